//! Instance layout for bound types.
//!
//! Every instance is one slab: the object header, a flag byte, and a payload
//! at a fixed offset. The payload is either the native value itself (Owned)
//! or a record aliasing storage owned elsewhere (Aliased). The flag byte is
//! the only discriminant; construction and destruction are explicit steps
//! between the slab's allocation and its release.

use std::mem::{ManuallyDrop, offset_of};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr::{self, NonNull};

use molt_obj_model::{PyObject, PyTypeObject};
use tracing::error;

use crate::abi::{Borrowed, ObjRef, generic_alloc_aligned, generic_free, type_name};
use crate::descriptor::TypeKind;
use crate::error::{BindError, BindResult};
use crate::gil::PyToken;
use crate::metaclass;
use crate::registry::{self, TypeHash};

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PayloadKind {
    /// Allocated, constructor not run yet.
    Vacant = 0,
    Owned = 1,
    Aliased = 2,
    /// Owned value whose destructor already ran.
    Destroyed = 3,
}

impl PayloadKind {
    fn from_flags(flags: u8) -> Self {
        match flags {
            1 => Self::Owned,
            2 => Self::Aliased,
            3 => Self::Destroyed,
            _ => Self::Vacant,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Self::Vacant => "not constructed",
            Self::Owned => "owned",
            Self::Aliased => "aliased",
            Self::Destroyed => "destroyed",
        }
    }
}

/// Alias to storage the instance does not own. Its lifetime is not tracked:
/// the aliased value must outlive every use of the instance.
#[repr(C)]
pub struct RefRecord<T> {
    ptr: NonNull<T>,
    mutable: bool,
}

impl<T> Clone for RefRecord<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for RefRecord<T> {}

impl<T> RefRecord<T> {
    pub fn new_mut(target: &mut T) -> Self {
        Self {
            ptr: NonNull::from(target),
            mutable: true,
        }
    }

    pub fn new_const(target: &T) -> Self {
        Self {
            ptr: NonNull::from(target),
            mutable: false,
        }
    }

    pub fn ptr(&self) -> NonNull<T> {
        self.ptr
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable
    }
}

#[repr(C)]
union Payload<T> {
    owned: ManuallyDrop<T>,
    alias: RefRecord<T>,
}

#[repr(C)]
pub struct Instance<T> {
    ob_base: PyObject,
    flags: u8,
    payload: Payload<T>,
}

impl<T> Instance<T> {
    pub const PAYLOAD_OFFSET: usize = offset_of!(Instance<T>, payload);
    pub const SIZE: usize = size_of::<Instance<T>>();
    pub const ALIGN: usize = align_of::<Instance<T>>();
}

/// The flag byte sits right after the header for every `T`.
pub const FLAGS_OFFSET: usize = offset_of!(Instance<()>, flags);

/// Tagged view of an initialised payload.
pub enum Slot<T> {
    Owned(NonNull<T>),
    Borrowed(RefRecord<T>),
}

impl<T> Slot<T> {
    pub fn as_ptr(&self) -> NonNull<T> {
        match self {
            Self::Owned(ptr) => *ptr,
            Self::Borrowed(record) => record.ptr,
        }
    }

    pub fn is_mutable(&self) -> bool {
        match self {
            Self::Owned(_) => true,
            Self::Borrowed(record) => record.mutable,
        }
    }
}

/// Allocates a zeroed, suitably aligned `Instance<T>` slab for `ty`; the
/// payload starts out Vacant.
///
/// # Safety
/// `ty` must be a readied type whose instances are `Instance<T>`.
pub unsafe fn allocate<T>(ty: *mut PyTypeObject) -> BindResult<ObjRef> {
    let raw = unsafe { generic_alloc_aligned(ty, Instance::<T>::SIZE, Instance::<T>::ALIGN) };
    unsafe { ObjRef::from_owned_ptr(raw) }.ok_or_else(|| {
        BindError::Native(format!(
            "out of memory allocating a '{}' instance",
            unsafe { type_name(ty) }
        ))
    })
}

pub fn header_of<T>(instance: NonNull<Instance<T>>) -> NonNull<PyObject> {
    instance.cast()
}

/// # Safety
/// `obj` must be an instance of a bound type.
pub unsafe fn payload_kind(obj: *mut PyObject) -> PayloadKind {
    PayloadKind::from_flags(unsafe { *obj.cast::<u8>().add(FLAGS_OFFSET) })
}

/// # Safety
/// `obj` must be an instance of a bound type, and the payload must hold
/// what `kind` claims.
pub unsafe fn set_payload_kind(obj: *mut PyObject, kind: PayloadKind) {
    unsafe { *obj.cast::<u8>().add(FLAGS_OFFSET) = kind as u8 };
}

/// # Safety
/// `obj` must be an `Instance<T>`.
pub unsafe fn slot<T>(obj: *mut PyObject) -> Option<Slot<T>> {
    let instance = obj.cast::<Instance<T>>();
    unsafe {
        match payload_kind(obj) {
            PayloadKind::Owned => {
                let owned = &raw mut (*instance).payload.owned;
                Some(Slot::Owned(NonNull::new_unchecked(owned.cast::<T>())))
            }
            PayloadKind::Aliased => Some(Slot::Borrowed((*instance).payload.alias)),
            PayloadKind::Vacant | PayloadKind::Destroyed => None,
        }
    }
}

/// Moves `value` into the payload. A Vacant payload becomes Owned; an Owned
/// one has its old value dropped first.
///
/// # Safety
/// `obj` must be an `Instance<T>` of a value type.
pub unsafe fn construct_in_place<T>(obj: *mut PyObject, value: T) -> BindResult<()> {
    let instance = obj.cast::<Instance<T>>();
    unsafe {
        match payload_kind(obj) {
            PayloadKind::Vacant => {}
            PayloadKind::Owned => {
                run_destructor::<T>(obj);
            }
            kind => {
                return Err(BindError::ConstructionUnsupported(format!(
                    "cannot construct into a {} instance",
                    kind.describe()
                )));
            }
        }
        ptr::write(&raw mut (*instance).payload.owned, ManuallyDrop::new(value));
        set_payload_kind(obj, PayloadKind::Owned);
    }
    Ok(())
}

/// # Safety
/// `obj` must be a Vacant `Instance<T>` of a reference type.
pub unsafe fn alias_in_place<T>(obj: *mut PyObject, record: RefRecord<T>) {
    let instance = obj.cast::<Instance<T>>();
    unsafe {
        ptr::write(&raw mut (*instance).payload.alias, record);
        set_payload_kind(obj, PayloadKind::Aliased);
    }
}

/// Drops an Owned payload in place and marks it Destroyed. Returns false,
/// doing nothing, for any other payload.
///
/// # Safety
/// `obj` must be an `Instance<T>`.
pub unsafe fn run_destructor<T>(obj: *mut PyObject) -> bool {
    unsafe {
        if payload_kind(obj) != PayloadKind::Owned {
            return false;
        }
        // Flag first: a panicking destructor must not run twice.
        set_payload_kind(obj, PayloadKind::Destroyed);
        let instance = obj.cast::<Instance<T>>();
        ManuallyDrop::drop(&mut (*instance).payload.owned);
    }
    true
}

pub(crate) unsafe extern "C" fn instance_dealloc<T>(obj: *mut PyObject) {
    let dropped = catch_unwind(AssertUnwindSafe(|| unsafe { run_destructor::<T>(obj) }));
    if dropped.is_err() {
        error!(
            type_name = %std::any::type_name::<T>(),
            "native destructor panicked during teardown"
        );
    }
    unsafe { generic_free(obj) };
}

/// `tp_new` of value types: a Vacant slab for `tp_init` to construct into.
pub(crate) unsafe extern "C" fn instance_new<T>(
    ty: *mut PyTypeObject,
    _args: *mut PyObject,
    _kwargs: *mut PyObject,
) -> *mut PyObject {
    unsafe {
        match allocate::<T>(ty) {
            Ok(obj) => obj.into_ptr(),
            Err(err) => crate::error::raise(err),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Access {
    Shared,
    Exclusive,
}

/// Pointer to the `T` behind `obj`, checked against the object's type,
/// constness and payload state.
pub fn resolve<T: 'static>(obj: Borrowed<'_>, access: Access) -> BindResult<NonNull<T>> {
    let expected = TypeHash::of::<T>();
    let heap = metaclass::heap_type(obj.type_ptr())
        .filter(|heap| heap.context().is_some_and(|ctx| ctx.type_hash() == expected))
        .ok_or_else(|| {
            BindError::mismatch(format!(
                "expected an existing {} instance, got {}",
                std::any::type_name::<T>(),
                obj.type_name()
            ))
        })?;
    if access == Access::Exclusive && heap.kind() == TypeKind::ConstRef {
        return Err(BindError::mismatch(format!(
            "cannot bind a mutable reference to const alias '{}'",
            obj.type_name()
        )));
    }
    match unsafe { slot::<T>(obj.as_ptr()) } {
        Some(slot) if access == Access::Exclusive && !slot.is_mutable() => {
            Err(BindError::mismatch(format!(
                "'{}' aliases read-only storage",
                obj.type_name()
            )))
        }
        Some(slot) => Ok(slot.as_ptr()),
        None => Err(BindError::mismatch(format!(
            "'{}' instance is {}",
            obj.type_name(),
            unsafe { payload_kind(obj.as_ptr()) }.describe()
        ))),
    }
}

/// Runs `f` on the native value behind `obj`.
pub fn with_instance<T: 'static, R>(obj: Borrowed<'_>, f: impl FnOnce(&T) -> R) -> BindResult<R> {
    let ptr = resolve::<T>(obj, Access::Shared)?;
    Ok(f(unsafe { ptr.as_ref() }))
}

pub fn with_instance_mut<T: 'static, R>(
    obj: Borrowed<'_>,
    f: impl FnOnce(&mut T) -> R,
) -> BindResult<R> {
    let mut ptr = resolve::<T>(obj, Access::Exclusive)?;
    Ok(f(unsafe { ptr.as_mut() }))
}

/// Allocates instances of the registered value type for `T`.
pub struct ValueObject;

impl ValueObject {
    pub fn alloc<T: 'static>(_py: &PyToken<'_>, value: T) -> BindResult<ObjRef> {
        let descriptor = registry::lookup_type::<T>()?;
        let obj = unsafe { allocate::<T>(descriptor.value_type_ptr())? };
        unsafe { construct_in_place(obj.as_ptr(), value)? };
        Ok(obj)
    }
}

/// Allocates instances of the reference shadow types for `T`.
pub struct ReferenceObject;

impl ReferenceObject {
    pub fn alloc_mut<T: 'static>(_py: &PyToken<'_>, target: &mut T) -> BindResult<ObjRef> {
        let descriptor = registry::lookup_type::<T>()?;
        let obj = unsafe { allocate::<T>(descriptor.mut_ref_type_ptr())? };
        unsafe { alias_in_place(obj.as_ptr(), RefRecord::new_mut(target)) };
        Ok(obj)
    }

    pub fn alloc_const<T: 'static>(_py: &PyToken<'_>, target: &T) -> BindResult<ObjRef> {
        let descriptor = registry::lookup_type::<T>()?;
        let obj = unsafe { allocate::<T>(descriptor.const_ref_type_ptr())? };
        unsafe { alias_in_place(obj.as_ptr(), RefRecord::new_const(target)) };
        Ok(obj)
    }
}

/// Runs the destructor of an Owned instance early. Later attempts, and
/// aliased instances, are no-ops that return false.
pub fn destroy<T: 'static>(_py: &PyToken<'_>, obj: Borrowed<'_>) -> BindResult<bool> {
    let heap = metaclass::heap_type(obj.type_ptr())
        .filter(|heap| {
            heap.context()
                .is_some_and(|ctx| ctx.type_hash() == TypeHash::of::<T>())
        })
        .ok_or_else(|| {
            BindError::mismatch(format!(
                "cannot destroy a {} through {}",
                obj.type_name(),
                std::any::type_name::<T>()
            ))
        })?;
    if heap.kind() != TypeKind::Value {
        return Ok(false);
    }
    Ok(unsafe { run_destructor::<T>(obj.as_ptr()) })
}
