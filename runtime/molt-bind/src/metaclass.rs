//! `molt_bind.NativeType`, the type of every bound and enum type object.
//!
//! Type objects created here are `Box<HeapType>` allocations. When the last
//! reference goes, generic teardown sees the marker and hands the object
//! back to [`teardown_type`], which rebuilds the box and drops it.

use std::ptr::NonNull;
use std::sync::OnceLock;

use molt_obj_model::{
    PyObject, PySsize, PyTypeObject, TPFLAGS_DEFAULT, TPFLAGS_DISALLOW_INSTANTIATION,
    TPFLAGS_IMMUTABLETYPE, TPFLAGS_READY, TPFLAGS_TYPE_SUBCLASS,
};
use tracing::debug;

use crate::abi::{
    Borrowed, ObjRef, builtins, decref, dict_get_item, dict_keys, dict_set_item, int_value,
    new_dict, type_call, type_getattro, type_setattro,
};
use crate::descriptor::{HeapType, HeapTypeSpec, TypeKind};
use crate::error::{BindError, BindResult};
use crate::gil::PyToken;

struct Metaclass(NonNull<PyTypeObject>);

// Leaked and immortal; never written after creation.
unsafe impl Send for Metaclass {}
unsafe impl Sync for Metaclass {}

static METACLASS: OnceLock<Metaclass> = OnceLock::new();

fn create() -> Metaclass {
    let types = builtins();
    let mut ty = PyTypeObject::zeroed();
    ty.ob_base.ob_base = PyObject::immortal(types.type_);
    ty.tp_name = c"molt_bind.NativeType".as_ptr();
    ty.tp_basicsize = size_of::<HeapType>() as PySsize;
    ty.tp_flags = TPFLAGS_DEFAULT | TPFLAGS_READY | TPFLAGS_TYPE_SUBCLASS;
    ty.tp_base = types.type_;
    ty.tp_call = Some(type_call);
    ty.tp_getattro = Some(type_getattro);
    ty.tp_setattro = Some(type_setattro);
    ty.tp_dealloc = Some(teardown_slot);
    Metaclass(NonNull::from(Box::leak(Box::new(ty))))
}

pub fn metaclass_ptr() -> *mut PyTypeObject {
    METACLASS.get_or_init(create).0.as_ptr()
}

/// # Safety
/// `obj` must point to a live object.
pub unsafe fn is_native_type_object(obj: *mut PyObject) -> bool {
    let Some(meta) = METACLASS.get() else {
        return false;
    };
    unsafe { (*obj).ob_type == meta.0.as_ptr() && (*obj.cast::<HeapType>()).is_marked() }
}

/// The `HeapType` behind a type object created by this crate.
pub fn heap_type<'a>(ty: *mut PyTypeObject) -> Option<&'a HeapType> {
    if ty.is_null() {
        return None;
    }
    if unsafe { is_native_type_object(ty.cast()) } {
        Some(unsafe { &*ty.cast::<HeapType>() })
    } else {
        None
    }
}

/// Releases a type object: its dict, its reference to the base, then the
/// box with its tables, names and context share.
///
/// # Safety
/// `obj` must be a native type object whose refcount reached zero.
pub(crate) unsafe fn teardown_type(obj: *mut PyObject) {
    let heap = unsafe { Box::from_raw(obj.cast::<HeapType>()) };
    debug!(type_name = %heap.name(), kind = ?heap.kind(), "releasing native type object");
    unsafe {
        decref(heap.ty.tp_dict);
        decref(heap.ty.tp_base.cast());
    }
    drop(heap);
}

unsafe extern "C" fn teardown_slot(obj: *mut PyObject) {
    unsafe { teardown_type(obj) }
}

/// Builds an enumeration type whose attributes are the integer entries of
/// `members`. The type cannot be instantiated; `__members__` holds the
/// mapping itself.
pub fn new_enum_type(py: &PyToken<'_>, name: &str, members: Borrowed<'_>) -> BindResult<ObjRef> {
    if !members.is_instance(builtins().dict) {
        return Err(BindError::mismatch(format!(
            "enum '{name}' expects a dict of members, got {}",
            members.type_name()
        )));
    }
    let dict = new_dict(py);
    for key in dict_keys(members) {
        let Some(value) = dict_get_item(members, &key) else {
            continue;
        };
        if int_value(value).is_none() {
            return Err(BindError::mismatch(format!(
                "enum member {name}.{key} must be an int, got {}",
                value.type_name()
            )));
        }
        dict_set_item(py, dict.borrow(), &key, value.to_owned())?;
    }
    dict_set_item(py, dict.borrow(), "__members__", members.to_owned())?;

    let mut spec = HeapTypeSpec::new(name, TypeKind::Enum);
    spec.dict = Some(dict);
    spec.flags = TPFLAGS_DISALLOW_INSTANTIATION | TPFLAGS_IMMUTABLETYPE;
    let ty = spec.create(py)?;
    debug!(enum_name = %name, "created enum type");
    Ok(ty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{ExceptionKind, call, getattr, new_int, str_value};
    use crate::gil::with_gil;

    #[test]
    fn test_enum_members_are_type_attributes() {
        with_gil(|py| {
            let members = new_dict(py);
            dict_set_item(py, members.borrow(), "RED", new_int(py, 0)).unwrap();
            dict_set_item(py, members.borrow(), "BLUE", new_int(py, 2)).unwrap();
            let color = new_enum_type(py, "Color", members.borrow()).unwrap();

            assert!(unsafe { is_native_type_object(color.as_ptr()) });
            let blue = getattr(py, color.borrow(), "BLUE").unwrap();
            assert_eq!(int_value(blue.borrow()), Some(2));
            let name = getattr(py, color.borrow(), "__name__").unwrap();
            assert_eq!(str_value(name.borrow()), Some("Color"));
            let heap = heap_type(color.as_ptr().cast()).unwrap();
            assert_eq!(heap.kind(), TypeKind::Enum);
        });
    }

    #[test]
    fn test_enum_types_cannot_be_called() {
        with_gil(|py| {
            let members = new_dict(py);
            let empty = new_enum_type(py, "Empty", members.borrow()).unwrap();
            let err = call(py, empty.borrow(), &[]).unwrap_err();
            assert_eq!(err.exception_kind(), ExceptionKind::TypeError);
        });
    }

    #[test]
    fn test_non_int_member_is_rejected() {
        with_gil(|py| {
            let members = new_dict(py);
            dict_set_item(py, members.borrow(), "X", new_dict(py)).unwrap();
            let err = new_enum_type(py, "Bad", members.borrow()).unwrap_err();
            assert!(matches!(err, BindError::ArgumentMismatch(_)));
        });
    }

    #[test]
    fn test_builtin_types_are_not_native() {
        let int_type = builtins().int;
        assert!(heap_type(int_type).is_none());
        assert!(heap_type(std::ptr::null_mut()).is_none());
    }
}
