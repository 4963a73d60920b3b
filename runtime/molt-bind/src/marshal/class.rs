use std::ptr::NonNull;

use super::{Claim, FromWire, IntoWire, WireTag};
use crate::abi::{Borrowed, ObjRef};
use crate::error::BindResult;
use crate::gil::PyToken;
use crate::object_model::{Access, ReferenceObject, resolve};

/// A native type exposed through a [`TypeBuilder`](crate::TypeBuilder).
/// Implemented by [`native_class!`](crate::native_class) for user types and
/// by the crate for primitive reference types.
pub trait NativeClass: Sized + 'static {
    const NAME: &'static str;
}

/// Pointer to the value behind an existing instance of `T`, value or alias.
pub fn resolve_shared<T: NativeClass>(obj: Borrowed<'_>) -> BindResult<NonNull<T>> {
    resolve::<T>(obj, Access::Shared)
}

// Reference parameters carry an unbounded lifetime: the callable must not
// keep the reference past the call.

impl<T: NativeClass> FromWire for &'static T {
    const TAG: WireTag = WireTag::Instance;
    const ALIASING: bool = true;
    type Raw = NonNull<T>;

    fn describe() -> String {
        format!("&{}", T::NAME)
    }

    fn unpack(_py: &PyToken<'_>, obj: Borrowed<'_>) -> BindResult<NonNull<T>> {
        resolve::<T>(obj, Access::Shared)
    }

    fn convert(_py: &PyToken<'_>, raw: &mut NonNull<T>) -> BindResult<Self> {
        Ok(unsafe { &*raw.as_ptr() })
    }

    fn claims(raw: &NonNull<T>, visit: &mut dyn FnMut(Claim)) {
        visit(Claim::of(*raw, false));
    }
}

impl<T: NativeClass> FromWire for &'static mut T {
    const TAG: WireTag = WireTag::Instance;
    const ALIASING: bool = true;
    type Raw = NonNull<T>;

    fn describe() -> String {
        format!("&mut {}", T::NAME)
    }

    fn unpack(_py: &PyToken<'_>, obj: Borrowed<'_>) -> BindResult<NonNull<T>> {
        resolve::<T>(obj, Access::Exclusive)
    }

    fn convert(_py: &PyToken<'_>, raw: &mut NonNull<T>) -> BindResult<Self> {
        Ok(unsafe { &mut *raw.as_ptr() })
    }

    fn claims(raw: &NonNull<T>, visit: &mut dyn FnMut(Claim)) {
        visit(Claim::of(*raw, true));
    }
}

impl<T: NativeClass> IntoWire for &T {
    fn into_wire(self, py: &PyToken<'_>) -> BindResult<ObjRef> {
        ReferenceObject::alloc_const(py, self)
    }
}

impl<T: NativeClass> IntoWire for &mut T {
    fn into_wire(self, py: &PyToken<'_>) -> BindResult<ObjRef> {
        ReferenceObject::alloc_mut(py, self)
    }
}
