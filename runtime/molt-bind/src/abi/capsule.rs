use std::ffi::CStr;
use std::ptr;

use libc::c_void;
use molt_obj_model::PyObject;

use super::builtins::builtins;
use super::object::{Borrowed, ObjRef, alloc_or_abort, generic_free};
use crate::error::{BindError, BindResult};
use crate::gil::PyToken;

/// Opaque native pointer carried through the object protocol. The capsule
/// owns the pointee and drops it on teardown.
#[repr(C)]
pub struct CapsuleObject {
    pub ob_base: PyObject,
    pointer: *mut c_void,
    name: &'static CStr,
    destructor: unsafe fn(*mut c_void),
}

unsafe fn drop_boxed<T>(pointer: *mut c_void) {
    drop(unsafe { Box::from_raw(pointer.cast::<T>()) });
}

pub fn new_capsule<T: 'static>(_py: &PyToken<'_>, value: Box<T>, name: &'static CStr) -> ObjRef {
    let pointer = Box::into_raw(value).cast::<c_void>();
    unsafe {
        let obj = alloc_or_abort(builtins().capsule, size_of::<CapsuleObject>());
        let capsule = obj.as_ptr().cast::<CapsuleObject>();
        (&raw mut (*capsule).pointer).write(pointer);
        (&raw mut (*capsule).name).write(name);
        (&raw mut (*capsule).destructor).write(drop_boxed::<T>);
        ObjRef::from_non_null(obj)
    }
}

/// Pointer stored in `capsule`, checked against the name it was created
/// with.
pub fn capsule_pointer(capsule: Borrowed<'_>, name: &CStr) -> BindResult<*mut c_void> {
    if capsule.type_ptr() != builtins().capsule {
        return Err(BindError::mismatch(format!(
            "expected capsule, got {}",
            capsule.type_name()
        )));
    }
    let capsule = unsafe { &*capsule.as_ptr().cast::<CapsuleObject>() };
    if capsule.name != name {
        return Err(BindError::lookup(format!(
            "capsule '{}' where '{}' was expected",
            capsule.name.to_string_lossy(),
            name.to_string_lossy()
        )));
    }
    Ok(capsule.pointer)
}

pub(crate) unsafe extern "C" fn capsule_dealloc(obj: *mut PyObject) {
    unsafe {
        let capsule = obj.cast::<CapsuleObject>();
        let pointer = ptr::replace(&raw mut (*capsule).pointer, ptr::null_mut());
        let destructor = (*capsule).destructor;
        generic_free(obj);
        if !pointer.is_null() {
            destructor(pointer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gil::with_gil;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_capsule_drops_payload_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        with_gil(|py| {
            let capsule = new_capsule(py, Box::new(DropCounter(drops.clone())), c"test.counter");
            let pointer = capsule_pointer(capsule.borrow(), c"test.counter").unwrap();
            assert!(!pointer.is_null());
            let second = capsule.clone();
            drop(capsule);
            assert_eq!(drops.load(Ordering::SeqCst), 0);
            drop(second);
        });
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_capsule_name_is_checked() {
        with_gil(|py| {
            let capsule = new_capsule(py, Box::new(5u32), c"test.a");
            let err = capsule_pointer(capsule.borrow(), c"test.b").unwrap_err();
            assert!(matches!(err, BindError::LookupFailure(_)));
        });
    }
}
