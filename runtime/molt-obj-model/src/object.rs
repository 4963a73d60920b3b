use crate::typeobject::PyTypeObject;

pub type PySsize = isize;

/// Objects whose refcount starts here are never deallocated.
pub const IMMORTAL_REFCNT: PySsize = PySsize::MAX / 2;

/// Fixed prefix of every object.
#[repr(C)]
#[derive(Debug)]
pub struct PyObject {
    pub ob_refcnt: PySsize,
    pub ob_type: *mut PyTypeObject,
}

/// Prefix of variable-sized objects (type objects, tuples).
#[repr(C)]
#[derive(Debug)]
pub struct PyVarObject {
    pub ob_base: PyObject,
    pub ob_size: PySsize,
}

impl PyObject {
    pub const fn new(ob_type: *mut PyTypeObject) -> Self {
        Self {
            ob_refcnt: 1,
            ob_type,
        }
    }

    pub const fn immortal(ob_type: *mut PyTypeObject) -> Self {
        Self {
            ob_refcnt: IMMORTAL_REFCNT,
            ob_type,
        }
    }

    pub fn is_immortal(&self) -> bool {
        self.ob_refcnt >= IMMORTAL_REFCNT
    }
}
