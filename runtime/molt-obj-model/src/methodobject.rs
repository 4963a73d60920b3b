use libc::{c_char, c_int};

use crate::object::PyObject;

pub type PyCFunction = unsafe extern "C" fn(slf: *mut PyObject, args: *mut PyObject) -> *mut PyObject;

pub const METH_VARARGS: c_int = 0x0001;
pub const METH_KEYWORDS: c_int = 0x0002;
pub const METH_NOARGS: c_int = 0x0004;
pub const METH_O: c_int = 0x0008;
pub const METH_CLASS: c_int = 0x0010;
pub const METH_STATIC: c_int = 0x0020;

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct PyMethodDef {
    pub ml_name: *const c_char,
    pub ml_meth: Option<PyCFunction>,
    pub ml_flags: c_int,
    pub ml_doc: *const c_char,
}

impl PyMethodDef {
    pub const fn sentinel() -> Self {
        Self {
            ml_name: std::ptr::null(),
            ml_meth: None,
            ml_flags: 0,
            ml_doc: std::ptr::null(),
        }
    }
}

unsafe impl Send for PyMethodDef {}
unsafe impl Sync for PyMethodDef {}
