use libc::{c_char, c_int, c_void};

use crate::object::{PyObject, PySsize};

pub type Getter = unsafe extern "C" fn(slf: *mut PyObject, closure: *mut c_void) -> *mut PyObject;
pub type Setter =
    unsafe extern "C" fn(slf: *mut PyObject, value: *mut PyObject, closure: *mut c_void) -> c_int;

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct PyGetSetDef {
    pub name: *const c_char,
    pub get: Option<Getter>,
    pub set: Option<Setter>,
    pub doc: *const c_char,
    pub closure: *mut c_void,
}

impl PyGetSetDef {
    pub const fn sentinel() -> Self {
        Self {
            name: std::ptr::null(),
            get: None,
            set: None,
            doc: std::ptr::null(),
            closure: std::ptr::null_mut(),
        }
    }
}

unsafe impl Send for PyGetSetDef {}
unsafe impl Sync for PyGetSetDef {}

// Member type codes (structmember.h).
pub const T_INT: c_int = 1;
pub const T_DOUBLE: c_int = 4;
pub const T_STRING: c_int = 5;
pub const T_LONGLONG: c_int = 17;
pub const T_BOOL: c_int = 14;
pub const T_OBJECT_EX: c_int = 16;

pub const READONLY: c_int = 1;

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct PyMemberDef {
    pub name: *const c_char,
    pub type_code: c_int,
    pub offset: PySsize,
    pub flags: c_int,
    pub doc: *const c_char,
}
