use libc::{c_char, c_int, c_uint, c_ulong, c_void};

use crate::descrobject::{PyGetSetDef, PyMemberDef};
use crate::methodobject::PyMethodDef;
use crate::object::{PyObject, PySsize, PyVarObject};

pub type Destructor = unsafe extern "C" fn(obj: *mut PyObject);
pub type FreeFunc = unsafe extern "C" fn(ptr: *mut c_void);
pub type ReprFunc = unsafe extern "C" fn(obj: *mut PyObject) -> *mut PyObject;
pub type HashFunc = unsafe extern "C" fn(obj: *mut PyObject) -> PySsize;
pub type TernaryFunc = unsafe extern "C" fn(
    callable: *mut PyObject,
    args: *mut PyObject,
    kwargs: *mut PyObject,
) -> *mut PyObject;
pub type GetAttrFunc = unsafe extern "C" fn(obj: *mut PyObject, name: *mut c_char) -> *mut PyObject;
pub type SetAttrFunc =
    unsafe extern "C" fn(obj: *mut PyObject, name: *mut c_char, value: *mut PyObject) -> c_int;
pub type GetAttroFunc = unsafe extern "C" fn(obj: *mut PyObject, name: *mut PyObject) -> *mut PyObject;
pub type SetAttroFunc =
    unsafe extern "C" fn(obj: *mut PyObject, name: *mut PyObject, value: *mut PyObject) -> c_int;
pub type RichCmpFunc =
    unsafe extern "C" fn(a: *mut PyObject, b: *mut PyObject, op: c_int) -> *mut PyObject;
pub type GetIterFunc = unsafe extern "C" fn(obj: *mut PyObject) -> *mut PyObject;
pub type IterNextFunc = unsafe extern "C" fn(obj: *mut PyObject) -> *mut PyObject;
pub type DescrGetFunc = unsafe extern "C" fn(
    descr: *mut PyObject,
    obj: *mut PyObject,
    owner: *mut PyObject,
) -> *mut PyObject;
pub type DescrSetFunc =
    unsafe extern "C" fn(descr: *mut PyObject, obj: *mut PyObject, value: *mut PyObject) -> c_int;
pub type InitProc =
    unsafe extern "C" fn(obj: *mut PyObject, args: *mut PyObject, kwargs: *mut PyObject) -> c_int;
pub type AllocFunc = unsafe extern "C" fn(ty: *mut PyTypeObject, nitems: PySsize) -> *mut PyObject;
pub type NewFunc = unsafe extern "C" fn(
    ty: *mut PyTypeObject,
    args: *mut PyObject,
    kwargs: *mut PyObject,
) -> *mut PyObject;
pub type Inquiry = unsafe extern "C" fn(obj: *mut PyObject) -> c_int;

pub const TPFLAGS_DISALLOW_INSTANTIATION: c_ulong = 1 << 7;
pub const TPFLAGS_IMMUTABLETYPE: c_ulong = 1 << 8;
pub const TPFLAGS_HEAPTYPE: c_ulong = 1 << 9;
pub const TPFLAGS_BASETYPE: c_ulong = 1 << 10;
pub const TPFLAGS_READY: c_ulong = 1 << 12;
pub const TPFLAGS_READYING: c_ulong = 1 << 13;
pub const TPFLAGS_HAVE_GC: c_ulong = 1 << 14;
pub const TPFLAGS_HAVE_VERSION_TAG: c_ulong = 1 << 18;
pub const TPFLAGS_LONG_SUBCLASS: c_ulong = 1 << 24;
pub const TPFLAGS_TUPLE_SUBCLASS: c_ulong = 1 << 26;
pub const TPFLAGS_UNICODE_SUBCLASS: c_ulong = 1 << 28;
pub const TPFLAGS_DICT_SUBCLASS: c_ulong = 1 << 29;
pub const TPFLAGS_TYPE_SUBCLASS: c_ulong = 1 << 31;
pub const TPFLAGS_DEFAULT: c_ulong = TPFLAGS_HAVE_VERSION_TAG;

/// The type object. Slots this crate never fills are typed as opaque
/// pointers; they still occupy their C position.
#[repr(C)]
#[derive(Debug)]
pub struct PyTypeObject {
    pub ob_base: PyVarObject,
    pub tp_name: *const c_char,
    pub tp_basicsize: PySsize,
    pub tp_itemsize: PySsize,
    pub tp_dealloc: Option<Destructor>,
    pub tp_vectorcall_offset: PySsize,
    pub tp_getattr: Option<GetAttrFunc>,
    pub tp_setattr: Option<SetAttrFunc>,
    pub tp_as_async: *mut c_void,
    pub tp_repr: Option<ReprFunc>,
    pub tp_as_number: *mut c_void,
    pub tp_as_sequence: *mut c_void,
    pub tp_as_mapping: *mut c_void,
    pub tp_hash: Option<HashFunc>,
    pub tp_call: Option<TernaryFunc>,
    pub tp_str: Option<ReprFunc>,
    pub tp_getattro: Option<GetAttroFunc>,
    pub tp_setattro: Option<SetAttroFunc>,
    pub tp_as_buffer: *mut c_void,
    pub tp_flags: c_ulong,
    pub tp_doc: *const c_char,
    pub tp_traverse: *mut c_void,
    pub tp_clear: Option<Inquiry>,
    pub tp_richcompare: Option<RichCmpFunc>,
    pub tp_weaklistoffset: PySsize,
    pub tp_iter: Option<GetIterFunc>,
    pub tp_iternext: Option<IterNextFunc>,
    pub tp_methods: *mut PyMethodDef,
    pub tp_members: *mut PyMemberDef,
    pub tp_getset: *mut PyGetSetDef,
    pub tp_base: *mut PyTypeObject,
    pub tp_dict: *mut PyObject,
    pub tp_descr_get: Option<DescrGetFunc>,
    pub tp_descr_set: Option<DescrSetFunc>,
    pub tp_dictoffset: PySsize,
    pub tp_init: Option<InitProc>,
    pub tp_alloc: Option<AllocFunc>,
    pub tp_new: Option<NewFunc>,
    pub tp_free: Option<FreeFunc>,
    pub tp_is_gc: Option<Inquiry>,
    pub tp_bases: *mut PyObject,
    pub tp_mro: *mut PyObject,
    pub tp_cache: *mut PyObject,
    pub tp_subclasses: *mut c_void,
    pub tp_weaklist: *mut PyObject,
    pub tp_del: Option<Destructor>,
    pub tp_version_tag: c_uint,
    pub tp_finalize: Option<Destructor>,
    pub tp_vectorcall: *mut c_void,
}

impl PyTypeObject {
    /// A type object with every slot empty, ready to be filled in.
    pub fn zeroed() -> Self {
        // SAFETY: every field is an integer, a raw pointer or an
        // `Option<extern fn>`, all of which are valid when zeroed.
        unsafe { std::mem::zeroed() }
    }

    pub fn has_flag(&self, flag: c_ulong) -> bool {
        self.tp_flags & flag != 0
    }
}
