use std::ffi::CStr;
use std::ptr::{self, NonNull};
use std::sync::OnceLock;

use libc::c_ulong;
use molt_obj_model::{
    PyGetSetDef, PyMethodDef, PyObject, PySsize, PyTypeObject, TPFLAGS_BASETYPE, TPFLAGS_DEFAULT,
    TPFLAGS_DICT_SUBCLASS, TPFLAGS_LONG_SUBCLASS, TPFLAGS_READY, TPFLAGS_TUPLE_SUBCLASS,
    TPFLAGS_TYPE_SUBCLASS, TPFLAGS_UNICODE_SUBCLASS,
};

use super::call::{
    cfunction_call, generic_getattr, generic_setattr, getset_descr_get, getset_descr_set,
    method_descr_call, method_descr_get, type_call, type_getattro, type_setattro,
};
use super::capsule::{CapsuleObject, capsule_dealloc};
use super::module::{ModuleObject, module_dealloc, module_getattro};
use super::object::{ObjRef, alloc_or_abort, generic_dealloc, generic_free, generic_tp_alloc};
use crate::error::{BindError, BindResult};
use crate::gil::PyToken;

#[repr(C)]
pub struct IntObject {
    pub ob_base: PyObject,
    pub value: i128,
}

#[repr(C)]
pub struct FloatObject {
    pub ob_base: PyObject,
    pub value: f64,
}

#[repr(C)]
pub struct StrObject {
    pub ob_base: PyObject,
    pub value: String,
}

/// Tuples and lists share one shape; only the type differs.
#[repr(C)]
pub struct SeqObject {
    pub ob_base: PyObject,
    pub items: Vec<ObjRef>,
}

/// String-keyed, insertion-ordered mapping.
#[repr(C)]
pub struct DictObject {
    pub ob_base: PyObject,
    pub entries: Vec<(String, ObjRef)>,
}

/// Built-in function bound to `m_self` (a module, a capsule, or an instance
/// for bound methods).
#[repr(C)]
pub struct CFunctionObject {
    pub ob_base: PyObject,
    pub ml: *const PyMethodDef,
    pub m_self: *mut PyObject,
}

/// Neither descriptor owns its type: the type's dict owns the descriptor.
#[repr(C)]
pub struct MethodDescrObject {
    pub ob_base: PyObject,
    pub d_type: *mut PyTypeObject,
    pub d_method: *const PyMethodDef,
}

#[repr(C)]
pub struct GetSetDescrObject {
    pub ob_base: PyObject,
    pub d_type: *mut PyTypeObject,
    pub d_getset: *const PyGetSetDef,
}

pub struct BuiltinTypes {
    pub object: *mut PyTypeObject,
    pub type_: *mut PyTypeObject,
    pub none: *mut PyTypeObject,
    pub int: *mut PyTypeObject,
    pub bool_: *mut PyTypeObject,
    pub float: *mut PyTypeObject,
    pub str_: *mut PyTypeObject,
    pub tuple: *mut PyTypeObject,
    pub list: *mut PyTypeObject,
    pub dict: *mut PyTypeObject,
    pub module: *mut PyTypeObject,
    pub capsule: *mut PyTypeObject,
    pub cfunction: *mut PyTypeObject,
    pub method_descr: *mut PyTypeObject,
    pub getset_descr: *mut PyTypeObject,
    none_obj: NonNull<PyObject>,
    true_obj: NonNull<PyObject>,
    false_obj: NonNull<PyObject>,
}

// Every pointer targets a leaked, immortal object.
unsafe impl Send for BuiltinTypes {}
unsafe impl Sync for BuiltinTypes {}

static BUILTINS: OnceLock<BuiltinTypes> = OnceLock::new();

pub fn builtins() -> &'static BuiltinTypes {
    BUILTINS.get_or_init(BuiltinTypes::create)
}

fn leak_type(
    meta: *mut PyTypeObject,
    name: &'static CStr,
    basicsize: usize,
    base: *mut PyTypeObject,
    flags: c_ulong,
) -> *mut PyTypeObject {
    let mut ty = PyTypeObject::zeroed();
    ty.ob_base.ob_base = PyObject::immortal(meta);
    ty.tp_name = name.as_ptr();
    ty.tp_basicsize = basicsize as PySsize;
    ty.tp_flags = TPFLAGS_DEFAULT | TPFLAGS_READY | flags;
    ty.tp_base = base;
    ty.tp_alloc = Some(generic_tp_alloc);
    ty.tp_dealloc = Some(generic_dealloc);
    ty.tp_getattro = Some(generic_getattr);
    ty.tp_setattro = Some(generic_setattr);
    Box::into_raw(Box::new(ty))
}

fn leak_object<T>(value: T) -> NonNull<PyObject> {
    NonNull::from(Box::leak(Box::new(value))).cast()
}

impl BuiltinTypes {
    fn create() -> Self {
        let object = leak_type(
            ptr::null_mut(),
            c"object",
            size_of::<PyObject>(),
            ptr::null_mut(),
            TPFLAGS_BASETYPE,
        );
        let type_ = leak_type(
            ptr::null_mut(),
            c"type",
            size_of::<PyTypeObject>(),
            object,
            TPFLAGS_BASETYPE | TPFLAGS_TYPE_SUBCLASS,
        );
        // SAFETY: both were just leaked and are not shared yet.
        unsafe {
            (*object).ob_base.ob_base.ob_type = type_;
            (*type_).ob_base.ob_base.ob_type = type_;
            (*type_).tp_call = Some(type_call);
            (*type_).tp_getattro = Some(type_getattro);
            (*type_).tp_setattro = Some(type_setattro);
        }
        let plain = |name, size, base, flags| leak_type(type_, name, size, base, flags);

        let none = plain(c"NoneType", size_of::<PyObject>(), object, 0);
        let int = plain(
            c"int",
            size_of::<IntObject>(),
            object,
            TPFLAGS_BASETYPE | TPFLAGS_LONG_SUBCLASS,
        );
        let bool_ = plain(c"bool", size_of::<IntObject>(), int, TPFLAGS_LONG_SUBCLASS);
        let float = plain(c"float", size_of::<FloatObject>(), object, TPFLAGS_BASETYPE);
        let str_ = plain(
            c"str",
            size_of::<StrObject>(),
            object,
            TPFLAGS_BASETYPE | TPFLAGS_UNICODE_SUBCLASS,
        );
        let tuple = plain(
            c"tuple",
            size_of::<SeqObject>(),
            object,
            TPFLAGS_BASETYPE | TPFLAGS_TUPLE_SUBCLASS,
        );
        let list = plain(c"list", size_of::<SeqObject>(), object, TPFLAGS_BASETYPE);
        let dict = plain(
            c"dict",
            size_of::<DictObject>(),
            object,
            TPFLAGS_BASETYPE | TPFLAGS_DICT_SUBCLASS,
        );
        let module = plain(c"module", size_of::<ModuleObject>(), object, TPFLAGS_BASETYPE);
        let capsule = plain(c"PyCapsule", size_of::<CapsuleObject>(), object, 0);
        let cfunction = plain(
            c"builtin_function_or_method",
            size_of::<CFunctionObject>(),
            object,
            0,
        );
        let method_descr = plain(
            c"method_descriptor",
            size_of::<MethodDescrObject>(),
            object,
            0,
        );
        let getset_descr = plain(
            c"getset_descriptor",
            size_of::<GetSetDescrObject>(),
            object,
            0,
        );

        // SAFETY: the types are still private to this function.
        unsafe {
            (*str_).tp_dealloc = Some(str_dealloc);
            (*tuple).tp_dealloc = Some(seq_dealloc);
            (*list).tp_dealloc = Some(seq_dealloc);
            (*dict).tp_dealloc = Some(dict_dealloc);
            (*module).tp_dealloc = Some(module_dealloc);
            (*module).tp_getattro = Some(module_getattro);
            (*capsule).tp_dealloc = Some(capsule_dealloc);
            (*cfunction).tp_dealloc = Some(cfunction_dealloc);
            (*cfunction).tp_call = Some(cfunction_call);
            (*method_descr).tp_call = Some(method_descr_call);
            (*method_descr).tp_descr_get = Some(method_descr_get);
            (*getset_descr).tp_descr_get = Some(getset_descr_get);
            (*getset_descr).tp_descr_set = Some(getset_descr_set);
        }

        let none_obj = leak_object(PyObject::immortal(none));
        let true_obj = leak_object(IntObject {
            ob_base: PyObject::immortal(bool_),
            value: 1,
        });
        let false_obj = leak_object(IntObject {
            ob_base: PyObject::immortal(bool_),
            value: 0,
        });

        Self {
            object,
            type_,
            none,
            int,
            bool_,
            float,
            str_,
            tuple,
            list,
            dict,
            module,
            capsule,
            cfunction,
            method_descr,
            getset_descr,
            none_obj,
            true_obj,
            false_obj,
        }
    }
}

unsafe extern "C" fn str_dealloc(obj: *mut PyObject) {
    unsafe {
        ptr::drop_in_place(&raw mut (*obj.cast::<StrObject>()).value);
        generic_free(obj);
    }
}

unsafe extern "C" fn seq_dealloc(obj: *mut PyObject) {
    unsafe {
        ptr::drop_in_place(&raw mut (*obj.cast::<SeqObject>()).items);
        generic_free(obj);
    }
}

unsafe extern "C" fn dict_dealloc(obj: *mut PyObject) {
    unsafe {
        ptr::drop_in_place(&raw mut (*obj.cast::<DictObject>()).entries);
        generic_free(obj);
    }
}

unsafe extern "C" fn cfunction_dealloc(obj: *mut PyObject) {
    unsafe {
        let m_self = (*obj.cast::<CFunctionObject>()).m_self;
        generic_free(obj);
        super::object::decref(m_self);
    }
}

/// Allocates a builtin object of type `ty` and writes its body.
///
/// # Safety
/// `T` must be the object struct for `ty`, starting with `PyObject`.
unsafe fn alloc_builtin<T>(ty: *mut PyTypeObject, init: impl FnOnce(*mut T)) -> ObjRef {
    unsafe {
        let obj = alloc_or_abort(ty, size_of::<T>());
        init(obj.as_ptr().cast::<T>());
        ObjRef::from_non_null(obj)
    }
}

pub fn none(_py: &PyToken<'_>) -> ObjRef {
    unsafe { ObjRef::from_non_null(builtins().none_obj) }
}

pub fn is_none(obj: super::Borrowed<'_>) -> bool {
    obj.as_ptr() == builtins().none_obj.as_ptr()
}

pub fn new_bool(_py: &PyToken<'_>, value: bool) -> ObjRef {
    let obj = if value {
        builtins().true_obj
    } else {
        builtins().false_obj
    };
    unsafe { ObjRef::from_non_null(obj) }
}

pub fn new_int(_py: &PyToken<'_>, value: i128) -> ObjRef {
    unsafe {
        alloc_builtin::<IntObject>(builtins().int, |obj| {
            (&raw mut (*obj).value).write(value);
        })
    }
}

pub fn new_float(_py: &PyToken<'_>, value: f64) -> ObjRef {
    unsafe {
        alloc_builtin::<FloatObject>(builtins().float, |obj| {
            (&raw mut (*obj).value).write(value);
        })
    }
}

pub fn new_str(_py: &PyToken<'_>, value: &str) -> ObjRef {
    let value = value.to_owned();
    unsafe {
        alloc_builtin::<StrObject>(builtins().str_, |obj| {
            (&raw mut (*obj).value).write(value);
        })
    }
}

pub fn new_tuple(_py: &PyToken<'_>, items: Vec<ObjRef>) -> ObjRef {
    unsafe {
        alloc_builtin::<SeqObject>(builtins().tuple, |obj| {
            (&raw mut (*obj).items).write(items);
        })
    }
}

pub fn new_list(_py: &PyToken<'_>, items: Vec<ObjRef>) -> ObjRef {
    unsafe {
        alloc_builtin::<SeqObject>(builtins().list, |obj| {
            (&raw mut (*obj).items).write(items);
        })
    }
}

pub fn new_dict(_py: &PyToken<'_>) -> ObjRef {
    unsafe {
        alloc_builtin::<DictObject>(builtins().dict, |obj| {
            (&raw mut (*obj).entries).write(Vec::new());
        })
    }
}

/// # Safety
/// `ml` must outlive the function object; `m_self` keeps it alive when the
/// table lives inside it.
pub unsafe fn new_cfunction(
    _py: &PyToken<'_>,
    ml: *const PyMethodDef,
    m_self: Option<ObjRef>,
) -> ObjRef {
    let m_self = m_self.map_or(ptr::null_mut(), ObjRef::into_ptr);
    unsafe {
        alloc_builtin::<CFunctionObject>(builtins().cfunction, |obj| {
            (&raw mut (*obj).ml).write(ml);
            (&raw mut (*obj).m_self).write(m_self);
        })
    }
}

/// # Safety
/// `def` must live as long as `d_type`.
pub(crate) unsafe fn new_method_descr(
    d_type: *mut PyTypeObject,
    def: *const PyMethodDef,
) -> ObjRef {
    unsafe {
        alloc_builtin::<MethodDescrObject>(builtins().method_descr, |obj| {
            (&raw mut (*obj).d_type).write(d_type);
            (&raw mut (*obj).d_method).write(def);
        })
    }
}

/// # Safety
/// `def` must live as long as `d_type`.
pub(crate) unsafe fn new_getset_descr(
    d_type: *mut PyTypeObject,
    def: *const PyGetSetDef,
) -> ObjRef {
    unsafe {
        alloc_builtin::<GetSetDescrObject>(builtins().getset_descr, |obj| {
            (&raw mut (*obj).d_type).write(d_type);
            (&raw mut (*obj).d_getset).write(def);
        })
    }
}

pub fn int_value(obj: super::Borrowed<'_>) -> Option<i128> {
    obj.is_instance(builtins().int)
        .then(|| unsafe { (*obj.as_ptr().cast::<IntObject>()).value })
}

pub fn bool_value(obj: super::Borrowed<'_>) -> Option<bool> {
    (obj.type_ptr() == builtins().bool_)
        .then(|| unsafe { (*obj.as_ptr().cast::<IntObject>()).value != 0 })
}

/// Floats, and ints widened to float.
pub fn float_value(obj: super::Borrowed<'_>) -> Option<f64> {
    if obj.is_instance(builtins().float) {
        return Some(unsafe { (*obj.as_ptr().cast::<FloatObject>()).value });
    }
    int_value(obj).map(|value| value as f64)
}

pub fn str_value(obj: super::Borrowed<'_>) -> Option<&str> {
    obj.is_instance(builtins().str_)
        .then(|| unsafe { (*obj.as_ptr().cast::<StrObject>()).value.as_str() })
}

pub fn tuple_items(obj: super::Borrowed<'_>) -> Option<&[ObjRef]> {
    obj.is_instance(builtins().tuple)
        .then(|| unsafe { (*obj.as_ptr().cast::<SeqObject>()).items.as_slice() })
}

pub fn list_items(obj: super::Borrowed<'_>) -> Option<&[ObjRef]> {
    obj.is_instance(builtins().list)
        .then(|| unsafe { (*obj.as_ptr().cast::<SeqObject>()).items.as_slice() })
}

/// Items of a tuple or a list.
pub fn sequence_items(obj: super::Borrowed<'_>) -> Option<&[ObjRef]> {
    tuple_items(obj).or_else(|| list_items(obj))
}

pub fn list_append(_py: &PyToken<'_>, list: super::Borrowed<'_>, item: ObjRef) -> BindResult<()> {
    if !list.is_instance(builtins().list) {
        return Err(BindError::mismatch(format!(
            "expected list, got {}",
            list.type_name()
        )));
    }
    unsafe { (*list.as_ptr().cast::<SeqObject>()).items.push(item) };
    Ok(())
}

fn dict_entries<'a>(dict: super::Borrowed<'a>) -> BindResult<&'a mut Vec<(String, ObjRef)>> {
    if !dict.is_instance(builtins().dict) {
        return Err(BindError::mismatch(format!(
            "expected dict, got {}",
            dict.type_name()
        )));
    }
    Ok(unsafe { &mut (*dict.as_ptr().cast::<DictObject>()).entries })
}

/// Inserts or replaces `key`; insertion order of first insert is kept.
pub fn dict_set_item(
    _py: &PyToken<'_>,
    dict: super::Borrowed<'_>,
    key: &str,
    value: ObjRef,
) -> BindResult<()> {
    let entries = dict_entries(dict)?;
    let previous = match entries.iter_mut().find(|(k, _)| k == key) {
        Some((_, slot)) => Some(std::mem::replace(slot, value)),
        None => {
            entries.push((key.to_owned(), value));
            None
        }
    };
    drop(previous);
    Ok(())
}

pub fn dict_get_item<'a>(dict: super::Borrowed<'a>, key: &str) -> Option<super::Borrowed<'a>> {
    let entries = dict_entries(dict).ok()?;
    entries
        .iter()
        .find(|(k, _)| k == key)
        .and_then(|(_, value)| unsafe { super::Borrowed::from_ptr(value.as_ptr()) })
}

pub fn dict_keys(dict: super::Borrowed<'_>) -> Vec<String> {
    dict_entries(dict)
        .map(|entries| entries.iter().map(|(k, _)| k.clone()).collect())
        .unwrap_or_default()
}

pub fn dict_len(dict: super::Borrowed<'_>) -> usize {
    dict_entries(dict).map_or(0, |entries| entries.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gil::with_gil;

    #[test]
    fn test_bool_is_an_int() {
        with_gil(|py| {
            let t = new_bool(py, true);
            assert_eq!(int_value(t.borrow()), Some(1));
            assert_eq!(bool_value(t.borrow()), Some(true));
            let one = new_int(py, 1);
            assert_eq!(bool_value(one.borrow()), None);
        });
    }

    #[test]
    fn test_singletons_are_immortal() {
        with_gil(|py| {
            let a = none(py);
            let b = none(py);
            assert!(a.is(&b));
            assert!(is_none(a.borrow()));
            drop(a);
            assert!(b.refcnt() >= molt_obj_model::IMMORTAL_REFCNT);
        });
    }

    #[test]
    fn test_dict_keeps_insertion_order_on_replace() {
        with_gil(|py| {
            let dict = new_dict(py);
            dict_set_item(py, dict.borrow(), "b", new_int(py, 1)).unwrap();
            dict_set_item(py, dict.borrow(), "a", new_int(py, 2)).unwrap();
            dict_set_item(py, dict.borrow(), "b", new_int(py, 3)).unwrap();
            assert_eq!(dict_keys(dict.borrow()), vec!["b", "a"]);
            let b = dict_get_item(dict.borrow(), "b").unwrap();
            assert_eq!(int_value(b), Some(3));
            assert_eq!(dict_len(dict.borrow()), 2);
        });
    }

    #[test]
    fn test_sequence_items_accepts_tuple_and_list() {
        with_gil(|py| {
            let tuple = new_tuple(py, vec![new_int(py, 1), new_str(py, "x")]);
            let list = new_list(py, vec![new_float(py, 2.5)]);
            assert_eq!(sequence_items(tuple.borrow()).map(<[_]>::len), Some(2));
            assert_eq!(sequence_items(list.borrow()).map(<[_]>::len), Some(1));
            assert!(sequence_items(new_int(py, 0).borrow()).is_none());
            assert!(list_append(py, tuple.borrow(), none(py)).is_err());
        });
    }

    #[test]
    fn test_float_widens_int() {
        with_gil(|py| {
            assert_eq!(float_value(new_int(py, 3).borrow()), Some(3.0));
            assert_eq!(float_value(new_str(py, "3").borrow()), None);
        });
    }
}
