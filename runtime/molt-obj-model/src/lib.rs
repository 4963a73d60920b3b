//! CPython-compatible object and type layout for Molt native bindings.
//! Every structure here is `#[repr(C)]` and matches the 3.11 C ABI on
//! 64-bit targets, so type objects built from Rust can be handed to code that
//! only knows the C headers.

mod descrobject;
mod methodobject;
mod object;
mod typeobject;

pub use descrobject::{
    Getter, PyGetSetDef, PyMemberDef, READONLY, Setter, T_BOOL, T_DOUBLE, T_INT, T_LONGLONG,
    T_OBJECT_EX, T_STRING,
};
pub use methodobject::{
    METH_CLASS, METH_KEYWORDS, METH_NOARGS, METH_O, METH_STATIC, METH_VARARGS, PyCFunction,
    PyMethodDef,
};
pub use object::{IMMORTAL_REFCNT, PyObject, PySsize, PyVarObject};
pub use typeobject::*;

/// Returns true if a method table entry is the terminating sentinel.
pub fn is_method_sentinel(def: &PyMethodDef) -> bool {
    def.ml_name.is_null()
}

/// Returns true if a getset table entry is the terminating sentinel.
pub fn is_getset_sentinel(def: &PyGetSetDef) -> bool {
    def.name.is_null()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    fn test_object_header_layout() {
        assert_eq!(size_of::<PyObject>(), 2 * size_of::<usize>());
        assert_eq!(offset_of!(PyObject, ob_type), size_of::<usize>());
        assert_eq!(size_of::<PyVarObject>(), 3 * size_of::<usize>());
    }

    #[cfg(all(target_pointer_width = "64", not(windows)))]
    #[test]
    fn test_type_object_layout() {
        assert_eq!(offset_of!(PyTypeObject, tp_name), 24);
        assert_eq!(offset_of!(PyTypeObject, tp_basicsize), 32);
        assert_eq!(offset_of!(PyTypeObject, tp_dealloc), 48);
        assert_eq!(offset_of!(PyTypeObject, tp_call), 128);
        assert_eq!(offset_of!(PyTypeObject, tp_getattro), 144);
        assert_eq!(offset_of!(PyTypeObject, tp_flags), 168);
        assert_eq!(offset_of!(PyTypeObject, tp_doc), 176);
        assert_eq!(offset_of!(PyTypeObject, tp_methods), 232);
        assert_eq!(offset_of!(PyTypeObject, tp_getset), 248);
        assert_eq!(offset_of!(PyTypeObject, tp_base), 256);
        assert_eq!(offset_of!(PyTypeObject, tp_dict), 264);
        assert_eq!(offset_of!(PyTypeObject, tp_init), 296);
        assert_eq!(offset_of!(PyTypeObject, tp_new), 312);
        assert_eq!(offset_of!(PyTypeObject, tp_free), 320);
        assert_eq!(offset_of!(PyTypeObject, tp_version_tag), 384);
        assert_eq!(size_of::<PyTypeObject>(), 408);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_table_entry_layout() {
        assert_eq!(size_of::<PyMethodDef>(), 32);
        assert_eq!(offset_of!(PyMethodDef, ml_flags), 16);
        assert_eq!(size_of::<PyGetSetDef>(), 40);
        assert_eq!(offset_of!(PyGetSetDef, closure), 32);
        assert_eq!(size_of::<PyMemberDef>(), 40);
        assert_eq!(offset_of!(PyMemberDef, offset), 16);
    }

    #[test]
    fn test_zeroed_tables_are_sentinels() {
        assert!(is_method_sentinel(&PyMethodDef::sentinel()));
        assert!(is_getset_sentinel(&PyGetSetDef::sentinel()));
        let ty = PyTypeObject::zeroed();
        assert!(ty.tp_new.is_none());
        assert!(ty.tp_methods.is_null());
        assert_eq!(ty.tp_flags, 0);
    }
}
