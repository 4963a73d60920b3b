use std::ffi::CStr;
use std::ptr;

use libc::c_int;
use molt_obj_model::{METH_NOARGS, METH_O, METH_VARARGS, PyMethodDef, PyObject, PyTypeObject};

use super::builtins::{
    CFunctionObject, GetSetDescrObject, MethodDescrObject, dict_get_item, dict_len,
    dict_set_item, new_cfunction, new_str, new_tuple, none, str_value, tuple_items,
};
use super::err::{ExceptionKind, err_set};
use super::object::{Borrowed, ObjRef, decref, is_subtype, type_name};
use crate::error::{BindError, BindResult};
use crate::gil::PyToken;

pub(crate) fn owned_or_fetch(ptr: *mut PyObject) -> BindResult<ObjRef> {
    unsafe { ObjRef::from_owned_ptr(ptr) }.ok_or_else(BindError::fetch)
}

fn status_or_fetch(status: c_int) -> BindResult<()> {
    if status < 0 {
        Err(BindError::fetch())
    } else {
        Ok(())
    }
}

/// Calls `callable(*args)` through its type's `tp_call` slot.
pub fn call(py: &PyToken<'_>, callable: Borrowed<'_>, args: &[Borrowed<'_>]) -> BindResult<ObjRef> {
    let tuple = new_tuple(py, args.iter().copied().map(Borrowed::to_owned).collect());
    call_tuple(py, callable, tuple.borrow())
}

pub fn call_tuple(
    _py: &PyToken<'_>,
    callable: Borrowed<'_>,
    args: Borrowed<'_>,
) -> BindResult<ObjRef> {
    let ty = callable.type_ptr();
    let Some(slot) = (unsafe { (*ty).tp_call }) else {
        return Err(foreign(
            ExceptionKind::TypeError,
            format!("'{}' object is not callable", callable.type_name()),
        ));
    };
    owned_or_fetch(unsafe { slot(callable.as_ptr(), args.as_ptr(), ptr::null_mut()) })
}

pub fn getattr(py: &PyToken<'_>, obj: Borrowed<'_>, name: &str) -> BindResult<ObjRef> {
    let Some(slot) = (unsafe { (*obj.type_ptr()).tp_getattro }) else {
        return Err(no_attribute(obj, name));
    };
    let name = new_str(py, name);
    owned_or_fetch(unsafe { slot(obj.as_ptr(), name.as_ptr()) })
}

pub fn setattr(
    py: &PyToken<'_>,
    obj: Borrowed<'_>,
    name: &str,
    value: Borrowed<'_>,
) -> BindResult<()> {
    let Some(slot) = (unsafe { (*obj.type_ptr()).tp_setattro }) else {
        return Err(no_attribute(obj, name));
    };
    let name = new_str(py, name);
    status_or_fetch(unsafe { slot(obj.as_ptr(), name.as_ptr(), value.as_ptr()) })
}

pub fn call_method(
    py: &PyToken<'_>,
    obj: Borrowed<'_>,
    name: &str,
    args: &[Borrowed<'_>],
) -> BindResult<ObjRef> {
    let bound = getattr(py, obj, name)?;
    call(py, bound.borrow(), args)
}

fn foreign(kind: ExceptionKind, message: impl Into<String>) -> BindError {
    BindError::ForeignRuntime(super::PyErrState::new(kind, message))
}

fn no_attribute(obj: Borrowed<'_>, name: &str) -> BindError {
    foreign(
        ExceptionKind::AttributeError,
        format!("'{}' object has no attribute '{name}'", obj.type_name()),
    )
}

fn set_null(kind: ExceptionKind, message: impl Into<String>) -> *mut PyObject {
    err_set(kind, message);
    ptr::null_mut()
}

fn set_status(kind: ExceptionKind, message: impl Into<String>) -> c_int {
    err_set(kind, message);
    -1
}

/// Finds `name` in the dicts along the `tp_base` chain.
///
/// # Safety
/// `ty` must be a type object whose chain outlives `'a`.
pub(crate) unsafe fn lookup_in_type<'a>(ty: *mut PyTypeObject, name: &str) -> Option<Borrowed<'a>> {
    let mut current = ty;
    while !current.is_null() {
        unsafe {
            let found = Borrowed::from_ptr((*current).tp_dict)
                .and_then(|dict| dict_get_item(dict, name));
            if found.is_some() {
                return found;
            }
            current = (*current).tp_base;
        }
    }
    None
}

unsafe fn name_of<'a>(name: *mut PyObject) -> Option<&'a str> {
    unsafe { Borrowed::from_ptr(name) }.and_then(str_value)
}

pub(crate) unsafe extern "C" fn generic_getattr(
    obj: *mut PyObject,
    name: *mut PyObject,
) -> *mut PyObject {
    unsafe {
        let (Some(obj), Some(name)) = (Borrowed::from_ptr(obj), name_of(name)) else {
            return set_null(ExceptionKind::TypeError, "attribute name must be a string");
        };
        let ty = obj.type_ptr();
        match lookup_in_type(ty, name) {
            Some(attr) => match (*attr.type_ptr()).tp_descr_get {
                Some(get) => get(attr.as_ptr(), obj.as_ptr(), ty.cast()),
                None => attr.to_owned().into_ptr(),
            },
            None => {
                no_attribute(obj, name).restore();
                ptr::null_mut()
            }
        }
    }
}

pub(crate) unsafe extern "C" fn generic_setattr(
    obj: *mut PyObject,
    name: *mut PyObject,
    value: *mut PyObject,
) -> c_int {
    unsafe {
        let (Some(obj), Some(name)) = (Borrowed::from_ptr(obj), name_of(name)) else {
            return set_status(ExceptionKind::TypeError, "attribute name must be a string");
        };
        match lookup_in_type(obj.type_ptr(), name) {
            Some(attr) => match (*attr.type_ptr()).tp_descr_set {
                Some(set) => set(attr.as_ptr(), obj.as_ptr(), value),
                None => set_status(
                    ExceptionKind::AttributeError,
                    format!("'{}' object attribute '{name}' is read-only", obj.type_name()),
                ),
            },
            None => {
                no_attribute(obj, name).restore();
                -1
            }
        }
    }
}

pub(crate) unsafe extern "C" fn type_getattro(
    type_obj: *mut PyObject,
    name: *mut PyObject,
) -> *mut PyObject {
    unsafe {
        let py = PyToken::assume_held();
        let Some(name) = name_of(name) else {
            return set_null(ExceptionKind::TypeError, "attribute name must be a string");
        };
        let ty = type_obj.cast::<PyTypeObject>();
        match name {
            "__name__" => return new_str(&py, &type_name(ty)).into_ptr(),
            "__doc__" => {
                let doc = (*ty).tp_doc;
                return if doc.is_null() {
                    none(&py).into_ptr()
                } else {
                    new_str(&py, &CStr::from_ptr(doc).to_string_lossy()).into_ptr()
                };
            }
            _ => {}
        }
        match lookup_in_type(ty, name) {
            Some(attr) => match (*attr.type_ptr()).tp_descr_get {
                Some(get) => get(attr.as_ptr(), ptr::null_mut(), type_obj),
                None => attr.to_owned().into_ptr(),
            },
            None => set_null(
                ExceptionKind::AttributeError,
                format!("type object '{}' has no attribute '{name}'", type_name(ty)),
            ),
        }
    }
}

pub(crate) unsafe extern "C" fn type_setattro(
    type_obj: *mut PyObject,
    name: *mut PyObject,
    value: *mut PyObject,
) -> c_int {
    unsafe {
        let py = PyToken::assume_held();
        let ty = type_obj.cast::<PyTypeObject>();
        let (Some(name), Some(value)) = (name_of(name), Borrowed::from_ptr(value)) else {
            return set_status(
                ExceptionKind::TypeError,
                format!("cannot delete attributes of type '{}'", type_name(ty)),
            );
        };
        let Some(dict) = Borrowed::from_ptr((*ty).tp_dict) else {
            return set_status(
                ExceptionKind::TypeError,
                format!("type '{}' is not ready", type_name(ty)),
            );
        };
        match dict_set_item(&py, dict, name, value.to_owned()) {
            Ok(()) => 0,
            Err(err) => {
                err.restore();
                -1
            }
        }
    }
}

/// Calls one method-table entry, honouring its calling convention.
unsafe fn call_method_def(
    def: *const PyMethodDef,
    m_self: *mut PyObject,
    args: Borrowed<'_>,
) -> *mut PyObject {
    unsafe {
        let def = &*def;
        let name = CStr::from_ptr(def.ml_name).to_string_lossy();
        let Some(meth) = def.ml_meth else {
            return set_null(ExceptionKind::SystemError, format!("{name}() has no implementation"));
        };
        let items = tuple_items(args).unwrap_or(&[]);
        if def.ml_flags & METH_NOARGS != 0 {
            if !items.is_empty() {
                return set_null(
                    ExceptionKind::TypeError,
                    format!("{name}() takes no arguments ({} given)", items.len()),
                );
            }
            meth(m_self, ptr::null_mut())
        } else if def.ml_flags & METH_O != 0 {
            if items.len() != 1 {
                return set_null(
                    ExceptionKind::TypeError,
                    format!("{name}() takes exactly one argument ({} given)", items.len()),
                );
            }
            meth(m_self, items[0].as_ptr())
        } else if def.ml_flags & METH_VARARGS != 0 {
            meth(m_self, args.as_ptr())
        } else {
            set_null(ExceptionKind::SystemError, format!("{name}() has bad call flags"))
        }
    }
}

unsafe fn reject_kwargs(kwargs: *mut PyObject, what: &str) -> bool {
    match unsafe { Borrowed::from_ptr(kwargs) } {
        Some(kw) if dict_len(kw) > 0 => {
            err_set(
                ExceptionKind::TypeError,
                format!("{what} takes no keyword arguments"),
            );
            true
        }
        _ => false,
    }
}

pub(crate) unsafe extern "C" fn cfunction_call(
    func: *mut PyObject,
    args: *mut PyObject,
    kwargs: *mut PyObject,
) -> *mut PyObject {
    unsafe {
        let func = &*func.cast::<CFunctionObject>();
        if reject_kwargs(kwargs, "builtin function") {
            return ptr::null_mut();
        }
        let Some(args) = Borrowed::from_ptr(args) else {
            return set_null(ExceptionKind::SystemError, "missing argument tuple");
        };
        call_method_def(func.ml, func.m_self, args)
    }
}

pub(crate) unsafe extern "C" fn method_descr_get(
    descr: *mut PyObject,
    obj: *mut PyObject,
    _owner: *mut PyObject,
) -> *mut PyObject {
    unsafe {
        let py = PyToken::assume_held();
        let Some(obj) = Borrowed::from_ptr(obj) else {
            super::object::incref(descr);
            return descr;
        };
        let d = &*descr.cast::<MethodDescrObject>();
        if !obj.is_instance(d.d_type) {
            return set_null(
                ExceptionKind::TypeError,
                format!(
                    "descriptor for '{}' objects doesn't apply to a '{}' object",
                    type_name(d.d_type),
                    obj.type_name()
                ),
            );
        }
        new_cfunction(&py, d.d_method, Some(obj.to_owned())).into_ptr()
    }
}

/// Unbound call: the first argument is the receiver.
pub(crate) unsafe extern "C" fn method_descr_call(
    descr: *mut PyObject,
    args: *mut PyObject,
    kwargs: *mut PyObject,
) -> *mut PyObject {
    unsafe {
        let py = PyToken::assume_held();
        let d = &*descr.cast::<MethodDescrObject>();
        if reject_kwargs(kwargs, "method") {
            return ptr::null_mut();
        }
        let items = Borrowed::from_ptr(args).and_then(tuple_items).unwrap_or(&[]);
        let Some((receiver, rest)) = items.split_first() else {
            return set_null(
                ExceptionKind::TypeError,
                format!("descriptor of '{}' object needs an argument", type_name(d.d_type)),
            );
        };
        if !receiver.borrow().is_instance(d.d_type) {
            return set_null(
                ExceptionKind::TypeError,
                format!(
                    "descriptor requires a '{}' object but received a '{}'",
                    type_name(d.d_type),
                    receiver.borrow().type_name()
                ),
            );
        }
        let rest = new_tuple(&py, rest.to_vec());
        call_method_def(d.d_method, receiver.as_ptr(), rest.borrow())
    }
}

unsafe fn check_getset_receiver(d: &GetSetDescrObject, obj: Borrowed<'_>) -> bool {
    if obj.is_instance(d.d_type) {
        return true;
    }
    let name = unsafe { CStr::from_ptr((*d.d_getset).name) }.to_string_lossy();
    err_set(
        ExceptionKind::TypeError,
        format!(
            "descriptor '{name}' for '{}' objects doesn't apply to a '{}' object",
            unsafe { type_name(d.d_type) },
            obj.type_name()
        ),
    );
    false
}

pub(crate) unsafe extern "C" fn getset_descr_get(
    descr: *mut PyObject,
    obj: *mut PyObject,
    _owner: *mut PyObject,
) -> *mut PyObject {
    unsafe {
        let Some(obj) = Borrowed::from_ptr(obj) else {
            super::object::incref(descr);
            return descr;
        };
        let d = &*descr.cast::<GetSetDescrObject>();
        if !check_getset_receiver(d, obj) {
            return ptr::null_mut();
        }
        let def = &*d.d_getset;
        match def.get {
            Some(get) => get(obj.as_ptr(), def.closure),
            None => set_null(
                ExceptionKind::AttributeError,
                format!(
                    "attribute '{}' of '{}' objects is not readable",
                    CStr::from_ptr(def.name).to_string_lossy(),
                    type_name(d.d_type)
                ),
            ),
        }
    }
}

pub(crate) unsafe extern "C" fn getset_descr_set(
    descr: *mut PyObject,
    obj: *mut PyObject,
    value: *mut PyObject,
) -> c_int {
    unsafe {
        let Some(obj) = Borrowed::from_ptr(obj) else {
            return set_status(ExceptionKind::SystemError, "descriptor set without receiver");
        };
        let d = &*descr.cast::<GetSetDescrObject>();
        if !check_getset_receiver(d, obj) {
            return -1;
        }
        let def = &*d.d_getset;
        match def.set {
            Some(set) => set(obj.as_ptr(), value, def.closure),
            None => set_status(
                ExceptionKind::AttributeError,
                format!(
                    "attribute '{}' of '{}' objects is not writable",
                    CStr::from_ptr(def.name).to_string_lossy(),
                    type_name(d.d_type)
                ),
            ),
        }
    }
}

/// `tp_call` of type objects: `tp_new`, then `tp_init` when the result is
/// an instance of the called type.
pub(crate) unsafe extern "C" fn type_call(
    type_obj: *mut PyObject,
    args: *mut PyObject,
    kwargs: *mut PyObject,
) -> *mut PyObject {
    unsafe {
        let ty = type_obj.cast::<PyTypeObject>();
        let Some(new) = (*ty).tp_new else {
            return set_null(
                ExceptionKind::TypeError,
                format!("cannot create '{}' instances", type_name(ty)),
            );
        };
        let obj = new(ty, args, kwargs);
        if obj.is_null() {
            return obj;
        }
        if !is_subtype((*obj).ob_type, ty) {
            return obj;
        }
        if let Some(init) = (*ty).tp_init {
            if init(obj, args, kwargs) < 0 {
                decref(obj);
                return ptr::null_mut();
            }
        }
        obj
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{ExceptionKind, builtins, err_clear, int_value, new_int};
    use crate::gil::with_gil;

    #[test]
    fn test_calling_a_non_callable_is_type_error() {
        with_gil(|py| {
            let five = new_int(py, 5);
            let err = call(py, five.borrow(), &[]).unwrap_err();
            assert_eq!(err.exception_kind(), ExceptionKind::TypeError);
            assert_eq!(err.message(), "'int' object is not callable");
        });
    }

    #[test]
    fn test_missing_attribute_is_attribute_error() {
        with_gil(|py| {
            err_clear();
            let five = new_int(py, 5);
            let err = getattr(py, five.borrow(), "nope").unwrap_err();
            assert_eq!(err.exception_kind(), ExceptionKind::AttributeError);
        });
    }

    #[test]
    fn test_builtin_type_name_attribute() {
        with_gil(|py| {
            let int_type = unsafe { Borrowed::from_ptr(builtins().int.cast()) }.unwrap();
            let name = getattr(py, int_type, "__name__").unwrap();
            assert_eq!(str_value(name.borrow()), Some("int"));
        });
    }

    #[test]
    fn test_builtin_types_cannot_be_instantiated() {
        with_gil(|py| {
            let float_type = unsafe { Borrowed::from_ptr(builtins().float.cast()) }.unwrap();
            let err = call(py, float_type, &[]).unwrap_err();
            assert_eq!(err.message(), "cannot create 'float' instances");
            let one = new_int(py, 1);
            assert_eq!(int_value(one.borrow()), Some(1));
        });
    }
}
