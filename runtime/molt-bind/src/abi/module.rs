use std::ptr;

use molt_obj_model::PyObject;

use super::builtins::{builtins, dict_get_item, dict_set_item, new_dict, new_str, none, str_value};
use super::err::{ExceptionKind, err_set};
use super::object::{Borrowed, ObjRef, alloc_or_abort, generic_free};
use crate::error::{BindError, BindResult};
use crate::gil::PyToken;

#[repr(C)]
pub struct ModuleObject {
    pub ob_base: PyObject,
    name: String,
    dict: ObjRef,
}

/// A module object whose dict already holds `__name__` and `__doc__`.
pub fn new_module(py: &PyToken<'_>, name: &str, doc: Option<&str>) -> BindResult<ObjRef> {
    let dict = new_dict(py);
    dict_set_item(py, dict.borrow(), "__name__", new_str(py, name))?;
    let doc = doc.map_or_else(|| none(py), |doc| new_str(py, doc));
    dict_set_item(py, dict.borrow(), "__doc__", doc)?;
    let name = name.to_owned();
    unsafe {
        let obj = alloc_or_abort(builtins().module, size_of::<ModuleObject>());
        let module = obj.as_ptr().cast::<ModuleObject>();
        (&raw mut (*module).name).write(name);
        (&raw mut (*module).dict).write(dict);
        Ok(ObjRef::from_non_null(obj))
    }
}

fn module_ref<'a>(module: Borrowed<'a>) -> BindResult<&'a ModuleObject> {
    if !module.is_instance(builtins().module) {
        return Err(BindError::mismatch(format!(
            "expected module, got {}",
            module.type_name()
        )));
    }
    Ok(unsafe { &*module.as_ptr().cast::<ModuleObject>() })
}

pub fn module_name(module: Borrowed<'_>) -> BindResult<&str> {
    module_ref(module).map(|m| m.name.as_str())
}

pub fn module_dict(module: Borrowed<'_>) -> BindResult<Borrowed<'_>> {
    module_ref(module).map(|m| m.dict.borrow())
}

pub fn module_add_object(
    py: &PyToken<'_>,
    module: Borrowed<'_>,
    name: &str,
    value: ObjRef,
) -> BindResult<()> {
    dict_set_item(py, module_dict(module)?, name, value)
}

pub(crate) unsafe extern "C" fn module_getattro(
    obj: *mut PyObject,
    name: *mut PyObject,
) -> *mut PyObject {
    unsafe {
        let (Some(module), Some(name)) = (
            Borrowed::from_ptr(obj),
            Borrowed::from_ptr(name).and_then(str_value),
        ) else {
            err_set(ExceptionKind::TypeError, "attribute name must be a string");
            return ptr::null_mut();
        };
        let module = &*module.as_ptr().cast::<ModuleObject>();
        match dict_get_item(module.dict.borrow(), name) {
            Some(value) => value.to_owned().into_ptr(),
            None => {
                err_set(
                    ExceptionKind::AttributeError,
                    format!("module '{}' has no attribute '{name}'", module.name),
                );
                ptr::null_mut()
            }
        }
    }
}

pub(crate) unsafe extern "C" fn module_dealloc(obj: *mut PyObject) {
    unsafe {
        let module = obj.cast::<ModuleObject>();
        ptr::drop_in_place(&raw mut (*module).name);
        let dict = ptr::read(&raw const (*module).dict);
        generic_free(obj);
        drop(dict);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{getattr, int_value, new_int};
    use crate::gil::with_gil;

    #[test]
    fn test_module_attributes_come_from_its_dict() {
        with_gil(|py| {
            let module = new_module(py, "demo", Some("docs")).unwrap();
            module_add_object(py, module.borrow(), "answer", new_int(py, 42)).unwrap();
            let answer = getattr(py, module.borrow(), "answer").unwrap();
            assert_eq!(int_value(answer.borrow()), Some(42));
            let doc = getattr(py, module.borrow(), "__doc__").unwrap();
            assert_eq!(str_value(doc.borrow()), Some("docs"));
            assert_eq!(module_name(module.borrow()).unwrap(), "demo");
            assert!(getattr(py, module.borrow(), "missing").is_err());
        });
    }
}
