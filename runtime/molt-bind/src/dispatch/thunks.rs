//! `extern "C"` entry points installed in type objects and method tables.
//! Each one resolves its per-type context and hands off to an overload set
//! behind [`boundary`].

use std::ffi::{CStr, CString};
use std::ptr;
use std::sync::Arc;

use libc::{c_int, c_void};
use molt_obj_model::{METH_VARARGS, PyMethodDef, PyObject, PyTypeObject};

use super::boundary;
use crate::abi::{
    Borrowed, ObjRef, capsule_pointer, dict_len, new_capsule, new_cfunction, tuple_items,
    type_name,
};
use crate::context::{FunctionTable, OverloadSet, TypeContext};
use crate::descriptor::cstring;
use crate::error::{BindError, BindResult};
use crate::gil::PyToken;
use crate::marshal::IntoWire;
use crate::metaclass;
use crate::object_model::destroy;
use crate::registry::name_hash;

const CALLABLE_CAPSULE: &CStr = c"molt_bind.callable";

/// Where a capsule-backed callable finds its overloads.
pub(crate) enum CallTarget {
    Static(Arc<TypeContext>),
    Free(Arc<FunctionTable>),
}

/// Owned by the capsule that is the callable's `m_self`.
struct CallableRecord {
    def: PyMethodDef,
    name: CString,
    name_hash: u64,
    target: CallTarget,
}

impl CallableRecord {
    fn overloads(&self) -> BindResult<&OverloadSet> {
        match &self.target {
            CallTarget::Static(context) => context.static_method(self.name_hash),
            CallTarget::Free(table) => table.get(self.name_hash),
        }
    }
}

/// A builtin function object dispatching `name` through `target`.
pub(crate) fn callable_object(
    py: &PyToken<'_>,
    name: &str,
    target: CallTarget,
) -> BindResult<ObjRef> {
    let name_c = cstring(name)?;
    let mut record = Box::new(CallableRecord {
        def: PyMethodDef::sentinel(),
        name: name_c,
        name_hash: name_hash(name),
        target,
    });
    record.def = PyMethodDef {
        ml_name: record.name.as_ptr(),
        ml_meth: Some(static_thunk),
        ml_flags: METH_VARARGS,
        ml_doc: ptr::null(),
    };
    let capsule = new_capsule(py, record, CALLABLE_CAPSULE);
    let record = capsule_pointer(capsule.borrow(), CALLABLE_CAPSULE)?.cast::<CallableRecord>();
    let def = unsafe { &raw const (*record).def };
    Ok(unsafe { new_cfunction(py, def, Some(capsule)) })
}

fn context_of<'a>(slf: Borrowed<'_>) -> BindResult<&'a TypeContext> {
    metaclass::heap_type(slf.type_ptr())
        .and_then(|heap| heap.context())
        .ok_or_else(|| {
            BindError::lookup(format!(
                "'{}' is not an instance of a bound type",
                slf.type_name()
            ))
        })
}

fn receiver<'a>(slf: *mut PyObject) -> BindResult<Borrowed<'a>> {
    unsafe { Borrowed::from_ptr(slf) }.ok_or_else(|| BindError::mismatch("missing receiver"))
}

/// Positional arguments of a call; a null tuple means none.
fn positional<'a>(args: *mut PyObject) -> BindResult<Vec<Borrowed<'a>>> {
    let Some(args) = (unsafe { Borrowed::from_ptr(args) }) else {
        return Ok(Vec::new());
    };
    let items = tuple_items(args).ok_or_else(|| {
        BindError::mismatch(format!("argument list must be a tuple, not {}", args.type_name()))
    })?;
    Ok(items.iter().map(ObjRef::borrow).collect())
}

fn with_receiver<'a>(slf: Borrowed<'a>, args: *mut PyObject) -> BindResult<Vec<Borrowed<'a>>> {
    let mut all = vec![slf];
    all.extend(positional(args)?);
    Ok(all)
}

/// Instance methods. `NAME` is the name hash the method was declared under.
pub(crate) unsafe extern "C" fn method_thunk<const NAME: u64>(
    slf: *mut PyObject,
    args: *mut PyObject,
) -> *mut PyObject {
    boundary(|py| {
        let slf = receiver(slf)?;
        let overloads = context_of(slf)?.method(NAME)?;
        let all = with_receiver(slf, args)?;
        overloads.dispatch(py, &all).map(ObjRef::into_ptr)
    })
}

/// Static methods and free functions; `record` is the owning capsule.
unsafe extern "C" fn static_thunk(record: *mut PyObject, args: *mut PyObject) -> *mut PyObject {
    boundary(|py| {
        let capsule = unsafe { Borrowed::from_ptr(record) }
            .ok_or_else(|| BindError::lookup("callable has no record"))?;
        let record = capsule_pointer(capsule, CALLABLE_CAPSULE)?.cast::<CallableRecord>();
        let overloads = unsafe { &*record }.overloads()?;
        let all = positional(args)?;
        overloads.dispatch(py, &all).map(ObjRef::into_ptr)
    })
}

/// `tp_init` of constructible value types.
pub(crate) unsafe extern "C" fn init_thunk(
    slf: *mut PyObject,
    args: *mut PyObject,
    kwargs: *mut PyObject,
) -> c_int {
    boundary(|py| {
        if unsafe { Borrowed::from_ptr(kwargs) }.is_some_and(|kw| dict_len(kw) > 0) {
            return Err(BindError::mismatch("constructors take no keyword arguments"));
        }
        let slf = receiver(slf)?;
        let constructors = context_of(slf)?.constructors();
        let all = with_receiver(slf, args)?;
        constructors.dispatch(py, &all)?;
        Ok(0)
    })
}

/// `tp_new` of value types without a constructor.
pub(crate) unsafe extern "C" fn no_constructor_new(
    ty: *mut PyTypeObject,
    _args: *mut PyObject,
    _kwargs: *mut PyObject,
) -> *mut PyObject {
    boundary(|_py| {
        Err(BindError::ConstructionUnsupported(format!(
            "'{}' declares no constructor",
            unsafe { type_name(ty) }
        )))
    })
}

/// Getter of every declared member; `closure` is the member's offset.
pub(crate) unsafe extern "C" fn member_get(
    slf: *mut PyObject,
    closure: *mut c_void,
) -> *mut PyObject {
    boundary(|py| {
        let slf = receiver(slf)?;
        let accessor = context_of(slf)?.get_accessor(closure as usize)?;
        accessor.get(py, slf).map(ObjRef::into_ptr)
    })
}

pub(crate) unsafe extern "C" fn member_set(
    slf: *mut PyObject,
    value: *mut PyObject,
    closure: *mut c_void,
) -> c_int {
    boundary(|py| {
        let slf = receiver(slf)?;
        let value = unsafe { Borrowed::from_ptr(value) }
            .ok_or_else(|| BindError::mismatch("members cannot be deleted"))?;
        let accessor = context_of(slf)?.get_accessor(closure as usize)?;
        accessor.set(py, slf, value)?;
        Ok(0)
    })
}

/// `__destroy__`: runs the destructor of an owned instance early.
pub(crate) unsafe extern "C" fn destroy_thunk<T: 'static>(
    slf: *mut PyObject,
    _args: *mut PyObject,
) -> *mut PyObject {
    boundary(|py| {
        let slf = receiver(slf)?;
        destroy::<T>(py, slf)?.into_wire(py).map(ObjRef::into_ptr)
    })
}
