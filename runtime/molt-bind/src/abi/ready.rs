use std::ffi::CStr;

use molt_obj_model::{
    METH_STATIC, PyTypeObject, TPFLAGS_DISALLOW_INSTANTIATION, TPFLAGS_READY, TPFLAGS_READYING,
    is_getset_sentinel, is_method_sentinel,
};

use super::builtins::{
    builtins, dict_get_item, dict_set_item, new_cfunction, new_dict, new_getset_descr,
    new_method_descr,
};
use super::object::{Borrowed, type_name};
use crate::error::{BindError, BindResult};
use crate::gil::PyToken;

/// Completes a type object: links the base, inherits unset slots, and fills
/// `tp_dict` with descriptors for the method and getset tables.
///
/// `tp_new`/`tp_init` are inherited from any base other than `object`
/// unless the type disallows instantiation.
///
/// # Safety
/// `ty` must point to a type object that outlives every descriptor created
/// here, and its tables must be sentinel-terminated.
pub unsafe fn type_ready(py: &PyToken<'_>, ty: *mut PyTypeObject) -> BindResult<()> {
    let t = unsafe { &mut *ty };
    if t.has_flag(TPFLAGS_READY) {
        return Ok(());
    }
    if t.has_flag(TPFLAGS_READYING) {
        return Err(BindError::FinalizationMisuse(format!(
            "type '{}' is already being readied",
            unsafe { type_name(ty) }
        )));
    }
    t.tp_flags |= TPFLAGS_READYING;
    let result = unsafe { ready_inner(py, ty) };
    let t = unsafe { &mut *ty };
    t.tp_flags &= !TPFLAGS_READYING;
    if result.is_ok() {
        t.tp_flags |= TPFLAGS_READY;
    }
    result
}

unsafe fn ready_inner(py: &PyToken<'_>, ty: *mut PyTypeObject) -> BindResult<()> {
    let object = builtins().object;
    let t = unsafe { &mut *ty };
    if t.tp_base.is_null() && ty != object {
        t.tp_base = object;
    }
    let base_ptr = t.tp_base;
    if !base_ptr.is_null() {
        unsafe { type_ready(py, base_ptr)? };
        let base = unsafe { &*base_ptr };
        if t.tp_basicsize == 0 {
            t.tp_basicsize = base.tp_basicsize;
        }
        t.tp_dealloc = t.tp_dealloc.or(base.tp_dealloc);
        t.tp_getattro = t.tp_getattro.or(base.tp_getattro);
        t.tp_setattro = t.tp_setattro.or(base.tp_setattro);
        t.tp_alloc = t.tp_alloc.or(base.tp_alloc);
        t.tp_free = t.tp_free.or(base.tp_free);
        t.tp_call = t.tp_call.or(base.tp_call);
        t.tp_repr = t.tp_repr.or(base.tp_repr);
        t.tp_descr_get = t.tp_descr_get.or(base.tp_descr_get);
        t.tp_descr_set = t.tp_descr_set.or(base.tp_descr_set);
        if !t.has_flag(TPFLAGS_DISALLOW_INSTANTIATION) && base_ptr != object {
            t.tp_new = t.tp_new.or(base.tp_new);
            t.tp_init = t.tp_init.or(base.tp_init);
        }
    }

    if t.tp_dict.is_null() {
        t.tp_dict = new_dict(py).into_ptr();
    }
    let dict = unsafe { Borrowed::from_ptr(t.tp_dict) }
        .ok_or_else(|| BindError::lookup("type dict vanished during ready"))?;

    if !t.tp_methods.is_null() {
        let mut def = t.tp_methods;
        while !is_method_sentinel(unsafe { &*def }) {
            let name = unsafe { CStr::from_ptr((*def).ml_name) }.to_string_lossy();
            if dict_get_item(dict, &name).is_none() {
                let descr = if unsafe { (*def).ml_flags } & METH_STATIC != 0 {
                    unsafe { new_cfunction(py, def, None) }
                } else {
                    unsafe { new_method_descr(ty, def) }
                };
                dict_set_item(py, dict, &name, descr)?;
            }
            def = unsafe { def.add(1) };
        }
    }

    if !t.tp_getset.is_null() {
        let mut def = t.tp_getset;
        while !is_getset_sentinel(unsafe { &*def }) {
            let name = unsafe { CStr::from_ptr((*def).name) }.to_string_lossy();
            if dict_get_item(dict, &name).is_none() {
                dict_set_item(py, dict, &name, unsafe { new_getset_descr(ty, def) })?;
            }
            def = unsafe { def.add(1) };
        }
    }
    Ok(())
}
