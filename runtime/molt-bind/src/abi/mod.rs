//! The slice of the CPython object protocol the binding engine talks to:
//! reference counting, the builtin types it marshals through, the thread's
//! error indicator, attribute access and the call protocol.
//!
//! Structures come from `molt_obj_model` and keep the C layout, so a type
//! object built here can be handed to code that only knows the C headers.
//! There is no interpreter behind it.

mod builtins;
mod call;
mod capsule;
mod err;
mod module;
mod object;
mod ready;

pub use builtins::{
    BuiltinTypes, CFunctionObject, DictObject, FloatObject, GetSetDescrObject, IntObject,
    MethodDescrObject, SeqObject, StrObject, bool_value, builtins, dict_get_item, dict_keys,
    dict_len, dict_set_item, float_value, int_value, is_none, list_append, list_items, new_bool,
    new_cfunction, new_dict, new_float, new_int, new_list, new_str, new_tuple, none,
    sequence_items, str_value, tuple_items,
};
pub use call::{call, call_method, call_tuple, getattr, setattr};
pub(crate) use call::{type_call, type_getattro, type_setattro};
pub use capsule::{CapsuleObject, capsule_pointer, new_capsule};
pub use err::{ExceptionKind, PyErrState, err_clear, err_fetch, err_occurred, err_restore, err_set};
pub use module::{ModuleObject, module_add_object, module_dict, module_name, new_module};
pub use object::{
    Borrowed, ObjRef, alloc_or_abort, dealloc, decref, generic_alloc, generic_alloc_aligned,
    generic_free, incref, is_subtype, type_name,
};
pub use ready::type_ready;
