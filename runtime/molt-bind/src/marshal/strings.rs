use std::mem;

use super::{FromWire, IntoWire, WireTag, instance_value};
use crate::abi::{Borrowed, ObjRef, new_str, str_value};
use crate::error::{BindError, BindResult};
use crate::gil::PyToken;
use crate::object_model::{Access, resolve};

impl FromWire for String {
    const TAG: WireTag = WireTag::Str;
    type Raw = String;

    fn describe() -> String {
        "String".to_string()
    }

    fn unpack(_py: &PyToken<'_>, obj: Borrowed<'_>) -> BindResult<String> {
        match str_value(obj) {
            Some(text) => Ok(text.to_owned()),
            None => instance_value::<String>(obj, "str"),
        }
    }

    fn convert(_py: &PyToken<'_>, raw: &mut String) -> BindResult<String> {
        Ok(mem::take(raw))
    }
}

/// Borrows the string object's own buffer for the duration of the call.
impl FromWire for &'static str {
    const TAG: WireTag = WireTag::Str;
    const ALIASING: bool = true;
    type Raw = *const str;

    fn describe() -> String {
        "&str".to_string()
    }

    fn unpack(_py: &PyToken<'_>, obj: Borrowed<'_>) -> BindResult<*const str> {
        if let Some(text) = str_value(obj) {
            return Ok(text as *const str);
        }
        resolve::<String>(obj, Access::Shared)
            .map(|ptr| unsafe { ptr.as_ref() }.as_str() as *const str)
            .map_err(|_| BindError::mismatch(format!("expected str, got {}", obj.type_name())))
    }

    fn convert(_py: &PyToken<'_>, raw: &mut *const str) -> BindResult<&'static str> {
        Ok(unsafe { &**raw })
    }
}

impl IntoWire for String {
    fn into_wire(self, py: &PyToken<'_>) -> BindResult<ObjRef> {
        Ok(new_str(py, &self))
    }
}

impl IntoWire for &str {
    fn into_wire(self, py: &PyToken<'_>) -> BindResult<ObjRef> {
        Ok(new_str(py, self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::new_int;
    use crate::gil::with_gil;
    use crate::marshal::extract;

    #[test]
    fn test_str_param_aliases_the_object_buffer() {
        with_gil(|py| {
            let text = new_str(py, "hello");
            let mut raw = <&'static str>::unpack(py, text.borrow()).unwrap();
            let view = <&'static str>::convert(py, &mut raw).unwrap();
            assert_eq!(view, "hello");
            assert_eq!(view.as_ptr(), str_value(text.borrow()).unwrap().as_ptr());
        });
    }

    #[test]
    fn test_string_param_rejects_ints() {
        with_gil(|py| {
            let five = new_int(py, 5);
            let err = extract::<String>(py, five.borrow()).unwrap_err();
            assert_eq!(err.message(), "expected str, got int");
            assert!(extract::<&'static str>(py, five.borrow()).is_err());
        });
    }
}
