use super::{Claim, FromWire, IntoWire, WireTag};
use crate::abi::{Borrowed, ObjRef, is_none, new_list, none, sequence_items};
use crate::error::{BindError, BindResult};
use crate::gil::PyToken;

/// Lists and tuples, element by element.
impl<T: FromWire> FromWire for Vec<T> {
    const TAG: WireTag = WireTag::Sequence;
    type Raw = Vec<T::Raw>;

    fn describe() -> String {
        format!("Vec<{}>", T::describe())
    }

    fn unpack(py: &PyToken<'_>, obj: Borrowed<'_>) -> BindResult<Self::Raw> {
        let items = sequence_items(obj).ok_or_else(|| {
            BindError::mismatch(format!("expected list or tuple, got {}", obj.type_name()))
        })?;
        items.iter().map(|item| T::unpack(py, item.borrow())).collect()
    }

    fn convert(py: &PyToken<'_>, raw: &mut Self::Raw) -> BindResult<Self> {
        raw.iter_mut().map(|item| T::convert(py, item)).collect()
    }

    fn claims(raw: &Self::Raw, visit: &mut dyn FnMut(Claim)) {
        for item in raw {
            T::claims(item, visit);
        }
    }
}

impl<T: IntoWire> IntoWire for Vec<T> {
    fn into_wire(self, py: &PyToken<'_>) -> BindResult<ObjRef> {
        let items = self
            .into_iter()
            .map(|item| item.into_wire(py))
            .collect::<BindResult<Vec<_>>>()?;
        Ok(new_list(py, items))
    }
}

impl<T: FromWire> FromWire for Option<T> {
    const TAG: WireTag = WireTag::Optional;
    type Raw = Option<T::Raw>;

    fn describe() -> String {
        format!("Option<{}>", T::describe())
    }

    fn unpack(py: &PyToken<'_>, obj: Borrowed<'_>) -> BindResult<Self::Raw> {
        if is_none(obj) {
            return Ok(None);
        }
        T::unpack(py, obj).map(Some)
    }

    fn convert(py: &PyToken<'_>, raw: &mut Self::Raw) -> BindResult<Self> {
        raw.as_mut().map(|inner| T::convert(py, inner)).transpose()
    }

    fn claims(raw: &Self::Raw, visit: &mut dyn FnMut(Claim)) {
        if let Some(inner) = raw {
            T::claims(inner, visit);
        }
    }
}

impl<T: IntoWire> IntoWire for Option<T> {
    fn into_wire(self, py: &PyToken<'_>) -> BindResult<ObjRef> {
        match self {
            Some(value) => value.into_wire(py),
            None => Ok(none(py)),
        }
    }
}

/// Any object, passed through with a new reference.
impl FromWire for ObjRef {
    const TAG: WireTag = WireTag::Object;
    type Raw = ObjRef;

    fn describe() -> String {
        "object".to_string()
    }

    fn unpack(_py: &PyToken<'_>, obj: Borrowed<'_>) -> BindResult<ObjRef> {
        Ok(obj.to_owned())
    }

    fn convert(_py: &PyToken<'_>, raw: &mut ObjRef) -> BindResult<ObjRef> {
        Ok(raw.clone())
    }
}

impl IntoWire for ObjRef {
    fn into_wire(self, _py: &PyToken<'_>) -> BindResult<ObjRef> {
        Ok(self)
    }
}

/// `Err` values raise through their [`BindError`] conversion: plain messages
/// become `RuntimeError`, a relayed runtime error keeps its kind.
impl<T: IntoWire, E: Into<BindError>> IntoWire for Result<T, E> {
    fn into_wire(self, py: &PyToken<'_>) -> BindResult<ObjRef> {
        match self {
            Ok(value) => value.into_wire(py),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{ExceptionKind, PyErrState, int_value, list_items, new_int, new_str, new_tuple};
    use crate::gil::with_gil;
    use crate::marshal::extract;

    #[test]
    fn test_vec_from_tuple_and_to_list() {
        with_gil(|py| {
            let tuple = new_tuple(py, vec![new_int(py, 1), new_int(py, 2), new_int(py, 3)]);
            let values = extract::<Vec<i64>>(py, tuple.borrow()).unwrap();
            assert_eq!(values, vec![1, 2, 3]);

            let list = values.into_wire(py).unwrap();
            let items = list_items(list.borrow()).unwrap();
            assert_eq!(int_value(items[2].borrow()), Some(3));
        });
    }

    #[test]
    fn test_vec_with_a_bad_element_is_a_mismatch() {
        with_gil(|py| {
            let tuple = new_tuple(py, vec![new_int(py, 1), new_str(py, "two")]);
            let err = extract::<Vec<i64>>(py, tuple.borrow()).unwrap_err();
            assert!(matches!(err, BindError::ArgumentMismatch(_)));
        });
    }

    #[test]
    fn test_option_maps_none() {
        with_gil(|py| {
            assert_eq!(extract::<Option<i32>>(py, none(py).borrow()).unwrap(), None);
            let seven = new_int(py, 7);
            assert_eq!(extract::<Option<i32>>(py, seven.borrow()).unwrap(), Some(7));
        });
    }

    #[test]
    fn test_err_becomes_native_error() {
        with_gil(|py| {
            let failed: Result<i32, String> = Err("disk full".to_string());
            let err = failed.into_wire(py).unwrap_err();
            assert_eq!(err, BindError::Native("disk full".to_string()));
            let failed: Result<i32, &str> = Err("read only");
            assert_eq!(
                failed.into_wire(py).unwrap_err(),
                BindError::Native("read only".to_string())
            );
        });
    }

    #[test]
    fn test_err_keeps_a_foreign_error_kind() {
        with_gil(|py| {
            let state = PyErrState::new(ExceptionKind::KeyError, "missing");
            let failed: BindResult<ObjRef> = Err(BindError::ForeignRuntime(state.clone()));
            let err = failed.into_wire(py).unwrap_err();
            assert_eq!(err.exception_kind(), ExceptionKind::KeyError);
            assert_eq!(err, BindError::ForeignRuntime(state));
        });
    }
}
