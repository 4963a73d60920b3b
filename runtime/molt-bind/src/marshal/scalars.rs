use super::{FromWire, IntoWire, WireTag, instance_value};
use crate::abi::{Borrowed, ObjRef, bool_value, float_value, int_value, new_bool, new_float, new_int, none};
use crate::error::{BindError, BindResult};
use crate::gil::PyToken;

impl IntoWire for () {
    fn into_wire(self, py: &PyToken<'_>) -> BindResult<ObjRef> {
        Ok(none(py))
    }
}

impl FromWire for bool {
    const TAG: WireTag = WireTag::Bool;
    type Raw = bool;

    fn describe() -> String {
        "bool".to_string()
    }

    fn unpack(_py: &PyToken<'_>, obj: Borrowed<'_>) -> BindResult<bool> {
        match bool_value(obj) {
            Some(value) => Ok(value),
            None => instance_value::<bool>(obj, "bool"),
        }
    }

    fn convert(_py: &PyToken<'_>, raw: &mut bool) -> BindResult<bool> {
        Ok(*raw)
    }
}

impl IntoWire for bool {
    fn into_wire(self, py: &PyToken<'_>) -> BindResult<ObjRef> {
        Ok(new_bool(py, self))
    }
}

macro_rules! int_wire {
    ($($ty:ty),* $(,)?) => {$(
        impl FromWire for $ty {
            const TAG: WireTag = WireTag::Int;
            type Raw = $ty;

            fn describe() -> String {
                stringify!($ty).to_string()
            }

            fn unpack(_py: &PyToken<'_>, obj: Borrowed<'_>) -> BindResult<$ty> {
                match int_value(obj) {
                    Some(value) => <$ty>::try_from(value).map_err(|_| {
                        BindError::Overflow(format!(
                            "{value} is out of range for {}",
                            stringify!($ty)
                        ))
                    }),
                    None => instance_value::<$ty>(obj, stringify!($ty)),
                }
            }

            fn convert(_py: &PyToken<'_>, raw: &mut $ty) -> BindResult<$ty> {
                Ok(*raw)
            }
        }

        impl IntoWire for $ty {
            fn into_wire(self, py: &PyToken<'_>) -> BindResult<ObjRef> {
                let value = i128::try_from(self).map_err(|_| {
                    BindError::Overflow(format!("{self} does not fit a runtime int"))
                })?;
                Ok(new_int(py, value))
            }
        }
    )*};
}

int_wire!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

macro_rules! float_wire {
    ($($ty:ty),* $(,)?) => {$(
        impl FromWire for $ty {
            const TAG: WireTag = WireTag::Float;
            type Raw = $ty;

            fn describe() -> String {
                stringify!($ty).to_string()
            }

            fn unpack(_py: &PyToken<'_>, obj: Borrowed<'_>) -> BindResult<$ty> {
                match float_value(obj) {
                    Some(value) => {
                        let narrowed = value as $ty;
                        if value.is_finite() && !f64::from(narrowed).is_finite() {
                            return Err(BindError::Overflow(format!(
                                "{value} is out of range for {}",
                                stringify!($ty)
                            )));
                        }
                        Ok(narrowed)
                    }
                    None => instance_value::<$ty>(obj, stringify!($ty)),
                }
            }

            fn convert(_py: &PyToken<'_>, raw: &mut $ty) -> BindResult<$ty> {
                Ok(*raw)
            }
        }

        impl IntoWire for $ty {
            fn into_wire(self, py: &PyToken<'_>) -> BindResult<ObjRef> {
                Ok(new_float(py, f64::from(self)))
            }
        }
    )*};
}

float_wire!(f32, f64);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{new_str, str_value};
    use crate::gil::with_gil;
    use crate::marshal::extract;

    #[test]
    fn test_int_range_is_checked() {
        with_gil(|py| {
            let big = new_int(py, 300);
            assert_eq!(extract::<i32>(py, big.borrow()).unwrap(), 300);
            let err = extract::<u8>(py, big.borrow()).unwrap_err();
            assert!(matches!(err, BindError::Overflow(_)));
            let negative = new_int(py, -1);
            assert!(extract::<usize>(py, negative.borrow()).is_err());
        });
    }

    #[test]
    fn test_floats_accept_ints() {
        with_gil(|py| {
            let two = new_int(py, 2);
            assert_eq!(extract::<f64>(py, two.borrow()).unwrap(), 2.0);
            let half = 0.5f32.into_wire(py).unwrap();
            assert_eq!(extract::<f32>(py, half.borrow()).unwrap(), 0.5);
        });
    }

    #[test]
    fn test_f32_narrowing_overflows_only_finite_values() {
        with_gil(|py| {
            let huge = new_float(py, 1e300);
            let err = extract::<f32>(py, huge.borrow()).unwrap_err();
            assert!(matches!(err, BindError::Overflow(_)));
            assert_eq!(extract::<f64>(py, huge.borrow()).unwrap(), 1e300);
            let inf = new_float(py, f64::INFINITY);
            assert_eq!(extract::<f32>(py, inf.borrow()).unwrap(), f32::INFINITY);
            let max = new_float(py, f64::from(f32::MAX));
            assert_eq!(extract::<f32>(py, max.borrow()).unwrap(), f32::MAX);
        });
    }

    #[test]
    fn test_bool_rejects_ints_and_strings() {
        with_gil(|py| {
            let one = new_int(py, 1);
            assert!(extract::<bool>(py, one.borrow()).is_err());
            let text = new_str(py, "true");
            let err = extract::<bool>(py, text.borrow()).unwrap_err();
            assert_eq!(err.message(), "expected bool, got str");
            let truth = true.into_wire(py).unwrap();
            assert!(extract::<bool>(py, truth.borrow()).unwrap());
        });
    }

    #[test]
    fn test_unit_is_none() {
        with_gil(|py| {
            let unit = ().into_wire(py).unwrap();
            assert!(crate::abi::is_none(unit.borrow()));
            assert_eq!(str_value(unit.borrow()), None);
        });
    }
}
