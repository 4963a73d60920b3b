//! Registry entries for scalar and `String` types, so natives can take and
//! return `&P` / `&mut P` and have them alias native storage.
//!
//! Each primitive type exposes `value` as a member plus `get()` / `set(v)`.

use once_cell::sync::OnceCell;
use tracing::debug;

use crate::builder::TypeBuilder;
use crate::error::{BindError, BindResult};
use crate::gil::PyToken;
use crate::marshal::{FromWire, IntoWire, NativeClass};
use crate::registry::name_hash;

static PRIMITIVES: OnceCell<()> = OnceCell::new();

fn register_primitive<P>() -> BindResult<()>
where
    P: NativeClass + FromWire + IntoWire + Clone,
{
    let mut builder = TypeBuilder::<P>::new(P::NAME);
    builder
        .doc(format!("Native {} storage", P::NAME))?
        .constructor(|value: P| value)?;
    // The whole value sits at offset 0.
    unsafe { builder.member_at::<P, _>("value", 0, false, |value: &P| value)? };
    builder.method::<{ name_hash("get") }, _, _, _>("get", |value: &'static P| value.clone())?;
    builder.method::<{ name_hash("set") }, _, _, _>("set", |slot: &'static mut P, value: P| {
        *slot = value;
    })?;
    builder.finalize()?;
    Ok(())
}

macro_rules! primitive_classes {
    ($($ty:ty),* $(,)?) => {
        $(
            impl NativeClass for $ty {
                const NAME: &'static str = stringify!($ty);
            }
        )*

        fn register_all() -> BindResult<()> {
            $(register_primitive::<$ty>()?;)*
            Ok(())
        }
    };
}

primitive_classes!(bool, i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64, String);

/// Registers every primitive type once per process. Later calls return the
/// first outcome's success without doing anything.
pub fn ensure_registered(_py: &PyToken<'_>) -> BindResult<()> {
    PRIMITIVES.get_or_try_init(|| {
        register_all()?;
        debug!("registered primitive reference types");
        Ok::<(), BindError>(())
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{call_method, getattr, int_value, new_int, str_value};
    use crate::gil::with_gil;
    use crate::object_model::ReferenceObject;
    use crate::registry::{self, TypeHash};

    #[test]
    fn test_primitives_register_once() {
        with_gil(|py| {
            ensure_registered(py).unwrap();
            ensure_registered(py).unwrap();
            assert!(registry::contains(TypeHash::of::<i32>()));
            assert!(registry::contains(TypeHash::of::<String>()));
            let desc = registry::lookup_type::<u8>().unwrap();
            assert_eq!(desc.name(), "u8");
            assert!(desc.is_constructible());
        });
    }

    #[test]
    fn test_mut_alias_writes_through() {
        let mut storage = 5i64;
        with_gil(|py| {
            ensure_registered(py).unwrap();
            let alias = ReferenceObject::alloc_mut(py, &mut storage).unwrap();
            let seven = new_int(py, 7);
            call_method(py, alias.borrow(), "set", &[seven.borrow()]).unwrap();
            let value = getattr(py, alias.borrow(), "value").unwrap();
            assert_eq!(int_value(value.borrow()), Some(7));
        });
        assert_eq!(storage, 7);
    }

    #[test]
    fn test_const_alias_rejects_writes() {
        let storage = String::from("fixed");
        with_gil(|py| {
            ensure_registered(py).unwrap();
            let alias = ReferenceObject::alloc_const(py, &storage).unwrap();
            let got = call_method(py, alias.borrow(), "get", &[]).unwrap();
            assert_eq!(str_value(got.borrow()), Some("fixed"));
            let other = crate::abi::new_str(py, "changed");
            assert!(call_method(py, alias.borrow(), "set", &[other.borrow()]).is_err());
            crate::abi::err_clear();
        });
        assert_eq!(storage, "fixed");
    }
}
