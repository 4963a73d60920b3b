//! Erasure of native signatures into runtime-callable overloads, and the
//! boundary every thunk runs behind.

mod thunks;

pub(crate) use thunks::{
    CallTarget, callable_object, destroy_thunk, init_thunk, member_get, member_set, method_thunk,
    no_constructor_new,
};

use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::{debug, error, warn};

use crate::abi::{Borrowed, ObjRef, none};
use crate::config::config;
use crate::context::{Invoke, Overload};
use crate::error::{BindError, BindResult, ExceptionSentinel, raise};
use crate::gil::PyToken;
use crate::marshal::{Claim, FromWire, IntoWire, StagingBuffer, StagingLayout, WireTag};
use crate::object_model::construct_in_place;
use crate::registry::signature_hash;

/// Why a candidate did not produce a value.
#[derive(Debug)]
pub enum DispatchFailure {
    /// The arguments do not fit this signature; try the next one.
    Mismatch(BindError),
    /// The candidate ran (or started converting) and failed.
    Raised(BindError),
}

/// A parameter list: a tuple of [`FromWire`] types.
pub trait ArgList: Sized + 'static {
    const ARITY: usize;

    fn tags() -> Vec<WireTag>;
    fn raw_sizes() -> Vec<usize>;
    fn staged_sizes() -> Vec<usize>;
    fn describe() -> String;

    /// Unpacks `args` slot by slot into `raw`.
    fn unpack_into(
        py: &PyToken<'_>,
        args: &[Borrowed<'_>],
        raw: &mut StagingBuffer<'_>,
    ) -> BindResult<()>;

    /// Converts every raw slot into the matching staged slot.
    ///
    /// # Safety
    /// `raw` must have been filled by [`unpack_into`](Self::unpack_into).
    unsafe fn convert_into(
        py: &PyToken<'_>,
        raw: &mut StagingBuffer<'_>,
        staged: &mut StagingBuffer<'_>,
    ) -> BindResult<()>;

    /// # Safety
    /// `staged` must have been filled by [`convert_into`](Self::convert_into).
    unsafe fn take(staged: &mut StagingBuffer<'_>) -> Self;
}

/// A native callable taking `Args` by position.
pub trait NativeFn<Args, R>: Send + Sync + 'static {
    fn call(&self, args: Args) -> R;
}

/// Storage borrowed by the reference parameters unpacked so far in one call.
#[derive(Default)]
struct ClaimSet {
    bound: Vec<(usize, Claim)>,
}

impl ClaimSet {
    /// Rejects argument `position` when it borrows storage an earlier
    /// argument already borrows and either borrow is mutable.
    fn add<A: FromWire>(&mut self, position: usize, raw: &A::Raw) -> BindResult<()> {
        let mut conflict = None;
        let bound = &mut self.bound;
        A::claims(raw, &mut |claim: Claim| {
            if conflict.is_none() {
                conflict = bound
                    .iter()
                    .find(|(_, earlier)| claim.conflicts_with(earlier))
                    .map(|(earlier, _)| *earlier);
            }
            bound.push((position, claim));
        });
        match conflict {
            Some(earlier) => Err(BindError::mismatch(format!(
                "argument {} aliases argument {}",
                position + 1,
                earlier + 1
            ))),
            None => Ok(()),
        }
    }
}

macro_rules! arg_list {
    ($arity:expr; $($idx:tt $name:ident),*) => {
        impl<$($name: FromWire + 'static),*> ArgList for ($($name,)*) {
            const ARITY: usize = $arity;

            fn tags() -> Vec<WireTag> {
                vec![$(<$name as FromWire>::TAG),*]
            }

            fn raw_sizes() -> Vec<usize> {
                vec![$(size_of::<<$name as FromWire>::Raw>()),*]
            }

            fn staged_sizes() -> Vec<usize> {
                vec![$(size_of::<$name>()),*]
            }

            fn describe() -> String {
                let parts: Vec<String> = vec![$(<$name as FromWire>::describe()),*];
                parts.join(", ")
            }

            #[allow(unused_variables, unused_mut)]
            fn unpack_into(
                py: &PyToken<'_>,
                args: &[Borrowed<'_>],
                raw: &mut StagingBuffer<'_>,
            ) -> BindResult<()> {
                let mut claims = ClaimSet::default();
                $(
                    let value = <$name as FromWire>::unpack(py, args[$idx])?;
                    claims.add::<$name>($idx, &value)?;
                    unsafe { raw.write($idx, value, !<$name as FromWire>::ALIASING) };
                )*
                Ok(())
            }

            #[allow(unused_variables)]
            unsafe fn convert_into(
                py: &PyToken<'_>,
                raw: &mut StagingBuffer<'_>,
                staged: &mut StagingBuffer<'_>,
            ) -> BindResult<()> {
                $(
                    let value = unsafe {
                        raw.with_slot($idx, |slot: &mut <$name as FromWire>::Raw| {
                            <$name as FromWire>::convert(py, slot)
                        })
                    }?;
                    unsafe { staged.write::<$name>($idx, value, true) };
                )*
                Ok(())
            }

            #[allow(unused_variables, unused_unsafe, clippy::unused_unit)]
            unsafe fn take(staged: &mut StagingBuffer<'_>) -> Self {
                unsafe { ($(staged.read::<$name>($idx),)*) }
            }
        }

        impl<Func, Ret, $($name),*> NativeFn<($($name,)*), Ret> for Func
        where
            Func: Fn($($name),*) -> Ret + Send + Sync + 'static,
        {
            #[allow(non_snake_case)]
            fn call(&self, ($($name,)*): ($($name,)*)) -> Ret {
                self($($name),*)
            }
        }
    };
}

arg_list!(0;);
arg_list!(1; 0 A0);
arg_list!(2; 0 A0, 1 A1);
arg_list!(3; 0 A0, 1 A1, 2 A2);
arg_list!(4; 0 A0, 1 A1, 2 A2, 3 A3);
arg_list!(5; 0 A0, 1 A1, 2 A2, 3 A3, 4 A4);
arg_list!(6; 0 A0, 1 A1, 2 A2, 3 A3, 4 A4, 5 A5);
arg_list!(7; 0 A0, 1 A1, 2 A2, 3 A3, 4 A4, 5 A5, 6 A6);
arg_list!(8; 0 A0, 1 A1, 2 A2, 3 A3, 4 A4, 5 A5, 6 A6, 7 A7);

/// Erases `f` into an overload. The first `skip` runtime arguments are not
/// parameters of `f`; `finish` turns the native result into the call's
/// return value.
fn erase<Args, R, F, W>(f: F, skip: usize, finish: W) -> Overload
where
    Args: ArgList,
    F: NativeFn<Args, R>,
    W: Fn(&PyToken<'_>, &[Borrowed<'_>], R) -> BindResult<ObjRef> + Send + Sync + 'static,
{
    let raw_layout = StagingLayout::compute(&Args::raw_sizes());
    let staged_layout = StagingLayout::compute(&Args::staged_sizes());
    let invoke: Box<Invoke> = Box::new(move |py, args| {
        let params = args.get(skip..).unwrap_or(&[]);
        if params.len() != Args::ARITY {
            return Err(DispatchFailure::Mismatch(BindError::mismatch(format!(
                "expected {} argument(s) ({}), got {}",
                Args::ARITY,
                Args::describe(),
                params.len()
            ))));
        }
        let mut raw = StagingBuffer::new(&raw_layout);
        Args::unpack_into(py, params, &mut raw).map_err(DispatchFailure::Mismatch)?;
        let mut staged = StagingBuffer::new(&staged_layout);
        unsafe { Args::convert_into(py, &mut raw, &mut staged) }.map_err(DispatchFailure::Raised)?;
        let values = unsafe { Args::take(&mut staged) };
        let result = f.call(values);
        drop(raw);
        finish(py, args, result).map_err(DispatchFailure::Raised)
    });
    Overload::new(signature_hash::<Args>(), Args::describe(), invoke)
}

/// Free functions, static methods and instance methods (receiver first).
pub(crate) fn function_overload<Args, R, F>(f: F) -> Overload
where
    Args: ArgList,
    R: IntoWire + 'static,
    F: NativeFn<Args, R>,
{
    erase(f, 0, |py, _args, result: R| result.into_wire(py))
}

/// Constructors: the first runtime argument is the Vacant instance the
/// result is moved into.
pub(crate) fn constructor_overload<T, Args, F>(f: F) -> Overload
where
    T: 'static,
    Args: ArgList,
    F: NativeFn<Args, T>,
{
    erase(f, 1, |py, args, value: T| {
        let slf = args
            .first()
            .ok_or_else(|| BindError::mismatch("constructor called without an instance"))?;
        unsafe { construct_in_place(slf.as_ptr(), value)? };
        Ok(none(py))
    })
}

/// Runs a thunk body: a token for the held lock, panics caught, and an
/// `Err` turned into the error indicator plus the failure sentinel.
pub(crate) fn boundary<T, F>(body: F) -> T
where
    T: ExceptionSentinel,
    F: FnOnce(&PyToken<'_>) -> BindResult<T>,
{
    let py = unsafe { PyToken::assume_held() };
    match catch_unwind(AssertUnwindSafe(|| body(&py))) {
        Ok(Ok(value)) => value,
        Ok(Err(err)) => {
            debug!(error = %err, "native call failed");
            raise(err)
        }
        Err(payload) => {
            let err = BindError::from_panic(payload);
            if !config().catch_panics {
                error!(error = %err, "panic reached the dispatch boundary; aborting");
                std::process::abort();
            }
            warn!(error = %err, "native callable panicked");
            raise(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::ptr::NonNull;

    use super::*;
    use crate::abi::{int_value, new_int, new_str, str_value};
    use crate::gil::with_gil;

    fn call(
        overload: &Overload,
        py: &PyToken<'_>,
        args: &[Borrowed<'_>],
    ) -> Result<ObjRef, DispatchFailure> {
        overload.invoke(py, args)
    }

    #[test]
    fn test_layout_sizes_follow_the_signature() {
        type Sig = (i32, String, &'static str, Vec<u8>);
        assert_eq!(Sig::ARITY, 4);
        assert_eq!(
            Sig::staged_sizes(),
            vec![4, size_of::<String>(), size_of::<&str>(), size_of::<Vec<u8>>()]
        );
        assert_eq!(Sig::raw_sizes()[2], size_of::<*const str>());
        assert_eq!(Sig::tags()[1], WireTag::Str);
        assert_eq!(Sig::describe(), "i32, String, &str, Vec<u8>");
    }

    #[test]
    fn test_function_overload_marshals_both_ways() {
        let concat = function_overload(|a: String, b: &'static str, n: u8| {
            format!("{a}{}", b.repeat(n as usize))
        });
        with_gil(|py| {
            let a = new_str(py, "x");
            let b = new_str(py, "yz");
            let n = new_int(py, 2);
            let out = call(&concat, py, &[a.borrow(), b.borrow(), n.borrow()]).unwrap();
            assert_eq!(str_value(out.borrow()), Some("xyzyz"));
        });
    }

    #[test]
    fn test_arity_and_shape_errors_are_mismatches() {
        let double = function_overload(|x: i64| x * 2);
        with_gil(|py| {
            assert!(matches!(
                call(&double, py, &[]),
                Err(DispatchFailure::Mismatch(_))
            ));
            let text = new_str(py, "4");
            assert!(matches!(
                call(&double, py, &[text.borrow()]),
                Err(DispatchFailure::Mismatch(_))
            ));
            let four = new_int(py, 4);
            let out = call(&double, py, &[four.borrow()]).unwrap();
            assert_eq!(int_value(out.borrow()), Some(8));
        });
    }

    #[test]
    fn test_err_results_are_raised() {
        let checked = function_overload(|x: i32| -> Result<i32, String> {
            if x < 0 {
                return Err("negative".into());
            }
            Ok(x)
        });
        with_gil(|py| {
            let minus = new_int(py, -3);
            match call(&checked, py, &[minus.borrow()]) {
                Err(DispatchFailure::Raised(err)) => assert_eq!(err.message(), "negative"),
                other => panic!("unexpected {other:?}"),
            }
        });
    }

    #[test]
    fn test_claim_set_rejects_overlapping_mutable_borrows() {
        let mut pair = [1i64, 2];
        let first = NonNull::from(&mut pair[0]);
        let second = NonNull::from(&mut pair[1]);

        let mut claims = ClaimSet::default();
        claims.add::<&'static i64>(0, &first).unwrap();
        claims.add::<&'static i64>(1, &first).unwrap();
        claims.add::<&'static mut i64>(2, &second).unwrap();
        let err = claims.add::<&'static mut i64>(3, &first).unwrap_err();
        assert_eq!(err, BindError::mismatch("argument 4 aliases argument 1"));

        let mut claims = ClaimSet::default();
        claims.add::<Option<&'static mut i64>>(0, &Some(second)).unwrap();
        let err = claims.add::<Vec<&'static i64>>(1, &vec![first, second]).unwrap_err();
        assert_eq!(err, BindError::mismatch("argument 2 aliases argument 1"));
    }

    #[test]
    fn test_boundary_translates_panics() {
        with_gil(|_py| {
            crate::abi::err_clear();
            let out: *mut molt_obj_model::PyObject = boundary(|_py| panic!("kaboom"));
            assert!(out.is_null());
            let err = BindError::fetch();
            assert_eq!(err.message(), "native code panicked: kaboom");
        });
    }
}
