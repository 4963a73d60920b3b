//! Per-type argument and return contracts.
//!
//! A parameter type describes how a runtime object is unpacked into raw
//! scratch (`Raw`), then converted into the value handed to the native
//! callable. Both steps are per-type and resolved at compile time; the
//! dispatcher only sees their sizes through [`ArgList`](crate::dispatch::ArgList).

mod class;
mod containers;
mod layout;
mod scalars;
mod staging;
mod strings;

use std::ptr::NonNull;

pub use class::{NativeClass, resolve_shared};
pub use layout::StagingLayout;
pub use staging::StagingBuffer;

use crate::abi::{Borrowed, ObjRef};
use crate::error::{BindError, BindResult};
use crate::gil::PyToken;
use crate::object_model::{Access, resolve};

/// How an argument travels through the runtime's calling convention. The
/// format unit mirrors the runtime's argument-parsing codes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WireTag {
    Bool,
    Int,
    Float,
    Str,
    Sequence,
    Optional,
    Object,
    Instance,
}

impl WireTag {
    pub fn format_unit(self) -> &'static str {
        match self {
            Self::Bool => "p",
            Self::Int => "L",
            Self::Float => "d",
            Self::Str => "s",
            Self::Sequence | Self::Optional | Self::Object => "O",
            Self::Instance => "O!",
        }
    }
}

/// Conversion of one runtime argument into a native parameter.
///
/// `unpack` failures are shape mismatches: the dispatcher moves on to the
/// next overload. `convert` runs only once a candidate is chosen.
pub trait FromWire: Sized {
    const TAG: WireTag;
    /// The raw scratch points into a runtime object and is never released.
    const ALIASING: bool = false;
    type Raw;

    fn describe() -> String;
    fn unpack(py: &PyToken<'_>, obj: Borrowed<'_>) -> BindResult<Self::Raw>;
    fn convert(py: &PyToken<'_>, raw: &mut Self::Raw) -> BindResult<Self>;

    /// Reports the native storage `raw` will hand out a reference to.
    fn claims(_raw: &Self::Raw, _visit: &mut dyn FnMut(Claim)) {}
}

/// Native storage a reference parameter borrows for the duration of a call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Claim {
    pub start: usize,
    pub len: usize,
    pub exclusive: bool,
}

impl Claim {
    pub fn of<T>(ptr: NonNull<T>, exclusive: bool) -> Self {
        Self {
            start: ptr.as_ptr() as usize,
            len: size_of::<T>(),
            exclusive,
        }
    }

    /// Two claims conflict when their storage overlaps and either one is
    /// exclusive. Zero-sized storage never conflicts.
    pub fn conflicts_with(&self, other: &Claim) -> bool {
        (self.exclusive || other.exclusive)
            && self.start < other.start + other.len
            && other.start < self.start + self.len
    }
}

/// Conversion of a native return value into a runtime object.
pub trait IntoWire {
    fn into_wire(self, py: &PyToken<'_>) -> BindResult<ObjRef>;
}

/// Unpack and convert a single object.
pub fn extract<T: FromWire>(py: &PyToken<'_>, obj: Borrowed<'_>) -> BindResult<T> {
    let mut raw = T::unpack(py, obj)?;
    T::convert(py, &mut raw)
}

/// Clone of the value behind a bound instance of `T`, for value parameters
/// given an existing instance instead of a literal.
pub(crate) fn instance_value<T: Clone + 'static>(
    obj: Borrowed<'_>,
    expected: &str,
) -> BindResult<T> {
    match resolve::<T>(obj, Access::Shared) {
        Ok(ptr) => Ok(unsafe { ptr.as_ref() }.clone()),
        Err(_) => Err(BindError::mismatch(format!(
            "expected {expected}, got {}",
            obj.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim(start: usize, len: usize, exclusive: bool) -> Claim {
        Claim { start, len, exclusive }
    }

    #[test]
    fn test_claims_conflict_on_overlap_with_an_exclusive_side() {
        assert!(claim(64, 16, true).conflicts_with(&claim(64, 16, true)));
        assert!(claim(64, 16, false).conflicts_with(&claim(72, 8, true)));
        assert!(!claim(64, 16, false).conflicts_with(&claim(64, 16, false)));
        assert!(!claim(64, 16, true).conflicts_with(&claim(80, 16, true)));
        assert!(!claim(64, 0, true).conflicts_with(&claim(64, 16, true)));
    }
}
