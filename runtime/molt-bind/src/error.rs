use std::any::Any;

use libc::c_int;
use molt_obj_model::PyObject;
use thiserror::Error;

use crate::abi::{ExceptionKind, PyErrState, err_fetch, err_restore};

/// Errors raised by the binding engine. Inside a thunk they are converted to
/// the runtime's error indicator exactly once, at the dispatch boundary.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BindError {
    #[error("argument mismatch: {0}")]
    ArgumentMismatch(String),
    #[error("lookup failure: {0}")]
    LookupFailure(String),
    #[error("duplicate registration: {0}")]
    DuplicateRegistration(String),
    #[error("construction unsupported: {0}")]
    ConstructionUnsupported(String),
    #[error("finalization misuse: {0}")]
    FinalizationMisuse(String),
    #[error("{0}")]
    ForeignRuntime(PyErrState),
    #[error("overflow: {0}")]
    Overflow(String),
    #[error("native error: {0}")]
    Native(String),
}

pub type BindResult<T> = Result<T, BindError>;

impl BindError {
    pub fn mismatch(message: impl Into<String>) -> Self {
        Self::ArgumentMismatch(message.into())
    }

    pub fn lookup(message: impl Into<String>) -> Self {
        Self::LookupFailure(message.into())
    }

    pub fn duplicate(message: impl Into<String>) -> Self {
        Self::DuplicateRegistration(message.into())
    }

    /// Takes the pending runtime error. An empty indicator means a slot
    /// returned its failure sentinel without raising, which is a bug in that
    /// slot; it surfaces as `SystemError`.
    pub fn fetch() -> Self {
        Self::ForeignRuntime(err_fetch().unwrap_or_else(|| {
            PyErrState::new(
                ExceptionKind::SystemError,
                "error return without exception set",
            )
        }))
    }

    pub fn exception_kind(&self) -> ExceptionKind {
        match self {
            Self::ArgumentMismatch(_) | Self::ConstructionUnsupported(_) => {
                ExceptionKind::TypeError
            }
            Self::LookupFailure(_) => ExceptionKind::LookupError,
            Self::DuplicateRegistration(_) => ExceptionKind::ValueError,
            Self::FinalizationMisuse(_) | Self::Native(_) => ExceptionKind::RuntimeError,
            Self::Overflow(_) => ExceptionKind::OverflowError,
            Self::ForeignRuntime(state) => state.kind,
        }
    }

    /// The message carried into the runtime, without the variant prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::ArgumentMismatch(msg)
            | Self::LookupFailure(msg)
            | Self::DuplicateRegistration(msg)
            | Self::ConstructionUnsupported(msg)
            | Self::FinalizationMisuse(msg)
            | Self::Overflow(msg)
            | Self::Native(msg) => msg,
            Self::ForeignRuntime(state) => &state.message,
        }
    }

    /// Sets the runtime error indicator from this error. A foreign error is
    /// restored unchanged rather than wrapped.
    pub fn restore(self) {
        let state = match self {
            Self::ForeignRuntime(state) => state,
            other => PyErrState::new(other.exception_kind(), other.message()),
        };
        err_restore(state);
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let detail = if let Some(msg) = payload.downcast_ref::<&'static str>() {
            (*msg).to_string()
        } else if let Some(msg) = payload.downcast_ref::<String>() {
            msg.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::Native(format!("native code panicked: {detail}"))
    }
}

impl From<String> for BindError {
    fn from(message: String) -> Self {
        Self::Native(message)
    }
}

impl From<&str> for BindError {
    fn from(message: &str) -> Self {
        Self::Native(message.to_owned())
    }
}

/// Value a slot function returns after setting the error indicator.
pub trait ExceptionSentinel {
    fn exception_sentinel() -> Self;
}

impl ExceptionSentinel for *mut PyObject {
    fn exception_sentinel() -> Self {
        std::ptr::null_mut()
    }
}

impl ExceptionSentinel for c_int {
    fn exception_sentinel() -> Self {
        -1
    }
}

pub(crate) fn raise<T: ExceptionSentinel>(err: BindError) -> T {
    err.restore();
    T::exception_sentinel()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::err_clear;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            BindError::mismatch("x").exception_kind(),
            ExceptionKind::TypeError
        );
        assert_eq!(
            BindError::lookup("x").exception_kind(),
            ExceptionKind::LookupError
        );
        assert_eq!(
            BindError::duplicate("x").exception_kind(),
            ExceptionKind::ValueError
        );
        assert_eq!(
            BindError::FinalizationMisuse("x".into()).exception_kind(),
            ExceptionKind::RuntimeError
        );
        assert_eq!(
            BindError::Overflow("x".into()).exception_kind(),
            ExceptionKind::OverflowError
        );
    }

    #[test]
    fn test_restore_then_fetch_keeps_message() {
        err_clear();
        let sentinel: c_int = raise(BindError::mismatch("expected int"));
        assert_eq!(sentinel, -1);
        match BindError::fetch() {
            BindError::ForeignRuntime(state) => {
                assert_eq!(state.kind, ExceptionKind::TypeError);
                assert_eq!(state.message, "expected int");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_foreign_error_restored_unchanged() {
        err_clear();
        let state = PyErrState::new(ExceptionKind::KeyError, "missing");
        BindError::ForeignRuntime(state.clone()).restore();
        assert_eq!(BindError::fetch(), BindError::ForeignRuntime(state));
    }

    #[test]
    fn test_fetch_without_indicator_is_system_error() {
        err_clear();
        assert_eq!(BindError::fetch().exception_kind(), ExceptionKind::SystemError);
    }

    #[test]
    fn test_panic_payload_message() {
        let err = BindError::from_panic(Box::new("boom"));
        assert_eq!(err.message(), "native code panicked: boom");
    }
}
