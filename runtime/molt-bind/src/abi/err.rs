use std::cell::RefCell;
use std::fmt;

/// Exception classes the shim can raise.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    TypeError,
    ValueError,
    LookupError,
    KeyError,
    AttributeError,
    RuntimeError,
    OverflowError,
    SystemError,
}

impl ExceptionKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::TypeError => "TypeError",
            Self::ValueError => "ValueError",
            Self::LookupError => "LookupError",
            Self::KeyError => "KeyError",
            Self::AttributeError => "AttributeError",
            Self::RuntimeError => "RuntimeError",
            Self::OverflowError => "OverflowError",
            Self::SystemError => "SystemError",
        }
    }
}

/// A raised exception: what the thread's error indicator holds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PyErrState {
    pub kind: ExceptionKind,
    pub message: String,
}

impl PyErrState {
    pub fn new(kind: ExceptionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for PyErrState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.name(), self.message)
    }
}

thread_local! {
    static ERR_INDICATOR: RefCell<Option<PyErrState>> = const { RefCell::new(None) };
}

pub fn err_set(kind: ExceptionKind, message: impl Into<String>) {
    err_restore(PyErrState::new(kind, message));
}

/// Replaces any pending error.
pub fn err_restore(state: PyErrState) {
    ERR_INDICATOR.with(|slot| *slot.borrow_mut() = Some(state));
}

pub fn err_fetch() -> Option<PyErrState> {
    ERR_INDICATOR.with(|slot| slot.borrow_mut().take())
}

pub fn err_occurred() -> Option<ExceptionKind> {
    ERR_INDICATOR.with(|slot| slot.borrow().as_ref().map(|state| state.kind))
}

pub fn err_clear() {
    ERR_INDICATOR.with(|slot| slot.borrow_mut().take());
}
