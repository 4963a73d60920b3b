use std::cell::Cell;
use std::marker::PhantomData;

use parking_lot::RawMutex;
use parking_lot::lock_api::RawMutex as _;

/// The single execution lock guarding every object and type mutation.
static EXECUTION_LOCK: RawMutex = RawMutex::INIT;

thread_local! {
    static GIL_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Scoped acquire. Reentrant on the owning thread: only the outermost guard
/// touches the lock.
pub struct GilGuard {
    _not_send: PhantomData<*mut ()>,
}

/// Proof that the execution lock is held for `'gil`.
#[derive(Copy, Clone)]
pub struct PyToken<'gil> {
    _guard: PhantomData<(&'gil GilGuard, *mut ())>,
}

impl GilGuard {
    pub fn new() -> Self {
        let needs_lock = GIL_DEPTH.with(|depth| {
            let current = depth.get();
            depth.set(current + 1);
            current == 0
        });
        if needs_lock {
            EXECUTION_LOCK.lock();
        }
        Self {
            _not_send: PhantomData,
        }
    }

    pub fn token(&self) -> PyToken<'_> {
        PyToken {
            _guard: PhantomData,
        }
    }
}

impl Default for GilGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for GilGuard {
    fn drop(&mut self) {
        let should_release = GIL_DEPTH.with(|depth| {
            let next = depth.get().saturating_sub(1);
            depth.set(next);
            next == 0
        });
        if should_release {
            // SAFETY: depth went 1 -> 0 on this thread, so this thread locked it.
            unsafe { EXECUTION_LOCK.unlock() };
        }
    }
}

impl PyToken<'_> {
    /// Token for code the runtime only ever calls with the lock held
    /// (slot functions, thunks).
    ///
    /// # Safety
    /// The calling thread must hold the execution lock.
    pub unsafe fn assume_held<'gil>() -> PyToken<'gil> {
        debug_assert!(gil_held(), "thunk entered without the execution lock");
        PyToken {
            _guard: PhantomData,
        }
    }
}

/// Scoped release around blocking work; the previous nesting depth is
/// restored on drop.
pub struct GilReleaseGuard {
    depth: usize,
    _not_send: PhantomData<*mut ()>,
}

impl GilReleaseGuard {
    pub fn new() -> Self {
        let depth = GIL_DEPTH.with(|d| d.replace(0));
        if depth > 0 {
            // SAFETY: a non-zero depth means this thread owns the lock.
            unsafe { EXECUTION_LOCK.unlock() };
        }
        Self {
            depth,
            _not_send: PhantomData,
        }
    }
}

impl Default for GilReleaseGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for GilReleaseGuard {
    fn drop(&mut self) {
        if self.depth == 0 {
            return;
        }
        EXECUTION_LOCK.lock();
        GIL_DEPTH.with(|d| d.set(self.depth));
    }
}

pub fn gil_held() -> bool {
    GIL_DEPTH.try_with(|depth| depth.get() > 0).unwrap_or(false)
}

pub(crate) fn gil_assert() {
    debug_assert!(gil_held(), "execution lock required for object mutation");
}

pub fn with_gil<F, R>(f: F) -> R
where
    F: for<'gil> FnOnce(&PyToken<'gil>) -> R,
{
    let guard = GilGuard::new();
    let token = guard.token();
    f(&token)
}

/// Runs `f` with the execution lock released so other threads can use the
/// runtime while `f` blocks.
pub fn allow_threads<F, R>(_py: &PyToken<'_>, f: F) -> R
where
    F: FnOnce() -> R,
{
    let _release = GilReleaseGuard::new();
    f()
}

#[cfg(test)]
mod tests {
    use super::{GIL_DEPTH, GilGuard, GilReleaseGuard, allow_threads, gil_held, with_gil};

    #[test]
    fn gil_depth_tracks_nesting() {
        let start = GIL_DEPTH.with(|depth| depth.get());
        {
            let _g1 = GilGuard::new();
            assert_eq!(GIL_DEPTH.with(|d| d.get()), start + 1);
            assert!(gil_held());
            {
                let _g2 = GilGuard::new();
                assert_eq!(GIL_DEPTH.with(|d| d.get()), start + 2);
            }
            assert_eq!(GIL_DEPTH.with(|d| d.get()), start + 1);
        }
        assert_eq!(GIL_DEPTH.with(|d| d.get()), start);
    }

    #[test]
    fn release_guard_restores_depth() {
        with_gil(|_py| {
            let _inner = GilGuard::new();
            let before = GIL_DEPTH.with(|d| d.get());
            {
                let _release = GilReleaseGuard::new();
                assert!(!gil_held());
            }
            assert_eq!(GIL_DEPTH.with(|d| d.get()), before);
            assert!(gil_held());
        });
    }

    #[test]
    fn allow_threads_lets_another_thread_enter() {
        with_gil(|py| {
            let joined = allow_threads(py, || {
                std::thread::spawn(|| with_gil(|_py| gil_held()))
                    .join()
                    .unwrap_or(false)
            });
            assert!(joined);
            assert!(gil_held());
        });
    }
}
