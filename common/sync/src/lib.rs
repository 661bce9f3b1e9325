//! Thin wrappers around `std::sync` primitives that panic on a poisoned lock
//! instead of returning a `PoisonError`.
//!
//! Every lock in this workspace protects data that is only ever mutated
//! under the lock itself and never left half-updated across a panic
//! boundary that matters to correctness (see spec.md §5: "per-field
//! mutexes held only for short critical sections"). Propagating poison
//! errors at every call site would turn every `lock()` into a `match`; since
//! recovering from a poisoned lock is not a behaviour this server needs,
//! callers just get the guard.

use std::sync::LockResult;
use std::sync::TryLockError;

#[derive(Debug, Default)]
pub struct Mutex<T: ?Sized>(std::sync::Mutex<T>);

impl<T> Mutex<T> {
    pub fn new(val: T) -> Self {
        Mutex(std::sync::Mutex::new(val))
    }

    pub fn into_inner(self) -> T {
        unpoison(self.0.into_inner())
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> std::sync::MutexGuard<T> {
        unpoison(self.0.lock())
    }

    /// Attempts to acquire the lock without blocking. Returns `None` if the
    /// lock is currently held by another thread — used by the table
    /// engine's single-writer enforcement (spec.md §4.9).
    pub fn try_lock(&self) -> Option<std::sync::MutexGuard<T>> {
        match self.0.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct RwLock<T: ?Sized>(std::sync::RwLock<T>);

impl<T> RwLock<T> {
    pub fn new(val: T) -> Self {
        RwLock(std::sync::RwLock::new(val))
    }
}

impl<T: ?Sized> RwLock<T> {
    pub fn read(&self) -> std::sync::RwLockReadGuard<T> {
        unpoison(self.0.read())
    }

    pub fn write(&self) -> std::sync::RwLockWriteGuard<T> {
        unpoison(self.0.write())
    }
}

pub use std::sync::Condvar;

fn unpoison<G>(result: LockResult<G>) -> G {
    result.unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::Mutex;

    #[test]
    fn try_lock_fails_while_held() {
        let m = Mutex::new(0);
        let guard = m.lock();
        assert!(m.try_lock().is_none());
        drop(guard);
        assert!(m.try_lock().is_some());
    }

    #[test]
    fn survives_poison() {
        use std::panic;
        use std::sync::Arc;

        let m = Arc::new(Mutex::new(5));
        let m2 = m.clone();
        let _ = panic::catch_unwind(panic::AssertUnwindSafe(|| {
            let mut guard = m2.lock();
            *guard += 1;
            panic!("boom");
        }));
        assert_eq!(*m.lock(), 6);
    }
}
