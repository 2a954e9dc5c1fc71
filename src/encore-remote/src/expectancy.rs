//! Echo suppression.
//!
//! While a member remote applies an inbound change, the instance's own
//! interceptor fires as if a local caller had made the change. The guard
//! below marks "(this thread, this instance) is applying an inbound change" so
//! the outbound path can drop those notifications instead of sending the
//! change straight back.

use std::sync::{Mutex, PoisonError};
use std::thread::{self, ThreadId};

static EXPECTED: Mutex<Vec<(ThreadId, usize)>> = Mutex::new(Vec::new());

/// Registered while an inbound change is applied; unregisters on drop,
/// including on early return and unwinding.
#[must_use = "the expectancy ends as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ExpectancyGuard {
    thread: ThreadId,
    instance: usize,
}

impl ExpectancyGuard {
    pub fn enter(instance: usize) -> Self {
        let thread = thread::current().id();
        EXPECTED
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((thread, instance));
        Self { thread, instance }
    }
}

impl Drop for ExpectancyGuard {
    fn drop(&mut self) {
        let mut expected = EXPECTED.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pos) = expected
            .iter()
            .rposition(|entry| *entry == (self.thread, self.instance))
        {
            expected.swap_remove(pos);
        }
    }
}

/// Whether the current thread is applying an inbound change to `instance`.
pub fn is_expected(instance: usize) -> bool {
    let thread = thread::current().id();
    EXPECTED
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .any(|entry| *entry == (thread, instance))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_scopes_expectancy() {
        let key = 0x1000;
        assert!(!is_expected(key));
        {
            let _guard = ExpectancyGuard::enter(key);
            assert!(is_expected(key));
            assert!(!is_expected(key + 1));
        }
        assert!(!is_expected(key));
    }

    #[test]
    fn nested_guards_unwind_in_order() {
        let key = 0x2000;
        let outer = ExpectancyGuard::enter(key);
        let inner = ExpectancyGuard::enter(key);
        drop(inner);
        assert!(is_expected(key));
        drop(outer);
        assert!(!is_expected(key));
    }

    #[test]
    fn other_threads_are_unaffected() {
        let key = 0x3000;
        let _guard = ExpectancyGuard::enter(key);
        let seen = thread::spawn(move || is_expected(key)).join().unwrap();
        assert!(!seen);
    }

    #[test]
    fn guard_is_released_on_panic() {
        let key = 0x4000;
        let result = std::panic::catch_unwind(|| {
            let _guard = ExpectancyGuard::enter(key);
            panic!("apply failed");
        });
        assert!(result.is_err());
        assert!(!is_expected(key));
    }
}
