//! Lock Registry (C5): named cooperative locks, shared across all sessions.
//!
//! Grounded directly on the original `locks = dict()` in
//! `x84/engine.py::_loop` — a plain map from lock name to acquisition
//! time, mutated only by the engine in response to `lock*` messages.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, error};

/// A single named lock: presence in the registry ≡ held.
#[derive(Default)]
pub struct LockRegistry {
    held: HashMap<String, Instant>,
}

impl LockRegistry {
    pub fn new() -> Self {
        LockRegistry {
            held: HashMap::new(),
        }
    }

    /// Applies acquire semantics for `name`, returning the reply to post.
    ///
    /// - Free: insert with now, grant.
    /// - Held but `stale` elapsed: overwrite with now, grant, log override.
    /// - Held, not stale (or no `stale` given): deny.
    pub fn acquire(&mut self, name: &str, stale: Option<Duration>) -> bool {
        match self.held.get(name) {
            None => {
                self.held.insert(name.to_string(), Instant::now());
                debug!(lock = name, "granted");
                true
            }
            Some(&acquired_at) => {
                if let Some(stale) = stale {
                    if acquired_at.elapsed() > stale {
                        self.held.insert(name.to_string(), Instant::now());
                        error!(lock = name, "stale; override granted");
                        return true;
                    }
                }
                debug!(lock = name, "acquire failed; already held");
                false
            }
        }
    }

    /// Applies release semantics for `name`. No reply is ever posted for a
    /// release (see §4.5); failures are logged, not surfaced.
    pub fn release(&mut self, name: &str) {
        if self.held.remove(name).is_none() {
            error!(lock = name, "release of a lock that was not held");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_round_trips() {
        let mut locks = LockRegistry::new();
        assert!(locks.acquire("room", None));
        assert!(!locks.held.is_empty());
        locks.release("room");
        assert!(locks.held.is_empty());
    }

    #[test]
    fn contended_acquire_is_denied() {
        let mut locks = LockRegistry::new();
        assert!(locks.acquire("room", None));
        assert!(!locks.acquire("room", None));
    }

    #[test]
    fn release_then_reacquire_succeeds() {
        let mut locks = LockRegistry::new();
        assert!(locks.acquire("room", None));
        assert!(!locks.acquire("room", None));
        locks.release("room");
        assert!(locks.acquire("room", None));
    }

    #[test]
    fn release_of_unheld_lock_is_a_logged_no_op() {
        let mut locks = LockRegistry::new();
        locks.release("nope"); // must not panic
    }

    #[test]
    fn stale_override_grants_after_ttl_elapses() {
        let mut locks = LockRegistry::new();
        assert!(locks.acquire("x", None));
        std::thread::sleep(Duration::from_millis(5));
        assert!(locks.acquire("x", Some(Duration::from_millis(1))));
    }

    #[test]
    fn non_stale_ttl_still_denies() {
        let mut locks = LockRegistry::new();
        assert!(locks.acquire("x", None));
        assert!(!locks.acquire("x", Some(Duration::from_secs(60))));
    }
}
