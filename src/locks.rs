// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Resilient mutex acquisition.
//!
//! A poisoned lock means some thread panicked while holding it. The data
//! behind the limiter's lock is a map of timestamp lists, which stays usable
//! even if an update was interrupted halfway, so we recover the guard and log
//! instead of taking the whole gateway down.

use std::sync::{Mutex, MutexGuard};

/// Acquire a mutex, recovering from poisoning if necessary.
#[inline]
pub fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "askgate::locks",
                event = "LOCK_POISONED",
                "Mutex was poisoned; recovering data. A thread previously panicked while holding this lock."
            );
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_resilient_lock_normal() {
        let lock = Mutex::new(vec![1u64]);
        resilient_lock(&lock).push(2);
        assert_eq!(*resilient_lock(&lock), vec![1, 2]);
    }

    #[test]
    fn test_resilient_lock_poisoned() {
        let lock = Arc::new(Mutex::new(42));
        let lock_clone = Arc::clone(&lock);

        let handle = thread::spawn(move || {
            let _guard = lock_clone.lock().unwrap();
            panic!("intentional panic to poison lock");
        });
        let _ = handle.join();

        let mut guard = resilient_lock(&lock);
        assert_eq!(*guard, 42);
        *guard = 7;
        drop(guard);
        assert_eq!(*resilient_lock(&lock), 7);
    }
}
