use std::sync::{Mutex, MutexGuard};

use tracing::warn;

/// Lock a mutex, recovering the guard if a panicking holder poisoned it.
///
/// Engine state stays usable after a user callback panics while a lock is
/// held; the recovered state is whatever the panicking holder left behind.
pub(crate) fn lock_or_recover<'a, T>(
    lock: &'a Mutex<T>,
    component: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                component,
                result = "poisoned_recovered",
                "Recovered from poisoned engine lock"
            );
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    #[test]
    fn recovers_poisoned_mutex() {
        let lock = Mutex::new(1_u32);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let mut guard = lock.lock().expect("lock should be acquired");
            *guard = 2;
            panic!("poison lock");
        }));

        assert!(lock.is_poisoned());
        assert_eq!(*lock_or_recover(&lock, "test", "read"), 2);
    }
}
