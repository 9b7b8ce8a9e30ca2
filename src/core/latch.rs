//! Single-assignment exit code cell.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Exit code published once by the exit watcher and observed by any number
/// of waiters.
///
/// The code is stored under the mutex before waiters are notified, so anyone
/// who sees the latch fired also sees the code.
#[derive(Debug, Default)]
pub(crate) struct ExitLatch {
    code: Mutex<Option<i32>>,
    fired: Condvar,
}

impl ExitLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the exit code. Later calls are ignored.
    pub fn fire(&self, code: i32) {
        let mut slot = self.lock();
        if slot.is_none() {
            *slot = Some(code);
            self.fired.notify_all();
        }
    }

    /// Block until the code is published.
    pub fn wait(&self) -> i32 {
        let slot = self
            .fired
            .wait_while(self.lock(), |code| code.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        slot.unwrap_or(-1)
    }

    /// Block until the code is published or `timeout` elapses on the
    /// monotonic clock. Returns `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<i32> {
        let (slot, _) = self
            .fired
            .wait_timeout_while(self.lock(), timeout, |code| code.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        *slot
    }

    pub fn try_get(&self) -> Option<i32> {
        *self.lock()
    }

    fn lock(&self) -> MutexGuard<'_, Option<i32>> {
        self.code.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_fire_once() {
        let latch = ExitLatch::new();
        assert_eq!(latch.try_get(), None);
        latch.fire(3);
        latch.fire(7);
        assert_eq!(latch.try_get(), Some(3));
        assert_eq!(latch.wait(), 3);
        assert_eq!(latch.wait(), 3);
    }

    #[test]
    fn test_wait_timeout_expires() {
        let latch = ExitLatch::new();
        let start = Instant::now();
        assert_eq!(latch.wait_timeout(Duration::from_millis(50)), None);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_many_waiters_see_same_code() {
        let latch = Arc::new(ExitLatch::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let latch = Arc::clone(&latch);
                thread::spawn(move || latch.wait())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        latch.fire(42);

        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), 42);
        }
        assert_eq!(latch.wait_timeout(Duration::from_secs(1)), Some(42));
    }
}
