//! One-shot completion signal

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A flag that is set once and can be waited on from any thread
#[derive(Debug, Default)]
pub struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag, waking all waiters. Returns false if it was already set.
    pub fn set(&self) -> bool {
        let mut done = self.done.lock();
        if *done {
            return false;
        }
        *done = true;
        self.cond.notify_all();
        true
    }

    pub fn is_set(&self) -> bool {
        *self.done.lock()
    }

    /// Block until the flag is set
    pub fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }

    /// Block until the flag is set or `timeout` elapses. Returns whether it is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock();
        while !*done {
            if self.cond.wait_until(&mut done, deadline).timed_out() {
                return *done;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_set_once() {
        let completion = Completion::new();
        assert!(!completion.is_set());
        assert!(completion.set());
        assert!(!completion.set());
        assert!(completion.is_set());
        completion.wait();
    }

    #[test]
    fn test_wait_timeout_expires() {
        let completion = Completion::new();
        assert!(!completion.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn test_wait_across_threads() {
        let completion = Arc::new(Completion::new());
        let setter = completion.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            setter.set();
        });
        assert!(completion.wait_timeout(Duration::from_secs(5)));
        handle.join().unwrap();
    }
}
