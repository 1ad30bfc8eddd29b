//! Lifecycle gate for public store operations.
//!
//! Every public operation registers with the thread group before touching
//! any state and deregisters when it returns. Shutdown flips a flag so new
//! registrations fail with `ShuttingDown`, then blocks until the
//! outstanding count drains to zero. In-flight operations always run to
//! completion; there is no mid-operation cancellation.

use crate::error::{Result, StoreError};
use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct State {
    outstanding: usize,
    stopped: bool,
}

/// Counts in-flight operations and coordinates shutdown.
#[derive(Debug, Default)]
pub struct ThreadGroup {
    state: Mutex<State>,
    drained: Condvar,
}

impl ThreadGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an operation. Fails once shutdown has begun.
    pub fn add(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.stopped {
            return Err(StoreError::ShuttingDown);
        }
        state.outstanding += 1;
        Ok(())
    }

    /// Deregisters an operation registered with [`add`](Self::add).
    pub fn done(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.outstanding > 0, "done without matching add");
        state.outstanding = state.outstanding.saturating_sub(1);
        if state.outstanding == 0 {
            self.drained.notify_all();
        }
    }

    /// Begins shutdown and blocks until all outstanding operations finish.
    /// Idempotent.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        while state.outstanding > 0 {
            self.drained.wait(&mut state);
        }
    }

    /// True once [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }
}

/// RAII registration: [`ThreadGroup::done`] runs on drop.
pub struct ThreadGroupGuard<'a> {
    tg: &'a ThreadGroup,
}

impl ThreadGroup {
    /// Registers and returns a guard that deregisters on drop.
    pub fn enter(&self) -> Result<ThreadGroupGuard<'_>> {
        self.add()?;
        Ok(ThreadGroupGuard { tg: self })
    }
}

impl Drop for ThreadGroupGuard<'_> {
    fn drop(&mut self) {
        self.tg.done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn add_fails_after_stop() {
        let tg = ThreadGroup::new();
        tg.stop();
        assert!(matches!(tg.add(), Err(StoreError::ShuttingDown)));
    }

    #[test]
    fn guard_releases_on_drop() {
        let tg = ThreadGroup::new();
        {
            let _guard = tg.enter().unwrap();
        }
        tg.stop();
        assert!(tg.is_stopped());
    }

    #[test]
    fn stop_waits_for_outstanding_operations() {
        let tg = Arc::new(ThreadGroup::new());
        tg.add().unwrap();

        let tg2 = Arc::clone(&tg);
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            tg2.done();
        });

        tg.stop();
        assert!(tg.is_stopped());
        releaser.join().unwrap();
    }
}
