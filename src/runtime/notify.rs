//! Wakeup flags for thread-per-block workers

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default)]
struct NotifyState {
    input_changed: bool,
    output_changed: bool,
    message: bool,
    interrupted: bool,
}

/// Per-block condition variable plus the reasons it was signalled.
///
/// Neighbours set `input_changed` when they produce into one of our inputs and
/// `output_changed` when they consume from one of our outputs. Flags stay set
/// until the owner clears them at the top of its next iteration, so a wakeup
/// that arrives while the owner is busy is never lost.
#[derive(Debug, Default)]
pub struct ThreadNotifier {
    state: Mutex<NotifyState>,
    cond: Condvar,
}

impl ThreadNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NotifyState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn notify_input(&self) {
        self.lock().input_changed = true;
        self.cond.notify_all();
    }

    pub fn notify_output(&self) {
        self.lock().output_changed = true;
        self.cond.notify_all();
    }

    pub fn notify_message(&self) {
        self.lock().message = true;
        self.cond.notify_all();
    }

    /// Ask the owning worker to leave its loop
    pub fn interrupt(&self) {
        self.lock().interrupted = true;
        self.cond.notify_all();
    }

    pub fn is_interrupted(&self) -> bool {
        self.lock().interrupted
    }

    /// Reset for a new scheduler run
    pub fn reset(&self) {
        *self.lock() = NotifyState::default();
    }

    /// Forget pending input/output/message wakeups
    pub fn clear_changed(&self) {
        let mut st = self.lock();
        st.input_changed = false;
        st.output_changed = false;
        st.message = false;
    }

    /// Wait for new input, a message or an interrupt, at most `timeout`.
    /// Returns true if woken by one of those.
    pub fn wait_input(&self, timeout: Duration) -> bool {
        let st = self.lock();
        let (st, _) = self
            .cond
            .wait_timeout_while(st, timeout, |s| {
                !(s.input_changed || s.message || s.interrupted)
            })
            .unwrap_or_else(|e| e.into_inner());
        st.input_changed || st.message || st.interrupted
    }

    /// Wait without a deadline for output space, a message or an interrupt
    pub fn wait_output(&self) {
        let st = self.lock();
        let _st = self
            .cond
            .wait_while(st, |s| !(s.output_changed || s.message || s.interrupted))
            .unwrap_or_else(|e| e.into_inner());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_pending_flag_is_not_lost() {
        let n = ThreadNotifier::new();
        n.notify_input();
        let start = Instant::now();
        assert!(n.wait_input(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_input_wait_times_out() {
        let n = ThreadNotifier::new();
        assert!(!n.wait_input(Duration::from_millis(20)));
    }

    #[test]
    fn test_interrupt_releases_output_wait() {
        let n = Arc::new(ThreadNotifier::new());
        let waiter = {
            let n = Arc::clone(&n);
            thread::spawn(move || n.wait_output())
        };
        thread::sleep(Duration::from_millis(20));
        n.interrupt();
        waiter.join().unwrap();
        assert!(n.is_interrupted());
        n.reset();
        assert!(!n.is_interrupted());
    }

    #[test]
    fn test_clear_changed_keeps_interrupt() {
        let n = ThreadNotifier::new();
        n.notify_output();
        n.interrupt();
        n.clear_changed();
        assert!(n.is_interrupted());
    }
}
