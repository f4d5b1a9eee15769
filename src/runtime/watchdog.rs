//! Blocked-worker watchdog for the thread-per-block scheduler
//!
//! Low-overhead monitoring using atomic timestamps instead of locks.
//! Each worker stores the time it started waiting in an atomic variable,
//! and the watchdog periodically scans these timestamps to detect workers
//! stuck in an input or output wait.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{Sender, bounded};
use tracing::{info, warn};

/// Timestamp in milliseconds since UNIX_EPOCH
#[inline(always)]
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

/// What a worker is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WaitKind {
    Input = 0,
    Output = 1,
}

impl WaitKind {
    fn from_u8(v: u8) -> Self {
        if v == WaitKind::Output as u8 {
            WaitKind::Output
        } else {
            WaitKind::Input
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            WaitKind::Input => "input",
            WaitKind::Output => "output space",
        }
    }
}

struct WorkerState {
    /// Timestamp (ms since epoch) when the current blocked streak started, or 0
    blocked_since: AtomicU64,
    waiting_for: AtomicU8,
    has_warned: AtomicBool,
    block: String,
}

/// Handle to one worker's watchdog state
#[derive(Clone)]
pub struct WatchdogHandle {
    state: Arc<WorkerState>,
}

impl WatchdogHandle {
    /// The worker is about to wait; starts a streak unless one is running
    #[inline(always)]
    pub fn blocked(&self, kind: WaitKind) {
        self.state.waiting_for.store(kind as u8, Ordering::Relaxed);
        if self.state.blocked_since.load(Ordering::Relaxed) == 0 {
            self.state.blocked_since.store(now_millis(), Ordering::Relaxed);
        }
    }

    /// The worker made progress; ends the streak
    #[inline(always)]
    pub fn progressed(&self) {
        if self.state.blocked_since.swap(0, Ordering::Relaxed) != 0
            && self.state.has_warned.swap(false, Ordering::Relaxed)
        {
            info!("UNBLOCKED: [{}]", self.state.block);
        }
    }
}

/// Shared watchdog state
pub struct Watchdog {
    workers: Arc<Mutex<Vec<Weak<WorkerState>>>>,
    threshold: Duration,
    stop_tx: Mutex<Option<Sender<()>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    pub fn new(threshold: Duration) -> Self {
        Self {
            workers: Arc::new(Mutex::new(Vec::new())),
            threshold,
            stop_tx: Mutex::new(None),
            monitor: Mutex::new(None),
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Register a worker for monitoring
    pub fn register(&self, block: &str) -> WatchdogHandle {
        let state = Arc::new(WorkerState {
            blocked_since: AtomicU64::new(0),
            waiting_for: AtomicU8::new(WaitKind::Input as u8),
            has_warned: AtomicBool::new(false),
            block: block.to_string(),
        });
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::downgrade(&state));
        WatchdogHandle { state }
    }

    /// Warn once about every worker blocked longer than the threshold.
    /// Returns how many workers are currently over it.
    pub fn check_for_blocked(&self) -> usize {
        Self::scan(&self.workers, self.threshold.as_millis() as u64)
    }

    fn scan(workers: &Mutex<Vec<Weak<WorkerState>>>, threshold_ms: u64) -> usize {
        let now = now_millis();
        let mut over = 0;
        let mut workers = workers.lock().unwrap_or_else(|e| e.into_inner());

        // Remove dead weak references and check live ones
        workers.retain(|weak| {
            let Some(state) = weak.upgrade() else {
                return false;
            };
            let start = state.blocked_since.load(Ordering::Relaxed);
            if start > 0 {
                let duration_ms = now.saturating_sub(start);
                if duration_ms > threshold_ms {
                    over += 1;
                    if !state.has_warned.swap(true, Ordering::Relaxed) {
                        let kind = WaitKind::from_u8(state.waiting_for.load(Ordering::Relaxed));
                        warn!(
                            "BLOCKED: [{}] waiting for {} for {:.1}s",
                            state.block,
                            kind.as_str(),
                            duration_ms as f64 / 1000.0
                        );
                    }
                }
            }
            true
        });
        over
    }

    /// Start the monitoring thread; a no-op if it is already running
    pub fn start(&self) {
        let mut monitor = self.monitor.lock().unwrap_or_else(|e| e.into_inner());
        if monitor.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let workers = Arc::clone(&self.workers);
        let threshold_ms = self.threshold.as_millis() as u64;
        let interval = (self.threshold / 2).clamp(Duration::from_millis(10), Duration::from_secs(1));

        *monitor = Some(std::thread::spawn(move || {
            // Exits on an explicit stop or when the sender is dropped
            while let Err(crossbeam_channel::RecvTimeoutError::Timeout) = stop_rx.recv_timeout(interval) {
                Self::scan(&workers, threshold_ms);
            }
        }));
        *self.stop_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(stop_tx);
    }

    /// Stop and join the monitoring thread
    pub fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.try_send(());
        }
        if let Some(handle) = self.monitor.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reports_long_wait_once() {
        let watchdog = Watchdog::new(Duration::from_millis(20));
        assert_eq!(watchdog.threshold(), Duration::from_millis(20));
        let handle = watchdog.register("sink1");
        handle.blocked(WaitKind::Input);
        assert_eq!(watchdog.check_for_blocked(), 0);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(watchdog.check_for_blocked(), 1);
        assert!(handle.state.has_warned.load(Ordering::Relaxed));
        handle.progressed();
        assert_eq!(watchdog.check_for_blocked(), 0);
        assert!(!handle.state.has_warned.load(Ordering::Relaxed));
    }

    #[test]
    fn test_streak_keeps_first_timestamp() {
        let watchdog = Watchdog::new(Duration::from_millis(20));
        let handle = watchdog.register("copy2");
        handle.blocked(WaitKind::Output);
        std::thread::sleep(Duration::from_millis(50));
        handle.blocked(WaitKind::Output);
        assert_eq!(watchdog.check_for_blocked(), 1);
    }

    #[test]
    fn test_dead_workers_are_forgotten() {
        let watchdog = Watchdog::new(Duration::from_millis(1));
        {
            let handle = watchdog.register("gone");
            handle.blocked(WaitKind::Input);
        }
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(watchdog.check_for_blocked(), 0);
        assert!(watchdog.workers.lock().unwrap().is_empty());
    }

    #[test]
    fn test_monitor_stops_promptly() {
        let watchdog = Watchdog::new(Duration::from_secs(5));
        watchdog.start();
        watchdog.start();
        let begin = std::time::Instant::now();
        watchdog.stop();
        assert!(begin.elapsed() < Duration::from_secs(1));
    }
}
