//! Signal state shared between the signal handlers and the monitor loop.
//!
//! The daemon suspends only in short sleeps between protocol steps; those
//! sleeps go through [`SignalState::wait_timeout`], a Condvar-backed wait
//! that wakes within milliseconds of a termination request instead of
//! running the sleep out.
//!
//! Two sticky flags are carried: *shutdown* (SIGINT/SIGTERM; monitoring
//! unwinds at the next suspension point) and *reload* (SIGHUP; the config
//! file is reread at the loop's next convenient point).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Cloneable handle to the daemon's signal flags.
#[derive(Clone)]
pub struct SignalState {
    inner: Arc<SignalInner>,
}

struct SignalInner {
    shutdown: AtomicBool,
    reload: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl SignalState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                shutdown: AtomicBool::new(false),
                reload: AtomicBool::new(false),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Request graceful termination. Wakes every waiter immediately.
    pub fn request_shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.condvar.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Mark the configuration for rereading. Wakes waiters so a long sleep
    /// does not delay the reload.
    pub fn request_reload(&self) {
        self.inner.reload.store(true, Ordering::SeqCst);
        self.inner.condvar.notify_all();
    }

    /// Consume a pending reload request, if any.
    pub fn take_reload(&self) -> bool {
        self.inner.reload.swap(false, Ordering::SeqCst)
    }

    /// Sleep for at most `duration`, waking early on shutdown or reload.
    /// Returns `true` if shutdown has been requested (caller should unwind).
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        if self.is_shutdown() || duration.is_zero() {
            return self.is_shutdown();
        }
        let guard = self.inner.mutex.lock().unwrap_or_else(|e| e.into_inner());
        let (_guard, _timeout) = self
            .inner
            .condvar
            .wait_timeout(guard, duration)
            .unwrap_or_else(|e| e.into_inner());
        self.is_shutdown()
    }
}

impl Default for SignalState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_initial_state_is_quiet() {
        let signals = SignalState::new();
        assert!(!signals.is_shutdown());
        assert!(!signals.take_reload());
    }

    #[test]
    fn test_wait_returns_immediately_after_shutdown() {
        let signals = SignalState::new();
        signals.request_shutdown();
        let start = Instant::now();
        assert!(signals.wait_timeout(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_shutdown_wakes_a_sleeping_waiter() {
        let signals = SignalState::new();
        let waiter = signals.clone();
        let handle = std::thread::spawn(move || {
            let start = Instant::now();
            let shutdown = waiter.wait_timeout(Duration::from_secs(10));
            (shutdown, start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(20));
        signals.request_shutdown();
        let (shutdown, elapsed) = handle.join().unwrap();
        assert!(shutdown);
        assert!(elapsed < Duration::from_secs(1), "woke after {:?}", elapsed);
    }

    #[test]
    fn test_wait_expires_without_signal() {
        let signals = SignalState::new();
        let start = Instant::now();
        assert!(!signals.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_reload_is_sticky_and_consumed_once() {
        let signals = SignalState::new();
        signals.request_reload();
        assert!(signals.take_reload());
        assert!(!signals.take_reload());
        // A reload does not terminate monitoring.
        assert!(!signals.is_shutdown());
    }

    #[test]
    fn test_clone_shares_flags() {
        let a = SignalState::new();
        let b = a.clone();
        a.request_shutdown();
        assert!(b.is_shutdown());
    }
}
