//! Signal plumbing: handlers do nothing but set flags; a watcher thread
//! forwards them into the daemon's `SignalState` (a Condvar notify is not
//! async-signal-safe, so the handler cannot do it directly).
//!
//! SIGHUP marks the configuration for rereading; SIGINT and SIGTERM start
//! graceful termination.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use perch_common::signal::SignalState;

static GOT_SIGHUP: AtomicBool = AtomicBool::new(false);
static GOT_TERMINATION: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sighup(_sig: libc::c_int) {
    GOT_SIGHUP.store(true, Ordering::SeqCst);
}

extern "C" fn handle_termination(_sig: libc::c_int) {
    GOT_TERMINATION.store(true, Ordering::SeqCst);
}

fn install_handler(sig: libc::c_int, handler: extern "C" fn(libc::c_int)) -> io::Result<()> {
    // SAFETY: the handlers only store to static atomics, which is
    // async-signal-safe.
    let previous = unsafe { libc::signal(sig, handler as usize as libc::sighandler_t) };
    if previous == libc::SIG_ERR {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Register the handlers and start the forwarding thread. The thread ends
/// itself once shutdown has been delivered.
pub fn install(signals: &SignalState) -> io::Result<()> {
    install_handler(libc::SIGHUP, handle_sighup)?;
    install_handler(libc::SIGINT, handle_termination)?;
    install_handler(libc::SIGTERM, handle_termination)?;

    let signals = signals.clone();
    std::thread::Builder::new()
        .name("perchd-signals".to_string())
        .spawn(move || loop {
            if GOT_SIGHUP.swap(false, Ordering::SeqCst) {
                signals.request_reload();
            }
            if GOT_TERMINATION.swap(false, Ordering::SeqCst) {
                signals.request_shutdown();
            }
            if signals.is_shutdown() {
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raised_signals_reach_the_signal_state() {
        let signals = SignalState::new();
        install(&signals).unwrap();

        // SAFETY: raising a signal at our own process; the installed
        // handler only sets a flag.
        unsafe { libc::raise(libc::SIGHUP) };
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !signals.take_reload() {
            assert!(std::time::Instant::now() < deadline, "reload never arrived");
            std::thread::sleep(Duration::from_millis(10));
        }

        unsafe { libc::raise(libc::SIGTERM) };
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !signals.is_shutdown() {
            assert!(std::time::Instant::now() < deadline, "shutdown never arrived");
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
