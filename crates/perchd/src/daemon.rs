//! Unix daemonization (double fork) and PID-file handling.

use std::fs;
use std::io;
use std::path::Path;

use thiserror::Error;

/// Detach from the foreground: fork, become a session leader, fork again so
/// we can never reacquire a controlling terminal, then chdir to the
/// configuration file's directory. Standard input and output are pointed at
/// /dev/null; stderr is left alone for the logger.
#[cfg(unix)]
pub fn daemonize(working_dir: &Path) -> io::Result<()> {
    // SAFETY: fork() is safe to call; both return paths are handled.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(io::Error::last_os_error());
    }
    if pid > 0 {
        // Parent exits without running destructors; the child owns the
        // shared descriptors now.
        std::process::exit(0);
    }

    // SAFETY: setsid() is safe after fork.
    if unsafe { libc::setsid() } < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: as above.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(io::Error::last_os_error());
    }
    if pid > 0 {
        std::process::exit(0);
    }

    std::env::set_current_dir(working_dir)?;
    redirect_stdio()?;
    Ok(())
}

#[cfg(unix)]
fn redirect_stdio() -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let dev_null = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    // SAFETY: dup2 over valid descriptors.
    unsafe {
        libc::dup2(dev_null.as_raw_fd(), libc::STDIN_FILENO);
        libc::dup2(dev_null.as_raw_fd(), libc::STDOUT_FILENO);
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn daemonize(_working_dir: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "daemonization is only supported on Unix systems",
    ))
}

/// Why the PID file could not be claimed.
#[derive(Error, Debug)]
pub enum PidFileError {
    #[error("PID file {path} exists and contains the PID of a running process ({pid})")]
    AlreadyRunning { path: String, pid: i32 },

    #[error("PID file {path} exists but could not be read: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("could not write PID file {path}: {source}")]
    Unwritable {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Claim the PID file: refuse if it names a live process, otherwise write
/// our own PID (silently replacing a stale file).
pub fn check_and_create_pid_file(path: &Path) -> Result<(), PidFileError> {
    if path.exists() {
        let contents = fs::read_to_string(path).map_err(|source| PidFileError::Unreadable {
            path: path.display().to_string(),
            source,
        })?;
        if let Ok(pid) = contents.trim().parse::<i32>() {
            if pid > 0 && process_is_alive(pid) {
                return Err(PidFileError::AlreadyRunning {
                    path: path.display().to_string(),
                    pid,
                });
            }
        }
        // Stale or garbage content: claim it.
    }

    fs::write(path, format!("{}\n", std::process::id())).map_err(|source| {
        PidFileError::Unwritable {
            path: path.display().to_string(),
            source,
        }
    })
}

/// Remove the PID file on termination. Best-effort.
pub fn remove_pid_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!("unable to remove PID file {}: {}", path.display(), e);
        }
    }
}

#[cfg(unix)]
fn process_is_alive(pid: i32) -> bool {
    // SAFETY: kill with signal 0 only probes for existence.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM means the process exists but belongs to someone else.
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_is_alive(_pid: i32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_file_created_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perchd.pid");
        check_and_create_pid_file(&path).unwrap();
        let written: i32 = fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(written, std::process::id() as i32);
    }

    #[test]
    fn test_live_pid_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perchd.pid");
        // Our own PID is certainly alive.
        fs::write(&path, format!("{}\n", std::process::id())).unwrap();
        assert!(matches!(
            check_and_create_pid_file(&path),
            Err(PidFileError::AlreadyRunning { .. })
        ));
    }

    #[test]
    fn test_stale_pid_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perchd.pid");
        // PIDs above the default pid_max are never allocated.
        fs::write(&path, "99999999\n").unwrap();
        check_and_create_pid_file(&path).unwrap();
        let written: i32 = fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(written, std::process::id() as i32);
    }

    #[test]
    fn test_garbage_pid_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perchd.pid");
        fs::write(&path, "not a pid\n").unwrap();
        check_and_create_pid_file(&path).unwrap();
    }

    #[test]
    fn test_remove_pid_file_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perchd.pid");
        remove_pid_file(&path);
        check_and_create_pid_file(&path).unwrap();
        remove_pid_file(&path);
        assert!(!path.exists());
    }
}
