use std::fs::{File, OpenOptions};
use std::io;
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixListener};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use nix::fcntl::{Flock, FlockArg};
use tracing::{debug, warn};

pub const DEFAULT_LOCK_FILE: &str = "/run/xtables.lock";
pub const DEFAULT_LOCK_SOCKET: &str = "xtables";

/// Serializes restore invocations against other writers of the kernel tables.
pub trait DataplaneLock: Send + Sync {
    fn lock(&self);
    fn unlock(&self);
}

/// Used when the restore binary takes the xtables lock itself.
#[derive(Clone, Copy, Debug, Default)]
pub struct DummyLock;

impl DataplaneLock for DummyLock {
    fn lock(&self) {}
    fn unlock(&self) {}
}

/// Releases a [`DataplaneLock`] when dropped.
pub struct LockGuard<'a> {
    lock: &'a dyn DataplaneLock,
}

impl<'a> LockGuard<'a> {
    pub fn new(lock: &'a dyn DataplaneLock) -> Self {
        lock.lock();
        Self { lock }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Both historical xtables locks: the 1.6.x flock on the lock file and the
/// 1.4.x abstract unix socket. Held until dropped.
pub struct IptablesLocks {
    _file: Flock<File>,
    _socket: UnixListener,
}

/// Polls both xtables locks every `probe_interval` until acquired or
/// `timeout` elapses.
pub fn grab_iptables_locks(
    lock_file: &Path,
    socket_name: &str,
    timeout: Duration,
    probe_interval: Duration,
) -> io::Result<IptablesLocks> {
    let deadline = Instant::now() + timeout;

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_file)?;
    let flock = loop {
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => break flock,
            Err((returned, errno)) => {
                file = returned;
                if Instant::now() >= deadline {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("timed out waiting for {}: {errno}", lock_file.display()),
                    ));
                }
                thread::sleep(probe_interval);
            }
        }
    };

    let addr = SocketAddr::from_abstract_name(socket_name.as_bytes())?;
    let socket = loop {
        match UnixListener::bind_addr(&addr) {
            Ok(socket) => break socket,
            Err(e) => {
                if Instant::now() >= deadline {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("timed out waiting for @{socket_name}: {e}"),
                    ));
                }
                thread::sleep(probe_interval);
            }
        }
    };

    Ok(IptablesLocks {
        _file: flock,
        _socket: socket,
    })
}

#[derive(Default)]
struct SharedLockState {
    reference_count: usize,
    handle: Option<IptablesLocks>,
}

/// Reference counted process wide lock. The first `lock` grabs the xtables
/// locks, the matching last `unlock` releases them.
pub struct SharedLock {
    state: Mutex<SharedLockState>,
    lock_file: PathBuf,
    socket_name: String,
    timeout: Duration,
    probe_interval: Duration,
}

impl SharedLock {
    pub fn new(lock_file: impl Into<PathBuf>, timeout: Duration, probe_interval: Duration) -> Self {
        Self::with_socket_name(lock_file, DEFAULT_LOCK_SOCKET, timeout, probe_interval)
    }

    pub fn with_socket_name(
        lock_file: impl Into<PathBuf>,
        socket_name: &str,
        timeout: Duration,
        probe_interval: Duration,
    ) -> Self {
        Self {
            state: Mutex::new(SharedLockState::default()),
            lock_file: lock_file.into(),
            socket_name: socket_name.to_owned(),
            timeout,
            probe_interval,
        }
    }

    pub fn reference_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reference_count
    }
}

impl DataplaneLock for SharedLock {
    fn lock(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.reference_count == 0 {
            let start = Instant::now();
            match grab_iptables_locks(
                &self.lock_file,
                &self.socket_name,
                self.timeout,
                self.probe_interval,
            ) {
                Ok(handle) => state.handle = Some(handle),
                Err(e) => panic!("failed to acquire iptables lock: {e}"),
            }
            let waited = start.elapsed();
            if waited > Duration::from_secs(1) {
                warn!(?waited, "waited a long time for the iptables lock");
            } else {
                debug!(?waited, "acquired iptables lock");
            }
        }
        state.reference_count += 1;
    }

    fn unlock(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.reference_count == 0 {
            panic!("unmatched unlock of the iptables lock");
        }
        state.reference_count -= 1;
        if state.reference_count == 0 {
            debug!("releasing iptables lock");
            state.handle = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::process;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn unique(prefix: &str) -> (PathBuf, String) {
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        let id = format!("{prefix}-{}-{n}", process::id());
        (std::env::temp_dir().join(format!("{id}.lock")), id)
    }

    fn shared(prefix: &str, timeout: Duration) -> SharedLock {
        let (path, socket) = unique(prefix);
        SharedLock::with_socket_name(path, &socket, timeout, Duration::from_millis(5))
    }

    #[test]
    fn test_nested_lock_refcount() {
        let lock = shared("egw-nested", Duration::from_secs(1));
        lock.lock();
        lock.lock();
        assert_eq!(lock.reference_count(), 2);
        lock.unlock();
        assert_eq!(lock.reference_count(), 1);
        lock.unlock();
        assert_eq!(lock.reference_count(), 0);

        // Released resources can be grabbed again.
        lock.lock();
        lock.unlock();
    }

    #[test]
    fn test_guard_releases() {
        let lock = shared("egw-guard", Duration::from_secs(1));
        {
            let _guard = LockGuard::new(&lock);
            assert_eq!(lock.reference_count(), 1);
        }
        assert_eq!(lock.reference_count(), 0);
    }

    #[test]
    #[should_panic(expected = "unmatched unlock")]
    fn test_unmatched_unlock_panics() {
        let lock = shared("egw-unmatched", Duration::from_secs(1));
        lock.unlock();
    }

    #[test]
    fn test_second_grab_times_out() {
        let (path, socket) = unique("egw-contended");
        let _held = grab_iptables_locks(
            &path,
            &socket,
            Duration::from_secs(1),
            Duration::from_millis(5),
        )
        .unwrap();
        let err = grab_iptables_locks(
            &path,
            &socket,
            Duration::from_millis(30),
            Duration::from_millis(5),
        )
        .err()
        .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    #[should_panic(expected = "failed to acquire iptables lock")]
    fn test_lock_timeout_panics() {
        let (path, socket) = unique("egw-timeout");
        let _held = grab_iptables_locks(
            &path,
            &socket,
            Duration::from_secs(1),
            Duration::from_millis(5),
        )
        .unwrap();
        let lock =
            SharedLock::with_socket_name(path, &socket, Duration::from_millis(30), Duration::from_millis(5));
        lock.lock();
    }

    #[test]
    fn test_dummy_lock_is_noop() {
        let lock = DummyLock;
        let _a = LockGuard::new(&lock);
        let _b = LockGuard::new(&lock);
    }
}
