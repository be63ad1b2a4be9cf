//! Process manager - death notification
//!
//! One `SIGCHLD` handler serves every engine in the process. The handler
//! only wakes a reaper thread through a self-pipe; the thread then writes a
//! byte into the private death pipe of every registered engine. Each engine
//! reaps its own child with `waitpid(WNOHANG)`, so unrelated children are
//! never stolen.

use std::collections::HashMap;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, OnceLock};
use std::thread;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::sys;

static INSTANCE: OnceLock<std::result::Result<ProcessManager, String>> = OnceLock::new();

/// Registered death pipes, keyed by engine serial
#[derive(Debug, Default)]
pub(crate) struct Registry {
    next_serial: u64,
    children: HashMap<u64, OwnedFd>,
}

impl Registry {
    /// Registers the write end of an engine's death pipe and returns the
    /// engine's serial
    pub(crate) fn add(&mut self, death_pipe: OwnedFd) -> u64 {
        self.next_serial += 1;
        let serial = self.next_serial;
        self.children.insert(serial, death_pipe);
        serial
    }

    pub(crate) fn remove(&mut self, serial: u64) -> bool {
        self.children.remove(&serial).is_some()
    }

    fn notify_all(&self) {
        for fd in self.children.values() {
            // a full pipe already carries a pending notification
            let _ = sys::write(fd.as_raw_fd(), &[0]);
        }
    }
}

/// Process-wide `SIGCHLD` dispatcher
#[derive(Debug)]
pub struct ProcessManager {
    registry: Arc<Mutex<Registry>>,
}

impl ProcessManager {
    /// Returns the manager, installing the signal handler and reaper thread
    /// on first use
    pub fn instance() -> io::Result<&'static ProcessManager> {
        INSTANCE
            .get_or_init(|| Self::install().map_err(|e| e.to_string()))
            .as_ref()
            .map_err(|msg| io::Error::new(io::ErrorKind::Other, msg.clone()))
    }

    fn install() -> io::Result<Self> {
        let (mut reader, writer) = UnixStream::pair()?;
        signal_hook::low_level::pipe::register(signal_hook::consts::SIGCHLD, writer)?;

        let registry = Arc::new(Mutex::new(Registry::default()));
        let shared = Arc::clone(&registry);
        thread::Builder::new()
            .name("forkpipe-reaper".to_string())
            .spawn(move || {
                let mut buf = [0u8; 64];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(_) => shared.lock().notify_all(),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            warn!(error = %e, "SIGCHLD pipe failed, death notification stopped");
                            break;
                        }
                    }
                }
            })?;

        info!("Installed SIGCHLD handler");
        Ok(Self { registry })
    }

    /// Locks the registry.
    ///
    /// Held across `fork` so a child that dies immediately cannot signal
    /// before its engine is registered.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock()
    }

    /// Unregisters an engine; unknown serials are ignored
    pub fn remove(&self, serial: u64) {
        if self.registry.lock().remove(serial) {
            debug!(serial, "Unregistered death pipe");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_serials_are_unique() {
        let mut registry = Registry::default();
        let (_r1, w1) = sys::pipe().unwrap();
        let (_r2, w2) = sys::pipe().unwrap();
        let a = registry.add(w1);
        let b = registry.add(w2);
        assert_ne!(a, b);
        assert!(registry.remove(a));
        assert!(!registry.remove(a));
    }

    #[test]
    fn test_notify_all_writes_one_byte_each() {
        let mut registry = Registry::default();
        let (r, w) = sys::pipe().unwrap();
        registry.add(w);
        registry.notify_all();
        assert_eq!(sys::bytes_available(r.as_raw_fd()), 1);
    }

    #[test]
    fn test_removed_pipe_is_not_notified() {
        let manager = ProcessManager::instance().unwrap();
        let (r, w) = sys::pipe().unwrap();
        let serial = manager.lock().add(w);
        manager.remove(serial);
        manager.lock().notify_all();
        assert_eq!(sys::bytes_available(r.as_raw_fd()), 0);
    }

    #[test]
    fn test_instance_is_shared() {
        let a = ProcessManager::instance().unwrap();
        let b = ProcessManager::instance().unwrap();
        assert!(std::ptr::eq(a, b));
    }
}
