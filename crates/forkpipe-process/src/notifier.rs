//! Readiness notification
//!
//! An engine asks its [`ReadinessSource`] for one [`Notifier`] per descriptor
//! it wants to hear about. Two strategies exist:
//!
//! - [`NoEventLoop`] hands out nothing. The engine is driven purely by the
//!   blocking `wait_for_*` calls, which multiplex with `poll(2)` directly.
//! - [`TokioReactor`] registers descriptors with a tokio reactor so that
//!   [`crate::Process::dispatch_events`] can service them asynchronously.
//!
//! A notifier never owns its descriptor. It must be dropped before the
//! descriptor is closed.

use std::fmt;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::runtime::Handle;

use crate::sys;

/// The readiness a notifier watches for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

/// Registration of one descriptor with a readiness source
pub struct Notifier {
    inner: AsyncFd<WatchedFd>,
    direction: Direction,
    enabled: bool,
}

impl Notifier {
    pub fn fd(&self) -> RawFd {
        self.inner.get_ref().0
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// A disabled notifier never reports readiness
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Resolves once the descriptor is ready.
    ///
    /// Readiness cached by the reactor is confirmed with a zero-timeout poll
    /// first; stale readiness is cleared and the task parks again.
    pub(crate) fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<()> {
        if !self.enabled {
            return Poll::Pending;
        }
        loop {
            let guard = match self.direction {
                Direction::Read => ready!(self.inner.poll_read_ready(cx)),
                Direction::Write => ready!(self.inner.poll_write_ready(cx)),
            };
            let mut guard = match guard {
                Ok(guard) => guard,
                // let the handler run into the error itself
                Err(_) => return Poll::Ready(()),
            };
            if sys::is_ready(self.fd(), self.direction) {
                return Poll::Ready(());
            }
            guard.clear_ready();
        }
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("fd", &self.fd())
            .field("direction", &self.direction)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Borrowed descriptor handed to the reactor
struct WatchedFd(RawFd);

impl AsRawFd for WatchedFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Source of readiness notifications for an engine
pub trait ReadinessSource: Send + Sync + fmt::Debug {
    /// Starts watching `fd`. `None` means notifications are unavailable and
    /// the engine must rely on its blocking waits.
    fn register(&self, fd: RawFd, direction: Direction) -> Option<Notifier>;
}

/// Strategy for engines used without an event loop
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEventLoop;

impl ReadinessSource for NoEventLoop {
    fn register(&self, _fd: RawFd, _direction: Direction) -> Option<Notifier> {
        None
    }
}

/// Strategy backed by a tokio runtime's I/O driver
#[derive(Debug, Clone)]
pub struct TokioReactor {
    handle: Handle,
}

impl TokioReactor {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Reactor of the runtime the caller is running on, if any
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl ReadinessSource for TokioReactor {
    fn register(&self, fd: RawFd, direction: Direction) -> Option<Notifier> {
        let _entered = self.handle.enter();
        let interest = match direction {
            Direction::Read => Interest::READABLE,
            Direction::Write => Interest::WRITABLE,
        };
        match AsyncFd::with_interest(WatchedFd(fd), interest) {
            Ok(inner) => Some(Notifier {
                inner,
                direction,
                enabled: true,
            }),
            Err(e) => {
                tracing::debug!(fd, error = %e, "Readiness registration failed");
                None
            }
        }
    }
}

/// Picks [`TokioReactor`] when called from inside a tokio runtime and
/// [`NoEventLoop`] otherwise
pub fn default_source() -> Arc<dyn ReadinessSource> {
    match TokioReactor::current() {
        Some(reactor) => Arc::new(reactor),
        None => Arc::new(NoEventLoop),
    }
}

/// Polls `slot` if present, treating an absent notifier as never ready
pub(crate) fn poll_slot(slot: &Option<Notifier>, cx: &mut Context<'_>) -> Poll<()> {
    match slot {
        Some(notifier) => notifier.poll_ready(cx),
        None => Poll::Pending,
    }
}
