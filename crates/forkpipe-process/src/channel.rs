//! The three standard streams of a child
//!
//! A [`Channel`] pairs the parent's view of one stream (staging buffer,
//! closed flag, readiness notifier) with an [`Endpoint`] describing where the
//! stream is connected and which pipe ends are currently held. Endpoints sit
//! behind `Arc<Mutex<_>>` so two engines can be chained: the stdout endpoint
//! of one and the stdin endpoint of the other hold weak references to each
//! other and share a single OS pipe.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::notifier::{Direction, Notifier, ReadinessSource};
use crate::ring_buffer::RingBuffer;
use crate::sys;

/// Which standard stream a channel carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelRole {
    Stdin,
    Stdout,
    Stderr,
}

impl ChannelRole {
    /// Whether the parent reads from this stream
    pub fn is_output(self) -> bool {
        !matches!(self, Self::Stdin)
    }
}

/// What a channel is connected to
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ChannelKind {
    /// A pipe to or from the parent
    #[default]
    Normal,
    /// A file opened by the parent before the fork
    Redirect(PathBuf),
    /// stdout feeding another engine's stdin
    PipeSource,
    /// stdin fed by another engine's stdout
    PipeSink,
}

pub(crate) type SharedEndpoint = Arc<Mutex<Endpoint>>;

/// Connection state of one stream. Dropping a held end closes it.
#[derive(Debug, Default)]
pub(crate) struct Endpoint {
    kind: ChannelKind,
    read: Option<OwnedFd>,
    write: Option<OwnedFd>,
    peer: Option<Weak<Mutex<Endpoint>>>,
    append: bool,
}

impl Endpoint {
    fn close(&mut self) {
        self.read = None;
        self.write = None;
    }

    fn points_to(&self, target: &SharedEndpoint) -> bool {
        self.peer
            .as_ref()
            .is_some_and(|peer| std::ptr::eq(peer.as_ptr(), Arc::as_ptr(target)))
    }
}

/// One of the engine's three channels
#[derive(Debug)]
pub(crate) struct Channel {
    pub(crate) role: ChannelRole,
    endpoint: SharedEndpoint,
    /// Data read from the child, or queued for it on stdin
    pub(crate) buffer: RingBuffer,
    /// Caller asked for end-of-stream on this channel
    pub(crate) closed: bool,
    pub(crate) notifier: Option<Notifier>,
}

impl Channel {
    pub(crate) fn new(role: ChannelRole) -> Self {
        Self {
            role,
            endpoint: Arc::default(),
            buffer: RingBuffer::new(),
            closed: false,
            notifier: None,
        }
    }

    pub(crate) fn kind(&self) -> ChannelKind {
        self.endpoint.lock().kind.clone()
    }

    pub(crate) fn is_normal(&self) -> bool {
        self.endpoint.lock().kind == ChannelKind::Normal
    }

    pub(crate) fn append(&self) -> bool {
        self.endpoint.lock().append
    }

    /// Connects the channel to `path`, breaking any chain first
    pub(crate) fn set_redirect(&mut self, path: PathBuf, append: bool) {
        self.clear();
        let mut endpoint = self.endpoint.lock();
        endpoint.kind = ChannelKind::Redirect(path);
        endpoint.append = append;
    }

    /// Chains `source` (an engine's stdout) into `sink` (another engine's
    /// stdin). Any previous connection of either side is cleared first.
    pub(crate) fn link(source: &mut Channel, sink: &mut Channel) {
        source.clear();
        sink.clear();
        let (mut src, mut dst) = lock_pair(&source.endpoint, &sink.endpoint);
        src.kind = ChannelKind::PipeSource;
        src.peer = Some(Arc::downgrade(&sink.endpoint));
        dst.kind = ChannelKind::PipeSink;
        dst.peer = Some(Arc::downgrade(&source.endpoint));
    }

    /// Resets the channel to [`ChannelKind::Normal`].
    ///
    /// A chained peer is reset too, so a link is never left one-sided.
    pub(crate) fn clear(&mut self) {
        let peer = {
            let mut endpoint = self.endpoint.lock();
            endpoint.kind = ChannelKind::Normal;
            endpoint.append = false;
            endpoint.peer.take()
        };
        let Some(peer) = peer.and_then(|weak| weak.upgrade()) else {
            return;
        };
        let mut other = peer.lock();
        if other.points_to(&self.endpoint) {
            other.kind = ChannelKind::Normal;
            other.peer = None;
        }
    }

    /// Creates the descriptors the child will inherit for this stream.
    ///
    /// `passthrough` marks a normal channel the child inherits from the
    /// parent (forwarded, or stderr merged into stdout); it gets no
    /// descriptors at all.
    pub(crate) fn open(
        &mut self,
        source: &dyn ReadinessSource,
        passthrough: bool,
    ) -> std::io::Result<()> {
        let kind = self.kind();
        match kind {
            ChannelKind::Normal => {
                if passthrough {
                    return Ok(());
                }
                let (read, write) = sys::pipe()?;
                let parent_fd = if self.role.is_output() {
                    read.as_raw_fd()
                } else {
                    write.as_raw_fd()
                };
                {
                    let mut endpoint = self.endpoint.lock();
                    endpoint.read = Some(read);
                    endpoint.write = Some(write);
                }
                self.notifier = if self.role.is_output() {
                    source.register(parent_fd, Direction::Read)
                } else {
                    // nothing queued yet
                    source.register(parent_fd, Direction::Write).map(|mut n| {
                        n.set_enabled(false);
                        n
                    })
                };
                Ok(())
            }
            ChannelKind::Redirect(path) => {
                let append = self.append();
                let file = sys::open_redirect(&path, !self.role.is_output(), append)?;
                debug!(role = ?self.role, path = %path.display(), append, "Opened redirection");
                let mut endpoint = self.endpoint.lock();
                if self.role.is_output() {
                    endpoint.write = Some(file);
                } else {
                    endpoint.read = Some(file);
                }
                Ok(())
            }
            ChannelKind::PipeSource | ChannelKind::PipeSink => self.open_chained(kind),
        }
    }

    /// Uses the end the peer already parked here, or creates a new pipe and
    /// parks the other end with the peer.
    fn open_chained(&mut self, kind: ChannelKind) -> std::io::Result<()> {
        let peer = self.endpoint.lock().peer.as_ref().and_then(Weak::upgrade);
        let Some(peer) = peer else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "chained process is gone",
            ));
        };
        let (mut own, mut other) = lock_pair(&self.endpoint, &peer);
        let is_source = kind == ChannelKind::PipeSource;
        if (is_source && own.write.is_some()) || (!is_source && own.read.is_some()) {
            return Ok(());
        }

        let (read, write) = sys::pipe()?;
        if is_source {
            own.write = Some(write);
            other.read = Some(read);
        } else {
            own.read = Some(read);
            other.write = Some(write);
        }
        Ok(())
    }

    pub(crate) fn read_fd(&self) -> Option<RawFd> {
        self.endpoint.lock().read.as_ref().map(AsRawFd::as_raw_fd)
    }

    pub(crate) fn write_fd(&self) -> Option<RawFd> {
        self.endpoint.lock().write.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Descriptor the parent reads from or writes to
    pub(crate) fn parent_fd(&self) -> Option<RawFd> {
        if self.role.is_output() {
            self.read_fd()
        } else {
            self.write_fd()
        }
    }

    /// Descriptor the child inherits on its standard stream
    pub(crate) fn child_fd(&self) -> Option<RawFd> {
        if self.role.is_output() {
            self.write_fd()
        } else {
            self.read_fd()
        }
    }

    /// Closes the child's end in the parent after the fork and switches the
    /// parent's end to non-blocking mode
    pub(crate) fn finish_fork(&mut self) -> std::io::Result<()> {
        let mut endpoint = self.endpoint.lock();
        if self.role.is_output() {
            endpoint.write = None;
            if let Some(fd) = &endpoint.read {
                sys::set_nonblocking(fd.as_raw_fd())?;
            }
        } else {
            endpoint.read = None;
            if let Some(fd) = &endpoint.write {
                sys::set_nonblocking(fd.as_raw_fd())?;
            }
        }
        Ok(())
    }

    /// Drops the notifier, then closes every held end. Safe to repeat.
    pub(crate) fn close(&mut self) {
        self.notifier = None;
        self.endpoint.lock().close();
    }

    pub(crate) fn set_notifier_enabled(&mut self, enabled: bool) {
        if let Some(notifier) = &mut self.notifier {
            notifier.set_enabled(enabled);
        }
    }
}

/// Locks two endpoints in address order, returning the guards in argument order
fn lock_pair<'a>(
    a: &'a SharedEndpoint,
    b: &'a SharedEndpoint,
) -> (MutexGuard<'a, Endpoint>, MutexGuard<'a, Endpoint>) {
    if Arc::as_ptr(a) < Arc::as_ptr(b) {
        let first = a.lock();
        let second = b.lock();
        (first, second)
    } else {
        let second = b.lock();
        let first = a.lock();
        (first, second)
    }
}
