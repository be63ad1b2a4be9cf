//! Thin wrappers over the POSIX calls the engine needs
//!
//! Every wrapper retries `EINTR` and reports failures as `io::Error`.

use std::fs::OpenOptions;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::Duration;

use crate::notifier::Direction;

/// Path of the null device
pub const NULL_DEVICE: &str = "/dev/null";

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn cvt_size(ret: libc::ssize_t) -> io::Result<usize> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// Creates a close-on-exec pipe, returning `(read_end, write_end)`
#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub(crate) fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [libc::c_int; 2] = [-1, -1];
    cvt(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) })?;
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Creates a close-on-exec pipe, returning `(read_end, write_end)`
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
)))]
pub(crate) fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [libc::c_int; 2] = [-1, -1];
    cvt(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
    let ends = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    for fd in fds {
        cvt(unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) })?;
    }
    Ok(ends)
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    if flags & libc::O_NONBLOCK == 0 {
        cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
    }
    Ok(())
}

pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let ret = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        match cvt_size(ret) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

pub(crate) fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    loop {
        let ret = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        match cvt_size(ret) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Bytes queued in a pipe according to `FIONREAD`, 0 if the query fails
pub(crate) fn bytes_available(fd: RawFd) -> usize {
    let mut nbytes: libc::c_int = 0;
    let ret = unsafe { libc::ioctl(fd, libc::FIONREAD as _, &mut nbytes as *mut libc::c_int) };
    if ret < 0 {
        0
    } else {
        nbytes.max(0) as usize
    }
}

/// Opens a redirection target for the child.
///
/// Input files are opened read-only; output files are created with mode
/// 0666 (before umask) and either truncated or appended to.
pub(crate) fn open_redirect(path: &Path, input: bool, append: bool) -> io::Result<OwnedFd> {
    let mut options = OpenOptions::new();
    if input {
        options.read(true);
    } else {
        options.write(true).create(true).mode(0o666);
        if append {
            options.append(true);
        } else {
            options.truncate(true);
        }
    }
    options.open(path).map(OwnedFd::from)
}

/// A readiness set for one `poll(2)` call
#[derive(Debug, Default)]
pub(crate) struct PollSet {
    fds: Vec<libc::pollfd>,
}

impl PollSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&mut self, fd: RawFd, direction: Direction) {
        let events = match direction {
            Direction::Read => libc::POLLIN,
            Direction::Write => libc::POLLOUT,
        };
        self.fds.push(libc::pollfd {
            fd,
            events,
            revents: 0,
        });
    }

    /// Blocks until a descriptor is ready or `timeout` passes (`None` blocks
    /// forever). Returns the number of ready descriptors; 0 means timeout.
    pub(crate) fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms = match timeout {
            None => -1,
            Some(t) => t
                .as_micros()
                .div_ceil(1000)
                .min(libc::c_int::MAX as u128) as libc::c_int,
        };
        for pfd in &mut self.fds {
            pfd.revents = 0;
        }
        let ret = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        cvt(ret).map(|n| n as usize)
    }

    /// Whether `fd` fired for `direction` in the last `wait`.
    ///
    /// Hang-up and error conditions count as ready so the handler observes
    /// EOF or the failing call itself.
    pub(crate) fn is_ready(&self, fd: RawFd, direction: Direction) -> bool {
        let wanted = match direction {
            Direction::Read => libc::POLLIN | libc::POLLHUP | libc::POLLERR,
            Direction::Write => libc::POLLOUT | libc::POLLHUP | libc::POLLERR,
        };
        self.fds.iter().any(|pfd| {
            pfd.fd == fd
                && pfd.events & direction_events(direction) != 0
                && pfd.revents & wanted != 0
        })
    }
}

fn direction_events(direction: Direction) -> libc::c_short {
    match direction {
        Direction::Read => libc::POLLIN,
        Direction::Write => libc::POLLOUT,
    }
}

/// Non-blocking readiness probe of a single descriptor
pub(crate) fn is_ready(fd: RawFd, direction: Direction) -> bool {
    let mut set = PollSet::new();
    set.add(fd, direction);
    matches!(set.wait(Some(Duration::ZERO)), Ok(n) if n > 0) && set.is_ready(fd, direction)
}
