//! Building blocks of the blocking waits
//!
//! The `wait_for_*` loops in [`crate::Process`] describe which descriptors
//! they care about with [`WaitFds`], block in [`wait_fds`] and then dispatch
//! the fired descriptors to the same handlers the event-driven path uses.

use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use crate::notifier::Direction;
use crate::sys::PollSet;

/// Time budget of one wait call. `None` never expires.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    start: Instant,
    timeout: Option<Duration>,
}

impl Deadline {
    pub(crate) fn new(timeout: Option<Duration>) -> Self {
        Self {
            start: Instant::now(),
            timeout,
        }
    }

    /// Budget left, clamped at zero
    pub(crate) fn remaining(&self) -> Option<Duration> {
        self.timeout
            .map(|timeout| timeout.saturating_sub(self.start.elapsed()))
    }
}

/// Descriptors one iteration of a wait loop multiplexes on
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct WaitFds {
    pub(crate) startup: Option<RawFd>,
    pub(crate) stdout: Option<RawFd>,
    pub(crate) stderr: Option<RawFd>,
    /// Only set while input is queued
    pub(crate) stdin: Option<RawFd>,
    pub(crate) death: Option<RawFd>,
}

/// Which descriptors fired
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Ready {
    pub(crate) startup: bool,
    pub(crate) stdout: bool,
    pub(crate) stderr: bool,
    pub(crate) stdin: bool,
    pub(crate) death: bool,
}

#[derive(Debug)]
pub(crate) enum WaitOutcome {
    Ready(Ready),
    TimedOut,
    Failed(io::Error),
}

/// Blocks until one of `fds` is ready or `deadline` passes. Interrupted
/// polls are restarted with the remaining budget.
pub(crate) fn wait_fds(fds: &WaitFds, deadline: &Deadline) -> WaitOutcome {
    let mut set = PollSet::new();
    let reads = [fds.startup, fds.stdout, fds.stderr, fds.death];
    for fd in reads.into_iter().flatten() {
        set.add(fd, Direction::Read);
    }
    if let Some(fd) = fds.stdin {
        set.add(fd, Direction::Write);
    }

    loop {
        match set.wait(deadline.remaining()) {
            Ok(0) => return WaitOutcome::TimedOut,
            Ok(_) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return WaitOutcome::Failed(e),
        }
    }

    let fired = |fd: Option<RawFd>, direction| fd.is_some_and(|fd| set.is_ready(fd, direction));
    WaitOutcome::Ready(Ready {
        startup: fired(fds.startup, Direction::Read),
        stdout: fired(fds.stdout, Direction::Read),
        stderr: fired(fds.stderr, Direction::Read),
        stdin: fired(fds.stdin, Direction::Write),
        death: fired(fds.death, Direction::Read),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_deadline_infinite_never_expires() {
        assert_eq!(Deadline::new(None).remaining(), None);
    }

    #[test]
    fn test_deadline_clamps_at_zero() {
        let deadline = Deadline::new(Some(Duration::ZERO));
        assert_eq!(deadline.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn test_wait_reports_only_fired_descriptors() {
        let (out_r, out_w) = sys::pipe().unwrap();
        let (err_r, _err_w) = sys::pipe().unwrap();
        sys::write(out_w.as_raw_fd(), b"data").unwrap();

        let fds = WaitFds {
            stdout: Some(out_r.as_raw_fd()),
            stderr: Some(err_r.as_raw_fd()),
            ..WaitFds::default()
        };
        match wait_fds(&fds, &Deadline::new(Some(Duration::from_secs(5)))) {
            WaitOutcome::Ready(ready) => {
                assert!(ready.stdout);
                assert!(!ready.stderr);
                assert!(!ready.death);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_wait_times_out() {
        let (r, _w) = sys::pipe().unwrap();
        let fds = WaitFds {
            death: Some(r.as_raw_fd()),
            ..WaitFds::default()
        };
        let outcome = wait_fds(&fds, &Deadline::new(Some(Duration::from_millis(20))));
        assert!(matches!(outcome, WaitOutcome::TimedOut));
    }

    #[test]
    fn test_writable_stdin_fires() {
        let (_r, w) = sys::pipe().unwrap();
        let fds = WaitFds {
            stdin: Some(w.as_raw_fd()),
            ..WaitFds::default()
        };
        match wait_fds(&fds, &Deadline::new(Some(Duration::from_secs(5)))) {
            WaitOutcome::Ready(ready) => assert!(ready.stdin),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
