//! Fire-and-forget launch of a program outside the engine
//!
//! Uses the double-fork idiom. The intermediate child starts a new session,
//! forks the grandchild that execs the program and exits immediately, so the
//! program is re-parented to init and never becomes our zombie.
//!
//! Two pipes report back to the caller:
//! - the status pipe stays empty on success (its close-on-exec write end
//!   vanishes when the grandchild execs) and carries `1` if exec failed or
//!   `2` if the second fork failed
//! - the pid pipe carries the grandchild's pid as a native-endian `pid_t`

use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;

use nix::errno::Errno;
use nix::sys::wait::waitpid;
use nix::unistd::{fork, ForkResult, Pid};
use tracing::{debug, info};

use crate::command_line::split_program;
use crate::error::{Error, Result};
use crate::spawn::ExecPlan;
use crate::sys;

const EXEC_FAILED: u8 = 1;
const FORK_FAILED: u8 = 2;

/// Starts `program` detached from the calling process.
///
/// Returns the pid of the launched program, or 0 if it could not be
/// determined. The program inherits the caller's environment and runs in
/// `working_directory` when given.
pub fn start_detached(
    program: &str,
    arguments: &[String],
    working_directory: Option<&Path>,
) -> Result<u32> {
    let plan = ExecPlan::new(program, arguments, None, working_directory)?;
    let (status_read, status_write) = sys::pipe()?;
    let (pid_read, pid_write) = sys::pipe()?;

    let intermediate = match unsafe { fork() }.map_err(std::io::Error::from)? {
        ForkResult::Child => unsafe {
            detach_and_exec(
                &plan,
                [status_read.as_raw_fd(), pid_read.as_raw_fd()],
                status_write.as_raw_fd(),
                pid_write.as_raw_fd(),
            )
        },
        ForkResult::Parent { child } => child,
    };
    drop(plan);
    drop(status_write);
    drop(pid_write);

    let mut reply = [0u8; 1];
    let status = sys::read(status_read.as_raw_fd(), &mut reply);
    reap(intermediate);

    match status {
        Ok(0) => {}
        Ok(_) if reply[0] == EXEC_FAILED => {
            return Err(Error::DetachedStartFailed(format!("could not execute {program}")))
        }
        Ok(_) => {
            return Err(Error::DetachedStartFailed(
                "Resource error (fork failure)".to_string(),
            ))
        }
        Err(e) => return Err(Error::DetachedStartFailed(e.to_string())),
    }

    let mut raw = [0u8; std::mem::size_of::<libc::pid_t>()];
    let pid = match sys::read(pid_read.as_raw_fd(), &mut raw) {
        Ok(n) if n == raw.len() => libc::pid_t::from_ne_bytes(raw).max(0) as u32,
        _ => 0,
    };
    info!(pid, program, "Started detached process");
    Ok(pid)
}

/// Splits `command` with [`crate::split_command_line`] and starts the result
/// detached
pub fn start_detached_command(command: &str) -> Result<u32> {
    let (program, arguments) = split_program(command)
        .ok_or_else(|| Error::DetachedStartFailed("No program defined".to_string()))?;
    start_detached(&program, &arguments, None)
}

fn reap(pid: Pid) {
    loop {
        match waitpid(pid, None) {
            Err(Errno::EINTR) => continue,
            Err(e) => {
                debug!(pid = %pid, error = %e, "Could not reap intermediate child");
                return;
            }
            Ok(_) => return,
        }
    }
}

unsafe fn detach_and_exec(
    plan: &ExecPlan,
    parent_ends: [RawFd; 2],
    status_write: RawFd,
    pid_write: RawFd,
) -> ! {
    libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    libc::setsid();
    for fd in parent_ends {
        libc::close(fd);
    }

    let grandchild = libc::fork();
    if grandchild == 0 {
        libc::close(pid_write);
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        if let Some(dir) = plan.working_directory() {
            libc::chdir(dir.as_ptr());
        }
        plan.exec();
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        write_all(status_write, &[EXEC_FAILED]);
        libc::_exit(1);
    } else if grandchild == -1 {
        write_all(status_write, &[FORK_FAILED]);
    }

    libc::close(status_write);
    write_all(pid_write, &grandchild.to_ne_bytes());
    libc::chdir(c"/".as_ptr());
    libc::_exit(0)
}

unsafe fn write_all(fd: RawFd, data: &[u8]) {
    while libc::write(fd, data.as_ptr().cast(), data.len()) == -1
        && std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted
    {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_start_returns_pid() {
        let arguments = ["-c".to_string(), "exit 0".to_string()];
        let pid = start_detached("/bin/sh", &arguments, None).unwrap();
        assert!(pid > 0);
    }

    #[test]
    fn test_detached_missing_program_fails() {
        let err = start_detached("/definitely/does/not/exist", &[], None).unwrap_err();
        assert!(matches!(err, Error::DetachedStartFailed(_)));
    }

    #[test]
    fn test_detached_command_requires_program() {
        assert!(start_detached_command("   ").is_err());
    }

    #[test]
    fn test_detached_runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        start_detached(
            "/bin/sh",
            &["-c".to_string(), "pwd > where.txt".to_string()],
            Some(dir.path()),
        )
        .unwrap();

        let marker = dir.path().join("where.txt");
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while std::time::Instant::now() < deadline {
            if std::fs::read_to_string(&marker).is_ok_and(|s| !s.trim().is_empty()) {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        let written = std::fs::read_to_string(&marker).unwrap();
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(Path::new(written.trim()).canonicalize().unwrap(), expected);
    }
}
