//! fork/exec of a managed child
//!
//! Everything the child needs is prepared in the parent as C strings before
//! the fork. Between `fork` and `exec` the child only makes async-signal-safe
//! calls and never allocates, so forking from a multithreaded parent is safe.
//!
//! When the child cannot exec it reports back through the startup pipe with a
//! five byte message: one tag byte naming the failing step followed by the
//! native-endian `errno`, then exits with status 127.

use std::ffi::{CString, OsStr};
use std::io;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::ptr;

use nix::unistd::{fork, ForkResult, Pid};

use crate::environment::ProcessEnvironment;
use crate::error::Result;

/// Search path used when `PATH` is unset or empty
const DEFAULT_PATH: &str = "/bin:/usr/bin";

const TAG_CHDIR: u8 = b'c';
const TAG_HOOK: u8 = b'h';
const TAG_EXEC: u8 = b'e';

/// Closure run in the child after redirection and `chdir`, before `exec`
pub type ChildSetupHook = Box<dyn FnMut() -> io::Result<()> + Send>;

/// Arguments, environment and search candidates for one `exec`
pub(crate) struct ExecPlan {
    _argv: Vec<CString>,
    argv_ptrs: Vec<*const libc::c_char>,
    _envp: Vec<CString>,
    envp_ptrs: Vec<*const libc::c_char>,
    candidates: Vec<CString>,
    working_directory: Option<CString>,
}

impl ExecPlan {
    /// `environment` of `None` hands the child a snapshot of the parent's
    /// environment
    pub(crate) fn new(
        program: &str,
        arguments: &[String],
        environment: Option<&ProcessEnvironment>,
        working_directory: Option<&Path>,
    ) -> Result<Self> {
        let mut argv = Vec::with_capacity(arguments.len() + 1);
        argv.push(CString::new(program)?);
        for arg in arguments {
            argv.push(CString::new(arg.as_str())?);
        }

        let envp = match environment {
            Some(env) => env.to_envp()?,
            None => inherited_envp()?,
        };

        let working_directory = working_directory
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(|dir| CString::new(dir.as_os_str().as_bytes()))
            .transpose()?;

        let argv_ptrs = null_terminated(&argv);
        let envp_ptrs = null_terminated(&envp);
        Ok(Self {
            _argv: argv,
            argv_ptrs,
            _envp: envp,
            envp_ptrs,
            candidates: path_candidates(program, std::env::var_os("PATH").as_deref())?,
            working_directory,
        })
    }

    pub(crate) fn candidates(&self) -> &[CString] {
        &self.candidates
    }

    /// Tries every candidate in order. Only returns if all of them failed,
    /// yielding `EACCES` if any candidate reported it and the last error
    /// otherwise.
    ///
    /// # Safety
    ///
    /// Replaces the process image on success; call only in a forked child.
    pub(crate) unsafe fn exec(&self) -> i32 {
        let mut saw_eacces = false;
        let mut last = libc::ENOENT;
        for candidate in &self.candidates {
            libc::execve(
                candidate.as_ptr(),
                self.argv_ptrs.as_ptr(),
                self.envp_ptrs.as_ptr(),
            );
            last = errno();
            if last == libc::EACCES {
                saw_eacces = true;
            }
        }
        if saw_eacces {
            libc::EACCES
        } else {
            last
        }
    }

    pub(crate) fn working_directory(&self) -> Option<&CString> {
        self.working_directory.as_ref()
    }
}

/// Descriptors the child installs on 0, 1 and 2. `None` leaves the
/// inherited descriptor in place.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChildStdio {
    pub(crate) stdin: Option<RawFd>,
    pub(crate) stdout: Option<RawFd>,
    pub(crate) stderr: Option<RawFd>,
    /// Duplicate fd 1 onto fd 2 instead of installing `stderr`
    pub(crate) merge_stderr: bool,
}

/// Forks and execs `plan` in the child. Returns the child's pid in the
/// parent; the child never returns.
pub(crate) fn fork_exec(
    plan: &ExecPlan,
    stdio: ChildStdio,
    startup_read: RawFd,
    startup_write: RawFd,
    hook: Option<&mut ChildSetupHook>,
) -> nix::Result<Pid> {
    match unsafe { fork() }? {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => unsafe { exec_child(plan, stdio, startup_read, startup_write, hook) },
    }
}

unsafe fn exec_child(
    plan: &ExecPlan,
    stdio: ChildStdio,
    startup_read: RawFd,
    startup_write: RawFd,
    hook: Option<&mut ChildSetupHook>,
) -> ! {
    // ignored dispositions survive exec
    libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    let mut empty: libc::sigset_t = std::mem::zeroed();
    libc::sigemptyset(&mut empty);
    libc::pthread_sigmask(libc::SIG_SETMASK, &empty, ptr::null_mut());

    if let Some(fd) = stdio.stdin {
        install(fd, libc::STDIN_FILENO);
    }
    if let Some(fd) = stdio.stdout {
        install(fd, libc::STDOUT_FILENO);
    }
    if stdio.merge_stderr {
        install(libc::STDOUT_FILENO, libc::STDERR_FILENO);
    } else if let Some(fd) = stdio.stderr {
        install(fd, libc::STDERR_FILENO);
    }

    libc::close(startup_read);

    if let Some(dir) = plan.working_directory() {
        if libc::chdir(dir.as_ptr()) == -1 {
            report_failure(startup_write, TAG_CHDIR, errno());
        }
    }

    if let Some(hook) = hook {
        // an unwind must not escape into the forked copy of the parent
        match panic::catch_unwind(AssertUnwindSafe(|| hook())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                report_failure(startup_write, TAG_HOOK, e.raw_os_error().unwrap_or(libc::EINVAL))
            }
            Err(_) => report_failure(startup_write, TAG_HOOK, libc::ECANCELED),
        }
    }

    let err = plan.exec();
    report_failure(startup_write, TAG_EXEC, err)
}

/// Makes `fd` the child's descriptor `target`, inheritable across exec
unsafe fn install(fd: RawFd, target: RawFd) {
    if fd == target {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags != -1 {
            libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC);
        }
    } else {
        while libc::dup2(fd, target) == -1 && errno() == libc::EINTR {}
    }
}

unsafe fn report_failure(fd: RawFd, tag: u8, err: i32) -> ! {
    let mut msg = [0u8; 5];
    msg[0] = tag;
    msg[1..].copy_from_slice(&err.to_ne_bytes());
    while libc::write(fd, msg.as_ptr().cast(), msg.len()) == -1 && errno() == libc::EINTR {}
    libc::_exit(127)
}

fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Renders a failure message read from the startup pipe
pub(crate) fn describe_startup_failure(msg: &[u8]) -> String {
    if msg.len() < 5 {
        return "Child process reported an unknown startup failure".to_string();
    }
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&msg[1..5]);
    let err = io::Error::from_raw_os_error(i32::from_ne_bytes(raw));
    match msg[0] {
        TAG_CHDIR => format!("Failed to change working directory: {err}"),
        TAG_HOOK => format!("Child setup failed: {err}"),
        _ => format!("Failed to execute program: {err}"),
    }
}

/// Absolute paths to try for `program`.
///
/// A program containing `/` is used as given. Otherwise every non-empty
/// entry of `path` (or the default search path) is tried in order.
pub(crate) fn path_candidates(program: &str, path: Option<&OsStr>) -> Result<Vec<CString>> {
    if program.contains('/') {
        return Ok(vec![CString::new(program)?]);
    }
    let path = path
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| OsStr::new(DEFAULT_PATH));

    let mut candidates = Vec::new();
    for dir in path.as_bytes().split(|&b| b == b':').filter(|d| !d.is_empty()) {
        let mut full = dir.to_vec();
        if !full.ends_with(b"/") {
            full.push(b'/');
        }
        full.extend_from_slice(program.as_bytes());
        candidates.push(CString::new(full)?);
    }
    Ok(candidates)
}

fn inherited_envp() -> Result<Vec<CString>> {
    std::env::vars_os()
        .map(|(name, value)| {
            let mut entry = name.as_bytes().to_vec();
            entry.push(b'=');
            entry.extend_from_slice(value.as_bytes());
            CString::new(entry).map_err(Into::into)
        })
        .collect()
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(candidates: &[CString]) -> Vec<&str> {
        candidates.iter().map(|c| c.to_str().unwrap()).collect()
    }

    #[test]
    fn test_candidates_follow_path_order() {
        let candidates = path_candidates("tool", Some(OsStr::new("/opt/a:/usr/b/::/c"))).unwrap();
        assert_eq!(names(&candidates), vec!["/opt/a/tool", "/usr/b/tool", "/c/tool"]);
    }

    #[test]
    fn test_program_with_slash_is_used_verbatim() {
        let candidates = path_candidates("./run.sh", Some(OsStr::new("/bin"))).unwrap();
        assert_eq!(names(&candidates), vec!["./run.sh"]);
    }

    #[test]
    fn test_missing_path_uses_default() {
        let candidates = path_candidates("sh", None).unwrap();
        assert_eq!(names(&candidates), vec!["/bin/sh", "/usr/bin/sh"]);
    }

    #[test]
    fn test_describe_startup_failure() {
        let mut msg = vec![TAG_EXEC];
        msg.extend_from_slice(&libc::ENOENT.to_ne_bytes());
        let text = describe_startup_failure(&msg);
        assert!(text.starts_with("Failed to execute program"));

        msg[0] = TAG_CHDIR;
        assert!(describe_startup_failure(&msg).contains("working directory"));
        assert!(describe_startup_failure(b"x").contains("unknown"));
    }

    #[test]
    fn test_plan_rejects_nul_bytes() {
        assert!(ExecPlan::new("echo", &["a\0b".to_string()], None, None).is_err());
    }

    #[test]
    fn test_plan_with_explicit_environment() {
        let env = ProcessEnvironment::from_list(["ONLY=1"]);
        let plan = ExecPlan::new("/bin/true", &[], Some(&env), Some(Path::new("/tmp"))).unwrap();
        assert_eq!(plan.argv_ptrs.len(), 2);
        assert!(plan.argv_ptrs.last().unwrap().is_null());
        assert!(plan.envp_ptrs.last().unwrap().is_null());
        assert_eq!(plan.working_directory().unwrap().to_str().unwrap(), "/tmp");
        assert_eq!(names(plan.candidates()), vec!["/bin/true"]);
    }
}
