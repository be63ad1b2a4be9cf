//! The process engine
//!
//! [`Process`] owns one child at a time together with its three channels.
//! All I/O is non-blocking. Readiness is delivered either by a tokio reactor
//! through [`Process::dispatch_events`] or by the blocking `wait_for_*` calls,
//! which multiplex the same descriptors with `poll(2)` and run the very same
//! handlers.
//!
//! Lifecycle:
//!
//! ```text
//! NotRunning --start--> Starting --exec ok--> Running --death--> NotRunning
//!                          |
//!                          +--exec failed / death--> NotRunning
//! ```
//!
//! Every failure path ends in one idempotent cleanup that drops notifiers
//! before closing the descriptors they watch.

use std::fmt;
use std::future::poll_fn;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelKind, ChannelRole};
use crate::command_line::split_program;
use crate::detached;
use crate::environment::{self, ProcessEnvironment};
use crate::error::{Error, ProcessError, Result};
use crate::events::{EventBus, ProcessEvent};
use crate::manager::ProcessManager;
use crate::notifier::{self, poll_slot, Direction, NoEventLoop, Notifier, ReadinessSource};
use crate::ring_buffer::RingBuffer;
use crate::spawn::{self, ChildSetupHook, ChildStdio, ExecPlan};
use crate::sys;
use crate::types::{
    ExitStatus, InputChannelMode, OpenMode, ProcessChannel, ProcessChannelMode, ProcessState,
    WriteMode,
};
use crate::wait::{wait_fds, Deadline, Ready, WaitFds, WaitOutcome};

/// Result of one read attempt on an output channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadOutcome {
    /// New bytes were appended to the channel buffer
    Delivered,
    /// Bytes were consumed but the caller closed the channel
    Discarded,
    /// Nothing to read right now, end of stream, or a read error
    Nothing,
}

/// Notification that woke [`Process::dispatch_events`]
#[derive(Debug, Clone, Copy)]
enum Source {
    Startup,
    Stdout,
    Stderr,
    Stdin,
    Death,
}

/// A child process and the channels connecting it to the parent
pub struct Process {
    program: String,
    arguments: Vec<String>,
    working_directory: Option<PathBuf>,
    /// `None` inherits the parent's environment
    environment: Option<ProcessEnvironment>,
    channel_mode: ProcessChannelMode,
    input_mode: InputChannelMode,
    read_channel: ProcessChannel,
    open_mode: OpenMode,

    stdin: Channel,
    stdout: Channel,
    stderr: Channel,

    startup_pipe: Option<OwnedFd>,
    startup_notifier: Option<Notifier>,
    death_pipe: Option<OwnedFd>,
    death_notifier: Option<Notifier>,
    /// Registration with the [`ProcessManager`]
    serial: Option<u64>,

    state: ProcessState,
    pid: Option<Pid>,
    reaped: bool,
    exit_code: i32,
    exit_status: ExitStatus,
    crashed: bool,
    error: ProcessError,
    error_string: String,
    /// Termination is being processed
    dying: bool,

    readiness: Arc<dyn ReadinessSource>,
    child_setup: Option<ChildSetupHook>,
    events: EventBus,
}

impl Process {
    /// Creates an engine that uses the current tokio runtime for readiness
    /// notification when there is one, and blocking waits otherwise
    pub fn new() -> Self {
        Self::with_readiness(notifier::default_source())
    }

    /// Creates an engine with an explicit readiness strategy
    pub fn with_readiness(readiness: Arc<dyn ReadinessSource>) -> Self {
        Self {
            program: String::new(),
            arguments: Vec::new(),
            working_directory: None,
            environment: None,
            channel_mode: ProcessChannelMode::default(),
            input_mode: InputChannelMode::default(),
            read_channel: ProcessChannel::default(),
            open_mode: OpenMode::NOT_OPEN,
            stdin: Channel::new(ChannelRole::Stdin),
            stdout: Channel::new(ChannelRole::Stdout),
            stderr: Channel::new(ChannelRole::Stderr),
            startup_pipe: None,
            startup_notifier: None,
            death_pipe: None,
            death_notifier: None,
            serial: None,
            state: ProcessState::NotRunning,
            pid: None,
            reaped: false,
            exit_code: 0,
            exit_status: ExitStatus::NormalExit,
            crashed: false,
            error: ProcessError::UnknownError,
            error_string: String::new(),
            dying: false,
            readiness,
            child_setup: None,
            events: EventBus::default(),
        }
    }

    /// Starts `program` with `arguments`, opening the facade in `mode`.
    ///
    /// Ignored with a warning if a child is already attached. Failures are
    /// reported through [`Process::error`] and the
    /// [`ProcessEvent::ErrorOccurred`] event.
    pub fn start<I, S>(&mut self, program: impl Into<String>, arguments: I, mode: OpenMode)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.state != ProcessState::NotRunning {
            warn!(program = %self.program, "Process is already running");
            return;
        }
        self.program = program.into();
        self.arguments = arguments.into_iter().map(Into::into).collect();
        self.launch(mode);
    }

    /// Splits `command` into program and arguments and starts it
    pub fn start_command(&mut self, command: &str, mode: OpenMode) {
        if self.state != ProcessState::NotRunning {
            warn!(program = %self.program, "Process is already running");
            return;
        }
        match split_program(command) {
            Some((program, arguments)) => self.start(program, arguments, mode),
            None => {
                self.reset_run_state();
                self.set_error(ProcessError::FailedToStart, "No program defined");
            }
        }
    }

    /// Starts the configured program. Returns whether a child was forked.
    pub fn open(&mut self, mode: OpenMode) -> bool {
        if self.state != ProcessState::NotRunning {
            warn!(program = %self.program, "Process is already running");
            return false;
        }
        self.launch(mode);
        self.state != ProcessState::NotRunning
    }

    fn launch(&mut self, mode: OpenMode) {
        self.reset_run_state();
        if self.program.is_empty() {
            self.set_error(ProcessError::FailedToStart, "No program defined");
            return;
        }

        self.stdin.buffer.clear();
        self.stdout.buffer.clear();
        self.stderr.buffer.clear();

        let mut mode = mode;
        if !self.stdin.is_normal() || self.input_mode == InputChannelMode::ForwardedInputChannel {
            mode.remove(OpenMode::WRITE_ONLY);
        }
        if !self.stdout.is_normal()
            && (!self.stderr.is_normal() || self.channel_mode == ProcessChannelMode::MergedChannels)
        {
            mode.remove(OpenMode::READ_ONLY);
        }
        if mode.is_empty() {
            mode = OpenMode::UNBUFFERED;
        }
        if !mode.is_readable() {
            if self.stdout.is_normal() && !self.channel_mode.forwards_output() {
                self.stdout.set_redirect(PathBuf::from(sys::NULL_DEVICE), false);
            }
            if self.stderr.is_normal()
                && !self.channel_mode.forwards_error()
                && self.channel_mode != ProcessChannelMode::MergedChannels
            {
                self.stderr.set_redirect(PathBuf::from(sys::NULL_DEVICE), false);
            }
        }
        self.open_mode = mode;

        self.stdin.closed = false;
        self.stdout.closed = false;
        self.stderr.closed = false;

        info!(program = %self.program, args = ?self.arguments, "Starting process");
        self.start_process();
    }

    fn reset_run_state(&mut self) {
        self.exit_code = 0;
        self.exit_status = ExitStatus::NormalExit;
        self.crashed = false;
        self.dying = false;
        self.error = ProcessError::UnknownError;
        self.error_string.clear();
    }

    fn start_process(&mut self) {
        let manager = match ProcessManager::instance() {
            Ok(manager) => manager,
            Err(e) => {
                self.fail_to_start(format!("Death notification unavailable: {e}"));
                return;
            }
        };

        let plan = match ExecPlan::new(
            &self.program,
            &self.arguments,
            self.environment.as_ref(),
            self.working_directory.as_deref(),
        ) {
            Ok(plan) => plan,
            Err(e) => {
                self.fail_to_start(e.to_string());
                return;
            }
        };

        if let Err(e) = self.open_channels() {
            self.fail_to_start(e.to_string());
            return;
        }

        let (startup_read, startup_write) = match sys::pipe() {
            Ok(pair) => pair,
            Err(e) => {
                self.fail_to_start(e.to_string());
                return;
            }
        };
        let (death_read, death_write) = match self.death_pipe_pair() {
            Ok(pair) => pair,
            Err(e) => {
                self.fail_to_start(e.to_string());
                return;
            }
        };
        self.startup_notifier = self
            .readiness
            .register(startup_read.as_raw_fd(), Direction::Read);
        self.death_notifier = self
            .readiness
            .register(death_read.as_raw_fd(), Direction::Read);
        let startup_read_fd = startup_read.as_raw_fd();
        self.startup_pipe = Some(startup_read);
        self.death_pipe = Some(death_read);

        self.set_state(ProcessState::Starting);

        let stdio = ChildStdio {
            stdin: match self.input_mode {
                InputChannelMode::ManagedInputChannel => self.stdin.child_fd(),
                InputChannelMode::ForwardedInputChannel => None,
            },
            stdout: if self.channel_mode.forwards_output() {
                None
            } else {
                self.stdout.child_fd()
            },
            stderr: if self.channel_mode.forwards_error() {
                None
            } else {
                self.stderr.child_fd()
            },
            merge_stderr: self.channel_mode == ProcessChannelMode::MergedChannels,
        };

        let forked = {
            let mut registry = manager.lock();
            let forked = spawn::fork_exec(
                &plan,
                stdio,
                startup_read_fd,
                startup_write.as_raw_fd(),
                self.child_setup.as_mut(),
            );
            if forked.is_ok() {
                self.serial = Some(registry.add(death_write));
            }
            forked
        };
        drop(plan);
        drop(startup_write);

        let pid = match forked {
            Ok(pid) => pid,
            Err(e) => {
                self.set_state(ProcessState::NotRunning);
                self.fail_to_start(format!("Resource error (fork failure): {e}"));
                return;
            }
        };
        self.pid = Some(pid);
        debug!(pid = %pid, program = %self.program, "Forked child");

        for channel in [&mut self.stdin, &mut self.stdout, &mut self.stderr] {
            if let Err(e) = channel.finish_fork() {
                debug!(role = ?channel.role, error = %e, "Could not make channel non-blocking");
            }
        }
    }

    fn open_channels(&mut self) -> io::Result<()> {
        let readiness = Arc::clone(&self.readiness);
        let forwarded_input = self.input_mode == InputChannelMode::ForwardedInputChannel;
        let merged = self.channel_mode == ProcessChannelMode::MergedChannels;

        self.stdin.open(readiness.as_ref(), forwarded_input)?;
        self.stdout
            .open(readiness.as_ref(), self.channel_mode.forwards_output())?;
        self.stderr
            .open(readiness.as_ref(), merged || self.channel_mode.forwards_error())?;
        Ok(())
    }

    fn death_pipe_pair(&self) -> io::Result<(OwnedFd, OwnedFd)> {
        let (read, write) = sys::pipe()?;
        sys::set_nonblocking(read.as_raw_fd())?;
        sys::set_nonblocking(write.as_raw_fd())?;
        Ok((read, write))
    }

    fn fail_to_start(&mut self, message: String) {
        self.set_error(ProcessError::FailedToStart, message);
        self.cleanup();
    }

    /// Asks the child to terminate with `SIGTERM`. Does not block.
    pub fn terminate(&self) {
        self.send_signal(Signal::SIGTERM);
    }

    /// Kills the child with `SIGKILL`. Does not block.
    pub fn kill(&self) {
        self.send_signal(Signal::SIGKILL);
    }

    fn send_signal(&self, signal: Signal) {
        let Some(pid) = self.pid.filter(|_| !self.reaped) else {
            return;
        };
        match kill(pid, signal) {
            Ok(()) => debug!(pid = %pid, signal = %signal, "Sent signal"),
            Err(e) => warn!(pid = %pid, signal = %signal, error = %e, "Failed to signal process"),
        }
    }

    /// Flushes pending input, kills the child, waits for it and closes the
    /// facade
    pub fn close(&mut self) {
        self.events.emit(ProcessEvent::AboutToClose);
        while self.wait_for_bytes_written(None) {}
        self.kill();
        self.wait_for_finished(None);
        self.stdout.buffer.clear();
        self.stderr.buffer.clear();
        self.open_mode = OpenMode::NOT_OPEN;
    }

    /// Resolves the exec outcome reported through the startup pipe
    fn on_startup_notification(&mut self) -> bool {
        if self.state != ProcessState::Starting {
            return self.state == ProcessState::Running;
        }
        match self.process_started() {
            Ok(()) => {
                self.set_state(ProcessState::Running);
                info!(pid = self.pid(), program = %self.program, "Process started");
                self.events.emit(ProcessEvent::Started);
                true
            }
            Err(message) => {
                self.set_state(ProcessState::NotRunning);
                self.set_error(ProcessError::FailedToStart, message);
                self.reap(true);
                // a failed start never reports the child's own exit code
                self.exit_code = 0;
                self.crashed = false;
                self.cleanup();
                false
            }
        }
    }

    /// Reads the startup pipe once. An empty read means the child exec'd.
    fn process_started(&mut self) -> std::result::Result<(), String> {
        self.startup_notifier = None;
        let Some(pipe) = self.startup_pipe.take() else {
            return Ok(());
        };
        let mut message = [0u8; 5];
        match sys::read(pipe.as_raw_fd(), &mut message) {
            Ok(n) if n > 0 => Err(spawn::describe_startup_failure(&message[..n])),
            _ => Ok(()),
        }
    }

    fn on_can_read(&mut self, role: ChannelRole) -> bool {
        if self.read_chunk(role) != ReadOutcome::Delivered {
            return false;
        }
        let selected = self.is_selected(role);
        if selected {
            self.events.emit(ProcessEvent::ReadyRead);
        }
        self.events.emit(match role {
            ChannelRole::Stderr => ProcessEvent::ReadyReadStandardError,
            _ => ProcessEvent::ReadyReadStandardOutput,
        });
        selected
    }

    fn read_chunk(&mut self, role: ChannelRole) -> ReadOutcome {
        let channel = self.channel_mut(role);
        let Some(fd) = channel.parent_fd() else {
            return ReadOutcome::Nothing;
        };
        // FIONREAD may under-report
        let wanted = sys::bytes_available(fd).max(1);
        let result = sys::read(fd, channel.buffer.reserve(wanted));

        let failure = match result {
            Ok(0) => {
                channel.buffer.chop(wanted);
                debug!(role = ?role, "Channel reached end of stream");
                channel.close();
                return ReadOutcome::Nothing;
            }
            Ok(n) => {
                channel.buffer.chop(wanted - n);
                if channel.closed {
                    channel.buffer.clear();
                    return ReadOutcome::Discarded;
                }
                return ReadOutcome::Delivered;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                channel.buffer.chop(wanted);
                return ReadOutcome::Nothing;
            }
            Err(e) => {
                channel.buffer.chop(wanted);
                channel.close();
                e
            }
        };
        self.set_error(
            ProcessError::ReadError,
            format!("Error reading from process: {failure}"),
        );
        ReadOutcome::Nothing
    }

    /// Writes the next contiguous block of queued input
    fn on_can_write(&mut self) -> bool {
        self.stdin.set_notifier_enabled(false);
        if self.stdin.buffer.is_empty() {
            return false;
        }
        let Some(fd) = self.stdin.parent_fd() else {
            return false;
        };

        let written = match sys::write(fd, self.stdin.buffer.read_pointer()) {
            Ok(n) => {
                self.stdin.buffer.free(n);
                if n > 0 {
                    self.events.emit(ProcessEvent::BytesWritten { bytes: n });
                }
                true
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
            Err(e) => {
                self.stdin.close();
                self.set_error(
                    ProcessError::WriteError,
                    format!("Error writing to process: {e}"),
                );
                false
            }
        };

        if self.stdin.buffer.is_empty() && self.stdin.closed {
            self.stdin.close();
        } else {
            let pending = !self.stdin.buffer.is_empty();
            self.stdin.set_notifier_enabled(pending);
        }
        written
    }

    /// Handles a death notification. Returns `true` if this engine's child
    /// was reaped and its termination processed.
    fn on_process_died(&mut self) -> bool {
        if !self.wait_for_dead_child() {
            return false;
        }
        // the child may die before its startup report was read
        if self.state == ProcessState::Starting && !self.on_startup_notification() {
            return true;
        }
        if self.dying {
            return true;
        }
        self.dying = true;

        self.on_can_read(ChannelRole::Stdout);
        self.on_can_read(ChannelRole::Stderr);

        if self.crashed {
            self.exit_status = ExitStatus::CrashExit;
            self.set_error(ProcessError::Crashed, ProcessError::Crashed.to_string());
        }

        let was_running = self.state == ProcessState::Running;
        let pid = self.pid();
        self.cleanup();
        if was_running {
            info!(
                pid,
                exit_code = self.exit_code,
                exit_status = ?self.exit_status,
                "Process finished"
            );
            self.events.emit(ProcessEvent::ReadChannelFinished);
            self.events.emit(ProcessEvent::Finished {
                exit_code: self.exit_code,
                exit_status: self.exit_status,
            });
        }
        self.dying = false;
        true
    }

    /// Consumes pending death notifications and reaps the child if it has
    /// terminated
    fn wait_for_dead_child(&mut self) -> bool {
        if let Some(pipe) = &self.death_pipe {
            let mut buf = [0u8; 64];
            while matches!(sys::read(pipe.as_raw_fd(), &mut buf), Ok(n) if n > 0) {}
        }
        if self.reaped {
            return true;
        }
        match self.reap(false) {
            Some((code, crashed)) => {
                self.exit_code = code;
                self.crashed = crashed;
                true
            }
            None => false,
        }
    }

    /// Collects the child's exit status as `(code, crashed)`. A crash
    /// reports the signal number as its code.
    fn reap(&mut self, block: bool) -> Option<(i32, bool)> {
        let pid = self.pid.filter(|_| !self.reaped)?;
        let flags = (!block).then_some(WaitPidFlag::WNOHANG);
        let status = loop {
            match waitpid(pid, flags) {
                Err(Errno::EINTR) => continue,
                other => break other,
            }
        };
        let outcome = match status {
            Ok(WaitStatus::Exited(_, code)) => (code, false),
            Ok(WaitStatus::Signaled(_, signal, _)) => (signal as i32, true),
            Ok(_) => return None,
            Err(Errno::ECHILD) => {
                warn!(pid = %pid, "Child was reaped elsewhere");
                (-1, true)
            }
            Err(e) => {
                debug!(pid = %pid, error = %e, "waitpid failed");
                return None;
            }
        };
        self.reaped = true;
        self.unregister();
        debug!(pid = %pid, code = outcome.0, crashed = outcome.1, "Reaped child");
        Some(outcome)
    }

    fn unregister(&mut self) {
        if let Some(serial) = self.serial.take() {
            if let Ok(manager) = ProcessManager::instance() {
                manager.remove(serial);
            }
        }
    }

    /// Releases every resource of the current run. Safe to repeat.
    fn cleanup(&mut self) {
        self.set_state(ProcessState::NotRunning);
        self.unregister();
        if let Some(pid) = self.pid.take() {
            if !self.reaped {
                debug!(pid = %pid, "Releasing unreaped child");
            }
        }
        self.reaped = false;
        self.dying = false;

        self.startup_notifier = None;
        self.death_notifier = None;
        self.stdout.close();
        self.stderr.close();
        self.stdin.close();
        self.startup_pipe = None;
        self.death_pipe = None;
    }

    fn set_state(&mut self, state: ProcessState) {
        if self.state == state {
            return;
        }
        self.state = state;
        self.events.emit(ProcessEvent::StateChanged { state });
    }

    /// Records `error` unless a sticky error is already present.
    /// `Timedout` is recorded silently.
    fn set_error(&mut self, error: ProcessError, message: impl Into<String>) {
        let message = message.into();
        if error == ProcessError::Timedout {
            if !self.error.is_sticky() {
                self.error = error;
                self.error_string = message;
            }
            return;
        }
        debug!(error = ?error, message = %message, program = %self.program, "Process error");
        if !self.error.is_sticky() {
            self.error = error;
            self.error_string = message;
        }
        self.events.emit(ProcessEvent::ErrorOccurred { error });
    }

    fn set_timed_out(&mut self) {
        self.set_error(ProcessError::Timedout, ProcessError::Timedout.to_string());
    }

    /// Blocks until the child has exec'd. `None` waits forever.
    pub fn wait_for_started(&mut self, timeout: Option<Duration>) -> bool {
        self.ensure_started(&Deadline::new(timeout))
    }

    /// Waits for a pending start out of `deadline`'s budget
    fn ensure_started(&mut self, deadline: &Deadline) -> bool {
        let state = self.state;
        match state {
            ProcessState::NotRunning => false,
            ProcessState::Starting => self.wait_started(deadline),
            ProcessState::Running => true,
        }
    }

    fn wait_started(&mut self, deadline: &Deadline) -> bool {
        let Some(fd) = self.startup_pipe.as_ref().map(AsRawFd::as_raw_fd) else {
            return self.state == ProcessState::Running;
        };
        let fds = WaitFds {
            startup: Some(fd),
            ..WaitFds::default()
        };
        match wait_fds(&fds, deadline) {
            WaitOutcome::Ready(_) => self.on_startup_notification(),
            WaitOutcome::TimedOut => {
                self.set_timed_out();
                false
            }
            WaitOutcome::Failed(e) => {
                debug!(error = %e, "Waiting for startup failed");
                false
            }
        }
    }

    /// Blocks until new data is available on the current read channel
    pub fn wait_for_ready_read(&mut self, timeout: Option<Duration>) -> bool {
        if self.state == ProcessState::NotRunning || self.current_channel().closed {
            return false;
        }
        let deadline = Deadline::new(timeout);
        loop {
            let Some(ready) = self.poll_once(&deadline) else {
                return false;
            };
            if ready.startup && !self.on_startup_notification() {
                return false;
            }
            let mut delivered = false;
            if ready.stdout && self.on_can_read(ChannelRole::Stdout) {
                delivered = true;
            }
            if ready.stderr && self.on_can_read(ChannelRole::Stderr) {
                delivered = true;
            }
            if delivered {
                return true;
            }
            if ready.stdin {
                self.on_can_write();
            }
            if self.state == ProcessState::NotRunning {
                return false;
            }
            if ready.death && self.on_process_died() {
                return false;
            }
        }
    }

    /// Blocks until one write of queued input completed
    pub fn wait_for_bytes_written(&mut self, timeout: Option<Duration>) -> bool {
        let deadline = Deadline::new(timeout);
        if !self.ensure_started(&deadline) {
            return false;
        }
        while !self.stdin.buffer.is_empty() {
            let Some(ready) = self.poll_once(&deadline) else {
                return false;
            };
            if ready.startup && !self.on_startup_notification() {
                return false;
            }
            if ready.stdin {
                return self.on_can_write();
            }
            if ready.stdout {
                self.on_can_read(ChannelRole::Stdout);
            }
            if ready.stderr {
                self.on_can_read(ChannelRole::Stderr);
            }
            if self.state == ProcessState::NotRunning {
                return false;
            }
            if ready.death && self.on_process_died() {
                return false;
            }
        }
        false
    }

    /// Blocks until the child has terminated and its death was processed
    pub fn wait_for_finished(&mut self, timeout: Option<Duration>) -> bool {
        let deadline = Deadline::new(timeout);
        if !self.ensure_started(&deadline) {
            return false;
        }
        loop {
            let Some(ready) = self.poll_once(&deadline) else {
                return false;
            };
            if ready.startup && !self.on_startup_notification() {
                return false;
            }
            if ready.stdin {
                self.on_can_write();
            }
            if ready.stdout {
                self.on_can_read(ChannelRole::Stdout);
            }
            if ready.stderr {
                self.on_can_read(ChannelRole::Stderr);
            }
            if self.state == ProcessState::NotRunning {
                return true;
            }
            if ready.death && self.on_process_died() {
                return true;
            }
        }
    }

    /// One multiplexing round over the descriptors of the current run.
    /// `None` means the wait is over: timed out or failed.
    fn poll_once(&mut self, deadline: &Deadline) -> Option<Ready> {
        let raw = |fd: &Option<OwnedFd>| fd.as_ref().map(AsRawFd::as_raw_fd);
        let fds = WaitFds {
            startup: if self.state == ProcessState::Starting {
                raw(&self.startup_pipe)
            } else {
                None
            },
            stdout: self.stdout.parent_fd(),
            stderr: self.stderr.parent_fd(),
            stdin: if self.stdin.buffer.is_empty() {
                None
            } else {
                self.stdin.parent_fd()
            },
            death: raw(&self.death_pipe),
        };
        match wait_fds(&fds, deadline) {
            WaitOutcome::Ready(ready) => Some(ready),
            WaitOutcome::TimedOut => {
                self.set_timed_out();
                None
            }
            WaitOutcome::Failed(e) => {
                debug!(error = %e, "Multiplexing failed");
                None
            }
        }
    }

    /// Waits for one armed notification and runs its handler.
    ///
    /// Returns `false` without waiting when no notifier is armed, which is
    /// the case for engines without an event loop and for engines that are
    /// not running.
    pub async fn dispatch_events(&mut self) -> bool {
        let slots = [
            &self.startup_notifier,
            &self.stdout.notifier,
            &self.stderr.notifier,
            &self.stdin.notifier,
            &self.death_notifier,
        ];
        if slots.iter().all(|slot| slot.is_none()) {
            return false;
        }
        let fired = poll_fn(|cx| {
            let order = [
                Source::Startup,
                Source::Stdout,
                Source::Stderr,
                Source::Stdin,
                Source::Death,
            ];
            for (slot, source) in slots.iter().zip(order) {
                if poll_slot(slot, cx).is_ready() {
                    return Poll::Ready(source);
                }
            }
            Poll::Pending
        })
        .await;

        match fired {
            Source::Startup => {
                self.on_startup_notification();
            }
            Source::Stdout => {
                self.on_can_read(ChannelRole::Stdout);
            }
            Source::Stderr => {
                self.on_can_read(ChannelRole::Stderr);
            }
            Source::Stdin => {
                self.on_can_write();
            }
            Source::Death => {
                self.on_process_died();
            }
        }
        true
    }

    /// Dispatches notifications until the engine is back to
    /// [`ProcessState::NotRunning`]. Returns `false` if no event loop
    /// drives this engine.
    pub async fn until_finished(&mut self) -> bool {
        while self.state != ProcessState::NotRunning {
            if !self.dispatch_events().await {
                return false;
            }
        }
        true
    }

    fn channel_mut(&mut self, role: ChannelRole) -> &mut Channel {
        match role {
            ChannelRole::Stdin => &mut self.stdin,
            ChannelRole::Stdout => &mut self.stdout,
            ChannelRole::Stderr => &mut self.stderr,
        }
    }

    fn channel(&self, role: ChannelRole) -> &Channel {
        match role {
            ChannelRole::Stdin => &self.stdin,
            ChannelRole::Stdout => &self.stdout,
            ChannelRole::Stderr => &self.stderr,
        }
    }

    fn current_channel(&self) -> &Channel {
        match self.read_channel {
            ProcessChannel::StandardOutput => &self.stdout,
            ProcessChannel::StandardError => &self.stderr,
        }
    }

    fn current_buffer(&mut self) -> &mut RingBuffer {
        match self.read_channel {
            ProcessChannel::StandardOutput => &mut self.stdout.buffer,
            ProcessChannel::StandardError => &mut self.stderr.buffer,
        }
    }

    fn is_selected(&self, role: ChannelRole) -> bool {
        matches!(
            (self.read_channel, role),
            (ProcessChannel::StandardOutput, ChannelRole::Stdout)
                | (ProcessChannel::StandardError, ChannelRole::Stderr)
        )
    }

    /// Drains the current read channel
    pub fn read_all(&mut self) -> Vec<u8> {
        self.current_buffer().read_all()
    }

    /// Drains the stdout channel regardless of the current read channel
    pub fn read_all_standard_output(&mut self) -> Vec<u8> {
        self.read_all_from(ProcessChannel::StandardOutput)
    }

    /// Drains the stderr channel regardless of the current read channel
    pub fn read_all_standard_error(&mut self) -> Vec<u8> {
        self.read_all_from(ProcessChannel::StandardError)
    }

    fn read_all_from(&mut self, channel: ProcessChannel) -> Vec<u8> {
        let previous = std::mem::replace(&mut self.read_channel, channel);
        let data = self.read_all();
        self.read_channel = previous;
        data
    }

    /// Reads one line including its `\n`, or everything buffered if no
    /// complete line is available
    pub fn read_line(&mut self) -> Vec<u8> {
        self.current_buffer().read_line()
    }

    pub fn can_read_line(&self) -> bool {
        self.current_channel().buffer.can_read_line()
    }

    pub fn get_char(&mut self) -> Option<u8> {
        self.current_buffer().get_char()
    }

    /// Bytes buffered on the current read channel
    pub fn bytes_available(&self) -> usize {
        self.current_channel().buffer.len()
    }

    /// Bytes queued for the child's stdin
    pub fn bytes_to_write(&self) -> usize {
        self.stdin.buffer.len()
    }

    /// No buffered data left and no child attached
    pub fn at_end(&self) -> bool {
        self.current_channel().buffer.is_empty() && self.state == ProcessState::NotRunning
    }

    pub fn is_open(&self) -> bool {
        !self.open_mode.is_empty()
    }

    pub fn open_mode(&self) -> OpenMode {
        self.open_mode
    }

    pub fn read_channel(&self) -> ProcessChannel {
        self.read_channel
    }

    pub fn set_read_channel(&mut self, channel: ProcessChannel) {
        self.read_channel = channel;
    }

    /// Discards everything that arrives on `channel` from now on
    pub fn close_read_channel(&mut self, channel: ProcessChannel) {
        match channel {
            ProcessChannel::StandardOutput => self.stdout.closed = true,
            ProcessChannel::StandardError => self.stderr.closed = true,
        }
    }

    /// Closes the child's stdin once queued input has been written
    pub fn close_write_channel(&mut self) {
        self.stdin.closed = true;
        if self.stdin.buffer.is_empty() {
            self.stdin.close();
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn set_program(&mut self, program: impl Into<String>) {
        self.program = program.into();
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    pub fn set_arguments<I, S>(&mut self, arguments: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = arguments.into_iter().map(Into::into).collect();
    }

    pub fn working_directory(&self) -> Option<&Path> {
        self.working_directory.as_deref()
    }

    /// Directory the child changes into before exec. An empty path keeps
    /// the parent's directory.
    pub fn set_working_directory(&mut self, dir: impl Into<PathBuf>) {
        let dir = dir.into();
        self.working_directory = (!dir.as_os_str().is_empty()).then_some(dir);
    }

    /// Replaces the child's environment with `NAME=VALUE` entries
    pub fn set_environment<I, S>(&mut self, entries: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.environment = Some(ProcessEnvironment::from_list(entries));
    }

    /// Explicit environment as `NAME=VALUE` entries; empty when the child
    /// inherits the parent's environment
    pub fn environment(&self) -> Vec<String> {
        self.environment
            .as_ref()
            .map(ProcessEnvironment::to_string_list)
            .unwrap_or_default()
    }

    pub fn set_process_environment(&mut self, environment: ProcessEnvironment) {
        self.environment = Some(environment);
    }

    pub fn process_environment(&self) -> ProcessEnvironment {
        self.environment.clone().unwrap_or_default()
    }

    pub fn process_channel_mode(&self) -> ProcessChannelMode {
        self.channel_mode
    }

    pub fn set_process_channel_mode(&mut self, mode: ProcessChannelMode) {
        self.channel_mode = mode;
    }

    pub fn input_channel_mode(&self) -> InputChannelMode {
        self.input_mode
    }

    pub fn set_input_channel_mode(&mut self, mode: InputChannelMode) {
        self.input_mode = mode;
    }

    /// Feeds the child's stdin from `path`. An empty path restores the pipe.
    pub fn set_standard_input_file(&mut self, path: impl Into<PathBuf>) {
        self.redirect(ChannelRole::Stdin, path.into(), false);
    }

    /// Sends the child's stdout to `path`. An empty path restores the pipe.
    pub fn set_standard_output_file(&mut self, path: impl Into<PathBuf>, mode: WriteMode) {
        self.redirect(ChannelRole::Stdout, path.into(), mode == WriteMode::Append);
    }

    /// Sends the child's stderr to `path`. An empty path restores the pipe.
    pub fn set_standard_error_file(&mut self, path: impl Into<PathBuf>, mode: WriteMode) {
        self.redirect(ChannelRole::Stderr, path.into(), mode == WriteMode::Append);
    }

    fn redirect(&mut self, role: ChannelRole, path: PathBuf, append: bool) {
        let channel = self.channel_mut(role);
        if path.as_os_str().is_empty() {
            channel.clear();
        } else {
            channel.set_redirect(path, append);
        }
    }

    /// Pipes this engine's stdout into `destination`'s stdin
    pub fn set_standard_output_process(&mut self, destination: &mut Process) {
        Channel::link(&mut self.stdout, &mut destination.stdin);
    }

    /// Restores a channel to a plain pipe, unlinking a chained engine
    pub fn reset_channel(&mut self, role: ChannelRole) {
        self.channel_mut(role).clear();
    }

    pub fn channel_kind(&self, role: ChannelRole) -> ChannelKind {
        self.channel(role).kind()
    }

    /// Registers a closure run in the child after redirection and the
    /// working directory change, right before exec. An error aborts the
    /// start with [`ProcessError::FailedToStart`].
    ///
    /// # Safety
    ///
    /// The closure runs in a freshly forked child of a possibly
    /// multithreaded parent. It must only make async-signal-safe calls and
    /// must not allocate, lock or unwind.
    pub unsafe fn set_child_setup<F>(&mut self, hook: F)
    where
        F: FnMut() -> io::Result<()> + Send + 'static,
    {
        self.child_setup = Some(Box::new(hook));
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Pid of the attached child, 0 when none
    pub fn pid(&self) -> u32 {
        self.pid
            .map(|pid| u32::try_from(pid.as_raw()).unwrap_or(0))
            .unwrap_or(0)
    }

    /// Exit code of the last child, or the signal number if it crashed
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn exit_status(&self) -> ExitStatus {
        self.exit_status
    }

    pub fn error(&self) -> ProcessError {
        self.error
    }

    /// Human readable text of [`Process::error`]
    pub fn error_string(&self) -> String {
        if self.error_string.is_empty() {
            self.error.to_string()
        } else {
            self.error_string.clone()
        }
    }

    /// Registers a callback invoked synchronously for every event
    pub fn on_event(&mut self, callback: impl FnMut(&ProcessEvent) + Send + 'static) {
        self.events.on_event(callback);
    }

    /// Returns a receiver that gets every event from now on
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ProcessEvent> {
        self.events.subscribe()
    }

    /// Runs `program` to completion with all three streams forwarded.
    ///
    /// Returns the exit code, `-1` if the child crashed and `-2` if it
    /// could not be started.
    pub fn execute<I, S>(program: impl Into<String>, arguments: I) -> i32
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut process = Process::with_readiness(Arc::new(NoEventLoop));
        process.set_process_channel_mode(ProcessChannelMode::ForwardedChannels);
        process.set_input_channel_mode(InputChannelMode::ForwardedInputChannel);
        process.start(program, arguments, OpenMode::READ_WRITE);
        if !process.wait_for_finished(None) || process.error() == ProcessError::FailedToStart {
            return -2;
        }
        match process.exit_status() {
            ExitStatus::NormalExit => process.exit_code(),
            ExitStatus::CrashExit => -1,
        }
    }

    /// [`Process::execute`] for a combined command line
    pub fn execute_command(command: &str) -> i32 {
        match split_program(command) {
            Some((program, arguments)) => Self::execute(program, arguments),
            None => -2,
        }
    }

    /// See [`crate::start_detached`]
    pub fn start_detached(
        program: &str,
        arguments: &[String],
        working_directory: Option<&Path>,
    ) -> Result<u32> {
        detached::start_detached(program, arguments, working_directory)
    }

    /// Path of the platform's null device
    pub fn null_device() -> &'static str {
        sys::NULL_DEVICE
    }

    /// Flat `NAME=VALUE` snapshot of the calling process's environment
    pub fn system_environment() -> Vec<String> {
        environment::system_environment()
    }
}

impl Default for Process {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("program", &self.program)
            .field("arguments", &self.arguments)
            .field("state", &self.state)
            .field("pid", &self.pid)
            .field("error", &self.error)
            .field("channel_mode", &self.channel_mode)
            .field("open_mode", &self.open_mode)
            .field("readiness", &self.readiness)
            .finish_non_exhaustive()
    }
}

impl io::Read for Process {
    /// Reads buffered data of the current read channel. Returns
    /// [`io::ErrorKind::WouldBlock`] while more data may still arrive and
    /// `Ok(0)` once the channel has reached end of stream.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.open_mode.is_readable() {
            return Err(Error::NotOpen("reading").into());
        }
        let n = self.current_buffer().read(buf);
        if n > 0 || buf.is_empty() {
            return Ok(n);
        }
        if self.current_channel().parent_fd().is_some() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        Ok(0)
    }
}

impl io::Write for Process {
    /// Queues `buf` for the child's stdin. Nothing is written until a
    /// notification or a blocking wait services the channel.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.open_mode.is_writable() {
            return Err(Error::NotOpen("writing").into());
        }
        if self.stdin.closed {
            return Ok(0);
        }
        self.stdin.buffer.append(buf);
        self.stdin.set_notifier_enabled(true);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if self.state != ProcessState::NotRunning {
            warn!(
                pid = self.pid(),
                program = %self.program,
                "Dropping a running process, killing it"
            );
            self.kill();
            self.wait_for_finished(None);
        }
        self.cleanup();
        self.stdin.clear();
        self.stdout.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::sync::Mutex;

    const WAIT: Option<Duration> = Some(Duration::from_secs(10));

    fn blocking() -> Process {
        Process::with_readiness(Arc::new(NoEventLoop))
    }

    #[test]
    fn test_new_process_is_idle() {
        let process = blocking();
        assert_eq!(process.state(), ProcessState::NotRunning);
        assert_eq!(process.pid(), 0);
        assert_eq!(process.error(), ProcessError::UnknownError);
        assert!(!process.is_open());
        assert!(process.at_end());
    }

    #[test]
    fn test_empty_program_fails_to_start() {
        let mut process = blocking();
        let mut events = process.subscribe();
        process.start("", Vec::<String>::new(), OpenMode::READ_WRITE);

        assert_eq!(process.state(), ProcessState::NotRunning);
        assert_eq!(process.error(), ProcessError::FailedToStart);
        assert_eq!(process.error_string(), "No program defined");
        assert_eq!(
            events.try_recv().unwrap(),
            ProcessEvent::ErrorOccurred {
                error: ProcessError::FailedToStart
            }
        );
    }

    #[test]
    fn test_echo_output_is_captured() {
        let mut process = blocking();
        process.start("/bin/echo", ["hello"], OpenMode::READ_WRITE);
        assert!(process.wait_for_finished(WAIT));
        assert_eq!(process.exit_status(), ExitStatus::NormalExit);
        assert_eq!(process.exit_code(), 0);
        assert_eq!(process.read_all_standard_output(), b"hello\n");
        assert_eq!(process.state(), ProcessState::NotRunning);
    }

    #[test]
    fn test_events_follow_lifecycle() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut process = blocking();
        process.on_event(move |event| sink.lock().unwrap().push(*event));

        process.start("/bin/sh", ["-c", "exit 3"], OpenMode::READ_WRITE);
        assert!(process.wait_for_finished(WAIT));

        let seen = seen.lock().unwrap();
        assert_eq!(
            seen.first(),
            Some(&ProcessEvent::StateChanged {
                state: ProcessState::Starting
            })
        );
        assert!(seen.contains(&ProcessEvent::Started));
        let finished = seen
            .iter()
            .filter(|e| matches!(e, ProcessEvent::Finished { .. }))
            .count();
        assert_eq!(finished, 1);
        assert_eq!(
            seen.last(),
            Some(&ProcessEvent::Finished {
                exit_code: 3,
                exit_status: ExitStatus::NormalExit
            })
        );
    }

    #[test]
    fn test_failed_start_never_finishes() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut process = blocking();
        process.on_event(move |event| sink.lock().unwrap().push(*event));

        process.start("/definitely/not/here", Vec::<String>::new(), OpenMode::READ_WRITE);
        assert!(!process.wait_for_started(WAIT));
        assert_eq!(process.error(), ProcessError::FailedToStart);
        assert_eq!(process.exit_code(), 0);
        assert!(process.error_string().starts_with("Failed to execute program"));
        assert!(!seen
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, ProcessEvent::Finished { .. } | ProcessEvent::Started)));
    }

    #[test]
    fn test_missing_working_directory_fails_to_start() {
        let mut process = blocking();
        process.set_working_directory("/definitely/not/a/dir");
        process.start("/bin/true", Vec::<String>::new(), OpenMode::READ_WRITE);
        assert!(!process.wait_for_started(WAIT));
        assert_eq!(process.error(), ProcessError::FailedToStart);
        assert!(process.error_string().contains("working directory"));
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let mut process = blocking();
        process.start("/bin/true", Vec::<String>::new(), OpenMode::READ_WRITE);
        assert!(process.wait_for_finished(WAIT));
        process.cleanup();
        process.cleanup();
        assert_eq!(process.state(), ProcessState::NotRunning);
        assert!(process.stdout.parent_fd().is_none());
    }

    #[test]
    fn test_start_while_running_is_ignored() {
        let mut process = blocking();
        process.start("/bin/sh", ["-c", "sleep 5"], OpenMode::READ_WRITE);
        let pid = process.pid();
        process.start("/bin/echo", ["again"], OpenMode::READ_WRITE);
        assert_eq!(process.pid(), pid);
        assert_eq!(process.program(), "/bin/sh");
        process.kill();
        assert!(process.wait_for_finished(WAIT));
        assert_eq!(process.exit_status(), ExitStatus::CrashExit);
    }

    #[test]
    fn test_write_then_read_back_through_cat() {
        let mut process = blocking();
        process.start("/bin/cat", Vec::<String>::new(), OpenMode::READ_WRITE);
        assert!(process.wait_for_started(WAIT));

        process.write_all(b"round trip\n").unwrap();
        assert_eq!(process.bytes_to_write(), 11);
        assert!(process.wait_for_bytes_written(WAIT));
        assert_eq!(process.bytes_to_write(), 0);

        assert!(process.wait_for_ready_read(WAIT));
        while !process.can_read_line() {
            assert!(process.wait_for_ready_read(WAIT));
        }
        assert_eq!(process.read_line(), b"round trip\n");

        process.close_write_channel();
        assert!(process.wait_for_finished(WAIT));
        assert_eq!(process.exit_code(), 0);
    }

    #[test]
    fn test_read_reports_would_block_then_eof() {
        let mut process = blocking();
        process.start("/bin/sh", ["-c", "sleep 0.2; echo done"], OpenMode::READ_ONLY);
        assert!(process.wait_for_started(WAIT));

        let mut buf = [0u8; 16];
        let err = process.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        assert!(process.wait_for_finished(WAIT));
        let n = process.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"done\n");
        assert_eq!(process.read(&mut buf).unwrap(), 0);
        assert!(process.at_end());
    }

    #[test]
    fn test_write_requires_write_mode() {
        let mut process = blocking();
        process.start("/bin/true", Vec::<String>::new(), OpenMode::READ_ONLY);
        let err = process.write(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        assert!(process.wait_for_finished(WAIT));
    }

    #[test]
    fn test_merged_channels_share_stdout() {
        let mut process = blocking();
        process.set_process_channel_mode(ProcessChannelMode::MergedChannels);
        process.start("/bin/sh", ["-c", "echo out; echo err 1>&2"], OpenMode::READ_WRITE);
        assert!(process.wait_for_finished(WAIT));
        let out = String::from_utf8(process.read_all_standard_output()).unwrap();
        assert!(out.contains("out") && out.contains("err"));
        assert!(process.read_all_standard_error().is_empty());
    }

    #[test]
    fn test_separate_channels_and_read_channel_switch() {
        let mut process = blocking();
        process.start("/bin/sh", ["-c", "echo out; echo err 1>&2"], OpenMode::READ_WRITE);
        assert!(process.wait_for_finished(WAIT));

        process.set_read_channel(ProcessChannel::StandardError);
        assert_eq!(process.bytes_available(), 4);
        assert_eq!(process.read_all(), b"err\n");
        assert_eq!(process.read_channel(), ProcessChannel::StandardError);
        assert_eq!(process.read_all_standard_output(), b"out\n");
        assert_eq!(process.read_channel(), ProcessChannel::StandardError);
    }

    #[test]
    fn test_closed_read_channel_discards_output() {
        let mut process = blocking();
        process.close_read_channel(ProcessChannel::StandardOutput);
        process.start("/bin/echo", ["dropped"], OpenMode::READ_WRITE);
        // start() reopens every channel
        process.close_read_channel(ProcessChannel::StandardOutput);
        assert!(!process.wait_for_ready_read(WAIT));
        assert!(process.wait_for_finished(WAIT));
        assert!(process.read_all_standard_output().is_empty());
    }

    #[test]
    fn test_ready_read_timeout_is_not_sticky() {
        let mut process = blocking();
        process.start("/bin/sh", ["-c", "sleep 5"], OpenMode::READ_WRITE);
        assert!(!process.wait_for_ready_read(Some(Duration::from_millis(50))));
        assert_eq!(process.error(), ProcessError::Timedout);

        process.kill();
        assert!(process.wait_for_finished(WAIT));
        assert_eq!(process.error(), ProcessError::Crashed);
    }

    #[test]
    fn test_crash_reports_signal_number() {
        let mut process = blocking();
        process.start("/bin/sh", ["-c", "kill -TERM $$"], OpenMode::READ_WRITE);
        assert!(process.wait_for_finished(WAIT));
        assert_eq!(process.exit_status(), ExitStatus::CrashExit);
        assert_eq!(process.exit_code(), libc::SIGTERM);
        assert_eq!(process.error(), ProcessError::Crashed);
    }

    #[test]
    fn test_explicit_environment_replaces_inherited() {
        let mut process = blocking();
        process.set_environment(["FORKPIPE_ONLY=yes"]);
        assert_eq!(process.environment(), vec!["FORKPIPE_ONLY=yes"]);
        process.start("/bin/sh", ["-c", "echo $FORKPIPE_ONLY"], OpenMode::READ_WRITE);
        assert!(process.wait_for_finished(WAIT));
        assert_eq!(process.read_all_standard_output(), b"yes\n");
    }

    #[test]
    fn test_working_directory_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let mut process = blocking();
        process.set_working_directory(dir.path());
        process.start("/bin/sh", ["-c", "pwd"], OpenMode::READ_WRITE);
        assert!(process.wait_for_finished(WAIT));
        let out = String::from_utf8(process.read_all_standard_output()).unwrap();
        assert_eq!(
            Path::new(out.trim()).canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[test]
    fn test_not_readable_mode_discards_output() {
        let mut process = blocking();
        process.start("/bin/echo", ["quiet"], OpenMode::WRITE_ONLY);
        assert_eq!(
            process.channel_kind(ChannelRole::Stdout),
            ChannelKind::Redirect(PathBuf::from(sys::NULL_DEVICE))
        );
        assert!(process.wait_for_finished(WAIT));
        assert!(process.read_all_standard_output().is_empty());
    }

    #[test]
    fn test_redirected_stdin_drops_write_mode() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        std::fs::write(&input, "from file\n").unwrap();

        let mut process = blocking();
        process.set_standard_input_file(&input);
        process.start("/bin/cat", Vec::<String>::new(), OpenMode::READ_WRITE);
        assert_eq!(process.open_mode(), OpenMode::READ_ONLY);
        assert!(process.wait_for_finished(WAIT));
        assert_eq!(process.read_all_standard_output(), b"from file\n");
    }

    #[test]
    fn test_missing_input_file_fails_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut process = blocking();
        process.set_standard_input_file(dir.path().join("absent"));
        process.start("/bin/cat", Vec::<String>::new(), OpenMode::READ_WRITE);
        assert_eq!(process.state(), ProcessState::NotRunning);
        assert_eq!(process.error(), ProcessError::FailedToStart);
        assert!(!process.wait_for_started(WAIT));
    }

    #[test]
    fn test_child_setup_failure_is_reported() {
        let mut process = blocking();
        unsafe {
            process.set_child_setup(|| Err(io::Error::from_raw_os_error(libc::EPERM)));
        }
        process.start("/bin/true", Vec::<String>::new(), OpenMode::READ_WRITE);
        assert!(!process.wait_for_started(WAIT));
        assert!(process.error_string().starts_with("Child setup failed"));
    }

    #[test]
    fn test_close_kills_running_child() {
        let mut process = blocking();
        process.start("/bin/sh", ["-c", "sleep 30"], OpenMode::READ_WRITE);
        assert!(process.wait_for_started(WAIT));
        process.close();
        assert_eq!(process.state(), ProcessState::NotRunning);
        assert!(!process.is_open());
    }

    #[test]
    fn test_execute_exit_codes() {
        assert_eq!(Process::execute("/bin/sh", ["-c", "exit 4"]), 4);
        assert_eq!(Process::execute("/bin/sh", ["-c", "kill -KILL $$"]), -1);
        assert_eq!(Process::execute("/definitely/not/here", Vec::<String>::new()), -2);
        assert_eq!(Process::execute_command("   "), -2);
    }

    #[tokio::test]
    async fn test_event_loop_drives_engine() {
        let mut process = Process::new();
        let mut events = process.subscribe();
        process.start("/bin/echo", ["async"], OpenMode::READ_WRITE);

        let finished = tokio::time::timeout(Duration::from_secs(10), process.until_finished())
            .await
            .unwrap();
        assert!(finished);
        assert_eq!(process.read_all_standard_output(), b"async\n");

        let mut saw_ready_read = false;
        while let Ok(event) = events.try_recv() {
            saw_ready_read |= event == ProcessEvent::ReadyReadStandardOutput;
        }
        assert!(saw_ready_read);
    }

    #[test]
    fn test_dispatch_without_event_loop_returns_immediately() {
        let mut process = blocking();
        process.start("/bin/true", Vec::<String>::new(), OpenMode::READ_WRITE);
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        assert!(!rt.block_on(process.dispatch_events()));
        assert!(process.wait_for_finished(WAIT));
    }
}
