//! # forkpipe-process
//!
//! **Purpose**: Child process engine with pipe, file and process-to-process
//! channel wiring
//!
//! A [`Process`] forks and execs one child at a time, connects its standard
//! streams and tracks its lifecycle. The same non-blocking core is driven
//! either by a tokio reactor or by blocking `wait_for_*` calls.
//!
//! ## Features
//!
//! - **Channels**: stdin/stdout/stderr as pipes, redirected files, the null
//!   device or a pipe chained into another engine's stdin
//! - **Channel Modes**: separate, merged or forwarded output; managed or
//!   forwarded input
//! - **Startup Reporting**: exec, `chdir` and setup-hook failures travel back
//!   from the child over a close-on-exec pipe
//! - **Death Notification**: one process-wide `SIGCHLD` handler wakes every
//!   engine, each reaps only its own child
//! - **Blocking Waits**: `wait_for_started`, `wait_for_ready_read`,
//!   `wait_for_bytes_written`, `wait_for_finished` with optional timeouts
//! - **Events**: lifecycle and I/O events through callbacks or channels
//! - **Detached Start**: double-fork launch reporting the remote pid
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use forkpipe_process::{OpenMode, Process};
//!
//! let mut process = Process::new();
//! process.start("/bin/echo", ["hello"], OpenMode::READ_WRITE);
//! if process.wait_for_finished(Some(Duration::from_secs(5))) {
//!     let output = process.read_all_standard_output();
//!     assert_eq!(output, b"hello\n");
//! }
//! ```

pub mod command_line;
pub mod environment;
pub mod error;
pub mod events;
pub mod ring_buffer;
pub mod types;

#[cfg(unix)]
mod channel;
#[cfg(unix)]
pub mod config;
#[cfg(unix)]
mod detached;
#[cfg(unix)]
pub mod manager;
#[cfg(unix)]
pub mod notifier;
#[cfg(unix)]
mod process;
#[cfg(unix)]
mod spawn;
#[cfg(unix)]
mod sys;
#[cfg(unix)]
mod wait;

pub use command_line::split_command_line;
pub use environment::{system_environment, ProcessEnvironment};
pub use error::{Error, ProcessError, Result};
pub use events::ProcessEvent;
pub use ring_buffer::RingBuffer;
pub use types::{
    ExitStatus, InputChannelMode, OpenMode, ProcessChannel, ProcessChannelMode, ProcessState,
    WriteMode,
};

#[cfg(unix)]
pub use channel::{ChannelKind, ChannelRole};
#[cfg(unix)]
pub use config::ProcessConfig;
#[cfg(unix)]
pub use detached::{start_detached, start_detached_command};
#[cfg(unix)]
pub use manager::ProcessManager;
#[cfg(unix)]
pub use notifier::{default_source, Direction, NoEventLoop, Notifier, ReadinessSource, TokioReactor};
#[cfg(unix)]
pub use process::Process;
#[cfg(unix)]
pub use spawn::ChildSetupHook;
#[cfg(unix)]
pub use sys::NULL_DEVICE;
