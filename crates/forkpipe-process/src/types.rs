//! Value types shared by the engine and its callers

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Lifecycle state of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// No child is attached
    #[default]
    NotRunning,
    /// Forked, waiting for the child to report its exec outcome
    Starting,
    /// Child exec'd successfully and has not been reaped yet
    Running,
}

/// How the last child terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    /// Voluntary exit; `exit_code()` is the child's own code
    #[default]
    NormalExit,
    /// Killed by a signal; `exit_code()` is the signal number
    CrashExit,
}

/// One of the two output streams the facade can read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessChannel {
    #[default]
    StandardOutput,
    StandardError,
}

/// Routing of the child's stdout and stderr
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessChannelMode {
    /// stdout and stderr each get their own channel
    #[default]
    SeparateChannels,
    /// stderr is merged into the stdout channel
    MergedChannels,
    /// Both streams go straight to the parent's own stdout/stderr
    ForwardedChannels,
    /// stdout is forwarded, stderr is captured
    ForwardedOutputChannel,
    /// stderr is forwarded, stdout is captured
    ForwardedErrorChannel,
}

impl ProcessChannelMode {
    pub(crate) fn forwards_output(self) -> bool {
        matches!(self, Self::ForwardedChannels | Self::ForwardedOutputChannel)
    }

    pub(crate) fn forwards_error(self) -> bool {
        matches!(self, Self::ForwardedChannels | Self::ForwardedErrorChannel)
    }
}

/// Routing of the child's stdin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputChannelMode {
    /// The engine owns the child's stdin through its write channel
    #[default]
    ManagedInputChannel,
    /// The child inherits the parent's stdin
    ForwardedInputChannel,
}

bitflags! {
    /// Facade open mode
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OpenMode: u8 {
        const READ_ONLY = 0b0001;
        const WRITE_ONLY = 0b0010;
        const READ_WRITE = Self::READ_ONLY.bits() | Self::WRITE_ONLY.bits();
        const UNBUFFERED = 0b0100;
    }
}

impl OpenMode {
    /// Not open at all
    pub const NOT_OPEN: Self = Self::empty();

    pub fn is_readable(self) -> bool {
        self.contains(Self::READ_ONLY)
    }

    pub fn is_writable(self) -> bool {
        self.contains(Self::WRITE_ONLY)
    }
}

/// Where a redirected output file is positioned on open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    #[default]
    Truncate,
    Append,
}
