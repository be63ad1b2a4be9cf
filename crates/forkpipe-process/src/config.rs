//! Process configuration

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::environment::ProcessEnvironment;
use crate::error::{Error, Result};
use crate::process::Process;
use crate::sys::NULL_DEVICE;
use crate::types::{InputChannelMode, ProcessChannelMode, WriteMode};

/// Everything needed to configure a [`Process`] before starting it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Executable, looked up in `PATH` when it has no `/`
    pub program: String,
    /// Command arguments
    pub args: Vec<String>,
    /// Working directory (None = current dir)
    pub working_dir: Option<PathBuf>,
    /// Full replacement environment as `NAME=VALUE` entries
    /// (None = start from the parent's environment)
    pub environment: Option<Vec<String>>,
    /// Variables added on top of the base environment
    pub env: BTreeMap<String, String>,
    pub channel_mode: ProcessChannelMode,
    pub input_channel_mode: InputChannelMode,
    /// File fed to the child's stdin
    pub stdin_file: Option<PathBuf>,
    /// File receiving the child's stdout
    pub stdout_file: Option<PathBuf>,
    pub stdout_append: bool,
    /// File receiving the child's stderr
    pub stderr_file: Option<PathBuf>,
    pub stderr_append: bool,
    /// Default budget for blocking waits (None = no timeout)
    #[serde(with = "duration_millis")]
    pub timeout: Option<Duration>,
}

impl ProcessConfig {
    /// Create new process configuration
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Set command arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set working directory
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Replace the inherited environment with `NAME=VALUE` entries
    pub fn environment<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.environment = Some(entries.into_iter().map(Into::into).collect());
        self
    }

    pub fn channel_mode(mut self, mode: ProcessChannelMode) -> Self {
        self.channel_mode = mode;
        self
    }

    pub fn input_channel_mode(mut self, mode: InputChannelMode) -> Self {
        self.input_channel_mode = mode;
        self
    }

    pub fn stdin_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin_file = Some(path.into());
        self
    }

    pub fn stdout_file(mut self, path: impl Into<PathBuf>, mode: WriteMode) -> Self {
        self.stdout_file = Some(path.into());
        self.stdout_append = mode == WriteMode::Append;
        self
    }

    pub fn stderr_file(mut self, path: impl Into<PathBuf>, mode: WriteMode) -> Self {
        self.stderr_file = Some(path.into());
        self.stderr_append = mode == WriteMode::Append;
        self
    }

    /// Set timeout in seconds
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = Some(Duration::from_secs(secs));
        self
    }

    /// Set timeout duration
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Enable/disable stdout capture; disabled output goes to the null device
    pub fn capture_stdout(mut self, capture: bool) -> Self {
        self.stdout_file = (!capture).then(|| PathBuf::from(NULL_DEVICE));
        self.stdout_append = false;
        self
    }

    /// Enable/disable stderr capture; disabled output goes to the null device
    pub fn capture_stderr(mut self, capture: bool) -> Self {
        self.stderr_file = (!capture).then(|| PathBuf::from(NULL_DEVICE));
        self.stderr_append = false;
        self
    }

    /// Rejects configurations that can never start
    pub fn validate(&self) -> Result<()> {
        if self.program.trim().is_empty() {
            return Err(Error::InvalidConfig("program must not be empty".to_string()));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(Error::InvalidConfig("timeout must be positive".to_string()));
        }
        Ok(())
    }

    /// Environment the child will receive, or `None` to inherit unchanged
    pub fn resolved_environment(&self) -> Option<ProcessEnvironment> {
        if self.environment.is_none() && self.env.is_empty() {
            return None;
        }
        let mut environment = match &self.environment {
            Some(entries) => ProcessEnvironment::from_list(entries),
            None => ProcessEnvironment::system_environment(),
        };
        for (name, value) in &self.env {
            environment.insert(name, value);
        }
        Some(environment)
    }

    /// Configures `process` for a subsequent [`Process::open`]
    pub fn apply(&self, process: &mut Process) -> Result<()> {
        self.validate()?;
        process.set_program(self.program.clone());
        process.set_arguments(self.args.iter().cloned());
        if let Some(dir) = &self.working_dir {
            process.set_working_directory(dir);
        }
        if let Some(environment) = self.resolved_environment() {
            process.set_process_environment(environment);
        }
        process.set_process_channel_mode(self.channel_mode);
        process.set_input_channel_mode(self.input_channel_mode);
        if let Some(path) = &self.stdin_file {
            process.set_standard_input_file(path);
        }
        if let Some(path) = &self.stdout_file {
            process.set_standard_output_file(path, write_mode(self.stdout_append));
        }
        if let Some(path) = &self.stderr_file {
            process.set_standard_error_file(path, write_mode(self.stderr_append));
        }
        Ok(())
    }
}

impl Process {
    /// Builds an engine configured from `config`
    pub fn from_config(config: &ProcessConfig) -> Result<Self> {
        let mut process = Process::new();
        config.apply(&mut process)?;
        Ok(process)
    }
}

fn write_mode(append: bool) -> WriteMode {
    if append {
        WriteMode::Append
    } else {
        WriteMode::Truncate
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
