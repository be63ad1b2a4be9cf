// forkpipe CLI entry point

mod settings;

use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use forkpipe_process::{
    split_command_line, start_detached, ExitStatus, InputChannelMode, OpenMode, Process,
    ProcessChannelMode, ProcessConfig, ProcessState,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use settings::{Settings, SettingsLoader};

/// Slice used when polling a running child so output reaches the terminal
/// while it is produced
const DRAIN_INTERVAL: Duration = Duration::from_millis(50);

/// Exit code for children that could not be started, as in POSIX shells
const EXIT_NOT_STARTED: i32 = 127;

#[derive(Parser, Debug)]
#[command(name = "forkpipe", version, about = "Run and wire child processes")]
struct Cli {
    /// Settings file (defaults to <config dir>/forkpipe/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a program and copy its output to the terminal
    Run(RunArgs),

    /// Run a combined command line with all streams forwarded
    Exec {
        /// Command line, split with shell-like quoting
        command: String,
    },

    /// Start a program detached from this process and print its pid
    Detach {
        program: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
        /// Working directory for the detached program
        #[arg(long)]
        cwd: Option<PathBuf>,
    },

    /// Feed one command's stdout into another's stdin
    Pipe {
        producer: String,
        consumer: String,
    },

    /// Print the environment a child inherits
    Env,

    /// Print the effective settings as TOML
    Settings,
}

#[derive(Args, Debug)]
struct RunArgs {
    program: String,
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
    /// Feed this file to the child's stdin
    #[arg(long)]
    stdin: Option<PathBuf>,
    /// Send the child's stdout to this file
    #[arg(long)]
    stdout: Option<PathBuf>,
    /// Send the child's stderr to this file
    #[arg(long)]
    stderr: Option<PathBuf>,
    /// Append to --stdout/--stderr files instead of truncating
    #[arg(long)]
    append: bool,
    /// Merge stderr into stdout
    #[arg(long)]
    merge: bool,
    /// Working directory for the child
    #[arg(long)]
    cwd: Option<PathBuf>,
    /// Kill the child after this many milliseconds
    #[arg(long)]
    timeout: Option<u64>,
}

fn main() {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("forkpipe: {e:#}");
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let loader = match &cli.config {
        Some(path) => SettingsLoader::with_path(path),
        None => SettingsLoader::new(),
    };
    let settings = loader
        .load()
        .with_context(|| format!("reading {}", loader.config_path().display()))?;
    init_logging(&settings, cli.verbose);
    debug!(path = %loader.config_path().display(), "Settings loaded");

    match cli.command {
        Command::Run(args) => run_program(args, &settings),
        Command::Exec { command } => exec_command(&command),
        Command::Detach { program, args, cwd } => {
            let pid = start_detached(&program, &args, cwd.as_deref())?;
            info!(pid, program = %program, "Detached");
            println!("{pid}");
            Ok(0)
        }
        Command::Pipe { producer, consumer } => pipe_commands(&producer, &consumer, &settings),
        Command::Env => {
            for entry in Process::system_environment() {
                println!("{entry}");
            }
            Ok(0)
        }
        Command::Settings => {
            print!("{}", settings.to_toml()?);
            Ok(0)
        }
    }
}

/// Installs the stderr subscriber. `RUST_LOG` wins over the settings.
fn init_logging(settings: &Settings, verbose: bool) {
    let fallback = if verbose { "debug" } else { settings.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_program(args: RunArgs, settings: &Settings) -> Result<i32> {
    let channel_mode = if args.merge {
        ProcessChannelMode::MergedChannels
    } else {
        settings.channel_mode
    };
    let mut config = ProcessConfig::new(args.program)
        .args(args.args)
        .channel_mode(channel_mode)
        .timeout(args.timeout.map_or(settings.wait_timeout(), Duration::from_millis));
    config.stdout_append = args.append;
    config.stderr_append = args.append;
    config.working_dir = args.cwd;
    config.stdout_file = args.stdout;
    config.stderr_file = args.stderr;
    config = match args.stdin {
        Some(path) => config.stdin_file(path),
        None => config.input_channel_mode(InputChannelMode::ForwardedInputChannel),
    };

    let mut process = Process::from_config(&config)?;
    process.open(OpenMode::READ_WRITE);
    let budget = config.timeout.unwrap_or(settings.wait_timeout());
    supervise(&mut process, budget)
}

fn exec_command(command: &str) -> Result<i32> {
    if split_command_line(command).is_empty() {
        bail!("empty command line");
    }
    match Process::execute_command(command) {
        -2 => {
            warn!(command = %command, "Could not start");
            Ok(EXIT_NOT_STARTED)
        }
        -1 => bail!("`{command}` crashed"),
        code => Ok(code),
    }
}

fn pipe_commands(producer: &str, consumer: &str, settings: &Settings) -> Result<i32> {
    let mut upstream = Process::new();
    let mut downstream = Process::new();
    upstream.set_standard_output_process(&mut downstream);
    upstream.set_process_channel_mode(ProcessChannelMode::ForwardedErrorChannel);
    upstream.set_input_channel_mode(InputChannelMode::ForwardedInputChannel);
    downstream.set_process_channel_mode(ProcessChannelMode::ForwardedChannels);

    downstream.start_command(consumer, OpenMode::READ_WRITE);
    upstream.start_command(producer, OpenMode::READ_WRITE);

    let deadline = Instant::now() + settings.wait_timeout();
    let upstream_code = supervise_until(&mut upstream, deadline)?;
    let downstream_code = supervise_until(&mut downstream, deadline)?;
    debug!(upstream = upstream_code, downstream = downstream_code, "Pipeline finished");
    Ok(downstream_code)
}

fn supervise(process: &mut Process, budget: Duration) -> Result<i32> {
    supervise_until(process, Instant::now() + budget)
}

/// Waits for `process`, copying captured output as it arrives, and maps the
/// outcome to an exit code. The child is killed once `deadline` passes.
fn supervise_until(process: &mut Process, deadline: Instant) -> Result<i32> {
    if !process.wait_for_started(Some(deadline.saturating_duration_since(Instant::now()))) {
        if process.state() == ProcessState::NotRunning {
            eprintln!("forkpipe: {}: {}", process.program(), process.error_string());
            return Ok(EXIT_NOT_STARTED);
        }
        process.kill();
        process.wait_for_finished(None);
        bail!("`{}` did not start in time", process.program());
    }

    loop {
        let slice = DRAIN_INTERVAL.min(deadline.saturating_duration_since(Instant::now()));
        let finished = process.wait_for_finished(Some(slice));
        copy_output(process)?;
        if finished || process.state() == ProcessState::NotRunning {
            break;
        }
        if Instant::now() >= deadline {
            warn!(pid = process.pid(), "Timed out, killing child");
            process.kill();
            process.wait_for_finished(None);
            copy_output(process)?;
            bail!("`{}` timed out", process.program());
        }
    }

    Ok(match process.exit_status() {
        ExitStatus::NormalExit => process.exit_code(),
        ExitStatus::CrashExit => 128 + process.exit_code(),
    })
}

fn copy_output(process: &mut Process) -> Result<()> {
    let out = process.read_all_standard_output();
    if !out.is_empty() {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(&out)?;
        stdout.flush()?;
    }
    let err = process.read_all_standard_error();
    if !err.is_empty() {
        let mut stderr = std::io::stderr().lock();
        stderr.write_all(&err)?;
        stderr.flush()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_arguments_parse() {
        let cli = Cli::try_parse_from([
            "forkpipe", "run", "--merge", "--timeout", "250", "/bin/sh", "-c", "exit 3",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.program, "/bin/sh");
        assert_eq!(args.args, vec!["-c", "exit 3"]);
        assert!(args.merge);
        assert_eq!(args.timeout, Some(250));
    }

    #[test]
    fn test_pipe_takes_two_command_lines() {
        let cli = Cli::try_parse_from(["forkpipe", "pipe", "echo hi", "tr a-z A-Z"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Pipe { ref producer, ref consumer }
                if producer == "echo hi" && consumer == "tr a-z A-Z"
        ));
    }

    #[test]
    fn test_run_reports_exit_code() {
        let args = RunArgs {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "exit 4".to_string()],
            stdin: Some(PathBuf::from(Process::null_device())),
            stdout: None,
            stderr: None,
            append: false,
            merge: false,
            cwd: None,
            timeout: Some(20_000),
        };
        assert_eq!(run_program(args, &Settings::default()).unwrap(), 4);
    }

    #[test]
    fn test_run_missing_program_is_not_started() {
        let args = RunArgs {
            program: "/nonexistent/forkpipe-cli".to_string(),
            args: Vec::new(),
            stdin: Some(PathBuf::from(Process::null_device())),
            stdout: None,
            stderr: None,
            append: false,
            merge: false,
            cwd: None,
            timeout: Some(20_000),
        };
        assert_eq!(run_program(args, &Settings::default()).unwrap(), EXIT_NOT_STARTED);
    }

    #[test]
    fn test_run_writes_redirect_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let out = dir.path().join("out.txt");
        let args = RunArgs {
            program: "/bin/echo".to_string(),
            args: vec!["to file".to_string()],
            stdin: Some(PathBuf::from(Process::null_device())),
            stdout: Some(out.clone()),
            stderr: None,
            append: false,
            merge: false,
            cwd: None,
            timeout: Some(20_000),
        };
        assert_eq!(run_program(args, &Settings::default()).unwrap(), 0);
        assert_eq!(std::fs::read_to_string(out).unwrap(), "to file\n");
    }

    #[test]
    fn test_exec_empty_command_is_an_error() {
        assert!(exec_command("  ").is_err());
    }
}
