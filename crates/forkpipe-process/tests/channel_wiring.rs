//! Integration tests for channel redirection, chaining and channel modes

use std::sync::Arc;
use std::time::Duration;

use forkpipe_process::{
    ChannelKind, ChannelRole, NoEventLoop, OpenMode, Process, ProcessChannelMode, ProcessError,
    ProcessState, WriteMode,
};
use tempfile::TempDir;

const WAIT: Option<Duration> = Some(Duration::from_secs(20));

fn blocking() -> Process {
    Process::with_readiness(Arc::new(NoEventLoop))
}

#[test]
fn test_chained_processes_share_a_pipe() {
    let mut producer = blocking();
    let mut consumer = blocking();
    producer.set_standard_output_process(&mut consumer);
    assert_eq!(producer.channel_kind(ChannelRole::Stdout), ChannelKind::PipeSource);
    assert_eq!(consumer.channel_kind(ChannelRole::Stdin), ChannelKind::PipeSink);

    producer.start("/bin/sh", ["-c", "echo one; echo two"], OpenMode::READ_WRITE);
    consumer.start("/bin/sh", ["-c", "tr a-z A-Z"], OpenMode::READ_WRITE);
    assert!(!consumer.open_mode().is_writable());

    assert!(producer.wait_for_finished(WAIT));
    assert!(consumer.wait_for_finished(WAIT));
    assert_eq!(consumer.read_all_standard_output(), b"ONE\nTWO\n");
    assert!(producer.read_all_standard_output().is_empty());
}

#[test]
fn test_consumer_started_first() {
    let mut producer = blocking();
    let mut consumer = blocking();
    producer.set_standard_output_process(&mut consumer);

    consumer.start("/bin/cat", Vec::<String>::new(), OpenMode::READ_WRITE);
    assert!(consumer.wait_for_started(WAIT));
    producer.start("/bin/echo", ["late producer"], OpenMode::READ_WRITE);

    assert!(producer.wait_for_finished(WAIT));
    assert!(consumer.wait_for_finished(WAIT));
    assert_eq!(consumer.read_all_standard_output(), b"late producer\n");
}

#[test]
fn test_unlinking_resets_both_sides() {
    let mut producer = blocking();
    let mut consumer = blocking();
    producer.set_standard_output_process(&mut consumer);

    producer.reset_channel(ChannelRole::Stdout);
    assert_eq!(producer.channel_kind(ChannelRole::Stdout), ChannelKind::Normal);
    assert_eq!(consumer.channel_kind(ChannelRole::Stdin), ChannelKind::Normal);
}

#[test]
fn test_dropping_consumer_unlinks_producer() {
    let mut producer = blocking();
    {
        let mut consumer = blocking();
        producer.set_standard_output_process(&mut consumer);
    }
    assert_eq!(producer.channel_kind(ChannelRole::Stdout), ChannelKind::Normal);

    producer.start("/bin/echo", ["alone"], OpenMode::READ_WRITE);
    assert!(producer.wait_for_finished(WAIT));
    assert_eq!(producer.read_all_standard_output(), b"alone\n");
}

#[test]
fn test_redirected_output_truncates_and_appends() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("out.log");
    std::fs::write(&out, "stale contents\n").unwrap();

    let mut process = blocking();
    process.set_standard_output_file(&out, WriteMode::Truncate);
    process.start("/bin/echo", ["first"], OpenMode::READ_WRITE);
    assert!(process.wait_for_finished(WAIT));
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "first\n");

    process.set_standard_output_file(&out, WriteMode::Append);
    process.start("/bin/echo", ["second"], OpenMode::READ_WRITE);
    assert!(process.wait_for_finished(WAIT));
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "first\nsecond\n");
}

#[test]
fn test_redirected_stderr_keeps_stdout_captured() {
    let dir = TempDir::new().unwrap();
    let err = dir.path().join("err.log");

    let mut process = blocking();
    process.set_standard_error_file(&err, WriteMode::Truncate);
    process.start("/bin/sh", ["-c", "echo visible; echo hidden 1>&2"], OpenMode::READ_WRITE);
    assert!(process.open_mode().is_readable());
    assert!(process.wait_for_finished(WAIT));

    assert_eq!(process.read_all_standard_output(), b"visible\n");
    assert!(process.read_all_standard_error().is_empty());
    assert_eq!(std::fs::read_to_string(&err).unwrap(), "hidden\n");
}

#[test]
fn test_fully_redirected_output_drops_read_mode() {
    let dir = TempDir::new().unwrap();
    let mut process = blocking();
    process.set_standard_output_file(dir.path().join("o"), WriteMode::Truncate);
    process.set_standard_error_file(dir.path().join("e"), WriteMode::Truncate);
    process.start("/bin/true", Vec::<String>::new(), OpenMode::READ_WRITE);
    assert_eq!(process.open_mode(), OpenMode::WRITE_ONLY);
    assert!(process.wait_for_finished(WAIT));
}

#[test]
fn test_empty_path_restores_pipe() {
    let dir = TempDir::new().unwrap();
    let mut process = blocking();
    process.set_standard_output_file(dir.path().join("o"), WriteMode::Truncate);
    process.set_standard_output_file("", WriteMode::Truncate);
    assert_eq!(process.channel_kind(ChannelRole::Stdout), ChannelKind::Normal);
}

#[test]
fn test_unwritable_output_file_fails_to_start() {
    let dir = TempDir::new().unwrap();
    let mut process = blocking();
    process.set_standard_output_file(dir.path().join("missing/dir/out"), WriteMode::Truncate);
    process.start("/bin/echo", ["never"], OpenMode::READ_WRITE);

    assert_eq!(process.state(), ProcessState::NotRunning);
    assert_eq!(process.error(), ProcessError::FailedToStart);
    assert_eq!(process.pid(), 0);
}

#[test]
fn test_forwarded_error_channel_is_not_captured() {
    let mut process = blocking();
    process.set_process_channel_mode(ProcessChannelMode::ForwardedErrorChannel);
    process.start("/bin/sh", ["-c", "echo kept; echo forwarded 1>&2"], OpenMode::READ_WRITE);
    assert!(process.wait_for_finished(WAIT));
    assert_eq!(process.read_all_standard_output(), b"kept\n");
    assert!(process.read_all_standard_error().is_empty());
}

#[test]
fn test_stdin_file_feeds_child() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("input.txt");
    std::fs::write(&input, "line a\nline b\n").unwrap();

    let mut process = blocking();
    process.set_standard_input_file(&input);
    process.start("/bin/sh", ["-c", "wc -l"], OpenMode::READ_WRITE);
    assert!(process.wait_for_finished(WAIT));
    let count = String::from_utf8(process.read_all_standard_output()).unwrap();
    assert_eq!(count.trim(), "2");
}
