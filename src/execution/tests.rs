use super::*;
use crate::execution::source::{BufferSource, FileSource, InputSource};
use crate::test_support::serial_guard;
use std::ffi::CString;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{Duration, Instant};

fn argv(args: &[&str]) -> Vec<CString> {
    prepare_argv(args).unwrap()
}

fn run_bytes(args: &[&str], input: Option<&[u8]>, capture: bool) -> ExecResult {
    let plan = StdioPlan::for_request(input.is_some(), capture);
    let child = launch(&argv(args), plan, Path::new("/dev/null")).unwrap();
    let source = input.map(|data| Box::new(BufferSource::new(data.to_vec())) as Box<dyn InputSource>);
    Multiplexer::new(child, source, true, FALLBACK_CHUNK_SIZE).run()
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn cat_round_trips_every_size() {
    let _guard = serial_guard();

    for len in [0, 1, 37, 64 * 1024 + 3, 3 * 1024 * 1024 + 17] {
        let input = patterned(len);
        let result = run_bytes(&["cat"], Some(&input), true);

        assert!(result.exited);
        assert_eq!(result.exit_code, 0, "cat failed for {} bytes", len);
        let stdout = result.stdout.expect("stdout captured");
        assert_eq!(stdout.len(), len);
        assert!(stdout == input, "output differs for {} bytes", len);
        assert_eq!(result.stderr, Some(Vec::new()));
    }
}

#[test]
fn embedded_zero_bytes_are_not_truncated() {
    let input = b"before\0middle\0\0after".to_vec();
    let result = run_bytes(&["cat"], Some(&input), true);
    assert_eq!(result.stdout, Some(input));
}

#[test]
fn concrete_shell_scenario() {
    let result = run_bytes(
        &["sh", "-c", "cat;echo hello; echo error >&2; exit 42"],
        Some(b"catsh stdin "),
        true,
    );

    assert!(result.exited);
    assert_eq!(result.exit_code, 42);
    assert_eq!(result.stdout.as_deref(), Some(&b"catsh stdin hello\n"[..]));
    assert_eq!(result.stderr.as_deref(), Some(&b"error\n"[..]));
}

#[test]
fn output_larger_than_pipe_while_stdin_is_pending_does_not_deadlock() {
    let _guard = serial_guard();

    // The child floods stdout before it reads any stdin
    let input = patterned(2 * 1024 * 1024);
    let started = Instant::now();
    let result = run_bytes(
        &["sh", "-c", "head -c 4000000 /dev/zero; cat"],
        Some(&input),
        true,
    );

    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(result.exit_code, 0);
    let stdout = result.stdout.unwrap();
    assert_eq!(stdout.len(), 4_000_000 + input.len());
    assert!(stdout[..4_000_000].iter().all(|&b| b == 0));
    assert!(stdout[4_000_000..] == input[..]);
}

#[test]
fn stderr_flood_is_drained_concurrently() {
    let _guard = serial_guard();

    let result = run_bytes(
        &["sh", "-c", "head -c 3000000 /dev/zero >&2; echo tail"],
        None,
        true,
    );

    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stderr.map(|e| e.len()), Some(3_000_000));
    assert_eq!(result.stdout.as_deref(), Some(&b"tail\n"[..]));
}

#[test]
fn output_queued_before_exit_is_kept() {
    let result = run_bytes(&["sh", "-c", "printf queued; exit 5"], None, true);

    assert_eq!(result.exit_code, 5);
    assert_eq!(result.stdout.as_deref(), Some(&b"queued"[..]));
}

#[test]
fn large_output_queued_before_exit_is_kept() {
    let result = run_bytes(&["sh", "-c", "head -c 60000 /dev/zero; exit 0"], None, true);
    assert_eq!(result.stdout.map(|out| out.len()), Some(60_000));
}

#[test]
fn child_ignoring_stdin_does_not_hang() {
    let input = patterned(4 * 1024 * 1024);
    let result = run_bytes(&["sh", "-c", "exit 9"], Some(&input), true);

    assert!(result.exited);
    assert_eq!(result.exit_code, 9);
}

#[test]
fn signal_termination_maps_to_128_plus_signal() {
    let result = run_bytes(&["sh", "-c", "kill -9 $$"], None, true);
    assert!(result.exited);
    assert_eq!(result.exit_code, 128 + 9);

    let result = run_bytes(&["sh", "-c", "kill -TERM $$"], None, false);
    assert_eq!(result.exit_code, 128 + 15);
}

#[test]
fn normal_exit_codes_pass_through() {
    for code in [0, 1, 42, 255] {
        let script = format!("exit {}", code);
        let result = run_bytes(&["sh", "-c", &script], None, false);
        assert_eq!(result.exit_code, code);
    }
}

#[test]
fn capture_disabled_is_absent_and_silent_stream_is_empty() {
    let captured = run_bytes(&["echo", "abc"], None, true);
    assert_eq!(captured.stdout.as_deref(), Some(&b"abc\n"[..]));
    assert_eq!(captured.stderr, Some(Vec::new()));

    let discarded = run_bytes(&["echo", "abc"], None, false);
    assert!(discarded.stdout.is_none());
    assert!(discarded.stderr.is_none());
}

#[test]
fn stderr_only_and_both_streams() {
    let stderr_only = run_bytes(&["sh", "-c", "echo err >&2"], None, true);
    assert_eq!(stderr_only.stdout, Some(Vec::new()));
    assert_eq!(stderr_only.stderr.as_deref(), Some(&b"err\n"[..]));

    let both = run_bytes(&["sh", "-c", "echo out; echo err >&2"], None, true);
    assert_eq!(both.stdout.as_deref(), Some(&b"out\n"[..]));
    assert_eq!(both.stderr.as_deref(), Some(&b"err\n"[..]));
}

#[test]
fn missing_program_reports_sentinel_through_multiplexer() {
    let result = run_bytes(&["pipexec-no-such-binary"], Some(b"ignored"), true);
    assert!(result.exited);
    assert_eq!(result.exit_code, EXEC_FAILURE_EXIT_CODE);
    assert_eq!(result.stdout, Some(Vec::new()));
}

#[test]
fn chunk_size_follows_pipe_capacity_without_raising() {
    let child = launch(
        &argv(&["true"]),
        StdioPlan::for_request(true, true),
        Path::new("/dev/null"),
    )
    .unwrap();

    let expected = [&child.stdout, &child.stderr, &child.stdin]
        .into_iter()
        .filter_map(|end| end.as_ref().and_then(pipe_capacity))
        .min()
        .unwrap_or(FALLBACK_CHUNK_SIZE);

    let multiplexer = Multiplexer::new(child, None, false, FALLBACK_CHUNK_SIZE);
    assert_eq!(multiplexer.chunk_size(), expected);

    let result = multiplexer.run();
    assert_eq!(result.exit_code, 0);
}

#[test]
fn file_source_streams_through_child_with_progress() {
    let _guard = serial_guard();

    let payload = patterned(1024 * 1024 + 11);
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(&payload).unwrap();
    file.seek(SeekFrom::Start(0)).unwrap();

    let child = launch(
        &argv(&["cat"]),
        StdioPlan::for_request(true, true),
        Path::new("/dev/null"),
    )
    .unwrap();

    let mut notifications: Vec<(f32, i32)> = Vec::new();
    let mut sink = |fraction: f32, slot: i32| notifications.push((fraction, slot));
    let source: Box<dyn InputSource> = Box::new(FileSource::new(file));
    let result = Multiplexer::new(child, Some(source), true, FALLBACK_CHUNK_SIZE)
        .with_progress(&mut sink, 7)
        .run();

    assert_eq!(result.exit_code, 0);
    assert!(result.stdout.unwrap() == payload);

    let (last, rest) = notifications.split_last().unwrap();
    assert_eq!(*last, (PROGRESS_DONE, 7));
    assert!(!rest.is_empty());
    assert!(rest.iter().all(|&(f, slot)| (0.0..=1.0).contains(&f) && slot == 7));
    assert!(rest.windows(2).all(|w| w[0].0 <= w[1].0));
}

#[test]
fn file_source_from_pipe_uses_indeterminate_total() {
    let (read_end, write_end) = nix::unistd::pipe().unwrap();
    let writer = std::thread::spawn(move || {
        let mut writer = std::fs::File::from(write_end);
        writer.write_all(b"streamed through a pipe\n").unwrap();
    });

    let child = launch(
        &argv(&["cat"]),
        StdioPlan::for_request(true, true),
        Path::new("/dev/null"),
    )
    .unwrap();

    let mut fractions = Vec::new();
    let mut sink = |fraction: f32, _slot: i32| fractions.push(fraction);
    let source: Box<dyn InputSource> = Box::new(FileSource::new(std::fs::File::from(read_end)));
    let result = Multiplexer::new(child, Some(source), true, FALLBACK_CHUNK_SIZE)
        .with_progress(&mut sink, 0)
        .run();
    writer.join().unwrap();

    assert_eq!(
        result.stdout.as_deref(),
        Some(&b"streamed through a pipe\n"[..])
    );
    assert_eq!(fractions.last(), Some(&PROGRESS_DONE));
    // Total is treated as 1 byte, so every fraction saturates at 1.0
    assert!(fractions[..fractions.len() - 1].iter().all(|&f| f == 0.0 || f == 1.0));
}

#[test]
fn no_channels_just_reaps() {
    let child = launch(
        &argv(&["sh", "-c", "exit 3"]),
        StdioPlan::for_request(false, false),
        Path::new("/dev/null"),
    )
    .unwrap();

    let mut calls = Vec::new();
    let mut sink = |fraction: f32, _slot: i32| calls.push(fraction);
    let result = Multiplexer::new(child, None, true, FALLBACK_CHUNK_SIZE)
        .with_progress(&mut sink, 1)
        .run();

    assert!(result.exited);
    assert_eq!(result.exit_code, 3);
    assert!(result.stdout.is_none() && result.stderr.is_none());
    assert_eq!(calls, vec![PROGRESS_DONE]);
}

#[test]
fn sigpipe_death_is_reported_as_signal() {
    let result = run_bytes(&["sh", "-c", "kill -PIPE $$; exit 3"], None, true);
    assert!(result.exited);
    assert_eq!(result.exit_code, 128 + 13);
}

#[test]
fn pipelines_inside_the_child_end_quietly_on_sigpipe() {
    let result = run_bytes(&["sh", "-c", "yes | head -c 1 >/dev/null"], None, true);
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stderr, Some(Vec::new()));
}
