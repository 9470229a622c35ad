//! Tests for the subprocess executor

use super::subprocess::{ExecutorError, SubprocessExecutor};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::time::Instant;

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_execute_command_success() {
    let result =
        SubprocessExecutor::execute_command("echo", &args(&["hello"]), None, None, Some(5000), 1024)
            .await;

    let execution_result = result.unwrap();
    assert!(execution_result.success);
    assert_eq!(execution_result.exit_code, Some(0));
    assert!(execution_result.stdout.contains("hello"));
    assert!(execution_result.stderr.is_empty());
}

#[tokio::test]
async fn test_execute_command_failure() {
    let result =
        SubprocessExecutor::execute_command("false", &[], None, None, Some(5000), 1024).await;

    let execution_result = result.unwrap();
    assert!(!execution_result.success);
    assert_eq!(execution_result.exit_code, Some(1));
}

#[tokio::test]
async fn test_execute_command_timeout_kills_child() {
    let started = Instant::now();
    let result =
        SubprocessExecutor::execute_command("sleep", &args(&["10"]), None, None, Some(300), 1024)
            .await;

    assert!(matches!(
        result,
        Err(ExecutorError::TimedOut {
            timeout_ms: 300,
            ..
        })
    ));
    assert!(started.elapsed().as_secs() < 5);
}

#[tokio::test]
async fn test_missing_program_is_spawn_error() {
    let result = SubprocessExecutor::execute_command(
        "nonexistent_command_12345",
        &[],
        None,
        None,
        Some(1000),
        1024,
    )
    .await;

    match result {
        Err(ExecutorError::Spawn { source, .. }) => assert_eq!(source.kind(), ErrorKind::NotFound),
        other => panic!("expected spawn error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_output_is_capped() {
    let result = SubprocessExecutor::execute_command(
        "sh",
        &args(&["-c", "yes x | head -c 100000"]),
        None,
        None,
        Some(5000),
        64,
    )
    .await
    .unwrap();

    assert!(result.success);
    assert!(result.stdout.starts_with("x\nx\n"));
    assert!(result.stdout.ends_with("[truncated 99936 bytes]"));
}

#[tokio::test]
async fn test_working_dir_and_env() {
    let dir = tempfile::tempdir().unwrap();
    let mut env = HashMap::new();
    env.insert("VERITAS_PROBE".to_string(), "42".to_string());

    let result = SubprocessExecutor::execute_command(
        "sh",
        &args(&["-c", "pwd; echo $VERITAS_PROBE"]),
        Some(dir.path()),
        Some(&env),
        Some(5000),
        4096,
    )
    .await
    .unwrap();

    let canonical = dir.path().canonicalize().unwrap();
    assert!(result.stdout.contains(canonical.to_str().unwrap()));
    assert!(result.stdout.contains("42"));
}

#[tokio::test]
async fn test_stderr_keeps_last_line() {
    let script = "i=0; while [ $i -lt 200 ]; do echo \"note: loading plugin $i\" >&2; i=$((i+1)); done; \
                  echo \"ModuleNotFoundError: No module named 'missing'\" >&2; exit 1";
    let result = SubprocessExecutor::execute_command(
        "sh",
        &args(&["-c", script]),
        None,
        None,
        Some(5000),
        1024,
    )
    .await
    .unwrap();

    assert!(!result.success);
    assert!(result.stderr.starts_with("[truncated "));
    assert!(result
        .stderr
        .trim_end()
        .ends_with("ModuleNotFoundError: No module named 'missing'"));
    assert!(!result.stderr.contains("loading plugin 0\n"));
}

#[tokio::test]
async fn test_truncation_respects_char_boundary() {
    let head = SubprocessExecutor::execute_command(
        "sh",
        &args(&["-c", "printf 'ééé'"]),
        None,
        None,
        Some(5000),
        3,
    )
    .await
    .unwrap();
    assert_eq!(head.stdout, "é\n[truncated 4 bytes]");

    let tail = SubprocessExecutor::execute_command(
        "sh",
        &args(&["-c", "printf 'ééé' >&2"]),
        None,
        None,
        Some(5000),
        3,
    )
    .await
    .unwrap();
    assert_eq!(tail.stderr, "[truncated 4 bytes]\né");
}
