#![cfg(unix)]

use aws_lambda_process_shim::{InvocationContext, Report, Shim, ShimError, Signal, StderrPolicy};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::{ffi::OsStr, time::Duration};
use tokio::time::Instant;

/// A shim running `script` under `/bin/sh`, with the event as `$1`.
fn sh(script: &str) -> Shim {
  Shim::default()
    .program("/bin/sh")
    .arg("-c")
    .arg(script)
    .arg("sh")
}

async fn invoke(shim: &Shim, event: serde_json::Value) -> (Result<Report, ShimError>, Option<Signal>) {
  let (ctx, signal) = InvocationContext::channel();
  let result = shim.handle(&event, ctx, None).await;
  (result, signal.recv().await)
}

#[test]
fn event_is_the_only_argument() {
  let payload = serde_json::to_string(&json!({"query": "foo", "size": 10})).unwrap();
  let command = Shim::default().command(&payload);
  let args: Vec<&OsStr> = command.as_std().get_args().collect();
  assert_eq!(args, vec![OsStr::new(r#"{"query":"foo","size":10}"#)]);
  assert_eq!(command.as_std().get_program(), OsStr::new("./elasticsearch_client"));
}

#[tokio::test]
async fn child_receives_the_serialized_event() {
  let shim = sh(r#"printf '%s %s' "$#" "$1""#);
  let (_, signal) = invoke(&shim, json!({"query": "foo"})).await;
  assert_eq!(signal, Some(Signal::Succeed(r#"stdout: 1 {"query":"foo"}"#.into())));
}

#[tokio::test]
async fn stdout_completes_the_invocation() {
  let shim = sh(r#"[ "$1" = '{"query":"foo"}' ] && printf ok"#);
  let (result, signal) = invoke(&shim, json!({"query": "foo"})).await;
  assert_eq!(signal, Some(Signal::Succeed("stdout: ok".into())));

  let report = result.unwrap();
  assert_eq!(report.exit_code, Some(0));
  assert!(report.suppressed.is_empty());
}

#[tokio::test]
async fn stderr_completes_the_invocation_successfully() {
  let shim = sh("printf boom >&2; exit 1");
  let (result, signal) = invoke(&shim, json!({})).await;
  assert_eq!(signal, Some(Signal::Succeed("stderr: boom".into())));
  assert_eq!(result.unwrap().exit_code, Some(1));
}

#[tokio::test]
async fn stderr_fails_when_configured() {
  let shim = sh("printf boom >&2").stderr_policy(StderrPolicy::Fail);
  let (_, signal) = invoke(&shim, json!({})).await;
  assert_eq!(signal, Some(Signal::Fail("stderr: boom".into())));
}

#[tokio::test]
async fn output_on_both_streams_is_signaled_once() {
  let shim = sh("printf out; printf err >&2");
  let (result, signal) = invoke(&shim, json!({})).await;
  let report = result.unwrap();

  assert_eq!(report.signals().count(), 2);
  assert_eq!(report.suppressed.len(), 1);
  assert_eq!(signal, report.delivered);
}

#[tokio::test]
async fn silent_failure_sends_no_signal() {
  let shim = sh("exit 7");
  let (result, signal) = invoke(&shim, json!({})).await;
  assert_eq!(signal, None);
  assert_eq!(
    result.unwrap(),
    Report {
      delivered: None,
      suppressed: vec![],
      exit_code: Some(7),
      timed_out: false,
    }
  );
}

#[tokio::test]
async fn missing_executable_is_a_spawn_error() {
  let dir = tempfile::tempdir().unwrap();
  let shim = Shim::default().current_dir(dir.path());
  let (result, signal) = invoke(&shim, json!({"query": "foo"})).await;

  assert_eq!(signal, None);
  match result {
    Err(ShimError::Spawn { program, .. }) => {
      assert_eq!(program, std::path::PathBuf::from("./elasticsearch_client"))
    }
    other => panic!("expected a spawn error, got {other:?}"),
  }
}

#[tokio::test]
async fn runs_in_the_configured_directory() {
  let dir = tempfile::tempdir().unwrap();
  let shim = sh(r#"printf %s "$(pwd -P)""#).current_dir(dir.path());
  let (_, signal) = invoke(&shim, json!({})).await;

  let expected = std::fs::canonicalize(dir.path()).unwrap();
  assert_eq!(
    signal,
    Some(Signal::Succeed(format!("stdout: {}", expected.display())))
  );
}

#[tokio::test]
async fn deadline_kills_a_silent_child() {
  let shim = sh("exec sleep 30");
  let (ctx, signal) = InvocationContext::channel();
  let started = Instant::now();
  let result = shim
    .handle(&json!({}), ctx, Some(started + Duration::from_millis(200)))
    .await;

  assert!(matches!(result, Err(ShimError::DeadlineExceeded { .. })));
  assert_eq!(signal.recv().await, None);
  assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn deadline_after_output_keeps_the_signal() {
  let shim = sh("printf early; exec sleep 30");
  let (ctx, signal) = InvocationContext::channel();
  let report = shim
    .handle(&json!({}), ctx, Some(Instant::now() + Duration::from_millis(500)))
    .await
    .unwrap();

  assert!(report.timed_out);
  assert_eq!(signal.recv().await, Some(Signal::Succeed("stdout: early".into())));
}

#[tokio::test]
async fn one_large_write_is_one_message() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("hits.json");
  let body = "a".repeat(20_000);
  std::fs::write(&path, &body).unwrap();

  // `$0` is the file, `$1` the event
  let shim = Shim::default()
    .program("/bin/sh")
    .arg("-c")
    .arg(r#"cat "$0""#)
    .arg(&path);
  let (result, signal) = invoke(&shim, json!({})).await;

  let report = result.unwrap();
  assert!(report.suppressed.is_empty());
  assert_eq!(signal, Some(Signal::Succeed(format!("stdout: {body}"))));
}

#[tokio::test]
async fn background_processes_do_not_hold_the_invocation() {
  let shim = sh("printf ok; sleep 5 &");
  let started = Instant::now();
  let (result, signal) = invoke(&shim, json!({})).await;

  assert!(started.elapsed() < Duration::from_secs(3));
  assert_eq!(signal, Some(Signal::Succeed("stdout: ok".into())));
  assert_eq!(result.unwrap().exit_code, Some(0));
}

#[tokio::test]
async fn stdin_is_empty() {
  let shim = sh(r#"printf 'read %s bytes' "$(cat | wc -c | tr -d ' ')""#);
  let (_, signal) = invoke(&shim, json!({})).await;
  assert_eq!(signal, Some(Signal::Succeed("stdout: read 0 bytes".into())));
}
