//! Facade-level tests.
//!
//! The first group runs anywhere: it exercises validation, caching and
//! the disabled path, none of which touch the daemon. The `#[ignore]`
//! group needs a running Docker daemon (and pulls `python:3.11-slim` on
//! first use):
//!
//! ```text
//! cargo test -p crucible-engine -- --ignored
//! ```

use crate::config::EngineConfig;
use crate::engine::ExecutionEngine;
use crate::types::{ExecutionRequest, ExecutionStatus, Language, TestCase};
use uuid::Uuid;

fn engine() -> ExecutionEngine {
    ExecutionEngine::new(EngineConfig::default()).expect("engine construction is offline")
}

fn python(source: &str) -> ExecutionRequest {
    ExecutionRequest::new(Language::Python, source)
}

fn add_request() -> ExecutionRequest {
    let mut request = python("def add(a, b):\n    return a + b\n");
    request.test_cases.push(TestCase {
        name: "adds two positives".to_string(),
        test_code: "print(add(2, 3))".to_string(),
        expected_output: "5".to_string(),
    });
    request
}

#[test]
fn construction_makes_no_daemon_connection() {
    // plain #[test]: construction must need neither an async runtime nor
    // a reachable Docker socket
    assert!(ExecutionEngine::new(EngineConfig::default()).is_ok());
}

#[tokio::test]
async fn validation_rejection_spawns_no_sandbox() {
    let engine = engine();
    let report = engine
        .execute(python("import socket\nprint('unreachable')\n"))
        .await;

    assert_eq!(report.status, ExecutionStatus::ValidationRejected);
    assert!(report.stderr.contains("socket"));
    assert_eq!(report.duration_ms, 0);
    assert!(!report.cache_hit);

    let metrics = engine.metrics().await;
    assert_eq!(metrics.sandboxes_spawned, 0);
    assert_eq!(metrics.active_sandboxes, 0);
}

#[tokio::test]
async fn oversized_source_is_rejected_before_spawn() {
    let engine = engine();
    let report = engine.execute(python(&"a = 1\n".repeat(200_000))).await;

    assert_eq!(report.status, ExecutionStatus::ValidationRejected);
    assert!(report.stderr.contains("byte limit"));
    assert_eq!(engine.metrics().await.sandboxes_spawned, 0);
}

#[tokio::test]
async fn disabled_engine_answers_without_touching_the_runtime() {
    let config = EngineConfig {
        enabled: false,
        ..EngineConfig::default()
    };
    let engine = ExecutionEngine::new(config).expect("engine construction is offline");

    let report = engine.execute(python("print('hi')")).await;
    assert_eq!(report.status, ExecutionStatus::RuntimeError);
    assert!(report.stderr.contains("disabled"));
    assert_eq!(engine.metrics().await.sandboxes_spawned, 0);
    assert!(!engine.is_runtime_available().await);
}

#[tokio::test]
async fn repeated_rejection_is_served_from_cache() {
    let engine = engine();
    let request = python("import subprocess\n");

    let first = engine.execute(request.clone()).await;
    let second = engine.execute(request).await;

    assert_eq!(first.status, ExecutionStatus::ValidationRejected);
    assert!(!first.cache_hit);
    assert_eq!(second.status, ExecutionStatus::ValidationRejected);
    assert!(second.cache_hit);
    assert_eq!(first.stderr, second.stderr);

    let metrics = engine.metrics().await;
    assert_eq!(metrics.sandboxes_spawned, 0);
    assert_eq!(metrics.cached_reports, 1);
}

#[tokio::test]
async fn cache_bypass_never_stores_or_serves() {
    let engine = engine();
    let mut request = python("import subprocess\n");
    request.use_cache = false;

    let first = engine.execute(request.clone()).await;
    let second = engine.execute(request).await;

    assert!(!first.cache_hit);
    assert!(!second.cache_hit);
    assert_eq!(engine.metrics().await.cached_reports, 0);
}

#[tokio::test]
async fn exercise_invalidation_busts_cached_reports() {
    let engine = engine();
    let exercise = Uuid::new_v4();
    let mut request = python("import subprocess\n");
    request.exercise_id = Some(exercise);

    engine.execute(request.clone()).await;
    assert_eq!(engine.invalidate_exercise(exercise).await, 1);

    let after = engine.execute(request).await;
    assert!(!after.cache_hit, "invalidated entry must recompute");
}

#[tokio::test]
async fn clear_cache_empties_the_store() {
    let engine = engine();
    engine.execute(python("import subprocess\n")).await;
    assert_eq!(engine.metrics().await.cached_reports, 1);
    engine.clear_cache().await;
    assert_eq!(engine.metrics().await.cached_reports, 0);
}

// ---------------------------------------------------------------------
// Docker integration. Each test makes its own engine, so counters start
// at zero.
// ---------------------------------------------------------------------

#[tokio::test]
#[ignore] // requires a Docker daemon and the python:3.11-slim image
async fn plain_print_succeeds() {
    let engine = engine();
    let report = engine.execute(python("print('hello')\n")).await;

    assert_eq!(report.status, ExecutionStatus::Success, "stderr: {}", report.stderr);
    assert_eq!(report.stdout.trim(), "hello");
    assert_eq!(report.exit_code, Some(0));
    assert!(report.test_results.is_empty());
    assert!(report.duration_ms > 0);
}

#[tokio::test]
#[ignore] // requires a Docker daemon and the python:3.11-slim image
async fn add_function_passes_its_case() {
    let engine = engine();
    let report = engine.execute(add_request()).await;

    assert_eq!(report.status, ExecutionStatus::Success, "stderr: {}", report.stderr);
    assert_eq!(report.test_results.len(), 1);
    assert!(report.test_results[0].passed);
    assert_eq!(report.test_results[0].actual_output, "5");
    assert!(!report.cache_hit);
}

#[tokio::test]
#[ignore] // requires a Docker daemon and the python:3.11-slim image
async fn wrong_answer_reports_the_actual_output() {
    let engine = engine();
    let mut request = add_request();
    request.source_code = "def add(a, b):\n    return a - b\n".to_string();

    let report = engine.execute(request).await;

    assert_eq!(report.status, ExecutionStatus::TestFailures);
    assert!(!report.test_results[0].passed);
    assert_eq!(report.test_results[0].actual_output, "-1");
    assert_eq!(report.test_results[0].expected_output, "5");
}

#[tokio::test]
#[ignore] // requires a Docker daemon and the python:3.11-slim image
async fn crashing_submission_is_a_runtime_error() {
    let engine = engine();
    let report = engine
        .execute(python("raise ValueError('boom')\n"))
        .await;

    assert_eq!(report.status, ExecutionStatus::RuntimeError);
    assert!(report.stderr.contains("ValueError"));
    assert_eq!(report.exit_code, Some(1));
}

#[tokio::test]
#[ignore] // requires a Docker daemon and the python:3.11-slim image
async fn failing_assertion_with_empty_expectation_is_reported() {
    let engine = engine();
    let mut request = python("def add(a, b):\n    return a - b\n");
    request.test_cases.push(TestCase {
        name: "sums correctly".to_string(),
        test_code: "assert add(2, 3) == 5".to_string(),
        expected_output: String::new(),
    });

    let report = engine.execute(request).await;

    assert_eq!(report.status, ExecutionStatus::TestFailures);
    assert!(!report.test_results[0].passed);
    assert!(report.stderr.contains("AssertionError"));
}

#[tokio::test]
#[ignore] // requires a Docker daemon and the python:3.11-slim image
async fn submission_crash_fails_every_case() {
    let engine = engine();
    let mut request = add_request();
    request.source_code = "raise RuntimeError('no definitions')\n".to_string();

    let report = engine.execute(request).await;

    assert_eq!(report.status, ExecutionStatus::RuntimeError);
    assert_eq!(report.test_results.len(), 1);
    assert!(!report.test_results[0].passed);
    assert_eq!(report.test_results[0].actual_output, "");
}

#[tokio::test]
#[ignore] // requires a Docker daemon and the python:3.11-slim image
async fn timeout_is_enforced_promptly() {
    let engine = engine();
    let mut request = python("while True:\n    pass\n");
    request.time_limit_seconds = 1;

    let report = engine.execute(request).await;

    assert_eq!(report.status, ExecutionStatus::Timeout);
    assert!(report.stderr.contains("time limit exceeded"));
    assert!(report.exit_code.is_none());
    // killed at the 1s limit plus scheduling margin, not at some larger
    // default
    assert!(report.duration_ms >= 900, "duration: {}ms", report.duration_ms);
    assert!(report.duration_ms < 3_000, "duration: {}ms", report.duration_ms);

    assert_eq!(engine.metrics().await.active_sandboxes, 0);
}

#[tokio::test]
#[ignore] // requires a Docker daemon and the python:3.11-slim image
async fn partial_output_survives_a_timeout() {
    let engine = engine();
    let mut request = python("print('started', flush=True)\nwhile True:\n    pass\n");
    request.time_limit_seconds = 1;

    let report = engine.execute(request).await;

    assert_eq!(report.status, ExecutionStatus::Timeout);
    assert!(report.stdout.contains("started"));
}

#[tokio::test]
#[ignore] // requires a Docker daemon and the python:3.11-slim image
async fn memory_ceiling_kills_the_run() {
    let engine = engine();
    let mut request = python(
        "data = []\nwhile True:\n    data.append(bytearray(1024 * 1024))\n",
    );
    request.memory_limit_bytes = 32 * 1024 * 1024;
    request.time_limit_seconds = 15;

    let report = engine.execute(request).await;

    assert_eq!(
        report.status,
        ExecutionStatus::MemoryExceeded,
        "exit: {:?}, stderr: {}",
        report.exit_code,
        report.stderr
    );
    assert!(report.stderr.contains("memory limit exceeded"));
}

#[tokio::test]
#[ignore] // requires a Docker daemon and the python:3.11-slim image
async fn identical_submissions_hit_the_cache() {
    let engine = engine();
    let request = add_request();

    let first = engine.execute(request.clone()).await;
    let second = engine.execute(request).await;

    assert_eq!(first.status, ExecutionStatus::Success);
    assert!(!first.cache_hit);
    assert!(second.cache_hit);

    // identical content apart from the hit flag
    let mut first_normalized = first.clone();
    first_normalized.cache_hit = second.cache_hit;
    assert_eq!(first_normalized, second);

    assert_eq!(engine.metrics().await.sandboxes_spawned, 1);
}

#[tokio::test]
#[ignore] // requires a Docker daemon and the python:3.11-slim image
async fn concurrent_identical_submissions_share_one_sandbox() {
    let engine = engine();
    // slow enough that all four calls overlap the same in-flight run
    let request = python(
        "total = 0\nfor i in range(3 * 10 ** 6):\n    total += i\nprint(total)\n",
    );

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let engine = engine.clone();
        let request = request.clone();
        tasks.push(tokio::spawn(async move { engine.execute(request).await }));
    }

    let mut reports = Vec::new();
    for task in tasks {
        reports.push(task.await.expect("task completes"));
    }

    assert!(reports
        .iter()
        .all(|r| r.status == ExecutionStatus::Success));
    assert!(reports.windows(2).all(|p| p[0].stdout == p[1].stdout));
    assert_eq!(reports.iter().filter(|r| !r.cache_hit).count(), 1);
    assert_eq!(engine.metrics().await.sandboxes_spawned, 1);
}

#[tokio::test]
#[ignore] // requires a Docker daemon and the python:3.11-slim image
async fn no_sandboxes_leak_across_outcomes() {
    let engine = engine();

    let mut timeout_request = python("while True:\n    pass\n");
    timeout_request.time_limit_seconds = 1;
    let runs = vec![
        python("print('ok')\n"),
        python("raise ValueError('boom')\n"),
        timeout_request,
        add_request(),
    ];

    for mut request in runs {
        request.use_cache = false;
        engine.execute(request).await;
        assert_eq!(engine.metrics().await.active_sandboxes, 0);
    }

    let metrics = engine.metrics().await;
    assert_eq!(metrics.sandboxes_spawned, 4);
    assert_eq!(metrics.active_sandboxes, 0);
}
