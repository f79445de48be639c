//! Value types shared across the execution engine.
//!
//! Everything here is plain data: requests and test definitions flow in,
//! reports flow out, and nothing holds a live resource. The one piece of
//! behavior is [`ExecutionRequest::fingerprint`], which derives the
//! content-addressed cache key for a request.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config;

/// Languages the engine knows how to execute.
///
/// Single variant today. An enum rather than a free-form string keeps the
/// interpreter invocation, script naming and validator dispatch for each
/// language in one place, and makes adding a language a compile-checked
/// change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
}

impl Language {
    /// Command line that runs the staged script inside the sandbox.
    pub(crate) fn run_command(&self, script_path: &str) -> Vec<String> {
        match self {
            // -I isolates from user site-packages and env vars,
            // -B suppresses .pyc writes on the read-only tree,
            // -u keeps stdout/stderr unbuffered so partial output survives
            // a mid-run kill.
            Language::Python => vec![
                "python3".to_string(),
                "-I".to_string(),
                "-B".to_string(),
                "-u".to_string(),
                script_path.to_string(),
            ],
        }
    }

    /// Filename the submission is staged under in the scratch mount.
    pub(crate) fn script_filename(&self) -> &'static str {
        match self {
            Language::Python => "main.py",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::Python => write!(f, "python"),
        }
    }
}

/// One instructor-defined check, executed after the submitted code in the
/// same interpreter namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    /// Display name, e.g. `"adds two positives"`.
    pub name: String,
    /// Code appended after the submission, e.g. `print(add(2, 3))`.
    pub test_code: String,
    /// What the case's stdout segment must equal after normalization.
    pub expected_output: String,
}

/// One submission to execute, assembled by the caller from a learner's
/// code plus the exercise definition. The engine never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub source_code: String,
    pub language: Language,
    /// Wall-clock budget in seconds; clamped against the configured maximum.
    #[serde(default = "default_time_limit_seconds")]
    pub time_limit_seconds: u64,
    /// Memory ceiling in bytes; clamped against the configured maximum.
    #[serde(default = "default_memory_limit_bytes")]
    pub memory_limit_bytes: u64,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
    /// When false the run bypasses the result cache entirely: no lookup,
    /// no store, no request coalescing.
    #[serde(default = "default_use_cache")]
    pub use_cache: bool,
    /// Cache tag only: lets the caller bust every cached report for an
    /// exercise after its definition changes. Not part of the fingerprint.
    #[serde(default)]
    pub exercise_id: Option<Uuid>,
}

fn default_time_limit_seconds() -> u64 {
    config::DEFAULT_TIME_LIMIT_SECONDS
}

fn default_memory_limit_bytes() -> u64 {
    config::DEFAULT_MEMORY_LIMIT_BYTES
}

fn default_use_cache() -> bool {
    true
}

impl ExecutionRequest {
    /// A request with default limits, caching enabled and no test cases.
    pub fn new(language: Language, source_code: impl Into<String>) -> Self {
        Self {
            source_code: source_code.into(),
            language,
            time_limit_seconds: default_time_limit_seconds(),
            memory_limit_bytes: default_memory_limit_bytes(),
            test_cases: Vec::new(),
            use_cache: default_use_cache(),
            exercise_id: None,
        }
    }

    /// Deterministic cache key over everything that can change the outcome:
    /// language, normalized source, the ordered test definitions and the
    /// resource ceiling actually applied. `use_cache` and `exercise_id` are
    /// deliberately excluded; neither affects what the sandbox produces.
    pub fn fingerprint(&self, ceiling: &ResourceCeiling) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.language.to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(normalize_source(&self.source_code).as_bytes());
        for case in &self.test_cases {
            hasher.update([0u8]);
            hasher.update(case.name.as_bytes());
            hasher.update([0u8]);
            hasher.update(case.test_code.as_bytes());
            hasher.update([0u8]);
            hasher.update(case.expected_output.as_bytes());
        }
        hasher.update([0u8]);
        hasher.update(ceiling.time_limit_seconds.to_le_bytes());
        hasher.update(ceiling.memory_bytes.to_le_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Normalization applied to source before fingerprinting: line endings and
/// outer whitespace only. Anything deeper (formatting, comments) changes
/// the program text learners submitted, so it stays significant.
pub(crate) fn normalize_source(source: &str) -> String {
    source.replace("\r\n", "\n").trim().to_string()
}

/// Hard limits applied to one sandbox, derived from the request clamped
/// against [`EngineConfig`](crate::config::EngineConfig) maxima. This is
/// what the fingerprint covers, so a request that asks for more than the
/// maximum hashes the same as one that asks for exactly the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCeiling {
    pub time_limit_seconds: u64,
    pub memory_bytes: u64,
    pub nano_cpus: i64,
    pub pids_limit: i64,
    pub nofile_limit: i64,
}

impl ResourceCeiling {
    pub fn time_limit(&self) -> Duration {
        Duration::from_secs(self.time_limit_seconds)
    }
}

/// Terminal classification of one execution attempt. Exactly one status
/// per report; precedence when several could apply is timeout, then
/// memory, then runtime error, then test outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Code ran to completion and every test case passed.
    Success,
    /// Code ran to completion but at least one test case failed.
    TestFailures,
    /// Killed at the wall-clock limit.
    Timeout,
    /// Killed by the memory ceiling.
    MemoryExceeded,
    /// Static validation refused the submission; nothing was executed.
    ValidationRejected,
    /// The code crashed, or the sandbox runtime failed operationally.
    RuntimeError,
    /// The engine itself failed unexpectedly.
    InternalError,
}

impl ExecutionStatus {
    /// Whether a report with this status may be stored in the result cache.
    ///
    /// Only verdicts about the code itself are cacheable. `RuntimeError`
    /// covers transient operational failures (pool saturation, daemon
    /// hiccups) that the caller is expected to retry, and `InternalError`
    /// is unexpected by definition; caching either would pin a transient
    /// failure onto a fingerprint for the full TTL.
    pub fn is_cacheable(&self) -> bool {
        !matches!(
            self,
            ExecutionStatus::RuntimeError | ExecutionStatus::InternalError
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::TestFailures => "test_failures",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::MemoryExceeded => "memory_exceeded",
            ExecutionStatus::ValidationRejected => "validation_rejected",
            ExecutionStatus::RuntimeError => "runtime_error",
            ExecutionStatus::InternalError => "internal_error",
        };
        write!(f, "{s}")
    }
}

/// Outcome of a single test case within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCaseResult {
    pub name: String,
    pub passed: bool,
    /// The case's normalized stdout segment; empty if the segment never
    /// appeared (crash before the case, or mid-case kill).
    pub actual_output: String,
    pub expected_output: String,
}

/// Everything the caller learns about one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub status: ExecutionStatus,
    /// Combined stdout of the whole run, markers included, capped at the
    /// stream limit. Preserved even for timeouts and kills.
    pub stdout: String,
    pub stderr: String,
    /// Exit code of the interpreter process; `None` when it never exited
    /// on its own (timeout) or never ran (rejection, spawn failure).
    pub exit_code: Option<i64>,
    /// Wall-clock duration of the in-sandbox run. Zero when nothing ran.
    pub duration_ms: u64,
    /// One entry per requested test case, in request order. Empty when the
    /// request carried no test cases.
    pub test_results: Vec<TestCaseResult>,
    /// True when this report was served from the cache (or joined onto an
    /// in-flight identical run) rather than computed for this call.
    pub cache_hit: bool,
}

impl ExecutionReport {
    /// Report for a submission refused by static validation.
    pub(crate) fn rejected(violations: &[String]) -> Self {
        let mut stderr = String::from("submission rejected by static validation:");
        for violation in violations {
            stderr.push_str("\n  - ");
            stderr.push_str(violation);
        }
        Self {
            status: ExecutionStatus::ValidationRejected,
            stdout: String::new(),
            stderr,
            exit_code: None,
            duration_ms: 0,
            test_results: Vec::new(),
            cache_hit: false,
        }
    }

    /// Report for an operational failure the caller may retry.
    pub(crate) fn runtime_error(message: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::RuntimeError,
            stdout: String::new(),
            stderr: message.into(),
            exit_code: None,
            duration_ms: 0,
            test_results: Vec::new(),
            cache_hit: false,
        }
    }

    /// Report for an unexpected engine-side failure.
    pub(crate) fn internal_error(message: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::InternalError,
            stdout: String::new(),
            stderr: message.into(),
            exit_code: None,
            duration_ms: 0,
            test_results: Vec::new(),
            cache_hit: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn ceiling(request: &ExecutionRequest) -> ResourceCeiling {
        EngineConfig::default().ceiling_for(request)
    }

    fn request_with_case() -> ExecutionRequest {
        let mut request = ExecutionRequest::new(
            Language::Python,
            "def add(a, b):\n    return a + b\n",
        );
        request.test_cases.push(TestCase {
            name: "adds".to_string(),
            test_code: "print(add(2, 3))".to_string(),
            expected_output: "5".to_string(),
        });
        request
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let request = request_with_case();
        let a = request.fingerprint(&ceiling(&request));
        let b = request.fingerprint(&ceiling(&request));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn fingerprint_changes_with_source() {
        let request = request_with_case();
        let mut changed = request.clone();
        changed.source_code.push_str("\n# extra comment");
        assert_ne!(
            request.fingerprint(&ceiling(&request)),
            changed.fingerprint(&ceiling(&changed))
        );
    }

    #[test]
    fn fingerprint_changes_with_test_cases() {
        let request = request_with_case();
        let mut changed = request.clone();
        changed.test_cases[0].expected_output = "6".to_string();
        assert_ne!(
            request.fingerprint(&ceiling(&request)),
            changed.fingerprint(&ceiling(&changed))
        );
    }

    #[test]
    fn fingerprint_changes_with_effective_limits() {
        let request = request_with_case();
        let mut changed = request.clone();
        changed.time_limit_seconds = 5;
        assert_ne!(
            request.fingerprint(&ceiling(&request)),
            changed.fingerprint(&ceiling(&changed))
        );
    }

    #[test]
    fn fingerprint_ignores_cache_controls() {
        let request = request_with_case();
        let mut changed = request.clone();
        changed.use_cache = false;
        changed.exercise_id = Some(Uuid::new_v4());
        assert_eq!(
            request.fingerprint(&ceiling(&request)),
            changed.fingerprint(&ceiling(&changed))
        );
    }

    #[test]
    fn fingerprint_normalizes_line_endings() {
        let unix = ExecutionRequest::new(Language::Python, "print('hi')\n");
        let dos = ExecutionRequest::new(Language::Python, "print('hi')\r\n");
        assert_eq!(
            unix.fingerprint(&ceiling(&unix)),
            dos.fingerprint(&ceiling(&dos))
        );
    }

    #[test]
    fn limit_overrides_beyond_max_hash_like_the_max() {
        let request = request_with_case();
        let mut at_max = request.clone();
        at_max.time_limit_seconds = crate::config::MAX_TIME_LIMIT_SECONDS;
        let mut beyond = request.clone();
        beyond.time_limit_seconds = crate::config::MAX_TIME_LIMIT_SECONDS * 10;
        assert_eq!(
            at_max.fingerprint(&ceiling(&at_max)),
            beyond.fingerprint(&ceiling(&beyond))
        );
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&ExecutionStatus::MemoryExceeded).unwrap();
        assert_eq!(json, "\"memory_exceeded\"");
        let back: ExecutionStatus = serde_json::from_str("\"validation_rejected\"").unwrap();
        assert_eq!(back, ExecutionStatus::ValidationRejected);
    }

    #[test]
    fn request_deserializes_with_defaults() {
        let json = r#"{"source_code": "print(1)", "language": "python"}"#;
        let request: ExecutionRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.time_limit_seconds, 30);
        assert_eq!(request.memory_limit_bytes, 256 * 1024 * 1024);
        assert!(request.use_cache);
        assert!(request.test_cases.is_empty());
        assert!(request.exercise_id.is_none());
    }

    #[test]
    fn cacheable_statuses_exclude_operational_failures() {
        assert!(ExecutionStatus::Success.is_cacheable());
        assert!(ExecutionStatus::TestFailures.is_cacheable());
        assert!(ExecutionStatus::Timeout.is_cacheable());
        assert!(ExecutionStatus::MemoryExceeded.is_cacheable());
        assert!(ExecutionStatus::ValidationRejected.is_cacheable());
        assert!(!ExecutionStatus::RuntimeError.is_cacheable());
        assert!(!ExecutionStatus::InternalError.is_cacheable());
    }

    #[test]
    fn rejected_report_lists_violations() {
        let report = ExecutionReport::rejected(&[
            "import of module 'socket' is not permitted".to_string(),
            "disallowed call to eval()".to_string(),
        ]);
        assert_eq!(report.status, ExecutionStatus::ValidationRejected);
        assert!(report.stderr.contains("socket"));
        assert!(report.stderr.contains("eval()"));
        assert_eq!(report.duration_ms, 0);
        assert!(report.exit_code.is_none());
    }
}
