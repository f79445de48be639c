//! Test harness: wraps a submission with its instructor test cases and
//! scores the run's stdout.
//!
//! The submission runs first at module scope; each case then executes in
//! the same namespace between sentinel marker lines carrying a per-run
//! nonce. Submitted code never sees the nonce through any allowlisted
//! channel, so it cannot fabricate a marker that parses, and each case is
//! shielded by try/except so one raising case cannot take down the rest:
//! the except arm sends the traceback to stderr and prints a crash
//! sentinel that fails that case no matter what output it expected.

use uuid::Uuid;

use crate::session::ExecutionSession;
use crate::types::{ExecutionReport, ExecutionRequest, ExecutionStatus, TestCaseResult};

const MARKER_BEGIN_SUFFIX: &str = ":begin--";
const MARKER_END_SUFFIX: &str = ":end--";
const MARKER_CRASHED_SUFFIX: &str = ":crashed--";

pub(crate) struct TestHarness<'a> {
    session: ExecutionSession<'a>,
}

impl<'a> TestHarness<'a> {
    pub fn new(session: ExecutionSession<'a>) -> Self {
        Self { session }
    }

    /// Compose, run and score one request.
    pub async fn evaluate(&self, request: &ExecutionRequest) -> ExecutionReport {
        let nonce = Uuid::new_v4();
        let program = compose_script(request, &nonce);
        let report = self.session.run(request, &program).await;
        score(request, &nonce, report)
    }
}

fn marker_prefix(nonce: &Uuid) -> String {
    format!("--crucible:{nonce}:")
}

fn begin_marker(nonce: &Uuid, index: usize) -> String {
    format!("{}{}{}", marker_prefix(nonce), index, MARKER_BEGIN_SUFFIX)
}

fn end_marker(nonce: &Uuid, index: usize) -> String {
    format!("{}{}{}", marker_prefix(nonce), index, MARKER_END_SUFFIX)
}

fn crashed_marker(nonce: &Uuid, index: usize) -> String {
    format!("{}{}{}", marker_prefix(nonce), index, MARKER_CRASHED_SUFFIX)
}

/// Build the composite script: submission first, then each test case
/// between its markers. With no test cases the submission runs bare.
fn compose_script(request: &ExecutionRequest, nonce: &Uuid) -> String {
    let mut script = String::with_capacity(request.source_code.len() + 256);
    script.push_str(&request.source_code);
    if !script.ends_with('\n') {
        script.push('\n');
    }
    if request.test_cases.is_empty() {
        return script;
    }

    // Obscured aliases keep the harness working even if the submission
    // shadows `sys` or `traceback` style names.
    script.push_str("\nimport sys as _cr_sys\nimport traceback as _cr_tb\n");
    for (index, case) in request.test_cases.iter().enumerate() {
        // {:?} produces a double-quoted, escaped literal that is valid
        // Python for the ASCII marker text.
        script.push_str(&format!(
            "print({:?}, flush=True)\n",
            begin_marker(nonce, index)
        ));
        script.push_str("try:\n");
        let mut wrote_body = false;
        for line in case.test_code.lines() {
            script.push_str("    ");
            script.push_str(line);
            script.push('\n');
            wrote_body = true;
        }
        if !wrote_body {
            script.push_str("    pass\n");
        }
        script.push_str("except Exception:\n");
        script.push_str("    _cr_tb.print_exc(file=_cr_sys.stderr)\n");
        script.push_str(&format!(
            "    print({:?}, flush=True)\n",
            crashed_marker(nonce, index)
        ));
        script.push_str(&format!(
            "print({:?}, flush=True)\n",
            end_marker(nonce, index)
        ));
    }
    script
}

/// One case's captured stdout. `crashed` is set when the case's except
/// arm ran, which fails the case no matter what the segment contains.
#[derive(Debug, Clone)]
struct CaseSegment {
    text: String,
    crashed: bool,
}

/// Extract each case's stdout segment by scanning for exact marker lines.
/// Anything outside a matched begin/end pair (learner prints, noise,
/// forged markers with the wrong nonce) is ignored rather than guessed
/// at; a case whose end marker never appeared yields `None`.
fn split_segments(stdout: &str, nonce: &Uuid, cases: usize) -> Vec<Option<CaseSegment>> {
    let prefix = marker_prefix(nonce);
    let parse = |line: &str, suffix: &str| -> Option<usize> {
        line.trim()
            .strip_prefix(prefix.as_str())?
            .strip_suffix(suffix)?
            .parse()
            .ok()
    };

    let mut segments: Vec<Option<CaseSegment>> = vec![None; cases];
    let mut crashed = vec![false; cases];
    let mut current: Option<(usize, String)> = None;
    for line in stdout.lines() {
        if let Some(index) = parse(line, MARKER_BEGIN_SUFFIX) {
            if index < cases {
                current = Some((index, String::new()));
            }
            continue;
        }
        if let Some(index) = parse(line, MARKER_CRASHED_SUFFIX) {
            if index < cases {
                crashed[index] = true;
            }
            continue;
        }
        if let Some(index) = parse(line, MARKER_END_SUFFIX) {
            if let Some((open, buffer)) = current.take() {
                if open == index && index < cases {
                    segments[index] = Some(CaseSegment {
                        text: buffer,
                        crashed: crashed[index],
                    });
                }
            }
            continue;
        }
        if let Some((_, buffer)) = current.as_mut() {
            if !buffer.is_empty() {
                buffer.push('\n');
            }
            buffer.push_str(line);
        }
    }
    segments
}

/// Case-sensitive comparison after newline normalization and outer
/// trimming: `"5\n"` matches `"5"`, `"Hello"` never matches `"hello"`.
fn normalize_output(text: &str) -> String {
    text.replace("\r\n", "\n").trim().to_string()
}

/// Fold test outcomes into the raw report.
///
/// Passes are only awarded off a cleanly completed run. On timeout,
/// memory kill or crash, every case is marked failed, though segments
/// that did make it to stdout are still surfaced as the actual output.
/// A case whose own body raised is failed outright via the crash
/// sentinel; without it, an empty expectation would match the empty
/// segment the except arm leaves behind.
fn score(request: &ExecutionRequest, nonce: &Uuid, mut report: ExecutionReport) -> ExecutionReport {
    if request.test_cases.is_empty() {
        return report;
    }
    if report.status == ExecutionStatus::ValidationRejected {
        // Nothing was executed; there are no outcomes to report.
        return report;
    }

    let segments = split_segments(&report.stdout, nonce, request.test_cases.len());

    if report.status != ExecutionStatus::Success {
        report.test_results = request
            .test_cases
            .iter()
            .enumerate()
            .map(|(index, case)| TestCaseResult {
                name: case.name.clone(),
                passed: false,
                actual_output: segments[index]
                    .as_ref()
                    .map(|segment| normalize_output(&segment.text))
                    .unwrap_or_default(),
                expected_output: case.expected_output.clone(),
            })
            .collect();
        return report;
    }

    let mut all_passed = true;
    report.test_results = request
        .test_cases
        .iter()
        .enumerate()
        .map(|(index, case)| {
            let actual = segments[index]
                .as_ref()
                .map(|segment| normalize_output(&segment.text))
                .unwrap_or_default();
            let passed = match &segments[index] {
                Some(segment) if !segment.crashed => {
                    actual == normalize_output(&case.expected_output)
                }
                _ => false,
            };
            all_passed &= passed;
            TestCaseResult {
                name: case.name.clone(),
                passed,
                actual_output: actual,
                expected_output: case.expected_output.clone(),
            }
        })
        .collect();

    report.status = if all_passed {
        ExecutionStatus::Success
    } else {
        ExecutionStatus::TestFailures
    };
    report
}
