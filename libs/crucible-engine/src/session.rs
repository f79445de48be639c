//! One execution from request to raw report.
//!
//! The session owns the lifecycle invariant: validate before spawning,
//! spawn at most one sandbox, and tear it down on every path out,
//! including timeouts and runtime failures. Test scoring happens above,
//! in the harness; status precedence for the run itself is decided here.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::sandbox::{DockerRuntime, ExecOutput, SandboxHandle, SCRATCH_DIR};
use crate::types::{ExecutionReport, ExecutionRequest, ExecutionStatus};
use crate::validator;

/// Submissions larger than this are refused before anything is spawned.
pub(crate) const MAX_SOURCE_CODE_BYTES: usize = 1024 * 1024;

/// Exit code the runtime reports when the cgroup OOM killer SIGKILLed the
/// process under its hard memory ceiling.
const OOM_EXIT_CODE: i64 = 137;

const SEGFAULT_EXIT_CODE: i64 = 139;

/// Budget for staging the program into scratch, separate from the
/// learner-visible time limit.
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) struct ExecutionSession<'a> {
    runtime: &'a DockerRuntime,
    config: &'a EngineConfig,
}

impl<'a> ExecutionSession<'a> {
    pub fn new(runtime: &'a DockerRuntime, config: &'a EngineConfig) -> Self {
        Self { runtime, config }
    }

    /// Run `program` (the harness-assembled script) under `request`'s
    /// limits. The returned report carries no test scoring; the harness
    /// fills that in from the raw streams.
    #[tracing::instrument(skip_all, fields(language = %request.language))]
    pub async fn run(&self, request: &ExecutionRequest, program: &str) -> ExecutionReport {
        // Size guardrail first: no point pattern-scanning a submission we
        // will not run.
        if request.source_code.len() > MAX_SOURCE_CODE_BYTES {
            return ExecutionReport::rejected(&[format!(
                "source code exceeds the {MAX_SOURCE_CODE_BYTES} byte limit"
            )]);
        }
        // Static validation covers the learner's source, not the wrapper
        // we generate around it.
        let verdict = validator::validate(request.language, &request.source_code);
        if !verdict.allowed {
            info!(
                violations = verdict.violations.len(),
                "submission rejected by static validation"
            );
            return ExecutionReport::rejected(&verdict.violations);
        }

        let ceiling = self.config.ceiling_for(request);
        let mut handle = match self.runtime.spawn(ceiling).await {
            Ok(handle) => handle,
            Err(EngineError::ResourceExhausted) => {
                warn!("sandbox pool at capacity; failing the request fast");
                return ExecutionReport::runtime_error(
                    "sandbox pool at capacity; retry shortly",
                );
            }
            Err(e) => {
                error!(error = %e, "failed to provision a sandbox");
                return ExecutionReport::runtime_error(format!(
                    "failed to provision a sandbox: {e}"
                ));
            }
        };

        let outcome = self.execute_program(request, &handle, program).await;

        // Teardown happens before the report leaves, on every path. A
        // failed removal is an operational alert, not the caller's
        // problem; the handle's Drop backstop will retry it.
        if let Err(e) = self.runtime.destroy(&mut handle).await {
            error!(container = %handle.name, error = %e, "sandbox teardown failed after run");
        }

        match outcome {
            Ok(report) => report,
            Err(EngineError::Internal(message)) => {
                error!(error = %message, "execution failed inside the engine");
                ExecutionReport::internal_error(message)
            }
            Err(e) => {
                error!(error = %e, "sandbox execution failed");
                ExecutionReport::runtime_error(e.to_string())
            }
        }
    }

    async fn execute_program(
        &self,
        request: &ExecutionRequest,
        handle: &SandboxHandle,
        program: &str,
    ) -> Result<ExecutionReport, EngineError> {
        let script_path = format!("{}/{}", SCRATCH_DIR, request.language.script_filename());

        // Staged through the exec's attached stdin rather than an argv
        // embedding, so source size is bounded by our own guardrail and
        // not the kernel's argument limit.
        let upload = self
            .runtime
            .exec(
                handle,
                vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    format!("cat > {script_path}"),
                ],
                Some(program.as_bytes()),
                Instant::now() + UPLOAD_TIMEOUT,
            )
            .await?;
        if upload.timed_out || upload.exit_code != Some(0) {
            return Err(EngineError::Internal(format!(
                "failed to stage program in scratch (exit {:?}): {}",
                upload.exit_code,
                upload.stderr.trim()
            )));
        }

        let started = Instant::now();
        let deadline = started + handle.ceiling.time_limit();
        let run = self
            .runtime
            .exec(handle, request.language.run_command(&script_path), None, deadline)
            .await?;
        let duration_ms = started.elapsed().as_millis() as u64;

        Ok(classify(run, duration_ms))
    }
}

/// Map a raw exec outcome onto the report taxonomy. Precedence: the
/// host-side deadline wins over everything, then the exit code decides.
fn classify(run: ExecOutput, duration_ms: u64) -> ExecutionReport {
    let ExecOutput {
        stdout,
        mut stderr,
        exit_code,
        timed_out,
    } = run;

    let status = if timed_out {
        append_note(&mut stderr, "[killed: time limit exceeded]");
        ExecutionStatus::Timeout
    } else {
        match exit_code {
            Some(0) => ExecutionStatus::Success,
            Some(OOM_EXIT_CODE) => {
                append_note(&mut stderr, "[killed: memory limit exceeded]");
                ExecutionStatus::MemoryExceeded
            }
            Some(SEGFAULT_EXIT_CODE) => {
                append_note(&mut stderr, "[crashed: segmentation fault]");
                ExecutionStatus::RuntimeError
            }
            _ => ExecutionStatus::RuntimeError,
        }
    };

    ExecutionReport {
        status,
        stdout,
        stderr,
        exit_code,
        duration_ms,
        test_results: Vec::new(),
        cache_hit: false,
    }
}

fn append_note(stderr: &mut String, note: &str) {
    if !stderr.is_empty() {
        stderr.push('\n');
    }
    stderr.push_str(note);
}
