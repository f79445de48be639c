//! Container runtime adapter.
//!
//! Everything that talks to Docker lives here: image pulls, sandbox
//! creation with the full hardening profile, exec with host-side
//! deadlines, and teardown. Layers above see [`SandboxHandle`] and
//! [`ExecOutput`], never bollard types.
//!
//! Hardening applied to every sandbox:
//! - no network interface at all
//! - read-only root filesystem, with one writable scratch tmpfs
//! - unprivileged user (`nobody`), all capabilities dropped,
//!   no-new-privileges
//! - hard ceilings on memory (no swap headroom), CPU, process count and
//!   open file descriptors

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, ResourcesUlimits};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::pool::{SandboxPermit, SandboxPool};
use crate::types::ResourceCeiling;

/// Writable scratch mount inside every sandbox; the submission is staged
/// here and it is also the working directory.
pub(crate) const SCRATCH_DIR: &str = "/sandbox";

/// uid:gid of `nobody` in the base images we run.
const SANDBOX_USER: &str = "65534:65534";

/// The keep-alive `sleep` outlives the deadline by this much, so even a
/// sandbox that somehow escapes teardown exits on its own.
const KEEPALIVE_SLACK_SECONDS: u64 = 60;

/// Per-stream capture cap. Exec output beyond this is discarded, with a
/// note appended so the truncation is visible in the report.
const MAX_STREAM_BYTES: usize = 256 * 1024;

const TRUNCATION_NOTE: &str = "\n[output truncated]";

/// Raw outcome of one exec inside a sandbox.
#[derive(Debug)]
pub(crate) struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process never reported an exit (timed out, or the
    /// runtime lost it).
    pub exit_code: Option<i64>,
    /// True when the host-side deadline fired first. Captured output up
    /// to that point is preserved.
    pub timed_out: bool,
}

/// One live sandbox, exclusively owned by the session that spawned it.
///
/// Normal teardown goes through [`DockerRuntime::destroy`]; `Drop` is a
/// backstop that force-removes the container if a panic or early return
/// ever skips it, so no exit path leaks a container or its pool slot.
pub(crate) struct SandboxHandle {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub ceiling: ResourceCeiling,
    docker: Docker,
    destroyed: bool,
    _permit: SandboxPermit,
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        if self.destroyed {
            return;
        }
        warn!(container = %self.name, "sandbox dropped without teardown; force removing");
        let docker = self.docker.clone();
        let id = self.id.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            match docker.remove_container(&id, Some(options)).await {
                Ok(()) => {}
                Err(e) if is_gone(&e) => {}
                Err(e) => error!(container = %name, error = %e, "backstop removal failed"),
            }
        });
    }
}

/// Thin adapter over the Docker daemon. Cheap to clone; clones share the
/// client cell, the pool and the spawn counter.
#[derive(Clone)]
pub(crate) struct DockerRuntime {
    docker: Arc<OnceCell<Docker>>,
    config: EngineConfig,
    pool: SandboxPool,
    spawned_total: Arc<AtomicU64>,
}

impl DockerRuntime {
    /// Build the runtime without touching the daemon. The client is
    /// connected on first use ([`connect`](Self::connect)), so a host
    /// with no Docker socket can still construct the engine and serve
    /// health checks, rejections and cached reports.
    pub fn new(config: EngineConfig) -> Self {
        let pool = SandboxPool::new(config.max_sandboxes);
        Self {
            docker: Arc::new(OnceCell::new()),
            config,
            pool,
            spawned_total: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Connect with the environment's defaults (unix socket, or
    /// `DOCKER_HOST` when set) on first use and cache the client. A
    /// failure is not sticky: the cell stays empty and the next call
    /// retries, so a daemon brought up after the engine is picked up.
    async fn connect(&self) -> Result<&Docker, EngineError> {
        self.docker
            .get_or_try_init(|| async { Docker::connect_with_local_defaults() })
            .await
            .map_err(EngineError::from)
    }

    pub async fn is_available(&self) -> bool {
        match self.connect().await {
            Ok(docker) => docker.ping().await.is_ok(),
            Err(_) => false,
        }
    }

    pub fn pool(&self) -> &SandboxPool {
        &self.pool
    }

    /// Sandboxes successfully started since engine construction.
    pub fn spawned_total(&self) -> u64 {
        self.spawned_total.load(Ordering::Relaxed)
    }

    async fn ensure_image(&self, docker: &Docker) -> Result<(), EngineError> {
        let image = &self.config.sandbox_image;
        if docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        info!(image = %image, "sandbox image not present locally; pulling");
        let options = CreateImageOptions {
            from_image: image.as_str(),
            ..Default::default()
        };
        let mut pull = docker.create_image(Some(options), None, None);
        while let Some(progress) = pull.next().await {
            progress?;
        }
        info!(image = %image, "sandbox image pulled");
        Ok(())
    }

    /// Admit a pool slot, then create and start a hardened container.
    ///
    /// The container idles on a bounded `sleep`; actual work happens via
    /// [`exec`](Self::exec). On any failure after creation the container
    /// is removed before the error is returned.
    pub async fn spawn(&self, ceiling: ResourceCeiling) -> Result<SandboxHandle, EngineError> {
        let permit = self.pool.admit(self.config.admission_window()).await?;
        let docker = self.connect().await?;
        self.ensure_image(docker).await?;

        let name = format!("crucible-{}", Uuid::new_v4());
        let keepalive = ceiling.time_limit_seconds + KEEPALIVE_SLACK_SECONDS;

        let mut tmpfs = HashMap::new();
        tmpfs.insert(
            SCRATCH_DIR.to_string(),
            format!(
                "rw,noexec,nosuid,size={},mode=1777",
                self.config.scratch_bytes
            ),
        );

        let host_config = HostConfig {
            memory: Some(ceiling.memory_bytes as i64),
            // swap ceiling equal to the memory ceiling means no swap at
            // all; the limit is hard
            memory_swap: Some(ceiling.memory_bytes as i64),
            nano_cpus: Some(ceiling.nano_cpus),
            pids_limit: Some(ceiling.pids_limit),
            ulimits: Some(vec![ResourcesUlimits {
                name: Some("nofile".to_string()),
                soft: Some(ceiling.nofile_limit),
                hard: Some(ceiling.nofile_limit),
            }]),
            readonly_rootfs: Some(true),
            tmpfs: Some(tmpfs),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(self.config.sandbox_image.clone()),
            cmd: Some(vec!["sleep".to_string(), keepalive.to_string()]),
            // override any image entrypoint so cmd is exactly what runs
            entrypoint: Some(vec![]),
            user: Some(SANDBOX_USER.to_string()),
            working_dir: Some(SCRATCH_DIR.to_string()),
            network_disabled: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };
        let container = docker.create_container(Some(options), container_config).await?;

        if let Err(e) = docker
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
        {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            let _ = docker.remove_container(&container.id, Some(options)).await;
            return Err(e.into());
        }

        self.spawned_total.fetch_add(1, Ordering::Relaxed);
        debug!(
            container = %name,
            memory_bytes = ceiling.memory_bytes,
            time_limit_seconds = ceiling.time_limit_seconds,
            "sandbox started"
        );

        Ok(SandboxHandle {
            id: container.id,
            name,
            created_at: Utc::now(),
            ceiling,
            docker: docker.clone(),
            destroyed: false,
            _permit: permit,
        })
    }

    /// Run a command inside the sandbox, bounded by `deadline` on the
    /// host side so a stalled or output-hoarding process cannot defeat
    /// the limit. `stdin` is streamed through the exec's attached input
    /// and closed, which is how source is staged without touching the
    /// filesystem API. Talks to the daemon through the handle's own
    /// client, which the spawn that created the container established.
    pub async fn exec(
        &self,
        handle: &SandboxHandle,
        cmd: Vec<String>,
        stdin: Option<&[u8]>,
        deadline: Instant,
    ) -> Result<ExecOutput, EngineError> {
        let exec = handle
            .docker
            .create_exec(
                &handle.id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    attach_stdin: Some(stdin.is_some()),
                    ..Default::default()
                },
            )
            .await?;

        let started = handle
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    ..Default::default()
                }),
            )
            .await?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut timed_out = false;

        match started {
            StartExecResults::Attached { mut output, mut input } => {
                if let Some(bytes) = stdin {
                    input
                        .write_all(bytes)
                        .await
                        .map_err(|e| EngineError::Internal(format!("exec stdin write: {e}")))?;
                    if let Err(e) = input.shutdown().await {
                        warn!(container = %handle.name, error = %e, "exec stdin close failed");
                    }
                }
                drop(input);

                loop {
                    tokio::select! {
                        item = output.next() => match item {
                            Some(Ok(LogOutput::StdOut { message })) => {
                                push_capped(&mut stdout, &message);
                            }
                            Some(Ok(LogOutput::StdErr { message })) => {
                                push_capped(&mut stderr, &message);
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(container = %handle.name, error = %e, "exec stream error");
                                break;
                            }
                            None => break,
                        },
                        _ = tokio::time::sleep_until(deadline) => {
                            timed_out = true;
                            break;
                        }
                    }
                }
            }
            StartExecResults::Detached => {
                debug!(container = %handle.name, "exec unexpectedly detached");
            }
        }

        if timed_out {
            debug!(container = %handle.name, "exec hit the host-side deadline");
            return Ok(ExecOutput {
                stdout,
                stderr,
                exit_code: None,
                timed_out: true,
            });
        }

        // Stream EOF does not always mean the process has exited (it may
        // just have closed its descriptors); poll until the runtime
        // reports it finished or the deadline passes.
        let exit_code = loop {
            let inspect = handle.docker.inspect_exec(&exec.id).await?;
            if inspect.running != Some(true) {
                break inspect.exit_code;
            }
            if Instant::now() >= deadline {
                timed_out = true;
                break None;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        };

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
            timed_out,
        })
    }

    /// Idempotent teardown: SIGTERM, a bounded grace wait, then forced
    /// removal. An already-gone container counts as success. A genuine
    /// removal failure is escalated in the log as an operational alert
    /// and returned; the handle then stays undestroyed so its `Drop`
    /// backstop retries.
    pub async fn destroy(&self, handle: &mut SandboxHandle) -> Result<(), EngineError> {
        if handle.destroyed {
            return Ok(());
        }

        match handle
            .docker
            .kill_container(&handle.id, Some(KillContainerOptions { signal: "SIGTERM" }))
            .await
        {
            Ok(()) => {}
            Err(e) if is_gone(&e) => {}
            Err(e) => {
                debug!(container = %handle.name, error = %e, "SIGTERM failed; forcing removal")
            }
        }

        let mut wait = handle.docker.wait_container(
            &handle.id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );
        let _ = tokio::time::timeout(self.config.destroy_grace(), wait.next()).await;

        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match handle.docker.remove_container(&handle.id, Some(options)).await {
            Ok(()) => {
                handle.destroyed = true;
                debug!(
                    container = %handle.name,
                    lifetime_ms = (Utc::now() - handle.created_at).num_milliseconds(),
                    "sandbox removed"
                );
                Ok(())
            }
            Err(e) if is_gone(&e) => {
                handle.destroyed = true;
                Ok(())
            }
            Err(e) => {
                error!(
                    container = %handle.name,
                    error = %e,
                    "sandbox removal failed; container may be leaked on the host"
                );
                Err(e.into())
            }
        }
    }
}

/// Server responses meaning the container is already gone or already on
/// its way out.
fn is_gone(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404 | 409,
            ..
        }
    )
}

fn push_capped(buffer: &mut String, chunk: &[u8]) {
    if buffer.len() >= MAX_STREAM_BYTES {
        return;
    }
    buffer.push_str(&String::from_utf8_lossy(chunk));
    if buffer.len() > MAX_STREAM_BYTES {
        let mut cut = MAX_STREAM_BYTES;
        while !buffer.is_char_boundary(cut) {
            cut -= 1;
        }
        buffer.truncate(cut);
        buffer.push_str(TRUNCATION_NOTE);
    }
}
