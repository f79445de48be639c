//! Public entry point: cache in front, harness and session behind.
//!
//! [`ExecutionEngine::execute`] is the one call external code makes per
//! submission. It never returns an error and never panics across the
//! boundary; every failure mode becomes a report status the embedding
//! application can store or render.

use std::sync::Arc;

use serde::Serialize;
use tracing::error;
use uuid::Uuid;

use crate::cache::ResultCache;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::harness::TestHarness;
use crate::sandbox::DockerRuntime;
use crate::session::ExecutionSession;
use crate::types::{ExecutionReport, ExecutionRequest};

/// Live counters for the sandbox fleet, used by health endpoints and the
/// leak assertions in the test suite.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct EngineMetrics {
    /// Sandboxes currently occupying pool slots.
    pub active_sandboxes: usize,
    /// Sandboxes successfully started since engine construction.
    pub sandboxes_spawned: u64,
    /// Reports currently stored in the result cache.
    pub cached_reports: usize,
}

/// The execution engine facade. Cheap to clone; all clones share the
/// same pool, spawn counters and result cache.
#[derive(Clone)]
pub struct ExecutionEngine {
    config: EngineConfig,
    runtime: DockerRuntime,
    cache: Arc<ResultCache>,
}

impl ExecutionEngine {
    /// Construction only wires things up; the daemon connection is
    /// deferred to the first spawn or ping, so a disabled or Docker-less
    /// deployment can still instantiate the engine for its health
    /// endpoints, rejections and cached reports.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let runtime = DockerRuntime::new(config.clone());
        let cache = Arc::new(ResultCache::new(config.cache_ttl()));
        Ok(Self {
            config,
            runtime,
            cache,
        })
    }

    /// Execute one request end to end: cache lookup, validation, sandbox
    /// run, test scoring.
    ///
    /// Identical in-flight requests are coalesced onto one sandbox run.
    /// The whole execution happens in a detached task, so cancelling the
    /// returned future (a disconnecting client) never abandons a
    /// container mid-run; teardown always completes.
    #[tracing::instrument(skip_all, fields(
        language = %request.language,
        test_cases = request.test_cases.len(),
        use_cache = request.use_cache,
    ))]
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionReport {
        if !self.config.enabled {
            return ExecutionReport::runtime_error("execution engine is disabled");
        }

        if request.use_cache {
            let ceiling = self.config.ceiling_for(&request);
            let fingerprint = request.fingerprint(&ceiling);
            let engine = self.clone();
            let (report, cache_hit) = self
                .cache
                .get_or_compute(&fingerprint, request.exercise_id, move || async move {
                    engine.run_isolated(request).await
                })
                .await;
            let mut report = (*report).clone();
            report.cache_hit = cache_hit;
            report
        } else {
            let engine = self.clone();
            let request_task = tokio::spawn(async move { engine.run_isolated(request).await });
            match request_task.await {
                Ok(report) => report,
                Err(join_error) => {
                    error!(error = %join_error, "execution task failed");
                    ExecutionReport::internal_error("execution task failed unexpectedly")
                }
            }
        }
    }

    async fn run_isolated(&self, request: ExecutionRequest) -> ExecutionReport {
        let session = ExecutionSession::new(&self.runtime, &self.config);
        TestHarness::new(session).evaluate(&request).await
    }

    /// Health check: true when the engine is enabled and the container
    /// daemon answers a ping.
    pub async fn is_runtime_available(&self) -> bool {
        self.config.enabled && self.runtime.is_available().await
    }

    pub async fn metrics(&self) -> EngineMetrics {
        EngineMetrics {
            active_sandboxes: self.runtime.pool().active(),
            sandboxes_spawned: self.runtime.spawned_total(),
            cached_reports: self.cache.len().await,
        }
    }

    /// Bust every cached report tagged with `exercise_id`, for immediate
    /// effect after an instructor edits the exercise. Returns the number
    /// of entries dropped.
    pub async fn invalidate_exercise(&self, exercise_id: Uuid) -> usize {
        self.cache.invalidate_exercise(exercise_id).await
    }

    /// Housekeeping sweep for entries past their TTL; lookup also
    /// enforces expiry lazily, so calling this is optional.
    pub async fn purge_expired_cache(&self) -> usize {
        self.cache.purge_expired().await
    }

    pub async fn clear_cache(&self) {
        self.cache.clear().await;
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
