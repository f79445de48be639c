//! Engine configuration.
//!
//! Injected once at construction and treated as immutable afterwards. The
//! struct is serde-friendly so the embedding application can load it from
//! whatever configuration source it already uses; every field has a
//! default, so `{}` deserializes to a working configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::{ExecutionRequest, ResourceCeiling};

pub const DEFAULT_TIME_LIMIT_SECONDS: u64 = 30;
pub const MAX_TIME_LIMIT_SECONDS: u64 = 60;
pub const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 256 * 1024 * 1024;
pub const MAX_MEMORY_LIMIT_BYTES: u64 = 512 * 1024 * 1024;

/// Floor below which a memory request is raised rather than honored; the
/// interpreter itself cannot start under roughly this much.
const MIN_MEMORY_LIMIT_BYTES: u64 = 32 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Master switch. A disabled engine answers every request with a
    /// `runtime_error` report instead of touching the container runtime.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Base image every sandbox is created from. Pulled on first use if
    /// not present locally.
    #[serde(default = "default_sandbox_image")]
    pub sandbox_image: String,

    /// Maximum number of concurrently live sandboxes.
    #[serde(default = "default_max_sandboxes")]
    pub max_sandboxes: usize,

    /// How long a request may wait for a free sandbox slot before the
    /// engine fails it fast instead of queueing indefinitely.
    #[serde(default = "default_admission_window_ms")]
    pub admission_window_ms: u64,

    /// Applied when a request does not set its own time limit.
    #[serde(default = "default_time_limit_seconds")]
    pub default_time_limit_seconds: u64,

    /// Requests asking for more are clamped down to this.
    #[serde(default = "default_max_time_limit_seconds")]
    pub max_time_limit_seconds: u64,

    #[serde(default = "default_memory_limit_bytes")]
    pub default_memory_limit_bytes: u64,

    #[serde(default = "default_max_memory_limit_bytes")]
    pub max_memory_limit_bytes: u64,

    /// CPU share per sandbox in units of 1e-9 CPUs; 500_000_000 is half a
    /// core.
    #[serde(default = "default_nano_cpus")]
    pub nano_cpus: i64,

    /// Process count ceiling per sandbox (fork bomb guard).
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,

    /// Open file descriptor ceiling per sandbox.
    #[serde(default = "default_nofile_limit")]
    pub nofile_limit: i64,

    /// Size of the writable scratch tmpfs each sandbox gets; everything
    /// else in the container is read-only.
    #[serde(default = "default_scratch_bytes")]
    pub scratch_bytes: u64,

    /// Grace between SIGTERM and forced removal during teardown. Kept
    /// short: the keep-alive process never handles SIGTERM, so a normal
    /// run always pays the full window.
    #[serde(default = "default_destroy_grace_ms")]
    pub destroy_grace_ms: u64,

    /// How long a cached report stays servable.
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_sandbox_image() -> String {
    "python:3.11-slim".to_string()
}

fn default_max_sandboxes() -> usize {
    8
}

fn default_admission_window_ms() -> u64 {
    500
}

fn default_time_limit_seconds() -> u64 {
    DEFAULT_TIME_LIMIT_SECONDS
}

fn default_max_time_limit_seconds() -> u64 {
    MAX_TIME_LIMIT_SECONDS
}

fn default_memory_limit_bytes() -> u64 {
    DEFAULT_MEMORY_LIMIT_BYTES
}

fn default_max_memory_limit_bytes() -> u64 {
    MAX_MEMORY_LIMIT_BYTES
}

fn default_nano_cpus() -> i64 {
    500_000_000
}

fn default_pids_limit() -> i64 {
    64
}

fn default_nofile_limit() -> i64 {
    64
}

fn default_scratch_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_destroy_grace_ms() -> u64 {
    500
}

fn default_cache_ttl_seconds() -> u64 {
    900
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            sandbox_image: default_sandbox_image(),
            max_sandboxes: default_max_sandboxes(),
            admission_window_ms: default_admission_window_ms(),
            default_time_limit_seconds: default_time_limit_seconds(),
            max_time_limit_seconds: default_max_time_limit_seconds(),
            default_memory_limit_bytes: default_memory_limit_bytes(),
            max_memory_limit_bytes: default_max_memory_limit_bytes(),
            nano_cpus: default_nano_cpus(),
            pids_limit: default_pids_limit(),
            nofile_limit: default_nofile_limit(),
            scratch_bytes: default_scratch_bytes(),
            destroy_grace_ms: default_destroy_grace_ms(),
            cache_ttl_seconds: default_cache_ttl_seconds(),
        }
    }
}

impl EngineConfig {
    pub fn admission_window(&self) -> Duration {
        Duration::from_millis(self.admission_window_ms)
    }

    pub fn destroy_grace(&self) -> Duration {
        Duration::from_millis(self.destroy_grace_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }

    /// Effective limits for one request: per-request overrides clamped
    /// into the configured bounds. A zero time limit means "use the
    /// default"; a memory request below the interpreter floor is raised
    /// to the floor rather than producing a sandbox that cannot start.
    pub fn ceiling_for(&self, request: &ExecutionRequest) -> ResourceCeiling {
        let requested_time = if request.time_limit_seconds == 0 {
            self.default_time_limit_seconds
        } else {
            request.time_limit_seconds
        };
        let requested_memory = if request.memory_limit_bytes == 0 {
            self.default_memory_limit_bytes
        } else {
            request.memory_limit_bytes
        };
        ResourceCeiling {
            time_limit_seconds: requested_time.min(self.max_time_limit_seconds),
            memory_bytes: requested_memory
                .clamp(MIN_MEMORY_LIMIT_BYTES, self.max_memory_limit_bytes),
            nano_cpus: self.nano_cpus,
            pids_limit: self.pids_limit,
            nofile_limit: self.nofile_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecutionRequest, Language};

    #[test]
    fn empty_json_yields_working_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert!(config.enabled);
        assert_eq!(config.sandbox_image, "python:3.11-slim");
        assert_eq!(config.max_sandboxes, 8);
        assert_eq!(config.max_time_limit_seconds, 60);
        assert_eq!(config.cache_ttl_seconds, 900);
    }

    #[test]
    fn request_defaults_pass_through_unclamped() {
        let config = EngineConfig::default();
        let request = ExecutionRequest::new(Language::Python, "print(1)");
        let ceiling = config.ceiling_for(&request);
        assert_eq!(ceiling.time_limit_seconds, DEFAULT_TIME_LIMIT_SECONDS);
        assert_eq!(ceiling.memory_bytes, DEFAULT_MEMORY_LIMIT_BYTES);
        assert_eq!(ceiling.nano_cpus, 500_000_000);
    }

    #[test]
    fn overrides_beyond_maximums_are_clamped() {
        let config = EngineConfig::default();
        let mut request = ExecutionRequest::new(Language::Python, "print(1)");
        request.time_limit_seconds = 3_600;
        request.memory_limit_bytes = 8 * 1024 * 1024 * 1024;
        let ceiling = config.ceiling_for(&request);
        assert_eq!(ceiling.time_limit_seconds, MAX_TIME_LIMIT_SECONDS);
        assert_eq!(ceiling.memory_bytes, MAX_MEMORY_LIMIT_BYTES);
    }

    #[test]
    fn zero_limits_fall_back_to_defaults() {
        let config = EngineConfig::default();
        let mut request = ExecutionRequest::new(Language::Python, "print(1)");
        request.time_limit_seconds = 0;
        request.memory_limit_bytes = 0;
        let ceiling = config.ceiling_for(&request);
        assert_eq!(ceiling.time_limit_seconds, config.default_time_limit_seconds);
        assert_eq!(ceiling.memory_bytes, config.default_memory_limit_bytes);
    }

    #[test]
    fn tiny_memory_requests_are_raised_to_the_floor() {
        let config = EngineConfig::default();
        let mut request = ExecutionRequest::new(Language::Python, "print(1)");
        request.memory_limit_bytes = 1024;
        let ceiling = config.ceiling_for(&request);
        assert_eq!(ceiling.memory_bytes, 32 * 1024 * 1024);
    }
}
