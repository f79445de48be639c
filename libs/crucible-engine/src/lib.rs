//! Secure sandboxed execution of learner code submissions.
//!
//! Each submission runs inside a throwaway Docker container with no
//! network, a read-only root filesystem and hard resource ceilings, gets
//! its instructor-defined test cases evaluated in-process, and has its
//! report cached by content fingerprint so identical submissions never
//! run twice.
//!
//! The embedding application constructs one [`ExecutionEngine`] and calls
//! [`ExecutionEngine::execute`] per submission; everything else in this
//! crate sits behind that facade.

mod cache;
pub mod config;
pub mod engine;
pub mod error;
mod harness;
mod pool;
mod sandbox;
mod session;
pub mod types;
pub mod validator;

#[cfg(test)]
mod engine_tests;

pub use config::EngineConfig;
pub use engine::{EngineMetrics, ExecutionEngine};
pub use error::EngineError;
pub use types::{
    ExecutionReport, ExecutionRequest, ExecutionStatus, Language, TestCase, TestCaseResult,
};
pub use validator::{validate, ValidationResult};
