use thiserror::Error;

/// Failures inside the engine, below the report boundary.
///
/// These never cross the public facade:
/// [`ExecutionEngine::execute`](crate::engine::ExecutionEngine::execute)
/// folds every one of them into an
/// [`ExecutionReport`](crate::types::ExecutionReport) status. The typed
/// enum exists so the adapter and session layers can distinguish pool
/// saturation from runtime failures without string matching.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The admission window elapsed with every sandbox slot occupied.
    #[error("sandbox pool at capacity")]
    ResourceExhausted,

    /// The container runtime refused or failed an operation.
    #[error("container runtime error: {0}")]
    Runtime(#[from] bollard::errors::Error),

    /// Anything unexpected on the engine side itself.
    #[error("internal engine error: {0}")]
    Internal(String),
}
