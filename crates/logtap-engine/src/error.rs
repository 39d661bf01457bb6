//! Engine error types.

use logtap_runtime::SandboxError;

/// Errors terminating a pipeline run.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The input reader failed.
    #[error("reader: {0}")]
    Reader(#[source] std::io::Error),

    /// A sandbox hook failed and was not recovered.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}
