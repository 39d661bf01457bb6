//! Sandbox error types.

use std::path::PathBuf;

use crate::http::HttpClientError;

/// Errors from the sandbox runtime layer.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The sandbox was used before `init` or after `close`.
    #[error("sandbox is not initialized")]
    Uninitialized,

    /// A required script hook is missing.
    #[error("not defined in script: function {0}")]
    HookNotDefined(&'static str),

    /// The script failed to compile or its top-level statements errored.
    #[error("failed to load script {}: {message}", path.display())]
    Load {
        /// Path of the script that failed to load.
        path: PathBuf,
        /// Underlying engine error message.
        message: String,
    },

    /// A hook raised an error the sandbox did not recover from.
    #[error("script error in {hook}: {message}")]
    Script {
        /// Name of the hook that raised.
        hook: &'static str,
        /// Underlying engine error message.
        message: String,
    },

    /// Invalid sandbox configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// HTTP client failure surfaced through the sandbox.
    #[error(transparent)]
    Http(#[from] HttpClientError),

    /// Kafka producer failure surfaced through the sandbox.
    #[error("kafka: {0}")]
    Kafka(String),

    /// A shared-state mutex was poisoned by a panicking thread.
    #[error("{0} mutex poisoned")]
    Poisoned(&'static str),
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, SandboxError>;
