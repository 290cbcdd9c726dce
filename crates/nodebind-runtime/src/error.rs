use std::path::PathBuf;
use std::time::Duration;

use nodebind_promise::Rejection;

/// Why a binder transaction failed.
///
/// This is the rejection type of every [`Completion`](crate::Completion), so
/// it is `Clone`: one failure may settle many promises at once.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BinderError {
    /// The local target is missing, or its handler failed.
    #[error("local dispatch failed: {0}")]
    LocalDispatch(String),

    /// Arguments or results could not be encoded or decoded.
    #[error("marshal error: {0}")]
    Marshal(String),

    /// The connection to the target node failed or was closed.
    #[error("connection error: {0}")]
    Connection(String),

    /// No reply arrived before the transaction deadline.
    #[error("transaction timed out after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the transaction locally.
    #[error("transaction cancelled")]
    Cancelled,

    /// The remote node reported a failure.
    #[error("remote exception: {message}")]
    Remote {
        message: String,
        cause: Option<String>,
    },

    /// A binder URI could not be parsed.
    #[error("invalid binder uri {uri:?}: {reason}")]
    InvalidUri { uri: String, reason: String },
}

impl BinderError {
    pub fn not_found(target: impl std::fmt::Display) -> Self {
        BinderError::LocalDispatch(format!("target not found: {target}"))
    }

    /// True for failures raised by the connection rather than the target.
    pub fn is_transport(&self) -> bool {
        matches!(self, BinderError::Connection(_) | BinderError::Timeout(_))
    }
}

impl Rejection for BinderError {
    fn timed_out(after: Duration) -> Self {
        BinderError::Timeout(after)
    }

    fn cancelled() -> Self {
        BinderError::Cancelled
    }
}

pub type Result<T> = std::result::Result<T, BinderError>;

/// Errors loading or validating node configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The configuration is not valid JSON for the expected shape.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// The configuration parsed but is inconsistent.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors building, starting or stopping a runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Worker pool or scheduler could not start.
    #[error("executor error: {0}")]
    Executor(#[from] nodebind_promise::ExecutorError),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] nodebind_transport::TransportError),

    /// Node id 0 is reserved.
    #[error("invalid node id {0}")]
    InvalidNode(u32),

    /// Lifecycle operation in the wrong state.
    #[error("runtime is {0}")]
    State(&'static str),
}
