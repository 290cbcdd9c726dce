/// Errors raised by executors and the deadline scheduler.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The bounded task queue is full.
    #[error("executor queue full ({capacity} tasks)")]
    QueueFull { capacity: usize },

    /// The executor no longer accepts tasks.
    #[error("executor shut down")]
    Shutdown,

    /// A worker thread could not be spawned.
    #[error("failed to spawn thread {name}: {source}")]
    Spawn {
        name: String,
        source: std::io::Error,
    },

    /// Invalid pool sizing.
    #[error("invalid executor configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;
