//! Error types for the engine binary.

/// Top-level error for the engine binary.
///
/// Each variant wraps a subsystem error so startup and shutdown can
/// propagate with `?`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration loading or validation failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: patchwork_core::ConfigError,
    },

    /// The simulator could not be built.
    #[error("simulator error: {source}")]
    Simulator {
        /// The underlying simulator error.
        #[from]
        source: patchwork_core::SimulatorError,
    },

    /// Reading or writing a snapshot failed.
    #[error("persistence error: {source}")]
    Persistence {
        /// The underlying persistence error.
        #[from]
        source: patchwork_core::PersistenceError,
    },

    /// The session server could not start.
    #[error("server error: {source}")]
    Server {
        /// The underlying server error.
        #[from]
        source: patchwork_session::ServerError,
    },

    /// The tracing subscriber could not be installed.
    #[error("logging error: {message}")]
    Logging {
        /// Description of the failure.
        message: String,
    },

    /// A blocking save task panicked or was cancelled.
    #[error("save task failed: {source}")]
    SaveTask {
        /// The underlying join error.
        #[from]
        source: tokio::task::JoinError,
    },
}
