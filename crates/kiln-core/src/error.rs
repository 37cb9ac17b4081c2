//! Error types for Kiln.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Configuration errors
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid job definition: {0}")]
    InvalidJob(String),

    // Sandbox lifecycle errors
    #[error("Sandbox rejected by cluster admission: {0}")]
    Admission(String),

    #[error("Sandbox not ready after {waited_secs}s: {last_cause}")]
    ReadinessTimeout { waited_secs: u64, last_cause: String },

    #[error("Transient scheduling failure: {0}")]
    TransientScheduling(String),

    #[error("Sandbox failed: {0}")]
    SandboxFailed(String),

    #[error("Node lost while hosting sandbox {0}")]
    NodeLost(String),

    #[error("Invalid sandbox transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Sandbox {0} is not ready for command execution")]
    SandboxNotReady(String),

    #[error("Teardown of sandbox {name} incomplete: {reason}")]
    Teardown { name: String, reason: String },

    // Execution errors
    #[error("Command channel broken: {0}")]
    Channel(String),

    #[error("Step failed with exit code {exit_code}: {message}")]
    StepFailed { exit_code: i32, message: String },

    #[error("Step timed out after {seconds}s")]
    StepTimeout { seconds: u64 },

    #[error("Cancelled: {reason}")]
    Cancelled { reason: String },

    // Cluster API errors
    #[error("Cluster API error ({status}): {message}")]
    ClusterApi { status: u16, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Network error: {0}")]
    Network(String),

    // Infrastructure errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the error reports an object that does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::ClusterApi { status: 404, .. })
    }

    /// Whether a cluster call failed in a way worth retrying: network
    /// trouble, throttling or a server-side error.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Network(_) | Error::TransientScheduling(_) => true,
            Error::ClusterApi { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
