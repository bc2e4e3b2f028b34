//! Session and stop errors.
//!
//! A [`RunError`]'s display text is what the client sees in the session's
//! terminal `Error` event.

use crate::demux::DemuxError;
use crate::sandbox::SandboxError;
use crate::technology::UnsupportedLanguage;

/// Why a session ended without an exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum RunError {
    #[error(transparent)]
    UnsupportedLanguage(#[from] UnsupportedLanguage),

    #[error("Timeout must be a positive number of seconds")]
    InvalidTimeout,

    #[error("Failed to create container: {0}")]
    Provisioning(#[source] SandboxError),

    #[error("Failed to attach to container: {0}")]
    Attach(#[source] SandboxError),

    #[error("Failed to start container: {0}")]
    Start(#[source] SandboxError),

    #[error("Failed to write to stdin: {0}")]
    StdinWrite(#[source] std::io::Error),

    #[error("Execution timed out.")]
    TimedOut,

    #[error("Execution was stopped.")]
    Stopped,

    #[error("Execution was forcibly stopped.")]
    ForceStopped,

    #[error("Server is shutting down.")]
    ShuttingDown,

    #[error("Container failed while running: {0}")]
    Lifecycle(#[source] SandboxError),

    #[error(transparent)]
    Output(#[from] DemuxError),

    #[error("Client disconnected")]
    ClientDisconnected,
}

impl RunError {
    /// Final state name used in session logs.
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::TimedOut => "timed_out",
            Self::Stopped | Self::ForceStopped | Self::ShuttingDown | Self::ClientDisconnected => {
                "killed"
            }
            _ => "errored",
        }
    }
}

/// Failures of the out-of-band stop operation.
#[derive(Debug, thiserror::Error)]
pub(crate) enum StopError {
    /// No active session has this id (unknown or already finished).
    #[error("No active execution with request id '{request_id}'")]
    NotFound { request_id: String },

    /// The forced kill failed.
    #[error("Failed to stop execution: {message}")]
    Internal { message: String },
}

impl StopError {
    pub fn not_found(request_id: impl Into<String>) -> Self {
        Self::NotFound {
            request_id: request_id.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
