//! Docker sandbox for isolated code execution.
//!
//! A sandbox runs exactly one untrusted program. The runtime trait is the
//! seam between the orchestrator and the container engine: create (with
//! the workspace already inside), attach, start, wait, kill, remove, and
//! resource statistics.

mod docker;
mod error;
#[cfg(test)]
pub(crate) mod mock;

pub(crate) use docker::DockerSandbox;
pub(crate) use error::SandboxError;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::technology::Technology;

/// Opaque handle of a provisioned sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct SandboxId(String);

impl SandboxId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SandboxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form, like `docker ps`
        f.write_str(self.0.get(..12).unwrap_or(&self.0))
    }
}

/// One frame of the attached connection, tagged with its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum OutputFrame {
    Stdout(Bytes),
    Stderr(Bytes),
}

/// Framed output of an attached sandbox.
pub(crate) type FrameStream =
    Pin<Box<dyn Stream<Item = Result<OutputFrame, SandboxError>> + Send>>;

/// Write side of an attached sandbox's stdin.
pub(crate) type StdinWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// A bidirectional connection to a sandbox that has not started yet.
pub(crate) struct AttachedConnection {
    pub output: FrameStream,
    pub input: StdinWriter,
}

/// Cumulative resource counters at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct ResourceSample {
    /// Total CPU time consumed by the sandbox, in nanoseconds
    pub cpu_total_ns: u64,
    /// Total CPU time of the host, in nanoseconds
    pub system_total_ns: u64,
    pub online_cpus: u32,
    pub memory_bytes: u64,
}

/// Terminal status of a sandboxed program, or why it could not be observed.
pub(crate) type ExitOutcome = Result<i64, SandboxError>;

/// Lifecycle operations on isolated execution environments.
#[async_trait]
pub(crate) trait SandboxRuntime: Send + Sync {
    /// Provision a sandbox with the technology's workspace materialized in it.
    async fn create(
        &self,
        request_id: &str,
        technology: &dyn Technology,
        source_code: &str,
    ) -> Result<SandboxId, SandboxError>;

    /// Attach to the sandbox's stdio. Must happen before `start`.
    async fn attach(&self, id: &SandboxId) -> Result<AttachedConnection, SandboxError>;

    /// Start the program.
    async fn start(&self, id: &SandboxId) -> Result<(), SandboxError>;

    /// Resolve once the program stops running.
    ///
    /// Cancelling `cancel` abandons the wait (the sender is dropped) but
    /// leaves the sandbox running.
    fn wait(&self, id: &SandboxId, cancel: CancellationToken) -> oneshot::Receiver<ExitOutcome>;

    /// Send SIGKILL. A sandbox that is already gone is not an error.
    async fn kill(&self, id: &SandboxId) -> Result<(), SandboxError>;

    /// Reclaim every resource held by the sandbox.
    async fn remove(&self, id: &SandboxId) -> Result<(), SandboxError>;

    /// Periodic cumulative samples until `cancel` fires or the sandbox exits.
    fn stream_statistics(
        &self,
        id: &SandboxId,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<ResourceSample>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_id_display_is_short() {
        let id = SandboxId::new("4f2a9c1e7b3d5a6f8e9d0c1b2a3f4e5d");
        assert_eq!(id.to_string(), "4f2a9c1e7b3d");
        assert_eq!(id.as_str().len(), 32);

        let short = SandboxId::new("mock-1");
        assert_eq!(short.to_string(), "mock-1");
    }
}
