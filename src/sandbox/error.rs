//! Domain-specific error types for sandbox operations.
//!
//! Typed errors let the orchestrator tell a missing image from a vanished
//! container without parsing message strings.

/// Errors that can occur during sandbox operations.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Docker daemon is not running or not accessible.
    #[error("Docker is not available: {message}")]
    DockerUnavailable { message: String },

    /// Container image was not found.
    #[error("Container image not found: {image}")]
    ImageNotFound { image: String },

    /// The sandbox no longer exists.
    #[error("Sandbox not found: {id}")]
    NotFound { id: String },

    /// The workspace could not be packed for upload.
    #[error("Failed to prepare workspace: {message}")]
    Workspace { message: String },

    /// A lifecycle operation (create, attach, start, kill, remove) failed.
    #[error("Container {operation} failed: {message}")]
    ContainerFailed {
        operation: &'static str,
        message: String,
    },

    /// The sandbox failed while running (disappeared, wait broke, ...).
    #[error("Container is unhealthy: {message}")]
    Unhealthy { message: String },
}

impl SandboxError {
    /// Creates a `DockerUnavailable` error.
    pub fn docker_unavailable(message: impl Into<String>) -> Self {
        Self::DockerUnavailable {
            message: message.into(),
        }
    }

    /// Creates an `ImageNotFound` error.
    pub fn image_not_found(image: impl Into<String>) -> Self {
        Self::ImageNotFound {
            image: image.into(),
        }
    }

    /// Creates a `NotFound` error.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Creates a `Workspace` error.
    pub fn workspace(message: impl Into<String>) -> Self {
        Self::Workspace {
            message: message.into(),
        }
    }

    /// Creates a `ContainerFailed` error for the named operation.
    pub fn container_failed(operation: &'static str, message: impl Into<String>) -> Self {
        Self::ContainerFailed {
            operation,
            message: message.into(),
        }
    }

    /// Creates an `Unhealthy` error.
    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::Unhealthy {
            message: message.into(),
        }
    }

    /// Returns true if the sandbox is already gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if this is a Docker unavailability error.
    pub fn is_docker_unavailable(&self) -> bool {
        matches!(self, Self::DockerUnavailable { .. })
    }

    /// Returns true if this is an image not found error.
    pub fn is_image_not_found(&self) -> bool {
        matches!(self, Self::ImageNotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_docker_unavailable_error() {
        let err = SandboxError::docker_unavailable("daemon not running");
        assert!(err.is_docker_unavailable());
        assert!(!err.is_not_found());
        assert_eq!(
            err.to_string(),
            "Docker is not available: daemon not running"
        );
    }

    #[test]
    fn test_image_not_found_error() {
        let err = SandboxError::image_not_found("codecell/dotnet");
        assert!(err.is_image_not_found());
        assert_eq!(err.to_string(), "Container image not found: codecell/dotnet");
    }

    #[test]
    fn test_container_failed_names_operation() {
        let err = SandboxError::container_failed("start", "port already allocated");
        assert_eq!(
            err.to_string(),
            "Container start failed: port already allocated"
        );
    }

    #[test]
    fn test_unhealthy_error() {
        let err = SandboxError::unhealthy("container disappeared");
        assert_eq!(err.to_string(), "Container is unhealthy: container disappeared");
    }

    #[test]
    fn test_error_variants_are_distinct() {
        let missing = SandboxError::not_found("abc");
        let docker = SandboxError::docker_unavailable("test");
        let image = SandboxError::image_not_found("test");

        assert!(missing.is_not_found());
        assert!(!missing.is_docker_unavailable());
        assert!(!missing.is_image_not_found());

        assert!(!docker.is_not_found());
        assert!(docker.is_docker_unavailable());

        assert!(!image.is_not_found());
        assert!(image.is_image_not_found());
    }
}
