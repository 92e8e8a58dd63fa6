//! Domain-specific error types for sandbox provisioning.
//!
//! These cover the control-plane side only (create, readiness, teardown).
//! Failures inside a running sandbox are reported as tool output text.

use std::time::Duration;

/// Errors that can occur while provisioning or tearing down a sandbox.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Docker daemon is not running or not accessible.
    #[error("Docker is not available: {message}")]
    DockerUnavailable { message: String },

    /// Container image was not found.
    #[error("Container image not found: {image}")]
    ImageNotFound { image: String },

    /// The sandbox did not become ready before its deadline.
    #[error("Sandbox {name} not ready within {timeout_secs}s")]
    ReadinessTimeout { name: String, timeout_secs: u64 },

    /// The pod reached a terminal phase before becoming ready.
    #[error("Pod {name} failed: {message}")]
    PodFailed { name: String, message: String },

    /// The cluster could not be reached or rejected a request.
    #[error("Kubernetes cluster unavailable: {message}")]
    ClusterUnavailable { message: String },

    /// Container operation failed (create, start, inspect, etc.).
    #[error("Container operation failed: {message}")]
    ContainerFailed { message: String },

    /// The cloud sandbox service returned an error.
    #[error("Cloud sandbox API error: {message}")]
    CloudApi { message: String },

    /// The configured backend combination cannot be built.
    #[error("Unsupported sandbox configuration: {message}")]
    Unsupported { message: String },
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

    /// Creates a `ReadinessTimeout` error from a `Duration`.
    pub fn readiness_timeout(name: impl Into<String>, duration: Duration) -> Self {
        Self::ReadinessTimeout {
            name: name.into(),
            timeout_secs: duration.as_secs(),
        }
    }

    /// Creates a `PodFailed` error.
    pub fn pod_failed(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PodFailed {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Creates a `ClusterUnavailable` error.
    pub fn cluster_unavailable(message: impl Into<String>) -> Self {
        Self::ClusterUnavailable {
            message: message.into(),
        }
    }

    /// Creates a `ContainerFailed` error.
    pub fn container_failed(message: impl Into<String>) -> Self {
        Self::ContainerFailed {
            message: message.into(),
        }
    }

    /// Creates a `CloudApi` error.
    pub fn cloud_api(message: impl Into<String>) -> Self {
        Self::CloudApi {
            message: message.into(),
        }
    }

    /// Creates an `Unsupported` error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Returns true if this is a readiness timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ReadinessTimeout { .. })
    }

    /// Returns true if this is a Docker unavailability error.
    pub fn is_docker_unavailable(&self) -> bool {
        matches!(self, Self::DockerUnavailable { .. })
    }

    /// Returns true if the cluster itself could not be reached.
    pub fn is_cluster_unavailable(&self) -> bool {
        matches!(self, Self::ClusterUnavailable { .. })
    }
}
