//! Error types for patch and rollback operations.

use thiserror::Error;

/// Errors that can occur while patching or rolling back a deployment.
#[derive(Debug, Error)]
pub enum GrappleError {
    /// The requested container does not exist in the deployment.
    #[error("container {container:?} not found in deployment {deployment:?}, available: {}", .available.join(", "))]
    UnknownContainer {
        deployment: String,
        container: String,
        available: Vec<String>,
    },

    /// The base image was built for a different platform than requested.
    #[error(
        "image {image:?} was built for platform {built:?} but the configured platform is {requested:?}, rebuild it for the correct platform"
    )]
    PlatformMismatch {
        image: String,
        built: String,
        requested: String,
    },

    /// The platform string is not one we can build for.
    #[error("unsupported platform {0:?}, supported: linux/amd64, linux/arm64")]
    UnsupportedPlatform(String),

    /// A mount argument did not have the `HOST:CONTAINER` shape.
    #[error("invalid mount {0:?}, expected HOST_PATH:MOUNT_PATH")]
    InvalidMount(String),

    /// Rollback was requested for a deployment that carries no patch marker.
    #[error("deployment {0} is not patched, stopping rollback")]
    NotPatched(String),

    /// Every revision was undone and the patch marker is still present.
    #[error("could not roll back deployment {0} into an unpatched state")]
    RollbackExhausted(String),

    /// An external tool exited with a failure status.
    #[error("{program} {} failed: {stderr}", .args.join(" "))]
    Command {
        program: String,
        args: Vec<String>,
        stderr: String,
    },

    /// An external tool could not be started at all.
    #[error("failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Tool output could not be interpreted.
    #[error("unexpected output: {0}")]
    Parse(String),

    /// JSON (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Template registration, rendering or parsing failed.
    #[error("template error: {0}")]
    Template(String),

    /// Config file could not be read, written or parsed.
    #[error("config error: {0}")]
    Config(String),

    /// Filesystem error while preparing a build context.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GrappleError {
    /// Whether this error was raised before anything in the cluster was touched.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::UnknownContainer { .. }
                | Self::PlatformMismatch { .. }
                | Self::UnsupportedPlatform(_)
                | Self::InvalidMount(_)
        )
    }
}

impl From<handlebars::RenderError> for GrappleError {
    fn from(err: handlebars::RenderError) -> Self {
        Self::Template(err.to_string())
    }
}

impl From<serde_yaml::Error> for GrappleError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GrappleError>;
