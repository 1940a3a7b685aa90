//! Configuration types and fixed naming constants.
//!
//! A project keeps its grapple settings in a small YAML file (by default
//! `grapple.yaml`). Command line flags override whatever the file holds.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GrappleError, Result};

/// Pod template annotation key that marks a deployment as patched.
pub const CREATED_BY_ANNOTATION: &str = "grapple.5dlabs.ai/created-by";
/// Value of [`CREATED_BY_ANNOTATION`] written by the patch template.
pub const PATCH_CREATOR: &str = "grapple-patch";
/// Change cause recorded on the deployment when a patch is applied.
pub const PATCH_CHANGE_CAUSE: &str = "grapple patch";
/// Annotation kubectl reads for `rollout history` change causes.
pub const CHANGE_CAUSE_ANNOTATION: &str = "kubernetes.io/change-cause";
/// Annotation holding the deployment's latest revision number.
pub const REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";

/// Suffix appended to the deployment name to form the snapshot configmap name.
pub const SNAPSHOT_SUFFIX: &str = "-grapple-snapshot";
/// Key inside the snapshot configmap holding the serialized deployment.
pub const SNAPSHOT_KEY: &str = "deployment.json";
/// Where the snapshot configmap is mounted inside the patched container.
pub const SNAPSHOT_MOUNT_PATH: &str = "/etc/grapple";

/// Suffix appended to the deployment name to form the debug image name.
pub const PATCH_IMAGE_SUFFIX: &str = "-grapple-debug";
/// Tag used for every debug image.
pub const PATCH_IMAGE_TAG: &str = "latest";

/// Default config file name, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "grapple.yaml";
/// Default rollout wait timeout in seconds.
pub const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 300;

/// Target platform for the debug image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Platform {
    /// 64-bit x86 Linux.
    #[default]
    #[serde(rename = "linux/amd64")]
    LinuxAmd64,
    /// 64-bit ARM Linux.
    #[serde(rename = "linux/arm64")]
    LinuxArm64,
}

impl Platform {
    /// All platforms a debug image can be built for.
    pub const ALL: [Platform; 2] = [Platform::LinuxAmd64, Platform::LinuxArm64];

    /// The `os/arch` string docker uses for this platform.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LinuxAmd64 => "linux/amd64",
            Self::LinuxArm64 => "linux/arm64",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = GrappleError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "linux/amd64" => Ok(Self::LinuxAmd64),
            "linux/arm64" => Ok(Self::LinuxArm64),
            _ => Err(GrappleError::UnsupportedPlatform(s.to_string())),
        }
    }
}

/// A host path mounted into the patched container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Path on the node.
    pub host_path: String,
    /// Path inside the container.
    pub mount_path: String,
}

impl FromStr for Mount {
    type Err = GrappleError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some((host, mount)) if !host.is_empty() && !mount.is_empty() => Ok(Self {
                host_path: host.to_string(),
                mount_path: mount.to_string(),
            }),
            _ => Err(GrappleError::InvalidMount(s.to_string())),
        }
    }
}

/// Per-project grapple configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrappleConfig {
    /// kubectl context to use; the current context when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Namespace of the target deployment.
    pub namespace: String,
    /// Name of the target deployment.
    pub deployment: String,
    /// Container to patch; resolved from the deployment when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    /// Repository to push the debug image to; kept local when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    /// Base image to wrap; the container's current image when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Platform to build the debug image for.
    #[serde(default)]
    pub platform: Platform,
    /// Extra host mounts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,
    /// Seconds to wait for the deployment rollout to settle.
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,
}

fn default_wait_timeout_secs() -> u64 {
    DEFAULT_WAIT_TIMEOUT_SECS
}

impl GrappleConfig {
    /// Create a config for a deployment with every optional field unset.
    #[must_use]
    pub fn new(namespace: impl Into<String>, deployment: impl Into<String>) -> Self {
        Self {
            context: None,
            namespace: namespace.into(),
            deployment: deployment.into(),
            container: None,
            repository: None,
            image: None,
            platform: Platform::default(),
            mounts: Vec::new(),
            wait_timeout_secs: DEFAULT_WAIT_TIMEOUT_SECS,
        }
    }

    /// Load a config from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid YAML.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GrappleError::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: Self = serde_yaml::from_str(&content)?;
        if config.deployment.is_empty() {
            return Err(GrappleError::Config(format!(
                "{} does not name a deployment",
                path.display()
            )));
        }
        Ok(config)
    }

    /// Write the config to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)
            .map_err(|e| GrappleError::Config(format!("failed to write {}: {e}", path.display())))
    }

    /// Rollout wait timeout as a [`Duration`].
    #[must_use]
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }
}

/// Name of the snapshot configmap for a deployment.
#[must_use]
pub fn snapshot_name(deployment: &str) -> String {
    format!("{deployment}{SNAPSHOT_SUFFIX}")
}

/// Full reference of the debug image built for a deployment.
///
/// With a repository the image lives under it, otherwise it stays a bare
/// local name for clusters that share the local image store.
#[must_use]
pub fn patched_image_name(repository: Option<&str>, deployment: &str) -> String {
    let name = match repository.map(|r| r.trim_end_matches('/')) {
        Some(repo) if !repo.is_empty() => format!("{repo}/{deployment}{PATCH_IMAGE_SUFFIX}"),
        _ => format!("{deployment}{PATCH_IMAGE_SUFFIX}"),
    };
    format!("{name}:{PATCH_IMAGE_TAG}")
}

/// Resolve the config file path, defaulting to `grapple.yaml` in the working directory.
#[must_use]
pub fn config_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}
