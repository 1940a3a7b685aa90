//! Deployment patch rendering.
//!
//! The patch is a handlebars template over [`PatchValues`]. Rendering runs in
//! strict mode so a missing value fails instead of producing a half-empty
//! patch, and the result is parsed back before anyone applies it.

use handlebars::Handlebars;
use serde::Serialize;
use serde_json::Value;

use crate::config::{
    Mount, CREATED_BY_ANNOTATION, PATCH_CHANGE_CAUSE, PATCH_CREATOR, SNAPSHOT_MOUNT_PATH,
};
use crate::error::{GrappleError, Result};

/// Embedded strategic merge patch template.
pub const DEPLOYMENT_PATCH_TEMPLATE: &str = include_str!("../assets/deployment-patch.yaml");

const TEMPLATE_NAME: &str = "deployment_patch";

/// Snapshot configmap mounted into the patched container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigMapMount {
    /// Configmap name.
    pub name: String,
    /// Mount path inside the container.
    pub mount_path: String,
}

/// Values the patch template is rendered with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchValues {
    pub change_cause: String,
    pub created_by_key: String,
    pub created_by: String,
    pub deployment: String,
    pub container: String,
    pub image: String,
    pub config_map: ConfigMapMount,
    pub mounts: Vec<Mount>,
}

impl PatchValues {
    /// Values for patching `container` of `deployment` to `image`.
    ///
    /// The marker annotation, change cause and snapshot mount are fixed.
    #[must_use]
    pub fn new(deployment: &str, container: &str, image: &str, mounts: Vec<Mount>) -> Self {
        Self {
            change_cause: PATCH_CHANGE_CAUSE.to_string(),
            created_by_key: CREATED_BY_ANNOTATION.to_string(),
            created_by: PATCH_CREATOR.to_string(),
            deployment: deployment.to_string(),
            container: container.to_string(),
            image: image.to_string(),
            config_map: ConfigMapMount {
                name: crate::config::snapshot_name(deployment),
                mount_path: SNAPSHOT_MOUNT_PATH.to_string(),
            },
            mounts,
        }
    }
}

/// A rendered, parsed patch document.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchDocument {
    value: Value,
}

impl PatchDocument {
    /// The parsed patch.
    #[must_use]
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Serialize as JSON for `kubectl patch`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.value)?)
    }

    /// Image set on the named container, if the patch touches it.
    #[must_use]
    pub fn container_image(&self, container: &str) -> Option<&str> {
        self.value
            .pointer("/spec/template/spec/containers")?
            .as_array()?
            .iter()
            .find(|c| c.get("name").and_then(Value::as_str) == Some(container))?
            .get("image")?
            .as_str()
    }

    /// Value of a pod template annotation written by the patch.
    #[must_use]
    pub fn pod_template_annotation(&self, key: &str) -> Option<&str> {
        self.value
            .pointer("/spec/template/metadata/annotations")?
            .get(key)?
            .as_str()
    }
}

/// Render `template` with `values` and parse the result.
///
/// # Errors
///
/// Returns [`GrappleError::Template`] if the template is invalid, references a
/// value that is not set, or renders into something that is not a YAML mapping.
pub fn render_patch(template: &str, values: &PatchValues) -> Result<PatchDocument> {
    let mut handlebars = Handlebars::new();
    handlebars.set_strict_mode(true);
    // Every interpolated value sits inside a YAML double-quoted scalar.
    handlebars.register_escape_fn(escape_double_quoted);
    handlebars
        .register_template_string(TEMPLATE_NAME, template)
        .map_err(|e| GrappleError::Template(format!("failed to register patch template: {e}")))?;

    let rendered = handlebars.render(TEMPLATE_NAME, values)?;

    let value: Value = serde_yaml::from_str(&rendered)
        .map_err(|e| GrappleError::Template(format!("rendered patch is not valid YAML: {e}")))?;
    if !value.is_object() {
        return Err(GrappleError::Template(
            "rendered patch is not a mapping".to_string(),
        ));
    }
    Ok(PatchDocument { value })
}

/// Escape `raw` for use between YAML double quotes.
///
/// JSON string escapes are a subset of YAML's double-quoted escapes, so
/// control characters such as newlines survive the round trip.
fn escape_double_quoted(raw: &str) -> String {
    let quoted = Value::from(raw).to_string();
    quoted
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(&quoted)
        .to_string()
}

/// Render the embedded deployment patch template.
///
/// # Errors
///
/// See [`render_patch`].
pub fn render_default_patch(values: &PatchValues) -> Result<PatchDocument> {
    render_patch(DEPLOYMENT_PATCH_TEMPLATE, values)
}
