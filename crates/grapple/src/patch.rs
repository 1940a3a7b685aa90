//! Patch engine.
//!
//! [`Grapple`] swaps a deployment's container image for a debug build. Every
//! decision re-reads the live deployment; nothing is cached between steps, so
//! a crashed or concurrent run can always be recovered with a rollback.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::config::{
    patched_image_name, snapshot_name, GrappleConfig, Mount, Platform, CREATED_BY_ANNOTATION,
    DEFAULT_WAIT_TIMEOUT_SECS, PATCH_CREATOR, SNAPSHOT_KEY,
};
use crate::error::{GrappleError, Result};
use crate::image::{ImageBuilder, ImagePipeline};
use crate::kubectl::{container_image, container_names, ClusterGateway};
use crate::state;
use crate::template::{render_default_patch, PatchValues};

/// Inputs to a single patch run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchRequest {
    /// Repository to push the debug image to. The image stays local when unset.
    pub repository: Option<String>,
    /// Base image to wrap. Defaults to the target container's current image.
    pub image: Option<String>,
    /// Platform the base image must have been built for.
    pub platform: Platform,
    /// Target container. Resolved from the deployment when unset.
    pub container: Option<String>,
    /// Extra host paths to mount into the container.
    pub mounts: Vec<Mount>,
}

impl From<&GrappleConfig> for PatchRequest {
    fn from(config: &GrappleConfig) -> Self {
        Self {
            repository: config.repository.clone(),
            image: config.image.clone(),
            platform: config.platform,
            container: config.container.clone(),
            mounts: config.mounts.clone(),
        }
    }
}

/// What a successful patch did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOutcome {
    /// Container that was patched.
    pub container: String,
    /// Image the debug image was built from.
    pub base_image: String,
    /// Debug image now running in the container.
    pub image: String,
    /// Whether the debug image was pushed.
    pub pushed: bool,
    /// Whether an earlier patch had to be rolled back first.
    pub rolled_back_first: bool,
}

/// Snapshot of what the cluster says about a deployment's patch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchStatus {
    /// Patch marker present on the pod template.
    pub patched: bool,
    /// Snapshot configmap present.
    pub snapshot_present: bool,
}

impl PatchStatus {
    /// Marker and snapshot agree.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.patched == self.snapshot_present
    }
}

/// Patch and rollback orchestration for one deployment.
pub struct Grapple<G, B> {
    pub(crate) gateway: G,
    pub(crate) images: ImagePipeline<B>,
    pub(crate) deployment: String,
    pub(crate) wait_timeout: Duration,
}

impl<G: ClusterGateway, B: ImageBuilder> Grapple<G, B> {
    /// Orchestrator for `deployment` using the given gateway and image builder.
    pub fn new(gateway: G, builder: B, deployment: impl Into<String>) -> Self {
        Self {
            gateway,
            images: ImagePipeline::new(builder),
            deployment: deployment.into(),
            wait_timeout: Duration::from_secs(DEFAULT_WAIT_TIMEOUT_SECS),
        }
    }

    /// Set how long to wait for rollouts to settle.
    #[must_use]
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Name of the snapshot configmap for this deployment.
    pub fn snapshot_name(&self) -> String {
        snapshot_name(&self.deployment)
    }

    /// Whether the deployment currently carries the patch marker.
    pub async fn is_patched(&self) -> bool {
        state::is_patched(&self.gateway, &self.deployment).await
    }

    /// Marker and snapshot presence as the cluster reports them now.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot lookup fails.
    pub async fn status(&self) -> Result<PatchStatus> {
        let patched = self.is_patched().await;
        let snapshot_present = self.gateway.config_map_exists(&self.snapshot_name()).await?;
        Ok(PatchStatus {
            patched,
            snapshot_present,
        })
    }

    /// Replace the target container's image with a debug build.
    ///
    /// An existing patch is rolled back first, so patching twice leaves a
    /// single marker and a single snapshot.
    ///
    /// # Errors
    ///
    /// Validation errors ([`GrappleError::UnknownContainer`],
    /// [`GrappleError::PlatformMismatch`]) are returned before anything in
    /// the cluster changes. Any later failure is returned as-is; the snapshot
    /// is left in place so [`Grapple::rollback`] can recover.
    pub async fn patch(&self, request: PatchRequest) -> Result<PatchOutcome> {
        let mut rolled_back_first = false;
        if self.is_patched().await {
            warn!(deployment = %self.deployment, "Deployment already patched, rolling back first");
            self.rollback_patched().await?;
            rolled_back_first = true;
        }

        let deployment = self.gateway.get_deployment(&self.deployment).await?;
        let container = resolve_container(&deployment, request.container.as_deref())?;

        let base_image = match request.image.filter(|image| !image.is_empty()) {
            Some(image) => image,
            None => container_image(&deployment, &container).ok_or_else(|| {
                GrappleError::Parse(format!(
                    "container {container} in deployment {} has no image",
                    self.deployment
                ))
            })?,
        };
        self.images
            .verify_platform(&base_image, request.platform)
            .await?;

        self.store_snapshot(&deployment).await?;

        info!(deployment = %self.deployment, "Waiting for deployment to get ready");
        self.gateway
            .wait_for_rollout(&self.deployment, self.wait_timeout)
            .await?;

        let target = patched_image_name(request.repository.as_deref(), &self.deployment);
        let image = self
            .images
            .build(&base_image, request.platform, &target)
            .await?;
        let pushed = self
            .images
            .publish(&image, request.repository.as_deref())
            .await?;

        info!("Rendering deployment patch");
        let values = PatchValues::new(&self.deployment, &container, &image, request.mounts);
        let patch = render_default_patch(&values)?;
        if patch.container_image(&container) != Some(image.as_str())
            || patch.pod_template_annotation(CREATED_BY_ANNOTATION) != Some(PATCH_CREATOR)
        {
            return Err(GrappleError::Template(format!(
                "rendered patch does not set image and marker on container {container}"
            )));
        }

        info!(deployment = %self.deployment, container = %container, image = %image, "Patching deployment");
        self.gateway
            .patch_deployment(&self.deployment, &patch.to_json()?)
            .await?;

        self.gateway
            .wait_for_rollout(&self.deployment, self.wait_timeout)
            .await?;

        Ok(PatchOutcome {
            container,
            base_image,
            image,
            pushed,
            rolled_back_first,
        })
    }

    async fn store_snapshot(&self, deployment: &Deployment) -> Result<()> {
        let name = self.snapshot_name();
        info!(configmap = %name, "Storing deployment snapshot");
        let serialized = serde_json::to_string(deployment)?;

        // A stale snapshot from an interrupted run would block the create.
        if let Err(e) = self.gateway.delete_config_map(&name).await {
            debug!(configmap = %name, error = %e, "No stale snapshot to remove");
        }

        let data = BTreeMap::from([(SNAPSHOT_KEY.to_string(), serialized)]);
        self.gateway.create_config_map(&name, data).await
    }
}

/// Pick the container to patch.
///
/// An explicit name must exist. Without one, a single-container deployment
/// uses its only container and otherwise a container named like the
/// deployment is chosen.
///
/// # Errors
///
/// Returns [`GrappleError::UnknownContainer`] if no container matches.
pub fn resolve_container(deployment: &Deployment, requested: Option<&str>) -> Result<String> {
    let available = container_names(deployment);
    let name = deployment.name_any();
    let unknown = |container: &str| GrappleError::UnknownContainer {
        deployment: name.clone(),
        container: container.to_string(),
        available: available.clone(),
    };

    match requested.filter(|c| !c.is_empty()) {
        Some(container) if available.iter().any(|c| c == container) => Ok(container.to_string()),
        Some(container) => Err(unknown(container)),
        None if available.len() == 1 => Ok(available[0].clone()),
        None if available.contains(&name) => Ok(name.clone()),
        None => Err(unknown("")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::MockImageBuilder;
    use crate::kubectl::MockClusterGateway;
    use serde_json::{json, Value};

    fn deployment(containers: &[&str]) -> Deployment {
        let containers: Vec<Value> = containers
            .iter()
            .map(|name| json!({ "name": name, "image": format!("acme/{name}:1.0") }))
            .collect();
        serde_json::from_value(json!({
            "metadata": { "name": "api", "annotations": { "deployment.kubernetes.io/revision": "2" } },
            "spec": {
                "selector": {},
                "template": { "spec": { "containers": containers } }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_resolve_container() {
        let single = deployment(&["app"]);
        assert_eq!(resolve_container(&single, None).unwrap(), "app");
        assert_eq!(resolve_container(&single, Some("")).unwrap(), "app");
        assert_eq!(resolve_container(&single, Some("app")).unwrap(), "app");

        let multi = deployment(&["sidecar", "api"]);
        assert_eq!(resolve_container(&multi, None).unwrap(), "api");

        let ambiguous = deployment(&["sidecar", "worker"]);
        assert!(matches!(
            resolve_container(&ambiguous, None),
            Err(GrappleError::UnknownContainer { .. })
        ));

        match resolve_container(&multi, Some("web")) {
            Err(GrappleError::UnknownContainer {
                container,
                available,
                ..
            }) => {
                assert_eq!(container, "web");
                assert_eq!(available, vec!["sidecar", "api"]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_patch_request_from_config() {
        let mut config = GrappleConfig::new("shop", "api");
        config.repository = Some("ghcr.io/acme".to_string());
        config.platform = Platform::LinuxArm64;
        let request = PatchRequest::from(&config);
        assert_eq!(request.repository.as_deref(), Some("ghcr.io/acme"));
        assert_eq!(request.platform, Platform::LinuxArm64);
        assert!(request.container.is_none());
    }

    #[tokio::test]
    async fn test_unknown_container_touches_nothing() {
        let mut gateway = MockClusterGateway::new();
        gateway
            .expect_get_deployment()
            .returning(|_| Ok(deployment(&["app"])));
        gateway.expect_create_config_map().times(0);
        gateway.expect_delete_config_map().times(0);
        gateway.expect_patch_deployment().times(0);
        let mut builder = MockImageBuilder::new();
        builder.expect_inspect_platform().times(0);

        let grapple = Grapple::new(gateway, builder, "api");
        let err = grapple
            .patch(PatchRequest {
                container: Some("web".to_string()),
                ..PatchRequest::default()
            })
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_patch_runs_steps_in_order() {
        let mut seq = mockall::Sequence::new();
        let mut gateway = MockClusterGateway::new();
        let mut builder = MockImageBuilder::new();

        // State check, then the fresh read for validation.
        gateway
            .expect_get_deployment()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Ok(deployment(&["app"])));
        builder
            .expect_inspect_platform()
            .withf(|image| image == "acme/app:1.0")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok("linux/amd64".to_string()));
        gateway
            .expect_delete_config_map()
            .withf(|name| name == "api-grapple-snapshot")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        gateway
            .expect_create_config_map()
            .withf(|name, data| {
                name == "api-grapple-snapshot"
                    && data
                        .get(SNAPSHOT_KEY)
                        .is_some_and(|json| json.contains("acme/app:1.0"))
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        gateway
            .expect_wait_for_rollout()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        builder
            .expect_build()
            .withf(|_, _, tag, _| tag == "ghcr.io/acme/api-grapple-debug:latest")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(()));
        builder
            .expect_push()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        gateway
            .expect_patch_deployment()
            .withf(|name, patch| {
                let value: Value = serde_json::from_str(patch).unwrap_or_default();
                name == "api"
                    && value.pointer("/spec/template/spec/containers/0/image")
                        == Some(&Value::from("ghcr.io/acme/api-grapple-debug:latest"))
                    && value
                        .pointer("/spec/template/metadata/annotations")
                        .and_then(|a| a.get(CREATED_BY_ANNOTATION))
                        == Some(&Value::from(PATCH_CREATOR))
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        gateway
            .expect_wait_for_rollout()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let grapple = Grapple::new(gateway, builder, "api");
        let outcome = grapple
            .patch(PatchRequest {
                repository: Some("ghcr.io/acme".to_string()),
                ..PatchRequest::default()
            })
            .await
            .unwrap();

        assert_eq!(outcome.container, "app");
        assert_eq!(outcome.base_image, "acme/app:1.0");
        assert_eq!(outcome.image, "ghcr.io/acme/api-grapple-debug:latest");
        assert!(outcome.pushed);
        assert!(!outcome.rolled_back_first);
    }

    #[tokio::test]
    async fn test_rollout_timeout_keeps_snapshot() {
        let mut gateway = MockClusterGateway::new();
        gateway
            .expect_get_deployment()
            .returning(|_| Ok(deployment(&["app"])));
        gateway.expect_delete_config_map().returning(|_| Ok(()));
        gateway
            .expect_create_config_map()
            .times(1)
            .returning(|_, _| Ok(()));
        gateway.expect_wait_for_rollout().returning(|_, _| {
            Err(GrappleError::Command {
                program: "kubectl".to_string(),
                args: Vec::new(),
                stderr: "timed out waiting for the condition".to_string(),
            })
        });
        gateway.expect_patch_deployment().times(0);
        let mut builder = MockImageBuilder::new();
        builder
            .expect_inspect_platform()
            .returning(|_| Ok("linux/amd64".to_string()));
        builder.expect_build().times(0);

        let grapple = Grapple::new(gateway, builder, "api").with_wait_timeout(Duration::from_secs(1));
        let err = grapple.patch(PatchRequest::default()).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_status_reports_inconsistency() {
        let mut gateway = MockClusterGateway::new();
        gateway.expect_get_deployment().returning(|_| {
            let mut d = deployment(&["app"]);
            if let Some(spec) = d.spec.as_mut() {
                spec.template.metadata = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                    annotations: Some(BTreeMap::from([(
                        CREATED_BY_ANNOTATION.to_string(),
                        PATCH_CREATOR.to_string(),
                    )])),
                    ..Default::default()
                });
            }
            Ok(d)
        });
        gateway.expect_config_map_exists().returning(|_| Ok(false));

        let grapple = Grapple::new(gateway, MockImageBuilder::new(), "api");
        let status = grapple.status().await.unwrap();
        assert!(status.patched);
        assert!(!status.snapshot_present);
        assert!(!status.is_consistent());
    }
}
