//! Cluster command gateway.
//!
//! Every cluster operation the patch engine needs goes through the
//! [`ClusterGateway`] trait. [`Kubectl`] implements it by shelling out to
//! `kubectl`, which gives us `rollout undo` and `rollout status` semantics
//! that the API server does not expose directly.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::config::REVISION_ANNOTATION;
use crate::error::{GrappleError, Result};
use crate::exec;

/// Operations the patch engine and rollback controller issue against the cluster.
///
/// All methods act on the gateway's namespace.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    /// Fetch a deployment by name.
    async fn get_deployment(&self, name: &str) -> Result<Deployment>;

    /// List namespace names visible to the current context.
    async fn list_namespaces(&self) -> Result<Vec<String>>;

    /// List deployment names in the namespace.
    async fn list_deployments(&self) -> Result<Vec<String>>;

    /// Whether a configmap exists.
    async fn config_map_exists(&self, name: &str) -> Result<bool>;

    /// Create a configmap holding `data`.
    async fn create_config_map(&self, name: &str, data: BTreeMap<String, String>) -> Result<()>;

    /// Delete a configmap. Fails if it does not exist.
    async fn delete_config_map(&self, name: &str) -> Result<()>;

    /// Apply a strategic merge patch (JSON) to a deployment.
    async fn patch_deployment(&self, name: &str, patch: &str) -> Result<()>;

    /// Block until the deployment rollout completes or `timeout` elapses.
    async fn wait_for_rollout(&self, name: &str, timeout: Duration) -> Result<()>;

    /// Undo the deployment to a specific revision.
    async fn rollout_undo(&self, name: &str, revision: i64) -> Result<()>;

    /// The deployment's latest revision number.
    async fn latest_revision(&self, name: &str) -> Result<i64>;

    /// Overwrite the deployment's change-cause annotation.
    async fn update_change_cause(&self, name: &str, cause: &str) -> Result<()>;
}

/// `kubectl`-backed gateway bound to one namespace (and optionally one context).
#[derive(Debug, Clone)]
pub struct Kubectl {
    program: String,
    namespace: String,
    context: Option<String>,
}

impl Kubectl {
    /// Create a gateway for `namespace` using the current kubectl context.
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            program: "kubectl".to_string(),
            namespace: namespace.into(),
            context: None,
        }
    }

    /// Use a specific kubectl context instead of the current one.
    #[must_use]
    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context;
        self
    }

    fn global_args(&self, namespaced: bool) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(context) = &self.context {
            args.push("--context".to_string());
            args.push(context.clone());
        }
        if namespaced {
            args.push("-n".to_string());
            args.push(self.namespace.clone());
        }
        args
    }

    async fn kubectl(&self, args: &[&str]) -> Result<String> {
        let mut full = self.global_args(true);
        full.extend(args.iter().map(ToString::to_string));
        exec::run(&self.program, &full, None).await
    }

    async fn kubectl_stdin(&self, args: &[&str], stdin: &[u8]) -> Result<String> {
        let mut full = self.global_args(true);
        full.extend(args.iter().map(ToString::to_string));
        exec::run(&self.program, &full, Some(stdin)).await
    }
}

#[async_trait]
impl ClusterGateway for Kubectl {
    async fn get_deployment(&self, name: &str) -> Result<Deployment> {
        let out = self.kubectl(&["get", "deployment", name, "-o", "json"]).await?;
        Ok(serde_json::from_str(&out)?)
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        let mut args = self.global_args(false);
        args.extend(["get", "namespace", "-o", "name"].map(String::from));
        let out = exec::run(&self.program, &args, None).await?;
        parse_resources(&out, "namespace/")
    }

    async fn list_deployments(&self) -> Result<Vec<String>> {
        let out = self.kubectl(&["get", "deployment", "-o", "name"]).await?;
        parse_resources(&out, "deployment.apps/")
    }

    async fn config_map_exists(&self, name: &str) -> Result<bool> {
        let out = self
            .kubectl(&["get", "configmap", name, "-o", "name", "--ignore-not-found"])
            .await?;
        Ok(!out.trim().is_empty())
    }

    async fn create_config_map(&self, name: &str, data: BTreeMap<String, String>) -> Result<()> {
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                ..ObjectMeta::default()
            },
            data: Some(data),
            ..ConfigMap::default()
        };
        // The snapshot can exceed argv limits, so it goes in on stdin.
        let manifest = serde_json::to_vec(&config_map)?;
        self.kubectl_stdin(&["create", "-f", "-"], &manifest).await?;
        info!(configmap = name, namespace = %self.namespace, "Created configmap");
        Ok(())
    }

    async fn delete_config_map(&self, name: &str) -> Result<()> {
        self.kubectl(&["delete", "configmap", name]).await?;
        debug!(configmap = name, "Deleted configmap");
        Ok(())
    }

    async fn patch_deployment(&self, name: &str, patch: &str) -> Result<()> {
        self.kubectl(&["patch", "deployment", name, "--patch", patch])
            .await?;
        Ok(())
    }

    async fn wait_for_rollout(&self, name: &str, timeout: Duration) -> Result<()> {
        let target = format!("deployment/{name}");
        let timeout = format!("{}s", timeout.as_secs());
        self.kubectl(&["rollout", "status", &target, "-w", "--timeout", &timeout])
            .await?;
        Ok(())
    }

    async fn rollout_undo(&self, name: &str, revision: i64) -> Result<()> {
        let target = format!("deployment/{name}");
        let to_revision = format!("--to-revision={revision}");
        self.kubectl(&["rollout", "undo", &target, &to_revision])
            .await?;
        Ok(())
    }

    async fn latest_revision(&self, name: &str) -> Result<i64> {
        let deployment = self.get_deployment(name).await?;
        latest_revision_of(&deployment)
    }

    async fn update_change_cause(&self, name: &str, cause: &str) -> Result<()> {
        let target = format!("deployment/{name}");
        let annotation = format!("{}={cause}", crate::config::CHANGE_CAUSE_ANNOTATION);
        self.kubectl(&["annotate", &target, &annotation, "--overwrite"])
            .await?;
        Ok(())
    }
}

/// Read the latest revision number from a deployment's annotations.
///
/// # Errors
///
/// Returns [`GrappleError::Parse`] if the annotation is missing or not a number.
pub fn latest_revision_of(deployment: &Deployment) -> Result<i64> {
    let raw = deployment
        .annotations()
        .get(REVISION_ANNOTATION)
        .ok_or_else(|| {
            GrappleError::Parse(format!(
                "deployment {} has no {REVISION_ANNOTATION} annotation",
                deployment.name_any()
            ))
        })?;
    raw.trim().parse().map_err(|_| {
        GrappleError::Parse(format!(
            "deployment {} has non-numeric revision {raw:?}",
            deployment.name_any()
        ))
    })
}

/// Names of the containers in a deployment's pod template.
#[must_use]
pub fn container_names(deployment: &Deployment) -> Vec<String> {
    deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .map(|pod| pod.containers.iter().map(|c| c.name.clone()).collect())
        .unwrap_or_default()
}

/// Current image of a named container in a deployment's pod template.
#[must_use]
pub fn container_image(deployment: &Deployment, container: &str) -> Option<String> {
    deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .and_then(|pod| pod.containers.iter().find(|c| c.name == container))
        .and_then(|c| c.image.clone())
}

/// Value of an annotation on a deployment's pod template metadata.
#[must_use]
pub fn pod_template_annotation<'a>(deployment: &'a Deployment, key: &str) -> Option<&'a str> {
    deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.metadata.as_ref())
        .and_then(|meta| meta.annotations.as_ref())
        .and_then(|annotations| annotations.get(key))
        .map(String::as_str)
}

/// Parse `kubectl get -o name` output, stripping the resource `prefix`.
///
/// # Errors
///
/// Returns [`GrappleError::Parse`] if a line does not carry the prefix.
pub fn parse_resources(out: &str, prefix: &str) -> Result<Vec<String>> {
    out.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.strip_prefix(prefix)
                .map(ToString::to_string)
                .ok_or_else(|| GrappleError::Parse(format!("prefix {prefix:?} not found in {line:?}")))
        })
        .collect()
}
