//! Rollback controller.
//!
//! Walks the deployment's revision history backwards one revision at a time
//! and checks the live marker after every undo. Intermediate revisions can be
//! patched too, so the target is never computed up front.

use tracing::{debug, info, warn};

use crate::error::{GrappleError, Result};
use crate::image::ImageBuilder;
use crate::kubectl::ClusterGateway;
use crate::patch::Grapple;

/// Where a successful rollback ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackOutcome {
    /// Revision the deployment was undone to.
    pub revision: i64,
    /// Number of undo steps it took.
    pub steps: usize,
}

impl<G: ClusterGateway, B: ImageBuilder> Grapple<G, B> {
    /// Restore the deployment to its unpatched state.
    ///
    /// # Errors
    ///
    /// Returns [`GrappleError::NotPatched`] without touching the cluster if the
    /// deployment carries no marker, and [`GrappleError::RollbackExhausted`]
    /// if every revision was undone and the marker is still there.
    pub async fn rollback(&self) -> Result<RollbackOutcome> {
        info!(deployment = %self.deployment, "Rolling back");
        if !self.is_patched().await {
            return Err(GrappleError::NotPatched(self.deployment.clone()));
        }
        self.rollback_patched().await
    }

    /// Rollback loop; the caller has already seen the marker.
    pub(crate) async fn rollback_patched(&self) -> Result<RollbackOutcome> {
        let latest = self.gateway.latest_revision(&self.deployment).await?;
        let snapshot = self.snapshot_name();

        let snapshot_present = match self.gateway.config_map_exists(&snapshot).await {
            Ok(true) => true,
            Ok(false) => {
                warn!(
                    deployment = %self.deployment,
                    configmap = %snapshot,
                    "Invalid patch state: marker present but no snapshot found"
                );
                false
            }
            Err(e) => {
                warn!(configmap = %snapshot, error = %e, "Could not check for deployment snapshot");
                false
            }
        };

        for (step, revision) in (0..latest).rev().enumerate() {
            info!(configmap = %snapshot, "Removing deployment snapshot");
            if let Err(e) = self.gateway.delete_config_map(&snapshot).await {
                if step == 0 && snapshot_present {
                    warn!(configmap = %snapshot, error = %e, "Failed to remove deployment snapshot");
                } else {
                    debug!(configmap = %snapshot, "Deployment snapshot already removed");
                }
            }

            info!(deployment = %self.deployment, revision, "Rolling back deployment");
            self.gateway
                .rollout_undo(&self.deployment, revision)
                .await?;

            if !self.is_patched().await {
                self.gateway
                    .update_change_cause(
                        &self.deployment,
                        &format!("grapple rollback to revision {revision}"),
                    )
                    .await?;
                info!(deployment = %self.deployment, revision, "Deployment is unpatched");
                return Ok(RollbackOutcome {
                    revision,
                    steps: step + 1,
                });
            }
        }

        Err(GrappleError::RollbackExhausted(self.deployment.clone()))
    }
}
