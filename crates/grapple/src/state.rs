//! Patch state detection.

use tracing::debug;

use crate::config::{CREATED_BY_ANNOTATION, PATCH_CREATOR};
use crate::kubectl::{pod_template_annotation, ClusterGateway};

/// Whether the live deployment carries the grapple patch marker.
///
/// A deployment that cannot be read is reported as not patched: from our
/// point of view an unreachable workload has no patch to undo.
pub async fn is_patched<G: ClusterGateway + ?Sized>(gateway: &G, deployment: &str) -> bool {
    match gateway.get_deployment(deployment).await {
        Ok(d) => pod_template_annotation(&d, CREATED_BY_ANNOTATION) == Some(PATCH_CREATOR),
        Err(e) => {
            debug!(deployment, error = %e, "Could not read deployment, treating as unpatched");
            false
        }
    }
}
