//! grapple: debug-image patching for Kubernetes deployments.
//!
//! Swaps the image of a running deployment's container for a build that
//! bundles a debugger, keeping a snapshot of the original deployment in a
//! configmap, and reverses the swap by walking the revision history until
//! the patch marker is gone.
//!
//! # Example
//!
//! ```rust,ignore
//! use grapple::{Grapple, PatchRequest};
//! use grapple::image::Docker;
//! use grapple::kubectl::Kubectl;
//!
//! #[tokio::main]
//! async fn main() -> grapple::Result<()> {
//!     let grapple = Grapple::new(Kubectl::new("shop"), Docker::new(), "api");
//!
//!     grapple.patch(PatchRequest::default()).await?;
//!     // ... attach the debugger ...
//!     grapple.rollback().await?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
mod exec;
pub mod image;
pub mod kubectl;
pub mod patch;
pub mod rollback;
pub mod state;
pub mod template;

pub use config::{GrappleConfig, Mount, Platform};
pub use error::{GrappleError, Result};
pub use patch::{Grapple, PatchOutcome, PatchRequest, PatchStatus};
pub use rollback::RollbackOutcome;
