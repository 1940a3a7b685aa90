//! Debug image build pipeline.
//!
//! Wraps an existing image with the debugger by building the embedded
//! Dockerfile with the original image passed as the `IMAGE` build argument.

use std::path::Path;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::Platform;
use crate::error::{GrappleError, Result};
use crate::exec;

/// Embedded Dockerfile for the debug image.
pub const DEBUG_DOCKERFILE: &str = include_str!("../assets/Dockerfile");

/// Build argument carrying the base image reference.
pub const BASE_IMAGE_BUILD_ARG: &str = "IMAGE";

/// Image operations the pipeline relies on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// The `os/arch` an image was built for.
    async fn inspect_platform(&self, image: &str) -> Result<String>;

    /// Build `context_dir` into `tag` for `platform` with the given build args.
    async fn build(
        &self,
        context_dir: &Path,
        build_args: &[(String, String)],
        tag: &str,
        platform: Platform,
    ) -> Result<()>;

    /// Push a built image.
    async fn push(&self, image: &str) -> Result<()>;
}

/// `docker` CLI backed builder.
#[derive(Debug, Clone)]
pub struct Docker {
    program: String,
}

impl Docker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            program: "docker".to_string(),
        }
    }
}

impl Default for Docker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageBuilder for Docker {
    async fn inspect_platform(&self, image: &str) -> Result<String> {
        let args = [
            "image",
            "inspect",
            "-f",
            "{{.Os}}/{{.Architecture}}",
            image,
        ]
        .map(String::from);
        let out = exec::run(&self.program, &args, None).await?;
        Ok(out.trim().to_string())
    }

    async fn build(
        &self,
        context_dir: &Path,
        build_args: &[(String, String)],
        tag: &str,
        platform: Platform,
    ) -> Result<()> {
        let mut args = vec!["build".to_string()];
        for (key, value) in build_args {
            args.push("--build-arg".to_string());
            args.push(format!("{key}={value}"));
        }
        args.extend([
            "-t".to_string(),
            tag.to_string(),
            "--platform".to_string(),
            platform.to_string(),
            context_dir.to_string_lossy().into_owned(),
        ]);
        exec::run(&self.program, &args, None).await?;
        Ok(())
    }

    async fn push(&self, image: &str) -> Result<()> {
        let args = ["push".to_string(), image.to_string()];
        exec::run(&self.program, &args, None).await?;
        Ok(())
    }
}

/// Checks, builds and publishes debug images through an [`ImageBuilder`].
#[derive(Debug, Clone)]
pub struct ImagePipeline<B> {
    builder: B,
}

impl<B: ImageBuilder> ImagePipeline<B> {
    /// Pipeline over the embedded Dockerfile.
    #[must_use]
    pub fn new(builder: B) -> Self {
        Self { builder }
    }

    /// Fail unless `image` was built for `platform`.
    ///
    /// # Errors
    ///
    /// Returns [`GrappleError::PlatformMismatch`] on a mismatch, or the
    /// builder's error if the image cannot be inspected.
    pub async fn verify_platform(&self, image: &str, platform: Platform) -> Result<()> {
        let built = self.builder.inspect_platform(image).await?;
        if built != platform.as_str() {
            return Err(GrappleError::PlatformMismatch {
                image: image.to_string(),
                built,
                requested: platform.to_string(),
            });
        }
        Ok(())
    }

    /// Build the debug image for `base_image` and tag it `target`.
    ///
    /// The Dockerfile is written to a temporary build context that is removed
    /// once the build finishes.
    ///
    /// # Errors
    ///
    /// Returns an error if the build context cannot be prepared or the build fails.
    pub async fn build(&self, base_image: &str, platform: Platform, target: &str) -> Result<String> {
        let context = tempfile::Builder::new().prefix("grapple-build-").tempdir()?;
        std::fs::write(context.path().join("Dockerfile"), DEBUG_DOCKERFILE)?;

        info!(image = target, base = base_image, %platform, "Building debug image");
        let build_args = vec![(BASE_IMAGE_BUILD_ARG.to_string(), base_image.to_string())];
        self.builder
            .build(context.path(), &build_args, target, platform)
            .await?;

        if let Err(e) = context.close() {
            warn!(error = %e, "Failed to remove build context");
        }
        Ok(target.to_string())
    }

    /// Push `image` if a repository is configured.
    ///
    /// Returns whether a push happened.
    ///
    /// # Errors
    ///
    /// Returns the builder's error if the push fails.
    pub async fn publish(&self, image: &str, repository: Option<&str>) -> Result<bool> {
        match repository {
            Some(repo) if !repo.is_empty() => {
                info!(image, "Pushing debug image");
                self.builder.push(image).await?;
                Ok(true)
            }
            _ => {
                info!(image, "No repository configured, keeping debug image local");
                Ok(false)
            }
        }
    }
}
