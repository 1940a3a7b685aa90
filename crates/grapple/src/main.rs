//! grapple CLI.
//!
//! Patches a running deployment with a debugger-enabled image and rolls it
//! back again.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use grapple::config::{config_path, GrappleConfig, Mount, Platform};
use grapple::image::Docker;
use grapple::kubectl::Kubectl;
use grapple::{Grapple, PatchRequest};

mod ui;
mod wizard;

use wizard::{WizardDefaults, WizardOutcome};

/// grapple - attach a debugger to a live deployment.
#[derive(Parser)]
#[command(
    name = "grapple",
    version,
    about = "Swap a deployment's image for a debug build and roll it back",
    long_about = "Swap a running deployment's container image for a debugger-enabled\n\
                  build and restore it afterwards.\n\n\
                  The pre-patch deployment is stored in a configmap next to it, and\n\
                  rollback walks the revision history until the patch marker is gone.\n\
                  Re-running either command is safe."
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file path (default: grapple.yaml).
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// kubectl context to use.
    #[arg(long, global = true)]
    context: Option<String>,

    /// Namespace of the deployment.
    #[arg(short, long, global = true)]
    namespace: Option<String>,

    /// Deployment to operate on.
    #[arg(short, long, global = true)]
    deployment: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Patch the deployment with a debug image.
    Patch(PatchArgs),

    /// Roll the deployment back to its unpatched state.
    Rollback,

    /// Show whether the deployment is patched.
    Status,

    /// Create a config file interactively.
    Init,
}

impl GlobalArgs {
    /// Apply namespace, deployment and context flags on top of a loaded config.
    fn apply(&self, config: &mut GrappleConfig) {
        if let Some(namespace) = &self.namespace {
            config.namespace.clone_from(namespace);
        }
        if let Some(deployment) = &self.deployment {
            config.deployment.clone_from(deployment);
        }
        if self.context.is_some() {
            config.context.clone_from(&self.context);
        }
    }

    /// Config built from flags alone. Needs at least `--deployment`.
    fn config_from_flags(&self) -> Option<GrappleConfig> {
        let deployment = self.deployment.clone()?;
        let namespace = self
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let mut config = GrappleConfig::new(namespace, deployment);
        config.context.clone_from(&self.context);
        Some(config)
    }

    fn wizard_defaults(&self) -> WizardDefaults {
        WizardDefaults {
            context: self.context.clone(),
            namespace: self.namespace.clone(),
            deployment: self.deployment.clone(),
        }
    }
}

#[derive(Args, Debug)]
struct PatchArgs {
    /// Repository to push the debug image to.
    #[arg(long = "repo", value_name = "REPOSITORY")]
    repository: Option<String>,

    /// Base image to wrap (default: the container's current image).
    #[arg(long)]
    image: Option<String>,

    /// Platform of the base image (linux/amd64 or linux/arm64).
    #[arg(long)]
    platform: Option<Platform>,

    /// Container to patch.
    #[arg(long)]
    container: Option<String>,

    /// Extra host mount, repeatable.
    #[arg(long = "mount", value_name = "HOST:CONTAINER")]
    mounts: Vec<Mount>,

    /// Seconds to wait for the rollout to settle.
    #[arg(long, value_name = "SECONDS")]
    wait_timeout: Option<u64>,
}

impl PatchArgs {
    fn apply(self, config: &mut GrappleConfig) {
        if self.repository.is_some() {
            config.repository = self.repository;
        }
        if self.image.is_some() {
            config.image = self.image;
        }
        if let Some(platform) = self.platform {
            config.platform = platform;
        }
        if self.container.is_some() {
            config.container = self.container;
        }
        if !self.mounts.is_empty() {
            config.mounts = self.mounts;
        }
        if let Some(secs) = self.wait_timeout {
            config.wait_timeout_secs = secs;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.global.verbose {
        EnvFilter::new("info,grapple=debug")
    } else {
        EnvFilter::new("warn,grapple=info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let path = config_path(cli.global.config.clone());

    match cli.command {
        Commands::Init => init(&path, &cli.global).await,
        Commands::Patch(args) => {
            let Some(mut config) = resolve_config(&cli.global, &path).await? else {
                return cancelled();
            };
            args.apply(&mut config);
            patch(&config).await
        }
        Commands::Rollback => {
            let Some(config) = resolve_config(&cli.global, &path).await? else {
                return cancelled();
            };
            rollback(&config).await
        }
        Commands::Status => {
            let Some(config) = resolve_config(&cli.global, &path).await? else {
                return cancelled();
            };
            status(&config).await
        }
    }
}

/// Effective config for a command.
///
/// A config file is overridden by the global flags. Without a file, the
/// flags alone are used when they name a deployment. Otherwise the wizard
/// runs with the flags as preselected answers, and its result is saved and
/// used unchanged.
async fn resolve_config(global: &GlobalArgs, path: &Path) -> Result<Option<GrappleConfig>> {
    if path.exists() {
        let mut config = GrappleConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?;
        global.apply(&mut config);
        return Ok(Some(config));
    }
    if let Some(config) = global.config_from_flags() {
        return Ok(Some(config));
    }

    ui::note(&format!(
        "No config found at {}, starting setup",
        path.display()
    ));
    let outcome = wizard::run(global.wizard_defaults()).await?;
    save_outcome(outcome, path)
}

/// Persist a completed wizard session. A cancelled one writes nothing.
fn save_outcome(outcome: WizardOutcome, path: &Path) -> Result<Option<GrappleConfig>> {
    match outcome {
        WizardOutcome::Completed(config) => {
            config
                .save(path)
                .with_context(|| format!("Failed to write config to {}", path.display()))?;
            ui::done(&format!("Saved config to {}", path.display()));
            Ok(Some(config))
        }
        WizardOutcome::Cancelled => Ok(None),
    }
}

fn cancelled() -> Result<()> {
    ui::warn("Configuration cancelled, nothing to do.");
    Ok(())
}

fn engine(config: &GrappleConfig) -> Grapple<Kubectl, Docker> {
    let kubectl = Kubectl::new(config.namespace.clone()).with_context(config.context.clone());
    Grapple::new(kubectl, Docker::new(), config.deployment.clone())
        .with_wait_timeout(config.wait_timeout())
}

async fn init(path: &Path, global: &GlobalArgs) -> Result<()> {
    let outcome = wizard::run(global.wizard_defaults()).await?;
    if save_outcome(outcome, path)?.is_none() {
        ui::warn("Setup cancelled, no config written.");
    }
    Ok(())
}

async fn patch(config: &GrappleConfig) -> Result<()> {
    ui::header("Patching", &config.namespace, &config.deployment);
    let outcome = match engine(config).patch(PatchRequest::from(config)).await {
        Ok(outcome) => outcome,
        Err(e) => {
            if e.is_validation() {
                ui::note("Nothing in the cluster was changed.");
            }
            return Err(anyhow::Error::new(e)
                .context(format!("Failed to patch deployment {}", config.deployment)));
        }
    };

    ui::patched(&outcome);
    info!(deployment = %config.deployment, image = %outcome.image, "Patch complete");
    Ok(())
}

async fn rollback(config: &GrappleConfig) -> Result<()> {
    ui::header("Rolling back", &config.namespace, &config.deployment);
    let outcome = engine(config)
        .rollback()
        .await
        .with_context(|| format!("Failed to roll back deployment {}", config.deployment))?;

    ui::rolled_back(&outcome);
    Ok(())
}

async fn status(config: &GrappleConfig) -> Result<()> {
    ui::header("Status", &config.namespace, &config.deployment);
    let status = engine(config)
        .status()
        .await
        .with_context(|| format!("Failed to read status of {}", config.deployment))?;

    ui::status(&status);
    Ok(())
}
