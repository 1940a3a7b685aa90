//! Interactive first-run configuration.
//!
//! Walks the user through picking a namespace, deployment and container from
//! the live cluster. Pressing Esc on any selection cancels the session and
//! returns [`WizardOutcome::Cancelled`]; nothing is written in that case.
//!
//! Namespace and deployment flags given on the command line preselect the
//! matching entries, so the saved config is the one that runs.

use anyhow::{Context, Result};
use colored::Colorize;
use dialoguer::{theme::ColorfulTheme, Confirm, Input, Select};

use grapple::config::{GrappleConfig, Mount, Platform};
use grapple::kubectl::{container_image, container_names, ClusterGateway, Kubectl};

/// Result of an interactive configuration session.
#[derive(Debug)]
pub enum WizardOutcome {
    /// The user finished and confirmed the config.
    Completed(GrappleConfig),
    /// The user backed out.
    Cancelled,
}

/// Values preselected in the wizard's prompts.
#[derive(Debug, Clone, Default)]
pub struct WizardDefaults {
    pub context: Option<String>,
    pub namespace: Option<String>,
    pub deployment: Option<String>,
}

/// Run the configuration wizard against the cluster behind `defaults.context`.
pub async fn run(defaults: WizardDefaults) -> Result<WizardOutcome> {
    let context = defaults.context;
    let theme = ColorfulTheme::default();

    println!();
    println!("{}", "Let's configure grapple for this project.".cyan().bold());
    println!("{}", "Press Esc on any selection to cancel.".bright_black());
    println!();

    let cluster = Kubectl::new("default").with_context(context.clone());
    let namespaces = cluster
        .list_namespaces()
        .await
        .context("Failed to list namespaces")?;
    let Some(namespace) = select(
        &theme,
        "Namespace",
        &namespaces,
        defaults.namespace.as_deref(),
    )?
    else {
        return Ok(WizardOutcome::Cancelled);
    };

    let kubectl = Kubectl::new(namespace.clone()).with_context(context.clone());
    let deployments = kubectl
        .list_deployments()
        .await
        .with_context(|| format!("Failed to list deployments in {namespace}"))?;
    if deployments.is_empty() {
        anyhow::bail!("No deployments found in namespace {namespace}");
    }
    let Some(deployment_name) = select(
        &theme,
        "Deployment",
        &deployments,
        defaults.deployment.as_deref(),
    )?
    else {
        return Ok(WizardOutcome::Cancelled);
    };

    let deployment = kubectl
        .get_deployment(&deployment_name)
        .await
        .with_context(|| format!("Failed to read deployment {deployment_name}"))?;
    let containers = container_names(&deployment);
    if containers.is_empty() {
        anyhow::bail!("Deployment {deployment_name} has no containers");
    }
    let container = if containers.len() == 1 {
        containers[0].clone()
    } else {
        let Some(container) = select(&theme, "Container", &containers, None)? else {
            return Ok(WizardOutcome::Cancelled);
        };
        container
    };

    let current_image = container_image(&deployment, &container).unwrap_or_default();
    let image: String = Input::with_theme(&theme)
        .with_prompt("Base image to wrap")
        .default(current_image)
        .interact_text()?;

    let repository: String = Input::with_theme(&theme)
        .with_prompt("Repository to push the debug image to (empty keeps it local)")
        .allow_empty(true)
        .interact_text()?;

    let platforms: Vec<&str> = Platform::ALL.iter().map(Platform::as_str).collect();
    let Some(platform_idx) = Select::with_theme(&theme)
        .with_prompt("Platform")
        .items(&platforms)
        .default(0)
        .interact_opt()?
    else {
        return Ok(WizardOutcome::Cancelled);
    };

    let mut mounts = Vec::new();
    loop {
        let raw: String = Input::with_theme(&theme)
            .with_prompt("Host mount HOST_PATH:MOUNT_PATH (empty to finish)")
            .allow_empty(true)
            .validate_with(|input: &String| -> Result<(), String> {
                if input.is_empty() {
                    return Ok(());
                }
                input.parse::<Mount>().map(|_| ()).map_err(|e| e.to_string())
            })
            .interact_text()?;
        if raw.is_empty() {
            break;
        }
        mounts.push(raw.parse::<Mount>()?);
    }

    let mut config = GrappleConfig::new(namespace, deployment_name);
    config.context = context;
    config.container = Some(container);
    config.image = Some(image).filter(|i| !i.is_empty());
    config.repository = Some(repository).filter(|r| !r.is_empty());
    config.platform = Platform::ALL[platform_idx];
    config.mounts = mounts;

    let confirmed = Confirm::with_theme(&theme)
        .with_prompt("Save this configuration?")
        .default(true)
        .interact_opt()?;
    if confirmed == Some(true) {
        Ok(WizardOutcome::Completed(config))
    } else {
        Ok(WizardOutcome::Cancelled)
    }
}

fn select(
    theme: &ColorfulTheme,
    prompt: &str,
    items: &[String],
    preferred: Option<&str>,
) -> Result<Option<String>> {
    let idx = Select::with_theme(theme)
        .with_prompt(prompt)
        .items(items)
        .default(preferred_index(items, preferred))
        .interact_opt()?;
    Ok(idx.map(|i| items[i].clone()))
}

/// Index of `preferred` in `items`, or the first entry.
fn preferred_index(items: &[String], preferred: Option<&str>) -> usize {
    preferred
        .and_then(|wanted| items.iter().position(|item| item == wanted))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preferred_index() {
        let items = vec!["default".to_string(), "shop".to_string()];
        assert_eq!(preferred_index(&items, Some("shop")), 1);
        assert_eq!(preferred_index(&items, Some("missing")), 0);
        assert_eq!(preferred_index(&items, None), 0);
    }
}
