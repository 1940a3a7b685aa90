//! Terminal output for the grapple CLI.

use colored::Colorize;

use grapple::{PatchOutcome, PatchStatus, RollbackOutcome};

const RULE_WIDTH: usize = 60;

/// Header naming the action and the `namespace/deployment` it targets.
pub fn header(action: &str, namespace: &str, deployment: &str) {
    println!();
    println!(
        "{} {}",
        action.cyan().bold(),
        format!("{namespace}/{deployment}").bold()
    );
    println!("{}", "─".repeat(RULE_WIDTH).bright_black());
}

pub fn done(message: &str) {
    println!("{} {}", "✓".green().bold(), message.green());
}

pub fn warn(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message.yellow());
}

pub fn note(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

fn field(key: &str, value: &str) {
    println!("  {:<12} {}", format!("{key}:").bright_black(), value);
}

/// Summary block after a successful patch.
pub fn patched(outcome: &PatchOutcome) {
    if outcome.rolled_back_first {
        note("Previous patch was rolled back first");
    }
    done("Deployment patched");
    field("container", &outcome.container);
    field("base image", &outcome.base_image);
    field("debug image", &outcome.image);
    field(
        "pushed",
        if outcome.pushed { "yes" } else { "no (local only)" },
    );
}

pub fn rolled_back(outcome: &RollbackOutcome) {
    done(&format!(
        "Deployment restored to revision {} after {} step(s)",
        outcome.revision, outcome.steps
    ));
}

/// Marker and snapshot state, plus a hint when they disagree.
pub fn status(status: &PatchStatus) {
    field("patched", if status.patched { "yes" } else { "no" });
    field(
        "snapshot",
        if status.snapshot_present {
            "present"
        } else {
            "absent"
        },
    );
    if let Some(hint) = status_hint(status) {
        warn(hint);
    }
}

/// What to tell the user about an inconsistent patch state.
pub fn status_hint(status: &PatchStatus) -> Option<&'static str> {
    match (status.patched, status.snapshot_present) {
        (true, false) => Some(
            "Invalid patch state: marker present but no snapshot. `grapple rollback` can still restore the deployment.",
        ),
        (false, true) => Some(
            "Stale snapshot from an interrupted patch. Re-running `grapple patch` replaces it.",
        ),
        _ => None,
    }
}
