//! External process execution shared by the kubectl and docker adapters.

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{GrappleError, Result};

/// Run `program` with `args`, optionally feeding `stdin`, and return stdout.
///
/// A non-zero exit becomes [`GrappleError::Command`] carrying the tool's
/// stderr verbatim.
pub(crate) async fn run(program: &str, args: &[String], stdin: Option<&[u8]>) -> Result<String> {
    debug!(program, args = ?args, "Executing command");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let spawn_err = |source| GrappleError::Spawn {
        program: program.to_string(),
        source,
    };

    let mut child = cmd.spawn().map_err(spawn_err)?;

    // Stdin is fed while stdout and stderr drain; a tool that writes before
    // it finishes reading would otherwise block on a full pipe.
    let pipe = child.stdin.take();
    let feed = async move {
        if let (Some(mut pipe), Some(input)) = (pipe, stdin) {
            pipe.write_all(input).await?;
        }
        Ok::<(), std::io::Error>(())
    };
    let (fed, output) = tokio::join!(feed, child.wait_with_output());
    let output = output.map_err(spawn_err)?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(GrappleError::Command {
            program: program.to_string(),
            args: args.to_vec(),
            stderr,
        });
    }
    fed?;

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
