//! Executes abstract firewall commands against the host.
//!
//! The [`CommandRunner`] trait is the seam between command execution and the
//! operating system. Production code uses [`ProcessRunner`]; tests substitute
//! a stateful mock (see the `mocks` module).

use async_trait::async_trait;
use tokio::process::Command as ProcessCommand;

use std::process::Output;

use super::command::Command;
use super::{Error, FirewallConfig};

/// Namespace-entry helper prefixed to every invocation when a target network
/// namespace is configured.
const NSENTER: &str = "nsenter";

/// Spawns a program and waits for its captured output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn output(&self, program: &str, args: &[String]) -> std::io::Result<Output>;
}

/// Production [`CommandRunner`] backed by tokio's process handling.
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn output(&self, program: &str, args: &[String]) -> std::io::Result<Output> {
        ProcessCommand::new(program).args(args).output().await
    }
}

/// Runs one command in the configured execution context and returns its
/// combined stdout and stderr.
///
/// In simulate-only mode the command is logged but never invoked, and an
/// empty output is returned as if it had succeeded.
pub async fn execute(
    config: &FirewallConfig,
    command: &Command,
    runner: &dyn CommandRunner,
) -> Result<String, Error> {
    let (program, args) = contextualize(config, command);
    tracing::info!("{} {}", program, args.join(" "));

    if config.simulate_only {
        return Ok(String::new());
    }

    let output = runner.output(&program, &args).await.map_err(|source| Error::Launch {
        command: command.to_string(),
        source,
    })?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    if !combined.is_empty() {
        // Firewall tool failures are often only explained here.
        tracing::info!(tag = %command.tag, "{}", combined.trim_end());
    }

    if !output.status.success() {
        return Err(Error::CommandFailed {
            command: command.to_string(),
            status: output.status,
            output: combined,
        });
    }

    Ok(combined)
}

/// Wraps the invocation with the namespace-entry helper when a namespace is
/// set. The `--` token isolates the helper's own arguments from the wrapped
/// command's arguments; some nsenter implementations (BusyBox) cannot
/// otherwise tell them apart.
fn contextualize(config: &FirewallConfig, command: &Command) -> (String, Vec<String>) {
    match config.net_ns.as_deref() {
        Some(ns) if !ns.is_empty() => {
            let mut args = vec![format!("--net={ns}"), "--".to_string(), command.program.clone()];
            args.extend(command.args.iter().cloned());
            (NSENTER.to_string(), args)
        }
        _ => (command.program.clone(), command.args.clone()),
    }
}
