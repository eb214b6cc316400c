//! Execution of external OS networking tools.
//!
//! Every tool invocation of the service (`wpa_cli`, `networkctl`, `ifconfig`)
//! goes through [`CommandRunner`], so the rest of the crate never touches
//! `std::process` directly and can be tested with a mock runner.

use anyhow::{Context, Result, bail};
use log::debug;
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use tokio::process::Command;
use trait_variant::make;

#[make(Send)]
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` and return its trimmed stdout
    ///
    /// A non-zero exit status is an error carrying the captured stderr and stdout.
    async fn run(&self, program: &str, args: &[String]) -> Result<String>;
}

/// Runs tools as child processes of the service
#[derive(Clone, Debug, Default)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<String> {
        debug!("running: {program} {}", args.join(" "));

        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to execute {program}"))?;

        let stdout = String::from_utf8_lossy(&output.stdout);

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "run: {program} {} failed with {}: stderr: {} stdout: {}",
                args.join(" "),
                output.status,
                stderr.trim(),
                stdout.trim()
            );
        }

        Ok(stdout.trim().to_string())
    }
}

/// Convenience for building argument lists from string literals
pub fn args<I, S>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    args.into_iter().map(Into::into).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_returns_trimmed_stdout() {
        let out = SystemCommandRunner
            .run("echo", &args(["  hello  "]))
            .await
            .expect("echo should succeed");

        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn run_reports_stderr_on_failure() {
        let err = SystemCommandRunner
            .run("sh", &args(["-c", "echo broken >&2; exit 3"]))
            .await
            .expect_err("non-zero exit must fail");

        let msg = format!("{err:#}");
        assert!(msg.contains("broken"), "unexpected error: {msg}");
        assert!(msg.contains("sh -c"), "unexpected error: {msg}");
    }

    #[tokio::test]
    async fn run_fails_for_missing_program() {
        let result = SystemCommandRunner
            .run("/nonexistent/wificonfig-tool", &[])
            .await;

        assert!(result.is_err());
    }
}
