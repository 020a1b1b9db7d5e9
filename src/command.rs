//! External command execution behind a trait so callers can be tested
//! without the real binaries.

use std::process::Output;

use async_trait::async_trait;
use tracing::debug;

use crate::error::KshapeError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: &str) -> Self {
        Self {
            success: true,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: &str) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    /// Trimmed stderr, or stdout when stderr is empty.
    pub fn message(&self) -> &str {
        let err = self.stderr.trim();
        if err.is_empty() {
            self.stdout.trim()
        } else {
            err
        }
    }
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` and capture its output. Only a failure to
    /// spawn is an error; a non-zero exit is reported through the output.
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, KshapeError>;
}

/// Runs real processes with `tokio::process`.
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, KshapeError> {
        debug!(program = %program, args = ?redact(args), "Executing command");
        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| KshapeError::bootstrap(format!("failed to execute {program}: {e}")))?;
        Ok(CommandOutput::from(output))
    }
}

/// Hide values following flags that carry secrets.
fn redact(args: &[String]) -> Vec<&str> {
    let mut hidden = false;
    args.iter()
        .map(|a| {
            let shown = if hidden { "***" } else { a.as_str() };
            hidden = matches!(a.as_str(), "--set-string" | "--token");
            shown
        })
        .collect()
}

/// Build an owned argument list from string slices.
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    items.into_iter().map(|s| s.as_ref().to_string()).collect()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_prefers_stderr() {
        let out = CommandOutput {
            success: false,
            stdout: "partial".to_string(),
            stderr: "  boom\n".to_string(),
        };
        assert_eq!(out.message(), "boom");
        assert_eq!(CommandOutput::ok(" done\n").message(), "done");
    }

    #[test]
    fn test_redact_hides_secret_values() {
        let shown = redact(&args(["upgrade", "--set-string", "token=abc", "--wait"]));
        assert_eq!(shown, vec!["upgrade", "--set-string", "***", "--wait"]);
    }

    #[tokio::test]
    async fn test_fake_runner_rules_expire() {
        let runner = fake::FakeRunner::new();
        runner.respond("version", CommandOutput::failed("refused"), 1);
        let first = runner.run("talosctl", &args(["version"])).await.unwrap();
        let second = runner.run("talosctl", &args(["version"])).await.unwrap();
        assert!(!first.success);
        assert!(second.success);
        assert_eq!(runner.count("talosctl version"), 2);
    }
}
