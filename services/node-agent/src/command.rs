//! External command execution.
//!
//! Every host mutation the agent performs is a single command invocation.
//! Call sites state which failure messages they accept as success; those
//! allow-lists are declared as constants next to the commands that use them.

use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// Errors from command execution.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed ({status}): {output}")]
    Failed {
        command: String,
        status: String,
        output: String,
    },
}

/// Captured result of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(1),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Stdout followed by stderr.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}{}", self.stdout, self.stderr)
        }
    }

    fn matches_any(&self, benign: &[&str]) -> bool {
        benign
            .iter()
            .any(|needle| self.stdout.contains(needle) || self.stderr.contains(needle))
    }

    fn status(&self) -> String {
        match self.code {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

fn render(program: &str, args: &[&str]) -> String {
    let mut command = program.to_string();
    for arg in args {
        command.push(' ');
        command.push_str(arg);
    }
    command
}

/// Runs external programs.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a program to completion. Fails only if it cannot be spawned.
    async fn output(&self, program: &str, args: &[&str]) -> Result<CommandOutput, CommandError>;

    /// Run a program, accepting failures whose output contains one of
    /// `benign`. Returns the combined output.
    async fn run_tolerant(
        &self,
        benign: &[&str],
        program: &str,
        args: &[&str],
    ) -> Result<String, CommandError> {
        let output = self.output(program, args).await?;
        if output.success {
            return Ok(output.combined());
        }

        let command = render(program, args);
        if output.matches_any(benign) {
            debug!(command = %command, output = %output.combined().trim(), "Tolerated command failure");
            return Ok(output.combined());
        }

        warn!(command = %command, output = %output.combined().trim(), "Command failed");
        Err(CommandError::Failed {
            command,
            status: output.status(),
            output: output.combined().trim().to_string(),
        })
    }

    /// Run a program with no tolerated failures.
    async fn run(&self, program: &str, args: &[&str]) -> Result<String, CommandError> {
        self.run_tolerant(&[], program, args).await
    }

    /// Run a query. Returns stdout, or `None` when the failure is benign.
    async fn query(
        &self,
        benign: &[&str],
        program: &str,
        args: &[&str],
    ) -> Result<Option<String>, CommandError> {
        let output = self.output(program, args).await?;
        if output.success {
            return Ok(Some(output.stdout));
        }
        if output.matches_any(benign) {
            return Ok(None);
        }
        Err(CommandError::Failed {
            command: render(program, args),
            status: output.status(),
            output: output.combined().trim().to_string(),
        })
    }

    /// Run a program whose effect is about to be superseded; any failure is
    /// logged and dropped.
    async fn run_ignored(&self, program: &str, args: &[&str]) {
        match self.output(program, args).await {
            Ok(output) if !output.success => {
                debug!(command = %render(program, args), output = %output.combined().trim(), "Ignored command failure");
            }
            Ok(_) => {}
            Err(e) => {
                debug!(command = %render(program, args), error = %e, "Ignored command error");
            }
        }
    }
}

/// Runs commands on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn output(&self, program: &str, args: &[&str]) -> Result<CommandOutput, CommandError> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| CommandError::Spawn {
                program: program.to_string(),
                source,
            })?;

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Canned(CommandOutput);

    #[async_trait]
    impl CommandRunner for Canned {
        async fn output(&self, _: &str, _: &[&str]) -> Result<CommandOutput, CommandError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_tolerant_accepts_benign_failure() {
        let runner = Canned(CommandOutput::failed("RTNETLINK answers: File exists\n"));
        let output = runner
            .run_tolerant(&["File exists"], "ip", &["netns", "add", "n0abc"])
            .await
            .unwrap();
        assert!(output.contains("File exists"));
    }

    #[tokio::test]
    async fn test_tolerant_rejects_other_failure() {
        let runner = Canned(CommandOutput::failed("Operation not permitted"));
        let err = runner
            .run_tolerant(&["File exists"], "ip", &["netns", "add", "n0abc"])
            .await
            .unwrap_err();
        match err {
            CommandError::Failed { command, output, .. } => {
                assert_eq!(command, "ip netns add n0abc");
                assert_eq!(output, "Operation not permitted");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_query_maps_benign_failure_to_none() {
        let runner = Canned(CommandOutput::failed(
            "Cannot open network namespace \"n0abc\": No such file or directory",
        ));
        let out = runner
            .query(&["No such file or directory"], "ip", &["netns", "exec", "n0abc", "true"])
            .await
            .unwrap();
        assert_eq!(out, None);
    }

    #[tokio::test]
    async fn test_system_runner_captures_output() {
        let output = SystemRunner.output("sh", &["-c", "echo out; echo err >&2; exit 3"]).await.unwrap();
        assert!(!output.success);
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
    }

    #[tokio::test]
    async fn test_system_runner_spawn_error() {
        let err = SystemRunner
            .output("/nonexistent/stratus-binary", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }
}
