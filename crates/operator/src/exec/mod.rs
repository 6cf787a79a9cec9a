//! Remote-exec tool server run by the agent container
//!
//! Commands never run locally: they are forwarded to the sibling workspace
//! container through the pod exec API, and their output comes back as one
//! structured [`ExecOutcome`].

pub mod remote;
pub mod server;

use crate::reconcile::types::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use remote::RemoteExecutor;
pub use server::{router, ExecServerState};

pub const DEFAULT_WORKDIR: &str = "/workspace";
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
pub const MAX_TIMEOUT_SECS: u64 = 3600;

/// Fixed shell prologue; caller text only ever arrives as positional arguments
const CHDIR_PROLOGUE: &str = r#"cd -- "$1" && shift && exec "$@""#;
const PROLOGUE_NAME: &str = "workspace-exec";

/// Arguments of the `exec` tool
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExecRequest {
    /// Shell program, run with `sh -c`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Program and arguments, run without a shell when no workdir is given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argv: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,

    /// Seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl ExecRequest {
    pub fn shell(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            ..Default::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        let secs = self
            .timeout
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
            .clamp(1, MAX_TIMEOUT_SECS);
        Duration::from_secs(secs)
    }

    /// The argument vector handed to the exec API
    pub fn to_argv(&self) -> Result<Vec<String>> {
        let workdir = self
            .workdir
            .as_deref()
            .map(str::trim)
            .filter(|w| !w.is_empty());

        let program = match (&self.command, &self.argv) {
            (Some(_), Some(_)) => {
                return Err(Error::ExecError(
                    "specify either command or argv, not both".to_string(),
                ))
            }
            (Some(command), None) if !command.trim().is_empty() => {
                vec!["sh".to_string(), "-c".to_string(), command.clone()]
            }
            (None, Some(argv)) if argv.first().is_some_and(|p| !p.is_empty()) => {
                if workdir.is_none() {
                    return Ok(argv.clone());
                }
                argv.clone()
            }
            _ => return Err(Error::ExecError("command is required".to_string())),
        };

        let mut full = vec![
            "sh".to_string(),
            "-c".to_string(),
            CHDIR_PROLOGUE.to_string(),
            PROLOGUE_NAME.to_string(),
            workdir.unwrap_or(DEFAULT_WORKDIR).to_string(),
        ];
        full.extend(program);
        Ok(full)
    }
}

/// Result of one remote command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecOutcome {
    /// The command could not be run at all
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && self.error.is_none()
    }

    /// Text block returned to the agent as tool output
    pub fn render(&self) -> String {
        let mut text = self.stdout.clone();
        if !self.stderr.is_empty() {
            text.push_str("\n[STDERR]\n");
            text.push_str(&self.stderr);
        }
        if !self.success() {
            text.push_str(&format!("\n[Exit code: {}]", self.exit_code));
            if let Some(error) = &self.error {
                text.push_str(&format!("\n[Error: {error}]"));
            }
            if self.timed_out {
                text.push_str("\n[Timed out]");
            }
        }
        text
    }
}

/// Executes an argument vector somewhere other than this process
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Never fails: transport problems are reported inside the outcome
    async fn run(&self, argv: &[String], timeout: Duration) -> ExecOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn shell_command_is_one_argument_behind_the_prologue() {
        let request = ExecRequest {
            command: Some("ls; rm -rf /tmp/x".to_string()),
            workdir: Some("/workspace/repo $(whoami)".to_string()),
            ..Default::default()
        };
        assert_eq!(
            request.to_argv().unwrap(),
            strings(&[
                "sh",
                "-c",
                CHDIR_PROLOGUE,
                "workspace-exec",
                "/workspace/repo $(whoami)",
                "sh",
                "-c",
                "ls; rm -rf /tmp/x",
            ])
        );
    }

    #[test]
    fn argv_without_workdir_runs_directly() {
        let request = ExecRequest {
            argv: Some(strings(&["cargo", "test", "--", "--nocapture"])),
            ..Default::default()
        };
        assert_eq!(
            request.to_argv().unwrap(),
            strings(&["cargo", "test", "--", "--nocapture"])
        );
    }

    #[test]
    fn argv_with_workdir_changes_directory_first() {
        let request = ExecRequest {
            argv: Some(strings(&["make"])),
            workdir: Some("/workspace/app".to_string()),
            ..Default::default()
        };
        let argv = request.to_argv().unwrap();
        assert_eq!(&argv[4..], strings(&["/workspace/app", "make"]).as_slice());
    }

    #[test]
    fn rejects_missing_or_ambiguous_commands() {
        assert!(ExecRequest::default().to_argv().is_err());
        assert!(ExecRequest::shell("   ").to_argv().is_err());
        let both = ExecRequest {
            command: Some("ls".to_string()),
            argv: Some(strings(&["ls"])),
            ..Default::default()
        };
        assert!(both.to_argv().is_err());
    }

    #[test]
    fn timeout_defaults_and_clamps() {
        assert_eq!(ExecRequest::shell("ls").timeout(), Duration::from_secs(300));
        let long = ExecRequest {
            timeout: Some(86_400),
            ..ExecRequest::shell("ls")
        };
        assert_eq!(long.timeout(), Duration::from_secs(MAX_TIMEOUT_SECS));
        let zero = ExecRequest {
            timeout: Some(0),
            ..ExecRequest::shell("ls")
        };
        assert_eq!(zero.timeout(), Duration::from_secs(1));
    }

    #[test]
    fn renders_failures_for_the_agent() {
        let ok = ExecOutcome {
            stdout: "done\n".to_string(),
            ..Default::default()
        };
        assert_eq!(ok.render(), "done\n");

        let failed = ExecOutcome {
            stdout: "partial".to_string(),
            stderr: "boom".to_string(),
            exit_code: 2,
            ..Default::default()
        };
        assert_eq!(failed.render(), "partial\n[STDERR]\nboom\n[Exit code: 2]");

        let timed_out = ExecOutcome {
            exit_code: -1,
            timed_out: true,
            error: Some("command timed out after 5s".to_string()),
            ..Default::default()
        };
        assert_eq!(
            timed_out.render(),
            "\n[Exit code: -1]\n[Error: command timed out after 5s]\n[Timed out]"
        );
    }
}
