// agent/src/sys/aws_cli.rs

use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;

use crate::sys::sanitize::{failure_stream, strip_ansi};

/// Thin runner for the `aws` command-line client. Object storage and role
/// assumption both go through it, using the agent's own ambient identity.
#[derive(Debug, Clone)]
pub struct AwsCli {
    binary: PathBuf,
    region: String,
    call_timeout: Option<Duration>,
}

impl AwsCli {
    pub fn new(binary: impl Into<PathBuf>, region: impl Into<String>) -> Self {
        Self { binary: binary.into(), region: region.into(), call_timeout: None }
    }

    /// Upper bound on one invocation. `None` waits for the client to exit.
    pub fn with_call_timeout(mut self, limit: Option<Duration>) -> Self {
        self.call_timeout = limit;
        self
    }

    pub async fn run<I, S>(&self, args: I) -> std::io::Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .arg("--region")
            .arg(&self.region)
            .arg("--output")
            .arg("json")
            // Never hand output to a pager or prompt for anything.
            .env("AWS_PAGER", "")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let output = command.output();

        let Some(limit) = self.call_timeout else {
            return output.await;
        };
        // Dropping the pending output drops the child, and kill_on_drop ends it.
        match tokio::time::timeout(limit, output).await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(timeout = ?limit, "aws call timed out, killing client");
                Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("aws timed out after {limit:?}"),
                ))
            }
        }
    }
}

/// Human-readable, ANSI-free diagnostics of a failed `aws` invocation.
pub fn diagnostics(output: &Output) -> String {
    let stderr = strip_ansi(&String::from_utf8_lossy(&output.stderr));
    let stdout = strip_ansi(&String::from_utf8_lossy(&output.stdout));
    let text = failure_stream(&stderr, &stdout).trim();
    if text.is_empty() {
        format!("aws exited with code {}", output.status.code().unwrap_or(-1))
    } else {
        text.to_string()
    }
}

/// Rejects values that the CLI would parse as flags.
pub fn reject_flag_like(field: &str, value: &str) -> Result<(), String> {
    if value.starts_with('-') {
        return Err(format!("SECURITY VIOLATION: {field} looks like a command-line flag"));
    }
    Ok(())
}
