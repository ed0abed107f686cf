// agent/src/sys/tool.rs

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::error::{AgentError, ToolStageError};
use crate::model::ValidationOutcome;
use crate::sys::sanitize::{failure_stream, strip_ansi};
use crate::sys::secrets::AssumedCredentials;
use crate::sys::traits::IacTool;

/// Saved plan written by `plan` and consumed by `apply`.
pub const PLAN_FILE: &str = "tfplan";
/// Local state the tool leaves behind after `apply`; persisted next to the source.
pub const STATE_FILE: &str = "terraform.tfstate";

/// Variables that would let the child pick up the agent's own identity instead of
/// the assumed role.
const AMBIENT_AWS_VARS: &[&str] = &[
    "AWS_PROFILE",
    "AWS_DEFAULT_PROFILE",
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
    "AWS_SECURITY_TOKEN",
    "AWS_SHARED_CREDENTIALS_FILE",
    "AWS_CONFIG_FILE",
    "AWS_WEB_IDENTITY_TOKEN_FILE",
    "AWS_ROLE_ARN",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Init,
    /// `init` without a backend, for validation of untrusted source.
    ValidateInit,
    Plan,
    Apply,
    Destroy,
    Validate,
}

impl Stage {
    pub const fn args(self) -> &'static [&'static str] {
        match self {
            Self::Init => &["init", "-input=false", "-no-color"],
            Self::ValidateInit => &["init", "-backend=false", "-input=false", "-no-color"],
            Self::Plan => &["plan", "-out=tfplan", "-no-color", "-input=false"],
            Self::Apply => &["apply", "-auto-approve", "-no-color", "-input=false", "tfplan"],
            Self::Destroy => &["destroy", "-auto-approve", "-no-color", "-input=false"],
            Self::Validate => &["validate", "-no-color"],
        }
    }

    /// Prefix used in recorded failure messages ("Init failed: ...").
    pub const fn label(self) -> &'static str {
        match self {
            Self::Init | Self::ValidateInit => "Init",
            Self::Plan => "Plan",
            Self::Apply => "Apply",
            Self::Destroy => "Destroy",
            Self::Validate => "Validate",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl StageOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

// ==============================================================================
// 1. Concrete Tool (terraform-compatible CLI)
// ==============================================================================

pub struct TerraformCli {
    binary: PathBuf,
    region: String,
    stage_timeout: Option<Duration>,
}

impl TerraformCli {
    pub fn new(binary: impl Into<PathBuf>, region: impl Into<String>) -> Self {
        Self { binary: binary.into(), region: region.into(), stage_timeout: None }
    }

    /// Upper bound on a single stage. `None` lets a stage run until it exits.
    pub fn with_stage_timeout(mut self, limit: Option<Duration>) -> Self {
        self.stage_timeout = limit;
        self
    }

    fn command(
        &self,
        stage: Stage,
        working_dir: &Path,
        credentials: Option<&AssumedCredentials>,
    ) -> Command {
        let mut command = Command::new(&self.binary);
        command.args(stage.args()).current_dir(working_dir);

        // 🛡️ The only identity a stage ever sees is the one passed in for this execution.
        for var in AMBIENT_AWS_VARS {
            command.env_remove(var);
        }
        command
            .env("TF_IN_AUTOMATION", "1")
            .env("TF_INPUT", "0")
            .env("AWS_REGION", &self.region)
            .env("AWS_DEFAULT_REGION", &self.region);
        if let Some(credentials) = credentials {
            credentials.inject(&mut command);
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl IacTool for TerraformCli {
    async fn run_stage(
        &self,
        stage: Stage,
        working_dir: &Path,
        credentials: Option<&AssumedCredentials>,
    ) -> std::io::Result<StageOutput> {
        let mut child = self.command(stage, working_dir, credentials).spawn()?;
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        // Pipes are drained alongside wait(): a chatty provider can fill the pipe
        // buffer long before it exits.
        let collect = async {
            let (status, stdout, stderr) = tokio::join!(
                child.wait(),
                async {
                    let mut buf = Vec::new();
                    if let Some(pipe) = stdout_pipe.as_mut() {
                        let _ = pipe.read_to_end(&mut buf).await;
                    }
                    buf
                },
                async {
                    let mut buf = Vec::new();
                    if let Some(pipe) = stderr_pipe.as_mut() {
                        let _ = pipe.read_to_end(&mut buf).await;
                    }
                    buf
                },
            );
            status.map(|status| StageOutput {
                exit_code: status.code(),
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            })
        };

        let Some(limit) = self.stage_timeout else {
            return collect.await;
        };
        tokio::select! {
            result = collect => result,
            () = tokio::time::sleep(limit) => {
                tracing::error!(stage = stage.label(), timeout = ?limit, "Stage timed out, killing tool");
                let _ = child.kill().await;
                Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("timed out after {limit:?}"),
                ))
            }
        }
    }
}

// ==============================================================================
// 2. Pipelines
// ==============================================================================

/// Runs stages in order, stops at the first failure and turns it into a
/// readable, ANSI-free, credential-free error.
#[derive(Clone)]
pub struct ToolInvoker {
    tool: Arc<dyn IacTool>,
}

impl ToolInvoker {
    pub fn new(tool: Arc<dyn IacTool>) -> Self {
        Self { tool }
    }

    fn scrub(text: &str, credentials: Option<&AssumedCredentials>) -> String {
        let clean = strip_ansi(text);
        match credentials {
            Some(credentials) => credentials.redact(&clean),
            None => clean,
        }
    }

    async fn run_checked(
        &self,
        stage: Stage,
        working_dir: &Path,
        credentials: Option<&AssumedCredentials>,
    ) -> Result<StageOutput, AgentError> {
        tracing::info!(stage = stage.label(), args = ?stage.args(), "Running tool stage");

        let output = match self.tool.run_stage(stage, working_dir, credentials).await {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                return Err(ToolStageError { stage, detail: e.to_string() }.into());
            }
            Err(e) => return Err(e.into()),
        };

        if !output.success() {
            let stderr = Self::scrub(&output.stderr, credentials);
            let stdout = Self::scrub(&output.stdout, credentials);
            let mut detail = failure_stream(&stderr, &stdout).trim().to_string();
            if detail.is_empty() {
                detail = format!("exited with code {}", output.exit_code.unwrap_or(-1));
            }
            tracing::warn!(stage = stage.label(), exit_code = ?output.exit_code, "Tool stage failed");
            return Err(ToolStageError { stage, detail }.into());
        }
        Ok(output)
    }

    /// init → plan → apply. Returns the sanitized apply stdout.
    pub async fn apply_pipeline(
        &self,
        working_dir: &Path,
        credentials: &AssumedCredentials,
    ) -> Result<String, AgentError> {
        self.run_checked(Stage::Init, working_dir, Some(credentials)).await?;
        self.run_checked(Stage::Plan, working_dir, Some(credentials)).await?;
        let applied = self.run_checked(Stage::Apply, working_dir, Some(credentials)).await?;
        Ok(Self::scrub(&applied.stdout, Some(credentials)))
    }

    /// init → destroy. Returns the sanitized destroy stdout.
    pub async fn destroy_pipeline(
        &self,
        working_dir: &Path,
        credentials: &AssumedCredentials,
    ) -> Result<String, AgentError> {
        self.run_checked(Stage::Init, working_dir, Some(credentials)).await?;
        let destroyed = self.run_checked(Stage::Destroy, working_dir, Some(credentials)).await?;
        Ok(Self::scrub(&destroyed.stdout, Some(credentials)))
    }

    /// Backend-less init followed by validate. Stage failures become an invalid
    /// outcome carrying the tool's own diagnostics; only failures to run the
    /// tool at all are errors.
    pub async fn validate_pipeline(&self, working_dir: &Path) -> Result<ValidationOutcome, AgentError> {
        for stage in [Stage::ValidateInit, Stage::Validate] {
            match self.run_checked(stage, working_dir, None).await {
                Ok(_) => {}
                Err(AgentError::ToolStage(e)) => return Ok(ValidationOutcome::failed(e.detail)),
                Err(e) => return Err(e),
            }
        }
        Ok(ValidationOutcome::passed())
    }
}
