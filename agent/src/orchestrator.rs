// agent/src/orchestrator.rs

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::model::{Deployment, DeploymentStatus, Operation, ValidationOutcome};
use crate::state::StatusUpdate;
use crate::sys::sandbox::{Sandbox, SandboxManager};
use crate::sys::sanitize::strip_ansi;
use crate::sys::store::SourceStore;
use crate::sys::tool::{ToolInvoker, STATE_FILE};
use crate::sys::traits::{CredentialBroker, DeploymentRepository, PlanCatalog};

/// File name inline source text is validated under.
pub const INLINE_SOURCE_FILE: &str = "main.tf";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyRequest {
    pub deployment_id: Uuid,
    pub plan_id: Uuid,
    pub source_prefix: String,
    pub role_arn: String,
    pub external_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestroyRequest {
    pub deployment_id: Uuid,
    pub role_arn: String,
    pub external_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationSource {
    /// A single file of source text.
    Text(String),
    /// A stored bundle.
    Prefix(String),
}

/// Composes download, role assumption and tool stages into the apply and destroy
/// workflows. Every failure past the RUNNING transition ends up in the
/// deployment's terminal status; nothing is retried.
pub struct Orchestrator {
    bucket: String,
    store: SourceStore,
    broker: Arc<dyn CredentialBroker>,
    sandboxes: SandboxManager,
    invoker: ToolInvoker,
    deployments: Arc<dyn DeploymentRepository>,
    plans: Arc<dyn PlanCatalog>,
}

impl Orchestrator {
    pub fn new(
        bucket: impl Into<String>,
        store: SourceStore,
        broker: Arc<dyn CredentialBroker>,
        sandboxes: SandboxManager,
        invoker: ToolInvoker,
        deployments: Arc<dyn DeploymentRepository>,
        plans: Arc<dyn PlanCatalog>,
    ) -> Self {
        Self { bucket: bucket.into(), store, broker, sandboxes, invoker, deployments, plans }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn store(&self) -> &SourceStore {
        &self.store
    }

    pub async fn apply(&self, request: ApplyRequest) -> Result<Deployment> {
        let id = request.deployment_id;
        self.deployments.update_status(id, StatusUpdate::to(DeploymentStatus::Running)).await?;
        tracing::info!(deployment_id = %id, plan_id = %request.plan_id, prefix = %request.source_prefix, "Apply started");

        let outcome = match self.sandboxes.acquire(&id.to_string()).await {
            Ok(sandbox) => {
                let result = self.apply_in(&sandbox, &request).await;
                self.release(id, sandbox).await;
                result
            }
            Err(e) => Err(e),
        };
        self.finish(id, Operation::Apply, outcome).await
    }

    pub async fn destroy(&self, request: DestroyRequest) -> Result<Deployment> {
        let id = request.deployment_id;
        self.deployments.update_status(id, StatusUpdate::to(DeploymentStatus::Running)).await?;
        tracing::info!(deployment_id = %id, "Destroy started");

        let outcome = match self.sandboxes.acquire(&id.to_string()).await {
            Ok(sandbox) => {
                let result = self.destroy_in(&sandbox, &request).await;
                self.release(id, sandbox).await;
                result
            }
            Err(e) => Err(e),
        };
        self.finish(id, Operation::Destroy, outcome).await
    }

    /// Validates source in a throwaway directory. Never touches a deployment and
    /// never fails: problems of any kind come back as an invalid outcome.
    pub async fn validate(&self, source: ValidationSource) -> ValidationOutcome {
        let sandbox = match self.sandboxes.acquire_disposable("validate").await {
            Ok(sandbox) => sandbox,
            Err(e) => return ValidationOutcome::failed(format!("Validation error: {e}")),
        };

        let outcome = match self.validate_in(&sandbox, source).await {
            Ok(outcome) => outcome,
            Err(AgentError::Store(e)) => {
                ValidationOutcome::failed(format!("Failed to download source: {e}"))
            }
            Err(e) => ValidationOutcome::failed(format!("Validation error: {e}")),
        };
        if let Err(e) = sandbox.release().await {
            tracing::warn!(error = %e, "Validation sandbox cleanup failed");
        }
        tracing::info!(valid = outcome.valid, "Validation finished");
        outcome
    }

    /// Records a terminal failure for a job that never produced an outcome
    /// (its task panicked). Does nothing if the cycle already ended.
    pub async fn abandon(&self, id: Uuid, operation: Operation, reason: &str) {
        let Ok(Some(current)) = self.deployments.get(id).await else {
            return;
        };
        if current.status.is_terminal() {
            return;
        }
        if current.status == DeploymentStatus::Started {
            let running = StatusUpdate::to(DeploymentStatus::Running);
            if let Err(e) = self.deployments.update_status(id, running).await {
                tracing::error!(deployment_id = %id, error = %e, "Could not record abandoned job");
                return;
            }
        }
        let failed = StatusUpdate::to(failed_status(operation))
            .with_error(format!("Unexpected error: {}", strip_ansi(reason)));
        if let Err(e) = self.deployments.update_status(id, failed).await {
            tracing::error!(deployment_id = %id, error = %e, "Could not record abandoned job");
        }
    }

    // ==========================================================================
    // Workflow steps
    // ==========================================================================

    async fn release(&self, id: Uuid, sandbox: Sandbox) {
        if let Err(e) = sandbox.release().await {
            tracing::warn!(deployment_id = %id, error = %e, "Sandbox cleanup failed");
        }
    }

    async fn apply_in(&self, sandbox: &Sandbox, request: &ApplyRequest) -> Result<String> {
        self.store.download_all(&self.bucket, &request.source_prefix, sandbox.path()).await?;
        let credentials = self.broker.assume(&request.role_arn, &request.external_id).await?;
        let output = self.invoker.apply_pipeline(sandbox.path(), &credentials).await?;
        self.persist_state(request.deployment_id, &request.source_prefix, sandbox.path()).await;
        Ok(output)
    }

    async fn destroy_in(&self, sandbox: &Sandbox, request: &DestroyRequest) -> Result<String> {
        let id = request.deployment_id;
        let deployment = self
            .deployments
            .get(id)
            .await?
            .ok_or_else(|| AgentError::not_found("deployment", id))?;
        let plan = self
            .plans
            .get_plan(deployment.plan_id)
            .await?
            .ok_or_else(|| AgentError::not_found("plan", deployment.plan_id))?;

        // The bundle includes the state persisted by the last apply.
        self.store.download_all(&self.bucket, &plan.source_prefix, sandbox.path()).await?;
        if !fs::try_exists(sandbox.path().join(STATE_FILE)).await? {
            tracing::warn!(deployment_id = %id, "No persisted state found; destroy may find nothing to remove");
        }
        let credentials = self.broker.assume(&request.role_arn, &request.external_id).await?;
        self.invoker.destroy_pipeline(sandbox.path(), &credentials).await
    }

    async fn validate_in(&self, sandbox: &Sandbox, source: ValidationSource) -> Result<ValidationOutcome> {
        match source {
            ValidationSource::Text(text) => {
                fs::write(sandbox.path().join(INLINE_SOURCE_FILE), text).await?;
            }
            ValidationSource::Prefix(prefix) => {
                self.store.download_all(&self.bucket, &prefix, sandbox.path()).await?;
            }
        }
        self.invoker.validate_pipeline(sandbox.path()).await
    }

    /// Uploads the tool's local state next to the source it was produced from.
    /// Failure here does not fail the deployment: the infrastructure exists.
    async fn persist_state(&self, id: Uuid, prefix: &str, working_dir: &Path) {
        let state = match fs::read_to_string(working_dir.join(STATE_FILE)).await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(deployment_id = %id, error = %e, "No tool state to persist");
                return;
            }
        };
        let files = BTreeMap::from([(STATE_FILE.to_string(), state)]);
        match self.store.upload(&self.bucket, prefix, &files).await {
            Ok(()) => tracing::info!(deployment_id = %id, prefix, "Tool state persisted"),
            Err(e) => tracing::warn!(deployment_id = %id, prefix, error = %e, "Failed to persist tool state"),
        }
    }

    async fn finish(&self, id: Uuid, operation: Operation, outcome: Result<String>) -> Result<Deployment> {
        let update = match outcome {
            Ok(output) => StatusUpdate::to(succeeded_status(operation)).with_output(output),
            Err(e) => {
                let message = strip_ansi(&e.failure_message());
                tracing::error!(deployment_id = %id, error_kind = e.kind(), error = %message, "Deployment cycle failed");
                StatusUpdate::to(failed_status(operation)).with_error(message)
            }
        };
        let recorded = self.deployments.update_status(id, update).await?;
        tracing::info!(deployment_id = %id, status = %recorded.status, "Deployment cycle finished");
        Ok(recorded)
    }
}

const fn succeeded_status(operation: Operation) -> DeploymentStatus {
    match operation {
        Operation::Apply => DeploymentStatus::Success,
        Operation::Destroy => DeploymentStatus::Destroyed,
    }
}

const fn failed_status(operation: Operation) -> DeploymentStatus {
    match operation {
        Operation::Apply => DeploymentStatus::Failed,
        Operation::Destroy => DeploymentStatus::DestroyFailed,
    }
}
