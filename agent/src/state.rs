// agent/src/state.rs
//
// The deployment state machine. Every status write in the crate goes through
// `apply_update`; repositories call it inside their atomic update.
//
//   STARTED ──▶ RUNNING ──▶ SUCCESS ──▶ STARTED (destroy cycle)
//                  │                        │
//                  └──▶ FAILED              ▼
//                                        RUNNING ──▶ DESTROYED
//                                           └──────▶ DESTROY_FAILED

use chrono::{DateTime, Utc};

use crate::error::GuardViolation;
use crate::model::{Deployment, DeploymentStatus, Operation};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: DeploymentStatus,
    pub output: Option<String>,
    pub error_message: Option<String>,
}

impl StatusUpdate {
    pub fn to(status: DeploymentStatus) -> Self {
        Self { status, output: None, error_message: None }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

/// Returns the operation the deployment belongs to after moving from `current`
/// to `requested`, or the violation if the machine forbids the move.
pub fn check_transition(
    deployment_id: uuid::Uuid,
    operation: Operation,
    current: DeploymentStatus,
    requested: DeploymentStatus,
) -> Result<Operation, GuardViolation> {
    use DeploymentStatus::*;

    let next = match (current, requested) {
        (Started, Running) => Some(operation),
        (Running, Success | Failed) => (operation == Operation::Apply).then_some(operation),
        (Running, Destroyed | DestroyFailed) => {
            (operation == Operation::Destroy).then_some(operation)
        }
        (Success, Started) => Some(Operation::Destroy),
        (Started, Started | Success | Failed | Destroyed | DestroyFailed)
        | (Running, Started | Running)
        | (Success, Running | Success | Failed | Destroyed | DestroyFailed)
        | (Failed | Destroyed | DestroyFailed, _) => None,
    };

    next.ok_or(GuardViolation { deployment_id, current, requested })
}

/// Applies `update` to `deployment` if the machine allows it.
pub fn apply_update(
    deployment: &mut Deployment,
    update: StatusUpdate,
    now: DateTime<Utc>,
) -> Result<(), GuardViolation> {
    let operation =
        check_transition(deployment.id, deployment.operation, deployment.status, update.status)?;

    let new_cycle = deployment.status.is_terminal() && update.status == DeploymentStatus::Started;
    if new_cycle {
        deployment.output = None;
        deployment.error_message = None;
    }

    deployment.operation = operation;
    deployment.status = update.status;
    if update.output.is_some() {
        deployment.output = update.output;
    }
    if update.error_message.is_some() {
        deployment.error_message = update.error_message;
    }
    deployment.updated_at = now;
    deployment.completed_at = update.status.is_terminal().then_some(now);

    Ok(())
}
