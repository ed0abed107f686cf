// agent/src/model.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ==============================================================================
// 1. Deployment Lifecycle
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Started,
    Running,
    Success,
    Failed,
    Destroyed,
    DestroyFailed,
}

impl DeploymentStatus {
    /// Terminal states carry `completed_at` and stay frozen until a new cycle begins.
    pub const fn is_terminal(self) -> bool {
        match self {
            Self::Success | Self::Failed | Self::Destroyed | Self::DestroyFailed => true,
            Self::Started | Self::Running => false,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Destroyed => "destroyed",
            Self::DestroyFailed => "destroy_failed",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which workflow the current cycle of a deployment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Apply,
    Destroy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: Uuid,
    pub owner: String,
    pub plan_id: Uuid,
    pub connection_id: Uuid,
    pub operation: Operation,
    pub status: DeploymentStatus,
    pub output: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Deployment {
    /// A fresh apply cycle: STARTED, nothing recorded yet.
    pub fn new(owner: &str, plan_id: Uuid, connection_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner: owner.to_string(),
            plan_id,
            connection_id,
            operation: Operation::Apply,
            status: DeploymentStatus::Started,
            output: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

// ==============================================================================
// 2. Plans (stored IaC bundles)
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Generating,
    Ready,
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub errors: Option<String>,
}

impl ValidationOutcome {
    pub fn passed() -> Self {
        Self { valid: true, errors: None }
    }

    pub fn failed(errors: impl Into<String>) -> Self {
        Self { valid: false, errors: Some(errors.into()) }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub owner: String,
    pub source_prefix: String,
    pub requirements: String,
    pub structured_requirements: serde_json::Value,
    pub validation: Option<ValidationOutcome>,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
}

/// Object-storage layout for a plan bundle: `{owner}/{plan_id}/v{version}/`.
pub fn source_prefix(owner: &str, plan_id: Uuid, version: u32) -> String {
    format!("{owner}/{plan_id}/v{version}/")
}

// ==============================================================================
// 3. Cloud Connections
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Pending,
    Connected,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudConnection {
    pub id: Uuid,
    pub owner: String,
    pub external_id: String,
    pub role_arn: Option<String>,
    pub status: ConnectionStatus,
}

/// What `plan_summary` reports about a plan's most recent successful apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub plan_id: Uuid,
    pub deployed: bool,
    pub deployment_id: Option<Uuid>,
    pub deployed_at: Option<DateTime<Utc>>,
    pub can_destroy: bool,
}
