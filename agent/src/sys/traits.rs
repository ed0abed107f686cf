use async_trait::async_trait;
use std::path::Path;
use uuid::Uuid;

use crate::error::{AgentError, CredentialError, StoreError};
use crate::model::{CloudConnection, Deployment, Plan};
use crate::state::StatusUpdate;
use crate::sys::secrets::AssumedCredentials;
use crate::sys::tool::{Stage, StageOutput};

// ==============================================================================
// 1. Object Storage (Source Bundles)
// ==============================================================================

/// Headers attached to every stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectMeta {
    pub content_type: &'static str,
    pub server_side_encryption: &'static str,
}

impl ObjectMeta {
    pub const TEXT_ENCRYPTED: Self = Self {
        content_type: "text/plain",
        server_side_encryption: "AES256",
    };
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        meta: ObjectMeta,
    ) -> Result<(), StoreError>;

    /// Every key under `prefix`, including directory markers.
    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError>;
}

// ==============================================================================
// 2. Credential Brokerage (Zero-Leak Auth)
// ==============================================================================

#[async_trait]
pub trait CredentialBroker: Send + Sync {
    /// Assumes `role_arn` in the customer account.
    /// The returned credentials are owned by the single execution that asked for
    /// them and are zeroized when it drops them.
    async fn assume(
        &self,
        role_arn: &str,
        external_id: &str,
    ) -> Result<AssumedCredentials, CredentialError>;
}

// ==============================================================================
// 3. IaC Tool Execution
// ==============================================================================

#[async_trait]
pub trait IacTool: Send + Sync {
    /// Runs one stage to completion inside `working_dir`.
    /// An `Err` means the process could not be run at all (spawn failure,
    /// timeout); a non-zero exit is reported through `StageOutput`.
    async fn run_stage(
        &self,
        stage: Stage,
        working_dir: &Path,
        credentials: Option<&AssumedCredentials>,
    ) -> std::io::Result<StageOutput>;
}

// ==============================================================================
// 4. State Repository & Catalogs
// ==============================================================================

#[async_trait]
pub trait DeploymentRepository: Send + Sync {
    async fn create(
        &self,
        owner: &str,
        plan_id: Uuid,
        connection_id: Uuid,
    ) -> Result<Deployment, AgentError>;

    /// Unscoped read, for the orchestrator and for telling "missing" from "foreign".
    async fn get(&self, id: Uuid) -> Result<Option<Deployment>, AgentError>;

    /// Owner-filtered read: another owner's deployment is reported as absent.
    async fn get_for_owner(&self, id: Uuid, owner: &str) -> Result<Option<Deployment>, AgentError>;

    /// Newest first.
    async fn list_by_owner(&self, owner: &str) -> Result<Vec<Deployment>, AgentError>;

    /// One atomic, state-machine-checked write.
    async fn update_status(&self, id: Uuid, update: StatusUpdate) -> Result<Deployment, AgentError>;
}

#[async_trait]
pub trait PlanCatalog: Send + Sync {
    async fn get_plan(&self, id: Uuid) -> Result<Option<Plan>, AgentError>;
    async fn put_plan(&self, plan: Plan) -> Result<(), AgentError>;
}

#[async_trait]
pub trait ConnectionCatalog: Send + Sync {
    async fn get_connection(&self, id: Uuid) -> Result<Option<CloudConnection>, AgentError>;
    async fn put_connection(&self, connection: CloudConnection) -> Result<(), AgentError>;
}
