// agent/src/repository.rs
//
// In-process implementations of the repository and catalog seams. The agent
// owns its deployment records; plans and connections are registered by the
// calling layer through the front end.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::AgentError;
use crate::model::{CloudConnection, Deployment, Plan};
use crate::state::{apply_update, StatusUpdate};
use crate::sys::traits::{ConnectionCatalog, DeploymentRepository, PlanCatalog};

#[derive(Default)]
pub struct MemoryDeploymentRepository {
    rows: RwLock<HashMap<Uuid, Deployment>>,
}

impl MemoryDeploymentRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeploymentRepository for MemoryDeploymentRepository {
    async fn create(
        &self,
        owner: &str,
        plan_id: Uuid,
        connection_id: Uuid,
    ) -> Result<Deployment, AgentError> {
        let deployment = Deployment::new(owner, plan_id, connection_id, Utc::now());
        self.rows.write().await.insert(deployment.id, deployment.clone());
        tracing::info!(deployment_id = %deployment.id, owner, plan_id = %plan_id, "Deployment created");
        Ok(deployment)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Deployment>, AgentError> {
        Ok(self.rows.read().await.get(&id).cloned())
    }

    async fn get_for_owner(&self, id: Uuid, owner: &str) -> Result<Option<Deployment>, AgentError> {
        Ok(self.rows.read().await.get(&id).filter(|d| d.owner == owner).cloned())
    }

    async fn list_by_owner(&self, owner: &str) -> Result<Vec<Deployment>, AgentError> {
        let rows = self.rows.read().await;
        let mut owned: Vec<Deployment> = rows.values().filter(|d| d.owner == owner).cloned().collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(owned)
    }

    async fn update_status(&self, id: Uuid, update: StatusUpdate) -> Result<Deployment, AgentError> {
        // Check and write happen under one lock: this is the compare-and-set that
        // keeps two racing requests from both leaving SUCCESS.
        let mut rows = self.rows.write().await;
        let deployment = rows.get_mut(&id).ok_or_else(|| AgentError::not_found("deployment", id))?;
        let from = deployment.status;
        apply_update(deployment, update, Utc::now())?;
        tracing::info!(deployment_id = %id, from = %from, to = %deployment.status, "Status updated");
        Ok(deployment.clone())
    }
}

#[derive(Default)]
pub struct MemoryCatalog {
    plans: RwLock<HashMap<Uuid, Plan>>,
    connections: RwLock<HashMap<Uuid, CloudConnection>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PlanCatalog for MemoryCatalog {
    async fn get_plan(&self, id: Uuid) -> Result<Option<Plan>, AgentError> {
        Ok(self.plans.read().await.get(&id).cloned())
    }

    async fn put_plan(&self, plan: Plan) -> Result<(), AgentError> {
        self.plans.write().await.insert(plan.id, plan);
        Ok(())
    }
}

#[async_trait]
impl ConnectionCatalog for MemoryCatalog {
    async fn get_connection(&self, id: Uuid) -> Result<Option<CloudConnection>, AgentError> {
        Ok(self.connections.read().await.get(&id).cloned())
    }

    async fn put_connection(&self, connection: CloudConnection) -> Result<(), AgentError> {
        self.connections.write().await.insert(connection.id, connection);
        Ok(())
    }
}
