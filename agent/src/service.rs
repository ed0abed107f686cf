// agent/src/service.rs

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::dispatcher::{Dispatcher, Job, JobSlot};
use crate::error::{AgentError, GuardViolation, Result};
use crate::model::{
    source_prefix, CloudConnection, ConnectionStatus, Deployment, DeploymentStatus, Plan,
    PlanStatus, PlanSummary, ValidationOutcome,
};
use crate::orchestrator::{ApplyRequest, DestroyRequest, Orchestrator, ValidationSource};
use crate::state::StatusUpdate;
use crate::sys::tool::STATE_FILE;
use crate::sys::traits::{ConnectionCatalog, DeploymentRepository, PlanCatalog};

/// Everything a new plan needs; the agent assigns the id and stores the files.
#[derive(Debug, Clone)]
pub struct NewPlan {
    pub requirements: String,
    pub structured_requirements: serde_json::Value,
    pub files: BTreeMap<String, String>,
}

/// Request boundary. Ownership checks and status guards run here, synchronously;
/// the workflows themselves are queued and observed through `get_status`.
pub struct DeploymentService {
    orchestrator: Arc<Orchestrator>,
    dispatcher: Arc<Dispatcher>,
    deployments: Arc<dyn DeploymentRepository>,
    plans: Arc<dyn PlanCatalog>,
    connections: Arc<dyn ConnectionCatalog>,
}

impl DeploymentService {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        dispatcher: Arc<Dispatcher>,
        deployments: Arc<dyn DeploymentRepository>,
        plans: Arc<dyn PlanCatalog>,
        connections: Arc<dyn ConnectionCatalog>,
    ) -> Self {
        Self { orchestrator, dispatcher, deployments, plans, connections }
    }

    /// Creates a deployment in STARTED and queues its apply.
    pub async fn start_apply(&self, owner: &str, plan_id: Uuid, connection_id: Uuid) -> Result<Deployment> {
        let plan = self.owned_plan(owner, plan_id).await?;
        let connection = self.owned_connection(owner, connection_id).await?;
        let role_arn = usable_role(&connection)?;

        let slot = self.dispatcher.reserve()?;
        let deployment = self.deployments.create(owner, plan.id, connection.id).await?;
        slot.dispatch(Job::Apply(ApplyRequest {
            deployment_id: deployment.id,
            plan_id: plan.id,
            source_prefix: plan.source_prefix,
            role_arn,
            external_id: connection.external_id,
        }));

        tracing::info!(deployment_id = %deployment.id, owner, "Apply accepted");
        Ok(deployment)
    }

    /// Starts a destroy cycle on a successfully applied deployment and queues it.
    /// Anything but SUCCESS is refused before any write or scheduling.
    pub async fn start_destroy(&self, owner: &str, deployment_id: Uuid) -> Result<Deployment> {
        let deployment = self.owned_deployment(owner, deployment_id).await?;
        if deployment.status != DeploymentStatus::Success {
            tracing::warn!(deployment_id = %deployment_id, status = %deployment.status, "Destroy refused");
            return Err(GuardViolation {
                deployment_id,
                current: deployment.status,
                requested: DeploymentStatus::Started,
            }
            .into());
        }

        let connection = self
            .connections
            .get_connection(deployment.connection_id)
            .await?
            .ok_or_else(|| AgentError::not_found("connection", deployment.connection_id))?;
        let role_arn = connection
            .role_arn
            .clone()
            .ok_or_else(|| AgentError::Precondition(format!("connection {} has no role ARN", connection.id)))?;

        let slot = self.dispatcher.reserve()?;
        // SUCCESS -> STARTED is checked again under the repository's write lock;
        // a concurrent destroy that got here first makes this fail and the slot
        // is handed back unused.
        let restarted = self.deployments.update_status(deployment_id, StatusUpdate::to(DeploymentStatus::Started)).await?;
        slot.dispatch(Job::Destroy(DestroyRequest {
            deployment_id,
            role_arn,
            external_id: connection.external_id,
        }));

        tracing::info!(deployment_id = %deployment_id, owner, "Destroy accepted");
        Ok(restarted)
    }

    pub async fn get_status(&self, owner: &str, deployment_id: Uuid) -> Result<Deployment> {
        self.owned_deployment(owner, deployment_id).await
    }

    pub async fn list_deployments(&self, owner: &str) -> Result<Vec<Deployment>> {
        self.deployments.list_by_owner(owner).await
    }

    /// Whether the plan is currently deployed, from its most recent SUCCESS deployment.
    pub async fn plan_summary(&self, owner: &str, plan_id: Uuid) -> Result<PlanSummary> {
        self.owned_plan(owner, plan_id).await?;
        let latest = self
            .deployments
            .list_by_owner(owner)
            .await?
            .into_iter()
            .filter(|d| d.plan_id == plan_id && d.status == DeploymentStatus::Success)
            .max_by_key(|d| d.created_at);

        Ok(match latest {
            Some(d) => PlanSummary {
                plan_id,
                deployed: true,
                deployment_id: Some(d.id),
                deployed_at: d.completed_at,
                can_destroy: true,
            },
            None => PlanSummary {
                plan_id,
                deployed: false,
                deployment_id: None,
                deployed_at: None,
                can_destroy: false,
            },
        })
    }

    /// Validates inline text or a stored bundle on the worker pool and waits for
    /// the answer. A bundle must live under the caller's own prefix.
    pub async fn validate(&self, owner: &str, source: ValidationSource) -> Result<ValidationOutcome> {
        if let ValidationSource::Prefix(prefix) = &source {
            if !prefix.starts_with(&format!("{owner}/")) {
                return Err(AgentError::forbidden("prefix", prefix));
            }
        }

        let slot = self.dispatcher.reserve()?;
        run_validation(slot, source).await
    }

    /// Stores a new bundle under `{owner}/{plan_id}/v1/`, validates it and
    /// registers the plan as READY or INVALID accordingly.
    ///
    /// The validation slot is taken before anything is uploaded, and the plan is
    /// registered as GENERATING as soon as its files exist, so a stored bundle
    /// always has a plan record pointing at it.
    pub async fn publish_plan(&self, owner: &str, new_plan: NewPlan) -> Result<Plan> {
        if new_plan.files.is_empty() {
            return Err(AgentError::Precondition("a plan needs at least one file".into()));
        }

        let slot = self.dispatcher.reserve()?;
        let id = Uuid::new_v4();
        let prefix = source_prefix(owner, id, 1);
        self.orchestrator
            .store()
            .upload(self.orchestrator.bucket(), &prefix, &new_plan.files)
            .await?;

        let mut plan = Plan {
            id,
            owner: owner.to_string(),
            source_prefix: prefix.clone(),
            requirements: new_plan.requirements,
            structured_requirements: new_plan.structured_requirements,
            validation: None,
            status: PlanStatus::Generating,
            created_at: Utc::now(),
        };
        self.plans.put_plan(plan.clone()).await?;

        let validation = run_validation(slot, ValidationSource::Prefix(prefix)).await?;
        plan.status = if validation.valid { PlanStatus::Ready } else { PlanStatus::Invalid };
        plan.validation = Some(validation);
        self.plans.put_plan(plan.clone()).await?;

        tracing::info!(plan_id = %plan.id, owner, status = ?plan.status, "Plan published");
        Ok(plan)
    }

    /// The source files of one of the caller's plans, as `relative path -> text`.
    pub async fn plan_files(&self, owner: &str, plan_id: Uuid) -> Result<BTreeMap<String, String>> {
        let plan = self.owned_plan(owner, plan_id).await?;
        let files = self
            .orchestrator
            .store()
            .download_files(self.orchestrator.bucket(), &plan.source_prefix)
            .await?;
        // Tool state can hold resource secrets; only the source goes back out.
        Ok(files.into_iter().filter(|(name, _)| name != STATE_FILE).collect())
    }

    /// Records (or replaces) one of the caller's cloud connections.
    pub async fn register_connection(&self, owner: &str, connection: CloudConnection) -> Result<CloudConnection> {
        if connection.owner != owner {
            return Err(AgentError::forbidden("connection", connection.id));
        }
        if let Some(existing) = self.connections.get_connection(connection.id).await? {
            if existing.owner != owner {
                return Err(AgentError::forbidden("connection", connection.id));
            }
        }
        self.connections.put_connection(connection.clone()).await?;
        tracing::info!(connection_id = %connection.id, owner, status = ?connection.status, "Connection registered");
        Ok(connection)
    }

    // ==========================================================================
    // Ownership checks
    // ==========================================================================

    async fn owned_deployment(&self, owner: &str, id: Uuid) -> Result<Deployment> {
        if let Some(deployment) = self.deployments.get_for_owner(id, owner).await? {
            return Ok(deployment);
        }
        Err(match self.deployments.get(id).await? {
            Some(_) => AgentError::forbidden("deployment", id),
            None => AgentError::not_found("deployment", id),
        })
    }

    async fn owned_plan(&self, owner: &str, id: Uuid) -> Result<Plan> {
        match self.plans.get_plan(id).await? {
            Some(plan) if plan.owner == owner => Ok(plan),
            Some(_) => Err(AgentError::forbidden("plan", id)),
            None => Err(AgentError::not_found("plan", id)),
        }
    }

    async fn owned_connection(&self, owner: &str, id: Uuid) -> Result<CloudConnection> {
        match self.connections.get_connection(id).await? {
            Some(connection) if connection.owner == owner => Ok(connection),
            Some(_) => Err(AgentError::forbidden("connection", id)),
            None => Err(AgentError::not_found("connection", id)),
        }
    }
}

async fn run_validation(slot: JobSlot, source: ValidationSource) -> Result<ValidationOutcome> {
    let (reply, outcome) = oneshot::channel();
    slot.dispatch(Job::Validate { source, reply });
    outcome
        .await
        .map_err(|_| AgentError::Unexpected("validation job ended without a result".into()))
}

fn usable_role(connection: &CloudConnection) -> Result<String> {
    if connection.status != ConnectionStatus::Connected {
        return Err(AgentError::Precondition(format!(
            "connection {} is not connected",
            connection.id
        )));
    }
    connection
        .role_arn
        .clone()
        .ok_or_else(|| AgentError::Precondition(format!("connection {} has no role ARN", connection.id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::tool::Stage;
    use crate::sys::traits::ObjectStore;
    use crate::testing::{Harness, ScriptedTool, BUCKET, MAIN_TF};
    use std::time::Duration;
    use tokio::sync::Semaphore;
    use DeploymentStatus::*;

    fn service(h: &Harness, workers: usize, capacity: usize) -> DeploymentService {
        h.service(workers, capacity)
    }

    async fn wait_for(svc: &DeploymentService, id: Uuid, status: DeploymentStatus) -> Deployment {
        for _ in 0..200 {
            let d = svc.get_status("u1", id).await.unwrap();
            if d.status == status {
                return d;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("deployment {id} never reached {status}");
    }

    #[tokio::test]
    async fn apply_then_destroy_round_trip() {
        let h = Harness::new();
        let svc = service(&h, 2, 8);
        let plan = h.seed_plan("u1").await;
        let connection = h.seed_connection("u1", ConnectionStatus::Connected).await;

        let accepted = svc.start_apply("u1", plan.id, connection.id).await.unwrap();
        assert_eq!(accepted.status, Started);
        assert!(accepted.output.is_none() && accepted.error_message.is_none());
        assert!(accepted.completed_at.is_none());

        wait_for(&svc, accepted.id, Success).await;
        let summary = svc.plan_summary("u1", plan.id).await.unwrap();
        assert!(summary.deployed && summary.can_destroy);
        assert_eq!(summary.deployment_id, Some(accepted.id));

        let restarted = svc.start_destroy("u1", accepted.id).await.unwrap();
        assert_eq!(restarted.status, Started);
        assert!(restarted.completed_at.is_none());

        let destroyed = wait_for(&svc, accepted.id, Destroyed).await;
        assert!(destroyed.completed_at.is_some());
        assert!(!svc.plan_summary("u1", plan.id).await.unwrap().deployed);
    }

    #[tokio::test]
    async fn destroy_of_failed_deployment_is_refused_without_side_effects() {
        let h = Harness::new();
        let svc = service(&h, 1, 1);
        let plan = h.seed_plan("u1").await;
        let connection = h.seed_connection("u1", ConnectionStatus::Connected).await;
        let failed = h.seed_deployment(&plan, &connection, &[Running, Failed]).await;

        let err = svc.start_destroy("u1", failed.id).await.unwrap_err();
        match err {
            AgentError::Guard(violation) => {
                assert_eq!(violation.current, Failed);
                assert_eq!(violation.requested, Started);
            }
            other => panic!("unexpected error {other:?}"),
        }

        assert_eq!(svc.get_status("u1", failed.id).await.unwrap(), failed);
        assert!(h.tool.stages().is_empty());
        assert_eq!(h.broker.calls(), 0);
        // The single queue place was never taken.
        assert!(svc.dispatcher.reserve().is_ok());
    }

    #[tokio::test]
    async fn destroy_is_refused_for_every_status_but_success() {
        let h = Harness::new();
        let svc = service(&h, 1, 4);
        let plan = h.seed_plan("u1").await;
        let connection = h.seed_connection("u1", ConnectionStatus::Connected).await;

        let paths: [&[DeploymentStatus]; 5] = [
            &[],
            &[Running],
            &[Running, Failed],
            &[Running, Success, Started, Running, Destroyed],
            &[Running, Success, Started, Running, DestroyFailed],
        ];
        for path in paths {
            let d = h.seed_deployment(&plan, &connection, path).await;
            let err = svc.start_destroy("u1", d.id).await.unwrap_err();
            assert!(matches!(err, AgentError::Guard(_)), "{:?}", d.status);
            assert_eq!(svc.get_status("u1", d.id).await.unwrap(), d);
        }
        assert!(h.tool.stages().is_empty());
    }

    #[tokio::test]
    async fn racing_destroys_accept_exactly_one() {
        let gate = Arc::new(Semaphore::new(0));
        let h = Harness::with_tool(ScriptedTool::default().gated(gate.clone()));
        let svc = Arc::new(service(&h, 2, 8));
        let plan = h.seed_plan("u1").await;
        let connection = h.seed_connection("u1", ConnectionStatus::Connected).await;
        let d = h.seed_deployment(&plan, &connection, &[Running, Success]).await;

        let id = d.id;
        let attempts: Vec<_> = (0..4)
            .map(|_| {
                let svc = Arc::clone(&svc);
                tokio::spawn(async move { svc.start_destroy("u1", id).await })
            })
            .collect();
        let mut accepted = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(_) => accepted += 1,
                Err(e) => assert!(matches!(e, AgentError::Guard(_)), "{e:?}"),
            }
        }
        assert_eq!(accepted, 1);

        gate.add_permits(100);
        wait_for(&svc, d.id, Destroyed).await;
        assert_eq!(h.tool.stages(), [Stage::Init, Stage::Destroy]);
    }

    #[tokio::test]
    async fn ownership_distinguishes_missing_from_foreign() {
        let h = Harness::new();
        let svc = service(&h, 1, 4);
        let plan = h.seed_plan("u1").await;
        let connection = h.seed_connection("u1", ConnectionStatus::Connected).await;
        let d = h.seed_deployment(&plan, &connection, &[]).await;

        assert!(matches!(svc.get_status("u2", d.id).await, Err(AgentError::Forbidden { .. })));
        assert!(matches!(svc.get_status("u1", Uuid::new_v4()).await, Err(AgentError::NotFound { .. })));
        assert!(matches!(svc.start_destroy("u2", d.id).await, Err(AgentError::Forbidden { .. })));
        assert!(matches!(
            svc.start_apply("u2", plan.id, connection.id).await,
            Err(AgentError::Forbidden { .. })
        ));
        assert!(matches!(
            svc.plan_summary("u1", Uuid::new_v4()).await,
            Err(AgentError::NotFound { .. })
        ));
        assert!(svc.list_deployments("u2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn apply_requires_a_connected_role() {
        let h = Harness::new();
        let svc = service(&h, 1, 4);
        let plan = h.seed_plan("u1").await;

        let pending = h.seed_connection("u1", ConnectionStatus::Pending).await;
        let err = svc.start_apply("u1", plan.id, pending.id).await.unwrap_err();
        assert!(matches!(err, AgentError::Precondition(_)));

        let mut no_role = h.seed_connection("u1", ConnectionStatus::Connected).await;
        no_role.role_arn = None;
        svc.register_connection("u1", no_role.clone()).await.unwrap();
        let err = svc.start_apply("u1", plan.id, no_role.id).await.unwrap_err();
        assert!(matches!(err, AgentError::Precondition(_)));

        assert!(svc.list_deployments("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn full_queue_creates_no_deployment() {
        let gate = Arc::new(Semaphore::new(0));
        let h = Harness::with_tool(ScriptedTool::default().gated(gate.clone()));
        let svc = service(&h, 1, 1);
        let plan = h.seed_plan("u1").await;
        let connection = h.seed_connection("u1", ConnectionStatus::Connected).await;

        svc.start_apply("u1", plan.id, connection.id).await.unwrap();
        while h.tool.stages().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        svc.start_apply("u1", plan.id, connection.id).await.unwrap();

        let err = svc.start_apply("u1", plan.id, connection.id).await.unwrap_err();
        assert!(matches!(err, AgentError::Unavailable(_)));
        assert_eq!(svc.list_deployments("u1").await.unwrap().len(), 2);
        gate.add_permits(100);
    }

    #[tokio::test]
    async fn publish_plan_stores_and_validates() {
        let h = Harness::with_tool(ScriptedTool::default().fail_at(Stage::Validate, "Error: bad"));
        let svc = service(&h, 1, 4);

        let plan = svc
            .publish_plan(
                "u1",
                NewPlan {
                    requirements: "one bucket".into(),
                    structured_requirements: serde_json::json!({}),
                    files: BTreeMap::from([("main.tf".to_string(), MAIN_TF.to_string())]),
                },
            )
            .await
            .unwrap();

        assert_eq!(plan.source_prefix, format!("u1/{}/v1/", plan.id));
        assert_eq!(plan.status, PlanStatus::Invalid);
        assert_eq!(plan.validation, Some(ValidationOutcome::failed("Error: bad")));
        assert!(h.objects.object(BUCKET, &format!("{}main.tf", plan.source_prefix)).is_some());
        assert_eq!(svc.plans.get_plan(plan.id).await.unwrap(), Some(plan));
    }

    #[tokio::test]
    async fn publish_on_a_full_queue_stores_nothing() {
        let gate = Arc::new(Semaphore::new(0));
        let h = Harness::with_tool(ScriptedTool::default().gated(gate.clone()));
        let svc = service(&h, 1, 1);
        let plan = h.seed_plan("u1").await;
        let connection = h.seed_connection("u1", ConnectionStatus::Connected).await;

        svc.start_apply("u1", plan.id, connection.id).await.unwrap();
        while h.tool.stages().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        svc.start_apply("u1", plan.id, connection.id).await.unwrap();
        let keys_before = h.objects.list_keys(BUCKET, "u1/").await.unwrap();

        for _ in 0..3 {
            let err = svc
                .publish_plan(
                    "u1",
                    NewPlan {
                        requirements: "one bucket".into(),
                        structured_requirements: serde_json::json!({}),
                        files: BTreeMap::from([("main.tf".to_string(), MAIN_TF.to_string())]),
                    },
                )
                .await
                .unwrap_err();
            assert!(matches!(err, AgentError::Unavailable(_)), "{err:?}");
        }

        assert_eq!(h.objects.list_keys(BUCKET, "u1/").await.unwrap(), keys_before);
        gate.add_permits(100);
    }

    #[tokio::test]
    async fn published_plan_is_registered_before_validation_finishes() {
        let gate = Arc::new(Semaphore::new(0));
        let h = Harness::with_tool(ScriptedTool::default().gated(gate.clone()));
        let svc = Arc::new(service(&h, 1, 4));

        let publishing = {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move {
                svc.publish_plan(
                    "u1",
                    NewPlan {
                        requirements: "one bucket".into(),
                        structured_requirements: serde_json::json!({}),
                        files: BTreeMap::from([("main.tf".to_string(), MAIN_TF.to_string())]),
                    },
                )
                .await
            })
        };
        while h.tool.stages().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let keys = h.objects.list_keys(BUCKET, "u1/").await.unwrap();
        assert_eq!(keys.len(), 1);
        let plan_id: Uuid = keys[0].split('/').nth(1).unwrap().parse().unwrap();
        let pending = svc.plans.get_plan(plan_id).await.unwrap().unwrap();
        assert_eq!(pending.status, PlanStatus::Generating);
        assert!(pending.validation.is_none());

        gate.add_permits(100);
        let plan = publishing.await.unwrap().unwrap();
        assert_eq!(plan.id, plan_id);
        assert_eq!(plan.status, PlanStatus::Ready);
        assert_eq!(svc.plans.get_plan(plan_id).await.unwrap(), Some(plan));
    }

    #[tokio::test]
    async fn plan_files_return_source_without_tool_state() {
        let h = Harness::new();
        let svc = service(&h, 1, 4);
        let plan = h.seed_plan("u1").await;
        h.objects.insert(BUCKET, &format!("{}{}", plan.source_prefix, STATE_FILE), b"{}");

        let files = svc.plan_files("u1", plan.id).await.unwrap();
        assert_eq!(files, BTreeMap::from([("main.tf".to_string(), MAIN_TF.to_string())]));
        assert!(matches!(svc.plan_files("u2", plan.id).await, Err(AgentError::Forbidden { .. })));
    }

    #[tokio::test]
    async fn validation_of_a_foreign_prefix_is_forbidden() {
        let h = Harness::new();
        let svc = service(&h, 1, 4);
        let err = svc
            .validate("u1", ValidationSource::Prefix("u2/p/v1/".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Forbidden { .. }));

        let outcome = svc.validate("u1", ValidationSource::Text(MAIN_TF.into())).await.unwrap();
        assert!(outcome.valid);
    }

    #[tokio::test]
    async fn connections_cannot_be_registered_for_someone_else() {
        let h = Harness::new();
        let svc = service(&h, 1, 4);
        let theirs = h.seed_connection("u2", ConnectionStatus::Connected).await;

        let mut hijack = theirs.clone();
        hijack.owner = "u1".into();
        assert!(matches!(
            svc.register_connection("u1", hijack).await,
            Err(AgentError::Forbidden { .. })
        ));
        assert!(matches!(
            svc.register_connection("u1", theirs).await,
            Err(AgentError::Forbidden { .. })
        ));
    }
}
