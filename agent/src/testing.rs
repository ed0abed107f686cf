// agent/src/testing.rs
//
// In-memory fakes for the trait seams plus a fully wired orchestrator.

use async_trait::async_trait;
use secrecy::SecretString;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::error::{CredentialError, StoreError};
use crate::model::{
    source_prefix, CloudConnection, ConnectionStatus, Deployment, DeploymentStatus, Plan, PlanStatus,
};
use crate::dispatcher::Dispatcher;
use crate::orchestrator::Orchestrator;
use crate::repository::{MemoryCatalog, MemoryDeploymentRepository};
use crate::service::DeploymentService;
use crate::state::StatusUpdate;
use crate::sys::sandbox::SandboxManager;
use crate::sys::secrets::AssumedCredentials;
use crate::sys::store::SourceStore;
use crate::sys::tool::{Stage, StageOutput, ToolInvoker, STATE_FILE};
use crate::sys::traits::{
    ConnectionCatalog, CredentialBroker, DeploymentRepository, IacTool, ObjectMeta, ObjectStore,
    PlanCatalog,
};

pub const BUCKET: &str = "iac-source";
pub const APPLY_STDOUT: &str =
    "\x1b[32mApply complete!\x1b[0m Resources: 1 added, 0 changed, 0 destroyed.\n";
pub const DESTROY_STDOUT: &str = "Destroy complete! Resources: 1 destroyed.\n";
pub const MAIN_TF: &str = "resource \"aws_s3_bucket\" \"site\" {}\n";

/// Writes an executable script and returns its path.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub fn fake_credentials() -> AssumedCredentials {
    AssumedCredentials::new(
        SecretString::new("ASIATESTACCESSKEY".into()),
        SecretString::new("test-secret-key".into()),
        SecretString::new("test-session-token".into()),
    )
}

// ==============================================================================
// Object store
// ==============================================================================

type ObjectKey = (String, String);

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<ObjectKey, (Vec<u8>, ObjectMeta)>>,
    failing_puts: Mutex<HashSet<String>>,
}

impl MemoryObjectStore {
    pub fn insert(&self, bucket: &str, key: &str, body: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert((bucket.into(), key.into()), (body.to_vec(), ObjectMeta::TEXT_ENCRYPTED));
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<(Vec<u8>, ObjectMeta)> {
        self.objects.lock().unwrap().get(&(bucket.into(), key.into())).cloned()
    }

    pub fn fail_puts_for(&self, key: &str) {
        self.failing_puts.lock().unwrap().insert(key.into());
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        meta: ObjectMeta,
    ) -> Result<(), StoreError> {
        if self.failing_puts.lock().unwrap().contains(key) {
            return Err(StoreError::AccessDenied(format!("put {key} denied")));
        }
        self.objects.lock().unwrap().insert((bucket.into(), key.into()), (body, meta));
        Ok(())
    }

    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .map(|(_, k)| k.clone())
            .collect())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        self.object(bucket, key)
            .map(|(body, _)| body)
            .ok_or_else(|| StoreError::NotFound { key: key.into() })
    }
}

// ==============================================================================
// Credential broker
// ==============================================================================

#[derive(Default)]
pub struct StaticBroker {
    reject: bool,
    calls: AtomicUsize,
}

impl StaticBroker {
    pub fn rejecting() -> Self {
        Self { reject: true, calls: AtomicUsize::new(0) }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialBroker for StaticBroker {
    async fn assume(
        &self,
        role_arn: &str,
        _external_id: &str,
    ) -> Result<AssumedCredentials, CredentialError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.reject {
            return Err(CredentialError::Rejected(format!(
                "\x1b[31mAccessDenied\x1b[0m: not authorized to assume {role_arn}"
            )));
        }
        Ok(fake_credentials())
    }
}

// ==============================================================================
// IaC tool
// ==============================================================================

/// Answers stages from a script: every stage succeeds unless told otherwise.
/// A successful apply leaves a state file behind, like the real tool.
#[derive(Default)]
pub struct ScriptedTool {
    failures: HashMap<Stage, String>,
    panic_at: Option<Stage>,
    gate: Option<Arc<Semaphore>>,
    calls: Mutex<Vec<(Stage, PathBuf, bool)>>,
}

impl ScriptedTool {
    pub fn fail_at(mut self, stage: Stage, stderr: &str) -> Self {
        self.failures.insert(stage, stderr.into());
        self
    }

    pub fn panic_at(mut self, stage: Stage) -> Self {
        self.panic_at = Some(stage);
        self
    }

    /// Every stage waits for a permit first.
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.calls.lock().unwrap().iter().map(|(stage, _, _)| *stage).collect()
    }

    pub fn working_dirs(&self) -> Vec<PathBuf> {
        self.calls.lock().unwrap().iter().map(|(_, dir, _)| dir.clone()).collect()
    }

    /// Whether the persisted state file was present when each stage ran.
    pub fn saw_state(&self) -> Vec<bool> {
        self.calls.lock().unwrap().iter().map(|(_, _, state)| *state).collect()
    }
}

#[async_trait]
impl IacTool for ScriptedTool {
    async fn run_stage(
        &self,
        stage: Stage,
        working_dir: &Path,
        credentials: Option<&AssumedCredentials>,
    ) -> std::io::Result<StageOutput> {
        let has_state = working_dir.join(STATE_FILE).exists();
        self.calls.lock().unwrap().push((stage, working_dir.to_path_buf(), has_state));

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if self.panic_at == Some(stage) {
            panic!("tool crashed during {stage:?}");
        }
        if matches!(stage, Stage::Init | Stage::Plan | Stage::Apply | Stage::Destroy) {
            assert!(credentials.is_some(), "{stage:?} ran without credentials");
        }
        if let Some(stderr) = self.failures.get(&stage) {
            return Ok(StageOutput { exit_code: Some(1), stdout: String::new(), stderr: stderr.clone() });
        }

        let stdout = match stage {
            Stage::Apply => {
                std::fs::write(working_dir.join(STATE_FILE), "{\"version\": 4, \"serial\": 1}")?;
                APPLY_STDOUT.to_string()
            }
            Stage::Destroy => DESTROY_STDOUT.to_string(),
            _ => String::new(),
        };
        Ok(StageOutput { exit_code: Some(0), stdout, stderr: String::new() })
    }
}

// ==============================================================================
// Wired orchestrator
// ==============================================================================

pub struct Harness {
    pub root: tempfile::TempDir,
    pub objects: Arc<MemoryObjectStore>,
    pub broker: Arc<StaticBroker>,
    pub tool: Arc<ScriptedTool>,
    pub deployments: Arc<MemoryDeploymentRepository>,
    pub catalog: Arc<MemoryCatalog>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(ScriptedTool::default(), StaticBroker::default())
    }

    pub fn with_tool(tool: ScriptedTool) -> Self {
        Self::build(tool, StaticBroker::default())
    }

    pub fn build(tool: ScriptedTool, broker: StaticBroker) -> Self {
        let root = tempfile::tempdir().unwrap();
        let objects = Arc::new(MemoryObjectStore::default());
        let broker = Arc::new(broker);
        let tool = Arc::new(tool);
        let deployments = Arc::new(MemoryDeploymentRepository::new());
        let catalog = Arc::new(MemoryCatalog::new());

        let orchestrator = Arc::new(Orchestrator::new(
            BUCKET,
            SourceStore::new(objects.clone()),
            broker.clone(),
            SandboxManager::new(root.path().join("sandboxes")),
            ToolInvoker::new(tool.clone()),
            deployments.clone(),
            catalog.clone(),
        ));

        Self { root, objects, broker, tool, deployments, catalog, orchestrator }
    }

    /// A service over this harness with its own worker pool.
    pub fn service(&self, workers: usize, capacity: usize) -> DeploymentService {
        let dispatcher = Arc::new(Dispatcher::spawn(self.orchestrator.clone(), workers, capacity));
        DeploymentService::new(
            self.orchestrator.clone(),
            dispatcher,
            self.deployments.clone(),
            self.catalog.clone(),
            self.catalog.clone(),
        )
    }

    pub fn sandbox_root(&self) -> PathBuf {
        self.root.path().join("sandboxes")
    }

    /// Nothing left under the sandbox root (or the root was never created).
    pub fn sandboxes_are_gone(&self) -> bool {
        match std::fs::read_dir(self.sandbox_root()) {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => true,
        }
    }

    /// A plan owned by `owner` with one source file stored under its prefix.
    pub async fn seed_plan(&self, owner: &str) -> Plan {
        let id = Uuid::new_v4();
        let prefix = source_prefix(owner, id, 1);
        self.objects.insert(BUCKET, &format!("{prefix}main.tf"), MAIN_TF.as_bytes());
        let plan = Plan {
            id,
            owner: owner.into(),
            source_prefix: prefix,
            requirements: "a static site bucket".into(),
            structured_requirements: serde_json::json!({"resources": ["s3"]}),
            validation: None,
            status: PlanStatus::Ready,
            created_at: chrono::Utc::now(),
        };
        self.catalog.put_plan(plan.clone()).await.unwrap();
        plan
    }

    pub async fn seed_connection(&self, owner: &str, status: ConnectionStatus) -> CloudConnection {
        let connection = CloudConnection {
            id: Uuid::new_v4(),
            owner: owner.into(),
            external_id: format!("ext-{owner}"),
            role_arn: Some("arn:aws:iam::123456789012:role/deployer".into()),
            status,
        };
        self.catalog.put_connection(connection.clone()).await.unwrap();
        connection
    }

    /// Creates a deployment and walks it through `path`.
    pub async fn seed_deployment(
        &self,
        plan: &Plan,
        connection: &CloudConnection,
        path: &[DeploymentStatus],
    ) -> Deployment {
        let mut deployment =
            self.deployments.create(&plan.owner, plan.id, connection.id).await.unwrap();
        for status in path {
            deployment =
                self.deployments.update_status(deployment.id, StatusUpdate::to(*status)).await.unwrap();
        }
        deployment
    }
}
