// agent/src/server.rs
//
// Newline-delimited JSON over a Unix domain socket: one request object per
// line in, one `AgentResponse` per line out.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_stream::wrappers::UnixListenerStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::error::AgentError;
use crate::model::CloudConnection;
use crate::orchestrator::ValidationSource;
use crate::service::{DeploymentService, NewPlan};

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AgentRequest {
    StartApply { owner: String, plan_id: Uuid, connection_id: Uuid },
    StartDestroy { owner: String, deployment_id: Uuid },
    Validate {
        owner: String,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        prefix: Option<String>,
    },
    GetStatus { owner: String, deployment_id: Uuid },
    ListDeployments { owner: String },
    PlanSummary { owner: String, plan_id: Uuid },
    PlanFiles { owner: String, plan_id: Uuid },
    PublishPlan {
        owner: String,
        requirements: String,
        #[serde(default)]
        structured_requirements: Value,
        files: BTreeMap<String, String>,
    },
    RegisterConnection { owner: String, connection: CloudConnection },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl AgentResponse {
    fn ok(data: Value) -> Self {
        Self { success: true, data: Some(data), error_kind: None, error_message: None }
    }
}

fn construct_error_response(kind: &str, err_msg: &str) -> AgentResponse {
    AgentResponse {
        success: false,
        data: None,
        error_kind: Some(kind.to_string()),
        error_message: Some(err_msg.to_string()),
    }
}

impl From<AgentError> for AgentResponse {
    fn from(err: AgentError) -> Self {
        construct_error_response(err.kind(), &err.to_string())
    }
}

fn to_data<T: Serialize>(value: &T) -> Result<Value, AgentError> {
    serde_json::to_value(value).map_err(|e| AgentError::Unexpected(format!("response encoding failed: {e}")))
}

/// Parses and executes one request line.
pub async fn handle_request(service: &DeploymentService, line: &str) -> AgentResponse {
    let request: AgentRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => return construct_error_response("bad_request", &format!("malformed request: {e}")),
    };
    match dispatch(service, request).await {
        Ok(data) => AgentResponse::ok(data),
        Err(e) => e.into(),
    }
}

async fn dispatch(service: &DeploymentService, request: AgentRequest) -> Result<Value, AgentError> {
    match request {
        AgentRequest::StartApply { owner, plan_id, connection_id } => {
            let deployment = service.start_apply(&owner, plan_id, connection_id).await?;
            Ok(json!({
                "deployment_id": deployment.id,
                "status": deployment.status,
                "message": "Deployment started in background",
            }))
        }
        AgentRequest::StartDestroy { owner, deployment_id } => {
            let deployment = service.start_destroy(&owner, deployment_id).await?;
            Ok(json!({
                "deployment_id": deployment.id,
                "status": deployment.status,
                "message": "Destroy operation started in background",
            }))
        }
        AgentRequest::Validate { owner, text, prefix } => {
            let source = match (text, prefix) {
                (Some(text), None) => ValidationSource::Text(text),
                (None, Some(prefix)) => ValidationSource::Prefix(prefix),
                _ => {
                    return Err(AgentError::Precondition(
                        "exactly one of 'text' or 'prefix' is required".into(),
                    ));
                }
            };
            to_data(&service.validate(&owner, source).await?)
        }
        AgentRequest::GetStatus { owner, deployment_id } => {
            to_data(&service.get_status(&owner, deployment_id).await?)
        }
        AgentRequest::ListDeployments { owner } => to_data(&service.list_deployments(&owner).await?),
        AgentRequest::PlanSummary { owner, plan_id } => {
            to_data(&service.plan_summary(&owner, plan_id).await?)
        }
        AgentRequest::PlanFiles { owner, plan_id } => to_data(&service.plan_files(&owner, plan_id).await?),
        AgentRequest::PublishPlan { owner, requirements, structured_requirements, files } => {
            let plan = service
                .publish_plan(&owner, NewPlan { requirements, structured_requirements, files })
                .await?;
            to_data(&plan)
        }
        AgentRequest::RegisterConnection { owner, connection } => {
            to_data(&service.register_connection(&owner, connection).await?)
        }
    }
}

/// Accepts connections until `shutdown` resolves. Peers whose UID is not
/// `expected_uid` get one refusal and are disconnected.
pub async fn serve(
    listener: UnixListener,
    service: Arc<DeploymentService>,
    expected_uid: u32,
    shutdown: impl Future<Output = ()>,
) {
    let mut incoming = UnixListenerStream::new(listener);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => {
                tracing::info!("Front end shutting down");
                break;
            }
            next = incoming.next() => match next {
                Some(Ok(stream)) => {
                    let service = Arc::clone(&service);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, service, expected_uid).await {
                            tracing::warn!(error = %e, "Connection closed with error");
                        }
                    });
                }
                Some(Err(e)) => tracing::warn!(error = %e, "Failed to accept connection"),
                None => break,
            },
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    service: Arc<DeploymentService>,
    expected_uid: u32,
) -> std::io::Result<()> {
    // 🛡️ SO_PEERCRED: socket permissions narrow who can connect, this pins it
    // to the one API identity.
    let peer_uid = stream.peer_cred()?.uid();
    let (reader, mut writer) = stream.into_split();

    if peer_uid != expected_uid {
        tracing::warn!(peer_uid, expected_uid, "Rejected connection from unexpected peer");
        let refusal = construct_error_response("forbidden", "peer is not the configured API user");
        return write_response(&mut writer, &refusal).await;
    }

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_request(&service, &line).await;
        write_response(&mut writer, &response).await?;
    }
    Ok(())
}

async fn write_response(
    writer: &mut (impl AsyncWriteExt + Unpin),
    response: &AgentResponse,
) -> std::io::Result<()> {
    let mut encoded = serde_json::to_vec(response)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}
