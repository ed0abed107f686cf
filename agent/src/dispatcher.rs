// agent/src/dispatcher.rs

use std::any::Any;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, error::TrySendError, OwnedPermit};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::model::{Operation, ValidationOutcome};
use crate::orchestrator::{ApplyRequest, DestroyRequest, Orchestrator, ValidationSource};

pub enum Job {
    Apply(ApplyRequest),
    Destroy(DestroyRequest),
    Validate {
        source: ValidationSource,
        reply: oneshot::Sender<ValidationOutcome>,
    },
}

impl Job {
    fn name(&self) -> &'static str {
        match self {
            Self::Apply(_) => "apply",
            Self::Destroy(_) => "destroy",
            Self::Validate { .. } => "validate",
        }
    }

    /// The deployment cycle this job owns, if any.
    fn cycle(&self) -> Option<(Uuid, Operation)> {
        match self {
            Self::Apply(request) => Some((request.deployment_id, Operation::Apply)),
            Self::Destroy(request) => Some((request.deployment_id, Operation::Destroy)),
            Self::Validate { .. } => None,
        }
    }
}

/// A reserved place in the queue. Taking one before mutating any state means a
/// full queue is reported without leaving a deployment behind that no worker
/// will ever pick up. Dropping an unused slot gives the place back.
pub struct JobSlot {
    permit: OwnedPermit<Job>,
}

impl JobSlot {
    pub fn dispatch(self, job: Job) {
        tracing::debug!(job = job.name(), "Job queued");
        self.permit.send(job);
    }
}

/// Bounded queue in front of a fixed pool of workers. Each job runs to
/// completion on one worker; jobs for different deployments run in parallel.
pub struct Dispatcher {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn spawn(orchestrator: Arc<Orchestrator>, workers: usize, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let queue = Arc::new(tokio::sync::Mutex::new(receiver));

        let handles = (0..workers.max(1))
            .map(|worker| {
                tokio::spawn(worker_loop(worker, Arc::clone(&orchestrator), Arc::clone(&queue)))
            })
            .collect();
        tracing::info!(workers = workers.max(1), capacity = capacity.max(1), "Dispatcher started");

        Self {
            sender: Mutex::new(Some(sender)),
            workers: tokio::sync::Mutex::new(handles),
        }
    }

    pub fn reserve(&self) -> Result<JobSlot> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or_else(|| AgentError::Unavailable("agent is shutting down".into()))?;

        match sender.try_reserve_owned() {
            Ok(permit) => Ok(JobSlot { permit }),
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Job queue is full, rejecting request");
                Err(AgentError::Unavailable("job queue is full".into()))
            }
            Err(TrySendError::Closed(_)) => Err(AgentError::Unavailable("agent is shutting down".into())),
        }
    }

    /// Stops accepting jobs, lets the workers drain what is already queued and
    /// waits for them to exit.
    pub async fn shutdown(&self) {
        drop(self.sender.lock().unwrap_or_else(|p| p.into_inner()).take());
        let handles = std::mem::take(&mut *self.workers.lock().await);
        tracing::info!(workers = handles.len(), "Draining job queue");
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker exited abnormally");
            }
        }
        tracing::info!("Dispatcher stopped");
    }
}

async fn worker_loop(
    worker: usize,
    orchestrator: Arc<Orchestrator>,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
) {
    loop {
        // The lock is only held while waiting for the next job, never while running one.
        let next = queue.lock().await.recv().await;
        let Some(job) = next else {
            break;
        };
        run_job(worker, &orchestrator, job).await;
    }
    tracing::debug!(worker, "Worker stopped");
}

/// Runs one job on its own task so a panic inside it is contained: the
/// deployment is marked failed and the worker carries on.
async fn run_job(worker: usize, orchestrator: &Arc<Orchestrator>, job: Job) {
    let name = job.name();
    let cycle = job.cycle();
    tracing::info!(worker, job = name, deployment_id = ?cycle.map(|(id, _)| id), "Job picked up");

    let task = {
        let orchestrator = Arc::clone(orchestrator);
        tokio::spawn(async move { execute(&orchestrator, job).await })
    };

    match task.await {
        Ok(()) => {}
        Err(e) if e.is_panic() => {
            let reason = panic_message(e.into_panic());
            tracing::error!(worker, job = name, reason = %reason, "Job panicked");
            if let Some((id, operation)) = cycle {
                orchestrator.abandon(id, operation, &reason).await;
            }
        }
        Err(e) => tracing::error!(worker, job = name, error = %e, "Job was cancelled"),
    }
}

async fn execute(orchestrator: &Orchestrator, job: Job) {
    match job {
        Job::Apply(request) => {
            let id = request.deployment_id;
            if let Err(e) = orchestrator.apply(request).await {
                tracing::error!(deployment_id = %id, error = %e, "Apply could not be recorded");
            }
        }
        Job::Destroy(request) => {
            let id = request.deployment_id;
            if let Err(e) = orchestrator.destroy(request).await {
                tracing::error!(deployment_id = %id, error = %e, "Destroy could not be recorded");
            }
        }
        Job::Validate { source, reply } => {
            let outcome = orchestrator.validate(source).await;
            // The caller may have given up waiting.
            let _ = reply.send(outcome);
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "job panicked".to_string()
    }
}
