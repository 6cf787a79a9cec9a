use super::naming::{ResourceNaming, AGENT_CONTAINER};
use super::workload::{build_session_job, build_session_pvc, session_labels, session_owner};
use crate::crds::{AgenticSession, AgenticSessionStatus, ConditionStatus, SessionPhase};
use crate::reconcile::client::ManagedObject;
use crate::reconcile::conditions::{
    derive_phase_from_conditions, ensure_session_is_interactive, find_condition, mutate_session,
    mutate_session_status, now_rfc3339, set_condition, ConditionUpdate, COMPLETED, FAILED,
    JOB_CREATED, POD_SCHEDULED, PVC_READY, REPOS_RECONCILED, RUNNER_STARTED, SECRETS_READY,
    WORKFLOW_RECONCILED,
};
use crate::reconcile::metrics::ControllerKind;
use crate::reconcile::provision::{ensure_exec_rbac, ensure_object};
use crate::reconcile::resolver::resolve_session_config;
use crate::reconcile::types::{Context, Result, DESIRED_PHASE_ANNOTATION};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Poll interval while a session is still progressing
pub const ACTIVE_REQUEUE: Duration = Duration::from_secs(15);
/// Retry interval while the runner secret is missing
pub const SECRET_REQUEUE: Duration = Duration::from_secs(30);
pub const RESTART_REQUEUE: Duration = Duration::from_secs(1);

const RESTART_RESET: [&str; 5] = [JOB_CREATED, POD_SCHEDULED, RUNNER_STARTED, COMPLETED, FAILED];

#[instrument(skip(session, ctx), fields(namespace = %session.namespace().unwrap_or_default(), session = %session.name_any()))]
pub async fn reconcile_session(session: Arc<AgenticSession>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = session.namespace().unwrap_or_default();
    let name = session.name_any();
    ctx.metrics.record_reconcile(ControllerKind::Session);

    let action = reconcile_session_by_name(&ctx, &namespace, &name).await?;
    ctx.backoff.reset(&format!("{namespace}/{name}"));
    Ok(action)
}

/// Level-triggered reconcile of one session, always starting from a fresh read
pub async fn reconcile_session_by_name(ctx: &Context, namespace: &str, name: &str) -> Result<Action> {
    let client = ctx.client.as_ref();

    let Some(session) = client.get_session(namespace, name).await? else {
        debug!("session not found, nothing to do");
        return Ok(Action::await_change());
    };
    if session.metadata.deletion_timestamp.is_some() {
        debug!("session is being deleted, owned resources are garbage collected");
        return Ok(Action::await_change());
    }

    if let Err(reason) = session.spec.validate() {
        warn!(%reason, "session spec is invalid");
        mutate_session_status(client, namespace, name, |status| {
            set_condition(status, ConditionUpdate::truthy(FAILED, "InvalidSpec", reason.clone()));
            status.message = Some(reason.clone());
        })
        .await?;
        return Ok(Action::await_change());
    }

    let status = session.status.clone().unwrap_or_default();
    let terminal = derive_phase_from_conditions(&status).is_some_and(|p| p.is_terminal());

    if restart_requested(&session) {
        if terminal {
            restart_session(ctx, &session).await?;
            return Ok(Action::requeue(RESTART_REQUEUE));
        }
        // A restart request on a live session is meaningless; drop it so it
        // cannot fire once the session later finishes
        clear_restart_request(ctx, namespace, name).await?;
    }

    if terminal {
        debug!("session is terminal, waiting for a restart request");
        return Ok(Action::await_change());
    }

    let project = client.get_project_settings(namespace).await?;
    let effective = resolve_session_config(&ctx.config, project.as_ref().map(|p| &p.spec), &session.spec);
    let owner = session_owner(&session)?;
    let labels = session_labels(name);
    let mut progress = Progress::default();

    ensure_exec_rbac(
        client,
        namespace,
        &ResourceNaming::rbac_name(name),
        &labels,
        Some(&owner),
    )
    .await?;

    let pvc = build_session_pvc(&session, &effective, &ctx.config)?;
    let pvc_name = pvc.name_any();
    ensure_object(client, namespace, ManagedObject::PersistentVolumeClaim(pvc)).await?;
    progress.push(ConditionUpdate::truthy(
        PVC_READY,
        "Provisioned",
        format!("workspace volume {pvc_name} is provisioned"),
    ));

    let secret_name = &effective.runner_secrets_name;
    if client.get_secret(namespace, secret_name).await?.is_none() {
        info!(secret = %secret_name, "runner secret missing, waiting");
        progress.push(ConditionUpdate::falsy(
            SECRETS_READY,
            "SecretNotFound",
            format!("secret {secret_name} not found in namespace {namespace}"),
        ));
        progress.persist(ctx, &session).await?;
        return Ok(Action::requeue(SECRET_REQUEUE));
    }
    progress.push(ConditionUpdate::truthy(
        SECRETS_READY,
        "Found",
        format!("secret {secret_name} is available"),
    ));

    let job_name = ResourceNaming::job_name(name);
    match client.get_job(namespace, &job_name).await? {
        Some(job) => {
            let pods = client
                .list_pods(namespace, &format!("job-name={job_name}"))
                .await?;
            progress.observe(&job, &pods);
        }
        None => {
            let job = build_session_job(&session, &effective, &ctx.config)?;
            ensure_object(client, namespace, ManagedObject::Job(job)).await?;
        }
    }
    progress.job_name = Some(job_name.clone());
    progress.push(ConditionUpdate::truthy(
        JOB_CREATED,
        "Created",
        format!("job {job_name} created"),
    ));

    if !effective.repos.is_empty() {
        progress.push(ConditionUpdate::truthy(
            REPOS_RECONCILED,
            "Configured",
            format!("{} repositories configured", effective.repos.len()),
        ));
    }
    if let Some(workflow) = &session.spec.active_workflow {
        progress.push(ConditionUpdate::truthy(
            WORKFLOW_RECONCILED,
            "Configured",
            format!("workflow {} configured", workflow.git_url),
        ));
    }

    progress.persist(ctx, &session).await?;

    if progress.finished {
        // The workspace container never exits on its own; release the node
        info!(job = %job_name, "session finished, deleting job");
        client.delete_job(namespace, &job_name).await?;
        return Ok(Action::await_change());
    }

    Ok(Action::requeue(ACTIVE_REQUEUE))
}

fn restart_requested(session: &AgenticSession) -> bool {
    session
        .annotations()
        .get(DESIRED_PHASE_ANNOTATION)
        .is_some_and(|phase| phase.eq_ignore_ascii_case(SessionPhase::Running.as_str()))
}

async fn clear_restart_request(ctx: &Context, namespace: &str, name: &str) -> Result<bool> {
    mutate_session(ctx.client.as_ref(), namespace, name, |session| {
        session
            .annotations_mut()
            .remove(DESIRED_PHASE_ANNOTATION)
            .is_some()
    })
    .await
}

/// Puts a finished session back into a buildable state
async fn restart_session(ctx: &Context, session: &AgenticSession) -> Result<()> {
    let client = ctx.client.as_ref();
    let namespace = session.namespace().unwrap_or_default();
    let name = session.name_any();
    info!("restarting session");

    ensure_session_is_interactive(client, &namespace, &name).await?;
    client
        .delete_job(&namespace, &ResourceNaming::job_name(&name))
        .await?;

    mutate_session_status(client, &namespace, &name, |status| {
        for condition_type in RESTART_RESET {
            set_condition(
                status,
                ConditionUpdate::falsy(condition_type, "Restarting", "session restart requested"),
            );
        }
        status.completion_time = None;
        status.message = Some("Restarting session".to_string());
    })
    .await?;

    clear_restart_request(ctx, &namespace, &name).await?;
    Ok(())
}

/// Condition updates gathered during one reconcile, written in a single status update
#[derive(Debug, Default)]
struct Progress {
    updates: Vec<ConditionUpdate>,
    job_name: Option<String>,
    started: bool,
    finished: bool,
}

impl Progress {
    fn push(&mut self, update: ConditionUpdate) {
        self.updates.push(update);
    }

    fn observe(&mut self, job: &Job, pods: &[Pod]) {
        let observation = observe_workload(job, pods);
        self.started |= observation.started;
        self.finished |= observation.finished;
        self.updates.extend(observation.updates);
    }

    async fn persist(&self, ctx: &Context, session: &AgenticSession) -> Result<()> {
        let namespace = session.namespace().unwrap_or_default();
        let name = session.name_any();
        let generation = session.metadata.generation;

        mutate_session_status(ctx.client.as_ref(), &namespace, &name, |status| {
            for update in &self.updates {
                set_condition(status, update.clone());
            }
            if self.job_name.is_some() {
                status.job_name = self.job_name.clone();
            }
            if generation.is_some() {
                status.observed_generation = generation;
            }
            if self.started && status.start_time.is_none() {
                status.start_time = Some(now_rfc3339());
            }
            if self.finished && status.completion_time.is_none() {
                status.completion_time = Some(now_rfc3339());
            }
            status.message = Some(phase_message(status));
        })
        .await?;
        Ok(())
    }
}

fn phase_message(status: &AgenticSessionStatus) -> String {
    let failure = |condition_type: &str| {
        find_condition(status, condition_type)
            .filter(|c| c.status != ConditionStatus::True && !c.message.is_empty())
            .map(|c| c.message.clone())
    };

    match derive_phase_from_conditions(status) {
        Some(SessionPhase::Failed) => find_condition(status, FAILED)
            .map(|c| c.message.clone())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "Session failed".to_string()),
        Some(SessionPhase::Completed) => "Session completed".to_string(),
        Some(SessionPhase::Running) => "Agent is running".to_string(),
        Some(SessionPhase::Creating) => failure(POD_SCHEDULED)
            .unwrap_or_else(|| "Waiting for the session pod to start".to_string()),
        Some(SessionPhase::Pending) => failure(SECRETS_READY)
            .unwrap_or_else(|| "Workspace volume provisioned".to_string()),
        Some(SessionPhase::Stopped) => "Session stopped".to_string(),
        Some(SessionPhase::Unknown) | None => "Provisioning session resources".to_string(),
    }
}

/// What the Job and its pod say about the session
#[derive(Debug, Default, PartialEq)]
pub struct WorkloadObservation {
    pub updates: Vec<ConditionUpdate>,
    pub started: bool,
    pub finished: bool,
}

/// Labels the Job controller stamps on its pods, current and legacy
const CONTROLLER_UID_LABELS: [&str; 2] = ["batch.kubernetes.io/controller-uid", "controller-uid"];

/// Whether `pod` is a live pod of this exact Job instance
///
/// A restarted session reuses the Job name, and pods of the deleted Job can
/// linger with the same `job-name` label until garbage collection catches up.
fn belongs_to_job(pod: &Pod, job: &Job) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    let Some(uid) = job.metadata.uid.as_deref() else {
        return true;
    };
    pod.owner_references().iter().any(|owner| owner.uid == uid)
        || CONTROLLER_UID_LABELS
            .iter()
            .any(|label| pod.labels().get(*label).map(String::as_str) == Some(uid))
}

pub fn observe_workload(job: &Job, pods: &[Pod]) -> WorkloadObservation {
    let mut observation = WorkloadObservation::default();

    if let Some(pod) = pods.iter().find(|pod| belongs_to_job(pod, job)) {
        observe_pod(pod, &mut observation);
    }

    let job_conditions = job
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(Vec::as_slice)
        .unwrap_or_default();
    for condition in job_conditions.iter().filter(|c| c.status == "True") {
        match condition.type_.as_str() {
            "Complete" => {
                observation.finished = true;
                observation.updates.push(ConditionUpdate::truthy(
                    COMPLETED,
                    "JobComplete",
                    "session job completed",
                ));
            }
            "Failed" => {
                observation.finished = true;
                let reason = condition.reason.clone().unwrap_or_else(|| "JobFailed".to_string());
                let message = condition
                    .message
                    .clone()
                    .unwrap_or_else(|| "session job failed".to_string());
                observation
                    .updates
                    .push(ConditionUpdate::truthy(FAILED, reason, message));
            }
            _ => {}
        }
    }

    observation
}

fn observe_pod(pod: &Pod, observation: &mut WorkloadObservation) {
    let node = pod.spec.as_ref().and_then(|s| s.node_name.as_deref());
    let status = pod.status.as_ref();

    match node {
        Some(node) => observation.updates.push(ConditionUpdate::truthy(
            POD_SCHEDULED,
            "Scheduled",
            format!("pod {} scheduled on {node}", pod.name_any()),
        )),
        None => {
            let unschedulable = status
                .and_then(|s| s.conditions.as_ref())
                .and_then(|conditions| {
                    conditions
                        .iter()
                        .find(|c| c.type_ == "PodScheduled" && c.status == "False")
                });
            if let Some(condition) = unschedulable {
                observation.updates.push(ConditionUpdate::falsy(
                    POD_SCHEDULED,
                    condition.reason.clone().unwrap_or_else(|| "Unschedulable".to_string()),
                    condition.message.clone().unwrap_or_default(),
                ));
            }
        }
    }

    let agent = status
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.iter().find(|c| c.name == AGENT_CONTAINER));
    let Some(state) = agent.and_then(|a| a.state.as_ref()) else {
        return;
    };

    if state.running.is_some() {
        observation.started = true;
        observation.updates.push(ConditionUpdate::truthy(
            RUNNER_STARTED,
            "Started",
            "agent container is running",
        ));
    } else if let Some(terminated) = &state.terminated {
        observation.started = true;
        observation.finished = true;
        observation.updates.push(ConditionUpdate::truthy(
            RUNNER_STARTED,
            "Started",
            "agent container ran",
        ));
        if terminated.exit_code == 0 {
            observation.updates.push(ConditionUpdate::truthy(
                COMPLETED,
                "AgentCompleted",
                "agent finished successfully",
            ));
        } else {
            let reason = terminated.reason.clone().unwrap_or_else(|| "Error".to_string());
            observation.updates.push(ConditionUpdate::truthy(
                FAILED,
                "AgentFailed",
                format!("agent container exited with code {}: {reason}", terminated.exit_code),
            ));
        }
    } else if let Some(waiting) = &state.waiting {
        let reason = waiting.reason.as_deref().unwrap_or_default();
        if matches!(reason, "ErrImagePull" | "ImagePullBackOff" | "InvalidImageName") {
            observation.updates.push(ConditionUpdate::falsy(
                RUNNER_STARTED,
                reason,
                waiting.message.clone().unwrap_or_default(),
            ));
        }
    }
}
