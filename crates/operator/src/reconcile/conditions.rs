//! Condition bookkeeping and phase derivation for `AgenticSession` status
//!
//! The phase is a projection of the condition list and is recomputed on every
//! status write; nothing else assigns it.

use super::client::ResourceClient;
use super::types::{Error, Result};
use crate::crds::{AgenticSession, AgenticSessionStatus, ConditionStatus, SessionCondition, SessionPhase};
use chrono::{SecondsFormat, Utc};
use kube::ResourceExt;
use tracing::debug;

pub const PVC_READY: &str = "PVCReady";
pub const SECRETS_READY: &str = "SecretsReady";
pub const JOB_CREATED: &str = "JobCreated";
pub const POD_SCHEDULED: &str = "PodScheduled";
pub const RUNNER_STARTED: &str = "RunnerStarted";
pub const REPOS_RECONCILED: &str = "ReposReconciled";
pub const WORKFLOW_RECONCILED: &str = "WorkflowReconciled";
pub const COMPLETED: &str = "Completed";
pub const FAILED: &str = "Failed";

/// Read-modify-write attempts before giving up on a contended object
pub const MAX_UPDATE_ATTEMPTS: u32 = 5;

/// Desired state of one condition
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConditionUpdate {
    pub condition_type: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
}

impl ConditionUpdate {
    pub fn new(
        condition_type: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            condition_type: condition_type.into(),
            status,
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn truthy(condition_type: impl Into<String>, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(condition_type, ConditionStatus::True, reason, message)
    }

    pub fn falsy(condition_type: impl Into<String>, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(condition_type, ConditionStatus::False, reason, message)
    }
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Upserts a condition by type, stamping the current time on transitions
pub fn set_condition(status: &mut AgenticSessionStatus, update: ConditionUpdate) {
    set_condition_at(status, update, &now_rfc3339());
}

/// Upserts a condition by type (case-insensitive)
///
/// `lastTransitionTime` moves only when `status` changes. An empty reason or
/// message in the update keeps the stored one.
pub fn set_condition_at(status: &mut AgenticSessionStatus, update: ConditionUpdate, now: &str) {
    let existing = status
        .conditions
        .iter_mut()
        .find(|c| c.condition_type.eq_ignore_ascii_case(&update.condition_type));

    match existing {
        Some(condition) => {
            if condition.status != update.status {
                condition.status = update.status;
                condition.last_transition_time = Some(now.to_string());
            }
            if !update.reason.is_empty() {
                condition.reason = update.reason;
            }
            if !update.message.is_empty() {
                condition.message = update.message;
            }
        }
        None => status.conditions.push(SessionCondition {
            condition_type: update.condition_type,
            status: update.status,
            reason: update.reason,
            message: update.message,
            last_transition_time: Some(now.to_string()),
        }),
    }
}

pub fn find_condition<'a>(status: &'a AgenticSessionStatus, condition_type: &str) -> Option<&'a SessionCondition> {
    status
        .conditions
        .iter()
        .find(|c| c.condition_type.eq_ignore_ascii_case(condition_type))
}

pub fn is_condition_true(status: &AgenticSessionStatus, condition_type: &str) -> bool {
    find_condition(status, condition_type).is_some_and(|c| c.status == ConditionStatus::True)
}

/// Priority-ordered projection of the conditions onto a phase
///
/// `Failed` outranks everything so a failing session never reads as running.
pub fn derive_phase_from_conditions(status: &AgenticSessionStatus) -> Option<SessionPhase> {
    const PRIORITY: [(&str, SessionPhase); 5] = [
        (FAILED, SessionPhase::Failed),
        (COMPLETED, SessionPhase::Completed),
        (RUNNER_STARTED, SessionPhase::Running),
        (JOB_CREATED, SessionPhase::Creating),
        (PVC_READY, SessionPhase::Pending),
    ];

    PRIORITY
        .iter()
        .find(|(condition_type, _)| is_condition_true(status, condition_type))
        .map(|(_, phase)| *phase)
}

/// Fetch, mutate and write back a session's status, retrying on conflicts
///
/// Returns `Ok(None)` when the session no longer exists. The phase is derived
/// from the mutated conditions; the write is skipped when nothing changed.
pub async fn mutate_session_status<F>(
    client: &dyn ResourceClient,
    namespace: &str,
    name: &str,
    mut mutate: F,
) -> Result<Option<AgenticSession>>
where
    F: FnMut(&mut AgenticSessionStatus) + Send,
{
    for attempt in 1..=MAX_UPDATE_ATTEMPTS {
        let Some(mut session) = client.get_session(namespace, name).await? else {
            debug!(namespace = %namespace, session = %name, "session gone, skipping status update");
            return Ok(None);
        };

        let before = session.status.clone().unwrap_or_default();
        let mut status = before.clone();
        mutate(&mut status);
        match derive_phase_from_conditions(&status) {
            Some(phase) => status.phase = Some(phase),
            None if status.phase == Some(SessionPhase::Unknown) => status.phase = None,
            None => {}
        }
        if status == before {
            return Ok(Some(session));
        }

        session.status = Some(status);
        match client.replace_session_status(&session).await {
            Ok(updated) => return Ok(Some(updated)),
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) if e.is_conflict() => {
                debug!(namespace = %namespace, session = %name, attempt, "status update conflicted, retrying");
            }
            Err(e) => return Err(e),
        }
    }

    Err(Error::Conflict {
        kind: "AgenticSession",
        namespace: namespace.to_string(),
        name: name.to_string(),
        attempts: MAX_UPDATE_ATTEMPTS,
    })
}

/// Fetch, mutate and write back a session's spec or metadata
///
/// `mutate` returns whether it changed anything; when it does not, no write is
/// issued. Returns whether a write happened.
pub async fn mutate_session<F>(
    client: &dyn ResourceClient,
    namespace: &str,
    name: &str,
    mut mutate: F,
) -> Result<bool>
where
    F: FnMut(&mut AgenticSession) -> bool + Send,
{
    for attempt in 1..=MAX_UPDATE_ATTEMPTS {
        let Some(mut session) = client.get_session(namespace, name).await? else {
            return Ok(false);
        };
        if !mutate(&mut session) {
            return Ok(false);
        }

        match client.replace_session(&session).await {
            Ok(_) => return Ok(true),
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) if e.is_conflict() => {
                debug!(namespace = %namespace, session = %session.name_any(), attempt, "session update conflicted, retrying");
            }
            Err(e) => return Err(e),
        }
    }

    Err(Error::Conflict {
        kind: "AgenticSession",
        namespace: namespace.to_string(),
        name: name.to_string(),
        attempts: MAX_UPDATE_ATTEMPTS,
    })
}

/// Forces `spec.interactive = true`; no write when it is already set
pub async fn ensure_session_is_interactive(
    client: &dyn ResourceClient,
    namespace: &str,
    name: &str,
) -> Result<bool> {
    mutate_session(client, namespace, name, |session| {
        if session.spec.interactive {
            return false;
        }
        session.spec.interactive = true;
        true
    })
    .await
}
