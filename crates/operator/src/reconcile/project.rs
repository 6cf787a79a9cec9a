//! ProjectSettings controller
//!
//! Keeps the group-access RoleBindings in place. Sessions in the namespace are
//! re-enqueued separately by the session controller's watch on this kind.

use super::metrics::ControllerKind;
use super::provision::ensure_group_access;
use super::types::{Context, Result};
use crate::crds::{AgenticSession, ProjectSettings};
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info, instrument};

#[instrument(skip(settings, ctx), fields(namespace = %settings.namespace().unwrap_or_default(), name = %settings.name_any()))]
pub async fn reconcile_project_settings(
    settings: Arc<ProjectSettings>,
    ctx: Arc<Context>,
) -> Result<Action> {
    ctx.metrics.record_reconcile(ControllerKind::Project);

    if settings.metadata.deletion_timestamp.is_some() {
        debug!("project settings are being deleted, bindings are garbage collected");
        ctx.backoff.reset(&project_key(&settings));
        return Ok(Action::await_change());
    }

    let created = ensure_group_access(ctx.client.as_ref(), &settings).await?;
    if created > 0 {
        info!(created, "group access bindings created");
    }

    ctx.backoff.reset(&project_key(&settings));
    Ok(Action::await_change())
}

pub(crate) fn project_key(settings: &ProjectSettings) -> String {
    super::object_key(settings.namespace().as_deref(), &settings.name_any())
}

/// Sessions to re-resolve after `settings` changed
pub fn sessions_affected_by<'a, I>(
    settings: &ProjectSettings,
    sessions: I,
) -> Vec<ObjectRef<AgenticSession>>
where
    I: IntoIterator<Item = &'a AgenticSession>,
{
    let namespace = settings.namespace();
    sessions
        .into_iter()
        .filter(|session| session.namespace() == namespace)
        .map(ObjectRef::from_obj)
        .collect()
}
