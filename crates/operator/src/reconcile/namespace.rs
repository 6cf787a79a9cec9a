//! Namespace controller: provisions namespaces labelled `ambient-code.io/managed=true`

use super::metrics::ControllerKind;
use super::provision::provision_namespace;
use super::types::{Context, Result, MANAGED_LABEL_KEY, MANAGED_LABEL_VALUE};
use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Copies and RBAC deleted out from under us are restored on this cadence
pub const NAMESPACE_RESYNC: Duration = Duration::from_secs(600);

/// Label selector for the namespace watch
pub fn managed_namespace_selector() -> String {
    format!("{MANAGED_LABEL_KEY}={MANAGED_LABEL_VALUE}")
}

pub fn is_managed(namespace: &Namespace) -> bool {
    namespace
        .labels()
        .get(MANAGED_LABEL_KEY)
        .is_some_and(|v| v == MANAGED_LABEL_VALUE)
}

#[instrument(skip(namespace, ctx), fields(namespace = %namespace.name_any()))]
pub async fn reconcile_namespace(namespace: Arc<Namespace>, ctx: Arc<Context>) -> Result<Action> {
    ctx.metrics.record_reconcile(ControllerKind::Namespace);
    let name = namespace.name_any();

    if !is_managed(&namespace) {
        debug!("namespace is not managed, ignoring");
        ctx.backoff.reset(&name);
        return Ok(Action::await_change());
    }
    if namespace.metadata.deletion_timestamp.is_some() {
        debug!("namespace is terminating, skipping provisioning");
        ctx.backoff.reset(&name);
        return Ok(Action::await_change());
    }

    let summary = provision_namespace(ctx.client.as_ref(), &ctx.config, &name).await?;
    if summary.pvc_created || summary.git_config_created || !summary.secrets_copied.is_empty() {
        info!(
            secrets_copied = ?summary.secrets_copied,
            git_config_created = summary.git_config_created,
            pvc_created = summary.pvc_created,
            "namespace provisioned"
        );
    }

    ctx.backoff.reset(&name);
    Ok(Action::requeue(NAMESPACE_RESYNC))
}
