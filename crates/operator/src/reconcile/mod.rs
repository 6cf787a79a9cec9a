use crate::crds::{AgenticSession, ProjectSettings};
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::watcher::{self, Config};
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn, Instrument};

pub mod client;
pub mod conditions;
pub mod config;
pub mod metrics;
pub mod namespace;
pub mod project;
pub mod provision;
pub mod resolver;
pub mod session;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

pub use client::{KubeResourceClient, ResourceClient};
pub use config::OperatorConfig;
pub use namespace::reconcile_namespace;
pub use project::reconcile_project_settings;
pub use session::reconcile_session;
pub use types::{Context, Error, Result};

use self::metrics::ControllerKind;

/// Requeue delay after a status write lost the optimistic-concurrency race
pub const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

/// Runs the session, project and namespace controllers until a shutdown signal
#[instrument(skip(client, context))]
pub async fn run_operator(client: Client, context: Arc<Context>) -> Result<()> {
    info!(
        namespace = %context.config.namespace,
        runner_image = %context.config.runner_image,
        "starting ambient operator controllers"
    );

    let sessions = tokio::spawn(run_session_controller(client.clone(), context.clone()));
    let projects = tokio::spawn(run_project_controller(client.clone(), context.clone()));
    let namespaces = tokio::spawn(run_namespace_controller(client, context.clone()));
    context.metrics.set_ready(true);

    match tokio::try_join!(sessions, projects, namespaces) {
        Ok(_) => info!("controllers stopped"),
        Err(e) => error!(error = ?e, "controller task join error"),
    }

    context.metrics.set_ready(false);
    Ok(())
}

async fn run_session_controller(client: Client, context: Arc<Context>) {
    info!("starting AgenticSession controller");

    let sessions_api: Api<AgenticSession> = Api::all(client.clone());
    let jobs_api: Api<Job> = Api::all(client.clone());
    let projects_api: Api<ProjectSettings> = Api::all(client);
    let watcher_config = Config::default().any_semantic();

    let controller = Controller::new(sessions_api, watcher_config.clone());
    let store = controller.store();

    controller
        .owns(
            jobs_api,
            watcher_config.clone().labels(types::SESSION_LABEL_KEY),
        )
        .watches(projects_api, watcher_config, move |settings| {
            let sessions = store.state();
            project::sessions_affected_by(&settings, sessions.iter().map(|session| &**session))
        })
        .shutdown_on_signal()
        .run(reconcile_session, error_policy_session, context.clone())
        .for_each(move |result| {
            if let Err(e) = &result {
                forget_missing_object(&context, e);
            }
            let span = tracing::info_span!("session_reconciliation_result");
            async move {
                match result {
                    Ok((session, _)) => {
                        info!(resource = %session, "AgenticSession reconciliation successful");
                    }
                    Err(e) => warn!(error = %e, "AgenticSession reconciliation error"),
                }
            }
            .instrument(span)
        })
        .await;

    info!("AgenticSession controller shutting down");
}

async fn run_project_controller(client: Client, context: Arc<Context>) {
    info!("starting ProjectSettings controller");

    let projects_api: Api<ProjectSettings> = Api::all(client);

    Controller::new(projects_api, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile_project_settings, error_policy_project, context.clone())
        .for_each(move |result| {
            if let Err(e) = &result {
                forget_missing_object(&context, e);
            }
            let span = tracing::info_span!("project_reconciliation_result");
            async move {
                if let Err(e) = result {
                    warn!(error = %e, "ProjectSettings reconciliation error");
                }
            }
            .instrument(span)
        })
        .await;

    info!("ProjectSettings controller shutting down");
}

async fn run_namespace_controller(client: Client, context: Arc<Context>) {
    info!("starting Namespace controller");

    let namespaces_api: Api<Namespace> = Api::all(client);
    let watcher_config = Config::default()
        .any_semantic()
        .labels(&namespace::managed_namespace_selector());

    Controller::new(namespaces_api, watcher_config)
        .shutdown_on_signal()
        .run(reconcile_namespace, error_policy_namespace, context.clone())
        .for_each(move |result| {
            if let Err(e) = &result {
                forget_missing_object(&context, e);
            }
            let span = tracing::info_span!("namespace_reconciliation_result");
            async move {
                match result {
                    Ok((namespace, _)) => {
                        info!(resource = %namespace, "Namespace reconciliation successful");
                    }
                    Err(e) => warn!(error = %e, "Namespace reconciliation error"),
                }
            }
            .instrument(span)
        })
        .await;

    info!("Namespace controller shutting down");
}

/// Backoff key of an object: `namespace/name`, or just `name` when cluster scoped
pub fn object_key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(namespace) => format!("{namespace}/{name}"),
        None => name.to_string(),
    }
}

/// Drops the failure count of an object deleted while it was still backing off
///
/// Requeues for a deleted object surface here as `ObjectNotFound` and never
/// reach the reconciler, so nothing else would reset its entry.
fn forget_missing_object(ctx: &Context, err: &controller::Error<Error, watcher::Error>) {
    if let controller::Error::ObjectNotFound(obj_ref) = err {
        ctx.backoff
            .reset(&object_key(obj_ref.namespace.as_deref(), &obj_ref.name));
    }
}

/// Shared requeue decision: conflicts retry quickly, everything else backs off per object
pub fn requeue_after_error(ctx: &Context, kind: ControllerKind, key: &str, err: &Error) -> Action {
    ctx.metrics.record_error(kind);

    if err.is_conflict() {
        warn!(object = %key, error = %err, "write conflict, requeueing");
        return Action::requeue(CONFLICT_REQUEUE);
    }

    let delay = ctx.backoff.next_delay(key);
    error!(object = %key, error = ?err, retry_in = ?delay, "reconciliation failed");
    Action::requeue(delay)
}

fn error_policy_session(session: Arc<AgenticSession>, err: &Error, ctx: Arc<Context>) -> Action {
    let key = object_key(session.namespace().as_deref(), &session.name_any());
    requeue_after_error(&ctx, ControllerKind::Session, &key, err)
}

fn error_policy_project(settings: Arc<ProjectSettings>, err: &Error, ctx: Arc<Context>) -> Action {
    requeue_after_error(&ctx, ControllerKind::Project, &project::project_key(&settings), err)
}

fn error_policy_namespace(namespace: Arc<Namespace>, err: &Error, ctx: Arc<Context>) -> Action {
    requeue_after_error(&ctx, ControllerKind::Namespace, &namespace.name_any(), err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::test_utils::FakeResourceClient;
    use kube::runtime::reflector::ObjectRef;

    fn context() -> Context {
        Context::new(
            Arc::new(FakeResourceClient::default()),
            Arc::new(OperatorConfig::default()),
        )
    }

    #[test]
    fn failures_back_off_exponentially_until_success() {
        let ctx = context();
        let err = Error::ConfigError("boom".to_string());

        let first = requeue_after_error(&ctx, ControllerKind::Session, "team-a/s1", &err);
        let second = requeue_after_error(&ctx, ControllerKind::Session, "team-a/s1", &err);
        assert_eq!(first, Action::requeue(Duration::from_secs(5)));
        assert_eq!(second, Action::requeue(Duration::from_secs(10)));

        ctx.backoff.reset("team-a/s1");
        let after_reset = requeue_after_error(&ctx, ControllerKind::Session, "team-a/s1", &err);
        assert_eq!(after_reset, Action::requeue(Duration::from_secs(5)));
        assert_eq!(ctx.metrics.snapshot().sessions.errors, 3);
    }

    #[test]
    fn deleted_objects_drop_their_backoff() {
        let ctx = context();
        let err = Error::ConfigError("boom".to_string());
        requeue_after_error(&ctx, ControllerKind::Session, "team-a/s1", &err);
        requeue_after_error(&ctx, ControllerKind::Session, "team-a/s1", &err);
        requeue_after_error(&ctx, ControllerKind::Namespace, "team-b", &err);

        let session_gone = controller::Error::<Error, watcher::Error>::ObjectNotFound(
            ObjectRef::<AgenticSession>::new("s1").within("team-a").erase(),
        );
        let namespace_gone = controller::Error::<Error, watcher::Error>::ObjectNotFound(
            ObjectRef::<Namespace>::new("team-b").erase(),
        );
        forget_missing_object(&ctx, &session_gone);
        forget_missing_object(&ctx, &namespace_gone);

        let first_retry = Action::requeue(Duration::from_secs(5));
        assert_eq!(
            requeue_after_error(&ctx, ControllerKind::Session, "team-a/s1", &err),
            first_retry
        );
        assert_eq!(
            requeue_after_error(&ctx, ControllerKind::Namespace, "team-b", &err),
            first_retry
        );
    }

    #[test]
    fn conflict_exhaustion_requeues_quickly() {
        let ctx = context();
        let err = Error::Conflict {
            kind: "AgenticSession",
            namespace: "team-a".to_string(),
            name: "s1".to_string(),
            attempts: 5,
        };
        let action = requeue_after_error(&ctx, ControllerKind::Session, "team-a/s1", &err);
        assert_eq!(action, Action::requeue(CONFLICT_REQUEUE));
    }
}
