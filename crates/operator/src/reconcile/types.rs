//! Shared types for the reconcilers: error taxonomy, context, constants

use super::client::ResourceClient;
use super::config::OperatorConfig;
use super::metrics::ControllerMetrics;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Label marking a namespace (and the objects provisioned into it) as operator-managed
pub const MANAGED_LABEL_KEY: &str = "ambient-code.io/managed";
pub const MANAGED_LABEL_VALUE: &str = "true";

/// Label carrying the owning session's name; also the pod-affinity key
pub const SESSION_LABEL_KEY: &str = "ambient-code.io/session";

pub const MANAGED_BY_LABEL_KEY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_LABEL_VALUE: &str = "ambient-operator";
pub const COMPONENT_LABEL_KEY: &str = "app.kubernetes.io/component";

pub const SECRET_TYPE_LABEL_KEY: &str = "ambient-code.io/secret-type";
pub const RUNNER_SECRETS_LABEL_VALUE: &str = "runner-secrets";
pub const CONFIG_TYPE_LABEL_KEY: &str = "ambient-code.io/config-type";
pub const GIT_CONFIG_LABEL_VALUE: &str = "git";
pub const COPIED_FROM_LABEL_KEY: &str = "ambient-code.io/copied-from";
pub const COPIED_AT_ANNOTATION_KEY: &str = "ambient-code.io/copied-at";

/// Annotation the backend sets to request a restart of a finished session
pub const DESIRED_PHASE_ANNOTATION: &str = "ambient-code.io/desired-phase";

pub const DEFAULT_RUNNER_SECRETS_NAME: &str = "ambient-runner-secrets";
pub const GIT_CONFIG_MAP_NAME: &str = "ambient-git-config";
pub const NAMESPACE_WORKSPACE_PVC_NAME: &str = "ambient-workspace";
pub const NAMESPACE_EXEC_SERVICE_ACCOUNT: &str = "ambient-workspace-exec";

/// Each namespace holds at most one `ProjectSettings`, under this name
pub const PROJECT_SETTINGS_NAME: &str = "projectsettings";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("failed to {operation} {kind} {namespace}/{name}: {source}")]
    Api {
        operation: &'static str,
        kind: &'static str,
        namespace: String,
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("gave up updating {kind} {namespace}/{name} after {attempts} conflicting writes")]
    Conflict {
        kind: &'static str,
        namespace: String,
        name: String,
        attempts: u32,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("{kind} {name} is missing {field}")]
    MissingField {
        kind: &'static str,
        name: String,
        field: &'static str,
    },

    #[error("Exec error: {0}")]
    ExecError(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Wraps a raw API error with the identity of the object it concerned
    pub fn api(
        operation: &'static str,
        kind: &'static str,
        namespace: &str,
        name: &str,
    ) -> impl FnOnce(kube::Error) -> Error {
        let namespace = namespace.to_string();
        let name = name.to_string();
        move |source| Error::Api {
            operation,
            kind,
            namespace,
            name,
            source,
        }
    }

    fn kube_source(&self) -> Option<&kube::Error> {
        match self {
            Error::KubeError(source) | Error::Api { source, .. } => Some(source),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kube_source().is_some_and(is_not_found)
    }

    /// True for optimistic-concurrency failures, raw or exhausted
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. }) || self.kube_source().is_some_and(is_conflict)
    }
}

pub fn api_error_code(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    }
}

pub fn is_not_found(err: &kube::Error) -> bool {
    api_error_code(err) == Some(404)
}

/// A 409 caused by a stale `resourceVersion`
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 409 && response.reason != "AlreadyExists")
}

/// A 409 caused by creating an object that already exists
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 409 && response.reason != "Conflict")
}

/// Per-object exponential backoff for the error policies
#[derive(Clone, Debug)]
pub struct Backoff {
    failures: Arc<DashMap<String, u32>>,
    base: Duration,
    max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(300))
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            failures: Arc::new(DashMap::new()),
            base,
            max,
        }
    }

    /// Records a failure for `key` and returns how long to wait before retrying
    pub fn next_delay(&self, key: &str) -> Duration {
        let mut failures = self.failures.entry(key.to_string()).or_insert(0);
        *failures = failures.saturating_add(1);
        let exponent = (*failures - 1).min(16);
        self.base
            .saturating_mul(1u32 << exponent)
            .min(self.max)
    }

    pub fn reset(&self, key: &str) {
        self.failures.remove(key);
    }
}

/// Shared state handed to every reconcile invocation
#[derive(Clone)]
pub struct Context {
    pub client: Arc<dyn ResourceClient>,
    pub config: Arc<OperatorConfig>,
    pub backoff: Backoff,
    pub metrics: Arc<ControllerMetrics>,
}

impl Context {
    pub fn new(client: Arc<dyn ResourceClient>, config: Arc<OperatorConfig>) -> Self {
        Self {
            client,
            config,
            backoff: Backoff::default(),
            metrics: Arc::new(ControllerMetrics::default()),
        }
    }
}
