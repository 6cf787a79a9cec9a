//! Operator Configuration
//!
//! Read once at startup from the process environment, optionally extended by a
//! mounted YAML file carrying the platform-default pod template.

use crate::crds::WorkspacePodTemplate;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_RUNNER_IMAGE: &str = "quay.io/ambient_code/vteam_claude_runner:latest";
pub const DEFAULT_CONTENT_SERVICE_IMAGE: &str = "quay.io/ambient_code/vteam_backend:latest";
pub const DEFAULT_WORKSPACE_IMAGE: &str = "registry.access.redhat.com/ubi9/ubi:latest";

const VALID_PULL_POLICIES: [&str; 3] = ["Always", "IfNotPresent", "Never"];

/// Main operator configuration structure
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    /// Namespace the operator runs in; never provisioned as a tenant
    pub namespace: String,

    /// Namespace holding the secret templates copied into managed namespaces
    pub secrets_source_namespace: String,

    /// Secret names copied into every managed namespace
    pub secrets_to_copy: Vec<String>,

    /// Agent container image
    pub runner_image: String,

    /// Content-service sidecar image; `None` disables the sidecar
    pub content_service_image: Option<String>,

    pub image_pull_policy: String,

    /// Platform-level workspace image (lowest precedence)
    pub default_workspace_image: String,

    pub storage: StorageConfig,

    /// Job deadline used when the session sets no timeout
    pub session_timeout_seconds: i64,

    /// Platform-level defaults loaded from `OPERATOR_CONFIG_PATH`
    pub platform: PlatformDefaults,
}

/// Storage configuration for workspace volumes
#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    pub workspace_size: String,
    pub storage_class_name: Option<String>,
}

/// Contents of the optional mounted configuration file
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformDefaults {
    /// Platform-default pod template fragment
    #[serde(default)]
    pub workspace_pod_template: Option<WorkspacePodTemplate>,

    /// Image pull secrets for private registries
    #[serde(default)]
    pub image_pull_secrets: Vec<String>,
}

impl PlatformDefaults {
    /// Load platform defaults from a mounted YAML file
    pub fn from_mounted_file(config_path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let config_path = config_path.as_ref();
        let config_str = std::fs::read_to_string(config_path).map_err(|e| {
            anyhow::anyhow!("Failed to read config file {}: {e}", config_path.display())
        })?;

        serde_yaml::from_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))
    }
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            secrets_source_namespace: "default".to_string(),
            secrets_to_copy: vec!["ambient-runner-secrets".to_string()],
            runner_image: DEFAULT_RUNNER_IMAGE.to_string(),
            content_service_image: Some(DEFAULT_CONTENT_SERVICE_IMAGE.to_string()),
            image_pull_policy: "Always".to_string(),
            default_workspace_image: DEFAULT_WORKSPACE_IMAGE.to_string(),
            storage: StorageConfig {
                workspace_size: "5Gi".to_string(),
                storage_class_name: None,
            },
            session_timeout_seconds: 7200,
            platform: PlatformDefaults::default(),
        }
    }
}

impl OperatorConfig {
    /// Build configuration from the process environment
    pub fn from_env() -> Result<Self, anyhow::Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, anyhow::Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string());
        let non_empty = |key: &str| get(key).filter(|v| !v.is_empty());

        let namespace = non_empty("NAMESPACE").unwrap_or(defaults.namespace);
        let secrets_source_namespace =
            non_empty("SECRETS_SOURCE_NAMESPACE").unwrap_or_else(|| namespace.clone());

        let secrets_to_copy = match get("SECRETS_TO_COPY") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect(),
            None => defaults.secrets_to_copy,
        };

        // An explicitly empty value turns the sidecar off
        let content_service_image = match get("CONTENT_SERVICE_IMAGE") {
            Some(image) if image.is_empty() => None,
            Some(image) => Some(image),
            None => defaults.content_service_image,
        };

        let session_timeout_seconds = match non_empty("SESSION_TIMEOUT_SECONDS") {
            Some(raw) => raw.parse::<i64>().map_err(|e| {
                anyhow::anyhow!("SESSION_TIMEOUT_SECONDS must be an integer, got '{raw}': {e}")
            })?,
            None => defaults.session_timeout_seconds,
        };

        let platform = match non_empty("OPERATOR_CONFIG_PATH") {
            Some(path) => PlatformDefaults::from_mounted_file(path)?,
            None => PlatformDefaults::default(),
        };

        Ok(Self {
            namespace,
            secrets_source_namespace,
            secrets_to_copy,
            runner_image: non_empty("AMBIENT_CODE_RUNNER_IMAGE").unwrap_or(defaults.runner_image),
            content_service_image,
            image_pull_policy: non_empty("IMAGE_PULL_POLICY")
                .unwrap_or(defaults.image_pull_policy),
            default_workspace_image: non_empty("DEFAULT_WORKSPACE_IMAGE")
                .unwrap_or(defaults.default_workspace_image),
            storage: StorageConfig {
                workspace_size: non_empty("WORKSPACE_STORAGE_SIZE")
                    .unwrap_or(defaults.storage.workspace_size),
                storage_class_name: non_empty("STORAGE_CLASS_NAME"),
            },
            session_timeout_seconds,
            platform,
        })
    }

    /// Validate that configuration has required fields
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.runner_image.trim().is_empty() {
            return Err(anyhow::anyhow!("AMBIENT_CODE_RUNNER_IMAGE must not be empty"));
        }
        if self.default_workspace_image.trim().is_empty() {
            return Err(anyhow::anyhow!("DEFAULT_WORKSPACE_IMAGE must not be empty"));
        }
        if !VALID_PULL_POLICIES.contains(&self.image_pull_policy.as_str()) {
            return Err(anyhow::anyhow!(
                "IMAGE_PULL_POLICY must be one of {}, got '{}'",
                VALID_PULL_POLICIES.join(", "),
                self.image_pull_policy
            ));
        }
        if self.session_timeout_seconds <= 0 {
            return Err(anyhow::anyhow!(
                "SESSION_TIMEOUT_SECONDS must be positive, got {}",
                self.session_timeout_seconds
            ));
        }
        if self.storage.workspace_size.trim().is_empty() {
            return Err(anyhow::anyhow!("WORKSPACE_STORAGE_SIZE must not be empty"));
        }
        Ok(())
    }

    /// Secrets are never copied into these namespaces
    pub fn is_protected_namespace(&self, namespace: &str) -> bool {
        namespace == self.namespace || namespace == self.secrets_source_namespace
    }
}
