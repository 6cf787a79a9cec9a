//! `AgenticSession` Custom Resource Definition

use super::template::WorkspacePodTemplate;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Location of a Git repository (URL plus optional branch)
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
pub struct RepoLocation {
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

/// Repository attached to a session
///
/// Either the flat `{url, branch}` form or the split `{input, output}` form is
/// accepted; `input` takes precedence when both are present.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
pub struct SessionRepo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<RepoLocation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<RepoLocation>,
}

impl SessionRepo {
    /// Where the agent clones from
    pub fn input_location(&self) -> Option<RepoLocation> {
        if let Some(input) = &self.input {
            return Some(input.clone());
        }
        self.url.as_ref().map(|url| RepoLocation {
            url: url.clone(),
            branch: self.branch.clone(),
        })
    }
}

/// Per-session resource overrides
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceOverrides {
    /// CPU request/limit for the agent container (e.g. "2")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Memory request/limit for the agent container (e.g. "4Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,

    /// Storage class for the session PVC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    /// Priority class for the session pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class: Option<String>,
}

/// Model settings forwarded to the runner
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LlmSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Pointer to an external workflow definition loaded into the session
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSelection {
    pub git_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// `AgenticSession` CRD: one agent run request
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "vteam.ambient-code", version = "v1alpha1", kind = "AgenticSession")]
#[kube(namespaced)]
#[kube(status = "AgenticSessionStatus")]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Interactive","type":"boolean","jsonPath":".spec.interactive"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct AgenticSessionSpec {
    /// Initial prompt for the agent
    pub prompt: String,

    /// Keep the session open for follow-up input
    #[serde(default)]
    pub interactive: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Repositories, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repos: Vec<SessionRepo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_overrides: Option<ResourceOverrides>,

    /// Environment variables for the agent container
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment_variables: BTreeMap<String, String>,

    /// Workspace image override (highest precedence)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_image: Option<String>,

    /// Pod template fragment (highest precedence)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_pod_template: Option<WorkspacePodTemplate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_workflow: Option<WorkflowSelection>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_settings: Option<LlmSettings>,

    /// Wall-clock limit in seconds for the workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
}

impl AgenticSessionSpec {
    /// Checks the fields the operator relies on; the error is shown to the user
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.prompt.trim().is_empty() {
            return Err("spec.prompt must not be empty".to_string());
        }

        for (index, repo) in self.repos.iter().enumerate() {
            match repo.input_location() {
                Some(location) if !location.url.trim().is_empty() => {}
                _ => return Err(format!("spec.repos[{index}] has no url")),
            }
        }

        for key in self.environment_variables.keys() {
            if !is_valid_env_name(key) {
                return Err(format!(
                    "spec.environmentVariables key '{key}' is not a valid variable name"
                ));
            }
        }

        if let Some(timeout) = self.timeout {
            if timeout <= 0 {
                return Err("spec.timeout must be positive".to_string());
            }
        }

        Ok(())
    }
}

fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '-' || c == '.' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

/// Coarse lifecycle label, always derived from the condition set
#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum SessionPhase {
    Pending,
    Creating,
    Running,
    Completed,
    Failed,
    Stopped,
    /// Any value written by another component that this operator does not know
    #[serde(other)]
    Unknown,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Pending => "Pending",
            SessionPhase::Creating => "Creating",
            SessionPhase::Running => "Running",
            SessionPhase::Completed => "Completed",
            SessionPhase::Failed => "Failed",
            SessionPhase::Stopped => "Stopped",
            SessionPhase::Unknown => "Unknown",
        }
    }

    /// Terminal phases are never acted on again without an explicit restart
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionPhase::Completed | SessionPhase::Failed)
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status value of a condition
#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    #[serde(other)]
    Unknown,
}

impl ConditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        }
    }
}

/// Condition for the `AgenticSession`
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionCondition {
    /// Type of condition (unique within the list)
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Status of the condition (True, False, or Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the last transition
    #[serde(default)]
    pub reason: String,

    /// Human-readable message about the condition
    #[serde(default)]
    pub message: String,

    /// Last time `status` changed value (RFC3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

/// Status of the `AgenticSession`
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgenticSessionStatus {
    /// Derived from `conditions`; never written independently
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<SessionPhase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<SessionCondition>,

    /// Name of the Job backing this session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<String>,
}
