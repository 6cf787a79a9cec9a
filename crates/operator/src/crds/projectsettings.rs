//! `ProjectSettings` Custom Resource Definition (per-namespace configuration)

use super::template::WorkspacePodTemplate;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Binds an identity-provider group to a project role
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GroupAccess {
    pub group_name: String,

    /// One of `admin`, `edit`, `view`
    pub role: String,
}

/// Repository available to sessions in the project
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRepo {
    pub name: String,
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_branch: Option<String>,
}

/// `ProjectSettings` CRD; read-only to the operator
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(group = "vteam.ambient-code", version = "v1alpha1", kind = "ProjectSettings")]
#[kube(namespaced)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSettingsSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_access: Vec<GroupAccess>,

    /// Secret injected into runner pods (defaults to `ambient-runner-secrets`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_secrets_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repos: Vec<ProjectRepo>,

    /// Project-level workspace image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_image: Option<String>,

    /// Project-level pod template fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_pod_template: Option<WorkspacePodTemplate>,
}

impl ProjectSettingsSpec {
    /// Catalog entry whose URL matches, ignoring a trailing `.git` or `/`
    pub fn find_repo(&self, url: &str) -> Option<&ProjectRepo> {
        let wanted = normalize_repo_url(url);
        self.repos
            .iter()
            .find(|repo| normalize_repo_url(&repo.url) == wanted)
    }
}

fn normalize_repo_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    trimmed
        .strip_suffix(".git")
        .unwrap_or(trimmed)
        .to_lowercase()
}
