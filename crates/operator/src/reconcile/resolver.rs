//! Cascading configuration resolver
//!
//! Layers, lowest to highest precedence: platform defaults, `ProjectSettings`,
//! the session itself, then the session's `resourceOverrides`. Scalars are
//! overwritten by the highest layer that sets them; pod template fragments are
//! merged strategically (containers by name, volumes and env by name, mounts by
//! mount path, resource quantities by resource name).

use super::config::OperatorConfig;
use super::session::naming::AGENT_CONTAINER;
use super::session::naming::WORKSPACE_CONTAINER;
use super::types::DEFAULT_RUNNER_SECRETS_NAME;
use crate::crds::{
    AgenticSessionSpec, ContainerTemplate, ProjectSettingsSpec, RepoLocation, ResourceOverrides,
    WorkspacePodTemplate,
};
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;

/// Repository as handed to the agent, with inherited defaults filled in
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedRepo {
    pub input: RepoLocation,
    pub output: Option<RepoLocation>,
}

/// Everything the workload builder needs, already merged
#[derive(Clone, Debug, PartialEq)]
pub struct EffectiveSessionConfig {
    pub workspace_image: String,
    pub pod_template: WorkspacePodTemplate,
    pub runner_secrets_name: String,
    pub storage_class_name: Option<String>,
    pub active_deadline_seconds: i64,
    pub image_pull_secrets: Vec<String>,
    pub repos: Vec<ResolvedRepo>,
}

/// One precedence layer: an optional image plus an optional template fragment
struct Layer<'a> {
    workspace_image: Option<&'a str>,
    template: Option<&'a WorkspacePodTemplate>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

pub fn resolve_session_config(
    config: &OperatorConfig,
    project: Option<&ProjectSettingsSpec>,
    session: &AgenticSessionSpec,
) -> EffectiveSessionConfig {
    let layers = [
        Layer {
            workspace_image: Some(config.default_workspace_image.as_str()),
            template: config.platform.workspace_pod_template.as_ref(),
        },
        Layer {
            workspace_image: project.and_then(|p| non_empty(&p.workspace_image)),
            template: project.and_then(|p| p.workspace_pod_template.as_ref()),
        },
        Layer {
            workspace_image: non_empty(&session.workspace_image),
            template: session.workspace_pod_template.as_ref(),
        },
    ];

    let mut pod_template = WorkspacePodTemplate::default();
    let mut workspace_image = String::new();
    for layer in &layers {
        if let Some(template) = layer.template {
            if let Some(image) = template
                .container(WORKSPACE_CONTAINER)
                .and_then(|c| non_empty(&c.image))
            {
                workspace_image = image.to_string();
            }
            merge_template(&mut pod_template, template);
        }
        // Within one layer the explicit image field beats the template's
        if let Some(image) = layer.workspace_image {
            workspace_image = image.to_string();
        }
    }

    if let Some(overrides) = &session.resource_overrides {
        merge_template(&mut pod_template, &overrides_template(overrides));
    }

    // Keep the merged fragment consistent with the resolved image
    if let Some(workspace) = pod_template
        .containers
        .iter_mut()
        .find(|c| c.name == WORKSPACE_CONTAINER)
    {
        workspace.image = Some(workspace_image.clone());
    }

    let runner_secrets_name = project
        .and_then(|p| non_empty(&p.runner_secrets_name))
        .unwrap_or(DEFAULT_RUNNER_SECRETS_NAME)
        .to_string();

    let storage_class_name = session
        .resource_overrides
        .as_ref()
        .and_then(|o| non_empty(&o.storage_class))
        .map(str::to_string)
        .or_else(|| config.storage.storage_class_name.clone());

    EffectiveSessionConfig {
        workspace_image,
        pod_template,
        runner_secrets_name,
        storage_class_name,
        active_deadline_seconds: session.timeout.unwrap_or(config.session_timeout_seconds),
        image_pull_secrets: config.platform.image_pull_secrets.clone(),
        repos: resolve_repos(project, session),
    }
}

/// Session repos with branches inherited from the project catalog
pub fn resolve_repos(project: Option<&ProjectSettingsSpec>, session: &AgenticSessionSpec) -> Vec<ResolvedRepo> {
    session
        .repos
        .iter()
        .filter_map(|repo| {
            let mut input = repo.input_location()?;
            if non_empty(&input.branch).is_none() {
                input.branch = project
                    .and_then(|p| p.find_repo(&input.url))
                    .and_then(|entry| entry.default_branch.clone());
            }
            Some(ResolvedRepo {
                input,
                output: repo.output.clone(),
            })
        })
        .collect()
}

fn overrides_template(overrides: &ResourceOverrides) -> WorkspacePodTemplate {
    let mut quantities = BTreeMap::new();
    if let Some(cpu) = non_empty(&overrides.cpu) {
        quantities.insert("cpu".to_string(), Quantity(cpu.to_string()));
    }
    if let Some(memory) = non_empty(&overrides.memory) {
        quantities.insert("memory".to_string(), Quantity(memory.to_string()));
    }

    let containers = if quantities.is_empty() {
        Vec::new()
    } else {
        vec![ContainerTemplate {
            name: AGENT_CONTAINER.to_string(),
            resources: Some(ResourceRequirements {
                requests: Some(quantities.clone()),
                limits: Some(quantities),
                ..Default::default()
            }),
            ..Default::default()
        }]
    };

    WorkspacePodTemplate {
        priority_class_name: non_empty(&overrides.priority_class).map(str::to_string),
        containers,
        ..Default::default()
    }
}

/// Layers `overlay` onto `base`
pub fn merge_template(base: &mut WorkspacePodTemplate, overlay: &WorkspacePodTemplate) {
    base.labels.extend(overlay.labels.clone());
    base.annotations.extend(overlay.annotations.clone());
    base.node_selector.extend(overlay.node_selector.clone());

    if overlay.tolerations.is_some() {
        base.tolerations = overlay.tolerations.clone();
    }
    if non_empty(&overlay.priority_class_name).is_some() {
        base.priority_class_name = overlay.priority_class_name.clone();
    }
    if non_empty(&overlay.runtime_class_name).is_some() {
        base.runtime_class_name = overlay.runtime_class_name.clone();
    }

    merge_by_key(&mut base.volumes, &overlay.volumes, |v| v.name.clone());

    for container in &overlay.containers {
        match base.containers.iter_mut().find(|c| c.name == container.name) {
            Some(existing) => merge_container(existing, container),
            None => base.containers.push(container.clone()),
        }
    }
}

pub fn merge_container(base: &mut ContainerTemplate, overlay: &ContainerTemplate) {
    if non_empty(&overlay.image).is_some() {
        base.image = overlay.image.clone();
    }
    if non_empty(&overlay.image_pull_policy).is_some() {
        base.image_pull_policy = overlay.image_pull_policy.clone();
    }
    if non_empty(&overlay.working_dir).is_some() {
        base.working_dir = overlay.working_dir.clone();
    }

    merge_by_key(&mut base.env, &overlay.env, |e| e.name.clone());
    merge_by_key(&mut base.volume_mounts, &overlay.volume_mounts, |m| m.mount_path.clone());
    merge_resources(&mut base.resources, overlay.resources.as_ref());
}

pub fn merge_resources(base: &mut Option<ResourceRequirements>, overlay: Option<&ResourceRequirements>) {
    let Some(overlay) = overlay else {
        return;
    };
    let merged = base.get_or_insert_with(ResourceRequirements::default);

    for (target, source) in [
        (&mut merged.requests, &overlay.requests),
        (&mut merged.limits, &overlay.limits),
    ] {
        if let Some(source) = source {
            target
                .get_or_insert_with(BTreeMap::new)
                .extend(source.clone());
        }
    }
    if overlay.claims.is_some() {
        merged.claims = overlay.claims.clone();
    }
}

/// Replaces entries whose key matches, appends the rest in overlay order
pub fn merge_by_key<T, K, F>(base: &mut Vec<T>, overlay: &[T], key: F)
where
    T: Clone,
    K: PartialEq,
    F: Fn(&T) -> K,
{
    for item in overlay {
        let item_key = key(item);
        match base.iter_mut().find(|existing| key(existing) == item_key) {
            Some(existing) => *existing = item.clone(),
            None => base.push(item.clone()),
        }
    }
}
