//! Session workload builder
//!
//! One Job per session whose pod runs the user's workspace image next to the
//! agent container (and optionally the content-service sidecar). The agent
//! reaches the workspace through the pod exec API, so the workspace image
//! needs nothing installed.

use super::naming::{
    sanitize_label_value, ResourceNaming, AGENT_CONTAINER, CONTENT_CONTAINER, WORKSPACE_CONTAINER,
    WORKSPACE_MOUNT_PATH, WORKSPACE_VOLUME,
};
use crate::crds::{AgenticSession, ContainerTemplate};
use crate::reconcile::config::OperatorConfig;
use crate::reconcile::provision::{controller_owner, workspace_pvc};
use crate::reconcile::resolver::{merge_by_key, merge_resources, EffectiveSessionConfig};
use crate::reconcile::types::{
    Error, Result, COMPONENT_LABEL_KEY, GIT_CONFIG_MAP_NAME, MANAGED_BY_LABEL_KEY,
    MANAGED_BY_LABEL_VALUE, SESSION_LABEL_KEY,
};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, ObjectFieldSelector, PersistentVolumeClaim, PodSpec, Volume,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use serde_json::json;
use std::collections::BTreeMap;

pub const TOKEN_VOLUME: &str = "exec-token";
pub const TOKEN_MOUNT_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
pub const GIT_CONFIG_VOLUME: &str = "git-config";
pub const GIT_CONFIG_MOUNT_PATH: &str = "/etc/ambient/git";
pub const CONTENT_SERVICE_PORT: i32 = 8080;
pub const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";

/// Labels every per-session object carries; the session label also drives pod affinity
pub fn session_labels(session_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (SESSION_LABEL_KEY.to_string(), sanitize_label_value(session_name)),
        (MANAGED_BY_LABEL_KEY.to_string(), MANAGED_BY_LABEL_VALUE.to_string()),
        (COMPONENT_LABEL_KEY.to_string(), "agentic-session".to_string()),
    ])
}

pub fn session_owner(session: &AgenticSession) -> Result<OwnerReference> {
    controller_owner(session).ok_or_else(|| Error::MissingField {
        kind: "AgenticSession",
        name: session.name_any(),
        field: "metadata.uid",
    })
}

pub fn build_session_pvc(
    session: &AgenticSession,
    effective: &EffectiveSessionConfig,
    config: &OperatorConfig,
) -> Result<PersistentVolumeClaim> {
    let name = session.name_any();
    let owner = session_owner(session)?;
    workspace_pvc(
        &ResourceNaming::pvc_name(&name),
        &config.storage.workspace_size,
        effective.storage_class_name.as_deref(),
        &session_labels(&name),
        Some(&owner),
    )
}

fn plain_env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Variables the operator owns; these win over anything user supplied
fn system_env(session: &AgenticSession, effective: &EffectiveSessionConfig) -> Vec<EnvVar> {
    let spec = &session.spec;
    let mut env = vec![
        field_env("POD_NAME", "metadata.name"),
        field_env("POD_NAMESPACE", "metadata.namespace"),
        plain_env("AGENTIC_SESSION_NAME", session.name_any()),
        plain_env(
            "AGENTIC_SESSION_NAMESPACE",
            session.namespace().unwrap_or_default(),
        ),
        plain_env("PROMPT", spec.prompt.clone()),
        plain_env("INTERACTIVE", spec.interactive.to_string()),
        plain_env("WORKSPACE_CONTAINER", WORKSPACE_CONTAINER),
        plain_env("WORKSPACE_STORE_PATH", WORKSPACE_MOUNT_PATH),
        plain_env("TIMEOUT", effective.active_deadline_seconds.to_string()),
    ];

    if let Some(display_name) = spec.display_name.as_deref().filter(|d| !d.is_empty()) {
        env.push(plain_env("DISPLAY_NAME", display_name));
    }

    if let Some(llm) = &spec.llm_settings {
        if let Some(model) = &llm.model {
            env.push(plain_env("LLM_MODEL", model.clone()));
        }
        if let Some(temperature) = llm.temperature {
            env.push(plain_env("LLM_TEMPERATURE", temperature.to_string()));
        }
        if let Some(max_tokens) = llm.max_tokens {
            env.push(plain_env("LLM_MAX_TOKENS", max_tokens.to_string()));
        }
    }

    if !effective.repos.is_empty() {
        let repos: Vec<_> = effective
            .repos
            .iter()
            .map(|repo| json!({ "input": repo.input, "output": repo.output }))
            .collect();
        env.push(plain_env("REPOS_JSON", serde_json::Value::from(repos).to_string()));
    }

    if let Some(workflow) = &spec.active_workflow {
        env.push(plain_env("ACTIVE_WORKFLOW_GIT_URL", workflow.git_url.clone()));
        if let Some(branch) = &workflow.branch {
            env.push(plain_env("ACTIVE_WORKFLOW_BRANCH", branch.clone()));
        }
        if let Some(path) = &workflow.path {
            env.push(plain_env("ACTIVE_WORKFLOW_PATH", path.clone()));
        }
    }

    env
}

/// Applies a container fragment onto a rendered container
fn apply_container_template(container: &mut Container, template: &ContainerTemplate) {
    if let Some(image) = template.image.as_deref().filter(|i| !i.is_empty()) {
        container.image = Some(image.to_string());
    }
    if template.image_pull_policy.is_some() {
        container.image_pull_policy = template.image_pull_policy.clone();
    }
    if template.working_dir.is_some() {
        container.working_dir = template.working_dir.clone();
    }
    merge_by_key(
        container.env.get_or_insert_with(Vec::new),
        &template.env,
        |e| e.name.clone(),
    );
    merge_by_key(
        container.volume_mounts.get_or_insert_with(Vec::new),
        &template.volume_mounts,
        |m| m.mount_path.clone(),
    );
    merge_resources(&mut container.resources, template.resources.as_ref());
}

fn base_pod_spec(
    session_name: &str,
    effective: &EffectiveSessionConfig,
    config: &OperatorConfig,
) -> Result<PodSpec> {
    let mut containers = vec![
        json!({
            "name": WORKSPACE_CONTAINER,
            "image": effective.workspace_image,
            "imagePullPolicy": config.image_pull_policy,
            // Keep the container alive; the agent execs into it
            "command": ["sleep", "infinity"],
            "workingDir": WORKSPACE_MOUNT_PATH,
            "volumeMounts": [{"name": WORKSPACE_VOLUME, "mountPath": WORKSPACE_MOUNT_PATH}]
        }),
        json!({
            "name": AGENT_CONTAINER,
            "image": config.runner_image,
            "imagePullPolicy": config.image_pull_policy,
            "envFrom": [{"secretRef": {"name": effective.runner_secrets_name}}],
            "securityContext": {
                "allowPrivilegeEscalation": false,
                "capabilities": {"drop": ["ALL"]}
            },
            "volumeMounts": [
                {"name": WORKSPACE_VOLUME, "mountPath": WORKSPACE_MOUNT_PATH},
                {"name": TOKEN_VOLUME, "mountPath": TOKEN_MOUNT_PATH, "readOnly": true},
                {"name": GIT_CONFIG_VOLUME, "mountPath": GIT_CONFIG_MOUNT_PATH, "readOnly": true}
            ]
        }),
    ];

    if let Some(content_image) = &config.content_service_image {
        containers.push(json!({
            "name": CONTENT_CONTAINER,
            "image": content_image,
            "imagePullPolicy": config.image_pull_policy,
            "env": [
                {"name": "CONTENT_SERVICE_MODE", "value": "true"},
                {"name": "STATE_BASE_DIR", "value": WORKSPACE_MOUNT_PATH}
            ],
            "ports": [{"name": "http", "containerPort": CONTENT_SERVICE_PORT}],
            "volumeMounts": [{"name": WORKSPACE_VOLUME, "mountPath": WORKSPACE_MOUNT_PATH}]
        }));
    }

    let image_pull_secrets: Vec<_> = effective
        .image_pull_secrets
        .iter()
        .map(|name| json!({ "name": name }))
        .collect();

    let pod_spec = json!({
        "serviceAccountName": ResourceNaming::rbac_name(session_name),
        // Only the agent gets a token, through the projected volume below
        "automountServiceAccountToken": false,
        "restartPolicy": "Never",
        "shareProcessNamespace": true,
        "imagePullSecrets": image_pull_secrets,
        "affinity": {
            "podAffinity": {
                "preferredDuringSchedulingIgnoredDuringExecution": [{
                    "weight": 100,
                    "podAffinityTerm": {
                        "labelSelector": {
                            "matchLabels": {
                                SESSION_LABEL_KEY: sanitize_label_value(session_name)
                            }
                        },
                        "topologyKey": HOSTNAME_TOPOLOGY_KEY
                    }
                }]
            }
        },
        "containers": containers,
        "volumes": [
            {
                "name": WORKSPACE_VOLUME,
                "persistentVolumeClaim": {"claimName": ResourceNaming::pvc_name(session_name)}
            },
            {
                "name": TOKEN_VOLUME,
                "projected": {
                    "sources": [
                        {"serviceAccountToken": {"path": "token", "expirationSeconds": 3600}},
                        {"configMap": {"name": "kube-root-ca.crt", "items": [{"key": "ca.crt", "path": "ca.crt"}]}},
                        {"downwardAPI": {"items": [{
                            "path": "namespace",
                            "fieldRef": {"fieldPath": "metadata.namespace"}
                        }]}}
                    ]
                }
            },
            {
                "name": GIT_CONFIG_VOLUME,
                "configMap": {"name": GIT_CONFIG_MAP_NAME, "optional": true}
            }
        ]
    });

    Ok(serde_json::from_value(pod_spec)?)
}

/// Renders the session Job with the resolved configuration layered in
pub fn build_session_job(
    session: &AgenticSession,
    effective: &EffectiveSessionConfig,
    config: &OperatorConfig,
) -> Result<Job> {
    let name = session.name_any();
    let owner = session_owner(session)?;
    let template = &effective.pod_template;
    let mut pod_spec = base_pod_spec(&name, effective, config)?;

    for container in pod_spec.containers.iter_mut() {
        if let Some(fragment) = template.container(&container.name) {
            apply_container_template(container, fragment);
        }
        if container.name == AGENT_CONTAINER {
            let env = container.env.get_or_insert_with(Vec::new);
            let user_env: Vec<EnvVar> = session
                .spec
                .environment_variables
                .iter()
                .map(|(k, v)| plain_env(k, v.clone()))
                .collect();
            merge_by_key(env, &user_env, |e| e.name.clone());
            merge_by_key(env, &system_env(session, effective), |e| e.name.clone());
        }
        if container.name == WORKSPACE_CONTAINER {
            container.image = Some(effective.workspace_image.clone());
        }
    }

    // Fragments for containers the operator does not render become extra sidecars
    let known: Vec<String> = pod_spec.containers.iter().map(|c| c.name.clone()).collect();
    for fragment in &template.containers {
        if known.contains(&fragment.name) || fragment.image.as_deref().unwrap_or("").is_empty() {
            continue;
        }
        let mut extra = Container {
            name: fragment.name.clone(),
            ..Default::default()
        };
        apply_container_template(&mut extra, fragment);
        pod_spec.containers.push(extra);
    }

    let system_volumes = pod_spec.volumes.take().unwrap_or_default();
    let mut volumes: Vec<Volume> = template.volumes.clone();
    merge_by_key(&mut volumes, &system_volumes, |v| v.name.clone());
    pod_spec.volumes = Some(volumes);

    if !template.node_selector.is_empty() {
        pod_spec.node_selector = Some(template.node_selector.clone());
    }
    if template.tolerations.is_some() {
        pod_spec.tolerations = template.tolerations.clone();
    }
    if template.priority_class_name.is_some() {
        pod_spec.priority_class_name = template.priority_class_name.clone();
    }
    if template.runtime_class_name.is_some() {
        pod_spec.runtime_class_name = template.runtime_class_name.clone();
    }

    let mut pod_labels = template.labels.clone();
    pod_labels.extend(session_labels(&name));

    let job = json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": ResourceNaming::job_name(&name),
            "labels": session_labels(&name),
            "ownerReferences": [owner]
        },
        "spec": {
            "backoffLimit": 0,
            "activeDeadlineSeconds": effective.active_deadline_seconds,
            "template": {
                "metadata": {
                    "labels": pod_labels,
                    "annotations": template.annotations
                },
                "spec": pod_spec
            }
        }
    });

    Ok(serde_json::from_value(job)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{LlmSettings, ProjectSettingsSpec};
    use crate::reconcile::resolver::resolve_session_config;
    use crate::reconcile::test_utils::session;

    fn render(session: &AgenticSession, project: Option<&ProjectSettingsSpec>) -> Job {
        let config = OperatorConfig::default();
        let effective = resolve_session_config(&config, project, &session.spec);
        build_session_job(session, &effective, &config).unwrap()
    }

    fn pod_spec(job: &Job) -> &PodSpec {
        job.spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap()
    }

    fn container<'a>(spec: &'a PodSpec, name: &str) -> &'a Container {
        spec.containers.iter().find(|c| c.name == name).unwrap()
    }

    fn env_value<'a>(container: &'a Container, name: &str) -> Option<&'a str> {
        container
            .env
            .as_ref()?
            .iter()
            .find(|e| e.name == name)?
            .value
            .as_deref()
    }

    #[test]
    fn renders_workspace_and_agent_split() {
        let job = render(&session("team-a", "s1"), None);
        let spec = pod_spec(&job);

        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.automount_service_account_token, Some(false));
        assert_eq!(spec.share_process_namespace, Some(true));
        assert_eq!(spec.service_account_name.as_deref(), Some("ambient-session-s1"));
        assert_eq!(job.spec.as_ref().unwrap().backoff_limit, Some(0));

        let workspace = container(spec, WORKSPACE_CONTAINER);
        assert_eq!(
            workspace.command.as_deref(),
            Some(&["sleep".to_string(), "infinity".to_string()][..])
        );
        assert_eq!(
            workspace.image.as_deref(),
            Some(OperatorConfig::default().default_workspace_image.as_str())
        );

        let agent = container(spec, AGENT_CONTAINER);
        assert_eq!(env_value(agent, "PROMPT"), Some("refactor the parser"));
        assert_eq!(env_value(agent, "WORKSPACE_CONTAINER"), Some(WORKSPACE_CONTAINER));
        let pod_name = agent
            .env
            .as_ref()
            .unwrap()
            .iter()
            .find(|e| e.name == "POD_NAME")
            .unwrap();
        assert_eq!(
            pod_name.value_from.as_ref().unwrap().field_ref.as_ref().unwrap().field_path,
            "metadata.name"
        );
        assert!(container(spec, CONTENT_CONTAINER).image.is_some());
    }

    #[test]
    fn only_agent_mounts_the_exec_token() {
        let job = render(&session("team-a", "s1"), None);
        let spec = pod_spec(&job);

        for c in &spec.containers {
            let mounts_token = c
                .volume_mounts
                .as_ref()
                .is_some_and(|m| m.iter().any(|m| m.name == TOKEN_VOLUME));
            assert_eq!(mounts_token, c.name == AGENT_CONTAINER, "container {}", c.name);
        }
    }

    #[test]
    fn prefers_colocation_with_session_label() {
        let job = render(&session("team-a", "s1"), None);
        let spec = pod_spec(&job);

        let terms = spec
            .affinity
            .as_ref()
            .unwrap()
            .pod_affinity
            .as_ref()
            .unwrap()
            .preferred_during_scheduling_ignored_during_execution
            .as_ref()
            .unwrap();
        assert_eq!(terms.len(), 1);
        assert_eq!(terms[0].weight, 100);
        assert_eq!(terms[0].pod_affinity_term.topology_key, HOSTNAME_TOPOLOGY_KEY);
        let selector = terms[0]
            .pod_affinity_term
            .label_selector
            .as_ref()
            .unwrap()
            .match_labels
            .as_ref()
            .unwrap();
        assert_eq!(selector[SESSION_LABEL_KEY], "s1");

        let pod_labels = job.spec.as_ref().unwrap().template.metadata.as_ref().unwrap().labels.as_ref().unwrap();
        assert_eq!(pod_labels[SESSION_LABEL_KEY], "s1");
    }

    #[test]
    fn job_and_pvc_are_owned_by_session() {
        let session = session("team-a", "s1");
        let config = OperatorConfig::default();
        let effective = resolve_session_config(&config, None, &session.spec);

        let job = build_session_job(&session, &effective, &config).unwrap();
        let pvc = build_session_pvc(&session, &effective, &config).unwrap();

        for owners in [job.metadata.owner_references, pvc.metadata.owner_references] {
            let owners = owners.unwrap();
            assert_eq!(owners[0].kind, "AgenticSession");
            assert_eq!(owners[0].uid, "uid-team-a-s1");
            assert_eq!(owners[0].controller, Some(true));
        }
        assert_eq!(pvc.metadata.name.as_deref(), Some("ambient-workspace-s1"));
    }

    #[test]
    fn session_without_uid_cannot_own_children() {
        let mut session = session("team-a", "s1");
        session.metadata.uid = None;
        let config = OperatorConfig::default();
        let effective = resolve_session_config(&config, None, &session.spec);
        assert!(matches!(
            build_session_job(&session, &effective, &config),
            Err(Error::MissingField { .. })
        ));
    }

    #[test]
    fn system_env_cannot_be_overridden_by_user() {
        let mut session = session("team-a", "s1");
        session
            .spec
            .environment_variables
            .insert("PROMPT".to_string(), "ignore me".to_string());
        session
            .spec
            .environment_variables
            .insert("FEATURE_FLAG".to_string(), "on".to_string());
        session.spec.llm_settings = Some(LlmSettings {
            model: Some("claude-sonnet".to_string()),
            temperature: Some(0.5),
            max_tokens: Some(4000),
        });

        let job = render(&session, None);
        let agent = container(pod_spec(&job), AGENT_CONTAINER);
        assert_eq!(env_value(agent, "PROMPT"), Some("refactor the parser"));
        assert_eq!(env_value(agent, "FEATURE_FLAG"), Some("on"));
        assert_eq!(env_value(agent, "LLM_MODEL"), Some("claude-sonnet"));
        assert_eq!(env_value(agent, "LLM_MAX_TOKENS"), Some("4000"));
    }

    #[test]
    fn project_template_and_overrides_reach_the_pod() {
        let mut session = session("team-a", "s1");
        session.spec.timeout = Some(900);
        session.spec.resource_overrides = Some(crate::crds::ResourceOverrides {
            cpu: Some("2".to_string()),
            priority_class: Some("high".to_string()),
            ..Default::default()
        });
        let project = ProjectSettingsSpec {
            workspace_image: Some("python:3.12".to_string()),
            runner_secrets_name: Some("team-secrets".to_string()),
            workspace_pod_template: Some(
                serde_json::from_value(json!({
                    "nodeSelector": {"pool": "sessions"},
                    "labels": {"team": "a", SESSION_LABEL_KEY: "spoofed"},
                    "volumes": [{"name": "workspace", "emptyDir": {}}, {"name": "cache", "emptyDir": {}}],
                    "containers": [
                        {"name": "workspace", "volumeMounts": [{"name": "cache", "mountPath": "/cache"}]},
                        {"name": "proxy", "image": "envoy:latest"}
                    ]
                }))
                .unwrap(),
            ),
            ..Default::default()
        };

        let job = render(&session, Some(&project));
        let job_spec = job.spec.as_ref().unwrap();
        assert_eq!(job_spec.active_deadline_seconds, Some(900));
        let spec = pod_spec(&job);

        assert_eq!(spec.priority_class_name.as_deref(), Some("high"));
        assert_eq!(spec.node_selector.as_ref().unwrap()["pool"], "sessions");
        let workspace = container(spec, WORKSPACE_CONTAINER);
        assert_eq!(workspace.image.as_deref(), Some("python:3.12"));
        assert_eq!(workspace.volume_mounts.as_ref().unwrap().len(), 2);
        assert!(container(spec, "proxy").image.is_some());

        let agent = container(spec, AGENT_CONTAINER);
        let env_from = serde_json::to_value(agent.env_from.as_ref().unwrap()).unwrap();
        assert_eq!(env_from[0]["secretRef"]["name"], "team-secrets");
        let cpu = &agent.resources.as_ref().unwrap().limits.as_ref().unwrap()["cpu"];
        assert_eq!(cpu.0, "2");

        // System volumes and labels win over template entries with the same key
        let volumes = spec.volumes.as_ref().unwrap();
        let workspace_volume = volumes.iter().find(|v| v.name == WORKSPACE_VOLUME).unwrap();
        assert!(workspace_volume.persistent_volume_claim.is_some());
        assert!(volumes.iter().any(|v| v.name == "cache"));
        let labels = job_spec.template.metadata.as_ref().unwrap().labels.as_ref().unwrap();
        assert_eq!(labels[SESSION_LABEL_KEY], "s1");
        assert_eq!(labels["team"], "a");
    }

    #[test]
    fn content_sidecar_can_be_disabled() {
        let config = OperatorConfig {
            content_service_image: None,
            ..Default::default()
        };
        let session = session("team-a", "s1");
        let effective = resolve_session_config(&config, None, &session.spec);
        let job = build_session_job(&session, &effective, &config).unwrap();
        assert!(pod_spec(&job).containers.iter().all(|c| c.name != CONTENT_CONTAINER));
    }
}
