//! RBAC and namespace provisioning
//!
//! Builders for the exec RBAC triple and workspace PVCs are shared between
//! namespace provisioning (no owner) and session reconciliation (owned by the
//! `AgenticSession`). Every create is idempotent: "already exists" is success.

use super::client::{CreateOutcome, ManagedObject, ResourceClient};
use super::config::OperatorConfig;
use super::conditions::now_rfc3339;
use super::types::{
    Result, COMPONENT_LABEL_KEY, CONFIG_TYPE_LABEL_KEY, COPIED_AT_ANNOTATION_KEY,
    COPIED_FROM_LABEL_KEY, GIT_CONFIG_LABEL_VALUE, GIT_CONFIG_MAP_NAME, MANAGED_BY_LABEL_KEY,
    MANAGED_BY_LABEL_VALUE, MANAGED_LABEL_KEY, MANAGED_LABEL_VALUE, NAMESPACE_EXEC_SERVICE_ACCOUNT,
    NAMESPACE_WORKSPACE_PVC_NAME, RUNNER_SECRETS_LABEL_VALUE, SECRET_TYPE_LABEL_KEY,
};
use crate::crds::{GroupAccess, ProjectSettings};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Keys the runner refuses to start without
pub const REQUIRED_RUNNER_SECRET_KEYS: [&str; 1] = ["ANTHROPIC_API_KEY"];

/// Roles a `groupAccess` entry may name
pub const PROJECT_ROLES: [&str; 3] = ["admin", "edit", "view"];

pub fn managed_labels(component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_LABEL_KEY.to_string(), MANAGED_LABEL_VALUE.to_string()),
        (MANAGED_BY_LABEL_KEY.to_string(), MANAGED_BY_LABEL_VALUE.to_string()),
        (COMPONENT_LABEL_KEY.to_string(), component.to_string()),
    ])
}

fn metadata_json(
    name: &str,
    labels: &BTreeMap<String, String>,
    owner: Option<&OwnerReference>,
) -> serde_json::Value {
    let mut metadata = json!({ "name": name, "labels": labels });
    if let Some(owner) = owner {
        metadata["ownerReferences"] = json!([owner]);
    }
    metadata
}

/// Owner reference that makes `owner` the managing controller of a child
pub fn controller_owner<K>(owner: &K) -> Option<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    owner.controller_owner_ref(&())
}

pub fn exec_service_account(
    name: &str,
    labels: &BTreeMap<String, String>,
    owner: Option<&OwnerReference>,
) -> Result<ServiceAccount> {
    Ok(serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "ServiceAccount",
        "metadata": metadata_json(name, labels, owner),
        "automountServiceAccountToken": false
    }))?)
}

/// Grants exec into sibling containers and nothing cluster-wide
pub fn exec_role(
    name: &str,
    labels: &BTreeMap<String, String>,
    owner: Option<&OwnerReference>,
) -> Result<Role> {
    Ok(serde_json::from_value(json!({
        "apiVersion": "rbac.authorization.k8s.io/v1",
        "kind": "Role",
        "metadata": metadata_json(name, labels, owner),
        "rules": [
            {"apiGroups": [""], "resources": ["pods/exec"], "verbs": ["create"]},
            {"apiGroups": [""], "resources": ["pods"], "verbs": ["get", "list"]}
        ]
    }))?)
}

pub fn exec_role_binding(
    name: &str,
    namespace: &str,
    labels: &BTreeMap<String, String>,
    owner: Option<&OwnerReference>,
) -> Result<RoleBinding> {
    Ok(serde_json::from_value(json!({
        "apiVersion": "rbac.authorization.k8s.io/v1",
        "kind": "RoleBinding",
        "metadata": metadata_json(name, labels, owner),
        "roleRef": {
            "apiGroup": "rbac.authorization.k8s.io",
            "kind": "Role",
            "name": name
        },
        "subjects": [{
            "kind": "ServiceAccount",
            "name": name,
            "namespace": namespace
        }]
    }))?)
}

pub fn workspace_pvc(
    name: &str,
    size: &str,
    storage_class: Option<&str>,
    labels: &BTreeMap<String, String>,
    owner: Option<&OwnerReference>,
) -> Result<PersistentVolumeClaim> {
    let mut spec = json!({
        "accessModes": ["ReadWriteOnce"],
        "resources": {
            "requests": {
                "storage": size
            }
        }
    });

    if let Some(storage_class) = storage_class {
        spec["storageClassName"] = json!(storage_class);
    }

    Ok(serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": metadata_json(name, labels, owner),
        "spec": spec
    }))?)
}

/// Creates an object unless it exists; returns whether it was new
pub async fn ensure_object(
    client: &dyn ResourceClient,
    namespace: &str,
    object: ManagedObject,
) -> Result<bool> {
    let kind = object.kind();
    let name = object.name();
    match client.create(namespace, object).await? {
        CreateOutcome::Created => {
            info!(namespace = %namespace, kind, name = %name, "created");
            Ok(true)
        }
        CreateOutcome::AlreadyExists => {
            debug!(namespace = %namespace, kind, name = %name, "already exists");
            Ok(false)
        }
    }
}

/// ServiceAccount, Role and RoleBinding for in-pod exec, in that order
pub async fn ensure_exec_rbac(
    client: &dyn ResourceClient,
    namespace: &str,
    name: &str,
    labels: &BTreeMap<String, String>,
    owner: Option<&OwnerReference>,
) -> Result<()> {
    ensure_object(
        client,
        namespace,
        ManagedObject::ServiceAccount(exec_service_account(name, labels, owner)?),
    )
    .await?;
    ensure_object(client, namespace, ManagedObject::Role(exec_role(name, labels, owner)?)).await?;
    ensure_object(
        client,
        namespace,
        ManagedObject::RoleBinding(exec_role_binding(name, namespace, labels, owner)?),
    )
    .await?;
    Ok(())
}

/// What a provisioning pass created
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProvisionSummary {
    pub secrets_copied: Vec<String>,
    pub git_config_created: bool,
    pub pvc_created: bool,
}

/// Brings a managed namespace to its provisioned state
pub async fn provision_namespace(
    client: &dyn ResourceClient,
    config: &OperatorConfig,
    namespace: &str,
) -> Result<ProvisionSummary> {
    let mut summary = ProvisionSummary {
        secrets_copied: copy_secrets(client, config, namespace).await?,
        ..Default::default()
    };

    summary.git_config_created = ensure_git_config(client, config, namespace).await?;

    let pvc = workspace_pvc(
        NAMESPACE_WORKSPACE_PVC_NAME,
        &config.storage.workspace_size,
        config.storage.storage_class_name.as_deref(),
        &managed_labels("workspace"),
        None,
    )?;
    summary.pvc_created =
        ensure_object(client, namespace, ManagedObject::PersistentVolumeClaim(pvc)).await?;

    ensure_exec_rbac(
        client,
        namespace,
        NAMESPACE_EXEC_SERVICE_ACCOUNT,
        &managed_labels("workspace-exec"),
        None,
    )
    .await?;

    Ok(summary)
}

/// Copies the configured secrets from the source namespace
///
/// Missing source secrets are skipped; existing targets are left untouched.
pub async fn copy_secrets(
    client: &dyn ResourceClient,
    config: &OperatorConfig,
    namespace: &str,
) -> Result<Vec<String>> {
    if config.is_protected_namespace(namespace) {
        debug!(namespace = %namespace, "not copying secrets into operator or source namespace");
        return Ok(Vec::new());
    }

    let mut copied = Vec::new();
    for name in &config.secrets_to_copy {
        if client.get_secret(namespace, name).await?.is_some() {
            debug!(namespace = %namespace, secret = %name, "secret already present");
            continue;
        }
        let Some(source) = client
            .get_secret(&config.secrets_source_namespace, name)
            .await?
        else {
            warn!(
                source_namespace = %config.secrets_source_namespace,
                secret = %name,
                "source secret not found, skipping"
            );
            continue;
        };

        let missing = missing_runner_secret_keys(&source);
        if !missing.is_empty() {
            warn!(secret = %name, missing = ?missing, "secret lacks keys the runner expects");
        }

        let copy = copied_secret(&source, name, &config.secrets_source_namespace);
        if ensure_object(client, namespace, ManagedObject::Secret(copy)).await? {
            copied.push(name.clone());
        }
    }
    Ok(copied)
}

fn copied_secret(source: &Secret, name: &str, source_namespace: &str) -> Secret {
    let mut labels = BTreeMap::from([
        (MANAGED_LABEL_KEY.to_string(), MANAGED_LABEL_VALUE.to_string()),
        (SECRET_TYPE_LABEL_KEY.to_string(), RUNNER_SECRETS_LABEL_VALUE.to_string()),
    ]);
    labels.insert(COPIED_FROM_LABEL_KEY.to_string(), source_namespace.to_string());

    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            annotations: Some(BTreeMap::from([(
                COPIED_AT_ANNOTATION_KEY.to_string(),
                now_rfc3339(),
            )])),
            ..Default::default()
        },
        type_: source.type_.clone(),
        data: source.data.clone(),
        string_data: source.string_data.clone(),
        ..Default::default()
    }
}

/// Required runner keys absent from a secret, only checked for the runner secret
pub fn missing_runner_secret_keys(secret: &Secret) -> Vec<&'static str> {
    if secret.name_any() != super::types::DEFAULT_RUNNER_SECRETS_NAME {
        return Vec::new();
    }
    REQUIRED_RUNNER_SECRET_KEYS
        .into_iter()
        .filter(|key| {
            let in_data = secret.data.as_ref().is_some_and(|d| d.contains_key(*key));
            let in_string_data = secret
                .string_data
                .as_ref()
                .is_some_and(|d| d.contains_key(*key));
            !in_data && !in_string_data
        })
        .collect()
}

pub fn default_git_config() -> BTreeMap<String, String> {
    [
        ("user.name", "Ambient Code Runner"),
        ("user.email", "runner@ambient-code.io"),
        ("init.defaultBranch", "main"),
        ("pull.rebase", "false"),
        ("safe.directory", "*"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Creates the namespace's git config map from the source namespace's copy or the defaults
pub async fn ensure_git_config(
    client: &dyn ResourceClient,
    config: &OperatorConfig,
    namespace: &str,
) -> Result<bool> {
    if client
        .get_config_map(namespace, GIT_CONFIG_MAP_NAME)
        .await?
        .is_some()
    {
        return Ok(false);
    }

    let mut data = default_git_config();
    if namespace != config.secrets_source_namespace {
        if let Some(source) = client
            .get_config_map(&config.secrets_source_namespace, GIT_CONFIG_MAP_NAME)
            .await?
        {
            data.extend(source.data.unwrap_or_default());
        }
    }

    let mut labels = BTreeMap::from([
        (MANAGED_LABEL_KEY.to_string(), MANAGED_LABEL_VALUE.to_string()),
        (CONFIG_TYPE_LABEL_KEY.to_string(), GIT_CONFIG_LABEL_VALUE.to_string()),
    ]);
    labels.insert(MANAGED_BY_LABEL_KEY.to_string(), MANAGED_BY_LABEL_VALUE.to_string());

    let config_map = ConfigMap {
        metadata: ObjectMeta {
            name: Some(GIT_CONFIG_MAP_NAME.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    };
    ensure_object(client, namespace, ManagedObject::ConfigMap(config_map)).await
}

pub fn group_access_binding_name(entry: &GroupAccess) -> String {
    super::session::naming::ResourceNaming::group_binding_name(&entry.role, &entry.group_name)
}

/// RoleBinding for one `groupAccess` entry; `None` for unknown roles
pub fn group_access_role_binding(
    settings: &ProjectSettings,
    entry: &GroupAccess,
) -> Result<Option<RoleBinding>> {
    if !PROJECT_ROLES.contains(&entry.role.as_str()) {
        return Ok(None);
    }

    let owner = controller_owner(settings);
    let binding = serde_json::from_value(json!({
        "apiVersion": "rbac.authorization.k8s.io/v1",
        "kind": "RoleBinding",
        "metadata": metadata_json(
            &group_access_binding_name(entry),
            &managed_labels("group-access"),
            owner.as_ref(),
        ),
        "roleRef": {
            "apiGroup": "rbac.authorization.k8s.io",
            "kind": "ClusterRole",
            "name": format!("ambient-project-{}", entry.role)
        },
        "subjects": [{
            "apiGroup": "rbac.authorization.k8s.io",
            "kind": "Group",
            "name": entry.group_name
        }]
    }))?;
    Ok(Some(binding))
}

/// Ensures a RoleBinding per valid `groupAccess` entry; returns how many were created
pub async fn ensure_group_access(
    client: &dyn ResourceClient,
    settings: &ProjectSettings,
) -> Result<usize> {
    let namespace = settings.namespace().unwrap_or_default();
    let mut created = 0;
    for entry in &settings.spec.group_access {
        match group_access_role_binding(settings, entry)? {
            Some(binding) => {
                if ensure_object(client, &namespace, ManagedObject::RoleBinding(binding)).await? {
                    created += 1;
                }
            }
            None => warn!(
                namespace = %namespace,
                group = %entry.group_name,
                role = %entry.role,
                "unknown project role, skipping"
            ),
        }
    }
    Ok(created)
}
