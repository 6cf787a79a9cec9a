//! Resource client abstraction
//!
//! Every Kubernetes call the reconcilers make goes through [`ResourceClient`].
//! The live implementation maps "not found" to `None` and "already exists" to
//! [`CreateOutcome::AlreadyExists`]; all other failures carry the identity of
//! the object involved.

use super::types::{is_not_found, Error, Result, PROJECT_SETTINGS_NAME};
use crate::crds::{AgenticSession, ProjectSettings};
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

/// Objects the operator creates on behalf of sessions and namespaces
#[derive(Clone, Debug, PartialEq)]
pub enum ManagedObject {
    ServiceAccount(ServiceAccount),
    Role(Role),
    RoleBinding(RoleBinding),
    PersistentVolumeClaim(PersistentVolumeClaim),
    Job(Job),
    Secret(Secret),
    ConfigMap(ConfigMap),
}

impl ManagedObject {
    pub fn kind(&self) -> &'static str {
        match self {
            ManagedObject::ServiceAccount(_) => "ServiceAccount",
            ManagedObject::Role(_) => "Role",
            ManagedObject::RoleBinding(_) => "RoleBinding",
            ManagedObject::PersistentVolumeClaim(_) => "PersistentVolumeClaim",
            ManagedObject::Job(_) => "Job",
            ManagedObject::Secret(_) => "Secret",
            ManagedObject::ConfigMap(_) => "ConfigMap",
        }
    }

    pub fn name(&self) -> String {
        match self {
            ManagedObject::ServiceAccount(o) => o.name_any(),
            ManagedObject::Role(o) => o.name_any(),
            ManagedObject::RoleBinding(o) => o.name_any(),
            ManagedObject::PersistentVolumeClaim(o) => o.name_any(),
            ManagedObject::Job(o) => o.name_any(),
            ManagedObject::Secret(o) => o.name_any(),
            ManagedObject::ConfigMap(o) => o.name_any(),
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            ManagedObject::ServiceAccount(o) => &o.metadata,
            ManagedObject::Role(o) => &o.metadata,
            ManagedObject::RoleBinding(o) => &o.metadata,
            ManagedObject::PersistentVolumeClaim(o) => &o.metadata,
            ManagedObject::Job(o) => &o.metadata,
            ManagedObject::Secret(o) => &o.metadata,
            ManagedObject::ConfigMap(o) => &o.metadata,
        }
    }
}

/// Result of an idempotent create
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

#[async_trait]
pub trait ResourceClient: Send + Sync {
    async fn get_session(&self, namespace: &str, name: &str) -> Result<Option<AgenticSession>>;

    /// Writes the status sub-resource; fails with a conflict when the
    /// session's `resourceVersion` is stale
    async fn replace_session_status(&self, session: &AgenticSession) -> Result<AgenticSession>;

    /// Writes spec and metadata; same concurrency rules as the status write
    async fn replace_session(&self, session: &AgenticSession) -> Result<AgenticSession>;

    async fn get_project_settings(&self, namespace: &str) -> Result<Option<ProjectSettings>>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>>;

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>>;

    async fn create(&self, namespace: &str, object: ManagedObject) -> Result<CreateOutcome>;

    /// Deletes a Job and its pods; a missing Job is not an error
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()>;
}

/// [`ResourceClient`] backed by the cluster API
#[derive(Clone)]
pub struct KubeResourceClient {
    client: Client,
}

impl KubeResourceClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn get_opt<K>(&self, kind: &'static str, namespace: &str, name: &str) -> Result<Option<K>>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(object) => Ok(Some(object)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(Error::api("get", kind, namespace, name)(e)),
        }
    }

    async fn create_in<K>(&self, kind: &'static str, namespace: &str, object: &K) -> Result<CreateOutcome>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), object).await {
            Ok(_) => Ok(CreateOutcome::Created),
            // Creates never carry a resourceVersion, so any 409 means the name is taken
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(Error::api("create", kind, namespace, &object.name_any())(e)),
        }
    }
}

fn session_identity(session: &AgenticSession) -> (String, String) {
    (session.namespace().unwrap_or_default(), session.name_any())
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    async fn get_session(&self, namespace: &str, name: &str) -> Result<Option<AgenticSession>> {
        self.get_opt("AgenticSession", namespace, name).await
    }

    async fn replace_session_status(&self, session: &AgenticSession) -> Result<AgenticSession> {
        let (namespace, name) = session_identity(session);
        let api: Api<AgenticSession> = Api::namespaced(self.client.clone(), &namespace);
        let body = serde_json::to_vec(session)?;
        api.replace_status(&name, &PostParams::default(), body)
            .await
            .map_err(Error::api("update status of", "AgenticSession", &namespace, &name))
    }

    async fn replace_session(&self, session: &AgenticSession) -> Result<AgenticSession> {
        let (namespace, name) = session_identity(session);
        let api: Api<AgenticSession> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&name, &PostParams::default(), session)
            .await
            .map_err(Error::api("update", "AgenticSession", &namespace, &name))
    }

    async fn get_project_settings(&self, namespace: &str) -> Result<Option<ProjectSettings>> {
        self.get_opt("ProjectSettings", namespace, PROJECT_SETTINGS_NAME)
            .await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        self.get_opt("Secret", namespace, name).await
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        self.get_opt("ConfigMap", namespace, name).await
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        self.get_opt("Job", namespace, name).await
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(Error::api("list", "Pod", namespace, label_selector))?;
        Ok(pods.items)
    }

    async fn create(&self, namespace: &str, object: ManagedObject) -> Result<CreateOutcome> {
        let kind = object.kind();
        match &object {
            ManagedObject::ServiceAccount(o) => self.create_in(kind, namespace, o).await,
            ManagedObject::Role(o) => self.create_in(kind, namespace, o).await,
            ManagedObject::RoleBinding(o) => self.create_in(kind, namespace, o).await,
            ManagedObject::PersistentVolumeClaim(o) => self.create_in(kind, namespace, o).await,
            ManagedObject::Job(o) => self.create_in(kind, namespace, o).await,
            ManagedObject::Secret(o) => self.create_in(kind, namespace, o).await,
            ManagedObject::ConfigMap(o) => self.create_in(kind, namespace, o).await,
        }
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(Error::api("delete", "Job", namespace, name)(e)),
        }
    }
}
