//! In-memory [`ResourceClient`] and fixtures for reconciler tests

use super::client::{CreateOutcome, ManagedObject, ResourceClient};
use super::types::{Error, Result, PROJECT_SETTINGS_NAME};
use crate::crds::{AgenticSession, AgenticSessionSpec, ProjectSettings, ProjectSettingsSpec};
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::ErrorResponse;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Mutex;

type ObjectKey = (String, &'static str, String);

#[derive(Default)]
struct FakeState {
    sessions: BTreeMap<(String, String), AgenticSession>,
    project_settings: BTreeMap<String, ProjectSettings>,
    objects: BTreeMap<ObjectKey, ManagedObject>,
    pods: Vec<(String, Pod)>,
    created: Vec<(String, ManagedObject)>,
    deleted_jobs: Vec<(String, String)>,
    status_writes: usize,
    spec_writes: usize,
    pending_conflicts: u32,
    failing_kind: Option<&'static str>,
    next_version: u64,
}

/// Fake cluster that enforces `resourceVersion` and records every write
#[derive(Default)]
pub struct FakeResourceClient {
    state: Mutex<FakeState>,
}

fn api_error(code: u16, reason: &str, message: String) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    })
}

fn conflict(namespace: &str, name: &str) -> Error {
    Error::api("update", "AgenticSession", namespace, name)(api_error(
        409,
        "Conflict",
        "the object has been modified".to_string(),
    ))
}

fn key(namespace: &str, name: &str) -> (String, String) {
    (namespace.to_string(), name.to_string())
}

impl FakeState {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn check_write(&mut self, session: &AgenticSession) -> Result<AgenticSession> {
        let namespace = session.namespace().unwrap_or_default();
        let name = session.name_any();

        if self.pending_conflicts > 0 {
            self.pending_conflicts -= 1;
            return Err(conflict(&namespace, &name));
        }

        let stored = self
            .sessions
            .get(&key(&namespace, &name))
            .cloned()
            .ok_or_else(|| {
                Error::api("update", "AgenticSession", &namespace, &name)(api_error(
                    404,
                    "NotFound",
                    format!("agenticsessions \"{name}\" not found"),
                ))
            })?;

        if stored.metadata.resource_version != session.metadata.resource_version {
            return Err(conflict(&namespace, &name));
        }
        Ok(stored)
    }

    fn get_object(&self, namespace: &str, kind: &'static str, name: &str) -> Option<ManagedObject> {
        self.objects
            .get(&(namespace.to_string(), kind, name.to_string()))
            .cloned()
    }
}

impl FakeResourceClient {
    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn insert_session(&self, mut session: AgenticSession) {
        let mut state = self.state();
        session.metadata.resource_version = Some(state.bump());
        let namespace = session.namespace().unwrap_or_default();
        state
            .sessions
            .insert(key(&namespace, &session.name_any()), session);
    }

    pub fn remove_session(&self, namespace: &str, name: &str) {
        self.state().sessions.remove(&key(namespace, name));
    }

    pub fn insert_project_settings(&self, settings: ProjectSettings) {
        let namespace = settings.namespace().unwrap_or_default();
        self.state().project_settings.insert(namespace, settings);
    }

    /// Seeds an object without counting it as a write
    pub fn insert_object(&self, namespace: &str, object: ManagedObject) {
        self.state()
            .objects
            .insert((namespace.to_string(), object.kind(), object.name()), object);
    }

    pub fn insert_pod(&self, namespace: &str, pod: Pod) {
        self.state().pods.push((namespace.to_string(), pod));
    }

    pub fn pods_in(&self, namespace: &str) -> Vec<Pod> {
        self.state()
            .pods
            .iter()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, pod)| pod.clone())
            .collect()
    }

    /// The next `count` session writes fail with a 409 Conflict
    pub fn inject_conflicts(&self, count: u32) {
        self.state().pending_conflicts = count;
    }

    /// Every create of `kind` fails with a 500
    pub fn fail_creates_of(&self, kind: &'static str) {
        self.state().failing_kind = Some(kind);
    }

    pub fn session(&self, namespace: &str, name: &str) -> Option<AgenticSession> {
        self.state().sessions.get(&key(namespace, name)).cloned()
    }

    pub fn object(&self, namespace: &str, kind: &'static str, name: &str) -> Option<ManagedObject> {
        self.state().get_object(namespace, kind, name)
    }

    pub fn objects_of_kind(&self, namespace: &str, kind: &'static str) -> Vec<ManagedObject> {
        self.state()
            .objects
            .iter()
            .filter(|((ns, k, _), _)| ns == namespace && *k == kind)
            .map(|(_, object)| object.clone())
            .collect()
    }

    /// Objects actually created (not the ones that already existed)
    pub fn created(&self) -> Vec<(String, ManagedObject)> {
        self.state().created.clone()
    }

    pub fn deleted_jobs(&self) -> Vec<(String, String)> {
        self.state().deleted_jobs.clone()
    }

    pub fn status_writes(&self) -> usize {
        self.state().status_writes
    }

    pub fn spec_writes(&self) -> usize {
        self.state().spec_writes
    }

    pub fn total_writes(&self) -> usize {
        let state = self.state();
        state.status_writes + state.spec_writes + state.created.len() + state.deleted_jobs.len()
    }
}

fn selector_matches(selector: &str, labels: &BTreeMap<String, String>) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k.trim()).map(String::as_str) == Some(v.trim()),
            None => labels.contains_key(term.trim()),
        })
}

#[async_trait]
impl ResourceClient for FakeResourceClient {
    async fn get_session(&self, namespace: &str, name: &str) -> Result<Option<AgenticSession>> {
        Ok(self.session(namespace, name))
    }

    async fn replace_session_status(&self, session: &AgenticSession) -> Result<AgenticSession> {
        let mut state = self.state();
        let mut stored = state.check_write(session)?;
        stored.status = session.status.clone();
        stored.metadata.resource_version = Some(state.bump());
        state.status_writes += 1;
        let namespace = stored.namespace().unwrap_or_default();
        state
            .sessions
            .insert(key(&namespace, &stored.name_any()), stored.clone());
        Ok(stored)
    }

    async fn replace_session(&self, session: &AgenticSession) -> Result<AgenticSession> {
        let mut state = self.state();
        let stored = state.check_write(session)?;
        let mut updated = session.clone();
        updated.status = stored.status;
        updated.metadata.resource_version = Some(state.bump());
        state.spec_writes += 1;
        let namespace = updated.namespace().unwrap_or_default();
        state
            .sessions
            .insert(key(&namespace, &updated.name_any()), updated.clone());
        Ok(updated)
    }

    async fn get_project_settings(&self, namespace: &str) -> Result<Option<ProjectSettings>> {
        Ok(self.state().project_settings.get(namespace).cloned())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(match self.object(namespace, "Secret", name) {
            Some(ManagedObject::Secret(secret)) => Some(secret),
            _ => None,
        })
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        Ok(match self.object(namespace, "ConfigMap", name) {
            Some(ManagedObject::ConfigMap(config_map)) => Some(config_map),
            _ => None,
        })
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        Ok(match self.object(namespace, "Job", name) {
            Some(ManagedObject::Job(job)) => Some(job),
            _ => None,
        })
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        Ok(self
            .state()
            .pods
            .iter()
            .filter(|(ns, pod)| ns == namespace && selector_matches(label_selector, pod.labels()))
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn create(&self, namespace: &str, mut object: ManagedObject) -> Result<CreateOutcome> {
        let mut state = self.state();
        let kind = object.kind();
        let name = object.name();

        if state.failing_kind == Some(kind) {
            return Err(Error::api("create", kind, namespace, &name)(api_error(
                500,
                "InternalError",
                "injected failure".to_string(),
            )));
        }

        let object_key = (namespace.to_string(), kind, name);
        if state.objects.contains_key(&object_key) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        if let ManagedObject::Job(job) = &mut object {
            let version = state.bump();
            job.metadata.uid.get_or_insert_with(|| format!("uid-job-{version}"));
        }
        state.objects.insert(object_key, object.clone());
        state.created.push((namespace.to_string(), object));
        Ok(CreateOutcome::Created)
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state();
        let removed = state
            .objects
            .remove(&(namespace.to_string(), "Job", name.to_string()));
        // Background propagation: pods outlive their Job until garbage collected
        if removed.is_some() {
            state.deleted_jobs.push(key(namespace, name));
        }
        Ok(())
    }
}

/// A minimal session with a uid so owner references can be built
pub fn session(namespace: &str, name: &str) -> AgenticSession {
    let spec: AgenticSessionSpec =
        serde_json::from_value(serde_json::json!({ "prompt": "refactor the parser" })).unwrap();
    let mut session = AgenticSession::new(name, spec);
    session.metadata.namespace = Some(namespace.to_string());
    session.metadata.uid = Some(format!("uid-{namespace}-{name}"));
    session.metadata.generation = Some(1);
    session
}

pub fn project_settings(namespace: &str, spec: ProjectSettingsSpec) -> ProjectSettings {
    let mut settings = ProjectSettings::new(PROJECT_SETTINGS_NAME, spec);
    settings.metadata.namespace = Some(namespace.to_string());
    settings.metadata.uid = Some(format!("uid-{namespace}-projectsettings"));
    settings
}

pub fn secret(namespace: &str, name: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        string_data: Some(BTreeMap::from([(
            "ANTHROPIC_API_KEY".to_string(),
            "sk-test".to_string(),
        )])),
        ..Default::default()
    }
}

pub fn config_map(namespace: &str, name: &str, data: &[(&str, &str)]) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(
            data.iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        ),
        ..Default::default()
    }
}

pub fn namespace(name: &str, labels: &[(&str, &str)]) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        ..Default::default()
    }
}
