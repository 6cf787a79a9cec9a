//! End-to-end checks over the public, cluster-free API: condition bookkeeping,
//! configuration layering and the rendered session workload.

use ambient_operator::crds::{
    AgenticSession, AgenticSessionSpec, AgenticSessionStatus, ConditionStatus, ProjectSettingsSpec,
    SessionPhase,
};
use ambient_operator::reconcile::conditions::{
    derive_phase_from_conditions, find_condition, set_condition_at, ConditionUpdate, COMPLETED,
    FAILED, JOB_CREATED, PVC_READY, RUNNER_STARTED,
};
use ambient_operator::reconcile::resolver::resolve_session_config;
use ambient_operator::reconcile::session::workload::{build_session_job, build_session_pvc};
use ambient_operator::OperatorConfig;
use serde_json::{json, Value};

fn status_from(conditions: &[(&str, ConditionStatus)]) -> AgenticSessionStatus {
    let mut status = AgenticSessionStatus::default();
    for (condition_type, value) in conditions {
        set_condition_at(
            &mut status,
            ConditionUpdate::new(*condition_type, *value, "Test", ""),
            "2025-06-01T00:00:00Z",
        );
    }
    status
}

fn session(spec: Value) -> AgenticSession {
    let spec: AgenticSessionSpec = serde_json::from_value(spec).unwrap();
    let mut session = AgenticSession::new("fix-login", spec);
    session.metadata.namespace = Some("team-a".to_string());
    session.metadata.uid = Some("0b5a7c1e-uid".to_string());
    session
}

#[test]
fn phase_scenarios() {
    use ConditionStatus::True;

    let cases = [
        (vec![(PVC_READY, True), (JOB_CREATED, True)], SessionPhase::Creating),
        (
            vec![(PVC_READY, True), (JOB_CREATED, True), (RUNNER_STARTED, True)],
            SessionPhase::Running,
        ),
        (vec![(RUNNER_STARTED, True), (FAILED, True)], SessionPhase::Failed),
        (vec![(FAILED, True), (COMPLETED, True)], SessionPhase::Failed),
    ];

    for (conditions, expected) in cases {
        let forward = status_from(&conditions);
        let mut reversed_input = conditions.clone();
        reversed_input.reverse();
        let reversed = status_from(&reversed_input);

        assert_eq!(derive_phase_from_conditions(&forward), Some(expected));
        assert_eq!(derive_phase_from_conditions(&reversed), Some(expected));
    }
}

#[test]
fn repeated_condition_updates_do_not_churn() {
    let mut status = AgenticSessionStatus::default();
    let update = ConditionUpdate::truthy(RUNNER_STARTED, "Started", "agent running");

    set_condition_at(&mut status, update.clone(), "2025-06-01T00:00:00Z");
    set_condition_at(&mut status, update, "2025-06-01T01:00:00Z");
    set_condition_at(
        &mut status,
        ConditionUpdate::truthy("runnerstarted", "Started", ""),
        "2025-06-01T02:00:00Z",
    );

    assert_eq!(status.conditions.len(), 1);
    let condition = find_condition(&status, RUNNER_STARTED).unwrap();
    assert_eq!(condition.last_transition_time.as_deref(), Some("2025-06-01T00:00:00Z"));
}

#[test]
fn workspace_image_cascades_through_layers() {
    let config = OperatorConfig::default();
    let project = ProjectSettingsSpec {
        workspace_image: Some("quay.io/team-a/toolbox:1".to_string()),
        ..Default::default()
    };

    let inherits = session(json!({"prompt": "p"}));
    let resolved = resolve_session_config(&config, Some(&project), &inherits.spec);
    assert_eq!(resolved.workspace_image, "quay.io/team-a/toolbox:1");

    let overrides = session(json!({"prompt": "p", "workspaceImage": "rust:1.80"}));
    let resolved = resolve_session_config(&config, Some(&project), &overrides.spec);
    assert_eq!(resolved.workspace_image, "rust:1.80");

    let resolved = resolve_session_config(&config, None, &inherits.spec);
    assert_eq!(resolved.workspace_image, config.default_workspace_image);
}

#[test]
fn rendered_workload_is_owned_colocated_and_locked_down() {
    let config = OperatorConfig::default();
    let session = session(json!({
        "prompt": "fix the login redirect",
        "workspaceImage": "node:20",
        "timeout": 1800
    }));
    let effective = resolve_session_config(&config, None, &session.spec);

    let pvc = build_session_pvc(&session, &effective, &config).unwrap();
    let job = build_session_job(&session, &effective, &config).unwrap();

    for owners in [
        pvc.metadata.owner_references.clone(),
        job.metadata.owner_references.clone(),
    ] {
        let owners = owners.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].uid, "0b5a7c1e-uid");
        assert_eq!(owners[0].controller, Some(true));
    }

    let job = serde_json::to_value(&job).unwrap();
    assert_eq!(job["spec"]["backoffLimit"], 0);
    assert_eq!(job["spec"]["activeDeadlineSeconds"], 1800);

    let pod = &job["spec"]["template"]["spec"];
    assert_eq!(pod["restartPolicy"], "Never");
    assert_eq!(pod["automountServiceAccountToken"], false);
    assert_eq!(pod["shareProcessNamespace"], true);

    let term = &pod["affinity"]["podAffinity"]["preferredDuringSchedulingIgnoredDuringExecution"][0];
    assert_eq!(term["podAffinityTerm"]["topologyKey"], "kubernetes.io/hostname");
    assert_eq!(
        term["podAffinityTerm"]["labelSelector"]["matchLabels"]["ambient-code.io/session"],
        "fix-login"
    );

    let containers = pod["containers"].as_array().unwrap();
    let workspace = containers.iter().find(|c| c["name"] == "workspace").unwrap();
    assert_eq!(workspace["image"], "node:20");
    assert!(containers.iter().any(|c| c["name"] == "agent"));
}
