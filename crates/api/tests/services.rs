use std::path::PathBuf;
use std::sync::Arc;

use dloop_api::{checkout_project, DloopError, ExecutionInput, Outcome, Scope, ServiceSelector, Services};
use dloop_apply::Manifest;
use dloop_client::{ClientConfig, MockPlatform, Platform, Resource};
use dloop_ops::LogQuery;
use dloop_persist::Session;
use futures::StreamExt;
use serde_json::json;

fn temp_dir(tag: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos();
    let dir = std::env::temp_dir().join(format!("dloop-api-{}-{}", tag, nanos));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn world() -> (Arc<MockPlatform>, Arc<dyn Platform>, Arc<Session>) {
    let m = Arc::new(MockPlatform::new());
    m.seed(&Resource::Projects, json!({"id": "p1", "name": "proj"}));
    m.seed(&Resource::Packages, json!({"id": "k1", "name": "pkg1", "projectId": "p1", "version": "1.0.0"}));
    m.seed(&Resource::Bots { project_id: "p1".into() }, json!({"id": "b1", "name": "bot", "email": "bot@p1"}));
    let p: Arc<dyn Platform> = m.clone();
    (m, p, Arc::new(Session::in_memory()))
}

async fn services(p: &Arc<dyn Platform>, s: &Arc<Session>) -> Services {
    let scope = Scope { project_id: Some("p1".into()), package: None };
    Services::connect(p.clone(), s.clone(), ClientConfig::default(), scope).await.unwrap()
}

#[tokio::test]
async fn project_resolution_order() {
    let (_m, p, s) = world();
    let err = Services::connect(p.clone(), s.clone(), ClientConfig::default(), Scope::default()).await.err().unwrap();
    assert!(err.is_not_found());

    let package = serde_json::from_value(json!({"id": "k1", "name": "pkg1", "projectId": "p1"})).unwrap();
    let via_package = Services::connect(p.clone(), s.clone(), ClientConfig::default(), Scope { project_id: None, package: Some(package) })
        .await
        .unwrap();
    assert_eq!(via_package.project().id, "p1");

    checkout_project(p.as_ref(), &s, "p1").await.unwrap();
    let via_session = Services::connect(p.clone(), s.clone(), ClientConfig::default(), Scope::default()).await.unwrap();
    assert_eq!(via_session.project().name, "proj");
}

#[tokio::test]
async fn current_service_needs_a_checkout() {
    let (m, p, s) = world();
    m.seed(&Resource::Services, json!({"id": "s1", "name": "svc1", "projectId": "p1"}));
    let svcs = services(&p, &s).await;

    let err = svcs.get(&ServiceSelector::Current).await.unwrap_err();
    assert_eq!(err, DloopError::not_found("No service found in state, please checkout a service."));

    svcs.checkout(&ServiceSelector::Name("svc1".into())).await.unwrap();
    assert_eq!(svcs.get(&ServiceSelector::Current).await.unwrap().id, "s1");
}

#[tokio::test]
async fn get_by_name_reports_missing_and_ambiguous() {
    let (m, p, s) = world();
    m.seed(&Resource::Services, json!({"id": "s1", "name": "dup", "projectId": "p1"}));
    m.seed(&Resource::Services, json!({"id": "s2", "name": "dup", "projectId": "p1"}));
    let svcs = services(&p, &s).await;
    assert!(matches!(svcs.get(&ServiceSelector::Name("dup".into())).await, Err(DloopError::Conflict(_))));
    assert!(svcs.get(&ServiceSelector::Name("none".into())).await.unwrap_err().is_not_found());
    assert_eq!(svcs.get(&ServiceSelector::Id("s2".into())).await.unwrap().id, "s2");
}

#[tokio::test]
async fn deploy_from_folder_creates_then_updates_and_checks_out() {
    let (m, p, s) = world();
    let dir = temp_dir("single");
    std::fs::write(
        dir.join("service.json"),
        json!({
            "name": "svc1",
            "runtime": {"gpu": false, "numReplicas": 1},
            "initParams": {"model": "a"},
            "triggers": [{"name": "on-item", "resource": "Item", "actions": ["Created"]}]
        })
        .to_string(),
    )
    .unwrap();
    let svcs = services(&p, &s).await;

    let first = svcs.deploy_from_local_folder(&dir, None, true).await.unwrap();
    assert_eq!(first.bot_user_name.as_deref(), Some("bot@p1"));
    assert_eq!(first.package_id.as_deref(), Some("k1"));
    assert_eq!(svcs.get(&ServiceSelector::Current).await.unwrap().id, first.id);
    assert_eq!(m.items(&Resource::Triggers).len(), 1);

    let second = svcs.deploy_from_local_folder(&dir, None, false).await.unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(m.count_calls("POST /services"), 1);
    assert_eq!(m.items(&Resource::Triggers).len(), 1);
}

#[tokio::test]
async fn deploy_surfaces_trigger_failure_as_error() {
    let (m, p, s) = world();
    m.fail_on("POST /triggers", None, 400, "bad filter");
    let dir = temp_dir("trigfail");
    std::fs::write(
        dir.join("service.json"),
        json!({"name": "svc1", "triggers": [{"name": "t", "resource": "Item"}]}).to_string(),
    )
    .unwrap();
    let svcs = services(&p, &s).await;
    let err = svcs.deploy_from_local_folder(&dir, None, false).await.unwrap_err();
    assert_eq!(err, DloopError::remote(400, "bad filter"));
    assert_eq!(m.items(&Resource::Services).len(), 1);
}

#[tokio::test]
async fn pipeline_deploy_and_teardown_through_files() {
    let (m, p, s) = world();
    let dir = temp_dir("pipeline");
    std::fs::write(
        dir.join("service.json"),
        json!([
            {"name": "a", "package": "pkg1", "triggers": [{"name": "t", "resource": "Dataset"}]},
            {"name": "b", "package": "missing"}
        ])
        .to_string(),
    )
    .unwrap();
    let svcs = services(&p, &s).await;

    let report = svcs.deploy_pipeline(&dir, None).await.unwrap();
    assert_eq!(report.entry("a").unwrap().outcome, Outcome::Created);
    assert!(report.entry("b").unwrap().outcome.is_failed());

    let td = svcs.tear_down(&dir).await.unwrap();
    assert_eq!(td.deleted_services, vec!["a".to_string()]);
    assert_eq!(td.deleted_triggers, vec!["a/t".to_string()]);
    assert_eq!(td.skipped, vec!["b".to_string()]);
    assert!(m.items(&Resource::Services).is_empty());
}

#[tokio::test]
async fn missing_manifest_is_not_found_before_any_remote_call() {
    let (m, p, s) = world();
    let svcs = services(&p, &s).await;
    m.clear_calls();
    let err = svcs.deploy_pipeline(&temp_dir("empty"), None).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(m.calls().is_empty());
}

#[tokio::test]
async fn template_round_trips_through_deploy() {
    let (m, p, s) = world();
    m.seed(&Resource::Packages, json!({"id": "k2", "name": "default-package", "projectId": "p1", "version": 2}));
    let dir = temp_dir("template");
    let path = Services::generate_services_json(&dir).unwrap();
    assert!(path.ends_with("service.json"));
    let svcs = services(&p, &s).await;
    let svc = svcs.deploy_from_local_folder(&dir, Some("explicit@bots".into()), false).await.unwrap();
    assert_eq!(svc.name, "default-service");
    assert_eq!(svc.bot_user_name.as_deref(), Some("explicit@bots"));
    assert_eq!(svc.package_revision, Some(json!(2)));
}

#[tokio::test]
async fn execute_and_logs_use_the_resolved_service() {
    let (m, p, s) = world();
    m.seed(&Resource::Services, json!({"id": "s1", "name": "svc1", "projectId": "p1"}));
    let svcs = services(&p, &s).await;
    let sel = ServiceSelector::Name("svc1".into());

    let ex = svcs.execute(&sel, None, ExecutionInput::Dataset("d1".into()), false).await.unwrap();
    assert_eq!(ex.input, json!({"dataset": {"dataset_id": "d1"}}));
    assert_eq!(svcs.status(&sel).await.unwrap()["status"], "running");

    m.push_log_page(json!({"logs": [{"timestamp": "t", "message": "hello"}], "checkpoint": null, "stop": true}));
    let lines: Vec<String> = svcs.log(&sel, LogQuery::default()).await.unwrap().map(|r| r.unwrap()).collect().await;
    assert_eq!(lines, vec!["t: hello"]);

    svcs.delete(&sel).await.unwrap();
    assert!(svcs.status(&ServiceSelector::Id("s1".into())).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn update_sends_whole_service() {
    let (m, p, s) = world();
    m.seed(&Resource::Services, json!({"id": "s1", "name": "svc1", "projectId": "p1", "runtime": {"gpu": false}}));
    let svcs = services(&p, &s).await;
    let mut svc = svcs.get(&ServiceSelector::Id("s1".into())).await.unwrap();
    svc.runtime.insert("numReplicas".into(), json!(4));
    let out = svcs.update(&svc).await.unwrap();
    assert_eq!(out.runtime.get("numReplicas"), Some(&json!(4)));
    assert_eq!(m.count_calls("PATCH /services/s1"), 1);
}

#[tokio::test]
async fn teardown_of_single_form_ignores_missing_package() {
    let (m, p, s) = world();
    m.seed(&Resource::Services, json!({"id": "s1", "name": "svc1", "projectId": "p1"}));
    m.seed(&Resource::Triggers, json!({"id": "t1", "name": "t", "serviceId": "s1", "projectId": "p1", "resource": "Item"}));
    let dir = temp_dir("td-nopkg");
    std::fs::write(
        dir.join("service.json"),
        json!({"name": "svc1", "packageName": "pkg-removed", "triggers": [{"name": "t", "resource": "Item"}]}).to_string(),
    )
    .unwrap();
    let svcs = services(&p, &s).await;

    let td = svcs.tear_down(&dir).await.unwrap();
    assert_eq!(td.deleted_services, vec!["svc1".to_string()]);
    assert_eq!(td.deleted_triggers, vec!["svc1/t".to_string()]);
    assert!(!td.has_failures());
    assert!(m.items(&Resource::Services).is_empty());
    assert!(m.items(&Resource::Triggers).is_empty());
}

#[tokio::test]
async fn teardown_of_single_form_without_package_name_in_multi_package_project() {
    let (m, p, s) = world();
    m.seed(&Resource::Packages, json!({"id": "k2", "name": "pkg2", "projectId": "p1"}));
    m.seed(&Resource::Services, json!({"id": "s1", "name": "default-service", "projectId": "p1"}));
    let dir = temp_dir("td-multipkg");
    std::fs::write(dir.join("service.json"), json!({"triggers": []}).to_string()).unwrap();
    let svcs = services(&p, &s).await;

    let td = svcs.tear_down(&dir).await.unwrap();
    assert_eq!(td.deleted_services, vec!["default-service".to_string()]);
    assert!(m.items(&Resource::Services).is_empty());
}

#[tokio::test]
async fn deploy_manifest_takes_an_already_parsed_document() {
    let (m, p, s) = world();
    let manifest = Manifest::parse(r#"[{"name": "a", "package": "pkg1"}]"#).unwrap();
    let svcs = services(&p, &s).await;
    let report = svcs.deploy_manifest(manifest, None).await.unwrap();
    assert_eq!(report.entry("a").unwrap().outcome, Outcome::Created);
    assert_eq!(m.items(&Resource::Services).len(), 1);
}
