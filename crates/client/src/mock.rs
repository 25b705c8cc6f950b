//! In-memory [`Platform`] used by tests and offline runs.
//!
//! Collections are plain JSON vectors keyed by collection name. Every call is
//! recorded as `"<METHOD> <path>"` so tests can assert on remote traffic.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use dloop_core::{DloopError, DloopResult, Json};
use serde_json::json;

use crate::{ListQuery, Page, Platform, Resource};

#[derive(Debug, Clone)]
struct Failure {
    call: String,
    target: Option<String>,
    status: u16,
    message: String,
}

#[derive(Default)]
struct MockState {
    collections: HashMap<&'static str, Vec<Json>>,
    calls: Vec<String>,
    failures: Vec<Failure>,
    log_pages: VecDeque<Json>,
    log_requests: Vec<Json>,
}

pub struct MockPlatform {
    state: Mutex<MockState>,
    page_size: Option<usize>,
}

impl Default for MockPlatform {
    fn default() -> Self { Self::new() }
}

impl MockPlatform {
    pub fn new() -> Self {
        Self { state: Mutex::new(MockState::default()), page_size: None }
    }

    /// Force a server-side page size, overriding the one in the query.
    pub fn with_page_size(mut self, n: usize) -> Self {
        self.page_size = Some(n.max(1));
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a raw entity as-is. Bots need `projectId` to show up under a project.
    pub fn seed(&self, resource: &Resource, mut value: Json) -> Json {
        if let (Resource::Bots { project_id }, Some(obj)) = (resource, value.as_object_mut()) {
            obj.entry("projectId").or_insert_with(|| json!(project_id));
        }
        let mut st = self.lock();
        st.collections.entry(resource.collection()).or_default().push(value.clone());
        value
    }

    pub fn items(&self, resource: &Resource) -> Vec<Json> {
        let st = self.lock();
        let all = st.collections.get(resource.collection()).cloned().unwrap_or_default();
        match resource {
            Resource::Bots { project_id } => all.into_iter().filter(|v| str_field(v, "projectId") == Some(project_id.as_str())).collect(),
            _ => all,
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Calls whose key starts with `prefix`, e.g. `"POST /services"`.
    pub fn count_calls(&self, prefix: &str) -> usize {
        self.lock().calls.iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Make `call` (e.g. `"POST /triggers"`) fail with `status`. With a `target`, only
    /// requests whose body name or path id equals it fail.
    pub fn fail_on(&self, call: &str, target: Option<&str>, status: u16, message: &str) {
        self.lock().failures.push(Failure {
            call: call.to_string(),
            target: target.map(|s| s.to_string()),
            status,
            message: message.to_string(),
        });
    }

    pub fn push_log_page(&self, page: Json) {
        self.lock().log_pages.push_back(page);
    }

    pub fn log_requests(&self) -> Vec<Json> {
        self.lock().log_requests.clone()
    }

    fn record(&self, st: &mut MockState, call: String, target: Option<&str>) -> DloopResult<()> {
        let hit = st.failures.iter().find(|f| {
            call.starts_with(&f.call) && f.target.as_deref().map_or(true, |t| Some(t) == target)
        });
        let err = hit.map(|f| DloopError::remote(f.status, f.message.clone()));
        st.calls.push(call);
        match err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn str_field<'a>(v: &'a Json, key: &str) -> Option<&'a str> {
    v.get(key).and_then(|x| x.as_str())
}

fn matches_query(resource: &Resource, v: &Json, q: &ListQuery) -> bool {
    if let Resource::Bots { project_id } = resource {
        if str_field(v, "projectId") != Some(project_id.as_str()) {
            return false;
        }
    }
    if let Some(p) = &q.project_id {
        let key = if matches!(resource, Resource::Projects) { "id" } else { "projectId" };
        if str_field(v, key) != Some(p.as_str()) {
            return false;
        }
    }
    if let Some(n) = &q.name {
        if str_field(v, "name") != Some(n.as_str()) {
            return false;
        }
    }
    if let Some(p) = &q.package_id {
        if str_field(v, "packageId") != Some(p.as_str()) {
            return false;
        }
    }
    true
}

fn not_found(resource: &Resource, id: &str) -> DloopError {
    DloopError::remote(404, format!("{} {} not found", resource.collection(), id))
}

#[async_trait::async_trait]
impl Platform for MockPlatform {
    async fn list(&self, resource: &Resource, query: &ListQuery) -> DloopResult<Page> {
        let mut st = self.lock();
        self.record(&mut st, format!("GET {}", resource.path()), None)?;
        let matched: Vec<Json> = st
            .collections
            .get(resource.collection())
            .map(|all| all.iter().filter(|v| matches_query(resource, v, query)).cloned().collect())
            .unwrap_or_default();
        let size = self.page_size.unwrap_or(query.page_size.max(1) as usize);
        let start = (query.page_offset as usize).saturating_mul(size);
        let items: Vec<Json> = matched.iter().skip(start).take(size).cloned().collect();
        let has_next_page = start + items.len() < matched.len();
        Ok(Page { items, has_next_page, total: Some(matched.len() as u64) })
    }

    async fn get(&self, resource: &Resource, id: &str) -> DloopResult<Json> {
        let mut st = self.lock();
        self.record(&mut st, format!("GET {}/{}", resource.path(), id), Some(id))?;
        st.collections
            .get(resource.collection())
            .and_then(|all| all.iter().find(|v| str_field(v, "id") == Some(id)).cloned())
            .ok_or_else(|| not_found(resource, id))
    }

    async fn create(&self, resource: &Resource, body: &Json) -> DloopResult<Json> {
        let mut st = self.lock();
        self.record(&mut st, format!("POST {}", resource.path()), str_field(body, "name"))?;
        let mut value = body.clone();
        let Some(obj) = value.as_object_mut() else {
            return Err(DloopError::remote(400, "body must be an object"));
        };
        obj.entry("id").or_insert_with(|| json!(uuid::Uuid::new_v4().to_string()));
        if let Resource::Bots { project_id } = resource {
            obj.entry("projectId").or_insert_with(|| json!(project_id));
            let name = obj.get("name").and_then(|v| v.as_str()).unwrap_or("bot").to_string();
            obj.entry("email").or_insert_with(|| json!(format!("{}-{}@bots.dataloop.ai", name, project_id)));
        }
        st.collections.entry(resource.collection()).or_default().push(value.clone());
        Ok(value)
    }

    async fn update(&self, resource: &Resource, id: &str, body: &Json) -> DloopResult<Json> {
        let mut st = self.lock();
        self.record(&mut st, format!("PATCH {}/{}", resource.path(), id), Some(id))?;
        let slot = st
            .collections
            .get_mut(resource.collection())
            .and_then(|all| all.iter_mut().find(|v| str_field(v, "id") == Some(id)))
            .ok_or_else(|| not_found(resource, id))?;
        if let (Some(dst), Some(src)) = (slot.as_object_mut(), body.as_object()) {
            for (k, v) in src {
                if k != "id" {
                    dst.insert(k.clone(), v.clone());
                }
            }
        }
        Ok(slot.clone())
    }

    async fn delete(&self, resource: &Resource, id: &str) -> DloopResult<()> {
        let mut st = self.lock();
        self.record(&mut st, format!("DELETE {}/{}", resource.path(), id), Some(id))?;
        let all = st.collections.entry(resource.collection()).or_default();
        let before = all.len();
        all.retain(|v| str_field(v, "id") != Some(id));
        if all.len() == before {
            return Err(not_found(resource, id));
        }
        Ok(())
    }

    async fn service_status(&self, service_id: &str) -> DloopResult<Json> {
        let mut st = self.lock();
        self.record(&mut st, format!("GET /services/{}/status", service_id), Some(service_id))?;
        let exists = st
            .collections
            .get("services")
            .map_or(false, |all| all.iter().any(|v| str_field(v, "id") == Some(service_id)));
        if !exists {
            return Err(not_found(&Resource::Services, service_id));
        }
        Ok(json!({"status": "running"}))
    }

    async fn service_logs(&self, service_id: &str, body: &Json) -> DloopResult<Json> {
        let mut st = self.lock();
        self.record(&mut st, format!("POST /services/{}/logs", service_id), Some(service_id))?;
        st.log_requests.push(body.clone());
        Ok(st
            .log_pages
            .pop_front()
            .unwrap_or_else(|| json!({"logs": [], "checkpoint": null, "stop": true})))
    }

    async fn execute(&self, body: &Json, sync: bool) -> DloopResult<Json> {
        let mut st = self.lock();
        let path = if sync { "POST /executions?sync=true".to_string() } else { "POST /executions".to_string() };
        self.record(&mut st, path, str_field(body, "serviceId"))?;
        let mut value = body.clone();
        if let Some(obj) = value.as_object_mut() {
            obj.insert("id".into(), json!(uuid::Uuid::new_v4().to_string()));
            obj.insert("status".into(), json!(if sync { "success" } else { "created" }));
        }
        st.collections.entry("executions").or_default().push(value.clone());
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn update_merges_top_level_keys() {
        let m = MockPlatform::new();
        m.seed(&Resource::Services, json!({"id": "s1", "name": "a", "runtime": {"podType": "regular-s"}}));
        let out = m.update(&Resource::Services, "s1", &json!({"initParams": {"x": 1}})).await.unwrap();
        assert_eq!(out["runtime"]["podType"], "regular-s");
        assert_eq!(out["initParams"]["x"], 1);
        assert_eq!(m.calls(), vec!["PATCH /services/s1".to_string()]);
    }

    #[tokio::test]
    async fn missing_ids_are_remote_404() {
        let m = MockPlatform::new();
        let err = m.delete(&Resource::Triggers, "nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn injected_failure_is_scoped_to_target() {
        let m = MockPlatform::new();
        m.fail_on("POST /triggers", Some("bad"), 500, "boom");
        assert!(m.create(&Resource::Triggers, &json!({"name": "good"})).await.is_ok());
        let err = m.create(&Resource::Triggers, &json!({"name": "bad"})).await.unwrap_err();
        assert_eq!(err, DloopError::remote(500, "boom"));
        assert_eq!(m.items(&Resource::Triggers).len(), 1);
    }

    #[tokio::test]
    async fn bots_are_scoped_to_their_project() {
        let m = MockPlatform::new();
        m.create(&Resource::Bots { project_id: "p1".into() }, &json!({"name": "b", "email": "b@x"})).await.unwrap();
        let p2 = m.list(&Resource::Bots { project_id: "p2".into() }, &ListQuery::new(10)).await.unwrap();
        assert!(p2.items.is_empty());
        let p1 = m.list(&Resource::Bots { project_id: "p1".into() }, &ListQuery::new(10)).await.unwrap();
        assert_eq!(p1.items.len(), 1);
    }

    #[tokio::test]
    async fn logs_end_with_stop_when_script_runs_out() {
        let m = MockPlatform::new();
        let page = m.service_logs("s1", &json!({})).await;
        // unknown services still answer logs; status is the call that checks existence
        assert_eq!(page.unwrap()["stop"], true);
        assert_eq!(m.log_requests().len(), 1);
    }
}
