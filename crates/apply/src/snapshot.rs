//! Name-keyed view of a project's services, triggers and packages for one run.

use std::time::Instant;

use dloop_client::{list_all, ListQuery, Platform, Resource};
use dloop_core::{DloopError, DloopResult, Package, Service, Trigger};
use metrics::histogram;
use rustc_hash::FxHashMap;
use tracing::info;

/// Built once per run and never persisted. Names are not unique remotely, so
/// each name maps to every entity carrying it and lookups report ambiguity.
#[derive(Debug, Clone, Default)]
pub struct ProjectIndex {
    project_id: String,
    services: FxHashMap<String, Vec<Service>>,
    packages: FxHashMap<String, Vec<Package>>,
    triggers: Vec<Trigger>,
}

impl ProjectIndex {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self { project_id: project_id.into(), ..Default::default() }
    }

    pub fn from_parts(project_id: impl Into<String>, services: Vec<Service>, triggers: Vec<Trigger>, packages: Vec<Package>) -> Self {
        let mut idx = Self::new(project_id);
        for s in services {
            idx.upsert_service(s);
        }
        for p in packages {
            idx.packages.entry(p.name.clone()).or_default().push(p);
        }
        idx.triggers = triggers;
        idx
    }

    /// Drain all listing pages for the project before returning.
    pub async fn fetch(platform: &dyn Platform, project_id: &str, page_size: u32, workers: usize) -> DloopResult<Self> {
        let t0 = Instant::now();
        let q = ListQuery::new(page_size).project(project_id);
        let services: Vec<Service> = list_all(platform, &Resource::Services, &q, workers).await?;
        let triggers: Vec<Trigger> = list_all(platform, &Resource::Triggers, &q, workers).await?;
        let packages: Vec<Package> = list_all(platform, &Resource::Packages, &q, workers).await?;
        histogram!("snapshot_fetch_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(
            project = %project_id,
            services = services.len(),
            triggers = triggers.len(),
            packages = packages.len(),
            took_ms = %t0.elapsed().as_millis(),
            "snapshot: fetched"
        );
        Ok(Self::from_parts(project_id, services, triggers, packages))
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// `Ok(None)` when absent, `Conflict` when the name is ambiguous.
    pub fn service(&self, name: &str) -> DloopResult<Option<&Service>> {
        match self.services.get(name).map(|v| v.as_slice()) {
            None | Some([]) => Ok(None),
            Some([one]) => Ok(Some(one)),
            Some(many) => Err(DloopError::conflict(format!("{} services named {} in project {}", many.len(), name, self.project_id))),
        }
    }

    pub fn package(&self, name: &str) -> DloopResult<&Package> {
        match self.packages.get(name).map(|v| v.as_slice()) {
            None | Some([]) => Err(DloopError::not_found(format!("Package not found, package name: {}", name))),
            Some([one]) => Ok(one),
            Some(many) => Err(DloopError::conflict(format!("{} packages named {} in project {}", many.len(), name, self.project_id))),
        }
    }

    /// The project's only package; used when a manifest does not name one.
    pub fn sole_package(&self) -> DloopResult<&Package> {
        let mut all = self.packages.values().flatten();
        match (all.next(), all.next()) {
            (Some(p), None) => Ok(p),
            (None, _) => Err(DloopError::not_found(format!("no packages in project {}", self.project_id))),
            (Some(_), Some(_)) => Err(DloopError::validation("project has more than one package; set packageName")),
        }
    }

    /// Trigger `name` bound to `service_id`. Triggers of other services are invisible here.
    pub fn trigger_for(&self, service_id: &str, name: &str) -> DloopResult<Option<&Trigger>> {
        let mut hits = self
            .triggers
            .iter()
            .filter(|t| t.service_id.as_deref() == Some(service_id) && t.name == name);
        match (hits.next(), hits.next()) {
            (None, _) => Ok(None),
            (Some(t), None) => Ok(Some(t)),
            (Some(_), Some(_)) => Err(DloopError::conflict(format!("more than one trigger named {} on service {}", name, service_id))),
        }
    }

    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.services.values().flatten()
    }

    pub fn triggers(&self) -> &[Trigger] {
        &self.triggers
    }

    pub fn upsert_service(&mut self, service: Service) {
        for bucket in self.services.values_mut() {
            bucket.retain(|s| s.id != service.id);
        }
        self.services.entry(service.name.clone()).or_default().push(service);
    }

    pub fn upsert_trigger(&mut self, trigger: Trigger) {
        match self.triggers.iter_mut().find(|t| t.id == trigger.id) {
            Some(slot) => *slot = trigger,
            None => self.triggers.push(trigger),
        }
    }

    pub fn remove_service(&mut self, id: &str) {
        for bucket in self.services.values_mut() {
            bucket.retain(|s| s.id != id);
        }
    }

    pub fn remove_trigger(&mut self, id: &str) {
        self.triggers.retain(|t| t.id != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn svc(id: &str, name: &str) -> Service {
        serde_json::from_value(json!({"id": id, "name": name})).unwrap()
    }

    fn trig(id: &str, name: &str, service: &str) -> Trigger {
        serde_json::from_value(json!({"id": id, "name": name, "serviceId": service})).unwrap()
    }

    fn pkg(id: &str, name: &str) -> Package {
        serde_json::from_value(json!({"id": id, "name": name, "version": "1.0.0"})).unwrap()
    }

    #[test]
    fn duplicate_service_names_conflict() {
        let idx = ProjectIndex::from_parts("p", vec![svc("1", "a"), svc("2", "a"), svc("3", "b")], vec![], vec![]);
        assert!(matches!(idx.service("a"), Err(DloopError::Conflict(_))));
        assert_eq!(idx.service("b").unwrap().map(|s| s.id.as_str()), Some("3"));
        assert!(idx.service("c").unwrap().is_none());
    }

    #[test]
    fn triggers_are_scoped_by_service() {
        let idx = ProjectIndex::from_parts("p", vec![], vec![trig("t1", "on-item", "other")], vec![]);
        assert!(idx.trigger_for("mine", "on-item").unwrap().is_none());
        assert_eq!(idx.trigger_for("other", "on-item").unwrap().map(|t| t.id.as_str()), Some("t1"));
    }

    #[test]
    fn package_lookup_and_sole_package() {
        let idx = ProjectIndex::from_parts("p", vec![], vec![], vec![pkg("k1", "pkg1")]);
        assert_eq!(idx.package("pkg1").unwrap().id, "k1");
        assert!(idx.package("missing").unwrap_err().is_not_found());
        assert_eq!(idx.sole_package().unwrap().id, "k1");

        let two = ProjectIndex::from_parts("p", vec![], vec![], vec![pkg("k1", "a"), pkg("k2", "b")]);
        assert!(matches!(two.sole_package(), Err(DloopError::Validation(_))));
        assert!(ProjectIndex::new("p").sole_package().unwrap_err().is_not_found());
    }

    #[test]
    fn upsert_replaces_by_id() {
        let mut idx = ProjectIndex::new("p");
        idx.upsert_service(svc("1", "a"));
        idx.upsert_service(svc("1", "a"));
        assert_eq!(idx.services().count(), 1);
        idx.remove_service("1");
        assert!(idx.service("a").unwrap().is_none());
    }
}
