//! Create-or-update reconciliation of manifest entries against a [`ProjectIndex`].

use std::fmt;
use std::time::Instant;

use dloop_client::{decode_one, ListQuery, Platform, Resource};
use dloop_core::{
    Bot, BotRef, DloopError, DloopResult, ExecutionMode, Json, JsonMap, Package, Service, Trigger,
    DEFAULT_FUNCTION_NAME, DEFAULT_MODULE_NAME,
};
use metrics::{counter, histogram};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::manifest::{ServiceManifestEntry, TriggerSpec};
use crate::snapshot::ProjectIndex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "lowercase")]
pub enum Outcome {
    Created,
    Updated,
    Failed(String),
}

impl Outcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Created => f.write_str("created"),
            Outcome::Updated => f.write_str("updated"),
            Outcome::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerReport {
    pub name: String,
    #[serde(flatten)]
    pub outcome: Outcome,
}

/// Result for one manifest entry. A failed trigger fails the entry while the
/// already-applied service change stays in `service`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryReport {
    pub name: String,
    #[serde(flatten)]
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_outcome: Option<Outcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<Service>,
    pub triggers: Vec<TriggerReport>,
}

impl EntryReport {
    fn failed(name: &str, reason: String) -> Self {
        Self { name: name.to_string(), outcome: Outcome::Failed(reason), service_outcome: None, service: None, triggers: Vec::new() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub entries: Vec<EntryReport>,
}

impl ReconcileReport {
    pub fn entry(&self, name: &str) -> Option<&EntryReport> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn count(&self, pred: impl Fn(&Outcome) -> bool) -> usize {
        self.entries.iter().filter(|e| pred(&e.outcome)).count()
    }

    pub fn has_failures(&self) -> bool {
        self.entries.iter().any(|e| e.outcome.is_failed())
    }

    pub fn summary(&self) -> String {
        format!(
            "created: {}, updated: {}, failed: {}",
            self.count(|o| *o == Outcome::Created),
            self.count(|o| *o == Outcome::Updated),
            self.count(Outcome::is_failed),
        )
    }
}

/// Bot used for service creation. An explicit bot wins; otherwise the project's
/// first bot, else a bot named `default` is created. Resolved at most once per run.
#[derive(Debug, Clone, Default)]
pub struct BotResolver {
    explicit: Option<BotRef>,
    cached: Option<String>,
}

impl BotResolver {
    pub fn new(explicit: Option<BotRef>) -> Self {
        Self { explicit, cached: None }
    }

    pub async fn email(&mut self, platform: &dyn Platform, project_id: &str) -> DloopResult<String> {
        if let Some(b) = &self.explicit {
            return Ok(b.email().to_string());
        }
        if let Some(e) = &self.cached {
            return Ok(e.clone());
        }
        let bots_res = Resource::Bots { project_id: project_id.to_string() };
        let page = platform.list(&bots_res, &ListQuery::new(1)).await?;
        let bot: Bot = match page.items.into_iter().next() {
            Some(raw) => decode_one(raw)?,
            None => {
                info!(project = %project_id, "bot not found for project; creating a default bot");
                counter!("deploy_bot_created_total", 1u64);
                decode_one(platform.create(&bots_res, &json!({"name": "default"})).await?)?
            }
        };
        debug!(email = %bot.email, "deploy: using bot");
        self.cached = Some(bot.email.clone());
        Ok(bot.email)
    }
}

pub struct Reconciler<'a> {
    platform: &'a dyn Platform,
    index: ProjectIndex,
    bots: BotResolver,
    sdk_version: String,
}

impl<'a> Reconciler<'a> {
    pub fn new(platform: &'a dyn Platform, index: ProjectIndex) -> Self {
        Self { platform, index, bots: BotResolver::default(), sdk_version: crate::SDK_VERSION.to_string() }
    }

    pub fn with_bot(mut self, bot: Option<BotRef>) -> Self {
        self.bots = BotResolver::new(bot);
        self
    }

    pub fn with_sdk_version(mut self, v: impl Into<String>) -> Self {
        self.sdk_version = v.into();
        self
    }

    pub fn index(&self) -> &ProjectIndex {
        &self.index
    }

    pub fn into_index(self) -> ProjectIndex {
        self.index
    }

    /// Apply entries in manifest order. Entry failures are recorded and the pass continues.
    pub async fn run(&mut self, entries: &[ServiceManifestEntry]) -> ReconcileReport {
        let t0 = Instant::now();
        let mut report = ReconcileReport::default();
        for entry in entries {
            let r = self.apply_entry(entry).await;
            if let Outcome::Failed(reason) = &r.outcome {
                counter!("deploy_entry_failed_total", 1u64);
                warn!(service = %entry.name, %reason, "deploy: entry failed");
            }
            report.entries.push(r);
        }
        histogram!("deploy_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(project = %self.index.project_id(), summary = %report.summary(), took_ms = %t0.elapsed().as_millis(), "deploy: done");
        report
    }

    /// Apply a single entry and surface its first error instead of recording it.
    /// A trigger error still leaves the service change applied.
    pub async fn apply_one(&mut self, entry: &ServiceManifestEntry) -> DloopResult<EntryReport> {
        let (service, service_outcome) = self.service_stage(entry).await?;
        let (report, first_err) = self.trigger_stage(entry, service, service_outcome).await;
        match first_err {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    async fn apply_entry(&mut self, entry: &ServiceManifestEntry) -> EntryReport {
        match self.service_stage(entry).await {
            Ok((service, outcome)) => self.trigger_stage(entry, service, outcome).await.0,
            Err(e) => EntryReport::failed(&entry.name, e.to_string()),
        }
    }

    async fn service_stage(&mut self, entry: &ServiceManifestEntry) -> DloopResult<(Service, Outcome)> {
        let package = self.index.package(&entry.package)?.clone();
        self.apply_service(entry, &package).await
    }

    async fn trigger_stage(&mut self, entry: &ServiceManifestEntry, service: Service, service_outcome: Outcome) -> (EntryReport, Option<DloopError>) {
        let mut triggers = Vec::with_capacity(entry.triggers.len());
        let mut first_err: Option<(String, DloopError)> = None;
        for spec in &entry.triggers {
            let outcome = match self.apply_trigger(&service, spec).await {
                Ok(o) => o,
                Err(e) => {
                    warn!(service = %service.name, trigger = %spec.name, error = %e, "deploy: trigger failed");
                    let reason = e.to_string();
                    first_err.get_or_insert_with(|| (spec.name.clone(), e));
                    Outcome::Failed(reason)
                }
            };
            triggers.push(TriggerReport { name: spec.name.clone(), outcome });
        }

        let outcome = match &first_err {
            Some((name, e)) => Outcome::Failed(format!("trigger {}: {}", name, e)),
            None => service_outcome.clone(),
        };
        let report = EntryReport {
            name: entry.name.clone(),
            outcome,
            service_outcome: Some(service_outcome),
            service: Some(service),
            triggers,
        };
        (report, first_err.map(|(_, e)| e))
    }

    async fn apply_service(&mut self, entry: &ServiceManifestEntry, package: &Package) -> DloopResult<(Service, Outcome)> {
        if let Some(existing) = self.index.service(&entry.name)?.cloned() {
            let patch = service_patch(entry, &existing, package);
            if patch.is_empty() {
                debug!(service = %existing.name, "deploy: service up to date; nothing to send");
                return Ok((existing, Outcome::Updated));
            }
            let raw = self.platform.update(&Resource::Services, &existing.id, &Json::Object(patch)).await?;
            let updated: Service = decode_one(raw)?;
            counter!("deploy_service_updated_total", 1u64);
            info!(service = %updated.name, id = %updated.id, "deploy: service updated");
            self.index.upsert_service(updated.clone());
            return Ok((updated, Outcome::Updated));
        }

        let bot = match &entry.bot {
            Some(email) => email.clone(),
            None => self.bots.email(self.platform, self.index.project_id()).await?,
        };
        let body = create_payload(entry, package, self.index.project_id(), &bot, &self.sdk_version);
        let created: Service = decode_one(self.platform.create(&Resource::Services, &body).await?)?;
        counter!("deploy_service_created_total", 1u64);
        info!(service = %created.name, id = %created.id, "deploy: service created");
        self.index.upsert_service(created.clone());
        Ok((created, Outcome::Created))
    }

    async fn apply_trigger(&mut self, service: &Service, spec: &TriggerSpec) -> DloopResult<Outcome> {
        if let Some(existing) = self.index.trigger_for(&service.id, &spec.name)?.cloned() {
            let patch = trigger_patch(spec);
            if patch.is_empty() {
                return Ok(Outcome::Updated);
            }
            let raw = self.platform.update(&Resource::Triggers, &existing.id, &Json::Object(patch)).await?;
            let updated: Trigger = decode_one(raw)?;
            counter!("deploy_trigger_updated_total", 1u64);
            self.index.upsert_trigger(updated);
            return Ok(Outcome::Updated);
        }
        let body = trigger_create_payload(spec, service, self.index.project_id());
        let created: Trigger = decode_one(self.platform.create(&Resource::Triggers, &body).await?)?;
        counter!("deploy_trigger_created_total", 1u64);
        debug!(trigger = %created.name, service = %service.id, "deploy: trigger created");
        self.index.upsert_trigger(created);
        Ok(Outcome::Created)
    }
}

/// Partial patch with only the fields the entry names. Runtime keys merge over
/// the remote runtime so server-added keys survive.
pub fn service_patch(entry: &ServiceManifestEntry, existing: &Service, package: &Package) -> JsonMap {
    let mut patch = JsonMap::new();
    if let Some(rt) = &entry.runtime {
        let mut merged = existing.runtime.clone();
        for (k, v) in rt {
            merged.insert(k.clone(), v.clone());
        }
        patch.insert("runtime".into(), Json::Object(merged));
    }
    if let Some(p) = &entry.init_params {
        patch.insert("initParams".into(), Json::Object(p.clone()));
    }
    if let Some(m) = &entry.module_name {
        patch.insert("moduleName".into(), json!(m));
    }
    if let Some(d) = &entry.driver_id {
        patch.insert("driverId".into(), json!(d));
    }
    if let Some(r) = pinned_revision(entry) {
        patch.insert("packageRevision".into(), r.clone());
    }
    if let Some(v) = &entry.versions {
        patch.insert("versions".into(), v.clone());
    }
    if existing.package_id.as_deref().is_some_and(|id| id != package.id) {
        patch.insert("packageId".into(), json!(package.id));
    }
    patch
}

pub fn create_payload(entry: &ServiceManifestEntry, package: &Package, project_id: &str, bot_email: &str, sdk_version: &str) -> Json {
    let mut runtime = entry.runtime.clone().unwrap_or_else(default_runtime);
    if !runtime.contains_key("podType") {
        let gpu = runtime.get("gpu").and_then(|v| v.as_bool()).unwrap_or(false);
        runtime.insert("podType".into(), json!(if gpu { "gpu-k80-s" } else { "regular-s" }));
    }
    let versions = entry.versions.clone().unwrap_or_else(|| {
        json!({
            "dtlpy": entry.version.as_deref().unwrap_or(sdk_version),
            "verify": entry.verify.unwrap_or(true),
        })
    });
    let mut body = json!({
        "name": entry.name,
        "projectId": project_id,
        "packageId": package.id,
        "initParams": entry.init_params.clone().unwrap_or_default(),
        "botUserName": bot_email,
        "versions": versions,
        "moduleName": entry.module_name.as_deref().unwrap_or(DEFAULT_MODULE_NAME),
        "runtime": runtime,
    });
    if let Some(obj) = body.as_object_mut() {
        if let Some(d) = &entry.driver_id {
            obj.insert("driverId".into(), json!(d));
        }
        if let Some(rev) = pinned_revision(entry) {
            obj.insert("packageRevision".into(), rev.clone());
        }
    }
    body
}

/// Only integer revisions are pinned; anything else tracks the latest package.
fn pinned_revision(entry: &ServiceManifestEntry) -> Option<&Json> {
    entry.revision.as_ref().filter(|r| r.is_i64() || r.is_u64())
}

fn default_runtime() -> JsonMap {
    let mut rt = JsonMap::new();
    rt.insert("gpu".into(), json!(false));
    rt.insert("numReplicas".into(), json!(1));
    rt
}

pub fn trigger_patch(spec: &TriggerSpec) -> JsonMap {
    let mut patch = JsonMap::new();
    patch.insert("resource".into(), json!(spec.resource.as_str()));
    if let Some(a) = spec.active {
        patch.insert("active".into(), json!(a));
    }
    if let Some(a) = &spec.actions {
        patch.insert("actions".into(), json!(a));
    }
    if let Some(f) = &spec.filter {
        patch.insert("filter".into(), Json::Object(f.clone()));
    }
    if let Some(m) = spec.execution_mode {
        patch.insert("executionMode".into(), json!(m));
    }
    if let Some(f) = &spec.function {
        patch.insert("functionName".into(), json!(f));
    }
    patch
}

pub fn trigger_create_payload(spec: &TriggerSpec, service: &Service, project_id: &str) -> Json {
    json!({
        "name": spec.name,
        "projectId": project_id,
        "serviceId": service.id,
        "resource": spec.resource.as_str(),
        "filter": spec.filter.clone().unwrap_or_default(),
        "actions": spec.actions.clone().unwrap_or_else(|| vec!["Created".to_string()]),
        "active": spec.active.unwrap_or(true),
        "executionMode": spec.execution_mode.unwrap_or(ExecutionMode::Once),
        "functionName": spec.function.as_deref().unwrap_or(DEFAULT_FUNCTION_NAME),
    })
}
