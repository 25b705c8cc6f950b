//! dloop public API façade (in-process).
//!
//! [`Services`] is the services repository frontends (CLI, scripts) depend on. It
//! wires the platform client, manifest reconciliation, log streaming and the
//! local session together. The project is resolved once, when the façade is built.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use dloop_apply::{load_manifest, tear_down, Manifest, ProjectIndex, ReconcileReport, Reconciler, SingleServiceManifest, TeardownReport};
use dloop_client::{decode_one, list_all, ClientConfig, ListQuery, Platform, Resource};
use dloop_ops::{follow_logs, log_stream, LogChunk, LogQuery, StreamHandle};
use dloop_persist::Session;
use futures::Stream;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use dloop_apply::{EntryReport, Outcome, TriggerReport};
pub use dloop_core::{BotRef, DloopError, DloopResult, Execution, Json, Package, Project, Service};
pub use dloop_ops::{ExecutionInput, ExecutionRequest};

/// How a call names its service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceSelector {
    Id(String),
    Name(String),
    /// The checked-out service.
    Current,
}

impl ServiceSelector {
    /// Id wins over name; neither means the checked-out service.
    pub fn from_parts(id: Option<String>, name: Option<String>) -> Self {
        match (id, name) {
            (Some(id), _) => Self::Id(id),
            (None, Some(name)) => Self::Name(name),
            (None, None) => Self::Current,
        }
    }
}

/// Where the project comes from, in priority order.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    pub project_id: Option<String>,
    pub package: Option<Package>,
}

pub(crate) fn session_err(e: impl std::fmt::Display) -> DloopError {
    DloopError::internal(format!("session store: {}", e))
}

/// Services repository bound to one project.
pub struct Services {
    platform: Arc<dyn Platform>,
    session: Arc<Session>,
    project: Project,
    config: ClientConfig,
}

impl Services {
    /// Resolve the project: explicit id, then the package's project, then the
    /// checked-out project. None of those is `NotFound`.
    pub async fn connect(platform: Arc<dyn Platform>, session: Arc<Session>, config: ClientConfig, scope: Scope) -> DloopResult<Self> {
        let project_id = scope
            .project_id
            .or_else(|| scope.package.as_ref().and_then(|p| p.project_id.clone()));
        let project = match project_id {
            Some(id) => decode_one::<Project>(platform.get(&Resource::Projects, &id).await?)?,
            None => session
                .current_project()
                .map_err(session_err)?
                .ok_or_else(|| DloopError::not_found("Missing project. Please checkout a project or provide a project id"))?,
        };
        info!(project = %project.id, name = %project.name, "api: project resolved");
        Ok(Self { platform, session, project, config })
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn platform(&self) -> Arc<dyn Platform> {
        Arc::clone(&self.platform)
    }

    fn query(&self) -> ListQuery {
        ListQuery::new(self.config.page_size).project(self.project.id.clone())
    }

    async fn index(&self) -> DloopResult<ProjectIndex> {
        ProjectIndex::fetch(self.platform.as_ref(), &self.project.id, self.config.page_size, self.config.decode_workers).await
    }

    pub async fn get(&self, selector: &ServiceSelector) -> DloopResult<Service> {
        match selector {
            ServiceSelector::Id(id) => decode_one(self.platform.get(&Resource::Services, id).await?),
            ServiceSelector::Name(name) => {
                let mut found = self.list(Some(name.as_str()), None).await?;
                match found.len() {
                    0 => Err(DloopError::not_found(format!("Service not found: {}", name))),
                    1 => Ok(found.remove(0)),
                    n => Err(DloopError::conflict(format!(
                        "{} services named {} in project {}; use the service id",
                        n, name, self.project.id
                    ))),
                }
            }
            ServiceSelector::Current => self
                .session
                .current_service()
                .map_err(session_err)?
                .ok_or_else(|| DloopError::not_found("No service found in state, please checkout a service.")),
        }
    }

    pub async fn list(&self, name: Option<&str>, package_id: Option<&str>) -> DloopResult<Vec<Service>> {
        let t0 = Instant::now();
        let mut q = self.query();
        if let Some(n) = name {
            q = q.name(n);
        }
        if let Some(p) = package_id {
            q = q.package(p);
        }
        let out: Vec<Service> = list_all(self.platform.as_ref(), &Resource::Services, &q, self.config.decode_workers).await?;
        info!(count = out.len(), took_ms = %t0.elapsed().as_millis(), "api: list services ok");
        Ok(out)
    }

    pub async fn status(&self, selector: &ServiceSelector) -> DloopResult<Json> {
        let svc = self.get(selector).await?;
        self.platform.service_status(&svc.id).await
    }

    pub async fn delete(&self, selector: &ServiceSelector) -> DloopResult<()> {
        let svc = self.get(selector).await?;
        self.platform.delete(&Resource::Services, &svc.id).await?;
        counter!("services_deleted_total", 1u64);
        info!(service = %svc.name, id = %svc.id, "api: delete ok");
        Ok(())
    }

    /// Send the whole service (minus id) as the new remote state.
    pub async fn update(&self, service: &Service) -> DloopResult<Service> {
        let raw = self.platform.update(&Resource::Services, &service.id, &service.to_patch()?).await?;
        decode_one(raw)
    }

    /// Create-or-update one service from the single-service form.
    pub async fn deploy(&self, manifest: SingleServiceManifest, bot: Option<BotRef>, checkout: bool) -> DloopResult<Service> {
        let t0 = Instant::now();
        let index = self.index().await?;
        let entry = manifest.into_entry(&index)?;
        let mut reconciler = Reconciler::new(self.platform.as_ref(), index).with_bot(bot);
        let report = reconciler.apply_one(&entry).await?;
        let service = report
            .service
            .ok_or_else(|| DloopError::internal("deploy finished without a service"))?;
        if checkout {
            self.session.checkout_service(&service).map_err(session_err)?;
        }
        info!(service = %service.name, id = %service.id, outcome = %report.outcome, took_ms = %t0.elapsed().as_millis(), "api: deploy ok");
        Ok(service)
    }

    /// Deploy `<dir>/service.json` (or an explicit file) in the single-service form.
    pub async fn deploy_from_local_folder(&self, path: &Path, bot: Option<BotRef>, checkout: bool) -> DloopResult<Service> {
        match load_manifest(path)? {
            Manifest::Single(m) => self.deploy(m, bot, checkout).await,
            Manifest::Pipeline(_) => Err(DloopError::validation("expected a single service object; use deploy_pipeline for arrays")),
        }
    }

    /// Reconcile every entry of a manifest. Entry failures are in the report, not the error.
    pub async fn deploy_pipeline(&self, path: &Path, bot: Option<BotRef>) -> DloopResult<ReconcileReport> {
        self.deploy_manifest(load_manifest(path)?, bot).await
    }

    /// Reconcile an already loaded manifest of either form.
    pub async fn deploy_manifest(&self, manifest: Manifest, bot: Option<BotRef>) -> DloopResult<ReconcileReport> {
        let index = self.index().await?;
        let entries = manifest.into_entries(&index)?;
        let mut reconciler = Reconciler::new(self.platform.as_ref(), index).with_bot(bot);
        let report = reconciler.run(&entries).await;
        if report.has_failures() {
            warn!(summary = %report.summary(), "api: deploy finished with failures");
        }
        Ok(report)
    }

    /// Delete what the manifest names. Packages are not looked up, so a removed
    /// package never blocks deleting its services.
    pub async fn tear_down(&self, path: &Path) -> DloopResult<TeardownReport> {
        let entries = load_manifest(path)?.into_teardown_entries();
        let mut index = self.index().await?;
        Ok(tear_down(self.platform.as_ref(), &mut index, &entries).await)
    }

    pub async fn execute(&self, selector: &ServiceSelector, function_name: Option<String>, input: ExecutionInput, sync: bool) -> DloopResult<Execution> {
        let svc = self.get(selector).await?;
        let req = ExecutionRequest { service_id: svc.id, function_name, input, sync };
        dloop_ops::execute(self.platform.as_ref(), &req).await
    }

    /// Lazy paged log lines for a service.
    pub async fn log(&self, selector: &ServiceSelector, q: LogQuery) -> DloopResult<impl Stream<Item = DloopResult<String>> + Send> {
        let svc = self.get(selector).await?;
        Ok(log_stream(self.platform(), svc.id, q))
    }

    /// Like [`Services::log`] but pumped into a bounded channel with a cancel handle.
    pub async fn follow(&self, selector: &ServiceSelector, q: LogQuery) -> DloopResult<StreamHandle<DloopResult<LogChunk>>> {
        let svc = self.get(selector).await?;
        Ok(follow_logs(self.platform(), &svc.id, q))
    }

    pub async fn checkout(&self, selector: &ServiceSelector) -> DloopResult<Service> {
        let svc = self.get(selector).await?;
        self.session.checkout_service(&svc).map_err(session_err)?;
        info!(service = %svc.name, id = %svc.id, "api: checkout ok");
        Ok(svc)
    }

    pub fn generate_services_json(dir: &Path) -> DloopResult<PathBuf> {
        dloop_apply::write_template(dir)
    }
}

/// Fetch a project and make it the session's current project.
pub async fn checkout_project(platform: &dyn Platform, session: &Session, project_id: &str) -> DloopResult<Project> {
    let project: Project = decode_one(platform.get(&Resource::Projects, project_id).await?)?;
    session.checkout_project(&project).map_err(session_err)?;
    info!(project = %project.id, name = %project.name, "api: project checkout ok");
    Ok(project)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_prefers_id() {
        assert_eq!(ServiceSelector::from_parts(Some("i".into()), Some("n".into())), ServiceSelector::Id("i".into()));
        assert_eq!(ServiceSelector::from_parts(None, Some("n".into())), ServiceSelector::Name("n".into()));
        assert_eq!(ServiceSelector::from_parts(None, None), ServiceSelector::Current);
    }
}
