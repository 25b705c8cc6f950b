//! Manifest-driven deletion of services and their triggers.

use std::time::Instant;

use dloop_client::{Platform, Resource};
use dloop_core::DloopResult;
use metrics::counter;
use serde::Serialize;
use tracing::{info, warn};

use crate::manifest::ServiceManifestEntry;
use crate::snapshot::ProjectIndex;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TeardownReport {
    pub deleted_services: Vec<String>,
    pub deleted_triggers: Vec<String>,
    pub skipped: Vec<String>,
    pub failures: Vec<(String, String)>,
}

impl TeardownReport {
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "services deleted: {}, triggers deleted: {}, skipped: {}, failed: {}",
            self.deleted_services.len(),
            self.deleted_triggers.len(),
            self.skipped.len(),
            self.failures.len()
        )
    }
}

/// Delete every manifest service found in the index, its listed triggers first.
/// Missing entities are skipped; a failed delete is recorded and the pass continues.
pub async fn tear_down(platform: &dyn Platform, index: &mut ProjectIndex, entries: &[ServiceManifestEntry]) -> TeardownReport {
    let t0 = Instant::now();
    let mut report = TeardownReport::default();
    for entry in entries {
        let service_id = match index.service(&entry.name) {
            Ok(Some(s)) => s.id.clone(),
            Ok(None) => {
                report.skipped.push(entry.name.clone());
                continue;
            }
            Err(e) => {
                report.failures.push((entry.name.clone(), e.to_string()));
                continue;
            }
        };

        for spec in &entry.triggers {
            let label = format!("{}/{}", entry.name, spec.name);
            let trigger_id = match index.trigger_for(&service_id, &spec.name) {
                Ok(Some(t)) => t.id.clone(),
                Ok(None) => {
                    report.skipped.push(label);
                    continue;
                }
                Err(e) => {
                    report.failures.push((label, e.to_string()));
                    continue;
                }
            };
            match delete_one(platform, &Resource::Triggers, &trigger_id).await {
                Ok(true) => {
                    index.remove_trigger(&trigger_id);
                    report.deleted_triggers.push(label);
                }
                Ok(false) => {
                    index.remove_trigger(&trigger_id);
                    report.skipped.push(label);
                }
                Err(e) => {
                    warn!(trigger = %label, error = %e, "teardown: trigger delete failed");
                    report.failures.push((label, e.to_string()));
                }
            }
        }

        match delete_one(platform, &Resource::Services, &service_id).await {
            Ok(true) => {
                index.remove_service(&service_id);
                report.deleted_services.push(entry.name.clone());
            }
            Ok(false) => {
                index.remove_service(&service_id);
                report.skipped.push(entry.name.clone());
            }
            Err(e) => {
                warn!(service = %entry.name, error = %e, "teardown: service delete failed");
                report.failures.push((entry.name.clone(), e.to_string()));
            }
        }
    }
    counter!("teardown_deleted_total", (report.deleted_services.len() + report.deleted_triggers.len()) as u64);
    info!(summary = %report.summary(), took_ms = %t0.elapsed().as_millis(), "teardown: done");
    report
}

/// `Ok(false)` when the entity was already gone.
async fn delete_one(platform: &dyn Platform, resource: &Resource, id: &str) -> DloopResult<bool> {
    match platform.delete(resource, id).await {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}
