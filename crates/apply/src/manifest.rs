//! Service manifests (`service.json`): single-service and pipeline forms.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use dloop_core::{
    DloopError, DloopResult, ExecutionMode, Json, JsonMap, TriggerResource, DEFAULT_FUNCTION_NAME,
    DEFAULT_MODULE_NAME, DEFAULT_SERVICE_NAME,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::snapshot::ProjectIndex;

pub const SERVICE_FILENAME: &str = "service.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerSpec {
    pub name: String,
    pub resource: TriggerResource,
    #[serde(default, alias = "filters", skip_serializing_if = "Option::is_none")]
    pub filter: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_mode: Option<ExecutionMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
}

/// One entry of the pipeline form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceManifestEntry {
    pub name: String,
    pub package: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_params: Option<JsonMap>,
    #[serde(default, rename = "module_name", alias = "moduleName", skip_serializing_if = "Option::is_none")]
    pub module_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub versions: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<bool>,
    /// Bot email overriding the run-wide bot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot: Option<String>,
    #[serde(default)]
    pub triggers: Vec<TriggerSpec>,
}

impl ServiceManifestEntry {
    pub fn new(name: impl Into<String>, package: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            package: package.into(),
            runtime: None,
            init_params: None,
            module_name: None,
            driver_id: None,
            revision: None,
            versions: None,
            version: None,
            verify: None,
            bot: None,
            triggers: Vec::new(),
        }
    }
}

/// The single-service form read by `deploy_from_local_folder`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleServiceManifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_params: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub versions: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<bool>,
    #[serde(default, rename = "module_name", alias = "moduleName", skip_serializing_if = "Option::is_none")]
    pub module_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot: Option<String>,
    #[serde(default)]
    pub triggers: Vec<TriggerSpec>,
}

impl SingleServiceManifest {
    /// Resolve the package against the project and produce a pipeline entry.
    ///
    /// Without `packageName` the project must hold exactly one package.
    /// `revision` falls back to that package's version.
    pub fn into_entry(self, index: &ProjectIndex) -> DloopResult<ServiceManifestEntry> {
        let package = match self.package_name.as_deref() {
            Some(name) => index.package(name)?,
            None => index.sole_package()?,
        };
        let revision = self.revision.or_else(|| package.version.clone());
        Ok(ServiceManifestEntry {
            name: self.name.unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string()),
            package: package.name.clone(),
            runtime: self.runtime,
            init_params: self.init_params,
            module_name: self.module_name,
            driver_id: self.driver_id,
            revision,
            versions: self.versions,
            version: self.version,
            verify: self.verify,
            bot: self.bot,
            triggers: self.triggers,
        })
    }

    /// Entry naming only what tear-down matches on: the service and its triggers.
    /// The package is not resolved, so a service whose package is gone can still be removed.
    pub fn teardown_entry(self) -> ServiceManifestEntry {
        let name = self.name.unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string());
        let mut entry = ServiceManifestEntry::new(name, self.package_name.unwrap_or_default());
        entry.triggers = self.triggers;
        entry
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Manifest {
    Single(SingleServiceManifest),
    Pipeline(Vec<ServiceManifestEntry>),
}

impl Manifest {
    pub fn from_json(v: Json) -> DloopResult<Self> {
        let m = match v {
            Json::Object(_) => Manifest::Single(serde_json::from_value(v).map_err(shape_error)?),
            Json::Array(_) => Manifest::Pipeline(serde_json::from_value(v).map_err(shape_error)?),
            _ => return Err(DloopError::validation("manifest must be a JSON object or array")),
        };
        m.validate()?;
        Ok(m)
    }

    pub fn parse(text: &str) -> DloopResult<Self> {
        let v: Json = serde_json::from_str(text).map_err(|e| DloopError::Parse(e.to_string()))?;
        Self::from_json(v)
    }

    pub fn validate(&self) -> DloopResult<()> {
        match self {
            Manifest::Single(s) => {
                if s.name.as_deref() == Some("") {
                    return Err(DloopError::validation("service name must not be empty"));
                }
                validate_triggers(s.name.as_deref().unwrap_or(DEFAULT_SERVICE_NAME), &s.triggers)
            }
            Manifest::Pipeline(entries) => {
                let mut seen = HashSet::new();
                for e in entries {
                    if e.name.is_empty() {
                        return Err(DloopError::validation("service name must not be empty"));
                    }
                    if e.package.is_empty() {
                        return Err(DloopError::validation(format!("service {}: package must not be empty", e.name)));
                    }
                    if !seen.insert(e.name.as_str()) {
                        return Err(DloopError::validation(format!("duplicate service name in manifest: {}", e.name)));
                    }
                    validate_triggers(&e.name, &e.triggers)?;
                }
                Ok(())
            }
        }
    }

    /// Entries for the pipeline form; the single form needs the project to resolve its package.
    pub fn into_entries(self, index: &ProjectIndex) -> DloopResult<Vec<ServiceManifestEntry>> {
        match self {
            Manifest::Single(s) => Ok(vec![s.into_entry(index)?]),
            Manifest::Pipeline(entries) => Ok(entries),
        }
    }

    /// Entries for tear-down; needs no remote state.
    pub fn into_teardown_entries(self) -> Vec<ServiceManifestEntry> {
        match self {
            Manifest::Single(s) => vec![s.teardown_entry()],
            Manifest::Pipeline(entries) => entries,
        }
    }
}

fn validate_triggers(service: &str, triggers: &[TriggerSpec]) -> DloopResult<()> {
    let mut seen = HashSet::new();
    for t in triggers {
        if t.name.is_empty() {
            return Err(DloopError::validation(format!("service {}: trigger name must not be empty", service)));
        }
        if !seen.insert(t.name.as_str()) {
            return Err(DloopError::validation(format!("service {}: duplicate trigger name {}", service, t.name)));
        }
    }
    Ok(())
}

// The document is known to be JSON here, so any failure is a shape problem.
fn shape_error(e: serde_json::Error) -> DloopError {
    DloopError::validation(format!("invalid manifest: {}", e))
}

/// A directory resolves to `<dir>/service.json`.
pub fn resolve_manifest_path(path: &Path) -> DloopResult<PathBuf> {
    let resolved = if path.is_dir() { path.join(SERVICE_FILENAME) } else { path.to_path_buf() };
    if !resolved.is_file() {
        return Err(DloopError::not_found(format!("File not exist: {}", resolved.display())));
    }
    Ok(resolved)
}

pub fn load_manifest(path: &Path) -> DloopResult<Manifest> {
    let resolved = resolve_manifest_path(path)?;
    let meta = std::fs::metadata(&resolved)
        .map_err(|e| DloopError::internal(format!("reading {}: {}", resolved.display(), e)))?;
    if meta.len() as usize > crate::max_manifest_bytes() {
        return Err(DloopError::validation(format!(
            "manifest too large (>{} bytes): {}",
            crate::max_manifest_bytes(),
            resolved.display()
        )));
    }
    let text = std::fs::read_to_string(&resolved)
        .map_err(|e| DloopError::internal(format!("reading {}: {}", resolved.display(), e)))?;
    let m = Manifest::parse(&text)?;
    debug!(path = %resolved.display(), "manifest loaded");
    Ok(m)
}

pub fn template() -> Json {
    json!({
        "name": DEFAULT_SERVICE_NAME,
        "packageName": "default-package",
        "initParams": {},
        "runtime": {"gpu": false, "numReplicas": 1},
        "verify": true,
        "module_name": DEFAULT_MODULE_NAME,
        "triggers": [{
            "name": "default-trigger",
            "resource": "Item",
            "filter": {},
            "actions": ["Created"],
            "active": true,
            "executionMode": "Once",
            "function": DEFAULT_FUNCTION_NAME
        }]
    })
}

/// Write the default single-service manifest to `<dir>/service.json`.
pub fn write_template(dir: &Path) -> DloopResult<PathBuf> {
    let path = dir.join(SERVICE_FILENAME);
    let text = serde_json::to_string_pretty(&template()).map_err(|e| DloopError::internal(e.to_string()))?;
    std::fs::write(&path, text).map_err(|e| DloopError::internal(format!("writing {}: {}", path.display(), e)))?;
    Ok(path)
}
