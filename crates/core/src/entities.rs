//! Typed mirrors of platform JSON.
//!
//! Every entity keeps unknown remote fields in `extra` so that a value read from
//! the platform can be written back without dropping anything the SDK does not model.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{DloopError, DloopResult, Json, JsonMap};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub extra: JsonMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(flatten)]
    pub extra: JsonMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bot {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub email: String,
    #[serde(flatten)]
    pub extra: JsonMap,
}

/// Bot given either by its email or as a fetched entity.
#[derive(Debug, Clone, PartialEq)]
pub enum BotRef {
    Email(String),
    Bot(Bot),
}

impl BotRef {
    pub fn email(&self) -> &str {
        match self {
            BotRef::Email(e) => e,
            BotRef::Bot(b) => &b.email,
        }
    }
}

impl From<&str> for BotRef {
    fn from(s: &str) -> Self { BotRef::Email(s.to_string()) }
}

impl From<Bot> for BotRef {
    fn from(b: Bot) -> Self { BotRef::Bot(b) }
}

/// Input accepted either as a typed entity or as raw platform JSON.
/// Normalized once at the API boundary; nothing downstream sees the raw form.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityOrRaw<T> {
    Typed(T),
    Raw(Json),
}

impl<T: DeserializeOwned> EntityOrRaw<T> {
    pub fn normalize(self) -> DloopResult<T> {
        match self {
            EntityOrRaw::Typed(t) => Ok(t),
            EntityOrRaw::Raw(v) => serde_json::from_value(v).map_err(DloopError::from),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_revision: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_name: Option<String>,
    #[serde(default)]
    pub runtime: JsonMap,
    #[serde(default)]
    pub init_params: JsonMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub versions: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_user_name: Option<String>,
    #[serde(flatten)]
    pub extra: JsonMap,
}

impl Service {
    pub fn pod_type(&self) -> Option<&str> {
        self.runtime.get("podType").and_then(|v| v.as_str())
    }

    /// Body for a full update: everything but the id.
    pub fn to_patch(&self) -> DloopResult<Json> {
        let mut v = serde_json::to_value(self)?;
        if let Some(obj) = v.as_object_mut() {
            obj.remove("id");
        }
        Ok(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerResource {
    Item,
    Dataset,
    Annotation,
    ItemStatus,
    Task,
    Assignment,
}

impl TriggerResource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerResource::Item => "Item",
            TriggerResource::Dataset => "Dataset",
            TriggerResource::Annotation => "Annotation",
            TriggerResource::ItemStatus => "ItemStatus",
            TriggerResource::Task => "Task",
            TriggerResource::Assignment => "Assignment",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExecutionMode {
    #[default]
    Once,
    Always,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default)]
    pub filter: Json,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_mode: Option<ExecutionMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(flatten)]
    pub extra: JsonMap,
}

fn default_true() -> bool { true }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Json>,
    #[serde(default)]
    pub input: Json,
    #[serde(flatten)]
    pub extra: JsonMap,
}

/// Packaged source archive stored as a platform item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Codebase {
    pub id: String,
    pub name: String,
    pub filename: String,
    #[serde(default)]
    pub metadata: JsonMap,
}

impl Codebase {
    /// Archives are stored as `<version>.zip`.
    pub fn version(&self) -> &str {
        self.name.split('.').next().unwrap_or("")
    }

    /// Codebase name, i.e. the folder that holds the version archives.
    pub fn codebase_name(&self) -> Option<&str> {
        let mut parts = self.filename.rsplit('/');
        parts.next()?;
        parts.next().filter(|s| !s.is_empty())
    }

    pub fn md5(&self) -> Option<&str> { self.system_str("md5") }

    pub fn description(&self) -> Option<&str> { self.system_str("description") }

    pub fn set_md5(&mut self, md5: &str) { self.set_system("md5", md5) }

    pub fn set_description(&mut self, description: &str) { self.set_system("description", description) }

    fn system_str(&self, key: &str) -> Option<&str> {
        self.metadata.get("system").and_then(|s| s.get(key)).and_then(|v| v.as_str())
    }

    fn set_system(&mut self, key: &str, value: &str) {
        let system = self.metadata.entry("system").or_insert_with(|| Json::Object(JsonMap::new()));
        if !system.is_object() {
            *system = Json::Object(JsonMap::new());
        }
        if let Some(obj) = system.as_object_mut() {
            obj.insert(key.to_string(), Json::String(value.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn service_keeps_unknown_fields_through_roundtrip() {
        let raw = json!({
            "id": "s1",
            "name": "svc",
            "packageId": "p1",
            "runtime": {"gpu": false, "podType": "regular-s"},
            "initParams": {"k": 1},
            "createdAt": "2020-01-01T00:00:00Z",
            "url": "https://example/services/s1"
        });
        let svc: Service = serde_json::from_value(raw).unwrap();
        assert_eq!(svc.pod_type(), Some("regular-s"));
        assert_eq!(svc.extra.get("createdAt"), Some(&json!("2020-01-01T00:00:00Z")));
        let patch = svc.to_patch().unwrap();
        assert!(patch.get("id").is_none());
        assert_eq!(patch["url"], json!("https://example/services/s1"));
        assert_eq!(patch["initParams"], json!({"k": 1}));
    }

    #[test]
    fn trigger_defaults_to_active() {
        let t: Trigger = serde_json::from_value(json!({"id": "t", "name": "n"})).unwrap();
        assert!(t.active);
        assert!(t.actions.is_empty());
        assert_eq!(t.filter, Json::Null);
    }

    #[test]
    fn entity_or_raw_normalizes_both_forms() {
        let bot = Bot { id: "b".into(), name: "default".into(), email: "bot@x".into(), extra: JsonMap::new() };
        let typed = EntityOrRaw::Typed(bot.clone()).normalize().unwrap();
        let raw: Bot = EntityOrRaw::Raw(json!({"id": "b", "name": "default", "email": "bot@x"})).normalize().unwrap();
        assert_eq!(typed, raw);
        let bad = EntityOrRaw::<Bot>::Raw(json!({"id": "b"})).normalize().unwrap_err();
        assert!(matches!(bad, DloopError::Validation(_)));
        assert_eq!(BotRef::from(bot).email(), "bot@x");
    }

    #[test]
    fn codebase_reads_system_metadata() {
        let mut cb = Codebase {
            id: "c".into(),
            name: "3.zip".into(),
            filename: "/codebases/my-pkg/3.zip".into(),
            metadata: JsonMap::new(),
        };
        assert_eq!(cb.version(), "3");
        assert_eq!(cb.codebase_name(), Some("my-pkg"));
        assert_eq!(cb.md5(), None);
        cb.set_md5("abc");
        cb.set_description("first");
        assert_eq!(cb.md5(), Some("abc"));
        assert_eq!(cb.description(), Some("first"));
    }
}
