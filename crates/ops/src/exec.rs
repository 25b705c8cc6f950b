use std::time::Instant;

use dloop_client::{decode_one, Platform};
use dloop_core::{DloopResult, Execution, Json, TriggerResource, DEFAULT_FUNCTION_NAME};
use metrics::counter;
use serde_json::json;
use tracing::info;

/// What an execution runs on.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionInput {
    None,
    Raw(Json),
    Item(String),
    Dataset(String),
    Annotation(String),
}

impl ExecutionInput {
    /// Shortcut used by `exec --resource item --id ...`.
    pub fn for_resource(resource: TriggerResource, id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        match resource {
            TriggerResource::Item => Some(Self::Item(id)),
            TriggerResource::Dataset => Some(Self::Dataset(id)),
            TriggerResource::Annotation => Some(Self::Annotation(id)),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Json {
        match self {
            Self::None => json!({}),
            Self::Raw(v) => v.clone(),
            Self::Item(id) => json!({"item": {"item_id": id}}),
            Self::Dataset(id) => json!({"dataset": {"dataset_id": id}}),
            Self::Annotation(id) => json!({"annotation": {"annotation_id": id}}),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    pub service_id: String,
    pub function_name: Option<String>,
    pub input: ExecutionInput,
    pub sync: bool,
}

impl ExecutionRequest {
    pub fn new(service_id: impl Into<String>) -> Self {
        Self { service_id: service_id.into(), function_name: None, input: ExecutionInput::None, sync: false }
    }

    pub fn body(&self) -> Json {
        json!({
            "serviceId": self.service_id,
            "functionName": self.function_name.as_deref().unwrap_or(DEFAULT_FUNCTION_NAME),
            "input": self.input.to_json(),
        })
    }
}

pub async fn execute(platform: &dyn Platform, req: &ExecutionRequest) -> DloopResult<Execution> {
    let t0 = Instant::now();
    let raw = platform.execute(&req.body(), req.sync).await?;
    let execution: Execution = decode_one(raw)?;
    counter!("executions_created_total", 1u64);
    info!(service = %req.service_id, execution = %execution.id, sync = req.sync, took_ms = %t0.elapsed().as_millis(), "exec: ok");
    Ok(execution)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dloop_client::MockPlatform;

    #[test]
    fn resource_shortcuts_build_nested_input() {
        let item = ExecutionInput::for_resource(TriggerResource::Item, "i1").unwrap();
        assert_eq!(item.to_json(), json!({"item": {"item_id": "i1"}}));
        let ds = ExecutionInput::for_resource(TriggerResource::Dataset, "d1").unwrap();
        assert_eq!(ds.to_json(), json!({"dataset": {"dataset_id": "d1"}}));
        let ann = ExecutionInput::for_resource(TriggerResource::Annotation, "a1").unwrap();
        assert_eq!(ann.to_json(), json!({"annotation": {"annotation_id": "a1"}}));
        assert!(ExecutionInput::for_resource(TriggerResource::Task, "t").is_none());
    }

    #[tokio::test]
    async fn sync_execute_hits_sync_endpoint() {
        let m = MockPlatform::new();
        let mut req = ExecutionRequest::new("s1");
        req.input = ExecutionInput::Item("i1".into());
        req.sync = true;
        let ex = execute(&m, &req).await.unwrap();
        assert_eq!(ex.service_id.as_deref(), Some("s1"));
        assert_eq!(ex.function_name.as_deref(), Some("run"));
        assert_eq!(ex.input, json!({"item": {"item_id": "i1"}}));
        assert_eq!(m.calls(), vec!["POST /executions?sync=true".to_string()]);
    }
}
