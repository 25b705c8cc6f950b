//! dloop client: the platform collaborator interface and its implementations.
//!
//! [`Platform`] is the seam every higher crate talks through. [`HttpPlatform`]
//! speaks the REST API; [`MockPlatform`] keeps everything in memory for tests.

#![forbid(unsafe_code)]

use dloop_core::{DloopError, DloopResult, Json};
use serde::de::DeserializeOwned;
use tracing::warn;

pub mod config;
pub mod decode;
pub mod http;
pub mod mock;

pub use config::ClientConfig;
pub use decode::decode_entities;
pub use http::HttpPlatform;
pub use mock::MockPlatform;

/// Remote collections the SDK addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Resource {
    Projects,
    Packages,
    Services,
    Triggers,
    Executions,
    Bots { project_id: String },
}

impl Resource {
    /// Collection path relative to the API base.
    pub fn path(&self) -> String {
        match self {
            Resource::Bots { project_id } => format!("/projects/{}/bots", project_id),
            other => format!("/{}", other.collection()),
        }
    }

    pub fn collection(&self) -> &'static str {
        match self {
            Resource::Projects => "projects",
            Resource::Packages => "packages",
            Resource::Services => "services",
            Resource::Triggers => "triggers",
            Resource::Executions => "executions",
            Resource::Bots { .. } => "bots",
        }
    }
}

/// Filters and paging for a listing call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub project_id: Option<String>,
    pub name: Option<String>,
    pub package_id: Option<String>,
    pub page_offset: u32,
    pub page_size: u32,
}

impl ListQuery {
    pub fn new(page_size: u32) -> Self {
        Self { page_size: page_size.max(1), ..Default::default() }
    }

    pub fn project(mut self, id: impl Into<String>) -> Self { self.project_id = Some(id.into()); self }
    pub fn name(mut self, name: impl Into<String>) -> Self { self.name = Some(name.into()); self }
    pub fn package(mut self, id: impl Into<String>) -> Self { self.package_id = Some(id.into()); self }

    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        if let Some(p) = &self.project_id { out.push(("projects".to_string(), p.clone())); }
        if let Some(n) = &self.name { out.push(("name".to_string(), n.clone())); }
        if let Some(p) = &self.package_id { out.push(("packageId".to_string(), p.clone())); }
        out.push(("pageOffset".to_string(), self.page_offset.to_string()));
        out.push(("pageSize".to_string(), self.page_size.to_string()));
        out
    }
}

/// One page of a listing response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub items: Vec<Json>,
    pub has_next_page: bool,
    pub total: Option<u64>,
}

impl Page {
    /// Accepts `{items, hasNextPage, totalItemsCount}` or a bare array.
    pub fn from_response(v: Json) -> DloopResult<Self> {
        match v {
            Json::Array(items) => Ok(Page { total: Some(items.len() as u64), items, has_next_page: false }),
            Json::Object(mut obj) => {
                let items = match obj.remove("items") {
                    Some(Json::Array(a)) => a,
                    _ => return Err(DloopError::internal("listing response missing items array")),
                };
                let has_next_page = obj.get("hasNextPage").and_then(|v| v.as_bool()).unwrap_or(false);
                let total = obj.get("totalItemsCount").and_then(|v| v.as_u64());
                Ok(Page { items, has_next_page, total })
            }
            _ => Err(DloopError::internal("listing response is neither object nor array")),
        }
    }
}

/// Platform operations consumed by the SDK.
#[async_trait::async_trait]
pub trait Platform: Send + Sync {
    async fn list(&self, resource: &Resource, query: &ListQuery) -> DloopResult<Page>;

    async fn get(&self, resource: &Resource, id: &str) -> DloopResult<Json>;

    async fn create(&self, resource: &Resource, body: &Json) -> DloopResult<Json>;

    /// Partial update: only keys present in `body` change remotely.
    async fn update(&self, resource: &Resource, id: &str, body: &Json) -> DloopResult<Json>;

    async fn delete(&self, resource: &Resource, id: &str) -> DloopResult<()>;

    async fn service_status(&self, service_id: &str) -> DloopResult<Json>;

    /// Fetch one page of service logs; `body` carries direction/start/checkpoint.
    async fn service_logs(&self, service_id: &str, body: &Json) -> DloopResult<Json>;

    async fn execute(&self, body: &Json, sync: bool) -> DloopResult<Json>;
}

/// Follow `hasNextPage` until the listing is exhausted.
pub async fn drain_pages(platform: &dyn Platform, resource: &Resource, query: &ListQuery) -> DloopResult<Vec<Json>> {
    let mut q = query.clone();
    let mut out = Vec::new();
    loop {
        let page = platform.list(resource, &q).await?;
        let n = page.items.len();
        out.extend(page.items);
        if !page.has_next_page {
            break;
        }
        if n == 0 {
            warn!(collection = resource.collection(), offset = q.page_offset, "empty page claims more pages; stopping");
            break;
        }
        q.page_offset += 1;
    }
    Ok(out)
}

/// Drain all pages and decode items on the worker pool. Undecodable items are dropped.
pub async fn list_all<T>(platform: &dyn Platform, resource: &Resource, query: &ListQuery, workers: usize) -> DloopResult<Vec<T>>
where
    T: DeserializeOwned + Send + 'static,
{
    let raw = drain_pages(platform, resource, query).await?;
    Ok(decode_entities(raw, workers).await)
}

/// Decode a single response body; a shape mismatch here is a server contract breach.
pub fn decode_one<T: DeserializeOwned>(v: Json) -> DloopResult<T> {
    serde_json::from_value(v).map_err(|e| DloopError::internal(format!("unexpected response shape: {}", e)))
}
