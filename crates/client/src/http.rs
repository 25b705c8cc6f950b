//! REST implementation of [`Platform`] on top of `reqwest`.

use std::time::Instant;

use dloop_core::{DloopError, DloopResult, Json};
use metrics::{counter, histogram};
use reqwest::Method;
use tracing::debug;

use crate::{ClientConfig, ListQuery, Page, Platform, Resource};

pub struct HttpPlatform {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpPlatform {
    pub fn new(cfg: &ClientConfig) -> DloopResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| DloopError::internal(format!("building http client: {}", e)))?;
        Ok(Self { http, base_url: cfg.base_url.trim_end_matches('/').to_string(), token: cfg.token.clone() })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, self.url(path));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req.header("Accept", "application/json")
    }

    async fn send(&self, req: reqwest::RequestBuilder, what: &str) -> DloopResult<Json> {
        let t0 = Instant::now();
        let resp = req
            .send()
            .await
            .map_err(|e| DloopError::internal(format!("{}: failed to reach platform: {}", what, e)))?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        histogram!("http_request_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(%what, status = status.as_u16(), took_ms = %t0.elapsed().as_millis(), "platform call");
        if !status.is_success() {
            counter!("http_error_total", 1u64);
            return Err(DloopError::remote(status.as_u16(), error_message(&body)));
        }
        if body.trim().is_empty() {
            return Ok(Json::Null);
        }
        serde_json::from_str(&body).map_err(|e| DloopError::Parse(format!("{}: response is not JSON: {}", what, e)))
    }
}

/// Prefer the platform's `message` field, fall back to the raw body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Json>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(|s| s.to_string()))
        .unwrap_or_else(|| body.to_string())
}

#[async_trait::async_trait]
impl Platform for HttpPlatform {
    async fn list(&self, resource: &Resource, query: &ListQuery) -> DloopResult<Page> {
        let path = resource.path();
        let req = self.request(Method::GET, &path).query(&query.to_params());
        let v = self.send(req, &format!("GET {}", path)).await?;
        Page::from_response(v)
    }

    async fn get(&self, resource: &Resource, id: &str) -> DloopResult<Json> {
        let path = format!("{}/{}", resource.path(), id);
        self.send(self.request(Method::GET, &path), &format!("GET {}", path)).await
    }

    async fn create(&self, resource: &Resource, body: &Json) -> DloopResult<Json> {
        let path = resource.path();
        self.send(self.request(Method::POST, &path).json(body), &format!("POST {}", path)).await
    }

    async fn update(&self, resource: &Resource, id: &str, body: &Json) -> DloopResult<Json> {
        let path = format!("{}/{}", resource.path(), id);
        self.send(self.request(Method::PATCH, &path).json(body), &format!("PATCH {}", path)).await
    }

    async fn delete(&self, resource: &Resource, id: &str) -> DloopResult<()> {
        let path = format!("{}/{}", resource.path(), id);
        self.send(self.request(Method::DELETE, &path), &format!("DELETE {}", path)).await.map(|_| ())
    }

    async fn service_status(&self, service_id: &str) -> DloopResult<Json> {
        let path = format!("/services/{}/status", service_id);
        self.send(self.request(Method::GET, &path), &format!("GET {}", path)).await
    }

    async fn service_logs(&self, service_id: &str, body: &Json) -> DloopResult<Json> {
        let path = format!("/services/{}/logs", service_id);
        self.send(self.request(Method::POST, &path).json(body), &format!("POST {}", path)).await
    }

    async fn execute(&self, body: &Json, sync: bool) -> DloopResult<Json> {
        let path = Resource::Executions.path();
        let mut req = self.request(Method::POST, &path).json(body);
        if sync {
            req = req.query(&[("sync", "true")]);
        }
        self.send(req, &format!("POST {}", path)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let cfg = ClientConfig::default().with_base_url("https://example.test/api/v1/");
        let p = HttpPlatform::new(&cfg).unwrap();
        assert_eq!(p.url("/services"), "https://example.test/api/v1/services");
    }

    #[test]
    fn error_message_prefers_message_field() {
        assert_eq!(error_message(r#"{"message":"Service not found","status":404}"#), "Service not found");
        assert_eq!(error_message("plain failure"), "plain failure");
    }
}
