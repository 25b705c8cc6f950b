//! Checkpoint-driven service log pages as a lazy stream of formatted lines.

use std::sync::Arc;

use dloop_client::Platform;
use dloop_core::{DloopResult, Json};
use futures::Stream;
use metrics::counter;
use serde_json::json;
use tracing::{debug, info};

use crate::{channel, pump_lines, LogChunk, StreamHandle};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogQuery {
    pub size: Option<u32>,
    pub checkpoint: Option<Json>,
    /// ISO timestamp; today at 00:00:00 local time when absent.
    pub start: Option<String>,
    pub end: Option<String>,
}

/// Position in the remote log, carried between page fetches.
#[derive(Debug, Clone, PartialEq)]
pub struct LogCursor {
    pub checkpoint: Option<Json>,
    pub start: String,
    pub stop: bool,
}

impl LogCursor {
    pub fn new(q: &LogQuery) -> Self {
        Self { checkpoint: q.checkpoint.clone(), start: q.start.clone().unwrap_or_else(default_start), stop: false }
    }

    pub fn request_body(&self, q: &LogQuery) -> Json {
        let mut body = json!({"direction": "asc", "start": self.start});
        if let Some(obj) = body.as_object_mut() {
            if let Some(size) = q.size {
                obj.insert("size".into(), json!(size));
            }
            if let Some(cp) = self.checkpoint.as_ref().filter(|c| !c.is_null()) {
                obj.insert("checkpoint".into(), cp.clone());
            }
            if let Some(end) = &q.end {
                obj.insert("end".into(), json!(end));
            }
        }
        body
    }

    /// Take `checkpoint`/`stop` from a response page.
    pub fn advance(&mut self, page: &Json) {
        self.checkpoint = page.get("checkpoint").cloned().filter(|c| !c.is_null());
        self.stop = page.get("stop").and_then(|v| v.as_bool()).unwrap_or(false);
    }
}

/// Midnight today, local time, without offset: `2024-05-01T00:00:00`.
pub fn default_start() -> String {
    chrono::Local::now().date_naive().format("%Y-%m-%dT00:00:00").to_string()
}

/// `"<timestamp>: <message>"`; the timestamp falls back to the query start.
pub fn format_entry(entry: &Json, start: &str) -> String {
    let ts = entry.get("timestamp").and_then(|v| v.as_str()).unwrap_or(start);
    let msg = entry.get("message").and_then(|v| v.as_str()).unwrap_or("");
    format!("{}: {}", ts, msg)
}

/// Lazy line stream. One page is fetched per pull; the stream ends after
/// yielding the page on which the server reports `stop`.
pub fn log_stream(platform: Arc<dyn Platform>, service_id: String, q: LogQuery) -> impl Stream<Item = DloopResult<String>> + Send {
    async_stream::try_stream! {
        let mut cursor = LogCursor::new(&q);
        let mut pages = 0usize;
        loop {
            let body = cursor.request_body(&q);
            let page = platform.service_logs(&service_id, &body).await?;
            pages += 1;
            counter!("logs_pages_total", 1u64);
            let lines: Vec<String> = page
                .get("logs")
                .and_then(|v| v.as_array())
                .map(|entries| entries.iter().map(|e| format_entry(e, &cursor.start)).collect())
                .unwrap_or_default();
            debug!(service = %service_id, page = pages, lines = lines.len(), "logs: page fetched");
            for line in lines {
                yield line;
            }
            cursor.advance(&page);
            if cursor.stop {
                break;
            }
        }
    }
}

/// Spawn a pump that forwards [`log_stream`] into a bounded channel (`DLOOP_LOGS_QUEUE_CAP`).
pub fn follow_logs(platform: Arc<dyn Platform>, service_id: &str, q: LogQuery) -> StreamHandle<DloopResult<LogChunk>> {
    let cap = std::env::var("DLOOP_LOGS_QUEUE_CAP").ok().and_then(|s| s.parse().ok()).unwrap_or(1024);
    let (tx, handle, cancel_rx) = channel::<DloopResult<LogChunk>>(cap);
    let id = service_id.to_string();
    tokio::spawn(async move {
        info!(service = %id, start = ?q.start, size = ?q.size, "logs stream starting");
        let stream = log_stream(platform, id.clone(), q);
        pump_lines(stream, tx, cancel_rx, &id).await;
    });
    handle
}
