//! dloop ops: imperative service operations.
//! Paged log streaming (lazy or pumped into a bounded channel) and executions.

#![forbid(unsafe_code)]

use dloop_core::DloopResult;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

pub mod exec;
pub mod logs;

pub use exec::{execute, ExecutionInput, ExecutionRequest};
pub use logs::{default_start, follow_logs, format_entry, log_stream, LogCursor, LogQuery};

/// A single formatted log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogChunk {
    pub line: String,
}

/// Cancellation handle for an in-flight operation.
#[derive(Debug)]
pub struct CancelHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    pub fn cancel(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Result of starting a streaming operation.
pub struct StreamHandle<T> {
    pub rx: mpsc::Receiver<T>,
    pub cancel: CancelHandle,
}

pub(crate) fn channel<T>(cap: usize) -> (mpsc::Sender<T>, StreamHandle<T>, oneshot::Receiver<()>) {
    let (tx, rx) = mpsc::channel::<T>(cap.max(1));
    let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
    (tx, StreamHandle { rx, cancel: CancelHandle { tx: Some(cancel_tx) } }, cancel_rx)
}

/// Forward lines into a bounded channel until the stream ends, errors, the
/// receiver goes away, or cancel fires. An error is forwarded once, then the pump stops.
pub(crate) async fn pump_lines<S>(stream: S, tx: mpsc::Sender<DloopResult<LogChunk>>, mut cancel_rx: oneshot::Receiver<()>, ctx: &str)
where
    S: Stream<Item = DloopResult<String>>,
{
    let stream = stream.fuse();
    futures::pin_mut!(stream);
    let mut sent = 0usize;
    loop {
        tokio::select! {
            _ = &mut cancel_rx => { info!(ctx = %ctx, "log pump cancelled"); break; }
            next = stream.next() => {
                match next {
                    Some(Ok(line)) => {
                        if tx.send(Ok(LogChunk { line })).await.is_err() { break; }
                        sent += 1;
                    }
                    Some(Err(e)) => {
                        warn!(ctx = %ctx, error = %e, "log stream error");
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                    None => break,
                }
            }
        }
    }
    info!(ctx = %ctx, lines = sent, "log pump ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use dloop_core::DloopError;
    use futures::stream;

    #[tokio::test]
    async fn pump_forwards_lines_in_order() {
        let (tx, mut handle, cancel_rx) = channel::<DloopResult<LogChunk>>(16);
        let s = stream::iter(vec![Ok("a".to_string()), Ok("b".to_string()), Ok("c".to_string())]);
        pump_lines(s, tx, cancel_rx, "test").await;
        let mut out = Vec::new();
        while let Some(Ok(c)) = handle.rx.recv().await {
            out.push(c.line);
        }
        assert_eq!(out, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn pump_forwards_error_then_stops() {
        let (tx, mut handle, cancel_rx) = channel::<DloopResult<LogChunk>>(16);
        let s = stream::iter(vec![
            Ok("a".to_string()),
            Err(DloopError::remote(500, "boom")),
            Ok("never".to_string()),
        ]);
        pump_lines(s, tx, cancel_rx, "err-test").await;
        assert_eq!(handle.rx.recv().await, Some(Ok(LogChunk { line: "a".into() })));
        assert_eq!(handle.rx.recv().await, Some(Err(DloopError::remote(500, "boom"))));
        assert_eq!(handle.rx.recv().await, None);
    }

    #[tokio::test]
    async fn cancel_stops_pump_quickly() {
        let (tx, mut handle, cancel_rx) = channel::<DloopResult<LogChunk>>(16);
        let s = async_stream::stream! {
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                yield Ok::<String, DloopError>("line".to_string());
            }
        };
        let join = tokio::spawn(async move { pump_lines(s, tx, cancel_rx, "cancel-test").await });
        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        handle.cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), join).await.expect("pump did not stop").unwrap();
        let _ = tokio::time::timeout(std::time::Duration::from_millis(50), handle.rx.recv()).await;
    }
}
