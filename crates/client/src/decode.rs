//! Parallel JSON-to-entity conversion for listing responses.

use std::sync::Arc;

use dloop_core::Json;
use metrics::counter;
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Decode `items` on at most `workers` blocking tasks at a time.
///
/// Items that fail to decode are logged and dropped; the batch never aborts.
/// Output order is completion order, not input order.
pub async fn decode_entities<T>(items: Vec<Json>, workers: usize) -> Vec<T>
where
    T: DeserializeOwned + Send + 'static,
{
    let total = items.len();
    let sem = Arc::new(Semaphore::new(workers.max(1)));
    let mut set: JoinSet<(usize, Result<T, serde_json::Error>)> = JoinSet::new();
    for (idx, raw) in items.into_iter().enumerate() {
        let Ok(permit) = Arc::clone(&sem).acquire_owned().await else {
            break;
        };
        set.spawn_blocking(move || {
            let _permit = permit;
            (idx, serde_json::from_value::<T>(raw))
        });
    }
    let mut out = Vec::with_capacity(total);
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((_, Ok(v))) => out.push(v),
            Ok((idx, Err(e))) => {
                counter!("decode_dropped_total", 1u64);
                warn!(index = idx, error = %e, "dropping entity that failed to decode");
            }
            Err(e) => {
                counter!("decode_dropped_total", 1u64);
                warn!(error = %e, "decode task failed");
            }
        }
    }
    debug!(total, decoded = out.len(), "decoded listing batch");
    out
}
