//! dloop apply: manifest loading and create-or-update reconciliation of services and triggers.
//!
//! Flow: [`load_manifest`] → [`ProjectIndex::fetch`] → [`Reconciler::run`] (or [`tear_down`]).
//! The index is fetched once per run and updated in memory as the reconciler applies
//! changes, so later entries see earlier results without re-listing.

#![forbid(unsafe_code)]

pub mod manifest;
pub mod reconcile;
pub mod snapshot;
pub mod teardown;

pub use manifest::{
    load_manifest, resolve_manifest_path, write_template, Manifest, ServiceManifestEntry,
    SingleServiceManifest, TriggerSpec, SERVICE_FILENAME,
};
pub use reconcile::{BotResolver, EntryReport, Outcome, ReconcileReport, Reconciler, TriggerReport};
pub use snapshot::ProjectIndex;
pub use teardown::{tear_down, TeardownReport};

/// Version reported in `versions.dtlpy` when a manifest does not pin one.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

pub(crate) fn max_manifest_bytes() -> usize {
    std::env::var("DLOOP_MAX_MANIFEST_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000)
}
