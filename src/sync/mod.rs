//! Replay of queued mutations and the state published about it.

mod connectivity;
mod engine;
mod service;
mod state;

pub use connectivity::{probe_once, spawn_probe, Connectivity, ProbeOptions};
pub use engine::{ReplayOutcome, ReplayPolicy, SyncEngine};
pub use service::{ServiceOptions, SyncService};
pub use state::{publish_counts, StatePublisher, Subscription, SyncState, SyncStatus};
