pub mod config;
pub mod decode;
pub mod engine;
pub mod error;
pub mod feed;
pub mod plugin;
pub mod reconcile;
pub mod store;

pub use engine::{EngineSettings, SyncEngine, SyncFailure, SyncReport, SyncState};
pub use error::{DecodeError, FetchError, ReconcileError, StoreError, SyncError, UsageError};
pub use plugin::{Plugin, Severity};
