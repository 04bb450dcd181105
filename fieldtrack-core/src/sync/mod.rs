//! Reconciliation of the local sample log with the attendance service.
//!
//! ## Architecture
//!
//! The sync path follows a "local-first" principle:
//! - Samples are always stored in the local SQLite database first
//! - Flushing to the service happens on a timer, on demand, or from host
//!   lifecycle hooks
//! - Network failures never block sampling; unsynced records stay in the
//!   store and are retried by the next flush
//!
//! ## Usage
//!
//! Enable the service in `~/.config/fieldtrack/config.toml`:
//!
//! ```toml
//! [remote]
//! enabled = true
//! server_url = "https://erp.example.com"
//! api_key = "xxxxxxxxxxxx"
//! ```

pub mod client;
pub mod engine;
pub mod record;

use std::future::Future;
use std::sync::Arc;

use crate::error::Result;

pub use client::HttpRemote;
pub use engine::{FlushReport, SyncEngine, SyncStats};
pub use record::{PushStatus, SyncRecord};

/// Receiver of synced records, one call per record.
///
/// Return `Ok` with the service's verdict, or `Err` when the service could
/// not be reached; transient errors are retried by the engine.
pub trait RemoteEndpoint: Send + Sync + 'static {
    fn push(&self, record: &SyncRecord) -> impl Future<Output = Result<PushStatus>> + Send;
}

impl<T: RemoteEndpoint> RemoteEndpoint for Arc<T> {
    fn push(&self, record: &SyncRecord) -> impl Future<Output = Result<PushStatus>> + Send {
        (**self).push(record)
    }
}
