//! # fieldtrack-core
//!
//! Core library for fieldtrack - GPS tracking of field agents during their
//! attendance periods.
//!
//! This library provides:
//! - Domain types for samples and sessions
//! - The sample filter and spatial cluster index that decide what is kept
//! - A durable local store with SQLite
//! - A sync engine that reconciles the store with the attendance service
//! - The tracking session state machine driving sampling and sync timers
//! - Route thinning and statistics for display
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! Samples flow through three stages:
//! - **Capture:** a position fix passes the filter and is appended to the store
//! - **Store:** SQLite is the source of truth; every sample starts unsynced
//! - **Sync:** unsynced samples are pushed oldest first and marked synced
//!   once the service confirms them
//!
//! ## Example
//!
//! ```rust,no_run
//! use fieldtrack_core::{Config, LocalStore};
//!
//! // Load configuration
//! let config = Config::load().expect("failed to load config");
//!
//! // Open the sample store
//! let store = LocalStore::open(&Config::database_path()).expect("failed to open store");
//! println!("{} samples waiting to sync", store.count_unsynced().unwrap_or(0));
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use db::{LocalStore, StoreStats};
pub use error::{Error, ProviderError, Result};
pub use session::{TrackingEvent, TrackingService};
pub use sync::{FlushReport, HttpRemote, SyncEngine};
pub use types::*;

// Public modules
pub mod config;
pub mod db;
pub mod display;
pub mod error;
pub mod geo;
pub mod logging;
pub mod session;
pub mod sync;
pub mod tracking;
pub mod types;
