//! Local sample store
//!
//! This module provides the durable log of accepted samples using SQLite with:
//! - Schema migrations
//! - Keyed access by capture time
//! - Lazy, restartable iteration over unsynced records

pub mod repo;
pub mod schema;

pub use repo::{LocalStore, StoreStats, UnsyncedCursor, UnsyncedRecord};
