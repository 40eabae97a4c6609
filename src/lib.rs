//! Offline-first sync core for field asset records.

pub mod accounting;
pub mod attachments;
pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod ids;
pub mod merge;
pub mod model;
pub mod monitor;
pub mod orchestrator;
pub mod persistence;
pub mod repository;
pub mod store;

pub use engine::SyncEngine;
pub use error::{EngineError, EngineResult, GatewayError};
pub use model::{AnyEntity, EntityKind, Record, SyncState, SyncStatus, Syncable};
pub use orchestrator::{SyncMode, SyncOutcome, SyncReport};
