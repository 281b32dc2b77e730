//! # Retail Sync
//!
//! Incremental replication of retail sales rows from a transactional Postgres
//! source into an append-only analytical table, plus geographic enrichment of
//! the stores those rows mention.
//!
//! ## Overview
//!
//! - **Transfer**: checkpointed, batch-by-batch copy of rows whose key is above
//!   the sink's high-water mark, with per-row value normalization
//! - **Resilience**: bulk inserts with a row-by-row fallback that isolates bad rows
//! - **Enrichment**: one record per (chain, address, date) with geography from an
//!   external geocoder, falling back to offline address heuristics
//! - **Credential rotation**: a pool of geocoder API keys switched on quota responses
//!
//! ## Architecture
//!
//! ### Storage Layer
//! `store` defines the traits the engines depend on; `database` implements them
//! over sqlx, leasing one connection per (worker, role) from `connection_manager`.
//!
//! ### Transfer Layer
//! `transfer` drives `normalization` and `schema` conversion and hands batches to
//! `batch_writer`. Row failures go to `error_log`.
//!
//! ### Enrichment Layer
//! `enrichment` combines `geocoder`, `credential_pool`, `address_parser` and
//! `store_profiles`.

// Core Types
/// Error types shared by every layer
pub mod error;
/// Source value normalization
pub mod normalization;
/// Fixed sink schema and row conversion
pub mod schema;
/// Storage traits and enrichment records
pub mod store;

// Infrastructure
/// Per-worker database connection lifecycle
pub mod connection_manager;
/// PostgreSQL implementations of the storage traits
pub mod database;
/// Metrics and observability
pub mod metrics;
/// Progress bars
pub mod progress;

// Transfer Layer
/// Checkpointed batch transfer
pub mod transfer;
/// Bulk insert with row-by-row fallback
pub mod batch_writer;
/// Per-run log of failed rows
pub mod error_log;

// Enrichment Layer
/// Geo enrichment of store records
pub mod enrichment;
/// HTTP geocoder client
pub mod geocoder;
/// Geocoder API key rotation
pub mod credential_pool;
/// Offline address parsing
pub mod address_parser;
/// Store type, area and amenity tables
pub mod store_profiles;

// Settings & Configuration
/// Configuration management
pub mod settings;

// Re-exports for convenience
pub use enrichment::GeoEnrichmentEngine;
pub use error::{StoreError, SyncError};
pub use settings::Settings;
pub use transfer::TransferEngine;
