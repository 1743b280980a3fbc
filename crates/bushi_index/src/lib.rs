//! # `bushi_index`
//!
//! Stores the history of configured git repositories in SQLite: one row per
//! repository, one per commit (with parent linkage, touched files and an
//! ancestry skip list) and one per branch or tag.
//!
//! [`ingest::Ingestor`] drives [`bushi_core`]'s export surfaces into any
//! [`db::IndexStore`]; [`db::IndexDb`] is the SQLite implementation.

pub mod config;
pub mod db;
pub mod ingest;

pub use config::{Config, ConfigError, ResolvedConfig, ResolvedRepository};
pub use db::{IndexDb, IndexStore, StoreError};
pub use ingest::{IngestError, IngestReport, Ingestor, Outcome, RepositoryReport, ingest_all};
