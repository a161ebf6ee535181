//! Marginalia Storage crate - SQLite persistence for entries and their joins.
//!
//! Provides a WAL-mode SQLite database with migrations, the entry
//! repository, and the symmetric join graph built on top of it.

pub mod db;
pub mod joins;
pub mod migrations;
pub mod repository;

pub use db::Database;
pub use joins::{JoinAudit, JoinEdge, JoinGraph, JoinOutcome};
pub use repository::EntryRepository;
