//! Infrastructure layer for Stepwise.
//!
//! Contains the durable implementations of the contracts defined in
//! `stepwise-core`: the SQLite workflow repository, the SQLite-backed
//! message bus, and the `config.toml` loader.

pub mod config;
pub mod sqlite;
