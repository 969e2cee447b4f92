//! # Plume - Embedded Document Datastore
//!
//! Plume is a lightweight, embedded, file-backed document datastore written
//! in Rust. It offers MongoDB-like queries and update operators, per-field
//! indexes, and durability through an append-only journal that tolerates
//! crashes mid-write.
//!
//! ## Key Features
//!
//! - **Embedded**: No separate server process required
//! - **Documents**: Schemaless JSON documents with dot-notation field access
//! - **Rich Querying**: `$lt`/`$gt`/`$in`/`$regex`/`$and`/`$or` and friends
//! - **Update Operators**: `$set`, `$inc`, `$push`, `$addToSet` and more
//! - **Indexing**: Unique and sparse per-field indexes that speed up queries
//! - **Durability**: Append-only journal with atomic compaction
//! - **Fault Isolation**: One worker thread runs all operations in order;
//!   a panicking callback never corrupts the store or stalls the queue
//! - **Clean API**: PIMPL pattern provides a stable, cloneable handle
//!
//! ## Quick Start
//!
//! ```rust
//! use plume::{doc, DatastoreOptions};
//!
//! # fn main() -> Result<(), plume::errors::PlumeError> {
//! let datastore = DatastoreOptions::new()
//!     .in_memory_only()
//!     .autoload()
//!     .open()?;
//!
//! datastore.insert_sync(doc! { "name": "Jane", "age": 30 })?;
//!
//! let adults = datastore.find_sync(doc! { "age": { "$gte": 18 } })?;
//! assert_eq!(adults.len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - [`collection`] - Documents, ids, and the indexed working set
//! - [`common`] - Common types, constants, and utilities
//! - [`datastore`] - The public datastore interface
//! - [`errors`] - Error types and result definitions
//! - [`filter`] - Query matching
//! - [`persistence`] - The append-only journal and compaction

use crate::common::snowflake::SnowflakeIdGenerator;
use std::sync::LazyLock;

pub mod collection;
pub mod common;
pub mod datastore;
pub mod errors;
pub mod filter;
pub mod persistence;

pub(crate) mod executor;
pub(crate) mod update;

pub use crate::collection::{
    DocId, Document, IndexDefinition, IndexOptions, RemoveOptions, UpdateOptions, UpdateResult,
};
pub use crate::common::Value;
pub use crate::datastore::{Datastore, DatastoreOptions};
pub use crate::errors::{ErrorKind, PlumeError, PlumeResult};

pub(crate) static ID_GENERATOR: LazyLock<SnowflakeIdGenerator> =
    LazyLock::new(SnowflakeIdGenerator::new);
