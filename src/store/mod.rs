//! Abstract key/value storage backing checkpoints and shared knowledge.
//!
//! The core reserves two key classes: `checkpoint:<id>` and
//! `knowledge:<key>`. Everything else is free for the embedding
//! application. The default implementation is in-memory; durable engines
//! plug in behind the same trait.

mod memory;

pub use memory::MemoryStore;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Key prefix reserved for orchestrator checkpoints.
pub const CHECKPOINT_PREFIX: &str = "checkpoint:";

/// Key prefix reserved for shared knowledge entries.
pub const KNOWLEDGE_PREFIX: &str = "knowledge:";

/// Minimal key/value contract the core depends on.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Store a value, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Fetch a value; absent if missing or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Remove a key; returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// All live keys.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Number of live entries.
    async fn len(&self) -> Result<usize>;

    /// Drop every entry.
    async fn clear(&self) -> Result<()>;
}
