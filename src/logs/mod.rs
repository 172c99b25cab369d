//! # Log Streamer
//!
//! Read-only access to the append-only log collection written by an
//! external agent. Entries are keyed by `{event, component, container}`
//! (see [`LogCriteria`]) and returned in insertion order.
//!
//! - [`LogStore`]: point query plus tailing cursor over the collection
//!   ([`MemoryLogStore`], [`PgLogStore`])
//! - [`LogStreamer`]: `get_logs` for a finite snapshot, `stream_logs` for a
//!   live, cancelable stream

pub mod memory;
pub mod postgres;
pub mod streamer;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::LogCriteria;

pub use memory::MemoryLogStore;
pub use postgres::PgLogStore;
pub use streamer::LogStreamer;

/// A stored log document exactly as the agent wrote it. Decoding into
/// [`crate::models::LogEntry`] happens in the streamer.
pub type RawLogDocument = serde_json::Value;

#[async_trait]
pub trait LogStore: Send + Sync {
    /// All matching documents, in insertion order.
    async fn find(&self, criteria: &LogCriteria) -> Result<Vec<RawLogDocument>>;

    /// Opens a tailing cursor over matching documents.
    async fn tail(&self, criteria: &LogCriteria) -> Result<Box<dyn LogCursor>>;
}

#[async_trait]
pub trait LogCursor: Send {
    /// A cursor opened before any matching document existed is dead and
    /// never yields; the caller must open a new one.
    fn is_dead(&self) -> bool;

    /// Next matching document, or `None` when currently exhausted. Never
    /// waits for new data.
    async fn try_next(&mut self) -> Result<Option<RawLogDocument>>;
}
