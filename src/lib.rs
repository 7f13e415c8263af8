//! Tagged, TTL-based caching over a minimal Redis wire protocol client
//!
//! Two layers:
//! - [`client`]: hand-rolled RESP client (framing, reply decoding,
//!   transaction batching, reconnect-on-failure) over a single TCP
//!   connection
//! - [`cache`]: tagged cache backend (load/save/remove/clean) that keeps a
//!   reverse index from tags to record ids so whole groups of records can
//!   be invalidated together, plus a garbage-collection sweep that repairs
//!   index drift after records expire on their own
//!
//! Payloads are opaque byte strings; serialization is the caller's problem.

pub mod cache;
pub mod client;
pub mod config;
pub mod error;

pub use cache::{Capabilities, CleaningMode, Lifetime, Metadata, TaggedCache};
pub use client::{Client, Command, Reply};
pub use config::{CacheConfig, CompressionCodec, ConnectionConfig, KeySchema};
pub use error::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
