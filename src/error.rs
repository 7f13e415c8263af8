//! Error taxonomy for the client and the cache backend

use thiserror::Error;

/// Library error type.
///
/// Recovery inside the library is limited to bounded connect retries and a
/// transparent reconnect before a non-transactional write. Everything else
/// propagates to the caller.
#[derive(Debug, Error)]
pub enum Error {
  /// Missing or invalid configuration; raised at construction, never retried.
  #[error("configuration error: {0}")]
  Configuration(String),

  /// The transport could not be established within the retry budget.
  #[error("connection to server failed after {failures} failures")]
  Connection { failures: u32 },

  /// Malformed reply framing. The connection is desynced and should be
  /// discarded.
  #[error("protocol error: {0}")]
  Protocol(String),

  /// The store returned an explicit error reply outside a transaction.
  #[error("server error: {0}")]
  Server(String),

  /// The connection dropped while commands were buffered. The transaction
  /// cannot be replayed safely.
  #[error("lost connection to server during transaction")]
  TransactionLost,

  /// The store rejected a record write.
  #[error("could not write cache record: {0}")]
  Write(String),

  /// A codec failed to compress a payload. Decompression failures are not
  /// modeled; unmatched markers fall back to raw bytes.
  #[error("compression failed: {0}")]
  Compression(String),

  /// Transport-level I/O failure, including read timeouts.
  #[error("i/o error: {0}")]
  Io(#[from] std::io::Error),
}
