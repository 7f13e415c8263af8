//! Backend and connection configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Error;

/// Hard ceiling on record lifetime (30 days). The store's own expiry is the
/// reclamation mechanism, so even "infinite" records get an expiry at this
/// ceiling.
pub const MAX_LIFETIME: u64 = 2_592_000;

/// Connection parameters for the upstream store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
  /// Server hostname or address
  #[serde(default = "default_host")]
  pub host: String,

  /// Server port
  #[serde(default = "default_port")]
  pub port: u16,

  /// Password for AUTH (optional)
  #[serde(default)]
  pub password: Option<String>,

  /// Database index selected on connect
  #[serde(default)]
  pub database: u32,

  /// Per-attempt connect timeout in milliseconds
  #[serde(default = "default_connect_timeout_ms")]
  pub connect_timeout_ms: u64,

  /// Timeout for each blocking read in milliseconds (0 = none)
  #[serde(default)]
  pub read_timeout_ms: u64,

  /// Keep the connection open on close()/drop
  #[serde(default)]
  pub persistent: bool,

  /// Extra connect attempts after the first failure
  #[serde(default = "default_connect_retries")]
  pub connect_retries: u32,
}

fn default_host() -> String {
  "127.0.0.1".to_string()
}

fn default_port() -> u16 {
  6379
}

fn default_connect_timeout_ms() -> u64 {
  2500
}

fn default_connect_retries() -> u32 {
  1
}

impl Default for ConnectionConfig {
  fn default() -> Self {
    Self {
      host: default_host(),
      port: default_port(),
      password: None,
      database: 0,
      connect_timeout_ms: default_connect_timeout_ms(),
      read_timeout_ms: 0,
      persistent: false,
      connect_retries: default_connect_retries(),
    }
  }
}

impl ConnectionConfig {
  pub fn addr(&self) -> String {
    format!("{}:{}", self.host, self.port)
  }

  pub fn connect_timeout(&self) -> Duration {
    Duration::from_millis(self.connect_timeout_ms)
  }

  pub fn read_timeout(&self) -> Option<Duration> {
    if self.read_timeout_ms > 0 {
      Some(Duration::from_millis(self.read_timeout_ms))
    } else {
      None
    }
  }
}

/// Compression codec selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionCodec {
  #[default]
  Gzip,
  Lz4,
  Snappy,
}

impl CompressionCodec {
  /// Two-byte codec tag written ahead of the compression marker.
  pub fn tag(&self) -> &'static [u8; 2] {
    match self {
      CompressionCodec::Gzip => b"gz",
      CompressionCodec::Lz4 => b"lz",
      CompressionCodec::Snappy => b"sn",
    }
  }
}

impl std::fmt::Display for CompressionCodec {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      CompressionCodec::Gzip => write!(f, "gzip"),
      CompressionCodec::Lz4 => write!(f, "lz4"),
      CompressionCodec::Snappy => write!(f, "snappy"),
    }
  }
}

impl std::str::FromStr for CompressionCodec {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "gzip" | "gz" | "zlib" => Ok(CompressionCodec::Gzip),
      "lz4" | "lz" => Ok(CompressionCodec::Lz4),
      "snappy" | "sn" => Ok(CompressionCodec::Snappy),
      _ => Err(format!("Unknown compression codec: {}", s)),
    }
  }
}

/// Key-space schema. All remote key names hang off a single configurable
/// prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeySchema {
  #[serde(default = "default_prefix")]
  pub prefix: String,
}

fn default_prefix() -> String {
  "tc".to_string()
}

impl Default for KeySchema {
  fn default() -> Self {
    Self {
      prefix: default_prefix(),
    }
  }
}

impl KeySchema {
  /// Record hash key: `<prefix>:k:<id>`
  pub fn record(&self, id: &str) -> String {
    format!("{}:k:{}", self.prefix, id)
  }

  /// Tag index set key: `<prefix>:ti:<tag>`
  pub fn tag_index(&self, tag: &str) -> String {
    format!("{}:ti:{}", self.prefix, tag)
  }

  /// Global tag registry set key: `<prefix>:tags`
  pub fn tag_set(&self) -> String {
    format!("{}:tags", self.prefix)
  }

  /// Global id registry set key: `<prefix>:ids`
  pub fn id_set(&self) -> String {
    format!("{}:ids", self.prefix)
  }

  /// Pattern matching every record key, for full id scans.
  pub fn record_pattern(&self) -> String {
    format!("{}:k:*", self.prefix)
  }

  /// Strip the record prefix back off a scanned key.
  pub fn record_id<'a>(&self, key: &'a str) -> &'a str {
    let prefix_len = self.prefix.len() + 3; // "<prefix>:k:"
    &key[prefix_len.min(key.len())..]
  }
}

/// Tagged cache backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
  /// Upstream store connection
  #[serde(default)]
  pub connection: ConnectionConfig,

  /// Key-space prefixes
  #[serde(default)]
  pub keys: KeySchema,

  /// Default record lifetime in seconds, used when a save does not carry a
  /// specific one
  #[serde(default = "default_lifetime")]
  pub default_lifetime: u64,

  /// Ceiling applied to "infinite" records, capped at [`MAX_LIFETIME`]
  #[serde(default = "default_lifetime_limit")]
  pub lifetime_limit: u64,

  /// Compression level for record payloads (0 = off)
  #[serde(default)]
  pub compress_data: u32,

  /// Compression level for the encoded tag list (0 = off)
  #[serde(default)]
  pub compress_tags: u32,

  /// Minimum payload size in bytes before compression applies
  #[serde(default = "default_compress_threshold")]
  pub compress_threshold: usize,

  /// Codec used when compression applies
  #[serde(default)]
  pub compression_codec: CompressionCodec,

  /// Maintain the global id registry so not-matching-tag queries work.
  /// Costs one extra set write per save/remove.
  #[serde(default)]
  pub not_matching_tags: bool,

  /// When > 0, each save triggers a garbage-collection sweep with
  /// probability 1/factor
  #[serde(default)]
  pub automatic_cleaning_factor: u32,
}

fn default_lifetime() -> u64 {
  3600
}

fn default_lifetime_limit() -> u64 {
  MAX_LIFETIME
}

fn default_compress_threshold() -> usize {
  20480
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      connection: ConnectionConfig::default(),
      keys: KeySchema::default(),
      default_lifetime: default_lifetime(),
      lifetime_limit: default_lifetime_limit(),
      compress_data: 0,
      compress_tags: 0,
      compress_threshold: default_compress_threshold(),
      compression_codec: CompressionCodec::default(),
      not_matching_tags: false,
      automatic_cleaning_factor: 0,
    }
  }
}

impl CacheConfig {
  /// Check the configuration before any connection is attempted.
  pub fn validate(&self) -> Result<(), Error> {
    if self.connection.host.is_empty() {
      return Err(Error::Configuration("server not specified".to_string()));
    }
    if self.connection.port == 0 {
      return Err(Error::Configuration("port not specified".to_string()));
    }
    if self.default_lifetime > MAX_LIFETIME {
      return Err(Error::Configuration(format!(
        "backend has a limit of 30 days ({} seconds) for the lifetime",
        MAX_LIFETIME
      )));
    }
    Ok(())
  }

  /// Effective ceiling for "infinite" records.
  pub fn effective_lifetime_limit(&self) -> u64 {
    self.lifetime_limit.min(MAX_LIFETIME)
  }
}
