//! Tagged cache backend over the protocol client
//!
//! Records live as field maps under `<prefix>:k:<id>` (payload, tag list,
//! mtime, infinite flag); each tag owns a reverse-index set of ids under
//! `<prefix>:ti:<tag>`, and a global registry set tracks every known tag.
//! Every multi-step mutation runs inside one client transaction so a record
//! and its tag-index entries always move together. Records are reclaimed by
//! store-side expiry; the garbage-collection sweep repairs the index drift
//! that expiry leaves behind.

pub mod compress;

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::client::{Client, Command, Reply};
use crate::config::CacheConfig;
use crate::error::Error;
use crate::Result;

// Record hash fields
const FIELD_DATA: &str = "d";
const FIELD_TAGS: &str = "t";
const FIELD_MTIME: &str = "m";
const FIELD_INF: &str = "i";

// Expired ids are flushed out of a tag index in batches of this size during
// garbage collection.
const GC_FLUSH_BATCH: usize = 100;

const TAG_SEPARATOR: char = ',';

/// Requested lifetime for a saved record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Lifetime {
  /// Use the configured default lifetime
  #[default]
  Default,
  /// Specific lifetime in seconds (0 behaves like `Infinite`)
  Seconds(u64),
  /// Never logically expires. Still physically expired at the configured
  /// lifetime ceiling, so abandoned records get reclaimed.
  Infinite,
}

/// Cleaning modes accepted by [`TaggedCache::clean`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleaningMode {
  /// Truncate the whole database the backend is bound to
  All,
  /// Run the garbage-collection sweep
  Old,
  /// Remove records carrying every one of the given tags
  MatchingTag,
  /// Remove records carrying none of the given tags (needs the global id
  /// registry)
  NotMatchingTag,
  /// Remove records carrying at least one of the given tags, then retire
  /// the tags themselves
  MatchingAnyTag,
}

impl std::fmt::Display for CleaningMode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      CleaningMode::All => write!(f, "all"),
      CleaningMode::Old => write!(f, "old"),
      CleaningMode::MatchingTag => write!(f, "matchingTag"),
      CleaningMode::NotMatchingTag => write!(f, "notMatchingTag"),
      CleaningMode::MatchingAnyTag => write!(f, "matchingAnyTag"),
    }
  }
}

impl std::str::FromStr for CleaningMode {
  type Err = String;

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "all" => Ok(CleaningMode::All),
      "old" => Ok(CleaningMode::Old),
      "matchingtag" => Ok(CleaningMode::MatchingTag),
      "notmatchingtag" => Ok(CleaningMode::NotMatchingTag),
      "matchinganytag" => Ok(CleaningMode::MatchingAnyTag),
      _ => Err(format!("Unknown cleaning mode: {}", s)),
    }
  }
}

/// Metadata for a stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
  /// Expiry timestamp in epoch seconds; `None` for infinite records
  pub expire: Option<u64>,
  /// Tags the record was saved with
  pub tags: Vec<String>,
  /// Last-write timestamp in epoch seconds
  pub mtime: u64,
}

/// Static description of what this backend supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
  pub automatic_cleaning: bool,
  pub tags: bool,
  pub expired_read: bool,
  pub priority: bool,
  pub infinite_lifetime: bool,
  pub get_list: bool,
}

/// Tagged, TTL-based cache backend.
///
/// Owns one client connection; all operations run sequentially over it.
/// Run one backend per worker when sharing a store — the store's atomic
/// set/hash primitives plus per-mutation transactions keep concurrent
/// instances consistent without any cross-instance locking.
pub struct TaggedCache {
  config: CacheConfig,
  client: Client,
}

impl TaggedCache {
  /// Validate the configuration and connect to the store.
  pub async fn new(config: CacheConfig) -> Result<Self> {
    config.validate()?;
    let client = Client::connect(config.connection.clone()).await?;
    Ok(Self { config, client })
  }

  /// Close the underlying connection (no-op in persistent mode).
  pub fn close(&mut self) {
    self.client.close();
  }

  /// Read a record's payload. Absent key or field is a miss, never an
  /// error.
  pub async fn load(&mut self, id: &str) -> Result<Option<Vec<u8>>> {
    let reply = self
      .client
      .execute(
        Command::new("HGET")
          .arg(self.config.keys.record(id))
          .arg(FIELD_DATA),
      )
      .await?;
    Ok(reply.into_bytes().map(compress::decode))
  }

  /// Check whether a record exists, returning its last-write timestamp.
  pub async fn mtime(&mut self, id: &str) -> Result<Option<u64>> {
    let reply = self
      .client
      .execute(
        Command::new("HGET")
          .arg(self.config.keys.record(id))
          .arg(FIELD_MTIME),
      )
      .await?;
    Ok(reply.as_i64().map(|m| m as u64))
  }

  /// Store a record under `id` with the given tags.
  ///
  /// The record fields, its expiry, and the tag-index adjustments (diffed
  /// against the previously stored tag list) are applied in one
  /// transaction. An expiry is always set — for infinite records at the
  /// configured ceiling — so the store's own expiry governs reclamation.
  pub async fn save(&mut self, data: &[u8], id: &str, tags: &[&str], lifetime: Lifetime) -> Result<()> {
    let record_key = self.config.keys.record(id);

    let lifetime_secs = match lifetime {
      Lifetime::Default => match self.config.default_lifetime {
        0 => None,
        secs => Some(secs),
      },
      Lifetime::Seconds(0) | Lifetime::Infinite => None,
      Lifetime::Seconds(secs) => Some(secs),
    };
    let expire_secs = lifetime_secs.unwrap_or_else(|| self.config.effective_lifetime_limit());

    let old_tags = self.read_tag_field(&record_key).await?;
    let added: Vec<&str> = tags
      .iter()
      .copied()
      .filter(|t| !old_tags.iter().any(|o| o == t))
      .collect();
    let removed: Vec<&String> = old_tags
      .iter()
      .filter(|o| !tags.contains(&o.as_str()))
      .collect();

    // Encode before entering the transaction so a codec failure cannot
    // leave a dangling buffer.
    let encoded_data = compress::encode(
      data.to_vec(),
      self.config.compress_data,
      self.config.compress_threshold,
      self.config.compression_codec,
    )?;
    let encoded_tags = compress::encode(
      tags.join(&TAG_SEPARATOR.to_string()).into_bytes(),
      self.config.compress_tags,
      self.config.compress_threshold,
      self.config.compression_codec,
    )?;

    self.client.multi()?;
    self
      .client
      .execute(
        Command::new("HMSET")
          .arg(record_key.clone())
          .arg(FIELD_DATA)
          .arg(encoded_data)
          .arg(FIELD_TAGS)
          .arg(encoded_tags)
          .arg(FIELD_MTIME)
          .arg(now().to_string())
          .arg(FIELD_INF)
          .arg(if lifetime_secs.is_none() { "1" } else { "0" }),
      )
      .await?;
    self
      .client
      .execute(
        Command::new("EXPIRE")
          .arg(record_key.clone())
          .arg(expire_secs.to_string()),
      )
      .await?;

    if !added.is_empty() {
      self
        .client
        .execute(Command::new("SADD").arg(self.config.keys.tag_set()).args(added.iter().copied()))
        .await?;
      for tag in &added {
        self
          .client
          .execute(
            Command::new("SADD")
              .arg(self.config.keys.tag_index(tag))
              .arg(id),
          )
          .await?;
      }
    }
    for tag in &removed {
      self
        .client
        .execute(
          Command::new("SREM")
            .arg(self.config.keys.tag_index(tag))
            .arg(id),
        )
        .await?;
    }
    if self.config.not_matching_tags {
      self
        .client
        .execute(Command::new("SADD").arg(self.config.keys.id_set()).arg(id))
        .await?;
    }

    let results = self
      .exec_results()
      .await?
      .ok_or_else(|| Error::Write(format!("transaction aborted for {}", id)))?;
    if !results.first().map(Reply::is_truthy).unwrap_or(false) {
      return Err(Error::Write(id.to_string()));
    }

    self.maybe_auto_clean().await?;
    Ok(())
  }

  /// Delete a record and drop it from every tag index it belonged to.
  /// Returns whether the record existed.
  pub async fn remove(&mut self, id: &str) -> Result<bool> {
    let record_key = self.config.keys.record(id);
    let tags = self.read_tag_field(&record_key).await?;

    self.client.multi()?;
    self
      .client
      .execute(Command::new("DEL").arg(record_key))
      .await?;
    if self.config.not_matching_tags {
      self
        .client
        .execute(Command::new("SREM").arg(self.config.keys.id_set()).arg(id))
        .await?;
    }
    for tag in &tags {
      self
        .client
        .execute(
          Command::new("SREM")
            .arg(self.config.keys.tag_index(tag))
            .arg(id),
        )
        .await?;
    }

    let results = self.exec_results().await?.unwrap_or_default();
    Ok(results.first().map(Reply::is_truthy).unwrap_or(false))
  }

  /// Clean cache records. Tag-based modes with an empty tag list are a
  /// no-op.
  pub async fn clean(&mut self, mode: CleaningMode, tags: &[&str]) -> Result<()> {
    match mode {
      CleaningMode::All => {
        self.client.execute(Command::new("FLUSHDB")).await?;
        Ok(())
      }
      CleaningMode::Old => self.collect_garbage().await,
      _ if tags.is_empty() => Ok(()),
      CleaningMode::MatchingTag => {
        let ids = self.ids_matching_tags(tags).await?;
        self.remove_ids(&ids).await
      }
      CleaningMode::NotMatchingTag => {
        let ids = self.ids_not_matching_tags(tags).await?;
        self.remove_ids(&ids).await
      }
      CleaningMode::MatchingAnyTag => self.remove_by_matching_any_tags(tags).await,
    }
  }

  /// Ids carrying every one of the given tags (set intersection). Empty
  /// input yields an empty result.
  pub async fn ids_matching_tags(&mut self, tags: &[&str]) -> Result<Vec<String>> {
    if tags.is_empty() {
      return Ok(Vec::new());
    }
    let reply = self
      .client
      .execute(Command::new("SINTER").args(self.tag_index_keys(tags)))
      .await?;
    Ok(reply.into_strings())
  }

  /// Ids carrying at least one of the given tags (set union). Empty input
  /// yields an empty result.
  pub async fn ids_matching_any_tags(&mut self, tags: &[&str]) -> Result<Vec<String>> {
    if tags.is_empty() {
      return Ok(Vec::new());
    }
    let reply = self
      .client
      .execute(Command::new("SUNION").args(self.tag_index_keys(tags)))
      .await?;
    Ok(reply.into_strings())
  }

  /// Ids carrying none of the given tags, from the global id registry.
  /// Empty input yields the whole registry. Fails unless the
  /// `not_matching_tags` feature is enabled.
  pub async fn ids_not_matching_tags(&mut self, tags: &[&str]) -> Result<Vec<String>> {
    if !self.config.not_matching_tags {
      return Err(Error::Configuration(
        "not_matching_tags is currently disabled".to_string(),
      ));
    }
    let reply = if tags.is_empty() {
      self
        .client
        .execute(Command::new("SMEMBERS").arg(self.config.keys.id_set()))
        .await?
    } else {
      self
        .client
        .execute(
          Command::new("SDIFF")
            .arg(self.config.keys.id_set())
            .args(self.tag_index_keys(tags)),
        )
        .await?
    };
    Ok(reply.into_strings())
  }

  /// Every stored id: the global registry when enabled, otherwise a key
  /// scan over the record namespace.
  pub async fn ids(&mut self) -> Result<Vec<String>> {
    if self.config.not_matching_tags {
      let reply = self
        .client
        .execute(Command::new("SMEMBERS").arg(self.config.keys.id_set()))
        .await?;
      Ok(reply.into_strings())
    } else {
      let reply = self
        .client
        .execute(Command::new("KEYS").arg(self.config.keys.record_pattern()))
        .await?;
      Ok(
        reply
          .into_strings()
          .iter()
          .map(|key| self.config.keys.record_id(key).to_string())
          .collect(),
      )
    }
  }

  /// Every known tag.
  pub async fn tags(&mut self) -> Result<Vec<String>> {
    let reply = self
      .client
      .execute(Command::new("SMEMBERS").arg(self.config.keys.tag_set()))
      .await?;
    Ok(reply.into_strings())
  }

  /// Expiry, tags and mtime for a record; `None` when the record is gone.
  pub async fn metadata(&mut self, id: &str) -> Result<Option<Metadata>> {
    let record_key = self.config.keys.record(id);
    let reply = self
      .client
      .execute(
        Command::new("HMGET")
          .arg(record_key.clone())
          .arg(FIELD_TAGS)
          .arg(FIELD_MTIME)
          .arg(FIELD_INF),
      )
      .await?;

    let mut fields = reply.into_array().unwrap_or_default().into_iter();
    let tags_field = fields.next().unwrap_or(Reply::Nil);
    let mtime = match fields.next().and_then(|r| r.as_i64()) {
      Some(m) => m as u64,
      None => return Ok(None),
    };
    let infinite = fields.next().and_then(|r| r.into_bytes()) == Some(b"1".to_vec());

    let expire = if infinite {
      None
    } else {
      let ttl = self
        .client
        .execute(Command::new("TTL").arg(record_key))
        .await?
        .as_i64()
        .unwrap_or(0);
      Some(now() + ttl.max(0) as u64)
    };

    Ok(Some(Metadata {
      expire,
      tags: decode_tag_field(tags_field),
      mtime,
    }))
  }

  /// Extend a finite record's lifetime by `extra_lifetime` seconds on top
  /// of its remaining TTL. Returns false for infinite or missing records.
  pub async fn touch(&mut self, id: &str, extra_lifetime: u64) -> Result<bool> {
    let record_key = self.config.keys.record(id);
    let inf = self
      .client
      .execute(
        Command::new("HGET")
          .arg(record_key.clone())
          .arg(FIELD_INF),
      )
      .await?;

    if inf.into_bytes() != Some(b"0".to_vec()) {
      return Ok(false);
    }

    let ttl = self
      .client
      .execute(Command::new("TTL").arg(record_key.clone()))
      .await?
      .as_i64()
      .unwrap_or(0);
    let expire_at = now() + ttl.max(0) as u64 + extra_lifetime;
    let reply = self
      .client
      .execute(
        Command::new("EXPIREAT")
          .arg(record_key)
          .arg(expire_at.to_string()),
      )
      .await?;
    Ok(reply.is_truthy())
  }

  /// Static capability description.
  pub fn capabilities(&self) -> Capabilities {
    Capabilities {
      automatic_cleaning: self.config.automatic_cleaning_factor > 0,
      tags: true,
      expired_read: false,
      priority: false,
      infinite_lifetime: true,
      get_list: true,
    }
  }

  /// Reconcile tag indices against records that expired on their own.
  ///
  /// Walks every registered tag and drops index entries whose record key no
  /// longer exists. Deletions are committed incrementally, not as one
  /// transaction: the sweep only removes ids independently confirmed
  /// absent, so running it alongside ordinary traffic is safe. Ids without
  /// any tag are not reconciled against the global id registry.
  pub async fn collect_garbage(&mut self) -> Result<()> {
    let mut exists: HashMap<String, bool> = HashMap::new();
    let all_tags = self.tags().await?;

    for tag in all_tags {
      let tag_key = self.config.keys.tag_index(&tag);
      let members = self
        .client
        .execute(Command::new("SMEMBERS").arg(tag_key.clone()))
        .await?
        .into_strings();
      let total = members.len();
      let mut expired: Vec<String> = Vec::new();
      let mut num_expired = 0usize;
      let mut num_live = 0usize;

      for id in members {
        let alive = match exists.get(&id) {
          Some(known) => *known,
          None => {
            let reply = self
              .client
              .execute(Command::new("EXISTS").arg(self.config.keys.record(&id)))
              .await?;
            let alive = reply.is_truthy();
            exists.insert(id.clone(), alive);
            alive
          }
        };

        if alive {
          num_live += 1;
          continue;
        }
        num_expired += 1;
        expired.push(id);

        // Flush in batches to bound memory on huge tag sets, but only once
        // a live member has been seen: a fully-expired set gets deleted
        // wholesale below.
        if expired.len() % GC_FLUSH_BATCH == 0 && num_live > 0 {
          self.flush_expired(&tag_key, &expired).await?;
          expired.clear();
        }
      }

      if total > 0 && expired.is_empty() {
        continue;
      }

      if num_expired == total {
        // Empty or completely expired tag: retire it.
        tracing::debug!("garbage collection retiring tag {}", tag);
        self
          .client
          .execute(Command::new("DEL").arg(tag_key))
          .await?;
        self
          .client
          .execute(Command::new("SREM").arg(self.config.keys.tag_set()).arg(tag))
          .await?;
      } else if !expired.is_empty() {
        tracing::debug!(
          "garbage collection dropping {} expired ids from tag {}",
          expired.len(),
          tag
        );
        self.flush_expired(&tag_key, &expired).await?;
      }
    }

    Ok(())
  }

  async fn flush_expired(&mut self, tag_key: &str, expired: &[String]) -> Result<()> {
    self
      .client
      .execute(Command::new("SREM").arg(tag_key).args(expired.iter().cloned()))
      .await?;
    if self.config.not_matching_tags {
      self
        .client
        .execute(
          Command::new("SREM")
            .arg(self.config.keys.id_set())
            .args(expired.iter().cloned()),
        )
        .await?;
    }
    Ok(())
  }

  /// Transactionally delete the given records and drop them from the
  /// global id registry.
  async fn remove_ids(&mut self, ids: &[String]) -> Result<()> {
    if ids.is_empty() {
      return Ok(());
    }
    self.client.multi()?;
    self
      .client
      .execute(Command::new("DEL").args(ids.iter().map(|id| self.config.keys.record(id))))
      .await?;
    if self.config.not_matching_tags {
      self
        .client
        .execute(
          Command::new("SREM")
            .arg(self.config.keys.id_set())
            .args(ids.iter().cloned()),
        )
        .await?;
    }
    self.exec_results().await?;
    Ok(())
  }

  /// Remove every record matching any given tag, then retire the tags
  /// themselves — even when no record matched.
  async fn remove_by_matching_any_tags(&mut self, tags: &[&str]) -> Result<()> {
    let ids = self.ids_matching_any_tags(tags).await?;

    self.client.multi()?;
    if !ids.is_empty() {
      self
        .client
        .execute(Command::new("DEL").args(ids.iter().map(|id| self.config.keys.record(id))))
        .await?;
      if self.config.not_matching_tags {
        self
          .client
          .execute(
            Command::new("SREM")
              .arg(self.config.keys.id_set())
              .args(ids.iter().cloned()),
          )
          .await?;
      }
    }
    self
      .client
      .execute(Command::new("DEL").args(self.tag_index_keys(tags)))
      .await?;
    self
      .client
      .execute(
        Command::new("SREM")
          .arg(self.config.keys.tag_set())
          .args(tags.iter().copied()),
      )
      .await?;
    self.exec_results().await?;
    Ok(())
  }

  /// Read and decode the stored tag list for a record key.
  async fn read_tag_field(&mut self, record_key: &str) -> Result<Vec<String>> {
    let reply = self
      .client
      .execute(Command::new("HGET").arg(record_key).arg(FIELD_TAGS))
      .await?;
    Ok(decode_tag_field(reply))
  }

  /// Run EXEC and unpack the per-command results, `None` when the server
  /// aborted the transaction.
  async fn exec_results(&mut self) -> Result<Option<Vec<Reply>>> {
    Ok(self.client.exec().await?.into_array())
  }

  fn tag_index_keys(&self, tags: &[&str]) -> Vec<String> {
    tags
      .iter()
      .map(|tag| self.config.keys.tag_index(tag))
      .collect()
  }

  /// One save in `automatic_cleaning_factor` triggers a sweep.
  async fn maybe_auto_clean(&mut self) -> Result<()> {
    let factor = self.config.automatic_cleaning_factor;
    if factor > 0 && rand::thread_rng().gen_range(1..=factor) == 1 {
      tracing::debug!("automatic cleaning triggered (factor {})", factor);
      self.collect_garbage().await?;
    }
    Ok(())
  }
}

fn decode_tag_field(reply: Reply) -> Vec<String> {
  match reply.into_bytes() {
    Some(raw) => {
      let raw = compress::decode(raw);
      let text = String::from_utf8_lossy(&raw);
      if text.is_empty() {
        Vec::new()
      } else {
        text.split(TAG_SEPARATOR).map(str::to_string).collect()
      }
    }
    None => Vec::new(),
  }
}

fn now() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs()
}
