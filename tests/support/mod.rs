//! In-process store server for integration tests
//!
//! Speaks just enough of the wire protocol to back the client and the cache
//! backend: hash and set keys with per-key expiry, MULTI/EXEC, and the
//! AUTH/SELECT handshake. State is shared across connections so reconnects
//! see the same data. A `drop_next_connection` switch closes the serving
//! socket before the next reply, for exercising the reconnect paths.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use tagcache::client::resp::{extract_command, RespParser, RespValue};
use tagcache::{CacheConfig, ConnectionConfig};

enum Value {
  Hash(HashMap<String, Vec<u8>>),
  Set(HashSet<String>),
}

struct Entry {
  value: Value,
  expires_at: Option<u64>,
}

#[derive(Default)]
struct Store {
  entries: HashMap<String, Entry>,
}

impl Store {
  fn purge_expired(&mut self, key: &str) {
    if let Some(entry) = self.entries.get(key) {
      if entry.expires_at.map(|at| at <= now()).unwrap_or(false) {
        self.entries.remove(key);
      }
    }
  }

  fn hash_mut(&mut self, key: &str) -> &mut HashMap<String, Vec<u8>> {
    let entry = self.entries.entry(key.to_string()).or_insert(Entry {
      value: Value::Hash(HashMap::new()),
      expires_at: None,
    });
    if let Value::Set(_) = entry.value {
      entry.value = Value::Hash(HashMap::new());
    }
    match &mut entry.value {
      Value::Hash(h) => h,
      Value::Set(_) => unreachable!(),
    }
  }

  fn set_mut(&mut self, key: &str) -> &mut HashSet<String> {
    let entry = self.entries.entry(key.to_string()).or_insert(Entry {
      value: Value::Set(HashSet::new()),
      expires_at: None,
    });
    if let Value::Hash(_) = entry.value {
      entry.value = Value::Set(HashSet::new());
    }
    match &mut entry.value {
      Value::Set(s) => s,
      Value::Hash(_) => unreachable!(),
    }
  }

  fn set_members(&mut self, key: &str) -> Vec<String> {
    self.purge_expired(key);
    match self.entries.get(key).map(|e| &e.value) {
      Some(Value::Set(s)) => s.iter().cloned().collect(),
      _ => Vec::new(),
    }
  }
}

fn now() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs()
}

type SharedStore = Arc<Mutex<Store>>;

pub struct TestServer {
  port: u16,
  store: SharedStore,
  password: Option<String>,
  drop_next: Arc<AtomicBool>,
}

impl TestServer {
  pub async fn start() -> Self {
    Self::start_with_password(None).await
  }

  pub async fn start_with_password(password: Option<&str>) -> Self {
    let listener = TcpListener::bind("127.0.0.1:0")
      .await
      .expect("bind test server");
    let port = listener.local_addr().expect("local addr").port();
    let store: SharedStore = Arc::new(Mutex::new(Store::default()));
    let drop_next = Arc::new(AtomicBool::new(false));
    let expected_password = password.map(str::to_string);

    let accept_store = store.clone();
    let accept_drop = drop_next.clone();
    let accept_password = expected_password.clone();
    tokio::spawn(async move {
      loop {
        let Ok((socket, _)) = listener.accept().await else {
          break;
        };
        let store = accept_store.clone();
        let drop_next = accept_drop.clone();
        let password = accept_password.clone();
        tokio::spawn(async move {
          serve_connection(socket, store, drop_next, password).await;
        });
      }
    });

    Self {
      port,
      store,
      password: expected_password,
      drop_next,
    }
  }

  pub fn port(&self) -> u16 {
    self.port
  }

  pub fn connection_config(&self) -> ConnectionConfig {
    ConnectionConfig {
      host: "127.0.0.1".to_string(),
      port: self.port,
      password: self.password.clone(),
      ..ConnectionConfig::default()
    }
  }

  pub fn cache_config(&self) -> CacheConfig {
    CacheConfig {
      connection: self.connection_config(),
      ..CacheConfig::default()
    }
  }

  /// Close the serving socket right before the next reply is written.
  pub fn drop_next_connection(&self) {
    self.drop_next.store(true, Ordering::SeqCst);
  }

  /// Delete a key directly in the store, simulating server-side expiry
  /// without touching any index that points at it.
  pub async fn force_expire(&self, key: &str) {
    self.store.lock().await.entries.remove(key);
  }

  pub async fn key_exists(&self, key: &str) -> bool {
    let mut store = self.store.lock().await;
    store.purge_expired(key);
    store.entries.contains_key(key)
  }

  pub async fn set_members(&self, key: &str) -> Vec<String> {
    let mut members = self.store.lock().await.set_members(key);
    members.sort();
    members
  }
}

async fn serve_connection(
  mut socket: TcpStream,
  store: SharedStore,
  drop_next: Arc<AtomicBool>,
  password: Option<String>,
) {
  let mut parser = RespParser::new();
  let mut buf = [0u8; 4096];
  let mut queued: Option<Vec<(String, Vec<Vec<u8>>)>> = None;
  let mut authenticated = password.is_none();

  loop {
    let frame = loop {
      match parser.parse() {
        Ok(Some(frame)) => break frame,
        Ok(None) => {}
        Err(_) => return,
      }
      let Ok(n) = socket.read(&mut buf).await else {
        return;
      };
      if n == 0 {
        return;
      }
      parser.feed(&buf[..n]);
    };

    let Some((cmd, args)) = extract_command(&frame) else {
      return;
    };

    if drop_next.swap(false, Ordering::SeqCst) {
      return;
    }

    let reply = match cmd.as_str() {
      "AUTH" => {
        let given = args.first().map(|a| String::from_utf8_lossy(a).to_string());
        if given.as_deref() == password.as_deref() {
          authenticated = true;
          RespValue::ok()
        } else {
          RespValue::error("ERR invalid password")
        }
      }
      "QUIT" => {
        let _ = socket.write_all(&RespValue::ok().encode()).await;
        return;
      }
      _ if !authenticated => RespValue::error("NOAUTH Authentication required."),
      "MULTI" => {
        queued = Some(Vec::new());
        RespValue::ok()
      }
      "EXEC" => match queued.take() {
        Some(commands) => {
          let mut store = store.lock().await;
          let results = commands
            .into_iter()
            .map(|(cmd, args)| apply(&mut store, &cmd, &args))
            .collect();
          RespValue::Array(Some(results))
        }
        None => RespValue::error("ERR EXEC without MULTI"),
      },
      "DISCARD" => {
        queued = None;
        RespValue::ok()
      }
      _ => match &mut queued {
        Some(commands) => {
          commands.push((cmd, args));
          RespValue::queued()
        }
        None => {
          let mut store = store.lock().await;
          apply(&mut store, &cmd, &args)
        }
      },
    };

    if socket.write_all(&reply.encode()).await.is_err() {
      return;
    }
  }
}

fn apply(store: &mut Store, cmd: &str, args: &[Vec<u8>]) -> RespValue {
  match cmd {
    "PING" => RespValue::SimpleString("PONG".to_string()),
    "SELECT" => RespValue::ok(),
    "FLUSHDB" => {
      store.entries.clear();
      RespValue::ok()
    }
    "DEL" => {
      let mut removed = 0;
      for key in args.iter().map(|a| text(a)) {
        store.purge_expired(&key);
        if store.entries.remove(&key).is_some() {
          removed += 1;
        }
      }
      RespValue::integer(removed)
    }
    "EXISTS" => {
      let key = text(&args[0]);
      store.purge_expired(&key);
      RespValue::integer(store.entries.contains_key(&key) as i64)
    }
    "EXPIRE" => {
      let key = text(&args[0]);
      store.purge_expired(&key);
      let secs: u64 = text(&args[1]).parse().unwrap_or(0);
      match store.entries.get_mut(&key) {
        Some(entry) => {
          entry.expires_at = Some(now() + secs);
          RespValue::integer(1)
        }
        None => RespValue::integer(0),
      }
    }
    "EXPIREAT" => {
      let key = text(&args[0]);
      store.purge_expired(&key);
      let at: u64 = text(&args[1]).parse().unwrap_or(0);
      match store.entries.get_mut(&key) {
        Some(entry) => {
          entry.expires_at = Some(at);
          RespValue::integer(1)
        }
        None => RespValue::integer(0),
      }
    }
    "TTL" => {
      let key = text(&args[0]);
      store.purge_expired(&key);
      match store.entries.get(&key) {
        Some(entry) => match entry.expires_at {
          Some(at) => RespValue::integer(at.saturating_sub(now()) as i64),
          None => RespValue::integer(-1),
        },
        None => RespValue::integer(-2),
      }
    }
    "HMSET" | "HSET" => {
      let key = text(&args[0]);
      store.purge_expired(&key);
      let hash = store.hash_mut(&key);
      for pair in args[1..].chunks(2) {
        if let [field, value] = pair {
          hash.insert(text(field), value.clone());
        }
      }
      RespValue::ok()
    }
    "HGET" => {
      let key = text(&args[0]);
      store.purge_expired(&key);
      match store.entries.get(&key).map(|e| &e.value) {
        Some(Value::Hash(h)) => match h.get(&text(&args[1])) {
          Some(value) => RespValue::bulk(value.clone()),
          None => RespValue::null_bulk(),
        },
        _ => RespValue::null_bulk(),
      }
    }
    "HMGET" => {
      let key = text(&args[0]);
      store.purge_expired(&key);
      let values = args[1..]
        .iter()
        .map(|field| match store.entries.get(&key).map(|e| &e.value) {
          Some(Value::Hash(h)) => match h.get(&text(field)) {
            Some(value) => RespValue::bulk(value.clone()),
            None => RespValue::null_bulk(),
          },
          _ => RespValue::null_bulk(),
        })
        .collect();
      RespValue::Array(Some(values))
    }
    "SADD" => {
      let key = text(&args[0]);
      store.purge_expired(&key);
      let set = store.set_mut(&key);
      let mut added = 0;
      for member in args[1..].iter().map(|a| text(a)) {
        if set.insert(member) {
          added += 1;
        }
      }
      RespValue::integer(added)
    }
    "SREM" => {
      let key = text(&args[0]);
      store.purge_expired(&key);
      let mut removed = 0;
      if let Some(Value::Set(set)) = store.entries.get_mut(&key).map(|e| &mut e.value) {
        for member in args[1..].iter().map(|a| text(a)) {
          if set.remove(&member) {
            removed += 1;
          }
        }
      }
      RespValue::integer(removed)
    }
    "SMEMBERS" => members_reply(store.set_members(&text(&args[0]))),
    "SINTER" => {
      let mut sets = arg_sets(store, args);
      let first = if sets.is_empty() {
        HashSet::new()
      } else {
        sets.remove(0)
      };
      let result = first
        .into_iter()
        .filter(|m| sets.iter().all(|s| s.contains(m)))
        .collect();
      members_reply(result)
    }
    "SUNION" => {
      let mut result: HashSet<String> = HashSet::new();
      for set in arg_sets(store, args) {
        result.extend(set);
      }
      members_reply(result.into_iter().collect())
    }
    "SDIFF" => {
      let mut sets = arg_sets(store, args);
      let first = if sets.is_empty() {
        HashSet::new()
      } else {
        sets.remove(0)
      };
      let result = first
        .into_iter()
        .filter(|m| !sets.iter().any(|s| s.contains(m)))
        .collect();
      members_reply(result)
    }
    "KEYS" => {
      let pattern = text(&args[0]);
      let keys: Vec<String> = store
        .entries
        .keys()
        .filter(|key| match pattern.strip_suffix('*') {
          Some(prefix) => key.starts_with(prefix),
          None => key.as_str() == pattern,
        })
        .cloned()
        .collect();
      members_reply(keys)
    }
    other => RespValue::error(&format!("ERR unknown command '{}'", other)),
  }
}

fn arg_sets(store: &mut Store, args: &[Vec<u8>]) -> Vec<HashSet<String>> {
  args
    .iter()
    .map(|key| store.set_members(&text(key)).into_iter().collect())
    .collect()
}

fn members_reply(members: Vec<String>) -> RespValue {
  RespValue::Array(Some(members.into_iter().map(RespValue::bulk).collect()))
}

fn text(bytes: &[u8]) -> String {
  String::from_utf8_lossy(bytes).to_string()
}
