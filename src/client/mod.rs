//! Minimal wire-protocol client for the upstream key/value/set store
//!
//! Speaks RESP by hand over a single TCP connection: command framing, reply
//! decoding, transaction batching, and reconnect-on-failure. No
//! publish/subscribe, scripting, or cluster support; no pipelining beyond a
//! single transaction.

pub mod resp;

use std::io::{self, ErrorKind};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::ConnectionConfig;
use crate::error::Error;
use crate::Result;
use resp::{encode_command, RespParser, RespValue};

/// A single command invocation: name plus raw byte arguments.
///
/// The set of commands the cache layer issues is closed (key, hash-field and
/// set primitives plus MULTI/EXEC and connection handshake); this builder
/// keeps the invocation explicit instead of dispatching on arbitrary names.
#[derive(Debug, Clone)]
pub struct Command {
  args: Vec<Vec<u8>>,
}

impl Command {
  pub fn new(name: &str) -> Self {
    Self {
      args: vec![name.as_bytes().to_vec()],
    }
  }

  /// Append one argument. Integers go through `to_string()` at the caller.
  pub fn arg(mut self, arg: impl Into<Vec<u8>>) -> Self {
    self.args.push(arg.into());
    self
  }

  /// Append every item of an iterator as its own argument.
  pub fn args<I, A>(mut self, items: I) -> Self
  where
    I: IntoIterator<Item = A>,
    A: Into<Vec<u8>>,
  {
    for item in items {
      self.args.push(item.into());
    }
    self
  }

  pub fn name(&self) -> &str {
    // args[0] is always the ASCII command name set in new()
    std::str::from_utf8(&self.args[0]).unwrap_or("?")
  }

  fn encode(&self) -> Vec<u8> {
    encode_command(&self.args)
  }
}

/// A decoded reply, after applying the cache layer's conventions:
/// `+OK`/`+QUEUED` collapse to `Bool(true)`, nil bulk/array to `Nil`, and an
/// error reply during transaction construction to `Bool(false)`.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
  Nil,
  Bool(bool),
  Simple(String),
  Bytes(Vec<u8>),
  Int(i64),
  Array(Vec<Reply>),
}

impl Reply {
  pub fn is_nil(&self) -> bool {
    matches!(self, Reply::Nil)
  }

  /// Loose truthiness, matching how multi-step results are checked: nil,
  /// `false` and `0` are falsy.
  pub fn is_truthy(&self) -> bool {
    match self {
      Reply::Nil => false,
      Reply::Bool(b) => *b,
      Reply::Int(i) => *i != 0,
      _ => true,
    }
  }

  pub fn as_bytes(&self) -> Option<&[u8]> {
    match self {
      Reply::Bytes(data) => Some(data),
      Reply::Simple(s) => Some(s.as_bytes()),
      _ => None,
    }
  }

  pub fn into_bytes(self) -> Option<Vec<u8>> {
    match self {
      Reply::Bytes(data) => Some(data),
      Reply::Simple(s) => Some(s.into_bytes()),
      _ => None,
    }
  }

  pub fn as_i64(&self) -> Option<i64> {
    match self {
      Reply::Int(i) => Some(*i),
      Reply::Bytes(data) => std::str::from_utf8(data).ok()?.parse().ok(),
      _ => None,
    }
  }

  pub fn into_array(self) -> Option<Vec<Reply>> {
    match self {
      Reply::Array(items) => Some(items),
      _ => None,
    }
  }

  /// Flatten an array reply of bulk strings into owned strings, skipping
  /// anything non-textual. Used for set-membership replies.
  pub fn into_strings(self) -> Vec<String> {
    match self {
      Reply::Array(items) => items
        .into_iter()
        .filter_map(|r| r.into_bytes())
        .filter_map(|b| String::from_utf8(b).ok())
        .collect(),
      _ => Vec::new(),
    }
  }
}

/// Open transaction state: commands already framed but not yet flushed.
#[derive(Debug)]
struct Transaction {
  buffer: Vec<u8>,
  command_count: usize,
}

/// Client over one logical connection.
///
/// State machine: disconnected -> connected -> (buffering -> connected)*.
/// Buffering is entered by [`Client::multi`] and left by [`Client::exec`] or
/// [`Client::discard`]. Losing the transport while a transaction is buffered
/// is unrecoverable for that transaction.
#[derive(Debug)]
pub struct Client {
  config: ConnectionConfig,
  stream: Option<TcpStream>,
  parser: RespParser,
  connect_failures: u32,
  transaction: Option<Transaction>,
}

impl Client {
  /// Connect to the store, performing AUTH and SELECT as configured.
  pub async fn connect(config: ConnectionConfig) -> Result<Self> {
    let mut client = Self {
      config,
      stream: None,
      parser: RespParser::new(),
      connect_failures: 0,
      transaction: None,
    };
    client.establish().await?;
    Ok(client)
  }

  pub fn is_connected(&self) -> bool {
    self.stream.is_some()
  }

  /// Close the connection. A no-op in persistent mode, where the socket is
  /// kept for the lifetime of the client.
  pub fn close(&mut self) {
    if !self.config.persistent {
      self.drop_connection();
    }
  }

  /// Execute one command. Outside a transaction this is a full round trip;
  /// inside one, the command is buffered and a queued sentinel returned.
  pub async fn execute(&mut self, cmd: Command) -> Result<Reply> {
    if let Some(txn) = &mut self.transaction {
      txn.buffer.extend_from_slice(&cmd.encode());
      txn.command_count += 1;
      return Ok(Reply::Bool(true));
    }

    self.ensure_connected().await?;
    match self.round_trip(&cmd.encode(), false).await {
      Err(Error::Io(e)) if is_disconnect(&e) => {
        // Server side dropped an idle connection; reconnect (re-AUTH,
        // re-SELECT) and retry once.
        tracing::debug!("connection to {} lost, reconnecting", self.config.addr());
        self.drop_connection();
        self.establish().await?;
        self.round_trip(&cmd.encode(), false).await
      }
      other => other,
    }
  }

  /// Enter transaction mode. Subsequent commands are buffered client-side;
  /// nothing touches the socket until [`Client::exec`].
  pub fn multi(&mut self) -> Result<()> {
    if self.transaction.is_some() {
      return Err(Error::Protocol(
        "MULTI called inside an open transaction".to_string(),
      ));
    }
    self.transaction = Some(Transaction {
      buffer: Command::new("MULTI").encode(),
      command_count: 1,
    });
    Ok(())
  }

  /// Flush the buffered transaction in one write and drain one reply per
  /// buffered command plus the terminator's own reply. Returns the
  /// terminator's reply: the array of per-command results in order. The
  /// intervening queued acknowledgements are consumed and discarded.
  pub async fn exec(&mut self) -> Result<Reply> {
    let txn = self
      .transaction
      .take()
      .ok_or_else(|| Error::Protocol("EXEC without MULTI".to_string()))?;

    let mut buffer = txn.buffer;
    buffer.extend_from_slice(&Command::new("EXEC").encode());
    let expected = txn.command_count + 1;

    // Nothing has been flushed yet, so reconnecting here is still safe.
    if self.stream.is_none() {
      self.establish().await?;
    }

    match self.drain_transaction(&buffer, expected).await {
      Err(Error::Io(e)) if is_disconnect(&e) => {
        // The buffered commands may be partially applied server-side;
        // replaying could duplicate effects.
        self.drop_connection();
        Err(Error::TransactionLost)
      }
      other => other,
    }
  }

  /// Abandon the buffered transaction. Nothing was flushed, so this is a
  /// purely client-side operation.
  pub fn discard(&mut self) {
    self.transaction = None;
  }

  /// Connection health probe.
  pub async fn ping(&mut self) -> Result<bool> {
    let reply = self.execute(Command::new("PING")).await?;
    Ok(matches!(reply, Reply::Simple(ref s) if s == "PONG"))
  }

  async fn drain_transaction(&mut self, buffer: &[u8], expected: usize) -> Result<Reply> {
    self.write_all(buffer).await?;
    // Per-command acks first (QUEUED, or inline queuing errors which decode
    // to a false sentinel), then the terminator's reply.
    for _ in 0..expected - 1 {
      let frame = self.read_frame().await?;
      let _ = decode(frame, true)?;
    }
    let frame = self.read_frame().await?;
    decode(frame, false)
  }

  async fn ensure_connected(&mut self) -> Result<()> {
    if self.stream.is_none() {
      self.establish().await?;
    }
    Ok(())
  }

  /// Open the transport with a bounded per-attempt timeout and a bounded
  /// retry budget, then run the AUTH/SELECT handshake.
  async fn establish(&mut self) -> Result<()> {
    let addr = self.config.addr();
    loop {
      match timeout(self.config.connect_timeout(), TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => {
          self.stream = Some(stream);
          self.parser.clear();
          self.connect_failures = 0;
          break;
        }
        Ok(Err(e)) => {
          tracing::debug!("connect to {} failed: {}", addr, e);
        }
        Err(_) => {
          tracing::debug!("connect to {} timed out", addr);
        }
      }
      self.connect_failures += 1;
      if self.connect_failures > self.config.connect_retries {
        let failures = self.connect_failures;
        self.connect_failures = 0;
        return Err(Error::Connection { failures });
      }
    }

    if let Some(password) = self.config.password.clone() {
      let reply = self
        .round_trip(&Command::new("AUTH").arg(password).encode(), false)
        .await?;
      if !reply.is_truthy() {
        return Err(Error::Configuration(
          "unable to authenticate with the server".to_string(),
        ));
      }
    }

    // Always select the database so a reused persistent connection cannot
    // leak another caller's selection.
    let reply = self
      .round_trip(
        &Command::new("SELECT")
          .arg(self.config.database.to_string())
          .encode(),
        false,
      )
      .await?;
    if !reply.is_truthy() {
      return Err(Error::Configuration(
        "the database could not be selected".to_string(),
      ));
    }

    tracing::debug!("connected to {} (db {})", addr, self.config.database);
    Ok(())
  }

  fn drop_connection(&mut self) {
    self.stream = None;
    self.parser.clear();
  }

  async fn round_trip(&mut self, frame: &[u8], in_transaction: bool) -> Result<Reply> {
    self.write_all(frame).await?;
    let reply = self.read_frame().await?;
    decode(reply, in_transaction)
  }

  async fn write_all(&mut self, frame: &[u8]) -> Result<()> {
    let stream = self
      .stream
      .as_mut()
      .ok_or_else(|| Error::Io(io::Error::new(ErrorKind::NotConnected, "not connected")))?;
    stream.write_all(frame).await?;
    stream.flush().await?;
    Ok(())
  }

  /// Read exactly one reply frame, honoring the configured read timeout per
  /// blocking read.
  async fn read_frame(&mut self) -> Result<RespValue> {
    let mut buf = [0u8; 4096];
    loop {
      if let Some(frame) = self
        .parser
        .parse()
        .map_err(|e| Error::Protocol(e.to_string()))?
      {
        return Ok(frame);
      }

      let stream = self
        .stream
        .as_mut()
        .ok_or_else(|| Error::Io(io::Error::new(ErrorKind::NotConnected, "not connected")))?;

      let n = match self.config.read_timeout() {
        Some(limit) => timeout(limit, stream.read(&mut buf))
          .await
          .map_err(|_| Error::Io(io::Error::new(ErrorKind::TimedOut, "read timed out")))??,
        None => stream.read(&mut buf).await?,
      };
      if n == 0 {
        return Err(Error::Io(io::Error::new(
          ErrorKind::UnexpectedEof,
          "connection closed by server",
        )));
      }
      self.parser.feed(&buf[..n]);
    }
  }
}

/// Map a raw frame onto the decoded reply conventions. During transaction
/// construction an error reply is tolerated (the store reports queuing
/// errors inline) and collapses to `Bool(false)`.
fn decode(value: RespValue, in_transaction: bool) -> Result<Reply> {
  Ok(match value {
    RespValue::SimpleString(s) => {
      if s == "OK" || s == "QUEUED" {
        Reply::Bool(true)
      } else {
        Reply::Simple(s)
      }
    }
    RespValue::Error(msg) => {
      if in_transaction {
        Reply::Bool(false)
      } else {
        return Err(Error::Server(msg));
      }
    }
    RespValue::Integer(i) => Reply::Int(i),
    RespValue::BulkString(None) | RespValue::Array(None) => Reply::Nil,
    RespValue::BulkString(Some(data)) => Reply::Bytes(data),
    RespValue::Array(Some(items)) => {
      let mut decoded = Vec::with_capacity(items.len());
      for item in items {
        decoded.push(decode(item, in_transaction)?);
      }
      Reply::Array(decoded)
    }
  })
}

fn is_disconnect(e: &io::Error) -> bool {
  matches!(
    e.kind(),
    ErrorKind::UnexpectedEof
      | ErrorKind::BrokenPipe
      | ErrorKind::ConnectionReset
      | ErrorKind::ConnectionAborted
      | ErrorKind::NotConnected
      | ErrorKind::WriteZero
  )
}
