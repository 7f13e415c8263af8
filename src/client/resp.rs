//! RESP wire format parser and encoder
//!
//! Binary-safe: bulk strings are byte payloads, not text. The parser is
//! incremental; feed it raw socket reads and it yields one frame at a time,
//! holding partial input until the rest arrives.

use std::io::{self, Write};

/// A single RESP frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
  /// Simple string (+OK\r\n)
  SimpleString(String),
  /// Error (-ERR message\r\n)
  Error(String),
  /// Integer (:123\r\n)
  Integer(i64),
  /// Bulk string ($5\r\nhello\r\n); None is the nil bulk ($-1)
  BulkString(Option<Vec<u8>>),
  /// Array (*2\r\n...); None is the nil array (*-1)
  Array(Option<Vec<RespValue>>),
}

impl RespValue {
  pub fn ok() -> Self {
    RespValue::SimpleString("OK".to_string())
  }

  pub fn queued() -> Self {
    RespValue::SimpleString("QUEUED".to_string())
  }

  pub fn error(msg: &str) -> Self {
    RespValue::Error(msg.to_string())
  }

  pub fn bulk(data: impl Into<Vec<u8>>) -> Self {
    RespValue::BulkString(Some(data.into()))
  }

  pub fn null_bulk() -> Self {
    RespValue::BulkString(None)
  }

  pub fn integer(i: i64) -> Self {
    RespValue::Integer(i)
  }

  pub fn array(items: Vec<RespValue>) -> Self {
    RespValue::Array(Some(items))
  }

  /// Encode to wire format
  pub fn encode(&self) -> Vec<u8> {
    let mut buf = Vec::new();
    // Writing to a Vec cannot fail
    self.write_to(&mut buf).expect("vec write");
    buf
  }

  fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
    match self {
      RespValue::SimpleString(s) => {
        write!(w, "+{}\r\n", s)?;
      }
      RespValue::Error(e) => {
        write!(w, "-{}\r\n", e)?;
      }
      RespValue::Integer(i) => {
        write!(w, ":{}\r\n", i)?;
      }
      RespValue::BulkString(None) => {
        write!(w, "$-1\r\n")?;
      }
      RespValue::BulkString(Some(data)) => {
        write!(w, "${}\r\n", data.len())?;
        w.write_all(data)?;
        w.write_all(b"\r\n")?;
      }
      RespValue::Array(None) => {
        write!(w, "*-1\r\n")?;
      }
      RespValue::Array(Some(items)) => {
        write!(w, "*{}\r\n", items.len())?;
        for item in items {
          item.write_to(w)?;
        }
      }
    }
    Ok(())
  }

  pub fn as_bytes(&self) -> Option<&[u8]> {
    match self {
      RespValue::BulkString(Some(data)) => Some(data),
      RespValue::SimpleString(s) => Some(s.as_bytes()),
      _ => None,
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      RespValue::SimpleString(s) => Some(s),
      RespValue::BulkString(Some(data)) => std::str::from_utf8(data).ok(),
      _ => None,
    }
  }

  pub fn as_i64(&self) -> Option<i64> {
    match self {
      RespValue::Integer(i) => Some(*i),
      _ => self.as_str().and_then(|s| s.parse().ok()),
    }
  }

  pub fn as_array(&self) -> Option<&[RespValue]> {
    match self {
      RespValue::Array(Some(items)) => Some(items),
      _ => None,
    }
  }
}

/// Encode a command invocation as an array of bulk strings:
/// `*N\r\n($len\r\n<bytes>\r\n)+`
pub fn encode_command(args: &[Vec<u8>]) -> Vec<u8> {
  let mut buf = Vec::with_capacity(16 + args.iter().map(|a| a.len() + 16).sum::<usize>());
  buf.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
  for arg in args {
    buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
    buf.extend_from_slice(arg);
    buf.extend_from_slice(b"\r\n");
  }
  buf
}

/// RESP parse error
#[derive(Debug, Clone)]
pub enum RespError {
  /// Incomplete data, need more bytes
  Incomplete,
  /// Malformed framing
  Invalid(String),
}

impl std::fmt::Display for RespError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      RespError::Incomplete => write!(f, "incomplete data"),
      RespError::Invalid(msg) => write!(f, "invalid RESP: {}", msg),
    }
  }
}

impl std::error::Error for RespError {}

/// Incremental RESP parser over a growable byte buffer.
#[derive(Debug)]
pub struct RespParser {
  buffer: Vec<u8>,
  pos: usize,
}

impl Default for RespParser {
  fn default() -> Self {
    Self::new()
  }
}

impl RespParser {
  pub fn new() -> Self {
    Self {
      buffer: Vec::new(),
      pos: 0,
    }
  }

  /// Add data to the parse buffer
  pub fn feed(&mut self, data: &[u8]) {
    self.buffer.extend_from_slice(data);
  }

  /// Try to parse the next frame from the buffer. `Ok(None)` means more
  /// input is needed.
  pub fn parse(&mut self) -> Result<Option<RespValue>, RespError> {
    if self.pos >= self.buffer.len() {
      return Ok(None);
    }

    let start_pos = self.pos;
    match self.parse_value() {
      Ok(value) => {
        self.buffer.drain(..self.pos);
        self.pos = 0;
        Ok(Some(value))
      }
      Err(RespError::Incomplete) => {
        self.pos = start_pos;
        Ok(None)
      }
      Err(e) => Err(e),
    }
  }

  /// Drop any buffered input. Used when the connection is discarded.
  pub fn clear(&mut self) {
    self.buffer.clear();
    self.pos = 0;
  }

  fn parse_value(&mut self) -> Result<RespValue, RespError> {
    let byte = self.read_byte()?;

    match byte {
      b'+' => {
        let line = self.read_line()?;
        Ok(RespValue::SimpleString(line))
      }
      b'-' => {
        let line = self.read_line()?;
        Ok(RespValue::Error(line))
      }
      b':' => {
        let line = self.read_line()?;
        let i = line
          .parse()
          .map_err(|_| RespError::Invalid(format!("invalid integer: {}", line)))?;
        Ok(RespValue::Integer(i))
      }
      b'$' => self.parse_bulk_string(),
      b'*' => self.parse_array(),
      other => Err(RespError::Invalid(format!(
        "unexpected type byte: 0x{:02x}",
        other
      ))),
    }
  }

  fn parse_bulk_string(&mut self) -> Result<RespValue, RespError> {
    let len_str = self.read_line()?;
    let len: i64 = len_str
      .parse()
      .map_err(|_| RespError::Invalid(format!("invalid bulk string length: {}", len_str)))?;

    if len < 0 {
      return Ok(RespValue::BulkString(None));
    }

    let len = len as usize;
    if self.pos + len + 2 > self.buffer.len() {
      return Err(RespError::Incomplete);
    }

    let data = self.buffer[self.pos..self.pos + len].to_vec();
    self.pos += len;

    if &self.buffer[self.pos..self.pos + 2] != b"\r\n" {
      return Err(RespError::Invalid(
        "missing CRLF after bulk string".to_string(),
      ));
    }
    self.pos += 2;

    Ok(RespValue::BulkString(Some(data)))
  }

  fn parse_array(&mut self) -> Result<RespValue, RespError> {
    let len_str = self.read_line()?;
    let len: i64 = len_str
      .parse()
      .map_err(|_| RespError::Invalid(format!("invalid array length: {}", len_str)))?;

    if len < 0 {
      return Ok(RespValue::Array(None));
    }

    let len = len as usize;
    let mut items = Vec::with_capacity(len);
    for _ in 0..len {
      items.push(self.parse_value()?);
    }

    Ok(RespValue::Array(Some(items)))
  }

  fn read_byte(&mut self) -> Result<u8, RespError> {
    if self.pos >= self.buffer.len() {
      return Err(RespError::Incomplete);
    }
    let byte = self.buffer[self.pos];
    self.pos += 1;
    Ok(byte)
  }

  fn read_line(&mut self) -> Result<String, RespError> {
    let start = self.pos;

    loop {
      if self.pos + 1 >= self.buffer.len() {
        return Err(RespError::Incomplete);
      }

      if self.buffer[self.pos] == b'\r' && self.buffer[self.pos + 1] == b'\n' {
        let line = String::from_utf8_lossy(&self.buffer[start..self.pos]).to_string();
        self.pos += 2;
        return Ok(line);
      }

      self.pos += 1;
    }
  }
}

/// Extract command name and arguments from a request frame. Used by test
/// servers; the client only ever encodes requests.
pub fn extract_command(value: &RespValue) -> Option<(String, Vec<Vec<u8>>)> {
  let arr = value.as_array()?;
  if arr.is_empty() {
    return None;
  }

  let cmd = arr[0].as_str()?.to_uppercase();
  let args: Vec<Vec<u8>> = arr[1..]
    .iter()
    .filter_map(|v| v.as_bytes().map(|b| b.to_vec()))
    .collect();

  Some((cmd, args))
}
