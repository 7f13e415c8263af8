//! Payload compression with codec-marker framing
//!
//! Compressed payloads are framed as `<2-byte codec tag><marker><bytes>`.
//! The decoder is lenient: anything without a recognized marker passes
//! through untouched, so mixed compressed/raw data and codec changes never
//! break reads.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use snap::raw::{Decoder as SnapDecoder, Encoder as SnapEncoder};

use crate::config::CompressionCodec;
use crate::error::Error;
use crate::Result;

/// Marker bytes following the codec tag.
const MARKER: &[u8; 3] = b":\x1f\x8b";

/// Compress `data` when a level is set and the payload meets the size
/// threshold; otherwise return it unchanged.
pub fn encode(
  data: Vec<u8>,
  level: u32,
  threshold: usize,
  codec: CompressionCodec,
) -> Result<Vec<u8>> {
  if level == 0 || data.len() < threshold {
    return Ok(data);
  }

  let compressed = match codec {
    CompressionCodec::Gzip => {
      let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level.min(9)));
      encoder
        .write_all(&data)
        .and_then(|_| encoder.finish())
        .map_err(|e| Error::Compression(e.to_string()))?
    }
    CompressionCodec::Lz4 => compress_prepend_size(&data),
    CompressionCodec::Snappy => SnapEncoder::new()
      .compress_vec(&data)
      .map_err(|e| Error::Compression(e.to_string()))?,
  };

  let mut framed = Vec::with_capacity(2 + MARKER.len() + compressed.len());
  framed.extend_from_slice(codec.tag());
  framed.extend_from_slice(MARKER);
  framed.extend_from_slice(&compressed);
  Ok(framed)
}

/// Undo [`encode`]. Unmatched markers (and corrupt compressed payloads) fall
/// back to the raw bytes rather than erroring.
pub fn decode(data: Vec<u8>) -> Vec<u8> {
  if data.len() < 5 || &data[2..5] != MARKER {
    return data;
  }

  let body = &data[5..];
  let decompressed = match &data[0..2] {
    b"gz" => {
      let mut decoder = ZlibDecoder::new(body);
      let mut out = Vec::new();
      decoder.read_to_end(&mut out).map(|_| out).ok()
    }
    b"lz" => decompress_size_prepended(body).ok(),
    b"sn" => SnapDecoder::new().decompress_vec(body).ok(),
    _ => None,
  };

  match decompressed {
    Some(out) => out,
    None => {
      tracing::warn!("unrecognized or corrupt compression frame, passing through raw");
      data
    }
  }
}
