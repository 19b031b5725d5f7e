//! zlib compression for cached values.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use super::codec::{CodecCacheStore, CodecError, ValueCodec};

const HEADER_RAW: u8 = 0;
const HEADER_DEFLATED: u8 = 1;

/// Store wrapper that compresses values.
pub type CompressedCacheStore = CodecCacheStore<DeflateCodec>;

/// zlib codec with a one-byte header.
///
/// Payload format: `[header (1 byte)] || [body]`, where the header is `0`
/// for a raw body and `1` for a zlib-deflated one. Values shorter than
/// `min_size` are stored raw.
#[derive(Debug, Clone)]
pub struct DeflateCodec {
    level: Compression,
    min_size: usize,
}

impl DeflateCodec {
    /// `level` is clamped to zlib's 0-9 range.
    pub fn new(level: u32, min_size: usize) -> Self {
        Self {
            level: Compression::new(level.min(9)),
            min_size,
        }
    }
}

impl Default for DeflateCodec {
    fn default() -> Self {
        Self::new(6, crate::config::DEFAULT_COMPRESSION_MIN_SIZE)
    }
}

impl ValueCodec for DeflateCodec {
    fn name(&self) -> &'static str {
        "deflate"
    }

    fn encode(&self, plain: &[u8]) -> Result<Vec<u8>, CodecError> {
        if plain.len() < self.min_size {
            let mut out = Vec::with_capacity(plain.len() + 1);
            out.push(HEADER_RAW);
            out.extend_from_slice(plain);
            return Ok(out);
        }

        let mut encoder = ZlibEncoder::new(vec![HEADER_DEFLATED], self.level);
        encoder.write_all(plain)?;
        Ok(encoder.finish()?)
    }

    fn decode(&self, stored: &[u8]) -> Result<Vec<u8>, CodecError> {
        match stored.split_first() {
            Some((&HEADER_RAW, body)) => Ok(body.to_vec()),
            Some((&HEADER_DEFLATED, body)) => {
                let mut plain = Vec::new();
                ZlibDecoder::new(body).read_to_end(&mut plain)?;
                Ok(plain)
            }
            Some(_) => Err(CodecError::Malformed("unknown compression header")),
            None => Err(CodecError::Malformed("empty payload")),
        }
    }
}
