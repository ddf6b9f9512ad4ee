//! Turns [`ItemValue`]s into wire payloads and back.
//!
//! Write order is fixed: serialize, wrap binary buffers into a
//! [`UserBinaryObject`], then compress. Reads run the exact inverse:
//! inflate when [`BitSet::COMPRESSED`] is set, decode, then unwrap.

use log::{debug, trace};

use crate::errors::{CacheError, ErrorKind};
use crate::types::{BitSet, CacheResult, ItemValue};

/// Chunk size of a [`UserBinaryObject`].
pub const CHUNK_SIZE: usize = 80 * 1024;

/// Default size above which payloads are compressed.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 100 * 1024;

/// How structured values are tagged on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SerializationFormat {
    /// Opaque to the servers. Values are still encoded as compact JSON text,
    /// but no type flag is attached.
    #[default]
    Binary,
    /// Tagged with [`BitSet::JSON_DATA`] so servers may inspect documents.
    Json,
}

/// The serialization collaborator.
pub trait Serializer: Send + Sync {
    /// Encodes `value`, recording the payload shape in `flags`.
    fn serialize(&self, value: &ItemValue, flags: &mut BitSet) -> CacheResult<Vec<u8>>;

    /// Decodes a payload produced by [`Serializer::serialize`].
    fn deserialize(&self, bytes: &[u8], flags: BitSet) -> CacheResult<ItemValue>;
}

/// A byte buffer split into fixed-size chunks.
///
/// Large buffers travel chunked so that neither side has to allocate one
/// contiguous block for them. On the wire it is a big-endian `u32` chunk count
/// followed by each chunk as a `u32` length and its bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserBinaryObject {
    chunks: Vec<Vec<u8>>,
}

impl UserBinaryObject {
    /// Splits `bytes` into chunks of [`CHUNK_SIZE`].
    pub fn from_bytes(bytes: &[u8]) -> UserBinaryObject {
        UserBinaryObject {
            chunks: bytes.chunks(CHUNK_SIZE).map(<[u8]>::to_vec).collect(),
        }
    }

    /// Number of chunks.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Total payload size.
    pub fn len(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }

    /// Returns true if no bytes are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Joins the chunks back into one buffer.
    pub fn into_bytes(self) -> Vec<u8> {
        self.chunks.concat()
    }

    /// Frames the chunks for the wire.
    pub fn encode(&self) -> CacheResult<Vec<u8>> {
        let mut out = Vec::with_capacity(4 + self.chunks.len() * 4 + self.len());
        out.extend_from_slice(&frame_len(self.chunks.len())?);
        for chunk in &self.chunks {
            out.extend_from_slice(&frame_len(chunk.len())?);
            out.extend_from_slice(chunk);
        }
        Ok(out)
    }

    /// Parses a framed buffer.
    pub fn decode(mut bytes: &[u8]) -> CacheResult<UserBinaryObject> {
        let count = read_u32(&mut bytes)? as usize;
        let mut chunks = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let len = read_u32(&mut bytes)? as usize;
            if bytes.len() < len {
                fail!((
                    ErrorKind::Serialization,
                    "Truncated binary object",
                    format!("chunk of {len} bytes, {} left", bytes.len()),
                ));
            }
            let (chunk, rest) = bytes.split_at(len);
            chunks.push(chunk.to_vec());
            bytes = rest;
        }
        if !bytes.is_empty() {
            fail!((
                ErrorKind::Serialization,
                "Trailing bytes after binary object",
                format!("{} bytes", bytes.len()),
            ));
        }
        Ok(UserBinaryObject { chunks })
    }
}

fn frame_len(len: usize) -> CacheResult<[u8; 4]> {
    match u32::try_from(len) {
        Ok(len) => Ok(len.to_be_bytes()),
        Err(_) => fail!((
            ErrorKind::Serialization,
            "Binary object too large to frame",
            format!("length {len} does not fit in 32 bits"),
        )),
    }
}

fn read_u32(bytes: &mut &[u8]) -> CacheResult<u32> {
    if bytes.len() < 4 {
        fail!((ErrorKind::Serialization, "Truncated binary object header"));
    }
    let (head, rest) = bytes.split_at(4);
    *bytes = rest;
    Ok(u32::from_be_bytes([head[0], head[1], head[2], head[3]]))
}

fn compress(bytes: &[u8]) -> CacheResult<Vec<u8>> {
    lz4::block::compress(bytes, None, true).map_err(|err| {
        CacheError::from((
            ErrorKind::Compression,
            "Failed to compress payload",
            err.to_string(),
        ))
    })
}

fn decompress(bytes: &[u8]) -> CacheResult<Vec<u8>> {
    lz4::block::decompress(bytes, None).map_err(|err| {
        CacheError::from((
            ErrorKind::Compression,
            "Failed to inflate payload",
            err.to_string(),
        ))
    })
}

/// The default [`Serializer`]: JSON for structured values, chunked buffers
/// for binary ones, lz4 above a size threshold.
#[derive(Clone, Debug)]
pub struct Codec {
    format: SerializationFormat,
    compression_threshold: Option<usize>,
}

impl Default for Codec {
    fn default() -> Self {
        Codec::new(SerializationFormat::default(), None)
    }
}

impl Codec {
    /// Creates a codec. `compression_threshold` of `None` disables compression.
    pub fn new(format: SerializationFormat, compression_threshold: Option<usize>) -> Codec {
        Codec {
            format,
            compression_threshold,
        }
    }

    /// Decodes an event payload, never failing.
    ///
    /// Items raised by events may come from writers using another encoding.
    /// Whatever cannot be decoded is handed back as raw bytes, taken after as
    /// many pipeline stages as succeeded.
    pub(crate) fn deserialize_lossy(&self, bytes: &[u8], flags: BitSet) -> ItemValue {
        match self.deserialize(bytes, flags) {
            Ok(value) => value,
            Err(err) => {
                debug!("Returning raw event payload after decode failure: {err}");
                let mut raw = bytes.to_vec();
                if flags.is_set(BitSet::COMPRESSED) {
                    if let Ok(inflated) = decompress(&raw) {
                        raw = inflated;
                    }
                }
                if flags.is_set(BitSet::BINARY_DATA) {
                    if let Ok(object) = UserBinaryObject::decode(&raw) {
                        raw = object.into_bytes();
                    }
                }
                ItemValue::Binary(raw)
            }
        }
    }
}

impl Serializer for Codec {
    fn serialize(&self, value: &ItemValue, flags: &mut BitSet) -> CacheResult<Vec<u8>> {
        flags.unset(BitSet::COMPRESSED | BitSet::BINARY_DATA | BitSet::JSON_DATA);
        let bytes = match value {
            ItemValue::Json(value) => {
                if self.format == SerializationFormat::Json {
                    flags.set(BitSet::JSON_DATA);
                }
                serde_json::to_vec(value)?
            }
            ItemValue::Binary(bytes) => {
                flags.set(BitSet::BINARY_DATA);
                UserBinaryObject::from_bytes(bytes).encode()?
            }
        };

        match self.compression_threshold {
            Some(threshold) if bytes.len() > threshold => {
                let compressed = compress(&bytes)?;
                trace!("compressed payload {} -> {}", bytes.len(), compressed.len());
                flags.set(BitSet::COMPRESSED);
                Ok(compressed)
            }
            _ => Ok(bytes),
        }
    }

    fn deserialize(&self, bytes: &[u8], flags: BitSet) -> CacheResult<ItemValue> {
        let inflated;
        let bytes = if flags.is_set(BitSet::COMPRESSED) {
            inflated = decompress(bytes)?;
            &inflated[..]
        } else {
            bytes
        };

        if flags.is_set(BitSet::BINARY_DATA) {
            Ok(ItemValue::Binary(UserBinaryObject::decode(bytes)?.into_bytes()))
        } else {
            Ok(ItemValue::Json(serde_json::from_slice(bytes)?))
        }
    }
}
