//! Snapshot container format
//!
//! ```text
//! magic "WEFT" | version u16 | flags u16 | dimension u32 | payload_len u64 | blake3(payload) [32]
//! payload = zstd(bincode(T))
//! ```
//!
//! All integers are little endian. The header is validated (magic,
//! version, dimension) before the payload is touched, so an incompatible
//! snapshot is rejected without decompressing anything.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub const MAGIC: &[u8; 4] = b"WEFT";
pub const FORMAT_VERSION: u16 = 1;
pub const HEADER_LEN: usize = 4 + 2 + 2 + 4 + 8 + 32;

const FLAG_SLIM: u16 = 1;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Snapshot truncated: {0} bytes")]
    Truncated(usize),

    #[error("Not a snapshot (bad magic)")]
    BadMagic,

    #[error("Unsupported snapshot version {0}")]
    UnsupportedVersion(u16),

    #[error("Dimension mismatch: expected {expected}, snapshot has {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("Snapshot checksum mismatch")]
    ChecksumMismatch,

    #[error("Compression error: {0}")]
    Compression(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub version: u16,
    pub slim: bool,
    pub dimension: usize,
    pub payload_len: u64,
}

/// Encode `payload` into a snapshot
pub fn encode<T: Serialize>(
    payload: &T,
    dimension: usize,
    slim: bool,
    compression_level: i32,
) -> Result<Vec<u8>, SnapshotError> {
    let raw = bincode::serialize(payload)?;
    let compressed = zstd::encode_all(&raw[..], compression_level)?;
    let checksum = blake3::hash(&compressed);

    let mut out = Vec::with_capacity(HEADER_LEN + compressed.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&(if slim { FLAG_SLIM } else { 0 }).to_le_bytes());
    out.extend_from_slice(&(dimension as u32).to_le_bytes());
    out.extend_from_slice(&(compressed.len() as u64).to_le_bytes());
    out.extend_from_slice(checksum.as_bytes());
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Read and validate the header only
pub fn read_header(bytes: &[u8]) -> Result<SnapshotHeader, SnapshotError> {
    if bytes.len() < HEADER_LEN {
        return Err(SnapshotError::Truncated(bytes.len()));
    }
    if &bytes[0..4] != MAGIC {
        return Err(SnapshotError::BadMagic);
    }

    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != FORMAT_VERSION {
        return Err(SnapshotError::UnsupportedVersion(version));
    }
    let flags = u16::from_le_bytes([bytes[6], bytes[7]]);
    let dimension = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    let mut len = [0u8; 8];
    len.copy_from_slice(&bytes[12..20]);

    Ok(SnapshotHeader {
        version,
        slim: flags & FLAG_SLIM != 0,
        dimension,
        payload_len: u64::from_le_bytes(len),
    })
}

/// Decode a snapshot, refusing it when its dimension differs from
/// `expected_dimension`
pub fn decode<T: DeserializeOwned>(
    bytes: &[u8],
    expected_dimension: usize,
) -> Result<(SnapshotHeader, T), SnapshotError> {
    let header = read_header(bytes)?;
    if header.dimension != expected_dimension {
        return Err(SnapshotError::DimensionMismatch {
            expected: expected_dimension,
            found: header.dimension,
        });
    }

    let payload = &bytes[HEADER_LEN..];
    if payload.len() as u64 != header.payload_len {
        return Err(SnapshotError::Truncated(bytes.len()));
    }
    if blake3::hash(payload).as_bytes() != &bytes[20..HEADER_LEN] {
        return Err(SnapshotError::ChecksumMismatch);
    }

    let raw = zstd::decode_all(payload)?;
    let value = bincode::deserialize(&raw)?;
    Ok((header, value))
}
