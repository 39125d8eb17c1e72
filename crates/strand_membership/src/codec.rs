//! Wire codec for serialized nodes configurations.
//!
//! Frame layout:
//!
//! ```text
//! [0..4)   magic  b"SNC1"
//! [4..12)  config version, big-endian u64
//! [12..16) crc32 of the body, big-endian u32
//! [16..]   serde_json body
//! ```
//!
//! The version lives in the fixed header so consumers can decide whether a
//! blob is stale without paying for a full parse.

use anyhow::{bail, Context};
use bytes::Bytes;

use crate::config::{ConfigVersion, NodesConfiguration};

const MAGIC: [u8; 4] = *b"SNC1";
const HEADER_LEN: usize = 16;

/// Cheap header-only version extraction. Returns `None` for blobs too short
/// or carrying the wrong magic.
pub fn extract_version(blob: &[u8]) -> Option<ConfigVersion> {
    if blob.len() < HEADER_LEN || blob[0..4] != MAGIC {
        return None;
    }
    let mut version = [0u8; 8];
    version.copy_from_slice(&blob[4..12]);
    Some(u64::from_be_bytes(version))
}

pub fn serialize(config: &NodesConfiguration) -> anyhow::Result<Bytes> {
    let body = serde_json::to_vec(config).context("encode nodes configuration body")?;
    let mut framed = Vec::with_capacity(HEADER_LEN + body.len());
    framed.extend_from_slice(&MAGIC);
    framed.extend_from_slice(&config.version().to_be_bytes());
    framed.extend_from_slice(&crc32fast::hash(&body).to_be_bytes());
    framed.extend_from_slice(&body);
    Ok(Bytes::from(framed))
}

pub fn deserialize(blob: &[u8]) -> anyhow::Result<NodesConfiguration> {
    if blob.len() < HEADER_LEN {
        bail!("blob too short for a nodes configuration frame: {} bytes", blob.len());
    }
    if blob[0..4] != MAGIC {
        bail!("bad nodes configuration frame magic");
    }
    let header_version = extract_version(blob).context("extract header version")?;

    let mut crc = [0u8; 4];
    crc.copy_from_slice(&blob[12..16]);
    let expected_crc = u32::from_be_bytes(crc);
    let body = &blob[HEADER_LEN..];
    let actual_crc = crc32fast::hash(body);
    if actual_crc != expected_crc {
        bail!("nodes configuration body checksum mismatch: expected {expected_crc:#010x}, got {actual_crc:#010x}");
    }

    let config: NodesConfiguration =
        serde_json::from_slice(body).context("decode nodes configuration body")?;
    if config.version() != header_version {
        bail!(
            "frame header version {} disagrees with body version {}",
            header_version,
            config.version()
        );
    }
    Ok(config)
}

/// Human-readable rendering for trace samples. Falls back to a placeholder
/// instead of failing.
pub fn debug_json(config: &NodesConfiguration) -> String {
    serde_json::to_string(config).unwrap_or_else(|_| "<unencodable>".to_string())
}
