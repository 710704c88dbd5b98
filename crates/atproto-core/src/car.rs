//! Content-addressed block store decoding for firehose commits.
//!
//! A commit frame carries a self-contained CAR bundle of blocks touched by
//! that commit. This module parses the bundle into a CID-keyed block map and
//! extracts the record bytes named by each operation, verifying that the
//! declared content hash matches a recomputed hash of the bytes before
//! handing them off for CBOR decoding.

use std::collections::HashMap;
use std::io::Cursor;

use ipld_core::cid::Cid;
use iroh_car::CarReader;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tracing::{trace, warn};

use crate::AtprotoError;

/// sha2-256 multihash code, per the multihash table.
const SHA2_256_CODE: u64 = 0x12;

/// Parse a CAR byte bundle into a block map keyed by CID string.
pub async fn parse_blocks(car_bytes: &[u8]) -> Result<HashMap<String, Vec<u8>>, AtprotoError> {
    let cursor = Cursor::new(car_bytes);
    let mut reader = CarReader::new(cursor)
        .await
        .map_err(|e| AtprotoError::CarParse(format!("failed to read CAR header: {}", e)))?;

    let mut blocks = HashMap::new();
    loop {
        match reader.next_block().await {
            Ok(Some((cid, data))) => {
                blocks.insert(cid.to_string(), data);
            }
            Ok(None) => break,
            Err(e) => {
                return Err(AtprotoError::CarParse(format!("failed to read block: {}", e)));
            }
        }
    }

    trace!(block_count = blocks.len(), "parsed CAR blocks");
    Ok(blocks)
}

/// Verify that `bytes` hash to `cid` under sha2-256, the only digest algorithm
/// the firehose is known to emit. Unrecognized digest codes are accepted
/// without verification rather than rejected, since a future codec change
/// should not silently start dropping every record.
fn verify_cid(path: &str, cid: &Cid, bytes: &[u8]) -> Result<(), AtprotoError> {
    let hash = cid.hash();
    if hash.code() != SHA2_256_CODE {
        return Ok(());
    }
    let computed = Sha256::digest(bytes);
    if hash.digest() != computed.as_slice() {
        return Err(AtprotoError::CidMismatch {
            path: path.to_string(),
            declared: cid.to_string(),
            computed: format!("{:x}", computed),
        });
    }
    Ok(())
}

/// Look up the bytes for `cid` in `blocks`, verifying the content hash, and
/// decode them from canonical CBOR into `T`.
pub fn decode_block<T: DeserializeOwned>(
    path: &str,
    cid: &Cid,
    blocks: &HashMap<String, Vec<u8>>,
) -> Result<T, AtprotoError> {
    let cid_str = cid.to_string();
    let bytes = blocks
        .get(&cid_str)
        .ok_or_else(|| AtprotoError::CarParse(format!("block not found for {}: {}", path, cid_str)))?;

    if bytes.is_empty() {
        return Err(AtprotoError::CarParse(format!("empty block for {}: {}", path, cid_str)));
    }

    verify_cid(path, cid, bytes)?;

    serde_ipld_dagcbor::from_slice(bytes)
        .map_err(|e| AtprotoError::CborDecode(format!("{} ({}): {}", path, cid_str, e)))
}

/// Parse a record path into `(collection, rkey)`. Either side being empty is
/// malformed.
pub fn parse_record_path(path: &str) -> Option<(&str, &str)> {
    let mut parts = path.splitn(2, '/');
    let collection = parts.next().filter(|s| !s.is_empty())?;
    let rkey = parts.next().filter(|s| !s.is_empty())?;
    Some((collection, rkey))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_record_path_valid() {
        assert_eq!(
            parse_record_path("app.bsky.feed.post/3abc123"),
            Some(("app.bsky.feed.post", "3abc123"))
        );
    }

    #[test]
    fn test_parse_record_path_no_slash() {
        assert_eq!(parse_record_path("app.bsky.feed.post"), None);
    }

    #[test]
    fn test_parse_record_path_empty_collection() {
        assert_eq!(parse_record_path("/3abc123"), None);
    }

    #[test]
    fn test_parse_record_path_empty_rkey() {
        assert_eq!(parse_record_path("app.bsky.feed.post/"), None);
    }

    #[test]
    fn test_parse_record_path_multiple_slashes() {
        // Only the first slash is significant; rkey may contain slashes.
        assert_eq!(
            parse_record_path("app.bsky.feed.post/a/b"),
            Some(("app.bsky.feed.post", "a/b"))
        );
    }

    #[tokio::test]
    async fn test_parse_blocks_empty_data() {
        let result = parse_blocks(&[]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_parse_blocks_invalid_data() {
        let result = parse_blocks(&[0, 1, 2, 3, 4, 5]).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_verify_cid_detects_mismatch() {
        let bytes = b"hello world";
        let digest = Sha256::digest(bytes);
        let wrong_digest = Sha256::digest(b"goodbye world");
        let mh = ipld_core::cid::multihash::Multihash::<64>::wrap(SHA2_256_CODE, &digest).unwrap();
        let wrong_mh =
            ipld_core::cid::multihash::Multihash::<64>::wrap(SHA2_256_CODE, &wrong_digest).unwrap();
        let cid = Cid::new_v1(0x71, mh);
        let wrong_cid = Cid::new_v1(0x71, wrong_mh);

        assert!(verify_cid("x/y", &cid, bytes).is_ok());
        assert!(verify_cid("x/y", &wrong_cid, bytes).is_err());
    }
}
