//! Wire format for tiles stored in byte-oriented cache backends: a
//! length-delimited record with tagged fields for the payload, the TTL
//! policy, and the response headers.

use prost::Message;

use crate::cacher::{BackendError, CachedTile, TtlPolicy};

#[derive(Clone, PartialEq, Message)]
struct StoredHeader {
    #[prost(string, tag = "1")]
    name: String,
    #[prost(string, tag = "2")]
    value: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
enum StoredPolicy {
    Error = 0,
    Regular = 1,
    Extended = 2,
}

#[derive(Clone, PartialEq, Message)]
struct StoredTile {
    #[prost(bytes = "vec", tag = "1")]
    data: Vec<u8>,
    #[prost(enumeration = "StoredPolicy", tag = "2")]
    policy: i32,
    #[prost(message, repeated, tag = "3")]
    headers: Vec<StoredHeader>,
}

pub fn encode_cached_tile(tile: &CachedTile) -> Vec<u8> {
    let policy = match tile.policy {
        TtlPolicy::Error => StoredPolicy::Error,
        TtlPolicy::Regular => StoredPolicy::Regular,
        TtlPolicy::Extended => StoredPolicy::Extended,
    };
    StoredTile {
        data: tile.data.clone(),
        policy: policy as i32,
        headers: tile
            .headers
            .iter()
            .map(|(name, value)| StoredHeader {
                name: name.clone(),
                value: value.clone(),
            })
            .collect(),
    }
    .encode_to_vec()
}

pub fn decode_cached_tile(bytes: &[u8]) -> Result<CachedTile, BackendError> {
    let stored =
        StoredTile::decode(bytes).map_err(|e| BackendError::Operation(e.to_string()))?;
    let policy = match StoredPolicy::from_i32(stored.policy) {
        Some(StoredPolicy::Error) => TtlPolicy::Error,
        Some(StoredPolicy::Extended) => TtlPolicy::Extended,
        _ => TtlPolicy::Regular,
    };
    Ok(CachedTile {
        data: stored.data,
        headers: stored
            .headers
            .into_iter()
            .map(|header| (header.name, header.value))
            .collect(),
        policy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_record_roundtrip() {
        let tile = CachedTile {
            data: vec![1, 2, 3, 4],
            headers: vec![("Content-Encoding".to_string(), "gzip".to_string())],
            policy: TtlPolicy::Extended,
        };
        let decoded = decode_cached_tile(&encode_cached_tile(&tile)).unwrap();
        assert_eq!(decoded, tile);
    }

    #[test]
    fn garbage_bytes_are_rejected() {
        assert!(decode_cached_tile(&[0xff, 0xff, 0xff]).is_err());
    }
}
