use std::io;
use std::io::Read as _;

use flate2::read::{GzDecoder, ZlibDecoder};

/// Raw tile payload bytes.
pub type TileData = Vec<u8>;

pub fn decode_gzip(data: &[u8]) -> Result<Vec<u8>, io::Error> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(decompressed)
}

pub fn decode_zlib(data: &[u8]) -> Result<Vec<u8>, io::Error> {
    let mut decoder = ZlibDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(decompressed)
}

pub fn encode_gzip(data: &[u8]) -> Result<Vec<u8>, io::Error> {
    use std::io::Write as _;
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

pub fn is_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
}

pub fn is_zlib(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x78
}

/// Decompresses gzip/zlib payloads when the magic matches, and passes
/// everything else through untouched.
pub fn maybe_decompress(data: Vec<u8>) -> Result<Vec<u8>, io::Error> {
    if is_gzip(&data) {
        decode_gzip(&data)
    } else if is_zlib(&data) {
        decode_zlib(&data)
    } else {
        Ok(data)
    }
}

/// File extension of a tile request, driving both validation and the
/// response `Content-Type`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TileExtension {
    Png,
    Mvt,
    Json,
    Html,
}

impl TileExtension {
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "png" => Self::Png,
            "mvt" => Self::Mvt,
            "json" => Self::Json,
            "html" => Self::Html,
            _ => None?,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Mvt => "mvt",
            Self::Json => "json",
            Self::Html => "html",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Mvt => "application/x-protobuf",
            Self::Json => "application/json",
            Self::Html => "text/html",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_roundtrip_via_sniffing() {
        let payload = b"not actually a tile".to_vec();
        let compressed = encode_gzip(&payload).unwrap();
        assert!(is_gzip(&compressed));
        assert_eq!(maybe_decompress(compressed).unwrap(), payload);
    }

    #[test]
    fn plain_payload_passes_through() {
        let payload = vec![0x89, 0x50, 0x4e, 0x47];
        assert_eq!(maybe_decompress(payload.clone()).unwrap(), payload);
    }

    #[test]
    fn extension_parsing() {
        assert_eq!(TileExtension::parse("png"), Some(TileExtension::Png));
        assert_eq!(TileExtension::parse("mvt"), Some(TileExtension::Mvt));
        assert_eq!(TileExtension::parse("gif"), None);
        assert_eq!(TileExtension::Json.content_type(), "application/json");
    }
}
