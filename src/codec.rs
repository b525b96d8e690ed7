//! Artifact encoding helpers
//!
//! Files move through text-only channels (shell redirection into a container,
//! JSON frames to the browser), so their bytes travel as base64.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::{Error, Result};

/// Largest base64 slice written per shell command. Multiple of 4 so every
/// slice decodes on its own.
pub const SHELL_CHUNK_LEN: usize = 64 * 1024;

/// Encode bytes as standard base64
pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode standard base64, tolerating embedded whitespace and a `data:` URI prefix
pub fn decode(text: &str) -> Result<Vec<u8>> {
    let payload = match text.strip_prefix("data:") {
        Some(rest) => rest
            .split_once(";base64,")
            .map(|(_, payload)| payload)
            .ok_or_else(|| Error::InvalidInput("data URI is not base64 encoded".into()))?,
        None => text,
    };

    let cleaned: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    STANDARD
        .decode(cleaned.as_bytes())
        .map_err(|e| Error::InvalidInput(format!("invalid base64 payload: {}", e)))
}

/// Build a `data:<mime>;base64,<payload>` URI
pub fn data_uri(mime: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime, encode(bytes))
}

/// Split encoded text into independently decodable slices of at most `max_len` bytes
pub fn chunks(encoded: &str, max_len: usize) -> Vec<&str> {
    let step = (max_len / 4).max(1) * 4;
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() / step + 1);
    let mut start = 0;
    while start < bytes.len() {
        let end = (start + step).min(bytes.len());
        // base64 is ASCII, so byte offsets are always char boundaries
        out.push(&encoded[start..end]);
        start = end;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_round_trip() {
        let bytes: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        assert_eq!(decode(&encode(&bytes)).unwrap(), bytes);
    }

    #[test]
    fn test_decode_tolerates_line_breaks_and_data_uri() {
        assert_eq!(decode("aGVs\nbG8=\n").unwrap(), b"hello");
        assert_eq!(decode(&data_uri("image/png", b"\x89PNG")).unwrap(), b"\x89PNG");
        assert!(decode("data:text/plain,hello").is_err());
        assert!(decode("@@@").is_err());
    }

    #[test]
    fn test_chunks_decode_independently() {
        let bytes: Vec<u8> = (0..100u8).collect();
        let encoded = encode(&bytes);
        let parts = chunks(&encoded, 10);
        assert!(parts.iter().all(|p| p.len() <= 8));

        let mut rebuilt = Vec::new();
        for part in &parts {
            rebuilt.extend(decode(part).unwrap());
        }
        assert_eq!(rebuilt, bytes);
        assert!(chunks("", 8).is_empty());
    }
}
