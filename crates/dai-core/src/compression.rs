// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Result payload compression.
//!
//! Results are gzip-compressed and then base64-encoded. The encoded form must
//! stay shorter than [`MAX_RESULT_LENGTH`]; oversized input is cut to 90% of
//! its length (plus a truncation notice) until it fits. Input longer than
//! [`MAX_RESULT_COMPRESSOR_LENGTH`] characters is cut the same way before
//! compression starts.

use std::io::{Read, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use thiserror::Error;

/// Encoded results must be strictly shorter than this.
pub const MAX_RESULT_LENGTH: usize = 262_140;

/// Longest input (in characters) handed to the compressor.
pub const MAX_RESULT_COMPRESSOR_LENGTH: usize = 33_554_432;

/// Appended whenever results are cut.
pub const TRUNCATION_NOTICE: &str = "\n\n*** Results have been truncated!";

/// What decompressing a missing payload yields.
pub const NULL_RESPONSE: &str = "NULL response received";

/// Errors decoding a stored payload. Not expected for payloads this module wrote.
#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("payload is not valid gzip: {0}")]
    Gzip(#[from] std::io::Error),

    #[error("decompressed payload is not UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Keep the first 90% of `data` (by character) and append the truncation notice.
pub fn reduce_by_ten_percent(data: &str) -> String {
    let keep = data.chars().count() * 9 / 10;
    let end = data
        .char_indices()
        .nth(keep)
        .map_or(data.len(), |(index, _)| index);
    let mut reduced = String::with_capacity(end + TRUNCATION_NOTICE.len());
    reduced.push_str(&data[..end]);
    reduced.push_str(TRUNCATION_NOTICE);
    reduced
}

fn gzip_base64(data: &str) -> String {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    // Writing into a Vec cannot fail.
    let bytes = encoder
        .write_all(data.as_bytes())
        .and_then(|()| encoder.finish())
        .unwrap_or_default();
    STANDARD.encode(bytes)
}

/// Compress `data` for storage, truncating as needed to honour the length limits.
pub fn compress(data: &str) -> String {
    let mut data = data.to_string();
    while data.chars().count() > MAX_RESULT_COMPRESSOR_LENGTH {
        data = reduce_by_ten_percent(&data);
    }
    loop {
        let encoded = gzip_base64(&data);
        if encoded.len() < MAX_RESULT_LENGTH {
            return encoded;
        }
        data = reduce_by_ten_percent(&data);
    }
}

/// Reverse [`compress`]. A missing payload decodes to [`NULL_RESPONSE`].
pub fn decompress(data: Option<&str>) -> Result<String, CompressionError> {
    let Some(data) = data else {
        return Ok(NULL_RESPONSE.to_string());
    };
    let bytes = STANDARD.decode(data)?;
    let mut decoded = Vec::new();
    GzDecoder::new(bytes.as_slice()).read_to_end(&mut decoded)?;
    Ok(String::from_utf8(decoded)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        for text in ["", "ok", "Node R0-CN1 is now active\n", "ünïcødé ✓"] {
            assert_eq!(decompress(Some(&compress(text))).unwrap(), text);
        }
    }

    #[test]
    fn test_null_payload() {
        assert_eq!(decompress(None).unwrap(), NULL_RESPONSE);
    }

    #[test]
    fn test_garbage_payload_is_an_error() {
        assert!(matches!(
            decompress(Some("not base64 !!")),
            Err(CompressionError::Base64(_))
        ));
        let not_gzip = STANDARD.encode(b"plain text");
        assert!(matches!(
            decompress(Some(&not_gzip)),
            Err(CompressionError::Gzip(_))
        ));
    }

    #[test]
    fn test_reduce_by_ten_percent() {
        let reduced = reduce_by_ten_percent("0123456789");
        assert_eq!(reduced, format!("012345678{}", TRUNCATION_NOTICE));
    }

    #[test]
    fn test_reduce_respects_char_boundaries() {
        let reduced = reduce_by_ten_percent("ééééééééééé");
        assert!(reduced.starts_with("éééééééééé"));
        assert!(reduced.ends_with(TRUNCATION_NOTICE));
    }

    #[test]
    fn test_large_compressible_payload_is_kept_whole() {
        let text = "telemetry sample line\n".repeat(200_000);
        let compressed = compress(&text);
        assert!(compressed.len() < MAX_RESULT_LENGTH);
        assert_eq!(decompress(Some(&compressed)).unwrap(), text);
    }

    #[test]
    fn test_incompressible_payload_is_truncated() {
        // xorshift noise does not compress, so the encoded form overflows.
        let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
        let text: String = (0..400_000)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                char::from(b'!' + (state % 90) as u8)
            })
            .collect();

        let compressed = compress(&text);
        assert!(compressed.len() < MAX_RESULT_LENGTH);

        let restored = decompress(Some(&compressed)).unwrap();
        assert!(restored.ends_with(TRUNCATION_NOTICE));
        let prefix = restored.split(TRUNCATION_NOTICE).next().unwrap();
        assert!(text.starts_with(prefix));
        assert!(restored.len() < text.len());
    }
}
