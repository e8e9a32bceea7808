//! Body Codec (C2): decompression, binary/text detection, and the sentinel
//! bodies documented in §4.2.

use std::io::Read;

/// Content-Type prefixes decoded as UTF-8 text outright, without sampling.
const TEXT_CONTENT_TYPES: &[&str] = &[
    "application/json",
    "text/",
    "application/xml",
    "application/javascript",
    "application/x-www-form-urlencoded",
];

/// Decompress `buffer` according to `content_encoding`, then decide whether
/// the result is safe to expose as a UTF-8 string or must be replaced with a
/// sentinel (§4.2). `content_type` drives the text/binary heuristic.
pub fn decode_body(buffer: &[u8], content_encoding: Option<&str>, content_type: Option<&str>) -> String {
    let encoding = content_encoding.unwrap_or("").trim().to_ascii_lowercase();

    let decompressed = match encoding.as_str() {
        "gzip" => match gunzip(buffer) {
            Ok(bytes) => bytes,
            Err(_) => return compressed_failure_sentinel("gzip", buffer.len()),
        },
        "deflate" => match inflate(buffer) {
            Ok(bytes) => bytes,
            Err(_) => return compressed_failure_sentinel("deflate", buffer.len()),
        },
        "br" => match un_brotli(buffer) {
            Ok(bytes) => bytes,
            Err(_) => return compressed_failure_sentinel("br", buffer.len()),
        },
        _ => buffer.to_vec(),
    };

    to_safe_string(&decompressed, content_type)
}

fn gunzip(buffer: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(buffer);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

fn inflate(buffer: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = flate2::read::DeflateDecoder::new(buffer);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

fn un_brotli(buffer: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut reader = brotli::Decompressor::new(buffer, 4096);
    reader.read_to_end(&mut out)?;
    Ok(out)
}

/// Apply the text/binary heuristic of §4.2 to already-decompressed bytes.
fn to_safe_string(bytes: &[u8], content_type: Option<&str>) -> String {
    let declared_text = content_type
        .map(|ct| {
            let ct = ct.to_ascii_lowercase();
            TEXT_CONTENT_TYPES.iter().any(|prefix| ct.starts_with(prefix))
        })
        .unwrap_or(false);

    if declared_text {
        return match std::str::from_utf8(bytes) {
            Ok(s) if !s.contains('\u{FFFD}') => s.to_string(),
            _ => binary_sentinel(content_type, bytes.len()),
        };
    }

    if looks_binary(bytes) {
        return binary_sentinel(content_type, bytes.len());
    }

    match std::str::from_utf8(bytes) {
        Ok(s) if !s.contains('\u{FFFD}') => s.to_string(),
        _ => binary_sentinel(content_type, bytes.len()),
    }
}

/// Sample the first 512 bytes for NUL or non-whitespace control characters.
fn looks_binary(bytes: &[u8]) -> bool {
    let sample = &bytes[..bytes.len().min(512)];
    sample
        .iter()
        .any(|&b| b == 0x00 || (b < 0x20 && !matches!(b, b'\t' | b'\r' | b'\n')))
}

fn binary_sentinel(content_type: Option<&str>, n: usize) -> String {
    format!("[Binary content: {}, {} bytes]", content_type.unwrap_or("unknown"), n)
}

fn compressed_failure_sentinel(encoding: &str, n: usize) -> String {
    format!("[Compressed content: {}, {} bytes - decompression failed]", encoding, n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn passes_through_plain_text() {
        let body = decode_body(b"hello world", None, Some("text/plain"));
        assert_eq!(body, "hello world");
    }

    #[test]
    fn decodes_json_without_sampling() {
        let body = decode_body(br#"{"a":1}"#, None, Some("application/json"));
        assert_eq!(body, r#"{"a":1}"#);
    }

    #[test]
    fn detects_binary_by_nul_byte() {
        let bytes = vec![0x00, 0x01, 0x02, 0x03];
        let body = decode_body(&bytes, None, Some("application/octet-stream"));
        assert_eq!(body, "[Binary content: application/octet-stream, 4 bytes]");
    }

    #[test]
    fn decompresses_gzip() {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"hello gzip").unwrap();
        let compressed = encoder.finish().unwrap();

        let body = decode_body(&compressed, Some("gzip"), Some("text/plain"));
        assert_eq!(body, "hello gzip");
    }

    #[test]
    fn gzip_decompression_failure_yields_sentinel() {
        let body = decode_body(b"not actually gzip", Some("gzip"), Some("text/plain"));
        assert_eq!(body, "[Compressed content: gzip, 17 bytes - decompression failed]");
    }

    #[test]
    fn invalid_utf8_is_treated_as_binary() {
        let bytes = vec![0xff, 0xfe, 0xfd];
        let body = decode_body(&bytes, None, None);
        assert_eq!(body, "[Binary content: unknown, 3 bytes]");
    }
}
