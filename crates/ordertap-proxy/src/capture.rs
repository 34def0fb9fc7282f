//! Capture policy for intercepted responses.
//!
//! Decides which responses are handed to the order parser and keeps a bounded
//! decoded copy of their bodies while the wire bytes are relayed untouched.

use std::io::Read;

use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};

/// Default limit for a captured body.
pub const DEFAULT_CAPTURE_LIMIT: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureState {
    Off,
    Collecting,
    Truncated,
}

/// Bounded copy of a decoded message body.
#[derive(Debug)]
pub struct CaptureBuffer {
    buf: Vec<u8>,
    limit: usize,
    state: CaptureState,
}

impl CaptureBuffer {
    /// Creates a buffer that collects up to `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            state: CaptureState::Collecting,
        }
    }

    /// Creates a buffer that ignores everything.
    pub fn disabled() -> Self {
        Self {
            buf: Vec::new(),
            limit: 0,
            state: CaptureState::Off,
        }
    }

    /// Appends body bytes. Past the limit the buffer is dropped and marked
    /// truncated.
    pub fn extend(&mut self, bytes: &[u8]) {
        if self.state != CaptureState::Collecting {
            return;
        }
        if self.buf.len() + bytes.len() > self.limit {
            self.buf = Vec::new();
            self.state = CaptureState::Truncated;
            return;
        }
        self.buf.extend_from_slice(bytes);
    }

    pub fn is_enabled(&self) -> bool {
        self.state != CaptureState::Off
    }

    pub fn is_truncated(&self) -> bool {
        self.state == CaptureState::Truncated
    }

    /// Returns the collected body, or `None` if capture was off or truncated.
    pub fn into_body(self) -> Option<Vec<u8>> {
        match self.state {
            CaptureState::Collecting => Some(self.buf),
            _ => None,
        }
    }
}

/// Returns true if a response with this content type may carry an order
/// payload. Checked before the body is read. Bodies declared as something
/// other than JSON are skipped.
pub fn wants_body(content_type: Option<&str>) -> bool {
    content_type.map_or(true, is_json_type)
}

/// Returns true if a decoded body should be parsed.
///
/// The body must be non-empty. With a Content-Type it must name JSON; without
/// one the body must start with `{`.
pub fn is_capturable(content_type: Option<&str>, body: &[u8]) -> bool {
    if body.is_empty() {
        return false;
    }
    match content_type {
        Some(content_type) => is_json_type(content_type),
        None => body.trim_ascii_start().first() == Some(&b'{'),
    }
}

fn is_json_type(content_type: &str) -> bool {
    content_type.to_ascii_lowercase().contains("json")
}

/// Undoes `Content-Encoding` for the captured copy.
///
/// Returns `None` for encodings that are not understood, fail to decode, or
/// expand past `limit` bytes.
pub fn decode_content(encoding: Option<&str>, body: Vec<u8>, limit: usize) -> Option<Vec<u8>> {
    let encoding = match encoding.map(str::trim) {
        None | Some("") => return Some(body),
        Some(e) => e.to_ascii_lowercase(),
    };

    let result = match encoding.as_str() {
        "identity" => return Some(body),
        "gzip" | "x-gzip" => inflate(GzDecoder::new(body.as_slice()), limit),
        "deflate" => inflate(ZlibDecoder::new(body.as_slice()), limit)
            .or_else(|_| inflate(DeflateDecoder::new(body.as_slice()), limit)),
        other => {
            tracing::debug!("Skipping capture with content encoding {}", other);
            return None;
        }
    };

    match result {
        Ok(out) if out.len() > limit => {
            tracing::debug!("Decoded {} body exceeds {} bytes, skipping capture", encoding, limit);
            None
        }
        Ok(out) => Some(out),
        Err(e) => {
            tracing::debug!("Failed to decode {} body: {}", encoding, e);
            None
        }
    }
}

/// Reads at most `limit + 1` decoded bytes, enough to detect overflow.
fn inflate<R: Read>(decoder: R, limit: usize) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    decoder
        .take((limit as u64).saturating_add(1))
        .read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::{DeflateEncoder, GzEncoder, ZlibEncoder};
    use flate2::Compression;
    use std::io::Write;

    // ==================== Policy ====================

    #[test]
    fn json_content_type_is_capturable() {
        assert!(is_capturable(Some("application/json"), b"{}"));
        assert!(is_capturable(
            Some("application/vnd.api+json; charset=utf-8"),
            b"[1]"
        ));
    }

    #[test]
    fn html_is_never_capturable() {
        assert!(!is_capturable(Some("text/html"), b"{\"order_id\":1}"));
        assert!(!wants_body(Some("text/html")));
    }

    #[test]
    fn missing_content_type_needs_object_body() {
        assert!(is_capturable(None, b"  \n{\"a\":1}"));
        assert!(!is_capturable(None, b"[{\"a\":1}]"));
        assert!(!is_capturable(None, b"hello"));
    }

    #[test]
    fn empty_body_is_not_capturable() {
        assert!(!is_capturable(Some("application/json"), b""));
        assert!(!is_capturable(None, b""));
    }

    #[test]
    fn wanted_regardless_of_status() {
        // The status line is not consulted; error pages in JSON still reach the parser.
        assert!(wants_body(Some("application/json")));
        assert!(wants_body(Some("application/problem+json")));
        assert!(wants_body(None));
        assert!(!wants_body(Some("text/plain")));
    }

    // ==================== Buffer ====================

    #[test]
    fn buffer_collects_within_limit() {
        let mut capture = CaptureBuffer::new(8);
        capture.extend(b"abcd");
        capture.extend(b"efgh");
        assert!(!capture.is_truncated());
        assert_eq!(capture.into_body().unwrap(), b"abcdefgh");
    }

    #[test]
    fn buffer_truncates_past_limit() {
        let mut capture = CaptureBuffer::new(4);
        capture.extend(b"abc");
        capture.extend(b"de");
        assert!(capture.is_truncated());
        capture.extend(b"f");
        assert!(capture.into_body().is_none());
    }

    #[test]
    fn disabled_buffer_ignores_input() {
        let mut capture = CaptureBuffer::disabled();
        capture.extend(b"abc");
        assert!(!capture.is_enabled());
        assert!(capture.into_body().is_none());
    }

    // ==================== Content-Encoding ====================

    #[test]
    fn decode_gzip_body() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"{\"order_id\":\"1\"}").unwrap();
        let compressed = encoder.finish().unwrap();

        let decoded = decode_content(Some("gzip"), compressed, DEFAULT_CAPTURE_LIMIT).unwrap();
        assert_eq!(decoded, b"{\"order_id\":\"1\"}");
    }

    #[test]
    fn decode_deflate_zlib_and_raw() {
        let mut zlib = ZlibEncoder::new(Vec::new(), Compression::default());
        zlib.write_all(b"{\"a\":1}").unwrap();
        let zlib = zlib.finish().unwrap();
        assert_eq!(decode_content(Some("deflate"), zlib, 64).unwrap(), b"{\"a\":1}");

        let mut raw = DeflateEncoder::new(Vec::new(), Compression::default());
        raw.write_all(b"{\"a\":1}").unwrap();
        let raw = raw.finish().unwrap();
        assert_eq!(decode_content(Some("deflate"), raw, 64).unwrap(), b"{\"a\":1}");
    }

    #[test]
    fn decoded_size_is_bounded() {
        // A few hundred compressed bytes expanding to 1 MiB.
        let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(&vec![b'0'; 1024 * 1024]).unwrap();
        let compressed = encoder.finish().unwrap();
        assert!(compressed.len() < 4096);

        assert!(decode_content(Some("gzip"), compressed.clone(), 64 * 1024).is_none());
        assert_eq!(
            decode_content(Some("gzip"), compressed, 1024 * 1024).unwrap().len(),
            1024 * 1024
        );
    }

    #[test]
    fn decode_identity_and_unknown() {
        assert_eq!(decode_content(None, b"x".to_vec(), 16).unwrap(), b"x");
        assert_eq!(decode_content(Some("identity"), b"x".to_vec(), 16).unwrap(), b"x");
        assert!(decode_content(Some("br"), b"x".to_vec(), 16).is_none());
        assert!(decode_content(Some("gzip"), b"not gzip".to_vec(), 16).is_none());
    }
}
