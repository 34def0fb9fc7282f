//! HTTP/1.1 message framing.
//!
//! Heads are parsed for routing decisions but relayed from their raw bytes, so
//! header order and case survive. Bodies are streamed: every byte read from
//! one side is written to the other as-is (chunk framing included) while the
//! decoded payload is fed to a [`CaptureBuffer`].

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::capture::CaptureBuffer;
use crate::error::CodecError;

/// Maximum size of a start line plus headers.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Maximum size of a chunk-size or trailer line.
const MAX_LINE_SIZE: usize = 8 * 1024;

type CodecResult<T> = std::result::Result<T, CodecError>;

// =============================================================================
// Headers
// =============================================================================

/// Header fields in wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    /// Returns the first value of the named header (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns every value of the named header.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Checks a comma-separated header for a token (case-insensitive).
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Copies the fields out, for building an exchange record.
    pub fn to_vec(&self) -> Vec<(String, String)> {
        self.fields.clone()
    }

    fn parse(lines: &[&str]) -> CodecResult<Self> {
        let mut fields: Vec<(String, String)> = Vec::with_capacity(lines.len());
        for line in lines {
            if line.starts_with(|c: char| c == ' ' || c == '\t') {
                // obsolete line folding
                let (_, value) = fields
                    .last_mut()
                    .ok_or_else(|| CodecError::Header(line.to_string()))?;
                value.push(' ');
                value.push_str(line.trim());
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| CodecError::Header(line.to_string()))?;
            if name.is_empty() || name.contains(char::is_whitespace) {
                return Err(CodecError::Header(line.to_string()));
            }
            fields.push((name.to_string(), value.trim().to_string()));
        }
        Ok(Self { fields })
    }
}

fn wants_close(version: &str, headers: &Headers) -> bool {
    if headers.has_token("connection", "close") {
        return true;
    }
    version.eq_ignore_ascii_case("HTTP/1.0") && !headers.has_token("connection", "keep-alive")
}

// =============================================================================
// Message Heads
// =============================================================================

/// A parsed request line and headers.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    /// Request target as sent (origin, absolute or authority form).
    pub target: String,
    pub version: String,
    pub headers: Headers,
    raw: Vec<u8>,
    /// Length of the start line including its line ending.
    line_len: usize,
}

impl RequestHead {
    /// The head exactly as received.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Re-encodes the head with a different request target.
    ///
    /// Header bytes are kept verbatim.
    pub fn encode_with_target(&self, target: &str) -> Vec<u8> {
        let fields = &self.raw[self.line_len..];
        let mut out = Vec::with_capacity(fields.len() + target.len() + 32);
        out.extend_from_slice(
            format!("{} {} {}\r\n", self.method, target, self.version).as_bytes(),
        );
        out.extend_from_slice(fields);
        out
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Returns true if the connection must close after this exchange.
    pub fn wants_close(&self) -> bool {
        wants_close(&self.version, &self.headers)
    }
}

/// A parsed status line and headers.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    raw: Vec<u8>,
}

impl ResponseHead {
    /// The head exactly as received.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// 1xx responses other than 101 precede the final response.
    pub fn is_interim(&self) -> bool {
        (100..200).contains(&self.status) && self.status != 101
    }

    pub fn wants_close(&self) -> bool {
        wants_close(&self.version, &self.headers)
    }
}

struct RawHead {
    raw: Vec<u8>,
    /// Line boundaries within `raw`, line endings excluded.
    lines: Vec<(usize, usize)>,
}

impl RawHead {
    fn line(&self, index: usize) -> String {
        let (start, end) = self.lines[index];
        String::from_utf8_lossy(&self.raw[start..end]).into_owned()
    }

    /// Offset just past the start line's line ending.
    fn start_line_len(&self) -> usize {
        self.lines
            .get(1)
            .map(|(start, _)| *start)
            .unwrap_or(self.raw.len() - blank_line_len(&self.raw))
    }

    fn header_lines(&self) -> Vec<String> {
        (1..self.lines.len()).map(|i| self.line(i)).collect()
    }
}

fn blank_line_len(raw: &[u8]) -> usize {
    if raw.ends_with(b"\r\n") {
        2
    } else {
        1
    }
}

/// Reads lines up to and including the blank line ending a head.
///
/// Returns `None` on a clean EOF before any byte of a new message.
async fn read_raw_head<R>(reader: &mut R) -> CodecResult<Option<RawHead>>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();
    let mut lines = Vec::new();
    let mut head_start = 0;

    loop {
        let remaining = MAX_HEAD_SIZE.saturating_sub(raw.len());
        if remaining == 0 {
            return Err(CodecError::HeadTooLarge(MAX_HEAD_SIZE));
        }

        let start = raw.len();
        let n = (&mut *reader)
            .take(remaining as u64)
            .read_until(b'\n', &mut raw)
            .await?;
        if n == 0 {
            if lines.is_empty() {
                return Ok(None);
            }
            return Err(CodecError::UnexpectedEof);
        }
        if raw.last() != Some(&b'\n') {
            if raw.len() >= MAX_HEAD_SIZE {
                return Err(CodecError::HeadTooLarge(MAX_HEAD_SIZE));
            }
            return Err(CodecError::UnexpectedEof);
        }

        let mut end = raw.len() - 1;
        if end > start && raw[end - 1] == b'\r' {
            end -= 1;
        }

        if end == start {
            if lines.is_empty() {
                // stray line endings between messages
                head_start = raw.len();
                continue;
            }
            break;
        }
        lines.push((start - head_start, end - head_start));
    }

    raw.drain(..head_start);
    Ok(Some(RawHead { raw, lines }))
}

/// Reads a request head.
///
/// Returns `Ok(None)` if the peer closed the connection between messages.
pub async fn read_request_head<R>(reader: &mut R) -> CodecResult<Option<RequestHead>>
where
    R: AsyncBufRead + Unpin,
{
    let Some(head) = read_raw_head(reader).await? else {
        return Ok(None);
    };

    let line = head.line(0);
    let mut parts = line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(CodecError::StartLine(line));
    };
    if !version.to_ascii_uppercase().starts_with("HTTP/") {
        return Err(CodecError::StartLine(line));
    }

    let headers = Headers::parse(
        &head
            .header_lines()
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>(),
    )?;

    Ok(Some(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers,
        line_len: head.start_line_len(),
        raw: head.raw,
    }))
}

/// Reads a response head.
///
/// Returns `Ok(None)` if the peer closed the connection before responding.
pub async fn read_response_head<R>(reader: &mut R) -> CodecResult<Option<ResponseHead>>
where
    R: AsyncBufRead + Unpin,
{
    let Some(head) = read_raw_head(reader).await? else {
        return Ok(None);
    };

    let line = head.line(0);
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.to_ascii_uppercase().starts_with("HTTP/") {
        return Err(CodecError::StartLine(line));
    }
    let status = parts
        .next()
        .filter(|code| code.len() == 3)
        .and_then(|code| code.parse::<u16>().ok())
        .filter(|code| (100..1000).contains(code))
        .ok_or_else(|| CodecError::StartLine(line.clone()))?;
    let reason = parts.next().unwrap_or_default().trim().to_string();

    let headers = Headers::parse(
        &head
            .header_lines()
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>(),
    )?;

    Ok(Some(ResponseHead {
        version: version.to_string(),
        status,
        reason,
        headers,
        raw: head.raw,
    }))
}

// =============================================================================
// Body Framing
// =============================================================================

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body.
    Empty,
    /// Exactly this many bytes.
    Length(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// Everything until the peer closes.
    UntilEof,
}

impl BodyFraming {
    /// Framing of a request body.
    pub fn for_request(head: &RequestHead) -> CodecResult<Self> {
        Ok(declared_framing(&head.headers)?.unwrap_or(Self::Empty))
    }

    /// Framing of a response body, given the method of the request it answers.
    pub fn for_response(head: &ResponseHead, request_method: &str) -> CodecResult<Self> {
        if request_method.eq_ignore_ascii_case("HEAD")
            || head.status < 200
            || head.status == 204
            || head.status == 304
        {
            return Ok(Self::Empty);
        }
        match declared_framing(&head.headers)? {
            Some(framing) => Ok(framing),
            None if head.wants_close() => Ok(Self::UntilEof),
            None => Ok(Self::Empty),
        }
    }
}

fn declared_framing(headers: &Headers) -> CodecResult<Option<BodyFraming>> {
    if headers.has_token("transfer-encoding", "chunked") {
        return Ok(Some(BodyFraming::Chunked));
    }

    let mut length: Option<u64> = None;
    for value in headers.get_all("content-length").flat_map(|v| v.split(',')) {
        let parsed = value
            .trim()
            .parse::<u64>()
            .map_err(|_| CodecError::ContentLength(value.to_string()))?;
        match length {
            Some(existing) if existing != parsed => {
                return Err(CodecError::ContentLength(value.to_string()))
            }
            _ => length = Some(parsed),
        }
    }

    Ok(length.map(|n| {
        if n == 0 {
            BodyFraming::Empty
        } else {
            BodyFraming::Length(n)
        }
    }))
}

// =============================================================================
// Body Relay
// =============================================================================

/// Copies one body from `reader` to `writer` and feeds its decoded bytes to
/// `capture`.
///
/// Wire bytes are written unchanged. Returns the decoded body length.
pub async fn relay_body<R, W>(
    reader: &mut R,
    writer: &mut W,
    framing: BodyFraming,
    capture: &mut CaptureBuffer,
) -> CodecResult<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match framing {
        BodyFraming::Empty => Ok(0),
        BodyFraming::Length(n) => {
            copy_exact(reader, writer, n, capture).await?;
            Ok(n)
        }
        BodyFraming::UntilEof => copy_to_eof(reader, writer, capture).await,
        BodyFraming::Chunked => relay_chunked(reader, writer, capture).await,
    }
}

/// Reads and decodes one body, failing if it exceeds `limit` bytes.
pub async fn read_body<R>(reader: &mut R, framing: BodyFraming, limit: usize) -> CodecResult<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut capture = CaptureBuffer::new(limit);
    relay_body(reader, &mut tokio::io::sink(), framing, &mut capture).await?;
    capture.into_body().ok_or(CodecError::BodyTooLarge(limit))
}

async fn copy_exact<R, W>(
    reader: &mut R,
    writer: &mut W,
    len: u64,
    capture: &mut CaptureBuffer,
) -> CodecResult<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut remaining = len;
    while remaining > 0 {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Err(CodecError::UnexpectedEof);
        }
        let take = remaining.min(buf.len() as u64) as usize;
        writer.write_all(&buf[..take]).await?;
        capture.extend(&buf[..take]);
        reader.consume(take);
        remaining -= take as u64;
    }
    Ok(())
}

async fn copy_to_eof<R, W>(reader: &mut R, writer: &mut W, capture: &mut CaptureBuffer) -> CodecResult<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(total);
        }
        let len = buf.len();
        writer.write_all(buf).await?;
        capture.extend(buf);
        reader.consume(len);
        total += len as u64;
    }
}

async fn relay_chunked<R, W>(reader: &mut R, writer: &mut W, capture: &mut CaptureBuffer) -> CodecResult<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    loop {
        let size_line = read_line(reader).await?;
        writer.write_all(&size_line).await?;
        let size = parse_chunk_size(&size_line)?;

        if size == 0 {
            // trailer section, ended by a blank line
            loop {
                let trailer = read_line(reader).await?;
                writer.write_all(&trailer).await?;
                if is_blank(&trailer) {
                    return Ok(total);
                }
            }
        }

        copy_exact(reader, writer, size, capture).await?;
        total += size;

        let terminator = read_line(reader).await?;
        writer.write_all(&terminator).await?;
        if !is_blank(&terminator) {
            return Err(CodecError::Chunk(
                String::from_utf8_lossy(&terminator).into_owned(),
            ));
        }
    }
}

/// Reads one line including its ending.
async fn read_line<R>(reader: &mut R) -> CodecResult<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let n = (&mut *reader)
        .take(MAX_LINE_SIZE as u64)
        .read_until(b'\n', &mut line)
        .await?;
    if n == 0 {
        return Err(CodecError::UnexpectedEof);
    }
    if line.last() != Some(&b'\n') {
        if line.len() >= MAX_LINE_SIZE {
            return Err(CodecError::Chunk("line too long".to_string()));
        }
        return Err(CodecError::UnexpectedEof);
    }
    Ok(line)
}

fn is_blank(line: &[u8]) -> bool {
    line == b"\r\n" || line == b"\n"
}

fn parse_chunk_size(line: &[u8]) -> CodecResult<u64> {
    let text = String::from_utf8_lossy(line);
    let size = text.split(';').next().unwrap_or_default().trim();
    if size.is_empty() {
        return Err(CodecError::Chunk(text.into_owned()));
    }
    u64::from_str_radix(size, 16).map_err(|_| CodecError::Chunk(text.into_owned()))
}
