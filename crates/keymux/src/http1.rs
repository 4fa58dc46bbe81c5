//! Hand-rolled HTTP/1.1 framing over tokio streams.
//!
//! Request and response heads, body framing (Content-Length, chunked,
//! read-to-EOF), and streaming copies that flush after every chunk so
//! server-sent-event responses pass through unbuffered. The intercept
//! engine, the plain-HTTP forwarder, and the authorizer client all speak
//! HTTP through this module.
//!
//! Chunked bodies are relayed verbatim (framing bytes included); the proxy
//! never re-frames what the origin sent.

use crate::error::{ProxyError, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum total size of HTTP headers (64 KiB). Prevents OOM from
/// malicious clients sending unbounded header data.
pub const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Maximum buffered request body size (16 MiB).
pub const MAX_REQUEST_BODY: usize = 16 * 1024 * 1024;

/// Ordered header list with case-insensitive lookup.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`, case-insensitive.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace every value of `name` with a single entry, preserving the
    /// position of the first occurrence; appends when absent.
    pub fn set(&mut self, name: &str, value: &str) {
        let mut replaced = false;
        self.entries.retain_mut(|(n, v)| {
            if n.eq_ignore_ascii_case(name) {
                if replaced {
                    return false;
                }
                replaced = true;
                *v = value.to_string();
            }
            true
        });
        if !replaced {
            self.entries.push((name.to_string(), value.to_string()));
        }
    }

    /// Remove every entry named `name`, case-insensitive.
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn push(&mut self, name: &str, value: &str) {
        self.entries.push((name.to_string(), value.to_string()));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when a `Connection` header asks to close after this exchange.
    #[must_use]
    pub fn wants_close(&self) -> bool {
        self.get("connection")
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("close")))
            .unwrap_or(false)
    }

    fn encode_into(&self, out: &mut String) {
        for (name, value) in &self.entries {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
    }
}

/// Parsed request line and headers.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    /// Request target exactly as received: origin-form (`/v1/models?key=x`)
    /// or absolute-form / authority-form for proxy requests.
    pub target: String,
    pub version: String,
    pub headers: Headers,
}

impl RequestHead {
    /// Serialize back to wire format, including the blank line.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut out = format!("{} {} {}\r\n", self.method, self.target, self.version);
        self.headers.encode_into(&mut out);
        out.push_str("\r\n");
        out
    }
}

/// Parsed status line and headers.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

impl ResponseHead {
    /// Serialize back to wire format, including the blank line.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut out = if self.reason.is_empty() {
            format!("{} {}\r\n", self.version, self.status)
        } else {
            format!("{} {} {}\r\n", self.version, self.status, self.reason)
        };
        self.headers.encode_into(&mut out);
        out.push_str("\r\n");
        out
    }
}

/// How the message body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// Exactly this many bytes.
    Length(u64),
    /// `Transfer-Encoding: chunked`; relayed verbatim.
    Chunked,
    /// Delimited by connection close.
    ToEof,
    /// No body at all.
    None,
}

/// Read one request head from the stream.
///
/// Returns `Ok(None)` on clean EOF before any request bytes (the client is
/// done with the connection). Tolerates stray blank lines between pipelined
/// requests.
pub async fn read_request_head<R>(reader: &mut R) -> Result<Option<RequestHead>>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        if !line.trim().is_empty() {
            break;
        }
    }

    let request_line = line.trim_end();
    let mut parts = request_line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) if v.starts_with("HTTP/") => {
            (m.to_string(), t.to_string(), v.to_string())
        }
        _ => {
            return Err(ProxyError::HttpParse(format!(
                "malformed request line: {}",
                request_line
            )))
        }
    };

    let headers = read_headers(reader).await?;
    Ok(Some(RequestHead {
        method,
        target,
        version,
        headers,
    }))
}

/// Read one response head from the stream.
pub async fn read_response_head<R>(reader: &mut R) -> Result<ResponseHead>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(ProxyError::HttpParse(
            "connection closed before response status line".to_string(),
        ));
    }

    let status_line = line.trim_end();
    let mut parts = status_line.splitn(3, ' ');
    let version = parts
        .next()
        .filter(|v| v.starts_with("HTTP/"))
        .ok_or_else(|| ProxyError::HttpParse(format!("malformed status line: {}", status_line)))?
        .to_string();
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ProxyError::HttpParse(format!("malformed status line: {}", status_line)))?;
    let reason = parts.next().unwrap_or("").to_string();

    let headers = read_headers(reader).await?;
    Ok(ResponseHead {
        version,
        status,
        reason,
        headers,
    })
}

async fn read_headers<R>(reader: &mut R) -> Result<Headers>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut headers = Headers::new();
    let mut total = 0usize;
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(ProxyError::HttpParse(
                "connection closed inside headers".to_string(),
            ));
        }
        total += n;
        if total > MAX_HEADER_SIZE {
            return Err(ProxyError::HeadersTooLarge);
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            return Ok(headers);
        }
        let (name, value) = trimmed.split_once(':').ok_or_else(|| {
            ProxyError::HttpParse(format!("malformed header line: {}", trimmed))
        })?;
        headers.push(name.trim(), value.trim());
    }
}

/// Determine how a request body is framed.
pub fn request_body_framing(head: &RequestHead) -> Result<BodyFraming> {
    if let Some(te) = head.headers.get("transfer-encoding") {
        if te
            .split(',')
            .any(|t| t.trim().eq_ignore_ascii_case("chunked"))
        {
            return Ok(BodyFraming::Chunked);
        }
        return Err(ProxyError::HttpParse(format!(
            "unsupported transfer encoding: {}",
            te
        )));
    }
    match head.headers.get("content-length") {
        Some(v) => {
            let len: u64 = v.trim().parse().map_err(|_| {
                ProxyError::HttpParse(format!("invalid content-length: {}", v))
            })?;
            Ok(BodyFraming::Length(len))
        }
        None => Ok(BodyFraming::None),
    }
}

/// Determine how a response body is framed, given the request method.
#[must_use]
pub fn response_body_framing(request_method: &str, head: &ResponseHead) -> BodyFraming {
    if request_method.eq_ignore_ascii_case("HEAD")
        || head.status / 100 == 1
        || head.status == 204
        || head.status == 304
    {
        return BodyFraming::None;
    }
    if let Some(te) = head.headers.get("transfer-encoding") {
        if te
            .split(',')
            .any(|t| t.trim().eq_ignore_ascii_case("chunked"))
        {
            return BodyFraming::Chunked;
        }
        return BodyFraming::ToEof;
    }
    match head
        .headers
        .get("content-length")
        .and_then(|v| v.trim().parse().ok())
    {
        Some(len) => BodyFraming::Length(len),
        None => BodyFraming::ToEof,
    }
}

/// Read an entire request body into memory, honoring the framing.
///
/// Chunked bodies are captured verbatim, framing bytes included, so they
/// can be forwarded without re-encoding. `cap` bounds the buffered size.
pub async fn read_body<R>(reader: &mut R, framing: BodyFraming, cap: usize) -> Result<Vec<u8>>
where
    R: AsyncBufReadExt + Unpin,
{
    match framing {
        BodyFraming::None => Ok(Vec::new()),
        BodyFraming::Length(len) => {
            let len = usize::try_from(len)
                .map_err(|_| ProxyError::HttpParse("content-length overflow".to_string()))?;
            if len > cap {
                return Err(ProxyError::BodyTooLarge);
            }
            let mut body = vec![0u8; len];
            reader.read_exact(&mut body).await?;
            Ok(body)
        }
        BodyFraming::Chunked => read_chunked_raw(reader, cap).await,
        BodyFraming::ToEof => {
            // Requests are never EOF-delimited; nothing to read here.
            Err(ProxyError::HttpParse(
                "EOF-delimited request body".to_string(),
            ))
        }
    }
}

/// Capture a chunked body verbatim (sizes, extensions, trailers and all).
async fn read_chunked_raw<R>(reader: &mut R, cap: usize) -> Result<Vec<u8>>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut raw = Vec::new();
    loop {
        let mut size_line = String::new();
        let n = reader.read_line(&mut size_line).await?;
        if n == 0 {
            return Err(ProxyError::HttpParse(
                "connection closed inside chunked body".to_string(),
            ));
        }
        raw.extend_from_slice(size_line.as_bytes());

        let size_text = size_line
            .trim_end()
            .split(';')
            .next()
            .unwrap_or("")
            .trim();
        let size = usize::from_str_radix(size_text, 16).map_err(|_| {
            ProxyError::HttpParse(format!("invalid chunk size: {}", size_text))
        })?;

        if raw.len() + size + 2 > cap {
            return Err(ProxyError::BodyTooLarge);
        }

        if size == 0 {
            // Trailer section up to the blank line.
            loop {
                let mut trailer = String::new();
                let n = reader.read_line(&mut trailer).await?;
                if n == 0 {
                    return Err(ProxyError::HttpParse(
                        "connection closed inside chunk trailers".to_string(),
                    ));
                }
                raw.extend_from_slice(trailer.as_bytes());
                if trailer.trim().is_empty() {
                    return Ok(raw);
                }
            }
        }

        let mut chunk = vec![0u8; size + 2]; // data + CRLF
        reader.read_exact(&mut chunk).await?;
        raw.extend_from_slice(&chunk);
    }
}

/// Read a response body into memory with chunked framing decoded, for
/// callers that need the payload itself (e.g. parsing a JSON reply).
pub async fn read_decoded_body<R>(
    reader: &mut R,
    framing: BodyFraming,
    cap: usize,
) -> Result<Vec<u8>>
where
    R: AsyncBufReadExt + Unpin,
{
    match framing {
        BodyFraming::None => Ok(Vec::new()),
        BodyFraming::Length(_) => read_body(reader, framing, cap).await,
        BodyFraming::ToEof => {
            let mut body = Vec::new();
            let mut buf = [0u8; 8192];
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    return Ok(body);
                }
                if body.len() + n > cap {
                    return Err(ProxyError::BodyTooLarge);
                }
                body.extend_from_slice(&buf[..n]);
            }
        }
        BodyFraming::Chunked => {
            let mut body = Vec::new();
            loop {
                let mut size_line = String::new();
                let n = reader.read_line(&mut size_line).await?;
                if n == 0 {
                    return Err(ProxyError::HttpParse(
                        "connection closed inside chunked body".to_string(),
                    ));
                }
                let size_text = size_line
                    .trim_end()
                    .split(';')
                    .next()
                    .unwrap_or("")
                    .trim();
                let size = usize::from_str_radix(size_text, 16).map_err(|_| {
                    ProxyError::HttpParse(format!("invalid chunk size: {}", size_text))
                })?;
                if size == 0 {
                    // Drain trailers.
                    loop {
                        let mut trailer = String::new();
                        let n = reader.read_line(&mut trailer).await?;
                        if n == 0 || trailer.trim().is_empty() {
                            return Ok(body);
                        }
                    }
                }
                if body.len() + size > cap {
                    return Err(ProxyError::BodyTooLarge);
                }
                let mut chunk = vec![0u8; size + 2];
                reader.read_exact(&mut chunk).await?;
                body.extend_from_slice(&chunk[..size]);
            }
        }
    }
}

/// Stream a body from `reader` to `writer`, flushing after every chunk so
/// streamed responses (SSE, chunked JSON) are never held back.
pub async fn stream_body<R, W>(reader: &mut R, writer: &mut W, framing: BodyFraming) -> Result<()>
where
    R: AsyncBufReadExt + Unpin,
    W: AsyncWrite + Unpin,
{
    match framing {
        BodyFraming::None => Ok(()),
        BodyFraming::Length(len) => {
            let mut remaining = len;
            let mut buf = [0u8; 8192];
            while remaining > 0 {
                let want = buf.len().min(usize::try_from(remaining).unwrap_or(buf.len()));
                let n = reader.read(&mut buf[..want]).await?;
                if n == 0 {
                    return Err(ProxyError::HttpParse(
                        "connection closed mid-body".to_string(),
                    ));
                }
                writer.write_all(&buf[..n]).await?;
                writer.flush().await?;
                remaining -= n as u64;
            }
            Ok(())
        }
        BodyFraming::Chunked => stream_chunked(reader, writer).await,
        BodyFraming::ToEof => {
            let mut buf = [0u8; 8192];
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    return Ok(());
                }
                writer.write_all(&buf[..n]).await?;
                writer.flush().await?;
            }
        }
    }
}

/// Relay a chunked body verbatim, flushing after each complete chunk.
async fn stream_chunked<R, W>(reader: &mut R, writer: &mut W) -> Result<()>
where
    R: AsyncBufReadExt + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let mut size_line = String::new();
        let n = reader.read_line(&mut size_line).await?;
        if n == 0 {
            return Err(ProxyError::HttpParse(
                "connection closed inside chunked body".to_string(),
            ));
        }
        writer.write_all(size_line.as_bytes()).await?;

        let size_text = size_line
            .trim_end()
            .split(';')
            .next()
            .unwrap_or("")
            .trim();
        let size = usize::from_str_radix(size_text, 16).map_err(|_| {
            ProxyError::HttpParse(format!("invalid chunk size: {}", size_text))
        })?;

        if size == 0 {
            loop {
                let mut trailer = String::new();
                let n = reader.read_line(&mut trailer).await?;
                if n == 0 {
                    return Err(ProxyError::HttpParse(
                        "connection closed inside chunk trailers".to_string(),
                    ));
                }
                writer.write_all(trailer.as_bytes()).await?;
                if trailer.trim().is_empty() {
                    writer.flush().await?;
                    return Ok(());
                }
            }
        }

        let mut remaining = size + 2; // data + CRLF
        let mut buf = [0u8; 8192];
        while remaining > 0 {
            let want = buf.len().min(remaining);
            let n = reader.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(ProxyError::HttpParse(
                    "connection closed mid-chunk".to_string(),
                ));
            }
            writer.write_all(&buf[..n]).await?;
            remaining -= n;
        }
        writer.flush().await?;
    }
}

/// Serialize a plain-text response, the shape every synthesized error
/// takes. `close` appends `Connection: close` for one-shot connections;
/// rejects on keep-alive sessions leave it off.
#[must_use]
pub fn plain_text_response(version: &str, status: u16, reason: &str, body: &str, close: bool) -> String {
    let connection = if close { "Connection: close\r\n" } else { "" };
    format!(
        "{} {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n{}\r\n{}",
        version,
        status,
        reason,
        body.len(),
        connection,
        body
    )
}

/// Standard reason phrase for the handful of statuses the proxy synthesizes.
#[must_use]
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}
