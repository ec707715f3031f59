//! HTTP/1.x message reader over a reassembled byte stream

use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version};
use promptdump_core::config::CorrelationSettings;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::debug;

/// Maximum number of headers in one message head
pub const MAX_HEADERS: usize = 64;

/// Longest accepted chunk-size or trailer line
const MAX_CHUNK_LINE: usize = 4096;

/// Message reader error type
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("end of stream")]
    EndOfStream,

    #[error("stream ended inside a message head")]
    Truncated,

    #[error("malformed HTTP message: {0}")]
    Malformed(String),

    #[error("message head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MessageError {
    /// The stream ended; not worth reporting
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, MessageError::EndOfStream | MessageError::Truncated)
    }
}

pub type MessageResult<T> = Result<T, MessageError>;

/// Size limits applied while reading
#[derive(Debug, Clone, Copy)]
pub struct MessageLimits {
    pub max_head_bytes: usize,
    pub max_body_bytes: usize,
}

impl Default for MessageLimits {
    fn default() -> Self {
        Self::from(&CorrelationSettings::default())
    }
}

impl From<&CorrelationSettings> for MessageLimits {
    fn from(settings: &CorrelationSettings) -> Self {
        Self {
            max_head_bytes: settings.max_head_bytes,
            max_body_bytes: settings.max_body_bytes,
        }
    }
}

/// Request line and headers
#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

/// Status line and headers
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub reason: String,
    pub version: Version,
    pub headers: HeaderMap,
}

/// How a message body is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
    /// Everything until the stream ends
    UntilClose,
}

impl BodyFraming {
    /// Requests without a length or chunked coding have no body
    pub fn for_request(head: &RequestHead) -> MessageResult<Self> {
        Ok(framing_from_headers(&head.headers)?.unwrap_or(BodyFraming::Empty))
    }

    /// Framing of a response; `request_method` is the method of the
    /// request it answers, when known
    pub fn for_response(head: &ResponseHead, request_method: Option<&Method>) -> MessageResult<Self> {
        let status = head.status;
        if request_method == Some(&Method::HEAD)
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            return Ok(BodyFraming::Empty);
        }
        if request_method == Some(&Method::CONNECT) && status.is_success() {
            return Ok(BodyFraming::Empty);
        }
        Ok(framing_from_headers(&head.headers)?.unwrap_or(BodyFraming::UntilClose))
    }
}

fn framing_from_headers(headers: &HeaderMap) -> MessageResult<Option<BodyFraming>> {
    let chunked = headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .last()
        .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
    if chunked {
        return Ok(Some(BodyFraming::Chunked));
    }

    match headers.get(CONTENT_LENGTH) {
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(|n| Some(BodyFraming::Length(n)))
            .ok_or_else(|| MessageError::Malformed(format!("invalid Content-Length {:?}", value))),
        None => Ok(None),
    }
}

/// A message body as read from the stream
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Body {
    pub bytes: Vec<u8>,
    /// Bytes beyond the size limit were consumed and dropped
    pub truncated: bool,
    /// The stream ended before the body did
    pub incomplete: bool,
}

impl Body {
    fn push(&mut self, data: &[u8], limit: usize) {
        let room = limit.saturating_sub(self.bytes.len());
        if data.len() > room {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&data[..data.len().min(room)]);
    }
}

enum Line {
    Complete,
    Eof,
    TooLong,
}

/// Reads successive HTTP/1.x messages from one half-stream
pub struct MessageReader<R> {
    inner: R,
    limits: MessageLimits,
}

impl<R: AsyncBufRead + Unpin> MessageReader<R> {
    pub fn new(inner: R, limits: MessageLimits) -> Self {
        Self { inner, limits }
    }

    /// Wait for at least one byte. Returns `false` at end of stream.
    pub async fn peek(&mut self) -> MessageResult<bool> {
        Ok(!self.inner.fill_buf().await?.is_empty())
    }

    pub async fn read_request(&mut self) -> MessageResult<RequestHead> {
        let head = self.read_head().await?;

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(&head) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(MessageError::Malformed("incomplete request head".into()))
            }
            Err(e) => return Err(MessageError::Malformed(e.to_string())),
        }

        let method = Method::from_bytes(req.method.unwrap_or_default().as_bytes())
            .map_err(|e| MessageError::Malformed(e.to_string()))?;
        let uri: Uri = req
            .path
            .unwrap_or_default()
            .parse()
            .map_err(|e: http::uri::InvalidUri| MessageError::Malformed(e.to_string()))?;

        Ok(RequestHead {
            method,
            uri,
            version: version(req.version),
            headers: header_map(req.headers)?,
        })
    }

    /// Read the next final response. Interim 1xx responses are skipped,
    /// except `101 Switching Protocols` which is returned.
    pub async fn read_response(&mut self, request_method: Option<&Method>) -> MessageResult<ResponseHead> {
        loop {
            let head = self.read_head().await?;

            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut res = httparse::Response::new(&mut headers);
            match res.parse(&head) {
                Ok(httparse::Status::Complete(_)) => {}
                Ok(httparse::Status::Partial) => {
                    return Err(MessageError::Malformed("incomplete response head".into()))
                }
                Err(e) => return Err(MessageError::Malformed(e.to_string())),
            }

            let code = res.code.unwrap_or_default();
            let status = StatusCode::from_u16(code)
                .map_err(|_| MessageError::Malformed(format!("invalid status code {}", code)))?;

            if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
                debug!(
                    "Skipping interim {} response{}",
                    status,
                    request_method.map(|m| format!(" to {}", m)).unwrap_or_default()
                );
                continue;
            }

            return Ok(ResponseHead {
                status,
                reason: res.reason.unwrap_or_default().to_string(),
                version: version(res.version),
                headers: header_map(res.headers)?,
            });
        }
    }

    /// Read a body delimited by `framing`. A stream that ends early yields
    /// the bytes read so far with `incomplete` set.
    pub async fn read_body(&mut self, framing: BodyFraming) -> MessageResult<Body> {
        let mut body = Body::default();
        match framing {
            BodyFraming::Empty => {}
            BodyFraming::Length(n) => {
                body.incomplete = !self.copy_exact(n, &mut body).await?;
            }
            BodyFraming::UntilClose => self.copy_to_end(&mut body).await?,
            BodyFraming::Chunked => self.read_chunked(&mut body).await?,
        }
        if body.truncated {
            debug!(
                "Body exceeded {} bytes and was truncated",
                self.limits.max_body_bytes
            );
        }
        Ok(body)
    }

    /// Read up to the blank line ending a message head. Blank lines before
    /// the start line are skipped.
    async fn read_head(&mut self) -> MessageResult<Vec<u8>> {
        let limit = self.limits.max_head_bytes;
        let mut head = Vec::new();
        loop {
            let line_start = head.len();
            match self.read_line(&mut head, limit).await? {
                Line::Complete => {}
                Line::TooLong => return Err(MessageError::HeadTooLarge(limit)),
                Line::Eof if head.iter().all(u8::is_ascii_whitespace) => {
                    return Err(MessageError::EndOfStream)
                }
                Line::Eof => return Err(MessageError::Truncated),
            }

            let line = &head[line_start..];
            if line == b"\r\n" || line == b"\n" {
                if line_start == 0 {
                    head.clear();
                    continue;
                }
                return Ok(head);
            }
        }
    }

    /// Append one line including its terminator to `out`
    async fn read_line(&mut self, out: &mut Vec<u8>, limit: usize) -> MessageResult<Line> {
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                return Ok(Line::Eof);
            }
            let (used, done) = match available.iter().position(|&b| b == b'\n') {
                Some(i) => (i + 1, true),
                None => (available.len(), false),
            };
            if out.len() + used > limit {
                return Ok(Line::TooLong);
            }
            out.extend_from_slice(&available[..used]);
            self.inner.consume(used);
            if done {
                return Ok(Line::Complete);
            }
        }
    }

    /// Copy exactly `n` bytes into `body`. Returns `false` if the stream
    /// ended first.
    async fn copy_exact(&mut self, n: u64, body: &mut Body) -> MessageResult<bool> {
        let limit = self.limits.max_body_bytes;
        let mut remaining = n;
        while remaining > 0 {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                return Ok(false);
            }
            let take = available.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
            body.push(&available[..take], limit);
            self.inner.consume(take);
            remaining -= take as u64;
        }
        Ok(true)
    }

    async fn copy_to_end(&mut self, body: &mut Body) -> MessageResult<()> {
        let limit = self.limits.max_body_bytes;
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                return Ok(());
            }
            let n = available.len();
            body.push(available, limit);
            self.inner.consume(n);
        }
    }

    async fn read_chunked(&mut self, body: &mut Body) -> MessageResult<()> {
        let mut line = Vec::new();
        loop {
            line.clear();
            match self.read_line(&mut line, MAX_CHUNK_LINE).await? {
                Line::Complete => {}
                Line::Eof => {
                    body.incomplete = true;
                    return Ok(());
                }
                Line::TooLong => return Err(MessageError::Malformed("chunk size line too long".into())),
            }

            let size = chunk_size(&line)?;
            if size == 0 {
                return self.skip_trailers(body).await;
            }

            if !self.copy_exact(size, body).await? {
                body.incomplete = true;
                return Ok(());
            }

            line.clear();
            match self.read_line(&mut line, MAX_CHUNK_LINE).await? {
                Line::Complete if line.trim_ascii().is_empty() => {}
                Line::Complete | Line::TooLong => {
                    return Err(MessageError::Malformed("missing CRLF after chunk data".into()))
                }
                Line::Eof => {
                    body.incomplete = true;
                    return Ok(());
                }
            }
        }
    }

    async fn skip_trailers(&mut self, body: &mut Body) -> MessageResult<()> {
        let mut line = Vec::new();
        loop {
            line.clear();
            match self.read_line(&mut line, MAX_CHUNK_LINE).await? {
                Line::Complete if line.trim_ascii().is_empty() => return Ok(()),
                Line::Complete => {}
                Line::Eof => {
                    body.incomplete = true;
                    return Ok(());
                }
                Line::TooLong => return Err(MessageError::Malformed("trailer line too long".into())),
            }
        }
    }
}

fn chunk_size(line: &[u8]) -> MessageResult<u64> {
    let text = std::str::from_utf8(line)
        .map_err(|_| MessageError::Malformed("non-ASCII chunk size".into()))?;
    let digits = text.split(';').next().unwrap_or_default().trim();
    u64::from_str_radix(digits, 16)
        .map_err(|_| MessageError::Malformed(format!("invalid chunk size {:?}", digits)))
}

fn version(minor: Option<u8>) -> Version {
    match minor {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    }
}

fn header_map(headers: &[httparse::Header<'_>]) -> MessageResult<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for h in headers {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|e| MessageError::Malformed(e.to_string()))?;
        let value =
            HeaderValue::from_bytes(h.value).map_err(|e| MessageError::Malformed(e.to_string()))?;
        map.append(name, value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(data: &[u8]) -> MessageReader<&[u8]> {
        MessageReader::new(data, MessageLimits::default())
    }

    #[tokio::test]
    async fn test_read_request_with_length_body() {
        let data = b"POST /api/chat HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\n\r\nhello";
        let mut r = reader(data);

        let head = r.read_request().await.unwrap();
        assert_eq!(head.method, Method::POST);
        assert_eq!(head.uri.path(), "/api/chat");
        assert_eq!(head.version, Version::HTTP_11);
        assert_eq!(head.headers["host"], "localhost");

        let framing = BodyFraming::for_request(&head).unwrap();
        assert_eq!(framing, BodyFraming::Length(5));
        let body = r.read_body(framing).await.unwrap();
        assert_eq!(body.bytes, b"hello");
        assert!(!body.incomplete);

        assert!(matches!(r.read_request().await, Err(MessageError::EndOfStream)));
    }

    #[tokio::test]
    async fn test_pipelined_requests() {
        let data = b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.0\r\nX-Id: 2\r\n\r\n";
        let mut r = reader(data);

        let first = r.read_request().await.unwrap();
        assert_eq!(BodyFraming::for_request(&first).unwrap(), BodyFraming::Empty);
        let second = r.read_request().await.unwrap();
        assert_eq!(second.uri.path(), "/b");
        assert_eq!(second.version, Version::HTTP_10);
        assert!(!r.peek().await.unwrap());
    }

    #[tokio::test]
    async fn test_chunked_response_with_trailers() {
        let data = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: gzip, chunked\r\n\r\n\
                     4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Trailer: yes\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n";
        let mut r = reader(data);

        let head = r.read_response(None).await.unwrap();
        let framing = BodyFraming::for_response(&head, Some(&Method::GET)).unwrap();
        assert_eq!(framing, BodyFraming::Chunked);
        let body = r.read_body(framing).await.unwrap();
        assert_eq!(body.bytes, b"Wikipedia");
        assert!(!body.incomplete);

        let next = r.read_response(None).await.unwrap();
        assert_eq!(next.status, StatusCode::NO_CONTENT);
        assert_eq!(next.reason, "No Content");
    }

    #[tokio::test]
    async fn test_response_framing_rules() {
        let mut r = reader(b"HTTP/1.1 200 OK\r\nContent-Length: 42\r\n\r\n");
        let head = r.read_response(Some(&Method::HEAD)).await.unwrap();
        assert_eq!(
            BodyFraming::for_response(&head, Some(&Method::HEAD)).unwrap(),
            BodyFraming::Empty
        );
        assert_eq!(
            BodyFraming::for_response(&head, Some(&Method::GET)).unwrap(),
            BodyFraming::Length(42)
        );

        let mut r = reader(b"HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\n\r\nall of it");
        let head = r.read_response(None).await.unwrap();
        let framing = BodyFraming::for_response(&head, None).unwrap();
        assert_eq!(framing, BodyFraming::UntilClose);
        assert_eq!(r.read_body(framing).await.unwrap().bytes, b"all of it");
    }

    #[tokio::test]
    async fn test_interim_responses_skipped() {
        let data = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n";
        let head = reader(data).read_response(Some(&Method::POST)).await.unwrap();
        assert_eq!(head.status, StatusCode::CREATED);

        let data = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n\x81\x05hello";
        let head = reader(data).read_response(Some(&Method::GET)).await.unwrap();
        assert_eq!(head.status, StatusCode::SWITCHING_PROTOCOLS);
    }

    #[tokio::test]
    async fn test_short_body_at_eof() {
        let mut r = reader(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc");
        let head = r.read_request().await.unwrap();
        let body = r
            .read_body(BodyFraming::for_request(&head).unwrap())
            .await
            .unwrap();
        assert_eq!(body.bytes, b"abc");
        assert!(body.incomplete);
    }

    #[tokio::test]
    async fn test_body_truncated_at_limit() {
        let data = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n0123456789HTTP/1.1 204 No Content\r\n\r\n";
        let mut r = MessageReader::new(
            &data[..],
            MessageLimits {
                max_head_bytes: 1024,
                max_body_bytes: 4,
            },
        );
        let head = r.read_response(None).await.unwrap();
        let body = r
            .read_body(BodyFraming::for_response(&head, None).unwrap())
            .await
            .unwrap();
        assert_eq!(body.bytes, b"0123");
        assert!(body.truncated);

        // the rest of the body was still consumed
        assert_eq!(r.read_response(None).await.unwrap().status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_end_of_stream_outcomes() {
        assert!(matches!(reader(b"").read_request().await, Err(MessageError::EndOfStream)));
        assert!(matches!(reader(b"\r\n").read_request().await, Err(MessageError::EndOfStream)));
        assert!(matches!(
            reader(b"GET / HTTP/1.1\r\nHost: x\r\n").read_request().await,
            Err(MessageError::Truncated)
        ));
        assert!(MessageError::Truncated.is_end_of_stream());
        assert!(!MessageError::HeadTooLarge(1).is_end_of_stream());
    }

    #[tokio::test]
    async fn test_malformed_messages() {
        assert!(matches!(
            reader(b"GET / HTTP/1.1\r\nBad Header\r\n\r\n").read_request().await,
            Err(MessageError::Malformed(_))
        ));
        assert!(matches!(
            reader(b"HTTP/1.1 abc OK\r\n\r\n").read_response(None).await,
            Err(MessageError::Malformed(_))
        ));

        let mut r = reader(b"HTTP/1.1 200 OK\r\nContent-Length: nope\r\n\r\n");
        let head = r.read_response(None).await.unwrap();
        assert!(matches!(
            BodyFraming::for_response(&head, None),
            Err(MessageError::Malformed(_))
        ));

        let mut r = reader(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n");
        let head = r.read_response(None).await.unwrap();
        assert!(matches!(
            r.read_body(BodyFraming::for_response(&head, None).unwrap()).await,
            Err(MessageError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_head_too_large() {
        let mut data = b"GET / HTTP/1.1\r\nX-Big: ".to_vec();
        data.extend(std::iter::repeat(b'a').take(200));
        data.extend_from_slice(b"\r\n\r\n");
        let mut r = MessageReader::new(
            &data[..],
            MessageLimits {
                max_head_bytes: 64,
                max_body_bytes: 1024,
            },
        );
        assert!(matches!(r.read_request().await, Err(MessageError::HeadTooLarge(64))));
    }

    #[tokio::test]
    async fn test_too_many_headers() {
        let mut data = b"GET / HTTP/1.1\r\n".to_vec();
        for i in 0..(MAX_HEADERS + 1) {
            data.extend_from_slice(format!("X-H{}: v\r\n", i).as_bytes());
        }
        data.extend_from_slice(b"\r\n");
        assert!(matches!(
            reader(&data).read_request().await,
            Err(MessageError::Malformed(_))
        ));
    }
}
