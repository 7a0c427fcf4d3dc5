use std;
use std::mem;
use http::{self, header, HeaderMap, Uri, Version};
use httparse;

use {Request, RequestHead};
use errors::*;


/// Most headers a single request may carry
pub const MAX_HEADERS: usize = 64;

/// Largest request head (request line + headers) we'll buffer
pub const MAX_HEAD_BYTES: usize = 16 * 1024;

/// Largest request body we'll buffer, declared or decoded
pub const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BodyFraming {
    Length(usize),
    Chunked,
}


/// Progress through a chunked body, kept between reads so chunks that
/// already arrived aren't decoded again
#[derive(Debug, Default)]
struct ChunkedBody {
    /// Offset of the next chunk-size line, relative to the end of the head
    pos: usize,
    body: Vec<u8>,
}
impl ChunkedBody {
    /// Decode every whole chunk in `buf` (everything after the head).
    /// Returns the body's length on the wire once the last chunk and the
    /// trailers are in.
    fn advance(&mut self, buf: &[u8]) -> Result<Option<usize>> {
        loop {
            let (used, size) = match httparse::parse_chunk_size(&buf[self.pos..]) {
                Ok(httparse::Status::Complete(found)) => found,
                Ok(httparse::Status::Partial) => return Ok(None),
                Err(_) => bail_fmt!(ErrorKind::MalformedHttpRequest, "invalid chunk size line"),
            };
            let start = self.pos + used;
            if size == 0 {
                return Ok(skip_trailers(&buf[start..]).map(|n| start + n))
            }
            if size > (MAX_BODY_BYTES - self.body.len()) as u64 {
                bail_fmt!(ErrorKind::RequestBodyTooLarge, "chunked body exceeds {} bytes", MAX_BODY_BYTES);
            }
            let end = start + size as usize;
            if buf.len() < end + 2 { return Ok(None) }
            if &buf[end..end + 2] != b"\r\n" {
                bail_fmt!(ErrorKind::MalformedHttpRequest, "chunk not terminated by CRLF");
            }
            self.body.extend_from_slice(&buf[start..end]);
            self.pos = end + 2;
        }
    }
}


/// Http reader/parser for incrementally reading a request and
/// parsing its headers
pub(crate) struct HttpStreamReader {
    read_buf: Vec<u8>,
    headers_length: usize,
    request: Option<RequestHead>,
    framing: BodyFraming,
    chunked: ChunkedBody,
    expect_continue: bool,
}
impl std::default::Default for HttpStreamReader {
    fn default() -> HttpStreamReader {
        HttpStreamReader {
            read_buf: Vec::new(),
            headers_length: 0, request: None,
            framing: BodyFraming::Length(0), chunked: ChunkedBody::default(),
            expect_continue: false,
        }
    }
}
impl HttpStreamReader {
    pub fn new() -> Self {
        Self {
            read_buf: Vec::with_capacity(1024),
            ..Self::default()
        }
    }

    /// Save a new chunk of bytes
    pub fn receive_chunk(&mut self, chunk: &[u8]) -> usize {
        self.read_buf.extend_from_slice(chunk);
        self.read_buf.len()
    }

    /// Whether the client is waiting on a `100 Continue` before sending its body.
    /// Reports `true` at most once per request.
    pub fn take_continue(&mut self) -> bool {
        mem::replace(&mut self.expect_continue, false)
    }

    /// Try turning the buffered bytes into a complete request.
    ///
    /// Returns `Ok(None)` while more bytes are needed. Bytes following a
    /// complete request stay buffered for the next call.
    pub fn try_build_request(&mut self) -> Result<Option<Request>> {
        if self.request.is_none() && !self.try_parse_head()? {
            return Ok(None)
        }

        let (body, consumed) = match self.framing {
            BodyFraming::Length(len) => {
                let end = self.headers_length + len;
                if self.read_buf.len() < end { return Ok(None) }
                (self.read_buf[self.headers_length..end].to_vec(), end)
            }
            BodyFraming::Chunked => {
                match self.chunked.advance(&self.read_buf[self.headers_length..])? {
                    Some(used) => {
                        let done = mem::replace(&mut self.chunked, ChunkedBody::default());
                        (done.body, self.headers_length + used)
                    }
                    None => return Ok(None),
                }
            }
        };

        self.read_buf.drain(..consumed);
        self.headers_length = 0;
        self.framing = BodyFraming::Length(0);
        self.expect_continue = false;
        Ok(self.request.take().map(|head| {
            let (parts, _) = head.into_parts();
            Request::from_parts(parts, body)
        }))
    }

    /// Parse the request line and headers once they've all arrived.
    /// Returns `false` if the head is still incomplete.
    fn try_parse_head(&mut self) -> Result<bool> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let status = match req.parse(&self.read_buf) {
            Ok(status) => status,
            Err(httparse::Error::TooManyHeaders) => {
                bail_fmt!(ErrorKind::RequestHeadersTooLarge, "more than {} headers", MAX_HEADERS);
            }
            Err(e) => {
                bail_fmt!(ErrorKind::MalformedHttpRequest, "{}: {:?}",
                          e, String::from_utf8_lossy(&self.read_buf[..self.read_buf.len().min(128)]));
            }
        };
        let headers_length = match status {
            httparse::Status::Complete(n) => n,
            httparse::Status::Partial => {
                if self.read_buf.len() > MAX_HEAD_BYTES {
                    bail_fmt!(ErrorKind::RequestHeadersTooLarge, "head exceeds {} bytes", MAX_HEAD_BYTES);
                }
                return Ok(false)
            }
        };
        if headers_length > MAX_HEAD_BYTES {
            bail_fmt!(ErrorKind::RequestHeadersTooLarge, "head exceeds {} bytes", MAX_HEAD_BYTES);
        }

        let (method, path, version) = match (req.method, req.path, req.version) {
            (Some(m), Some(p), Some(v)) => (m, p, v),
            _ => bail_fmt!(ErrorKind::MalformedHttpRequest, "incomplete request line"),
        };
        let version = if version == 0 { Version::HTTP_10 } else { Version::HTTP_11 };

        // HTTP parsing success. Build an `http::Request` with a placeholder body
        // while we continue to read the real one
        let mut request = http::Request::builder();
        request.method(method).version(version);
        for header in req.headers.iter() {
            request.header(header.name, header.value);
        }
        let mut head = request.body(())?;
        *head.uri_mut() = request_target(path);

        let framing = body_framing(head.headers())?;
        if let BodyFraming::Length(len) = framing {
            if len > MAX_BODY_BYTES {
                bail_fmt!(ErrorKind::RequestBodyTooLarge, "declared length {} exceeds {} bytes", len, MAX_BODY_BYTES);
            }
        }
        self.expect_continue = version == Version::HTTP_11 && expects_continue(head.headers());
        self.headers_length = headers_length;
        self.framing = framing;
        self.request = Some(head);
        Ok(true)
    }
}


/// Work out how the body is delimited. A chunked transfer coding wins over
/// `content-length`, and no framing at all means an empty body.
fn body_framing(headers: &HeaderMap) -> Result<BodyFraming> {
    let mut codings = Vec::new();
    for value in headers.get_all(header::TRANSFER_ENCODING).iter() {
        let value = match value.to_str() {
            Ok(v) => v,
            Err(_) => bail_fmt!(ErrorKind::MalformedHttpRequest, "non-ascii transfer-encoding"),
        };
        codings.extend(value.split(',').map(|c| c.trim().to_ascii_lowercase()).filter(|c| !c.is_empty()));
    }
    if let Some(last) = codings.last() {
        if last == "chunked" {
            return Ok(BodyFraming::Chunked)
        }
        bail_fmt!(ErrorKind::MalformedHttpRequest, "unsupported transfer-encoding: {}", last);
    }

    let mut length = None;
    for value in headers.get_all(header::CONTENT_LENGTH).iter() {
        let parsed = value.to_str().ok().and_then(|v| v.trim().parse::<usize>().ok());
        match (parsed, length) {
            (None, _) => bail_fmt!(ErrorKind::MalformedHttpRequest, "invalid content-length: {:?}", value),
            (Some(n), Some(prev)) if n != prev => {
                bail_fmt!(ErrorKind::MalformedHttpRequest, "conflicting content-length values");
            }
            (Some(n), _) => length = Some(n),
        }
    }
    Ok(BodyFraming::Length(length.unwrap_or(0)))
}

fn expects_continue(headers: &HeaderMap) -> bool {
    headers.get(header::EXPECT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case("100-continue"))
        .unwrap_or(false)
}

/// The request target as a `Uri`. Bytes `Uri` refuses but httparse lets
/// through (quotes, braces, non-ascii...) are percent-encoded; a target that
/// still won't parse becomes `/`, since nothing downstream routes on it.
fn request_target(path: &str) -> Uri {
    if let Ok(uri) = path.parse::<Uri>() {
        return uri
    }
    let mut encoded = String::with_capacity(path.len() * 3);
    for &b in path.as_bytes() {
        match b {
            b'"' | b'<' | b'>' | b'\\' | b'`' | b'{' | b'}' | b'|' | b'^' | b'#' |
            b'[' | b']' | 0x00..=0x20 | 0x7f..=0xff => {
                encoded.push_str(&format!("%{:02X}", b))
            }
            _ => encoded.push(b as char),
        }
    }
    encoded.parse::<Uri>().unwrap_or_else(|e| {
        debug!("unparseable request target {:?}: {}", path, e);
        Uri::from_static("/")
    })
}

/// Length of the trailer section (including its closing blank line)
fn skip_trailers(buf: &[u8]) -> Option<usize> {
    if buf.starts_with(b"\r\n") {
        return Some(2)
    }
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}
