//! Putting `Response` values on the wire.

use http::{header, HeaderValue, Method, StatusCode, Version};

use {Request, Response};
use errors::*;


/// How a response must be framed for the request it answers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ResponseMode {
    /// Answering a `HEAD`: send the head only
    pub head_only: bool,
    /// Leave the connection open for another request
    pub keep_alive: bool,
    /// An HTTP/1.0 client asked for keep-alive and has to be told it got it
    pub announce_keep_alive: bool,
}
impl ResponseMode {
    pub fn of(request: &Request) -> ResponseMode {
        let connection = request.headers().get(header::CONNECTION);
        let http10 = request.version() == Version::HTTP_10;
        let keep_alive = if http10 {
            has_token(connection, "keep-alive")
        } else {
            !has_token(connection, "close")
        };
        ResponseMode {
            head_only: *request.method() == Method::HEAD,
            keep_alive,
            announce_keep_alive: keep_alive && http10,
        }
    }

    /// Full response, then hang up
    pub fn closing() -> ResponseMode {
        ResponseMode { head_only: false, keep_alive: false, announce_keep_alive: false }
    }
}

fn has_token(value: Option<&HeaderValue>, token: &str) -> bool {
    value.and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
        .unwrap_or(false)
}


/// Serialize `response` as an HTTP/1.1 message.
///
/// `content-length` and `connection` belong to the server: whatever the
/// handler set for them is replaced.
pub(crate) fn encode(response: &Response, mode: ResponseMode) -> Vec<u8> {
    let status = response.status();
    let body = response.body();
    let mut buf = Vec::with_capacity(128 + body.len());
    buf.extend_from_slice(
        format!("HTTP/1.1 {} {}\r\n", status.as_u16(), status.canonical_reason().unwrap_or("")).as_bytes());
    for (name, value) in response.headers() {
        if *name == header::CONTENT_LENGTH || *name == header::CONNECTION { continue }
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
    if !mode.keep_alive {
        buf.extend_from_slice(b"connection: close\r\n");
    } else if mode.announce_keep_alive {
        buf.extend_from_slice(b"connection: keep-alive\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    if !mode.head_only {
        buf.extend_from_slice(body);
    }
    buf
}


fn with_status(status: StatusCode) -> Response {
    let mut response = Response::new(Vec::new());
    *response.status_mut() = status;
    response
}

/// The answer to a request the reader refused
pub(crate) fn for_error(err: &Error) -> Response {
    with_status(match *err.kind() {
        ErrorKind::RequestHeadersTooLarge(_) => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
        ErrorKind::RequestBodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        _ => StatusCode::BAD_REQUEST,
    })
}

/// The answer when a handler panicked
pub(crate) fn internal_error() -> Response {
    with_status(StatusCode::INTERNAL_SERVER_ERROR)
}
