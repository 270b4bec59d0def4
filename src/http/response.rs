use std::collections::HashMap;

use bytes::Bytes;

use crate::http::request::Version;
use crate::store::Chunk;

/// HTTP status codes produced by the server.
///
/// - `Ok` (200): Request successful
/// - `NoContent` (204): Successful request with no content
/// - `NotModified` (304): Cached copy is still valid
/// - `BadRequest` (400): Malformed request
/// - `NotFound` (404): Resource or tuple not found
/// - `RequestTimeout` (408): Backend did not answer in time
/// - `PayloadTooLarge` (413): Request body over the accepted size
/// - `InternalServerError` (500): Backend or server failure
/// - `NotImplemented` (501): Method not supported
/// - `ServiceUnavailable` (503): Worker pool cannot take the connection
/// - `HttpVersionNotSupported` (505): Unknown protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// 200 OK
    Ok,
    /// 204 No Content
    NoContent,
    /// 304 Not Modified
    NotModified,
    /// 400 Bad Request
    BadRequest,
    /// 404 Not Found
    NotFound,
    /// 408 Request Timeout
    RequestTimeout,
    /// 413 Payload Too Large
    PayloadTooLarge,
    /// 500 Internal Server Error
    InternalServerError,
    /// 501 Not Implemented
    NotImplemented,
    /// 503 Service Unavailable
    ServiceUnavailable,
    /// 505 HTTP Version Not Supported
    HttpVersionNotSupported,
}

impl StatusCode {
    /// Returns the numeric HTTP status code.
    ///
    /// # Example
    ///
    /// ```
    /// # use tuplegate::http::response::StatusCode;
    /// assert_eq!(StatusCode::Ok.as_u16(), 200);
    /// assert_eq!(StatusCode::NotFound.as_u16(), 404);
    /// ```
    pub fn as_u16(&self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::NoContent => 204,
            StatusCode::NotModified => 304,
            StatusCode::BadRequest => 400,
            StatusCode::NotFound => 404,
            StatusCode::RequestTimeout => 408,
            StatusCode::PayloadTooLarge => 413,
            StatusCode::InternalServerError => 500,
            StatusCode::NotImplemented => 501,
            StatusCode::ServiceUnavailable => 503,
            StatusCode::HttpVersionNotSupported => 505,
        }
    }

    /// Returns the standard HTTP reason phrase for this status code.
    ///
    /// # Example
    ///
    /// ```
    /// # use tuplegate::http::response::StatusCode;
    /// assert_eq!(StatusCode::Ok.reason_phrase(), "OK");
    /// assert_eq!(StatusCode::NotFound.reason_phrase(), "Not Found");
    /// ```
    pub fn reason_phrase(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::NoContent => "No Content",
            StatusCode::NotModified => "Not Modified",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::NotFound => "Not Found",
            StatusCode::RequestTimeout => "Request Timeout",
            StatusCode::PayloadTooLarge => "Payload Too Large",
            StatusCode::InternalServerError => "Internal Server Error",
            StatusCode::NotImplemented => "Not Implemented",
            StatusCode::ServiceUnavailable => "Service Unavailable",
            StatusCode::HttpVersionNotSupported => "HTTP Version Not Supported",
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.as_u16())
    }

    /// Statuses whose responses never carry a body.
    pub fn forbids_body(&self) -> bool {
        matches!(self, StatusCode::NoContent | StatusCode::NotModified)
    }
}

/// Response entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// No entity at all; only valid where the status or method allows it
    Empty,
    /// Entire entity in one piece (possibly zero bytes long)
    Full(Bytes),
    /// First segment of an entity delivered segment by segment
    Chunked(Chunk),
}

impl Body {
    /// Length of the whole entity as it will go on the wire.
    pub fn len(&self) -> u64 {
        match self {
            Body::Empty => 0,
            Body::Full(bytes) => bytes.len() as u64,
            Body::Chunked(head) => head.total_len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes available right now, used to sniff the content type.
    pub fn leading_bytes(&self) -> &[u8] {
        match self {
            Body::Empty => &[],
            Body::Full(bytes) => &bytes[..],
            Body::Chunked(head) => &head.data[..],
        }
    }
}

/// Represents a complete HTTP response ready to be sent to a client.
#[derive(Debug, Clone)]
pub struct Response {
    pub version: Version,
    /// The HTTP status code
    pub status: StatusCode,
    /// HTTP headers as key-value pairs
    pub headers: HashMap<String, String>,
    pub body: Body,
}

/// Builder for constructing HTTP responses in a fluent style.
///
/// # Example
///
/// ```ignore
/// let response = ResponseBuilder::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(b"{}".to_vec())
///     .build();
/// ```
pub struct ResponseBuilder {
    version: Version,
    status: StatusCode,
    headers: HashMap<String, String>,
    body: Body,
}

impl ResponseBuilder {
    /// Creates a new response builder with the specified status code.
    pub fn new(status: StatusCode) -> Self {
        Self {
            version: Version::Http11,
            status,
            headers: HashMap::new(),
            body: Body::Empty,
        }
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// Adds or replaces a header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Sets a complete response body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Body::Full(body.into());
        self
    }

    /// Sets the head segment of a segmented body.
    pub fn chunked(mut self, head: Chunk) -> Self {
        self.body = Body::Chunked(head);
        self
    }

    /// Builds the final Response.
    ///
    /// Content-Length is left to the connection, which fills it in just
    /// before the response is written.
    pub fn build(self) -> Response {
        Response {
            version: self.version,
            status: self.status,
            headers: self.headers,
            body: self.body,
        }
    }
}

impl Response {
    /// Creates a simple 200 OK response with the given body.
    pub fn ok(body: impl Into<Bytes>) -> Self {
        ResponseBuilder::new(StatusCode::Ok).body(body).build()
    }

    /// Retrieves a header value by name, ignoring ASCII case.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Sets a header, replacing any existing one regardless of case.
    pub fn set_header(&mut self, key: &str, value: impl Into<String>) {
        self.remove_header(key);
        self.headers.insert(key.to_string(), value.into());
    }

    pub fn remove_header(&mut self, key: &str) {
        self.headers.retain(|k, _| !k.eq_ignore_ascii_case(key));
    }

    /// Response asked for the connection to be closed after it.
    pub fn wants_close(&self) -> bool {
        self.header("Connection")
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("close")))
            .unwrap_or(false)
    }

    pub fn is_chunked(&self) -> bool {
        matches!(self.body, Body::Chunked(_))
    }
}
