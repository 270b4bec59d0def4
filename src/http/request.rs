use std::collections::HashMap;
use std::fmt;

use percent_encoding::percent_decode_str;

use crate::http::response::StatusCode;

/// HTTP request methods.
///
/// Every method is parsed, but only GET and HEAD are served end-to-end; the
/// rest are answered with 501 Not Implemented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    /// GET - Retrieve a resource
    GET,
    /// POST - Create or submit data
    POST,
    /// PUT - Replace a resource
    PUT,
    /// DELETE - Delete a resource
    DELETE,
    /// HEAD - Like GET but without the response body
    HEAD,
    /// OPTIONS - Describe communication options
    OPTIONS,
    /// PATCH - Partial modification of a resource
    PATCH,
}

impl Method {
    /// Parses an HTTP method from a string.
    ///
    /// # Example
    ///
    /// ```
    /// # use tuplegate::http::request::Method;
    /// assert_eq!(Method::from_str("GET"), Some(Method::GET));
    /// assert_eq!(Method::from_str("get"), None);
    /// ```
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::GET),
            "POST" => Some(Method::POST),
            "PUT" => Some(Method::PUT),
            "DELETE" => Some(Method::DELETE),
            "HEAD" => Some(Method::HEAD),
            "OPTIONS" => Some(Method::OPTIONS),
            "PATCH" => Some(Method::PATCH),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
        }
    }

    /// Whether the server answers this method with content.
    pub fn is_supported(&self) -> bool {
        matches!(self, Method::GET | Method::HEAD)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol version of a request or response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Version {
    /// Request line only, no headers; response is the bare body
    Http09,
    Http10,
    Http11,
}

impl Version {
    /// Parses the third token of a request line.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "HTTP/1.1" => Some(Version::Http11),
            "HTTP/1.0" => Some(Version::Http10),
            "HTTP/0.9" => Some(Version::Http09),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http09 => "HTTP/0.9",
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }

    /// Connections are persistent by default only from HTTP/1.1 on.
    pub fn persistent_by_default(&self) -> bool {
        *self == Version::Http11
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents a parsed HTTP request from a client.
///
/// A request that could not be parsed is still a `Request`: `error` carries
/// the status to answer it with, and the remaining fields hold whatever could
/// be recovered.
#[derive(Debug, Clone)]
pub struct Request {
    /// The HTTP method (GET, POST, etc.)
    pub method: Method,
    /// The request target as sent (e.g., "/index.html")
    pub path: String,
    pub version: Version,
    /// Request headers as key-value pairs
    pub headers: HashMap<String, String>,
    /// Request body, when a Content-Length was sent
    pub body: Vec<u8>,
    /// Position of this request on its connection, assigned at read time
    pub sequence: u64,
    /// Status for a request that failed to parse
    pub error: Option<StatusCode>,
}

/// Builder for constructing Request objects.
pub struct RequestBuilder {
    method: Option<Method>,
    path: Option<String>,
    version: Option<Version>,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self {
            method: None,
            path: None,
            version: None,
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn build(self) -> Result<Request, &'static str> {
        Ok(Request {
            method: self.method.ok_or("method missing")?,
            path: self.path.ok_or("path missing")?,
            version: self.version.unwrap_or(Version::Http11),
            headers: self.headers,
            body: self.body,
            sequence: 0,
            error: None,
        })
    }
}

impl Request {
    /// A stand-in for input that could not be parsed.
    pub fn malformed(status: StatusCode, version: Version) -> Self {
        Self {
            method: Method::GET,
            path: String::new(),
            version,
            headers: HashMap::new(),
            body: Vec::new(),
            sequence: 0,
            error: Some(status),
        }
    }

    /// Retrieves a header value by name, ignoring ASCII case.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Retrieves the Content-Length header value and parses it as a usize.
    ///
    /// Returns 0 if the header is missing or not a valid number.
    pub fn content_length(&self) -> usize {
        self.header("Content-Length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    fn has_connection_token(&self, token: &str) -> bool {
        self.header("Connection")
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    }

    /// Client sent `Connection: close`.
    pub fn wants_close(&self) -> bool {
        self.has_connection_token("close")
    }

    /// Client sent `Connection: keep-alive`.
    pub fn wants_keep_alive(&self) -> bool {
        self.has_connection_token("keep-alive")
    }

    /// Determines whether the connection should outlive this request.
    ///
    /// An explicit `close` wins, then an explicit `keep-alive`; otherwise the
    /// version default applies (persistent for HTTP/1.1 only).
    pub fn keep_alive(&self) -> bool {
        if self.wants_close() {
            false
        } else if self.wants_keep_alive() {
            true
        } else {
            self.version.persistent_by_default()
        }
    }

    /// Normalized, percent-decoded absolute path of the target, without
    /// query or fragment.
    ///
    /// Absolute-form targets (`http://host/a`) are reduced to their path and
    /// dot segments are resolved so the result never climbs above `/`.
    /// `None` for targets that are not http(s), not UTF-8 once decoded, or
    /// that decode to a `/` or NUL inside a segment.
    pub fn target_path(&self) -> Option<String> {
        let url = if self.path.starts_with('/') {
            let base = url::Url::parse("http://localhost/").ok()?;
            base.join(&self.path).ok()?
        } else {
            url::Url::parse(&self.path).ok()?
        };

        if !matches!(url.scheme(), "http" | "https") {
            return None;
        }

        let segments = url
            .path()
            .split('/')
            .map(|segment| {
                let decoded = percent_decode_str(segment).decode_utf8().ok()?;
                if decoded.contains(['/', '\0']) {
                    return None;
                }
                Some(decoded)
            })
            .collect::<Option<Vec<_>>>()?;
        Some(segments.join("/"))
    }
}
