use std::collections::HashMap;

use crate::http::request::{Method, Request, Version};
use crate::http::response::StatusCode;

/// Largest request line plus header block accepted before giving up.
pub const MAX_HEAD_BYTES: usize = 16 * 1024;

/// Largest request body accepted. GET and HEAD never need one, so this only
/// bounds how much a client can make the connection buffer.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    InvalidRequest,
    /// Method token contains characters no method can have
    InvalidMethod,
    /// Syntactically fine method the server does not know
    UnknownMethod,
    InvalidHeader,
    InvalidContentLength,
    UnsupportedVersion,
    HeadTooLarge,
    BodyTooLarge,
    Incomplete,
}

impl ParseError {
    /// Status a client is answered with for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            ParseError::UnknownMethod => StatusCode::NotImplemented,
            ParseError::UnsupportedVersion => StatusCode::HttpVersionNotSupported,
            ParseError::BodyTooLarge => StatusCode::PayloadTooLarge,
            _ => StatusCode::BadRequest,
        }
    }

    /// The rest of the input cannot be framed, so the connection must close
    /// after the error response.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ParseError::HeadTooLarge | ParseError::BodyTooLarge)
    }
}

struct Failure {
    error: ParseError,
    consumed: usize,
    version: Version,
}

impl Failure {
    fn incomplete() -> Self {
        Self {
            error: ParseError::Incomplete,
            consumed: 0,
            version: Version::Http11,
        }
    }
}

/// Parses one request from the front of `buf`.
///
/// Returns the request and the number of bytes it occupied.
pub fn parse_http_request(buf: &[u8]) -> Result<(Request, usize), ParseError> {
    parse(buf).map_err(|failure| failure.error)
}

/// Parses one request, turning malformed input into an error request.
///
/// Returns `None` only when `buf` does not yet hold a complete request. A bad
/// request line consumes that line alone; a request whose line looked like
/// HTTP/1.x also consumes its header block, so the next request starts clean.
pub fn parse_or_recover(buf: &[u8]) -> Option<(Request, usize)> {
    match parse(buf) {
        Ok(parsed) => Some(parsed),
        Err(Failure {
            error: ParseError::Incomplete,
            ..
        }) => None,
        Err(Failure {
            error,
            consumed,
            version,
        }) => {
            let mut request = Request::malformed(error.status(), version);
            if error.is_fatal() {
                request.headers.insert("Connection".to_string(), "close".to_string());
            }
            Some((request, consumed))
        }
    }
}

fn parse(buf: &[u8]) -> Result<(Request, usize), Failure> {
    // Tolerate stray line breaks between pipelined requests
    let start = buf
        .iter()
        .position(|&b| b != b'\r' && b != b'\n')
        .ok_or_else(Failure::incomplete)?;

    let Some((line, line_end)) = next_line(buf, start) else {
        return Err(too_large_or_incomplete(buf, start));
    };

    let fail_line = |error| Failure {
        error,
        consumed: line_end,
        version: Version::Http11,
    };

    let line = std::str::from_utf8(line).map_err(|_| fail_line(ParseError::InvalidRequest))?;
    let parts: Vec<&str> = line.split_whitespace().collect();

    let (method_str, target, version) = match parts.as_slice() {
        [method, target] => (*method, *target, Version::Http09),
        [method, target, version] => match Version::from_str(version) {
            Some(version) => (*method, *target, version),
            None if version.starts_with("HTTP/") => {
                let head_end = find_head_end(buf, line_end)
                    .ok_or_else(|| too_large_or_incomplete(buf, start))?;
                return Err(Failure {
                    error: ParseError::UnsupportedVersion,
                    consumed: head_end,
                    version: Version::Http11,
                });
            }
            None => return Err(fail_line(ParseError::InvalidRequest)),
        },
        _ => return Err(fail_line(ParseError::InvalidRequest)),
    };

    if version == Version::Http09 {
        // two tokens that are not a valid simple request are just garbage,
        // answered as HTTP/1.1
        let method = parse_method(method_str).map_err(fail_line)?;
        let request = Request {
            method,
            path: target.to_string(),
            version,
            headers: HashMap::new(),
            body: Vec::new(),
            sequence: 0,
            error: None,
        };
        return Ok((request, line_end));
    }

    let head_end =
        find_head_end(buf, line_end).ok_or_else(|| too_large_or_incomplete(buf, start))?;
    let fail_head = |error| Failure {
        error,
        consumed: head_end,
        version,
    };

    let method = parse_method(method_str).map_err(fail_head)?;
    let headers = parse_headers(&buf[line_end..head_end]).map_err(fail_head)?;

    // Body
    let content_length = match header_value(&headers, "Content-Length") {
        Some(v) => v
            .trim()
            .parse::<usize>()
            .map_err(|_| fail_head(ParseError::InvalidContentLength))?,
        None => 0,
    };

    let body_end = head_end
        .checked_add(content_length)
        .ok_or_else(|| fail_head(ParseError::InvalidContentLength))?;
    if content_length > MAX_BODY_BYTES {
        return Err(Failure {
            error: ParseError::BodyTooLarge,
            consumed: buf.len(),
            version,
        });
    }
    if buf.len() < body_end {
        return Err(Failure::incomplete());
    }

    let request = Request {
        method,
        path: target.to_string(),
        version,
        headers,
        body: buf[head_end..body_end].to_vec(),
        sequence: 0,
        error: None,
    };

    Ok((request, body_end))
}

fn parse_method(token: &str) -> Result<Method, ParseError> {
    if let Some(method) = Method::from_str(token) {
        return Ok(method);
    }
    if !token.is_empty() && token.bytes().all(|b| b.is_ascii_uppercase() || b == b'-' || b == b'_') {
        Err(ParseError::UnknownMethod)
    } else {
        Err(ParseError::InvalidMethod)
    }
}

fn parse_headers(block: &[u8]) -> Result<HashMap<String, String>, ParseError> {
    let block = std::str::from_utf8(block).map_err(|_| ParseError::InvalidHeader)?;
    let mut headers: HashMap<String, String> = HashMap::new();

    for line in block.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            continue;
        }

        let (key, value) = line.split_once(':').ok_or(ParseError::InvalidHeader)?;
        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(ParseError::InvalidHeader);
        }

        let value = value.trim();
        match headers.keys().find(|k| k.eq_ignore_ascii_case(key)).cloned() {
            Some(existing) => {
                if let Some(joined) = headers.get_mut(&existing) {
                    joined.push_str(", ");
                    joined.push_str(value);
                }
            }
            None => {
                headers.insert(key.to_string(), value.to_string());
            }
        }
    }

    Ok(headers)
}

fn header_value<'a>(headers: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

/// Line starting at `from`, without its terminator, and the offset just past
/// the terminator.
fn next_line(buf: &[u8], from: usize) -> Option<(&[u8], usize)> {
    let newline = buf[from..].iter().position(|&b| b == b'\n')? + from;
    let line = &buf[from..newline];
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    Some((line, newline + 1))
}

/// Offset just past the blank line ending the header block that starts at
/// `from`.
fn find_head_end(buf: &[u8], mut from: usize) -> Option<usize> {
    loop {
        let (line, next) = next_line(buf, from)?;
        if line.is_empty() {
            return Some(next);
        }
        from = next;
    }
}

fn too_large_or_incomplete(buf: &[u8], start: usize) -> Failure {
    if buf.len() - start > MAX_HEAD_BYTES {
        Failure {
            error: ParseError::HeadTooLarge,
            consumed: buf.len(),
            version: Version::Http11,
        }
    } else {
        Failure::incomplete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_get() {
        let req = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";

        let (parsed, consumed) = parse_http_request(req).unwrap();

        assert_eq!(parsed.path, "/");
        assert_eq!(parsed.header("Host").unwrap(), "example.com");
        assert_eq!(consumed, req.len());
    }

    #[test]
    fn simple_request_has_no_header_block() {
        let req = b"GET /a\r\nGET /b HTTP/1.0\r\n\r\n";

        let (parsed, consumed) = parse_http_request(req).unwrap();

        assert_eq!(parsed.version, Version::Http09);
        assert_eq!(consumed, 8);
    }

    #[test]
    fn garbage_line_consumes_only_itself() {
        let req = b"\x01\x02 garbage\r\nGET /next HTTP/1.1\r\n\r\n";

        let (bad, consumed) = parse_or_recover(req).unwrap();
        assert_eq!(bad.error, Some(StatusCode::BadRequest));

        let (next, _) = parse_or_recover(&req[consumed..]).unwrap();
        assert_eq!(next.path, "/next");
        assert!(next.error.is_none());
    }
}
