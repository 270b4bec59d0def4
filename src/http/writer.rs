use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::http::request::Version;
use crate::http::response::{Body, Response};

/// Serializes the status line, headers and (when `with_body`) the body or
/// first segment of `resp`.
///
/// HTTP/0.9 responses have neither status line nor headers.
pub fn serialize_response(resp: &Response, with_body: bool) -> Vec<u8> {
    let mut buf = Vec::new();

    if resp.version != Version::Http09 {
        // Status line
        let status_line = format!(
            "{} {} {}\r\n",
            resp.version,
            resp.status.as_u16(),
            resp.status.reason_phrase()
        );
        buf.extend_from_slice(status_line.as_bytes());

        // Headers, sorted so output is stable
        let mut headers: Vec<_> = resp.headers.iter().collect();
        headers.sort();
        for (k, v) in headers {
            buf.extend_from_slice(k.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(v.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }

        // Header/body separator
        buf.extend_from_slice(b"\r\n");
    }

    if with_body {
        match &resp.body {
            Body::Empty => {}
            Body::Full(bytes) => buf.extend_from_slice(bytes),
            Body::Chunked(head) => buf.extend_from_slice(&head.data),
        }
    }

    buf
}

pub struct ResponseWriter {
    buffer: Vec<u8>,
    written: usize,
}

impl ResponseWriter {
    pub fn new(response: &Response, with_body: bool) -> Self {
        Self::from_bytes(serialize_response(response, with_body))
    }

    /// Writer for raw bytes, used for body segments after the head.
    pub fn from_bytes(buffer: Vec<u8>) -> Self {
        Self { buffer, written: 0 }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub async fn write_to_stream<W>(&mut self, stream: &mut W) -> anyhow::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        while self.written < self.buffer.len() {
            let n = stream.write(&self.buffer[self.written..]).await?;

            if n == 0 {
                return Err(anyhow::anyhow!("connection closed while writing"));
            }

            self.written += n;
        }

        stream.flush().await?;
        Ok(())
    }
}
