//! Access and error log sink.

use std::fmt::Display;
use std::net::SocketAddr;

use crate::http::request::Version;
use crate::http::response::StatusCode;

/// One completed response.
#[derive(Debug, Clone)]
pub struct AccessRecord<'a> {
    pub peer: SocketAddr,
    pub method: &'a str,
    pub path: &'a str,
    pub version: Version,
    pub status: StatusCode,
    /// Entity length announced to the client
    pub bytes: u64,
}

/// Receives access and error lines; formatting is up to the implementation.
pub trait LogSink: Send + Sync + 'static {
    fn access(&self, record: &AccessRecord<'_>);

    fn error(&self, peer: Option<SocketAddr>, component: &str, message: &str, cause: Option<&dyn Display>);
}

/// Forwards everything to `tracing`, access lines under the `access` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLog;

impl LogSink for TracingLog {
    fn access(&self, record: &AccessRecord<'_>) {
        tracing::info!(
            target: "access",
            peer = %record.peer,
            method = record.method,
            path = record.path,
            version = %record.version,
            status = record.status.as_u16(),
            bytes = record.bytes
        );
    }

    fn error(&self, peer: Option<SocketAddr>, component: &str, message: &str, cause: Option<&dyn Display>) {
        match (peer, cause) {
            (Some(peer), Some(cause)) => {
                tracing::error!(peer = %peer, component, error = %cause, "{}", message)
            }
            (Some(peer), None) => tracing::error!(peer = %peer, component, "{}", message),
            (None, Some(cause)) => tracing::error!(component, error = %cause, "{}", message),
            (None, None) => tracing::error!(component, "{}", message),
        }
    }
}
