//! Per-socket protocol state machine.
//!
//! Requests are read and buffered, dispatched to the resource proxy, and
//! answered strictly in the order they arrived even though the store may
//! complete them in any order. Two ordered sets carry that guarantee:
//!
//! - **pending**: dispatched, waiting for (or holding) a response that cannot
//!   be sent yet because an earlier request is still outstanding
//! - **queued**: response ready and every earlier response already ahead of
//!   it, waiting to be written
//!
//! Store completions arrive on other tasks and only ever touch the sets
//! through [`Exchange`], under its lock.

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::http::chunk::{ChunkError, ChunkSequence};
use crate::http::error_page::ErrorPages;
use crate::http::mime;
use crate::http::pair::Pair;
use crate::http::parser::parse_or_recover;
use crate::http::request::{Method, Request, Version};
use crate::http::response::{Body, Response, ResponseBuilder, StatusCode};
use crate::http::writer::ResponseWriter;
use crate::proxy::{ResourceProxy, Target};
use crate::server::log::{AccessRecord, LogSink};
use crate::store::{Chunk, ChunkId, StoreError, Tuple, TupleKey};

const READ_CHUNK: usize = 4096;
const SERVER_NAME: &str = concat!("tuplegate/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("client sent nothing within {0:?}")]
    ReadTimeout(Duration),

    /// A broken internal invariant; fatal to this connection only.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Chunk(#[from] ChunkError),
}

/// Knobs the connection needs from the server configuration.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Longest wait for the first request on a fresh socket
    pub read_timeout: Duration,
    /// Wait between buffered-request checks on a persistent connection
    pub idle_wait: Duration,
    /// Idle waits tolerated before a persistent connection is closed
    pub max_idle_ticks: u32,
    pub segment_threshold: usize,
    pub index_name: String,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(30),
            idle_wait: Duration::from_millis(100),
            max_idle_ticks: 50,
            segment_threshold: 64 * 1024,
            index_name: "index.html".to_string(),
        }
    }
}

/// Collaborators shared by every connection.
pub struct ConnectionContext {
    pub proxy: Arc<ResourceProxy>,
    pub pages: Arc<dyn ErrorPages>,
    pub log: Arc<dyn LogSink>,
    pub settings: ConnectionSettings,
}

/// Result of waiting for input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// At least one request was buffered
    Request,
    /// The client closed its side
    Closed,
    /// Nothing complete arrived within the wait
    TimedOut,
}

/// What the loop driver should do after a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Round {
    Continue,
    Close,
}

struct Sets {
    pending: BTreeMap<u64, Pair>,
    queued: BTreeMap<u64, Pair>,
    threshold: usize,
    fault: Option<String>,
}

/// The pending/queued sets plus the signal that wakes the pump.
pub struct Exchange {
    sets: Mutex<Sets>,
    ready: Notify,
}

impl Exchange {
    fn new(threshold: usize) -> Self {
        Self {
            sets: Mutex::new(Sets {
                pending: BTreeMap::new(),
                queued: BTreeMap::new(),
                threshold,
                fault: None,
            }),
            ready: Notify::new(),
        }
    }

    fn sets(&self) -> MutexGuard<'_, Sets> {
        self.sets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn add_pending(&self, pair: Pair) {
        self.sets().pending.insert(pair.sequence(), pair);
    }

    /// Attaches `response` to pending request `sequence`.
    ///
    /// If that request heads the pending set, it and every following request
    /// that already has a response move to the queued set. Otherwise the
    /// response waits behind its predecessors. Returns whether anything
    /// became writable.
    pub fn queue_response(&self, sequence: u64, response: Response) -> bool {
        let moved = {
            let mut sets = self.sets();
            let threshold = sets.threshold;
            let Some(pair) = sets.pending.get_mut(&sequence) else {
                tracing::warn!(sequence, "Response for a request that is not pending");
                return false;
            };
            pair.set_http_response(response, threshold);

            let mut moved = 0;
            while let Some(head) = sets.pending.first_entry() {
                if !head.get().has_response() {
                    break;
                }
                let pair = head.remove();
                sets.queued.insert(pair.sequence(), pair);
                moved += 1;
            }
            moved
        };

        if moved > 0 {
            self.ready.notify_one();
        }
        moved > 0
    }

    /// Deposits the next segment of a queued response.
    pub fn queue_chunk(&self, sequence: u64, chunk: Chunk) {
        {
            let mut sets = self.sets();
            let Sets { pending, queued, fault, .. } = &mut *sets;
            let slot = queued
                .get_mut(&sequence)
                .or_else(|| pending.get_mut(&sequence))
                .and_then(Pair::chunks_mut);

            match slot.map(|chunks| chunks.set_chunk(chunk)) {
                Some(Ok(())) => {}
                Some(Err(e)) => *fault = Some(format!("segment for request {sequence}: {e}")),
                None => *fault = Some(format!("segment for request {sequence} without a body in flight")),
            }
        }
        self.ready.notify_one();
    }

    /// Records a failed segment fetch; the connection cannot recover once
    /// the head has gone out.
    pub fn fail_chunk(&self, sequence: u64, reason: String) {
        self.sets().fault = Some(format!("segment for request {sequence}: {reason}"));
        self.ready.notify_one();
    }

    /// No request is waiting for or holding a response.
    pub fn is_idle(&self) -> bool {
        let sets = self.sets();
        sets.pending.is_empty() && sets.queued.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.sets().pending.len()
    }

    pub fn queued_len(&self) -> usize {
        self.sets().queued.len()
    }
}

/// One unit of output lifted out of the queued set.
enum Unit {
    Head {
        bytes: Vec<u8>,
        record: Pair,
        next: Option<ChunkId>,
    },
    Segment {
        data: Bytes,
        next: Option<ChunkId>,
    },
}

pub struct Connection<S = TcpStream> {
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    peer: SocketAddr,
    buffer: BytesMut,
    buffered: VecDeque<Request>,
    exchange: Arc<Exchange>,
    context: Arc<ConnectionContext>,
    next_sequence: u64,
    persistent: Option<bool>,
    closed: bool,
    idle_ticks: u32,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S, peer: SocketAddr, context: Arc<ConnectionContext>) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let threshold = context.settings.segment_threshold;

        Self {
            reader,
            writer,
            peer,
            buffer: BytesMut::with_capacity(READ_CHUNK),
            buffered: VecDeque::new(),
            exchange: Arc::new(Exchange::new(threshold)),
            context,
            next_sequence: 0,
            persistent: None,
            closed: false,
            idle_ticks: 0,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// `None` until the first request has been read.
    pub fn is_persistent(&self) -> Option<bool> {
        self.persistent
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn exchange(&self) -> &Arc<Exchange> {
        &self.exchange
    }

    /// Read but not yet dispatched.
    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// Nothing buffered, pending or queued, and the close flag is set.
    pub fn is_finished(&self) -> bool {
        self.closed && self.buffered.is_empty() && self.exchange.is_idle()
    }

    /// Drives the connection to completion: one round with the full read
    /// timeout, then idle-bounded rounds while it stays persistent.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let mut wait = self.context.settings.read_timeout;
        while self.run_round(wait).await? == Round::Continue {
            wait = self.context.settings.idle_wait;
        }
        self.shutdown().await;
        Ok(())
    }

    /// One pass of the loop driver: read if nothing is buffered, dispatch,
    /// then write every response that becomes ready.
    ///
    /// A read that times out on a fresh connection is fatal; on a persistent
    /// one it counts as an idle tick.
    pub async fn run_round(&mut self, wait: Duration) -> anyhow::Result<Round> {
        if self.buffered.is_empty() && !self.closed {
            match self.read_request(wait).await? {
                ReadOutcome::Request => self.idle_ticks = 0,
                ReadOutcome::Closed => self.closed = true,
                ReadOutcome::TimedOut if self.persistent.is_none() => {
                    return Err(ConnectionError::ReadTimeout(wait).into());
                }
                ReadOutcome::TimedOut => self.idle_ticks += 1,
            }
        }

        self.dispatch();
        self.flush_responses().await?;

        if self.closed || self.persistent == Some(false) {
            self.closed = true;
            return Ok(Round::Close);
        }

        if self.idle_ticks >= self.context.settings.max_idle_ticks {
            tracing::debug!(peer = %self.peer, ticks = self.idle_ticks, "Closing idle connection");
            self.closed = true;
            return Ok(Round::Close);
        }

        Ok(Round::Continue)
    }

    /// Waits up to `wait` for one complete request and buffers it, along
    /// with any further complete requests already received.
    ///
    /// Malformed input is buffered as an error request rather than failing
    /// the connection.
    pub async fn read_request(&mut self, wait: Duration) -> anyhow::Result<ReadOutcome> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            if self.parse_buffered() > 0 {
                return Ok(ReadOutcome::Request);
            }

            // Read more data
            self.buffer.reserve(READ_CHUNK);
            let read = tokio::time::timeout_at(deadline, self.reader.read_buf(&mut self.buffer)).await;

            match read {
                Err(_) => return Ok(ReadOutcome::TimedOut),
                Ok(Ok(0)) => {
                    if !self.buffer.is_empty() {
                        tracing::debug!(
                            peer = %self.peer,
                            bytes = self.buffer.len(),
                            "Client closed with a partial request"
                        );
                    }
                    return Ok(ReadOutcome::Closed);
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e).context("reading request"),
            }
        }
    }

    fn parse_buffered(&mut self) -> usize {
        let mut parsed = 0;

        while let Some((mut request, consumed)) = parse_or_recover(&self.buffer) {
            let _ = self.buffer.split_to(consumed);

            request.sequence = self.next_sequence;
            self.next_sequence += 1;

            if self.persistent.is_none() {
                let persistent = request.keep_alive();
                tracing::debug!(peer = %self.peer, version = %request.version, persistent, "Connection persistence");
                self.persistent = Some(persistent);
            }

            if let Some(status) = request.error {
                tracing::debug!(peer = %self.peer, sequence = request.sequence, status = status.as_u16(), "Malformed request");
            }

            self.buffered.push_back(request);
            parsed += 1;
        }

        parsed
    }

    /// Moves the oldest buffered request into the pending set.
    pub fn next_request(&mut self) -> Option<Pair> {
        let request = self.buffered.pop_front()?;
        let pair = Pair::new(request);
        let handle = pair.snapshot();
        self.exchange.add_pending(pair);
        Some(handle)
    }

    /// Dispatches every buffered request. Returns how many were dispatched.
    pub fn dispatch(&mut self) -> usize {
        if self.closed && !self.buffered.is_empty() {
            tracing::debug!(peer = %self.peer, dropped = self.buffered.len(), "Dropping requests after close");
            self.buffered.clear();
        }

        let mut dispatched = 0;
        while let Some(pair) = self.next_request() {
            self.resolve(pair);
            dispatched += 1;
        }
        dispatched
    }

    fn resolve(&self, pair: Pair) {
        let sequence = pair.sequence();
        let request = pair.request();
        let pages = &self.context.pages;

        if let Some(status) = request.error {
            let response = error_response(status, request.version, pages.as_ref(), None);
            self.exchange.queue_response(sequence, response);
            return;
        }

        if !request.method.is_supported() {
            let detail = format!("{} is not supported", request.method);
            let response = error_response(StatusCode::NotImplemented, request.version, pages.as_ref(), Some(&detail));
            self.exchange.queue_response(sequence, response);
            return;
        }

        let Some(path) = request.target_path() else {
            let response = error_response(StatusCode::BadRequest, request.version, pages.as_ref(), Some("invalid request target"));
            self.exchange.queue_response(sequence, response);
            return;
        };

        let target = Target::from_path(&path, &self.context.settings.index_name);
        let exchange = Arc::clone(&self.exchange);
        let pages = Arc::clone(pages);
        let version = request.version;

        self.context.proxy.fetch(
            target,
            Box::new(move |result| {
                let response = tuple_response(result, version, pages.as_ref());
                exchange.queue_response(sequence, response);
            }),
        );
    }

    fn request_chunk(&self, sequence: u64, request: &Request, id: ChunkId) {
        let Some(path) = request.target_path() else {
            self.exchange.fail_chunk(sequence, "invalid request target".into());
            return;
        };
        let target = Target::from_path(&path, &self.context.settings.index_name).chunk(id);
        let exchange = Arc::clone(&self.exchange);

        self.context.proxy.fetch(
            target,
            Box::new(move |result| match result {
                Ok(Some(Tuple::Chunk(chunk))) => exchange.queue_chunk(sequence, chunk),
                Ok(Some(Tuple::Data(_))) => exchange.fail_chunk(sequence, "expected a segment".into()),
                Ok(None) => exchange.fail_chunk(sequence, "segment not found".into()),
                Err(e) => exchange.fail_chunk(sequence, e.to_string()),
            }),
        );
    }

    /// Attaches a response to a pending request.
    pub fn queue_response(&self, sequence: u64, response: Response) -> bool {
        self.exchange.queue_response(sequence, response)
    }

    /// Deposits a body segment for a queued request.
    pub fn queue_chunk(&self, sequence: u64, chunk: Chunk) {
        self.exchange.queue_chunk(sequence, chunk)
    }

    /// Writes exactly one unit of output for the first queued request.
    ///
    /// Returns the bytes written for a head response, the negated segment
    /// size for a later body segment, and 0 when nothing is ready.
    pub async fn pump(&mut self) -> anyhow::Result<isize> {
        let Some((sequence, unit)) = self.next_unit()? else {
            return Ok(0);
        };

        match unit {
            Unit::Head { bytes, record, next } => {
                let mut writer = ResponseWriter::from_bytes(bytes);
                writer.write_to_stream(&mut self.writer).await?;
                self.log_access(&record);

                if let Some(id) = next {
                    self.request_chunk(sequence, record.request(), id);
                }
                Ok(writer.len() as isize)
            }
            Unit::Segment { data, next } => {
                let mut writer = ResponseWriter::from_bytes(data.to_vec());
                writer.write_to_stream(&mut self.writer).await?;

                if let Some(id) = next {
                    let request = self.request_of(sequence);
                    if let Some(request) = request {
                        self.request_chunk(sequence, &request, id);
                    }
                }
                Ok(-(writer.len() as isize))
            }
        }
    }

    fn request_of(&self, sequence: u64) -> Option<Request> {
        self.exchange
            .sets()
            .queued
            .get(&sequence)
            .map(|pair| pair.request().clone())
    }

    /// Lifts the next unit of output out of the queued set, under the lock.
    fn next_unit(&mut self) -> Result<Option<(u64, Unit)>, ConnectionError> {
        let exchange = Arc::clone(&self.exchange);
        let mut sets = exchange.sets();

        if let Some(fault) = sets.fault.take() {
            return Err(ConnectionError::Protocol(fault));
        }

        loop {
            let Some(mut entry) = sets.queued.first_entry() else {
                return Ok(None);
            };
            let sequence = *entry.key();
            let pair = entry.get_mut();

            let at_head = pair
                .chunks()
                .map_or(!pair.head_sent(), ChunkSequence::is_chunk_head);

            if at_head && self.closed {
                // a response already told the client this connection is done
                tracing::debug!(peer = %self.peer, sequence, "Discarding response after close");
                entry.remove();
                continue;
            }

            let unit = if at_head {
                let request = pair.request().clone();
                let response = pair
                    .response_mut()
                    .ok_or_else(|| ConnectionError::Protocol(format!("request {sequence} queued without a response")))?;

                let close = self.prepare_headers(&request, response);
                check_body(&request, response)?;

                let with_body = request.method != Method::HEAD;
                let bytes = crate::http::writer::serialize_response(response, with_body);

                let next = match pair.chunks_mut() {
                    Some(chunks) => chunks.next_chunk()?.and_then(|head| head.next),
                    None => None,
                };
                pair.mark_head_sent();

                if close {
                    self.closed = true;
                }

                Unit::Head {
                    bytes,
                    record: pair.snapshot(),
                    next,
                }
            } else {
                let Some(chunks) = pair.chunks_mut() else {
                    // head already out and no body left to stream
                    entry.remove();
                    continue;
                };
                match chunks.next_chunk() {
                    Ok(Some(chunk)) => Unit::Segment {
                        data: chunk.data,
                        next: chunk.next,
                    },
                    Ok(None) => return Ok(None),
                    Err(ChunkError::Exhausted) => {
                        entry.remove();
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            };

            if entry.get().is_finished() {
                entry.remove();
            }
            return Ok(Some((sequence, unit)));
        }
    }

    /// Fills in entity headers and settles the `Connection` header.
    ///
    /// Returns whether the connection must close after this response.
    fn prepare_headers(&self, request: &Request, response: &mut Response) -> bool {
        response.version = request.version;

        if response.header("Content-Length").is_none() && !response.status.forbids_body() {
            response.set_header("Content-Length", response.body.len().to_string());
        }

        if response.header("Content-Type").is_none() && !response.body.is_empty() {
            let index_name = &self.context.settings.index_name;
            let name = match request.target_path().map(|p| Target::from_path(&p, index_name).key) {
                Some(TupleKey::Name(name)) => name,
                _ => String::new(),
            };
            let content_type = mime::guess(&name, response.body.leading_bytes());
            response.set_header("Content-Type", content_type);
        }

        if response.header("Server").is_none() {
            response.set_header("Server", SERVER_NAME);
        }

        let close = match request.version {
            Version::Http09 => true,
            Version::Http10 => {
                request.wants_close() || !request.wants_keep_alive() || response.wants_close()
            }
            Version::Http11 => request.wants_close() || response.wants_close(),
        } || self.persistent == Some(false);

        match (request.version, close) {
            (Version::Http09, _) => {}
            (_, true) => response.set_header("Connection", "close"),
            (Version::Http10, false) => response.set_header("Connection", "keep-alive"),
            (Version::Http11, false) => response.remove_header("Connection"),
        }

        close
    }

    /// Writes every response that is or becomes ready, returning once no
    /// request is pending or queued.
    pub async fn flush_responses(&mut self) -> anyhow::Result<()> {
        let exchange = Arc::clone(&self.exchange);

        loop {
            let notified = exchange.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.pump().await? != 0 {
                continue;
            }
            if exchange.is_idle() {
                return Ok(());
            }
            notified.await;
        }
    }

    fn log_access(&self, record: &Pair) {
        let request = record.request();
        let Some(response) = record.response() else {
            return;
        };

        self.context.log.access(&AccessRecord {
            peer: self.peer,
            method: request.method.as_str(),
            path: &request.path,
            version: request.version,
            status: response.status,
            bytes: response.body.len(),
        });
    }

    /// Flushes and shuts down the write side.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.writer.shutdown().await {
            tracing::debug!(peer = %self.peer, error = %e, "Shutdown failed");
        }
    }
}

/// An empty body is only allowed where neither status nor method need one.
fn check_body(request: &Request, response: &Response) -> Result<(), ConnectionError> {
    let exempt = request.method == Method::HEAD || response.status.forbids_body();
    if response.body == Body::Empty && !exempt {
        return Err(ConnectionError::Protocol(format!(
            "{} response to {} {} has no body",
            response.status.as_u16(),
            request.method,
            request.path
        )));
    }
    Ok(())
}

/// Builds an error response whose body describes `status`.
pub fn error_response(
    status: StatusCode,
    version: Version,
    pages: &dyn ErrorPages,
    detail: Option<&str>,
) -> Response {
    ResponseBuilder::new(status)
        .version(version)
        .header("Content-Type", pages.content_type())
        .body(pages.render(status, detail))
        .build()
}

/// Turns a raw store result into the response for a GET or HEAD.
///
/// A missing tuple or resource is 404, a backend timeout 408, anything else
/// 500.
pub fn tuple_response(
    result: Result<Option<Tuple>, StoreError>,
    version: Version,
    pages: &dyn ErrorPages,
) -> Response {
    match result {
        Ok(Some(Tuple::Data(tuple))) => {
            let mut builder = ResponseBuilder::new(StatusCode::Ok)
                .version(version)
                .body(tuple.data);
            if let Some(content_type) = tuple.content_type {
                builder = builder.header("Content-Type", content_type);
            }
            builder.build()
        }
        Ok(Some(Tuple::Chunk(head))) => {
            let mut builder = ResponseBuilder::new(StatusCode::Ok).version(version);
            if let Some(content_type) = &head.content_type {
                builder = builder.header("Content-Type", content_type.clone());
            }
            builder.chunked(head).build()
        }
        Ok(None) => error_response(StatusCode::NotFound, version, pages, None),
        Err(StoreError::UnknownResource(path)) => error_response(
            StatusCode::NotFound,
            version,
            pages,
            Some(&format!("no resource {path}")),
        ),
        Err(StoreError::Timeout) => error_response(StatusCode::RequestTimeout, version, pages, None),
        Err(e) => {
            tracing::warn!(error = %e, "Store failure");
            error_response(StatusCode::InternalServerError, version, pages, None)
        }
    }
}
