//! HTTP protocol implementation.
//!
//! This module implements HTTP/0.9, 1.0 and 1.1 with persistent connections
//! and request pipelining.
//!
//! # Architecture
//!
//! The HTTP layer is organized into several submodules:
//!
//! - **`connection`**: Per-socket state machine that reorders asynchronous responses
//! - **`parser`**: Parses incoming HTTP requests from byte buffers, recovering from garbage
//! - **`request`**: HTTP request representation and persistence rules
//! - **`response`**: HTTP response representation with builder pattern
//! - **`pair`**: A request and its eventual response, ordered by sequence number
//! - **`chunk`**: Ordered reassembly of segmented response bodies
//! - **`writer`**: Serializes and writes HTTP responses to the client
//! - **`mime`**: MIME type detection based on file extensions and content
//! - **`error_page`**: Bodies for error responses
//!
//! # Request Lifecycle
//!
//! Each request moves through the connection's ordered sets:
//!
//! ```text
//!        ┌─────────────┐
//!        │  Buffered   │ ← Parsed, sequence number assigned
//!        └──────┬──────┘
//!               │ next_request
//!               ▼
//!        ┌──────────────────┐
//!        │    Pending       │ ← Waiting on the store, or on an earlier request
//!        └──────┬───────────┘
//!               │ Response ready and every earlier one is queued
//!               ▼
//!        ┌──────────────────┐
//!        │     Queued       │ ← Head, then each body segment as it arrives
//!        └──────┬───────────┘
//!               │ Last byte written
//!               ├─ Persistent → next buffered request
//!               └─ Close → Closed
//! ```
//!
//! # Example
//!
//! Connections are normally driven a round at a time by the server's worker
//! pool, but one can also be run to completion on its own task:
//!
//! ```ignore
//! use tuplegate::http::connection::Connection;
//! use tokio::net::TcpListener;
//!
//! let listener = TcpListener::bind("127.0.0.1:8080").await?;
//! let (socket, peer) = listener.accept().await?;
//! let mut conn = Connection::new(socket, peer, context.clone());
//! conn.run().await?;
//! ```

pub mod request;
pub mod response;
pub mod parser;
pub mod connection;
pub mod writer;
pub mod mime;
pub mod pair;
pub mod chunk;
pub mod error_page;
