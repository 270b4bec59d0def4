//! Tuplegate - pipelining HTTP front end for an asynchronous tuple store
//!
//! Core library for the HTTP connection engine, backend proxy, caches and
//! worker pool.

pub mod cache;
pub mod config;
pub mod http;
pub mod proxy;
pub mod server;
pub mod store;
