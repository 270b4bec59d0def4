//! Socket acceptance and connection scheduling.
//!
//! - **`listener`**: accept loop feeding the worker pool
//! - **`pool`**: bounded queue and resizable worker set
//! - **`log`**: access and error log sink

pub mod listener;
pub mod log;
pub mod pool;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;

use crate::config::Config;
use crate::http::connection::{Connection, ConnectionContext, Round};
use crate::server::pool::{Handler, PoolStatus, QueueHandle, WorkerPool};

/// An item of work for the pool.
pub enum Work {
    /// A freshly accepted socket
    Accept(TcpStream, SocketAddr),
    /// A persistent connection waiting for its next round
    Resume(Box<Connection>),
}

/// Runs one round of a connection per dequeued item and requeues it while
/// it stays open.
pub struct ConnectionHandler {
    context: Arc<ConnectionContext>,
}

impl ConnectionHandler {
    pub fn new(context: Arc<ConnectionContext>) -> Self {
        Self { context }
    }
}

impl Handler<Work> for ConnectionHandler {
    async fn handle(&self, item: Work, queue: QueueHandle<Work>) {
        let settings = &self.context.settings;
        let (mut conn, wait) = match item {
            Work::Accept(stream, peer) => {
                let conn = Connection::new(stream, peer, Arc::clone(&self.context));
                (Box::new(conn), settings.read_timeout)
            }
            Work::Resume(conn) => (conn, settings.idle_wait),
        };
        let peer = conn.peer();

        match conn.run_round(wait).await {
            Ok(Round::Continue) => match queue.offer(Work::Resume(conn)) {
                Ok(None) => {}
                Ok(Some(Work::Resume(mut conn))) => {
                    tracing::debug!(peer = %peer, "Queue refused persistent connection, closing");
                    conn.shutdown().await;
                }
                Ok(Some(Work::Accept(..))) => {}
                Err(e) => tracing::debug!(peer = %peer, error = %e, "Pool terminated, dropping connection"),
            },
            Ok(Round::Close) => conn.shutdown().await,
            Err(e) => {
                self.context
                    .log
                    .error(Some(peer), "connection", "Connection error", Some(&e));
                conn.shutdown().await;
            }
        }
    }
}

/// The worker pool together with the context every connection shares.
pub struct Server {
    pool: WorkerPool<Work, ConnectionHandler>,
    context: Arc<ConnectionContext>,
}

impl Server {
    /// Starts the worker pool. Must be called inside a tokio runtime.
    pub fn new(config: &Config, context: Arc<ConnectionContext>) -> Self {
        let handler = ConnectionHandler::new(Arc::clone(&context));
        let pool = WorkerPool::new(config.pool.queue_capacity, config.pool.workers, handler);
        Self { pool, context }
    }

    pub fn pool(&self) -> &WorkerPool<Work, ConnectionHandler> {
        &self.pool
    }

    pub fn context(&self) -> &Arc<ConnectionContext> {
        &self.context
    }

    /// Stops accepting work, lets queued connections finish their current
    /// round, then stops the workers and releases every cached binding.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.pool.set_status(PoolStatus::Drained).await?;
        self.pool.set_status(PoolStatus::Terminated).await?;
        self.context.proxy.shutdown();
        tracing::info!("Server stopped");
        Ok(())
    }
}
