use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::http::connection::error_response;
use crate::http::request::Version;
use crate::http::response::StatusCode;
use crate::http::writer::ResponseWriter;
use crate::server::{Server, Work};

pub async fn run(addr: &str, server: &Server) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on {}", listener.local_addr()?);
    serve(listener, server).await
}

/// Accepts sockets until the listener fails, handing each to the pool.
pub async fn serve(listener: TcpListener, server: &Server) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        tracing::debug!(peer = %peer, "Accepted connection");

        match server.pool().offer(Work::Accept(socket, peer))? {
            None => {}
            Some(Work::Accept(socket, peer)) => {
                warn!(peer = %peer, "Worker queue full, connection refused");
                if let Err(e) = reject(socket, server).await {
                    tracing::debug!(peer = %peer, error = %e, "Failed to send 503");
                }
            }
            Some(Work::Resume(_)) => {}
        }
    }
}

/// Answers 503 and closes; used when the pool cannot take the socket.
pub async fn reject(mut socket: TcpStream, server: &Server) -> anyhow::Result<()> {
    let pages = server.context().pages.as_ref();
    let mut response = error_response(StatusCode::ServiceUnavailable, Version::Http11, pages, None);
    response.set_header("Content-Length", response.body.len().to_string());
    response.set_header("Connection", "close");

    let mut writer = ResponseWriter::new(&response, true);
    writer.write_to_stream(&mut socket).await
}
