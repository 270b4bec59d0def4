use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use tuplegate::config::Config;
use tuplegate::http::connection::ConnectionContext;
use tuplegate::http::error_page::HtmlErrorPages;
use tuplegate::proxy::ResourceProxy;
use tuplegate::server::log::TracingLog;
use tuplegate::server::{self, Server};
use tuplegate::store::MemoryStore;

/// `--config <path>` wins over `TUPLEGATE_CONFIG`.
fn config_arg() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(path));
        }
    }
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = match config_arg() {
        Some(path) => Config::from_file(&path),
        None => Config::load(),
    }
    .context("loading configuration")?;

    let store = MemoryStore::new(cfg.store.segment_threshold, cfg.lease_duration());
    if let Some(root) = &cfg.store.root_dir {
        store.load_dir(root)?;
    }

    let proxy = ResourceProxy::start(Arc::new(store), cfg.proxy_settings());
    let context = Arc::new(ConnectionContext {
        proxy,
        pages: Arc::new(HtmlErrorPages {
            server_name: cfg.server.server_name.clone(),
        }),
        log: Arc::new(TracingLog),
        settings: cfg.connection_settings(),
    });
    let server = Server::new(&cfg, context);

    tokio::select! {
        res = server::listener::run(&cfg.server.listen_addr, &server) => {
            res?;
        }

        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    server.shutdown().await
}
