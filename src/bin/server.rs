//! Process entrypoint (C10).
//!
//! Parses `--config`/`--logger` overrides, resolves the layered
//! configuration, initializes logging, binds the listener, and runs the
//! event loop until a terminal-interrupt signal or a fatal protocol
//! violation ends it.

use std::path::PathBuf;
use std::sync::Arc;

use structopt::StructOpt;

use bbsd::config;
use bbsd::engine::Engine;
use bbsd::listener::Listener;
use bbsd::logging;
use bbsd::session::{spawn_echo_session, SessionSpawn};
use bbsd::storage::{InMemoryStorage, StorageBackend};

#[derive(StructOpt)]
#[structopt(
    name = "bbsd",
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = "Telnet connection multiplexer"
)]
struct Cli {
    /// Path to the main configuration document. Defaults to the standard
    /// lookup order (/etc/bbsd/default.ini, ~/.bbsd/default.ini).
    #[structopt(long, parse(from_os_str))]
    config: Option<PathBuf>,

    /// Path to the logging configuration document. Same lookup order,
    /// under logging.ini.
    #[structopt(long, parse(from_os_str))]
    logger: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::from_args();

    let config = match config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("bbsd: configuration error: {}", err);
            std::process::exit(1);
        }
    };

    let logging_path = config::resolve_logging_path(cli.logger.as_deref());
    logging::init(logging_path.as_deref());

    let addr = std::net::SocketAddr::new(config.telnet_addr, config.telnet_port);
    let listener = match Listener::bind(addr, config.max_connections).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%err, %addr, "failed to bind listener");
            std::process::exit(1);
        }
    };

    let storage: Arc<dyn StorageBackend> = Arc::new(InMemoryStorage::new());
    let spawn: Arc<dyn SessionSpawn> = Arc::new(spawn_echo_session);
    let engine = Engine::new(listener, storage, spawn, config.session_timeout);

    if let Err(err) = engine.run().await {
        tracing::error!(%err, "event loop exited with a fatal error");
        std::process::exit(1);
    }
}
