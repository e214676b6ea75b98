use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use logos_realtime::{
    AliasLookup, Collaborators, Gateway, GatewayServer, GuestIdentity, OpenAccess, ServerConfig,
    ServerError,
};

#[derive(Parser)]
#[command(name = "logos-realtime")]
#[command(version)]
#[command(about = "Realtime document-collaboration gateway")]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:9090")]
    bind: String,
    /// RocksDB directory; documents stay in memory when omitted
    #[arg(long)]
    storage: Option<PathBuf>,
    /// Frames queued per connection before a slow client is dropped
    #[arg(long, default_value_t = 256)]
    outbound_capacity: usize,
    /// Seconds between transport pings
    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,
    /// Reject every document update
    #[arg(long)]
    read_only: bool,
    /// Locator that may never be opened (repeatable)
    #[arg(long = "forbid")]
    forbidden: Vec<String>,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            outbound_capacity: self.outbound_capacity,
            heartbeat_interval_secs: self.heartbeat_secs,
            storage_path: self.storage.clone(),
        }
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => log::info!("Shutdown requested"),
        Err(e) => {
            log::error!("Cannot listen for shutdown signal: {e}");
            std::future::pending::<()>().await
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    env_logger::init();
    let cli = Cli::parse();
    let config = cli.server_config();

    let persistence = config.open_persistence()?;

    let gateway = Arc::new(Gateway::new(Collaborators {
        identity: Arc::new(GuestIdentity),
        lookup: Arc::new(AliasLookup::new(cli.forbidden)),
        authorization: Arc::new(OpenAccess {
            read_only: cli.read_only,
        }),
        persistence,
    }));

    log::info!("Starting logos-realtime...");
    GatewayServer::new(config, gateway)
        .run(shutdown_signal())
        .await
}
