use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use metricstore::config::StoreConfig;
use metricstore::server::ApiServer;
use metricstore::service::StoreService;
use metricstore::store::{StoreManager, StoreOptions};

#[derive(Debug, Parser)]
#[command(name = "metricstore", about = "Time-series metrics store server")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1")]
    address: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8020)]
    port: u16,

    /// Path to the store configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to datastore files.
    #[arg(long, default_value = "/var/lib/metricstore")]
    datastore: PathBuf,

    /// Maximum size of the record log in MB before rotation.
    #[arg(long, default_value_t = 50)]
    recordlog_max_size: u64,

    /// Number of indexed datastore files to keep open at idle.
    #[arg(long, default_value_t = 20)]
    idle_files_open: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let listen: SocketAddr = format!("{}:{}", args.address, args.port).parse()?;

    let mut options = StoreOptions::new(&args.datastore);
    options.recordlog_max_size_mb = args.recordlog_max_size;
    options.idle_files_open = args.idle_files_open;
    if let Some(config_path) = args.config.as_ref() {
        let config = StoreConfig::from_file(config_path).await?;
        options.target_indexed_file_size = config.target_indexed_file_size(&listen.to_string());
        info!(
            servers = config.server.len(),
            target_indexed_file_size = options.target_indexed_file_size,
            "Loaded store configuration."
        );
    }

    let store = StoreManager::open(options).await?;
    let service = Arc::new(StoreService::new(Arc::clone(&store)));
    let server = ApiServer::start(listen, service);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down.");
    server.stop().await;
    store.shutdown().await;
    Ok(())
}
