use clap::{Arg, Command};
use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::Server;

use chunkfs::config::load_config;
use chunkfs::master_service::MasterService;
use chunkfs::proto::master::master_server::MasterServer;
use chunkfs::util::init_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let matches = Command::new("Master")
        .version("1.0")
        .about("Starts the chunkfs metadata master")
        .arg(
            Arg::new("address")
                .short('a')
                .long("address")
                .value_name("ADDR")
                .help("Sets the address for the master (e.g., 127.0.0.1:50051)")
                .required(true),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .default_value("config.toml")
                .help("Path to the configuration file"),
        )
        .get_matches();

    let address = matches
        .get_one::<String>("address")
        .expect("Address is required");
    let config_path = matches.get_one::<String>("config").unwrap();

    // Load configuration
    let config = load_config(config_path)?;
    let _log_guard = init_tracing(
        &config.common.log_level,
        &config.common.log_output,
        &config.master.log_path,
    );

    // Recover metadata from snapshot + WAL before serving anything.
    let service = Arc::new(MasterService::recover(
        address,
        config.master,
        config.common,
    )?);

    // Background tasks: failure detection, garbage collection, snapshots.
    let _detector = Arc::clone(&service).start_failure_detector().await;
    let _gc = Arc::clone(&service).start_gc_task().await;
    let _snapshots = Arc::clone(&service).start_snapshot_task().await;

    let addr: SocketAddr = address.parse()?;
    tracing::info!("Master running at {}", addr);

    Server::builder()
        .add_service(MasterServer::new(Arc::clone(&service)))
        .serve(addr)
        .await?;

    Ok(())
}
