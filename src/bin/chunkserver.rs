use clap::{Arg, Command};
use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::Server;

use chunkfs::chunkserver_service::ChunkService;
use chunkfs::config::load_config;
use chunkfs::proto::chunk::chunk_server::ChunkServer;
use chunkfs::util::{connect_to_master, init_tracing};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Parse command line arguments
    let matches = Command::new("ChunkServer")
        .version("1.0")
        .about("Starts a chunkfs chunkserver")
        .arg(
            Arg::new("address")
                .short('a')
                .long("address")
                .value_name("ADDR")
                .help("Sets the address for the chunkserver (e.g., 127.0.0.1:50010)")
                .required(true),
        )
        .arg(
            Arg::new("server-id")
                .short('i')
                .long("server-id")
                .value_name("ID")
                .help("Stable identifier reported to the master; derived from the address if absent"),
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
    let addr: SocketAddr = address.parse().expect("Invalid address format");
    let sanitized_address = addr.to_string().replace(':', "_");
    let server_id = matches
        .get_one::<String>("server-id")
        .cloned()
        .unwrap_or_else(|| format!("cs-{}", sanitized_address));
    let config_path = matches.get_one::<String>("config").unwrap();

    // Load configuration
    let config = load_config(config_path)
        .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { e.to_string().into() })?;
    let _log_guard = init_tracing(
        &config.common.log_level,
        &config.common.log_output,
        &config.chunkserver.log_path,
    );

    // Chunk files live under a per-server directory so several chunkservers
    // can share a host during development.
    let data_dir = format!("{}/{}", sanitized_address, config.chunkserver.data_path);
    let service = ChunkService::new(
        &server_id,
        &addr.to_string(),
        &data_dir,
        config.chunkserver,
        config.common,
    )?;
    tracing::info!("ChunkServer '{}' running at {}", server_id, addr);

    // Announce ourselves and the chunks already on disk.
    let mut master_client = connect_to_master(&service.common.master_addrs).await?;
    service.register_with_master(&mut master_client).await?;

    let _heartbeats = Arc::new(service.clone()).start_heartbeat_loop().await;
    let _sweeper = Arc::new(service.clone()).start_buffer_sweeper().await;

    Server::builder()
        .add_service(ChunkServer::new(service))
        .serve(addr)
        .await?;

    Ok(())
}
