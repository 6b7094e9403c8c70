use std::time::{SystemTime, UNIX_EPOCH};

use crate::proto::master::master_client::MasterClient;

/// Connect to the master given the list of servers
pub async fn connect_to_master(
    master_addrs: &[String],
) -> Result<MasterClient<tonic::transport::Channel>, Box<dyn std::error::Error + Send + Sync>> {
    for addr in master_addrs {
        match MasterClient::connect(format!("http://{}", addr)).await {
            Ok(client) => {
                tracing::info!("Connected to master at: {}", addr);
                return Ok(client);
            }
            Err(e) => {
                tracing::warn!("Failed to connect to master at {}: {}", addr, e);
            }
        }
    }

    // If none of the addresses are connectable, return an error
    Err(Box::new(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "No master servers are connectable",
    )))
}

/// Seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_secs()
}

/// Mint an opaque 128-bit chunk handle.
pub fn new_chunk_handle() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// Initialize tracing for a binary, writing to stdout or a rolling file
/// depending on the configured output. Returns the appender guard which must
/// stay alive for the lifetime of the process.
pub fn init_tracing(
    log_level: &str,
    log_output: &str,
    log_path: &str,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level.to_string()));

    if log_output == "file" {
        let path = std::path::Path::new(log_path);
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let file = path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| "chunkfs.log".to_string());
        let appender = tracing_appender::rolling::never(dir, file);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_handles_are_unique_and_opaque() {
        let a = new_chunk_handle();
        let b = new_chunk_handle();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
