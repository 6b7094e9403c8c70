use serde::Deserialize;
use std::fs;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub wal_dir: String,
    pub wal_file: String,
    pub log_path: String,
    pub failure_scan_interval: u64, // Interval of the failure-detector task in seconds
    pub gc_interval: u64,           // Interval of the garbage-collection task in seconds
    pub rereplication_max_attempts: u32,
    pub rereplication_backoff_secs: u64, // Initial backoff between clone attempts
    pub rereplication_backoff_cap_secs: u64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            wal_dir: "master_meta".to_string(),
            wal_file: "wal.log".to_string(),
            log_path: "logs/master.log".to_string(),
            failure_scan_interval: 5,
            gc_interval: 60,
            rereplication_max_attempts: 5,
            rereplication_backoff_secs: 2,
            rereplication_backoff_cap_secs: 60,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ChunkServerConfig {
    pub data_path: String,
    pub rack_id: String, // Placement hint reported at registration
    pub log_path: String,
    pub buffer_ttl_secs: u64, // Lifetime of pushed-but-uncommitted data buffers
}

impl Default for ChunkServerConfig {
    fn default() -> Self {
        Self {
            data_path: "data".to_string(),
            rack_id: "default-rack".to_string(),
            log_path: "logs/chunkserver.log".to_string(),
            buffer_ttl_secs: 60,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub log_path: String,
    pub rpc_deadline_secs: u64,
    pub retry_budget: u32,
    pub retry_backoff_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            log_path: "logs/client.log".to_string(),
            rpc_deadline_secs: 30,
            retry_budget: 5,
            retry_backoff_ms: 200,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CommonConfig {
    pub master_addrs: Vec<String>,   // Master addresses tried in order
    pub chunk_size: u64,             // Maximum bytes per chunk
    pub replication_factor: usize,   // Target number of replicas per chunk
    pub heartbeat_interval: u64,     // Chunkserver heartbeat cadence in seconds
    pub heartbeat_timeout: u64,      // Silence after which a chunkserver is dead
    pub lease_duration: u64,         // Lease lifetime in seconds
    pub snapshot_interval: u64,      // Metadata snapshot cadence in seconds
    pub garbage_retention_days: u64, // Delay before physical deletion
    pub log_level: String,           // Log level (e.g., "debug", "info", etc.)
    pub log_output: String,          // Log output ("stdout" or "file")
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            master_addrs: vec!["127.0.0.1:50051".to_string()],
            chunk_size: 64 * 1024 * 1024,
            replication_factor: 3,
            heartbeat_interval: 10,
            heartbeat_timeout: 30,
            lease_duration: 60,
            snapshot_interval: 60,
            garbage_retention_days: 3,
            log_level: "info".to_string(),
            log_output: "stdout".to_string(),
        }
    }
}

impl CommonConfig {
    pub fn garbage_retention_secs(&self) -> u64 {
        self.garbage_retention_days * 24 * 60 * 60
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub master: MasterConfig,
    pub chunkserver: ChunkServerConfig,
    pub client: ClientConfig,
    pub common: CommonConfig,
}

pub fn load_config(path: &str) -> Result<Config, Box<dyn std::error::Error>> {
    // Read the config file
    let config_content = fs::read_to_string(path)?;
    // Parse the TOML content into the Config struct
    let config: Config = toml::from_str(&config_content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let common = CommonConfig::default();
        assert_eq!(common.chunk_size, 64 * 1024 * 1024);
        assert_eq!(common.replication_factor, 3);
        assert_eq!(common.heartbeat_interval, 10);
        assert_eq!(common.heartbeat_timeout, 30);
        assert_eq!(common.lease_duration, 60);
        assert_eq!(common.garbage_retention_secs(), 3 * 24 * 60 * 60);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [common]
            chunk_size = 1048576
            replication_factor = 2

            [chunkserver]
            rack_id = "rack-a"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.common.chunk_size, 1048576);
        assert_eq!(parsed.common.replication_factor, 2);
        assert_eq!(parsed.common.heartbeat_interval, 10);
        assert_eq!(parsed.chunkserver.rack_id, "rack-a");
        assert_eq!(parsed.master.rereplication_max_attempts, 5);
    }
}
