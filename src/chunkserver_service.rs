// Internal state and background loops of a chunkserver: data buffers from
// pipelined pushes, per-chunk mutation locks, the persistent version table,
// and the heartbeat/clone machinery.
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

use crate::chunkserver_storage::ChunkStore;
use crate::config::{ChunkServerConfig, CommonConfig};
use crate::error::FsError;
use crate::proto::chunk::chunk_client::ChunkClient;
use crate::proto::chunk::ReadChunkRequest;
use crate::proto::master::master_client::MasterClient;
use crate::proto::master::{ChunkReport, CloneCommand, HeartbeatRequest, RegisterRequest};
use crate::util::{connect_to_master, now_secs};

const CLONE_READ_STEP: u64 = 1024 * 1024;

#[derive(Clone, Debug)]
struct BufferedData {
    data: Bytes,
    inserted_at: u64,
}

#[derive(Clone, Debug)]
pub struct ChunkService {
    pub server_id: String,
    pub addr: String, // Address peers and clients dial
    pub store: ChunkStore,
    pub config: ChunkServerConfig,
    pub common: CommonConfig,
    buffers: Arc<Mutex<HashMap<String, BufferedData>>>,
    versions: Arc<Mutex<HashMap<String, u64>>>,
    serials: Arc<Mutex<HashMap<String, u64>>>,
    corrupt: Arc<Mutex<HashSet<String>>>,
    chunk_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    version_db: PathBuf,
}

impl ChunkService {
    pub fn new(
        server_id: &str,
        addr: &str,
        data_dir: impl Into<PathBuf>,
        config: ChunkServerConfig,
        common: CommonConfig,
    ) -> Result<Self, FsError> {
        let data_dir = data_dir.into();
        let store = ChunkStore::new(&data_dir)?;
        let version_db = data_dir.join("versions.json");
        let versions: HashMap<String, u64> = match std::fs::read_to_string(&version_db) {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            server_id: server_id.to_string(),
            addr: addr.to_string(),
            store,
            config,
            common,
            buffers: Arc::new(Mutex::new(HashMap::new())),
            versions: Arc::new(Mutex::new(versions)),
            serials: Arc::new(Mutex::new(HashMap::new())),
            corrupt: Arc::new(Mutex::new(HashSet::new())),
            chunk_locks: Arc::new(Mutex::new(HashMap::new())),
            version_db,
        })
    }

    /// The mutex serializing mutations of one chunk. Mutations on different
    /// chunks proceed concurrently.
    pub async fn chunk_lock(&self, handle: &str) -> Arc<Mutex<()>> {
        let mut locks = self.chunk_locks.lock().await;
        locks
            .entry(handle.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn put_buffer(&self, fingerprint: &str, data: Vec<u8>) {
        let mut buffers = self.buffers.lock().await;
        buffers.insert(
            fingerprint.to_string(),
            BufferedData {
                data: Bytes::from(data),
                inserted_at: now_secs(),
            },
        );
    }

    pub async fn take_buffer(&self, fingerprint: &str) -> Option<Bytes> {
        let mut buffers = self.buffers.lock().await;
        buffers.remove(fingerprint).map(|b| b.data)
    }

    pub async fn stored_version(&self, handle: &str) -> u64 {
        let versions = self.versions.lock().await;
        versions.get(handle).copied().unwrap_or(0)
    }

    /// Record a chunk version durably; versions survive restarts so stale
    /// replicas can be told apart after a crash.
    pub async fn set_version(&self, handle: &str, version: u64) -> Result<(), FsError> {
        let mut versions = self.versions.lock().await;
        versions.insert(handle.to_string(), version);
        self.persist_versions(&versions)
    }

    pub async fn forget_chunk(&self, handle: &str) -> Result<(), FsError> {
        {
            let mut versions = self.versions.lock().await;
            versions.remove(handle);
            self.persist_versions(&versions)?;
        }
        self.serials.lock().await.remove(handle);
        self.corrupt.lock().await.remove(handle);
        Ok(())
    }

    fn persist_versions(&self, versions: &HashMap<String, u64>) -> Result<(), FsError> {
        let raw = serde_json::to_string(versions)?;
        std::fs::write(&self.version_db, raw)?;
        Ok(())
    }

    /// Next mutation serial for a chunk; assigned by the primary under the
    /// chunk lock.
    pub async fn next_serial(&self, handle: &str) -> u64 {
        let mut serials = self.serials.lock().await;
        let serial = serials.entry(handle.to_string()).or_insert(0);
        *serial += 1;
        *serial
    }

    pub async fn mark_corrupt(&self, handle: &str) {
        warn!("[Storage] Marking replica of {} corrupt", handle);
        self.corrupt.lock().await.insert(handle.to_string());
    }

    /// Chunks reported to the master. Corrupt replicas are omitted so the
    /// master re-replicates them elsewhere.
    pub async fn chunk_report(&self) -> Result<Vec<ChunkReport>, FsError> {
        let corrupt = self.corrupt.lock().await.clone();
        let versions = self.versions.lock().await.clone();
        let mut report = Vec::new();
        for (handle, size) in self.store.list_chunks().await? {
            if corrupt.contains(&handle) {
                continue;
            }
            report.push(ChunkReport {
                version: versions.get(&handle).copied().unwrap_or(0),
                size,
                handle,
            });
        }
        Ok(report)
    }

    /// Register with the master, executing any deletions it orders for
    /// chunks it no longer expects here.
    pub async fn register_with_master(
        &self,
        client: &mut MasterClient<tonic::transport::Channel>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let chunks = self.chunk_report().await?;
        let response = client
            .register_chunk_server(tonic::Request::new(RegisterRequest {
                server_id: self.server_id.clone(),
                address: self.addr.clone(),
                rack_id: self.config.rack_id.clone(),
                chunks,
            }))
            .await?
            .into_inner();
        info!("[Register] {}", response.message);
        for handle in response.chunks_to_delete {
            if let Err(e) = self.store.delete(&handle).await {
                warn!("[Register] Failed to delete chunk {}: {}", handle, e);
            }
            let _ = self.forget_chunk(&handle).await;
        }
        Ok(())
    }

    /// Periodic heartbeat: report holdings, then execute the master's
    /// delete and clone orders.
    pub async fn start_heartbeat_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_secs(self.common.heartbeat_interval);
        let service = Arc::clone(&self);

        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            let mut client: Option<MasterClient<tonic::transport::Channel>> = None;

            loop {
                ticker.tick().await;

                if client.is_none() {
                    client = connect_to_master(&service.common.master_addrs).await.ok();
                }
                let Some(master) = client.as_mut() else {
                    warn!("[Heartbeat] No master reachable");
                    continue;
                };

                let chunks = match service.chunk_report().await {
                    Ok(chunks) => chunks,
                    Err(e) => {
                        error!("[Heartbeat] Failed to scan local chunks: {}", e);
                        continue;
                    }
                };

                let request = HeartbeatRequest {
                    server_id: service.server_id.clone(),
                    chunks,
                    timestamp: now_secs(),
                };
                match master.heartbeat(tonic::Request::new(request)).await {
                    Ok(response) => {
                        let reply = response.into_inner();
                        service.execute_deletes(reply.chunks_to_delete).await;
                        for command in reply.chunks_to_clone {
                            let svc = Arc::clone(&service);
                            tokio::spawn(async move {
                                if let Err(e) = svc.execute_clone(&command).await {
                                    error!(
                                        "[Heartbeat] Clone of {} from {} failed: {}",
                                        command.handle, command.source_address, e
                                    );
                                }
                            });
                        }
                    }
                    Err(e) => {
                        warn!("[Heartbeat] Failed to send heartbeat: {}", e);
                        // The master may have restarted and lost our runtime
                        // record; re-register on the next tick.
                        if e.code() == tonic::Code::NotFound {
                            if let Some(master) = client.as_mut() {
                                let _ = service.register_with_master(master).await;
                            }
                        } else {
                            client = None;
                        }
                    }
                }
            }
        })
    }

    async fn execute_deletes(&self, handles: Vec<String>) {
        let deletions = handles.into_iter().map(|handle| async move {
            info!("[Heartbeat] Master ordered deletion of chunk {}", handle);
            if let Err(e) = self.store.delete(&handle).await {
                warn!("[Heartbeat] Failed to delete chunk {}: {}", handle, e);
            }
            let _ = self.forget_chunk(&handle).await;
        });
        futures::future::join_all(deletions).await;
    }

    pub async fn execute_clone(&self, command: &CloneCommand) -> Result<(), tonic::Status> {
        self.clone_from_peer(
            &command.handle,
            &command.source_handle,
            &command.source_address,
            command.version,
        )
        .await
    }

    /// Pull a chunk image from a peer with ranged reads and install it
    /// locally at the given version.
    pub async fn clone_from_peer(
        &self,
        handle: &str,
        source_handle: &str,
        source_address: &str,
        version: u64,
    ) -> Result<(), tonic::Status> {
        let mut client = ChunkClient::connect(format!("http://{}", source_address))
            .await
            .map_err(|e| {
                tonic::Status::unavailable(format!(
                    "failed to connect to source chunkserver '{}': {}",
                    source_address, e
                ))
            })?;

        let mut data: Vec<u8> = Vec::new();
        loop {
            let request = ReadChunkRequest {
                handle: source_handle.to_string(),
                offset: data.len() as u64,
                length: CLONE_READ_STEP,
            };
            let reply = match client.read_chunk(tonic::Request::new(request)).await {
                Ok(reply) => reply.into_inner(),
                // A chunk with no bytes yet has no file on the source.
                Err(e) if e.code() == tonic::Code::NotFound && data.is_empty() => break,
                Err(e) => return Err(e),
            };
            let total = reply.chunk_length;
            data.extend_from_slice(&reply.data);
            if data.len() as u64 >= total || reply.data.is_empty() {
                break;
            }
        }

        self.store
            .install(handle, &data)
            .await
            .map_err(tonic::Status::from)?;
        self.set_version(handle, version)
            .await
            .map_err(tonic::Status::from)?;
        // A fresh install replaces whatever local copy went bad.
        self.corrupt.lock().await.remove(handle);
        info!(
            "[Clone] Installed chunk {} ({} bytes) at version {} from {}",
            handle,
            data.len(),
            version,
            source_address
        );
        Ok(())
    }

    /// Drop pushed-but-never-committed buffers after their TTL.
    pub async fn start_buffer_sweeper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let ttl = self.config.buffer_ttl_secs;
        let service = Arc::clone(&self);
        tokio::spawn(async move {
            let mut ticker = time::interval(Duration::from_secs(ttl.max(2) / 2));
            loop {
                ticker.tick().await;
                let cutoff = now_secs().saturating_sub(ttl);
                let mut buffers = service.buffers.lock().await;
                let before = buffers.len();
                buffers.retain(|_, b| b.inserted_at >= cutoff);
                let dropped = before - buffers.len();
                if dropped > 0 {
                    debug!("[Buffers] Expired {} stale data buffers", dropped);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(dir: &std::path::Path) -> ChunkService {
        ChunkService::new(
            "cs-test",
            "127.0.0.1:0",
            dir,
            ChunkServerConfig::default(),
            CommonConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn buffers_are_take_once() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        svc.put_buffer("fp1", b"data".to_vec()).await;
        assert_eq!(svc.take_buffer("fp1").await.as_deref(), Some(&b"data"[..]));
        assert_eq!(svc.take_buffer("fp1").await, None);
    }

    #[tokio::test]
    async fn versions_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let svc = service(dir.path());
            svc.set_version("h1", 3).await.unwrap();
            svc.set_version("h2", 1).await.unwrap();
            svc.forget_chunk("h2").await.unwrap();
        }
        let svc = service(dir.path());
        assert_eq!(svc.stored_version("h1").await, 3);
        assert_eq!(svc.stored_version("h2").await, 0);
    }

    #[tokio::test]
    async fn serials_increase_per_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        assert_eq!(svc.next_serial("a").await, 1);
        assert_eq!(svc.next_serial("a").await, 2);
        assert_eq!(svc.next_serial("b").await, 1);
    }

    #[tokio::test]
    async fn corrupt_chunks_are_left_out_of_reports() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        svc.store.install("h1", b"aa").await.unwrap();
        svc.store.install("h2", b"bbb").await.unwrap();
        svc.set_version("h1", 1).await.unwrap();
        svc.set_version("h2", 2).await.unwrap();
        svc.mark_corrupt("h1").await;

        let report = svc.chunk_report().await.unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].handle, "h2");
        assert_eq!(report[0].version, 2);
        assert_eq!(report[0].size, 3);
    }
}
