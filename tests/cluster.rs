// End-to-end scenarios over real gRPC servers on localhost: every component
// runs in-process on ephemeral ports with scratch directories.
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tonic::transport::Server;

use chunkfs::chunkserver_service::ChunkService;
use chunkfs::client::FsClient;
use chunkfs::config::{ChunkServerConfig, ClientConfig, CommonConfig, MasterConfig};
use chunkfs::master_service::MasterService;
use chunkfs::proto::chunk::chunk_server::ChunkServer;
use chunkfs::proto::master::master_server::MasterServer;
use chunkfs::util::connect_to_master;

const MIB: u64 = 1024 * 1024;

fn free_addr() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

struct TestChunkServer {
    id: String,
    serve_task: JoinHandle<()>,
    heartbeat_task: JoinHandle<()>,
}

struct Cluster {
    tmp: tempfile::TempDir,
    common: CommonConfig,
    client_config: ClientConfig,
    master_config: MasterConfig,
    master: Arc<MasterService>,
    master_tasks: Vec<JoinHandle<()>>,
    chunkservers: Vec<TestChunkServer>,
}

impl Cluster {
    /// Master plus `num_chunkservers` chunkservers with 1 MiB chunks and
    /// second-scale heartbeats. A standby master address is reserved up
    /// front so restart tests can bring a recovered master up elsewhere.
    async fn start(num_chunkservers: usize, replication_factor: usize) -> Cluster {
        let tmp = tempfile::tempdir().unwrap();
        let primary_addr = free_addr();
        let standby_addr = free_addr();

        let common = CommonConfig {
            master_addrs: vec![primary_addr.clone(), standby_addr],
            chunk_size: MIB,
            replication_factor,
            heartbeat_interval: 1,
            heartbeat_timeout: 3,
            lease_duration: 60,
            snapshot_interval: 3600,
            ..CommonConfig::default()
        };
        let master_config = MasterConfig {
            wal_dir: tmp.path().join("master").to_string_lossy().to_string(),
            failure_scan_interval: 1,
            gc_interval: 1,
            rereplication_backoff_secs: 1,
            rereplication_backoff_cap_secs: 2,
            ..MasterConfig::default()
        };
        let client_config = ClientConfig {
            rpc_deadline_secs: 10,
            retry_budget: 5,
            retry_backoff_ms: 100,
            ..ClientConfig::default()
        };

        let (master, master_tasks) =
            spawn_master(&primary_addr, master_config.clone(), common.clone()).await;

        let mut cluster = Cluster {
            tmp,
            common,
            client_config,
            master_config,
            master,
            master_tasks,
            chunkservers: Vec::new(),
        };
        for i in 0..num_chunkservers {
            cluster.add_chunkserver(i).await;
        }
        cluster
    }

    async fn add_chunkserver(&mut self, i: usize) {
        let id = format!("cs-{}", i + 1);
        let addr = free_addr();
        let data_dir = self.tmp.path().join(&id);
        let cs_config = ChunkServerConfig {
            rack_id: format!("rack-{}", i + 1),
            ..ChunkServerConfig::default()
        };
        let service =
            ChunkService::new(&id, &addr, &data_dir, cs_config, self.common.clone()).unwrap();

        let mut master_client = connect_to_master(&self.common.master_addrs).await.unwrap();
        service.register_with_master(&mut master_client).await.unwrap();

        let heartbeat_task = Arc::new(service.clone()).start_heartbeat_loop().await;
        let socket = addr.parse().unwrap();
        let serve_service = service.clone();
        let serve_task = tokio::spawn(async move {
            let _ = Server::builder()
                .add_service(ChunkServer::new(serve_service))
                .serve(socket)
                .await;
        });
        wait_for_listen(&addr).await;

        self.chunkservers.push(TestChunkServer {
            id,
            serve_task,
            heartbeat_task,
        });
    }

    async fn client(&self) -> FsClient {
        FsClient::connect(self.common.clone(), self.client_config.clone())
            .await
            .unwrap()
    }

    fn kill_chunkserver(&self, index: usize) {
        let cs = &self.chunkservers[index];
        cs.serve_task.abort();
        cs.heartbeat_task.abort();
    }

    fn kill_master(&mut self) {
        for task in self.master_tasks.drain(..) {
            task.abort();
        }
    }

    async fn restart_master_on_standby(&mut self) {
        let standby = self.common.master_addrs[1].clone();
        let (master, tasks) =
            spawn_master(&standby, self.master_config.clone(), self.common.clone()).await;
        self.master = master;
        self.master_tasks = tasks;
    }

    fn data_dir_of(&self, index: usize) -> std::path::PathBuf {
        self.tmp.path().join(&self.chunkservers[index].id)
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        for task in self.master_tasks.drain(..) {
            task.abort();
        }
        for cs in &self.chunkservers {
            cs.serve_task.abort();
            cs.heartbeat_task.abort();
        }
    }
}

async fn spawn_master(
    addr: &str,
    config: MasterConfig,
    common: CommonConfig,
) -> (Arc<MasterService>, Vec<JoinHandle<()>>) {
    let master = Arc::new(MasterService::recover(addr, config, common).unwrap());
    let mut tasks = Vec::new();
    tasks.push(Arc::clone(&master).start_failure_detector().await);
    tasks.push(Arc::clone(&master).start_gc_task().await);
    let socket: std::net::SocketAddr = addr.parse().unwrap();
    let serve_master = Arc::clone(&master);
    tasks.push(tokio::spawn(async move {
        let _ = Server::builder()
            .add_service(MasterServer::new(serve_master))
            .serve(socket)
            .await;
    }));
    wait_for_listen(addr).await;
    (master, tasks)
}

async fn wait_for_listen(addr: &str) {
    for _ in 0..100 {
        if tokio::net::TcpStream::connect(addr).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("server at {} never came up", addr);
}

/// The master learns chunk (and thus file) sizes from heartbeat reports, so
/// metadata lags a write by up to one heartbeat interval.
async fn wait_for_size(client: &mut FsClient, path: &str, expected: u64) {
    for _ in 0..100 {
        if let Ok(info) = client.file_info(path).await {
            if info.size >= expected {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    panic!("file {} never reached {} bytes in master metadata", path, expected);
}

async fn wait_for_alive_replicas(master: &Arc<MasterService>, handle: &str, want: usize) {
    for _ in 0..200 {
        {
            let state = master.state.lock().await;
            if let Some(chunk) = state.chunks.get(handle) {
                let alive = chunk
                    .replicas
                    .iter()
                    .filter(|id| state.servers.get(*id).map(|s| s.alive).unwrap_or(false))
                    .count();
                if alive >= want {
                    return;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    panic!("chunk {} never reached {} live replicas", handle, want);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn create_write_read_round_trip() {
    let cluster = Cluster::start(3, 3).await;
    let mut client = cluster.client().await;

    client.create("/a").await.unwrap();
    client.write("/a", 0, b"Hola, GFS!").await.unwrap();

    wait_for_size(&mut client, "/a", 10).await;
    let bytes = client.read("/a", 0, 10).await.unwrap();
    assert_eq!(&bytes, b"Hola, GFS!");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_spanning_chunk_boundary_creates_two_chunks() {
    let cluster = Cluster::start(3, 3).await;
    let mut client = cluster.client().await;

    let mut data = vec![b'A'; MIB as usize];
    data.extend(vec![b'B'; (MIB / 2) as usize]);

    client.create("/big").await.unwrap();
    client.write("/big", 0, &data).await.unwrap();

    wait_for_size(&mut client, "/big", MIB + MIB / 2).await;
    let info = client.file_info("/big").await.unwrap();
    assert_eq!(info.size, MIB + MIB / 2);
    assert_eq!(info.chunk_handles.len(), 2);

    let first = client.read("/big", 0, MIB).await.unwrap();
    assert_eq!(first.len(), MIB as usize);
    assert!(first.iter().all(|&b| b == b'A'));

    let second = client.read("/big", MIB, MIB / 2).await.unwrap();
    assert_eq!(second.len(), (MIB / 2) as usize);
    assert!(second.iter().all(|&b| b == b'B'));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_appends_are_atomic_and_at_least_once() {
    let cluster = Cluster::start(3, 3).await;
    let mut client = cluster.client().await;
    client.create("/log").await.unwrap();

    let mut handles = Vec::new();
    for i in 1..=20u32 {
        let common = cluster.common.clone();
        let config = cluster.client_config.clone();
        handles.push(tokio::spawn(async move {
            let mut c = FsClient::connect(common, config).await.unwrap();
            c.append("/log", format!("R{}\n", i).as_bytes()).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // 9 three-byte records plus 11 four-byte records.
    let expected_total = 9 * 3 + 11 * 4;
    wait_for_size(&mut client, "/log", expected_total).await;
    let info = client.file_info("/log").await.unwrap();
    let content = client.read("/log", 0, info.size).await.unwrap();

    for i in 1..=20u32 {
        let needle = format!("R{}\n", i);
        let found = content
            .windows(needle.len())
            .any(|w| w == needle.as_bytes());
        assert!(found, "record {:?} missing from {:?}", needle, content);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lost_chunkserver_triggers_rereplication() {
    // A fourth chunkserver stands by as the re-replication target.
    let cluster = Cluster::start(4, 3).await;
    let mut client = cluster.client().await;

    client.create("/x").await.unwrap();
    client.write("/x", 0, b"replicate me").await.unwrap();
    wait_for_size(&mut client, "/x", 12).await;

    let info = client.file_info("/x").await.unwrap();
    let handle = info.chunk_handles[0].clone();

    // Equal load at allocation time places the chunk on cs-1..cs-3.
    let holder_index = 0;
    {
        let state = cluster.master.state.lock().await;
        assert!(state.chunks[&handle]
            .replicas
            .contains(&cluster.chunkservers[holder_index].id));
    }

    cluster.kill_chunkserver(holder_index);

    // Reads keep working off the surviving replicas the whole time.
    let bytes = client.read("/x", 0, 12).await.unwrap();
    assert_eq!(&bytes, b"replicate me");

    // Failure detection, clone onto cs-4, and the adoption heartbeat.
    wait_for_alive_replicas(&cluster.master, &handle, 3).await;
    {
        let state = cluster.master.state.lock().await;
        assert!(state.chunks[&handle]
            .replicas
            .contains(&cluster.chunkservers[3].id));
    }

    let bytes = client.read("/x", 0, 12).await.unwrap();
    assert_eq!(&bytes, b"replicate me");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn master_recovers_from_wal_alone() {
    let mut cluster = Cluster::start(3, 3).await;
    let mut client = cluster.client().await;

    client.create("/a").await.unwrap();
    client.write("/a", 0, b"payload v1").await.unwrap();
    client.append("/a", b"LOG\n").await.unwrap();
    client.rename("/a", "/b").await.unwrap();

    wait_for_size(&mut client, "/b", 14).await;
    let expected = client.read("/b", 0, 14).await.unwrap();
    assert_eq!(&expected, b"payload v1LOG\n");

    // Kill the master. No metadata snapshot was ever written, so recovery
    // has to come from the WAL alone.
    cluster.kill_master();
    let snapshot_path = cluster
        .tmp
        .path()
        .join("master")
        .join("metadata_snapshot.json");
    assert!(!snapshot_path.exists());

    cluster.restart_master_on_standby().await;

    // The recovered master re-learns liveness and sizes as chunkservers
    // re-register via their heartbeat loops.
    let mut recovered = None;
    for _ in 0..100 {
        let mut c = cluster.client().await;
        if let Ok(bytes) = c.read("/b", 0, 14).await {
            if bytes == expected {
                recovered = Some(bytes);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
    assert_eq!(recovered.as_deref(), Some(expected.as_slice()));

    // Namespace state survived too: /a is gone, /b exists.
    let mut c = cluster.client().await;
    assert!(c.file_info("/a").await.is_err());
    assert_eq!(c.list("/").await.unwrap(), vec!["/b".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn snapshot_is_copy_on_write() {
    let cluster = Cluster::start(3, 3).await;
    let mut client = cluster.client().await;

    client.create("/orig").await.unwrap();
    client.write("/orig", 0, b"v1").await.unwrap();
    wait_for_size(&mut client, "/orig", 2).await;

    client.snapshot("/orig", "/snap").await.unwrap();

    // The next write to /orig duplicates the shared chunk before mutating.
    client.write("/orig", 0, b"v2").await.unwrap();

    let orig = client.read("/orig", 0, 2).await.unwrap();
    assert_eq!(&orig, b"v2");
    let snap = client.read("/snap", 0, 2).await.unwrap();
    assert_eq!(&snap, b"v1");

    // The two files now point at distinct chunks.
    let orig_info = client.file_info("/orig").await.unwrap();
    let snap_info = client.file_info("/snap").await.unwrap();
    assert_ne!(orig_info.chunk_handles, snap_info.chunk_handles);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reads_fail_over_on_checksum_mismatch() {
    let cluster = Cluster::start(3, 3).await;
    let mut client = cluster.client().await;

    client.create("/f").await.unwrap();
    client.write("/f", 0, b"trust but verify").await.unwrap();
    wait_for_size(&mut client, "/f", 16).await;

    let info = client.file_info("/f").await.unwrap();
    let handle = info.chunk_handles[0].clone();

    // Corrupt the first replica's copy on disk behind its back. Replica
    // order in location replies is deterministic (sorted server ids), so
    // cs-1 is the replica a fresh client tries first.
    let victim = cluster.data_dir_of(0).join(format!("{}.chunk", handle));
    let mut raw = std::fs::read(&victim).unwrap();
    raw[0] ^= 0xff;
    std::fs::write(&victim, &raw).unwrap();

    let bytes = client.read("/f", 0, 16).await.unwrap();
    assert_eq!(&bytes, b"trust but verify");

    // The failed replica was reported to the master and dropped from the
    // serving set.
    for _ in 0..50 {
        {
            let state = cluster.master.state.lock().await;
            if !state.chunks[&handle].replicas.contains("cs-1") {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    panic!("bad replica was never evicted from the serving set");
}
