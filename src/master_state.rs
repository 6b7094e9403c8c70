// In-memory master metadata: namespace, chunk map, chunkserver table, leases,
// replica placement, repair planning and garbage collection. All methods are
// called with the master mutex held; mutations go through the WAL first.
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

use crate::config::{CommonConfig, MasterConfig};
use crate::error::FsError;
use crate::master_wal::{self, MetaOp, MetadataSnapshot, WalWriter};
use crate::util::new_chunk_handle;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileMeta {
    pub chunks: Vec<String>,
    pub created_at: u64,
    pub modified_at: u64,
    pub deleted: bool,
    pub deleted_at: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub primary: String,
    pub expiry: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub version: u64,
    // Largest size reported by a replica; soft state.
    pub size: u64,
    pub replicas: BTreeSet<String>,
    pub lease: Option<Lease>,
    pub refcount: u32,
    pub cow: bool,
    pub unreferenced_since: Option<u64>,
    // Replicas only learn a bumped version from the first mutation under the
    // new lease, so a lagging report is not stale until some replica has
    // confirmed the current version.
    #[serde(default)]
    pub version_confirmed: bool,
}

impl ChunkMeta {
    fn new(replicas: BTreeSet<String>) -> Self {
        Self {
            version: 0,
            size: 0,
            replicas,
            lease: None,
            refcount: 1,
            cow: false,
            unreferenced_since: None,
            version_confirmed: false,
        }
    }
}

/// Runtime record of a chunkserver; never persisted. Liveness and chunk
/// holdings are re-learned from registration and heartbeats after a restart.
#[derive(Clone, Debug)]
pub struct ServerRecord {
    pub id: String,
    pub address: String,
    pub rack_id: String,
    pub alive: bool,
    pub last_heartbeat: u64,
    pub chunks: HashSet<String>,
}

/// One chunk as reported in a heartbeat or registration.
#[derive(Clone, Debug)]
pub struct ReplicaReport {
    pub handle: String,
    pub version: u64,
    pub size: u64,
}

/// Clone order queued for delivery in a destination server's next heartbeat
/// reply.
#[derive(Clone, Debug)]
pub struct CloneDirective {
    pub handle: String,
    pub source_handle: String,
    pub source_address: String,
    pub version: u64,
}

#[derive(Clone, Debug)]
pub struct ReplicaAddr {
    pub server_id: String,
    pub address: String,
}

#[derive(Clone, Debug)]
pub struct LeaseInfo {
    pub handle: String,
    pub version: u64,
    pub primary: String,
    pub lease_expiry: u64,
    pub replicas: Vec<ReplicaAddr>,
}

#[derive(Clone, Debug)]
pub struct FileInfo {
    pub chunk_handles: Vec<String>,
    pub size: u64,
    pub created_at: u64,
    pub modified_at: u64,
}

/// Copy-on-write duplication the RPC layer must run before a write can
/// proceed: every live replica of `old_handle` installs a private copy under
/// `new_handle`, then `finish_cow` commits the repointing and grants a lease.
#[derive(Clone, Debug)]
pub struct CowPlan {
    pub path: String,
    pub index: u64,
    pub old_handle: String,
    pub new_handle: String,
    pub version: u64,
    pub replicas: Vec<ReplicaAddr>,
}

#[derive(Clone, Debug)]
pub enum WriteLookup {
    Ready(LeaseInfo),
    NeedsCow(CowPlan),
}

#[derive(Clone, Debug)]
struct RepairTask {
    attempts: u32,
    not_before: u64,
}

#[derive(Clone, Debug)]
struct DeferredDelete {
    execute_at: u64,
    server_id: String,
    handle: String,
}

#[derive(Debug)]
pub struct MasterState {
    pub namespace: HashMap<String, FileMeta>,
    pub chunks: HashMap<String, ChunkMeta>,
    pub servers: HashMap<String, ServerRecord>,
    repair_queue: HashMap<String, RepairTask>,
    dead_lettered: HashSet<String>,
    pending_deletes: HashMap<String, BTreeSet<String>>,
    pending_clones: HashMap<String, Vec<CloneDirective>>,
    deferred_deletes: Vec<DeferredDelete>,
    wal: WalWriter,
    last_applied_seq: u64,
    pub common: CommonConfig,
    pub config: MasterConfig,
}

impl MasterState {
    /// Load the most recent snapshot (if any), replay the WAL tail, and open
    /// the log for appending. The startup half of the WAL contract.
    pub fn recover(config: MasterConfig, common: CommonConfig) -> Result<Self, FsError> {
        let wal_dir = PathBuf::from(&config.wal_dir);
        let wal_path = wal_dir.join(&config.wal_file);

        let (namespace, chunks, snapshot_seq) = match MetadataSnapshot::load(&wal_dir)? {
            Some(snapshot) => {
                info!(
                    "[Recovery] Loaded metadata snapshot at sequence {}",
                    snapshot.last_applied_seq
                );
                (snapshot.namespace, snapshot.chunks, snapshot.last_applied_seq)
            }
            None => (HashMap::new(), HashMap::new(), 0),
        };

        let entries = master_wal::replay(&wal_path, snapshot_seq)?;
        let last_seq = entries
            .last()
            .map(|e| e.sequence_number)
            .unwrap_or(snapshot_seq);
        let wal = WalWriter::open(&wal_path, last_seq)?;

        let mut state = Self {
            namespace,
            chunks,
            servers: HashMap::new(),
            repair_queue: HashMap::new(),
            dead_lettered: HashSet::new(),
            pending_deletes: HashMap::new(),
            pending_clones: HashMap::new(),
            deferred_deletes: Vec::new(),
            wal,
            last_applied_seq: last_seq,
            common,
            config,
        };

        let replayed = entries.len();
        for entry in entries {
            state.apply(&entry.op, entry.timestamp);
        }
        if replayed > 0 {
            info!("[Recovery] Replayed {} WAL entries", replayed);
        }
        Ok(state)
    }

    /// Append to the WAL, then apply in memory. A WAL append failure is fatal
    /// for the master: it refuses further mutations and exits with the log
    /// state intact for the operator.
    fn commit(&mut self, op: MetaOp, now: u64) -> u64 {
        match self.wal.append(op.clone(), now) {
            Ok(seq) => {
                self.apply(&op, now);
                self.last_applied_seq = seq;
                seq
            }
            Err(e) => {
                error!("[WAL] Append failed, refusing further mutations: {}", e);
                std::process::exit(1);
            }
        }
    }

    /// Pure state transition shared by live commits and WAL replay.
    fn apply(&mut self, op: &MetaOp, ts: u64) {
        match op {
            MetaOp::CreateFile { path } => {
                self.namespace.insert(
                    path.clone(),
                    FileMeta {
                        chunks: Vec::new(),
                        created_at: ts,
                        modified_at: ts,
                        deleted: false,
                        deleted_at: None,
                    },
                );
            }
            MetaOp::AllocateChunk {
                path,
                index: _,
                handle,
                replicas,
            } => {
                if let Some(file) = self.namespace.get_mut(path) {
                    file.chunks.push(handle.clone());
                    file.modified_at = ts;
                }
                self.chunks.insert(
                    handle.clone(),
                    ChunkMeta::new(replicas.iter().cloned().collect()),
                );
            }
            MetaOp::GrantLease {
                handle,
                primary,
                expiry,
                version,
            } => {
                if let Some(chunk) = self.chunks.get_mut(handle) {
                    chunk.version = *version;
                    chunk.version_confirmed = false;
                    chunk.lease = Some(Lease {
                        primary: primary.clone(),
                        expiry: *expiry,
                    });
                }
            }
            MetaOp::RenewLease { handle, expiry } => {
                if let Some(chunk) = self.chunks.get_mut(handle) {
                    if let Some(lease) = chunk.lease.as_mut() {
                        lease.expiry = *expiry;
                    }
                }
            }
            MetaOp::RenameFile { old_path, new_path } => {
                if let Some(mut file) = self.namespace.remove(old_path) {
                    file.modified_at = ts;
                    self.namespace.insert(new_path.clone(), file);
                }
            }
            MetaOp::DeleteFile { path, deleted_at } => {
                if let Some(file) = self.namespace.get_mut(path) {
                    file.deleted = true;
                    file.deleted_at = Some(*deleted_at);
                }
            }
            MetaOp::SnapshotFile { src_path, dst_path } => {
                if let Some(src) = self.namespace.get(src_path).cloned() {
                    for handle in &src.chunks {
                        if let Some(chunk) = self.chunks.get_mut(handle) {
                            chunk.refcount += 1;
                            chunk.cow = true;
                            chunk.lease = None;
                        }
                    }
                    self.namespace.insert(
                        dst_path.clone(),
                        FileMeta {
                            chunks: src.chunks.clone(),
                            created_at: ts,
                            modified_at: ts,
                            deleted: false,
                            deleted_at: None,
                        },
                    );
                }
            }
            MetaOp::CowClone {
                path,
                index,
                old_handle,
                new_handle,
            } => {
                let cloned = self.chunks.get(old_handle).map(|old| ChunkMeta {
                    version: old.version,
                    size: old.size,
                    replicas: old.replicas.clone(),
                    lease: None,
                    refcount: 1,
                    cow: false,
                    unreferenced_since: None,
                    version_confirmed: false,
                });
                if let Some(new_meta) = cloned {
                    for id in &new_meta.replicas {
                        if let Some(server) = self.servers.get_mut(id) {
                            server.chunks.insert(new_handle.clone());
                        }
                    }
                    self.chunks.insert(new_handle.clone(), new_meta);
                }
                if let Some(old) = self.chunks.get_mut(old_handle) {
                    old.refcount = old.refcount.saturating_sub(1);
                    if old.refcount <= 1 {
                        old.cow = false;
                    }
                }
                if let Some(file) = self.namespace.get_mut(path) {
                    if let Some(slot) = file.chunks.get_mut(*index as usize) {
                        *slot = new_handle.clone();
                    }
                    file.modified_at = ts;
                }
            }
            MetaOp::PurgeFile { path, at: _ } => {
                if let Some(file) = self.namespace.remove(path) {
                    for handle in &file.chunks {
                        if let Some(chunk) = self.chunks.get_mut(handle) {
                            chunk.refcount = chunk.refcount.saturating_sub(1);
                            if chunk.refcount == 0 {
                                chunk.unreferenced_since = Some(ts);
                            }
                        }
                    }
                }
            }
            MetaOp::ReleaseChunk { handle } => {
                self.chunks.remove(handle);
            }
        }
    }

    // ---- namespace operations ----

    fn validate_path(path: &str) -> Result<(), FsError> {
        let ok = path.starts_with('/')
            && path.len() > 1
            && !path.ends_with('/')
            && path.split('/').skip(1).all(|seg| !seg.is_empty());
        if ok {
            Ok(())
        } else {
            Err(FsError::BadPath(path.to_string()))
        }
    }

    fn live_file(&self, path: &str) -> Result<&FileMeta, FsError> {
        match self.namespace.get(path) {
            Some(file) if !file.deleted => Ok(file),
            _ => Err(FsError::FileNotFound(path.to_string())),
        }
    }

    pub fn create_file(&mut self, path: &str, now: u64) -> Result<(), FsError> {
        Self::validate_path(path)?;
        if self.namespace.contains_key(path) {
            return Err(FsError::FileExists(path.to_string()));
        }
        self.commit(
            MetaOp::CreateFile {
                path: path.to_string(),
            },
            now,
        );
        info!("[Namespace] Created file '{}'", path);
        Ok(())
    }

    pub fn get_file_info(&self, path: &str) -> Result<FileInfo, FsError> {
        let file = self.live_file(path)?;
        Ok(FileInfo {
            chunk_handles: file.chunks.clone(),
            size: self.file_size(file),
            created_at: file.created_at,
            modified_at: file.modified_at,
        })
    }

    /// File size per the chunk model: all chunks but the last are full.
    fn file_size(&self, file: &FileMeta) -> u64 {
        match file.chunks.last() {
            None => 0,
            Some(last) => {
                let tail = self.chunks.get(last).map(|c| c.size).unwrap_or(0);
                (file.chunks.len() as u64 - 1) * self.common.chunk_size + tail
            }
        }
    }

    pub fn rename_file(&mut self, old: &str, new: &str, now: u64) -> Result<(), FsError> {
        Self::validate_path(new)?;
        self.live_file(old)?;
        if self.namespace.contains_key(new) {
            return Err(FsError::FileExists(new.to_string()));
        }
        self.commit(
            MetaOp::RenameFile {
                old_path: old.to_string(),
                new_path: new.to_string(),
            },
            now,
        );
        Ok(())
    }

    /// Tombstone only; chunks are reclaimed by garbage collection after the
    /// retention window.
    pub fn delete_file(&mut self, path: &str, now: u64) -> Result<(), FsError> {
        self.live_file(path)?;
        self.commit(
            MetaOp::DeleteFile {
                path: path.to_string(),
                deleted_at: now,
            },
            now,
        );
        info!("[Namespace] Tombstoned file '{}'", path);
        Ok(())
    }

    pub fn list_directory(&self, prefix: &str) -> Vec<String> {
        let mut paths: Vec<String> = self
            .namespace
            .iter()
            .filter(|(_, f)| !f.deleted)
            .map(|(p, _)| p.clone())
            .filter(|p| {
                prefix == "/" || p == prefix || p.starts_with(&format!("{}/", prefix))
            })
            .collect();
        paths.sort();
        paths
    }

    pub fn snapshot_file(&mut self, src: &str, dst: &str, now: u64) -> Result<(), FsError> {
        Self::validate_path(dst)?;
        self.live_file(src)?;
        if self.namespace.contains_key(dst) {
            return Err(FsError::FileExists(dst.to_string()));
        }
        self.commit(
            MetaOp::SnapshotFile {
                src_path: src.to_string(),
                dst_path: dst.to_string(),
            },
            now,
        );
        info!("[Namespace] Snapshotted '{}' into '{}'", src, dst);
        Ok(())
    }

    // ---- chunk operations ----

    /// Allocate the next chunk of a file, or hand back the existing chunk if
    /// the index is already populated (idempotent retries).
    pub fn allocate_chunk(
        &mut self,
        path: &str,
        index: u64,
        now: u64,
    ) -> Result<WriteLookup, FsError> {
        let file = self.live_file(path)?;
        let len = file.chunks.len() as u64;
        if index < len {
            return self.lookup_for_write(path, index, now);
        }
        if index > len {
            return Err(FsError::ChunkIndexOutOfRange {
                path: path.to_string(),
                index,
            });
        }

        let replicas = self.place_replicas(&BTreeSet::new())?;
        let handle = new_chunk_handle();
        self.commit(
            MetaOp::AllocateChunk {
                path: path.to_string(),
                index,
                handle: handle.clone(),
                replicas: replicas.clone(),
            },
            now,
        );
        for id in &replicas {
            if let Some(server) = self.servers.get_mut(id) {
                server.chunks.insert(handle.clone());
            }
        }
        if replicas.len() < self.common.replication_factor {
            self.enqueue_repair(&handle, now);
        }
        debug!(
            "[ChunkMap] Allocated chunk {} for '{}'[{}] on {:?}",
            handle, path, index, replicas
        );
        let lease = self.grant_lease(&handle, now)?;
        Ok(WriteLookup::Ready(lease))
    }

    /// Write-path lookup by (path, index) so copy-on-write can repoint the
    /// right file entry. Returns a COW plan instead of a lease when the chunk
    /// is shared with a snapshot.
    pub fn lookup_for_write(
        &mut self,
        path: &str,
        index: u64,
        now: u64,
    ) -> Result<WriteLookup, FsError> {
        let file = self.live_file(path)?;
        let handle = file
            .chunks
            .get(index as usize)
            .cloned()
            .ok_or(FsError::ChunkIndexOutOfRange {
                path: path.to_string(),
                index,
            })?;

        let chunk = self
            .chunks
            .get(&handle)
            .ok_or_else(|| FsError::ChunkNotFound(handle.clone()))?;
        if chunk.refcount > 1 {
            let replicas = self.alive_replicas(&handle)?;
            let version = chunk.version;
            return Ok(WriteLookup::NeedsCow(CowPlan {
                path: path.to_string(),
                index,
                old_handle: handle.clone(),
                new_handle: new_chunk_handle(),
                version,
                replicas,
            }));
        }
        let lease = self.grant_lease(&handle, now)?;
        Ok(WriteLookup::Ready(lease))
    }

    /// Commit a completed copy-on-write duplication and lease the new chunk.
    /// The plan is re-validated under the lock: a concurrent writer may have
    /// duplicated the chunk first, in which case this plan's installs are
    /// orphans (heartbeat reconciliation deletes them) and the caller is
    /// redirected to the current chunk.
    pub fn finish_cow(&mut self, plan: &CowPlan, now: u64) -> Result<WriteLookup, FsError> {
        let still_shared = self
            .namespace
            .get(&plan.path)
            .and_then(|f| f.chunks.get(plan.index as usize))
            .map(|h| h == &plan.old_handle)
            .unwrap_or(false)
            && self
                .chunks
                .get(&plan.old_handle)
                .map(|c| c.refcount > 1)
                .unwrap_or(false);
        if !still_shared {
            info!(
                "[ChunkMap] COW of {} for '{}'[{}] superseded; redoing lookup",
                plan.old_handle, plan.path, plan.index
            );
            return self.lookup_for_write(&plan.path, plan.index, now);
        }

        self.commit(
            MetaOp::CowClone {
                path: plan.path.clone(),
                index: plan.index,
                old_handle: plan.old_handle.clone(),
                new_handle: plan.new_handle.clone(),
            },
            now,
        );
        info!(
            "[ChunkMap] COW duplicated {} -> {} for '{}'[{}]",
            plan.old_handle, plan.new_handle, plan.path, plan.index
        );
        let lease = self.grant_lease(&plan.new_handle, now)?;
        Ok(WriteLookup::Ready(lease))
    }

    /// Read-path lookup by handle; stale replicas never appear in the replica
    /// set, so the reply only needs to drop dead servers.
    pub fn chunk_locations(&mut self, handle: &str, now: u64) -> Result<LeaseInfo, FsError> {
        let chunk = self
            .chunks
            .get(handle)
            .ok_or_else(|| FsError::ChunkNotFound(handle.to_string()))?;
        let version = chunk.version;
        let lease = chunk.lease.clone();
        let replicas = self.alive_replicas(handle)?;
        if replicas.len() < self.common.replication_factor {
            self.enqueue_repair(handle, now);
        }
        let (primary, lease_expiry) = match lease {
            Some(l) if l.expiry > now => (l.primary, l.expiry),
            _ => (String::new(), 0),
        };
        Ok(LeaseInfo {
            handle: handle.to_string(),
            version,
            primary,
            lease_expiry,
            replicas,
        })
    }

    fn alive_replicas(&self, handle: &str) -> Result<Vec<ReplicaAddr>, FsError> {
        let chunk = self
            .chunks
            .get(handle)
            .ok_or_else(|| FsError::ChunkNotFound(handle.to_string()))?;
        let replicas: Vec<ReplicaAddr> = chunk
            .replicas
            .iter()
            .filter_map(|id| self.servers.get(id))
            .filter(|s| s.alive)
            .map(|s| ReplicaAddr {
                server_id: s.id.clone(),
                address: s.address.clone(),
            })
            .collect();
        if replicas.is_empty() {
            return Err(FsError::NoLiveReplicas(handle.to_string()));
        }
        Ok(replicas)
    }

    /// Grant or renew the lease on a chunk. A fresh grant bumps the version;
    /// renewal only extends the expiry.
    fn grant_lease(&mut self, handle: &str, now: u64) -> Result<LeaseInfo, FsError> {
        let replicas = self.alive_replicas(handle)?;
        let (current_lease, current_version) = {
            let chunk = self
                .chunks
                .get(handle)
                .ok_or_else(|| FsError::ChunkNotFound(handle.to_string()))?;
            (chunk.lease.clone(), chunk.version)
        };
        let expiry = now + self.common.lease_duration;

        let holder_alive = |id: &str| replicas.iter().any(|r| r.server_id == id);

        match current_lease {
            Some(ref lease) if lease.expiry > now && holder_alive(&lease.primary) => {
                let primary = lease.primary.clone();
                self.commit(
                    MetaOp::RenewLease {
                        handle: handle.to_string(),
                        expiry,
                    },
                    now,
                );
                Ok(LeaseInfo {
                    handle: handle.to_string(),
                    version: current_version,
                    primary,
                    lease_expiry: expiry,
                    replicas,
                })
            }
            previous => {
                // Prefer the incumbent holder when it is still a live replica.
                let primary = previous
                    .map(|l| l.primary)
                    .filter(|p| holder_alive(p))
                    .unwrap_or_else(|| replicas[0].server_id.clone());
                let version = current_version + 1;
                self.commit(
                    MetaOp::GrantLease {
                        handle: handle.to_string(),
                        primary: primary.clone(),
                        expiry,
                        version,
                    },
                    now,
                );
                debug!(
                    "[Lease] Granted lease on {} to {} at version {}",
                    handle, primary, version
                );
                Ok(LeaseInfo {
                    handle: handle.to_string(),
                    version,
                    primary,
                    lease_expiry: expiry,
                    replicas,
                })
            }
        }
    }

    // ---- placement ----

    /// Choose up to `replication_factor` alive servers: distinct racks when
    /// enough racks exist, least-loaded first, ties broken by server id.
    fn place_replicas(&self, exclude: &BTreeSet<String>) -> Result<Vec<String>, FsError> {
        let mut candidates: Vec<&ServerRecord> = self
            .servers
            .values()
            .filter(|s| s.alive && !exclude.contains(&s.id))
            .collect();
        if candidates.is_empty() {
            return Err(FsError::NoServersAvailable);
        }
        candidates.sort_by(|a, b| {
            (a.chunks.len(), &a.id).cmp(&(b.chunks.len(), &b.id))
        });

        let n = self.common.replication_factor;
        let racks: HashSet<&str> = candidates.iter().map(|s| s.rack_id.as_str()).collect();
        let spread_racks = racks.len() >= n;

        let mut chosen = Vec::new();
        let mut used_racks: HashSet<&str> = HashSet::new();
        for server in &candidates {
            if chosen.len() == n {
                break;
            }
            if spread_racks && used_racks.contains(server.rack_id.as_str()) {
                continue;
            }
            used_racks.insert(server.rack_id.as_str());
            chosen.push(server.id.clone());
        }
        Ok(chosen)
    }

    // ---- chunkserver-facing ----

    /// Idempotent (re-)registration; reconciles the reported holdings the
    /// same way heartbeats do.
    pub fn register_server(
        &mut self,
        id: &str,
        address: &str,
        rack_id: &str,
        reports: &[ReplicaReport],
        now: u64,
    ) -> Vec<String> {
        self.servers.insert(
            id.to_string(),
            ServerRecord {
                id: id.to_string(),
                address: address.to_string(),
                rack_id: rack_id.to_string(),
                alive: true,
                last_heartbeat: now,
                chunks: HashSet::new(),
            },
        );
        info!(
            "[Register] Chunkserver '{}' at {} (rack {}), {} chunks reported",
            id,
            address,
            rack_id,
            reports.len()
        );
        self.reconcile_reports(id, reports, now)
    }

    pub fn heartbeat(
        &mut self,
        id: &str,
        reports: &[ReplicaReport],
        now: u64,
    ) -> Result<(Vec<String>, Vec<CloneDirective>), FsError> {
        let server = self
            .servers
            .get_mut(id)
            .ok_or_else(|| FsError::UnknownServer(id.to_string()))?;
        server.last_heartbeat = now;
        server.alive = true;

        let deletes = self.reconcile_reports(id, reports, now);
        let clones = self.pending_clones.remove(id).unwrap_or_default();
        Ok((deletes, clones))
    }

    /// Compare a server's reported chunks with master state: adopt healthy
    /// current-version replicas, evict stale ones, and tell the server to
    /// drop anything the master no longer expects.
    fn reconcile_reports(
        &mut self,
        server_id: &str,
        reports: &[ReplicaReport],
        now: u64,
    ) -> Vec<String> {
        let mut deletes: BTreeSet<String> = self
            .pending_deletes
            .remove(server_id)
            .unwrap_or_default();
        let mut reported: HashSet<String> = HashSet::new();
        let mut stale: Vec<String> = Vec::new();
        let mut adopted: Vec<String> = Vec::new();

        for report in reports {
            reported.insert(report.handle.clone());
            match self.chunks.get_mut(&report.handle) {
                None => {
                    // Not in the chunk map at all: surplus replica, delete.
                    deletes.insert(report.handle.clone());
                }
                Some(chunk) => {
                    if report.version < chunk.version {
                        if chunk.version_confirmed {
                            warn!(
                                "[Heartbeat] Stale replica of {} on '{}' (reported v{}, current v{})",
                                report.handle, server_id, report.version, chunk.version
                            );
                            chunk.replicas.remove(server_id);
                            stale.push(report.handle.clone());
                        } else if chunk.replicas.contains(server_id) {
                            // No mutation has landed under the current lease
                            // yet, so this replica simply has not heard the
                            // new version; it stays in the set.
                            if report.size > chunk.size {
                                chunk.size = report.size;
                            }
                            adopted.push(report.handle.clone());
                        } else {
                            // A lagging copy on a server outside the replica
                            // set is an old relic; retire it.
                            stale.push(report.handle.clone());
                        }
                    } else {
                        if report.version > chunk.version {
                            // Only possible if a lease outlived a master
                            // crash; the replica is authoritative.
                            warn!(
                                "[Heartbeat] Replica of {} on '{}' ahead of master (v{} > v{})",
                                report.handle, server_id, report.version, chunk.version
                            );
                            chunk.version = report.version;
                        }
                        chunk.version_confirmed = true;
                        chunk.replicas.insert(server_id.to_string());
                        if report.size > chunk.size {
                            chunk.size = report.size;
                        }
                        adopted.push(report.handle.clone());
                    }
                }
            }
        }

        // Stale replicas: kept on disk for the retention window, then deleted.
        let retention = self.common.garbage_retention_secs();
        for handle in &stale {
            self.deferred_deletes.push(DeferredDelete {
                execute_at: now + retention,
                server_id: server_id.to_string(),
                handle: handle.clone(),
            });
            self.enqueue_repair(handle, now);
        }

        // A previously-held chunk missing from the report was lost or went
        // corrupt on that server. Freshly allocated chunks have no bytes on
        // disk yet, so empty chunks are exempt.
        let previously: Vec<String> = self
            .servers
            .get(server_id)
            .map(|s| s.chunks.iter().cloned().collect())
            .unwrap_or_default();
        let mut lost: Vec<String> = Vec::new();
        for handle in previously {
            if !reported.contains(&handle) {
                if let Some(chunk) = self.chunks.get_mut(&handle) {
                    if chunk.size > 0 {
                        warn!(
                            "[Heartbeat] Replica of {} vanished from '{}'",
                            handle, server_id
                        );
                        chunk.replicas.remove(server_id);
                        lost.push(handle);
                    }
                }
            }
        }
        for handle in &lost {
            self.enqueue_repair(handle, now);
        }

        if let Some(server) = self.servers.get_mut(server_id) {
            server.chunks.retain(|h| reported.contains(h));
            for handle in adopted {
                // Arrival of a current-version replica is how a repair
                // completes.
                server.chunks.insert(handle.clone());
                if let Some(chunk) = self.chunks.get(&handle) {
                    if chunk.replicas.len() >= self.common.replication_factor {
                        self.repair_queue.remove(&handle);
                    }
                }
            }
            for handle in &stale {
                server.chunks.remove(handle);
            }
        }

        deletes.into_iter().collect()
    }

    /// Best-effort client fault report: drop the replica now, repair, and
    /// physically delete the bad copy after the retention window.
    pub fn report_bad_replica(&mut self, handle: &str, server_id: &str, now: u64) {
        if let Some(chunk) = self.chunks.get_mut(handle) {
            if chunk.replicas.remove(server_id) {
                warn!(
                    "[Client] Bad replica of {} reported on '{}'",
                    handle, server_id
                );
                if let Some(server) = self.servers.get_mut(server_id) {
                    server.chunks.remove(handle);
                }
                self.deferred_deletes.push(DeferredDelete {
                    execute_at: now + self.common.garbage_retention_secs(),
                    server_id: server_id.to_string(),
                    handle: handle.to_string(),
                });
                self.enqueue_repair(handle, now);
            }
        }
    }

    // ---- background scans ----

    /// Mark chunkservers dead after `heartbeat_timeout` of silence and queue
    /// their chunks for re-replication.
    pub fn detect_failures(&mut self, now: u64) {
        let timeout = self.common.heartbeat_timeout;
        let failed: Vec<String> = self
            .servers
            .values()
            .filter(|s| s.alive && now.saturating_sub(s.last_heartbeat) > timeout)
            .map(|s| s.id.clone())
            .collect();

        for id in failed {
            warn!("[FailureDetector] Chunkserver '{}' timed out", id);
            let held: Vec<String> = {
                let server = self.servers.get_mut(&id).unwrap();
                server.alive = false;
                server.chunks.drain().collect()
            };
            for handle in held {
                if let Some(chunk) = self.chunks.get_mut(&handle) {
                    chunk.replicas.remove(&id);
                    if chunk.refcount > 0 {
                        self.enqueue_repair(&handle, now);
                    }
                }
            }
        }
    }

    fn enqueue_repair(&mut self, handle: &str, now: u64) {
        if self.dead_lettered.contains(handle) || self.repair_queue.contains_key(handle) {
            return;
        }
        let chunk = match self.chunks.get(handle) {
            Some(c) => c,
            None => return,
        };
        if chunk.replicas.len() >= self.common.replication_factor {
            return;
        }
        debug!("[Repair] Enqueued chunk {} for re-replication", handle);
        self.repair_queue.insert(
            handle.to_string(),
            RepairTask {
                attempts: 0,
                not_before: now,
            },
        );
    }

    /// Plan due repairs: choose a live current-version source and a fresh
    /// destination, queue a clone command for the destination's next
    /// heartbeat, and arm exponential backoff for the next attempt.
    pub fn plan_repairs(&mut self, now: u64) {
        let due: Vec<String> = self
            .repair_queue
            .iter()
            .filter(|(_, task)| task.not_before <= now)
            .map(|(handle, _)| handle.clone())
            .collect();

        for handle in due {
            let chunk = match self.chunks.get(&handle) {
                Some(c) => c.clone(),
                None => {
                    self.repair_queue.remove(&handle);
                    continue;
                }
            };
            if chunk.replicas.len() >= self.common.replication_factor {
                self.repair_queue.remove(&handle);
                continue;
            }

            let attempts = self.repair_queue[&handle].attempts;
            if attempts >= self.config.rereplication_max_attempts {
                error!(
                    "[Repair] Giving up on chunk {} after {} attempts; operator attention required",
                    handle, attempts
                );
                self.repair_queue.remove(&handle);
                self.dead_lettered.insert(handle.clone());
                continue;
            }

            let plan = self.plan_one_repair(&handle, &chunk);
            let backoff = (self.config.rereplication_backoff_secs << attempts)
                .min(self.config.rereplication_backoff_cap_secs);
            let task = self.repair_queue.get_mut(&handle).unwrap();
            task.attempts += 1;
            task.not_before = now + backoff;

            match plan {
                Some((dest, directive)) => {
                    info!(
                        "[Repair] Cloning chunk {} from {} onto '{}'",
                        handle, directive.source_address, dest
                    );
                    self.pending_clones.entry(dest).or_default().push(directive);
                }
                None => {
                    warn!(
                        "[Repair] No usable source or destination for chunk {} (attempt {})",
                        handle,
                        attempts + 1
                    );
                }
            }
        }
    }

    fn plan_one_repair(
        &self,
        handle: &str,
        chunk: &ChunkMeta,
    ) -> Option<(String, CloneDirective)> {
        let source = chunk
            .replicas
            .iter()
            .filter_map(|id| self.servers.get(id))
            .find(|s| s.alive)?;
        let dest = self
            .place_replicas(&chunk.replicas)
            .ok()?
            .into_iter()
            .next()?;
        Some((
            dest,
            CloneDirective {
                handle: handle.to_string(),
                source_handle: handle.to_string(),
                source_address: source.address.clone(),
                version: chunk.version,
            },
        ))
    }

    /// Garbage collection: purge tombstoned files past retention, release
    /// unreferenced chunks past retention, and flush due stale-replica
    /// deletions into heartbeat replies.
    pub fn collect_garbage(&mut self, now: u64) {
        let retention = self.common.garbage_retention_secs();

        let expired_files: Vec<String> = self
            .namespace
            .iter()
            .filter(|(_, f)| {
                f.deleted
                    && f.deleted_at
                        .map(|t| now.saturating_sub(t) >= retention)
                        .unwrap_or(false)
            })
            .map(|(p, _)| p.clone())
            .collect();
        for path in expired_files {
            info!("[GC] Purging tombstoned file '{}'", path);
            self.commit(
                MetaOp::PurgeFile {
                    path,
                    at: now,
                },
                now,
            );
        }

        let expired_chunks: Vec<String> = self
            .chunks
            .iter()
            .filter(|(_, c)| {
                c.refcount == 0
                    && c.unreferenced_since
                        .map(|t| now.saturating_sub(t) >= retention)
                        .unwrap_or(false)
            })
            .map(|(h, _)| h.clone())
            .collect();
        for handle in expired_chunks {
            let holders: Vec<String> = self
                .chunks
                .get(&handle)
                .map(|c| c.replicas.iter().cloned().collect())
                .unwrap_or_default();
            info!("[GC] Releasing chunk {} held by {:?}", handle, holders);
            self.commit(MetaOp::ReleaseChunk { handle: handle.clone() }, now);
            for server_id in holders {
                if let Some(server) = self.servers.get_mut(&server_id) {
                    server.chunks.remove(&handle);
                }
                self.pending_deletes
                    .entry(server_id)
                    .or_default()
                    .insert(handle.clone());
            }
            self.repair_queue.remove(&handle);
        }

        let mut due = Vec::new();
        self.deferred_deletes.retain(|d| {
            if d.execute_at <= now {
                due.push((d.server_id.clone(), d.handle.clone()));
                false
            } else {
                true
            }
        });
        for (server_id, handle) in due {
            self.pending_deletes
                .entry(server_id)
                .or_default()
                .insert(handle);
        }
    }

    /// Atomic metadata snapshot (write-temp-then-rename) followed by WAL
    /// truncation.
    pub fn snapshot_to_disk(&mut self) -> Result<(), FsError> {
        let snapshot = MetadataSnapshot {
            last_applied_seq: self.last_applied_seq,
            namespace: self.namespace.clone(),
            chunks: self.chunks.clone(),
        };
        let wal_dir = PathBuf::from(&self.config.wal_dir);
        snapshot.save(&wal_dir)?;
        self.wal.truncate()?;
        info!(
            "[Snapshot] Metadata snapshot written at sequence {}",
            self.last_applied_seq
        );
        Ok(())
    }
}
