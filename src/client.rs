// Client-side coordination: metadata lookups against the master, pipelined
// data pushes, primary commits, and read-side replica failover. The client
// is stateless between operations apart from its location caches.
use std::collections::HashMap;
use std::ops::Range;
use tokio::time::Duration;
use tonic::{Code, Request, Status};
use tracing::{debug, warn};

use crate::config::{ClientConfig, CommonConfig};
use crate::proto::chunk::chunk_client::ChunkClient;
use crate::proto::chunk::{
    write_chunk_request::Frame, AppendRecordRequest, CommitWriteRequest, DataFrame,
    ReadChunkRequest, WriteChunkRequest, WriteHeader,
};
use crate::proto::master::master_client::MasterClient;
use crate::proto::master::{
    AllocateChunkRequest, ChunkLease, CreateFileRequest, DeleteFileRequest,
    GetChunkLocationsRequest, GetFileInfoRequest, GetFileInfoResponse, ListDirectoryRequest,
    RenameFileRequest, ReportBadReplicaRequest, SnapshotFileRequest,
};
use crate::util::{connect_to_master, now_secs};

const PUSH_FRAME_SIZE: usize = 1024 * 1024;
// Do not reuse a lease about to expire mid-operation.
const LEASE_SLACK_SECS: u64 = 5;

pub struct FsClient {
    master: MasterClient<tonic::transport::Channel>,
    common: CommonConfig,
    config: ClientConfig,
    write_cache: HashMap<(String, u64), ChunkLease>,
    read_cache: HashMap<String, (ChunkLease, u64)>,
}

/// (chunk index, offset within the chunk, slice of the caller's buffer) for
/// each chunk a byte range touches.
fn chunk_spans(offset: u64, len: usize, chunk_size: u64) -> Vec<(u64, u64, Range<usize>)> {
    let mut spans = Vec::new();
    let mut cursor = 0usize;
    while cursor < len {
        let abs = offset + cursor as u64;
        let index = abs / chunk_size;
        let in_off = abs % chunk_size;
        let span = ((chunk_size - in_off) as usize).min(len - cursor);
        spans.push((index, in_off, cursor..cursor + span));
        cursor += span;
    }
    spans
}

/// Fingerprint for a data push: a random nonce hashed with the payload, so
/// retries of the same bytes occupy distinct buffer slots.
fn make_fingerprint(data: &[u8]) -> String {
    let nonce: u128 = rand::random();
    let mut buf = Vec::with_capacity(16 + data.len());
    buf.extend_from_slice(&nonce.to_le_bytes());
    buf.extend_from_slice(data);
    format!("{:x}", md5::compute(&buf))
}

fn retryable(status: &Status) -> bool {
    matches!(
        status.code(),
        Code::Unavailable | Code::DeadlineExceeded | Code::Aborted | Code::FailedPrecondition
    )
}

async fn with_deadline<T, F>(secs: u64, fut: F) -> Result<T, Status>
where
    F: std::future::Future<Output = Result<tonic::Response<T>, Status>>,
{
    match tokio::time::timeout(Duration::from_secs(secs), fut).await {
        Ok(Ok(response)) => Ok(response.into_inner()),
        Ok(Err(status)) => Err(status),
        Err(_) => Err(Status::deadline_exceeded("rpc deadline exceeded")),
    }
}

impl FsClient {
    pub async fn connect(
        common: CommonConfig,
        config: ClientConfig,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let master = connect_to_master(&common.master_addrs).await?;
        Ok(Self {
            master,
            common,
            config,
            write_cache: HashMap::new(),
            read_cache: HashMap::new(),
        })
    }

    // ---- namespace operations ----

    pub async fn create(&mut self, path: &str) -> Result<(), Status> {
        with_deadline(
            self.config.rpc_deadline_secs,
            self.master.create_file(Request::new(CreateFileRequest {
                path: path.to_string(),
            })),
        )
        .await?;
        Ok(())
    }

    pub async fn delete(&mut self, path: &str) -> Result<(), Status> {
        with_deadline(
            self.config.rpc_deadline_secs,
            self.master.delete_file(Request::new(DeleteFileRequest {
                path: path.to_string(),
            })),
        )
        .await?;
        Ok(())
    }

    pub async fn rename(&mut self, old: &str, new: &str) -> Result<(), Status> {
        with_deadline(
            self.config.rpc_deadline_secs,
            self.master.rename_file(Request::new(RenameFileRequest {
                old_path: old.to_string(),
                new_path: new.to_string(),
            })),
        )
        .await?;
        Ok(())
    }

    pub async fn snapshot(&mut self, src: &str, dst: &str) -> Result<(), Status> {
        with_deadline(
            self.config.rpc_deadline_secs,
            self.master.snapshot_file(Request::new(SnapshotFileRequest {
                src_path: src.to_string(),
                dst_path: dst.to_string(),
            })),
        )
        .await?;
        // Leases were revoked; cached write leases for the source are gone.
        self.write_cache.retain(|(p, _), _| p != src);
        Ok(())
    }

    pub async fn list(&mut self, prefix: &str) -> Result<Vec<String>, Status> {
        let reply = with_deadline(
            self.config.rpc_deadline_secs,
            self.master.list_directory(Request::new(ListDirectoryRequest {
                prefix: prefix.to_string(),
            })),
        )
        .await?;
        Ok(reply.paths)
    }

    /// Metadata lookups are idempotent and retried transparently.
    pub async fn file_info(&mut self, path: &str) -> Result<GetFileInfoResponse, Status> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = with_deadline(
                self.config.rpc_deadline_secs,
                self.master.get_file_info(Request::new(GetFileInfoRequest {
                    path: path.to_string(),
                })),
            )
            .await;
            match result {
                Ok(info) => return Ok(info),
                Err(e)
                    if attempt <= self.config.retry_budget
                        && matches!(e.code(), Code::Unavailable | Code::DeadlineExceeded) =>
                {
                    self.backoff(attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ---- write path ----

    /// Random-offset write: split at chunk boundaries, then push + commit
    /// each span with the retry budget.
    pub async fn write(&mut self, path: &str, offset: u64, data: &[u8]) -> Result<(), Status> {
        for (index, in_off, range) in chunk_spans(offset, data.len(), self.common.chunk_size) {
            self.write_span(path, index, in_off, &data[range]).await?;
        }
        Ok(())
    }

    async fn write_span(
        &mut self,
        path: &str,
        index: u64,
        in_off: u64,
        data: &[u8],
    ) -> Result<(), Status> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_write_span(path, index, in_off, data).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt <= self.config.retry_budget && retryable(&e) => {
                    warn!(
                        "[Write] Attempt {} for '{}'[{}] failed: {}; retrying",
                        attempt, path, index, e
                    );
                    self.write_cache.remove(&(path.to_string(), index));
                    self.backoff(attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_write_span(
        &mut self,
        path: &str,
        index: u64,
        in_off: u64,
        data: &[u8],
    ) -> Result<(), Status> {
        let lease = self.write_lease(path, index).await?;
        let fingerprint = make_fingerprint(data);
        self.push_data(&lease, &fingerprint, data).await?;
        self.commit_to_primary(&lease, &fingerprint, in_off, data.len() as u64)
            .await
    }

    /// Push the bytes down the replica pipeline: header first, then bounded
    /// data frames, to the first replica, which forwards along the chain.
    async fn push_data(
        &self,
        lease: &ChunkLease,
        fingerprint: &str,
        data: &[u8],
    ) -> Result<(), Status> {
        let entry = lease
            .replicas
            .first()
            .ok_or_else(|| Status::unavailable("no live replicas to push to"))?;
        let chain: Vec<String> = lease.replicas[1..]
            .iter()
            .map(|r| r.address.clone())
            .collect();

        let mut frames = Vec::with_capacity(1 + data.len() / PUSH_FRAME_SIZE);
        frames.push(WriteChunkRequest {
            frame: Some(Frame::Header(WriteHeader {
                handle: lease.handle.clone(),
                fingerprint: fingerprint.to_string(),
                replica_chain: chain,
            })),
        });
        for piece in data.chunks(PUSH_FRAME_SIZE) {
            frames.push(WriteChunkRequest {
                frame: Some(Frame::Chunk(DataFrame {
                    data: piece.to_vec(),
                })),
            });
        }

        let mut client = ChunkClient::connect(format!("http://{}", entry.address))
            .await
            .map_err(|e| {
                Status::unavailable(format!("failed to connect to '{}': {}", entry.address, e))
            })?;
        with_deadline(
            self.config.rpc_deadline_secs,
            client.write_chunk(Request::new(tokio_stream::iter(frames))),
        )
        .await?;
        debug!(
            "[Push] {} bytes staged on {} replicas of chunk {}",
            data.len(),
            lease.replicas.len(),
            lease.handle
        );
        Ok(())
    }

    async fn commit_to_primary(
        &self,
        lease: &ChunkLease,
        fingerprint: &str,
        offset: u64,
        length: u64,
    ) -> Result<(), Status> {
        let primary = lease
            .replicas
            .iter()
            .find(|r| r.server_id == lease.primary_id)
            .ok_or_else(|| Status::unavailable("lease primary is not a live replica"))?;
        let secondaries: Vec<String> = lease
            .replicas
            .iter()
            .filter(|r| r.server_id != lease.primary_id)
            .map(|r| r.address.clone())
            .collect();

        let mut client = ChunkClient::connect(format!("http://{}", primary.address))
            .await
            .map_err(|e| {
                Status::unavailable(format!("failed to connect to primary: {}", e))
            })?;
        with_deadline(
            self.config.rpc_deadline_secs,
            client.commit_write(Request::new(CommitWriteRequest {
                handle: lease.handle.clone(),
                fingerprint: fingerprint.to_string(),
                offset,
                length,
                serial: 0,
                version: lease.version,
                secondaries,
                pad: false,
            })),
        )
        .await?;
        Ok(())
    }

    // ---- record append ----

    /// At-least-once atomic record append; returns the absolute file offset
    /// the record landed at.
    pub async fn append(&mut self, path: &str, record: &[u8]) -> Result<u64, Status> {
        let chunk_size = self.common.chunk_size;
        let limit = chunk_size / 4;
        if record.len() as u64 > limit {
            return Err(Status::invalid_argument(format!(
                "record of {} bytes exceeds append limit of {} bytes",
                record.len(),
                limit
            )));
        }

        let mut target: Option<u64> = None;
        let mut failures = 0;
        loop {
            let index = match target {
                Some(i) => i,
                None => {
                    let info = self.file_info(path).await?;
                    (info.chunk_handles.len() as u64).saturating_sub(1)
                }
            };

            match self.try_append(path, index, record).await {
                Ok(AppendOutcome::Done(offset)) => {
                    return Ok(index * chunk_size + offset);
                }
                Ok(AppendOutcome::ChunkFull) => {
                    // The primary padded the chunk; the record goes into the
                    // next one, which the master allocates on demand.
                    target = Some(index + 1);
                }
                Err(e) if failures < self.config.retry_budget && retryable(&e) => {
                    failures += 1;
                    warn!(
                        "[Append] Attempt {} on '{}' failed: {}; retrying",
                        failures, path, e
                    );
                    self.write_cache.remove(&(path.to_string(), index));
                    target = None;
                    self.backoff(failures).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_append(
        &mut self,
        path: &str,
        index: u64,
        record: &[u8],
    ) -> Result<AppendOutcome, Status> {
        let lease = self.write_lease(path, index).await?;
        let fingerprint = make_fingerprint(record);
        self.push_data(&lease, &fingerprint, record).await?;

        let primary = lease
            .replicas
            .iter()
            .find(|r| r.server_id == lease.primary_id)
            .ok_or_else(|| Status::unavailable("lease primary is not a live replica"))?;
        let secondaries: Vec<String> = lease
            .replicas
            .iter()
            .filter(|r| r.server_id != lease.primary_id)
            .map(|r| r.address.clone())
            .collect();

        let mut client = ChunkClient::connect(format!("http://{}", primary.address))
            .await
            .map_err(|e| {
                Status::unavailable(format!("failed to connect to primary: {}", e))
            })?;
        let reply = with_deadline(
            self.config.rpc_deadline_secs,
            client.append_record(Request::new(AppendRecordRequest {
                handle: lease.handle.clone(),
                fingerprint,
                length: record.len() as u64,
                version: lease.version,
                secondaries,
            })),
        )
        .await?;

        if reply.chunk_full {
            Ok(AppendOutcome::ChunkFull)
        } else {
            Ok(AppendOutcome::Done(reply.offset))
        }
    }

    // ---- read path ----

    /// Ranged read. Any live replica serves; a checksum failure rotates to
    /// the next replica and reports the bad copy to the master best-effort.
    pub async fn read(&mut self, path: &str, offset: u64, length: u64) -> Result<Vec<u8>, Status> {
        let info = self.file_info(path).await?;
        let end = (offset + length).min(info.size);
        if offset >= end {
            return Ok(Vec::new());
        }

        let mut out = Vec::with_capacity((end - offset) as usize);
        for (index, in_off, range) in
            chunk_spans(offset, (end - offset) as usize, self.common.chunk_size)
        {
            let handle = info
                .chunk_handles
                .get(index as usize)
                .ok_or_else(|| Status::internal("file size disagrees with chunk list"))?
                .clone();
            let want = (range.end - range.start) as u64;
            let bytes = self.read_span(&handle, in_off, want).await?;
            // A replica lagging the master's size report reads short; the
            // missing suffix is unwritten and reads as zeros.
            let short = (want as usize).saturating_sub(bytes.len());
            out.extend_from_slice(&bytes);
            out.extend(std::iter::repeat(0u8).take(short));
        }
        Ok(out)
    }

    async fn read_span(
        &mut self,
        handle: &str,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, Status> {
        let lease = self.read_locations(handle).await?;
        let mut last_err: Option<Status> = None;

        for replica in &lease.replicas {
            match read_from_replica(&replica.address, handle, offset, length, self.config.rpc_deadline_secs).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    warn!(
                        "[Read] Replica '{}' failed for chunk {}: {}",
                        replica.server_id, handle, e
                    );
                    if e.code() == Code::DataLoss {
                        let _ = self
                            .master
                            .report_bad_replica(Request::new(ReportBadReplicaRequest {
                                handle: handle.to_string(),
                                server_id: replica.server_id.clone(),
                            }))
                            .await;
                    }
                    last_err = Some(e);
                }
            }
        }
        self.read_cache.remove(handle);
        Err(last_err.unwrap_or_else(|| Status::unavailable("no replicas answered")))
    }

    // ---- lookups and caching ----

    /// Lease for writing `path[index]`, allocating the chunk (and any gap
    /// chunks before it) on demand. Cached until shortly before expiry.
    async fn write_lease(&mut self, path: &str, index: u64) -> Result<ChunkLease, Status> {
        let key = (path.to_string(), index);
        let now = now_secs();
        if let Some(lease) = self.write_cache.get(&key) {
            if lease.lease_expiry > now + LEASE_SLACK_SECS && !lease.primary_id.is_empty() {
                return Ok(lease.clone());
            }
        }

        let lease = match self.allocate(path, index).await {
            Ok(lease) => lease,
            Err(e) if e.code() == Code::InvalidArgument => {
                // Writing past the last chunk: allocate intermediates first.
                let info = self.file_info(path).await?;
                let mut next = info.chunk_handles.len() as u64;
                if next > index {
                    return Err(e);
                }
                let mut lease = None;
                while next <= index {
                    lease = Some(self.allocate(path, next).await?);
                    next += 1;
                }
                lease.expect("allocation loop ran at least once")
            }
            Err(e) => return Err(e),
        };
        self.write_cache.insert(key, lease.clone());
        Ok(lease)
    }

    async fn allocate(&mut self, path: &str, index: u64) -> Result<ChunkLease, Status> {
        with_deadline(
            self.config.rpc_deadline_secs,
            self.master.allocate_chunk(Request::new(AllocateChunkRequest {
                path: path.to_string(),
                chunk_index: index,
            })),
        )
        .await
    }

    async fn read_locations(&mut self, handle: &str) -> Result<ChunkLease, Status> {
        let now = now_secs();
        if let Some((lease, valid_until)) = self.read_cache.get(handle) {
            if *valid_until > now {
                return Ok(lease.clone());
            }
        }
        let lease = with_deadline(
            self.config.rpc_deadline_secs,
            self.master
                .get_chunk_locations(Request::new(GetChunkLocationsRequest {
                    handle: handle.to_string(),
                    path: String::new(),
                    chunk_index: 0,
                    for_write: false,
                })),
        )
        .await?;
        let valid_until = if lease.lease_expiry > 0 {
            lease.lease_expiry
        } else {
            now + self.common.heartbeat_interval
        };
        self.read_cache
            .insert(handle.to_string(), (lease.clone(), valid_until));
        Ok(lease)
    }

    async fn backoff(&self, attempt: u32) {
        let millis = self.config.retry_backoff_ms * attempt as u64;
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }
}

enum AppendOutcome {
    Done(u64),
    ChunkFull,
}

async fn read_from_replica(
    address: &str,
    handle: &str,
    offset: u64,
    length: u64,
    deadline_secs: u64,
) -> Result<Vec<u8>, Status> {
    let mut client = ChunkClient::connect(format!("http://{}", address))
        .await
        .map_err(|e| Status::unavailable(format!("failed to connect to '{}': {}", address, e)))?;
    let reply = with_deadline(
        deadline_secs,
        client.read_chunk(Request::new(ReadChunkRequest {
            handle: handle.to_string(),
            offset,
            length,
        })),
    )
    .await?;
    Ok(reply.data)
}
