// Implements the gRPC server behavior defined in the Chunk trait
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use crate::chunkserver_service::ChunkService;
use crate::error::FsError;
use crate::proto::chunk::chunk_client::ChunkClient;
use crate::proto::chunk::chunk_server::Chunk;
use crate::proto::chunk::{
    write_chunk_request::Frame, AppendRecordRequest, AppendRecordResponse, CloneChunkRequest,
    CloneChunkResponse, CommitWriteRequest, CommitWriteResponse, DataFrame, DeleteChunkRequest,
    DeleteChunkResponse, ReadChunkRequest, ReadChunkResponse, WriteChunkRequest,
    WriteChunkResponse, WriteHeader,
};

const FORWARD_FRAME_SIZE: usize = 1024 * 1024;

#[tonic::async_trait]
impl Chunk for ChunkService {
    /// Pipeline entry point: buffer the pushed bytes under their fingerprint,
    /// then forward the stream to the next replica in the chain. The ack only
    /// goes out once every downstream replica has buffered the data.
    async fn write_chunk(
        &self,
        request: Request<Streaming<WriteChunkRequest>>,
    ) -> Result<Response<WriteChunkResponse>, Status> {
        let mut stream = request.into_inner();
        let mut header: Option<WriteHeader> = None;
        let mut data: Vec<u8> = Vec::new();

        while let Some(req) = stream.message().await? {
            match req.frame {
                Some(Frame::Header(h)) => {
                    header = Some(h);
                }
                Some(Frame::Chunk(frame)) => {
                    if header.is_none() {
                        return Err(Status::invalid_argument("data frame before header"));
                    }
                    data.extend_from_slice(&frame.data);
                }
                None => return Err(Status::invalid_argument("empty request")),
            }
        }
        let header = header.ok_or_else(|| Status::invalid_argument("missing write header"))?;

        debug!(
            "[WriteChunk] Buffered {} bytes for chunk {} (fingerprint {})",
            data.len(),
            header.handle,
            header.fingerprint
        );
        self.put_buffer(&header.fingerprint, data.clone()).await;

        if let Some((next, rest)) = header.replica_chain.split_first() {
            forward_push(next, &header, rest, &data).await?;
        }

        Ok(Response::new(WriteChunkResponse {
            message: format!("buffered data for chunk '{}'", header.handle),
        }))
    }

    /// Apply buffered data at an offset. Clients address the primary and list
    /// the secondaries; the primary assigns a serial and re-issues the commit
    /// to each secondary in that order.
    async fn commit_write(
        &self,
        request: Request<CommitWriteRequest>,
    ) -> Result<Response<CommitWriteResponse>, Status> {
        let req = request.into_inner();
        let lock = self.chunk_lock(&req.handle).await;
        let _guard = lock.lock().await;

        let stored = self.stored_version(&req.handle).await;
        if req.version < stored {
            return Err(Status::from(FsError::StaleVersion {
                requested: req.version,
                stored,
            }));
        }

        let serial = if req.serial == 0 {
            self.next_serial(&req.handle).await
        } else {
            req.serial
        };

        if req.pad {
            self.store
                .zero_range(&req.handle, req.offset, req.length)
                .await
                .map_err(Status::from)?;
        } else {
            let data = self
                .take_buffer(&req.fingerprint)
                .await
                .ok_or_else(|| FsError::UnknownFingerprint(req.fingerprint.clone()))?;
            if data.len() as u64 != req.length {
                return Err(Status::invalid_argument(format!(
                    "buffered {} bytes but commit names {}",
                    data.len(),
                    req.length
                )));
            }
            self.store
                .write_at(&req.handle, req.offset, &data)
                .await
                .map_err(Status::from)?;
        }
        if req.version > stored {
            // A secondary learns the new lease's version from its first
            // mutation under that lease.
            self.set_version(&req.handle, req.version)
                .await
                .map_err(Status::from)?;
        }

        for addr in &req.secondaries {
            let forward = CommitWriteRequest {
                handle: req.handle.clone(),
                fingerprint: req.fingerprint.clone(),
                offset: req.offset,
                length: req.length,
                serial,
                version: req.version,
                secondaries: Vec::new(),
                pad: req.pad,
            };
            commit_on(addr, forward).await.map_err(|e| {
                Status::aborted(format!("secondary '{}' failed to commit: {}", addr, e))
            })?;
        }

        Ok(Response::new(CommitWriteResponse {
            message: format!("chunk '{}' committed at offset {}", req.handle, req.offset),
            serial,
        }))
    }

    /// Primary-only atomic record append. Chooses the offset under the chunk
    /// lock, applies everywhere in serial order, and converts partial failure
    /// into zero padding so a retry lands at a fresh offset on all replicas.
    async fn append_record(
        &self,
        request: Request<AppendRecordRequest>,
    ) -> Result<Response<AppendRecordResponse>, Status> {
        let req = request.into_inner();
        let chunk_size = self.common.chunk_size;
        let limit = chunk_size / 4;
        if req.length > limit {
            return Err(Status::from(FsError::RecordTooLarge {
                got: req.length,
                limit,
            }));
        }

        let lock = self.chunk_lock(&req.handle).await;
        let _guard = lock.lock().await;

        let stored = self.stored_version(&req.handle).await;
        if req.version < stored {
            return Err(Status::from(FsError::StaleVersion {
                requested: req.version,
                stored,
            }));
        }

        let size = self.store.size(&req.handle).await.map_err(Status::from)?;
        if size + req.length > chunk_size {
            // No room: pad every replica to capacity and have the client
            // retry against the next chunk.
            info!(
                "[Append] Chunk {} full at {} bytes; padding to {}",
                req.handle, size, chunk_size
            );
            let serial = self.next_serial(&req.handle).await;
            self.store
                .pad_to(&req.handle, chunk_size)
                .await
                .map_err(Status::from)?;
            if req.version > stored {
                self.set_version(&req.handle, req.version)
                    .await
                    .map_err(Status::from)?;
            }
            for addr in &req.secondaries {
                let pad = CommitWriteRequest {
                    handle: req.handle.clone(),
                    fingerprint: String::new(),
                    offset: size,
                    length: chunk_size - size,
                    serial,
                    version: req.version,
                    secondaries: Vec::new(),
                    pad: true,
                };
                commit_on(addr, pad).await.map_err(|e| {
                    Status::aborted(format!("secondary '{}' failed to pad: {}", addr, e))
                })?;
            }
            return Ok(Response::new(AppendRecordResponse {
                offset: 0,
                chunk_full: true,
            }));
        }

        let data = self
            .take_buffer(&req.fingerprint)
            .await
            .ok_or_else(|| FsError::UnknownFingerprint(req.fingerprint.clone()))?;
        if data.len() as u64 != req.length {
            return Err(Status::invalid_argument(format!(
                "buffered {} bytes but append names {}",
                data.len(),
                req.length
            )));
        }

        let offset = size;
        let serial = self.next_serial(&req.handle).await;
        self.store
            .write_at(&req.handle, offset, &data)
            .await
            .map_err(Status::from)?;
        if req.version > stored {
            self.set_version(&req.handle, req.version)
                .await
                .map_err(Status::from)?;
        }

        let mut applied: Vec<&String> = Vec::new();
        let mut failure: Option<(String, Status)> = None;
        for addr in &req.secondaries {
            let forward = CommitWriteRequest {
                handle: req.handle.clone(),
                fingerprint: req.fingerprint.clone(),
                offset,
                length: req.length,
                serial,
                version: req.version,
                secondaries: Vec::new(),
                pad: false,
            };
            match commit_on(addr, forward).await {
                Ok(()) => applied.push(addr),
                Err(e) => {
                    failure = Some((addr.clone(), e));
                    break;
                }
            }
        }

        if let Some((addr, e)) = failure {
            // Turn the half-applied record into padding on every replica
            // that took it; the retry appends again at a fresh offset.
            warn!(
                "[Append] Secondary '{}' failed ({}); padding region [{}, {}) of chunk {}",
                addr,
                e,
                offset,
                offset + req.length,
                req.handle
            );
            let pad_serial = self.next_serial(&req.handle).await;
            if let Err(pad_err) = self.store.zero_range(&req.handle, offset, req.length).await {
                warn!("[Append] Failed to pad primary replica: {}", pad_err);
            }
            for addr in applied {
                let pad = CommitWriteRequest {
                    handle: req.handle.clone(),
                    fingerprint: String::new(),
                    offset,
                    length: req.length,
                    serial: pad_serial,
                    version: req.version,
                    secondaries: Vec::new(),
                    pad: true,
                };
                if let Err(pad_err) = commit_on(addr, pad).await {
                    warn!(
                        "[Append] Failed to pad secondary '{}': {}",
                        addr, pad_err
                    );
                }
            }
            return Err(Status::aborted(format!(
                "record append failed on secondary '{}': {}",
                addr, e
            )));
        }

        Ok(Response::new(AppendRecordResponse {
            offset,
            chunk_full: false,
        }))
    }

    /// Read with checksum verification; a mismatch marks the replica corrupt
    /// so the next heartbeat omits it and the master re-replicates.
    async fn read_chunk(
        &self,
        request: Request<ReadChunkRequest>,
    ) -> Result<Response<ReadChunkResponse>, Status> {
        let req = request.into_inner();
        match self.store.read(&req.handle, req.offset, req.length).await {
            Ok(data) => {
                let chunk_length = self.store.size(&req.handle).await.map_err(Status::from)?;
                let version = self.stored_version(&req.handle).await;
                Ok(Response::new(ReadChunkResponse {
                    data,
                    chunk_length,
                    version,
                }))
            }
            Err(e @ FsError::ChecksumMismatch { .. }) => {
                self.mark_corrupt(&req.handle).await;
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn clone_chunk(
        &self,
        request: Request<CloneChunkRequest>,
    ) -> Result<Response<CloneChunkResponse>, Status> {
        let req = request.into_inner();
        self.clone_from_peer(&req.handle, &req.source_handle, &req.source_address, req.version)
            .await?;
        Ok(Response::new(CloneChunkResponse {
            message: format!(
                "chunk '{}' cloned from '{}'",
                req.handle, req.source_address
            ),
            version: req.version,
        }))
    }

    async fn delete_chunk(
        &self,
        request: Request<DeleteChunkRequest>,
    ) -> Result<Response<DeleteChunkResponse>, Status> {
        let handle = request.into_inner().handle;
        info!("[Delete] Removing chunk {}", handle);
        self.store.delete(&handle).await.map_err(Status::from)?;
        self.forget_chunk(&handle).await.map_err(Status::from)?;
        Ok(Response::new(DeleteChunkResponse {
            message: format!("chunk '{}' deleted", handle),
        }))
    }
}

/// Forward a push to the next replica in the chain, header first, then the
/// payload in bounded frames.
async fn forward_push(
    next: &str,
    header: &WriteHeader,
    rest: &[String],
    data: &[u8],
) -> Result<(), Status> {
    let mut frames = Vec::with_capacity(1 + data.len() / FORWARD_FRAME_SIZE);
    frames.push(WriteChunkRequest {
        frame: Some(Frame::Header(WriteHeader {
            handle: header.handle.clone(),
            fingerprint: header.fingerprint.clone(),
            replica_chain: rest.to_vec(),
        })),
    });
    for piece in data.chunks(FORWARD_FRAME_SIZE) {
        frames.push(WriteChunkRequest {
            frame: Some(Frame::Chunk(DataFrame {
                data: piece.to_vec(),
            })),
        });
    }

    let mut client = ChunkClient::connect(format!("http://{}", next))
        .await
        .map_err(|e| {
            Status::unavailable(format!("failed to connect to replica '{}': {}", next, e))
        })?;
    client
        .write_chunk(Request::new(tokio_stream::iter(frames)))
        .await
        .map_err(|e| Status::aborted(format!("downstream replica '{}' failed: {}", next, e)))?;
    Ok(())
}

async fn commit_on(addr: &str, request: CommitWriteRequest) -> Result<(), Status> {
    let mut client = ChunkClient::connect(format!("http://{}", addr))
        .await
        .map_err(|e| {
            Status::unavailable(format!("failed to connect to replica '{}': {}", addr, e))
        })?;
    client.commit_write(Request::new(request)).await?;
    Ok(())
}
