// Implements the gRPC server behavior defined in the Master trait
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{info, warn};

use crate::master_service::MasterService;
use crate::master_state::{CowPlan, LeaseInfo, ReplicaReport, WriteLookup};
use crate::proto::chunk::chunk_client::ChunkClient;
use crate::proto::chunk::CloneChunkRequest;
use crate::proto::master::master_server::Master;
use crate::proto::master::{
    AllocateChunkRequest, ChunkLease, CloneCommand, CreateFileRequest, CreateFileResponse,
    DeleteFileRequest, DeleteFileResponse, GetChunkLocationsRequest, GetFileInfoRequest,
    GetFileInfoResponse, HeartbeatRequest, HeartbeatResponse, ListDirectoryRequest,
    ListDirectoryResponse, RegisterRequest, RegisterResponse, RenameFileRequest,
    RenameFileResponse, ReplicaLocation, ReportBadReplicaRequest, ReportBadReplicaResponse,
    SnapshotFileRequest, SnapshotFileResponse,
};
use crate::util::now_secs;

fn lease_reply(info: LeaseInfo) -> ChunkLease {
    ChunkLease {
        handle: info.handle,
        replicas: info
            .replicas
            .into_iter()
            .map(|r| ReplicaLocation {
                server_id: r.server_id,
                address: r.address,
            })
            .collect(),
        primary_id: info.primary,
        lease_expiry: info.lease_expiry,
        version: info.version,
    }
}

/// Runs the copy-on-write duplication a write lookup may demand: every live
/// replica of the shared chunk installs a private copy, then the repointing
/// is committed and a lease granted on the new chunk. Must be called without
/// the state lock held.
async fn run_cow(service: &MasterService, plan: &CowPlan) -> Result<WriteLookup, Status> {
    info!(
        "[COW] Duplicating chunk {} as {} across {} replicas",
        plan.old_handle,
        plan.new_handle,
        plan.replicas.len()
    );
    for replica in &plan.replicas {
        let mut client = ChunkClient::connect(format!("http://{}", replica.address))
            .await
            .map_err(|e| {
                Status::unavailable(format!(
                    "failed to connect to replica '{}': {}",
                    replica.address, e
                ))
            })?;
        client
            .clone_chunk(Request::new(CloneChunkRequest {
                handle: plan.new_handle.clone(),
                source_handle: plan.old_handle.clone(),
                source_address: replica.address.clone(),
                version: plan.version,
            }))
            .await
            .map_err(|e| {
                Status::aborted(format!(
                    "replica '{}' failed to duplicate chunk: {}",
                    replica.server_id, e
                ))
            })?;
    }
    let mut state = service.state.lock().await;
    state.finish_cow(plan, now_secs()).map_err(Status::from)
}

async fn resolve_write_lookup(
    service: &MasterService,
    mut lookup: WriteLookup,
) -> Result<LeaseInfo, Status> {
    loop {
        match lookup {
            WriteLookup::Ready(info) => return Ok(info),
            WriteLookup::NeedsCow(plan) => {
                lookup = run_cow(service, &plan).await?;
            }
        }
    }
}

#[tonic::async_trait]
impl Master for Arc<MasterService> {
    async fn register_chunk_server(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<RegisterResponse>, Status> {
        let req = request.into_inner();
        let reports: Vec<ReplicaReport> = req
            .chunks
            .iter()
            .map(|c| ReplicaReport {
                handle: c.handle.clone(),
                version: c.version,
                size: c.size,
            })
            .collect();

        let mut state = self.state.lock().await;
        let chunks_to_delete =
            state.register_server(&req.server_id, &req.address, &req.rack_id, &reports, now_secs());

        Ok(Response::new(RegisterResponse {
            message: format!("chunkserver '{}' registered successfully", req.server_id),
            chunks_to_delete,
        }))
    }

    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        let req = request.into_inner();
        let reports: Vec<ReplicaReport> = req
            .chunks
            .iter()
            .map(|c| ReplicaReport {
                handle: c.handle.clone(),
                version: c.version,
                size: c.size,
            })
            .collect();

        let mut state = self.state.lock().await;
        let (chunks_to_delete, clones) = state
            .heartbeat(&req.server_id, &reports, now_secs())
            .map_err(Status::from)?;

        Ok(Response::new(HeartbeatResponse {
            message: format!("heartbeat from '{}' processed", req.server_id),
            chunks_to_delete,
            chunks_to_clone: clones
                .into_iter()
                .map(|c| CloneCommand {
                    handle: c.handle,
                    source_handle: c.source_handle,
                    source_address: c.source_address,
                    version: c.version,
                })
                .collect(),
        }))
    }

    async fn create_file(
        &self,
        request: Request<CreateFileRequest>,
    ) -> Result<Response<CreateFileResponse>, Status> {
        let path = request.into_inner().path;
        let mut state = self.state.lock().await;
        state.create_file(&path, now_secs()).map_err(Status::from)?;
        Ok(Response::new(CreateFileResponse {
            message: format!("file '{}' created", path),
        }))
    }

    async fn get_file_info(
        &self,
        request: Request<GetFileInfoRequest>,
    ) -> Result<Response<GetFileInfoResponse>, Status> {
        let path = request.into_inner().path;
        let state = self.state.lock().await;
        let info = state.get_file_info(&path).map_err(Status::from)?;
        Ok(Response::new(GetFileInfoResponse {
            chunk_handles: info.chunk_handles,
            size: info.size,
            created_at: info.created_at,
            modified_at: info.modified_at,
        }))
    }

    async fn rename_file(
        &self,
        request: Request<RenameFileRequest>,
    ) -> Result<Response<RenameFileResponse>, Status> {
        let req = request.into_inner();
        let mut state = self.state.lock().await;
        state
            .rename_file(&req.old_path, &req.new_path, now_secs())
            .map_err(Status::from)?;
        Ok(Response::new(RenameFileResponse {
            message: format!("renamed '{}' to '{}'", req.old_path, req.new_path),
        }))
    }

    async fn delete_file(
        &self,
        request: Request<DeleteFileRequest>,
    ) -> Result<Response<DeleteFileResponse>, Status> {
        let path = request.into_inner().path;
        let mut state = self.state.lock().await;
        state.delete_file(&path, now_secs()).map_err(Status::from)?;
        Ok(Response::new(DeleteFileResponse {
            message: format!("file '{}' scheduled for deletion", path),
        }))
    }

    async fn list_directory(
        &self,
        request: Request<ListDirectoryRequest>,
    ) -> Result<Response<ListDirectoryResponse>, Status> {
        let prefix = request.into_inner().prefix;
        let state = self.state.lock().await;
        Ok(Response::new(ListDirectoryResponse {
            paths: state.list_directory(&prefix),
        }))
    }

    async fn snapshot_file(
        &self,
        request: Request<SnapshotFileRequest>,
    ) -> Result<Response<SnapshotFileResponse>, Status> {
        let req = request.into_inner();
        let mut state = self.state.lock().await;
        state
            .snapshot_file(&req.src_path, &req.dst_path, now_secs())
            .map_err(Status::from)?;
        Ok(Response::new(SnapshotFileResponse {
            message: format!("snapshotted '{}' into '{}'", req.src_path, req.dst_path),
        }))
    }

    async fn allocate_chunk(
        &self,
        request: Request<AllocateChunkRequest>,
    ) -> Result<Response<ChunkLease>, Status> {
        let req = request.into_inner();
        let lookup = {
            let mut state = self.state.lock().await;
            state
                .allocate_chunk(&req.path, req.chunk_index, now_secs())
                .map_err(Status::from)?
        };
        let info = resolve_write_lookup(self, lookup).await?;
        Ok(Response::new(lease_reply(info)))
    }

    async fn get_chunk_locations(
        &self,
        request: Request<GetChunkLocationsRequest>,
    ) -> Result<Response<ChunkLease>, Status> {
        let req = request.into_inner();
        if req.for_write {
            // Write lookups go by (path, index) so copy-on-write duplication
            // knows which file entry to repoint.
            let lookup = {
                let mut state = self.state.lock().await;
                state
                    .lookup_for_write(&req.path, req.chunk_index, now_secs())
                    .map_err(Status::from)?
            };
            let info = resolve_write_lookup(self, lookup).await?;
            return Ok(Response::new(lease_reply(info)));
        }

        let mut state = self.state.lock().await;
        let info = state
            .chunk_locations(&req.handle, now_secs())
            .map_err(Status::from)?;
        Ok(Response::new(lease_reply(info)))
    }

    async fn report_bad_replica(
        &self,
        request: Request<ReportBadReplicaRequest>,
    ) -> Result<Response<ReportBadReplicaResponse>, Status> {
        let req = request.into_inner();
        warn!(
            "[Client] Bad replica report: chunk {} on '{}'",
            req.handle, req.server_id
        );
        let mut state = self.state.lock().await;
        state.report_bad_replica(&req.handle, &req.server_id, now_secs());
        Ok(Response::new(ReportBadReplicaResponse {
            message: "replica flagged".to_string(),
        }))
    }
}
