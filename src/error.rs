use tonic::Status;

/// Errors produced by the metadata and storage layers. RPC handlers convert
/// these into `tonic::Status` at the service boundary.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("file already exists: {0}")]
    FileExists(String),

    #[error("invalid path: {0}")]
    BadPath(String),

    #[error("chunk not found: {0}")]
    ChunkNotFound(String),

    #[error("chunk index {index} out of range for '{path}'")]
    ChunkIndexOutOfRange { path: String, index: u64 },

    #[error("no live replicas for chunk {0}")]
    NoLiveReplicas(String),

    #[error("no chunkservers available for placement")]
    NoServersAvailable,

    #[error("unknown chunkserver: {0}")]
    UnknownServer(String),

    #[error("stale version {requested}, stored version is {stored}")]
    StaleVersion { requested: u64, stored: u64 },

    #[error("checksum mismatch in chunk {handle} at block {block}")]
    ChecksumMismatch { handle: String, block: usize },

    #[error("read past end of chunk {handle} at offset {offset}")]
    ReadOutOfRange { handle: String, offset: u64 },

    #[error("record of {got} bytes exceeds append limit of {limit} bytes")]
    RecordTooLarge { got: u64, limit: u64 },

    #[error("no buffered data for fingerprint {0}")]
    UnknownFingerprint(String),

    #[error("write-ahead log corrupted at sequence {0}")]
    WalCorrupt(u64),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<FsError> for Status {
    fn from(err: FsError) -> Status {
        match &err {
            FsError::FileNotFound(_) | FsError::ChunkNotFound(_) | FsError::UnknownServer(_) => {
                Status::not_found(err.to_string())
            }
            FsError::FileExists(_) => Status::already_exists(err.to_string()),
            FsError::BadPath(_)
            | FsError::ChunkIndexOutOfRange { .. }
            | FsError::RecordTooLarge { .. } => Status::invalid_argument(err.to_string()),
            FsError::StaleVersion { .. } => Status::failed_precondition(err.to_string()),
            FsError::ReadOutOfRange { .. } => Status::out_of_range(err.to_string()),
            FsError::NoLiveReplicas(_) | FsError::NoServersAvailable => {
                Status::unavailable(err.to_string())
            }
            FsError::ChecksumMismatch { .. } => Status::data_loss(err.to_string()),
            FsError::UnknownFingerprint(_) => Status::failed_precondition(err.to_string()),
            FsError::WalCorrupt(_) | FsError::Io(_) | FsError::Json(_) => {
                Status::internal(err.to_string())
            }
        }
    }
}
