// Write-ahead log and metadata snapshots for the master. Every metadata
// mutation is appended (and fsync'd) here before it is applied in memory and
// before the caller sees a reply.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::FsError;
use crate::master_state::{ChunkMeta, FileMeta};

pub const SNAPSHOT_FILE: &str = "metadata_snapshot.json";

/// A single metadata mutation. The discriminator serializes as `op_kind` and
/// the variant fields as `payload`, one JSON object per WAL line.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op_kind", content = "payload", rename_all = "snake_case")]
pub enum MetaOp {
    CreateFile {
        path: String,
    },
    /// A new chunk enters the chunk map and is appended to the file's
    /// handle list.
    AllocateChunk {
        path: String,
        index: u64,
        handle: String,
        replicas: Vec<String>,
    },
    /// Lease assignment with its version bump. `version` is the chunk's new
    /// version under this lease.
    GrantLease {
        handle: String,
        primary: String,
        expiry: u64,
        version: u64,
    },
    /// Lease renewal: extends expiry without touching the version.
    RenewLease {
        handle: String,
        expiry: u64,
    },
    RenameFile {
        old_path: String,
        new_path: String,
    },
    /// Tombstone; the namespace entry survives until garbage collection.
    DeleteFile {
        path: String,
        deleted_at: u64,
    },
    /// Copy-on-write namespace clone: dst shares src's chunks, each with an
    /// incremented reference count.
    SnapshotFile {
        src_path: String,
        dst_path: String,
    },
    /// First mutation after a file snapshot: `path[index]` is repointed from
    /// the shared chunk to a fresh private copy.
    CowClone {
        path: String,
        index: u64,
        old_handle: String,
        new_handle: String,
    },
    /// Tombstoned file leaves the namespace; its chunks drop one reference.
    PurgeFile {
        path: String,
        at: u64,
    },
    /// Unreferenced chunk leaves the chunk map.
    ReleaseChunk {
        handle: String,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEntry {
    pub sequence_number: u64,
    pub timestamp: u64,
    #[serde(flatten)]
    pub op: MetaOp,
}

/// Append-only, fsync'd WAL writer. Lives inside the master state so all
/// appends are serialized by the master mutex.
#[derive(Debug)]
pub struct WalWriter {
    path: PathBuf,
    file: File,
    next_seq: u64,
}

impl WalWriter {
    /// Open (or create) the WAL at `path`, positioned after `last_seq`.
    pub fn open(path: &Path, last_seq: u64) -> Result<Self, FsError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            next_seq: last_seq + 1,
        })
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Append one entry and fsync before returning.
    pub fn append(&mut self, op: MetaOp, timestamp: u64) -> Result<u64, FsError> {
        let entry = LogEntry {
            sequence_number: self.next_seq,
            timestamp,
            op,
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.sync_data()?;
        self.next_seq += 1;
        Ok(entry.sequence_number)
    }

    /// Drop all entries. Called under the master mutex right after a
    /// snapshot has been durably renamed into place, so nothing between the
    /// snapshot and the truncation can be lost.
    pub fn truncate(&mut self) -> Result<(), FsError> {
        self.file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.file.sync_data()?;
        self.file = OpenOptions::new().append(true).open(&self.path)?;
        Ok(())
    }
}

/// Read every WAL entry with sequence > `after_seq`, verifying that
/// sequence numbers are contiguous. A malformed line aborts recovery with
/// the sequence number the operator needs to inspect.
pub fn replay(path: &Path, after_seq: u64) -> Result<Vec<LogEntry>, FsError> {
    let mut entries = Vec::new();
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("[Recovery] No WAL at {:?}, starting fresh", path);
            return Ok(entries);
        }
        Err(e) => return Err(e.into()),
    };

    let mut expected = None;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: LogEntry = serde_json::from_str(&line)
            .map_err(|_| FsError::WalCorrupt(expected.unwrap_or(after_seq + 1)))?;
        if let Some(want) = expected {
            if entry.sequence_number != want {
                return Err(FsError::WalCorrupt(want));
            }
        }
        expected = Some(entry.sequence_number + 1);
        if entry.sequence_number > after_seq {
            entries.push(entry);
        }
    }
    Ok(entries)
}

/// Full serialization of the master's durable state. Chunkserver liveness is
/// deliberately absent: it is soft state re-learned from registrations and
/// heartbeats.
#[derive(Debug, Serialize, Deserialize)]
pub struct MetadataSnapshot {
    pub last_applied_seq: u64,
    pub namespace: HashMap<String, FileMeta>,
    pub chunks: HashMap<String, ChunkMeta>,
}

impl MetadataSnapshot {
    /// Write atomically: temp file in the same directory, fsync, rename.
    pub fn save(&self, wal_dir: &Path) -> Result<(), FsError> {
        std::fs::create_dir_all(wal_dir)?;
        let tmp = wal_dir.join(format!("{}.tmp", SNAPSHOT_FILE));
        let target = wal_dir.join(SNAPSHOT_FILE);
        let mut file = File::create(&tmp)?;
        file.write_all(serde_json::to_string(self)?.as_bytes())?;
        file.sync_all()?;
        std::fs::rename(&tmp, &target)?;
        Ok(())
    }

    pub fn load(wal_dir: &Path) -> Result<Option<Self>, FsError> {
        let target = wal_dir.join(SNAPSHOT_FILE);
        match std::fs::read_to_string(&target) {
            Ok(content) => {
                let snapshot = serde_json::from_str(&content)?;
                Ok(Some(snapshot))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => {
                warn!("[Recovery] Failed to read snapshot {:?}: {}", target, e);
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_replay_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let wal_path = dir.path().join("wal.log");

        let mut wal = WalWriter::open(&wal_path, 0).unwrap();
        wal.append(
            MetaOp::CreateFile {
                path: "/a".to_string(),
            },
            100,
        )
        .unwrap();
        wal.append(
            MetaOp::AllocateChunk {
                path: "/a".to_string(),
                index: 0,
                handle: "h1".to_string(),
                replicas: vec!["cs-1".to_string(), "cs-2".to_string()],
            },
            101,
        )
        .unwrap();

        let entries = replay(&wal_path, 0).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].sequence_number, 1);
        assert_eq!(
            entries[0].op,
            MetaOp::CreateFile {
                path: "/a".to_string()
            }
        );
        assert_eq!(entries[1].sequence_number, 2);

        // Replay after a snapshot boundary skips applied entries.
        let tail = replay(&wal_path, 1).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].sequence_number, 2);
    }

    #[test]
    fn wal_lines_carry_op_kind_and_payload() {
        let dir = tempfile::tempdir().unwrap();
        let wal_path = dir.path().join("wal.log");
        let mut wal = WalWriter::open(&wal_path, 41).unwrap();
        wal.append(
            MetaOp::DeleteFile {
                path: "/gone".to_string(),
                deleted_at: 7,
            },
            7,
        )
        .unwrap();

        let raw = std::fs::read_to_string(&wal_path).unwrap();
        let value: serde_json::Value = serde_json::from_str(raw.trim()).unwrap();
        assert_eq!(value["sequence_number"], 42);
        assert_eq!(value["op_kind"], "delete_file");
        assert_eq!(value["payload"]["path"], "/gone");
    }

    #[test]
    fn corrupt_line_reports_offending_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let wal_path = dir.path().join("wal.log");
        let mut wal = WalWriter::open(&wal_path, 0).unwrap();
        wal.append(
            MetaOp::CreateFile {
                path: "/a".to_string(),
            },
            1,
        )
        .unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(&wal_path)
            .unwrap()
            .write_all(b"{ not json\n")
            .unwrap();

        match replay(&wal_path, 0) {
            Err(FsError::WalCorrupt(seq)) => assert_eq!(seq, 2),
            other => panic!("expected WalCorrupt, got {:?}", other),
        }
    }

    #[test]
    fn truncate_empties_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let wal_path = dir.path().join("wal.log");
        let mut wal = WalWriter::open(&wal_path, 0).unwrap();
        wal.append(
            MetaOp::CreateFile {
                path: "/a".to_string(),
            },
            1,
        )
        .unwrap();
        wal.truncate().unwrap();
        assert!(replay(&wal_path, 0).unwrap().is_empty());

        // The writer stays usable and keeps its sequence counter.
        let seq = wal
            .append(
                MetaOp::CreateFile {
                    path: "/b".to_string(),
                },
                2,
            )
            .unwrap();
        assert_eq!(seq, 2);
        assert_eq!(replay(&wal_path, 0).unwrap().len(), 1);
    }
}
