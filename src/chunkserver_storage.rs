// On-disk chunk storage: one raw file per chunk plus a checksum sidecar
// holding one CRC32 per 64 KiB block. Checksums are verified on every read.
// Callers serialize mutations per chunk; this layer assumes it.
use std::path::PathBuf;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::debug;

use crate::error::FsError;

pub const CHECKSUM_BLOCK_SIZE: u64 = 64 * 1024;

#[derive(Clone, Debug)]
pub struct ChunkStore {
    data_dir: PathBuf,
}

impl ChunkStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self, FsError> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;
        Ok(Self { data_dir })
    }

    fn chunk_path(&self, handle: &str) -> PathBuf {
        self.data_dir.join(format!("{}.chunk", handle))
    }

    fn sidecar_path(&self, handle: &str) -> PathBuf {
        self.data_dir.join(format!("{}.cksum", handle))
    }

    /// Bytes currently stored for the chunk; 0 when no file exists yet
    /// (a freshly allocated chunk has no on-disk presence until its first
    /// mutation).
    pub async fn size(&self, handle: &str) -> Result<u64, FsError> {
        match fs::metadata(self.chunk_path(handle)).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, handle: &str) -> bool {
        fs::metadata(self.chunk_path(handle)).await.is_ok()
    }

    /// Read `length` bytes at `offset`, verifying the checksum of every
    /// touched block. Short reads happen only at end-of-chunk.
    pub async fn read(&self, handle: &str, offset: u64, length: u64) -> Result<Vec<u8>, FsError> {
        let path = self.chunk_path(handle);
        let mut file = match OpenOptions::new().read(true).open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FsError::ChunkNotFound(handle.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let file_len = file.metadata().await?.len();
        if offset > file_len {
            return Err(FsError::ReadOutOfRange {
                handle: handle.to_string(),
                offset,
            });
        }
        let end = (offset + length).min(file_len);
        if end == offset {
            return Ok(Vec::new());
        }

        // Read whole blocks so every checksum can be recomputed.
        let first_block = offset / CHECKSUM_BLOCK_SIZE;
        let block_start = first_block * CHECKSUM_BLOCK_SIZE;
        let block_end = end
            .div_ceil(CHECKSUM_BLOCK_SIZE)
            .saturating_mul(CHECKSUM_BLOCK_SIZE)
            .min(file_len);
        let mut buf = vec![0u8; (block_end - block_start) as usize];
        file.seek(SeekFrom::Start(block_start)).await?;
        file.read_exact(&mut buf).await?;

        let sums = self.load_sidecar(handle).await?;
        for (i, block) in buf.chunks(CHECKSUM_BLOCK_SIZE as usize).enumerate() {
            let block_no = first_block as usize + i;
            let expected = sums.get(block_no).copied();
            if expected != Some(crc32fast::hash(block)) {
                return Err(FsError::ChecksumMismatch {
                    handle: handle.to_string(),
                    block: block_no,
                });
            }
        }

        let skip = (offset - block_start) as usize;
        let take = (end - offset) as usize;
        Ok(buf[skip..skip + take].to_vec())
    }

    /// Write `data` at `offset`, zero-filling any gap past the current end,
    /// and refresh the checksums of every touched block. Returns the new
    /// chunk size.
    pub async fn write_at(&self, handle: &str, offset: u64, data: &[u8]) -> Result<u64, FsError> {
        let path = self.chunk_path(handle);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .await?;
        let old_len = file.metadata().await?.len();
        if offset > old_len {
            // Gap bytes read back as zeros and get checksummed below.
            file.set_len(offset).await?;
        }
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.sync_data().await?;
        let new_len = old_len.max(offset + data.len() as u64);

        self.refresh_blocks(handle, old_len.min(offset)).await?;
        Ok(new_len)
    }

    /// Append at the current end of chunk; returns the offset the data
    /// landed at.
    pub async fn append(&self, handle: &str, data: &[u8]) -> Result<u64, FsError> {
        let offset = self.size(handle).await?;
        self.write_at(handle, offset, data).await?;
        Ok(offset)
    }

    /// Extend the chunk with zeros up to `target_len`. No-op if the chunk is
    /// already that large.
    pub async fn pad_to(&self, handle: &str, target_len: u64) -> Result<(), FsError> {
        let path = self.chunk_path(handle);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .await?;
        let old_len = file.metadata().await?.len();
        if target_len <= old_len {
            return Ok(());
        }
        file.set_len(target_len).await?;
        file.sync_data().await?;
        self.refresh_blocks(handle, old_len).await?;
        debug!(
            "[Storage] Padded chunk {} from {} to {} bytes",
            handle, old_len, target_len
        );
        Ok(())
    }

    /// Overwrite a range with zeros (failed record-append regions).
    pub async fn zero_range(&self, handle: &str, offset: u64, length: u64) -> Result<(), FsError> {
        self.write_at(handle, offset, &vec![0u8; length as usize])
            .await?;
        Ok(())
    }

    /// Install a full chunk image (clone target), replacing anything present.
    pub async fn install(&self, handle: &str, data: &[u8]) -> Result<(), FsError> {
        let path = self.chunk_path(handle);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;
        file.write_all(data).await?;
        file.sync_data().await?;
        self.refresh_blocks(handle, 0).await?;
        Ok(())
    }

    /// Remove chunk file and sidecar; idempotent.
    pub async fn delete(&self, handle: &str) -> Result<(), FsError> {
        for path in [self.chunk_path(handle), self.sidecar_path(handle)] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Handles of every chunk present in the data directory, with sizes.
    pub async fn list_chunks(&self) -> Result<Vec<(String, u64)>, FsError> {
        let mut out = Vec::new();
        let mut entries = fs::read_dir(&self.data_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(handle) = name.strip_suffix(".chunk") {
                let size = entry.metadata().await?.len();
                out.push((handle.to_string(), size));
            }
        }
        out.sort();
        Ok(out)
    }

    async fn load_sidecar(&self, handle: &str) -> Result<Vec<u32>, FsError> {
        let raw = match fs::read(self.sidecar_path(handle)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(raw
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }

    async fn store_sidecar(&self, handle: &str, sums: &[u32]) -> Result<(), FsError> {
        let mut raw = Vec::with_capacity(sums.len() * 4);
        for sum in sums {
            raw.extend_from_slice(&sum.to_le_bytes());
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.sidecar_path(handle))
            .await?;
        file.write_all(&raw).await?;
        file.sync_data().await?;
        Ok(())
    }

    /// Recompute sidecar entries for every block from the one containing
    /// `from` to end-of-file.
    async fn refresh_blocks(&self, handle: &str, from: u64) -> Result<(), FsError> {
        let mut file = OpenOptions::new()
            .read(true)
            .open(self.chunk_path(handle))
            .await?;
        let len = file.metadata().await?.len();
        let total_blocks = len.div_ceil(CHECKSUM_BLOCK_SIZE) as usize;

        let mut sums = self.load_sidecar(handle).await?;
        sums.resize(total_blocks, 0);

        let first_block = from / CHECKSUM_BLOCK_SIZE;
        file.seek(SeekFrom::Start(first_block * CHECKSUM_BLOCK_SIZE))
            .await?;
        let mut block = vec![0u8; CHECKSUM_BLOCK_SIZE as usize];
        for block_no in first_block as usize..total_blocks {
            let remaining = len - block_no as u64 * CHECKSUM_BLOCK_SIZE;
            let this = remaining.min(CHECKSUM_BLOCK_SIZE) as usize;
            file.read_exact(&mut block[..this]).await?;
            sums[block_no] = crc32fast::hash(&block[..this]);
        }
        self.store_sidecar(handle, &sums).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (ChunkStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(dir.path()).unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (store, _dir) = store();
        store.write_at("h1", 0, b"Hola, GFS!").await.unwrap();
        let got = store.read("h1", 0, 10).await.unwrap();
        assert_eq!(&got, b"Hola, GFS!");

        // Ranged read within the chunk.
        let got = store.read("h1", 6, 3).await.unwrap();
        assert_eq!(&got, b"GFS");
    }

    #[tokio::test]
    async fn write_spanning_blocks_keeps_checksums_valid() {
        let (store, _dir) = store();
        let data = vec![7u8; CHECKSUM_BLOCK_SIZE as usize * 2 + 100];
        store.write_at("h1", 0, &data).await.unwrap();
        // Overwrite a range straddling the first block boundary.
        store
            .write_at("h1", CHECKSUM_BLOCK_SIZE - 10, &[9u8; 20])
            .await
            .unwrap();
        let got = store
            .read("h1", 0, data.len() as u64)
            .await
            .unwrap();
        assert_eq!(got.len(), data.len());
        assert_eq!(got[CHECKSUM_BLOCK_SIZE as usize - 11], 7);
        assert_eq!(got[CHECKSUM_BLOCK_SIZE as usize - 10], 9);
        assert_eq!(got[CHECKSUM_BLOCK_SIZE as usize + 9], 9);
        assert_eq!(got[CHECKSUM_BLOCK_SIZE as usize + 10], 7);
    }

    #[tokio::test]
    async fn gap_writes_zero_fill() {
        let (store, _dir) = store();
        store.write_at("h1", 0, b"abc").await.unwrap();
        store.write_at("h1", 10, b"xyz").await.unwrap();
        let got = store.read("h1", 0, 13).await.unwrap();
        assert_eq!(&got[..3], b"abc");
        assert_eq!(&got[3..10], &[0u8; 7]);
        assert_eq!(&got[10..], b"xyz");
    }

    #[tokio::test]
    async fn corruption_is_detected_on_read() {
        let (store, dir) = store();
        store
            .write_at("h1", 0, &vec![1u8; CHECKSUM_BLOCK_SIZE as usize + 5])
            .await
            .unwrap();

        // Flip a byte in the second block behind the store's back.
        let path = dir.path().join("h1.chunk");
        let mut raw = std::fs::read(&path).unwrap();
        let idx = CHECKSUM_BLOCK_SIZE as usize + 2;
        raw[idx] ^= 0xff;
        std::fs::write(&path, &raw).unwrap();

        // First block still verifies.
        assert!(store.read("h1", 0, 16).await.is_ok());
        match store.read("h1", CHECKSUM_BLOCK_SIZE, 5).await {
            Err(FsError::ChecksumMismatch { block, .. }) => assert_eq!(block, 1),
            other => panic!("expected checksum mismatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn append_and_pad() {
        let (store, _dir) = store();
        let off = store.append("h1", b"one").await.unwrap();
        assert_eq!(off, 0);
        let off = store.append("h1", b"two").await.unwrap();
        assert_eq!(off, 3);
        store.pad_to("h1", 64).await.unwrap();
        assert_eq!(store.size("h1").await.unwrap(), 64);
        let got = store.read("h1", 0, 64).await.unwrap();
        assert_eq!(&got[..6], b"onetwo");
        assert!(got[6..].iter().all(|&b| b == 0));

        // Padding never shrinks.
        store.pad_to("h1", 10).await.unwrap();
        assert_eq!(store.size("h1").await.unwrap(), 64);
    }

    #[tokio::test]
    async fn install_delete_and_list() {
        let (store, _dir) = store();
        store.install("h1", b"payload").await.unwrap();
        store.install("h2", b"other").await.unwrap();
        let listed = store.list_chunks().await.unwrap();
        assert_eq!(
            listed,
            vec![("h1".to_string(), 7), ("h2".to_string(), 5)]
        );

        store.delete("h1").await.unwrap();
        store.delete("h1").await.unwrap(); // idempotent
        assert!(!store.exists("h1").await);
        assert!(matches!(
            store.read("h1", 0, 1).await,
            Err(FsError::ChunkNotFound(_))
        ));
    }

    #[tokio::test]
    async fn reads_past_end_are_rejected_or_short() {
        let (store, _dir) = store();
        store.write_at("h1", 0, b"abcdef").await.unwrap();
        // Short read at end-of-chunk.
        let got = store.read("h1", 4, 10).await.unwrap();
        assert_eq!(&got, b"ef");
        // Offset beyond the end is an error.
        assert!(matches!(
            store.read("h1", 7, 1).await,
            Err(FsError::ReadOutOfRange { .. })
        ));
    }
}
