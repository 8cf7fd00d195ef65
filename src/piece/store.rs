use crate::error::{DownpourError, Result};
use crate::piece::{Bitfield, PieceMap};
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// A file the torrent's bytes map onto, relative to the download directory
#[derive(Debug, Clone)]
pub struct FileSpec {
    pub path: PathBuf,
    pub length: u64,
}

/// Result of offering piece data to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Bytes verified, written and the bitfield bit set
    Stored,
    /// The piece was already validated; the offer is a no-op
    AlreadyComplete,
    /// Hash did not match; nothing was written
    HashMismatch,
}

/// Persists hash-verified pieces and tracks local possession.
///
/// The bitfield bit for a piece is set only after its bytes have been
/// verified and flushed to disk, in that order.
pub struct PieceStore {
    map: PieceMap,
    files: Vec<FileEntry>,
    bitfield: Mutex<Bitfield>,
}

struct FileEntry {
    path: PathBuf,
    length: u64,
    /// Global offset of this file within the torrent
    offset: u64,
}

impl PieceStore {
    pub async fn new<P: AsRef<Path>>(
        download_dir: P,
        files: Vec<FileSpec>,
        map: PieceMap,
    ) -> Result<Self> {
        let download_dir = download_dir.as_ref().to_path_buf();
        fs::create_dir_all(&download_dir).await?;

        let mut entries = Vec::with_capacity(files.len());
        let mut offset = 0u64;

        for spec in &files {
            let file_path = download_dir.join(&spec.path);

            if let Some(parent) = file_path.parent() {
                fs::create_dir_all(parent).await?;
            }

            entries.push(FileEntry {
                path: file_path,
                length: spec.length,
                offset,
            });

            offset += spec.length;
        }

        if offset != map.total_length() {
            return Err(DownpourError::StorageError(format!(
                "File lengths sum to {} but piece map covers {}",
                offset,
                map.total_length()
            )));
        }

        info!(
            "Piece store initialized: {} files, {} pieces, {} bytes",
            entries.len(),
            map.len(),
            map.total_length()
        );

        let bitfield = Bitfield::new(map.len());
        Ok(Self {
            map,
            files: entries,
            bitfield: Mutex::new(bitfield),
        })
    }

    /// Verify a fully reassembled piece and persist it.
    ///
    /// The hash is checked before anything touches disk; the bitfield bit is
    /// set only after the bytes are flushed.
    pub async fn append_if_valid(&self, piece_index: u32, data: &[u8]) -> Result<AppendOutcome> {
        let piece = self.map.get(piece_index).ok_or_else(|| {
            DownpourError::PieceError(format!("Invalid piece index {}", piece_index))
        })?;

        if data.len() != piece.length as usize {
            return Err(DownpourError::PieceError(format!(
                "Piece {} is {} bytes, got {}",
                piece_index,
                piece.length,
                data.len()
            )));
        }

        if self.bitfield.lock().unwrap().has(piece_index) {
            debug!("Piece {} already complete, ignoring", piece_index);
            return Ok(AppendOutcome::AlreadyComplete);
        }

        let mut hasher = Sha1::new();
        hasher.update(data);
        let hash = hasher.finalize();

        if hash.as_slice() != piece.hash {
            warn!(
                "Piece {} failed verification: expected {}, got {}",
                piece_index,
                hex::encode(piece.hash),
                hex::encode(hash)
            );
            return Ok(AppendOutcome::HashMismatch);
        }

        self.persist(self.map.piece_offset(piece_index), data)
            .await?;

        self.bitfield.lock().unwrap().set(piece_index);
        info!("Piece {} verified and stored", piece_index);

        Ok(AppendOutcome::Stored)
    }

    /// Snapshot of local possession
    pub fn bitfield(&self) -> Bitfield {
        self.bitfield.lock().unwrap().clone()
    }

    pub fn complete_count(&self) -> usize {
        self.bitfield.lock().unwrap().count()
    }

    pub fn is_complete(&self) -> bool {
        self.bitfield.lock().unwrap().is_full()
    }

    pub fn has_piece(&self, piece_index: u32) -> bool {
        self.bitfield.lock().unwrap().has(piece_index)
    }

    pub fn piece_map(&self) -> &PieceMap {
        &self.map
    }

    /// Flush piece bytes starting at a global offset, one file segment at a
    /// time. Every segment is synced before the call returns, so a set bit
    /// never races the data it stands for.
    async fn persist(&self, start: u64, data: &[u8]) -> Result<()> {
        let mut written = 0usize;

        while written < data.len() {
            let global = start + written as u64;
            let (entry, within) = self.locate(global)?;

            let room = (entry.length - within) as usize;
            let end = data.len().min(written + room);
            let chunk = &data[written..end];

            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .open(&entry.path)
                .await?;
            file.seek(std::io::SeekFrom::Start(within)).await?;
            file.write_all(chunk).await?;
            file.sync_data().await?;

            debug!("{} bytes into {:?}+{}", chunk.len(), entry.path, within);
            written = end;
        }

        Ok(())
    }

    /// Map a global offset to the file holding it and the offset inside it
    fn locate(&self, global: u64) -> Result<(&FileEntry, u64)> {
        self.files
            .iter()
            .find(|f| global >= f.offset && global < f.offset + f.length)
            .map(|f| (f, global - f.offset))
            .ok_or_else(|| {
                DownpourError::StorageError(format!("Offset {} is outside every file", global))
            })
    }
}
