use std::{
    io::SeekFrom,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{ensure, Context};
use bytes::Bytes;
use tokio::{
    fs,
    io::{AsyncSeekExt, AsyncWriteExt},
    sync::Mutex as FileLock,
};

use crate::protocol::Info;

const FILE_HANDLE_CAP: usize = 10;

#[derive(Debug, Clone)]
struct TargetFile {
    offset: u64,
    length: u64,
    path: PathBuf,
}

impl TargetFile {
    fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Intersection of a piece with one output file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    file_idx: usize,
    offset_in_file: u64,
    offset_in_piece: usize,
    length: usize,
}

/// Maps piece indexes onto the concatenated file layout and commits
/// verified pieces to disk.
///
/// Handles are cached per file behind their own lock, so commits touching
/// disjoint files run in parallel while same file commits serialize.
#[derive(Debug)]
pub struct FileMapper {
    files: Box<[TargetFile]>,
    segments: Vec<Vec<Segment>>,
    handles: Mutex<lru::LruCache<usize, Arc<FileLock<fs::File>>>>,
}

impl FileMapper {
    pub fn new(info: &Info, output_dir: impl AsRef<Path>) -> Self {
        let mut offset = 0;
        let files: Box<[TargetFile]> = info
            .output_files(output_dir)
            .into_iter()
            .map(|file| {
                let target = TargetFile {
                    offset,
                    length: file.length(),
                    path: file.path().clone(),
                };
                offset += file.length();
                target
            })
            .collect();

        let piece_length = info.piece_length as u64;
        let total_length = info.total_size();
        let mut segments = vec![Vec::new(); info.pieces.len()];
        for (file_idx, file) in files.iter().enumerate() {
            if file.length == 0 {
                continue;
            }
            let start_piece = file.offset / piece_length;
            let end_piece = (file.end() - 1) / piece_length;
            for piece in start_piece..=end_piece {
                let piece_start = piece * piece_length;
                let piece_end = u64::min(piece_start + piece_length, total_length);
                let overlap_start = u64::max(piece_start, file.offset);
                let overlap_end = u64::min(piece_end, file.end());
                if overlap_start < overlap_end {
                    segments[piece as usize].push(Segment {
                        file_idx,
                        offset_in_file: overlap_start - file.offset,
                        offset_in_piece: (overlap_start - piece_start) as usize,
                        length: (overlap_end - overlap_start) as usize,
                    });
                }
            }
        }

        Self {
            files,
            segments,
            handles: Mutex::new(lru::LruCache::new(NonZeroUsize::new(FILE_HANDLE_CAP).unwrap())),
        }
    }

    /// Write a verified piece into every file it intersects
    pub async fn commit_piece(&self, index: u32, bytes: Bytes) -> anyhow::Result<()> {
        let segments = self
            .segments
            .get(index as usize)
            .with_context(|| format!("piece {index} maps to no file"))?;
        for segment in segments {
            ensure!(
                segment.offset_in_piece + segment.length <= bytes.len(),
                "piece {index} is shorter than its file mapping"
            );
            let handle = self.handle(segment.file_idx).await?;
            let mut file = handle.lock().await;
            file.seek(SeekFrom::Start(segment.offset_in_file))
                .await
                .context("seek output file")?;
            file.write_all(&bytes[segment.offset_in_piece..segment.offset_in_piece + segment.length])
                .await
                .context("write output file")?;
            file.flush().await.context("flush output file")?;
        }
        Ok(())
    }

    async fn handle(&self, file_idx: usize) -> anyhow::Result<Arc<FileLock<fs::File>>> {
        if let Some(handle) = self.handles.lock().unwrap().get(&file_idx) {
            return Ok(Arc::clone(handle));
        }
        let target = &self.files[file_idx];
        if let Some(parent) = target.path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("create output directories")?;
        }
        tracing::debug!("Creating file handle: {}", target.path.display());
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&target.path)
            .await
            .with_context(|| format!("open {}", target.path.display()))?;
        file.set_len(target.length).await.context("size output file")?;

        let handle = Arc::new(FileLock::new(file));
        let mut cache = self.handles.lock().unwrap();
        // a concurrent commit may have opened the file in the meantime
        if let Some(existing) = cache.get(&file_idx) {
            return Ok(Arc::clone(existing));
        }
        cache.put(file_idx, Arc::clone(&handle));
        Ok(handle)
    }

    /// Drop cached handles. Files close once in-flight writers finish.
    pub fn close_all(&self) {
        self.handles.lock().unwrap().clear();
    }
}
