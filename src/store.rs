use std::fmt::Display;
use std::sync::Mutex;

use bytes::{Bytes, BytesMut};
use sha1::{Digest, Sha1};

use crate::protocol::{Hashes, Info};

pub const BLOCK_LENGTH: u32 = 16 * 1024;

/// The unit of request/response on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

impl Display for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Block in piece {} with offset {} and length {}",
            self.piece, self.offset, self.length
        )
    }
}

#[derive(Debug)]
struct BlockSlot {
    offset: u32,
    length: u32,
    data: Option<Bytes>,
    requested: bool,
}

#[derive(Debug)]
struct BlockTable {
    blocks: Vec<BlockSlot>,
}

impl BlockTable {
    fn new(piece_length: u32) -> Self {
        let mut blocks = Vec::with_capacity(piece_length.div_ceil(BLOCK_LENGTH) as usize);
        let mut offset = 0;
        while offset < piece_length {
            let length = u32::min(BLOCK_LENGTH, piece_length - offset);
            blocks.push(BlockSlot {
                offset,
                length,
                data: None,
                requested: false,
            });
            offset += length;
        }
        Self { blocks }
    }

    fn slot_mut(&mut self, offset: u32) -> Option<&mut BlockSlot> {
        if offset % BLOCK_LENGTH != 0 {
            return None;
        }
        self.blocks.get_mut((offset / BLOCK_LENGTH) as usize)
    }

    fn is_full(&self) -> bool {
        self.blocks.iter().all(|block| block.data.is_some())
    }

    fn reset(&mut self) {
        for block in &mut self.blocks {
            block.data = None;
            block.requested = false;
        }
    }
}

#[derive(Debug)]
enum PieceSlot {
    Missing(BlockTable),
    Downloading(BlockTable),
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceStatus {
    Missing,
    Downloading,
    Complete,
}

/// Exclusive right to be the sole downloader of a piece.
/// Consumed by [`PieceStore::release_piece`].
#[derive(Debug)]
pub struct Lease {
    pub index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Piece is verified and committed
    Keep,
    /// Clear all block state so the piece can be retried
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Stored,
    /// Duplicate delivery or a block of an unleased piece
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    UnknownPiece,
    UnknownOffset,
    LengthMismatch,
}

impl Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitError::UnknownPiece => write!(f, "unknown piece index"),
            SubmitError::UnknownOffset => write!(f, "offset is not a block start"),
            SubmitError::LengthMismatch => write!(f, "data length does not match block length"),
        }
    }
}

impl std::error::Error for SubmitError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceError {
    Incomplete,
    HashMismatch,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub completed_pieces: usize,
    pub total_pieces: usize,
    pub completed_bytes: u64,
}

impl Progress {
    pub fn is_complete(&self) -> bool {
        self.completed_pieces == self.total_pieces
    }

    pub fn percent(&self) -> f32 {
        if self.total_pieces == 0 {
            return 100.;
        }
        self.completed_pieces as f32 / self.total_pieces as f32 * 100.
    }
}

#[derive(Debug, Default)]
struct Counters {
    completed_pieces: usize,
    completed_bytes: u64,
}

/// Per piece block accounting, assembly and SHA-1 verification.
///
/// Lease transitions are serialized per piece; block mutations happen under
/// the same per piece lock. Nothing is held across await points.
#[derive(Debug)]
pub struct PieceStore {
    piece_length: u32,
    total_length: u64,
    hashes: Hashes,
    pieces: Vec<Mutex<PieceSlot>>,
    counters: Mutex<Counters>,
}

impl PieceStore {
    pub fn new(info: &Info) -> Self {
        let total_length = info.total_size();
        let pieces = (0..info.pieces.len() as u32)
            .map(|i| Mutex::new(PieceSlot::Missing(BlockTable::new(info.piece_len(i)))))
            .collect();
        Self {
            piece_length: info.piece_length,
            total_length,
            hashes: info.pieces.clone(),
            pieces,
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn total_pieces(&self) -> usize {
        self.pieces.len()
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Piece length taking the short last piece into account
    pub fn piece_len(&self, piece: u32) -> u32 {
        let start = piece as u64 * self.piece_length as u64;
        u64::min(self.piece_length as u64, self.total_length - start) as u32
    }

    pub fn piece_status(&self, index: u32) -> PieceStatus {
        let Some(piece) = self.pieces.get(index as usize) else {
            return PieceStatus::Complete;
        };
        match &*piece.lock().unwrap() {
            PieceSlot::Missing(_) => PieceStatus::Missing,
            PieceSlot::Downloading(_) => PieceStatus::Downloading,
            PieceSlot::Complete => PieceStatus::Complete,
        }
    }

    /// Missing -> Downloading. `None` means the piece is busy or done.
    pub fn lease_piece(&self, index: u32) -> Option<Lease> {
        let mut slot = self.pieces.get(index as usize)?.lock().unwrap();
        match std::mem::replace(&mut *slot, PieceSlot::Complete) {
            PieceSlot::Missing(table) => {
                *slot = PieceSlot::Downloading(table);
                Some(Lease { index })
            }
            other => {
                *slot = other;
                None
            }
        }
    }

    /// Downloading -> Complete (`Keep`) or Downloading -> Missing (`Reset`)
    pub fn release_piece(&self, lease: Lease, outcome: ReleaseOutcome) {
        let mut slot = self.pieces[lease.index as usize].lock().unwrap();
        match std::mem::replace(&mut *slot, PieceSlot::Complete) {
            PieceSlot::Downloading(mut table) => match outcome {
                ReleaseOutcome::Keep => {
                    // Complete pieces keep no buffers
                    drop(table);
                    let mut counters = self.counters.lock().unwrap();
                    counters.completed_pieces += 1;
                    counters.completed_bytes += self.piece_len(lease.index) as u64;
                }
                ReleaseOutcome::Reset => {
                    table.reset();
                    *slot = PieceSlot::Missing(table);
                }
            },
            other => {
                *slot = other;
                tracing::error!(piece = lease.index, "Released a lease on a piece that is not downloading");
            }
        }
    }

    /// Next block with no data and no request in flight. Does not mark it
    /// requested, the caller does that explicitly.
    pub fn next_missing_block(&self, index: u32) -> Option<Block> {
        let slot = self.pieces.get(index as usize)?.lock().unwrap();
        let PieceSlot::Downloading(table) = &*slot else {
            return None;
        };
        table
            .blocks
            .iter()
            .find(|block| !block.requested && block.data.is_none())
            .map(|block| Block {
                piece: index,
                offset: block.offset,
                length: block.length,
            })
    }

    pub fn mark_requested(&self, index: u32, offset: u32) {
        self.set_requested(index, offset, true);
    }

    pub fn clear_requested(&self, index: u32, offset: u32) {
        self.set_requested(index, offset, false);
    }

    fn set_requested(&self, index: u32, offset: u32, requested: bool) {
        let Some(piece) = self.pieces.get(index as usize) else {
            return;
        };
        let mut slot = piece.lock().unwrap();
        if let PieceSlot::Downloading(table) = &mut *slot {
            if let Some(block) = table.slot_mut(offset) {
                block.requested = requested;
            }
        }
    }

    /// Store an inbound block. Duplicate deliveries and blocks of pieces
    /// nobody is downloading are ignored; structural mismatches are errors.
    pub fn submit_block(&self, index: u32, offset: u32, data: Bytes) -> Result<Submission, SubmitError> {
        let piece = self
            .pieces
            .get(index as usize)
            .ok_or(SubmitError::UnknownPiece)?;
        let mut slot = piece.lock().unwrap();
        match &mut *slot {
            PieceSlot::Downloading(table) => {
                let block = table.slot_mut(offset).ok_or(SubmitError::UnknownOffset)?;
                if data.len() != block.length as usize {
                    return Err(SubmitError::LengthMismatch);
                }
                if block.data.is_some() {
                    return Ok(Submission::Ignored);
                }
                block.data = Some(data);
                block.requested = false;
                Ok(Submission::Stored)
            }
            PieceSlot::Missing(table) => {
                let block = table.slot_mut(offset).ok_or(SubmitError::UnknownOffset)?;
                if data.len() != block.length as usize {
                    return Err(SubmitError::LengthMismatch);
                }
                Ok(Submission::Ignored)
            }
            PieceSlot::Complete => Ok(Submission::Ignored),
        }
    }

    pub fn is_piece_full(&self, index: u32) -> bool {
        let Some(piece) = self.pieces.get(index as usize) else {
            return false;
        };
        match &*piece.lock().unwrap() {
            PieceSlot::Missing(table) | PieceSlot::Downloading(table) => table.is_full(),
            PieceSlot::Complete => true,
        }
    }

    /// Concatenate blocks in offset order and check the SHA-1 digest.
    /// The state transition is left to [`Self::release_piece`].
    pub fn assemble_and_verify(&self, index: u32) -> Result<Bytes, PieceError> {
        let slot = self.pieces[index as usize].lock().unwrap();
        let PieceSlot::Downloading(table) = &*slot else {
            return Err(PieceError::Incomplete);
        };
        let mut bytes = BytesMut::with_capacity(self.piece_len(index) as usize);
        for block in &table.blocks {
            let data = block.data.as_ref().ok_or(PieceError::Incomplete)?;
            bytes.extend_from_slice(data);
        }
        let mut hasher = Sha1::new();
        hasher.update(&bytes);
        let digest: [u8; 20] = hasher.finalize().into();
        if digest != self.hashes[index as usize] {
            tracing::warn!(piece = index, "Piece failed hash verification");
            return Err(PieceError::HashMismatch);
        }
        Ok(bytes.freeze())
    }

    pub fn progress(&self) -> Progress {
        let counters = self.counters.lock().unwrap();
        Progress {
            completed_pieces: counters.completed_pieces,
            total_pieces: self.pieces.len(),
            completed_bytes: counters.completed_bytes,
        }
    }
}

/// Build an [`Info`] whose piece hashes match the given piece contents
#[cfg(test)]
pub(crate) fn test_info(piece_length: u32, content: &[&[u8]]) -> Info {
    use crate::protocol::SizeDescriptor;

    let total: u64 = content.iter().map(|piece| piece.len() as u64).sum();
    let hashes = content
        .iter()
        .map(|piece| {
            let mut hasher = Sha1::new();
            hasher.update(piece);
            hasher.finalize().into()
        })
        .collect();
    Info {
        raw: Bytes::new(),
        file_descriptor: SizeDescriptor::Length(total),
        name: "test.bin".to_string(),
        piece_length,
        pieces: Hashes(hashes),
    }
}
