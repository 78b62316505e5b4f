use std::sync::Mutex;

use crate::{
    bitfield::BitField,
    store::{Lease, PieceStatus, PieceStore},
};

/// Rarest-first piece selection over a dense availability vector.
///
/// Every live session advertises a monotonically growing piece set; the
/// counts here are the number of sessions advertising each piece. Sessions
/// record their own contribution so the counts survive disconnects exactly.
#[derive(Debug)]
pub struct Scheduler {
    availability: Mutex<Vec<u16>>,
}

impl Scheduler {
    pub fn new(total_pieces: usize) -> Self {
        Self {
            availability: Mutex::new(vec![0; total_pieces]),
        }
    }

    /// Push availability deltas for pieces a session newly advertises
    pub fn add_pieces(&self, pieces: impl IntoIterator<Item = u32>) {
        let mut counts = self.availability.lock().unwrap();
        for piece in pieces {
            if let Some(count) = counts.get_mut(piece as usize) {
                *count = count.saturating_add(1);
            }
        }
    }

    /// Remove a closed session's contribution
    pub fn retract(&self, have: &BitField) {
        let mut counts = self.availability.lock().unwrap();
        for piece in have.pieces() {
            if let Some(count) = counts.get_mut(piece) {
                *count = count.saturating_sub(1);
            }
        }
    }

    pub fn availability(&self, piece: u32) -> u16 {
        self.availability
            .lock()
            .unwrap()
            .get(piece as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Lease the rarest missing piece the peer advertises; ties go to the
    /// lowest index. Pieces another pump leased in the meantime are skipped.
    pub fn next_piece(&self, store: &PieceStore, have: &BitField) -> Option<Lease> {
        let mut candidates: Vec<u32> = {
            let counts = self.availability.lock().unwrap();
            let mut candidates: Vec<u32> = have
                .pieces()
                .filter(|&piece| piece < counts.len())
                .map(|piece| piece as u32)
                .filter(|&piece| store.piece_status(piece) == PieceStatus::Missing)
                .collect();
            candidates.sort_unstable_by_key(|&piece| (counts[piece as usize], piece));
            candidates
        };
        let lease = candidates
            .drain(..)
            .find_map(|piece| store.lease_piece(piece));
        lease
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use crate::{
        bitfield::BitField,
        store::{test_info, PieceStore, ReleaseOutcome},
    };

    use super::Scheduler;

    fn three_piece_store() -> PieceStore {
        let pieces: Vec<Vec<u8>> = (0..3).map(|i| vec![i as u8; 100]).collect();
        let refs: Vec<&[u8]> = pieces.iter().map(|p| p.as_slice()).collect();
        PieceStore::new(&test_info(100, &refs))
    }

    fn full_bitfield(pieces: usize) -> BitField {
        let mut bf = BitField::empty(pieces);
        for i in 0..pieces {
            bf.add(i).unwrap();
        }
        bf
    }

    #[test]
    #[traced_test]
    fn rarest_first_with_lowest_index_tie_break() {
        let store = three_piece_store();
        let scheduler = Scheduler::new(3);
        // availability [3, 1, 1]
        scheduler.add_pieces([0, 1, 2]);
        scheduler.add_pieces([0]);
        scheduler.add_pieces([0]);

        let have = full_bitfield(3);
        let lease = scheduler.next_piece(&store, &have).unwrap();
        assert_eq!(lease.index, 1);
        let lease = scheduler.next_piece(&store, &have).unwrap();
        assert_eq!(lease.index, 2);
        let lease = scheduler.next_piece(&store, &have).unwrap();
        assert_eq!(lease.index, 0);
        assert!(scheduler.next_piece(&store, &have).is_none());
    }

    #[test]
    fn leased_and_completed_pieces_are_not_candidates() {
        let store = three_piece_store();
        let scheduler = Scheduler::new(3);
        scheduler.add_pieces([0, 1, 2]);

        let have = full_bitfield(3);
        let first = scheduler.next_piece(&store, &have).unwrap();
        assert_eq!(first.index, 0);
        store.release_piece(first, ReleaseOutcome::Keep);

        let second = scheduler.next_piece(&store, &have).unwrap();
        assert_eq!(second.index, 1);
        // 0 is complete, 1 is in flight, only 2 is left
        assert_eq!(scheduler.next_piece(&store, &have).unwrap().index, 2);
    }

    #[test]
    fn peer_without_pieces_gets_nothing() {
        let store = three_piece_store();
        let scheduler = Scheduler::new(3);
        let have = BitField::empty(3);
        assert!(scheduler.next_piece(&store, &have).is_none());
    }

    #[test]
    fn retract_removes_exact_contribution() {
        let scheduler = Scheduler::new(3);
        scheduler.add_pieces([0, 1]);
        scheduler.add_pieces([1]);
        assert_eq!(scheduler.availability(0), 1);
        assert_eq!(scheduler.availability(1), 2);

        let mut contribution = BitField::empty(3);
        contribution.add(0).unwrap();
        contribution.add(1).unwrap();
        scheduler.retract(&contribution);
        assert_eq!(scheduler.availability(0), 0);
        assert_eq!(scheduler.availability(1), 1);
        assert_eq!(scheduler.availability(2), 0);
    }

    #[test]
    fn spare_bits_are_ignored() {
        let scheduler = Scheduler::new(3);
        // bitfield byte has bits set past the piece count
        scheduler.add_pieces([0, 3, 7]);
        assert_eq!(scheduler.availability(0), 1);
        assert_eq!(scheduler.availability(3), 0);
    }
}
