use anyhow::anyhow;

/// Packed piece set as it appears on the wire: bit `i` of byte `i / 8`,
/// most significant bit first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitField(pub Vec<u8>);

impl BitField {
    pub fn new(data: &[u8]) -> Self {
        Self(data.to_vec())
    }

    pub fn empty(pieces_amount: usize) -> Self {
        Self(vec![0; std::cmp::max(pieces_amount.div_ceil(8), 1)])
    }

    pub fn has(&self, piece: usize) -> bool {
        let Some(byte) = self.0.get(piece / 8) else {
            return false;
        };
        let position = (piece % 8) as u32;
        byte & 1u8.rotate_right(position + 1) != 0
    }

    pub fn add(&mut self, piece: usize) -> anyhow::Result<()> {
        let Some(byte) = self.0.get_mut(piece / 8) else {
            return Err(anyhow!("piece {piece} does not exist"));
        };
        let position = (piece % 8) as u32;
        *byte |= 1u8.rotate_right(position + 1);
        Ok(())
    }

    pub fn remove(&mut self, piece: usize) -> anyhow::Result<()> {
        let Some(byte) = self.0.get_mut(piece / 8) else {
            return Err(anyhow!("piece {piece} does not exist"));
        };
        let position = (piece % 8) as u32;
        *byte &= !1u8.rotate_right(position + 1);
        Ok(())
    }

    /// All set bit positions, including spare bits past the piece count.
    pub fn pieces(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().enumerate().flat_map(|(i, byte)| {
            (0..8u32).filter_map(move |position| {
                let piece = i * 8 + position as usize;
                let mask = 1u8.rotate_right(position + 1);
                (byte & mask != 0).then_some(piece)
            })
        })
    }

    pub fn count(&self) -> usize {
        self.0.iter().map(|byte| byte.count_ones() as usize).sum()
    }
}

impl From<Vec<u8>> for BitField {
    fn from(value: Vec<u8>) -> Self {
        BitField(value)
    }
}

#[cfg(test)]
mod tests {
    use super::BitField;

    #[test]
    fn bitfield_has() {
        let data = [0b01110101, 0b01110001];
        let bitfield = BitField::new(&data);
        assert!(!bitfield.has(0));
        assert!(bitfield.has(1));
        assert!(bitfield.has(2));
        assert!(bitfield.has(3));
        assert!(!bitfield.has(4));
        assert!(bitfield.has(5));
        assert!(!bitfield.has(6));
        assert!(bitfield.has(7));
        assert!(!bitfield.has(8));
        assert!(bitfield.has(9));
        assert!(bitfield.has(10));
        assert!(bitfield.has(11));
        assert!(!bitfield.has(12));
        assert!(!bitfield.has(13));
        assert!(!bitfield.has(14));
        assert!(bitfield.has(15));
        assert!(!bitfield.has(16));
        assert!(!bitfield.has(17));
    }

    #[test]
    fn bitfield_add() {
        let data = [0b01110101, 0b01110001];
        let mut bitfield = BitField::new(&data);
        bitfield.add(0).unwrap();
        bitfield.add(4).unwrap();
        bitfield.add(14).unwrap();
        assert!(bitfield.has(0));
        assert!(bitfield.has(4));
        assert!(bitfield.has(14));
        assert!(bitfield.has(15));
        assert!(!bitfield.has(12));
        assert!(bitfield.add(16).is_err());
    }

    #[test]
    fn bitfield_remove() {
        let data = [0b01110101, 0b01110001];
        let mut bitfield = BitField::new(&data);
        bitfield.remove(1).unwrap();
        bitfield.remove(15).unwrap();
        assert!(!bitfield.has(1));
        assert!(!bitfield.has(15));
        assert!(bitfield.has(2));
        assert!(bitfield.remove(16).is_err());
    }

    #[test]
    fn bitfield_iterator() {
        let data = [0b01110101, 0b01110001];
        let bitfield = BitField::new(&data);
        let pieces: Vec<_> = bitfield.pieces().collect();
        assert_eq!(pieces, [1, 2, 3, 5, 7, 9, 10, 11, 15]);
        assert_eq!(bitfield.count(), 9);
    }

    #[test]
    fn bitfield_empty_is_at_least_one_byte() {
        assert_eq!(BitField::empty(0).0.len(), 1);
        assert_eq!(BitField::empty(1).0.len(), 1);
        assert_eq!(BitField::empty(8).0.len(), 1);
        assert_eq!(BitField::empty(9).0.len(), 2);
    }
}
