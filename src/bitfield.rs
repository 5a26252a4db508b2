/// Piece-availability bitmap, MSB-first within each byte: bit 0 of piece 0
/// is the high bit of byte 0, matching the peer-wire Bitfield payload.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Bitfield {
    data: Vec<u8>,
    bits: usize,
}

fn bytes_needed(bits: usize) -> usize {
    (bits + 7) / 8
}

fn index_and_mask(bit: usize) -> (usize, u8) {
    (bit / 8, 0b1000_0000 >> (bit % 8))
}

impl Bitfield {
    pub fn new(bits: usize) -> Self {
        Self {
            data: vec![0; bytes_needed(bits)],
            bits,
        }
    }

    pub fn len(&self) -> usize {
        self.bits
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn get(&self, bit: usize) -> bool {
        if bit >= self.bits {
            return false;
        }
        let (index, mask) = index_and_mask(bit);
        self.data[index] & mask != 0
    }

    pub fn set_bit(&mut self, bit: usize) {
        if bit >= self.bits {
            return;
        }
        let (index, mask) = index_and_mask(bit);
        self.data[index] |= mask;
    }

    /// Merges a received Bitfield payload into this bitmap. Payload bytes
    /// beyond our piece count are ignored; spare low bits of the final byte
    /// fall outside `bits` and are dropped by the per-bit guard.
    pub fn merge_bytes(&mut self, payload: &[u8]) {
        for bit in 0..self.bits {
            let (index, mask) = index_and_mask(bit);
            if index < payload.len() && payload[index] & mask != 0 {
                self.set_bit(bit);
            }
        }
    }

    pub fn count_set(&self) -> usize {
        (0..self.bits).filter(|&bit| self.get(bit)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_every_index() {
        let bits = 19;
        for i in 0..bits {
            let mut bf = Bitfield::new(bits);
            bf.set_bit(i);
            for j in 0..bits {
                assert_eq!(bf.get(j), i == j);
            }
        }
    }

    #[test]
    fn index_zero_is_high_bit_of_byte_zero() {
        let mut bf = Bitfield::new(10);
        bf.set_bit(0);
        assert_eq!(bf.as_bytes()[0], 0b1000_0000);
        bf.set_bit(9);
        assert_eq!(bf.as_bytes()[1], 0b0100_0000);
    }

    #[test]
    fn sizing_rounds_up() {
        assert_eq!(Bitfield::new(1).as_bytes().len(), 1);
        assert_eq!(Bitfield::new(8).as_bytes().len(), 1);
        assert_eq!(Bitfield::new(9).as_bytes().len(), 2);
    }

    #[test]
    fn merge_or_semantics() {
        let mut bf = Bitfield::new(12);
        bf.set_bit(2);
        bf.merge_bytes(&[0b1000_0000, 0b0001_0000]);
        assert!(bf.get(0));
        assert!(bf.get(2));
        assert!(bf.get(11));
        assert_eq!(bf.count_set(), 3);
    }

    #[test]
    fn out_of_range_is_ignored() {
        let mut bf = Bitfield::new(4);
        bf.set_bit(7); // spare bit of the only byte
        assert!(!bf.get(7));
        assert_eq!(bf.as_bytes()[0], 0);
    }
}
