use bitvec::prelude::*;

type Bits = BitVec<u8, Msb0>;

// Piece completion vector with a cached count of set bits, so completion
// checks don't rescan the vector on every piece write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {

    bits: Bits,

    num_complete: usize,

}

impl Bitfield {

    pub fn new(num_pieces: usize) -> Self {
        Self {
            bits: Bits::repeat(false, num_pieces),
            num_complete: 0,
        }
    }

    pub fn full(num_pieces: usize) -> Self {
        Self {
            bits: Bits::repeat(true, num_pieces),
            num_complete: num_pieces,
        }
    }

    // Rebuilds a bitfield from wire bytes. The wire carries whole bytes, so
    // trailing padding bits are dropped.
    pub fn from_raw(raw: &[u8], num_pieces: usize) -> Self {
        let mut bits = Bits::from_slice(raw);
        bits.resize(num_pieces, false);
        let num_complete = bits.count_ones();
        Self { bits, num_complete }
    }

    pub fn to_raw(&self) -> Vec<u8> {
        self.bits.clone().into_vec()
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn has(&self, idx: usize) -> bool {
        self.bits.get(idx).map(|b| *b).unwrap_or(false)
    }

    // Updates the cached count only on a transition.
    pub fn set(&mut self, idx: usize, value: bool) {
        let prev = self.bits[idx];
        if prev != value {
            self.bits.set(idx, value);
            if value {
                self.num_complete += 1;
            } else {
                self.num_complete -= 1;
            }
        }
    }

    pub fn num_complete(&self) -> usize {
        self.num_complete
    }

    pub fn complete(&self) -> bool {
        self.num_complete == self.bits.len()
    }

    pub fn intersection(&self, other: &Bitfield) -> Bitfield {
        debug_assert_eq!(self.len(), other.len());
        let mut bits = self.bits.clone();
        for idx in other.bits.iter_zeros() {
            if idx < bits.len() {
                bits.set(idx, false);
            }
        }
        let num_complete = bits.count_ones();
        Self { bits, num_complete }
    }

    pub fn complement(&self) -> Bitfield {
        let mut bits = Bits::repeat(false, self.bits.len());
        for idx in self.bits.iter_zeros() {
            bits.set(idx, true);
        }
        let num_complete = bits.count_ones();
        Self { bits, num_complete }
    }

    // Indices of set bits, ascending.
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }
}

impl std::fmt::Display for Bitfield {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for bit in self.bits.iter() {
            write!(f, "{}", if *bit { '1' } else { '0' })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_counts_transitions_only() {
        let mut bf = Bitfield::new(8);
        bf.set(3, true);
        assert_eq!(bf.num_complete(), 1);
        // Setting an already-set bit leaves the count alone.
        bf.set(3, true);
        assert_eq!(bf.num_complete(), 1);
        bf.set(3, false);
        assert_eq!(bf.num_complete(), 0);
        bf.set(3, false);
        assert_eq!(bf.num_complete(), 0);
    }

    #[test]
    fn test_complete() {
        let mut bf = Bitfield::new(3);
        assert!(!bf.complete());
        for i in 0..3 {
            bf.set(i, true);
        }
        assert!(bf.complete());
        assert!(Bitfield::full(3).complete());
        // Zero-length bitfields are vacuously complete.
        assert!(Bitfield::new(0).complete());
    }

    #[test]
    fn test_intersection_and_complement() {
        let mut a = Bitfield::new(4);
        a.set(0, true);
        a.set(2, true);
        let mut b = Bitfield::new(4);
        b.set(2, true);
        b.set(3, true);

        let both = a.intersection(&b);
        assert!(both.has(2));
        assert_eq!(both.num_complete(), 1);

        // Pieces b has that a lacks.
        let missing = b.intersection(&a.complement());
        assert!(missing.has(3));
        assert!(!missing.has(2));
        assert_eq!(missing.num_complete(), 1);
    }

    #[test]
    fn test_raw_round_trip_drops_padding() {
        let mut bf = Bitfield::new(10);
        bf.set(0, true);
        bf.set(9, true);
        let raw = bf.to_raw();
        assert_eq!(raw.len(), 2);
        let back = Bitfield::from_raw(&raw, 10);
        assert_eq!(back, bf);
        assert_eq!(back.num_complete(), 2);
    }

    #[test]
    fn test_display() {
        let mut bf = Bitfield::new(4);
        bf.set(1, true);
        assert_eq!(bf.to_string(), "0100");
    }
}
