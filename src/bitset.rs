//! Dense bit sets over operand numbers.
//!
//! The liveness analysis keeps four of these per block. They are plain
//! word vectors with the in-place set operations the backward data flow
//! needs, and an iterator over the members.

/// Number of bits in a set word.
const BITS: usize = 32;

/// A fixed-capacity set of small integers, stored as a bit mask.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct BitSet {
    words: Vec<u32>,
}

impl BitSet {
    /// Create an empty set with capacity for `len` members.
    pub fn with_capacity(len: usize) -> Self {
        Self {
            words: vec![0; (len + BITS - 1) / BITS],
        }
    }

    /// Is `bit` a member?
    pub fn contains(&self, bit: usize) -> bool {
        self.words[bit / BITS] & (1 << (bit % BITS)) != 0
    }

    /// Insert `bit` into the set.
    pub fn insert(&mut self, bit: usize) {
        self.words[bit / BITS] |= 1 << (bit % BITS);
    }

    /// Remove `bit` from the set.
    pub fn remove(&mut self, bit: usize) {
        self.words[bit / BITS] &= !(1 << (bit % BITS));
    }

    /// True if no bit is set.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Replace this set's contents with those of `other`.
    pub fn copy_from(&mut self, other: &Self) {
        debug_assert_eq!(self.words.len(), other.words.len());
        self.words.copy_from_slice(&other.words);
    }

    /// In-place union. Returns true if this set changed.
    pub fn union_with(&mut self, other: &Self) -> bool {
        debug_assert_eq!(self.words.len(), other.words.len());
        let mut changed = false;
        for (w, &o) in self.words.iter_mut().zip(other.words.iter()) {
            let new = *w | o;
            changed |= new != *w;
            *w = new;
        }
        changed
    }

    /// In-place difference: remove every member of `other`.
    pub fn difference_with(&mut self, other: &Self) {
        debug_assert_eq!(self.words.len(), other.words.len());
        for (w, &o) in self.words.iter_mut().zip(other.words.iter()) {
            *w &= !o;
        }
    }

    /// Iterate over the members in increasing order.
    pub fn iter(&self) -> SetBitIter<'_> {
        SetBitIter {
            words: &self.words,
            word: 0,
            bits: self.words.first().copied().unwrap_or(0),
        }
    }
}

/// Iterator over the members of a `BitSet`.
pub struct SetBitIter<'a> {
    words: &'a [u32],
    word: usize,
    bits: u32,
}

impl Iterator for SetBitIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        while self.bits == 0 {
            self.word += 1;
            if self.word >= self.words.len() {
                return None;
            }
            self.bits = self.words[self.word];
        }
        let bit = self.bits.trailing_zeros() as usize;
        self.bits &= self.bits - 1;
        Some(self.word * BITS + bit)
    }
}

#[cfg(test)]
mod tests {
    use super::BitSet;

    #[test]
    fn insert_contains_remove() {
        let mut s = BitSet::with_capacity(100);
        assert!(s.is_empty());
        s.insert(0);
        s.insert(31);
        s.insert(32);
        s.insert(99);
        assert!(s.contains(0) && s.contains(31) && s.contains(32) && s.contains(99));
        assert!(!s.contains(1) && !s.contains(98));
        s.remove(31);
        assert!(!s.contains(31));
        assert_eq!(s.iter().collect::<Vec<_>>(), vec![0, 32, 99]);
    }

    #[test]
    fn dataflow_ops() {
        let mut live_out = BitSet::with_capacity(64);
        let mut gen = BitSet::with_capacity(64);
        let mut kill = BitSet::with_capacity(64);
        gen.insert(3);
        kill.insert(40);
        live_out.insert(40);
        live_out.insert(41);

        // live_in = gen | (live_out - kill)
        let mut live_in = BitSet::with_capacity(64);
        live_in.copy_from(&live_out);
        live_in.difference_with(&kill);
        assert!(live_in.union_with(&gen));
        assert_eq!(live_in.iter().collect::<Vec<_>>(), vec![3, 41]);

        // a second identical union reports no change
        assert!(!live_in.union_with(&gen));
    }
}
