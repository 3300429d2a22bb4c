/// Fixed-capacity bit set sized to one OS code range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitSet {
    words: Vec<u64>,
    len: usize,
}

impl BitSet {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    /// Codes beyond `len` are dropped
    pub fn from_codes(len: usize, codes: impl IntoIterator<Item = usize>) -> Self {
        let mut set = Self::new(len);
        for code in codes {
            set.insert(code);
        }
        set
    }

    /// Size of the code range in bits
    pub fn capacity(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Out-of-range codes are ignored
    pub fn insert(&mut self, code: usize) {
        if code < self.len {
            self.words[code / 64] |= 1u64 << (code % 64);
        }
    }

    pub fn contains(&self, code: usize) -> bool {
        code < self.len && self.words[code / 64] & (1u64 << (code % 64)) != 0
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Set codes in ascending order
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(word_index, &word)| {
            let mut remaining = word;
            std::iter::from_fn(move || {
                if remaining == 0 {
                    return None;
                }
                let bit = remaining.trailing_zeros() as usize;
                remaining &= remaining - 1;
                Some(word_index * 64 + bit)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_codes_truncates_to_len() {
        let set = BitSet::from_codes(4, [0, 3, 4, 9]);
        assert_eq!(set.iter_ones().collect::<Vec<_>>(), vec![0, 3]);
        assert_eq!(set.count(), 2);
        assert!(!set.contains(4));
    }

    #[test]
    fn test_iter_crosses_word_boundary() {
        let set = BitSet::from_codes(0x300, [0x2ff, 63, 64, 0x120]);
        assert_eq!(
            set.iter_ones().collect::<Vec<_>>(),
            vec![63, 64, 0x120, 0x2ff]
        );
    }

    #[test]
    fn test_empty() {
        let set = BitSet::new(0x40);
        assert!(set.is_empty());
        assert_eq!(set.iter_ones().count(), 0);
        assert!(!set.contains(1000));
    }
}
