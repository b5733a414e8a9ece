const BITS_PER_WORD: usize = u64::BITS as usize;

/// A fixed-size bitmap with one bit per interface id. Sized from the highest interface id a class
/// can see, so "does this class implement interface X" is a single load and mask.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InterfaceBitmap {
    words: Box<[u64]>,
}

impl InterfaceBitmap {
    /// Create an empty bitmap able to hold ids `0..=max_id`.
    pub fn with_max_id(max_id: u32) -> Self {
        let bits = max_id as usize + 1;
        Self {
            words: vec![0u64; bits.div_ceil(BITS_PER_WORD)].into_boxed_slice(),
        }
    }

    pub fn set(&mut self, id: u32) {
        let (word, bit) = Self::locate(id);
        assert!(
            word < self.words.len(),
            "interface id {} is beyond the bitmap capacity {}",
            id,
            self.capacity()
        );
        self.words[word] |= 1 << bit;
    }

    pub fn contains(&self, id: u32) -> bool {
        let (word, bit) = Self::locate(id);
        self.words
            .get(word)
            .is_some_and(|w| (w >> bit) & 1 == 1)
    }

    /// The number of ids the bitmap can hold.
    pub fn capacity(&self) -> usize {
        self.words.len() * BITS_PER_WORD
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    fn locate(id: u32) -> (usize, usize) {
        let id = id as usize;
        (id / BITS_PER_WORD, id % BITS_PER_WORD)
    }
}
