use std::borrow::Cow;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use bitm::{BinaryRankSearch, RankSelect101111, Select};
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::Memory;

const WORD_BITS: u64 = 64;

/// Growable-once bit vector backed by `u64` words.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct BitVector {
    words: Vec<u64>,
    len: u64,
}

impl BitVector {
    /// Creates a vector of `len` cleared bits.
    pub fn new(len: u64) -> Self {
        Self {
            words: vec![0; len.div_ceil(WORD_BITS) as usize],
            len,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether bit `index` is set.
    pub fn get(&self, index: u64) -> bool {
        self.words[(index / WORD_BITS) as usize] & (1 << (index % WORD_BITS)) != 0
    }

    /// Sets bit `index`.
    pub fn set(&mut self, index: u64) {
        self.words[(index / WORD_BITS) as usize] |= 1 << (index % WORD_BITS);
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> u64 {
        self.words.iter().map(|w| w.count_ones() as u64).sum()
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    pub fn into_words(self) -> Vec<u64> {
        self.words
    }
}

/// Array of unsigned integers of a fixed bit width, packed into `u64` words.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct PackedInts {
    width: u32,
    len: u64,
    words: Vec<u64>,
}

impl PackedInts {
    /// Creates `len` zeroed integers of `width` bits each, `width <= 64`.
    pub fn new(width: u32, len: u64) -> Self {
        Self {
            width,
            len,
            words: vec![0; (len * width as u64).div_ceil(WORD_BITS) as usize],
        }
    }

    /// Bits per integer.
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn mask(&self) -> u64 {
        if self.width == 64 {
            u64::MAX
        } else {
            (1 << self.width) - 1
        }
    }

    /// Integer at `index`; always 0 when the width is 0.
    pub fn get(&self, index: u64) -> u64 {
        if self.width == 0 {
            return 0;
        }
        let bit = index * self.width as u64;
        let word = (bit / WORD_BITS) as usize;
        let shift = bit % WORD_BITS;
        let mut value = self.words[word] >> shift;
        if shift + self.width as u64 > WORD_BITS {
            value |= self.words[word + 1] << (WORD_BITS - shift);
        }
        value & self.mask()
    }

    /// Stores the low `width` bits of `value` at `index`.
    pub fn set(&mut self, index: u64, value: u64) {
        if self.width == 0 {
            return;
        }
        let mask = self.mask();
        let value = value & mask;
        let bit = index * self.width as u64;
        let word = (bit / WORD_BITS) as usize;
        let shift = bit % WORD_BITS;
        self.words[word] &= !(mask << shift);
        self.words[word] |= value << shift;
        if shift + self.width as u64 > WORD_BITS {
            let spill = WORD_BITS - shift;
            self.words[word + 1] &= !(mask >> spill);
            self.words[word + 1] |= value >> spill;
        }
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.words.len() as u64 * 8
    }
}

/// Words under a select index, shared between the index and its owner.
///
/// Words are either owned or viewed in place over a little-endian buffer,
/// typically a memory-mapped `offsets.bin`. Buffers that cannot be viewed as
/// `u64` words (misaligned, or on a big-endian host) are copied.
#[derive(Clone)]
pub struct SelectWords(Arc<WordStore>);

enum WordStore {
    Owned(Box<[u64]>),
    Viewed(Memory),
}

impl SelectWords {
    /// Words encoded little-endian in `memory`, viewed in place when possible.
    pub fn from_memory(memory: Memory) -> Self {
        let viewable = cfg!(target_endian = "little")
            && bytemuck::try_cast_slice::<u8, u64>(&memory[..]).is_ok();
        if viewable {
            Self(Arc::new(WordStore::Viewed(memory)))
        } else {
            let words = memory
                .chunks_exact(8)
                .map(|chunk| {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(chunk);
                    u64::from_le_bytes(buf)
                })
                .collect();
            Self(Arc::new(WordStore::Owned(words)))
        }
    }

    /// Whether the words are read in place from a buffer.
    pub fn is_viewed(&self) -> bool {
        matches!(*self.0, WordStore::Viewed(_))
    }

    /// Little-endian encoding of the words.
    pub fn to_le_bytes(&self) -> Cow<'_, [u8]> {
        match &*self.0 {
            WordStore::Viewed(memory) => Cow::Borrowed(&memory[..]),
            WordStore::Owned(words) => {
                Cow::Owned(words.iter().flat_map(|word| word.to_le_bytes()).collect())
            }
        }
    }
}

impl From<Vec<u64>> for SelectWords {
    fn from(words: Vec<u64>) -> Self {
        Self(Arc::new(WordStore::Owned(words.into_boxed_slice())))
    }
}

impl Deref for SelectWords {
    type Target = [u64];

    fn deref(&self) -> &[u64] {
        match &*self.0 {
            WordStore::Owned(words) => &words[..],
            // Checked castable when the view was created.
            WordStore::Viewed(memory) => bytemuck::cast_slice(&memory[..]),
        }
    }
}

impl fmt::Debug for SelectWords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectWords")
            .field("len", &self.len())
            .field("viewed", &self.is_viewed())
            .finish()
    }
}

type SelectIndex = RankSelect101111<BinaryRankSearch, BinaryRankSearch, SelectWords>;

/// Select over a bit vector: position of the `rank`-th set bit.
///
/// The index is `bitm`'s `RankSelect101111`, built when the structure is
/// created or deserialized; only the number of bits and the words are
/// persisted.
pub struct BitSelect {
    words: SelectWords,
    num_bits: u64,
    num_ones: u64,
    index: Option<SelectIndex>,
}

impl BitSelect {
    /// Builds a heap-resident select structure over `bits`.
    pub fn from_bits(bits: BitVector) -> Self {
        let num_bits = bits.len();
        Self::new(SelectWords::from(bits.into_words()), num_bits)
    }

    /// Indexes `words`, of which only the first `num_bits` bits are
    /// meaningful. Trailing bits must be clear.
    pub fn new(words: SelectWords, num_bits: u64) -> Self {
        let num_ones = words.iter().map(|word| word.count_ones() as u64).sum();
        let index = (num_ones > 0).then(|| SelectIndex::build(words.clone()).0);
        Self {
            words,
            num_bits,
            num_ones,
            index,
        }
    }

    /// Length of the indexed bit vector.
    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    /// Number of set bits.
    pub fn num_ones(&self) -> u64 {
        self.num_ones
    }

    /// Words of the indexed bit vector.
    pub fn words(&self) -> &SelectWords {
        &self.words
    }

    /// Position of the `rank`-th set bit, counting from zero.
    pub fn select(&self, rank: u64) -> Option<u64> {
        if rank >= self.num_ones {
            return None;
        }
        let index = self.index.as_ref()?;
        index.try_select(rank as usize).map(|position| position as u64)
    }
}

impl fmt::Debug for BitSelect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitSelect")
            .field("num_bits", &self.num_bits)
            .field("num_ones", &self.num_ones)
            .field("words", &self.words)
            .finish()
    }
}

#[derive(Serialize)]
struct SelectRef<'a> {
    num_bits: u64,
    words: &'a [u64],
}

#[derive(Deserialize)]
struct SelectImage {
    num_bits: u64,
    words: Vec<u64>,
}

impl Serialize for BitSelect {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        SelectRef {
            num_bits: self.num_bits,
            words: &self.words,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for BitSelect {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let image = SelectImage::deserialize(deserializer)?;
        if (image.words.len() as u64) < image.num_bits.div_ceil(WORD_BITS) {
            return Err(de::Error::custom(format!(
                "{} select words cannot hold {} bits",
                image.words.len(),
                image.num_bits
            )));
        }
        Ok(Self::new(SelectWords::from(image.words), image.num_bits))
    }
}
