use std::io::{Error, ErrorKind, Result, Write};

use serde::{Deserialize, Serialize};

use crate::{Codec, SizeEquation, UnitCodec};

/// Default target size in bytes of each temporary shard written during
/// construction.
pub const DEFAULT_TEMP_SHARD_SIZE: u64 = 64 << 20; // 64 MiB

/// Upper bound on the number of temporary shards used during construction.
pub const MAX_TEMP_SHARDS: u64 = 512;

/// Whether serialized keys are kept in the data file.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum KeyStorage {
    /// Keys are stored next to their values and checked on lookup.
    #[default]
    Explicit,
    /// Keys are dropped; lookups of unknown keys may return false positives
    /// at a rate bounded by the signature width.
    Implicit,
}

/// How a hash bucket is mapped to the byte offset of its entry.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum OffsetStorage {
    /// Pick the cheapest of the other modes once the data size is known.
    #[default]
    Automatic,
    /// One fixed-width offset per bucket in `offsets.bin`.
    Indexed,
    /// Offsets compressed into a bit vector queried with select.
    Selected,
    /// Offsets computed from the bucket index; needs constant entry sizes.
    Fixed,
}

/// Whether the smallest and largest keys are kept to reject out-of-range
/// lookups early.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RangeChecking {
    #[default]
    Disabled,
    MinAndMax,
    /// Track the range only when keys are stored implicitly.
    Automatic,
}

/// Key validation applied by readers, see [`KeyValidator`](crate::KeyValidator).
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum KeyValidation {
    Disabled,
    /// Use [`EqualKeyValidator`](crate::EqualKeyValidator).
    #[default]
    Equality,
}

/// Description of a table: its codecs, storage modes and resource limits.
///
/// The configuration is persisted inside the table metadata, so every reader
/// sees the exact codecs and modes used at construction time. Builder
/// methods consume the configuration and return the modified copy.
///
/// # Examples
///
/// ```
/// use mphtable::{LongCodec, OffsetStorage, TableConfig, VarLongCodec};
///
/// let config = TableConfig::new()
///     .with_key_codec(LongCodec)
///     .with_value_codec(VarLongCodec);
/// assert!(config.is_valid());
/// assert_eq!(config.entry_size_equation().slope(), 1);
/// assert!(!config.clone().with_offset_storage(OffsetStorage::Fixed).is_valid());
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TableConfig<KC, VC = UnitCodec> {
    key_codec: Option<KC>,
    value_codec: Option<VC>,
    key_validation: KeyValidation,
    key_storage: KeyStorage,
    offset_storage: OffsetStorage,
    range_checking: RangeChecking,
    signature_width: u32,
    max_heap_usage: u64,
    max_data_heap_usage: u64,
    temp_shard_size: u64,
    debug_duplicate_keys: bool,
    entry_size: SizeEquation,
}

impl<KC, VC> Default for TableConfig<KC, VC> {
    fn default() -> Self {
        Self {
            key_codec: None,
            value_codec: None,
            key_validation: KeyValidation::default(),
            key_storage: KeyStorage::default(),
            offset_storage: OffsetStorage::default(),
            range_checking: RangeChecking::default(),
            signature_width: 0,
            max_heap_usage: 0,
            max_data_heap_usage: 0,
            temp_shard_size: DEFAULT_TEMP_SHARD_SIZE,
            debug_duplicate_keys: false,
            entry_size: SizeEquation::constant_value(0),
        }
    }
}

impl<KC: Codec, VC: Codec> TableConfig<KC, VC> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key_codec(mut self, codec: KC) -> Self {
        self.key_codec = Some(codec);
        self.refresh_entry_size()
    }

    /// Sets the value codec. Tables without one store only keys.
    pub fn with_value_codec(mut self, codec: VC) -> Self {
        self.value_codec = Some(codec);
        self.refresh_entry_size()
    }

    pub fn with_key_validation(mut self, validation: KeyValidation) -> Self {
        self.key_validation = validation;
        self
    }

    pub fn with_key_storage(mut self, storage: KeyStorage) -> Self {
        self.key_storage = storage;
        self.refresh_entry_size()
    }

    pub fn with_offset_storage(mut self, storage: OffsetStorage) -> Self {
        self.offset_storage = storage;
        self
    }

    pub fn with_range_checking(mut self, range_checking: RangeChecking) -> Self {
        self.range_checking = range_checking;
        self
    }

    /// Number of signature bits stored per entry; unknown keys pass the
    /// signature check with probability `2^-width`.
    pub fn with_signature_width(mut self, width: u32) -> Self {
        self.signature_width = width;
        self
    }

    /// Byte limit above which offsets are memory-mapped instead of held in
    /// the heap. Zero keeps them in the heap.
    pub fn with_max_heap_usage(mut self, limit: u64) -> Self {
        self.max_heap_usage = limit;
        self
    }

    /// Byte limit below which the data file of a table without an offsets
    /// file is loaded into the heap. Zero always maps it.
    pub fn with_max_data_heap_usage(mut self, limit: u64) -> Self {
        self.max_data_heap_usage = limit;
        self
    }

    pub fn with_temp_shard_size(mut self, size: u64) -> Self {
        self.temp_shard_size = size;
        self
    }

    /// Decode both colliding entries when construction finds duplicate keys.
    pub fn with_debug_duplicate_keys(mut self, value: bool) -> Self {
        self.debug_duplicate_keys = value;
        self
    }

    fn refresh_entry_size(mut self) -> Self {
        self.entry_size = self.key_size_equation().add(&self.value_size_equation());
        self
    }

    /// Codec of the keys, required for building and reading.
    pub fn key_codec(&self) -> Option<&KC> {
        self.key_codec.as_ref()
    }

    /// Codec of the values; `None` for valueless tables.
    pub fn value_codec(&self) -> Option<&VC> {
        self.value_codec.as_ref()
    }

    /// Persisted key validation applied by readers without a custom validator.
    pub fn key_validation(&self) -> KeyValidation {
        self.key_validation
    }

    /// Whether keys are written to the data file.
    pub fn key_storage(&self) -> KeyStorage {
        self.key_storage
    }

    /// Requested offset storage, or the resolved one in a built table.
    pub fn offset_storage(&self) -> OffsetStorage {
        self.offset_storage
    }

    /// Requested key range checking.
    pub fn range_checking(&self) -> RangeChecking {
        self.range_checking
    }

    /// Bits of key signature stored per entry.
    pub fn signature_width(&self) -> u32 {
        self.signature_width
    }

    /// Heap budget in bytes for offsets and select bits; 0 means unlimited.
    pub fn max_heap_usage(&self) -> u64 {
        self.max_heap_usage
    }

    /// Largest data file loaded into the heap; 0 keeps data mapped.
    pub fn max_data_heap_usage(&self) -> u64 {
        self.max_data_heap_usage
    }

    /// Target size in bytes of each temporary shard during construction.
    pub fn temp_shard_size(&self) -> u64 {
        self.temp_shard_size
    }

    /// Whether duplicate keys are reported with their keys and values.
    pub fn debug_duplicate_keys(&self) -> bool {
        self.debug_duplicate_keys
    }

    /// Whether entries carry their serialized key.
    pub fn stores_keys(&self) -> bool {
        self.key_storage == KeyStorage::Explicit
    }

    /// Whether a value codec is set.
    pub fn has_values(&self) -> bool {
        self.value_codec.is_some()
    }

    /// Whether construction records the key range for this configuration.
    pub fn tracks_key_range(&self) -> bool {
        match self.range_checking {
            RangeChecking::Disabled => false,
            RangeChecking::MinAndMax => true,
            RangeChecking::Automatic => self.key_storage == KeyStorage::Implicit,
        }
    }

    pub fn key_size_equation(&self) -> SizeEquation {
        match &self.key_codec {
            Some(codec) if self.stores_keys() => codec
                .size_equation()
                .unwrap_or(SizeEquation::multiple_of(1)),
            _ => SizeEquation::constant_value(0),
        }
    }

    pub fn value_size_equation(&self) -> SizeEquation {
        match &self.value_codec {
            Some(codec) => codec
                .size_equation()
                .unwrap_or(SizeEquation::multiple_of(1)),
            None => SizeEquation::constant_value(0),
        }
    }

    /// Size equation of a whole entry, key and value combined.
    pub fn entry_size_equation(&self) -> SizeEquation {
        self.entry_size
    }

    /// Checks that a table can be built with this configuration.
    ///
    /// # Errors
    ///
    /// Returns `ErrorKind::InvalidInput` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let problem = if self.key_codec.is_none() {
            "a key codec is required"
        } else if self.offset_storage == OffsetStorage::Fixed && !self.entry_size.is_constant() {
            "fixed offset storage requires a constant entry size"
        } else if self.key_storage == KeyStorage::Implicit && self.signature_width == 0 {
            "implicit key storage requires a signature width"
        } else if self.signature_width > 64 {
            "signature width cannot exceed 64 bits"
        } else {
            return Ok(());
        };
        Err(Error::new(
            ErrorKind::InvalidInput,
            format!("Invalid table config: {}", problem),
        ))
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    pub(crate) fn require_key_codec(&self) -> Result<&KC> {
        self.key_codec
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "table config has no key codec"))
    }

    /// Serialized size of an entry, counting the key only when it is stored.
    pub fn size_of(&self, key: &KC::Item, value: Option<&VC::Item>) -> Result<u64> {
        let mut size = 0;
        if self.stores_keys() {
            size += self.require_key_codec()?.size_of(key)?;
        }
        if let (Some(codec), Some(value)) = (&self.value_codec, value) {
            size += codec.size_of(value)?;
        }
        Ok(size)
    }

    /// Bytes fed to the perfect hash for `key`.
    pub(crate) fn write_hash_key(&self, key: &KC::Item, out: &mut Vec<u8>) -> Result<()> {
        out.clear();
        self.require_key_codec()?.write(key, out)
    }

    pub(crate) fn write_entry<W: Write>(
        &self,
        key: &KC::Item,
        value: Option<&VC::Item>,
        out: &mut W,
    ) -> Result<()> {
        if self.stores_keys() {
            self.require_key_codec()?.write(key, out)?;
        }
        if let (Some(codec), Some(value)) = (&self.value_codec, value) {
            codec.write(value, out)?;
        }
        Ok(())
    }

    pub(crate) fn read_key(&self, input: &mut &[u8]) -> Result<Option<KC::Item>> {
        if !self.stores_keys() {
            return Ok(None);
        }
        self.require_key_codec()?.read(input).map(Some)
    }

    pub(crate) fn read_value(&self, input: &mut &[u8]) -> Result<Option<VC::Item>> {
        match &self.value_codec {
            Some(codec) => codec.read(input).map(Some),
            None => Ok(None),
        }
    }

    /// Width of a raw offset able to address `data_size` bytes.
    pub fn bytes_per_offset(&self, data_size: u64) -> u32 {
        if data_size < i16::MAX as u64 {
            2
        } else if data_size < i32::MAX as u64 {
            4
        } else {
            8
        }
    }

    /// Maps the offset of the entry in bucket `n` to the integer recorded in
    /// the select bit vector. Distinct buckets always map to distinct values
    /// as long as every entry size fits the entry size equation.
    pub fn compress_offset(&self, offset: u64, n: u64) -> u64 {
        (self.entry_size.solve_for_nth(offset as i64, n as i64) + n as i64) as u64
    }

    /// Inverse of [`compress_offset`](Self::compress_offset).
    pub fn decompress_offset(&self, value: u64, n: u64) -> u64 {
        self.entry_size
            .apply_nth(value as i64 - n as i64, n as i64) as u64
    }

    /// Bytes needed to store one raw offset per entry.
    pub fn indexed_offsets_size(&self, num_entries: u64, data_size: u64) -> u64 {
        num_entries * self.bytes_per_offset(data_size) as u64
    }

    /// Approximate bytes needed by the select structure over compressed
    /// offsets.
    pub fn selected_offsets_size(&self, num_entries: u64, data_size: u64) -> u64 {
        self.compress_offset(data_size, num_entries) * 3 / 64
    }

    /// Cheapest offset storage for a table of `num_entries` entries holding
    /// `data_size` bytes.
    pub fn choose_best_offset_storage(&self, num_entries: u64, data_size: u64) -> OffsetStorage {
        if self.entry_size.is_constant() {
            OffsetStorage::Fixed
        } else if self.indexed_offsets_size(num_entries, data_size)
            <= self.selected_offsets_size(num_entries, data_size)
        {
            OffsetStorage::Indexed
        } else {
            OffsetStorage::Selected
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use crate::*;

    #[test]
    fn test_validity() {
        let config = TableConfig::<LongCodec>::new();
        assert!(!config.is_valid());
        assert_eq!(config.validate().unwrap_err().kind(), std::io::ErrorKind::InvalidInput);

        let config = config.with_key_codec(LongCodec);
        assert!(config.is_valid());
        assert!(config
            .clone()
            .with_offset_storage(OffsetStorage::Fixed)
            .is_valid());
        assert!(!config.clone().with_key_storage(KeyStorage::Implicit).is_valid());
        assert!(config
            .clone()
            .with_key_storage(KeyStorage::Implicit)
            .with_signature_width(8)
            .is_valid());
        assert!(!config.clone().with_signature_width(65).is_valid());

        let config = TableConfig::new()
            .with_key_codec(VarLongCodec)
            .with_value_codec(LongCodec)
            .with_offset_storage(OffsetStorage::Fixed);
        assert!(!config.is_valid());
        assert!(config.with_key_storage(KeyStorage::Implicit).with_signature_width(4).is_valid());
    }

    #[test]
    fn test_entry_size_equation() {
        let config = TableConfig::<LongCodec, LongCodec>::new();
        assert_eq!(config.entry_size_equation(), SizeEquation::constant_value(0));

        let config = config.with_key_codec(LongCodec);
        assert_eq!(config.entry_size_equation(), SizeEquation::constant_value(8));
        let config = config.with_value_codec(LongCodec);
        assert_eq!(config.entry_size_equation(), SizeEquation::constant_value(16));
        let config = config.with_key_storage(KeyStorage::Implicit);
        assert_eq!(config.entry_size_equation(), SizeEquation::constant_value(8));

        let config = TableConfig::new()
            .with_key_codec(StringCodec)
            .with_value_codec(LongCodec);
        assert_eq!(config.entry_size_equation(), SizeEquation::slope_intercept(1, 8));
        assert_eq!(config.size_of(&"abc".to_string(), Some(&7)).unwrap(), 12);
        assert_eq!(config.size_of(&"abc".to_string(), None).unwrap(), 4);
    }

    #[test]
    fn test_bytes_per_offset() {
        let config = TableConfig::<LongCodec>::new().with_key_codec(LongCodec);
        assert_eq!(config.bytes_per_offset(0), 2);
        assert_eq!(config.bytes_per_offset(32766), 2);
        assert_eq!(config.bytes_per_offset(32767), 4);
        assert_eq!(config.bytes_per_offset(i32::MAX as u64 - 1), 4);
        assert_eq!(config.bytes_per_offset(i32::MAX as u64), 8);
    }

    #[test]
    fn test_choose_best_offset_storage() {
        let fixed = TableConfig::<LongCodec>::new().with_key_codec(LongCodec);
        assert_eq!(
            fixed.choose_best_offset_storage(1_000_000, 8 << 20),
            OffsetStorage::Fixed
        );

        let variable = TableConfig::<VarLongCodec>::new().with_key_codec(VarLongCodec);
        assert_eq!(
            variable.choose_best_offset_storage(1_000_000, 4 << 20),
            OffsetStorage::Selected
        );
        assert_eq!(
            variable.choose_best_offset_storage(1_000_000, 1 << 30),
            OffsetStorage::Indexed
        );
    }

    #[test]
    fn test_fixed_offsets() {
        let config = TableConfig::<LongCodec, LongCodec>::new()
            .with_key_codec(LongCodec)
            .with_value_codec(LongCodec);
        for n in 0..100 {
            assert_eq!(config.decompress_offset(0, n), n * 16);
            assert_eq!(config.compress_offset(n * 16, n), n);
        }
    }

    fn assert_compression_injective<KC: Codec, VC: Codec>(
        config: &TableConfig<KC, VC>,
        sizes: &[u64],
    ) {
        let mut offset = 0;
        let mut previous = None;
        for (n, size) in sizes.iter().enumerate() {
            let n = n as u64;
            let compressed = config.compress_offset(offset, n);
            if let Some(previous) = previous {
                assert!(compressed > previous, "{} <= {} at bucket {}", compressed, previous, n);
            }
            assert_eq!(config.decompress_offset(compressed, n), offset);
            previous = Some(compressed);
            offset += size;
        }
        let total = config.compress_offset(offset, sizes.len() as u64);
        assert!(previous.map_or(true, |p| p < total));
    }

    #[test]
    fn test_compression_injective() {
        let mut rng = rand::rng();

        let unit = TableConfig::<LongCodec>::new()
            .with_key_codec(LongCodec)
            .with_key_storage(KeyStorage::Implicit)
            .with_signature_width(1);
        assert_eq!(unit.entry_size_equation(), SizeEquation::constant_value(0));
        assert_compression_injective(&unit, &[0; 100]);

        let fixed = TableConfig::<LongCodec, LongCodec>::new()
            .with_key_codec(LongCodec)
            .with_value_codec(LongCodec);
        assert_compression_injective(&fixed, &[16; 100]);

        let variable = TableConfig::<LongCodec, VarLongCodec>::new()
            .with_key_codec(LongCodec)
            .with_value_codec(VarLongCodec);
        let sizes: Vec<u64> = (0..1000).map(|_| 8 + rng.random_range(1..=10)).collect();
        assert_compression_injective(&variable, &sizes);

        let strings = TableConfig::<StringCodec>::new().with_key_codec(StringCodec);
        let sizes: Vec<u64> = (0..1000).map(|_| rng.random_range(1..200)).collect();
        assert_compression_injective(&strings, &sizes);
    }

    #[test]
    fn test_persisted_config() {
        let config = TableConfig::new()
            .with_key_codec(StringCodec)
            .with_value_codec(ListCodec::new(VarLongCodec))
            .with_offset_storage(OffsetStorage::Selected)
            .with_range_checking(RangeChecking::MinAndMax)
            .with_signature_width(7);
        let bytes = rmp_serde::to_vec_named(&config).unwrap();
        let loaded: TableConfig<StringCodec, ListCodec<VarLongCodec>> =
            rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(loaded, config);
    }
}
