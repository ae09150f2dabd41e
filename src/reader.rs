use std::borrow::Cow;
use std::fmt;
use std::fs;
use std::io::{Error, ErrorKind, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::{
    BitSelect, Codec, EqualKeyValidator, KeyValidation, KeyValidator, Memory, OffsetStorage,
    SelectWords, TableConfig, TableMeta, UnitCodec,
};

/// Validator shape used by readers. The extracted value is wrapped in an
/// `Option` so that accepting a record of a valueless table stays distinct
/// from rejecting it.
pub type SharedKeyValidator<K, V> = Arc<dyn KeyValidator<K, Option<V>>>;

/// Overrides applied when opening a table.
pub struct ReaderOptions<K, V> {
    offsets: Option<PathBuf>,
    data: Option<PathBuf>,
    max_heap_usage: Option<u64>,
    max_data_heap_usage: Option<u64>,
    heap_resident: bool,
    validator: Option<SharedKeyValidator<K, V>>,
}

impl<K, V> Default for ReaderOptions<K, V> {
    fn default() -> Self {
        Self {
            offsets: None,
            data: None,
            max_heap_usage: None,
            max_data_heap_usage: None,
            heap_resident: false,
            validator: None,
        }
    }
}

impl<K, V> ReaderOptions<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_offsets_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.offsets = Some(path.into());
        self
    }

    pub fn with_data_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.data = Some(path.into());
        self
    }

    /// Replaces the offsets heap budget stored in the table configuration.
    pub fn with_max_heap_usage(mut self, limit: u64) -> Self {
        self.max_heap_usage = Some(limit);
        self
    }

    /// Replaces the data heap budget stored in the table configuration.
    pub fn with_max_data_heap_usage(mut self, limit: u64) -> Self {
        self.max_data_heap_usage = Some(limit);
        self
    }

    /// Reads every file into the heap regardless of the budgets.
    pub fn with_heap_resident(mut self, value: bool) -> Self {
        self.heap_resident = value;
        self
    }

    /// Validates located records with `validator` instead of the validation
    /// recorded in the table configuration.
    pub fn with_key_validator(mut self, validator: SharedKeyValidator<K, V>) -> Self {
        self.validator = Some(validator);
        self
    }
}

impl<K, V> fmt::Debug for ReaderOptions<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderOptions")
            .field("offsets", &self.offsets)
            .field("data", &self.data)
            .field("max_heap_usage", &self.max_heap_usage)
            .field("max_data_heap_usage", &self.max_data_heap_usage)
            .field("heap_resident", &self.heap_resident)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

/// Snapshot of lookup outcomes.
///
/// `filtered` lookups were rejected before touching the data (perfect hash
/// or key range), `missing` ones were rejected by the key validator and
/// `retrieved` ones returned a record.
#[derive(Serialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TableStats {
    /// Rejected by the perfect hash or the key range.
    pub filtered: u64,
    /// Rejected by the key validator.
    pub missing: u64,
    /// Returned a record.
    pub retrieved: u64,
}

impl TableStats {
    /// Total lookups.
    pub fn requests(&self) -> u64 {
        self.filtered + self.missing + self.retrieved
    }
}

impl fmt::Display for TableStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.requests().max(1) as f64;
        write!(
            f,
            "requests: {}, filtered: {} ({:.2}%), missing: {} ({:.2}%), retrieved: {} ({:.2}%)",
            self.requests(),
            self.filtered,
            self.filtered as f64 * 100.0 / total,
            self.missing,
            self.missing as f64 * 100.0 / total,
            self.retrieved,
            self.retrieved as f64 * 100.0 / total,
        )
    }
}

#[derive(Debug, Default)]
struct Counters {
    filtered: AtomicU64,
    missing: AtomicU64,
    retrieved: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TableStats {
        TableStats {
            filtered: self.filtered.load(Ordering::Relaxed),
            missing: self.missing.load(Ordering::Relaxed),
            retrieved: self.retrieved.load(Ordering::Relaxed),
        }
    }
}

/// Resources released by [`TableReader::close`].
#[derive(Debug)]
pub(crate) struct Storage {
    pub(crate) data: Memory,
    offsets: Option<Memory>,
    select: Option<BitSelect>,
}

impl Storage {
    /// Content of `offsets.bin`: raw offsets or the words under the select
    /// index. Empty when the table has no offsets file.
    pub(crate) fn offsets_bytes(&self) -> Cow<'_, [u8]> {
        match (&self.offsets, &self.select) {
            (Some(offsets), _) => Cow::Borrowed(&offsets[..]),
            (None, Some(select)) => select.words().to_le_bytes(),
            (None, None) => Cow::Borrowed(&[]),
        }
    }
}

/// Read access to a table directory.
///
/// Lookups hash the serialized key, resolve the entry offset from the
/// metadata and decode the record in place. When the table stores keys and
/// key validation is enabled, the stored key is compared to the query so
/// unknown keys are never reported as present.
///
/// A reader can be shared between threads; only the statistics counters are
/// updated by lookups.
///
/// # Examples
///
/// ```
/// use mphtable::{StringCodec, TableConfig, TableReader, TableWriter, VarLongCodec};
///
/// # fn main() -> std::io::Result<()> {
/// let dir = tempfile::tempdir()?;
/// let config = TableConfig::new()
///     .with_key_codec(StringCodec)
///     .with_value_codec(VarLongCodec);
/// let entries = [("apple".to_string(), 1), ("banana".to_string(), 2)];
/// TableWriter::new(config).write(dir.path(), &entries)?;
///
/// let reader = TableReader::<StringCodec, VarLongCodec>::open(dir.path())?;
/// assert_eq!(reader.get(&"banana".to_string())?, Some(2));
/// assert!(!reader.contains_key(&"cherry".to_string())?);
/// # Ok(())
/// # }
/// ```
pub struct TableReader<KC: Codec, VC: Codec = UnitCodec> {
    meta: TableMeta<KC, VC>,
    key_range: Option<(KC::Item, KC::Item)>,
    validator: Option<SharedKeyValidator<KC::Item, VC::Item>>,
    counters: Counters,
    storage: Option<Storage>,
}

impl<KC, VC> TableReader<KC, VC>
where
    KC: Codec,
    VC: Codec,
    KC::Item: Ord + 'static,
    VC::Item: 'static,
{
    /// Opens the table in a directory, or the table whose `meta.bin` is
    /// `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, ReaderOptions::default())
    }

    /// Opens a table with overridden locations, budgets or validator.
    ///
    /// # Errors
    ///
    /// Returns `ErrorKind::InvalidData` when the metadata is corrupt or a
    /// file is shorter than the metadata requires; IO errors are forwarded.
    pub fn open_with(
        path: impl AsRef<Path>,
        options: ReaderOptions<KC::Item, VC::Item>,
    ) -> Result<Self> {
        let meta =
            TableMeta::load_with(path, options.offsets.as_deref(), options.data.as_deref())?;
        let config = meta.config();
        let max_heap_usage = options.max_heap_usage.unwrap_or(config.max_heap_usage());
        let max_data_heap_usage = options
            .max_data_heap_usage
            .unwrap_or(config.max_data_heap_usage());
        let paths = meta.paths();

        let offsets = if meta.has_offsets_file() {
            let len = fs::metadata(&paths.offsets)?.len();
            let heap = options.heap_resident
                || (config.offset_storage() == OffsetStorage::Indexed
                    && (max_heap_usage == 0 || max_heap_usage >= len));
            Some(Memory::open(&paths.offsets, heap)?)
        } else {
            None
        };

        let data_len = fs::metadata(&paths.data)?.len();
        let heap =
            options.heap_resident || (!meta.has_offsets_file() && data_len < max_data_heap_usage);
        let data = Memory::open(&paths.data, heap)?;
        debug!(
            path = %paths.meta.display(),
            entries = meta.num_entries(),
            storage = ?config.offset_storage(),
            data_mapped = data.is_mapped(),
            offsets_mapped = offsets.as_ref().is_some_and(Memory::is_mapped),
            "opened table"
        );
        Self::assemble(meta, data, offsets, options.validator)
    }

    /// Builds a reader over already loaded files, checking their sizes
    /// against the metadata.
    pub(crate) fn assemble(
        meta: TableMeta<KC, VC>,
        data: Memory,
        offsets: Option<Memory>,
        validator: Option<SharedKeyValidator<KC::Item, VC::Item>>,
    ) -> Result<Self> {
        let config = meta.config();
        if data.len() as u64 != meta.data_size() {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!(
                    "Data file holds {} bytes, metadata expects {}",
                    data.len(),
                    meta.data_size()
                ),
            ));
        }

        let n = meta.num_entries();
        let (offsets, select) = match (config.offset_storage(), offsets) {
            (OffsetStorage::Indexed, Some(offsets)) => {
                let expected = config.indexed_offsets_size(n, meta.data_size());
                if (offsets.len() as u64) < expected {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        format!(
                            "Offsets file holds {} bytes, metadata expects {}",
                            offsets.len(),
                            expected
                        ),
                    ));
                }
                (Some(offsets), None)
            }
            (OffsetStorage::Selected, Some(words)) if meta.select().is_none() => {
                let num_bits = config.compress_offset(meta.data_size(), n);
                if (words.len() as u64) < num_bits.div_ceil(64) * 8 {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        format!("Select bits file is truncated: {} bytes", words.len()),
                    ));
                }
                let words = SelectWords::from_memory(words);
                debug!(
                    num_bits,
                    viewed = words.is_viewed(),
                    "indexing select bits from offsets file"
                );
                (None, Some(BitSelect::new(words, num_bits)))
            }
            (_, None) if !meta.has_offsets_file() => (None, None),
            (storage, _) => {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("Offsets do not match {:?} offset storage", storage),
                ))
            }
        };

        let validator = match validator {
            Some(validator) => Some(validator),
            None => match config.key_validation() {
                KeyValidation::Equality => {
                    Some(Arc::new(EqualKeyValidator) as SharedKeyValidator<_, _>)
                }
                KeyValidation::Disabled => None,
            },
        };

        Ok(Self {
            key_range: meta.key_range()?,
            meta,
            validator,
            counters: Counters::default(),
            storage: Some(Storage {
                data,
                offsets,
                select,
            }),
        })
    }

    fn storage(&self) -> Result<&Storage> {
        self.storage
            .as_ref()
            .ok_or_else(|| Error::other("table has been closed"))
    }

    pub(crate) fn meta_and_storage(&self) -> Result<(&TableMeta<KC, VC>, &Storage)> {
        Ok((&self.meta, self.storage()?))
    }

    fn out_of_range(&self, key: &KC::Item) -> bool {
        match &self.key_range {
            Some((min, max)) => key < min || key > max,
            None => false,
        }
    }

    fn hash_offset(&self, storage: &Storage, hash: u64) -> Result<u64> {
        self.meta
            .hash_offset(hash, storage.offsets.as_ref(), storage.select.as_ref())
    }

    fn read_at(
        &self,
        storage: &Storage,
        offset: u64,
    ) -> Result<(Option<KC::Item>, Option<VC::Item>)> {
        let mut input = storage.data.get(offset as usize..).ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidData,
                format!("Entry offset {} is past the end of the data", offset),
            )
        })?;
        let config = self.meta.config();
        let key = config.read_key(&mut input)?;
        let value = config.read_value(&mut input)?;
        Ok((key, value))
    }

    /// Locates `key` and runs the validator over the record. The outer
    /// `Option` is `None` when the key is absent.
    fn find(&self, key: &KC::Item) -> Result<Option<Option<VC::Item>>> {
        let storage = self.storage()?;
        if self.out_of_range(key) {
            Counters::bump(&self.counters.filtered);
            return Ok(None);
        }
        let Some(hash) = self.meta.hash(key)? else {
            Counters::bump(&self.counters.filtered);
            return Ok(None);
        };
        let offset = self.hash_offset(storage, hash)?;
        let (stored_key, value) = self.read_at(storage, offset)?;
        let found = match &self.validator {
            Some(validator) => validator.validate(key, stored_key.as_ref(), value),
            None => Some(value),
        };
        match found {
            Some(_) => Counters::bump(&self.counters.retrieved),
            None => Counters::bump(&self.counters.missing),
        }
        Ok(found)
    }

    /// Value stored for `key`.
    ///
    /// Tables without a value codec have no values to return; use
    /// [`contains_key`](Self::contains_key) on them.
    ///
    /// # Errors
    ///
    /// Fails once the reader is closed, or when the record cannot be decoded.
    pub fn get(&self, key: &KC::Item) -> Result<Option<VC::Item>> {
        Ok(self.find(key)?.flatten())
    }

    /// Whether `key` is in the table. Without a validator this only consults
    /// the perfect hash and the key range.
    pub fn contains_key(&self, key: &KC::Item) -> Result<bool> {
        if self.validator.is_some() {
            return Ok(self.find(key)?.is_some());
        }
        self.storage()?;
        if self.out_of_range(key) {
            return Ok(false);
        }
        Ok(self.meta.hash(key)?.is_some())
    }

    fn check_hash(&self, hash: u64) -> Result<()> {
        if hash >= self.len() {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("Hash {} is out of range for {} entries", hash, self.len()),
            ));
        }
        Ok(())
    }

    /// Record stored in bucket `hash`, read without hashing or validation.
    pub fn entry_for_hash(&self, hash: u64) -> Result<(Option<KC::Item>, Option<VC::Item>)> {
        self.check_hash(hash)?;
        let storage = self.storage()?;
        let offset = self.hash_offset(storage, hash)?;
        self.read_at(storage, offset)
    }

    /// Value stored in bucket `hash`.
    pub fn get_for_hash(&self, hash: u64) -> Result<Option<VC::Item>> {
        Ok(self.entry_for_hash(hash)?.1)
    }

    /// Key stored in bucket `hash`; always `None` under implicit key storage.
    pub fn get_key_for_hash(&self, hash: u64) -> Result<Option<KC::Item>> {
        Ok(self.entry_for_hash(hash)?.0)
    }

    /// Iterates over all entries in bucket order.
    ///
    /// # Errors
    ///
    /// Returns `ErrorKind::Unsupported` when keys are stored implicitly.
    pub fn iter(&self) -> Result<TableIter<'_, KC, VC>> {
        if !self.meta.config().stores_keys() {
            return Err(Error::new(
                ErrorKind::Unsupported,
                "Can't iterate over a table with implicit keys",
            ));
        }
        self.storage()?;
        Ok(TableIter {
            reader: self,
            hash: 0,
        })
    }

    /// Iterates over all keys in bucket order.
    pub fn keys(&self) -> Result<impl Iterator<Item = Result<KC::Item>> + '_> {
        Ok(self.iter()?.map(|entry| entry.map(|(key, _)| key)))
    }

    pub fn len(&self) -> u64 {
        self.meta.num_entries()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes of data and offsets, as accounted by the metadata.
    pub fn size_in_bytes(&self) -> u64 {
        self.meta.size_in_bytes()
    }

    /// Construction time in milliseconds since the Unix epoch.
    pub fn timestamp(&self) -> u64 {
        self.meta.timestamp()
    }

    pub fn config(&self) -> &TableConfig<KC, VC> {
        self.meta.config()
    }

    pub fn meta(&self) -> &TableMeta<KC, VC> {
        &self.meta
    }

    /// Whether the data is served from a memory-mapped file.
    pub fn is_disk_based(&self) -> bool {
        self.storage
            .as_ref()
            .is_some_and(|storage| storage.data.is_mapped())
    }

    pub fn stats(&self) -> TableStats {
        self.counters.snapshot()
    }

    /// Releases the mapped files. Later lookups fail.
    pub fn close(&mut self) {
        if self.storage.take().is_some() {
            debug!(path = %self.meta.paths().meta.display(), "closed table");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.storage.is_none()
    }
}

impl<KC: Codec, VC: Codec> fmt::Debug for TableReader<KC, VC> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableReader")
            .field("meta", &self.meta)
            .field("validator", &self.validator.is_some())
            .field("storage", &self.storage)
            .finish()
    }
}

/// Iterator over the entries of a [`TableReader`], see
/// [`TableReader::iter`].
pub struct TableIter<'a, KC: Codec, VC: Codec> {
    reader: &'a TableReader<KC, VC>,
    hash: u64,
}

impl<KC: Codec, VC: Codec> fmt::Debug for TableIter<'_, KC, VC> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableIter")
            .field("hash", &self.hash)
            .field("len", &self.reader.meta.num_entries())
            .finish()
    }
}

impl<KC, VC> Iterator for TableIter<'_, KC, VC>
where
    KC: Codec,
    VC: Codec,
    KC::Item: Ord + 'static,
    VC::Item: 'static,
{
    type Item = Result<(KC::Item, Option<VC::Item>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.hash >= self.reader.len() {
            return None;
        }
        let entry = self.reader.entry_for_hash(self.hash);
        self.hash += 1;
        Some(entry.and_then(|(key, value)| match key {
            Some(key) => Ok((key, value)),
            None => Err(Error::new(ErrorKind::InvalidData, "Stored key is missing")),
        }))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.reader.len().saturating_sub(self.hash) as usize;
        (remaining, Some(remaining))
    }
}
