use std::borrow::Borrow;
use std::fmt::Debug;
use std::fs::{self, File};
use std::io::{BufWriter, Error, ErrorKind, Result, Write};
use std::path::Path;
use std::time::Instant;

use memmap2::MmapMut;
use tracing::{debug, info};

use crate::meta::set_read_only;
use crate::{
    mph, BitSelect, BitVector, Codec, Memory, MphError, Mphf, OffsetStorage, TableConfig,
    TableInfo, TableMeta, TablePaths, UnitCodec, MAX_TEMP_SHARDS,
};

/// A key with an optional value, as consumed by [`TableWriter`].
///
/// Implemented for `(K, V)` pairs, references to entries, [`KeyOnly`] for
/// valueless tables and [`StoredEntry`].
pub trait TableEntry<K, V> {
    fn key(&self) -> &K;

    fn value(&self) -> Option<&V>;
}

impl<K, V> TableEntry<K, V> for (K, V) {
    fn key(&self) -> &K {
        &self.0
    }

    fn value(&self) -> Option<&V> {
        Some(&self.1)
    }
}

impl<K, V, E: TableEntry<K, V> + ?Sized> TableEntry<K, V> for &E {
    fn key(&self) -> &K {
        (**self).key()
    }

    fn value(&self) -> Option<&V> {
        (**self).value()
    }
}

/// Entry of a table without values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyOnly<T>(pub T);

impl<K, V, T: Borrow<K>> TableEntry<K, V> for KeyOnly<T> {
    fn key(&self) -> &K {
        self.0.borrow()
    }

    fn value(&self) -> Option<&V> {
        None
    }
}

/// Owned key and optional value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry<K, V> {
    pub key: K,
    pub value: Option<V>,
}

impl<K, V> TableEntry<K, V> for StoredEntry<K, V> {
    fn key(&self) -> &K {
        &self.key
    }

    fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }
}

/// Builds a table directory from a stream of entries.
///
/// Construction hashes every key once to build the minimal perfect hash,
/// then streams the entries into temporary shards, each covering a
/// contiguous range of buckets, and finally rewrites the shards in bucket
/// order into `data.bin`. Only two integers per entry are kept outside the
/// shards, in memory-mapped temporary files, so tables larger than memory can
/// be built. Offsets or the select bit vector are derived from the recorded
/// entry sizes, and `meta.bin` is written last.
///
/// The entry source is iterated several times; use
/// [`write_with_temp_storage`](Self::write_with_temp_storage) for one-shot
/// iterators.
///
/// # Examples
///
/// ```
/// use mphtable::{LongCodec, TableConfig, TableReader, TableWriter};
///
/// # fn main() -> std::io::Result<()> {
/// let dir = tempfile::tempdir()?;
/// let config = TableConfig::new()
///     .with_key_codec(LongCodec)
///     .with_value_codec(LongCodec);
/// let info = TableWriter::new(config).write(dir.path(), (0..20).map(|i| (i, i * i)))?;
/// assert_eq!(info.entry_count, 20);
///
/// let reader = TableReader::<LongCodec, LongCodec>::open(dir.path())?;
/// assert_eq!(reader.get(&7)?, Some(49));
/// assert_eq!(reader.get(&21)?, None);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct TableWriter<KC, VC = UnitCodec> {
    config: TableConfig<KC, VC>,
    data_size: Option<u64>,
    writer_buffer_size: usize,
}

impl<KC, VC> TableWriter<KC, VC>
where
    KC: Codec,
    VC: Codec,
    KC::Item: Ord + Clone + Debug,
    VC::Item: Debug,
{
    pub fn new(config: TableConfig<KC, VC>) -> Self {
        Self {
            config,
            data_size: None,
            writer_buffer_size: 16 << 20, // 16 MiB
        }
    }

    /// Declares the total serialized size of the entries, skipping the size
    /// computation. Construction fails if the entries turn out to differ.
    pub fn with_data_size(mut self, data_size: u64) -> Self {
        self.data_size = Some(data_size);
        self
    }

    /// Adjusts the capacity of the buffered writers used for output files.
    pub fn with_writer_buffer_size(mut self, size: usize) -> Self {
        self.writer_buffer_size = size;
        self
    }

    /// Writes a table to `dir` from a re-iterable collection of entries.
    ///
    /// # Errors
    ///
    /// Returns `ErrorKind::InvalidInput` for an invalid configuration,
    /// entries without a value when a value codec is configured, or duplicate
    /// keys; IO errors are forwarded.
    pub fn write<I>(self, dir: impl AsRef<Path>, entries: I) -> Result<TableInfo>
    where
        I: IntoIterator + Clone,
        I::Item: TableEntry<KC::Item, VC::Item>,
    {
        self.write_from(dir.as_ref(), || {
            entries.clone().into_iter().map(Ok::<_, Error>)
        })
    }

    /// Writes a valueless table to `dir` from a re-iterable collection of
    /// keys.
    pub fn write_keys<I>(self, dir: impl AsRef<Path>, keys: I) -> Result<TableInfo>
    where
        I: IntoIterator + Clone,
        I::Item: Borrow<KC::Item>,
    {
        self.write_from(dir.as_ref(), || {
            keys.clone().into_iter().map(|key| Ok::<_, Error>(KeyOnly(key)))
        })
    }

    /// Writes a table from a one-shot iterator by first spooling the encoded
    /// entries to a temporary file in `temp_dir`.
    pub fn write_with_temp_storage<I>(
        self,
        dir: impl AsRef<Path>,
        entries: I,
        temp_dir: impl AsRef<Path>,
    ) -> Result<TableInfo>
    where
        I: IntoIterator,
        I::Item: TableEntry<KC::Item, VC::Item>,
    {
        self.config.validate()?;
        let key_codec = self.config.require_key_codec()?;

        let spool = tempfile::Builder::new()
            .prefix("tmp_entries")
            .suffix(".bin")
            .tempfile_in(temp_dir)?;
        let mut out = BufWriter::with_capacity(self.writer_buffer_size, spool.as_file());
        let mut data_size = 0;
        let mut count = 0u64;
        for entry in entries {
            let (key, value) = (entry.key(), entry.value());
            check_value(&self.config, value)?;
            key_codec.write(key, &mut out)?;
            if let (Some(codec), Some(value)) = (self.config.value_codec(), value) {
                codec.write(value, &mut out)?;
            }
            data_size += self.config.size_of(key, value)?;
            count += 1;
        }
        out.flush()?;
        drop(out);
        debug!(entries = count, data_size, "spooled entries to temporary storage");

        let spooled = Memory::map(spool.path())?;
        let config = self.config.clone();
        let (config, input) = (&config, &spooled[..]);
        self.with_data_size(data_size)
            .write_from(dir.as_ref(), move || SpooledEntries { config, input })
    }

    fn write_from<E, It, F>(self, dir: &Path, source: F) -> Result<TableInfo>
    where
        F: Fn() -> It,
        It: Iterator<Item = Result<E>>,
        E: TableEntry<KC::Item, VC::Item>,
    {
        let started = Instant::now();
        self.config.validate()?;

        let track_range = self.config.tracks_key_range();
        let mut fingerprints = Vec::new();
        let mut key_range: Option<(KC::Item, KC::Item)> = None;
        let mut key_bytes = Vec::new();
        let mut computed_size = 0;
        for entry in source() {
            let entry = entry?;
            let (key, value) = (entry.key(), entry.value());
            check_value(&self.config, value)?;
            self.config.write_hash_key(key, &mut key_bytes)?;
            fingerprints.push(mph::fingerprint(&key_bytes));
            if self.data_size.is_none() {
                computed_size += self.config.size_of(key, value)?;
            }
            if track_range {
                key_range = Some(match key_range.take() {
                    Some((min, max)) => (
                        if *key < min { key.clone() } else { min },
                        if *key > max { key.clone() } else { max },
                    ),
                    None => (key.clone(), key.clone()),
                });
            }
        }
        let num_entries = fingerprints.len() as u64;
        let data_size = self.data_size.unwrap_or(computed_size);
        info!(entries = num_entries, data_size, "hashing table keys");

        let mph = match Mphf::build(fingerprints, self.config.signature_width()) {
            Ok(mph) => mph,
            Err(MphError::DuplicateKey { fingerprint }) if self.config.debug_duplicate_keys() => {
                return Err(describe_duplicate(&self.config, &source, fingerprint)?);
            }
            Err(e) => return Err(e.into()),
        };
        let paths = prepare_output_dir(dir)?;

        let storage = match self.config.offset_storage() {
            OffsetStorage::Automatic => self
                .config
                .choose_best_offset_storage(num_entries, data_size),
            storage => storage,
        };
        let config = self.config.clone().with_offset_storage(storage);
        info!(?storage, "resolved offset storage");

        let sizes = self.write_in_hash_order(&config, &mph, &paths, &source, data_size)?;

        let select = match storage {
            OffsetStorage::Indexed => {
                self.write_indexed_offsets(&config, &sizes, num_entries, data_size, &paths.offsets)?;
                None
            }
            OffsetStorage::Selected => {
                self.build_select(&config, &sizes, num_entries, data_size, &paths.offsets)?
            }
            _ => None,
        };

        let key_range = match key_range {
            Some((min, max)) => {
                let codec = config.require_key_codec()?;
                let (mut min_bytes, mut max_bytes) = (Vec::new(), Vec::new());
                codec.write(&min, &mut min_bytes)?;
                codec.write(&max, &mut max_bytes)?;
                Some((min_bytes, max_bytes))
            }
            None => None,
        };

        let meta = TableMeta::new(config, mph, select, data_size, key_range, paths);
        meta.store()?;
        let info = meta.info();
        info!(
            entries = info.entry_count,
            size_in_bytes = info.size_in_bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "wrote table"
        );
        Ok(info)
    }

    /// Splits the entries into temporary shards by bucket range and rewrites
    /// them into `data.bin` in bucket order. Returns the size of each entry,
    /// indexed by bucket.
    fn write_in_hash_order<E, It, F>(
        &self,
        config: &TableConfig<KC, VC>,
        mph: &Mphf,
        paths: &TablePaths,
        source: &F,
        data_size: u64,
    ) -> Result<TempArray>
    where
        F: Fn() -> It,
        It: Iterator<Item = Result<E>>,
        E: TableEntry<KC::Item, VC::Item>,
    {
        let dir = paths.data.parent().unwrap_or(Path::new("."));
        let num_entries = mph.len();
        let base_shards = MAX_TEMP_SHARDS.min(1 + data_size / config.temp_shard_size().max(1));
        let shard_size = num_entries.div_ceil(base_shards).max(1);
        let num_shards = num_entries.div_ceil(shard_size).max(1);
        info!(
            data_size,
            num_shards, shard_size, "splitting entries into temporary shards"
        );

        let started = Instant::now();
        let mut sizes = TempArray::new(num_entries, dir)?;
        let mut positions = TempArray::new(num_entries, dir)?;
        let mut counts = vec![0u64; num_shards as usize];
        let mut shards = (0..num_shards)
            .map(|_| {
                tempfile::Builder::new()
                    .prefix("tmpshard_")
                    .suffix(".bin")
                    .tempfile_in(dir)
                    .map(BufWriter::new)
            })
            .collect::<Result<Vec<_>>>()?;

        let equation = config.entry_size_equation();
        let check_sizes = config.offset_storage() != OffsetStorage::Indexed;
        let mut seen = BitVector::new(num_entries);
        let mut key_bytes = Vec::new();
        let mut entry_bytes = Vec::new();
        let mut written = 0u64;
        let mut total_size = 0u64;
        for entry in source() {
            let entry = entry?;
            let (key, value) = (entry.key(), entry.value());
            check_value(config, value)?;
            config.write_hash_key(key, &mut key_bytes)?;
            let hash = match mph.get(&key_bytes) {
                Some(hash) if !seen.get(hash) => hash,
                _ => {
                    return Err(Error::new(
                        ErrorKind::InvalidInput,
                        format!("Key {:?} maps to a bucket that is already assigned", key),
                    ))
                }
            };
            seen.set(hash);

            entry_bytes.clear();
            config.write_entry(key, value, &mut entry_bytes)?;
            let size = entry_bytes.len() as u64;
            if check_sizes && !equation.admits(size as i64) {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    format!(
                        "Entry of {} bytes does not fit the entry size equation {}",
                        size, equation
                    ),
                ));
            }
            let size = u32::try_from(size).map_err(|_| {
                Error::new(
                    ErrorKind::InvalidInput,
                    format!("Entry of {} bytes is too large", size),
                )
            })?;

            let shard = hash / shard_size;
            let shard_start = shard * shard_size;
            sizes.set(hash, size);
            positions.set(shard_start + counts[shard as usize], (hash - shard_start) as u32);
            counts[shard as usize] += 1;
            shards[shard as usize].write_all(&entry_bytes)?;
            written += 1;
            total_size += size as u64;
        }
        if written != num_entries {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "Entries changed between passes: hashed {}, wrote {}",
                    num_entries, written
                ),
            ));
        }
        if total_size != data_size {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "Declared data size {} does not match serialized size {}",
                    data_size, total_size
                ),
            ));
        }
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "split entries into {} shards", num_shards
        );

        let started = Instant::now();
        let mut data = BufWriter::with_capacity(self.writer_buffer_size, File::create(&paths.data)?);
        for (index, shard) in shards.into_iter().enumerate() {
            let shard = shard.into_inner().map_err(|e| e.into_error())?;
            let start = index as u64 * shard_size;
            let end = (start + shard_size).min(num_entries);
            if start >= end {
                continue;
            }
            let bytes = Memory::map(shard.path())?;

            let mut sources = vec![0u64; (end - start) as usize];
            let mut offset = 0u64;
            for position in start..end {
                let local = positions.get(position) as u64;
                sources[local as usize] = offset;
                offset += sizes.get(start + local) as u64;
            }
            for (local, &source_offset) in sources.iter().enumerate() {
                let from = source_offset as usize;
                let to = from + sizes.get(start + local as u64) as usize;
                let entry = bytes.get(from..to).ok_or_else(|| {
                    Error::new(ErrorKind::InvalidData, "Temporary shard is truncated")
                })?;
                data.write_all(entry)?;
            }
        }
        data.flush()?;
        drop(data);
        set_read_only(&paths.data)?;
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "rewrote shards in bucket order"
        );
        Ok(sizes)
    }

    fn write_indexed_offsets(
        &self,
        config: &TableConfig<KC, VC>,
        sizes: &TempArray,
        num_entries: u64,
        data_size: u64,
        path: &Path,
    ) -> Result<()> {
        let width = config.bytes_per_offset(data_size) as usize;
        let mut out = BufWriter::with_capacity(self.writer_buffer_size, File::create(path)?);
        let mut offset = 0u64;
        for hash in 0..num_entries {
            out.write_all(&offset.to_le_bytes()[..width])?;
            offset += sizes.get(hash) as u64;
        }
        out.flush()?;
        drop(out);
        set_read_only(path)?;
        info!(entries = num_entries, width, "wrote indexed offsets");
        Ok(())
    }

    /// Sets one bit per bucket at its compressed offset. The bit vector is
    /// embedded in the metadata unless it exceeds the heap budget, in which
    /// case its words go to `offsets.bin`.
    fn build_select(
        &self,
        config: &TableConfig<KC, VC>,
        sizes: &TempArray,
        num_entries: u64,
        data_size: u64,
        path: &Path,
    ) -> Result<Option<BitSelect>> {
        let num_bits = config.compress_offset(data_size, num_entries);
        let mut bits = BitVector::new(num_bits);
        let mut offset = 0u64;
        for hash in 0..num_entries {
            bits.set(config.compress_offset(offset, hash));
            offset += sizes.get(hash) as u64;
        }

        if config.max_heap_usage() > 0 && num_bits / 8 > config.max_heap_usage() {
            let mut out = BufWriter::with_capacity(self.writer_buffer_size, File::create(path)?);
            for word in bits.words() {
                out.write_all(&word.to_le_bytes())?;
            }
            out.flush()?;
            drop(out);
            set_read_only(path)?;
            info!(num_bits, "wrote select bits to offsets file");
            Ok(None)
        } else {
            info!(num_bits, "embedding select bits in metadata");
            Ok(Some(BitSelect::from_bits(bits)))
        }
    }
}

fn check_value<KC: Codec, VC: Codec>(
    config: &TableConfig<KC, VC>,
    value: Option<&VC::Item>,
) -> Result<()> {
    if config.has_values() && value.is_none() {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            "Can't store an entry without a value in a table with a value codec",
        ));
    }
    Ok(())
}

/// Creates `dir` if needed and removes the files of a previous table,
/// metadata first.
fn prepare_output_dir(dir: &Path) -> Result<TablePaths> {
    if dir.exists() && !dir.is_dir() {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            format!("Output path {} is not a directory", dir.display()),
        ));
    }
    fs::create_dir_all(dir)?;
    let paths = TablePaths::in_dir(dir);
    for path in [&paths.meta, &paths.data, &paths.offsets] {
        match fs::remove_file(path) {
            Err(e) if e.kind() != ErrorKind::NotFound => return Err(e),
            _ => {}
        }
    }
    Ok(paths)
}

fn describe_duplicate<KC, VC, E, It, F>(
    config: &TableConfig<KC, VC>,
    source: &F,
    fingerprint: u128,
) -> Result<Error>
where
    KC: Codec,
    VC: Codec,
    KC::Item: Debug,
    VC::Item: Debug,
    F: Fn() -> It,
    It: Iterator<Item = Result<E>>,
    E: TableEntry<KC::Item, VC::Item>,
{
    let mut found = Vec::with_capacity(2);
    let mut key_bytes = Vec::new();
    for entry in source() {
        let entry = entry?;
        config.write_hash_key(entry.key(), &mut key_bytes)?;
        if mph::fingerprint(&key_bytes) != fingerprint {
            continue;
        }
        found.push(match entry.value() {
            Some(value) => format!("{:?} ({:?})", entry.key(), value),
            None => format!("{:?}", entry.key()),
        });
        if found.len() == 2 {
            break;
        }
    }
    Ok(Error::new(
        ErrorKind::InvalidInput,
        format!("duplicate key: {}", found.join(" == ")),
    ))
}

/// Decodes entries spooled by
/// [`TableWriter::write_with_temp_storage`].
struct SpooledEntries<'a, KC, VC> {
    config: &'a TableConfig<KC, VC>,
    input: &'a [u8],
}

impl<KC: Codec, VC: Codec> Iterator for SpooledEntries<'_, KC, VC> {
    type Item = Result<StoredEntry<KC::Item, VC::Item>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.input.is_empty() {
            return None;
        }
        let entry = self.config.require_key_codec().and_then(|codec| {
            let key = codec.read(&mut self.input)?;
            let value = self.config.read_value(&mut self.input)?;
            Ok(StoredEntry { key, value })
        });
        if entry.is_err() {
            self.input = &[];
        }
        Some(entry)
    }
}

/// Array of `u32` kept in a memory-mapped temporary file.
struct TempArray {
    map: MmapMut,
    _file: File,
}

impl TempArray {
    fn new(len: u64, dir: &Path) -> Result<Self> {
        let file = tempfile::tempfile_in(dir)?;
        file.set_len(len.max(1) * 4)?;
        // SAFETY: the file is anonymous and only reachable through this map.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { map, _file: file })
    }

    fn get(&self, index: u64) -> u32 {
        let start = index as usize * 4;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.map[start..start + 4]);
        u32::from_le_bytes(buf)
    }

    fn set(&mut self, index: u64, value: u32) {
        let start = index as usize * 4;
        self.map[start..start + 4].copy_from_slice(&value.to_le_bytes());
    }
}
