use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::io::{Error, ErrorKind, Read, Result, Write};
use std::path::Path;

use foldhash::fast::FixedState;
use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::{
    Codec, Memory, ReaderOptions, TableConfig, TableEntry, TableIter, TableMeta, TablePaths,
    TableReader, TableStats, TableWriter, UnitCodec,
};

const MAP_MAGIC_NUMBER: u64 = u64::from_be_bytes(*b"MPHMAP!!");
const MAX_SERIALIZED_SIZE: u64 = i32::MAX as u64;

/// Immutable in-heap table with the read API of a map.
///
/// An `MphMap` keeps its data, offsets and metadata in the heap, so it does
/// not depend on any file once loaded. It can be built straight from entries
/// and converted to and from a single byte image, which also backs its serde
/// implementation. All mutating operations fail with
/// `ErrorKind::Unsupported`.
///
/// # Examples
///
/// ```
/// use std::collections::HashMap;
/// use mphtable::{MphMap, StringCodec, TableConfig, VarLongCodec};
///
/// # fn main() -> std::io::Result<()> {
/// let mut source = HashMap::new();
/// source.insert("one".to_string(), 1);
/// source.insert("two".to_string(), 2);
///
/// let config = TableConfig::new()
///     .with_key_codec(StringCodec)
///     .with_value_codec(VarLongCodec);
/// let map = MphMap::from_map(config, &source)?;
/// assert_eq!(map.get(&"two".to_string())?, Some(2));
///
/// let copy = MphMap::<StringCodec, VarLongCodec>::from_bytes(&map.to_bytes()?)?;
/// assert_eq!(copy.len(), 2);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct MphMap<KC: Codec, VC: Codec = UnitCodec> {
    reader: TableReader<KC, VC>,
}

impl<KC, VC> MphMap<KC, VC>
where
    KC: Codec,
    VC: Codec,
    KC::Item: Ord + Clone + fmt::Debug + 'static,
    VC::Item: fmt::Debug + 'static,
{
    /// Loads every file of the table at `path` into the heap.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let options = ReaderOptions::new().with_heap_resident(true);
        Ok(Self {
            reader: TableReader::open_with(path, options)?,
        })
    }

    /// Builds a table from `entries` in a temporary directory and loads it.
    pub fn from_entries<I>(config: TableConfig<KC, VC>, entries: I) -> Result<Self>
    where
        I: IntoIterator,
        I::Item: TableEntry<KC::Item, VC::Item>,
    {
        let dir = tempfile::tempdir()?;
        let table = dir.path().join("table");
        TableWriter::new(config).write_with_temp_storage(&table, entries, dir.path())?;
        Self::load(&table)
    }

    /// Builds a map holding a copy of `map`.
    pub fn from_map<S>(
        config: TableConfig<KC, VC>,
        map: &HashMap<KC::Item, VC::Item, S>,
    ) -> Result<Self>
    where
        KC::Item: Hash,
        VC::Item: Clone,
        S: BuildHasher,
    {
        Self::from_entries(config, map.iter().map(|(k, v)| (k.clone(), v.clone())))
    }

    pub fn len(&self) -> u64 {
        self.reader.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reader.is_empty()
    }

    pub fn get(&self, key: &KC::Item) -> Result<Option<VC::Item>> {
        self.reader.get(key)
    }

    pub fn contains_key(&self, key: &KC::Item) -> Result<bool> {
        self.reader.contains_key(key)
    }

    /// Scans every value. Linear in the size of the map.
    pub fn contains_value(&self, value: &VC::Item) -> Result<bool>
    where
        VC::Item: PartialEq,
    {
        for found in self.values() {
            if found? == *value {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn get_for_hash(&self, hash: u64) -> Result<Option<VC::Item>> {
        self.reader.get_for_hash(hash)
    }

    /// Entries in bucket order. Fails under implicit key storage.
    pub fn iter(&self) -> Result<TableIter<'_, KC, VC>> {
        self.reader.iter()
    }

    pub fn keys(&self) -> Result<impl Iterator<Item = Result<KC::Item>> + '_> {
        self.reader.keys()
    }

    /// Values in bucket order.
    pub fn values(&self) -> impl Iterator<Item = Result<VC::Item>> + '_ {
        (0..self.len()).filter_map(|hash| self.reader.get_for_hash(hash).transpose())
    }

    /// Collects the keys into a set.
    pub fn key_set(&self) -> Result<HashSet<KC::Item, FixedState>>
    where
        KC::Item: Hash,
    {
        let mut set = HashSet::with_capacity_and_hasher(self.len() as usize, FixedState::default());
        for key in self.keys()? {
            set.insert(key?);
        }
        Ok(set)
    }

    pub fn stats(&self) -> TableStats {
        self.reader.stats()
    }

    pub fn config(&self) -> &TableConfig<KC, VC> {
        self.reader.config()
    }

    pub fn put(&self, _key: KC::Item, _value: VC::Item) -> Result<Option<VC::Item>> {
        Err(immutable())
    }

    pub fn put_all<I: IntoIterator<Item = (KC::Item, VC::Item)>>(&self, _entries: I) -> Result<()> {
        Err(immutable())
    }

    pub fn remove(&self, _key: &KC::Item) -> Result<Option<VC::Item>> {
        Err(immutable())
    }

    pub fn clear(&self) -> Result<()> {
        Err(immutable())
    }

    /// Serializes the metadata, data and offsets into one image.
    ///
    /// The image starts with a magic number and the three section lengths,
    /// all big-endian `u64`, followed by the sections themselves.
    ///
    /// # Errors
    ///
    /// Returns `ErrorKind::InvalidInput` when the image would exceed
    /// `i32::MAX` bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.write_to(&mut bytes)?;
        Ok(bytes)
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        let (meta, storage) = self.reader.meta_and_storage()?;
        let meta = meta.to_bytes()?;
        let offsets = storage.offsets_bytes();
        let sections = [&meta[..], &storage.data[..], &offsets[..]];

        let total: u64 = sections.iter().map(|s| s.len() as u64).sum();
        if total > MAX_SERIALIZED_SIZE {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("MphMap of {} bytes is too large to serialize", total),
            ));
        }
        out.write_all(&MAP_MAGIC_NUMBER.to_be_bytes())?;
        for section in sections {
            out.write_all(&(section.len() as u64).to_be_bytes())?;
        }
        for section in sections {
            out.write_all(section)?;
        }
        debug!(bytes = total, "serialized MphMap");
        Ok(())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::read_from(&mut &bytes[..])
    }

    pub fn read_from<R: Read>(input: &mut R) -> Result<Self> {
        let mut header = [0u8; 32];
        input.read_exact(&mut header)?;
        let field = |index: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&header[index * 8..index * 8 + 8]);
            u64::from_be_bytes(buf)
        };
        if field(0) != MAP_MAGIC_NUMBER {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("Invalid magic number: {:#018x}", field(0)),
            ));
        }
        let lengths = [field(1), field(2), field(3)];
        let total = lengths.iter().try_fold(0u64, |sum, &len| sum.checked_add(len));
        if total.map_or(true, |total| total > MAX_SERIALIZED_SIZE) {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "MphMap image exceeds the maximum serialized size",
            ));
        }
        let mut sections = lengths.map(|len| vec![0u8; len as usize]);
        for section in sections.iter_mut() {
            input.read_exact(section)?;
        }
        let [meta, data, offsets] = sections;

        let meta = TableMeta::<KC, VC>::from_bytes(&meta, TablePaths::default())?;
        let offsets = meta.has_offsets_file().then(|| Memory::from(offsets));
        Ok(Self {
            reader: TableReader::assemble(meta, Memory::from(data), offsets, None)?,
        })
    }
}

fn immutable() -> Error {
    Error::new(ErrorKind::Unsupported, "MphMaps are immutable")
}

impl<KC, VC> Serialize for MphMap<KC, VC>
where
    KC: Codec,
    VC: Codec,
    KC::Item: Ord + Clone + fmt::Debug + 'static,
    VC::Item: fmt::Debug + 'static,
{
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let bytes = self.to_bytes().map_err(serde::ser::Error::custom)?;
        serializer.serialize_bytes(&bytes)
    }
}

impl<'de, KC, VC> Deserialize<'de> for MphMap<KC, VC>
where
    KC: Codec,
    VC: Codec,
    KC::Item: Ord + Clone + fmt::Debug + 'static,
    VC::Item: fmt::Debug + 'static,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let bytes = deserializer.deserialize_bytes(BytesVisitor)?;
        Self::from_bytes(&bytes).map_err(de::Error::custom)
    }
}

pub(crate) struct BytesVisitor;

impl<'de> Visitor<'de> for BytesVisitor {
    type Value = Vec<u8>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a byte array")
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<Vec<u8>, E> {
        Ok(v.to_vec())
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> std::result::Result<Vec<u8>, E> {
        Ok(v)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Vec<u8>, A::Error> {
        let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(byte) = seq.next_element()? {
            bytes.push(byte);
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::ErrorKind;

    use crate::*;

    fn sample() -> HashMap<String, i64> {
        (0..500).map(|i| (format!("k{}", i), i * 3 - 700)).collect()
    }

    fn string_config() -> TableConfig<StringCodec, VarLongCodec> {
        TableConfig::new()
            .with_key_codec(StringCodec)
            .with_value_codec(VarLongCodec)
    }

    #[test]
    fn test_container() {
        let source = sample();
        let map = MphMap::from_map(string_config(), &source).unwrap();
        assert_eq!(map.len(), 500);
        assert!(!map.is_empty());
        for (key, value) in &source {
            assert_eq!(map.get(key).unwrap(), Some(*value));
            assert!(map.contains_key(key).unwrap());
        }
        assert!(!map.contains_key(&"k500".to_string()).unwrap());
        assert!(map.contains_value(&-700).unwrap());
        assert!(!map.contains_value(&-701).unwrap());

        let keys = map.key_set().unwrap();
        assert_eq!(keys.len(), 500);
        assert!(source.keys().all(|key| keys.contains(key)));

        let mut values: Vec<i64> = map.values().map(|v| v.unwrap()).collect();
        values.sort();
        let mut expected: Vec<i64> = source.values().copied().collect();
        expected.sort();
        assert_eq!(values, expected);

        let entries: HashMap<String, i64> = map
            .iter()
            .unwrap()
            .map(|entry| {
                let (key, value) = entry.unwrap();
                (key, value.unwrap())
            })
            .collect();
        assert_eq!(entries, source);
        assert!(map.stats().retrieved >= 500);
    }

    #[test]
    fn test_immutable() {
        let map = MphMap::from_map(string_config(), &sample()).unwrap();
        for err in [
            map.put("x".to_string(), 1).unwrap_err(),
            map.remove(&"k1".to_string()).unwrap_err(),
        ] {
            assert_eq!(err.kind(), ErrorKind::Unsupported);
            assert_eq!(err.to_string(), "MphMaps are immutable");
        }
        assert_eq!(map.clear().unwrap_err().kind(), ErrorKind::Unsupported);
        assert_eq!(
            map.put_all([("y".to_string(), 2)]).unwrap_err().kind(),
            ErrorKind::Unsupported
        );
        assert_eq!(map.get(&"k1".to_string()).unwrap(), Some(-697));
    }

    #[test]
    fn test_byte_image() {
        let source = sample();
        for storage in [OffsetStorage::Indexed, OffsetStorage::Selected] {
            let config = string_config().with_offset_storage(storage);
            let map = MphMap::from_map(config.clone(), &source).unwrap();
            let bytes = map.to_bytes().unwrap();
            let copy = MphMap::<StringCodec, VarLongCodec>::from_bytes(&bytes).unwrap();
            assert_eq!(copy.config(), map.config());
            for (key, value) in &source {
                assert_eq!(copy.get(key).unwrap(), Some(*value));
            }

            let mut cursor = std::io::Cursor::new(Vec::new());
            map.write_to(&mut cursor).unwrap();
            cursor.set_position(0);
            let copy = MphMap::<StringCodec, VarLongCodec>::read_from(&mut cursor).unwrap();
            assert_eq!(copy.len(), 500);

            let encoded = rmp_serde::to_vec(&map).unwrap();
            let decoded: MphMap<StringCodec, VarLongCodec> = rmp_serde::from_slice(&encoded).unwrap();
            assert_eq!(decoded.get(&"k42".to_string()).unwrap(), Some(42 * 3 - 700));
        }

        let err = MphMap::<StringCodec, VarLongCodec>::from_bytes(b"not an image at all, really not!")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_load_and_entries() {
        let dir = tempfile::tempdir().unwrap();
        let config = TableConfig::new()
            .with_key_codec(LongCodec)
            .with_value_codec(LongCodec)
            .with_max_heap_usage(1)
            .with_offset_storage(OffsetStorage::Selected);
        let entries: Vec<(i64, i64)> = (0..1000).map(|i| (i, -i)).collect();
        TableWriter::new(config.clone())
            .write(dir.path(), &entries)
            .unwrap();

        let map = MphMap::<LongCodec, LongCodec>::load(dir.path()).unwrap();
        drop(dir);
        for (key, value) in &entries {
            assert_eq!(map.get(key).unwrap(), Some(*value));
        }

        let copy = MphMap::<LongCodec, LongCodec>::from_bytes(&map.to_bytes().unwrap()).unwrap();
        assert_eq!(copy.get(&999).unwrap(), Some(-999));

        let map = MphMap::from_entries(config, entries.into_iter()).unwrap();
        assert_eq!(map.len(), 1000);
        assert_eq!(map.get(&1000).unwrap(), None);
    }
}
