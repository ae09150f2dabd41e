use std::fmt;
use std::fs;
use std::io::{Error, ErrorKind, Result};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::{
    BitSelect, Codec, Fingerprinter, KeyStorage, Memory, Mphf, OffsetStorage, SizeEquation,
    TableConfig, UnitCodec, MAGIC_NUMBER,
};

/// Name of the metadata file inside a table directory.
pub const META_FILE: &str = "meta.bin";
/// Name of the file holding the serialized entries.
pub const DATA_FILE: &str = "data.bin";
/// Name of the optional file holding raw offsets or select words.
pub const OFFSETS_FILE: &str = "offsets.bin";
/// Version of the metadata layout written by this crate.
pub const FORMAT_VERSION: u32 = 1;

const HEADER_SIZE: usize = 12;

/// Locations of the three files making up a table.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TablePaths {
    /// `meta.bin`.
    pub meta: PathBuf,
    /// `offsets.bin`, possibly absent.
    pub offsets: PathBuf,
    /// `data.bin`.
    pub data: PathBuf,
}

impl TablePaths {
    /// Default file locations inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            meta: dir.join(META_FILE),
            offsets: dir.join(OFFSETS_FILE),
            data: dir.join(DATA_FILE),
        }
    }
}

/// Descriptor of a built table, persisted as `meta.bin`.
///
/// Holds the configuration used at construction time (with the offset
/// storage resolved), the perfect hash over the keys, the optional embedded
/// select structure and the size of the data file. Every offset computation
/// is a pure function of this state.
#[derive(Serialize, Deserialize, Debug)]
pub struct TableMeta<KC, VC = UnitCodec> {
    version: u32,
    config: TableConfig<KC, VC>,
    mph: Mphf,
    select: Option<BitSelect>,
    data_size: u64,
    bytes_per_offset: u32,
    timestamp: u64,
    min_key: Option<Vec<u8>>,
    max_key: Option<Vec<u8>>,
    #[serde(skip)]
    paths: TablePaths,
}

impl<KC: Codec, VC: Codec> TableMeta<KC, VC> {
    pub(crate) fn new(
        config: TableConfig<KC, VC>,
        mph: Mphf,
        select: Option<BitSelect>,
        data_size: u64,
        key_range: Option<(Vec<u8>, Vec<u8>)>,
        paths: TablePaths,
    ) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let (min_key, max_key) = key_range.unzip();
        Self {
            version: FORMAT_VERSION,
            bytes_per_offset: config.bytes_per_offset(data_size),
            config,
            mph,
            select,
            data_size,
            timestamp,
            min_key,
            max_key,
            paths,
        }
    }

    /// Loads metadata from a table directory or a `meta.bin` path, with the
    /// data and offsets files expected next to it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_with(path, None, None)
    }

    /// Loads metadata, optionally overriding the offsets and data locations.
    ///
    /// # Errors
    ///
    /// Returns `ErrorKind::InvalidData` when the magic number or version does
    /// not match, or when the payload cannot be deserialized.
    pub fn load_with(
        path: impl AsRef<Path>,
        offsets: Option<&Path>,
        data: Option<&Path>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let mut paths = if path.is_dir() {
            TablePaths::in_dir(path)
        } else {
            let mut paths = TablePaths::in_dir(path.parent().unwrap_or(Path::new(".")));
            paths.meta = path.to_path_buf();
            paths
        };
        if let Some(offsets) = offsets {
            paths.offsets = offsets.to_path_buf();
        }
        if let Some(data) = data {
            paths.data = data.to_path_buf();
        }

        let bytes = fs::read(&paths.meta)?;
        Self::from_bytes(&bytes, paths)
    }

    /// Decodes a metadata image produced by [`to_bytes`](Self::to_bytes).
    pub(crate) fn from_bytes(bytes: &[u8], paths: TablePaths) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("Metadata file is truncated: {} bytes", bytes.len()),
            ));
        }
        let (header, payload) = bytes.split_at(HEADER_SIZE);
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&header[..8]);
        let magic_number = u64::from_be_bytes(magic);
        if magic_number != MAGIC_NUMBER {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("Invalid magic number: {:#018x}", magic_number),
            ));
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&header[8..]);
        let version = u32::from_be_bytes(version);
        if version != FORMAT_VERSION {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("Unsupported table version: {}", version),
            ));
        }

        let mut meta: Self = rmp_serde::from_slice(payload).map_err(|e| {
            Error::new(
                ErrorKind::InvalidData,
                format!("Failed to deserialize TableMeta: {}", e),
            )
        })?;
        if meta.config.offset_storage() == OffsetStorage::Automatic {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "Table metadata has no resolved offset storage",
            ));
        }
        meta.paths = paths;
        Ok(meta)
    }

    /// Header followed by the MessagePack encoding of the metadata.
    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE);
        bytes.extend_from_slice(&MAGIC_NUMBER.to_be_bytes());
        bytes.extend_from_slice(&self.version.to_be_bytes());
        rmp_serde::encode::write_named(&mut bytes, self)
            .map_err(|e| Error::other(format!("Fail to serialize meta: {}", e)))?;
        Ok(bytes)
    }

    /// Writes `meta.bin` to its configured path and marks it read-only.
    ///
    /// The file is written under a temporary name first, so a table
    /// directory only ever contains a complete metadata file.
    pub fn store(&self) -> Result<()> {
        let bytes = self.to_bytes()?;
        let mut staging = self.paths.meta.clone().into_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);
        fs::write(&staging, &bytes)?;
        fs::rename(&staging, &self.paths.meta)?;
        set_read_only(&self.paths.meta)
    }

    /// Configuration the table was built with, offset storage resolved.
    pub fn config(&self) -> &TableConfig<KC, VC> {
        &self.config
    }

    /// Perfect hash over the keys.
    pub fn mph(&self) -> &Mphf {
        &self.mph
    }

    /// Select structure embedded in the metadata, if any.
    pub fn select(&self) -> Option<&BitSelect> {
        self.select.as_ref()
    }

    /// Number of entries, the size of the perfect hash.
    pub fn num_entries(&self) -> u64 {
        self.mph.len()
    }

    /// Size in bytes of the data file.
    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    /// Width of each entry in `offsets.bin` for indexed tables.
    pub fn bytes_per_offset(&self) -> u32 {
        self.bytes_per_offset
    }

    /// Construction time in milliseconds since the Unix epoch.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Metadata format version.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Where the table files are read from.
    pub fn paths(&self) -> &TablePaths {
        &self.paths
    }

    /// Whether the table needs `offsets.bin` to resolve offsets.
    pub fn has_offsets_file(&self) -> bool {
        match self.config.offset_storage() {
            OffsetStorage::Indexed => true,
            OffsetStorage::Selected => self.select.is_none(),
            _ => false,
        }
    }

    /// Smallest and largest keys, when range checking was enabled.
    pub fn key_range(&self) -> Result<Option<(KC::Item, KC::Item)>> {
        let (Some(min), Some(max)) = (&self.min_key, &self.max_key) else {
            return Ok(None);
        };
        let codec = self.config.require_key_codec()?;
        Ok(Some((codec.read(&mut min.as_slice())?, codec.read(&mut max.as_slice())?)))
    }

    /// Bucket of `key`, or `None` when the perfect hash rejects it.
    pub fn hash(&self, key: &KC::Item) -> Result<Option<u64>> {
        let mut fingerprinter = Fingerprinter::new();
        self.config.require_key_codec()?.write(key, &mut fingerprinter)?;
        Ok(self.mph.get_fingerprint(fingerprinter.finish()))
    }

    /// Byte offset in the data file of the entry in bucket `hash`.
    ///
    /// `offsets` is the content of `offsets.bin` for indexed tables; `select`
    /// overrides the embedded select structure for selected tables whose
    /// bit vector lives in `offsets.bin`.
    pub fn hash_offset(
        &self,
        hash: u64,
        offsets: Option<&Memory>,
        select: Option<&BitSelect>,
    ) -> Result<u64> {
        match self.config.offset_storage() {
            OffsetStorage::Indexed => {
                let offsets = offsets.ok_or_else(|| {
                    Error::new(ErrorKind::InvalidInput, "indexed table requires offsets")
                })?;
                let width = self.bytes_per_offset as usize;
                offsets
                    .read_uint_le(hash as usize * width, width)
                    .ok_or_else(|| {
                        Error::new(
                            ErrorKind::InvalidData,
                            format!("Offsets file is truncated at bucket {}", hash),
                        )
                    })
            }
            OffsetStorage::Selected => {
                let select = select
                    .or(self.select.as_ref())
                    .ok_or_else(|| {
                        Error::new(
                            ErrorKind::InvalidInput,
                            "selected table requires a select structure",
                        )
                    })?;
                let selected = select.select(hash).unwrap_or(0);
                Ok(self.config.decompress_offset(selected, hash))
            }
            OffsetStorage::Fixed => Ok(self.config.decompress_offset(0, hash)),
            OffsetStorage::Automatic => Err(Error::new(
                ErrorKind::InvalidData,
                "Table metadata has no resolved offset storage",
            )),
        }
    }

    /// Byte offset of the entry for `key`, or `None` when the perfect hash
    /// rejects it.
    pub fn offset(
        &self,
        key: &KC::Item,
        offsets: Option<&Memory>,
        select: Option<&BitSelect>,
    ) -> Result<Option<u64>> {
        match self.hash(key)? {
            Some(hash) => self.hash_offset(hash, offsets, select).map(Some),
            None => Ok(None),
        }
    }

    /// Bytes needed to serve the table: data plus offsets or select bits.
    pub fn size_in_bytes(&self) -> u64 {
        let n = self.num_entries();
        let offsets = match self.config.offset_storage() {
            OffsetStorage::Indexed => self.config.indexed_offsets_size(n, self.data_size),
            OffsetStorage::Selected => self.config.compress_offset(self.data_size, n).div_ceil(8),
            _ => 0,
        };
        self.data_size + offsets
    }

    pub fn info(&self) -> TableInfo {
        TableInfo {
            version: self.version,
            timestamp: self.timestamp,
            entry_count: self.num_entries(),
            data_size: self.data_size,
            size_in_bytes: self.size_in_bytes(),
            key_storage: self.config.key_storage(),
            offset_storage: self.config.offset_storage(),
            entry_size: self.config.entry_size_equation(),
            signature_width: self.mph.signature_width(),
            bytes_per_offset: self.bytes_per_offset,
            mph_size_in_bytes: self.mph.size_in_bytes(),
            select_bits: (self.config.offset_storage() == OffsetStorage::Selected)
                .then(|| self.config.compress_offset(self.data_size, self.num_entries())),
            has_offsets_file: self.has_offsets_file(),
            range_checked: self.min_key.is_some(),
        }
    }
}

/// Summary of a table, returned by [`TableWriter`](crate::TableWriter) and
/// [`TableMeta::info`]. Displays as JSON.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct TableInfo {
    /// Metadata format version.
    pub version: u32,
    /// Construction time in milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Number of entries.
    pub entry_count: u64,
    /// Size in bytes of the data file.
    pub data_size: u64,
    /// Bytes needed to serve the table, data plus offsets or select bits.
    pub size_in_bytes: u64,
    /// Whether keys are stored in the data file.
    pub key_storage: KeyStorage,
    /// Resolved offset storage.
    pub offset_storage: OffsetStorage,
    /// Sizes every serialized entry can take.
    pub entry_size: SizeEquation,
    /// Bits of key signature per entry.
    pub signature_width: u32,
    /// Width of each indexed offset.
    pub bytes_per_offset: u32,
    /// Serialized size of the perfect hash.
    pub mph_size_in_bytes: u64,
    /// Length of the select bit vector, for selected tables.
    pub select_bits: Option<u64>,
    /// Whether the table has an `offsets.bin`.
    pub has_offsets_file: bool,
    /// Whether lookups are checked against the key range.
    pub range_checked: bool,
}

impl fmt::Display for TableInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string_pretty(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

pub(crate) fn set_read_only(path: &Path) -> Result<()> {
    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_readonly(true);
    fs::set_permissions(path, permissions)
}

#[cfg(test)]
mod tests {
    use crate::*;

    fn sample_meta(dir: &std::path::Path) -> TableMeta<LongCodec, VarLongCodec> {
        let config = TableConfig::new()
            .with_key_codec(LongCodec)
            .with_value_codec(VarLongCodec)
            .with_offset_storage(OffsetStorage::Indexed);
        let fingerprints = (0..10i64)
            .map(|i| mph::fingerprint(&i.to_le_bytes()))
            .collect();
        let mph = Mphf::build(fingerprints, 0).unwrap();
        TableMeta::new(
            config,
            mph,
            None,
            90,
            Some((1i64.to_le_bytes().to_vec(), 9i64.to_le_bytes().to_vec())),
            meta::TablePaths::in_dir(dir),
        )
    }

    #[test]
    fn test_store_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let meta = sample_meta(dir.path());
        meta.store().unwrap();

        let path = dir.path().join(META_FILE);
        assert!(std::fs::metadata(&path).unwrap().permissions().readonly());
        assert!(!dir.path().join("meta.bin.tmp").exists());

        let loaded = TableMeta::<LongCodec, VarLongCodec>::load(dir.path()).unwrap();
        assert_eq!(loaded.num_entries(), 10);
        assert_eq!(loaded.data_size(), 90);
        assert_eq!(loaded.bytes_per_offset(), 2);
        assert_eq!(loaded.timestamp(), meta.timestamp());
        assert_eq!(loaded.config(), meta.config());
        assert_eq!(loaded.mph().len(), meta.mph().len());
        assert_eq!(loaded.key_range().unwrap(), Some((1, 9)));
        assert_eq!(loaded.paths(), &meta::TablePaths::in_dir(dir.path()));
        assert!(loaded.has_offsets_file());
        for key in 0..10 {
            assert_eq!(loaded.hash(&key).unwrap(), meta.hash(&key).unwrap());
        }

        let custom = dir.path().join("elsewhere.bin");
        let loaded = TableMeta::<LongCodec, VarLongCodec>::load_with(&path, Some(&custom), None)
            .unwrap();
        assert_eq!(loaded.paths().offsets, custom);
        assert_eq!(loaded.paths().data, dir.path().join(DATA_FILE));

        let info = loaded.info();
        assert_eq!(info.entry_count, 10);
        assert_eq!(info.size_in_bytes, 90 + 20);
        let json: serde_json::Value = serde_json::from_str(&info.to_string()).unwrap();
        assert_eq!(json["offset_storage"], "Indexed");
    }

    #[test]
    fn test_invalid_meta() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(META_FILE);
        TableMeta::<LongCodec>::load(dir.path()).unwrap_err();

        std::fs::write(&path, b"MPHTABLE").unwrap();
        let err = TableMeta::<LongCodec>::load(dir.path()).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);

        std::fs::write(&path, b"NOTATABLE\0\0\0\x01").unwrap();
        TableMeta::<LongCodec>::load(dir.path()).unwrap_err();

        let mut bytes = b"MPHTABLE".to_vec();
        bytes.extend_from_slice(&2u32.to_be_bytes());
        std::fs::write(&path, &bytes).unwrap();
        TableMeta::<LongCodec>::load(dir.path()).unwrap_err();

        let mut bytes = b"MPHTABLE".to_vec();
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(b"invalid data");
        std::fs::write(&path, &bytes).unwrap();
        TableMeta::<LongCodec>::load(dir.path()).unwrap_err();
    }

    #[test]
    fn test_hash_offset() {
        let dir = tempfile::tempdir().unwrap();
        let meta = sample_meta(dir.path());

        let offsets = Memory::from((0..10u16).flat_map(|i| (i * 9).to_le_bytes()).collect::<Vec<_>>());
        for hash in 0..10 {
            assert_eq!(meta.hash_offset(hash, Some(&offsets), None).unwrap(), hash * 9);
        }
        meta.hash_offset(10, Some(&offsets), None).unwrap_err();
        meta.hash_offset(0, None, None).unwrap_err();

        for key in 0..10 {
            let hash = meta.hash(&key).unwrap().unwrap();
            assert_eq!(meta.offset(&key, Some(&offsets), None).unwrap(), Some(hash * 9));
        }
    }
}
