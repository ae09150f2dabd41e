//! Immutable key-value tables indexed by a minimal perfect hash.
//!
//! The `mphtable` crate builds read-only tables from a stream of entries and
//! serves lookups from the heap or from memory-mapped files. A table is a
//! directory holding `meta.bin` (configuration, perfect hash and offset
//! index), `data.bin` (serialized entries in hash order) and, depending on
//! the offset storage, `offsets.bin`. Keys and values are serialized with
//! pluggable [`Codec`]s whose size equations drive the choice between fixed,
//! indexed and select-compressed offsets.
//!
//! Typical usage builds a table with [`TableWriter`] and opens it with
//! [`TableReader`], [`SharedTableReader`] or, for small tables held fully in
//! memory, [`MphMap`].
//!
//! ```
//! use mphtable::{LongCodec, StringCodec, TableConfig, TableReader, TableWriter};
//!
//! # fn main() -> std::io::Result<()> {
//! let dir = tempfile::tempdir()?;
//! let config = TableConfig::new()
//!     .with_key_codec(StringCodec)
//!     .with_value_codec(LongCodec);
//! let entries = [
//!     ("apple".to_string(), 1i64),
//!     ("banana".to_string(), 2i64),
//! ];
//! let info = TableWriter::new(config).write(dir.path(), &entries)?;
//! println!("{}", info);
//!
//! let table = TableReader::<StringCodec, LongCodec>::open(dir.path())?;
//! assert_eq!(table.get(&"banana".to_string())?, Some(2));
//! assert_eq!(table.get(&"cherry".to_string())?, None);
//! # Ok(())
//! # }
//! ```
const MAGIC_NUMBER: u64 = u64::from_be_bytes(*b"MPHTABLE");

mod equation;
pub use equation::{gcd, SizeEquation};

mod codec;
pub use codec::{
    read_varint, varint_len, write_varint, ByteCounter, Codec, ListCodec, LongCodec, SerdeCodec,
    StringCodec, UnitCodec, VarLongCodec,
};

mod validator;
pub use validator::{EqualKeyValidator, KeyValidator};

mod config;
pub use config::{
    KeyStorage, KeyValidation, OffsetStorage, RangeChecking, TableConfig, DEFAULT_TEMP_SHARD_SIZE,
    MAX_TEMP_SHARDS,
};

mod bits;
pub use bits::{BitSelect, BitVector, PackedInts, SelectWords};

mod memory;
pub use memory::Memory;

mod mph;
pub use mph::{fingerprint, Fingerprinter, MphError, Mphf};

mod meta;
pub use meta::{
    TableInfo, TableMeta, TablePaths, DATA_FILE, FORMAT_VERSION, META_FILE, OFFSETS_FILE,
};

mod writer;
pub use writer::{KeyOnly, StoredEntry, TableEntry, TableWriter};

mod reader;
pub use reader::{ReaderOptions, SharedKeyValidator, TableIter, TableReader, TableStats};

mod map;
pub use map::MphMap;

mod shared;
pub use shared::SharedTableReader;
