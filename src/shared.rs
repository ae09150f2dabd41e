use std::io::{Error, Result};
use std::path::Path;
use std::sync::{Arc, LockResult, PoisonError, RwLock};

use tracing::{info, warn};

use crate::{Codec, TableConfig, TableReader, TableStats, UnitCodec};

/// Reference-counted handle to a [`TableReader`] that can be swapped while
/// lookups are in flight.
///
/// [`get_copy`](Self::get_copy) hands out an `Arc` that keeps the current
/// reader alive. Swapping or closing the handle only drops the handle's own
/// reference; the reader releases its files once the last copy is dropped.
pub struct SharedTableReader<KC: Codec, VC: Codec = UnitCodec> {
    current: RwLock<Option<Arc<TableReader<KC, VC>>>>,
}

impl<KC, VC> SharedTableReader<KC, VC>
where
    KC: Codec,
    VC: Codec,
    KC::Item: Ord + 'static,
    VC::Item: 'static,
{
    pub fn new(reader: TableReader<KC, VC>) -> Self {
        Self {
            current: RwLock::new(Some(Arc::new(reader))),
        }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        TableReader::open(path).map(Self::new)
    }

    /// Current reader, or `None` once the handle is closed.
    pub fn get_copy(&self) -> Option<Arc<TableReader<KC, VC>>> {
        recover(self.current.read()).clone()
    }

    fn reader(&self) -> Result<Arc<TableReader<KC, VC>>> {
        self.get_copy()
            .ok_or_else(|| Error::other("table was already closed"))
    }

    pub fn get(&self, key: &KC::Item) -> Result<Option<VC::Item>> {
        self.reader()?.get(key)
    }

    pub fn contains_key(&self, key: &KC::Item) -> Result<bool> {
        self.reader()?.contains_key(key)
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.reader()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.reader()?.is_empty())
    }

    pub fn size_in_bytes(&self) -> Result<u64> {
        Ok(self.reader()?.size_in_bytes())
    }

    pub fn timestamp(&self) -> Result<u64> {
        Ok(self.reader()?.timestamp())
    }

    pub fn stats(&self) -> Result<TableStats> {
        Ok(self.reader()?.stats())
    }

    pub fn config(&self) -> Result<TableConfig<KC, VC>> {
        Ok(self.reader()?.config().clone())
    }

    /// Installs `reader` and returns the previous one, if the handle was not
    /// closed.
    pub fn swap(&self, reader: TableReader<KC, VC>) -> Option<Arc<TableReader<KC, VC>>> {
        info!(entries = reader.len(), timestamp = reader.timestamp(), "swapping table");
        recover(self.current.write()).replace(Arc::new(reader))
    }

    /// Drops the handle's reference. Outstanding copies stay usable.
    pub fn close(&self) {
        recover(self.current.write()).take();
    }
}

/// A panic while holding the lock cannot leave the slot half-written.
fn recover<G>(result: LockResult<G>) -> G {
    result.unwrap_or_else(|poisoned: PoisonError<G>| {
        warn!("recovering poisoned table lock");
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::*;

    fn build(dir: &std::path::Path, scale: i64) -> TableReader<LongCodec, LongCodec> {
        let config = TableConfig::new()
            .with_key_codec(LongCodec)
            .with_value_codec(LongCodec);
        TableWriter::new(config)
            .write(dir, (0..100).map(|i| (i, i * scale)))
            .unwrap();
        TableReader::open(dir).unwrap()
    }

    #[test]
    fn test_references() {
        let first = tempfile::tempdir().unwrap();
        let shared = SharedTableReader::new(build(first.path(), 2));
        assert_eq!(shared.get(&7).unwrap(), Some(14));
        assert_eq!(shared.len().unwrap(), 100);
        assert!(shared.contains_key(&99).unwrap());

        let copy = shared.get_copy().unwrap();
        assert_eq!(Arc::strong_count(&copy), 2);

        let second = tempfile::tempdir().unwrap();
        let previous = shared.swap(build(second.path(), 3)).unwrap();
        assert!(Arc::ptr_eq(&previous, &copy));
        drop(previous);
        assert_eq!(shared.get(&7).unwrap(), Some(21));
        assert_eq!(copy.get(&7).unwrap(), Some(14));

        shared.close();
        let err = shared.get(&7).unwrap_err();
        assert_eq!(err.to_string(), "table was already closed");
        assert!(shared.get_copy().is_none());
        shared.stats().unwrap_err();
        assert_eq!(copy.get(&8).unwrap(), Some(16));
        assert_eq!(Arc::strong_count(&copy), 1);
    }

    #[test]
    fn test_concurrent_swap() {
        let dirs: Vec<_> = (0..4).map(|_| tempfile::tempdir().unwrap()).collect();
        let shared = Arc::new(SharedTableReader::new(build(dirs[0].path(), 1)));
        std::thread::scope(|scope| {
            for _ in 0..4 {
                let shared = shared.clone();
                scope.spawn(move || {
                    for key in 0..2000 {
                        let reader = shared.get_copy().unwrap();
                        let value = reader.get(&(key % 100)).unwrap().unwrap();
                        assert_eq!(value % (key % 100).max(1), 0);
                    }
                });
            }
            for (scale, dir) in dirs.iter().enumerate().skip(1) {
                shared.swap(build(dir.path(), scale as i64 + 1));
            }
        });
        assert_eq!(shared.get(&10).unwrap(), Some(40));
    }
}
