use std::fmt;
use std::fs::File;
use std::io::Result;
use std::ops::Deref;
use std::path::Path;

use memmap2::Mmap;

/// Immutable bytes, either owned by the heap or mapped from a file.
pub enum Memory {
    Heap(Vec<u8>),
    Mapped(Mmap),
}

impl Memory {
    /// Maps `path` read-only. Empty files are represented by an empty heap
    /// buffer since zero-length mappings are not portable.
    pub fn map(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Ok(Memory::Heap(Vec::new()));
        }
        // SAFETY: table files are written once and marked read-only before
        // any reader opens them.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Memory::Mapped(mmap))
    }

    /// Reads the whole of `path` into the heap.
    pub fn read(path: &Path) -> Result<Self> {
        std::fs::read(path).map(Memory::Heap)
    }

    /// Reads `path` into the heap when `heap` is set, maps it otherwise.
    pub fn open(path: &Path, heap: bool) -> Result<Self> {
        if heap {
            Self::read(path)
        } else {
            Self::map(path)
        }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self, Memory::Mapped(_))
    }

    /// Little-endian unsigned integer of `width` bytes at `offset`.
    pub fn read_uint_le(&self, offset: usize, width: usize) -> Option<u64> {
        let bytes = self.get(offset..offset.checked_add(width)?)?;
        let mut buf = [0u8; 8];
        buf[..width].copy_from_slice(bytes);
        Some(u64::from_le_bytes(buf))
    }
}

impl Deref for Memory {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Memory::Heap(bytes) => bytes,
            Memory::Mapped(mmap) => mmap,
        }
    }
}

impl From<Vec<u8>> for Memory {
    fn from(bytes: Vec<u8>) -> Self {
        Memory::Heap(bytes)
    }
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_mapped() { "Mapped" } else { "Heap" };
        write!(f, "Memory::{}({} bytes)", kind, self.len())
    }
}
