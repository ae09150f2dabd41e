use std::fmt;
use std::io::{Error, ErrorKind, Read, Result, Write};
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::SizeEquation;

/// Binary codec for the keys or values stored in a table.
///
/// A codec is persisted inside the table metadata alongside the rest of the
/// configuration, so any parameters it carries must be serializable; readers
/// recover the exact codec that wrote the table from `meta.bin`.
///
/// Implementations must report stable sizes: [`size_of`](Self::size_of) has
/// to equal the number of bytes [`write`](Self::write) emits for the same
/// item, and [`size_equation`](Self::size_equation), when provided, has to
/// describe every size the codec can produce.
pub trait Codec: Clone + fmt::Debug + Send + Sync + Serialize + DeserializeOwned {
    /// Type encoded by this codec.
    type Item;

    /// Appends the encoding of `item` to `out`.
    fn write<W: Write>(&self, item: &Self::Item, out: &mut W) -> Result<()>;

    /// Decodes one item from the front of `input`, advancing it past the
    /// consumed bytes.
    fn read(&self, input: &mut &[u8]) -> Result<Self::Item>;

    /// Number of bytes [`write`](Self::write) produces for `item`.
    fn size_of(&self, item: &Self::Item) -> Result<u64> {
        let mut counter = ByteCounter::default();
        self.write(item, &mut counter)?;
        Ok(counter.count())
    }

    /// Affine description of every size this codec can produce, if known.
    fn size_equation(&self) -> Option<SizeEquation> {
        None
    }
}

/// [`Write`] sink that only counts bytes.
#[derive(Debug, Default)]
pub struct ByteCounter {
    count: u64,
}

impl ByteCounter {
    /// Bytes written so far.
    pub fn count(&self) -> u64 {
        self.count
    }
}

impl Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.count += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Codec for `()`, occupying no bytes. Used as the value codec type of
/// valueless tables.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UnitCodec;

impl Codec for UnitCodec {
    type Item = ();

    fn write<W: Write>(&self, _item: &(), _out: &mut W) -> Result<()> {
        Ok(())
    }

    fn read(&self, _input: &mut &[u8]) -> Result<()> {
        Ok(())
    }

    fn size_of(&self, _item: &()) -> Result<u64> {
        Ok(0)
    }

    fn size_equation(&self) -> Option<SizeEquation> {
        Some(SizeEquation::constant_value(0))
    }
}

/// Fixed-width little-endian `i64`.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LongCodec;

impl Codec for LongCodec {
    type Item = i64;

    fn write<W: Write>(&self, item: &i64, out: &mut W) -> Result<()> {
        out.write_all(&item.to_le_bytes())
    }

    fn read(&self, input: &mut &[u8]) -> Result<i64> {
        let mut buf = [0u8; 8];
        input.read_exact(&mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }

    fn size_of(&self, _item: &i64) -> Result<u64> {
        Ok(8)
    }

    fn size_equation(&self) -> Option<SizeEquation> {
        Some(SizeEquation::constant_value(8))
    }
}

/// Zig-zag LEB128 `i64`, between one and ten bytes.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VarLongCodec;

impl Codec for VarLongCodec {
    type Item = i64;

    fn write<W: Write>(&self, item: &i64, out: &mut W) -> Result<()> {
        write_varint(zigzag(*item), out)
    }

    fn read(&self, input: &mut &[u8]) -> Result<i64> {
        read_varint(input).map(unzigzag)
    }

    fn size_of(&self, item: &i64) -> Result<u64> {
        Ok(varint_len(zigzag(*item)))
    }
}

/// UTF-8 string prefixed with its varint byte length.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StringCodec;

impl Codec for StringCodec {
    type Item = String;

    fn write<W: Write>(&self, item: &String, out: &mut W) -> Result<()> {
        write_varint(item.len() as u64, out)?;
        out.write_all(item.as_bytes())
    }

    fn read(&self, input: &mut &[u8]) -> Result<String> {
        let len = read_varint(input)? as usize;
        if input.len() < len {
            return Err(Error::new(
                ErrorKind::UnexpectedEof,
                format!("string of {} bytes runs past the end of the data", len),
            ));
        }
        let (bytes, rest) = input.split_at(len);
        *input = rest;
        String::from_utf8(bytes.to_vec()).map_err(|e| {
            Error::new(ErrorKind::InvalidData, format!("Invalid UTF-8 string: {}", e))
        })
    }

    fn size_of(&self, item: &String) -> Result<u64> {
        Ok(varint_len(item.len() as u64) + item.len() as u64)
    }
}

/// Sequence of items prefixed with a varint element count.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct ListCodec<C> {
    element: C,
}

impl<C: Codec> ListCodec<C> {
    pub fn new(element: C) -> Self {
        Self { element }
    }
}

impl<C: Codec> Codec for ListCodec<C> {
    type Item = Vec<C::Item>;

    fn write<W: Write>(&self, item: &Vec<C::Item>, out: &mut W) -> Result<()> {
        write_varint(item.len() as u64, out)?;
        for element in item {
            self.element.write(element, out)?;
        }
        Ok(())
    }

    fn read(&self, input: &mut &[u8]) -> Result<Vec<C::Item>> {
        let count = read_varint(input)? as usize;
        // each element takes at least one byte unless the element codec is empty
        let mut items = Vec::with_capacity(count.min(input.len()));
        for _ in 0..count {
            items.push(self.element.read(input)?);
        }
        Ok(items)
    }

    fn size_of(&self, item: &Vec<C::Item>) -> Result<u64> {
        let mut size = varint_len(item.len() as u64);
        for element in item {
            size += self.element.size_of(element)?;
        }
        Ok(size)
    }
}

/// Codec for any serde type, encoded as MessagePack with `rmp-serde`.
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct SerdeCodec<T> {
    #[serde(skip)]
    phantom: PhantomData<fn() -> T>,
}

impl<T> SerdeCodec<T> {
    pub fn new() -> Self {
        Self {
            phantom: PhantomData,
        }
    }
}

impl<T> Default for SerdeCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for SerdeCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for SerdeCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SerdeCodec<{}>", std::any::type_name::<T>())
    }
}

impl<T: Serialize + DeserializeOwned> Codec for SerdeCodec<T> {
    type Item = T;

    fn write<W: Write>(&self, item: &T, out: &mut W) -> Result<()> {
        rmp_serde::encode::write(out, item)
            .map_err(|e| Error::other(format!("Fail to serialize item: {}", e)))
    }

    fn read(&self, input: &mut &[u8]) -> Result<T> {
        rmp_serde::decode::from_read(&mut *input).map_err(|e| {
            Error::new(
                ErrorKind::InvalidData,
                format!("Failed to deserialize item: {}", e),
            )
        })
    }
}

fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// Writes `value` as an unsigned LEB128 varint.
pub fn write_varint<W: Write>(mut value: u64, out: &mut W) -> Result<()> {
    let mut buf = [0u8; 10];
    let mut len = 0;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf[len] = byte;
            len += 1;
            break;
        }
        buf[len] = byte | 0x80;
        len += 1;
    }
    out.write_all(&buf[..len])
}

/// Reads an unsigned LEB128 varint from the front of `input`.
pub fn read_varint(input: &mut &[u8]) -> Result<u64> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        let (&byte, rest) = input.split_first().ok_or_else(|| {
            Error::new(ErrorKind::UnexpectedEof, "varint runs past the end of the data")
        })?;
        *input = rest;
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(Error::new(ErrorKind::InvalidData, "varint is longer than 10 bytes"))
}

/// Encoded length of `value` as a varint.
pub fn varint_len(value: u64) -> u64 {
    let bits = 64 - (value | 1).leading_zeros() as u64;
    bits.div_ceil(7)
}
