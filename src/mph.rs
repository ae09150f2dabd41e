use std::fmt;
use std::io::{Result as IoResult, Write};

use ph::phast;
use ph::seeds::Bits8;
use ph::Seedable;
use serde::de::{self, Deserializer};
use serde::ser::{self, Serializer};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use xxhash_rust::xxh3::{xxh3_128_with_seed, Xxh3, Xxh3Builder};

use crate::map::BytesVisitor;
use crate::{BitVector, ByteCounter, PackedInts};

const FINGERPRINT_SEED: u64 = u64::from_be_bytes(*b"mphtable");
const FUNCTION_SEED: u64 = 0x9e37_79b9_7f4a_7c15;
const SIGNATURE_SALT: u64 = 0xa076_1d64_78bd_642f;

/// PHast function over key fingerprints, with 8-bit seeds.
///
/// The seeded hasher is part of the persisted format: a function read back
/// from `meta.bin` must be evaluated with the hasher it was built with.
type Function =
    phast::Function<Bits8, phast::SeedOnly, phast::DefaultCompressedArray, FunctionHasher>;

type FunctionHasher = Seedable<Xxh3Builder>;

fn function_hasher() -> FunctionHasher {
    Seedable(Xxh3Builder::new().with_seed(FUNCTION_SEED))
}

fn function_params() -> phast::Params<Bits8> {
    phast::Params::new(Bits8, phast::bits_per_seed_to_100_bucket_size(8))
}

/// Errors raised while building a [`Mphf`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MphError {
    #[error("duplicate key (fingerprint {fingerprint:#034x})")]
    DuplicateKey { fingerprint: u128 },
    #[error("perfect hash function does not separate {keys} keys")]
    Unresolvable { keys: u64 },
}

impl From<MphError> for std::io::Error {
    fn from(e: MphError) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
    }
}

/// 128-bit fingerprint of serialized key bytes, the only input [`Mphf`]
/// needs from a key.
pub fn fingerprint(bytes: &[u8]) -> u128 {
    xxh3_128_with_seed(bytes, FINGERPRINT_SEED)
}

/// [`Write`] sink computing the [`fingerprint`] of everything written to it,
/// so keys can be fingerprinted straight from their codec.
pub struct Fingerprinter(Xxh3);

impl Fingerprinter {
    pub fn new() -> Self {
        Self(Xxh3::with_seed(FINGERPRINT_SEED))
    }

/// Fingerprint of the bytes written so far.
    pub fn finish(&self) -> u128 {
        self.0.digest128()
    }
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for Fingerprinter {
    fn write(&mut self, buf: &[u8]) -> IoResult<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> IoResult<()> {
        Ok(())
    }
}

/// Minimal perfect hash function with optional signatures.
///
/// The function itself is a PHast function from the `ph` crate built over
/// the key fingerprints. With a non-zero signature width, `width` bits
/// derived from each training fingerprint are stored at its hash value and
/// lookups whose bits differ are rejected, so an unknown key is accepted
/// with probability `2^-width`.
pub struct Mphf {
    len: u64,
    function: Option<Function>,
    function_size: u64,
    signatures: PackedInts,
}

impl Mphf {
    /// Builds a function mapping each fingerprint to a distinct value in
    /// `[0, fingerprints.len())`.
    ///
    /// # Errors
    ///
    /// Returns [`MphError::DuplicateKey`] when two fingerprints are equal,
    /// which is checked before the function is built.
    pub fn build(mut fingerprints: Vec<u128>, signature_width: u32) -> Result<Self, MphError> {
        fingerprints.sort_unstable();
        if let Some(pair) = fingerprints.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(MphError::DuplicateKey {
                fingerprint: pair[0],
            });
        }

        let len = fingerprints.len() as u64;
        let mut signatures = PackedInts::new(signature_width, len);
        if len == 0 {
            return Ok(Self {
                len,
                function: None,
                function_size: 0,
                signatures,
            });
        }

        let function = Function::with_slice_p_hash_sc(
            &fingerprints,
            &function_params(),
            function_hasher(),
            phast::SeedOnly,
        );
        let mut seen = BitVector::new(len);
        for &fingerprint in &fingerprints {
            let hash = function.get(&fingerprint) as u64;
            if hash >= len || seen.get(hash) {
                return Err(MphError::Unresolvable { keys: len });
            }
            seen.set(hash);
            signatures.set(hash, signature(fingerprint));
        }

        let mut counter = ByteCounter::default();
        // Writing into a counter cannot fail.
        let _ = function.write(&mut counter);
        Ok(Self {
            len,
            function: Some(function),
            function_size: counter.count(),
            signatures,
        })
    }

    /// Number of keys the function was built over.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bits of signature stored per key.
    pub fn signature_width(&self) -> u32 {
        self.signatures.width()
    }

    /// Hash of serialized key bytes, or `None` when the key is rejected by
    /// its signature. Unknown keys that pass are mapped to an arbitrary
    /// value in range.
    pub fn get(&self, bytes: &[u8]) -> Option<u64> {
        self.get_fingerprint(fingerprint(bytes))
    }

    /// Like [`get`](Self::get), for an already computed fingerprint.
    pub fn get_fingerprint(&self, fingerprint: u128) -> Option<u64> {
        let function = self.function.as_ref()?;
        let hash = function.get(&fingerprint) as u64;
        if hash >= self.len {
            return None;
        }
        let width = self.signatures.width();
        if width > 0 && self.signatures.get(hash) != signature(fingerprint) & low_bits(width) {
            return None;
        }
        Some(hash)
    }

    /// Serialized bytes of the function and its signatures.
    pub fn size_in_bytes(&self) -> u64 {
        self.function_size + self.signatures.size_in_bytes()
    }
}

impl fmt::Debug for Mphf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mphf")
            .field("len", &self.len)
            .field("signature_width", &self.signature_width())
            .field("size_in_bytes", &self.size_in_bytes())
            .finish()
    }
}

#[derive(Serialize)]
struct MphfRef<'a> {
    len: u64,
    #[serde(serialize_with = "serialize_bytes")]
    function: &'a [u8],
    signatures: &'a PackedInts,
}

#[derive(Deserialize)]
struct MphfImage {
    len: u64,
    #[serde(deserialize_with = "deserialize_bytes")]
    function: Vec<u8>,
    signatures: PackedInts,
}

fn serialize_bytes<S: Serializer>(bytes: &&[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_bytes(bytes)
}

fn deserialize_bytes<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    deserializer.deserialize_bytes(BytesVisitor)
}

impl Serialize for Mphf {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut function = Vec::with_capacity(self.function_size as usize);
        if let Some(f) = &self.function {
            f.write(&mut function).map_err(ser::Error::custom)?;
        }
        MphfRef {
            len: self.len,
            function: &function,
            signatures: &self.signatures,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Mphf {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let image = MphfImage::deserialize(deserializer)?;
        let function = if image.len == 0 {
            None
        } else {
            let function = Function::read_with_hasher_sc(
                &mut &image.function[..],
                function_hasher(),
                phast::SeedOnly,
            )
            .map_err(de::Error::custom)?;
            Some(function)
        };
        Ok(Self {
            len: image.len,
            function,
            function_size: image.function.len() as u64,
            signatures: image.signatures,
        })
    }
}

fn mix(mut x: u64) -> u64 {
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    x ^ (x >> 33)
}

fn low_bits(width: u32) -> u64 {
    u64::MAX >> (64 - width)
}

fn signature(fingerprint: u128) -> u64 {
    let (hi, lo) = ((fingerprint >> 64) as u64, fingerprint as u64);
    mix(hi.rotate_left(29) ^ lo ^ SIGNATURE_SALT)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(range: std::ops::Range<u64>) -> Vec<u128> {
        range.map(|i| fingerprint(&i.to_le_bytes())).collect()
    }

    fn assert_bijective(mphf: &Mphf, range: std::ops::Range<u64>) {
        let mut seen = BitVector::new(mphf.len());
        for i in range {
            let hash = mphf.get(&i.to_le_bytes()).unwrap();
            assert!(hash < mphf.len());
            assert!(!seen.get(hash), "hash {} assigned twice", hash);
            seen.set(hash);
        }
        assert_eq!(seen.count_ones(), mphf.len());
    }

    #[test]
    fn test_small_sets() {
        for n in 0..40 {
            let mphf = Mphf::build(keys(0..n), 0).unwrap();
            assert_eq!(mphf.len(), n);
            assert_bijective(&mphf, 0..n);
        }
        assert_eq!(Mphf::build(Vec::new(), 8).unwrap().get(b"anything"), None);
    }

    #[test]
    fn test_large_set() {
        const N: u64 = 200_000;
        let mphf = Mphf::build(keys(0..N), 0).unwrap();
        assert_bijective(&mphf, 0..N);
        assert!(mphf.size_in_bytes() < N);

        for i in N..N + 1000 {
            if let Some(hash) = mphf.get(&i.to_le_bytes()) {
                assert!(hash < N);
            }
        }
    }

    #[test]
    fn test_duplicates() {
        let mut fingerprints = keys(0..100);
        fingerprints.push(fingerprint(&42u64.to_le_bytes()));
        let err = Mphf::build(fingerprints, 0).unwrap_err();
        assert_eq!(
            err,
            MphError::DuplicateKey {
                fingerprint: fingerprint(&42u64.to_le_bytes())
            }
        );
        let err: std::io::Error = err.into();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_signatures() {
        const N: u64 = 10_000;
        let mphf = Mphf::build(keys(0..N), 8).unwrap();
        assert_eq!(mphf.signature_width(), 8);
        assert_bijective(&mphf, 0..N);

        let false_positives = (N..2 * N)
            .filter(|i| mphf.get(&i.to_le_bytes()).is_some())
            .count();
        assert!(false_positives > 0);
        assert!(false_positives < 150, "{} false positives", false_positives);

        let wide = Mphf::build(keys(0..N), 64).unwrap();
        assert_bijective(&wide, 0..N);
        assert!((N..2 * N).all(|i| wide.get(&i.to_le_bytes()).is_none()));
    }

    #[test]
    fn test_fingerprinter() {
        let bytes: Vec<u8> = (0..1000u32).flat_map(|i| i.to_le_bytes()).collect();
        let mut fingerprinter = Fingerprinter::new();
        for chunk in bytes.chunks(37) {
            fingerprinter.write_all(chunk).unwrap();
        }
        assert_eq!(fingerprinter.finish(), fingerprint(&bytes));
        assert_eq!(Fingerprinter::default().finish(), fingerprint(&[]));
    }

    #[test]
    fn test_serde() {
        let mphf = Mphf::build(keys(0..1000), 5).unwrap();
        let bytes = rmp_serde::to_vec_named(&mphf).unwrap();
        let loaded: Mphf = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(loaded.len(), 1000);
        assert_eq!(loaded.signature_width(), 5);
        assert_eq!(loaded.size_in_bytes(), mphf.size_in_bytes());
        assert_bijective(&loaded, 0..1000);
        for i in 0..2000u64 {
            assert_eq!(loaded.get(&i.to_le_bytes()), mphf.get(&i.to_le_bytes()));
        }

        let bytes = rmp_serde::to_vec(&Mphf::build(Vec::new(), 0).unwrap()).unwrap();
        let empty: Mphf = rmp_serde::from_slice(&bytes).unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.get(b"key"), None);
    }
}
