//! Encodable/Decodable traits and implementations for the wire format.
//!
//! Integers are little-endian, collections carry a compact-size prefix and
//! maps are written as sorted (key, value) pairs, matching the reference
//! serializer bit-for-bit. Decoding enforces an allocation cap so a peer
//! cannot make us reserve gigabytes from a forged length prefix.

use std::io::{self, Read, Write};

use thiserror::Error;

/// Maximum size, in bytes, of a vector we are willing to allocate up front
/// while decoding.
pub const MAX_VEC_SIZE: usize = 4_000_000;

/// Encoding/decoding errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("allocation of oversized vector requested: {requested} > {max}")]
    OversizedVectorAllocation { requested: usize, max: usize },

    #[error("non-minimal varint")]
    NonMinimalVarInt,

    #[error("parse failed: {0}")]
    ParseFailed(&'static str),
}

/// Objects which can be consensus-encoded to a writer.
pub trait Encodable {
    /// Encode `self`, returning the number of bytes written.
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error>;
}

/// Objects which can be consensus-decoded from a reader.
pub trait Decodable: Sized {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, Error>;
}

/// Encode an object into a fresh byte vector.
pub fn serialize<T: Encodable + ?Sized>(data: &T) -> Vec<u8> {
    let mut encoder = Vec::new();
    let len = data.consensus_encode(&mut encoder).expect("in-memory writers don't error");
    debug_assert_eq!(len, encoder.len());
    encoder
}

/// Decode an object from a byte slice, erroring on trailing bytes.
pub fn deserialize<T: Decodable>(data: &[u8]) -> Result<T, Error> {
    let mut cursor = data;
    let object = T::consensus_decode(&mut cursor)?;
    if !cursor.is_empty() {
        return Err(Error::ParseFailed("data not consumed entirely"));
    }
    Ok(object)
}

/// Decode an object from a byte slice, permitting trailing bytes.
pub fn deserialize_partial<T: Decodable>(data: &[u8]) -> Result<(T, usize), Error> {
    let mut cursor = data;
    let object = T::consensus_decode(&mut cursor)?;
    Ok((object, data.len() - cursor.len()))
}

macro_rules! impl_int_encodable {
    ($ty:ty) => {
        impl Encodable for $ty {
            #[inline]
            fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
                w.write_all(&self.to_le_bytes())?;
                Ok(std::mem::size_of::<$ty>())
            }
        }
        impl Decodable for $ty {
            #[inline]
            fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, Error> {
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                r.read_exact(&mut buf)?;
                Ok(<$ty>::from_le_bytes(buf))
            }
        }
    };
}

impl_int_encodable!(u8);
impl_int_encodable!(u16);
impl_int_encodable!(u32);
impl_int_encodable!(u64);
impl_int_encodable!(i8);
impl_int_encodable!(i16);
impl_int_encodable!(i32);
impl_int_encodable!(i64);

impl Encodable for bool {
    #[inline]
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        u8::from(*self).consensus_encode(w)
    }
}

impl Decodable for bool {
    #[inline]
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, Error> {
        Ok(u8::consensus_decode(r)? != 0)
    }
}

/// A variable-length unsigned integer (Satoshi's "compact size").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VarInt(pub u64);

impl VarInt {
    /// Length of the encoded varint in bytes.
    pub fn len(&self) -> usize {
        match self.0 {
            0..=0xFC => 1,
            0xFD..=0xFFFF => 3,
            0x10000..=0xFFFF_FFFF => 5,
            _ => 9,
        }
    }
}

impl Encodable for VarInt {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        match self.0 {
            0..=0xFC => {
                (self.0 as u8).consensus_encode(w)?;
                Ok(1)
            }
            0xFD..=0xFFFF => {
                0xFDu8.consensus_encode(w)?;
                (self.0 as u16).consensus_encode(w)?;
                Ok(3)
            }
            0x10000..=0xFFFF_FFFF => {
                0xFEu8.consensus_encode(w)?;
                (self.0 as u32).consensus_encode(w)?;
                Ok(5)
            }
            _ => {
                0xFFu8.consensus_encode(w)?;
                self.0.consensus_encode(w)?;
                Ok(9)
            }
        }
    }
}

impl Decodable for VarInt {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, Error> {
        match u8::consensus_decode(r)? {
            0xFF => {
                let x = u64::consensus_decode(r)?;
                if x < 0x1_0000_0000 {
                    Err(Error::NonMinimalVarInt)
                } else {
                    Ok(VarInt(x))
                }
            }
            0xFE => {
                let x = u32::consensus_decode(r)?;
                if x < 0x1_0000 {
                    Err(Error::NonMinimalVarInt)
                } else {
                    Ok(VarInt(x as u64))
                }
            }
            0xFD => {
                let x = u16::consensus_decode(r)?;
                if x < 0xFD {
                    Err(Error::NonMinimalVarInt)
                } else {
                    Ok(VarInt(x as u64))
                }
            }
            n => Ok(VarInt(n as u64)),
        }
    }
}

impl Encodable for String {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let bytes = self.as_bytes();
        let len = VarInt(bytes.len() as u64).consensus_encode(w)?;
        w.write_all(bytes)?;
        Ok(len + bytes.len())
    }
}

impl Decodable for String {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, Error> {
        let bytes = Vec::<u8>::consensus_decode(r)?;
        String::from_utf8(bytes).map_err(|_| Error::ParseFailed("invalid utf-8 string"))
    }
}

macro_rules! impl_array_encodable {
    ($size:expr) => {
        impl Encodable for [u8; $size] {
            #[inline]
            fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
                w.write_all(self)?;
                Ok($size)
            }
        }
        impl Decodable for [u8; $size] {
            #[inline]
            fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, Error> {
                let mut buf = [0u8; $size];
                r.read_exact(&mut buf)?;
                Ok(buf)
            }
        }
    };
}

impl_array_encodable!(4);
impl_array_encodable!(16);
impl_array_encodable!(20);
impl_array_encodable!(32);

impl<T: Encodable> Encodable for Vec<T> {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = VarInt(self.len() as u64).consensus_encode(w)?;
        for item in self {
            len += item.consensus_encode(w)?;
        }
        Ok(len)
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, Error> {
        let len = VarInt::consensus_decode(r)?.0 as usize;
        // each element is at least one byte on the wire
        if len > MAX_VEC_SIZE {
            return Err(Error::OversizedVectorAllocation { requested: len, max: MAX_VEC_SIZE });
        }
        let mut ret = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            ret.push(T::consensus_decode(r)?);
        }
        Ok(ret)
    }
}

impl<K, V> Encodable for std::collections::BTreeMap<K, V>
where
    K: Encodable + Ord,
    V: Encodable,
{
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = VarInt(self.len() as u64).consensus_encode(w)?;
        for (k, v) in self {
            len += k.consensus_encode(w)?;
            len += v.consensus_encode(w)?;
        }
        Ok(len)
    }
}

impl<K, V> Decodable for std::collections::BTreeMap<K, V>
where
    K: Decodable + Ord,
    V: Decodable,
{
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, Error> {
        let len = VarInt::consensus_decode(r)?.0 as usize;
        if len > MAX_VEC_SIZE {
            return Err(Error::OversizedVectorAllocation { requested: len, max: MAX_VEC_SIZE });
        }
        let mut ret = std::collections::BTreeMap::new();
        for _ in 0..len {
            let k = K::consensus_decode(r)?;
            let v = V::consensus_decode(r)?;
            ret.insert(k, v);
        }
        Ok(ret)
    }
}

impl<T: Encodable + Ord> Encodable for std::collections::BTreeSet<T> {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = VarInt(self.len() as u64).consensus_encode(w)?;
        for item in self {
            len += item.consensus_encode(w)?;
        }
        Ok(len)
    }
}

impl<T: Decodable + Ord> Decodable for std::collections::BTreeSet<T> {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, Error> {
        let len = VarInt::consensus_decode(r)?.0 as usize;
        if len > MAX_VEC_SIZE {
            return Err(Error::OversizedVectorAllocation { requested: len, max: MAX_VEC_SIZE });
        }
        let mut ret = std::collections::BTreeSet::new();
        for _ in 0..len {
            ret.insert(T::consensus_decode(r)?);
        }
        Ok(ret)
    }
}

impl<A: Encodable, B: Encodable> Encodable for (A, B) {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        Ok(self.0.consensus_encode(w)? + self.1.consensus_encode(w)?)
    }
}

impl<A: Decodable, B: Decodable> Decodable for (A, B) {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, Error> {
        Ok((A::consensus_decode(r)?, B::consensus_decode(r)?))
    }
}

/// Implements Encodable and Decodable for a struct as the plain
/// concatenation of its fields, in declaration order.
macro_rules! impl_consensus_encoding {
    ($thing:ident, $($field:ident),+ $(,)?) => {
        impl $crate::consensus::Encodable for $thing {
            fn consensus_encode<W: std::io::Write + ?Sized>(
                &self,
                w: &mut W,
            ) -> Result<usize, std::io::Error> {
                let mut len = 0;
                $( len += $crate::consensus::Encodable::consensus_encode(&self.$field, w)?; )+
                Ok(len)
            }
        }
        impl $crate::consensus::Decodable for $thing {
            fn consensus_decode<R: std::io::Read + ?Sized>(
                r: &mut R,
            ) -> Result<Self, $crate::consensus::encode::Error> {
                Ok($thing {
                    $( $field: $crate::consensus::Decodable::consensus_decode(r)?, )+
                })
            }
        }
    };
}
pub(crate) use impl_consensus_encoding;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_round_trip() {
        for n in [0u64, 0xFC, 0xFD, 0xFFFF, 0x10000, 0xFFFF_FFFF, 0x1_0000_0000, u64::MAX] {
            let encoded = serialize(&VarInt(n));
            assert_eq!(encoded.len(), VarInt(n).len());
            let decoded: VarInt = deserialize(&encoded).unwrap();
            assert_eq!(decoded.0, n);
        }
    }

    #[test]
    fn varint_rejects_non_minimal() {
        // 0xFD prefix carrying a value that fits in one byte
        assert!(matches!(
            deserialize::<VarInt>(&[0xFD, 0x10, 0x00]),
            Err(Error::NonMinimalVarInt)
        ));
    }

    #[test]
    fn int_layout_is_little_endian() {
        assert_eq!(serialize(&0x0403_0201u32), [1, 2, 3, 4]);
        assert_eq!(serialize(&(-1i32)), [0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(serialize(&0xFFFF_FFFFu32), [0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn string_round_trip() {
        let s = "ServiceNodeRegistry-Version-8".to_string();
        let encoded = serialize(&s);
        assert_eq!(encoded[0] as usize, s.len());
        assert_eq!(deserialize::<String>(&encoded).unwrap(), s);
    }

    #[test]
    fn oversized_vector_is_rejected() {
        let mut data = serialize(&VarInt(MAX_VEC_SIZE as u64 + 1));
        data.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            deserialize::<Vec<u8>>(&data),
            Err(Error::OversizedVectorAllocation { .. })
        ));
    }
}
