//! Opaque key/value handling.
//!
//! The engine stores keys and values as shared byte slices and never looks
//! inside them, except through a `KeyOrder` when a tree needs ordering.
//! `Codec<T>` is the encode/decode seam for callers that want typed values.

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ByteOrder};
use std::cmp::Ordering;
use std::fmt::Debug;
use std::sync::Arc;

use crate::error::TreeError;

/// Shared immutable byte string. Cloning is a refcount bump, which keeps
/// copy-on-write leaf rewrites cheap.
pub type Bytes = Arc<[u8]>;

#[inline]
pub fn bytes(data: &[u8]) -> Bytes {
    Arc::from(data)
}

// ---------------- key ordering ----------------

/// External key comparator. Errors surface as `TreeError::KeyOrdering` and
/// abort the mutation that triggered them.
pub trait KeyOrder: Send + Sync + Debug {
    fn compare(&self, a: &[u8], b: &[u8]) -> Result<Ordering>;
}

/// Plain byte-wise ordering; never fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct LexicographicOrder;

impl KeyOrder for LexicographicOrder {
    #[inline]
    fn compare(&self, a: &[u8], b: &[u8]) -> Result<Ordering> {
        Ok(a.cmp(b))
    }
}

/// Keys are 8-byte big-endian signed integers (see `I64Codec`).
/// Any other length is an ordering error.
#[derive(Debug, Default, Clone, Copy)]
pub struct I64Order;

impl KeyOrder for I64Order {
    fn compare(&self, a: &[u8], b: &[u8]) -> Result<Ordering> {
        if a.len() != 8 || b.len() != 8 {
            return Err(TreeError::ordering(format!(
                "i64 keys must be 8 bytes, got {} and {}",
                a.len(),
                b.len()
            ))
            .into());
        }
        Ok(BigEndian::read_i64(a).cmp(&BigEndian::read_i64(b)))
    }
}

// ---------------- value codecs ----------------

pub trait Codec<T> {
    fn encode(&self, value: &T) -> Vec<u8>;
    fn decode(&self, data: &[u8]) -> Result<T>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RawCodec;

impl Codec<Vec<u8>> for RawCodec {
    fn encode(&self, value: &Vec<u8>) -> Vec<u8> {
        value.clone()
    }
    fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Utf8Codec;

impl Codec<String> for Utf8Codec {
    fn encode(&self, value: &String) -> Vec<u8> {
        value.as_bytes().to_vec()
    }
    fn decode(&self, data: &[u8]) -> Result<String> {
        String::from_utf8(data.to_vec()).map_err(|e| anyhow!("invalid utf-8 value: {}", e))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct I64Codec;

impl Codec<i64> for I64Codec {
    fn encode(&self, value: &i64) -> Vec<u8> {
        let mut out = vec![0u8; 8];
        BigEndian::write_i64(&mut out, *value);
        out
    }
    fn decode(&self, data: &[u8]) -> Result<i64> {
        if data.len() != 8 {
            return Err(anyhow!("i64 value must be 8 bytes, got {}", data.len()));
        }
        Ok(BigEndian::read_i64(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn i64_order_handles_sign() {
        let c = I64Codec;
        let ord = I64Order;
        let a = c.encode(&-5);
        let b = c.encode(&3);
        assert_eq!(ord.compare(&a, &b).unwrap(), Ordering::Less);
        assert_eq!(ord.compare(&b, &a).unwrap(), Ordering::Greater);
        assert_eq!(c.decode(&a).unwrap(), -5);
    }

    #[test]
    fn i64_order_rejects_bad_length() {
        let err = I64Order.compare(b"abc", &[0u8; 8]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TreeError>(),
            Some(TreeError::KeyOrdering(_))
        ));
    }
}
