//! Mapping between application values and the `(flags, bytes)` pairs the
//! wire carries. Flags are persisted through the `Set`-family extras and
//! come back on `Get`, so a value decodes to the type it was stored as.

use bytes::Bytes;

/// Flag for opaque binary payloads.
pub const FLAG_RAW: u32 = 0;
/// Flag for UTF-8 string payloads.
pub const FLAG_UTF8: u32 = 1;
/// Flag for numeric payloads, stored in their ASCII-decimal form so the
/// server's increment/decrement arithmetic can operate on them.
pub const FLAG_NUMERIC: u32 = 2;

/// Bidirectional mapping between an application value and its stored form.
pub trait CacheValue: Sized + Send + Sync {
    fn encode(&self) -> (u32, Bytes);
    fn decode(flags: u32, data: Bytes) -> anyhow::Result<Self>;
}

impl CacheValue for Bytes {
    fn encode(&self) -> (u32, Bytes) {
        (FLAG_RAW, self.clone())
    }

    fn decode(_flags: u32, data: Bytes) -> anyhow::Result<Self> {
        Ok(data)
    }
}

impl CacheValue for Vec<u8> {
    fn encode(&self) -> (u32, Bytes) {
        (FLAG_RAW, Bytes::copy_from_slice(self))
    }

    fn decode(_flags: u32, data: Bytes) -> anyhow::Result<Self> {
        Ok(data.to_vec())
    }
}

impl CacheValue for String {
    fn encode(&self) -> (u32, Bytes) {
        (FLAG_UTF8, Bytes::copy_from_slice(self.as_bytes()))
    }

    fn decode(flags: u32, data: Bytes) -> anyhow::Result<Self> {
        if flags != FLAG_UTF8 && flags != FLAG_RAW {
            anyhow::bail!("value stored with flags {flags:#x} is not a string");
        }
        Ok(String::from_utf8(data.to_vec())?)
    }
}

impl CacheValue for u64 {
    fn encode(&self) -> (u32, Bytes) {
        (FLAG_NUMERIC, Bytes::copy_from_slice(self.to_string().as_bytes()))
    }

    /// Counters created by increment/decrement carry flags 0, so raw
    /// decimal payloads decode as well.
    fn decode(flags: u32, data: Bytes) -> anyhow::Result<Self> {
        if flags != FLAG_NUMERIC && flags != FLAG_RAW {
            anyhow::bail!("value stored with flags {flags:#x} is not numeric");
        }
        Ok(std::str::from_utf8(&data)?.trim().parse()?)
    }
}

impl CacheValue for i64 {
    fn encode(&self) -> (u32, Bytes) {
        (FLAG_NUMERIC, Bytes::copy_from_slice(self.to_string().as_bytes()))
    }

    fn decode(flags: u32, data: Bytes) -> anyhow::Result<Self> {
        if flags != FLAG_NUMERIC && flags != FLAG_RAW {
            anyhow::bail!("value stored with flags {flags:#x} is not numeric");
        }
        Ok(std::str::from_utf8(&data)?.trim().parse()?)
    }
}

/// A value together with the CAS token it was read with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueWithCas<V> {
    pub value: V,
    pub cas: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_round_trips_with_utf8_flag() {
        let (flags, data) = "héllo".to_string().encode();
        assert_eq!(flags, FLAG_UTF8);
        let back = String::decode(flags, data).unwrap();
        assert_eq!(back, "héllo");
    }

    #[test]
    fn string_rejects_foreign_flags() {
        assert!(String::decode(0x77, Bytes::from_static(b"x")).is_err());
    }

    #[test]
    fn raw_bytes_pass_through() {
        let raw = vec![0u8, 1, 2, 255];
        let (flags, data) = raw.encode();
        assert_eq!(flags, FLAG_RAW);
        assert_eq!(Vec::<u8>::decode(flags, data).unwrap(), raw);
    }

    #[test]
    fn counters_store_as_ascii_decimal() {
        let (flags, data) = 42u64.encode();
        assert_eq!(flags, FLAG_NUMERIC);
        assert_eq!(data.as_ref(), b"42");
        assert_eq!(u64::decode(flags, data).unwrap(), 42);

        // Values the server created through increment carry flags 0.
        assert_eq!(u64::decode(FLAG_RAW, Bytes::from_static(b"15")).unwrap(), 15);
        assert!(u64::decode(FLAG_UTF8, Bytes::from_static(b"15")).is_err());
        assert!(u64::decode(FLAG_NUMERIC, Bytes::from_static(b"abc")).is_err());
    }

    #[test]
    fn signed_counters_round_trip() {
        let (flags, data) = (-7i64).encode();
        assert_eq!(flags, FLAG_NUMERIC);
        assert_eq!(i64::decode(flags, data).unwrap(), -7);
    }
}
