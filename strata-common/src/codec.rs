//! # Value Codec
//!
//! The off-heap tier stores values as bytes in arena-managed memory; the
//! codec is the serialization boundary it crosses on every write and
//! read. The store consumes this seam and never looks inside the payload.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Byte codec for stored values.
pub trait ValueCodec<V>: Send + Sync {
    /// Encodes a value into its stored binary form.
    fn encode(&self, value: &V) -> anyhow::Result<Bytes>;

    /// Decodes a stored binary form back into a value.
    fn decode(&self, bytes: &[u8]) -> anyhow::Result<V>;
}

/// JSON codec for any serde-serializable value type.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<V> ValueCodec<V> for JsonCodec
where
    V: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &V) -> anyhow::Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn decode(&self, bytes: &[u8]) -> anyhow::Result<V> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Identity codec for callers that already hold bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl ValueCodec<Bytes> for BytesCodec {
    fn encode(&self, value: &Bytes) -> anyhow::Result<Bytes> {
        Ok(value.clone())
    }

    fn decode(&self, bytes: &[u8]) -> anyhow::Result<Bytes> {
        Ok(Bytes::copy_from_slice(bytes))
    }
}
