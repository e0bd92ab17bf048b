//! 编解码实现
//!
//! protobuf（prost）与 JSON（serde_json）两种负载格式

use std::fmt;
use std::marker::PhantomData;

use courier_errors::{MqError, MqResult};
use courier_ports::Codec;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// prost 消息编解码
pub struct ProstCodec<M> {
    _marker: PhantomData<fn() -> M>,
}

impl<M> ProstCodec<M> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<M> Default for ProstCodec<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Clone for ProstCodec<M> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<M> fmt::Debug for ProstCodec<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProstCodec<{}>", std::any::type_name::<M>())
    }
}

impl<M> Codec<M> for ProstCodec<M>
where
    M: prost::Message + Default,
{
    fn encode(&self, value: &M) -> MqResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(value.encoded_len());
        value
            .encode(&mut buf)
            .map_err(|e| MqError::encoding(format!("Failed to encode protobuf message: {}", e)))?;
        Ok(buf)
    }

    fn decode(&self, bytes: &[u8]) -> MqResult<M> {
        M::decode(bytes)
            .map_err(|e| MqError::decoding(format!("Failed to decode protobuf message: {}", e)))
    }
}

/// JSON 编解码
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JsonCodec<{}>", std::any::type_name::<T>())
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> MqResult<Vec<u8>> {
        serde_json::to_vec(value)
            .map_err(|e| MqError::encoding(format!("Failed to serialize message: {}", e)))
    }

    fn decode(&self, bytes: &[u8]) -> MqResult<T> {
        serde_json::from_slice(bytes)
            .map_err(|e| MqError::decoding(format!("Failed to parse payload: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tokio_test::{assert_err, assert_ok};

    #[derive(Clone, PartialEq, prost::Message)]
    struct OrderPlaced {
        #[prost(string, tag = "1")]
        order_id: String,
        #[prost(int64, tag = "2")]
        amount_cents: i64,
        #[prost(string, repeated, tag = "3")]
        items: Vec<String>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        body: String,
        seq: u32,
    }

    #[test]
    fn test_prost_round_trip() {
        let codec = ProstCodec::<OrderPlaced>::new();
        let message = OrderPlaced {
            order_id: "ord-1001".to_string(),
            amount_cents: 4599,
            items: vec!["sku-1".to_string(), "sku-2".to_string()],
        };

        let bytes = assert_ok!(codec.encode(&message));
        assert_eq!(assert_ok!(codec.decode(&bytes)), message);
    }

    #[test]
    fn test_prost_empty_message() {
        let codec = ProstCodec::<OrderPlaced>::new();
        let bytes = codec.encode(&OrderPlaced::default()).unwrap();
        assert!(bytes.is_empty());
        assert_eq!(codec.decode(&bytes).unwrap(), OrderPlaced::default());
    }

    #[test]
    fn test_prost_malformed_payload() {
        let codec = ProstCodec::<OrderPlaced>::new();
        // field 1 声明长度 10，实际只有 2 字节
        let err = codec.decode(&[0x0a, 0x0a, b'o', b'r']).unwrap_err();
        assert!(matches!(err, MqError::Decoding(_)));
    }

    #[test]
    fn test_json_round_trip() {
        let codec = JsonCodec::<Ping>::new();
        let message = Ping {
            body: "ping".to_string(),
            seq: 1,
        };

        let bytes = codec.encode(&message).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), message);
    }

    #[test]
    fn test_json_malformed_payload() {
        let codec = JsonCodec::<Ping>::new();
        let err = assert_err!(codec.decode(b"not json"));
        assert!(matches!(err, MqError::Decoding(_)));
        assert!(err.is_message_error());
    }
}
