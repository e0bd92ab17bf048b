//! 消息类型定义

use std::fmt;

/// 待发送的记录（已编码）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRecord {
    pub topic: String,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

impl OutboundRecord {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            payload,
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// 单次发送的投递结果，只属于发起它的那次调用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryResult {
    pub partition: i32,
    pub offset: i64,
}

impl DeliveryResult {
    pub fn new(partition: i32, offset: i64) -> Self {
        Self { partition, offset }
    }
}

/// 从 broker 收到的原始记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    /// 毫秒时间戳
    pub timestamp: Option<i64>,
}

impl ConsumedRecord {
    /// 提交时应写入的 offset（下一条待消费的位置）
    pub fn next_offset(&self) -> i64 {
        self.offset + 1
    }

    pub fn delivery(&self) -> DeliveryResult {
        DeliveryResult::new(self.partition, self.offset)
    }
}

impl fmt::Display for ConsumedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}
