//! Codec trait 定义

use courier_errors::MqResult;

/// 消息编解码
///
/// 纯同步、无 I/O；核心层只在发送前调用 `encode`、接收后立即调用 `decode`，
/// 从不直接解析负载字节
pub trait Codec<T>: Send + Sync {
    /// 领域消息 -> 字节
    fn encode(&self, value: &T) -> MqResult<Vec<u8>>;

    /// 字节 -> 领域消息
    fn decode(&self, bytes: &[u8]) -> MqResult<T>;
}
