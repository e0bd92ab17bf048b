//! Producer trait 定义

use async_trait::async_trait;
use courier_errors::MqResult;
use tokio_util::sync::CancellationToken;

use crate::DeliveryResult;

/// 同步生产者：一次一条，等待 broker 确认
#[async_trait]
pub trait Producer<T: Send + Sync + 'static>: Send + Sync {
    /// 发送消息并等待确认，或在 `cancel` 被取消时返回 `Cancelled`
    async fn send(
        &self,
        cancel: &CancellationToken,
        message: &T,
        topic: &str,
    ) -> MqResult<DeliveryResult>;

    /// 带 key 发送（同 key 落在同一分区）
    async fn send_with_key(
        &self,
        cancel: &CancellationToken,
        message: &T,
        topic: &str,
        key: &[u8],
    ) -> MqResult<DeliveryResult>;

    /// 释放底层连接，之后的发送都会失败
    async fn close(&self) -> MqResult<()>;
}
