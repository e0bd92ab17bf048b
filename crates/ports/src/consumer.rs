//! Consumer trait 定义

use std::sync::Arc;

use async_trait::async_trait;
use courier_errors::MqResult;
use tokio_util::sync::CancellationToken;

use crate::ClaimHandler;

/// 统一消费接口
///
/// 消费组与单连接轮询两种模型都实现该接口
#[async_trait]
pub trait Consumer<T: Send + 'static>: Send + Sync {
    /// 持续消费 `topics`（逗号分隔），每条消息交给 `handler`，
    /// 直到 `cancel` 被取消或出现致命错误
    async fn consume(
        &self,
        cancel: &CancellationToken,
        topics: &str,
        handler: Arc<dyn ClaimHandler<T>>,
    ) -> MqResult<()>;

    /// 离开消费组并释放连接，可重复调用
    async fn close(&self) -> MqResult<()>;
}
