//! 同步生产者

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use courier_errors::{MqError, MqResult};
use courier_ports::{Codec, DeliveryResult, OutboundRecord, Producer};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::ProducerBackend;
use crate::counters;

/// 同步生产者
///
/// 一次发送一条消息，等待 broker 确认或取消。多个任务可以共享同一个实例并发发送，
/// 每次调用只会拿到自己那条消息的投递结果
pub struct SyncProducer<B, C> {
    backend: Arc<B>,
    codec: Arc<C>,
    closed: AtomicBool,
}

impl<B, C> SyncProducer<B, C>
where
    B: ProducerBackend,
{
    pub fn new(backend: Arc<B>, codec: Arc<C>) -> Self {
        Self {
            backend,
            codec,
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 发送消息并等待确认
    pub async fn send_message<T>(
        &self,
        cancel: &CancellationToken,
        message: &T,
        topic: &str,
    ) -> MqResult<DeliveryResult>
    where
        C: Codec<T>,
    {
        self.send_inner(cancel, message, topic, None).await
    }

    /// 带 key 发送
    pub async fn send_message_with_key<T>(
        &self,
        cancel: &CancellationToken,
        message: &T,
        topic: &str,
        key: &[u8],
    ) -> MqResult<DeliveryResult>
    where
        C: Codec<T>,
    {
        self.send_inner(cancel, message, topic, Some(key)).await
    }

    async fn send_inner<T>(
        &self,
        cancel: &CancellationToken,
        message: &T,
        topic: &str,
        key: Option<&[u8]>,
    ) -> MqResult<DeliveryResult>
    where
        C: Codec<T>,
    {
        // 已取消的 token 不做任何编码和投递
        if cancel.is_cancelled() {
            return Err(MqError::Cancelled);
        }
        if self.is_closed() {
            return Err(MqError::closed("producer is closed"));
        }
        if topic.trim().is_empty() {
            return Err(MqError::invalid_argument("topic must not be empty"));
        }

        let payload = self.codec.encode(message)?;
        let mut record = OutboundRecord::new(topic, payload);
        if let Some(key) = key {
            record = record.with_key(key);
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(MqError::Cancelled),
            result = self.backend.deliver(record) => result,
        };

        match &result {
            Ok(delivery) => {
                counters::topic(counters::MESSAGES_PRODUCED, topic);
                debug!(
                    topic = topic,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "Message delivered"
                );
            }
            Err(MqError::Cancelled) => {
                debug!(topic = topic, "Send cancelled before acknowledgment");
            }
            Err(e) => {
                counters::failure(counters::DELIVERY_FAILURES, topic, e.kind());
                warn!(topic = topic, error = %e, "Message delivery failed");
            }
        }

        result
    }

    /// 关闭生产者，可重复调用
    pub async fn shutdown(&self) -> MqResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.backend.close().await?;
        info!("Producer closed");
        Ok(())
    }
}

#[async_trait]
impl<T, B, C> Producer<T> for SyncProducer<B, C>
where
    T: Send + Sync + 'static,
    B: ProducerBackend + 'static,
    C: Codec<T> + 'static,
{
    async fn send(
        &self,
        cancel: &CancellationToken,
        message: &T,
        topic: &str,
    ) -> MqResult<DeliveryResult> {
        self.send_message(cancel, message, topic).await
    }

    async fn send_with_key(
        &self,
        cancel: &CancellationToken,
        message: &T,
        topic: &str,
        key: &[u8],
    ) -> MqResult<DeliveryResult> {
        self.send_message_with_key(cancel, message, topic, key).await
    }

    async fn close(&self) -> MqResult<()> {
        self.shutdown().await
    }
}
