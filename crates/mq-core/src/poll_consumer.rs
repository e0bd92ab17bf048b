//! 单连接轮询消费者

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use courier_common::{BackoffPolicy, sleep_or_cancel};
use courier_errors::{MqError, MqResult};
use courier_ports::{ClaimHandler, Codec, ConsumedRecord, Consumer};
use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{PollBackend, PollEvent};
use crate::counters;
use crate::topic::parse_topic_list;

/// 轮询消费错误
#[derive(Debug, Error)]
pub enum ConsumeError {
    /// 负载无法解码，原始记录交还调用方，不会被自动提交
    #[error("Failed to decode {record}: {source}")]
    Decode {
        record: ConsumedRecord,
        #[source]
        source: MqError,
    },

    #[error(transparent)]
    Broker(#[from] MqError),
}

impl ConsumeError {
    /// 解码失败时的原始记录
    pub fn record(&self) -> Option<&ConsumedRecord> {
        match self {
            ConsumeError::Decode { record, .. } => Some(record),
            ConsumeError::Broker(_) => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ConsumeError::Broker(e) if e.is_cancelled())
    }
}

impl From<ConsumeError> for MqError {
    fn from(err: ConsumeError) -> Self {
        match err {
            ConsumeError::Decode { source, .. } => source,
            ConsumeError::Broker(e) => e,
        }
    }
}

/// 轮询选项
#[derive(Debug, Clone, Copy)]
pub struct PollOptions {
    /// 单次轮询的最长等待
    pub poll_timeout: Duration,
    /// 连续瞬时错误之间的退避，任何一次成功轮询后重置
    pub transient_backoff: BackoffPolicy,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(100),
            transient_backoff: BackoffPolicy::default(),
        }
    }
}

/// 单连接轮询消费者
///
/// `consume_message` 返回第一条解码成功的消息；提交与消费解耦，由调用方决定何时 `commit`
pub struct PollConsumer<B, C> {
    backend: Arc<B>,
    codec: Arc<C>,
    options: PollOptions,
    subscription: Mutex<Option<Vec<String>>>,
    closed: AtomicBool,
}

impl<B, C> PollConsumer<B, C>
where
    B: PollBackend,
{
    pub fn new(backend: Arc<B>, codec: Arc<C>, options: PollOptions) -> Self {
        Self {
            backend,
            codec,
            options,
            subscription: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 当前订阅的 topic
    pub fn subscription(&self) -> Option<Vec<String>> {
        self.subscription.lock().clone()
    }

    /// 轮询直到拿到一条消息
    ///
    /// `topic` 可以是单个名称或逗号分隔的列表；与当前订阅不同时重新订阅
    pub async fn consume_message<T>(
        &self,
        cancel: &CancellationToken,
        topic: &str,
    ) -> Result<(T, ConsumedRecord), ConsumeError>
    where
        C: Codec<T>,
    {
        if cancel.is_cancelled() {
            return Err(MqError::Cancelled.into());
        }
        if self.is_closed() {
            return Err(MqError::closed("poll consumer is closed").into());
        }

        let topics = parse_topic_list(topic)?;
        self.ensure_subscribed(&topics).await?;

        let mut transient_errors: u32 = 0;
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(topic = topic, "Poll cancelled");
                    return Err(MqError::Cancelled.into());
                }
                event = self.backend.poll(self.options.poll_timeout) => event,
            };

            match event {
                PollEvent::Record(record) => {
                    counters::topic(counters::MESSAGES_CONSUMED, &record.topic);
                    return match self.codec.decode(&record.payload) {
                        Ok(message) => {
                            debug!(
                                topic = %record.topic,
                                partition = record.partition,
                                offset = record.offset,
                                "Message received"
                            );
                            Ok((message, record))
                        }
                        Err(source) => {
                            counters::failure(
                                counters::DECODE_FAILURES,
                                &record.topic,
                                source.kind(),
                            );
                            warn!(
                                topic = %record.topic,
                                partition = record.partition,
                                offset = record.offset,
                                error = %source,
                                "Failed to decode message"
                            );
                            Err(ConsumeError::Decode { record, source })
                        }
                    };
                }
                PollEvent::Error(e) if e.is_fatal() => {
                    error!(topic = topic, error = %e, "Fatal consumer error, closing");
                    self.close_quietly().await;
                    return Err(e.into());
                }
                PollEvent::Error(e) => {
                    counters::failure(counters::TRANSIENT_ERRORS, topic, e.kind());
                    let delay = self
                        .options
                        .transient_backoff
                        .delay_for_attempt(transient_errors);
                    transient_errors = transient_errors.saturating_add(1);
                    warn!(
                        topic = topic,
                        error = %e,
                        attempt = transient_errors,
                        delay_ms = delay.as_millis() as u64,
                        "Transient consumer error, polling again"
                    );
                    if !sleep_or_cancel(delay, cancel).await {
                        return Err(MqError::Cancelled.into());
                    }
                }
                PollEvent::Empty => {
                    transient_errors = 0;
                }
            }
        }
    }

    async fn ensure_subscribed(&self, topics: &[String]) -> MqResult<()> {
        let current = self.subscription.lock().clone();
        if current.as_deref() == Some(topics) {
            return Ok(());
        }

        if let Err(e) = self.backend.subscribe(topics).await {
            error!(topics = ?topics, error = %e, "Failed to subscribe, closing consumer");
            self.close_quietly().await;
            return Err(e);
        }

        info!(topics = ?topics, "Subscribed to topics");
        *self.subscription.lock() = Some(topics.to_vec());
        Ok(())
    }

    /// 同步提交 `record.offset + 1`
    pub async fn commit(&self, record: &ConsumedRecord) -> MqResult<()> {
        if self.is_closed() {
            return Err(MqError::closed("poll consumer is closed"));
        }

        self.backend.commit(record).await?;
        counters::topic(counters::OFFSETS_COMMITTED, &record.topic);
        debug!(
            topic = %record.topic,
            partition = record.partition,
            offset = record.next_offset(),
            "Offset committed"
        );
        Ok(())
    }

    /// 关闭消费者，可重复调用
    pub async fn shutdown(&self) -> MqResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.subscription.lock().take();
        self.backend.close().await?;
        info!("Poll consumer closed");
        Ok(())
    }

    async fn close_quietly(&self) {
        if let Err(e) = self.shutdown().await {
            warn!(error = %e, "Failed to close poll consumer");
        }
    }
}

/// 处理器返回的错误统一归为 `Handler`，取消保持原样
pub(crate) fn handler_failure(err: MqError) -> MqError {
    match err {
        MqError::Handler(_) | MqError::Cancelled => err,
        other => MqError::handler(other.to_string()),
    }
}

#[async_trait]
impl<T, B, C> Consumer<T> for PollConsumer<B, C>
where
    T: Send + 'static,
    B: PollBackend + 'static,
    C: Codec<T> + 'static,
{
    /// 循环 consume_message -> handler -> commit
    ///
    /// 解码或处理器失败时停止并返回错误，该记录不提交
    async fn consume(
        &self,
        cancel: &CancellationToken,
        topics: &str,
        handler: Arc<dyn ClaimHandler<T>>,
    ) -> MqResult<()> {
        loop {
            let (message, record) = self.consume_message::<T>(cancel, topics).await?;

            if let Err(e) = handler.handle(message, &record).await {
                counters::failure(counters::HANDLER_FAILURES, &record.topic, e.kind());
                warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Handler failed, offset not committed"
                );
                return Err(handler_failure(e));
            }

            self.commit(&record).await?;
        }
    }

    async fn close(&self) -> MqResult<()> {
        self.shutdown().await
    }
}
