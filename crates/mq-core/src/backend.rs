//! Broker 客户端模型接入点
//!
//! 每种 broker 客户端模型（librdkafka、进程内 broker）实现这里的 trait，
//! 前端（[`SyncProducer`](crate::SyncProducer)、[`PollConsumer`](crate::PollConsumer)、
//! [`GroupConsumer`](crate::GroupConsumer)）只负责编解码、取消与状态机

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_errors::{MqError, MqResult};
use courier_ports::{ConsumedRecord, DeliveryResult, OutboundRecord};
use tokio_util::sync::CancellationToken;

/// 投递后端
///
/// 每次 `deliver` 调用都有自己的完成 future，并发调用之间不会串结果
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProducerBackend: Send + Sync {
    /// 投递一条已编码的记录并等待确认
    async fn deliver(&self, record: OutboundRecord) -> MqResult<DeliveryResult>;

    /// 刷出未完成的投递并释放连接
    async fn close(&self) -> MqResult<()>;
}

/// 单次轮询的结果
#[derive(Debug)]
pub enum PollEvent {
    /// 收到一条记录
    Record(ConsumedRecord),
    /// broker 报告错误，由 [`MqError::is_fatal`] 区分瞬时与致命
    Error(MqError),
    /// 超时内没有任何事件
    Empty,
}

/// 单连接轮询后端
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PollBackend: Send + Sync {
    /// 替换当前订阅
    async fn subscribe(&self, topics: &[String]) -> MqResult<()>;

    /// 最多等待 `timeout`
    async fn poll(&self, timeout: Duration) -> PollEvent;

    /// 同步提交 `record.offset + 1`
    async fn commit(&self, record: &ConsumedRecord) -> MqResult<()>;

    async fn close(&self) -> MqResult<()>;
}

/// 分区标识
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// 一次消费组会话（一代成员关系）的描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub group_id: String,
    pub member_id: String,
    pub generation: i64,
    /// 本成员在这一代认领的分区
    pub claims: Vec<TopicPartition>,
}

/// 会话内的 offset 标记
pub trait OffsetMarker: Send + Sync {
    /// 标记 `record` 已处理，下一次提交时生效
    fn mark(&self, record: &ConsumedRecord) -> MqResult<()>;
}

/// 消费组协议回调
///
/// 后端在每次会话建立、拆除时回调，并对每条认领的消息调用 `message_claimed`。
/// 同一分区内的消息按顺序逐条回调；返回 `Err` 时后端停止该分区的认领并结束会话
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// 完成一次 rebalance，开始认领
    fn session_established(&self, session: &SessionInfo);

    /// 会话结束（rebalance、错误或取消）
    fn session_torn_down(&self, session: &SessionInfo);

    async fn message_claimed(
        &self,
        marker: &dyn OffsetMarker,
        record: ConsumedRecord,
    ) -> MqResult<()>;
}

/// 消费组后端
#[async_trait]
pub trait GroupBackend: Send + Sync {
    fn group_id(&self) -> &str;

    /// 加入消费组并运行一次会话，直到 rebalance、错误或 `cancel` 被取消
    ///
    /// rebalance 结束会话时返回 `Ok(())`，调用方随即重新加入
    async fn run_session(
        &self,
        cancel: &CancellationToken,
        topics: &[String],
        handler: Arc<dyn SessionHandler>,
    ) -> MqResult<()>;

    /// 离开消费组，交出持有的分区；之后仍可再次 `run_session` 重新加入
    async fn leave(&self) -> MqResult<()>;

    /// 离开消费组并释放连接
    async fn close(&self) -> MqResult<()>;
}
