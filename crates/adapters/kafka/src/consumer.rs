//! Kafka 轮询后端

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use courier_errors::{MqError, MqResult};
use courier_mq_core::{PollBackend, PollEvent};
use courier_ports::ConsumedRecord;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, info, warn};

use crate::config::{ConsumerConfig, client_config};
use crate::error::{detach, receive_error};

/// 单连接轮询后端
///
/// `recv` 外面套一层 `tokio::time::timeout` 作为有界轮询；offset 只在调用方提交时写入
pub struct KafkaPollConsumer {
    consumer: StreamConsumer,
    group_id: String,
    closed: AtomicBool,
}

impl KafkaPollConsumer {
    pub fn new(config: &ConsumerConfig) -> MqResult<Self> {
        let consumer: StreamConsumer = client_config(config.to_client_config_entries())
            .create()
            .map_err(|e| MqError::connection(format!("Failed to create Kafka consumer: {}", e)))?;

        Ok(Self {
            consumer,
            group_id: config.group_id.clone(),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> MqResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MqError::closed("kafka consumer is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl PollBackend for KafkaPollConsumer {
    async fn subscribe(&self, topics: &[String]) -> MqResult<()> {
        self.ensure_open()?;
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&topics).map_err(|e| {
            MqError::subscription(format!("Failed to subscribe to {:?}: {}", topics, e))
        })?;

        info!(group_id = %self.group_id, topics = ?topics, "Kafka consumer subscribed");
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> PollEvent {
        if let Err(e) = self.ensure_open() {
            return PollEvent::Error(e);
        }

        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Ok(Ok(message)) => PollEvent::Record(detach(&message)),
            Ok(Err(e)) => PollEvent::Error(receive_error(e)),
            Err(_) => PollEvent::Empty,
        }
    }

    async fn commit(&self, record: &ConsumedRecord) -> MqResult<()> {
        self.ensure_open()?;

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &record.topic,
            record.partition,
            Offset::Offset(record.next_offset()),
        )
        .map_err(|e| MqError::internal(format!("Failed to add partition offset: {}", e)))?;

        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(|e| MqError::transient(format!("Failed to commit {}: {}", record, e)))?;

        debug!(
            topic = %record.topic,
            partition = record.partition,
            offset = record.next_offset(),
            "Offset committed"
        );
        Ok(())
    }

    async fn close(&self) -> MqResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.consumer.unsubscribe();
        if let Err(e) = self.consumer.unassign() {
            warn!(group_id = %self.group_id, error = %e, "Failed to unassign on close");
        }
        info!(group_id = %self.group_id, "Kafka consumer closed");
        Ok(())
    }
}
