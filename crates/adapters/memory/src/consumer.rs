//! Memory 轮询后端

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use courier_config::AutoOffsetReset;
use courier_errors::{MqError, MqResult};
use courier_mq_core::{PollBackend, PollEvent, TopicPartition};
use courier_ports::ConsumedRecord;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::broker::MemoryBroker;

#[derive(Debug, Default)]
struct Cursor {
    partitions: Vec<TopicPartition>,
    positions: HashMap<TopicPartition, i64>,
    /// 下一次从哪个分区开始扫描，避免某个分区饿死其它分区
    next: usize,
}

/// 进程内单连接轮询后端
///
/// 以 `group_id` 的身份读取已提交 offset，但不参与消费组分配
pub struct MemoryPollConsumer {
    broker: MemoryBroker,
    group_id: String,
    reset: AutoOffsetReset,
    cursor: Mutex<Cursor>,
    closed: AtomicBool,
}

impl MemoryPollConsumer {
    pub fn new(broker: MemoryBroker, group_id: impl Into<String>, reset: AutoOffsetReset) -> Self {
        Self {
            broker,
            group_id: group_id.into(),
            reset,
            cursor: Mutex::new(Cursor::default()),
            closed: AtomicBool::new(false),
        }
    }

    fn next_record(&self) -> Option<ConsumedRecord> {
        let mut cursor = self.cursor.lock();
        let count = cursor.partitions.len();
        for step in 0..count {
            let index = (cursor.next + step) % count;
            let tp = cursor.partitions[index].clone();
            let position = match cursor.positions.get(&tp) {
                Some(position) => *position,
                None => self.broker.start_offset(&self.group_id, &tp, self.reset),
            };

            if let Some(record) = self.broker.fetch(&tp.topic, tp.partition, position) {
                cursor.positions.insert(tp, position + 1);
                cursor.next = (index + 1) % count;
                return Some(record);
            }
            cursor.positions.insert(tp, position);
        }
        None
    }
}

#[async_trait]
impl PollBackend for MemoryPollConsumer {
    async fn subscribe(&self, topics: &[String]) -> MqResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MqError::closed("memory consumer is closed"));
        }

        let partitions = self.broker.resolve_partitions(topics);
        if partitions.is_empty() {
            return Err(MqError::subscription(format!(
                "Broker: Unknown topic or partition ({})",
                topics.join(",")
            )));
        }

        let mut positions = HashMap::new();
        for tp in &partitions {
            positions.insert(
                tp.clone(),
                self.broker.start_offset(&self.group_id, tp, self.reset),
            );
        }

        debug!(
            group_id = %self.group_id,
            partitions = partitions.len(),
            "Memory consumer subscribed"
        );
        *self.cursor.lock() = Cursor {
            partitions,
            positions,
            next: 0,
        };
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> PollEvent {
        let deadline = Instant::now() + timeout;
        let mut appends = self.broker.watch_appends();

        loop {
            if self.closed.load(Ordering::Acquire) {
                return PollEvent::Error(MqError::closed("memory consumer is closed"));
            }
            if let Some(e) = self.broker.take_transient_error() {
                return PollEvent::Error(e);
            }

            appends.borrow_and_update();
            if let Some(record) = self.next_record() {
                return PollEvent::Record(record);
            }

            match tokio::time::timeout_at(deadline, appends.changed()).await {
                Ok(Ok(())) => continue,
                // 超时或 broker 已释放
                Ok(Err(_)) | Err(_) => return PollEvent::Empty,
            }
        }
    }

    async fn commit(&self, record: &ConsumedRecord) -> MqResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MqError::closed("memory consumer is closed"));
        }
        self.broker.commit(
            &self.group_id,
            &record.topic,
            record.partition,
            record.next_offset(),
        );
        Ok(())
    }

    async fn close(&self) -> MqResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_ports::OutboundRecord;

    #[tokio::test]
    async fn test_poll_reads_from_committed_position() {
        let broker = MemoryBroker::new();
        for payload in [b"a", b"b", b"c"] {
            broker
                .append(OutboundRecord::new("t1", payload.to_vec()))
                .unwrap();
        }
        broker.commit("g1", "t1", 0, 2);

        let consumer = MemoryPollConsumer::new(broker, "g1", AutoOffsetReset::Earliest);
        consumer.subscribe(&["t1".to_string()]).await.unwrap();

        match consumer.poll(Duration::from_millis(10)).await {
            PollEvent::Record(record) => assert_eq!(record.payload, b"c"),
            other => panic!("expected a record, got {:?}", other),
        }
        assert!(matches!(
            consumer.poll(Duration::from_millis(10)).await,
            PollEvent::Empty
        ));
    }

    #[tokio::test]
    async fn test_latest_skips_existing_records() {
        let broker = MemoryBroker::new();
        broker
            .append(OutboundRecord::new("t1", b"old".to_vec()))
            .unwrap();

        let consumer = MemoryPollConsumer::new(broker.clone(), "g1", AutoOffsetReset::Latest);
        consumer.subscribe(&["t1".to_string()]).await.unwrap();
        broker
            .append(OutboundRecord::new("t1", b"new".to_vec()))
            .unwrap();

        match consumer.poll(Duration::from_millis(10)).await {
            PollEvent::Record(record) => assert_eq!(record.payload, b"new"),
            other => panic!("expected a record, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_poll_wakes_on_append() {
        let broker = MemoryBroker::new();
        broker.create_topic("t1", 1).unwrap();
        let consumer = MemoryPollConsumer::new(broker.clone(), "g1", AutoOffsetReset::Earliest);
        consumer.subscribe(&["t1".to_string()]).await.unwrap();

        let producer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer
                .append(OutboundRecord::new("t1", b"late".to_vec()))
                .unwrap();
        });

        match consumer.poll(Duration::from_secs(5)).await {
            PollEvent::Record(record) => assert_eq!(record.payload, b"late"),
            other => panic!("expected a record, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_topic_rejected_without_auto_create() {
        let broker = MemoryBroker::with_options(crate::BrokerOptions {
            auto_create_topics: false,
            ..Default::default()
        });
        let consumer = MemoryPollConsumer::new(broker, "g1", AutoOffsetReset::Earliest);

        let err = consumer
            .subscribe(&["missing".to_string()])
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
