//! Kafka Producer

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use courier_errors::{MqError, MqResult};
use courier_mq_core::ProducerBackend;
use courier_ports::{DeliveryResult, OutboundRecord};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use tracing::{debug, info, warn};

use crate::config::{ProducerConfig, client_config};

/// 关闭时等待在途消息的上限
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// 基于 `FutureProducer` 的投递后端
///
/// 多个调用方共享同一个连接，每次发送各自等待自己的确认
pub struct KafkaProducer {
    producer: FutureProducer,
    delivery_timeout: Duration,
    closed: AtomicBool,
}

impl KafkaProducer {
    pub fn new(config: &ProducerConfig) -> MqResult<Self> {
        let producer: FutureProducer = client_config(config.to_client_config_entries())
            .create()
            .map_err(|e| MqError::connection(format!("Failed to create Kafka producer: {}", e)))?;

        info!(brokers = %config.base.brokers, "Kafka producer created");
        Ok(Self {
            producer,
            delivery_timeout: config.delivery_timeout,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl ProducerBackend for KafkaProducer {
    async fn deliver(&self, record: OutboundRecord) -> MqResult<DeliveryResult> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MqError::closed("kafka producer is closed"));
        }

        let mut future_record: FutureRecord<'_, [u8], [u8]> =
            FutureRecord::to(&record.topic).payload(record.payload.as_slice());
        if let Some(key) = &record.key {
            future_record = future_record.key(key.as_slice());
        }

        let (partition, offset) = self
            .producer
            .send(future_record, Timeout::After(self.delivery_timeout))
            .await
            .map_err(|(e, _)| MqError::delivery(e.to_string()))?;

        debug!(
            topic = %record.topic,
            partition = partition,
            offset = offset,
            "Message delivered"
        );
        Ok(DeliveryResult::new(partition, offset))
    }

    async fn close(&self) -> MqResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(e) = self.producer.flush(Timeout::After(FLUSH_TIMEOUT)) {
            warn!(error = %e, "Failed to flush Kafka producer on close");
            return Err(MqError::delivery(format!("flush on close: {}", e)));
        }
        info!("Kafka producer closed");
        Ok(())
    }
}
