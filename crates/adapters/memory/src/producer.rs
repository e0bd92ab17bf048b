//! Memory Producer

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use courier_errors::{MqError, MqResult};
use courier_mq_core::ProducerBackend;
use courier_ports::{DeliveryResult, OutboundRecord};
use tracing::debug;

use crate::broker::MemoryBroker;

/// 进程内投递后端，追加即确认
pub struct MemoryProducer {
    broker: MemoryBroker,
    closed: AtomicBool,
}

impl MemoryProducer {
    pub fn new(broker: MemoryBroker) -> Self {
        Self {
            broker,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ProducerBackend for MemoryProducer {
    async fn deliver(&self, record: OutboundRecord) -> MqResult<DeliveryResult> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MqError::closed("memory producer is closed"));
        }
        let topic = record.topic.clone();
        let delivery = self.broker.append(record)?;
        debug!(
            topic = %topic,
            partition = delivery.partition,
            offset = delivery.offset,
            "Record appended"
        );
        Ok(delivery)
    }

    async fn close(&self) -> MqResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
