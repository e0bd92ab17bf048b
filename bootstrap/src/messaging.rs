//! 消息客户端工厂
//!
//! 根据 `MessagingConfig` 选择后端和消费模式，对外只暴露 `Producer<T>` / `Consumer<T>`

use std::sync::Arc;

use courier_adapter_kafka::{
    ConsumerConfig, KafkaGroupConsumer, KafkaPollConsumer, KafkaProducer, ProducerConfig,
};
use courier_adapter_memory::{MemoryBroker, MemoryGroupConsumer, MemoryPollConsumer, MemoryProducer};
use courier_common::BackoffPolicy;
use courier_config::{BackendKind, BackoffConfig, ConsumerMode, MessagingConfig};
use courier_errors::{MqError, MqResult};
use courier_mq_core::{GroupConsumer, GroupOptions, PollConsumer, PollOptions, SyncProducer};
use courier_ports::{Codec, Consumer, Producer};
use tracing::info;

fn backoff_policy(config: &BackoffConfig) -> BackoffPolicy {
    BackoffPolicy::new(config.initial(), config.max()).with_multiplier(config.multiplier)
}

/// 消息客户端工厂
///
/// memory 后端下所有客户端共享同一个进程内 broker
pub struct Messaging {
    config: MessagingConfig,
    broker: Option<MemoryBroker>,
}

impl Messaging {
    pub fn new(config: MessagingConfig) -> MqResult<Self> {
        config.validate().map_err(|e| MqError::config(e.to_string()))?;
        let broker = match config.backend {
            BackendKind::Memory => Some(MemoryBroker::new()),
            BackendKind::Kafka => None,
        };

        info!(
            backend = ?config.backend,
            consumer_mode = ?config.consumer_mode,
            group_id = %config.group_id,
            "Messaging initialized"
        );
        Ok(Self { config, broker })
    }

    /// 使用外部提供的进程内 broker
    pub fn with_broker(config: MessagingConfig, broker: MemoryBroker) -> MqResult<Self> {
        if config.backend != BackendKind::Memory {
            return Err(MqError::config("an in-process broker requires the memory backend"));
        }
        config.validate().map_err(|e| MqError::config(e.to_string()))?;
        Ok(Self {
            config,
            broker: Some(broker),
        })
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.config
    }

    /// memory 后端使用的 broker
    pub fn broker(&self) -> Option<&MemoryBroker> {
        self.broker.as_ref()
    }

    pub fn poll_options(&self) -> PollOptions {
        PollOptions {
            poll_timeout: self.config.poll_timeout(),
            transient_backoff: backoff_policy(&self.config.transient_backoff),
        }
    }

    pub fn group_options(&self) -> GroupOptions {
        GroupOptions {
            rejoin_backoff: backoff_policy(&self.config.rejoin_backoff),
        }
    }

    fn memory_broker(&self) -> MqResult<&MemoryBroker> {
        self.broker
            .as_ref()
            .ok_or_else(|| MqError::internal("memory backend without a broker"))
    }

    /// 创建同步生产者
    pub fn producer<T, C>(&self, codec: C) -> MqResult<Arc<dyn Producer<T>>>
    where
        T: Send + Sync + 'static,
        C: Codec<T> + 'static,
    {
        let codec = Arc::new(codec);
        let producer: Arc<dyn Producer<T>> = match self.config.backend {
            BackendKind::Kafka => {
                let backend = KafkaProducer::new(&ProducerConfig::from_messaging(&self.config))?;
                Arc::new(SyncProducer::new(Arc::new(backend), codec))
            }
            BackendKind::Memory => {
                let backend = MemoryProducer::new(self.memory_broker()?.clone());
                Arc::new(SyncProducer::new(Arc::new(backend), codec))
            }
        };
        Ok(producer)
    }

    /// 按配置的消费模式创建消费者
    pub fn consumer<T, C>(&self, codec: C) -> MqResult<Arc<dyn Consumer<T>>>
    where
        T: Send + 'static,
        C: Codec<T> + 'static,
    {
        match self.config.consumer_mode {
            ConsumerMode::Poll => self.poll_consumer(codec),
            ConsumerMode::Group => self.group_consumer(codec),
        }
    }

    /// 单连接轮询消费者
    pub fn poll_consumer<T, C>(&self, codec: C) -> MqResult<Arc<dyn Consumer<T>>>
    where
        T: Send + 'static,
        C: Codec<T> + 'static,
    {
        let codec = Arc::new(codec);
        let options = self.poll_options();
        let consumer: Arc<dyn Consumer<T>> = match self.config.backend {
            BackendKind::Kafka => {
                let backend =
                    KafkaPollConsumer::new(&ConsumerConfig::from_messaging(&self.config))?;
                Arc::new(PollConsumer::new(Arc::new(backend), codec, options))
            }
            BackendKind::Memory => {
                let backend = MemoryPollConsumer::new(
                    self.memory_broker()?.clone(),
                    self.config.group_id.as_str(),
                    self.config.auto_offset_reset,
                );
                Arc::new(PollConsumer::new(Arc::new(backend), codec, options))
            }
        };
        Ok(consumer)
    }

    /// 消费组消费者
    pub fn group_consumer<T, C>(&self, codec: C) -> MqResult<Arc<dyn Consumer<T>>>
    where
        T: Send + 'static,
        C: Codec<T> + 'static,
    {
        let codec = Arc::new(codec);
        let options = self.group_options();
        let consumer: Arc<dyn Consumer<T>> = match self.config.backend {
            BackendKind::Kafka => {
                let backend = KafkaGroupConsumer::new(
                    &ConsumerConfig::from_messaging(&self.config),
                    self.config.commit_interval(),
                )?;
                Arc::new(GroupConsumer::new(Arc::new(backend), codec, options))
            }
            BackendKind::Memory => {
                let backend = MemoryGroupConsumer::new(
                    self.memory_broker()?.clone(),
                    self.config.group_id.as_str(),
                    self.config.auto_offset_reset,
                    self.config.commit_interval(),
                );
                Arc::new(GroupConsumer::new(Arc::new(backend), codec, options))
            }
        };
        Ok(consumer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_rejected() {
        let config = MessagingConfig::memory("");
        let err = Messaging::new(config).err().unwrap();
        assert!(matches!(err, MqError::Config(_)));
    }

    #[test]
    fn test_external_broker_requires_memory_backend() {
        let config = MessagingConfig::new("localhost:9092", "g1");
        assert!(Messaging::with_broker(config, MemoryBroker::new()).is_err());
    }

    #[test]
    fn test_options_follow_config() {
        let mut config = MessagingConfig::memory("g1");
        config.poll_timeout_ms = 250;
        config.transient_backoff = BackoffConfig {
            initial_ms: 10,
            max_ms: 40,
            multiplier: 2.0,
        };
        let messaging = Messaging::new(config).unwrap();

        let poll = messaging.poll_options();
        assert_eq!(poll.poll_timeout.as_millis(), 250);
        assert_eq!(poll.transient_backoff.delay_for_attempt(0).as_millis(), 10);
        assert_eq!(poll.transient_backoff.delay_for_attempt(5).as_millis(), 40);
        assert!(messaging.broker().is_some());
    }
}
