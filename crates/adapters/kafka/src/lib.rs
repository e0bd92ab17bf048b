//! adapter-kafka - Kafka 后端
//!
//! 基于 librdkafka 实现三个后端：
//! - `KafkaProducer`：`FutureProducer`，逐条确认
//! - `KafkaPollConsumer`：`StreamConsumer` 单连接轮询，手动提交
//! - `KafkaGroupConsumer`：消费组会话，每个分区一个认领任务

mod config;
mod consumer;
mod error;
mod group;
mod producer;

pub use config::*;
pub use consumer::KafkaPollConsumer;
pub use group::KafkaGroupConsumer;
pub use producer::KafkaProducer;
