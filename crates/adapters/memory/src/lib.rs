//! Memory Adapter
//!
//! 进程内 broker，实现投递、单连接轮询、消费组三种后端：
//! - 分区日志与按消费组保存的已提交 offset
//! - 带 generation 的组协调器，确定性分区分配
//! - 可注入瞬时错误，便于测试重试路径

mod broker;
mod consumer;
mod group;
mod producer;

pub use broker::{BrokerOptions, MemoryBroker};
pub use consumer::MemoryPollConsumer;
pub use group::MemoryGroupConsumer;
pub use producer::MemoryProducer;
