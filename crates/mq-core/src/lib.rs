//! mq-core - 消息队列客户端核心
//!
//! 把 broker 客户端模型的投递与消费组原语组合成可取消的同步生产、轮询消费、消费组消费三种契约：
//! - [`SyncProducer`]: 发送一条消息并等待确认
//! - [`PollConsumer`]: 单连接轮询，返回第一条解码成功的消息，提交由调用方决定
//! - [`GroupConsumer`]: 加入消费组，处理器成功后才标记 offset
//!
//! 具体 broker 模型通过 [`backend`] 中的 trait 接入

pub mod backend;
pub mod codec;
pub mod counters;
pub mod group_consumer;
pub mod poll_consumer;
pub mod producer;
pub mod session;
pub mod topic;

pub use backend::*;
pub use codec::*;
pub use group_consumer::*;
pub use poll_consumer::*;
pub use producer::*;
pub use session::*;
pub use topic::*;
