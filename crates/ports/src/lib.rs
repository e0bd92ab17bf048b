//! ports - 抽象 trait 层
//!
//! 调用方只依赖这里的生产/消费接口，不关心背后是哪种 broker 客户端模型

mod codec;
mod consumer;
mod handler;
mod message;
mod producer;

pub use codec::*;
pub use consumer::*;
pub use handler::*;
pub use message::*;
pub use producer::*;
