//! courier-bootstrap - 启动骨架
//!
//! 按配置组装生产者和消费者，初始化遥测，处理关闭信号

mod messaging;
mod runtime;
mod shutdown;

pub use messaging::*;
pub use runtime::*;
pub use shutdown::*;
