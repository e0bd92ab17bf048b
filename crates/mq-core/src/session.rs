//! 消费组会话状态

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

/// 消费组成员状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// 尚未调用 consume，或 join 循环已退出
    #[default]
    NotJoined,
    /// 正在加入消费组
    Joining,
    /// 已分配分区，正在认领消息
    Claiming,
    /// 会话被拆除，等待重新加入
    Rebalancing,
    /// 已关闭
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::NotJoined => "not_joined",
            SessionState::Joining => "joining",
            SessionState::Claiming => "claiming",
            SessionState::Rebalancing => "rebalancing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// 一次性就绪信号
///
/// 第一次 rebalance 完成后打开，之后的 rebalance 不会再次触发
#[derive(Debug, Clone)]
pub struct ReadyGate {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ReadyGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// 打开就绪信号，只有第一次调用返回 true
    pub fn open(&self) -> bool {
        self.tx.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        })
    }

    /// 新一轮 consume 开始前重置
    pub fn reset(&self) {
        self.tx.send_if_modified(|ready| std::mem::replace(ready, false));
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// 等待就绪
    pub async fn wait(&self) {
        let mut rx = self.subscribe();
        // Sender 由 self 持有，wait_for 不会因通道关闭而失败
        let _ = rx.wait_for(|ready| *ready).await;
    }
}

/// 一次 consume 调用对应的消费组成员关系
#[derive(Debug, Clone)]
pub struct ConsumerSession {
    pub group_id: String,
    pub topics: Vec<String>,
    pub ready: ReadyGate,
}

impl ConsumerSession {
    pub fn new(group_id: impl Into<String>, topics: Vec<String>, ready: ReadyGate) -> Self {
        Self {
            group_id: group_id.into(),
            topics,
            ready,
        }
    }
}
