//! courier-errors - 统一错误处理
//!
//! 消息收发链路上的错误分类：编码、瞬时、投递、取消、消费组、致命错误

use thiserror::Error;

/// 消息队列错误类型
#[derive(Debug, Error)]
pub enum MqError {
    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Decoding error: {0}")]
    Decoding(String),

    #[error("Transient broker error: {0}")]
    Transient(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Consumer group error: {0}")]
    Group(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Client closed: {0}")]
    Closed(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MqError {
    pub fn encoding(msg: impl Into<String>) -> Self {
        Self::Encoding(msg.into())
    }

    pub fn decoding(msg: impl Into<String>) -> Self {
        Self::Decoding(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn delivery(msg: impl Into<String>) -> Self {
        Self::Delivery(msg.into())
    }

    pub fn group(msg: impl Into<String>) -> Self {
        Self::Group(msg.into())
    }

    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }

    pub fn subscription(msg: impl Into<String>) -> Self {
        Self::Subscription(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn closed(msg: impl Into<String>) -> Self {
        Self::Closed(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// 是否为取消错误
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// 瞬时错误：记录日志后继续轮询/认领
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// 致命错误：关闭客户端并立即向上传播
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Subscription(_) | Self::Connection(_) | Self::Closed(_) | Self::Config(_)
        )
    }

    /// 单条消息无法处理（编解码或处理器失败）
    pub fn is_message_error(&self) -> bool {
        matches!(
            self,
            Self::Encoding(_) | Self::Decoding(_) | Self::Handler(_)
        )
    }

    /// 错误类别，用作 metrics 标签
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Encoding(_) => "encoding",
            Self::Decoding(_) => "decoding",
            Self::Transient(_) => "transient",
            Self::Delivery(_) => "delivery",
            Self::Cancelled => "cancelled",
            Self::Group(_) => "group",
            Self::Handler(_) => "handler",
            Self::Subscription(_) => "subscription",
            Self::Connection(_) => "connection",
            Self::Closed(_) => "closed",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Config(_) => "config",
            Self::Internal(_) => "internal",
        }
    }
}

/// Result 类型别名
pub type MqResult<T> = Result<T, MqError>;
