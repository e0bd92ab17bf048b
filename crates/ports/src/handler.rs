//! ClaimHandler trait 定义

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use courier_errors::MqResult;

use crate::ConsumedRecord;

/// 认领消息处理器
///
/// 每条认领的消息在每次投递中至多调用一次；返回 `Ok` 后该 offset 才会被标记
#[async_trait]
pub trait ClaimHandler<T: Send + 'static>: Send + Sync {
    async fn handle(&self, message: T, record: &ConsumedRecord) -> MqResult<()>;
}

/// 闭包形式的处理器
pub struct FnHandler<T, F> {
    f: F,
    _marker: PhantomData<fn(T)>,
}

#[async_trait]
impl<T, F, Fut> ClaimHandler<T> for FnHandler<T, F>
where
    T: Send + 'static,
    F: Fn(T, ConsumedRecord) -> Fut + Send + Sync,
    Fut: Future<Output = MqResult<()>> + Send,
{
    async fn handle(&self, message: T, record: &ConsumedRecord) -> MqResult<()> {
        (self.f)(message, record.clone()).await
    }
}

/// 用闭包构造处理器
pub fn handler_fn<T, F, Fut>(f: F) -> Arc<dyn ClaimHandler<T>>
where
    T: Send + 'static,
    F: Fn(T, ConsumedRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MqResult<()>> + Send + 'static,
{
    Arc::new(FnHandler {
        f,
        _marker: PhantomData,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_errors::MqError;

    fn record() -> ConsumedRecord {
        ConsumedRecord {
            topic: "t1".to_string(),
            partition: 0,
            offset: 7,
            key: None,
            payload: Vec::new(),
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn test_handler_fn() {
        let handler = handler_fn(|message: String, record: ConsumedRecord| async move {
            if message == "ping" && record.offset == 7 {
                Ok(())
            } else {
                Err(MqError::handler("unexpected message"))
            }
        });

        assert!(handler.handle("ping".to_string(), &record()).await.is_ok());
        assert!(handler.handle("pong".to_string(), &record()).await.is_err());
    }
}
