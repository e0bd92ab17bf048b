//! 消费组消费者
//!
//! `consume` 在后台任务里运行 join 循环：每一轮加入消费组、认领分区、逐条回调处理器，
//! 会话因 rebalance 或错误结束后重新加入，直到 token 被取消或出现致命错误。
//! 第一次 rebalance 完成时打开一次性就绪信号。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use courier_common::{BackoffPolicy, sleep_or_cancel};
use courier_errors::{MqError, MqResult};
use courier_ports::{ClaimHandler, Codec, ConsumedRecord, Consumer};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{GroupBackend, OffsetMarker, SessionHandler, SessionInfo};
use crate::counters;
use crate::poll_consumer::handler_failure;
use crate::session::{ConsumerSession, ReadyGate, SessionState};
use crate::topic::parse_topic_list;

/// 消费组选项
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupOptions {
    /// 会话失败后重新加入前的退避
    pub rejoin_backoff: BackoffPolicy,
}

/// 消费组消费者
pub struct GroupConsumer<B, C> {
    backend: Arc<B>,
    codec: Arc<C>,
    options: GroupOptions,
    ready: ReadyGate,
    state: Arc<watch::Sender<SessionState>>,
    closed: AtomicBool,
}

impl<B, C> GroupConsumer<B, C>
where
    B: GroupBackend + 'static,
    C: Send + Sync + 'static,
{
    pub fn new(backend: Arc<B>, codec: Arc<C>, options: GroupOptions) -> Self {
        let (state, _rx) = watch::channel(SessionState::NotJoined);
        Self {
            backend,
            codec,
            options,
            ready: ReadyGate::new(),
            state: Arc::new(state),
            closed: AtomicBool::new(false),
        }
    }

    pub fn group_id(&self) -> &str {
        self.backend.group_id()
    }

    /// 就绪信号，第一次会话建立后变为 true
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.is_open()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 加入消费组并持续认领 `topic_list` 中的 topic
    ///
    /// 一直阻塞到 `cancel` 被取消或出现致命错误。取消时若最后一次会话失败则返回该错误，
    /// 否则返回 `Cancelled`
    pub async fn run<T>(
        &self,
        cancel: &CancellationToken,
        topic_list: &str,
        handler: Arc<dyn ClaimHandler<T>>,
    ) -> MqResult<()>
    where
        T: Send + 'static,
        C: Codec<T>,
    {
        if self.is_closed() {
            return Err(MqError::closed("group consumer is closed"));
        }
        let topics = parse_topic_list(topic_list)?;
        if cancel.is_cancelled() {
            return Err(MqError::Cancelled);
        }

        self.ready.reset();
        let session = ConsumerSession::new(self.backend.group_id(), topics, self.ready.clone());
        let driver: Arc<dyn SessionHandler> = Arc::new(ClaimDriver {
            codec: self.codec.clone(),
            handler,
            ready: self.ready.clone(),
            state: self.state.clone(),
        });

        info!(
            group_id = %session.group_id,
            topics = ?session.topics,
            "Starting consumer group"
        );

        let mut join = tokio::spawn(run_join_loop(
            self.backend.clone(),
            cancel.clone(),
            session,
            driver,
            self.options.rejoin_backoff,
            self.state.clone(),
        ));

        let mut ready_rx = self.ready.subscribe();
        let finished = tokio::select! {
            result = &mut join => Some(result),
            _ = async { let _ = ready_rx.wait_for(|ready| *ready).await; } => {
                info!(group_id = %self.group_id(), "Consumer group up and running");
                None
            }
        };

        let result = match finished {
            Some(result) => result,
            None => join.await,
        };

        result.map_err(|e| MqError::internal(format!("Consumer group loop failed: {}", e)))?
    }

    /// 离开消费组，可重复调用
    pub async fn shutdown(&self) -> MqResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.state.send_replace(SessionState::Closed);
        self.backend.close().await?;
        info!(group_id = %self.group_id(), "Consumer group closed");
        Ok(())
    }
}

/// 状态迁移，Closed 之后不再变化
fn transition(state: &watch::Sender<SessionState>, next: SessionState) {
    state.send_if_modified(|current| {
        if *current == SessionState::Closed || *current == next {
            false
        } else {
            *current = next;
            true
        }
    });
}

async fn run_join_loop<B>(
    backend: Arc<B>,
    cancel: CancellationToken,
    session: ConsumerSession,
    handler: Arc<dyn SessionHandler>,
    backoff: BackoffPolicy,
    state: Arc<watch::Sender<SessionState>>,
) -> MqResult<()>
where
    B: GroupBackend,
{
    let mut last_error: Option<MqError> = None;
    let mut failures: u32 = 0;

    let result = loop {
        if cancel.is_cancelled() {
            break Err(last_error.take().unwrap_or(MqError::Cancelled));
        }

        transition(&state, SessionState::Joining);
        match backend
            .run_session(&cancel, &session.topics, handler.clone())
            .await
        {
            Ok(()) => {
                failures = 0;
                last_error = None;
                debug!(group_id = %session.group_id, "Session ended, rejoining");
            }
            Err(e) if e.is_cancelled() => {
                break Err(last_error.take().unwrap_or(MqError::Cancelled));
            }
            Err(e) if e.is_fatal() => {
                counters::group(counters::GROUP_SESSION_FAILURES, &session.group_id);
                error!(
                    group_id = %session.group_id,
                    error = %e,
                    "Fatal consumer group error, leaving join loop"
                );
                break Err(e);
            }
            Err(e) => {
                counters::group(counters::GROUP_SESSION_FAILURES, &session.group_id);
                let delay = backoff.delay_for_attempt(failures);
                failures = failures.saturating_add(1);
                warn!(
                    group_id = %session.group_id,
                    error = %e,
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    "Consumer group session failed, rejoining"
                );
                last_error = Some(e);
                // 等待被取消时回到循环顶部返回 last_error
                sleep_or_cancel(delay, &cancel).await;
            }
        }
    };

    if let Err(e) = backend.leave().await {
        warn!(group_id = %session.group_id, error = %e, "Failed to leave consumer group");
    }
    transition(&state, SessionState::NotJoined);
    info!(group_id = %session.group_id, "Consumer group loop stopped");
    result
}

/// 把会话回调翻译成 解码 -> 处理器 -> 标记
struct ClaimDriver<T, C> {
    codec: Arc<C>,
    handler: Arc<dyn ClaimHandler<T>>,
    ready: ReadyGate,
    state: Arc<watch::Sender<SessionState>>,
}

#[async_trait]
impl<T, C> SessionHandler for ClaimDriver<T, C>
where
    T: Send + 'static,
    C: Codec<T> + 'static,
{
    fn session_established(&self, session: &SessionInfo) {
        counters::group(counters::GROUP_SESSIONS, &session.group_id);
        transition(&self.state, SessionState::Claiming);
        info!(
            group_id = %session.group_id,
            member_id = %session.member_id,
            generation = session.generation,
            claims = session.claims.len(),
            "Consumer group session established"
        );
        if self.ready.open() {
            debug!(group_id = %session.group_id, "Readiness signaled");
        }
    }

    fn session_torn_down(&self, session: &SessionInfo) {
        transition(&self.state, SessionState::Rebalancing);
        info!(
            group_id = %session.group_id,
            member_id = %session.member_id,
            generation = session.generation,
            "Consumer group session torn down"
        );
    }

    async fn message_claimed(
        &self,
        marker: &dyn OffsetMarker,
        record: ConsumedRecord,
    ) -> MqResult<()> {
        counters::topic(counters::MESSAGES_CONSUMED, &record.topic);

        let message = match self.codec.decode(&record.payload) {
            Ok(message) => message,
            Err(e) => {
                counters::failure(counters::DECODE_FAILURES, &record.topic, e.kind());
                warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Failed to decode claimed message"
                );
                return Err(e);
            }
        };

        if let Err(e) = self.handler.handle(message, &record).await {
            counters::failure(counters::HANDLER_FAILURES, &record.topic, e.kind());
            warn!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                error = %e,
                "Handler failed, offset not marked"
            );
            return Err(handler_failure(e));
        }

        marker.mark(&record)?;
        debug!(
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            "Offset marked"
        );
        Ok(())
    }
}

#[async_trait]
impl<T, B, C> Consumer<T> for GroupConsumer<B, C>
where
    T: Send + 'static,
    B: GroupBackend + 'static,
    C: Codec<T> + 'static,
{
    async fn consume(
        &self,
        cancel: &CancellationToken,
        topics: &str,
        handler: Arc<dyn ClaimHandler<T>>,
    ) -> MqResult<()> {
        self.run(cancel, topics, handler).await
    }

    async fn close(&self) -> MqResult<()> {
        self.shutdown().await
    }
}
