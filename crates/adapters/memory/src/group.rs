//! Memory 消费组后端

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use courier_config::AutoOffsetReset;
use courier_errors::{MqError, MqResult};
use courier_mq_core::{GroupBackend, OffsetMarker, SessionHandler, SessionInfo, TopicPartition};
use courier_ports::ConsumedRecord;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::MemoryBroker;

/// 会话内已标记、尚未提交的 offset
struct PendingMarks {
    marks: Mutex<HashMap<TopicPartition, i64>>,
}

impl PendingMarks {
    fn new() -> Self {
        Self {
            marks: Mutex::new(HashMap::new()),
        }
    }

    fn flush(&self, broker: &MemoryBroker, group_id: &str) -> usize {
        let marks: Vec<_> = self.marks.lock().drain().collect();
        for (tp, next_offset) in &marks {
            broker.commit(group_id, &tp.topic, tp.partition, *next_offset);
        }
        marks.len()
    }
}

impl OffsetMarker for PendingMarks {
    fn mark(&self, record: &ConsumedRecord) -> MqResult<()> {
        let tp = TopicPartition::new(record.topic.as_str(), record.partition);
        let mut marks = self.marks.lock();
        let entry = marks.entry(tp).or_insert(record.next_offset());
        if record.next_offset() > *entry {
            *entry = record.next_offset();
        }
        Ok(())
    }
}

/// 进程内消费组后端
///
/// 每个实例是一个组成员；同组的其它成员加入或离开时，当前会话结束并重新加入
pub struct MemoryGroupConsumer {
    broker: MemoryBroker,
    group_id: String,
    member_id: String,
    reset: AutoOffsetReset,
    commit_interval: Duration,
    closed: AtomicBool,
}

impl MemoryGroupConsumer {
    pub fn new(
        broker: MemoryBroker,
        group_id: impl Into<String>,
        reset: AutoOffsetReset,
        commit_interval: Duration,
    ) -> Self {
        let group_id = group_id.into();
        let member_id = format!("{}-{}", group_id, Uuid::new_v4());
        Self {
            broker,
            group_id,
            member_id,
            reset,
            commit_interval,
            closed: AtomicBool::new(false),
        }
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }
}

/// 认领单个分区，直到会话结束或处理失败
async fn claim_partition(
    broker: MemoryBroker,
    group_id: String,
    tp: TopicPartition,
    reset: AutoOffsetReset,
    session: CancellationToken,
    handler: Arc<dyn SessionHandler>,
    marks: Arc<PendingMarks>,
) -> MqResult<()> {
    let mut position = broker.start_offset(&group_id, &tp, reset);
    let mut appends = broker.watch_appends();
    debug!(group_id = %group_id, claim = %tp, position = position, "Claim started");

    loop {
        if session.is_cancelled() {
            return Ok(());
        }

        appends.borrow_and_update();
        match broker.fetch(&tp.topic, tp.partition, position) {
            Some(record) => {
                handler.message_claimed(marks.as_ref(), record).await?;
                position += 1;
            }
            None => {
                tokio::select! {
                    _ = session.cancelled() => return Ok(()),
                    changed = appends.changed() => {
                        if changed.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl GroupBackend for MemoryGroupConsumer {
    fn group_id(&self) -> &str {
        &self.group_id
    }

    async fn run_session(
        &self,
        cancel: &CancellationToken,
        topics: &[String],
        handler: Arc<dyn SessionHandler>,
    ) -> MqResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MqError::closed("memory group consumer is closed"));
        }

        let mut rebalances = self.broker.watch_rebalances();
        rebalances.borrow_and_update();
        let generation = self.broker.join_group(&self.group_id, &self.member_id, topics);
        let claims = self.broker.assignment(&self.group_id, &self.member_id);
        let info = SessionInfo {
            group_id: self.group_id.clone(),
            member_id: self.member_id.clone(),
            generation,
            claims: claims.clone(),
        };

        let session = cancel.child_token();
        let marks = Arc::new(PendingMarks::new());
        handler.session_established(&info);

        let mut tasks = JoinSet::new();
        for tp in claims {
            tasks.spawn(claim_partition(
                self.broker.clone(),
                self.group_id.clone(),
                tp,
                self.reset,
                session.clone(),
                handler.clone(),
                marks.clone(),
            ));
        }

        let mut commit_tick =
            tokio::time::interval(self.commit_interval.max(Duration::from_millis(1)));
        commit_tick.tick().await;

        let mut result = Ok(());
        loop {
            tokio::select! {
                _ = session.cancelled() => break,
                changed = rebalances.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if self.broker.generation(&self.group_id) != generation {
                        info!(
                            group_id = %self.group_id,
                            generation = generation,
                            "Rebalance requested, ending session"
                        );
                        break;
                    }
                }
                joined = tasks.join_next(), if !tasks.is_empty() => {
                    match joined {
                        Some(Ok(Ok(()))) | None => {}
                        Some(Ok(Err(e))) => {
                            result = Err(e);
                            break;
                        }
                        Some(Err(e)) => {
                            result = Err(MqError::internal(format!("claim task failed: {}", e)));
                            break;
                        }
                    }
                }
                _ = commit_tick.tick() => {
                    marks.flush(&self.broker, &self.group_id);
                }
            }
        }

        // 停止认领，等待正在执行的处理器返回
        session.cancel();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Err(e)) if result.is_ok() => result = Err(e),
                Err(e) if result.is_ok() => {
                    result = Err(MqError::internal(format!("claim task failed: {}", e)));
                }
                _ => {}
            }
        }

        let flushed = marks.flush(&self.broker, &self.group_id);
        debug!(group_id = %self.group_id, flushed = flushed, "Marked offsets committed");
        handler.session_torn_down(&info);

        if let Err(e) = &result {
            warn!(group_id = %self.group_id, error = %e, "Memory group session failed");
        }
        result
    }

    async fn leave(&self) -> MqResult<()> {
        self.broker.leave_group(&self.group_id, &self.member_id);
        Ok(())
    }

    async fn close(&self) -> MqResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.broker.leave_group(&self.group_id, &self.member_id);
        }
        Ok(())
    }
}
