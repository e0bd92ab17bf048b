//! Kafka 消费组后端
//!
//! 一个 `StreamConsumer` 就是一个组成员。会话从拿到分区分配开始，到分区被收回、
//! 处理失败或取消为止。会话循环负责驱动 `recv`（rebalance 回调也在这里触发），
//! 把消息按分区派发给各自的认领任务，同一分区内保持顺序。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use courier_errors::{MqError, MqResult};
use courier_mq_core::{GroupBackend, OffsetMarker, SessionHandler, SessionInfo, TopicPartition};
use courier_ports::ConsumedRecord;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::KafkaResult;
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ConsumerConfig, client_config};
use crate::error::{detach, is_no_offset, receive_error};

/// 每个认领任务的待处理队列长度
const CLAIM_BUFFER: usize = 64;

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// rebalance 回调转发给会话循环的事件
#[derive(Debug)]
enum RebalanceEvent {
    Assigned(Vec<TopicPartition>),
    Revoked(Vec<TopicPartition>),
    Failed(String),
}

fn claims_of(tpl: &TopicPartitionList) -> Vec<TopicPartition> {
    let mut claims: Vec<_> = tpl
        .elements()
        .iter()
        .map(|elem| TopicPartition::new(elem.topic(), elem.partition()))
        .collect();
    claims.sort();
    claims
}

/// 消费者上下文：在 librdkafka 线程里接收 rebalance 回调
struct GroupContext {
    group_id: String,
    events: mpsc::UnboundedSender<RebalanceEvent>,
    session: parking_lot::Mutex<Option<CancellationToken>>,
    revoked: AtomicBool,
}

impl GroupContext {
    fn begin_session(&self, token: CancellationToken) {
        self.revoked.store(false, Ordering::Release);
        *self.session.lock() = Some(token);
    }

    /// 结束会话，返回期间分区是否被收回
    fn end_session(&self) -> bool {
        self.session.lock().take();
        self.revoked.swap(false, Ordering::AcqRel)
    }

    fn forward(&self, event: RebalanceEvent) {
        // 接收端随后端一起释放，发送失败说明已经关闭
        let _ = self.events.send(event);
    }
}

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(tpl) = rebalance {
            let claims = claims_of(tpl);
            info!(
                group_id = %self.group_id,
                partitions = claims.len(),
                "Partitions revoked, ending session"
            );

            // 先停止认领，再把已标记的 offset 同步提交，避免新成员重复消费
            if let Some(token) = self.session.lock().as_ref() {
                self.revoked.store(true, Ordering::Release);
                token.cancel();
            }
            match base_consumer.commit_consumer_state(CommitMode::Sync) {
                Ok(()) => {}
                Err(e) if is_no_offset(&e) => {}
                Err(e) => {
                    warn!(group_id = %self.group_id, error = %e, "Commit before revoke failed");
                }
            }
            self.forward(RebalanceEvent::Revoked(claims));
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                let claims = claims_of(tpl);
                info!(
                    group_id = %self.group_id,
                    partitions = claims.len(),
                    "Partitions assigned"
                );
                self.forward(RebalanceEvent::Assigned(claims));
            }
            Rebalance::Revoke(_) => {}
            Rebalance::Error(e) => {
                error!(group_id = %self.group_id, error = %e, "Rebalance failed");
                self.forward(RebalanceEvent::Failed(e.to_string()));
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!(group_id = %self.group_id, "Offsets committed"),
            Err(e) if is_no_offset(&e) => {}
            Err(e) => warn!(group_id = %self.group_id, error = %e, "Offset commit failed"),
        }
    }
}

type GroupStreamConsumer = StreamConsumer<GroupContext>;

/// 标记即 `store_offset`，由会话循环定期提交
struct KafkaMarker {
    consumer: Arc<GroupStreamConsumer>,
    session: CancellationToken,
}

impl OffsetMarker for KafkaMarker {
    fn mark(&self, record: &ConsumedRecord) -> MqResult<()> {
        match self
            .consumer
            .store_offset(&record.topic, record.partition, record.next_offset())
        {
            Ok(()) => Ok(()),
            Err(e) if self.session.is_cancelled() => {
                // 分区已被收回，这条消息会由新的持有者重新处理
                debug!(record = %record, error = %e, "Mark skipped after session ended");
                Ok(())
            }
            Err(e) => Err(MqError::group(format!(
                "Failed to store offset for {}: {}",
                record, e
            ))),
        }
    }
}

/// 认领任务退出时的结果
struct ClaimExit {
    claim: TopicPartition,
    /// 第一条未处理完的消息，重新认领时从这里开始
    resume: Option<i64>,
    result: MqResult<()>,
}

async fn claim_partition(
    claim: TopicPartition,
    mut records: mpsc::Receiver<ConsumedRecord>,
    session: CancellationToken,
    handler: Arc<dyn SessionHandler>,
    marker: Arc<KafkaMarker>,
) -> ClaimExit {
    loop {
        let record = tokio::select! {
            biased;
            _ = session.cancelled() => break,
            record = records.recv() => match record {
                Some(record) => record,
                None => break,
            },
        };

        let offset = record.offset;
        if let Err(e) = handler.message_claimed(marker.as_ref(), record).await {
            return ClaimExit {
                claim,
                resume: Some(offset),
                result: Err(e),
            };
        }
    }

    ClaimExit {
        claim,
        resume: records.try_recv().ok().map(|record| record.offset),
        result: Ok(()),
    }
}

fn note_resume(resume: &mut HashMap<TopicPartition, i64>, claim: TopicPartition, offset: i64) {
    let entry = resume.entry(claim).or_insert(offset);
    if offset < *entry {
        *entry = offset;
    }
}

/// 会话结束时还没交给认领任务的记录，只记认领中的分区
fn note_undelivered<I>(
    resume: &mut HashMap<TopicPartition, i64>,
    claims: &BTreeMap<TopicPartition, mpsc::Sender<ConsumedRecord>>,
    records: I,
) where
    I: IntoIterator<Item = ConsumedRecord>,
{
    for record in records {
        let claim = TopicPartition::new(record.topic.as_str(), record.partition);
        if claims.contains_key(&claim) {
            note_resume(resume, claim, record.offset);
        }
    }
}

/// 会话循环每一轮等到的事情
enum Step {
    Stop,
    Event(Option<RebalanceEvent>),
    Claimed(Option<Result<ClaimExit, tokio::task::JoinError>>),
    Commit,
    Received(MqResult<ConsumedRecord>),
}

/// Kafka 消费组后端
pub struct KafkaGroupConsumer {
    consumer: Arc<GroupStreamConsumer>,
    group_id: String,
    member_id: String,
    commit_interval: Duration,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<RebalanceEvent>>,
    subscribed: parking_lot::Mutex<Option<Vec<String>>>,
    generation: AtomicI64,
    closed: AtomicBool,
}

impl KafkaGroupConsumer {
    pub fn new(config: &ConsumerConfig, commit_interval: Duration) -> MqResult<Self> {
        let member_id = config
            .base
            .client_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", config.group_id, Uuid::new_v4()));
        let mut config = config.clone().with_manual_offset_store();
        config.base.client_id = Some(member_id.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        let context = GroupContext {
            group_id: config.group_id.clone(),
            events: tx,
            session: parking_lot::Mutex::new(None),
            revoked: AtomicBool::new(false),
        };

        let consumer: GroupStreamConsumer = client_config(config.to_client_config_entries())
            .create_with_context(context)
            .map_err(|e| MqError::connection(format!("Failed to create Kafka consumer: {}", e)))?;

        Ok(Self {
            consumer: Arc::new(consumer),
            group_id: config.group_id.clone(),
            member_id,
            commit_interval,
            events: tokio::sync::Mutex::new(rx),
            subscribed: parking_lot::Mutex::new(None),
            generation: AtomicI64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    fn ensure_subscribed(&self, topics: &[String]) -> MqResult<()> {
        let mut subscribed = self.subscribed.lock();
        if subscribed.as_deref() == Some(topics) {
            return Ok(());
        }

        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&names).map_err(|e| {
            MqError::subscription(format!("Failed to subscribe to {:?}: {}", names, e))
        })?;
        info!(group_id = %self.group_id, topics = ?names, "Joined consumer group");
        *subscribed = Some(topics.to_vec());
        Ok(())
    }

    fn current_claims(&self) -> MqResult<Vec<TopicPartition>> {
        self.consumer
            .assignment()
            .map(|tpl| claims_of(&tpl))
            .map_err(|e| MqError::group(format!("Failed to read assignment: {}", e)))
    }

    /// 等待分区分配；在此之前收到的消息暂存到 `early`
    async fn await_claims(
        &self,
        cancel: &CancellationToken,
        events: &mut mpsc::UnboundedReceiver<RebalanceEvent>,
        early: &mut Vec<ConsumedRecord>,
    ) -> MqResult<Option<Vec<TopicPartition>>> {
        loop {
            while let Ok(event) = events.try_recv() {
                if let RebalanceEvent::Failed(reason) = event {
                    return Err(MqError::group(reason));
                }
            }

            let claims = self.current_claims()?;
            if !claims.is_empty() {
                return Ok(Some(claims));
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                event = events.recv() => match event {
                    Some(RebalanceEvent::Failed(reason)) => return Err(MqError::group(reason)),
                    Some(_) => {}
                    None => return Err(MqError::closed("rebalance channel closed")),
                },
                received = self.consumer.recv() => match received {
                    Ok(message) => early.push(detach(&message)),
                    Err(e) => {
                        let e = receive_error(e);
                        if e.is_fatal() {
                            return Err(e);
                        }
                        warn!(
                            group_id = %self.group_id,
                            error = %e,
                            "Receive failed while joining"
                        );
                    }
                },
            }
        }
    }

    fn commit_marked(&self, mode: CommitMode) {
        match self.consumer.commit_consumer_state(mode) {
            Ok(()) => {}
            Err(e) if is_no_offset(&e) => {}
            Err(e) => {
                warn!(group_id = %self.group_id, error = %e, "Failed to commit marked offsets");
            }
        }
    }

    /// 把仍然持有的分区拉回第一条未处理的消息
    fn rewind(&self, resume: &HashMap<TopicPartition, i64>) {
        for (claim, offset) in resume {
            if let Err(e) = self.consumer.seek(
                &claim.topic,
                claim.partition,
                Offset::Offset(*offset),
                SEEK_TIMEOUT,
            ) {
                warn!(claim = %claim, offset = offset, error = %e, "Failed to rewind claim");
            }
        }
    }
}

#[async_trait]
impl GroupBackend for KafkaGroupConsumer {
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
            return Err(MqError::closed("kafka group consumer is closed"));
        }
        self.ensure_subscribed(topics)?;

        let mut events = self.events.lock().await;
        let mut early = Vec::new();
        let claims = match self.await_claims(cancel, &mut events, &mut early).await? {
            Some(claims) => claims,
            None => return Ok(()),
        };

        let session = cancel.child_token();
        self.consumer.context().begin_session(session.clone());
        let info = SessionInfo {
            group_id: self.group_id.clone(),
            member_id: self.member_id.clone(),
            generation: self.generation.fetch_add(1, Ordering::AcqRel) + 1,
            claims: claims.clone(),
        };
        handler.session_established(&info);

        let marker = Arc::new(KafkaMarker {
            consumer: self.consumer.clone(),
            session: session.clone(),
        });
        let mut senders = BTreeMap::new();
        let mut tasks = JoinSet::new();
        for claim in &claims {
            let (tx, rx) = mpsc::channel(CLAIM_BUFFER);
            senders.insert(claim.clone(), tx);
            tasks.spawn(claim_partition(
                claim.clone(),
                rx,
                session.clone(),
                handler.clone(),
                marker.clone(),
            ));
        }

        let mut resume = HashMap::new();
        let mut pending = early.into_iter();
        let mut commit_tick =
            tokio::time::interval(self.commit_interval.max(Duration::from_millis(1)));
        commit_tick.tick().await;

        let mut result = Ok(());
        loop {
            let step = match pending.next() {
                Some(record) => Step::Received(Ok(record)),
                None => tokio::select! {
                    biased;
                    _ = session.cancelled() => Step::Stop,
                    event = events.recv() => Step::Event(event),
                    joined = tasks.join_next(), if !tasks.is_empty() => Step::Claimed(joined),
                    _ = commit_tick.tick() => Step::Commit,
                    received = self.consumer.recv() => {
                        Step::Received(received.map(|m| detach(&m)).map_err(receive_error))
                    }
                },
            };

            match step {
                Step::Stop => break,
                Step::Event(Some(RebalanceEvent::Revoked(revoked))) => {
                    debug!(group_id = %self.group_id, partitions = ?revoked, "Session revoked");
                    break;
                }
                Step::Event(Some(RebalanceEvent::Assigned(added))) => {
                    // 增量分配：带着完整的新分配重新建立会话
                    debug!(group_id = %self.group_id, added = added.len(), "Assignment changed");
                    break;
                }
                Step::Event(Some(RebalanceEvent::Failed(reason))) => {
                    result = Err(MqError::group(reason));
                    break;
                }
                Step::Event(None) => {
                    result = Err(MqError::closed("rebalance channel closed"));
                    break;
                }
                Step::Claimed(Some(Ok(exit))) => {
                    if let Some(offset) = exit.resume {
                        note_resume(&mut resume, exit.claim, offset);
                    }
                    if exit.result.is_err() {
                        result = exit.result;
                        break;
                    }
                }
                Step::Claimed(Some(Err(e))) => {
                    result = Err(MqError::internal(format!("claim task failed: {}", e)));
                    break;
                }
                Step::Claimed(None) => {}
                Step::Commit => self.commit_marked(CommitMode::Async),
                Step::Received(Err(e)) if e.is_fatal() => {
                    result = Err(e);
                    break;
                }
                Step::Received(Err(e)) => {
                    warn!(group_id = %self.group_id, error = %e, "Receive failed, continuing");
                }
                Step::Received(Ok(record)) => {
                    let claim = TopicPartition::new(record.topic.as_str(), record.partition);
                    let Some(tx) = senders.get(&claim) else {
                        debug!(record = %record, "Dropping record for unclaimed partition");
                        continue;
                    };
                    let permit = tokio::select! {
                        biased;
                        _ = session.cancelled() => None,
                        permit = tx.reserve() => Some(permit),
                    };
                    match permit {
                        Some(Ok(permit)) => permit.send(record),
                        // 认领任务已退出，退出结果里带着失败原因
                        Some(Err(_)) => note_resume(&mut resume, claim, record.offset),
                        None => {
                            note_resume(&mut resume, claim, record.offset);
                            break;
                        }
                    }
                }
            }
        }

        note_undelivered(&mut resume, &senders, pending);

        // 停止认领，等待正在执行的处理器返回
        session.cancel();
        senders.clear();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(exit) => {
                    if let Some(offset) = exit.resume {
                        note_resume(&mut resume, exit.claim, offset);
                    }
                    if let Err(e) = exit.result {
                        if result.is_ok() {
                            result = Err(e);
                        }
                    }
                }
                Err(e) if result.is_ok() => {
                    result = Err(MqError::internal(format!("claim task failed: {}", e)));
                }
                Err(_) => {}
            }
        }

        let revoked = self.consumer.context().end_session();
        self.commit_marked(CommitMode::Sync);
        if !revoked {
            self.rewind(&resume);
        }
        handler.session_torn_down(&info);

        if let Err(e) = &result {
            warn!(group_id = %self.group_id, error = %e, "Kafka group session failed");
        }
        result
    }

    async fn leave(&self) -> MqResult<()> {
        if self.subscribed.lock().take().is_some() {
            self.consumer.unsubscribe();
            info!(group_id = %self.group_id, member_id = %self.member_id, "Left consumer group");
        }
        Ok(())
    }

    async fn close(&self) -> MqResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.leave().await
    }
}
