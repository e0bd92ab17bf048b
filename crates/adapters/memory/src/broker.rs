//! 进程内 broker

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use courier_config::AutoOffsetReset;
use courier_errors::{MqError, MqResult};
use courier_mq_core::TopicPartition;
use courier_ports::{ConsumedRecord, DeliveryResult, OutboundRecord};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

/// Broker 选项
#[derive(Debug, Clone, Copy)]
pub struct BrokerOptions {
    /// 发送或订阅未知 topic 时自动创建
    pub auto_create_topics: bool,
    /// 自动创建的 topic 的分区数
    pub default_partitions: i32,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            auto_create_topics: true,
            default_partitions: 1,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
    timestamp: i64,
}

#[derive(Debug)]
struct TopicLog {
    partitions: Vec<Vec<StoredRecord>>,
    next_partition: usize,
}

impl TopicLog {
    fn new(partitions: i32) -> Self {
        let count = partitions.max(1) as usize;
        Self {
            partitions: vec![Vec::new(); count],
            next_partition: 0,
        }
    }

    /// 有 key 按哈希选分区，否则轮转
    fn select_partition(&mut self, key: Option<&[u8]>) -> usize {
        let count = self.partitions.len();
        match key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % count as u64) as usize
            }
            None => {
                let partition = self.next_partition % count;
                self.next_partition = self.next_partition.wrapping_add(1);
                partition
            }
        }
    }
}

#[derive(Debug, Default)]
struct GroupState {
    generation: i64,
    /// member_id -> 订阅的 topic
    members: BTreeMap<String, Vec<String>>,
    /// (topic, partition) -> 下一条待消费的 offset
    committed: HashMap<(String, i32), i64>,
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, TopicLog>,
    groups: HashMap<String, GroupState>,
    pending_transient_errors: u32,
}

struct Inner {
    options: BrokerOptions,
    state: Mutex<BrokerState>,
    /// 每次追加记录递增
    appends: watch::Sender<u64>,
    /// 每次任意消费组成员变化递增
    rebalances: watch::Sender<u64>,
}

/// 进程内 broker
///
/// 克隆共享同一份状态；同一个 broker 上创建的生产者与消费者互相可见
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MemoryBroker")
            .field("options", &self.inner.options)
            .field("topics", &state.topics.len())
            .field("groups", &state.groups.len())
            .finish()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_options(BrokerOptions::default())
    }

    pub fn with_options(options: BrokerOptions) -> Self {
        let (appends, _) = watch::channel(0);
        let (rebalances, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                options,
                state: Mutex::new(BrokerState::default()),
                appends,
                rebalances,
            }),
        }
    }

    pub fn options(&self) -> BrokerOptions {
        self.inner.options
    }

    /// 创建 topic，已存在时不做修改
    pub fn create_topic(&self, topic: &str, partitions: i32) -> MqResult<()> {
        if topic.trim().is_empty() {
            return Err(MqError::invalid_argument("topic must not be empty"));
        }
        if partitions < 1 {
            return Err(MqError::invalid_argument(format!(
                "topic '{}' needs at least one partition",
                topic
            )));
        }

        let mut state = self.inner.state.lock();
        if !state.topics.contains_key(topic) {
            state
                .topics
                .insert(topic.to_string(), TopicLog::new(partitions));
            info!(topic = topic, partitions = partitions, "Topic created");
        }
        Ok(())
    }

    pub fn partition_count(&self, topic: &str) -> Option<i32> {
        let state = self.inner.state.lock();
        state.topics.get(topic).map(|log| log.partitions.len() as i32)
    }

    /// 自动创建开启时补齐 topic，返回其分区数
    fn ensure_topic(&self, state: &mut BrokerState, topic: &str) -> Option<i32> {
        if !state.topics.contains_key(topic) {
            if !self.inner.options.auto_create_topics {
                return None;
            }
            state.topics.insert(
                topic.to_string(),
                TopicLog::new(self.inner.options.default_partitions),
            );
            debug!(topic = topic, "Topic auto-created");
        }
        state.topics.get(topic).map(|log| log.partitions.len() as i32)
    }

    /// 订阅时补齐 topic，返回每个 topic 的分区
    pub(crate) fn resolve_partitions(&self, topics: &[String]) -> Vec<TopicPartition> {
        let mut state = self.inner.state.lock();
        let mut partitions = Vec::new();
        for topic in topics {
            if let Some(count) = self.ensure_topic(&mut state, topic) {
                partitions.extend((0..count).map(|p| TopicPartition::new(topic.as_str(), p)));
            }
        }
        partitions
    }

    /// 追加一条记录
    pub fn append(&self, record: OutboundRecord) -> MqResult<DeliveryResult> {
        let delivery = {
            let mut state = self.inner.state.lock();
            if self.ensure_topic(&mut state, &record.topic).is_none() {
                return Err(MqError::delivery(format!(
                    "Broker: Unknown topic or partition ({})",
                    record.topic
                )));
            }
            let log = state
                .topics
                .get_mut(&record.topic)
                .ok_or_else(|| MqError::internal("topic vanished during append"))?;

            let partition = log.select_partition(record.key.as_deref());
            let entries = &mut log.partitions[partition];
            entries.push(StoredRecord {
                key: record.key,
                payload: record.payload,
                timestamp: now_millis(),
            });
            DeliveryResult::new(partition as i32, entries.len() as i64 - 1)
        };

        self.inner.appends.send_modify(|seq| *seq = seq.wrapping_add(1));
        Ok(delivery)
    }

    /// 读取指定位置的记录
    pub fn fetch(&self, topic: &str, partition: i32, offset: i64) -> Option<ConsumedRecord> {
        if offset < 0 {
            return None;
        }
        let state = self.inner.state.lock();
        let stored = state
            .topics
            .get(topic)?
            .partitions
            .get(partition as usize)?
            .get(offset as usize)?;

        Some(ConsumedRecord {
            topic: topic.to_string(),
            partition,
            offset,
            key: stored.key.clone(),
            payload: stored.payload.clone(),
            timestamp: Some(stored.timestamp),
        })
    }

    /// 分区的下一个写入位置
    pub fn end_offset(&self, topic: &str, partition: i32) -> i64 {
        let state = self.inner.state.lock();
        state
            .topics
            .get(topic)
            .and_then(|log| log.partitions.get(partition as usize))
            .map(|entries| entries.len() as i64)
            .unwrap_or(0)
    }

    /// 消费组在分区上已提交的 offset（下一条待消费的位置）
    pub fn committed(&self, group_id: &str, topic: &str, partition: i32) -> Option<i64> {
        let state = self.inner.state.lock();
        state
            .groups
            .get(group_id)?
            .committed
            .get(&(topic.to_string(), partition))
            .copied()
    }

    /// 提交 offset，不会回退
    pub fn commit(&self, group_id: &str, topic: &str, partition: i32, next_offset: i64) {
        let mut state = self.inner.state.lock();
        let group = state.groups.entry(group_id.to_string()).or_default();
        let entry = group
            .committed
            .entry((topic.to_string(), partition))
            .or_insert(next_offset);
        if next_offset > *entry {
            *entry = next_offset;
        }
    }

    /// 没有已提交 offset 时的起始位置
    pub(crate) fn start_offset(
        &self,
        group_id: &str,
        tp: &TopicPartition,
        reset: AutoOffsetReset,
    ) -> i64 {
        self.committed(group_id, &tp.topic, tp.partition)
            .unwrap_or_else(|| match reset {
                AutoOffsetReset::Earliest => 0,
                AutoOffsetReset::Latest => self.end_offset(&tp.topic, tp.partition),
            })
    }

    /// 之后的 `n` 次轮询返回瞬时错误
    pub fn inject_transient_errors(&self, n: u32) {
        self.inner.state.lock().pending_transient_errors = n;
    }

    pub(crate) fn take_transient_error(&self) -> Option<MqError> {
        let mut state = self.inner.state.lock();
        if state.pending_transient_errors == 0 {
            return None;
        }
        state.pending_transient_errors -= 1;
        Some(MqError::transient("Local: Broker transport failure"))
    }

    pub(crate) fn watch_appends(&self) -> watch::Receiver<u64> {
        self.inner.appends.subscribe()
    }

    pub(crate) fn watch_rebalances(&self) -> watch::Receiver<u64> {
        self.inner.rebalances.subscribe()
    }

    /// 加入消费组，成员或订阅变化时递增 generation
    pub(crate) fn join_group(&self, group_id: &str, member_id: &str, topics: &[String]) -> i64 {
        let (generation, changed) = {
            let mut state = self.inner.state.lock();
            let group = state.groups.entry(group_id.to_string()).or_default();
            let changed = group.members.get(member_id).map(Vec::as_slice) != Some(topics);
            if changed {
                group.members.insert(member_id.to_string(), topics.to_vec());
                group.generation += 1;
            }
            (group.generation, changed)
        };

        if changed {
            info!(
                group_id = group_id,
                member_id = member_id,
                generation = generation,
                "Group membership changed"
            );
            self.inner
                .rebalances
                .send_modify(|seq| *seq = seq.wrapping_add(1));
        }
        generation
    }

    pub(crate) fn leave_group(&self, group_id: &str, member_id: &str) {
        let left = {
            let mut state = self.inner.state.lock();
            match state.groups.get_mut(group_id) {
                Some(group) => {
                    if group.members.remove(member_id).is_some() {
                        group.generation += 1;
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if left {
            info!(group_id = group_id, member_id = member_id, "Member left group");
            self.inner
                .rebalances
                .send_modify(|seq| *seq = seq.wrapping_add(1));
        }
    }

    pub fn generation(&self, group_id: &str) -> i64 {
        let state = self.inner.state.lock();
        state.groups.get(group_id).map(|g| g.generation).unwrap_or(0)
    }

    pub fn member_count(&self, group_id: &str) -> usize {
        let state = self.inner.state.lock();
        state.groups.get(group_id).map(|g| g.members.len()).unwrap_or(0)
    }

    /// 成员在当前 generation 认领的分区
    ///
    /// 每个 topic 的分区按成员 id 排序后取模分配
    pub(crate) fn assignment(&self, group_id: &str, member_id: &str) -> Vec<TopicPartition> {
        let mut state = self.inner.state.lock();
        let Some(topics) = state
            .groups
            .get(group_id)
            .and_then(|g| g.members.get(member_id))
            .cloned()
        else {
            return Vec::new();
        };

        let mut claims = Vec::new();
        for topic in &topics {
            let Some(count) = self.ensure_topic(&mut state, topic) else {
                continue;
            };
            let Some(group) = state.groups.get(group_id) else {
                break;
            };
            let subscribers: Vec<&String> = group
                .members
                .iter()
                .filter(|(_, subscribed)| subscribed.contains(topic))
                .map(|(member, _)| member)
                .collect();
            let Some(index) = subscribers.iter().position(|m| m.as_str() == member_id) else {
                continue;
            };
            claims.extend(
                (0..count)
                    .filter(|p| *p as usize % subscribers.len() == index)
                    .map(|p| TopicPartition::new(topic.as_str(), p)),
            );
        }
        claims
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
