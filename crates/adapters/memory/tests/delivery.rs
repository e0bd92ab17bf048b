//! 进程内 broker 上的端到端收发测试

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use courier_adapter_memory::{
    BrokerOptions, MemoryBroker, MemoryGroupConsumer, MemoryPollConsumer, MemoryProducer,
};
use courier_common::BackoffPolicy;
use courier_config::AutoOffsetReset;
use courier_errors::MqError;
use courier_mq_core::{
    GroupConsumer, GroupOptions, JsonCodec, PollConsumer, PollOptions, ProstCodec, SessionState,
    SyncProducer,
};
use courier_ports::{ConsumedRecord, Consumer, OutboundRecord, Producer, handler_fn};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type JsonProducer = SyncProducer<MemoryProducer, JsonCodec<String>>;
type JsonGroup = GroupConsumer<MemoryGroupConsumer, JsonCodec<String>>;

fn producer(broker: &MemoryBroker) -> JsonProducer {
    SyncProducer::new(
        Arc::new(MemoryProducer::new(broker.clone())),
        Arc::new(JsonCodec::new()),
    )
}

fn group(broker: &MemoryBroker, group_id: &str) -> Arc<JsonGroup> {
    Arc::new(GroupConsumer::new(
        Arc::new(MemoryGroupConsumer::new(
            broker.clone(),
            group_id,
            AutoOffsetReset::Earliest,
            Duration::from_millis(50),
        )),
        Arc::new(JsonCodec::new()),
        GroupOptions {
            rejoin_backoff: BackoffPolicy::none(),
        },
    ))
}

fn poller(
    broker: &MemoryBroker,
    group_id: &str,
) -> PollConsumer<MemoryPollConsumer, JsonCodec<String>> {
    PollConsumer::new(
        Arc::new(MemoryPollConsumer::new(
            broker.clone(),
            group_id,
            AutoOffsetReset::Earliest,
        )),
        Arc::new(JsonCodec::new()),
        PollOptions {
            poll_timeout: Duration::from_millis(20),
            transient_backoff: BackoffPolicy::none(),
        },
    )
}

async fn wait_ready(consumer: &JsonGroup) {
    let mut ready = consumer.ready();
    tokio::time::timeout(Duration::from_secs(5), ready.wait_for(|r| *r))
        .await
        .expect("group should become ready")
        .expect("ready channel open");
}

#[tokio::test]
async fn test_ping_is_delivered_once_per_group() {
    let broker = MemoryBroker::new();
    let producer = producer(&broker);
    let cancel = CancellationToken::new();

    let delivery = producer
        .send(&cancel, &"ping".to_string(), "t1")
        .await
        .unwrap();
    let stored = broker
        .fetch("t1", delivery.partition, delivery.offset)
        .expect("record stored at reported location");
    assert_eq!(stored.payload, b"\"ping\"");

    // 第一次消费
    let consumer = group(&broker, "g1");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = handler_fn(move |message: String, _record: ConsumedRecord| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(message);
            Ok(())
        }
    });
    let task = {
        let consumer = consumer.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { consumer.run(&cancel, "t1", handler).await })
    };

    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, "ping");

    cancel.cancel();
    assert!(task.await.unwrap().unwrap_err().is_cancelled());
    consumer.shutdown().await.unwrap();
    assert_eq!(broker.committed("g1", "t1", 0), Some(1));

    // 同组重启后不会重复投递
    let restarted = group(&broker, "g1");
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = handler_fn(move |message: String, _record: ConsumedRecord| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(message);
            Ok(())
        }
    });
    let task = {
        let consumer = restarted.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { consumer.run(&cancel, "t1", handler).await })
    };
    wait_ready(&restarted).await;

    producer
        .send(&CancellationToken::new(), &"second".to_string(), "t1")
        .await
        .unwrap();
    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, "second");

    cancel.cancel();
    task.await.unwrap().unwrap_err();
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_ready_before_any_message() {
    let broker = MemoryBroker::new();
    let consumer = group(&broker, "g-ready");
    let cancel = CancellationToken::new();
    let handler = handler_fn(|_message: String, _record: ConsumedRecord| async { Ok(()) });

    assert!(!consumer.is_ready());
    let task = {
        let consumer = consumer.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { consumer.run(&cancel, "t1, t2", handler).await })
    };

    wait_ready(&consumer).await;
    assert_eq!(broker.member_count("g-ready"), 1);

    cancel.cancel();
    task.await.unwrap().unwrap_err();
}

#[tokio::test]
async fn test_failed_handler_is_redelivered() {
    let broker = MemoryBroker::new();
    let producer = producer(&broker);
    producer
        .send(&CancellationToken::new(), &"flaky".to_string(), "t1")
        .await
        .unwrap();

    let consumer = group(&broker, "g-retry");
    let cancel = CancellationToken::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = {
        let attempts = attempts.clone();
        handler_fn(move |_message: String, record: ConsumedRecord| {
            let attempts = attempts.clone();
            let tx = tx.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(MqError::handler("downstream unavailable"));
                }
                let _ = tx.send(record.offset);
                Ok(())
            }
        })
    };

    let task = {
        let consumer = consumer.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { consumer.run(&cancel, "t1", handler).await })
    };

    let offset = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(offset, 0);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    cancel.cancel();
    task.await.unwrap().unwrap_err();
    assert_eq!(broker.committed("g-retry", "t1", 0), Some(1));
}

#[tokio::test]
async fn test_handler_failure_is_never_committed() {
    let broker = MemoryBroker::new();
    let producer = producer(&broker);
    producer
        .send(&CancellationToken::new(), &"poison".to_string(), "t1")
        .await
        .unwrap();

    let consumer = group(&broker, "g-poison");
    let cancel = CancellationToken::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    let handler = {
        let attempts = attempts.clone();
        handler_fn(move |_message: String, _record: ConsumedRecord| {
            let attempts = attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(MqError::handler("cannot project"))
            }
        })
    };

    let task = {
        let consumer = consumer.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { consumer.run(&cancel, "t1", handler).await })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        while attempts.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    cancel.cancel();
    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, MqError::Handler(_) | MqError::Cancelled));
    assert_eq!(broker.committed("g-poison", "t1", 0), None);
}

#[tokio::test]
async fn test_malformed_payload_is_returned_uncommitted() {
    let broker = MemoryBroker::new();
    broker
        .append(OutboundRecord::new("t1", b"{not json".to_vec()))
        .unwrap();

    let consumer = poller(&broker, "g-poll");
    let err = consumer
        .consume_message::<String>(&CancellationToken::new(), "t1")
        .await
        .unwrap_err();

    let record = err.record().expect("raw record attached");
    assert_eq!(record.payload, b"{not json");
    assert_eq!(broker.committed("g-poll", "t1", 0), None);
}

#[tokio::test]
async fn test_poll_commit_advances_group_position() {
    let broker = MemoryBroker::new();
    let producer = producer(&broker);
    for body in ["first", "second"] {
        producer
            .send(&CancellationToken::new(), &body.to_string(), "t1")
            .await
            .unwrap();
    }

    let consumer = poller(&broker, "g-poll");
    let cancel = CancellationToken::new();
    let (message, record) = consumer
        .consume_message::<String>(&cancel, "t1")
        .await
        .unwrap();
    assert_eq!(message, "first");
    consumer.commit(&record).await.unwrap();
    consumer.shutdown().await.unwrap();

    let resumed = poller(&broker, "g-poll");
    let (message, _) = resumed
        .consume_message::<String>(&cancel, "t1")
        .await
        .unwrap();
    assert_eq!(message, "second");
}

#[tokio::test]
async fn test_poll_survives_transient_errors() {
    let broker = MemoryBroker::new();
    producer(&broker)
        .send(&CancellationToken::new(), &"ping".to_string(), "t1")
        .await
        .unwrap();
    broker.inject_transient_errors(3);

    let consumer = poller(&broker, "g-poll");
    let (message, _) = consumer
        .consume_message::<String>(&CancellationToken::new(), "t1")
        .await
        .unwrap();
    assert_eq!(message, "ping");
    assert!(!consumer.is_closed());
}

#[tokio::test]
async fn test_poll_consumer_loop_commits_handled_messages() {
    let broker = MemoryBroker::new();
    let producer = producer(&broker);
    for body in ["a", "b", "c"] {
        producer
            .send(&CancellationToken::new(), &body.to_string(), "t1")
            .await
            .unwrap();
    }

    let consumer = poller(&broker, "g-loop");
    let cancel = CancellationToken::new();
    let handled = Arc::new(AtomicUsize::new(0));
    let handler = {
        let handled = handled.clone();
        let cancel = cancel.clone();
        handler_fn(move |_message: String, _record: ConsumedRecord| {
            let handled = handled.clone();
            let cancel = cancel.clone();
            async move {
                if handled.fetch_add(1, Ordering::SeqCst) == 2 {
                    cancel.cancel();
                }
                Ok(())
            }
        })
    };

    let err = Consumer::consume(&consumer, &cancel, "t1", handler)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(broker.committed("g-loop", "t1", 0), Some(3));
}

#[tokio::test]
async fn test_concurrent_sends_report_their_own_location() {
    let broker = MemoryBroker::new();
    broker.create_topic("orders", 4).unwrap();
    let producer = Arc::new(producer(&broker));

    let mut handles = Vec::new();
    for i in 0..32 {
        let producer = producer.clone();
        handles.push(tokio::spawn(async move {
            let body = format!("order-{}", i);
            let delivery = producer
                .send_with_key(&CancellationToken::new(), &body, "orders", body.as_bytes())
                .await
                .unwrap();
            (body, delivery)
        }));
    }

    for handle in handles {
        let (body, delivery) = handle.await.unwrap();
        let stored = broker
            .fetch("orders", delivery.partition, delivery.offset)
            .unwrap();
        assert_eq!(stored.payload, format!("\"{}\"", body).into_bytes());
        assert_eq!(stored.key.as_deref(), Some(body.as_bytes()));
    }
}

#[tokio::test]
async fn test_cancelled_send_writes_nothing() {
    let broker = MemoryBroker::with_options(BrokerOptions {
        auto_create_topics: false,
        ..Default::default()
    });
    broker.create_topic("t1", 1).unwrap();
    let producer = producer(&broker);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = producer
        .send(&cancel, &"ping".to_string(), "t1")
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(broker.end_offset("t1", 0), 0);
}

#[tokio::test]
async fn test_unknown_topic_is_a_delivery_error() {
    let broker = MemoryBroker::with_options(BrokerOptions {
        auto_create_topics: false,
        ..Default::default()
    });
    let err = producer(&broker)
        .send(&CancellationToken::new(), &"ping".to_string(), "missing")
        .await
        .unwrap_err();
    assert!(matches!(err, MqError::Delivery(_)));
}

#[tokio::test]
async fn test_second_member_takes_over_after_leave() {
    let broker = MemoryBroker::new();
    broker.create_topic("t1", 2).unwrap();
    let first = group(&broker, "g-pair");
    let second = group(&broker, "g-pair");
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut tasks = Vec::new();
    for consumer in [first.clone(), second.clone()] {
        let tx = tx.clone();
        let cancel = cancel.clone();
        let handler = handler_fn(move |message: String, _record: ConsumedRecord| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message);
                Ok(())
            }
        });
        tasks.push(tokio::spawn(async move { consumer.run(&cancel, "t1", handler).await }));
    }
    wait_ready(&first).await;
    wait_ready(&second).await;
    assert_eq!(broker.member_count("g-pair"), 2);

    first.shutdown().await.unwrap();
    assert_eq!(broker.member_count("g-pair"), 1);

    let producer = producer(&broker);
    for i in 0..4 {
        producer
            .send(&CancellationToken::new(), &format!("m{}", i), "t1")
            .await
            .unwrap();
    }

    let mut received = Vec::new();
    while received.len() < 4 {
        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        if !received.contains(&message) {
            received.push(message);
        }
    }
    received.sort();
    assert_eq!(received, vec!["m0", "m1", "m2", "m3"]);

    cancel.cancel();
    for task in tasks {
        let _ = task.await.unwrap();
    }
}

#[tokio::test]
async fn test_cancelled_member_releases_its_partitions() {
    let broker = MemoryBroker::new();
    broker.create_topic("t1", 1).unwrap();
    let producer = producer(&broker);

    // 每一轮只取消不关闭，下一个成员仍然拿到唯一的分区
    for round in 0..3 {
        let consumer = group(&broker, "g-restart");
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = handler_fn(move |message: String, _record: ConsumedRecord| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message);
                Ok(())
            }
        });
        let task = {
            let consumer = consumer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { consumer.run(&cancel, "t1", handler).await })
        };
        wait_ready(&consumer).await;
        assert_eq!(broker.member_count("g-restart"), 1);

        let body = format!("ping-{}", round);
        producer
            .send(&CancellationToken::new(), &body, "t1")
            .await
            .unwrap();
        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("restarted member should receive the new message")
            .unwrap();
        assert_eq!(received, body);

        cancel.cancel();
        assert!(task.await.unwrap().unwrap_err().is_cancelled());
        assert_eq!(broker.member_count("g-restart"), 0);
        assert_eq!(consumer.state(), SessionState::NotJoined);
        drop(consumer);
    }
    assert_eq!(broker.committed("g-restart", "t1", 0), Some(3));
}

#[derive(Default)]
struct InFlight {
    current: Mutex<HashMap<i32, usize>>,
    max: AtomicUsize,
    seen: Mutex<Vec<(i32, i64)>>,
}

#[tokio::test]
async fn test_group_handles_each_partition_in_order() {
    let broker = MemoryBroker::new();
    broker.create_topic("seq", 3).unwrap();
    let producer = producer(&broker);
    for i in 0..30 {
        let key = format!("k{}", i % 6);
        producer
            .send_with_key(&CancellationToken::new(), &format!("m{}", i), "seq", key.as_bytes())
            .await
            .unwrap();
    }

    let consumer = group(&broker, "g-seq");
    let cancel = CancellationToken::new();
    let tracker = Arc::new(InFlight::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = {
        let tracker = tracker.clone();
        handler_fn(move |_message: String, record: ConsumedRecord| {
            let tracker = tracker.clone();
            let tx = tx.clone();
            async move {
                {
                    let mut current = tracker.current.lock();
                    let count = current.entry(record.partition).or_insert(0);
                    *count += 1;
                    tracker.max.fetch_max(*count, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
                tracker.seen.lock().push((record.partition, record.offset));
                *tracker.current.lock().entry(record.partition).or_insert(1) -= 1;
                let _ = tx.send(());
                Ok(())
            }
        })
    };
    let task = {
        let consumer = consumer.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { consumer.run(&cancel, "seq", handler).await })
    };

    for _ in 0..30 {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("every message should be handled")
            .unwrap();
    }
    cancel.cancel();
    task.await.unwrap().unwrap_err();

    assert_eq!(tracker.max.load(Ordering::SeqCst), 1);
    let seen = tracker.seen.lock().clone();
    assert_eq!(seen.len(), 30);
    let mut last: HashMap<i32, i64> = HashMap::new();
    for (partition, offset) in seen {
        if let Some(previous) = last.insert(partition, offset) {
            assert!(
                offset > previous,
                "partition {} went from {} to {}",
                partition,
                previous,
                offset
            );
        }
    }
}

#[derive(Clone, PartialEq, prost::Message)]
struct Ping {
    #[prost(string, tag = "1")]
    body: String,
}

#[tokio::test]
async fn test_protobuf_payloads() {
    let broker = MemoryBroker::new();
    let producer = SyncProducer::new(
        Arc::new(MemoryProducer::new(broker.clone())),
        Arc::new(ProstCodec::<Ping>::new()),
    );
    let consumer = PollConsumer::new(
        Arc::new(MemoryPollConsumer::new(
            broker.clone(),
            "g-proto",
            AutoOffsetReset::Earliest,
        )),
        Arc::new(ProstCodec::<Ping>::new()),
        PollOptions::default(),
    );
    let cancel = CancellationToken::new();

    producer
        .send_message(
            &cancel,
            &Ping {
                body: "ping".to_string(),
            },
            "t1",
        )
        .await
        .unwrap();
    let (message, _): (Ping, _) = consumer.consume_message(&cancel, "t1").await.unwrap();
    assert_eq!(message.body, "ping");
}
