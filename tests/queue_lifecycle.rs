//! End-to-end message lifecycle against the in-process broker

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Semaphore;

use pipeq::{
    AutoScaler, Broker, HandlerError, InMemoryBroker, MessageStatus, Payload, QueueError,
    QueueManager, QueueMessage, ResourceWarmer, ScalingDecision, SimulatedModelLoader,
    WorkerConfig, WorkerPool,
};

const SUBJECT: &str = "frame.generation";

fn test_config() -> WorkerConfig {
    let mut config = WorkerConfig::default();
    config.service_name = "illustration-worker".to_string();
    config.retry.delays_secs = vec![1.0];
    config.retry.jitter_factor = 0.0;
    config.retry.completed_retention_secs = 3600;
    config
}

fn frame_payload(frame_id: &str) -> Payload {
    let mut payload = Payload::new();
    payload.insert("frame_id".to_string(), json!(frame_id));
    payload.insert("request".to_string(), json!({ "prompt": "a lighthouse at dusk" }));
    payload
}

async fn connected_queue(config: &WorkerConfig) -> (Arc<InMemoryBroker>, Arc<QueueManager>) {
    let broker = Arc::new(InMemoryBroker::new());
    let queue = Arc::new(QueueManager::new(broker.clone(), config));
    queue.connect().await.unwrap();
    (broker, queue)
}

/// Poll `check` until it holds; panics after ~5 virtual minutes.
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..6000 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test(start_paused = true)]
async fn test_message_dead_lettered_after_retries_exhausted() {
    let (broker, queue) = connected_queue(&test_config()).await;
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = attempts.clone();
    queue
        .subscribe_to_queue(
            SUBJECT,
            move |_message: QueueMessage| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<Value, _>(HandlerError::new("model crashed"))
                }
            },
            Some("illustration-workers"),
        )
        .await
        .unwrap();

    let id = queue.publish_message(SUBJECT, frame_payload("f-1"), None).await.unwrap();

    eventually(|| async { queue.get_queue_stats().await.dlq_messages == 1 }).await;

    // one initial attempt plus max_retries retries
    assert_eq!(attempts.load(Ordering::SeqCst), 4);

    let stats = queue.get_queue_stats().await;
    assert_eq!(stats.processing_messages, 0);

    let dead = queue.list_dlq_messages().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, id);
    assert_eq!(dead[0].status, MessageStatus::DeadLetter);
    assert_eq!(dead[0].retry_count, 4);
    assert_eq!(dead[0].error_message.as_deref(), Some("model crashed"));

    let announced = broker.published_json("frame.generation.dlq");
    assert_eq!(announced.len(), 1);
    assert_eq!(announced[0]["originalMessage"]["id"], json!(id));
    assert_eq!(announced[0]["originalMessage"]["status"], json!("dead_letter"));
    assert_eq!(announced[0]["error"], json!("model crashed"));
    assert!(announced[0]["movedToDlqAt"].is_number());
}

#[tokio::test(start_paused = true)]
async fn test_retry_then_success_completes_message() {
    let (_broker, queue) = connected_queue(&test_config()).await;
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = attempts.clone();
    queue
        .subscribe_to_queue(
            SUBJECT,
            move |message: QueueMessage| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        return Err(HandlerError::new("CUDA out of memory"));
                    }
                    Ok(json!({ "frame_id": message.payload["frame_id"] }))
                }
            },
            None,
        )
        .await
        .unwrap();

    let id = queue.publish_message(SUBJECT, frame_payload("f-2"), None).await.unwrap();

    eventually(|| async {
        matches!(
            queue.get_message(&id).await,
            Some(QueueMessage { status: MessageStatus::Completed, .. })
        )
    })
    .await;

    let message = queue.get_message(&id).await.unwrap();
    assert_eq!(message.retry_count, 2);
    assert!(message.processed_at.is_some());
    assert_eq!(message.error_message.as_deref(), Some("CUDA out of memory"));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(queue.get_queue_stats().await.dlq_messages, 0);
    assert_eq!(queue.pending_retries(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reply_published_on_success() {
    let (broker, queue) = connected_queue(&test_config()).await;

    queue
        .subscribe_to_queue(
            SUBJECT,
            |message: QueueMessage| async move {
                Ok::<_, HandlerError>(json!({
                    "status": "success",
                    "frame_id": message.payload["frame_id"],
                }))
            },
            None,
        )
        .await
        .unwrap();

    let id = queue
        .publish_message(SUBJECT, frame_payload("f-3"), Some("frame.replies".to_string()))
        .await
        .unwrap();

    eventually(|| async { !broker.published_json("frame.replies").is_empty() }).await;

    let replies = broker.published_json("frame.replies");
    assert_eq!(replies[0]["messageId"], json!(id));
    assert_eq!(replies[0]["status"], json!("completed"));
    assert_eq!(replies[0]["result"]["frame_id"], json!("f-3"));
}

#[tokio::test(start_paused = true)]
async fn test_completed_record_evicted_after_retention() {
    let mut config = test_config();
    config.retry.completed_retention_secs = 30;
    let (_broker, queue) = connected_queue(&config).await;

    queue
        .subscribe_to_queue(
            SUBJECT,
            |_message: QueueMessage| async { Ok::<_, HandlerError>(Value::Null) },
            None,
        )
        .await
        .unwrap();

    let id = queue.publish_message(SUBJECT, frame_payload("f-4"), None).await.unwrap();
    eventually(|| async { queue.get_message(&id).await.is_some() }).await;
    assert_eq!(queue.get_queue_stats().await.processing_messages, 1);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(queue.get_message(&id).await.is_none());
    assert_eq!(queue.get_queue_stats().await.processing_messages, 0);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_envelope_is_dropped() {
    let (broker, queue) = connected_queue(&test_config()).await;
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    queue
        .subscribe_to_queue(
            SUBJECT,
            move |_message: QueueMessage| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, HandlerError>(Value::Null)
                }
            },
            None,
        )
        .await
        .unwrap();

    broker.publish(SUBJECT, b"{not json".to_vec()).await.unwrap();
    broker
        .publish(SUBJECT, br#"{"data": {"frame_id": "no-id"}}"#.to_vec())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let stats = queue.get_queue_stats().await;
    assert_eq!(stats.processing_messages, 0);
    assert_eq!(stats.dlq_messages, 0);
    assert_eq!(queue.pending_retries(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_snake_case_envelope_accepted() {
    let (broker, queue) = connected_queue(&test_config()).await;
    let seen_retry = Arc::new(AtomicUsize::new(usize::MAX));

    let seen = seen_retry.clone();
    queue
        .subscribe_to_queue(
            SUBJECT,
            move |message: QueueMessage| {
                let seen = seen.clone();
                async move {
                    seen.store(message.retry_count as usize, Ordering::SeqCst);
                    Ok::<_, HandlerError>(Value::Null)
                }
            },
            None,
        )
        .await
        .unwrap();

    let raw = json!({
        "id": "export-worker_1700000000000_4242",
        "data": { "frame_id": "f-5" },
        "reply_to": "legacy.replies",
        "created_at": 1700000000.5,
        "service": "export-worker",
        "retry_count": 1
    });
    broker.publish(SUBJECT, serde_json::to_vec(&raw).unwrap()).await.unwrap();

    eventually(|| async { !broker.published_json("legacy.replies").is_empty() }).await;
    assert_eq!(seen_retry.load(Ordering::SeqCst), 1);

    let message = queue.get_message("export-worker_1700000000000_4242").await.unwrap();
    assert_eq!(message.created_at.timestamp_millis(), 1_700_000_000_500);
    assert_eq!(message.reply_to.as_deref(), Some("legacy.replies"));
}

#[tokio::test(start_paused = true)]
async fn test_replay_dead_lettered_message() {
    let (broker, queue) = connected_queue(&test_config()).await;
    let healthy = Arc::new(AtomicBool::new(false));

    let flag = healthy.clone();
    queue
        .subscribe_to_queue(
            SUBJECT,
            move |_message: QueueMessage| {
                let flag = flag.clone();
                async move {
                    if flag.load(Ordering::SeqCst) {
                        Ok(json!({ "status": "success" }))
                    } else {
                        Err(HandlerError::new("model not loaded"))
                    }
                }
            },
            None,
        )
        .await
        .unwrap();

    let id = queue.publish_message(SUBJECT, frame_payload("f-6"), None).await.unwrap();
    eventually(|| async { queue.get_queue_stats().await.dlq_messages == 1 }).await;
    let created_at = queue.list_dlq_messages().await[0].created_at;

    healthy.store(true, Ordering::SeqCst);
    let replayed = queue.republish_dlq_message(&id, SUBJECT).await.unwrap();
    assert_eq!(replayed, id);
    assert_eq!(queue.get_queue_stats().await.dlq_messages, 0);

    eventually(|| async {
        matches!(
            queue.get_message(&id).await,
            Some(QueueMessage { status: MessageStatus::Completed, .. })
        )
    })
    .await;

    let message = queue.get_message(&id).await.unwrap();
    assert_eq!(message.retry_count, 0);
    assert_eq!(message.created_at, created_at);
    assert!(message.error_message.is_none());

    // the replay went over the wire as a fresh attempt
    let republished: Vec<Value> = broker
        .published_json(SUBJECT)
        .into_iter()
        .filter(|envelope| envelope["id"] == json!(id) && envelope["retryCount"] == json!(0))
        .collect();
    assert_eq!(republished.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_handler_is_retried_then_dead_lettered() {
    let (_broker, queue) = connected_queue(&test_config()).await;
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = attempts.clone();
    queue
        .subscribe_to_queue(
            SUBJECT,
            move |_message: QueueMessage| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if counter.load(Ordering::SeqCst) > 0 {
                        panic!("tensor shape mismatch");
                    }
                    Ok::<_, HandlerError>(Value::Null)
                }
            },
            None,
        )
        .await
        .unwrap();

    let id = queue.publish_message(SUBJECT, frame_payload("f-13"), None).await.unwrap();
    eventually(|| async { queue.get_queue_stats().await.dlq_messages == 1 }).await;

    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    assert_eq!(queue.get_queue_stats().await.processing_messages, 0);

    let dead = queue.get_message(&id).await.unwrap();
    assert_eq!(dead.status, MessageStatus::DeadLetter);
    assert_eq!(dead.retry_count, 4);
    assert_eq!(
        dead.error_message.as_deref(),
        Some("handler panicked: tensor shape mismatch")
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_replay_keeps_message_in_dlq() {
    let (broker, queue) = connected_queue(&test_config()).await;

    queue
        .subscribe_to_queue(
            SUBJECT,
            |_message: QueueMessage| async { Err::<Value, _>(HandlerError::new("model crashed")) },
            None,
        )
        .await
        .unwrap();

    let id = queue.publish_message(SUBJECT, frame_payload("f-14"), None).await.unwrap();
    eventually(|| async { queue.get_queue_stats().await.dlq_messages == 1 }).await;
    let published_before = broker.published().len();

    broker.disconnect().await.unwrap();
    let err = queue.republish_dlq_message(&id, SUBJECT).await.unwrap_err();
    assert!(matches!(err, QueueError::NotConnected));

    let stats = queue.get_queue_stats().await;
    assert_eq!(stats.dlq_messages, 1);
    assert_eq!(stats.processing_messages, 0);
    assert_eq!(broker.published().len(), published_before);

    let dead = queue.list_dlq_messages().await.remove(0);
    assert_eq!(dead.id, id);
    assert_eq!(dead.status, MessageStatus::DeadLetter);

    // replayable once the transport is back
    broker.connect().await.unwrap();
    assert_eq!(queue.republish_dlq_message(&id, SUBJECT).await.unwrap(), id);
    assert_eq!(queue.get_queue_stats().await.dlq_messages, 0);
}

#[tokio::test]
async fn test_replay_unknown_message_fails() {
    let (broker, queue) = connected_queue(&test_config()).await;

    let err = queue
        .republish_dlq_message("illustration-worker_1_1234", SUBJECT)
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::DlqNotFound(ref id) if id == "illustration-worker_1_1234"));
    assert!(broker.published().is_empty());
    let stats = queue.get_queue_stats().await;
    assert_eq!(stats.processing_messages, 0);
    assert_eq!(stats.dlq_messages, 0);
}

#[tokio::test(start_paused = true)]
async fn test_redelivery_of_dead_lettered_id_is_ignored() {
    let (broker, queue) = connected_queue(&test_config()).await;
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = attempts.clone();
    queue
        .subscribe_to_queue(
            SUBJECT,
            move |_message: QueueMessage| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<Value, _>(HandlerError::new("bad prompt"))
                }
            },
            None,
        )
        .await
        .unwrap();

    queue.publish_message(SUBJECT, frame_payload("f-7"), None).await.unwrap();
    eventually(|| async { queue.get_queue_stats().await.dlq_messages == 1 }).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 4);

    let dead = queue.list_dlq_messages().await.remove(0);
    let envelope = dead.to_envelope("illustration-worker").encode().unwrap();
    broker.publish(SUBJECT, envelope).await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    let stats = queue.get_queue_stats().await;
    assert_eq!(stats.dlq_messages, 1);
    assert_eq!(stats.processing_messages, 0);
}

#[tokio::test(start_paused = true)]
async fn test_message_id_format() {
    let (_broker, queue) = connected_queue(&test_config()).await;

    let id = queue.publish_message(SUBJECT, frame_payload("f-8"), None).await.unwrap();

    let parts: Vec<&str> = id.rsplitn(3, '_').collect();
    assert_eq!(parts.len(), 3);
    assert_eq!(parts[2], "illustration-worker");
    assert!(parts[1].parse::<i64>().unwrap() > 0);
    let suffix: u32 = parts[0].parse().unwrap();
    assert!((1000..=9999).contains(&suffix));
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_waits_for_warm_up() {
    let config = test_config();
    let broker = Arc::new(InMemoryBroker::new());
    let loader = SimulatedModelLoader::new(
        "/models/sdxl",
        Duration::from_secs(2),
        Duration::from_millis(500),
    );
    let warmer = Arc::new(ResourceWarmer::new(Arc::new(loader), 3));
    let queue = Arc::new(QueueManager::new(broker.clone(), &config).with_warm_gate(warmer.clone()));
    queue.connect().await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    queue
        .subscribe_to_queue(
            SUBJECT,
            move |_message: QueueMessage| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, HandlerError>(Value::Null)
                }
            },
            None,
        )
        .await
        .unwrap();

    queue.publish_message(SUBJECT, frame_payload("f-9"), None).await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    // the record is tracked while it waits
    assert_eq!(queue.get_queue_stats().await.processing_messages, 1);

    warmer.warm_cache().await.unwrap();
    eventually(|| async { calls.load(Ordering::SeqCst) == 1 }).await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_pending_retries() {
    let mut config = test_config();
    config.retry.delays_secs = vec![60.0];
    let (broker, queue) = connected_queue(&config).await;
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = attempts.clone();
    queue
        .subscribe_to_queue(
            SUBJECT,
            move |_message: QueueMessage| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<Value, _>(HandlerError::new("timeout"))
                }
            },
            None,
        )
        .await
        .unwrap();

    queue.publish_message(SUBJECT, frame_payload("f-10"), None).await.unwrap();
    eventually(|| async { queue.pending_retries() == 1 }).await;

    let cancelled = queue.shutdown().await.unwrap();
    assert_eq!(cancelled, 1);
    assert_eq!(queue.pending_retries(), 0);
    assert!(!broker.is_connected());

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_delete_message_cancels_retry() {
    let mut config = test_config();
    config.retry.delays_secs = vec![60.0];
    let (_broker, queue) = connected_queue(&config).await;
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = attempts.clone();
    queue
        .subscribe_to_queue(
            SUBJECT,
            move |_message: QueueMessage| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<Value, _>(HandlerError::new("timeout"))
                }
            },
            None,
        )
        .await
        .unwrap();

    let id = queue.publish_message(SUBJECT, frame_payload("f-11"), None).await.unwrap();
    eventually(|| async { queue.pending_retries() == 1 }).await;

    let deleted = queue.delete_message(&id).await.unwrap();
    assert_eq!(deleted.status, MessageStatus::Retry);
    assert_eq!(queue.pending_retries(), 0);
    assert!(queue.get_message(&id).await.is_none());

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    let err = queue.delete_message(&id).await.unwrap_err();
    assert!(matches!(err, QueueError::MessageNotFound(_)));
}

#[tokio::test]
async fn test_transport_failures_surface_as_errors() {
    let config = test_config();

    let queue = QueueManager::new(Arc::new(InMemoryBroker::unreachable()), &config);
    let err = queue.connect().await.unwrap_err();
    assert!(matches!(err, QueueError::TransportConnect { .. }));

    let queue = QueueManager::new(Arc::new(InMemoryBroker::new()), &config);
    let err = queue
        .publish_message(SUBJECT, frame_payload("f-12"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::NotConnected));
    assert!(!queue.get_queue_stats().await.connected);
}

#[tokio::test(start_paused = true)]
async fn test_queue_group_delivers_each_message_once() {
    let config = test_config();
    let broker = Arc::new(InMemoryBroker::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let mut workers = Vec::new();

    for _ in 0..2 {
        let queue = Arc::new(QueueManager::new(broker.clone(), &config));
        queue.connect().await.unwrap();
        let counter = calls.clone();
        queue
            .subscribe_to_queue(
                SUBJECT,
                move |_message: QueueMessage| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, HandlerError>(Value::Null)
                    }
                },
                Some("illustration-workers"),
            )
            .await
            .unwrap();
        workers.push(queue);
    }

    for i in 0..4 {
        workers[0]
            .publish_message(SUBJECT, frame_payload(&format!("g-{}", i)), None)
            .await
            .unwrap();
    }

    eventually(|| async { calls.load(Ordering::SeqCst) == 4 }).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    let first = workers[0].get_queue_stats().await.processing_messages;
    let second = workers[1].get_queue_stats().await.processing_messages;
    assert_eq!(first, 2);
    assert_eq!(second, 2);
}

#[tokio::test(start_paused = true)]
async fn test_scaler_follows_queue_backlog() {
    let mut config = test_config();
    config.retry.completed_retention_secs = 0;
    config.scaler.min_workers = 1;
    config.scaler.max_workers = 4;
    config.scaler.cooldown_secs = 60;

    let broker = Arc::new(InMemoryBroker::new());
    let pool = Arc::new(WorkerPool::new(config.scaler.min_workers));
    let queue = Arc::new(QueueManager::new(broker, &config).with_worker_pool(pool.clone()));
    queue.connect().await.unwrap();

    let gate = Arc::new(Semaphore::new(0));
    let permits = gate.clone();
    queue
        .subscribe_to_queue(
            SUBJECT,
            move |_message: QueueMessage| {
                let permits = permits.clone();
                async move {
                    permits
                        .acquire()
                        .await
                        .map_err(|e| HandlerError::new(e.to_string()))?
                        .forget();
                    Ok::<_, HandlerError>(Value::Null)
                }
            },
            None,
        )
        .await
        .unwrap();

    let scaler = AutoScaler::new(queue.clone(), &config.scaler).with_worker_pool(pool.clone());

    for i in 0..5 {
        queue
            .publish_message(SUBJECT, frame_payload(&format!("s-{}", i)), None)
            .await
            .unwrap();
    }
    eventually(|| async { queue.get_queue_stats().await.processing_messages == 5 }).await;
    assert_eq!(pool.active(), 1);

    assert_eq!(scaler.check_scaling_needs().await, ScalingDecision::ScaledUp(2));
    assert_eq!(pool.size(), 2);
    assert_eq!(scaler.check_scaling_needs().await, ScalingDecision::CoolingDown);
    eventually(|| async { pool.active() == 2 }).await;

    gate.add_permits(5);
    eventually(|| async { queue.get_queue_stats().await.processing_messages == 0 }).await;

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(scaler.check_scaling_needs().await, ScalingDecision::ScaledDown(1));
    assert_eq!(pool.size(), 1);
    assert_eq!(scaler.current_workers().await, 1);
}
