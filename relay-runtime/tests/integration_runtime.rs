//! End-to-end runs through the consumer, orchestrator and event sink.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use async_trait::async_trait;
use relay_events::{AgentEvent, ChannelSink, EventEnvelope, EventSink, SinkError, TASK_FAILED};
use relay_memory::{ConversationMessage, FetchError, HistorySource, RuntimeMessage};
use relay_queue::memory::Settlement;
use relay_queue::{retry_count, Headers, InMemoryBroker, QueueError};
use relay_runtime::*;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

const WAIT: Duration = Duration::from_secs(5);

// Mock implementations
struct MockHistory {
    fetches: AtomicUsize,
}

#[async_trait]
impl HistorySource for MockHistory {
    async fn fetch(&self, thread_id: &str, _limit: usize) -> Result<Vec<RuntimeMessage>, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(vec![serde_json::from_value(json!({
            "id": "m0",
            "thread": thread_id,
            "content": "hello world",
            "role": "user"
        }))
        .unwrap()])
    }
}

/// Streams the last message back word by word.
struct EchoWords;

#[async_trait]
impl Run for EchoWords {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, ctx: &RunContext) -> Result<RunOutcome, RunError> {
        let messages = ctx.messages().await?;
        let text = messages
            .last()
            .map(|m| m.content().to_string())
            .unwrap_or_default();

        let emitter = ctx.emitter();
        emitter.message_start("msg-1")?;
        for word in text.split_whitespace() {
            emitter.content("msg-1", word)?;
        }
        emitter.message_end("msg-1", None)?;
        ctx.append_message(ConversationMessage::ai(text));
        Ok(RunOutcome::default())
    }
}

struct Failing;

#[async_trait]
impl Run for Failing {
    fn name(&self) -> &str {
        "failing"
    }

    async fn execute(&self, _ctx: &RunContext) -> Result<RunOutcome, RunError> {
        Err(RunError::Failed("model unavailable".to_string()))
    }
}

struct Background;

#[async_trait]
impl Run for Background {
    fn name(&self) -> &str {
        "background"
    }

    fn interactive(&self) -> bool {
        false
    }

    async fn execute(&self, ctx: &RunContext) -> Result<RunOutcome, RunError> {
        ctx.emitter().message_start("hidden")?;
        ctx.emitter().content("hidden", "not streamed")?;
        ctx.emitter().message_end("hidden", None)?;
        Ok(RunOutcome::with_result(json!({"done": true})))
    }
}

/// Writes to the conversation, then trips over a bad index.
struct Exploding;

#[async_trait]
impl Run for Exploding {
    fn name(&self) -> &str {
        "exploding"
    }

    async fn execute(&self, ctx: &RunContext) -> Result<RunOutcome, RunError> {
        ctx.append_message(ConversationMessage::ai("partial"));
        let steps: Vec<u32> = Vec::new();
        let index = ctx.input().len();
        Ok(RunOutcome::with_result(json!(steps[index])))
    }
}

/// Accepts the first `limit` envelopes, then reports the channel closed.
struct LimitedSink {
    limit: usize,
    sent: AtomicUsize,
}

impl EventSink for LimitedSink {
    fn send(&self, _envelope: EventEnvelope) -> Result<(), SinkError> {
        if self.sent.fetch_add(1, Ordering::SeqCst) < self.limit {
            Ok(())
        } else {
            Err(SinkError::Closed)
        }
    }
}

struct Harness {
    runtime: Arc<Runtime>,
    broker: InMemoryBroker,
    history: Arc<MockHistory>,
    events: UnboundedReceiver<EventEnvelope>,
}

fn harness(max_attempts: u32) -> Harness {
    let mut config = RuntimeConfig::new("test", "secret", "http://localhost:3000", "amqp://localhost");
    config.retry.max_attempts = max_attempts;
    config.retry.backoff_ms = 10;
    config.shutdown_grace_secs = 2;

    let registry = RunRegistry::new()
        .with(Arc::new(EchoWords))
        .with(Arc::new(Failing))
        .with(Arc::new(Background))
        .with(Arc::new(Exploding));
    let history = Arc::new(MockHistory {
        fetches: AtomicUsize::new(0),
    });
    let (sink, events) = ChannelSink::new();

    Harness {
        runtime: Arc::new(Runtime::new(config, registry, history.clone(), Arc::new(sink))),
        broker: InMemoryBroker::new(),
        history,
        events,
    }
}

fn task_body(run_name: &str, thread_id: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "namespace": "test",
        "agentName": run_name,
        "sentAt": "2024-05-01T10:00:00Z",
        "message": {"id": "m1", "thread": thread_id, "content": "hello world", "role": "user"},
        "config": {}
    }))
    .unwrap()
}

/// Serve until `settlements` deliveries are settled, then shut down.
async fn serve_until(harness: &Harness, settlements: usize) {
    let mut consumer = harness.runtime.consumer(Arc::new(harness.broker.clone()));
    let token = consumer.shutdown_token();

    let server = {
        let runtime = Arc::clone(&harness.runtime);
        tokio::spawn(async move {
            let result = runtime.serve(&mut consumer).await;
            (consumer, result)
        })
    };

    assert!(harness.broker.wait_for_settlements(settlements, WAIT).await);
    token.cancel();

    let (consumer, result) = server.await.unwrap();
    result.unwrap();
    harness.runtime.shutdown(&consumer).await.unwrap();
    assert!(harness.broker.is_closed());
}

fn drain(events: &mut UnboundedReceiver<EventEnvelope>) -> Vec<EventEnvelope> {
    let mut out = Vec::new();
    while let Ok(envelope) = events.try_recv() {
        out.push(envelope);
    }
    out
}

fn kinds(envelopes: &[EventEnvelope]) -> Vec<(&'static str, u64)> {
    envelopes
        .iter()
        .map(|e| (e.event.kind(), e.order))
        .collect()
}

#[tokio::test]
async fn test_successful_run_streams_ordered_events() {
    let mut harness = harness(3);
    harness.broker.push(&harness.runtime.queue_name(), task_body("echo", "t1"), Headers::new());

    serve_until(&harness, 1).await;

    let events = drain(&mut harness.events);
    assert_eq!(
        kinds(&events),
        vec![
            ("RUN_STARTED", 0),
            ("TEXT_MESSAGE_START", 1),
            ("TEXT_MESSAGE_CONTENT", 2),
            ("TEXT_MESSAGE_CONTENT", 3),
            ("TEXT_MESSAGE_END", 4),
            ("RUN_FINISHED", 5),
        ]
    );

    let run_id = events[0].session_id.clone();
    for envelope in &events {
        assert_eq!(envelope.thread_id, "t1");
        assert_eq!(envelope.session_id, run_id);
    }
    assert!(matches!(
        &events[2].event,
        AgentEvent::TextMessageContent { delta, .. } if delta == "hello"
    ));

    assert!(matches!(harness.broker.settlements()[0], Settlement::Acked { .. }));
    assert!(harness.broker.published().is_empty());
    assert!(!harness.runtime.cache().contains("t1"));
    assert_eq!(harness.history.fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unknown_run_is_discarded_without_events() {
    let mut harness = harness(3);
    harness.broker.push(
        &harness.runtime.queue_name(),
        task_body("nonexistent", "t1"),
        Headers::new(),
    );

    serve_until(&harness, 1).await;

    assert!(matches!(
        harness.broker.settlements()[0],
        Settlement::Rejected { requeue: false, .. }
    ));
    assert!(harness.broker.published().is_empty());
    assert!(drain(&mut harness.events).is_empty());
}

#[tokio::test]
async fn test_failed_run_reports_error_and_republishes() {
    let mut harness = harness(1);
    let queue = harness.runtime.queue_name();
    harness.broker.push(&queue, task_body("failing", "t2"), Headers::new());

    // Ack of the failed attempt, then discard of the republished copy.
    serve_until(&harness, 2).await;

    let events = drain(&mut harness.events);
    assert_eq!(kinds(&events), vec![("RUN_STARTED", 0), ("RUN_ERROR", 1)]);
    match &events[1].event {
        AgentEvent::RunError { message, code, .. } => {
            assert_eq!(message, "model unavailable");
            assert_eq!(code, TASK_FAILED);
        }
        other => panic!("Expected RUN_ERROR, got {:?}", other),
    }

    let published = harness.broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].queue, queue);
    assert_eq!(retry_count(&published[0].headers), 1);

    let settlements = harness.broker.settlements();
    assert!(matches!(settlements[0], Settlement::Acked { .. }));
    assert!(matches!(settlements[1], Settlement::Rejected { requeue: false, .. }));
    assert!(!harness.runtime.cache().contains("t2"));
}

#[tokio::test]
async fn test_non_interactive_run_emits_only_run_events() {
    let mut harness = harness(3);
    harness.broker.push(
        &harness.runtime.queue_name(),
        task_body("background", "t3"),
        Headers::new(),
    );

    serve_until(&harness, 1).await;

    let events = drain(&mut harness.events);
    assert_eq!(kinds(&events), vec![("RUN_STARTED", 0), ("RUN_FINISHED", 1)]);
    assert!(matches!(
        &events[1].event,
        AgentEvent::RunFinished { raw_event: Some(raw), .. } if raw == &json!({"done": true})
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_runs_keep_per_run_order() {
    let mut harness = harness(3);
    let queue = harness.runtime.queue_name();
    for i in 0..6 {
        harness.broker.push(&queue, task_body("echo", &format!("thread-{}", i)), Headers::new());
    }

    serve_until(&harness, 6).await;

    let events = drain(&mut harness.events);
    assert_eq!(events.len(), 36);

    let mut sessions = std::collections::HashMap::<String, Vec<u64>>::new();
    for envelope in &events {
        sessions
            .entry(envelope.session_id.clone())
            .or_default()
            .push(envelope.order);
    }
    assert_eq!(sessions.len(), 6);
    for orders in sessions.values() {
        assert_eq!(orders, &(0..6).collect::<Vec<u64>>());
    }
}

#[tokio::test]
async fn test_closed_sink_requeues_without_clearing_cache() {
    let harness = harness(3);
    drop(harness.events);

    harness.runtime.cache().append("t4", ConversationMessage::human("kept"));
    let task = relay_queue::Task::decode(&task_body("echo", "t4")).unwrap();

    let err = harness.runtime.orchestrator().run_task(task).await.unwrap_err();
    assert!(matches!(err, relay_queue::HandlerError::Transient(_)));
    assert!(harness.runtime.cache().contains("t4"));
}

#[tokio::test]
async fn test_serve_fails_fast_when_broker_unreachable() {
    let harness = harness(3);
    let mut consumer = harness
        .runtime
        .consumer(Arc::new(InMemoryBroker::unreachable("connection refused")));

    let err = harness.runtime.serve(&mut consumer).await.unwrap_err();
    assert!(matches!(err, RuntimeError::Queue(QueueError::Connection(_))));
}

#[tokio::test]
async fn test_panicking_run_fails_with_bounded_retries() {
    let mut harness = harness(2);
    let queue = harness.runtime.queue_name();
    harness.broker.push(&queue, task_body("exploding", "t6"), Headers::new());

    // Two acked attempts, then the discard of the second republished copy.
    serve_until(&harness, 3).await;

    let events = drain(&mut harness.events);
    assert_eq!(
        kinds(&events),
        vec![("RUN_STARTED", 0), ("RUN_ERROR", 1), ("RUN_STARTED", 0), ("RUN_ERROR", 1)]
    );
    match &events[1].event {
        AgentEvent::RunError { message, code, .. } => {
            assert!(message.starts_with("Run panicked"));
            assert_eq!(code, TASK_FAILED);
        }
        other => panic!("Expected RUN_ERROR, got {:?}", other),
    }

    let retries: Vec<u32> = harness
        .broker
        .published()
        .iter()
        .map(|p| retry_count(&p.headers))
        .collect();
    assert_eq!(retries, vec![1, 2]);

    let settlements = harness.broker.settlements();
    assert_eq!(settlements.len(), 3);
    assert!(matches!(settlements[0], Settlement::Acked { .. }));
    assert!(matches!(settlements[1], Settlement::Acked { .. }));
    assert!(matches!(settlements[2], Settlement::Rejected { requeue: false, .. }));
    assert!(!harness.runtime.cache().contains("t6"));
}

#[tokio::test]
async fn test_undelivered_terminal_event_keeps_cache() {
    let sink = LimitedSink {
        limit: 1,
        sent: AtomicUsize::new(0),
    };
    let runtime = Runtime::new(
        RuntimeConfig::new("test", "secret", "http://localhost:3000", "amqp://localhost"),
        RunRegistry::new().with(Arc::new(Background)),
        Arc::new(MockHistory {
            fetches: AtomicUsize::new(0),
        }),
        Arc::new(sink),
    );
    runtime.cache().append("t7", ConversationMessage::human("kept"));

    let task = relay_queue::Task::decode(&task_body("background", "t7")).unwrap();
    assert!(runtime.orchestrator().run_task(task).await.unwrap());
    assert!(runtime.cache().contains("t7"));
}
