#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Ordering guarantees under concurrent emission.

use proptest::prelude::*;
use relay_events::*;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

fn collect(rx: &mut tokio::sync::mpsc::UnboundedReceiver<EventEnvelope>) -> Vec<EventEnvelope> {
    let mut out = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        out.push(envelope);
    }
    out
}

#[test]
fn test_concurrent_emitters_produce_dense_sequence() {
    let (sink, mut rx) = ChannelSink::new();
    let emitter = Arc::new(OrderedEventEmitter::new("t1", "r1", Arc::new(sink)));
    emitter.run_started(None).unwrap();

    let threads: Vec<_> = (0..8)
        .map(|worker| {
            let emitter = emitter.clone();
            std::thread::spawn(move || {
                for i in 0..250 {
                    emitter
                        .custom("tick", json!({"worker": worker, "i": i}))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in threads {
        handle.join().unwrap();
    }
    emitter.run_finished(None).unwrap();

    let events = collect(&mut rx);
    assert_eq!(events.len(), 2 + 8 * 250);

    // The sink sees events in the order their numbers were assigned.
    for (i, envelope) in events.iter().enumerate() {
        assert_eq!(envelope.order, i as u64);
        assert_eq!(envelope.session_id, "r1");
    }
    assert_eq!(events.first().unwrap().event.kind(), "RUN_STARTED");
    assert!(events.last().unwrap().event.is_terminal());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_tasks_share_one_sink_without_interleaving() {
    let (sink, mut rx) = ChannelSink::new();
    let sink: Arc<dyn EventSink> = Arc::new(sink);

    let mut handles = Vec::new();
    for run in 0..6 {
        let sink = sink.clone();
        handles.push(tokio::spawn(async move {
            let emitter = OrderedEventEmitter::new(format!("t{}", run), format!("r{}", run), sink);
            emitter.run_started(None).unwrap();
            emitter.message_start("m").unwrap();
            for i in 0..20 {
                emitter.content("m", &format!("{}", i)).unwrap();
                tokio::task::yield_now().await;
            }
            emitter.message_end("m", None).unwrap();
            emitter.run_finished(None).unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let events = collect(&mut rx);
    assert_eq!(events.len(), 6 * 24);
    for run in 0..6 {
        let session = format!("r{}", run);
        let orders: Vec<u64> = events
            .iter()
            .filter(|e| e.session_id == session)
            .map(|e| e.order)
            .collect();
        assert_eq!(orders, (0..24).collect::<Vec<_>>());
    }
}

proptest! {
    #[test]
    fn prop_receiver_reconstructs_every_sequence_number(
        workers in 1usize..6,
        per_worker in 1usize..40,
    ) {
        let (sink, mut rx) = ChannelSink::new();
        let emitter = Arc::new(OrderedEventEmitter::new("t", "r", Arc::new(sink)));
        emitter.run_started(None).unwrap();

        let threads: Vec<_> = (0..workers)
            .map(|_| {
                let emitter = emitter.clone();
                std::thread::spawn(move || {
                    for _ in 0..per_worker {
                        emitter.custom("e", json!(null)).unwrap();
                    }
                })
            })
            .collect();
        for handle in threads {
            handle.join().unwrap();
        }

        let events = collect(&mut rx);
        let total = 1 + workers * per_worker;
        prop_assert_eq!(events.len(), total);
        let seen: HashSet<u64> = events.iter().map(|e| e.order).collect();
        prop_assert_eq!(seen.len(), total);
        prop_assert!(seen.iter().all(|order| *order < total as u64));
    }
}
