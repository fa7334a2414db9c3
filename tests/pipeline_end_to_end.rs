use std::sync::{Arc, Mutex};
use std::time::Duration;

use oomwatch::enrich::{Enricher, StaticTable};
use oomwatch::fanout::{Consume, SubscriberHandle};
use oomwatch::pipeline::consumer::{ConsumerLoop, LoopState};
use oomwatch::pipeline::transport::{OverflowPolicy, RecordProducer, Transport};
use oomwatch::telemetry::{PipelineMetrics, PipelineSignal, SignalRecorder};
use oomwatch::{Constraint, EnrichmentStatus, OomDecision, OomEvent, OomWatcher, VictimTask, WatcherConfig};
use tokio::sync::{mpsc, watch};

fn decision(ts: u64, pid: u32, memcg_id: u64, constraint: Constraint, order: i32) -> OomDecision {
    OomDecision {
        timestamp_ns: ts,
        chosen: Some(VictimTask::new(pid, pid, "victim", 10_000, 8_000)),
        memcg_id,
        constraint,
        order,
        totalpages: 1_000_000,
        chosen_points: 8_000,
    }
}

fn config() -> WatcherConfig {
    WatcherConfig {
        ring_buffer_capacity: 8,
        poll_interval_ms: 10,
        enrichment_timeout_ms: 500,
        ..WatcherConfig::default()
    }
}

fn collect(handle: &mut SubscriberHandle) -> Vec<OomEvent> {
    let mut events = Vec::new();
    loop {
        match handle.consume() {
            Consume::Event(event) => events.push(event),
            Consume::Closed => return events,
            Consume::WouldBlock => panic!("queue should be closed after shutdown"),
        }
    }
}

#[tokio::test]
async fn test_three_kills_reach_every_subscriber() {
    let table = StaticTable::new().with_cgroup(55, "/sys/fs/cgroup/foo");
    let watcher = OomWatcher::start(config(), Arc::new(table)).expect("pipeline should start");

    let mut logger = watcher.register("logger", 16);
    let mut alerts = watcher.register("alerts", 16);
    let mut producer = watcher.producer();

    producer.submit(&decision(1_000, 100, 0, Constraint::None, 3)).unwrap();
    producer.submit(&decision(2_000, 200, 55, Constraint::Memcg, 1)).unwrap();
    producer.submit(&decision(3_000, 300, 0, Constraint::None, -1)).unwrap();

    let report = watcher.shutdown().await;

    for handle in [&mut logger, &mut alerts] {
        let events = collect(handle);
        assert_eq!(events.len(), 3, "subscriber {} should see all kills", handle.name());

        let timestamps: Vec<u64> = events.iter().map(|e| e.timestamp_ns).collect();
        assert_eq!(timestamps, vec![1_000, 2_000, 3_000], "delivered in timestamp order");

        assert_eq!(events[0].victim_pid, 100);
        assert_eq!(events[0].cgroup_path, None);
        assert_eq!(events[0].enrichment_status, EnrichmentStatus::Complete);

        assert_eq!(events[1].victim_pid, 200);
        assert_eq!(events[1].enrichment_status, EnrichmentStatus::Complete);
        assert_eq!(events[1].cgroup_path.as_deref(), Some("/sys/fs/cgroup/foo"));

        assert_eq!(events[2].victim_pid, 300);
        assert!(events[2].is_sysrq());
        assert_eq!(events[2].chosen_points, None, "sysrq path carries no score");
    }

    assert_eq!(report.metrics.events_total, 3);
    assert_eq!(report.metrics.drops_total, 0);
    assert_eq!(report.metrics.enrichment_partial_total, 0);
    assert_eq!(report.consumer.consumed, 3);
    println!("End-to-end scenario passed");
}

#[tokio::test]
async fn test_truncated_record_is_discarded_without_stall() {
    let watcher = OomWatcher::start(config(), Arc::new(StaticTable::new())).unwrap();
    let mut sub = watcher.register("sub", 16);
    let mut producer = watcher.producer();

    producer.submit(&decision(1_000, 100, 0, Constraint::None, 0)).unwrap();
    producer.submit_raw(&[1, 0, 0, 0, 7, 7, 7]);
    producer.submit(&decision(2_000, 101, 0, Constraint::None, 0)).unwrap();

    let report = watcher.shutdown().await;

    let events = collect(&mut sub);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].victim_pid, 100);
    assert_eq!(events[1].victim_pid, 101);
    assert_eq!(report.metrics.drops_corruption, 1);
    assert_eq!(report.metrics.drops_total, 1);
    assert_eq!(report.signals.corruptions, 1);
    assert_eq!(report.signals.drop_signals, 0, "raw injection does not open a sequence gap");
}

#[tokio::test]
async fn test_overwritten_records_surface_as_drop_detected() {
    let config = WatcherConfig {
        ring_buffer_capacity: 2,
        overflow_policy: OverflowPolicy::OverwriteOldest,
        ..config()
    };
    let watcher = OomWatcher::start(config, Arc::new(StaticTable::new())).unwrap();
    let mut sub = watcher.register("sub", 16);
    let mut producer = watcher.producer();

    // Nothing runs the consumer until we await, so the ring wraps.
    for i in 0..5u32 {
        producer.submit(&decision(1_000 + i as u64, 100 + i, 0, Constraint::None, 0)).unwrap();
    }

    let report = watcher.shutdown().await;

    let pids: Vec<u32> = collect(&mut sub).iter().map(|e| e.victim_pid).collect();
    assert_eq!(pids, vec![103, 104], "only the newest records survive");
    assert_eq!(report.metrics.drops_overflow, 3);
    assert_eq!(report.metrics.gaps_detected, 1);
    assert_eq!(report.signals.missing_records, 3);
    assert_eq!(report.signals.estimated_lost, 3);
}

#[tokio::test]
async fn test_shutdown_walks_state_machine() {
    let watcher = OomWatcher::start(config(), Arc::new(StaticTable::new())).unwrap();
    assert_eq!(watcher.state(), LoopState::Running);

    let mut sub = watcher.register("sub", 4);
    assert_eq!(sub.consume(), Consume::WouldBlock, "nothing to read while running");

    let signals_before = watcher.signals();
    assert!(signals_before.is_empty());

    let report = watcher.shutdown().await;
    assert_eq!(report.signals.state_changes, 2, "Running -> Draining -> Stopped");
    assert_eq!(sub.consume(), Consume::Closed);
}

#[tokio::test]
async fn test_signals_are_recorded_in_order() {
    let config = WatcherConfig {
        ring_buffer_capacity: 1,
        ..config()
    };
    let watcher = OomWatcher::start(config, Arc::new(StaticTable::new())).unwrap();
    let mut producer = watcher.producer();

    producer.submit(&decision(1, 10, 0, Constraint::None, 0)).unwrap();
    assert!(producer.submit(&decision(2, 11, 0, Constraint::None, 0)).is_err());

    // Let the consumer take the first record, then send one more.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    producer.submit(&decision(3, 12, 0, Constraint::None, 0)).unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let signals = watcher.signals();
    assert_eq!(
        signals,
        vec![PipelineSignal::DropDetected {
            producer: 0,
            missing: 1,
            estimated_lost: 1
        }]
    );
    watcher.shutdown().await;
}

#[tokio::test]
async fn test_unstamped_decisions_get_capture_time() {
    let watcher = OomWatcher::start(config(), Arc::new(StaticTable::new())).unwrap();
    let mut sub = watcher.register("sub", 8);
    let mut producer = watcher.producer();

    producer.submit(&decision(0, 100, 0, Constraint::None, 0)).unwrap();
    producer.submit(&decision(0, 101, 0, Constraint::None, 0)).unwrap();
    producer.submit(&decision(7, 102, 0, Constraint::None, 0)).unwrap();

    watcher.shutdown().await;

    let timestamps: Vec<u64> = collect(&mut sub).iter().map(|e| e.timestamp_ns).collect();
    assert_eq!(timestamps.len(), 3);
    assert!(timestamps[0] > 0, "submit stamps a missing capture time");
    assert!(timestamps[1] >= timestamps[0], "stamps follow submission order");
    assert_eq!(timestamps[2], 7, "an explicit capture time is kept");
}

#[tokio::test]
async fn test_drain_deadline_abandons_buffered_records() {
    let config = WatcherConfig {
        drain_deadline_ms: 0,
        ..config()
    };
    let watcher = OomWatcher::start(config, Arc::new(StaticTable::new())).unwrap();
    let mut sub = watcher.register("sub", 8);
    let mut producer = watcher.producer();

    // The consumer is not polled before shutdown, so all five are still buffered.
    for pid in 1..=5 {
        producer.submit(&decision(pid as u64, pid, 0, Constraint::None, 0)).unwrap();
    }

    let report = watcher.shutdown().await;

    assert_eq!(report.consumer.abandoned, 5);
    assert_eq!(report.consumer.consumed, 0);
    assert_eq!(report.signals.abandoned_on_drain, 5, "DrainAbandoned signal recorded");
    assert_eq!(report.signals.state_changes, 2, "still reaches Stopped");
    assert_eq!(sub.consume(), Consume::Closed);
}

#[tokio::test]
async fn test_full_enrichment_backlog_leaves_records_buffered() {
    let metrics = Arc::new(PipelineMetrics::new());
    let transport = Arc::new(Transport::new(8, OverflowPolicy::DropNewest, Arc::clone(&metrics)).unwrap());
    let enricher = Enricher::new(
        Arc::new(StaticTable::new()),
        1,
        Duration::from_millis(100),
        Arc::clone(&metrics),
    );
    let (pending_tx, mut pending_rx) = mpsc::channel(2);
    let (state_tx, _state_rx) = watch::channel(LoopState::Running);
    let mut consumer = ConsumerLoop::new(
        Arc::clone(&transport),
        enricher,
        pending_tx,
        Arc::clone(&metrics),
        Arc::new(Mutex::new(SignalRecorder::new())),
        state_tx,
        Duration::from_millis(10),
        Duration::from_millis(10),
    );

    let mut producer = RecordProducer::new(0, Arc::clone(&transport));
    for pid in 1..=5 {
        producer.submit(&decision(pid as u64, pid, 0, Constraint::None, 0)).unwrap();
    }

    assert_eq!(consumer.drain_available(), 2, "only as many as the backlog holds");
    assert_eq!(transport.len(), 3, "the rest waits in the transport");
    assert_eq!(metrics.snapshot().events_total, 2);
    assert_eq!(metrics.snapshot().drops_total, 0, "nothing is lost while waiting");

    let first = pending_rx.recv().await.unwrap();
    assert_eq!(first.raw.victim_pid, 1);
    assert_eq!(consumer.drain_available(), 1, "one slot freed, one record taken");
    assert_eq!(transport.len(), 2);
}
