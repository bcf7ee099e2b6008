//! Scheduler integration tests.
//!
//! Tests verify:
//! - Concurrent single-tile requests share one computation
//! - Requests for a queued tile join its job instead of queueing another
//! - Cancelled tiles are dequeued and never computed
//! - Listener jobs queue behind chunk work and ahead of older listener jobs
//! - Blocking calls propagate the first failure

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use tilecore::{
    ComputeError, ImageId, PoolKind, SchedulerConfig, SchedulerError, TileKey, TileScheduler,
    TileStatus,
};

use super::test_utils::{tile_for, wait_until, Gate, Outcome, RecordingListener, TestSource};

const IMAGE: ImageId = ImageId::new(1);
const OTHER: ImageId = ImageId::new(2);

fn single_worker() -> SchedulerConfig {
    SchedulerConfig {
        standard_parallelism: 1,
        prefetch_parallelism: 1,
        ..SchedulerConfig::default()
    }
}

/// A scheduler whose only standard worker is parked inside the computation of
/// `blocker` until `gate` opens.
fn blocked_scheduler() -> (TileScheduler, Arc<TestSource>, Arc<Gate>, TileKey) {
    let gate = Gate::new();
    let blocker = TileKey::new(OTHER, 99, 99);
    let source = Arc::new(TestSource::new().gated(gate.clone(), [blocker]));
    let scheduler = TileScheduler::new(source.clone(), single_worker()).unwrap();

    scheduler.schedule(OTHER, &[(99, 99)], Vec::new());
    gate.wait_entered(1);
    assert_eq!(scheduler.queued_jobs(PoolKind::Standard), 0);

    (scheduler, source, gate, blocker)
}

// =============================================================================
// Single Flight
// =============================================================================

#[test]
fn test_single_flight_computes_once() {
    let gate = Gate::new();
    let key = TileKey::new(IMAGE, 3, 4);
    let source = Arc::new(TestSource::new().gated(gate.clone(), [key]));
    let scheduler = Arc::new(TileScheduler::new(source.clone(), single_worker()).unwrap());

    let leader = {
        let scheduler = scheduler.clone();
        thread::spawn(move || scheduler.compute_single(IMAGE, 3, 4))
    };
    gate.wait_entered(1);

    let barrier = Arc::new(Barrier::new(8));
    let waiters: Vec<_> = (0..7)
        .map(|_| {
            let scheduler = scheduler.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                scheduler.compute_single(IMAGE, 3, 4)
            })
        })
        .collect();
    barrier.wait();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(scheduler.in_flight(), 1);
    gate.open();

    let expected = tile_for(IMAGE, 3, 4);
    assert_eq!(leader.join().unwrap().unwrap(), expected);
    for waiter in waiters {
        assert_eq!(waiter.join().unwrap().unwrap(), expected);
    }
    assert_eq!(source.calls_for(key), 1);
    assert_eq!(scheduler.in_flight(), 0);
}

#[test]
fn test_single_flight_shares_error() {
    let gate = Gate::new();
    let key = TileKey::new(IMAGE, 0, 0);
    let source = Arc::new(TestSource::new().gated(gate.clone(), [key]).failing(key));
    let scheduler = Arc::new(TileScheduler::new(source.clone(), single_worker()).unwrap());

    let callers: Vec<_> = (0..4)
        .map(|_| {
            let scheduler = scheduler.clone();
            thread::spawn(move || scheduler.compute_single(IMAGE, 0, 0))
        })
        .collect();
    gate.wait_entered(1);
    thread::sleep(Duration::from_millis(100));
    gate.open();

    let errors: Vec<SchedulerError> = callers
        .into_iter()
        .map(|c| c.join().unwrap().unwrap_err())
        .collect();
    assert!(errors.iter().all(|e| *e == errors[0]));
    assert!(matches!(
        errors[0].compute_error(),
        Some(ComputeError::Failed(_))
    ));
    assert_eq!(source.calls_for(key), 1);
}

#[test]
fn test_single_flight_waiter_timeout() {
    let gate = Gate::new();
    let key = TileKey::new(IMAGE, 0, 0);
    let source = Arc::new(TestSource::new().gated(gate.clone(), [key]));
    let config = SchedulerConfig {
        single_flight_timeout: Some(Duration::from_millis(30)),
        ..single_worker()
    };
    let scheduler = Arc::new(TileScheduler::new(source, config).unwrap());

    let leader = {
        let scheduler = scheduler.clone();
        thread::spawn(move || scheduler.compute_single(IMAGE, 0, 0))
    };
    gate.wait_entered(1);

    let err = scheduler.compute_single(IMAGE, 0, 0).unwrap_err();
    assert_eq!(err.compute_error(), Some(&ComputeError::Timeout));

    gate.open();
    assert!(leader.join().unwrap().is_ok());
}

// =============================================================================
// Request De-duplication
// =============================================================================

#[test]
fn test_two_requests_share_one_job() {
    let (scheduler, source, gate, _) = blocked_scheduler();
    let key = TileKey::new(IMAGE, 5, 5);

    let first = RecordingListener::new();
    let second = RecordingListener::new();
    let r1 = scheduler.schedule(IMAGE, &[(5, 5)], vec![first.as_listener()]);
    let r2 = scheduler.schedule(IMAGE, &[(5, 5)], vec![second.as_listener()]);
    assert_eq!(scheduler.queued_jobs(PoolKind::Standard), 1);

    gate.open();
    let events_1 = first.wait_for(1);
    let events_2 = second.wait_for(1);

    for events in [&events_1, &events_2] {
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key, key);
        assert_eq!(events[0].outcome, Outcome::Computed(tile_for(IMAGE, 5, 5)));
        let ids: HashSet<u64> = events[0].request_ids.iter().copied().collect();
        assert_eq!(ids, HashSet::from([r1.id(), r2.id()]));
    }

    assert_eq!(source.calls_for(key), 1);
    assert_eq!(r1.status(5, 5), Some(TileStatus::Computed));
    assert_eq!(r2.status(5, 5), Some(TileStatus::Computed));
    scheduler.shutdown();
}

#[test]
fn test_shared_listener_notified_once() {
    let (scheduler, _source, gate, _) = blocked_scheduler();
    let key = TileKey::new(IMAGE, 1, 1);

    let listener = RecordingListener::new();
    scheduler.schedule(IMAGE, &[(1, 1)], vec![listener.as_listener()]);
    scheduler.schedule(IMAGE, &[(1, 1)], vec![listener.as_listener()]);

    gate.open();
    listener.wait_for(1);
    scheduler.shutdown();

    assert_eq!(listener.events_for(key).len(), 1);
}

#[test]
fn test_duplicate_indices_in_one_request() {
    let source = Arc::new(TestSource::new());
    let scheduler = TileScheduler::new(source.clone(), single_worker()).unwrap();
    let listener = RecordingListener::new();

    let request = scheduler.schedule(
        IMAGE,
        &[(0, 0), (1, 0), (0, 0)],
        vec![listener.as_listener()],
    );
    listener.wait_for(2);
    scheduler.shutdown();

    assert_eq!(request.tile_indices(), &[(0, 0), (1, 0)]);
    assert_eq!(source.total_calls(), 2);
    assert!(request.is_finished());
}

// =============================================================================
// Cancellation
// =============================================================================

#[test]
fn test_cancelled_tile_never_computed() {
    let (scheduler, source, gate, blocker) = blocked_scheduler();
    let key = TileKey::new(IMAGE, 7, 7);

    let listener = RecordingListener::new();
    let request = scheduler.schedule(IMAGE, &[(7, 7)], vec![listener.as_listener()]);
    assert_eq!(scheduler.queued_jobs(PoolKind::Standard), 1);

    scheduler.cancel(&request, &[]);
    assert_eq!(scheduler.queued_jobs(PoolKind::Standard), 0);
    assert_eq!(request.status(7, 7), Some(TileStatus::Cancelled));
    assert_eq!(listener.events()[0].outcome, Outcome::Cancelled);

    gate.open();
    scheduler.shutdown();

    assert_eq!(source.calls_for(key), 0);
    assert_eq!(source.calls_for(blocker), 1);
    assert_eq!(listener.events().len(), 1);
}

#[test]
fn test_job_survives_until_last_request_cancels() {
    let (scheduler, source, gate, _) = blocked_scheduler();
    let key = TileKey::new(IMAGE, 2, 2);

    let first = RecordingListener::new();
    let second = RecordingListener::new();
    let r1 = scheduler.schedule(IMAGE, &[(2, 2)], vec![first.as_listener()]);
    let r2 = scheduler.schedule(IMAGE, &[(2, 2)], vec![second.as_listener()]);

    r1.cancel_tiles(&[(2, 2)]);
    assert_eq!(scheduler.queued_jobs(PoolKind::Standard), 1);
    assert_eq!(first.tally(key).get("cancelled"), Some(&1));
    assert!(second.events().is_empty());

    r2.cancel_tiles(&[]);
    assert_eq!(scheduler.queued_jobs(PoolKind::Standard), 0);

    gate.open();
    scheduler.shutdown();
    assert_eq!(source.calls_for(key), 0);
}

#[test]
fn test_cancel_after_completion_is_noop() {
    let source = Arc::new(TestSource::new());
    let scheduler = TileScheduler::new(source, single_worker()).unwrap();
    let listener = RecordingListener::new();

    let request = scheduler.schedule(IMAGE, &[(0, 0)], vec![listener.as_listener()]);
    listener.wait_for(1);
    scheduler.cancel(&request, &[]);

    assert_eq!(request.status(0, 0), Some(TileStatus::Computed));
    assert_eq!(listener.events().len(), 1);
}

#[test]
fn test_partial_cancel_ignores_foreign_indices() {
    let (scheduler, source, gate, _) = blocked_scheduler();
    let listener = RecordingListener::new();
    let request = scheduler.schedule(IMAGE, &[(0, 0), (1, 0)], vec![listener.as_listener()]);

    scheduler.cancel(&request, &[(1, 0), (40, 40)]);
    assert_eq!(request.status(1, 0), Some(TileStatus::Cancelled));
    assert_eq!(request.status(0, 0), Some(TileStatus::Pending));

    gate.open();
    listener.wait_for(2);
    scheduler.shutdown();

    assert_eq!(request.status(0, 0), Some(TileStatus::Computed));
    assert_eq!(source.calls_for(TileKey::new(IMAGE, 1, 0)), 0);
}

// =============================================================================
// Queue Ordering
// =============================================================================

#[test]
fn test_listener_jobs_queue_after_chunks() {
    let (scheduler, source, gate, blocker) = blocked_scheduler();
    let scheduler = Arc::new(scheduler);

    let bulk: Vec<(i32, i32)> = (0..4).map(|x| (x, 0)).collect();
    let blocking = {
        let scheduler = scheduler.clone();
        let bulk = bulk.clone();
        thread::spawn(move || scheduler.compute_blocking(IMAGE, &bulk))
    };
    wait_until("chunk job to be queued", || {
        scheduler.queued_jobs(PoolKind::Standard) == 1
    });

    let listener = RecordingListener::new();
    scheduler.schedule(OTHER, &[(0, 0)], vec![listener.as_listener()]);
    scheduler.schedule(OTHER, &[(1, 0)], vec![listener.as_listener()]);
    assert_eq!(scheduler.queued_jobs(PoolKind::Standard), 3);

    gate.open();
    assert_eq!(blocking.join().unwrap().unwrap().len(), 4);
    listener.wait_for(2);

    let order: Vec<TileKey> = source
        .log()
        .into_iter()
        .filter(|k| *k != blocker)
        .collect();
    let mut expected: Vec<TileKey> = bulk.iter().map(|&(x, y)| TileKey::new(IMAGE, x, y)).collect();
    expected.push(TileKey::new(OTHER, 1, 0));
    expected.push(TileKey::new(OTHER, 0, 0));
    assert_eq!(order, expected);
}

// =============================================================================
// Blocking Calls
// =============================================================================

#[test]
fn test_blocking_seventeen_tiles_four_workers() {
    let source = Arc::new(TestSource::new());
    let config = SchedulerConfig {
        standard_parallelism: 4,
        ..SchedulerConfig::default()
    };
    let scheduler = TileScheduler::new(source.clone(), config).unwrap();
    let indices: Vec<(i32, i32)> = (0..17).map(|i| (i % 5, i / 5)).collect();

    let tiles = scheduler.compute_blocking(IMAGE, &indices).unwrap();
    scheduler.shutdown();

    assert_eq!(tiles.len(), 17);
    for (tile, &(x, y)) in tiles.iter().zip(&indices) {
        assert_eq!(*tile, tile_for(IMAGE, x, y));
    }
    assert_eq!(source.total_calls(), 17);
}

#[test]
fn test_blocking_failure_skips_rest_of_chunk() {
    let broken = TileKey::new(IMAGE, 1, 0);
    let source = Arc::new(TestSource::new().failing(broken));
    let config = SchedulerConfig {
        standard_parallelism: 1,
        ..SchedulerConfig::default()
    };
    let scheduler = TileScheduler::new(source.clone(), config).unwrap();
    let indices: Vec<(i32, i32)> = (0..6).map(|x| (x, 0)).collect();

    let err = scheduler.compute_blocking(IMAGE, &indices).unwrap_err();
    scheduler.shutdown();

    assert!(matches!(err, SchedulerError::Compute { x: 1, y: 0, .. }));
    // One worker means one chunk: tiles after the failure are not attempted
    assert_eq!(source.total_calls(), 2);
}

#[test]
fn test_listener_failure_reported() {
    let broken = TileKey::new(IMAGE, 0, 1);
    let source = Arc::new(TestSource::new().failing(broken));
    let scheduler = TileScheduler::new(source, single_worker()).unwrap();
    let listener = RecordingListener::new();

    let request = scheduler.schedule(IMAGE, &[(0, 0), (0, 1)], vec![listener.as_listener()]);
    listener.wait_for(2);
    scheduler.shutdown();

    assert_eq!(listener.tally(broken).get("failed"), Some(&1));
    assert_eq!(request.status(0, 1), Some(TileStatus::Failed));
    assert_eq!(request.status(0, 0), Some(TileStatus::Computed));
}

// =============================================================================
// Pools
// =============================================================================

#[test]
fn test_synchronous_schedule_notifies_before_returning() {
    let source = Arc::new(TestSource::new());
    let config = SchedulerConfig {
        standard_parallelism: 0,
        prefetch_parallelism: 0,
        ..SchedulerConfig::default()
    };
    let scheduler = TileScheduler::new(source.clone(), config).unwrap();
    let listener = RecordingListener::new();

    let request = scheduler.schedule(IMAGE, &[(0, 0), (1, 1)], vec![listener.as_listener()]);

    assert!(request.is_finished());
    assert_eq!(listener.events().len(), 2);

    scheduler.prefetch(IMAGE, &[(2, 2), (3, 3)]);
    assert_eq!(source.total_calls(), 4);
}

#[test]
fn test_prefetch_runs_on_prefetch_pool() {
    let gate = Gate::new();
    let source = Arc::new(TestSource::new().gate_all(gate.clone()));
    let scheduler = TileScheduler::new(source.clone(), single_worker()).unwrap();

    scheduler.prefetch(IMAGE, &[(0, 0), (1, 0), (2, 0)]);
    gate.wait_entered(1);
    // One prefetch worker takes the whole range as a single chunk
    assert_eq!(scheduler.queued_jobs(PoolKind::Prefetch), 0);
    assert_eq!(source.total_calls(), 1);

    gate.open();
    wait_until("prefetch to finish", || source.total_calls() == 3);
    scheduler.shutdown();
}

#[test]
fn test_shutdown_fails_queued_listener_jobs() {
    let (scheduler, source, gate, _) = blocked_scheduler();
    let listener = RecordingListener::new();
    let request = scheduler.schedule(IMAGE, &[(4, 4)], vec![listener.as_listener()]);

    let opener = {
        let gate = gate.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            gate.open();
        })
    };
    scheduler.shutdown();
    opener.join().unwrap();

    assert_eq!(
        listener.events()[0].outcome,
        Outcome::Failed(ComputeError::ShutDown)
    );
    assert_eq!(request.status(4, 4), Some(TileStatus::Failed));
    assert_eq!(source.calls_for(TileKey::new(IMAGE, 4, 4)), 0);
}
