//! End-to-end scheduler lifecycle over mock devices: run to completion,
//! pause at transfer boundaries, abort with reservation release, and the
//! run-time assignment of ANY destination wells.

use plateflow::device::mock::{MockPipettor, MockRobotArm, MockTipBoxes, MockTransferStation};
use plateflow::device::TipBoxManager;
use plateflow::error::PlateFlowError;
use plateflow::labware::{Labware, Well};
use plateflow::messages::SchedulerEvent;
use plateflow::scheduler::{SchedulerState, SharedWorkQueue, TransferScheduler};
use plateflow::worklist::{
    DestinationPlate, Plate, TransferOverview, TransferRequest, VolumeUnits,
};
use plateflow::config::SchedulerSettings;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

fn overview_with_transfers(count: usize) -> TransferOverview {
    let mut overview = TransferOverview::new();
    overview
        .source_plates
        .add(Plate::new(Labware::new("96", 96).unwrap(), "S00001"));
    overview.destination_plates.add(
        DestinationPlate::new(Labware::new("96", 96).unwrap(), "D00001", "ANY").unwrap(),
    );
    for i in 0..count {
        overview.add_transfer(TransferRequest::new(
            "S00001",
            Well::at(i % 8, i / 8),
            "D00001",
            Well::at(i % 8, i / 8),
            1.0,
            VolumeUnits::Ul,
        ));
    }
    overview
}

struct Bench {
    scheduler: TransferScheduler,
    events: broadcast::Receiver<SchedulerEvent>,
    pipettor: Arc<MockPipettor>,
    tips: Arc<MockTipBoxes>,
    queue: SharedWorkQueue,
}

fn bench() -> Bench {
    bench_with_speed(2, 2)
}

/// Slower mocks give control commands room to land mid-run without racing
/// the queue drain.
fn bench_with_speed(robot_ms: u64, dispatch_ms: u64) -> Bench {
    let (events_tx, events) = broadcast::channel(256);
    let pipettor = Arc::new(MockPipettor::with_dispatch_time(dispatch_ms));
    let tips = Arc::new(MockTipBoxes::new(96));
    let queue = SharedWorkQueue::new();

    let mut scheduler = TransferScheduler::new("bench scheduler", SchedulerSettings::default());
    scheduler.set_hardware(vec![Arc::new(MockTransferStation::new("station", 4))]);
    scheduler.set_messenger(events_tx);
    scheduler.set_dispatcher(pipettor.clone());
    scheduler.set_shared_memory(queue.clone());
    scheduler.set_tip_box_manager(tips.clone());
    scheduler.set_robot_scheduler(Arc::new(MockRobotArm::with_move_time(robot_ms)));

    Bench { scheduler, events, pipettor, tips, queue }
}

async fn next_event(events: &mut broadcast::Receiver<SchedulerEvent>) -> SchedulerEvent {
    tokio::time::timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for scheduler event")
        .expect("event channel closed")
}

async fn wait_for_drained(events: &mut broadcast::Receiver<SchedulerEvent>) -> usize {
    loop {
        if let SchedulerEvent::WorkOrderDrained { completed } = next_event(events).await {
            return completed;
        }
    }
}

#[tokio::test]
async fn run_to_completion_consumes_tips_and_dispatches() {
    let mut bench = bench();
    bench
        .scheduler
        .add_transfers(&overview_with_transfers(3))
        .unwrap();
    bench.scheduler.start_scheduler().unwrap();
    assert!(bench.scheduler.is_running());

    let completed = wait_for_drained(&mut bench.events).await;
    assert_eq!(completed, 3);
    assert_eq!(bench.scheduler.state(), SchedulerState::Completed);
    assert!(!bench.scheduler.is_running());
    assert_eq!(bench.pipettor.dispatched(), 3);
    assert_eq!(bench.tips.tips_remaining(), 96 - 3);

    bench.scheduler.stop_scheduler().await.unwrap();
}

#[tokio::test]
async fn transfers_execute_in_order() {
    let mut bench = bench();
    bench
        .scheduler
        .add_transfers(&overview_with_transfers(5))
        .unwrap();
    bench.scheduler.start_scheduler().unwrap();

    let mut started = Vec::new();
    loop {
        match next_event(&mut bench.events).await {
            SchedulerEvent::TransferStarted { index, .. } => started.push(index),
            SchedulerEvent::WorkOrderDrained { .. } => break,
            _ => {}
        }
    }
    assert_eq!(started, vec![0, 1, 2, 3, 4]);
    bench.scheduler.stop_scheduler().await.unwrap();
}

#[tokio::test]
async fn pause_takes_effect_at_transfer_boundary() {
    let mut bench = bench_with_speed(25, 10);
    bench
        .scheduler
        .add_transfers(&overview_with_transfers(20))
        .unwrap();
    bench.scheduler.start_scheduler().unwrap();

    // Let the first transfer begin, then ask for a pause.
    loop {
        if matches!(
            next_event(&mut bench.events).await,
            SchedulerEvent::TransferStarted { .. }
        ) {
            break;
        }
    }
    bench.scheduler.pause().await.unwrap();
    assert_eq!(bench.scheduler.state(), SchedulerState::Paused);
    assert!(!bench.scheduler.is_running());

    // No further transfers start while paused.
    let pending = bench.queue.len();
    assert!(pending > 0, "pause should leave work in the queue");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(bench.queue.len(), pending);

    bench.scheduler.resume().await.unwrap();
    assert_eq!(bench.scheduler.state(), SchedulerState::Running);
    let completed = wait_for_drained(&mut bench.events).await;
    assert_eq!(completed, 20);
    bench.scheduler.stop_scheduler().await.unwrap();
}

#[tokio::test]
async fn abort_drops_queue_and_releases_reservations() {
    let mut bench = bench_with_speed(25, 10);
    bench
        .scheduler
        .add_transfers(&overview_with_transfers(20))
        .unwrap();
    bench.scheduler.start_scheduler().unwrap();

    loop {
        if matches!(
            next_event(&mut bench.events).await,
            SchedulerEvent::TransferStarted { .. }
        ) {
            break;
        }
    }
    let dropped = bench.scheduler.abort().await.unwrap();
    assert!(dropped > 0, "abort should drop queued transfers");
    assert_eq!(bench.scheduler.state(), SchedulerState::Aborted);
    assert!(!bench.scheduler.is_running());
    assert!(bench.queue.is_empty());

    // A new run needs an explicit reset back to Idle first.
    assert!(matches!(
        bench.scheduler.start_scheduler(),
        Err(PlateFlowError::InvalidSchedulerState(_))
    ));
    bench.scheduler.reset().unwrap();
    assert_eq!(bench.scheduler.state(), SchedulerState::Idle);

    bench
        .scheduler
        .add_transfers(&overview_with_transfers(2))
        .unwrap();
    bench.scheduler.start_scheduler().unwrap();
    let completed = wait_for_drained(&mut bench.events).await;
    assert_eq!(completed, 2);
    bench.scheduler.stop_scheduler().await.unwrap();
}

#[tokio::test]
async fn any_destination_wells_are_assigned_in_column_major_order() {
    let mut bench = bench();
    let mut overview = TransferOverview::new();
    overview
        .source_plates
        .add(Plate::new(Labware::new("96", 96).unwrap(), "S00001"));
    overview.destination_plates.add(
        DestinationPlate::new(Labware::new("96", 96).unwrap(), "D00001", "ANY").unwrap(),
    );
    for i in 0..3 {
        overview.add_transfer(TransferRequest::new(
            "S00001",
            Well::at(i, 0),
            "D00001",
            Well::Any,
            1.0,
            VolumeUnits::Ul,
        ));
    }
    bench.scheduler.add_transfers(&overview).unwrap();
    bench.scheduler.start_scheduler().unwrap();

    let mut assigned = Vec::new();
    loop {
        match next_event(&mut bench.events).await {
            SchedulerEvent::TransferStarted { transfer, .. } => {
                assigned.push((transfer.dest_barcode.clone(), transfer.dest_well.name()));
            }
            SchedulerEvent::WorkOrderDrained { .. } => break,
            _ => {}
        }
    }
    assert_eq!(
        assigned,
        vec![
            ("D00001".to_string(), "A1".to_string()),
            ("D00001".to_string(), "B1".to_string()),
            ("D00001".to_string(), "C1".to_string()),
        ]
    );
    bench.scheduler.stop_scheduler().await.unwrap();
}
