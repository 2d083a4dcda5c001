//! Mock device implementations.
//!
//! Simulated collaborators for tests and for driving the CLI without
//! physical hardware. All mocks use async-safe delays (tokio::time::sleep)
//! with a little random jitter to exercise the same interleavings a real
//! bench produces.

use crate::device::{HandoffDevice, RobotScheduler, TipBoxManager, TransferDispatcher};
use crate::location::{ActivePlate, PlateLocation, PlatePlace};
use crate::registry::LocationRegistry;
use crate::worklist::{Transfer, TransferOverview};
use anyhow::{bail, Result};
use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, info};

// =============================================================================
// MockTransferStation
// =============================================================================

/// Simulated pipetting station with a row of deck hand-off positions.
pub struct MockTransferStation {
    name: String,
    registry: LocationRegistry,
    worklists_accepted: AtomicUsize,
}

impl MockTransferStation {
    /// Create a station with `deck_positions` single-place locations.
    pub fn new(name: impl Into<String>, deck_positions: usize) -> Self {
        let name = name.into();
        let locations = (1..=deck_positions)
            .map(|i| {
                PlateLocation::new(
                    format!("{name} deck position {i}"),
                    vec![PlatePlace::new(format!("{name} deck position {i} nest"))],
                )
            })
            .collect();
        Self {
            registry: LocationRegistry::new(name.clone(), locations),
            name,
            worklists_accepted: AtomicUsize::new(0),
        }
    }

    pub fn worklists_accepted(&self) -> usize {
        self.worklists_accepted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HandoffDevice for MockTransferStation {
    fn name(&self) -> &str {
        &self.name
    }

    fn connected(&self) -> bool {
        true
    }

    fn is_homed(&self) -> bool {
        true
    }

    fn registry(&self) -> &LocationRegistry {
        &self.registry
    }

    async fn enqueue_worklist(&self, overview: &TransferOverview) -> Result<()> {
        self.worklists_accepted.fetch_add(1, Ordering::SeqCst);
        info!(
            "{}: accepted worklist with {} transfer(s)",
            self.name,
            overview.transfers().len()
        );
        Ok(())
    }
}

// =============================================================================
// MockTrash
// =============================================================================

/// Simulated trash chute. One location, two orientations.
pub struct MockTrash {
    name: String,
    registry: LocationRegistry,
}

impl MockTrash {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let location = PlateLocation::new(
            "Trash location",
            vec![
                PlatePlace::new("Trash (landscape)"),
                PlatePlace::new("Trash (portrait)"),
            ],
        );
        Self {
            registry: LocationRegistry::new(name.clone(), vec![location]),
            name,
        }
    }
}

#[async_trait]
impl HandoffDevice for MockTrash {
    fn name(&self) -> &str {
        &self.name
    }

    fn connected(&self) -> bool {
        // Trash requires no connection.
        true
    }

    fn is_homed(&self) -> bool {
        true
    }

    fn registry(&self) -> &LocationRegistry {
        &self.registry
    }

    async fn enqueue_worklist(&self, _overview: &TransferOverview) -> Result<()> {
        bail!("{}: trash accepts no worklists", self.name)
    }
}

// =============================================================================
// MockRobotArm
// =============================================================================

/// Simulated plate-handling robot.
pub struct MockRobotArm {
    move_ms: u64,
    jitter_ms: u64,
}

impl MockRobotArm {
    pub fn new() -> Self {
        Self { move_ms: 15, jitter_ms: 10 }
    }

    /// Robot with custom base move time, for slow-bench simulations.
    pub fn with_move_time(move_ms: u64) -> Self {
        Self { move_ms, jitter_ms: move_ms / 2 }
    }

    fn move_delay(&self) -> Duration {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..self.jitter_ms)
        };
        Duration::from_millis(self.move_ms + jitter)
    }
}

impl Default for MockRobotArm {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RobotScheduler for MockRobotArm {
    async fn deliver(&self, plate: &ActivePlate, destination: &Arc<PlateLocation>) -> Result<()> {
        plate.mark_in_transit();
        debug!("robot: moving {} to {}", plate, destination.name());
        sleep(self.move_delay()).await;
        destination.set_occupied();
        debug!("robot: {} placed at {}", plate, destination.name());
        Ok(())
    }
}

// =============================================================================
// MockTipBoxes
// =============================================================================

/// Counts disposable tips out of a fixed supply.
pub struct MockTipBoxes {
    remaining: AtomicUsize,
}

impl MockTipBoxes {
    pub fn new(capacity: usize) -> Self {
        Self { remaining: AtomicUsize::new(capacity) }
    }
}

#[async_trait]
impl TipBoxManager for MockTipBoxes {
    async fn take_tip(&self) -> Result<()> {
        let previous = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if previous.is_err() {
            bail!("tip boxes are empty");
        }
        Ok(())
    }

    async fn return_tip(&self) -> Result<()> {
        Ok(())
    }

    fn tips_remaining(&self) -> usize {
        self.remaining.load(Ordering::SeqCst)
    }
}

// =============================================================================
// MockPipettor
// =============================================================================

/// Simulated pipetting protocol: logs the transfer and takes a little time.
pub struct MockPipettor {
    dispatch_ms: u64,
    dispatched: AtomicUsize,
}

impl MockPipettor {
    pub fn new() -> Self {
        Self { dispatch_ms: 10, dispatched: AtomicUsize::new(0) }
    }

    pub fn with_dispatch_time(dispatch_ms: u64) -> Self {
        Self { dispatch_ms, dispatched: AtomicUsize::new(0) }
    }

    pub fn dispatched(&self) -> usize {
        self.dispatched.load(Ordering::SeqCst)
    }
}

impl Default for MockPipettor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransferDispatcher for MockPipettor {
    async fn dispatch(&self, transfer: &Transfer) -> Result<()> {
        info!(
            "pipettor: {} ({} {})",
            transfer, transfer.volume, transfer.units
        );
        sleep(Duration::from_millis(self.dispatch_ms)).await;
        self.dispatched.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_station_claims_and_exhausts_deck() {
        let station = MockTransferStation::new("station", 2);
        let plate = ActivePlate::new("P0001");
        assert!(station.claim(&plate).await.is_some());
        assert!(station.claim(&plate).await.is_some());
        assert!(station.claim(&plate).await.is_none());
    }

    #[tokio::test]
    async fn test_trash_rejects_foreign_reservation() {
        let station = MockTransferStation::new("station", 1);
        let trash = MockTrash::new("trash");
        let plate = ActivePlate::new("P0001");
        let station_location = station.get_available_location(&plate).unwrap();
        assert!(!trash.reserve_location(&station_location, &plate));
        assert!(station_location.is_available());
    }

    #[tokio::test]
    async fn test_robot_delivery_sets_occupied() {
        let robot = MockRobotArm::with_move_time(1);
        let location = PlateLocation::new("Deck", vec![PlatePlace::new("Deck nest")]);
        let plate = ActivePlate::new("P0001");
        robot.deliver(&plate, &location).await.unwrap();
        assert!(location.is_occupied());
        assert!(plate.is_busy());
    }

    #[tokio::test]
    async fn test_tip_boxes_run_dry() {
        let tips = MockTipBoxes::new(2);
        tips.take_tip().await.unwrap();
        tips.take_tip().await.unwrap();
        assert_eq!(tips.tips_remaining(), 0);
        assert!(tips.take_tip().await.is_err());
    }

    #[tokio::test]
    async fn test_pipettor_counts_dispatches() {
        use crate::labware::Well;
        use crate::worklist::{TransferOverview, TransferRequest, VolumeUnits};

        let mut overview = TransferOverview::new();
        overview.add_transfer(TransferRequest::new(
            "S00001",
            Well::parse("A1").unwrap(),
            "D00001",
            Well::parse("B2").unwrap(),
            1.0,
            VolumeUnits::Ul,
        ));
        let pipettor = MockPipettor::with_dispatch_time(1);
        pipettor.dispatch(&overview.transfers()[0]).await.unwrap();
        assert_eq!(pipettor.dispatched(), 1);
    }
}
