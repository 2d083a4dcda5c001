//! Device collaborator seams.
//!
//! The scheduler core does not talk to hardware protocols; it drives
//! collaborators through these traits. A device plugin participates in
//! plate hand-off through [`HandoffDevice`] (backed by a
//! [`LocationRegistry`]); the robot arm, tip-box bookkeeping, and the
//! pipetting protocol itself sit behind their own seams.
//!
//! Device instances are injected into the scheduler at configuration time;
//! there is no runtime plugin discovery in this core.

pub mod mock;

use crate::location::{ActivePlate, PlateLocation, PlatePlace};
use crate::registry::{JobComplete, LocationRegistry};
use crate::worklist::{Transfer, TransferOverview};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Plate hand-off contract implemented by device plugins.
///
/// A device must report `connected` and `is_homed` before it is asked to
/// participate in a reservation. The reservation subset delegates to the
/// device's [`LocationRegistry`].
#[async_trait]
pub trait HandoffDevice: Send + Sync {
    fn name(&self) -> &str;
    fn connected(&self) -> bool;
    fn is_homed(&self) -> bool;
    fn registry(&self) -> &LocationRegistry;

    /// Accept a work order for device-side execution.
    async fn enqueue_worklist(&self, overview: &TransferOverview) -> Result<()>;

    /// Query for an available hand-off location. Does not reserve.
    fn get_available_location(&self, active_plate: &ActivePlate) -> Option<Arc<PlateLocation>> {
        self.registry().get_available_location(active_plate)
    }

    /// Reserve a location; false if it belongs to another device.
    fn reserve_location(&self, location: &Arc<PlateLocation>, active_plate: &ActivePlate) -> bool {
        self.registry().reserve_location(location, active_plate)
    }

    fn lock_place(&self, place: &PlatePlace) {
        self.registry().lock_place(place);
    }

    fn add_job(&self, active_plate: Arc<ActivePlate>) {
        self.registry().add_job(active_plate);
    }

    fn subscribe_job_complete(&self) -> broadcast::Receiver<JobComplete> {
        self.registry().subscribe()
    }

    /// Atomic check-then-reserve over this device's locations.
    async fn claim(&self, active_plate: &ActivePlate) -> Option<Arc<PlateLocation>> {
        self.registry().claim(active_plate).await
    }
}

/// Moves plates between hand-off locations.
#[async_trait]
pub trait RobotScheduler: Send + Sync {
    /// Deliver a plate to a reserved location. Implementations set the
    /// location's Occupied signal once the plate is physically present.
    async fn deliver(&self, plate: &ActivePlate, destination: &Arc<PlateLocation>) -> Result<()>;
}

/// Tracks disposable-tip supply for the pipetting head.
#[async_trait]
pub trait TipBoxManager: Send + Sync {
    async fn take_tip(&self) -> Result<()>;
    async fn return_tip(&self) -> Result<()>;
    fn tips_remaining(&self) -> usize;
}

/// Executes the pipetting protocol for one transfer once the plates are in
/// place.
#[async_trait]
pub trait TransferDispatcher: Send + Sync {
    async fn dispatch(&self, transfer: &Transfer) -> Result<()>;
}
