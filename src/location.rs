//! Physical hand-off locations and plates in transit.
//!
//! A [`PlateLocation`] is a named spot where a robot places or picks up a
//! plate, composed of one or more [`PlatePlace`] slots. Each location
//! carries two independent signals: `Reserved` (intent to deliver) and
//! `Occupied` (physical presence confirmed). A location is available iff
//! neither signal is set.
//!
//! The signals are genuinely multi-writer (competing device and scheduler
//! tasks race on them), so they live in a `tokio::sync::watch` channel:
//! mutex-guarded state with change notification, giving race-free
//! wait-with-timeout instead of bare booleans.
//!
//! An [`ActivePlate`] is a plate in transit between locations. It exposes
//! the blocking wait for physical arrival and the completion marker that
//! device job workers drive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

/// A named physical slot within a location (e.g. "Trash (landscape)").
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlatePlace {
    name: String,
}

impl PlatePlace {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct SignalFlags {
    reserved: bool,
    occupied: bool,
}

/// A named hand-off location with Reserved/Occupied signals.
///
/// Created once per device at initialization and shared via `Arc`; the
/// signals mutate during job execution and clear on completion.
#[derive(Debug)]
pub struct PlateLocation {
    name: String,
    places: Vec<PlatePlace>,
    flags: watch::Sender<SignalFlags>,
}

impl PlateLocation {
    /// A location holds at least one place.
    pub fn new(name: impl Into<String>, places: Vec<PlatePlace>) -> Arc<Self> {
        let (flags, _) = watch::channel(SignalFlags::default());
        Arc::new(Self { name: name.into(), places, flags })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn places(&self) -> &[PlatePlace] {
        &self.places
    }

    pub fn set_reserved(&self) {
        self.flags.send_modify(|f| f.reserved = true);
    }

    pub fn clear_reserved(&self) {
        self.flags.send_modify(|f| f.reserved = false);
    }

    pub fn set_occupied(&self) {
        self.flags.send_modify(|f| f.occupied = true);
    }

    pub fn clear_occupied(&self) {
        self.flags.send_modify(|f| f.occupied = false);
    }

    pub fn is_reserved(&self) -> bool {
        self.flags.borrow().reserved
    }

    pub fn is_occupied(&self) -> bool {
        self.flags.borrow().occupied
    }

    /// True iff neither Reserved nor Occupied is set.
    pub fn is_available(&self) -> bool {
        let flags = *self.flags.borrow();
        !(flags.reserved || flags.occupied)
    }

    /// Wait until the Occupied signal is set.
    pub async fn wait_occupied(&self) {
        let mut receiver = self.flags.subscribe();
        // The sender lives as long as this location, so the wait cannot
        // observe a closed channel.
        let _ = receiver.wait_for(|f| f.occupied).await;
    }

    /// Wait until Occupied is set, or until the timeout elapses. Returns
    /// whether the signal was observed.
    pub async fn wait_occupied_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_occupied()).await.is_ok()
    }
}

/// A physical plate in transit between hand-off locations.
///
/// Not owned by any location registry: the scheduler creates one per plate
/// movement, points it at a destination location, and device job workers
/// drive it to completion.
#[derive(Debug)]
pub struct ActivePlate {
    serial: Uuid,
    barcode: String,
    free: AtomicBool,
    current: Mutex<Option<Arc<PlateLocation>>>,
    destination: Mutex<Option<Arc<PlateLocation>>>,
}

impl ActivePlate {
    pub fn new(barcode: impl Into<String>) -> Self {
        Self {
            serial: Uuid::new_v4(),
            barcode: barcode.into(),
            free: AtomicBool::new(true),
            current: Mutex::new(None),
            destination: Mutex::new(None),
        }
    }

    pub fn serial(&self) -> Uuid {
        self.serial
    }

    pub fn barcode(&self) -> &str {
        &self.barcode
    }

    /// Whether a movement job is outstanding for this plate.
    pub fn is_busy(&self) -> bool {
        !self.free.load(Ordering::SeqCst)
    }

    /// Flag the plate as picked up by the robot.
    pub fn mark_in_transit(&self) {
        self.free.store(false, Ordering::SeqCst);
    }

    pub fn current_location(&self) -> Option<Arc<PlateLocation>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_current_location(&self, location: Arc<PlateLocation>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(location);
    }

    pub fn destination(&self) -> Option<Arc<PlateLocation>> {
        self.destination.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_destination(&self, location: Arc<PlateLocation>) {
        *self.destination.lock().unwrap_or_else(PoisonError::into_inner) = Some(location);
    }

    /// Block until the destination location confirms physical presence.
    /// Returns immediately if no destination is set.
    pub async fn wait_for_arrival(&self) {
        if let Some(destination) = self.destination() {
            destination.wait_occupied().await;
        }
    }

    /// Completion marker: clears the destination's Reserved signal,
    /// promotes the destination to the current location, and frees the
    /// plate.
    pub fn mark_job_completed(&self) {
        if let Some(destination) = self.destination() {
            destination.clear_reserved();
            self.set_current_location(destination);
        }
        self.free.store(true, Ordering::SeqCst);
    }
}

impl std::fmt::Display for ActivePlate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ActivePlate[{},{}]", self.barcode, self.serial)
    }
}
