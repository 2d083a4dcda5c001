//! Per-device reservation state for physical hand-off locations.
//!
//! Each device owns a [`LocationRegistry`] over its hand-off locations. The
//! registry exposes the two-call availability/reservation contract, the
//! job-worker spawn point, and the `JobComplete` notification channel.
//!
//! Because `get_available_location` and `reserve_location` are separate
//! calls, a correct multi-actor caller must compose "check availability,
//! then reserve" atomically. [`LocationRegistry::claim`] provides that
//! composition under a per-registry async mutex; the raw two-call interface
//! remains part of the public contract.
//!
//! Job workers are spawned tasks with a cancellation channel and a joinable
//! handle, so shutdown can drain or abort outstanding jobs
//! deterministically.

use crate::location::{ActivePlate, PlateLocation, PlatePlace};
use futures::future::join_all;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::debug;

const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Notification that a plate-movement job finished on a device.
#[derive(Clone, Debug)]
pub struct JobComplete {
    pub device: String,
    pub barcode: String,
}

/// Reservation state and job workers for one device's locations.
pub struct LocationRegistry {
    device_name: String,
    locations: Vec<Arc<PlateLocation>>,
    events: broadcast::Sender<JobComplete>,
    claim_lock: tokio::sync::Mutex<()>,
    jobs: Mutex<Vec<JoinHandle<()>>>,
    cancel: watch::Sender<bool>,
}

impl LocationRegistry {
    pub fn new(device_name: impl Into<String>, locations: Vec<Arc<PlateLocation>>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (cancel, _) = watch::channel(false);
        Self {
            device_name: device_name.into(),
            locations,
            events,
            claim_lock: tokio::sync::Mutex::new(()),
            jobs: Mutex::new(Vec::new()),
            cancel,
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn locations(&self) -> &[Arc<PlateLocation>] {
        &self.locations
    }

    /// Subscribe to `JobComplete` notifications. Subscribe before calling
    /// [`Self::add_job`]; delivery is at-least-once and asynchronous
    /// relative to the call that triggered it.
    pub fn subscribe(&self) -> broadcast::Receiver<JobComplete> {
        self.events.subscribe()
    }

    /// A location that is currently available, if any. This is a query
    /// only; it does not reserve.
    pub fn get_available_location(&self, _active_plate: &ActivePlate) -> Option<Arc<PlateLocation>> {
        self.locations.iter().find(|l| l.is_available()).cloned()
    }

    /// Reserve a location for an incoming plate. Returns false without side
    /// effects if the location does not belong to this device.
    pub fn reserve_location(
        &self,
        location: &Arc<PlateLocation>,
        _active_plate: &ActivePlate,
    ) -> bool {
        if !self.locations.iter().any(|l| Arc::ptr_eq(l, location)) {
            return false;
        }
        location.set_reserved();
        true
    }

    /// Finer-grained slot locking within a multi-place location. A
    /// placeholder on current devices, kept as part of the contract for
    /// devices with sub-location structure.
    pub fn lock_place(&self, _place: &PlatePlace) {}

    /// Atomic check-then-reserve composition over this device's locations.
    pub async fn claim(&self, active_plate: &ActivePlate) -> Option<Arc<PlateLocation>> {
        let _guard = self.claim_lock.lock().await;
        let location = self.get_available_location(active_plate)?;
        self.reserve_location(&location, active_plate).then_some(location)
    }

    /// Spawn a worker that waits for the plate's physical arrival, raises
    /// `JobComplete`, marks the plate's job completed, and clears the
    /// Occupied signal on the owning location.
    pub fn add_job(&self, active_plate: Arc<ActivePlate>) {
        let mut cancel_rx = self.cancel.subscribe();
        let events = self.events.clone();
        let device = self.device_name.clone();
        let handle = tokio::spawn(async move {
            let destination = active_plate.destination();
            tokio::select! {
                _ = active_plate.wait_for_arrival() => {
                    let _ = events.send(JobComplete {
                        device,
                        barcode: active_plate.barcode().to_string(),
                    });
                    active_plate.mark_job_completed();
                    if let Some(location) = destination {
                        location.clear_occupied();
                    }
                    debug!("job completed for {}", active_plate);
                }
                _ = cancel_rx.changed() => {
                    debug!("job worker for {} canceled", active_plate);
                }
            }
        });
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        jobs.retain(|job| !job.is_finished());
        jobs.push(handle);
    }

    /// Outstanding job workers.
    pub fn active_jobs(&self) -> usize {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|job| !job.is_finished())
            .count()
    }

    /// Cancel and join all outstanding job workers.
    pub async fn shutdown(&self) {
        let _ = self.cancel.send(true);
        let jobs = {
            let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *jobs)
        };
        if !jobs.is_empty() {
            debug!("{}: draining {} job worker(s)", self.device_name, jobs.len());
        }
        join_all(jobs).await;
    }
}
