//! Scheduler lifecycle for queued plate transfers.
//!
//! [`TransferScheduler`] is a state machine:
//!
//! ```text
//! Idle -> Configuring -> Running <-> Paused -> { Completed, Aborted }
//! ```
//!
//! `reset` returns any terminal state to Idle. All configuration setters
//! must be called before `start_scheduler`; starting an unconfigured
//! scheduler fails with `NotConfigured` and does not transition state.
//!
//! The run task consumes the shared work queue one transfer at a time,
//! claiming hand-off slots on devices through their location registries
//! before physically acting. Control commands (pause, resume, abort, stop)
//! take effect between transfer boundaries only: a transfer already in
//! flight runs to completion. Abort cancels the remaining queue and
//! releases claimed-but-unused reservations.

use crate::allocator::DestinationAllocator;
use crate::config::SchedulerSettings;
use crate::device::{HandoffDevice, RobotScheduler, TipBoxManager, TransferDispatcher};
use crate::error::{AppResult, PlateFlowError};
use crate::labware::Well;
use crate::location::{ActivePlate, PlateLocation};
use crate::messages::{SchedulerCommand, SchedulerEvent};
use crate::worklist::{Barcoded, Transfer, TransferOverview};
use anyhow::{bail, Context};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

// =============================================================================
// State
// =============================================================================

/// Scheduler lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Configuring,
    Running,
    Paused,
    Completed,
    Aborted,
}

impl SchedulerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SchedulerState::Completed | SchedulerState::Aborted)
    }
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulerState::Idle => "Idle",
            SchedulerState::Configuring => "Configuring",
            SchedulerState::Running => "Running",
            SchedulerState::Paused => "Paused",
            SchedulerState::Completed => "Completed",
            SchedulerState::Aborted => "Aborted",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Shared work queue
// =============================================================================

/// Transfer queue shared between importer, scheduler and observers.
///
/// Clones share the same underlying queue. The mutex guards only short
/// push/pop sections; no await happens under it.
#[derive(Clone, Debug, Default)]
pub struct SharedWorkQueue {
    inner: Arc<Mutex<VecDeque<Transfer>>>,
}

impl SharedWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Transfer>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_transfers(&self, transfers: &[Transfer]) {
        self.queue().extend(transfers.iter().cloned());
    }

    pub fn pop(&self) -> Option<Transfer> {
        self.queue().pop_front()
    }

    /// Drop all queued transfers, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let mut queue = self.queue();
        let dropped = queue.len();
        queue.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue().is_empty()
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Drives queued transfers across the injected device collaborators.
pub struct TransferScheduler {
    name: String,
    settings: SchedulerSettings,
    state: Arc<Mutex<SchedulerState>>,
    is_running: Arc<AtomicBool>,
    hardware: Option<Vec<Arc<dyn HandoffDevice>>>,
    messenger: Option<broadcast::Sender<SchedulerEvent>>,
    dispatcher: Option<Arc<dyn TransferDispatcher>>,
    shared_memory: Option<SharedWorkQueue>,
    tip_box_manager: Option<Arc<dyn TipBoxManager>>,
    robot_scheduler: Option<Arc<dyn RobotScheduler>>,
    allocator: Arc<Mutex<DestinationAllocator>>,
    command_tx: Option<mpsc::Sender<SchedulerCommand>>,
    task: Option<JoinHandle<()>>,
}

impl TransferScheduler {
    pub fn new(name: impl Into<String>, settings: SchedulerSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            state: Arc::new(Mutex::new(SchedulerState::Idle)),
            is_running: Arc::new(AtomicBool::new(false)),
            hardware: None,
            messenger: None,
            dispatcher: None,
            shared_memory: None,
            tip_box_manager: None,
            robot_scheduler: None,
            allocator: Arc::new(Mutex::new(DestinationAllocator::new())),
            command_tx: None,
            task: None,
        }
    }

    pub fn scheduler_name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Poll-only status flag for external observers; not used internally
    /// for control flow.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    fn set_state(&self, to: SchedulerState) {
        let from = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let from = *state;
            *state = to;
            from
        };
        if from != to {
            if let Some(messenger) = &self.messenger {
                let _ = messenger.send(SchedulerEvent::StateChanged { from, to });
            }
        }
    }

    fn begin_configuring(&self) {
        if self.state() == SchedulerState::Idle {
            self.set_state(SchedulerState::Configuring);
        }
    }

    pub fn set_hardware(&mut self, devices: Vec<Arc<dyn HandoffDevice>>) {
        self.begin_configuring();
        self.hardware = Some(devices);
    }

    pub fn set_messenger(&mut self, messenger: broadcast::Sender<SchedulerEvent>) {
        self.begin_configuring();
        self.messenger = Some(messenger);
    }

    pub fn set_dispatcher(&mut self, dispatcher: Arc<dyn TransferDispatcher>) {
        self.begin_configuring();
        self.dispatcher = Some(dispatcher);
    }

    pub fn set_shared_memory(&mut self, queue: SharedWorkQueue) {
        self.begin_configuring();
        self.shared_memory = Some(queue);
    }

    pub fn set_tip_box_manager(&mut self, manager: Arc<dyn TipBoxManager>) {
        self.begin_configuring();
        self.tip_box_manager = Some(manager);
    }

    pub fn set_robot_scheduler(&mut self, robot: Arc<dyn RobotScheduler>) {
        self.begin_configuring();
        self.robot_scheduler = Some(robot);
    }

    /// Enqueue a work order's transfers at the tail of the shared queue.
    /// Allowed while Idle, Configuring, Running or Paused.
    pub fn add_transfers(&self, overview: &TransferOverview) -> AppResult<()> {
        if self.state().is_terminal() {
            return Err(PlateFlowError::InvalidSchedulerState("terminal"));
        }
        let queue = self
            .shared_memory
            .as_ref()
            .ok_or(PlateFlowError::NotConfigured("shared work queue"))?;
        // Register the overview's destination plates with the allocator so
        // transfers with an ANY destination can be assigned at run time.
        {
            let mut allocator = self.allocator.lock().unwrap_or_else(PoisonError::into_inner);
            for plate in overview.destination_plates.iter() {
                if !allocator.has_plate(plate.barcode()) {
                    allocator.add_plate(plate.barcode(), plate.format().well_count());
                }
            }
        }
        queue.add_transfers(overview.transfers());
        info!(
            "{}: queued {} transfer(s), {} now pending",
            self.name,
            overview.transfers().len(),
            queue.len()
        );
        Ok(())
    }

    /// Begin consuming the queue asynchronously.
    ///
    /// Fails with `NotConfigured` (and performs no state transition) unless
    /// every configuration setter has been called first.
    pub fn start_scheduler(&mut self) -> AppResult<()> {
        match self.state() {
            SchedulerState::Running | SchedulerState::Paused => {
                return Err(PlateFlowError::InvalidSchedulerState("already running"))
            }
            state if state.is_terminal() => {
                return Err(PlateFlowError::InvalidSchedulerState("terminal"))
            }
            _ => {}
        }

        let devices = self
            .hardware
            .clone()
            .ok_or(PlateFlowError::NotConfigured("hardware"))?;
        if devices.is_empty() {
            return Err(PlateFlowError::NotConfigured("hardware"));
        }
        let events = self
            .messenger
            .clone()
            .ok_or(PlateFlowError::NotConfigured("messenger"))?;
        let dispatcher = self
            .dispatcher
            .clone()
            .ok_or(PlateFlowError::NotConfigured("dispatcher"))?;
        let queue = self
            .shared_memory
            .clone()
            .ok_or(PlateFlowError::NotConfigured("shared work queue"))?;
        let tips = self
            .tip_box_manager
            .clone()
            .ok_or(PlateFlowError::NotConfigured("tip box manager"))?;
        let robot = self
            .robot_scheduler
            .clone()
            .ok_or(PlateFlowError::NotConfigured("robot scheduler"))?;

        let (command_tx, command_rx) = mpsc::channel(self.settings.command_channel_capacity);
        self.command_tx = Some(command_tx);

        self.set_state(SchedulerState::Running);
        self.is_running.store(true, Ordering::SeqCst);

        let worker = SchedulerWorker {
            name: self.name.clone(),
            settings: self.settings.clone(),
            state: self.state.clone(),
            is_running: self.is_running.clone(),
            events,
            devices,
            dispatcher,
            queue,
            tips,
            robot,
            allocator: self.allocator.clone(),
            completed: 0,
            next_index: 0,
            paused: false,
        };
        self.task = Some(tokio::spawn(worker.run(command_rx)));
        info!("{}: started", self.name);
        Ok(())
    }

    async fn send_command<R>(
        &self,
        command: SchedulerCommand,
        response: tokio::sync::oneshot::Receiver<R>,
    ) -> AppResult<R> {
        let tx = self
            .command_tx
            .as_ref()
            .ok_or(PlateFlowError::InvalidSchedulerState("not started"))?;
        tx.send(command)
            .await
            .map_err(|_| PlateFlowError::InvalidSchedulerState("not running"))?;
        response
            .await
            .map_err(|_| PlateFlowError::InvalidSchedulerState("not running"))
    }

    /// Suspend consumption at the next transfer boundary.
    pub async fn pause(&self) -> AppResult<()> {
        let (command, rx) = SchedulerCommand::pause();
        self.send_command(command, rx).await
    }

    /// Continue consumption after a pause.
    pub async fn resume(&self) -> AppResult<()> {
        let (command, rx) = SchedulerCommand::resume();
        self.send_command(command, rx).await
    }

    /// Cancel the remaining queue; returns the number of transfers dropped.
    /// The only operation that may interrupt a transfer that has not yet
    /// started.
    pub async fn abort(&self) -> AppResult<usize> {
        let (command, rx) = SchedulerCommand::abort();
        self.send_command(command, rx).await
    }

    /// Alias for [`Self::pause`] on the host-facing contract.
    pub async fn pause_scheduler(&self) -> AppResult<()> {
        self.pause().await
    }

    /// Alias for [`Self::resume`] on the host-facing contract.
    pub async fn resume_scheduler(&self) -> AppResult<()> {
        self.resume().await
    }

    /// Stop consuming and join the run task.
    pub async fn stop_scheduler(&mut self) -> AppResult<()> {
        let (command, rx) = SchedulerCommand::stop();
        // The run task may already have drained and exited; that is fine.
        if self.send_command(command, rx).await.is_err() {
            warn!("{}: stop requested but run task already finished", self.name);
        }
        if let Some(task) = self.task.take() {
            if task.await.is_err() {
                warn!("{}: run task panicked during stop", self.name);
            }
        }
        self.command_tx = None;
        Ok(())
    }

    /// Return a terminal (or never-started) scheduler to Idle, clearing the
    /// shared queue. Configuration is retained.
    pub fn reset(&mut self) -> AppResult<()> {
        if let Some(task) = &self.task {
            if !task.is_finished() {
                return Err(PlateFlowError::InvalidSchedulerState("running"));
            }
        }
        self.task = None;
        self.command_tx = None;
        if let Some(queue) = &self.shared_memory {
            queue.clear();
        }
        self.is_running.store(false, Ordering::SeqCst);
        self.set_state(SchedulerState::Idle);
        Ok(())
    }
}

// =============================================================================
// Run task
// =============================================================================

enum CommandFlow {
    Continue,
    Exit,
}

struct SchedulerWorker {
    name: String,
    settings: SchedulerSettings,
    state: Arc<Mutex<SchedulerState>>,
    is_running: Arc<AtomicBool>,
    events: broadcast::Sender<SchedulerEvent>,
    devices: Vec<Arc<dyn HandoffDevice>>,
    dispatcher: Arc<dyn TransferDispatcher>,
    queue: SharedWorkQueue,
    tips: Arc<dyn TipBoxManager>,
    robot: Arc<dyn RobotScheduler>,
    allocator: Arc<Mutex<DestinationAllocator>>,
    completed: usize,
    next_index: usize,
    paused: bool,
}

impl SchedulerWorker {
    async fn run(mut self, mut command_rx: mpsc::Receiver<SchedulerCommand>) {
        info!("{}: run task started", self.name);
        'main: loop {
            // Commands take effect between transfer boundaries only.
            while let Ok(command) = command_rx.try_recv() {
                if matches!(self.handle_command(command).await, CommandFlow::Exit) {
                    break 'main;
                }
            }
            if self.paused {
                match command_rx.recv().await {
                    Some(command) => {
                        if matches!(self.handle_command(command).await, CommandFlow::Exit) {
                            break 'main;
                        }
                    }
                    None => break 'main,
                }
                continue;
            }

            let Some(mut transfer) = self.queue.pop() else {
                self.transition(SchedulerState::Completed);
                self.is_running.store(false, Ordering::SeqCst);
                let _ = self.events.send(SchedulerEvent::WorkOrderDrained {
                    completed: self.completed,
                });
                info!(
                    "{}: work order drained after {} transfer(s)",
                    self.name, self.completed
                );
                break;
            };

            let index = self.next_index;
            self.next_index += 1;

            // Transfers with an ANY destination get their well assigned now.
            if transfer.dest_well.is_any() {
                match self.assign_destination(&mut transfer) {
                    Ok(()) => info!(
                        "{}: assigned destination {}.{} to transfer #{}",
                        self.name,
                        transfer.dest_barcode,
                        transfer.dest_well.name(),
                        index
                    ),
                    Err(err) => {
                        error!("{}: transfer {} failed: {}", self.name, transfer, err);
                        let _ = self.events.send(SchedulerEvent::TransferFailed {
                            index,
                            transfer,
                            error: err.to_string(),
                        });
                        continue;
                    }
                }
            }

            let _ = self.events.send(SchedulerEvent::TransferStarted {
                index,
                transfer: transfer.clone(),
            });
            match self.execute_transfer(&transfer).await {
                Ok(()) => {
                    self.completed += 1;
                    let _ = self.events.send(SchedulerEvent::TransferCompleted {
                        index,
                        transfer,
                    });
                }
                Err(err) => {
                    error!("{}: transfer {} failed: {:#}", self.name, transfer, err);
                    let _ = self.events.send(SchedulerEvent::TransferFailed {
                        index,
                        transfer,
                        error: format!("{err:#}"),
                    });
                }
            }
        }

        // Drain outstanding job workers so no fire-and-forget task outlives
        // the run.
        for device in &self.devices {
            device.registry().shutdown().await;
        }
        info!("{}: run task stopped", self.name);
    }

    async fn handle_command(&mut self, command: SchedulerCommand) -> CommandFlow {
        match command {
            SchedulerCommand::Pause { response } => {
                if !self.paused {
                    self.paused = true;
                    self.is_running.store(false, Ordering::SeqCst);
                    self.transition(SchedulerState::Paused);
                }
                let _ = response.send(());
                CommandFlow::Continue
            }
            SchedulerCommand::Resume { response } => {
                if self.paused {
                    self.paused = false;
                    self.is_running.store(true, Ordering::SeqCst);
                    self.transition(SchedulerState::Running);
                }
                let _ = response.send(());
                CommandFlow::Continue
            }
            SchedulerCommand::Abort { response } => {
                let dropped = self.queue.clear();
                self.release_unused_reservations();
                self.transition(SchedulerState::Aborted);
                self.is_running.store(false, Ordering::SeqCst);
                let _ = self.events.send(SchedulerEvent::Aborted { dropped });
                info!("{}: aborted, {} transfer(s) dropped", self.name, dropped);
                let _ = response.send(dropped);
                CommandFlow::Exit
            }
            SchedulerCommand::Stop { response } => {
                self.transition(SchedulerState::Completed);
                self.is_running.store(false, Ordering::SeqCst);
                info!("{}: stop requested", self.name);
                let _ = response.send(());
                CommandFlow::Exit
            }
        }
    }

    fn transition(&self, to: SchedulerState) {
        let from = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let from = *state;
            *state = to;
            from
        };
        if from != to {
            info!("{}: {} -> {}", self.name, from, to);
            let _ = self.events.send(SchedulerEvent::StateChanged { from, to });
        }
    }

    /// Replace an ANY destination with the next allocator slot. The
    /// allocator is single-writer by contract; the mutex makes this task
    /// and `add_transfers` callers take turns.
    fn assign_destination(&self, transfer: &mut Transfer) -> AppResult<()> {
        let (barcode, well_name) = {
            let mut allocator = self.allocator.lock().unwrap_or_else(PoisonError::into_inner);
            allocator.next_transfer_location()?
        };
        transfer.dest_barcode = barcode;
        transfer.dest_well = Well::parse(&well_name)?;
        Ok(())
    }

    /// Reservations made for plates that never arrived are the
    /// claimed-but-unused set released on abort.
    fn release_unused_reservations(&self) {
        for device in &self.devices {
            for location in device.registry().locations() {
                if location.is_reserved() && !location.is_occupied() {
                    location.clear_reserved();
                }
            }
        }
    }

    async fn execute_transfer(&self, transfer: &Transfer) -> anyhow::Result<()> {
        let source = Arc::new(ActivePlate::new(transfer.source_barcode.clone()));
        self.stage_plate(&source)
            .await
            .with_context(|| format!("staging source plate {}", transfer.source_barcode))?;

        let dest = Arc::new(ActivePlate::new(transfer.dest_barcode.clone()));
        self.stage_plate(&dest)
            .await
            .with_context(|| format!("staging destination plate {}", transfer.dest_barcode))?;

        self.tips.take_tip().await?;
        let dispatched = self.dispatcher.dispatch(transfer).await;
        self.tips.return_tip().await?;
        dispatched
    }

    /// Claim a hand-off slot, register the movement job, and deliver the
    /// plate; returns once the owning device acknowledges the hand-off.
    async fn stage_plate(&self, plate: &Arc<ActivePlate>) -> anyhow::Result<()> {
        let (device, location) = self.claim_slot(plate).await?;
        plate.set_destination(location.clone());

        // Subscribe before spawning the job so the completion event cannot
        // be missed.
        let mut job_events = device.subscribe_job_complete();
        device.add_job(plate.clone());

        if let Err(err) = self.robot.deliver(plate, &location).await {
            location.clear_reserved();
            return Err(err).context("robot delivery failed");
        }

        let deadline = Instant::now() + self.settings.job_timeout;
        loop {
            match tokio::time::timeout_at(deadline, job_events.recv()).await {
                Ok(Ok(event)) if event.barcode == plate.barcode() => return Ok(()),
                Ok(Ok(_)) => continue,
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    location.clear_reserved();
                    bail!("device {} closed its job channel", device.name());
                }
                Err(_) => {
                    location.clear_reserved();
                    bail!(
                        "timed out waiting for hand-off of plate {} at {}",
                        plate.barcode(),
                        location.name()
                    );
                }
            }
        }
    }

    async fn claim_slot(
        &self,
        plate: &ActivePlate,
    ) -> anyhow::Result<(Arc<dyn HandoffDevice>, Arc<PlateLocation>)> {
        let deadline = Instant::now() + self.settings.claim_timeout;
        loop {
            for device in &self.devices {
                if !(device.connected() && device.is_homed()) {
                    continue;
                }
                if let Some(location) = device.claim(plate).await {
                    return Ok((device.clone(), location));
                }
            }
            if Instant::now() >= deadline {
                bail!("no hand-off location available for plate {}", plate.barcode());
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }
}
