//! Core library for the plateflow application.
//!
//! plateflow coordinates automated liquid-handling work across a robotic
//! laboratory: it models work orders (plates, wells, transfers), allocates
//! destination wells across plates, arbitrates physical hand-off locations
//! between device actors, and drives queued transfers through a scheduler
//! lifecycle. Work orders persist as a canonical XML document.
//!
//! The library is consumed by the `plateflow` CLI and by host orchestration
//! embedding the scheduler directly.

pub mod allocator;
pub mod config;
pub mod device;
pub mod document;
pub mod error;
pub mod labware;
pub mod location;
pub mod messages;
pub mod registry;
pub mod scheduler;
pub mod worklist;

pub use allocator::DestinationAllocator;
pub use error::{AppResult, PlateFlowError};
pub use scheduler::{SchedulerState, SharedWorkQueue, TransferScheduler};
pub use worklist::TransferOverview;
