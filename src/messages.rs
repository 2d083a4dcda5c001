//! Message types for scheduler communication.
//!
//! This module defines the command envelopes sent to the scheduler run task
//! and the event notifications it broadcasts to observers (UI, logging,
//! tests). Commands carry oneshot response channels so callers can await
//! acknowledgement; events are fire-and-forget on a broadcast channel with
//! at-least-once delivery to current subscribers.

use crate::scheduler::SchedulerState;
use crate::worklist::Transfer;
use tokio::sync::oneshot;

/// Commands consumed by the scheduler run task at transfer boundaries.
#[derive(Debug)]
pub enum SchedulerCommand {
    /// Suspend consumption after the in-flight transfer finishes.
    Pause { response: oneshot::Sender<()> },

    /// Continue consumption after a pause.
    Resume { response: oneshot::Sender<()> },

    /// Cancel the remaining queue. Responds with the number of transfers
    /// dropped.
    Abort { response: oneshot::Sender<usize> },

    /// Stop consuming and exit the run task at the next boundary.
    Stop { response: oneshot::Sender<()> },
}

impl SchedulerCommand {
    pub fn pause() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Pause { response: tx }, rx)
    }

    pub fn resume() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Resume { response: tx }, rx)
    }

    pub fn abort() -> (Self, oneshot::Receiver<usize>) {
        let (tx, rx) = oneshot::channel();
        (Self::Abort { response: tx }, rx)
    }

    pub fn stop() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Stop { response: tx }, rx)
    }
}

/// Progress notifications broadcast by the scheduler.
#[derive(Clone, Debug)]
pub enum SchedulerEvent {
    StateChanged {
        from: SchedulerState,
        to: SchedulerState,
    },
    TransferStarted {
        index: usize,
        transfer: Transfer,
    },
    TransferCompleted {
        index: usize,
        transfer: Transfer,
    },
    TransferFailed {
        index: usize,
        transfer: Transfer,
        error: String,
    },
    /// The shared work queue drained and the run completed.
    WorkOrderDrained { completed: usize },
    Aborted { dropped: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_command_helpers_carry_responses() {
        let (command, rx) = SchedulerCommand::abort();
        let SchedulerCommand::Abort { response } = command else {
            unreachable!("abort() built a different command");
        };
        response.send(3).unwrap();
        assert_eq!(rx.await.unwrap(), 3);
    }
}
