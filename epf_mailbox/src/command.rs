// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The polled command/response engine served through the control BAR.
//!
//! The host writes a nonzero value into `command`; within one poll period
//! the engine consumes it, dispatches, and produces a nonzero `status`.
//! Clearing `command` before writing `status` is the entire
//! synchronization protocol: a host that observes a nonzero `status` can
//! trust its request was taken. The engine is the only writer of `status`
//! and, apart from the consume-clear, the host is the only writer of
//! `command`.

use crate::platform::RegisterIo;
use crate::platform::WorkerPool;
use epf_mailbox_protocol::Command;
use epf_mailbox_protocol::Register;
use epf_mailbox_protocol::Status;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Delay between command poll passes.
pub const POLL_PERIOD: Duration = Duration::from_millis(1);

/// Typed accessors over the control registers.
///
/// Each accessor is one fresh access through [`RegisterIo`]; nothing is
/// cached between passes.
struct ControlRegs<T>(Arc<T>);

impl<T: RegisterIo> ControlRegs<T> {
    fn command(&self) -> Command {
        Command(self.0.read_u32(Register::COMMAND.0 as usize))
    }

    fn set_command(&self, value: Command) {
        self.0.write_u32(Register::COMMAND.0 as usize, value.0)
    }

    fn set_status(&self, value: Status) {
        self.0.write_u32(Register::STATUS.0 as usize, value.0)
    }
}

/// The background command poller for one bound function instance.
///
/// Activations run on the injected [`WorkerPool`] and reschedule
/// themselves every [`POLL_PERIOD`]. Cancellation is cooperative: a pass
/// already running finishes, and nothing further is scheduled.
pub struct CommandPoller<T> {
    regs: ControlRegs<T>,
    pool: Arc<dyn WorkerPool>,
    cancelled: AtomicBool,
}

impl<T: RegisterIo + 'static> CommandPoller<T> {
    /// Creates a poller over the control BAR backing `regs`.
    pub fn new(regs: Arc<T>, pool: Arc<dyn WorkerPool>) -> Arc<Self> {
        Arc::new(Self {
            regs: ControlRegs(regs),
            pool,
            cancelled: AtomicBool::new(false),
        })
    }

    /// Schedules the first activation immediately.
    pub fn start(self: &Arc<Self>) {
        self.schedule(Duration::ZERO);
    }

    /// Stops the poll cycle.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn schedule(self: &Arc<Self>, delay: Duration) {
        let this = self.clone();
        // The handle is dropped rather than retained: cancellation is
        // cooperative through the flag, so a pending activation fires
        // once, observes it, and goes quiet without touching registers.
        drop(self.pool.schedule(delay, Box::new(move || this.activation())));
    }

    fn activation(self: Arc<Self>) {
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }
        self.process_once();
        if !self.cancelled.load(Ordering::SeqCst) {
            self.schedule(POLL_PERIOD);
        }
    }

    /// Executes one poll pass against the control registers.
    ///
    /// Non-blocking single pass; exposed so tests can drive the protocol
    /// without a live worker pool.
    pub fn process_once(&self) {
        let command = self.regs.command();
        if command == Command::NONE {
            return;
        }

        // Consume the request and invalidate any stale response before
        // dispatching.
        self.regs.set_command(Command::NONE);
        self.regs.set_status(Status::IDLE);

        match command {
            Command::GREET => {
                tracing::info!("host greeting acknowledged");
                self.regs.set_status(Status::GREET_ACK);
            }
            command => {
                tracing::debug!(command = command.0, "unknown command");
                self.regs.set_status(Status::UNKNOWN_COMMAND);
            }
        }
    }
}
