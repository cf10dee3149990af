// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Platform abstraction layer for the mailbox endpoint function.
//!
//! This module defines the interface between the function core and the
//! environment hosting it: the endpoint controller that owns BAR space and
//! the link, and the worker pool that drives the command poller. Mock
//! implementations for tests live in [`test_helpers`](crate::test_helpers).
//!
//! Events are delivered by the hosting glue calling
//! [`MailboxFunction::handle_event`](crate::MailboxFunction::handle_event)
//! once the function has signaled interest via
//! [`EndpointController::request_notifications`].

use crate::capabilities::EpcCapabilities;
use crate::lifecycle::FunctionHeader;
use open_enum::open_enum;
use std::sync::Arc;
use std::time::Duration;

/// Single-shot access to a BAR's backing registers.
///
/// The remote host reads and writes the same memory concurrently, with no
/// synchronization beyond the register semantics themselves.
/// Implementations must issue a fresh access for every call; values must
/// never be cached, elided, or reordered across calls.
pub trait RegisterIo: Send + Sync {
    /// Reads the 32-bit register at byte `offset`.
    fn read_u32(&self, offset: usize) -> u32;
    /// Writes the 32-bit register at byte `offset`.
    fn write_u32(&self, offset: usize, value: u32);
}

open_enum! {
    /// Asynchronous events an endpoint controller can deliver to a bound
    /// function.
    ///
    /// The set is open: a controller may define further event kinds, which
    /// the function rejects.
    pub enum EpcEvent: u32 {
        /// The controller core finished initializing.
        CORE_INIT = 0,
        /// The link to the host came up.
        LINK_UP = 1,
    }
}

/// The endpoint controller seam: capability query, BAR space management,
/// header commitment, and event interest.
pub trait EndpointController: Send {
    /// Register backing produced by [`alloc_bar`](Self::alloc_bar).
    type Registers: RegisterIo + 'static;

    /// Returns the controller's capabilities, or `None` when the
    /// controller cannot describe itself.
    fn capabilities(&self) -> Option<EpcCapabilities>;

    /// Reserves `len` bytes of backing space for `bar`, aligned to `align`
    /// bytes (zero means no constraint). Does not commit the BAR to the
    /// link.
    fn alloc_bar(
        &mut self,
        bar: usize,
        len: u64,
        align: u64,
    ) -> anyhow::Result<Arc<Self::Registers>>;

    /// Commits a previously allocated `bar` to the live link. This can
    /// fail independently of allocation (commit-time resource exhaustion),
    /// which is why the bind sequence keeps the two phases separate.
    fn set_bar(&mut self, bar: usize) -> anyhow::Result<()>;

    /// Uncommits `bar` if it was committed and frees its backing space.
    ///
    /// Idempotent and infallible: teardown must always complete. Backing
    /// memory stays valid until every handle returned by
    /// [`alloc_bar`](Self::alloc_bar) has been dropped, so a poll pass
    /// finishing out its cancellation never touches freed memory.
    fn release_bar(&mut self, bar: usize);

    /// Writes the function's standard configuration header.
    fn write_header(&mut self, header: &FunctionHeader) -> anyhow::Result<()>;

    /// Asks the controller to start delivering [`EpcEvent`]s for this
    /// function.
    fn request_notifications(&mut self);
}

/// Deferred-execution service that drives the command poller.
pub trait WorkerPool: Send + Sync {
    /// Schedules `work` to run once, roughly `delay` from now.
    fn schedule(&self, delay: Duration, work: Box<dyn FnOnce() + Send>) -> Box<dyn ScheduledWork>;
}

/// Handle to one scheduled unit of work.
pub trait ScheduledWork: Send {
    /// Cancels the work if it has not started running. A unit already
    /// running is allowed to finish.
    fn cancel(&mut self);
}
