// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bind/unbind lifecycle and event handling for the mailbox function.
//!
//! Bind negotiates the BAR layout and then takes one of two startup paths,
//! chosen by the controller's capabilities: when neither core-init nor
//! link-up is event-delivered, the header and layout are committed and the
//! poller starts during bind itself; otherwise the function registers for
//! notifications and commits (and goes live) as events arrive.

use crate::capabilities::EpcCapabilities;
use crate::command::CommandPoller;
use crate::negotiate;
use crate::negotiate::BarPlan;
use crate::negotiate::NegotiationError;
use crate::platform::EndpointController;
use crate::platform::EpcEvent;
use crate::platform::WorkerPool;
use std::sync::Arc;
use thiserror::Error;

/// Standard configuration header values committed for the function at core
/// initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionHeader {
    /// PCI vendor id; `0xffff` matches any.
    pub vendor_id: u16,
    /// PCI device id; `0xffff` matches any.
    pub device_id: u16,
    /// Base class code.
    pub base_class: u8,
    /// Subclass code.
    pub sub_class: u8,
    /// Programming interface.
    pub prog_if: u8,
    /// Legacy interrupt pin (1 = INTA); zero means none.
    pub interrupt_pin: u8,
}

impl Default for FunctionHeader {
    fn default() -> Self {
        Self {
            vendor_id: 0xffff,
            device_id: 0xffff,
            // "Other" device class.
            base_class: 0xff,
            sub_class: 0,
            prog_if: 0,
            interrupt_pin: 1,
        }
    }
}

/// Errors that abort [`MailboxFunction::bind`].
#[derive(Debug, Error)]
pub enum BindError {
    /// The controller cannot describe its capabilities; binding cannot
    /// proceed without them.
    #[error("endpoint controller capabilities are unavailable")]
    CapabilitiesUnavailable,
    /// The control-BAR path of negotiation failed.
    #[error("BAR negotiation failed")]
    Negotiation(#[from] NegotiationError),
    /// The configuration header could not be written.
    #[error("configuration header write failed")]
    HeaderWrite(#[source] anyhow::Error),
}

/// Errors returned to the event source; an `Err` rejects the notification.
#[derive(Debug, Error)]
pub enum EventError {
    /// The event kind is not one this function understands.
    #[error("unsupported endpoint controller event")]
    UnsupportedEvent,
    /// Deferred core initialization failed; the function cannot go live.
    #[error("core initialization failed")]
    CoreInit(#[source] BindError),
}

/// Post-bind run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Bound; waiting for a controller event before going live.
    AwaitingEvent,
    /// The command poller is running.
    Polling,
}

/// One bindable instance of the mailbox endpoint function.
///
/// Owns the endpoint controller handle, the negotiated plan, and the
/// poller. Bind and unbind run synchronously on the caller's thread and
/// must not race each other for the same instance; unbind is idempotent
/// and safe after a partially failed bind.
pub struct MailboxFunction<C: EndpointController> {
    epc: C,
    pool: Arc<dyn WorkerPool>,
    header: FunctionHeader,
    caps: Option<EpcCapabilities>,
    plan: Option<BarPlan<C::Registers>>,
    poller: Option<Arc<CommandPoller<C::Registers>>>,
    run_state: Option<RunState>,
}

impl<C: EndpointController> MailboxFunction<C> {
    /// Creates an unbound function over `epc`, polled on `pool`.
    pub fn new(epc: C, pool: Arc<dyn WorkerPool>, header: FunctionHeader) -> Self {
        Self {
            epc,
            pool,
            header,
            caps: None,
            plan: None,
            poller: None,
            run_state: None,
        }
    }

    /// Current run state; `None` while unbound.
    pub fn run_state(&self) -> Option<RunState> {
        self.run_state
    }

    /// The negotiated plan, once bind has produced one.
    pub fn plan(&self) -> Option<&BarPlan<C::Registers>> {
        self.plan.as_ref()
    }

    /// Negotiates resources and brings the function up.
    ///
    /// On failure the function may hold partial allocations;
    /// [`unbind`](Self::unbind) releases them and is always safe to call.
    pub fn bind(&mut self) -> Result<(), BindError> {
        let caps = self
            .epc
            .capabilities()
            .ok_or(BindError::CapabilitiesUnavailable)?;
        tracing::debug!(
            core_init_notifier = caps.core_init_notifier,
            linkup_notifier = caps.linkup_notifier,
            "bind"
        );
        self.caps = Some(caps.clone());

        let mut plan = negotiate::plan_bars(&caps)?;
        plan.allocate(&mut self.epc)?;
        self.plan = Some(plan);

        if !caps.core_init_notifier {
            self.core_init()?;
        }

        if caps.linkup_notifier || caps.core_init_notifier {
            self.epc.request_notifications();
            self.run_state = Some(RunState::AwaitingEvent);
        } else {
            self.start_poller();
        }

        Ok(())
    }

    /// Delivers a controller event to the function.
    ///
    /// The hosting glue calls this for every event once bind has issued
    /// [`request_notifications`](EndpointController::request_notifications).
    /// `Ok` accepts the notification, `Err` rejects it.
    pub fn handle_event(&mut self, event: EpcEvent) -> Result<(), EventError> {
        match event {
            EpcEvent::CORE_INIT => {
                self.core_init().map_err(EventError::CoreInit)?;
                // With no link-up notification coming, this event is the
                // signal to go live.
                let linkup_notifier = self.caps.as_ref().is_some_and(|caps| caps.linkup_notifier);
                if !linkup_notifier && self.run_state == Some(RunState::AwaitingEvent) {
                    self.start_poller();
                }
                Ok(())
            }
            EpcEvent::LINK_UP => {
                if self.run_state == Some(RunState::AwaitingEvent) {
                    self.start_poller();
                }
                Ok(())
            }
            event => {
                tracing::error!(event = event.0, "unsupported event");
                Err(EventError::UnsupportedEvent)
            }
        }
    }

    /// Tears the function down: stops polling, then releases every BAR in
    /// index order. Never fails; repeat calls are no-ops.
    pub fn unbind(&mut self) {
        tracing::debug!("unbind");
        if let Some(poller) = self.poller.take() {
            poller.cancel();
        }
        if let Some(plan) = self.plan.as_mut() {
            plan.release_all(&mut self.epc);
        }
        self.run_state = None;
    }

    /// Commits the configuration header and the BAR layout to the
    /// controller. Runs during bind, or on the core-init event when the
    /// controller defers it.
    fn core_init(&mut self) -> Result<(), BindError> {
        tracing::debug!("core init");
        self.epc
            .write_header(&self.header)
            .map_err(BindError::HeaderWrite)?;
        if let Some(plan) = self.plan.as_mut() {
            plan.configure(&mut self.epc)?;
        }
        Ok(())
    }

    fn start_poller(&mut self) {
        let Some(regs) = self.plan.as_ref().and_then(|plan| plan.control_regs()) else {
            return;
        };
        let poller = CommandPoller::new(regs.clone(), self.pool.clone());
        poller.start();
        self.poller = Some(poller);
        self.run_state = Some(RunState::Polling);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiate::BarState;
    use crate::test_helpers::TestController;
    use crate::test_helpers::TestWorkerPool;

    fn caps(core_init_notifier: bool, linkup_notifier: bool) -> EpcCapabilities {
        EpcCapabilities {
            align: 128,
            core_init_notifier,
            linkup_notifier,
            ..Default::default()
        }
    }

    fn function(
        caps: EpcCapabilities,
    ) -> (
        MailboxFunction<TestController>,
        TestController,
        TestWorkerPool,
    ) {
        let epc = TestController::new(caps);
        let pool = TestWorkerPool::new();
        let function = MailboxFunction::new(
            epc.clone(),
            Arc::new(pool.clone()),
            FunctionHeader::default(),
        );
        (function, epc, pool)
    }

    #[test]
    fn bind_fails_without_capabilities() {
        let epc = TestController::unsupported();
        let pool = TestWorkerPool::new();
        let mut function =
            MailboxFunction::new(epc, Arc::new(pool), FunctionHeader::default());
        assert!(matches!(
            function.bind(),
            Err(BindError::CapabilitiesUnavailable)
        ));
        assert_eq!(function.run_state(), None);
    }

    #[test]
    fn immediate_path_commits_and_polls_at_bind() {
        let (mut function, epc, pool) = function(caps(false, false));
        function.bind().unwrap();

        assert_eq!(function.run_state(), Some(RunState::Polling));
        assert_eq!(epc.header(), Some(FunctionHeader::default()));
        assert!(!epc.notifications_requested());
        for bar in 0..crate::NUM_BARS {
            assert_eq!(
                function.plan().unwrap().state(bar),
                BarState::Configured,
                "bar {bar}"
            );
        }
        assert_eq!(pool.pending(), 1);
    }

    #[test]
    fn notified_path_defers_commitment_until_core_init() {
        let (mut function, epc, pool) = function(caps(true, false));
        function.bind().unwrap();

        assert_eq!(function.run_state(), Some(RunState::AwaitingEvent));
        assert!(epc.notifications_requested());
        assert_eq!(epc.header(), None);
        assert_eq!(
            function.plan().unwrap().state(0),
            BarState::Allocated,
            "commitment deferred"
        );
        assert_eq!(pool.pending(), 0);

        function.handle_event(EpcEvent::CORE_INIT).unwrap();
        assert_eq!(epc.header(), Some(FunctionHeader::default()));
        assert_eq!(function.plan().unwrap().state(0), BarState::Configured);
        // No link-up notification is coming; core init goes live.
        assert_eq!(function.run_state(), Some(RunState::Polling));
        assert_eq!(pool.pending(), 1);
    }

    #[test]
    fn linkup_event_starts_the_poller() {
        let (mut function, epc, pool) = function(caps(false, true));
        function.bind().unwrap();

        // Core init is synchronous here; only the poller start waits.
        assert_eq!(epc.header(), Some(FunctionHeader::default()));
        assert_eq!(function.run_state(), Some(RunState::AwaitingEvent));
        assert_eq!(pool.pending(), 0);

        function.handle_event(EpcEvent::LINK_UP).unwrap();
        assert_eq!(function.run_state(), Some(RunState::Polling));
        assert_eq!(pool.pending(), 1);
    }

    #[test]
    fn both_notifiers_wait_for_linkup_to_go_live() {
        let (mut function, epc, pool) = function(caps(true, true));
        function.bind().unwrap();

        function.handle_event(EpcEvent::CORE_INIT).unwrap();
        assert_eq!(epc.header(), Some(FunctionHeader::default()));
        assert_eq!(function.run_state(), Some(RunState::AwaitingEvent));
        assert_eq!(pool.pending(), 0);

        function.handle_event(EpcEvent::LINK_UP).unwrap();
        assert_eq!(function.run_state(), Some(RunState::Polling));
        assert_eq!(pool.pending(), 1);
    }

    #[test]
    fn unknown_events_are_rejected() {
        let (mut function, _epc, _pool) = function(caps(true, true));
        function.bind().unwrap();
        assert!(matches!(
            function.handle_event(EpcEvent(7)),
            Err(EventError::UnsupportedEvent)
        ));
    }

    #[test]
    fn failed_core_init_event_is_rejected() {
        let (mut function, epc, _pool) = function(caps(true, false));
        epc.fail_header();
        function.bind().unwrap();
        assert!(matches!(
            function.handle_event(EpcEvent::CORE_INIT),
            Err(EventError::CoreInit(BindError::HeaderWrite(_)))
        ));
        assert_eq!(function.run_state(), Some(RunState::AwaitingEvent));
    }

    #[test]
    fn unbind_twice_is_idempotent() {
        let (mut function, epc, pool) = function(caps(false, false));
        function.bind().unwrap();
        assert_eq!(epc.allocated_count(), 6);

        function.unbind();
        assert_eq!(epc.allocated_count(), 0);
        assert_eq!(function.run_state(), None);
        let releases: Vec<_> = (0..crate::NUM_BARS)
            .map(|bar| epc.release_count(bar))
            .collect();

        function.unbind();
        let releases_after: Vec<_> = (0..crate::NUM_BARS)
            .map(|bar| epc.release_count(bar))
            .collect();
        assert_eq!(releases, releases_after);

        // The pending activation fires once, sees the cancellation, and
        // nothing further is scheduled.
        assert!(pool.run_next());
        assert_eq!(pool.pending(), 0);
    }

    #[test]
    fn unbind_cleans_up_after_header_write_failure() {
        let (mut function, epc, _pool) = function(caps(false, false));
        epc.fail_header();
        assert!(matches!(
            function.bind(),
            Err(BindError::HeaderWrite(_))
        ));
        assert_eq!(epc.allocated_count(), 6);

        function.unbind();
        assert_eq!(epc.allocated_count(), 0);
    }

    #[test]
    fn unbind_before_bind_is_a_no_op() {
        let (mut function, epc, _pool) = function(caps(false, false));
        function.unbind();
        assert_eq!(epc.allocated_count(), 0);
        assert_eq!(function.run_state(), None);
    }
}
