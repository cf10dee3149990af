// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! BAR layout negotiation and the two-phase bind sequence.
//!
//! Planning maps the controller's capability descriptor onto requested
//! sizes and the control BAR choice without touching the controller.
//! Allocation then carves out backing space for every planned BAR, and a
//! separate configuration pass commits the finished layout to the link.
//! The phases are distinct because committing a BAR can fail for reasons
//! independent of allocation, and because all space must be carved out
//! before any BAR goes live so address and size decisions are final.
//!
//! Only control-BAR failures are fatal. Auxiliary BARs are best effort:
//! their failures are logged, recorded per slot, and skipped.

use crate::capabilities::EpcCapabilities;
use crate::capabilities::NUM_BARS;
use crate::platform::EndpointController;
use epf_mailbox_protocol::ControlBlock;
use std::sync::Arc;
use thiserror::Error;

/// Backing sizes requested per BAR when the controller does not mandate
/// one.
pub const BASELINE_BAR_SIZES: [u64; NUM_BARS] = [512, 512, 1024, 16384, 131072, 1048576];

/// Errors from the control-BAR path of the bind sequence.
#[derive(Debug, Error)]
pub enum NegotiationError {
    /// Every BAR is reserved by the controller.
    #[error("no free BAR available for the control block")]
    NoFreeBar,
    /// The controller mandates a control BAR smaller than the control
    /// block itself.
    #[error(
        "control BAR {bar} fixed size {fixed:#x} cannot hold the {needed:#x} byte control block"
    )]
    ControlBarTooSmall {
        /// The control BAR index.
        bar: usize,
        /// The mandated size.
        fixed: u64,
        /// The rounded-up control block size.
        needed: u64,
    },
    /// Backing space allocation failed for the control BAR.
    #[error("failed to allocate space for control BAR {bar}")]
    AllocationFailed {
        /// The control BAR index.
        bar: usize,
        /// The controller's failure.
        #[source]
        source: anyhow::Error,
    },
    /// Committing the control BAR to the link failed.
    #[error("failed to configure control BAR {bar}")]
    ConfigurationFailed {
        /// The control BAR index.
        bar: usize,
        /// The controller's failure.
        #[source]
        source: anyhow::Error,
    },
}

/// The bind phase a BAR failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarPhase {
    /// Backing space allocation.
    Allocation,
    /// Commit to the live link.
    Configuration,
}

/// Outcome of the bind sequence so far for one BAR slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarState {
    /// Not part of the layout: reserved, consumed as the upper half of a
    /// preceding 64-bit BAR, or simply not planned.
    Unused,
    /// Backing space allocated but not yet committed to the link.
    Allocated,
    /// Allocated and committed; live.
    Configured,
    /// Failed in the given phase; any backing it held has been released.
    Failed(BarPhase),
}

struct BarSlot<R> {
    request: Option<u64>,
    regs: Option<Arc<R>>,
    state: BarState,
}

impl<R> BarSlot<R> {
    fn new() -> Self {
        Self {
            request: None,
            regs: None,
            state: BarState::Unused,
        }
    }
}

/// The negotiated BAR layout and its progress through the two-phase bind
/// sequence.
pub struct BarPlan<R> {
    bars: [BarSlot<R>; NUM_BARS],
    control_bar: usize,
    align: u64,
}

/// Maps `caps` onto a concrete BAR layout without touching the controller.
///
/// Selects the lowest-indexed non-reserved BAR to host the control block,
/// applies fixed-size overrides to the baseline size table, and sizes every
/// usable BAR. A fixed 64-bit BAR consumes the following slot, which stays
/// unplanned.
pub fn plan_bars<R>(caps: &EpcCapabilities) -> Result<BarPlan<R>, NegotiationError> {
    let control_bar = caps.first_free_bar().ok_or(NegotiationError::NoFreeBar)?;

    let mut sizes = BASELINE_BAR_SIZES;
    for (size, cap) in sizes.iter_mut().zip(caps.bars.iter()) {
        if let Some(fixed) = cap.fixed_size {
            *size = fixed;
        }
    }

    let mut plan = BarPlan {
        bars: std::array::from_fn(|_| BarSlot::new()),
        control_bar,
        align: caps.align,
    };

    // The control BAR needs just enough space for the register block; a
    // mandated size may widen that, never shrink it.
    let needed = round_up(size_of::<ControlBlock>() as u64, caps.align);
    plan.bars[control_bar].request = match caps.bars[control_bar].fixed_size {
        Some(fixed) if needed > fixed => {
            return Err(NegotiationError::ControlBarTooSmall {
                bar: control_bar,
                fixed,
                needed,
            });
        }
        Some(fixed) => Some(fixed),
        None => Some(needed),
    };

    let mut bar = 0;
    while bar < NUM_BARS {
        let step = if caps.bars[bar].fixed_64bit { 2 } else { 1 };
        if bar != control_bar && !caps.bars[bar].reserved {
            plan.bars[bar].request = Some(sizes[bar]);
        }
        bar += step;
    }

    Ok(plan)
}

impl<R> BarPlan<R> {
    /// Index of the BAR hosting the control block.
    pub fn control_bar(&self) -> usize {
        self.control_bar
    }

    /// Requested backing size for `bar`, if the BAR is planned.
    pub fn request(&self, bar: usize) -> Option<u64> {
        self.bars[bar].request
    }

    /// Bind outcome so far for `bar`.
    pub fn state(&self, bar: usize) -> BarState {
        self.bars[bar].state
    }

    /// Register backing of the control BAR, once allocated.
    pub fn control_regs(&self) -> Option<&Arc<R>> {
        self.bars[self.control_bar].regs.as_ref()
    }

    /// Reserves backing space for every planned BAR.
    ///
    /// The control BAR allocates first and its failure is fatal; nothing
    /// else has been touched at that point, so the bind aborts with no
    /// space committed. Every other BAR then allocates best effort.
    pub fn allocate<C>(&mut self, epc: &mut C) -> Result<(), NegotiationError>
    where
        C: EndpointController<Registers = R>,
    {
        let control = self.control_bar;
        if let Some(len) = self.bars[control].request {
            match epc.alloc_bar(control, len, self.align) {
                Ok(regs) => {
                    self.bars[control].regs = Some(regs);
                    self.bars[control].state = BarState::Allocated;
                }
                Err(source) => {
                    self.bars[control].state = BarState::Failed(BarPhase::Allocation);
                    return Err(NegotiationError::AllocationFailed {
                        bar: control,
                        source,
                    });
                }
            }
        }

        for bar in 0..NUM_BARS {
            if bar == control {
                continue;
            }
            let Some(len) = self.bars[bar].request else {
                continue;
            };
            match epc.alloc_bar(bar, len, self.align) {
                Ok(regs) => {
                    self.bars[bar].regs = Some(regs);
                    self.bars[bar].state = BarState::Allocated;
                }
                Err(error) => {
                    tracing::error!(bar, error = ?error, "failed to allocate BAR space");
                    self.bars[bar].state = BarState::Failed(BarPhase::Allocation);
                }
            }
        }

        Ok(())
    }

    /// Commits every allocated BAR to the live link.
    ///
    /// A control-BAR failure releases that BAR's backing and aborts. A
    /// failure elsewhere releases only the failing BAR and continues, so
    /// no BAR is ever left allocated-but-unconfigured after this pass.
    pub fn configure<C>(&mut self, epc: &mut C) -> Result<(), NegotiationError>
    where
        C: EndpointController<Registers = R>,
    {
        for bar in 0..NUM_BARS {
            if self.bars[bar].state != BarState::Allocated {
                continue;
            }
            match epc.set_bar(bar) {
                Ok(()) => self.bars[bar].state = BarState::Configured,
                Err(source) => {
                    self.bars[bar].regs = None;
                    self.bars[bar].state = BarState::Failed(BarPhase::Configuration);
                    epc.release_bar(bar);
                    if bar == self.control_bar {
                        return Err(NegotiationError::ConfigurationFailed { bar, source });
                    }
                    tracing::error!(bar, error = ?source, "failed to configure BAR");
                }
            }
        }
        Ok(())
    }

    /// Releases every BAR that still holds an allocation, in index order.
    ///
    /// Idempotent: a released slot is forgotten, so running this again is
    /// a no-op. Never touches an unallocated BAR.
    pub fn release_all<C>(&mut self, epc: &mut C)
    where
        C: EndpointController<Registers = R>,
    {
        for bar in 0..NUM_BARS {
            if self.bars[bar].regs.take().is_some() {
                epc.release_bar(bar);
                self.bars[bar].state = BarState::Unused;
            }
        }
    }
}

/// Rounds `len` up to a multiple of `align` bytes. `align` must be zero
/// (no constraint) or a power of two.
fn round_up(len: u64, align: u64) -> u64 {
    if align == 0 {
        len
    } else {
        (len + align - 1) & !(align - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::EpcCapabilities;
    use crate::test_helpers::TestController;
    use crate::test_helpers::TestRegisters;

    fn caps_with_align(align: u64) -> EpcCapabilities {
        EpcCapabilities {
            align,
            ..Default::default()
        }
    }

    #[test]
    fn round_up_handles_zero_align() {
        assert_eq!(round_up(12, 0), 12);
        assert_eq!(round_up(12, 128), 128);
        assert_eq!(round_up(128, 128), 128);
        assert_eq!(round_up(129, 128), 256);
    }

    #[test]
    fn plan_selects_first_free_bar_and_baseline_sizes() {
        let plan = plan_bars::<TestRegisters>(&caps_with_align(128)).unwrap();
        assert_eq!(plan.control_bar(), 0);
        assert_eq!(plan.request(0), Some(128));
        assert_eq!(plan.request(1), Some(512));
        assert_eq!(plan.request(2), Some(1024));
        assert_eq!(plan.request(3), Some(16384));
        assert_eq!(plan.request(4), Some(131072));
        assert_eq!(plan.request(5), Some(1048576));
    }

    #[test]
    fn plan_moves_control_bar_past_reserved() {
        let mut caps = caps_with_align(128);
        caps.bars[0].reserved = true;
        let plan = plan_bars::<TestRegisters>(&caps).unwrap();
        assert_eq!(plan.control_bar(), 1);
        assert_eq!(plan.request(0), None);
        assert_eq!(plan.request(1), Some(128));
        assert_eq!(plan.request(2), Some(1024));
    }

    #[test]
    fn plan_fails_when_all_bars_reserved() {
        let mut caps = caps_with_align(128);
        for bar in &mut caps.bars {
            bar.reserved = true;
        }
        assert!(matches!(
            plan_bars::<TestRegisters>(&caps),
            Err(NegotiationError::NoFreeBar)
        ));
    }

    #[test]
    fn fixed_control_size_widens_the_request() {
        let mut caps = caps_with_align(128);
        caps.bars[0].fixed_size = Some(4096);
        let plan = plan_bars::<TestRegisters>(&caps).unwrap();
        assert_eq!(plan.request(0), Some(4096));
    }

    #[test]
    fn fixed_control_size_below_block_fails() {
        let mut caps = caps_with_align(128);
        caps.bars[0].fixed_size = Some(64);
        assert!(matches!(
            plan_bars::<TestRegisters>(&caps),
            Err(NegotiationError::ControlBarTooSmall {
                bar: 0,
                fixed: 64,
                needed: 128,
            })
        ));
    }

    #[test]
    fn fixed_size_overrides_baseline_for_aux_bars() {
        let mut caps = caps_with_align(128);
        caps.bars[3].fixed_size = Some(8192);
        let plan = plan_bars::<TestRegisters>(&caps).unwrap();
        assert_eq!(plan.request(3), Some(8192));
    }

    #[test]
    fn fixed_64bit_bar_consumes_the_next_slot() {
        let mut caps = caps_with_align(128);
        caps.bars[2].fixed_64bit = true;
        let plan = plan_bars::<TestRegisters>(&caps).unwrap();
        assert_eq!(plan.request(2), Some(1024));
        assert_eq!(plan.request(3), None);
        assert_eq!(plan.request(4), Some(131072));
    }

    #[test]
    fn control_allocation_failure_is_fatal_and_leaves_nothing() {
        let epc = TestController::new(caps_with_align(128));
        epc.fail_alloc(0);
        let mut plan = plan_bars(&caps_with_align(128)).unwrap();
        let err = plan.allocate(&mut epc.clone()).unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::AllocationFailed { bar: 0, .. }
        ));
        assert_eq!(epc.allocated_count(), 0);
        assert_eq!(plan.state(0), BarState::Failed(BarPhase::Allocation));
    }

    #[test]
    fn aux_allocation_failure_is_recorded_not_fatal() {
        let epc = TestController::new(caps_with_align(128));
        epc.fail_alloc(3);
        let mut plan = plan_bars(&caps_with_align(128)).unwrap();
        plan.allocate(&mut epc.clone()).unwrap();
        assert_eq!(plan.state(0), BarState::Allocated);
        assert_eq!(plan.state(3), BarState::Failed(BarPhase::Allocation));
        assert_eq!(plan.state(4), BarState::Allocated);
        assert_eq!(epc.allocated_count(), 5);
    }

    #[test]
    fn control_configuration_failure_releases_and_aborts() {
        let epc = TestController::new(caps_with_align(128));
        epc.fail_set(0);
        let mut plan = plan_bars(&caps_with_align(128)).unwrap();
        plan.allocate(&mut epc.clone()).unwrap();
        let err = plan.configure(&mut epc.clone()).unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::ConfigurationFailed { bar: 0, .. }
        ));
        assert!(epc.bar_regs(0).is_none());
        assert_eq!(plan.state(0), BarState::Failed(BarPhase::Configuration));
    }

    #[test]
    fn aux_configuration_failure_releases_only_that_bar() {
        let epc = TestController::new(caps_with_align(128));
        epc.fail_set(2);
        let mut plan = plan_bars(&caps_with_align(128)).unwrap();
        plan.allocate(&mut epc.clone()).unwrap();
        plan.configure(&mut epc.clone()).unwrap();
        assert_eq!(plan.state(0), BarState::Configured);
        assert_eq!(plan.state(2), BarState::Failed(BarPhase::Configuration));
        assert!(epc.bar_regs(2).is_none());
        for bar in [1, 3, 4, 5] {
            assert_eq!(plan.state(bar), BarState::Configured, "bar {bar}");
            assert!(epc.is_configured(bar), "bar {bar}");
        }
        // Nothing is left allocated-but-unconfigured.
        for bar in 0..NUM_BARS {
            assert_ne!(plan.state(bar), BarState::Allocated, "bar {bar}");
        }
    }

    #[test]
    fn release_all_is_idempotent() {
        let epc = TestController::new(caps_with_align(128));
        let mut plan = plan_bars(&caps_with_align(128)).unwrap();
        plan.allocate(&mut epc.clone()).unwrap();
        plan.configure(&mut epc.clone()).unwrap();

        plan.release_all(&mut epc.clone());
        assert_eq!(epc.allocated_count(), 0);
        let releases: Vec<_> = (0..NUM_BARS).map(|bar| epc.release_count(bar)).collect();

        plan.release_all(&mut epc.clone());
        let releases_after: Vec<_> = (0..NUM_BARS).map(|bar| epc.release_count(bar)).collect();
        assert_eq!(releases, releases_after);
    }
}
