// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Control core of a PCIe endpoint mailbox function.
//!
//! The function negotiates a BAR layout against an endpoint controller's
//! reported capabilities, places a small command/status register block in
//! the control BAR, and serves host requests from a background poll task.
//! The endpoint controller, the event source, and the scheduler that drives
//! the poller are all injected behind the [`platform`] traits, so the core
//! carries no dependency on any particular controller or executor.
//!
//! The wire-visible register layout lives in [`epf_mailbox_protocol`].

#![forbid(unsafe_code)]

pub mod capabilities;
pub mod command;
pub mod lifecycle;
pub mod negotiate;
pub mod platform;
pub mod test_helpers;

pub use capabilities::BarCapability;
pub use capabilities::EpcCapabilities;
pub use capabilities::NUM_BARS;
pub use command::POLL_PERIOD;
pub use lifecycle::BindError;
pub use lifecycle::EventError;
pub use lifecycle::FunctionHeader;
pub use lifecycle::MailboxFunction;
pub use lifecycle::RunState;
pub use negotiate::NegotiationError;
pub use platform::EndpointController;
pub use platform::EpcEvent;
