// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire format shared between the mailbox endpoint function and the remote
//! host.
//!
//! The host reaches these registers through the function's control BAR.
//! Every field is a host-endian 32-bit word, packed with no padding. The
//! host writes `command` to issue a request and polls `status` for the
//! outcome; the function clears `command` before it produces `status`, so a
//! nonzero `status` guarantees the request was consumed.

#![forbid(unsafe_code)]

use open_enum::open_enum;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The register block exposed through the control BAR.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ControlBlock {
    /// Reserved. Present in the layout but carries no protocol meaning.
    pub magic: u32,
    /// Written by the host to issue a request. Zero means no request.
    pub command: u32,
    /// Written by the function with the outcome. Zero while idle or while a
    /// request is being processed.
    pub status: u32,
}

const _: () = assert!(size_of::<ControlBlock>() == 12);

open_enum! {
    /// Byte offsets of the control registers within the control BAR.
    pub enum Register: u32 {
        MAGIC = 0x0,
        COMMAND = 0x4,
        STATUS = 0x8,
    }
}

open_enum! {
    /// Request codes the host may place in `command`.
    ///
    /// The set is open: any nonzero value is a request, but only the named
    /// points are recognized.
    pub enum Command: u32 {
        /// No request pending.
        NONE = 0,
        /// Liveness greeting, answered with [`Status::GREET_ACK`].
        GREET = 0xdead_beef,
    }
}

open_enum! {
    /// Response codes the function places in `status`.
    pub enum Status: u32 {
        /// No response yet.
        IDLE = 0,
        /// The greeting was consumed and acknowledged.
        GREET_ACK = 0xdead_beef,
        /// The command value was not recognized.
        UNKNOWN_COMMAND = 0xdead_c0de,
    }
}
