//! gsched shared scheduling ABI
//!
//! Types that cross the boundary between the kernel dispatcher and the
//! user-space policy server. Neither side depends on the other; both depend
//! on this crate and talk only through [`Request`] / [`Response`] values.
//!
//! - `endpoint`: slot indices and generation-tagged process identities
//! - `fixed`: integer fixed-point CPU shares and the justice metric
//! - `affinity`: CPU affinity masks
//! - `config`: the scheduler configuration surface
//! - `message`: protocol requests and responses
//! - `wire`: postcard codec for protocol messages

#![cfg_attr(not(test), no_std)]

pub mod affinity;
pub mod config;
pub mod endpoint;
pub mod fixed;
pub mod message;
pub mod wire;

pub use affinity::CpuMask;
pub use config::{ConfigError, SchedConfig};
pub use endpoint::{Endpoint, SlotId};
pub use fixed::{CpuShare, Justice, ShareError};
pub use message::{
    AccountingSnapshot, PriorityBounds, RejectReason, Request, RequestKind, Response,
    ResponseKind, UNSOLICITED,
};
pub use wire::{WireError, MAX_MESSAGE_SIZE};

#[cfg(test)]
mod tests {
    use static_assertions::{assert_impl_all, const_assert};

    use super::*;

    assert_impl_all!(Request: Copy, Send, Sync);
    assert_impl_all!(Response: Copy, Send, Sync);
    const_assert!(core::mem::size_of::<Endpoint>() == 4);
    const_assert!(core::mem::size_of::<CpuShare>() == 4);
}
