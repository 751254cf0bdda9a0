// SPDX-License-Identifier: MPL-2.0

//! PCIe interrupt management for a monolithic kernel: INTx/MSI mode
//! arbitration, dispatch and masking for one PCIe function at a time.
//!
//! The crate is organized as five components:
//! - **C1** — the [`facade`] module's [`facade::PlatformIrq`] trait, the
//!   narrow boundary to the host's interrupt controller and MSI allocator.
//! - **C2** — [`device::DeviceIrqState`], the per-function record: active
//!   mode, handler table, MSI block handle, legacy backlink.
//! - **C3** — [`legacy::SharedLegacyDispatcher`] and [`legacy::LegacyRegistry`],
//!   multiplexing one shared INTx vector across every function wired to it.
//! - **C4** — [`msi`], the per-vector dispatch path installed at MSI entry.
//! - **C5** — [`control::PciIrqManager`], the driver-facing control plane:
//!   query capabilities, enter/leave a mode, register a handler, mask/unmask.
//!
//! [`cfg::PciCfgAccess`] is the config-space boundary: callers own locating
//! the MSI capability and resolving its register offsets; this crate only
//! reads and writes through the trait.
#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]

extern crate alloc;

pub mod cfg;
pub mod control;
pub mod device;
pub mod error;
pub mod facade;
pub mod legacy;
pub mod msi;
#[cfg(feature = "ostd-platform")]
pub mod platform;
mod sync;

pub use control::{IrqCapabilities, IrqModeInfo, PciIrqManager};
pub use device::{HandlerCallback, IrqMode};
pub use error::{Error, Result};
