// SPDX-License-Identifier: MPL-2.0

//! The boundary between this crate and PCI configuration space.
//!
//! This crate never decodes a bus/device/function address itself and never
//! walks the capability list to find the MSI capability pointer; both are a
//! caller responsibility (bus enumeration, §1). What it gets instead is a
//! [`PciCfgAccess`] handle already scoped to one device, plus (if the device
//! has one) an already-located [`MsiCapability`] describing the fixed-size
//! fields of that device's MSI capability block.

use bitflags::bitflags;

bitflags! {
    /// PCI configuration space command register (offset 0x04).
    ///
    /// Only [`Command::INTERRUPT_DISABLE`] is read or written by this crate;
    /// the rest of the register is reproduced so callers sharing the same
    /// bitflags type (BAR setup, bus enumeration) don't need a second
    /// definition.
    pub struct Command: u16 {
        const IO_SPACE                 = 1 << 0;
        const MEMORY_SPACE             = 1 << 1;
        const BUS_MASTER               = 1 << 2;
        const SPECIAL_CYCLES           = 1 << 3;
        const MWI_ENABLE                = 1 << 4;
        const VGA_PALETTE_SNOOP         = 1 << 5;
        const PARITY_ERROR_RESPONSE     = 1 << 6;
        const STEPPING_CONTROL          = 1 << 7;
        const SERR_ENABLE               = 1 << 8;
        const FAST_BACK_TO_BACK_ENABLE  = 1 << 9;
        /// Masks INTx at the device; the only bit this crate actually flips.
        const INTERRUPT_DISABLE         = 1 << 10;
    }
}

bitflags! {
    /// PCI configuration space status register (offset 0x06).
    pub struct Status: u16 {
        /// Set while the device is asserting its legacy pin.
        const INTERRUPT_STATUS          = 1 << 3;
        const CAPABILITIES_LIST         = 1 << 4;
        const MHZ66_CAPABLE             = 1 << 5;
        const FAST_BACK_TO_BACK_CAPABLE  = 1 << 7;
        const MASTER_DATA_PARITY_ERROR  = 1 << 8;
        const DEVSEL_MEDIUM_TIMING       = 1 << 9;
        const DEVSEL_SLOW_TIMING         = 1 << 10;
        const SIGNALED_TARGET_ABORT      = 1 << 11;
        const RECEIVED_TARGET_ABORT      = 1 << 12;
        const RECEIVED_MASTER_ABORT      = 1 << 13;
        const SIGNALED_SYSTEM_ERROR      = 1 << 14;
        const DETECTED_PARITY_ERROR      = 1 << 15;
    }
}

/// Byte offsets within the MSI capability block, relative to the
/// capability's first byte (the capability ID), for the fields this crate
/// reads or writes. The control register's location is fixed; everything
/// after it shifts depending on [`MsiCapability::is64bit`].
pub mod msi_offset {
    /// 16-bit MSI control register: ENABLE (bit 0), MMC (bits 1..3), MME
    /// (bits 4..6), 64BIT (bit 7), PVM (bit 8).
    pub const CONTROL: u16 = 0x02;
    pub const ADDRESS_LOW: u16 = 0x04;
    /// Only present when [`super::MsiCapability::is64bit`] is set.
    pub const ADDRESS_HIGH_64BIT: u16 = 0x08;
    pub const DATA_32BIT: u16 = 0x08;
    pub const DATA_64BIT: u16 = 0x0C;
    pub const PVM_MASK_32BIT: u16 = 0x0C;
    pub const PVM_MASK_64BIT: u16 = 0x10;
}

/// The fixed-shape facts about one device's MSI capability, resolved by the
/// caller's capability-list walk before a [`crate::device::DeviceIrqState`]
/// is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsiCapability {
    /// Whether the capability has the 64-bit address form (control bit 7).
    pub is64bit: bool,
    /// The device's advertised ceiling on simultaneously enabled vectors
    /// (`1 << MMC`), not necessarily a power of two requested at runtime.
    pub max_irqs: u32,
    /// Whether the device exposes a per-vector mask register (control bit 8).
    pub has_pvm: bool,
}

/// Read/write access to one device's command register, status register, and
/// MSI capability block.
///
/// Implemented by the caller (typically the same bus-enumeration layer that
/// located the capability); this crate only ever calls it. Offsets passed to
/// `read16`/`write16`/`read32`/`write32` are relative to the MSI capability
/// base, as laid out in [`msi_offset`] — never an absolute config-space
/// address.
pub trait PciCfgAccess: Send + Sync {
    fn read_command(&self) -> Command;
    fn write_command(&self, command: Command);
    fn read_status(&self) -> Status;

    fn read16(&self, msi_offset: u16) -> u16;
    fn write16(&self, msi_offset: u16, value: u16);
    fn read32(&self, msi_offset: u16) -> u32;
    fn write32(&self, msi_offset: u16, value: u32);
}
