// SPDX-License-Identifier: MPL-2.0

//! The narrow boundary between this crate and a concrete platform.
//!
//! Everything C2-C5 know about "the platform" is expressed through
//! [`PlatformIrq`]. A kernel wires a concrete implementation in (see
//! `platform::ostd_adapter` for a reference built on `ostd::irq::IrqLine`,
//! behind the `ostd-platform` feature); this crate never allocates a real
//! system vector itself.

use crate::error::Result;

bitflags::bitflags! {
    /// The two-bit return contract shared by the legacy and MSI dispatch paths.
    pub struct DispatchAction: u8 {
        /// Leave the vector masked; the driver will unmask it once ready.
        const MASK = 0b01;
        /// A higher-priority runnable exists; ask the scheduler to reschedule.
        const RESCHED = 0b10;
    }
}

impl DispatchAction {
    pub const NONE: DispatchAction = DispatchAction::empty();

    pub fn wants_mask(self) -> bool {
        self.contains(DispatchAction::MASK)
    }

    pub fn wants_resched(self) -> bool {
        self.contains(DispatchAction::RESCHED)
    }
}

/// A low-level callback the platform invokes directly from IRQ context.
///
/// For the legacy path the cookie is the owning device's single handler
/// slot; for MSI it is the slot for the specific vector.
pub type PlatformCallback = alloc::sync::Arc<dyn Fn() -> DispatchAction + Send + Sync>;

/// A contiguous block of platform-level vectors granted for one MSI
/// configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsiBlock {
    /// Opaque platform identifier for the block (e.g. the first vector number).
    pub id: u64,
    /// Number of vectors in the block; always a power of two.
    pub vector_count: u32,
    /// The address the device should post writes to.
    pub target_address: u64,
    /// The base data value; vector `i` of the block posts `target_data + i`.
    pub target_data: u32,
    /// Whether the platform can mask/unmask individual vectors of this block.
    pub supports_masking: bool,
}

/// Adapter over whatever the kernel's interrupt controller and MSI-block
/// allocator look like.
///
/// Allocation methods (`alloc_msi_block`, `free_msi_block`) may block;
/// everything else is called from contexts that must not sleep and must be
/// safe to invoke with interrupts disabled.
pub trait PlatformIrq: Send + Sync {
    /// Whether this platform can deliver MSI at all.
    fn supports_msi(&self) -> bool;

    /// Whether this platform can mask/unmask individual MSI vectors, independent
    /// of whether a given device also exposes its own per-vector mask register.
    fn supports_msi_masking(&self) -> bool;

    /// Reserve `count` contiguous vectors (a power of two).
    ///
    /// `need_64bit` hints that the target address may exceed 32 bits;
    /// `is_msix` is always `false` in the current implementation (MSI-X is
    /// reserved) but is threaded through so a future implementation can add
    /// MSI-X without changing this trait's shape.
    fn alloc_msi_block(&self, count: u32, need_64bit: bool, is_msix: bool) -> Result<MsiBlock>;

    /// Release a block obtained from `alloc_msi_block`.
    ///
    /// Must first unregister every per-vector handler and block until no
    /// invocation of any of them is still in flight on another core.
    fn free_msi_block(&self, block: MsiBlock);

    /// Install (or, with `callback: None`, remove) the handler for vector
    /// `index` of `block`.
    fn register_msi_handler(
        &self,
        block: MsiBlock,
        index: u32,
        callback: Option<PlatformCallback>,
    );

    /// Mask or unmask vector `index` of `block` at the platform controller.
    ///
    /// Only called when [`PlatformIrq::supports_msi_masking`] returns `true`.
    fn mask_unmask_msi(&self, block: MsiBlock, index: u32, mask: bool);

    /// Map a legacy INTx pin to a system vector for sharing purposes.
    ///
    /// Multiple devices with the same pin number may still resolve to
    /// different system vectors depending on platform routing; the returned
    /// id is what keys the shared dispatcher registry.
    fn legacy_vector_for_pin(&self, pin: u8) -> Result<u64>;

    /// Mask the given system (legacy) vector at the platform controller.
    fn mask_vector(&self, vector: u64);

    /// Unmask the given system (legacy) vector at the platform controller.
    fn unmask_vector(&self, vector: u64);

    /// Install (or, with `callback: None`, remove) the handler for a legacy
    /// system vector. Called once per vector by the shared dispatcher, not
    /// once per device.
    fn register_int_handler(&self, vector: u64, callback: Option<PlatformCallback>);
}
