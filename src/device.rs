// SPDX-License-Identifier: MPL-2.0

//! Per-function IRQ state (C2): the active mode, the handler table, the MSI
//! block handle, and the legacy pin/shared-dispatcher backlink for one PCIe
//! function.
//!
//! [`DeviceIrqState`] is the record every other component reaches into;
//! [`crate::control::PciIrqManager`] is the only thing allowed to mutate it.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::cfg::{msi_offset, Command, MsiCapability, PciCfgAccess};
use crate::error::{Error, Result};
use crate::facade::{DispatchAction, MsiBlock, PlatformIrq};
use crate::legacy::{LegacyRegistry, SharedLegacyDispatcher};
use crate::sync::{Mutex, SpinLock};

/// A driver-supplied callback, invoked from IRQ context with the owning
/// device, the `irq_id` of the slot that fired, and the opaque context
/// handed to [`crate::control::PciIrqManager::register_handler`].
pub type HandlerCallback =
    Arc<dyn Fn(&Arc<DeviceIrqState>, u32, usize) -> DispatchAction + Send + Sync>;

/// Which interrupt-delivery discipline is active for a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqMode {
    Disabled,
    Legacy,
    Msi,
    /// Reserved: every path touching this variant returns
    /// [`Error::NotSupported`]. Kept in the enum so a future implementation
    /// can slot in MSI-X without changing the public API shape.
    MsiX,
}

/// One handler slot: the driver callback, its opaque context, and the
/// current mask state, behind a fine-grained IRQ-safe lock.
///
/// Dispatch paths (C3, C4) reach a slot directly through an `Arc` captured
/// in the platform callback closure installed at mode-entry time; they never
/// go through [`DeviceIrqState::inner`] (which may be held by a blocking
/// control-plane call).
pub struct HandlerSlot {
    irq_id: u32,
    pub(crate) inner: SpinLock<HandlerSlotInner>,
}

pub(crate) struct HandlerSlotInner {
    pub(crate) callback: Option<HandlerCallback>,
    pub(crate) ctx: usize,
    pub(crate) masked: bool,
}

impl HandlerSlot {
    fn new(irq_id: u32) -> Arc<Self> {
        Arc::new(Self {
            irq_id,
            // Slots start masked: entering either mode masks every vector
            // before a handler can be registered (§4.1 enter-MSI step 4;
            // legacy attach's defensive INT_DISABLE).
            inner: SpinLock::new(HandlerSlotInner {
                callback: None,
                ctx: 0,
                masked: true,
            }),
        })
    }

    pub fn irq_id(&self) -> u32 {
        self.irq_id
    }
}

/// Storage for a device's handler table (invariant 5: singleton vs heap).
pub(crate) enum HandlerStorage {
    Empty,
    Singleton(Arc<HandlerSlot>),
    Heap(Box<[Arc<HandlerSlot>]>),
}

impl HandlerStorage {
    pub(crate) fn len(&self) -> usize {
        match self {
            HandlerStorage::Empty => 0,
            HandlerStorage::Singleton(_) => 1,
            HandlerStorage::Heap(slots) => slots.len(),
        }
    }

    pub(crate) fn get(&self, irq_id: u32) -> Option<&Arc<HandlerSlot>> {
        match self {
            HandlerStorage::Empty => None,
            HandlerStorage::Singleton(slot) => (irq_id == 0).then_some(slot),
            HandlerStorage::Heap(slots) => slots.get(irq_id as usize),
        }
    }
}

fn build_handler_table(requested_irqs: u32) -> Result<HandlerStorage> {
    if requested_irqs == 1 {
        return Ok(HandlerStorage::Singleton(HandlerSlot::new(0)));
    }
    let mut slots = Vec::new();
    slots
        .try_reserve_exact(requested_irqs as usize)
        .map_err(|_| Error::NoMemory)?;
    for i in 0..requested_irqs {
        slots.push(HandlerSlot::new(i));
    }
    Ok(HandlerStorage::Heap(slots.into_boxed_slice()))
}

pub(crate) struct DeviceIrqInner {
    pub(crate) mode: IrqMode,
    pub(crate) handlers: HandlerStorage,
    pub(crate) registered_handler_count: u32,
    pub(crate) legacy_dispatcher: Option<Arc<SharedLegacyDispatcher>>,
    pub(crate) msi_block: Option<MsiBlock>,
}

/// The per-function IRQ record (C2).
///
/// Everything but `inner` is fixed for the lifetime of the device: the pin
/// number, whether it has an MSI capability, and the accessors it was
/// constructed with never change. Only `inner` (guarded by `dev_lock`,
/// modeled here as [`DeviceIrqState::inner`]) and `plugged_in` vary.
pub struct DeviceIrqState {
    pub(crate) cfg: Arc<dyn PciCfgAccess>,
    pub(crate) platform: Arc<dyn PlatformIrq>,
    pub(crate) legacy_registry: Arc<LegacyRegistry>,
    pub(crate) legacy_pin: u8,
    pub(crate) msi_cap: Option<MsiCapability>,
    pub(crate) inner: Mutex<DeviceIrqInner>,
    /// Serializes read-modify-write access to config-space registers shared
    /// across more than one handler slot: the PVM mask register in MSI mode.
    /// (The legacy path has exactly one slot, so its command-register RMW
    /// is serialized by that slot's own lock instead — see [`crate::legacy`].)
    pub(crate) cmd_lock: SpinLock<()>,
    plugged_in: AtomicBool,
}

impl DeviceIrqState {
    pub(crate) fn new(
        cfg: Arc<dyn PciCfgAccess>,
        platform: Arc<dyn PlatformIrq>,
        legacy_registry: Arc<LegacyRegistry>,
        legacy_pin: u8,
        msi_cap: Option<MsiCapability>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            platform,
            legacy_registry,
            legacy_pin,
            msi_cap,
            inner: Mutex::new(DeviceIrqInner {
                mode: IrqMode::Disabled,
                handlers: HandlerStorage::Empty,
                registered_handler_count: 0,
                legacy_dispatcher: None,
                msi_block: None,
            }),
            cmd_lock: SpinLock::new(()),
            plugged_in: AtomicBool::new(true),
        })
    }

    pub(crate) fn mark_unplugged(&self) {
        self.plugged_in.store(false, Ordering::Release);
    }

    pub(crate) fn require_plugged_in(&self) -> Result<()> {
        if self.plugged_in.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::BadState)
        }
    }

    /// Sets or clears the PVM mask bit for `vector`, serialized by
    /// [`Self::cmd_lock`] since the register is shared across every vector
    /// of the device. No-op if the device has no PVM register.
    pub(crate) fn set_pvm_bit(&self, vector: u32, mask: bool) {
        let Some(cap) = self.msi_cap else { return };
        if !cap.has_pvm {
            return;
        }
        let _guard = self.cmd_lock.lock();
        let offset = if cap.is64bit {
            msi_offset::PVM_MASK_64BIT
        } else {
            msi_offset::PVM_MASK_32BIT
        };
        let mut bits = self.cfg.read32(offset);
        if mask {
            bits |= 1 << vector;
        } else {
            bits &= !(1 << vector);
        }
        self.cfg.write32(offset, bits);
    }

    fn write_msi_control_enable(&self, enable: bool) {
        let control = self.cfg.read16(msi_offset::CONTROL);
        let new_control = if enable { control | 0x1 } else { control & !0x1 };
        self.cfg.write16(msi_offset::CONTROL, new_control);
    }

    fn write_msi_mme(&self, mme: u32) {
        let control = self.cfg.read16(msi_offset::CONTROL);
        let cleared = control & !(0b111 << 4);
        self.cfg
            .write16(msi_offset::CONTROL, cleared | ((mme as u16) << 4));
    }

    fn write_msi_address_data(&self, cap: MsiCapability, block: MsiBlock, zero: bool) {
        let (address, data) = if zero {
            (0u64, 0u32)
        } else {
            (block.target_address, block.target_data)
        };
        self.cfg
            .write32(msi_offset::ADDRESS_LOW, (address & 0xFFFF_FFFF) as u32);
        if cap.is64bit {
            self.cfg
                .write32(msi_offset::ADDRESS_HIGH_64BIT, (address >> 32) as u32);
        }
        let data_offset = if cap.is64bit {
            msi_offset::DATA_64BIT
        } else {
            msi_offset::DATA_32BIT
        };
        self.cfg.write16(data_offset, data as u16);
    }

    /// Masks every vector of `block` at the PVM register (if present) and
    /// the platform controller (if `block.supports_masking`), and marks
    /// every allocated handler slot masked to match.
    fn mask_all_msi_vectors(&self, handlers: &HandlerStorage, block: MsiBlock) {
        let has_pvm = self.msi_cap.is_some_and(|c| c.has_pvm);
        for i in 0..block.vector_count {
            if has_pvm {
                self.set_pvm_bit(i, true);
            }
            if block.supports_masking {
                self.platform.mask_unmask_msi(block, i, true);
            }
        }
        for i in 0..handlers.len() as u32 {
            if let Some(slot) = handlers.get(i) {
                slot.inner.lock().masked = true;
            }
        }
    }

    /// Enter-MSI step 4-5: disable at top level, mask every vector, program
    /// the address/data pair and the Multi-Message-Enable field.
    pub(crate) fn program_msi_registers(
        &self,
        handlers: &HandlerStorage,
        block: MsiBlock,
        cap: MsiCapability,
        requested_irqs: u32,
    ) {
        self.write_msi_control_enable(false);
        self.mask_all_msi_vectors(handlers, block);
        self.write_msi_address_data(cap, block, false);
        self.write_msi_mme(ceil_log2(requested_irqs).min(5));
    }

    /// The DISABLED-from-MSI teardown: zero address/data, mask every
    /// vector. The caller frees the block afterwards.
    pub(crate) fn teardown_msi_registers(&self, handlers: &HandlerStorage, block: MsiBlock) {
        self.write_msi_control_enable(false);
        if let Some(cap) = self.msi_cap {
            self.write_msi_address_data(cap, block, true);
        }
        self.mask_all_msi_vectors(handlers, block);
    }
}

/// `⌈log₂(n)⌉` for `n ≥ 1`, used to derive the Multi-Message-Enable value.
fn ceil_log2(n: u32) -> u32 {
    debug_assert!(n >= 1);
    32 - (n - 1).leading_zeros()
}

/// The sole routine that moves a device back to `DISABLED` (§4.4). Callers
/// must already be certain no future dispatch will touch this device's
/// handlers: for legacy, after [`SharedLegacyDispatcher::detach`]; for MSI,
/// after [`PlatformIrq::free_msi_block`] has returned (which itself must
/// drain in-flight handlers).
fn reset_bookkeeping(inner: &mut DeviceIrqInner) {
    inner.handlers = HandlerStorage::Empty;
    inner.registered_handler_count = 0;
    inner.mode = IrqMode::Disabled;
}

/// Executes the full DISABLED transition: the shared "leave, from any
/// mode" path used both by an explicit `set_mode(DISABLED)` and to unwind a
/// failed `set_mode(MSI, _)` partway through (§4.1).
///
/// Driven off which resources `inner` actually holds rather than off `mode`
/// alone, so it is also correct when called on a record whose `mode` hasn't
/// been flipped to `Msi` yet but which already owns an allocated block (the
/// handler-table-allocation failure path in [`enter_msi`]).
pub(crate) fn disable_locked(dev: &Arc<DeviceIrqState>, inner: &mut DeviceIrqInner) {
    if matches!(inner.mode, IrqMode::Legacy) {
        if let Some(slot) = inner.handlers.get(0) {
            let mut slot_inner = slot.inner.lock();
            dev.cfg
                .write_command(dev.cfg.read_command() | Command::INTERRUPT_DISABLE);
            slot_inner.masked = true;
        }
    }
    if let Some(dispatcher) = inner.legacy_dispatcher.take() {
        dispatcher.detach(dev);
    }

    if let Some(block) = inner.msi_block.take() {
        dev.teardown_msi_registers(&inner.handlers, block);
        // Must drain in-flight per-vector dispatches before returning.
        dev.platform.free_msi_block(block);
    }

    reset_bookkeeping(inner);
}

pub(crate) fn enter_legacy(
    dev: &Arc<DeviceIrqState>,
    inner: &mut DeviceIrqInner,
    requested_irqs: u32,
) -> Result<()> {
    if dev.legacy_pin == 0 || requested_irqs != 1 {
        return Err(Error::NotSupported);
    }

    let vector_id = dev.platform.legacy_vector_for_pin(dev.legacy_pin)?;
    let slot = HandlerSlot::new(0);

    inner.handlers = HandlerStorage::Singleton(slot.clone());
    inner.registered_handler_count = 0;
    inner.mode = IrqMode::Legacy;

    let dispatcher = dev
        .legacy_registry
        .find_or_create(vector_id, dev.platform.clone());
    dispatcher.attach(dev, slot);
    inner.legacy_dispatcher = Some(dispatcher);

    Ok(())
}

pub(crate) fn enter_msi(
    dev: &Arc<DeviceIrqState>,
    inner: &mut DeviceIrqInner,
    requested_irqs: u32,
) -> Result<()> {
    let cap = dev.msi_cap.ok_or(Error::NotSupported)?;
    if !dev.platform.supports_msi() {
        return Err(Error::NotSupported);
    }
    if requested_irqs > cap.max_irqs {
        return Err(Error::NotSupported);
    }

    // Step 1.
    let block = dev
        .platform
        .alloc_msi_block(requested_irqs, cap.is64bit, false)?;
    inner.msi_block = Some(block);

    // Step 2.
    let handlers = match build_handler_table(requested_irqs) {
        Ok(handlers) => handlers,
        Err(err) => {
            disable_locked(dev, inner);
            return Err(err);
        }
    };
    inner.handlers = handlers;
    inner.registered_handler_count = 0;

    // Step 3.
    inner.mode = IrqMode::Msi;

    // Steps 4-5.
    dev.program_msi_registers(&inner.handlers, block, cap, requested_irqs);

    // Step 6: only vectors with a corresponding handler slot get a callback;
    // any extra vectors in a rounded-up block stay platform-masked only.
    for i in 0..block.vector_count {
        let callback = inner
            .handlers
            .get(i)
            .map(|slot| crate::msi::make_callback(dev.clone(), slot.clone(), i, block));
        dev.platform.register_msi_handler(block, i, callback);
    }

    // Step 7.
    dev.write_msi_control_enable(true);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceil_log2_matches_power_of_two_boundaries() {
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(3), 2);
        assert_eq!(ceil_log2(4), 2);
        assert_eq!(ceil_log2(5), 3);
        assert_eq!(ceil_log2(8), 3);
        assert_eq!(ceil_log2(9), 4);
    }

    #[test]
    fn handler_storage_singleton_only_answers_irq_id_zero() {
        let slot = HandlerSlot::new(0);
        let storage = HandlerStorage::Singleton(slot);
        assert_eq!(storage.len(), 1);
        assert!(storage.get(0).is_some());
        assert!(storage.get(1).is_none());
    }

    #[test]
    fn build_handler_table_picks_singleton_for_one_irq() {
        let table = build_handler_table(1).unwrap();
        assert!(matches!(table, HandlerStorage::Singleton(_)));

        let table = build_handler_table(4).unwrap();
        assert!(matches!(table, HandlerStorage::Heap(_)));
        assert_eq!(table.len(), 4);
    }
}
