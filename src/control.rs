// SPDX-License-Identifier: MPL-2.0

//! The Driver-Facing Control Plane (C5): the five operations a driver calls
//! to query, enter, and service an interrupt mode — [`PciIrqManager`].

use alloc::sync::Arc;

use crate::cfg::{MsiCapability, PciCfgAccess};
use crate::device::{self, DeviceIrqState, HandlerCallback, IrqMode};
use crate::error::{Error, Result};
use crate::facade::PlatformIrq;
use crate::legacy::LegacyRegistry;
use crate::{legacy, msi};

/// What a mode offers, as returned by [`PciIrqManager::query_capabilities`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqCapabilities {
    pub supported: bool,
    pub max_irqs: u32,
    pub supports_masking: bool,
}

/// A snapshot of mode and handler-table occupancy, as returned by
/// [`PciIrqManager::get_mode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqModeInfo {
    pub mode: IrqMode,
    pub handler_count: u32,
    pub registered_handler_count: u32,
}

/// The driver-facing handle for one PCIe function's interrupt state.
///
/// Wraps the [`DeviceIrqState`] record (C2) and exposes the five control-
/// plane operations of §4.1. Every operation here acquires `dev_lock`
/// (the state's own inner mutex) for its entire duration; none of them may
/// be called from IRQ context.
pub struct PciIrqManager {
    state: Arc<DeviceIrqState>,
}

impl PciIrqManager {
    /// Constructs the manager for one function.
    ///
    /// `cfg` and `platform` are supplied by the caller (bus enumeration and
    /// the platform binding, respectively); `legacy_registry` is shared by
    /// every function on the bus so INTx sharing works across devices.
    /// `legacy_pin` is `0` if the device has no legacy pin; `msi_cap` is
    /// `None` if the device's capability list has no MSI capability.
    pub fn new(
        cfg: Arc<dyn PciCfgAccess>,
        platform: Arc<dyn PlatformIrq>,
        legacy_registry: Arc<LegacyRegistry>,
        legacy_pin: u8,
        msi_cap: Option<MsiCapability>,
    ) -> Self {
        Self {
            state: DeviceIrqState::new(cfg, platform, legacy_registry, legacy_pin, msi_cap),
        }
    }

    /// Marks the device unplugged. Subsequent operations other than masking
    /// and `set_mode(DISABLED)` fail with [`Error::BadState`]; a device
    /// becoming unplugged between lock release and a later lock acquire is
    /// surfaced the same way (§5, Cancellation/timeout).
    pub fn mark_unplugged(&self) {
        self.state.mark_unplugged();
    }

    /// Returns what `mode` offers on this device and platform.
    pub fn query_capabilities(&self, mode: IrqMode) -> Result<IrqCapabilities> {
        let _inner = self.state.inner.lock();
        self.state.require_plugged_in()?;

        match mode {
            IrqMode::Legacy => Ok(IrqCapabilities {
                supported: self.state.legacy_pin != 0,
                max_irqs: 1,
                supports_masking: true,
            }),
            IrqMode::Msi => {
                let supported = self.state.msi_cap.is_some() && self.state.platform.supports_msi();
                let max_irqs = self.state.msi_cap.map_or(0, |cap| cap.max_irqs);
                let supports_masking = self.state.msi_cap.is_some_and(|cap| cap.has_pvm)
                    || self.state.platform.supports_msi_masking();
                Ok(IrqCapabilities {
                    supported,
                    max_irqs,
                    supports_masking,
                })
            }
            IrqMode::MsiX => Err(Error::NotSupported),
            IrqMode::Disabled => Err(Error::InvalidArgs),
        }
    }

    /// A pure read of the current mode and handler-table occupancy.
    pub fn get_mode(&self) -> IrqModeInfo {
        let inner = self.state.inner.lock();
        IrqModeInfo {
            mode: inner.mode,
            handler_count: inner.handlers.len() as u32,
            registered_handler_count: inner.registered_handler_count,
        }
    }

    /// The only path that transitions `mode` (§4.1).
    ///
    /// Transitions between two active modes must go through `Disabled`
    /// first; entering a mode with `requested_irqs` greater than what the
    /// device/platform can provide fails without mutating any state.
    /// `requested_irqs` need not itself be a power of two for MSI: the
    /// platform may round the underlying block up, in which case any extra
    /// vectors beyond `requested_irqs` receive platform-level masking only
    /// and never get a registered handler.
    pub fn set_mode(&self, target: IrqMode, requested_irqs: u32) -> Result<()> {
        let mut inner = self.state.inner.lock();

        if target == IrqMode::Disabled {
            device::disable_locked(&self.state, &mut inner);
            return Ok(());
        }

        self.state.require_plugged_in()?;
        if inner.mode != IrqMode::Disabled {
            return Err(Error::BadState);
        }
        if requested_irqs == 0 {
            return Err(Error::InvalidArgs);
        }

        match target {
            IrqMode::Legacy => device::enter_legacy(&self.state, &mut inner, requested_irqs),
            IrqMode::Msi => device::enter_msi(&self.state, &mut inner, requested_irqs),
            IrqMode::MsiX => Err(Error::NotSupported),
            IrqMode::Disabled => unreachable!("handled above"),
        }
    }

    /// Installs (or, with `callback: None`, removes) the handler for
    /// `irq_id`. Precondition: `mode != Disabled` and `irq_id <
    /// handler_count`.
    pub fn register_handler(
        &self,
        irq_id: u32,
        callback: Option<HandlerCallback>,
        ctx: usize,
    ) -> Result<()> {
        let mut inner = self.state.inner.lock();
        self.state.require_plugged_in()?;
        if inner.mode == IrqMode::Disabled {
            return Err(Error::BadState);
        }
        if irq_id >= inner.handlers.len() as u32 {
            return Err(Error::InvalidArgs);
        }

        let slot = inner
            .handlers
            .get(irq_id)
            .expect("irq_id checked against handler_count above")
            .clone();

        let mut slot_inner = slot.inner.lock();
        let had_callback = slot_inner.callback.is_some();
        let has_callback = callback.is_some();
        slot_inner.callback = callback;
        // "when ctx would be stored with a null callback, force ctx to null"
        slot_inner.ctx = if has_callback { ctx } else { 0 };
        drop(slot_inner);

        match (had_callback, has_callback) {
            (false, true) => inner.registered_handler_count += 1,
            (true, false) => inner.registered_handler_count -= 1,
            _ => {}
        }

        Ok(())
    }

    /// Masks or unmasks `irq_id`. Masking a plugged-out device succeeds
    /// (needed for teardown); unmasking one fails [`Error::BadState`], as
    /// does unmasking a slot with no registered handler. Returns the
    /// previous value of `masked`.
    pub fn mask_unmask(&self, irq_id: u32, mask: bool) -> Result<bool> {
        let inner = self.state.inner.lock();
        if !mask {
            self.state.require_plugged_in()?;
        }
        if inner.mode == IrqMode::Disabled {
            return Err(Error::BadState);
        }
        if irq_id >= inner.handlers.len() as u32 {
            return Err(Error::InvalidArgs);
        }

        let slot = inner
            .handlers
            .get(irq_id)
            .expect("irq_id checked against handler_count above")
            .clone();

        match inner.mode {
            IrqMode::Legacy => legacy::mask_unmask(&self.state, &slot, mask),
            IrqMode::Msi => {
                let block = inner
                    .msi_block
                    .expect("invariant: mode == Msi implies msi_block is allocated");
                msi::mask_unmask(&self.state, &slot, block, mask)
            }
            IrqMode::MsiX => Err(Error::NotSupported),
            IrqMode::Disabled => unreachable!("checked above"),
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::cfg::{Command, MsiCapability, PciCfgAccess, Status};
    use crate::facade::{DispatchAction, MsiBlock, PlatformCallback, PlatformIrq};
    use crate::sync::Mutex;

    #[derive(Default)]
    struct FakeCfgInner {
        command: Command,
        status: Status,
        msi: [u32; 8],
        msi16: [u16; 8],
    }

    /// A `PciCfgAccess` over a plain byte-addressable scratch register file,
    /// good enough to exercise command/status races and MSI register
    /// programming without real hardware.
    struct FakeCfg {
        inner: Mutex<FakeCfgInner>,
    }

    impl FakeCfg {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: Mutex::new(FakeCfgInner::default()),
            })
        }

        fn assert_interrupt_disabled(&self, expected: bool) {
            assert_eq!(
                self.inner
                    .lock()
                    .command
                    .contains(Command::INTERRUPT_DISABLE),
                expected
            );
        }

        fn set_status_asserted(&self, asserted: bool) {
            let mut inner = self.inner.lock();
            inner.status.set(Status::INTERRUPT_STATUS, asserted);
        }
    }

    impl PciCfgAccess for FakeCfg {
        fn read_command(&self) -> Command {
            self.inner.lock().command
        }
        fn write_command(&self, command: Command) {
            self.inner.lock().command = command;
        }
        fn read_status(&self) -> Status {
            self.inner.lock().status
        }
        fn read16(&self, offset: u16) -> u16 {
            self.inner.lock().msi16[offset as usize / 2]
        }
        fn write16(&self, offset: u16, value: u16) {
            self.inner.lock().msi16[offset as usize / 2] = value;
        }
        fn read32(&self, offset: u16) -> u32 {
            self.inner.lock().msi[offset as usize / 4]
        }
        fn write32(&self, offset: u16, value: u32) {
            self.inner.lock().msi[offset as usize / 4] = value;
        }
    }

    /// A `PlatformIrq` that runs everything synchronously on the calling
    /// thread: `register_*_handler` just stashes the callback, and the test
    /// fires it back by calling `fire_legacy`/`fire_msi` directly.
    struct FakePlatform {
        supports_msi: bool,
        supports_msi_masking: bool,
        next_vector: AtomicU32,
        legacy_callback: Mutex<Option<PlatformCallback>>,
        legacy_masked: Mutex<bool>,
        msi_callbacks: Mutex<alloc::vec::Vec<Option<PlatformCallback>>>,
        msi_masked: Mutex<alloc::vec::Vec<bool>>,
        freed_blocks: Mutex<u32>,
    }

    impl FakePlatform {
        fn new(supports_msi: bool, supports_msi_masking: bool) -> Arc<Self> {
            Arc::new(Self {
                supports_msi,
                supports_msi_masking,
                next_vector: AtomicU32::new(100),
                legacy_callback: Mutex::new(None),
                legacy_masked: Mutex::new(true),
                msi_callbacks: Mutex::new(alloc::vec::Vec::new()),
                msi_masked: Mutex::new(alloc::vec::Vec::new()),
                freed_blocks: Mutex::new(0),
            })
        }

        fn fire_legacy(&self) -> DispatchAction {
            let callback = self.legacy_callback.lock().clone();
            callback.map_or(DispatchAction::NONE, |cb| cb())
        }

        fn fire_msi(&self, vector: u32) -> DispatchAction {
            let callback = self.msi_callbacks.lock()[vector as usize].clone();
            callback.map_or(DispatchAction::NONE, |cb| cb())
        }
    }

    impl PlatformIrq for FakePlatform {
        fn supports_msi(&self) -> bool {
            self.supports_msi
        }
        fn supports_msi_masking(&self) -> bool {
            self.supports_msi_masking
        }
        fn alloc_msi_block(&self, count: u32, _need_64bit: bool, _is_msix: bool) -> Result<MsiBlock> {
            let vector_count = count.next_power_of_two();
            let id = self.next_vector.fetch_add(vector_count, Ordering::SeqCst) as u64;
            *self.msi_callbacks.lock() = (0..vector_count).map(|_| None).collect();
            *self.msi_masked.lock() = alloc::vec![true; vector_count as usize];
            Ok(MsiBlock {
                id,
                vector_count,
                target_address: 0xFEE0_0000,
                target_data: 0x30,
                supports_masking: self.supports_msi_masking,
            })
        }
        fn free_msi_block(&self, _block: MsiBlock) {
            *self.freed_blocks.lock() += 1;
            self.msi_callbacks.lock().clear();
        }
        fn register_msi_handler(&self, _block: MsiBlock, index: u32, callback: Option<PlatformCallback>) {
            self.msi_callbacks.lock()[index as usize] = callback;
        }
        fn mask_unmask_msi(&self, _block: MsiBlock, index: u32, mask: bool) {
            self.msi_masked.lock()[index as usize] = mask;
        }
        fn legacy_vector_for_pin(&self, _pin: u8) -> Result<u64> {
            Ok(17)
        }
        fn mask_vector(&self, _vector: u64) {
            *self.legacy_masked.lock() = true;
        }
        fn unmask_vector(&self, _vector: u64) {
            *self.legacy_masked.lock() = false;
        }
        fn register_int_handler(&self, _vector: u64, callback: Option<PlatformCallback>) {
            *self.legacy_callback.lock() = callback;
        }
    }

    fn manager_legacy(cfg: Arc<FakeCfg>, platform: Arc<FakePlatform>) -> PciIrqManager {
        PciIrqManager::new(cfg, platform, LegacyRegistry::new(), 2, None)
    }

    fn manager_msi(cfg: Arc<FakeCfg>, platform: Arc<FakePlatform>, max_irqs: u32) -> PciIrqManager {
        PciIrqManager::new(
            cfg,
            platform,
            LegacyRegistry::new(),
            0,
            Some(MsiCapability {
                is64bit: true,
                max_irqs,
                has_pvm: true,
            }),
        )
    }

    // --- scenario 1 ---

    #[test]
    fn legacy_end_to_end() {
        let cfg = FakeCfg::new();
        let platform = FakePlatform::new(false, false);
        let irq = manager_legacy(cfg.clone(), platform.clone());

        let caps = irq.query_capabilities(IrqMode::Legacy).unwrap();
        assert_eq!(caps, IrqCapabilities { supported: true, max_irqs: 1, supports_masking: true });

        irq.set_mode(IrqMode::Legacy, 1).unwrap();
        cfg.assert_interrupt_disabled(true); // attach defensively masks
        assert!(!*platform.legacy_masked.lock()); // but unmasks the system vector

        let fired = Arc::new(AtomicU32::new(0));
        {
            let fired = fired.clone();
            irq.register_handler(
                0,
                Some(Arc::new(move |_dev, irq_id, _ctx| {
                    assert_eq!(irq_id, 0);
                    fired.fetch_add(1, Ordering::SeqCst);
                    DispatchAction::MASK
                })),
                0,
            )
            .unwrap();
        }
        irq.mask_unmask(0, false).unwrap();
        cfg.assert_interrupt_disabled(false);

        cfg.set_status_asserted(true);
        let action = platform.fire_legacy();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(action, DispatchAction::NONE);
        cfg.assert_interrupt_disabled(true); // handler returned MASK
    }

    // --- scenario 2 ---

    #[test]
    fn two_devices_share_a_legacy_vector() {
        let cfg_a = FakeCfg::new();
        let cfg_b = FakeCfg::new();
        let platform = FakePlatform::new(false, false);
        let registry = LegacyRegistry::new();

        let dev_a = PciIrqManager::new(cfg_a, platform.clone(), registry.clone(), 2, None);
        let dev_b = PciIrqManager::new(cfg_b, platform.clone(), registry.clone(), 2, None);

        dev_a.set_mode(IrqMode::Legacy, 1).unwrap();
        assert!(!*platform.legacy_masked.lock());
        dev_b.set_mode(IrqMode::Legacy, 1).unwrap();
        assert!(!*platform.legacy_masked.lock());

        dev_a.set_mode(IrqMode::Disabled, 0).unwrap();
        assert!(!*platform.legacy_masked.lock(), "vector stays unmasked while dev_b remains attached");

        dev_b.set_mode(IrqMode::Disabled, 0).unwrap();
        assert!(*platform.legacy_masked.lock(), "vector masks once the last device detaches");
    }

    // --- scenarios 3-4 ---

    #[test]
    fn msi_enter_programs_registers_in_order_and_dispatches() {
        let cfg = FakeCfg::new();
        let platform = FakePlatform::new(true, true);
        let irq = manager_msi(cfg.clone(), platform.clone(), 8);

        irq.set_mode(IrqMode::Msi, 4).unwrap();

        let info = irq.get_mode();
        assert_eq!(info.mode, IrqMode::Msi);
        assert_eq!(info.handler_count, 4);

        {
            let c = cfg.inner.lock();
            assert_eq!(c.msi[1], 0xFEE0_0000); // address-low
            assert_eq!(c.msi[2], 0); // address-high
            assert_eq!(c.msi16[6], 0x30); // data, 64-bit offset 0xC / 2 == 6
        }
        let control = cfg.inner.lock().msi16[1];
        assert_eq!((control >> 4) & 0b111, 2, "MME == ceil(log2(4))");

        for i in 0..4 {
            irq.register_handler(i, Some(Arc::new(|_d, _id, _c| DispatchAction::NONE)), 0)
                .unwrap();
        }
        irq.mask_unmask(2, false).unwrap();

        let action = platform.fire_msi(2);
        assert_eq!(action, DispatchAction::NONE);
        assert!(!platform.msi_masked.lock()[2], "handler didn't ask to stay masked");
    }

    #[test]
    fn msi_requires_disable_before_reentry() {
        let cfg = FakeCfg::new();
        let platform = FakePlatform::new(true, true);
        let irq = manager_msi(cfg, platform, 8);

        irq.set_mode(IrqMode::Msi, 4).unwrap();
        assert_eq!(irq.set_mode(IrqMode::Msi, 2), Err(Error::BadState));

        irq.set_mode(IrqMode::Disabled, 0).unwrap();
        irq.set_mode(IrqMode::Msi, 2).unwrap();
        assert_eq!(irq.get_mode().handler_count, 2);
    }

    // --- boundary behaviours ---

    #[test]
    fn legacy_rejects_more_than_one_irq() {
        let cfg = FakeCfg::new();
        let platform = FakePlatform::new(false, false);
        let irq = manager_legacy(cfg, platform);
        assert_eq!(irq.set_mode(IrqMode::Legacy, 2), Err(Error::NotSupported));
        assert_eq!(irq.get_mode().mode, IrqMode::Disabled);
    }

    #[test]
    fn msi_rejects_more_than_max_irqs() {
        let cfg = FakeCfg::new();
        let platform = FakePlatform::new(true, true);
        let irq = manager_msi(cfg, platform, 4);
        assert_eq!(irq.set_mode(IrqMode::Msi, 5), Err(Error::NotSupported));
        assert_eq!(irq.get_mode().mode, IrqMode::Disabled);
    }

    #[test]
    fn register_handler_rejects_out_of_range_irq_id() {
        let cfg = FakeCfg::new();
        let platform = FakePlatform::new(false, false);
        let irq = manager_legacy(cfg, platform);
        irq.set_mode(IrqMode::Legacy, 1).unwrap();
        assert_eq!(
            irq.register_handler(1, Some(Arc::new(|_, _, _| DispatchAction::NONE)), 0),
            Err(Error::InvalidArgs)
        );
    }

    #[test]
    fn unmask_without_handler_fails_bad_state() {
        let cfg = FakeCfg::new();
        let platform = FakePlatform::new(false, false);
        let irq = manager_legacy(cfg, platform);
        irq.set_mode(IrqMode::Legacy, 1).unwrap();
        assert_eq!(irq.mask_unmask(0, false), Err(Error::BadState));
    }

    #[test]
    fn masking_without_any_mask_mechanism_fails_not_supported_but_unmask_succeeds() {
        let cfg = FakeCfg::new();
        // No PVM, and the platform doesn't support MSI masking either.
        let platform = FakePlatform::new(true, false);
        let irq = PciIrqManager::new(
            cfg,
            platform,
            LegacyRegistry::new(),
            0,
            Some(MsiCapability { is64bit: false, max_irqs: 1, has_pvm: false }),
        );
        irq.set_mode(IrqMode::Msi, 1).unwrap();
        irq.register_handler(0, Some(Arc::new(|_, _, _| DispatchAction::NONE)), 0)
            .unwrap();
        assert_eq!(irq.mask_unmask(0, true), Err(Error::NotSupported));
        assert_eq!(irq.mask_unmask(0, false), Ok(true)); // every vector starts masked
    }

    #[test]
    fn mask_then_unmask_round_trips() {
        let cfg = FakeCfg::new();
        let platform = FakePlatform::new(false, false);
        let irq = manager_legacy(cfg, platform);
        irq.set_mode(IrqMode::Legacy, 1).unwrap();
        irq.register_handler(0, Some(Arc::new(|_, _, _| DispatchAction::NONE)), 0)
            .unwrap();

        let was_masked_before = irq.mask_unmask(0, false).unwrap();
        let previous = irq.mask_unmask(0, true).unwrap();
        assert_eq!(previous, false);
        let restored = irq.mask_unmask(0, false).unwrap();
        assert_eq!(restored, true);
        let _ = was_masked_before;
    }

    #[test]
    fn mask_on_unplugged_device_succeeds_but_unmask_fails() {
        let cfg = FakeCfg::new();
        let platform = FakePlatform::new(false, false);
        let irq = manager_legacy(cfg, platform);
        irq.set_mode(IrqMode::Legacy, 1).unwrap();
        irq.register_handler(0, Some(Arc::new(|_, _, _| DispatchAction::NONE)), 0)
            .unwrap();

        irq.mark_unplugged();
        assert!(irq.mask_unmask(0, true).is_ok());
        assert_eq!(irq.mask_unmask(0, false), Err(Error::BadState));
        assert_eq!(irq.set_mode(IrqMode::Disabled, 0), Ok(()));
    }

    #[test]
    fn disabled_is_idempotent_and_frees_resources() {
        let cfg = FakeCfg::new();
        let platform = FakePlatform::new(true, true);
        let irq = manager_msi(cfg, platform.clone(), 8);

        irq.set_mode(IrqMode::Msi, 4).unwrap();
        irq.set_mode(IrqMode::Disabled, 0).unwrap();
        assert_eq!(*platform.freed_blocks.lock(), 1);
        irq.set_mode(IrqMode::Disabled, 0).unwrap();
        assert_eq!(*platform.freed_blocks.lock(), 1, "second DISABLED is a no-op");
        assert_eq!(irq.get_mode().mode, IrqMode::Disabled);
        assert_eq!(irq.get_mode().handler_count, 0);
    }
}
