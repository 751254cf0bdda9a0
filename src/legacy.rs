// SPDX-License-Identifier: MPL-2.0

//! The Shared Legacy Dispatcher (C3): one instance per system-level INTx
//! vector, multiplexing a single platform IRQ across every PCIe function
//! wired to it.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::cfg::{Command, Status};
use crate::device::{DeviceIrqState, HandlerSlot};
use crate::error::{Error, Result};
use crate::facade::{DispatchAction, PlatformCallback, PlatformIrq};
use crate::sync::{Mutex, SpinLock};

/// The control-plane half of legacy masking (`PciIrqManager::mask_unmask`,
/// §4.1): set or clear the INT_DISABLE bit under the slot lock (the same
/// lock `dispatch` uses), serializing against a concurrent dispatch of the
/// same device. Returns the previous value of `masked`.
pub(crate) fn mask_unmask(
    dev: &Arc<DeviceIrqState>,
    slot: &Arc<HandlerSlot>,
    mask: bool,
) -> Result<bool> {
    let mut slot_inner = slot.inner.lock();
    if !mask && slot_inner.callback.is_none() {
        return Err(Error::BadState);
    }
    let previous = slot_inner.masked;
    let command = dev.cfg.read_command();
    let new_command = if mask {
        command | Command::INTERRUPT_DISABLE
    } else {
        command & !Command::INTERRUPT_DISABLE
    };
    dev.cfg.write_command(new_command);
    slot_inner.masked = mask;
    Ok(previous)
}

/// One device attached to a [`SharedLegacyDispatcher`]: the device itself
/// (to read its command/status registers) and its singleton handler slot,
/// held directly so `dispatch` never needs `dev_lock`.
struct LegacyMember {
    device: Arc<DeviceIrqState>,
    slot: Arc<HandlerSlot>,
}

/// Multiplexes one system INTx vector across every device sharing it.
///
/// Created on demand by [`LegacyRegistry::find_or_create`] and kept alive by
/// the registry for as long as the registry itself exists — see the module
/// doc on [`LegacyRegistry`] for why this implementation keeps it that
/// simple rather than reference-counting the dispatcher away.
pub struct SharedLegacyDispatcher {
    vector_id: u64,
    platform: Arc<dyn PlatformIrq>,
    /// The IRQ-safe `list_lock` of §5's lock hierarchy (level 4).
    list_lock: SpinLock<Vec<LegacyMember>>,
}

impl SharedLegacyDispatcher {
    /// Attaches `dev` (whose singleton slot is `slot`), defensively masking
    /// it first, and unmasks the platform vector if the list was empty.
    pub(crate) fn attach(&self, dev: &Arc<DeviceIrqState>, slot: Arc<HandlerSlot>) {
        let mut list = self.list_lock.lock();
        {
            let mut slot_inner = slot.inner.lock();
            dev.cfg
                .write_command(dev.cfg.read_command() | Command::INTERRUPT_DISABLE);
            slot_inner.masked = true;
        }
        list.push(LegacyMember {
            device: dev.clone(),
            slot,
        });
        if list.len() == 1 {
            self.platform.unmask_vector(self.vector_id);
        }
    }

    /// Detaches `dev`, defensively re-masking it, and masks the platform
    /// vector if the list becomes empty. A no-op if `dev` is not attached.
    pub(crate) fn detach(&self, dev: &Arc<DeviceIrqState>) {
        let mut list = self.list_lock.lock();
        if let Some(pos) = list.iter().position(|m| Arc::ptr_eq(&m.device, dev)) {
            let member = list.remove(pos);
            let mut slot_inner = member.slot.inner.lock();
            dev.cfg
                .write_command(dev.cfg.read_command() | Command::INTERRUPT_DISABLE);
            slot_inner.masked = true;
        }
        if list.is_empty() {
            self.platform.mask_vector(self.vector_id);
        }
    }

    /// Invoked by the platform in IRQ context for this system vector.
    /// Services every attached device in list-insertion order; never
    /// blocks and never leaves the list lock held across a call that can.
    pub(crate) fn dispatch(&self) -> DispatchAction {
        let list = self.list_lock.lock();

        if list.is_empty() {
            log::warn!("spurious legacy interrupt on vector {}", self.vector_id);
            self.platform.mask_vector(self.vector_id);
            return DispatchAction::NONE;
        }

        let mut action = DispatchAction::NONE;
        for member in list.iter() {
            let dev = &member.device;
            let status = dev.cfg.read_status();
            let command = dev.cfg.read_command();
            if !(status.contains(Status::INTERRUPT_STATUS)
                && !command.contains(Command::INTERRUPT_DISABLE))
            {
                continue;
            }

            let mut slot_inner = member.slot.inner.lock();
            let mut should_mask = true;
            if !slot_inner.masked {
                if let Some(callback) = slot_inner.callback.clone() {
                    let ctx = slot_inner.ctx;
                    let result = callback(dev, 0, ctx);
                    should_mask = result.wants_mask();
                    if result.wants_resched() {
                        action |= DispatchAction::RESCHED;
                    }
                }
            }

            if should_mask {
                dev.cfg
                    .write_command(dev.cfg.read_command() | Command::INTERRUPT_DISABLE);
                slot_inner.masked = true;
            } else {
                slot_inner.masked = false;
            }
        }

        action
    }
}

/// The bus-driver registry of [`SharedLegacyDispatcher`]s, indexed by
/// system vector id.
///
/// Design note: the spec frames a dispatcher's lifetime as reference-
/// counted, destroyed when the last holder drops it. This implementation
/// instead has the registry hold a permanent [`Arc`] once a dispatcher is
/// created — it is masked rather than torn down when its device list empties
/// — which keeps the platform handler registration (itself not cheaply
/// reversible on every platform) a one-time cost per vector and matches how
/// the bus driver that owns this registry outlives every device rescan.
pub struct LegacyRegistry {
    dispatchers: Mutex<BTreeMap<u64, Arc<SharedLegacyDispatcher>>>,
}

impl LegacyRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            dispatchers: Mutex::new(BTreeMap::new()),
        })
    }

    /// Returns the dispatcher for `vector_id`, creating it (masked, with
    /// its platform handler installed) on first use.
    pub(crate) fn find_or_create(
        &self,
        vector_id: u64,
        platform: Arc<dyn PlatformIrq>,
    ) -> Arc<SharedLegacyDispatcher> {
        let mut dispatchers = self.dispatchers.lock();
        if let Some(existing) = dispatchers.get(&vector_id) {
            return existing.clone();
        }

        let dispatcher = Arc::new(SharedLegacyDispatcher {
            vector_id,
            platform: platform.clone(),
            list_lock: SpinLock::new(Vec::new()),
        });

        platform.mask_vector(vector_id);
        let callback: PlatformCallback = {
            let dispatcher = dispatcher.clone();
            Arc::new(move || dispatcher.dispatch())
        };
        platform.register_int_handler(vector_id, Some(callback));

        dispatchers.insert(vector_id, dispatcher.clone());
        dispatcher
    }
}

impl Default for LegacyRegistry {
    fn default() -> Self {
        // `new` returns an `Arc` because every caller needs shared
        // ownership; `Default` is provided only to satisfy the usual
        // clippy/derive expectation and constructs the same empty map.
        Self {
            dispatchers: Mutex::new(BTreeMap::new()),
        }
    }
}
