// SPDX-License-Identifier: MPL-2.0

//! The MSI Dispatcher (C4): the per-vector leaf dispatcher the platform
//! invokes for each vector of an allocated MSI block.

use alloc::sync::Arc;

use crate::device::{DeviceIrqState, HandlerSlot};
use crate::error::{Error, Result};
use crate::facade::{DispatchAction, MsiBlock, PlatformCallback};

/// The control-plane half of MSI masking (`PciIrqManager::mask_unmask`,
/// §4.1): set or clear `irq_id`'s mask outside of IRQ context. Returns the
/// previous value of `masked`.
pub(crate) fn mask_unmask(
    dev: &Arc<DeviceIrqState>,
    slot: &Arc<HandlerSlot>,
    block: MsiBlock,
    mask: bool,
) -> Result<bool> {
    let has_pvm = dev.msi_cap.is_some_and(|c| c.has_pvm);
    let masking_supported = has_pvm || block.supports_masking;
    if mask && !masking_supported {
        return Err(Error::NotSupported);
    }

    let mut slot_inner = slot.inner.lock();
    if !mask && slot_inner.callback.is_none() {
        return Err(Error::BadState);
    }

    let previous = slot_inner.masked;
    if has_pvm {
        dev.set_pvm_bit(slot.irq_id(), mask);
    }
    if block.supports_masking {
        dev.platform.mask_unmask_msi(block, slot.irq_id(), mask);
    }
    slot_inner.masked = mask;
    Ok(previous)
}

/// Builds the platform callback installed for one vector of an MSI block at
/// `set_mode(MSI, _)` time (§4.1 step 6). The closure owns everything
/// [`dispatch_vector`] needs, so the platform never has to call back
/// through `dev_lock`.
pub(crate) fn make_callback(
    dev: Arc<DeviceIrqState>,
    slot: Arc<HandlerSlot>,
    vector_index: u32,
    block: MsiBlock,
) -> PlatformCallback {
    Arc::new(move || dispatch_vector(&dev, &slot, vector_index, block))
}

/// Invoked by the platform in IRQ context for one vector of an MSI block.
fn dispatch_vector(
    dev: &Arc<DeviceIrqState>,
    slot: &Arc<HandlerSlot>,
    vector_index: u32,
    block: MsiBlock,
) -> DispatchAction {
    let has_pvm = dev.msi_cap.is_some_and(|c| c.has_pvm);
    let masking_supported = has_pvm || block.supports_masking;

    let mut slot_inner = slot.inner.lock();
    // "Previous masked is definitionally false" when nothing can mask this
    // vector — the stored flag is meaningless in that case.
    let was_masked = masking_supported && slot_inner.masked;

    if masking_supported {
        if has_pvm {
            dev.set_pvm_bit(vector_index, true);
        }
        if block.supports_masking {
            dev.platform.mask_unmask_msi(block, vector_index, true);
        }
        slot_inner.masked = true;
    }

    if was_masked || slot_inner.callback.is_none() {
        return DispatchAction::NONE;
    }

    let callback = slot_inner.callback.clone().expect("checked above");
    let ctx = slot_inner.ctx;
    drop(slot_inner);

    let result = callback(dev, slot.irq_id(), ctx);

    if !result.wants_mask() {
        let mut slot_inner = slot.inner.lock();
        if masking_supported {
            if has_pvm {
                dev.set_pvm_bit(vector_index, false);
            }
            if block.supports_masking {
                dev.platform.mask_unmask_msi(block, vector_index, false);
            }
        }
        slot_inner.masked = false;
    }

    if result.wants_resched() {
        DispatchAction::RESCHED
    } else {
        DispatchAction::NONE
    }
}
