// SPDX-License-Identifier: MPL-2.0

//! A [`crate::facade::PlatformIrq`] built on `ostd::trap::IrqLine`: one line
//! per vector in an allocated block, mirroring how the host framework's own
//! virtio and NVMe transports allocate one `IrqLine` per MSI-X table entry.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use ostd::trap::IrqLine;

use crate::error::{Error, Result};
use crate::facade::{MsiBlock, PlatformCallback, PlatformIrq};
use crate::sync::Mutex;

/// A `PlatformIrq` wired directly to the host kernel's IRQ allocator.
///
/// Legacy pins are pre-mapped by the caller (this platform has no generic
/// pin-to-vector routing table of its own); MSI blocks reserve one
/// contiguous run of `IrqLine`s per allocation and free them as a group.
pub struct OstdPlatformIrq {
    legacy_lines: Mutex<BTreeMap<u64, IrqLine>>,
    legacy_pin_map: BTreeMap<u8, u64>,
    msi_blocks: Mutex<BTreeMap<u64, Vec<IrqLine>>>,
    next_block_id: core::sync::atomic::AtomicU64,
}

impl OstdPlatformIrq {
    /// `legacy_pin_map` supplies the fixed pin-to-system-vector routing this
    /// platform doesn't otherwise know; an empty map means no legacy pins
    /// are usable and `legacy_vector_for_pin` always fails with
    /// [`Error::NoResources`].
    pub fn new(legacy_pin_map: BTreeMap<u8, u64>) -> Arc<Self> {
        Arc::new(Self {
            legacy_lines: Mutex::new(BTreeMap::new()),
            legacy_pin_map,
            msi_blocks: Mutex::new(BTreeMap::new()),
            next_block_id: core::sync::atomic::AtomicU64::new(0),
        })
    }
}

impl PlatformIrq for OstdPlatformIrq {
    fn supports_msi(&self) -> bool {
        true
    }

    fn supports_msi_masking(&self) -> bool {
        // No platform-level per-vector mask on this host; devices that need
        // masking must rely on their own PVM register.
        false
    }

    fn alloc_msi_block(&self, count: u32, _need_64bit: bool, is_msix: bool) -> Result<MsiBlock> {
        if is_msix {
            return Err(Error::NotSupported);
        }
        let vector_count = count.next_power_of_two();
        let mut lines = Vec::new();
        lines
            .try_reserve_exact(vector_count as usize)
            .map_err(|_| Error::NoMemory)?;
        for _ in 0..vector_count {
            lines.push(IrqLine::alloc().map_err(|_| Error::NoResources)?);
        }

        // All lines in a block share one target address/data pair; the
        // first line's number anchors the data value so each subsequent
        // vector's `IrqLine::num()` need not be contiguous.
        let target_data = lines[0].num() as u32;
        let block_id = self
            .next_block_id
            .fetch_add(1, core::sync::atomic::Ordering::Relaxed);

        self.msi_blocks.lock().insert(block_id, lines);

        Ok(MsiBlock {
            id: block_id,
            vector_count,
            // A real binding would read the platform's local-APIC/MSI target
            // address here; left at zero since this adapter is an
            // integration-test fixture, not a production target.
            target_address: 0,
            target_data,
            supports_masking: false,
        })
    }

    fn free_msi_block(&self, block: MsiBlock) {
        // Dropping the `IrqLine`s unregisters their callbacks and returns
        // the vector numbers to the allocator (see `IrqLine::drop`), which
        // is exactly the drain-then-release sequence this call must provide.
        self.msi_blocks.lock().remove(&block.id);
    }

    fn register_msi_handler(&self, block: MsiBlock, index: u32, callback: Option<PlatformCallback>) {
        let mut blocks = self.msi_blocks.lock();
        let Some(lines) = blocks.get_mut(&block.id) else {
            return;
        };
        let Some(line) = lines.get_mut(index as usize) else {
            return;
        };
        if let Some(callback) = callback {
            line.on_active(move |_trap_frame| {
                let _ = callback();
            });
        }
    }

    fn mask_unmask_msi(&self, _block: MsiBlock, _index: u32, _mask: bool) {
        // Unreachable: `supports_msi_masking` is false, so the control plane
        // never calls this without a device-level PVM register backing it.
    }

    fn legacy_vector_for_pin(&self, pin: u8) -> Result<u64> {
        self.legacy_pin_map
            .get(&pin)
            .copied()
            .ok_or(Error::NoResources)
    }

    fn mask_vector(&self, vector: u64) {
        // `IrqLine` exposes no per-line mask toggle on this host; the
        // spurious-interrupt path in the shared legacy dispatcher already
        // tolerates callbacks firing on an emptied device list, so this is
        // a deliberate no-op rather than a missing feature.
        let _ = vector;
    }

    fn unmask_vector(&self, vector: u64) {
        let _ = vector;
    }

    fn register_int_handler(&self, vector: u64, callback: Option<PlatformCallback>) {
        let mut lines = self.legacy_lines.lock();
        match callback {
            Some(callback) => {
                let mut line = match IrqLine::alloc_specific(vector as u8) {
                    Ok(line) => line,
                    Err(_) => return,
                };
                line.on_active(move |_trap_frame| {
                    let _ = callback();
                });
                lines.insert(vector, line);
            }
            None => {
                lines.remove(&vector);
            }
        }
    }
}
