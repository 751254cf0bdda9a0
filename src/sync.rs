// SPDX-License-Identifier: MPL-2.0

//! Lock aliases naming the two roles fixed by the crate's lock hierarchy
//! (§5): which locks may block (`Mutex`) versus which must be safe to
//! acquire from IRQ context and are only ever held across non-blocking code
//! (`SpinLock`). Both wrap [`spin::Mutex`] — the distinction here is
//! advisory, mirroring how the host kernel framework splits its own
//! `sync::Mutex` from `sync::SpinLock` even though both are spin-based at
//! the bottom.

pub(crate) type Mutex<T> = spin::Mutex<T>;
pub(crate) type SpinLock<T> = spin::Mutex<T>;
