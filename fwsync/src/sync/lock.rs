// SPDX-License-Identifier: MPL-2.0

//! The lock state machine.
//!
//! A [`Lock`] packs its whole observable state into one machine word so that
//! acquisition is a single compare-exchange and release is a single store.
//! Everything else on the struct is diagnostic bookkeeping owned by whichever
//! processor currently holds the lock.

use core::cell::UnsafeCell;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use intrusive_collections::{intrusive_adapter, LinkedListLink};

use crate::cpu::CpuId;

/// An exclusive spin lock guarding one shared firmware resource.
///
/// Locks are constructed once, before multiprocessor bring-up, and live for
/// the life of the firmware. All acquire/release traffic goes through
/// [`LockDomain`](super::LockDomain); the type itself only exposes the
/// queries that are safe to answer from raw state.
pub struct Lock {
    /// Bit 0: held. Bits 32..: the holder's processor id, meaningful only
    /// while bit 0 is set. Free is the all-zero word.
    state: AtomicU64,
    /// Whether this lock sits on the critical path of console output.
    /// Fixed at construction.
    in_con_path: bool,
    /// Name of the acquiring call site, for held-lock dumps. Written only by
    /// the holding processor; `None` while free.
    owner_tag: UnsafeCell<Option<&'static str>>,
    /// Membership in the holder's held-lock list; unlinked while free.
    pub(crate) held_link: LinkedListLink,
}

// SAFETY: `state` is only ever mutated through its atomic operations.
// `owner_tag` and `held_link` are touched only by the processor that holds
// the lock, and successive holders are ordered by the acquire/release
// transitions of `state`.
unsafe impl Send for Lock {}
unsafe impl Sync for Lock {}

intrusive_adapter!(pub(crate) HeldLocksAdapter = &'static Lock: Lock { held_link: LinkedListLink });

const HELD: u64 = 1;
const OWNER_SHIFT: u32 = 32;

const fn held_by_word(owner: CpuId) -> u64 {
    ((owner.as_u32() as u64) << OWNER_SHIFT) | HELD
}

impl Lock {
    /// Creates a free lock.
    pub const fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
            in_con_path: false,
            owner_tag: UnsafeCell::new(None),
            held_link: LinkedListLink::new(),
        }
    }

    /// Creates a free lock whose held interval must coincide with console
    /// output being suspended on the holder.
    pub const fn new_in_console_path() -> Self {
        Self {
            state: AtomicU64::new(0),
            in_con_path: true,
            owner_tag: UnsafeCell::new(None),
            held_link: LinkedListLink::new(),
        }
    }

    /// Whether the calling processor currently holds this lock.
    pub fn held_by(&self, me: CpuId) -> bool {
        self.state.load(Ordering::Relaxed) == held_by_word(me)
    }

    pub(crate) fn in_console_path(&self) -> bool {
        self.in_con_path
    }

    /// Whether any processor currently holds this lock. Point-in-time
    /// answer; the state may change before the caller acts on it.
    pub fn is_held(&self) -> bool {
        self.state.load(Ordering::Relaxed) & HELD != 0
    }

    /// The processor currently holding the lock, if any.
    pub(crate) fn holder(&self) -> Option<CpuId> {
        let state = self.state.load(Ordering::Relaxed);
        if state & HELD != 0 {
            Some(CpuId::new((state >> OWNER_SHIFT) as u32))
        } else {
            None
        }
    }

    pub(crate) fn raw_state(&self) -> u64 {
        self.state.load(Ordering::Relaxed)
    }

    /// One compare-exchange from free to held-by-`me`. Acquire ordering on
    /// success makes the holder's subsequent reads observe the data the lock
    /// protects.
    pub(crate) fn raw_try_acquire(&self, me: CpuId) -> bool {
        self.state
            .compare_exchange(0, held_by_word(me), Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Clears the state word. Release ordering pairs with the acquire
    /// compare-exchange of the next holder.
    pub(crate) fn raw_release(&self) {
        self.state.store(0, Ordering::Release);
    }

    /// Reads the diagnostic owner tag.
    ///
    /// # Safety
    ///
    /// The caller must be the processor holding the lock; only the holder may
    /// observe the tag without racing a concurrent write.
    pub(crate) unsafe fn tag(&self) -> Option<&'static str> {
        // SAFETY: per the function contract, no concurrent writer exists.
        unsafe { *self.owner_tag.get() }
    }

    /// Writes the diagnostic owner tag.
    ///
    /// # Safety
    ///
    /// The caller must be the processor holding the lock.
    pub(crate) unsafe fn set_tag(&self, tag: Option<&'static str>) {
        // SAFETY: per the function contract, the holder has exclusive access.
        unsafe { *self.owner_tag.get() = tag }
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("state", &self.raw_state())
            .field("in_con_path", &self.in_con_path)
            .finish_non_exhaustive()
    }
}
