// SPDX-License-Identifier: MPL-2.0

//! Per-processor descriptors and their registry.
//!
//! One [`Cpu`] exists per physical hardware thread, created at boot
//! discovery and alive for the life of the firmware. The fields here are the
//! subset of the processor descriptor owned by the lock subsystem: the
//! pending-request pointer the deadlock detector walks, the held-lock list
//! used for diagnostics and forced recovery, and the console suspend depth.
//!
//! Writer discipline: every field is mutated only by its owning processor.
//! `pending_request` is additionally read, but never written, by other
//! processors while they walk the wait-for graph under the detector lock.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU8, Ordering};

use intrusive_collections::LinkedList;

use crate::sync::{HeldLocksAdapter, Lock};

/// Unique id of one hardware execution thread in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuId(u32);

impl CpuId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Execution state of a processor.
///
/// Only processors past early bring-up participate in deadlock detection;
/// before that their lock bookkeeping is not yet meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CpuState {
    /// Still in early boot; exempt from deadlock detection.
    EarlyBoot = 0,
    /// Running firmware code after bring-up.
    Active = 1,
    /// Running the operating system.
    Os = 2,
}

impl CpuState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Active,
            2 => Self::Os,
            _ => Self::EarlyBoot,
        }
    }
}

/// Lock-subsystem state of one processor.
pub struct Cpu {
    id: CpuId,
    state: AtomicU8,
    /// The lock this processor is currently blocked trying to acquire, or
    /// null. Only `&'static Lock` pointers are ever stored here, which is
    /// what makes the deadlock detector's dereference sound.
    pending_request: AtomicPtr<Lock>,
    /// Locks currently held, in acquisition order (front = oldest).
    held_locks: spin::Mutex<LinkedList<HeldLocksAdapter>>,
    /// Number of held console-critical locks. Console output must stay
    /// withheld while nonzero.
    con_suspend: AtomicU32,
    /// A console flush was deferred and must be serviced when `con_suspend`
    /// returns to zero.
    con_need_flush: AtomicBool,
}

impl Cpu {
    fn new(id: CpuId) -> Self {
        Self {
            id,
            state: AtomicU8::new(CpuState::EarlyBoot as u8),
            pending_request: AtomicPtr::new(core::ptr::null_mut()),
            held_locks: spin::Mutex::new(LinkedList::new(HeldLocksAdapter::new())),
            con_suspend: AtomicU32::new(0),
            con_need_flush: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> CpuId {
        self.id
    }

    pub fn state(&self) -> CpuState {
        CpuState::from_raw(self.state.load(Ordering::Relaxed))
    }

    pub fn set_state(&self, state: CpuState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    /// Whether console output is currently suspended on this processor.
    pub fn console_suspended(&self) -> bool {
        self.con_suspend.load(Ordering::Relaxed) > 0
    }

    /// Marks a console flush as deferred. Called by the console subsystem
    /// when it withholds output because this processor's console is
    /// suspended; serviced when the suspend depth returns to zero.
    pub fn defer_console_flush(&self) {
        self.con_need_flush.store(true, Ordering::Relaxed);
    }

    pub(crate) fn suspend_console(&self) {
        self.con_suspend.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrements the console suspend depth; true if it reached zero.
    pub(crate) fn resume_console(&self) -> bool {
        self.con_suspend.fetch_sub(1, Ordering::Relaxed) == 1
    }

    pub(crate) fn take_deferred_flush(&self) -> bool {
        self.con_need_flush.swap(false, Ordering::Relaxed)
    }

    pub(crate) fn pending_request(&self) -> Option<&'static Lock> {
        let ptr = self.pending_request.load(Ordering::Acquire);
        // SAFETY: only null or `&'static Lock` pointers are ever stored.
        (!ptr.is_null()).then(|| unsafe { &*ptr })
    }

    pub(crate) fn set_pending_request(&self, lock: &'static Lock) {
        self.pending_request
            .store(lock as *const Lock as *mut Lock, Ordering::Release);
    }

    pub(crate) fn clear_pending_request(&self) {
        self.pending_request
            .store(core::ptr::null_mut(), Ordering::Release);
    }

    pub(crate) fn push_held(&self, lock: &'static Lock) {
        self.held_locks.lock().push_back(lock);
    }

    /// Unlinks `lock` from the held list if it is linked. Tolerates an
    /// unlinked lock so forced recovery can pop entries ahead of the normal
    /// release tail.
    pub(crate) fn unlink_held(&self, lock: &'static Lock) {
        let mut held = self.held_locks.lock();
        if lock.held_link.is_linked() {
            // SAFETY: a held lock is linked into its holder's list and
            // nowhere else.
            let mut cursor = unsafe { held.cursor_mut_from_ptr(lock as *const Lock) };
            cursor.remove();
        }
    }

    pub(crate) fn pop_most_recent_held(&self) -> Option<&'static Lock> {
        self.held_locks.lock().pop_back()
    }

    pub(crate) fn no_locks_held(&self) -> bool {
        self.held_locks.lock().is_empty()
    }

    /// Diagnostic tags of all held locks, in acquisition order.
    pub(crate) fn held_tags(&self) -> Vec<&'static str> {
        self.held_locks
            .lock()
            .iter()
            // SAFETY: every lock in this list is held by this processor, so
            // its tag is stable until this processor releases it.
            .filter_map(|lock| unsafe { lock.tag() })
            .collect()
    }
}

/// The table of per-processor descriptors, indexed by [`CpuId`].
pub struct CpuRegistry {
    cpus: Box<[Cpu]>,
}

impl CpuRegistry {
    pub(crate) fn new(num_cpus: usize) -> Self {
        let cpus = (0..num_cpus)
            .map(|raw| Cpu::new(CpuId::new(raw as u32)))
            .collect();
        Self { cpus }
    }

    /// Resolves a processor id, or `None` if no such processor exists.
    pub fn cpu(&self, id: CpuId) -> Option<&Cpu> {
        self.cpus.get(id.as_usize())
    }

    /// Total number of processors in the system.
    pub fn num_cpus(&self) -> usize {
        self.cpus.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cpu> {
        self.cpus.iter()
    }
}
