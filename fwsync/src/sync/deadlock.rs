// SPDX-License-Identifier: MPL-2.0

//! Wait-for cycle detection.
//!
//! Invoked on the contended path of `lock`, after the first failed
//! try-acquire and before the caller starts to spin. The walk follows
//! "requester → requested lock → its holder → the holder's requested lock →
//! …" for at most as many hops as there are processors. All walks are
//! serialized under one internal detector lock; `pending_request` chains must
//! not mutate mid-walk, and serializing the walks is what guarantees that.
//!
//! The hop bound by processor count rather than revisit detection is a known
//! approximation carried over from the original design.

use crate::cpu::{Cpu, CpuId, CpuState};
use crate::platform::Platform;

use super::{FaultKind, Lock, LockDomain};

impl<P: Platform> LockDomain<P> {
    /// Records `cpu`'s pending request for `lock` and faults fatally if the
    /// wait-for graph now contains a cycle through `cpu`.
    ///
    /// Processors still in early bring-up are exempt: their bookkeeping is
    /// not initialized yet.
    pub(crate) fn register_lock_request(&self, cpu: &Cpu, lock: &'static Lock) {
        match cpu.state() {
            CpuState::Active | CpuState::Os => {}
            CpuState::EarlyBoot => return,
        }

        // Lock states must stay constant for the duration of the walk. The
        // detector lock is taken through the raw spin path: no tagging, no
        // held-list entry, and no recursion into detection.
        loop {
            if self.bypass_active() {
                return;
            }
            if self.detector_lock.raw_try_acquire(cpu.id()) {
                break;
            }
            self.platform().lower_spin_priority();
            while self.detector_lock.is_held() && !self.bypass_active() {
                self.platform().spin_relax();
            }
            self.platform().restore_spin_priority();
        }

        cpu.set_pending_request(lock);
        if self.wait_chain_closes(cpu.id()) {
            self.lock_fault(lock, FaultKind::DeadlockDetected);
        }

        self.detector_lock.raw_release();
    }

    /// Walks the wait-for chain starting from `start`'s pending request.
    /// True only if the chain returns to `start` across live, held,
    /// non-console locks, which is a genuine deadlock.
    fn wait_chain_closes(&self, start: CpuId) -> bool {
        let mut next = self.cpu(start).pending_request();

        for _ in 0..self.cpus().num_cpus() {
            let Some(lock) = next else {
                return false;
            };
            // Console-critical locks are excluded from the graph; console
            // suspension has its own, non-lock semantics.
            if lock.in_console_path() {
                return false;
            }
            let Some(owner) = lock.holder() else {
                return false;
            };
            if owner == start {
                return true;
            }
            let Some(owner_cpu) = self.cpus().cpu(owner) else {
                return false;
            };
            next = owner_cpu.pending_request();
        }

        false
    }
}
