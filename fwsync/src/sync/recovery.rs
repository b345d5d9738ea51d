// SPDX-License-Identifier: MPL-2.0

//! Diagnostics and forced recovery.
//!
//! Nothing here changes the outcome of a lock operation: the spin-timeout
//! warning is a liveness hint for operators, the held-lock listing is a
//! debugging aid, and forced release only runs while the firmware is already
//! unwinding toward a fatal halt.

use alloc::vec::Vec;

use crate::cpu::CpuId;
use crate::platform::Platform;

use super::{Lock, LockDomain};

/// How long a single acquire may spin before a warning is logged.
const LOCK_TIMEOUT_MS: u64 = 5_000;

impl<P: Platform> LockDomain<P> {
    /// Emits the one-per-acquire spin warning once `spin_start` is more than
    /// the timeout threshold in the past. Returns whether the warning fired.
    ///
    /// If the timebase is not currently trustworthy the check is skipped
    /// outright; a garbage clock must never manufacture a false warning.
    pub(crate) fn warn_if_stuck(&self, lock: &Lock, spin_start: u64) -> bool {
        let Some(now) = self.platform().timebase_ms() else {
            return false;
        };
        let waited = now.saturating_sub(spin_start);
        if waited <= LOCK_TIMEOUT_MS {
            return false;
        }
        log::warn!("lock {:p} has been spinning for {}ms", lock, waited);
        self.platform().backtrace();
        true
    }

    /// Diagnostic tags of the locks `me` currently holds, in acquisition
    /// order.
    pub fn held_lock_tags(&self, me: CpuId) -> Vec<&'static str> {
        self.cpu(me).held_tags()
    }

    /// Logs the held-lock listing of `me` at error level.
    pub fn dump_held_locks(&self, me: CpuId) {
        log::error!("Locks held by cpu {}:", me.as_u32());
        for tag in self.held_lock_tags(me) {
            log::error!("  {}", tag);
        }
    }

    /// Forcibly releases every lock `me` holds, most recently acquired
    /// first, optionally logging each lock's tag on the way.
    ///
    /// Console-suspend bookkeeping is preserved, so a deferred flush is
    /// still serviced. Because the locks come off out of their normal
    /// program order, shared state is no longer known-consistent; the fast
    /// restart capability is disabled before the first release.
    pub fn release_all(&self, me: CpuId, verbose: bool) {
        self.platform()
            .disable_fast_restart("lock state unwound out of order");

        let cpu = self.cpu(me);
        while let Some(lock) = cpu.pop_most_recent_held() {
            if verbose {
                // SAFETY: `me` still owns every lock remaining in its held
                // list.
                if let Some(tag) = unsafe { lock.tag() } {
                    log::error!("  {}", tag);
                }
            }
            self.do_unlock(cpu, lock);
        }
    }
}
