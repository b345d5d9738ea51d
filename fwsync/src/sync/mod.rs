// SPDX-License-Identifier: MPL-2.0

//! The lock primitive and the domain that drives it.
//!
//! A [`LockDomain`] ties together the processor registry, the platform
//! hooks, the global bypass flag, and the deadlock detector. Every lock
//! operation names the calling processor explicitly; per-processor state is
//! always reached through the registry, never through ambient globals.
//!
//! Two-phase boot: a freshly constructed domain is in bypass mode, where
//! every operation is an instant no-op success. Before multiprocessor
//! bring-up there is exactly one thread of control and per-processor
//! bookkeeping does not exist yet. [`LockDomain::complete_bringup`] is the
//! one-way transition to full semantics.

mod deadlock;
mod lock;
mod recovery;

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

pub use self::lock::Lock;
pub(crate) use self::lock::HeldLocksAdapter;
use crate::cpu::{Cpu, CpuId, CpuRegistry};
use crate::platform::Platform;

/// How much validation the lock paths perform, chosen once at domain
/// construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instrumentation {
    /// Full validation: recursion and release checks, deadlock detection,
    /// spin-timeout warnings.
    Checked,
    /// Only the atomic state transitions and the bookkeeping that console
    /// semantics depend on. No validation, no detection, no timeouts.
    Minimal,
}

/// The offending condition behind a fatal synchronization fault.
///
/// Every variant indicates a programming defect in the firmware itself, not
/// an environmental fault; none of them is recoverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// A processor tried to acquire a lock it already holds, outside the
    /// recursion-aware helper.
    InvalidRecursion,
    /// Released a lock that is not held.
    ReleaseNotHeld,
    /// Released a lock held by a different processor.
    ReleaseNotOwner,
    /// Released a console-critical lock while the releaser's console is not
    /// suspended.
    ReleaseConsoleActive,
    /// Released by a processor whose held-lock set is empty.
    ReleaseEmptyHeldSet,
    /// The wait-for graph closed back on the requesting processor.
    DeadlockDetected,
}

impl FaultKind {
    /// Numeric reason code carried into the platform's fatal diagnostic.
    pub fn code(self) -> u16 {
        match self {
            Self::InvalidRecursion => 0,
            Self::ReleaseNotHeld => 1,
            Self::ReleaseNotOwner => 2,
            Self::ReleaseConsoleActive => 3,
            Self::ReleaseEmptyHeldSet => 4,
            Self::DeadlockDetected => 0,
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::InvalidRecursion => "Invalid recursive lock",
            Self::ReleaseNotHeld => "Unlocking unlocked lock",
            Self::ReleaseNotOwner => "Unlocked non-owned lock",
            Self::ReleaseConsoleActive => "Unlock console lock with console not suspended",
            Self::ReleaseEmptyHeldSet => "Releasing lock with empty held-lock set",
            Self::DeadlockDetected => "Deadlock detected",
        };
        f.write_str(reason)
    }
}

/// Diagnostic handed to [`Platform::fatal`] on a synchronization fault.
#[derive(Debug, Clone, Copy)]
pub struct LockFault {
    pub kind: FaultKind,
    /// Raw state word of the offending lock at fault time.
    pub state: u64,
}

impl fmt::Display for LockFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (code {}, state {:#018x})",
            self.kind,
            self.kind.code(),
            self.state
        )
    }
}

/// The mutual-exclusion subsystem of one machine.
pub struct LockDomain<P: Platform> {
    platform: P,
    cpus: CpuRegistry,
    instrumentation: Instrumentation,
    /// True until multiprocessor bring-up completes; re-armed on the fatal
    /// path so the console can still make progress while the machine dies.
    bypass: AtomicBool,
    /// Serializes all wait-for graph walks. Acquired through the raw spin
    /// path only, so the detector never recurses into itself.
    detector_lock: Lock,
}

impl<P: Platform> LockDomain<P> {
    /// Creates a domain for `num_cpus` processors, in bypass mode.
    pub fn new(platform: P, num_cpus: usize, instrumentation: Instrumentation) -> Self {
        Self {
            platform,
            cpus: CpuRegistry::new(num_cpus),
            instrumentation,
            bypass: AtomicBool::new(true),
            detector_lock: Lock::new(),
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn cpus(&self) -> &CpuRegistry {
        &self.cpus
    }

    /// Whether lock operations are currently no-ops.
    pub fn bypass_active(&self) -> bool {
        self.bypass.load(Ordering::Relaxed)
    }

    /// One-way transition out of bypass mode, called once multiprocessor
    /// bring-up has completed and every processor's descriptor is
    /// initialized. There is no reverse transition.
    pub fn complete_bringup(&self) {
        self.bypass.store(false, Ordering::Release);
    }

    /// Attempts a single atomic acquire; never blocks.
    ///
    /// On success records the caller's tag, adds the lock to the caller's
    /// held-lock set, and suspends the caller's console for console-critical
    /// locks.
    pub fn try_lock(&self, me: CpuId, lock: &'static Lock, tag: &'static str) -> bool {
        if self.bypass_active() {
            return true;
        }
        self.do_try_lock(self.cpu(me), lock, tag)
    }

    /// Acquires `lock`, spinning until it is obtained.
    ///
    /// Under [`Instrumentation::Checked`]: faults fatally on self-recursion,
    /// registers the request with the deadlock detector before spinning (and
    /// faults fatally on a cycle, so a caller never spins on a provably
    /// unsatisfiable request), and warns at most once if the spin outlives
    /// the timeout threshold.
    pub fn lock(&self, me: CpuId, lock: &'static Lock, tag: &'static str) {
        if self.bypass_active() {
            return;
        }
        let cpu = self.cpu(me);

        if self.checked() && lock.held_by(me) {
            self.lock_fault(lock, FaultKind::InvalidRecursion);
        }
        if self.do_try_lock(cpu, lock, tag) {
            return;
        }
        if self.checked() {
            self.register_lock_request(cpu, lock);
        }

        let spin_start = if self.checked() {
            self.platform.timebase_ms()
        } else {
            None
        };
        let mut warned = false;

        loop {
            // Bypass becoming active mid-spin means a fatal fault is
            // unwinding the machine; fall through instead of spinning on a
            // lock nobody will release.
            if self.bypass_active() || self.do_try_lock(cpu, lock, tag) {
                break;
            }
            self.platform.lower_spin_priority();
            while lock.is_held() && !self.bypass_active() {
                self.platform.spin_relax();
                if !warned {
                    if let Some(start) = spin_start {
                        warned = self.warn_if_stuck(lock, start);
                    }
                }
            }
            self.platform.restore_spin_priority();
        }

        if self.checked() {
            cpu.clear_pending_request();
        }
    }

    /// Releases `lock`, validating the release under
    /// [`Instrumentation::Checked`] (see [`FaultKind`]). Services a deferred
    /// console flush when the caller's console suspend depth returns to
    /// zero.
    pub fn unlock(&self, me: CpuId, lock: &'static Lock) {
        if self.bypass_active() {
            return;
        }
        let cpu = self.cpu(me);
        if self.checked() {
            self.check_release(cpu, lock);
        }
        self.do_unlock(cpu, lock);
    }

    /// Acquires `lock` only if the caller does not already hold it.
    ///
    /// Returns whether this call acquired the lock, that is, whether this
    /// call site, and not an outer one, owes the matching release.
    pub fn lock_recursive(&self, me: CpuId, lock: &'static Lock, tag: &'static str) -> bool {
        if self.bypass_active() {
            return false;
        }
        if lock.held_by(me) {
            return false;
        }
        self.lock(me, lock, tag);
        true
    }

    /// Whether the calling processor currently holds `lock`. Pure query, no
    /// side effect.
    pub fn holds(&self, me: CpuId, lock: &Lock) -> bool {
        lock.held_by(me)
    }

    fn checked(&self) -> bool {
        self.instrumentation == Instrumentation::Checked
    }

    pub(crate) fn cpu(&self, id: CpuId) -> &Cpu {
        self.cpus
            .cpu(id)
            .expect("lock operation from an unregistered processor id")
    }

    fn do_try_lock(&self, cpu: &Cpu, lock: &'static Lock, tag: &'static str) -> bool {
        if !lock.raw_try_acquire(cpu.id()) {
            return false;
        }
        // SAFETY: the compare-exchange above made this processor the holder.
        unsafe { lock.set_tag(Some(tag)) };
        if lock.in_console_path() {
            cpu.suspend_console();
        }
        cpu.push_held(lock);
        true
    }

    fn check_release(&self, cpu: &Cpu, lock: &Lock) {
        if !lock.is_held() {
            self.lock_fault(lock, FaultKind::ReleaseNotHeld);
        }
        if !lock.held_by(cpu.id()) {
            self.lock_fault(lock, FaultKind::ReleaseNotOwner);
        }
        if lock.in_console_path() && !cpu.console_suspended() {
            self.lock_fault(lock, FaultKind::ReleaseConsoleActive);
        }
        if cpu.no_locks_held() {
            self.lock_fault(lock, FaultKind::ReleaseEmptyHeldSet);
        }
    }

    /// Shared release tail: used by `unlock` and by forced recovery.
    pub(crate) fn do_unlock(&self, cpu: &Cpu, lock: &'static Lock) {
        // SAFETY: validated (or, under minimal instrumentation, trusted) to
        // be the holder.
        unsafe { lock.set_tag(None) };
        cpu.unlink_held(lock);
        lock.raw_release();
        if lock.in_console_path() && cpu.resume_console() && cpu.take_deferred_flush() {
            self.platform.flush_console();
        }
    }

    /// Fatal synchronization fault: re-arm bypass so the console path keeps
    /// working while the machine goes down, log, and terminate through the
    /// platform. Never returns.
    pub(crate) fn lock_fault(&self, lock: &Lock, kind: FaultKind) -> ! {
        self.bypass.store(true, Ordering::Relaxed);
        let fault = LockFault {
            kind,
            state: lock.raw_state(),
        };
        log::error!("LOCK ERROR: {} @{:p}", fault, lock);
        self.platform.fatal(fault)
    }
}

#[cfg(test)]
mod test {
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::cpu::CpuState;
    use crate::testing::{leak, TestPlatform};

    fn active_domain(num_cpus: usize) -> &'static LockDomain<TestPlatform> {
        let domain = leak(LockDomain::new(
            TestPlatform::new(),
            num_cpus,
            Instrumentation::Checked,
        ));
        domain.complete_bringup();
        for cpu in domain.cpus().iter() {
            cpu.set_state(CpuState::Active);
        }
        domain
    }

    #[test]
    fn bypass_mode_is_a_universal_no_op() {
        let domain = leak(LockDomain::new(
            TestPlatform::new(),
            1,
            Instrumentation::Checked,
        ));
        let me = CpuId::new(0);
        let lock = leak(Lock::new());
        let con = leak(Lock::new_in_console_path());

        assert!(domain.bypass_active());
        assert!(domain.try_lock(me, lock, "a"));
        domain.lock(me, lock, "b");
        domain.unlock(me, lock);
        domain.unlock(me, con);
        assert!(!domain.lock_recursive(me, lock, "c"));

        // No ownership record of any kind was left behind.
        assert!(!domain.holds(me, lock));
        assert!(domain.held_lock_tags(me).is_empty());
        assert!(!domain.cpu(me).console_suspended());
    }

    #[test]
    fn bringup_transition_is_one_way() {
        let domain = active_domain(1);
        assert!(!domain.bypass_active());
        domain.complete_bringup();
        assert!(!domain.bypass_active());
    }

    #[test]
    fn lock_records_ownership_and_unlock_clears_it() {
        let domain = active_domain(2);
        let me = CpuId::new(0);
        let other = CpuId::new(1);
        let lock = leak(Lock::new());

        domain.lock(me, lock, "console_write");
        assert!(domain.holds(me, lock));
        assert!(!domain.holds(other, lock));
        assert_eq!(domain.held_lock_tags(me), ["console_write"]);

        domain.unlock(me, lock);
        assert!(!domain.holds(me, lock));
        assert!(domain.held_lock_tags(me).is_empty());
    }

    #[test]
    fn try_lock_fails_without_blocking_when_contended() {
        let domain = active_domain(2);
        let lock = leak(Lock::new());

        assert!(domain.try_lock(CpuId::new(0), lock, "first"));
        assert!(!domain.try_lock(CpuId::new(1), lock, "second"));
        // The loser recorded nothing.
        assert!(domain.held_lock_tags(CpuId::new(1)).is_empty());

        domain.unlock(CpuId::new(0), lock);
        assert!(domain.try_lock(CpuId::new(1), lock, "second"));
    }

    #[test]
    fn recursive_helper_declines_a_lock_already_mine() {
        let domain = active_domain(2);
        let me = CpuId::new(0);
        let lock = leak(Lock::new());

        assert!(domain.lock_recursive(me, lock, "outer"));
        // Already mine: no acquisition, no state change.
        assert!(!domain.lock_recursive(me, lock, "inner"));
        assert_eq!(domain.held_lock_tags(me), ["outer"]);

        domain.unlock(me, lock);
        // A different processor sees a plain acquire.
        assert!(domain.lock_recursive(CpuId::new(1), lock, "elsewhere"));
        assert!(domain.holds(CpuId::new(1), lock));
    }

    #[test]
    fn console_suspend_depth_balances_and_flushes_once() {
        let domain = active_domain(1);
        let me = CpuId::new(0);
        let outer = leak(Lock::new_in_console_path());
        let inner = leak(Lock::new_in_console_path());
        let cpu = domain.cpu(me);

        domain.lock(me, outer, "con_outer");
        domain.lock(me, inner, "con_inner");
        assert!(cpu.console_suspended());

        // Console output got withheld somewhere in here.
        cpu.defer_console_flush();

        domain.unlock(me, inner);
        assert!(cpu.console_suspended());
        assert_eq!(domain.platform().flushes.load(Ordering::Relaxed), 0);

        domain.unlock(me, outer);
        assert!(!cpu.console_suspended());
        assert_eq!(domain.platform().flushes.load(Ordering::Relaxed), 1);

        // No deferred flush, no service call.
        domain.lock(me, outer, "again");
        domain.unlock(me, outer);
        assert_eq!(domain.platform().flushes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn recursive_acquire_outside_helper_is_fatal() {
        let domain = active_domain(1);
        let me = CpuId::new(0);
        let lock = leak(Lock::new());

        domain.lock(me, lock, "outer");
        let result = catch_unwind(AssertUnwindSafe(|| domain.lock(me, lock, "again")));
        assert!(result.is_err());
        assert_eq!(
            domain.platform().last_fault(),
            Some(FaultKind::InvalidRecursion)
        );
        // The fault path re-armed bypass for the trip down.
        assert!(domain.bypass_active());
    }

    #[test]
    fn releasing_an_unheld_lock_is_fatal() {
        let domain = active_domain(1);
        let lock = leak(Lock::new());

        let result = catch_unwind(AssertUnwindSafe(|| domain.unlock(CpuId::new(0), lock)));
        assert!(result.is_err());
        assert_eq!(
            domain.platform().last_fault(),
            Some(FaultKind::ReleaseNotHeld)
        );
        assert_eq!(FaultKind::ReleaseNotHeld.code(), 1);
    }

    #[test]
    fn releasing_someone_elses_lock_is_fatal() {
        let domain = active_domain(2);
        let lock = leak(Lock::new());

        domain.lock(CpuId::new(0), lock, "owner");
        let result = catch_unwind(AssertUnwindSafe(|| domain.unlock(CpuId::new(1), lock)));
        assert!(result.is_err());
        assert_eq!(
            domain.platform().last_fault(),
            Some(FaultKind::ReleaseNotOwner)
        );
        assert_eq!(FaultKind::ReleaseNotOwner.code(), 2);
    }

    #[test]
    fn releasing_console_lock_without_suspension_is_fatal() {
        let domain = active_domain(1);
        let me = CpuId::new(0);
        let lock = leak(Lock::new_in_console_path());

        // Stage inconsistent state: held by me, but the console suspend
        // depth was never raised.
        assert!(lock.raw_try_acquire(me));
        let result = catch_unwind(AssertUnwindSafe(|| domain.unlock(me, lock)));
        assert!(result.is_err());
        assert_eq!(
            domain.platform().last_fault(),
            Some(FaultKind::ReleaseConsoleActive)
        );
        assert_eq!(FaultKind::ReleaseConsoleActive.code(), 3);
    }

    #[test]
    fn releasing_with_empty_held_set_is_fatal() {
        let domain = active_domain(1);
        let me = CpuId::new(0);
        let lock = leak(Lock::new());

        // Held by me but never entered the held-lock set.
        assert!(lock.raw_try_acquire(me));
        let result = catch_unwind(AssertUnwindSafe(|| domain.unlock(me, lock)));
        assert!(result.is_err());
        assert_eq!(
            domain.platform().last_fault(),
            Some(FaultKind::ReleaseEmptyHeldSet)
        );
        assert_eq!(FaultKind::ReleaseEmptyHeldSet.code(), 4);
    }

    #[test]
    fn minimal_instrumentation_skips_validation_but_keeps_console_semantics() {
        let domain = leak(LockDomain::new(
            TestPlatform::new(),
            1,
            Instrumentation::Minimal,
        ));
        domain.complete_bringup();
        let me = CpuId::new(0);
        let lock = leak(Lock::new());
        let con = leak(Lock::new_in_console_path());

        // An invalid release does not fault under minimal instrumentation.
        let unheld = leak(Lock::new());
        domain.unlock(me, unheld);
        assert!(domain.platform().last_fault().is_none());

        domain.lock(me, lock, "plain");
        domain.unlock(me, lock);
        assert!(!domain.holds(me, lock));

        // Console accounting still works.
        let cpu = domain.cpu(me);
        domain.lock(me, con, "con");
        assert!(cpu.console_suspended());
        cpu.defer_console_flush();
        domain.unlock(me, con);
        assert!(!cpu.console_suspended());
        assert_eq!(domain.platform().flushes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn fault_diagnostics_format_reason_and_state() {
        let fault = LockFault {
            kind: FaultKind::DeadlockDetected,
            state: (3 << 32) | 1,
        };
        let text = std::format!("{}", fault);
        assert!(text.contains("Deadlock detected"));
        assert!(text.contains("code 0"));
        assert!(text.contains("0x0000000300000001"));
    }
}
