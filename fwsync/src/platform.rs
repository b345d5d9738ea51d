// SPDX-License-Identifier: MPL-2.0

//! The narrow interface to the rest of the firmware.
//!
//! The lock core reaches its external collaborators (timebase, console,
//! hardware-thread priority controls, and the platform's fatal termination
//! entry) exclusively through this trait. Bare-metal builds
//! implement it on top of the real hardware; hosted tests implement it with
//! counters, a synthetic clock, and short sleeps.

use crate::sync::LockFault;

/// Platform hooks required by the lock subsystem.
pub trait Platform: Send + Sync {
    /// Returns milliseconds elapsed since boot, or `None` while the hardware
    /// timebase is not trustworthy (e.g. pending recovery of the clock).
    ///
    /// A `None` here suppresses spin-timeout warnings rather than risking a
    /// false one from a garbage clock.
    fn timebase_ms(&self) -> Option<u64>;

    /// Drops the calling hardware thread to its lowest priority before a
    /// spin-wait, so sibling threads on the same core get more issue slots.
    fn lower_spin_priority(&self) {}

    /// Restores normal hardware-thread priority after a spin-wait.
    fn restore_spin_priority(&self) {}

    /// Called on every iteration of a spin-wait loop.
    ///
    /// Bare metal keeps the default pause hint; a hosted build can sleep
    /// briefly instead so simulated processors do not burn a host core.
    fn spin_relax(&self) {
        core::hint::spin_loop();
    }

    /// Services a console flush that was deferred while console output was
    /// suspended. Invoked when a processor's last console-critical lock is
    /// released and a flush is pending.
    fn flush_console(&self);

    /// Marks the firmware as ineligible for a fast, stateful restart.
    ///
    /// Called before locks are forcibly released out of program order, since
    /// that leaves shared state in an unverified condition.
    fn disable_fast_restart(&self, reason: &'static str);

    /// Dumps the current call stack to the log, as a liveness hint attached
    /// to spin-timeout warnings.
    fn backtrace(&self) {}

    /// Terminal error path for synchronization faults. Must not return.
    fn fatal(&self, fault: LockFault) -> !;
}
