// SPDX-License-Identifier: MPL-2.0

//! Mutual exclusion for firmware running with no operating system underneath.
//!
//! Every hardware thread of a multiprocessor server executes firmware code to
//! completion, cooperating only through shared memory; there are no blocking
//! primitives to fall back on. This crate provides the spin-based exclusive
//! lock that the rest of the firmware serializes on, together with the
//! machinery that keeps it diagnosable:
//!
//! - a one-word atomic lock state machine with per-call-site ownership tags
//!   ([`sync::Lock`], driven through [`sync::LockDomain`]);
//! - synchronous deadlock detection over a wait-for graph of spinning
//!   processors, run before a contended caller ever starts to spin;
//! - per-processor held-lock bookkeeping, spin-timeout warnings, and forced
//!   release of a processor's locks on the way down to a fatal halt;
//! - a bypass mode that turns every operation into a no-op until
//!   multiprocessor bring-up completes and per-processor bookkeeping exists.
//!
//! The embedding firmware supplies its clock, console flush, hardware-thread
//! priority hints, and fatal-termination entry point through the
//! [`platform::Platform`] trait. A hosted test build substitutes short sleeps
//! for the priority hints and a panic for the fatal path, which is how the
//! tests in this crate simulate processors with ordinary threads.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod cpu;
pub mod platform;
pub mod sync;

pub use self::{
    cpu::{Cpu, CpuId, CpuRegistry, CpuState},
    platform::Platform,
    sync::{FaultKind, Instrumentation, Lock, LockDomain, LockFault},
};
