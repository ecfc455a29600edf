//! Interception layer for process-wide signal handling.
//!
//! A managed runtime, a crash reporter, or a native bridge may want the
//! first look at a signal before whatever handler the surrounding
//! application installed gets to run. This crate claims signals on their
//! behalf: it overrides `sigaction`, `signal` and `sigprocmask`, installs a
//! single dispatcher with the kernel for every claimed signal, and forwards
//! each delivery through the registered special handlers before replaying
//! it into the recorded user action.
//!
//! The dispatcher starts with all signals blocked, fetches the interrupted
//! context's mask from the passed-in ucontext, and rebuilds the mask the
//! user handler asked for before invoking it.

#[macro_use]
extern crate log;

#[macro_use]
mod klog;

mod admin;
mod api;
mod platform;
mod sig_action;
mod sig_chain;
mod sig_handling;
mod sig_set;

use libc::c_int;

pub use admin::{
    AddSpecialSignalHandlerFn, EnsureFrontOfChain, RemoveSpecialSignalHandlerFn,
    SkipAddSignalHandler,
};
pub use api::{sigaction, signal, sigprocmask};
pub use sig_chain::{SigchainAction, SpecialHandlerFn, SIGCHAIN_ALLOW_NORETURN};

/// One past the highest valid signal number. Index 0 of the chain table is
/// allocated for convenience and never used.
pub const NSIG: usize = 65;

pub(crate) fn signo_in_range(signo: c_int) -> bool {
    signo > 0 && (signo as usize) < NSIG
}

/// Resolve the real libc entry points and create the per-thread handling
/// keys. Runs at most once; every public entry point calls this on the way
/// in, so the dispatcher can assume it has already completed.
pub(crate) fn initialize_signal_chain() {
    platform::initialize();
    sig_handling::initialize();
}
