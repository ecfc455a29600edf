//! Special-handler administration.
//!
//! The callers here are the privileged few (runtime, crash reporter,
//! native bridge), so misuse is a programming error and aborts rather
//! than reporting through errno.

use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use libc::c_int;

use crate::platform;
use crate::sig_chain::{dispatcher_address, SigchainAction, SignalChain, SpecialHandlerFn};

static SKIP_SIGNAL_HANDLERS: AtomicBool = AtomicBool::new(false);

pub(crate) fn skip_signal_handlers() -> bool {
    SKIP_SIGNAL_HANDLERS.load(Ordering::Relaxed)
}

/// Attach a special handler to `signo` and claim the signal, taking over
/// kernel delivery.
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn AddSpecialSignalHandlerFn(signo: c_int, sa: *const SigchainAction) {
    crate::initialize_signal_chain();

    if !crate::signo_in_range(signo) {
        fatal!("invalid signal {}", signo);
    }

    debug!("[sigchain] adding special handler for signal {}", signo);
    let chain = SignalChain::get(signo);
    chain.add_special_handler(&*sa);
    chain.claim(signo);
}

/// Detach the special handler whose callback is `func`. The signal stays
/// claimed.
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn RemoveSpecialSignalHandlerFn(signo: c_int, func: SpecialHandlerFn) {
    crate::initialize_signal_chain();

    if !crate::signo_in_range(signo) {
        fatal!("invalid signal {}", signo);
    }

    SignalChain::get(signo).remove_special_handler(func);
}

/// Reinstall the dispatcher if a third party displaced it by going to the
/// kernel directly. The displaced handler joins the chain as the user
/// action.
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn EnsureFrontOfChain(signo: c_int) {
    crate::initialize_signal_chain();

    if !crate::signo_in_range(signo) {
        fatal!("invalid signal {}", signo);
    }

    let mut current: libc::sigaction = mem::zeroed();
    (platform::linked().sigaction)(signo, ptr::null(), &mut current);

    if current.sa_sigaction != dispatcher_address() {
        warn!(
            "[sigchain] unexpected handler {:#x} installed for signal {}, reclaiming",
            current.sa_sigaction, signo
        );
        SignalChain::get(signo).register(signo);
    }
}

/// Debug bypass for host tests: while set, the `sigaction` override
/// reports success without doing anything at all.
#[allow(non_snake_case)]
#[no_mangle]
pub extern "C" fn SkipAddSignalHandler(value: bool) {
    SKIP_SIGNAL_HANDLERS.store(value, Ordering::Relaxed);
}
