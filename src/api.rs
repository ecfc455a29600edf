//! Overridden installation entry points.
//!
//! These symbols shadow the C library's when this object sits ahead of it
//! in the link order. A claimed signal absorbs installations into its
//! chain record; anything else is forwarded verbatim to the real entry
//! point resolved by [`crate::platform`].

use core::mem;

use libc::{c_int, sighandler_t, sigset_t};

use crate::admin;
use crate::klog;
use crate::platform;
use crate::sig_action::SaFlags;
use crate::sig_chain::SignalChain;
use crate::sig_handling;
use crate::sig_set;
use crate::NSIG;

unsafe fn set_errno(value: c_int) {
    #[cfg(target_os = "android")]
    let location = libc::__errno();
    #[cfg(not(target_os = "android"))]
    let location = libc::__errno_location();
    *location = value;
}

/// Override of `sigaction(2)`.
///
/// On a claimed signal the user's action is recorded and handed back, but
/// the kernel never sees it; the dispatcher stays installed and forwards
/// to the record. Out-of-range signal numbers fail exactly as the libc
/// call would.
#[no_mangle]
pub unsafe extern "C" fn sigaction(
    signo: c_int,
    new_action: *const libc::sigaction,
    old_action: *mut libc::sigaction,
) -> c_int {
    crate::initialize_signal_chain();

    if admin::skip_signal_handlers() {
        return 0;
    }

    if !crate::signo_in_range(signo) {
        set_errno(libc::EINVAL);
        return -1;
    }

    if signo == libc::SIGSEGV && !new_action.is_null() && (*new_action).sa_sigaction == libc::SIG_DFL
    {
        // the runtime would crash blind if this sticks
        error!("[sigchain] setting SIGSEGV to SIG_DFL");
        klog::log_stack();
    }

    let chain = SignalChain::get(signo);
    if chain.is_claimed() {
        let saved = chain.action().to_user();
        if !new_action.is_null() {
            chain.set_action(&*new_action);
        }
        if !old_action.is_null() {
            *old_action = saved;
        }
        return 0;
    }

    (platform::linked().sigaction)(signo, new_action, old_action)
}

/// Override of `signal(2)`: synthesizes the equivalent action and routes
/// it like `sigaction` does. Returns the previous handler, `SIG_ERR` on
/// failure.
#[no_mangle]
pub unsafe extern "C" fn signal(signo: c_int, handler: sighandler_t) -> sighandler_t {
    crate::initialize_signal_chain();

    if !crate::signo_in_range(signo) {
        set_errno(libc::EINVAL);
        return libc::SIG_ERR;
    }

    let mut synthesized: libc::sigaction = mem::zeroed();
    synthesized.sa_mask = sig_set::empty();
    synthesized.sa_sigaction = handler;
    synthesized.sa_flags = (SaFlags::SA_RESTART | SaFlags::SA_ONSTACK).bits() as c_int;

    let chain = SignalChain::get(signo);
    if chain.is_claimed() {
        let prior = chain.action().to_user().sa_sigaction;
        chain.set_action(&synthesized);
        return prior;
    }

    let mut displaced: libc::sigaction = mem::zeroed();
    if (platform::linked().sigaction)(signo, &synthesized, &mut displaced) == -1 {
        return libc::SIG_ERR;
    }
    displaced.sa_sigaction
}

/// Override of `sigprocmask(2)`.
///
/// Calls made while the current thread is inside the dispatcher pass
/// straight through; the chain is managing the mask itself there. From
/// outside, block requests are scrubbed so the application cannot block a
/// signal the runtime has claimed.
#[no_mangle]
pub unsafe extern "C" fn sigprocmask(
    how: c_int,
    new_set: *const sigset_t,
    old_set: *mut sigset_t,
) -> c_int {
    crate::initialize_signal_chain();

    if sig_handling::is_handling_any() {
        return (platform::linked().sigprocmask)(how, new_set, old_set);
    }

    let mut scrubbed: sigset_t;
    let mut new_ptr = new_set;
    if !new_set.is_null() && (how == libc::SIG_BLOCK || how == libc::SIG_SETMASK) {
        scrubbed = *new_set;
        for signo in 1..NSIG as c_int {
            if SignalChain::get(signo).is_claimed() && sig_set::is_member(&scrubbed, signo) {
                sig_set::del(&mut scrubbed, signo);
            }
        }
        new_ptr = &scrubbed;
    }

    (platform::linked().sigprocmask)(how, new_ptr, old_set)
}
