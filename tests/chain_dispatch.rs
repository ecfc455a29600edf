//! Dispatch scenarios driven through real kernel delivery.
//!
//! Claims are process-global and never released, so every test works on
//! its own signal number; the real-time range provides fresh ones.

use std::ffi::c_void;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use libc::{c_int, siginfo_t};
use sigchain::{
    AddSpecialSignalHandlerFn, EnsureFrontOfChain, RemoveSpecialSignalHandlerFn, SigchainAction,
    SIGCHAIN_ALLOW_NORETURN,
};

fn empty_set() -> libc::sigset_t {
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        set
    }
}

fn chain_action(callback: sigchain::SpecialHandlerFn, flags: u64) -> SigchainAction {
    SigchainAction {
        sc_sigaction: callback,
        sc_mask: empty_set(),
        sc_flags: flags,
    }
}

/// The genuine libc entry point, for installing handlers behind the
/// chain's back.
fn real_sigaction(
) -> unsafe extern "C" fn(c_int, *const libc::sigaction, *mut libc::sigaction) -> c_int {
    unsafe {
        let image = libc::dlopen(c"libc.so.6".as_ptr(), libc::RTLD_LOCAL | libc::RTLD_LAZY);
        assert!(!image.is_null());
        let sym = libc::dlsym(image, c"sigaction".as_ptr());
        assert!(!sym.is_null());
        mem::transmute(sym)
    }
}

mod pass_through {
    use super::*;

    static ORDER: AtomicUsize = AtomicUsize::new(0);
    static SPECIAL_STAMP: AtomicUsize = AtomicUsize::new(usize::MAX);
    static USER_STAMP: AtomicUsize = AtomicUsize::new(usize::MAX);

    unsafe extern "C" fn special(
        _signo: c_int,
        _info: *mut siginfo_t,
        _uctx: *mut c_void,
    ) -> bool {
        SPECIAL_STAMP.store(ORDER.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
        false
    }

    unsafe extern "C" fn user(_signo: c_int, _info: *mut siginfo_t, _uctx: *mut c_void) {
        USER_STAMP.store(ORDER.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
    }

    /// A special handler that declines the signal passes it on to the
    /// user action, in that order.
    #[test]
    fn test_special_then_user() {
        let signo = libc::SIGUSR1;
        unsafe {
            AddSpecialSignalHandlerFn(signo, &chain_action(special, 0));

            let mut action: libc::sigaction = mem::zeroed();
            libc::sigemptyset(&mut action.sa_mask);
            action.sa_sigaction =
                user as unsafe extern "C" fn(c_int, *mut siginfo_t, *mut c_void) as usize;
            action.sa_flags = libc::SA_SIGINFO;
            assert_eq!(sigchain::sigaction(signo, &action, ptr::null_mut()), 0);

            libc::raise(signo);
        }

        let special_stamp = SPECIAL_STAMP.load(Ordering::SeqCst);
        let user_stamp = USER_STAMP.load(Ordering::SeqCst);
        assert_ne!(special_stamp, usize::MAX, "special handler never ran");
        assert_ne!(user_stamp, usize::MAX, "user handler never ran");
        assert!(special_stamp < user_stamp);
    }
}

mod swallowed {
    use super::*;

    static SPECIAL_HITS: AtomicUsize = AtomicUsize::new(0);
    static USER_HITS: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn special(
        _signo: c_int,
        _info: *mut siginfo_t,
        _uctx: *mut c_void,
    ) -> bool {
        SPECIAL_HITS.fetch_add(1, Ordering::SeqCst);
        true
    }

    unsafe extern "C" fn user(_signo: c_int, _info: *mut siginfo_t, _uctx: *mut c_void) {
        USER_HITS.fetch_add(1, Ordering::SeqCst);
    }

    /// A special handler that reports the signal handled terminates
    /// dispatch; the user action must not be observed.
    #[test]
    fn test_special_swallows_signal() {
        let signo = libc::SIGUSR2;
        unsafe {
            AddSpecialSignalHandlerFn(signo, &chain_action(special, 0));

            let mut action: libc::sigaction = mem::zeroed();
            libc::sigemptyset(&mut action.sa_mask);
            action.sa_sigaction =
                user as unsafe extern "C" fn(c_int, *mut siginfo_t, *mut c_void) as usize;
            action.sa_flags = libc::SA_SIGINFO;
            assert_eq!(sigchain::sigaction(signo, &action, ptr::null_mut()), 0);

            libc::raise(signo);
            libc::raise(signo);
        }

        assert_eq!(SPECIAL_HITS.load(Ordering::SeqCst), 2);
        assert_eq!(USER_HITS.load(Ordering::SeqCst), 0);
    }
}

mod reentrant {
    use super::*;

    static SPECIAL_HITS: AtomicUsize = AtomicUsize::new(0);
    static USER_HITS: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn special(signo: c_int, _info: *mut siginfo_t, _uctx: *mut c_void) -> bool {
        if SPECIAL_HITS.fetch_add(1, Ordering::SeqCst) == 0 {
            // a delivery while the handling bit is set must skip the
            // special stage and go straight to the user action
            libc::raise(signo);
        }
        false
    }

    unsafe extern "C" fn user(_signo: c_int, _info: *mut siginfo_t, _uctx: *mut c_void) {
        USER_HITS.fetch_add(1, Ordering::SeqCst);
    }

    /// The handling bit is set while a special handler runs: a reentrant
    /// delivery of the same signal bypasses the special stage (the
    /// handler-crashed recovery path) and still reaches the user action.
    #[test]
    fn test_reentrant_delivery_skips_special_stage() {
        let signo = libc::SIGRTMIN() + 4;
        unsafe {
            AddSpecialSignalHandlerFn(signo, &chain_action(special, 0));

            let mut action: libc::sigaction = mem::zeroed();
            libc::sigemptyset(&mut action.sa_mask);
            action.sa_sigaction =
                user as unsafe extern "C" fn(c_int, *mut siginfo_t, *mut c_void) as usize;
            action.sa_flags = libc::SA_SIGINFO;
            assert_eq!(sigchain::sigaction(signo, &action, ptr::null_mut()), 0);

            libc::raise(signo);
        }

        // one outer special invocation; the nested delivery ran the user
        // action, and so did the outer one after the handler declined
        assert_eq!(SPECIAL_HITS.load(Ordering::SeqCst), 1);
        assert_eq!(USER_HITS.load(Ordering::SeqCst), 2);
    }
}

mod noreturn {
    use super::*;

    static SPECIAL_HITS: AtomicUsize = AtomicUsize::new(0);
    static USER_HITS: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn special(signo: c_int, _info: *mut siginfo_t, _uctx: *mut c_void) -> bool {
        if SPECIAL_HITS.fetch_add(1, Ordering::SeqCst) == 0 {
            // no handling bit was set for this slot, so the nested
            // delivery must run the special stage again
            libc::raise(signo);
        }
        true
    }

    unsafe extern "C" fn user(_signo: c_int, _info: *mut siginfo_t, _uctx: *mut c_void) {
        USER_HITS.fetch_add(1, Ordering::SeqCst);
    }

    /// ALLOW_NORETURN slots run without the reentrancy guard: a delivery
    /// from inside the handler still enters the special stage.
    #[test]
    fn test_noreturn_slot_leaves_bit_clear() {
        let signo = libc::SIGRTMIN() + 5;
        unsafe {
            AddSpecialSignalHandlerFn(
                signo,
                &chain_action(special, SIGCHAIN_ALLOW_NORETURN),
            );

            let mut action: libc::sigaction = mem::zeroed();
            libc::sigemptyset(&mut action.sa_mask);
            action.sa_sigaction =
                user as unsafe extern "C" fn(c_int, *mut siginfo_t, *mut c_void) as usize;
            action.sa_flags = libc::SA_SIGINFO;
            assert_eq!(sigchain::sigaction(signo, &action, ptr::null_mut()), 0);

            libc::raise(signo);
        }

        assert_eq!(SPECIAL_HITS.load(Ordering::SeqCst), 2);
        assert_eq!(USER_HITS.load(Ordering::SeqCst), 0);
    }
}

mod front_of_chain {
    use super::*;

    static SPECIAL_HITS: AtomicUsize = AtomicUsize::new(0);
    static DECOY_HITS: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn special(
        _signo: c_int,
        _info: *mut siginfo_t,
        _uctx: *mut c_void,
    ) -> bool {
        SPECIAL_HITS.fetch_add(1, Ordering::SeqCst);
        true
    }

    unsafe extern "C" fn decoy(_signo: c_int) {
        DECOY_HITS.fetch_add(1, Ordering::SeqCst);
    }

    /// A library that goes to the kernel directly displaces the
    /// dispatcher; EnsureFrontOfChain puts it back.
    #[test]
    fn test_reclaims_displaced_dispatcher() {
        let signo = libc::SIGRTMIN() + 6;
        unsafe {
            AddSpecialSignalHandlerFn(signo, &chain_action(special, 0));
            libc::raise(signo);
            assert_eq!(SPECIAL_HITS.load(Ordering::SeqCst), 1);

            let mut behind_our_back: libc::sigaction = mem::zeroed();
            libc::sigemptyset(&mut behind_our_back.sa_mask);
            behind_our_back.sa_sigaction = decoy as unsafe extern "C" fn(c_int) as usize;
            behind_our_back.sa_flags = libc::SA_RESTART;
            real_sigaction()(signo, &behind_our_back, ptr::null_mut());

            libc::raise(signo);
            assert_eq!(DECOY_HITS.load(Ordering::SeqCst), 1);
            assert_eq!(SPECIAL_HITS.load(Ordering::SeqCst), 1);

            EnsureFrontOfChain(signo);
            libc::raise(signo);
        }

        assert_eq!(SPECIAL_HITS.load(Ordering::SeqCst), 2);
        assert_eq!(DECOY_HITS.load(Ordering::SeqCst), 1);
    }
}

mod add_remove {
    use super::*;

    static FIRST_HITS: AtomicUsize = AtomicUsize::new(0);
    static SECOND_HITS: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn first(_signo: c_int, _info: *mut siginfo_t, _uctx: *mut c_void) -> bool {
        FIRST_HITS.fetch_add(1, Ordering::SeqCst);
        true
    }

    unsafe extern "C" fn second(
        _signo: c_int,
        _info: *mut siginfo_t,
        _uctx: *mut c_void,
    ) -> bool {
        SECOND_HITS.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Slots run in insertion order and removal promotes the survivor.
    #[test]
    fn test_removal_promotes_later_slot() {
        let signo = libc::SIGRTMIN() + 7;
        unsafe {
            AddSpecialSignalHandlerFn(signo, &chain_action(first, 0));
            AddSpecialSignalHandlerFn(signo, &chain_action(second, 0));

            libc::raise(signo);
            assert_eq!(FIRST_HITS.load(Ordering::SeqCst), 1);
            assert_eq!(SECOND_HITS.load(Ordering::SeqCst), 0);

            RemoveSpecialSignalHandlerFn(signo, first);
            libc::raise(signo);
        }

        assert_eq!(FIRST_HITS.load(Ordering::SeqCst), 1);
        assert_eq!(SECOND_HITS.load(Ordering::SeqCst), 1);
    }
}
