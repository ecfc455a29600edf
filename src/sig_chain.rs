//! Per-signal chain records and the dispatcher the kernel sees.

use core::cell::UnsafeCell;
use core::ffi::c_void;
use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use libc::{c_int, siginfo_t, sigset_t};

use crate::klog;
use crate::platform;
use crate::sig_action::{KSigAction, SaFlags, SaHandlerType, LEGACY_KERNEL_FLAGS};
use crate::sig_handling::{self, ScopedHandlingSignal};
use crate::sig_set;
use crate::NSIG;

/// Special-handler callback. Returns true when the signal was fully
/// handled and dispatch must stop.
pub type SpecialHandlerFn = unsafe extern "C" fn(c_int, *mut siginfo_t, *mut c_void) -> bool;

/// The handler may never return; the dispatcher must not set its
/// reentrancy bit.
pub const SIGCHAIN_ALLOW_NORETURN: u64 = 0x1;

/// C-ABI record describing one special handler.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SigchainAction {
    pub sc_sigaction: SpecialHandlerFn,
    pub sc_mask: sigset_t,
    pub sc_flags: u64,
}

const SPECIAL_SLOTS: usize = 2;

type DispatchFn = unsafe extern "C" fn(c_int, *mut siginfo_t, *mut c_void);

/// One record per signal number.
///
/// Scalar fields are atomics; the action and slot storage is raw-copied
/// whole. Mutation is rare and serialized by the calling convention
/// (installation happens before the signal fires, or within one thread),
/// so individual fields are not lock-protected. See the notes on
/// [`dispatch`].
pub(crate) struct SignalChain {
    claimed: AtomicBool,
    kernel_supported_flags: AtomicU32,
    action: UnsafeCell<KSigAction>,
    orig_action: UnsafeCell<KSigAction>,
    special_handlers: [UnsafeCell<Option<SigchainAction>>; SPECIAL_SLOTS],
}

unsafe impl Sync for SignalChain {}

// index 0 stays unused so a signal number indexes its own record
static CHAINS: [SignalChain; NSIG] = [const { SignalChain::new() }; NSIG];

impl SignalChain {
    const fn new() -> Self {
        Self {
            claimed: AtomicBool::new(false),
            kernel_supported_flags: AtomicU32::new(0),
            action: UnsafeCell::new(KSigAction::empty()),
            orig_action: UnsafeCell::new(KSigAction::empty()),
            special_handlers: [const { UnsafeCell::new(None) }; SPECIAL_SLOTS],
        }
    }

    /// Record for `signo`. Callers have validated the range.
    pub(crate) fn get(signo: c_int) -> &'static SignalChain {
        &CHAINS[signo as usize]
    }

    pub(crate) fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// Take over kernel delivery for `signo`. Idempotent; a record never
    /// returns to the unclaimed state.
    pub(crate) fn claim(&self, signo: c_int) {
        if !self.is_claimed() {
            self.register(signo);
            self.claimed.store(true, Ordering::Release);
        }
    }

    /// (Re)install the dispatcher with the kernel, displacing whatever
    /// action is currently installed into the user slot.
    pub(crate) fn register(&self, signo: c_int) {
        let mut handler_action: libc::sigaction = unsafe { mem::zeroed() };
        handler_action.sa_mask = sig_set::filled();
        handler_action.sa_sigaction = dispatch as DispatchFn as usize;
        handler_action.sa_flags = (SaFlags::SA_RESTART
            | SaFlags::SA_SIGINFO
            | SaFlags::SA_ONSTACK
            | SaFlags::SA_UNSUPPORTED
            | SaFlags::SA_EXPOSE_TAGBITS)
            .bits() as c_int;

        let linked = platform::linked();
        let mut displaced: libc::sigaction = unsafe { mem::zeroed() };
        unsafe {
            (linked.sigaction)(signo, &handler_action, &mut displaced);
            *self.action.get() = KSigAction::from_raw(displaced);
            if !self.is_claimed() {
                // the pre-claim action is captured exactly once
                *self.orig_action.get() = KSigAction::from_raw(displaced);
            }
        }

        // Newer kernels clear sa_flags bits they do not understand, and
        // reserve SA_UNSUPPORTED as a bit that is always cleared, so
        // userspace can tell the two behaviours apart. Older kernels keep
        // unknown bits; only the long-supported baseline can be assumed
        // there.
        let mut probe: libc::sigaction = unsafe { mem::zeroed() };
        unsafe {
            (linked.sigaction)(signo, ptr::null(), &mut probe);
        }
        let probed = SaFlags::from_bits_retain(probe.sa_flags as u32);
        let mut supported = LEGACY_KERNEL_FLAGS;
        if !probed.contains(SaFlags::SA_UNSUPPORTED) && probed.contains(SaFlags::SA_EXPOSE_TAGBITS)
        {
            supported |= SaFlags::SA_EXPOSE_TAGBITS;
        }
        self.kernel_supported_flags
            .store(supported.bits(), Ordering::Release);
    }

    pub(crate) fn supported_flags(&self) -> SaFlags {
        SaFlags::from_bits_retain(self.kernel_supported_flags.load(Ordering::Acquire))
    }

    pub(crate) fn action(&self) -> KSigAction {
        unsafe { *self.action.get() }
    }

    pub(crate) fn set_action(&self, user: &libc::sigaction) {
        let recorded = KSigAction::from_user(user, self.supported_flags());
        unsafe {
            *self.action.get() = recorded;
        }
    }

    #[cfg_attr(
        not(all(target_os = "android", target_arch = "aarch64")),
        allow(dead_code)
    )]
    fn orig_action(&self) -> KSigAction {
        unsafe { *self.orig_action.get() }
    }

    fn special_handler(&self, idx: usize) -> Option<SigchainAction> {
        unsafe { *self.special_handlers[idx].get() }
    }

    /// Insert into the first free slot. Not thread-safe, but installation
    /// happens before the signal can fire on this record.
    pub(crate) fn add_special_handler(&self, sa: &SigchainAction) {
        for slot in &self.special_handlers {
            let slot = unsafe { &mut *slot.get() };
            if slot.is_none() {
                *slot = Some(*sa);
                return;
            }
        }
        fatal!("too many special signal handlers");
    }

    /// Remove by callback identity, keeping the occupied prefix
    /// contiguous. Not thread-safe either; see `add_special_handler`.
    pub(crate) fn remove_special_handler(&self, func: SpecialHandlerFn) {
        for i in 0..SPECIAL_SLOTS {
            let matches = self
                .special_handler(i)
                .map_or(false, |sa| sa.sc_sigaction as usize == func as usize);
            if matches {
                unsafe {
                    for j in i..SPECIAL_SLOTS - 1 {
                        *self.special_handlers[j].get() = *self.special_handlers[j + 1].get();
                    }
                    *self.special_handlers[SPECIAL_SLOTS - 1].get() = None;
                }
                return;
            }
        }
        fatal!("failed to find special handler to remove");
    }
}

pub(crate) fn dispatcher_address() -> usize {
    dispatch as DispatchFn as usize
}

/// The single handler registered with the kernel for every claimed signal.
/// Installed with a fully-populated block mask, so it always starts with
/// all signals blocked.
///
/// Special handlers run first. A handler that returns true has consumed
/// the signal: dispatch stops and the mask is deliberately left as the
/// handler set it, because such a handler returns to the interrupted
/// context itself. A handler that crashes re-enters this function with its
/// reentrancy bit set, which skips the special stage and hands the crash
/// to the user action.
pub(crate) unsafe extern "C" fn dispatch(
    signo: c_int,
    siginfo: *mut siginfo_t,
    ucontext: *mut c_void,
) {
    let chain = SignalChain::get(signo);
    let linked = platform::linked();

    if !sig_handling::is_handling(signo) {
        for idx in 0..SPECIAL_SLOTS {
            let Some(handler) = chain.special_handler(idx) else {
                break;
            };
            let noreturn = handler.sc_flags & SIGCHAIN_ALLOW_NORETURN != 0;
            let mut previous_mask: sigset_t = mem::zeroed();
            (linked.sigprocmask)(libc::SIG_SETMASK, &handler.sc_mask, &mut previous_mask);

            let _restorer = (!noreturn).then(|| ScopedHandlingSignal::enter(signo));

            if (handler.sc_sigaction)(signo, siginfo, ucontext) {
                return;
            }
            (linked.sigprocmask)(libc::SIG_SETMASK, &previous_mask, ptr::null_mut());
        }
    } else {
        // A single set bit is the expected shape here. Anything else means
        // the TLS word itself is suspect, which is worth a line before the
        // crash gets forwarded.
        #[cfg(target_arch = "aarch64")]
        {
            let (word, expected) = sig_handling::handling_word(signo);
            if word != expected {
                sig_error!(
                    "already handling signal {}, value {:#x} differs from expected {:#x}",
                    signo,
                    word,
                    expected
                );
            }
        }
    }

    // The platform may be able to report the fault and let the process
    // continue (recoverable allocator crashes).
    if let Some(handle_recoverable) = linked.handle_recoverable {
        if handle_recoverable(signo, siginfo, ucontext) {
            return;
        }
    }

    #[cfg_attr(
        not(all(target_os = "android", target_arch = "aarch64")),
        allow(unused_mut)
    )]
    let mut action = chain.action();

    #[cfg(all(target_os = "android", target_arch = "aarch64"))]
    if signo == libc::SIGSEGV
        && mte::is_mte_fault(&*siginfo)
        && mte::allocator_intercepts_mte_segv()
    {
        sig_error!(
            "reverting to the pre-claim action for MTE SEGV, si_code {}",
            (*siginfo).si_code
        );
        action = chain.orig_action();
    }

    // Rebuild the mask the user handler asked for: the interrupted
    // context's mask, the action's mask, and the signal itself unless the
    // action opted out of deferral.
    let flags = action.flags();
    let ucontext_t = ucontext as *mut libc::ucontext_t;
    let mut mask = sig_set::or_set(&(*ucontext_t).uc_sigmask, action.mask());
    if !flags.contains(SaFlags::SA_NODEFER) {
        sig_set::add(&mut mask, signo);
    }
    (linked.sigprocmask)(libc::SIG_SETMASK, &mask, ptr::null_mut());

    match action.handler() {
        SaHandlerType::SigInfo(func) => {
            #[cfg(all(target_os = "android", target_arch = "aarch64"))]
            if !flags.contains(SaFlags::SA_EXPOSE_TAGBITS) {
                mte::untag_fault_address(signo, siginfo);
            }
            func(signo, siginfo, ucontext);
        }
        SaHandlerType::Ignore => {}
        SaHandlerType::Default => {
            // Whatever handles the re-raised signal cannot see this
            // ucontext, so the original crash stack is dumped here; then
            // the default disposition goes back in and the kernel takes
            // over on the re-raise.
            sig_error!(
                "reverting to SIG_DFL handler for signal {}, ucontext {:p}",
                signo,
                ucontext
            );
            klog::log_stack();
            let mut dfl: libc::sigaction = mem::zeroed();
            dfl.sa_sigaction = libc::SIG_DFL;
            (linked.sigaction)(signo, &dfl, ptr::null_mut());
        }
        SaHandlerType::Simple(func) => func(signo),
    }
}

#[cfg(all(target_os = "android", target_arch = "aarch64"))]
mod mte {
    //! Memory-tagging support, bionic only.

    use libc::{c_int, siginfo_t};

    const SEGV_MTEAERR: c_int = 8;
    const SEGV_MTESERR: c_int = 9;
    const SI_USER: c_int = 0;
    const SI_KERNEL: c_int = 0x80;
    const TRAP_HWBKPT: c_int = 4;
    // bionic malloc.h: M_BIONIC_SIGCHAINLIB_SHOULD_INTERCEPT_MTE_SIGSEGV
    const M_BIONIC_SIGCHAINLIB_SHOULD_INTERCEPT_MTE_SIGSEGV: c_int = -305;
    const TAG_SHIFT: u32 = 56;

    pub(super) fn is_mte_fault(info: &siginfo_t) -> bool {
        info.si_code == SEGV_MTEAERR || info.si_code == SEGV_MTESERR
    }

    /// Whether the allocator installed a pre-claim handler it needs to
    /// reach for tag-check faults.
    pub(super) fn allocator_intercepts_mte_segv() -> bool {
        unsafe { libc::mallopt(M_BIONIC_SIGCHAINLIB_SHOULD_INTERCEPT_MTE_SIGSEGV, 0) == 1 }
    }

    /// Handlers that did not opt into tag bits expect a canonical fault
    /// address for kernel-originated faults on the fault-reporting
    /// signals. The hardware-breakpoint flavour of SIGTRAP carries a
    /// non-address value and is left alone.
    pub(super) unsafe fn untag_fault_address(signo: c_int, info: *mut siginfo_t) {
        let fault_signal = signo == libc::SIGILL
            || signo == libc::SIGFPE
            || signo == libc::SIGSEGV
            || signo == libc::SIGBUS
            || signo == libc::SIGTRAP;
        let code = (*info).si_code;
        if !fault_signal || code <= SI_USER || code >= SI_KERNEL {
            return;
        }
        if signo == libc::SIGTRAP && code == TRAP_HWBKPT {
            return;
        }

        // layout of the fault-address variant of siginfo
        #[repr(C)]
        struct FaultSiginfo {
            si_signo: c_int,
            si_errno: c_int,
            si_code: c_int,
            _pad: c_int,
            si_addr: usize,
        }
        let info = info as *mut FaultSiginfo;
        (*info).si_addr &= (1usize << TAG_SHIFT) - 1;
    }
}
