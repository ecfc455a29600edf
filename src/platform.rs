//! Resolution of the real kernel-facing entry points.
//!
//! The overrides in [`crate::api`] shadow the C library's `sigaction` and
//! `sigprocmask`, so the chain has to reach the genuine implementations by
//! name from the libc image itself. Resolution runs exactly once, on the
//! normal path; the dispatcher only ever reads the resolved pointers.

use core::ffi::{c_void, CStr};
use core::mem;

use libc::c_int;
use spin::Once;

use crate::api;

pub(crate) type SigactionFn =
    unsafe extern "C" fn(c_int, *const libc::sigaction, *mut libc::sigaction) -> c_int;
pub(crate) type SigprocmaskFn =
    unsafe extern "C" fn(c_int, *const libc::sigset_t, *mut libc::sigset_t) -> c_int;

/// Platform decision hook for recoverable crashes: returns true when the
/// fault has been reported and the process may simply continue.
pub(crate) type RecoverableHandlerFn =
    unsafe extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void) -> bool;

pub(crate) struct LinkedFns {
    pub sigaction: SigactionFn,
    pub sigprocmask: SigprocmaskFn,
    pub handle_recoverable: Option<RecoverableHandlerFn>,
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
const LIBC_IMAGE: &CStr = c"libc.so.6";
#[cfg(target_os = "android")]
const LIBC_IMAGE: &CStr = c"libc.so";
#[cfg(not(any(all(target_os = "linux", target_env = "gnu"), target_os = "android")))]
compile_error!("unsupported libc: not bionic or glibc");

/// The symbol is weakly provided by newer platform images; absence just
/// disables the recovery stage.
const RECOVERABLE_SYMBOL: &CStr = c"android_handle_signal";

static LINKED: Once<LinkedFns> = Once::new();

pub(crate) fn initialize() -> &'static LinkedFns {
    LINKED.call_once(resolve)
}

/// Resolved entry points. Signal-side callers rely on an installation call
/// having run [`initialize`] beforehand.
pub(crate) fn linked() -> &'static LinkedFns {
    match LINKED.get() {
        Some(fns) => fns,
        None => fatal!("signal chain entered before initialization"),
    }
}

fn resolve() -> LinkedFns {
    let image = unsafe { libc::dlopen(LIBC_IMAGE.as_ptr(), libc::RTLD_LOCAL | libc::RTLD_LAZY) };
    if image.is_null() {
        fatal!("failed to dlopen {:?}: {}", LIBC_IMAGE, last_dl_error());
    }

    let sigaction_sym = lookup(image, c"sigaction", api::sigaction as SigactionFn as usize);
    let sigprocmask_sym = lookup(image, c"sigprocmask", api::sigprocmask as SigprocmaskFn as usize);
    let recoverable_sym = unsafe { libc::dlsym(libc::RTLD_DEFAULT, RECOVERABLE_SYMBOL.as_ptr()) };

    unsafe {
        LinkedFns {
            sigaction: mem::transmute::<*mut c_void, SigactionFn>(sigaction_sym),
            sigprocmask: mem::transmute::<*mut c_void, SigprocmaskFn>(sigprocmask_sym),
            handle_recoverable: if recoverable_sym.is_null() {
                None
            } else {
                Some(mem::transmute::<*mut c_void, RecoverableHandlerFn>(
                    recoverable_sym,
                ))
            },
        }
    }
}

/// Look `name` up in the libc image, falling back to the default search
/// order. Resolving our own override means the chain would call itself
/// forever, which is unrecoverable.
fn lookup(image: *mut c_void, name: &CStr, override_addr: usize) -> *mut c_void {
    let mut sym = unsafe { libc::dlsym(image, name.as_ptr()) };
    if sym.is_null() {
        sym = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
    }
    if sym.is_null() {
        fatal!("unable to find {:?} in signal chain", name);
    }
    if sym as usize == override_addr {
        fatal!("unable to find next {:?} in signal chain", name);
    }
    sym
}

fn last_dl_error() -> &'static str {
    let msg = unsafe { libc::dlerror() };
    if msg.is_null() {
        return "unknown dl error";
    }
    unsafe { CStr::from_ptr(msg) }.to_str().unwrap_or("non-utf8 dl error")
}
