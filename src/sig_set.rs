//! Small `sigset_t` helpers.
//!
//! Sets are manipulated one member at a time so the code is correct for
//! any `sigset_t` representation the platform picks.

use core::mem;
use core::ptr;

use libc::{c_int, sigset_t};

use crate::NSIG;

pub(crate) fn empty() -> sigset_t {
    unsafe {
        let mut set: sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        set
    }
}

pub(crate) fn filled() -> sigset_t {
    unsafe {
        let mut set: sigset_t = mem::zeroed();
        libc::sigfillset(&mut set);
        set
    }
}

pub(crate) fn is_member(set: &sigset_t, signo: c_int) -> bool {
    unsafe { libc::sigismember(set, signo) == 1 }
}

pub(crate) fn add(set: &mut sigset_t, signo: c_int) {
    unsafe {
        libc::sigaddset(set, signo);
    }
}

pub(crate) fn del(set: &mut sigset_t, signo: c_int) {
    unsafe {
        libc::sigdelset(set, signo);
    }
}

/// Union by member scan.
pub(crate) fn or_set(left: &sigset_t, right: &sigset_t) -> sigset_t {
    let mut out = empty();
    for signo in 1..NSIG as c_int {
        if is_member(left, signo) || is_member(right, signo) {
            add(&mut out, signo);
        }
    }
    out
}

/// Copy a mask between possibly different widths: `min(sizeof)` bytes are
/// copied into a destination the caller has already cleared, so a narrower
/// source zero-extends and a wider one truncates.
pub(crate) fn copy_mask<Dst, Src>(dst: &mut Dst, src: &Src) {
    let len = mem::size_of::<Src>().min(mem::size_of::<Dst>());
    unsafe {
        ptr::copy_nonoverlapping(
            src as *const Src as *const u8,
            dst as *mut Dst as *mut u8,
            len,
        );
    }
}
