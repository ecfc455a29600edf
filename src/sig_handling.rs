//! Per-thread record of which signals this chain is currently servicing on
//! the calling thread.
//!
//! One bit per non-zero signal, spread over as many machine words as that
//! takes, each word parked in its own pthread TLS slot. pthread get/set
//! specific is async-signal-safe on the supported platforms (bionic
//! documents it; glibc's implementation is a plain TLS load and store), so
//! the bitmap can be flipped from both normal and signal stacks.

use core::ffi::c_void;
use core::sync::atomic::{compiler_fence, Ordering};

use array_init::array_init;
use libc::{c_int, pthread_key_t};
use spin::Once;

use crate::NSIG;

const SIGNAL_SET_LENGTH: usize = NSIG - 1;
const SIGNALS_PER_KEY: usize = usize::BITS as usize;
const KEY_COUNT: usize = (SIGNAL_SET_LENGTH + SIGNALS_PER_KEY - 1) / SIGNALS_PER_KEY;

static HANDLING_KEYS: Once<[pthread_key_t; KEY_COUNT]> = Once::new();

/// Create the TLS keys. Must run on the normal path; the dispatcher assumes
/// the keys already exist.
pub(crate) fn initialize() {
    HANDLING_KEYS.call_once(|| {
        array_init(|_| {
            let mut key: pthread_key_t = 0;
            let rc = unsafe { libc::pthread_key_create(&mut key, None) };
            if rc != 0 {
                fatal!("failed to create handling-signal key: {}", rc);
            }
            key
        })
    });
}

fn keys() -> &'static [pthread_key_t; KEY_COUNT] {
    match HANDLING_KEYS.get() {
        Some(keys) => keys,
        None => fatal!("handling-signal bitmap used before initialization"),
    }
}

fn slot(signo: c_int) -> (pthread_key_t, usize) {
    let bit_idx = (signo - 1) as usize;
    (
        keys()[bit_idx / SIGNALS_PER_KEY],
        1usize << (bit_idx % SIGNALS_PER_KEY),
    )
}

/// True iff this chain is servicing any signal on the current thread.
pub(crate) fn is_handling_any() -> bool {
    keys()
        .iter()
        .any(|&key| unsafe { libc::pthread_getspecific(key) } as usize != 0)
}

pub(crate) fn is_handling(signo: c_int) -> bool {
    let (key, bit) = slot(signo);
    (unsafe { libc::pthread_getspecific(key) } as usize) & bit != 0
}

/// Flip the bit for `signo` and report its previous value. Runs on both
/// normal and signal stacks; the fences keep the compiler from moving the
/// read-modify-write across a handler boundary.
pub(crate) fn set_handling(signo: c_int, value: bool) -> bool {
    let (key, bit) = slot(signo);
    compiler_fence(Ordering::SeqCst);
    let word = unsafe { libc::pthread_getspecific(key) } as usize;
    let prior = word & bit != 0;
    let word = if value { word | bit } else { word & !bit };
    unsafe {
        libc::pthread_setspecific(key, word as *const c_void);
    }
    compiler_fence(Ordering::SeqCst);
    prior
}

/// The raw word owning `signo`'s bit plus the bit itself, for the
/// corruption diagnostic on the reentrant-delivery path.
#[cfg(target_arch = "aarch64")]
pub(crate) fn handling_word(signo: c_int) -> (usize, usize) {
    let (key, bit) = slot(signo);
    (unsafe { libc::pthread_getspecific(key) } as usize, bit)
}

/// Sets the handling bit for the lifetime of the scope and puts the prior
/// value back on drop. Never constructed around an ALLOW_NORETURN handler:
/// a destructor that never runs would leave the bit stuck.
pub(crate) struct ScopedHandlingSignal {
    signo: c_int,
    prior: bool,
}

impl ScopedHandlingSignal {
    pub(crate) fn enter(signo: c_int) -> Self {
        Self {
            signo,
            prior: set_handling(signo, true),
        }
    }
}

impl Drop for ScopedHandlingSignal {
    fn drop(&mut self) {
        set_handling(self.signo, self.prior);
    }
}
