//! Modelling of the user-visible signal action.

use core::ffi::c_void;
use core::mem;

use bitflags::bitflags;
use libc::{c_int, siginfo_t, sigset_t};

use crate::sig_set;

bitflags! {
    /// `sa_flags` bits, including the flag-probe bits the libc crate does
    /// not export. glibc headers do not define SA_RESTORER either, so the
    /// kernel value is spelled out here.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct SaFlags: u32 {
        const SA_NOCLDSTOP = 1;
        const SA_NOCLDWAIT = 2;
        const SA_SIGINFO   = 4;
        const SA_UNSUPPORTED    = 0x0000_0400;
        const SA_EXPOSE_TAGBITS = 0x0000_0800;
        const SA_RESTORER  = 0x0400_0000;
        const SA_ONSTACK   = 0x0800_0000;
        const SA_RESTART   = 0x1000_0000;
        const SA_NODEFER   = 0x4000_0000;
        const SA_RESETHAND = 0x8000_0000;
    }
}

/// Flags every kernel has honored since the 2.6 line. Newer kernels clear
/// unknown `sa_flags` bits on installation, which is what the claim-time
/// probe uses to detect anything beyond this baseline.
pub(crate) const LEGACY_KERNEL_FLAGS: SaFlags = SaFlags::SA_NOCLDSTOP
    .union(SaFlags::SA_NOCLDWAIT)
    .union(SaFlags::SA_SIGINFO)
    .union(SaFlags::SA_ONSTACK)
    .union(SaFlags::SA_RESTART)
    .union(SaFlags::SA_NODEFER)
    .union(SaFlags::SA_RESETHAND)
    .union(SaFlags::SA_RESTORER);

/// The four things an action can ask for. The platform ABI encodes the
/// first two as sentinel handler values; this is the decoded view the
/// dispatcher works with.
#[derive(Clone, Copy)]
pub(crate) enum SaHandlerType {
    Default,
    Ignore,
    Simple(unsafe extern "C" fn(c_int)),
    SigInfo(unsafe extern "C" fn(c_int, *mut siginfo_t, *mut c_void)),
}

/// An action held in the widest variant the platform knows. Conversion to
/// and from the public width copies flags, handler and restorer and moves
/// `min(sizeof)` bytes of the mask, so set bits that fit are never dropped
/// and a mask is never widened past what the caller supplied.
#[derive(Clone, Copy)]
pub(crate) struct KSigAction {
    raw: libc::sigaction,
}

impl KSigAction {
    pub(crate) const fn empty() -> Self {
        Self {
            raw: unsafe { mem::zeroed() },
        }
    }

    pub(crate) fn from_raw(raw: libc::sigaction) -> Self {
        Self { raw }
    }

    /// Record a caller-supplied action, keeping only the flag bits the
    /// kernel proved it supports at claim time.
    pub(crate) fn from_user(user: &libc::sigaction, supported: SaFlags) -> Self {
        let mut raw: libc::sigaction = unsafe { mem::zeroed() };
        raw.sa_flags = (SaFlags::from_bits_retain(user.sa_flags as u32) & supported).bits() as c_int;
        raw.sa_sigaction = user.sa_sigaction;
        raw.sa_restorer = user.sa_restorer;
        raw.sa_mask = sig_set::empty();
        sig_set::copy_mask(&mut raw.sa_mask, &user.sa_mask);
        Self { raw }
    }

    /// The narrow view handed back through the public API.
    pub(crate) fn to_user(&self) -> libc::sigaction {
        let mut out: libc::sigaction = unsafe { mem::zeroed() };
        out.sa_flags = self.raw.sa_flags;
        out.sa_sigaction = self.raw.sa_sigaction;
        out.sa_restorer = self.raw.sa_restorer;
        out.sa_mask = sig_set::empty();
        sig_set::copy_mask(&mut out.sa_mask, &self.raw.sa_mask);
        out
    }

    pub(crate) fn flags(&self) -> SaFlags {
        SaFlags::from_bits_retain(self.raw.sa_flags as u32)
    }

    pub(crate) fn mask(&self) -> &sigset_t {
        &self.raw.sa_mask
    }

    pub(crate) fn handler(&self) -> SaHandlerType {
        match self.raw.sa_sigaction {
            libc::SIG_DFL => SaHandlerType::Default,
            libc::SIG_IGN => SaHandlerType::Ignore,
            addr if self.flags().contains(SaFlags::SA_SIGINFO) => SaHandlerType::SigInfo(unsafe {
                mem::transmute::<usize, unsafe extern "C" fn(c_int, *mut siginfo_t, *mut c_void)>(
                    addr,
                )
            }),
            addr => SaHandlerType::Simple(unsafe {
                mem::transmute::<usize, unsafe extern "C" fn(c_int)>(addr)
            }),
        }
    }
}
