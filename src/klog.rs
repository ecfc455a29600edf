//! Diagnostics that stay usable inside a signal handler.
//!
//! The `log` facade is fine on the installation path, but the dispatcher
//! can preempt arbitrary code, so its messages are formatted into a fixed
//! stack buffer and flushed with a single `write(2)` to stderr.

use core::fmt::{self, Write};

const BUF_LEN: usize = 512;

struct SigSafeWriter {
    buf: [u8; BUF_LEN],
    len: usize,
}

impl SigSafeWriter {
    const fn new() -> Self {
        Self {
            buf: [0; BUF_LEN],
            len: 0,
        }
    }

    fn flush(&self) {
        unsafe {
            libc::write(
                libc::STDERR_FILENO,
                self.buf.as_ptr() as *const libc::c_void,
                self.len,
            );
        }
    }
}

impl fmt::Write for SigSafeWriter {
    // silently truncates once the buffer is full
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = BUF_LEN - self.len;
        let take = s.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

pub(crate) fn sig_log(args: fmt::Arguments) {
    let mut out = SigSafeWriter::new();
    let _ = out.write_str("[sigchain] ");
    let _ = out.write_fmt(args);
    let _ = out.write_str("\n");
    out.flush();
}

macro_rules! sig_error {
    ($($arg:tt)*) => {
        $crate::klog::sig_log(format_args!($($arg)*))
    };
}

macro_rules! fatal {
    ($($arg:tt)*) => {{
        $crate::klog::sig_log(format_args!($($arg)*));
        unsafe { ::libc::abort() }
    }};
}

/// Best-effort stack dump for crash diagnostics. Symbol resolution is not
/// async-signal-safe in the strict sense; the callers are one-way paths
/// where the alternative is dying with no context at all.
pub(crate) fn log_stack() {
    let mut frame_idx = 0usize;
    backtrace::trace(|frame| {
        let pc = frame.ip() as usize;
        let mut resolved = false;
        backtrace::resolve(frame.ip(), |symbol| {
            resolved = true;
            match symbol.name() {
                Some(name) => sig_error!("  #{:02} pc {:#018x}  {}", frame_idx, pc, name),
                None => sig_error!("  #{:02} pc {:#018x}  ???", frame_idx, pc),
            }
        });
        if !resolved {
            sig_error!("  #{:02} pc {:#018x}  ???", frame_idx, pc);
        }
        frame_idx += 1;
        true
    });
    if frame_idx == 0 {
        sig_error!("failed to get callstack");
    }
}
