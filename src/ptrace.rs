//! Thin, typed shim over `ptrace(2)` and the wait plumbing around it.
//!
//! Requests that `nix` wraps are delegated to it; the rest (`PEEKUSER`,
//! `POKEUSER`, `GETREGSET`, the FP register families, `GET_THREAD_AREA`) go
//! through `libc::ptrace` directly. `waitpid` is also called through `libc`
//! so the raw status word can be handed to [`WaitStatus`] unmodified.
//!
//! Continuation requests (`cont`, `step`, `set_options`, `get_event_msg`)
//! are only legal for threads with a consumed, unanswered stop; that
//! invariant is enforced by the session, not here.

use std::mem;
use std::ptr;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::ptrace as sys;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tracing::warn;

use crate::error::{Error, Result};
use crate::event::WaitStatus;
use crate::Address;

pub use nix::sys::ptrace::Options;

/// Linux constant defined in `include/uapi/linux/elf.h`.
pub const NT_X86_XSTATE: libc::c_int = 0x202;

/// Not exported by libc; value from `arch/x86/include/uapi/asm/ptrace-abi.h`.
#[cfg(target_arch = "x86")]
const PTRACE_GET_THREAD_AREA: libc::c_uint = 25;

pub fn traceme() -> Result<()> {
    Ok(sys::traceme()?)
}

pub fn attach(tid: Pid) -> Result<()> {
    sys::attach(tid).map_err(|source| Error::Attach { tid, source })
}

pub fn detach(tid: Pid) -> Result<()> {
    Ok(sys::detach(tid, None)?)
}

/// `PTRACE_CONT` with the signal encoded by `code` (0 injects nothing).
pub fn cont(tid: Pid, code: i32) -> Result<()> {
    Ok(sys::cont(tid, translate_code(tid, code))?)
}

/// `PTRACE_SINGLESTEP` with the signal encoded by `code`.
pub fn step(tid: Pid, code: i32) -> Result<()> {
    Ok(sys::step(tid, translate_code(tid, code))?)
}

pub fn set_options(tid: Pid, options: Options) -> Result<()> {
    Ok(sys::setoptions(tid, options)?)
}

/// `PTRACE_GETEVENTMSG`: extra data attached to the last ptrace event stop
/// (for a clone event, the new thread's tid).
pub fn get_event_msg(tid: Pid) -> Result<u64> {
    Ok(sys::getevent(tid)? as u64)
}

pub fn get_siginfo(tid: Pid) -> Result<libc::siginfo_t> {
    Ok(sys::getsiginfo(tid)?)
}

pub fn get_regs(tid: Pid) -> Result<libc::user_regs_struct> {
    Ok(sys::getregs(tid)?)
}

pub fn set_regs(tid: Pid, regs: &libc::user_regs_struct) -> Result<()> {
    Ok(sys::setregs(tid, *regs)?)
}

/// `PTRACE_PEEKTEXT`: one word of tracee memory.
pub fn peek_text(pid: Pid, address: Address) -> Result<libc::c_long> {
    // A -1 word is a valid read result; clear errno and re-check it to tell
    // the two apart.
    Errno::clear();

    let data = unsafe {
        libc::ptrace(
            libc::PTRACE_PEEKTEXT,
            pid.as_raw(),
            address as libc::c_ulong,
            0 as libc::c_ulong,
        )
    };

    if data == -1 {
        if let Some(errno) = std::io::Error::last_os_error().raw_os_error() {
            if errno != 0 {
                return Err(Error::Kernel(Errno::from_raw(errno)));
            }
        }
    }

    Ok(data)
}

/// `PTRACE_POKETEXT`: write one word of tracee memory.
pub fn poke_text(pid: Pid, address: Address, word: libc::c_long) -> Result<()> {
    let rc = unsafe {
        libc::ptrace(libc::PTRACE_POKETEXT, pid.as_raw(), address as libc::c_ulong, word)
    };

    Errno::result(rc).map(drop)?;
    Ok(())
}

pub fn kill(pid: Pid) -> Result<()> {
    Ok(sys::kill(pid)?)
}

// Map a resume code to the signal argument of a continuation request.
fn translate_code(tid: Pid, code: i32) -> Option<Signal> {
    if code == 0 {
        return None;
    }

    match Signal::try_from(code) {
        Ok(signal) => Some(signal),
        Err(_) => {
            warn!(tid = tid.as_raw(), code, "unrepresentable resume code, injecting nothing");
            None
        }
    }
}

/// Non-blocking or blocking `waitpid(2)`, preserving the raw status word.
///
/// Returns `None` when `WNOHANG` was given and no thread had a pending
/// status.
pub fn waitpid(tid: Pid, flags: libc::c_int) -> Result<Option<(Pid, WaitStatus)>> {
    let mut status = 0;
    let rc = unsafe { libc::waitpid(tid.as_raw(), &mut status, flags) };

    match Errno::result(rc) {
        Ok(0) => Ok(None),
        Ok(pid) => Ok(Some((Pid::from_raw(pid), WaitStatus(status)))),
        Err(source) => Err(Error::Wait { source }),
    }
}

/// Wait for a `SIGCHLD` to become deliverable to this thread.
///
/// `None` blocks indefinitely; `Some(Duration::ZERO)` polls. Returns whether
/// a `SIGCHLD` was consumed. Requires `SIGCHLD` to be blocked on the calling
/// thread (the session arranges this), or pending notifications may be
/// swallowed elsewhere in the process.
pub fn wait_for_sigchld(timeout: Option<Duration>) -> Result<bool> {
    let mut set = unsafe { mem::zeroed::<libc::sigset_t>() };
    unsafe {
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGCHLD);
    }

    let rc = match timeout {
        Some(timeout) => {
            let ts = libc::timespec {
                tv_sec: timeout.as_secs() as libc::time_t,
                tv_nsec: timeout.subsec_nanos() as libc::c_long,
            };
            unsafe { libc::sigtimedwait(&set, ptr::null_mut(), &ts) }
        }
        None => unsafe { libc::sigwaitinfo(&set, ptr::null_mut()) },
    };

    if rc == libc::SIGCHLD {
        return Ok(true);
    }

    match Errno::last() {
        Errno::EAGAIN | Errno::EINTR => Ok(false),
        source => Err(Error::Wait { source }),
    }
}

/// Thread-directed `SIGSTOP` (or any signal) via `tgkill(2)`. A
/// process-directed `kill` would race against concurrent clones.
pub fn tgkill(pid: Pid, tid: Pid, signal: libc::c_int) -> Result<()> {
    let rc = unsafe { libc::syscall(libc::SYS_tgkill, pid.as_raw(), tid.as_raw(), signal) };

    Errno::result(rc).map(drop)?;
    Ok(())
}

/// `PTRACE_PEEKUSER` at a byte offset into the virtual `user` struct.
pub fn peek_user(tid: Pid, offset: usize) -> Result<libc::c_long> {
    // A -1 word is a valid read result; clear errno and re-check it to
    // tell the two apart.
    Errno::clear();

    let data = unsafe {
        libc::ptrace(
            libc::PTRACE_PEEKUSER,
            tid.as_raw(),
            offset as libc::c_ulong,
            0 as libc::c_ulong,
        )
    };

    if data == -1 {
        if let Some(errno) = std::io::Error::last_os_error().raw_os_error() {
            if errno != 0 {
                return Err(Error::Kernel(Errno::from_raw(errno)));
            }
        }
    }

    Ok(data)
}

/// `PTRACE_POKEUSER` at a byte offset into the virtual `user` struct.
pub fn poke_user(tid: Pid, offset: usize, data: libc::c_long) -> Result<()> {
    let rc = unsafe {
        libc::ptrace(libc::PTRACE_POKEUSER, tid.as_raw(), offset as libc::c_ulong, data)
    };

    Errno::result(rc).map(drop)?;
    Ok(())
}

/// `PTRACE_GETREGSET` for register set `kind`, filling `buf`. Returns the
/// number of bytes the kernel actually wrote, which for variable-size sets
/// (XSAVE) may be less than the buffer length.
pub fn get_regset(tid: Pid, kind: libc::c_int, buf: &mut [u8]) -> Result<usize> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    let rc = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGSET,
            tid.as_raw(),
            kind as libc::c_ulong,
            &mut iov as *mut libc::iovec,
        )
    };

    Errno::result(rc)?;

    Ok(iov.iov_len)
}

/// `PTRACE_GETFPREGS`: the classic FP register block. On x86-64 this also
/// carries the SSE state; on x86-32 it is the bare i387 image.
pub fn get_fpregs(tid: Pid) -> Result<libc::user_fpregs_struct> {
    let mut data = mem::MaybeUninit::<libc::user_fpregs_struct>::uninit();

    let rc = unsafe {
        libc::ptrace(
            libc::PTRACE_GETFPREGS,
            tid.as_raw(),
            0 as libc::c_ulong,
            data.as_mut_ptr(),
        )
    };

    Errno::result(rc)?;

    Ok(unsafe { data.assume_init() })
}

/// `PTRACE_GETFPXREGS`: FXSAVE image with SSE state. x86-32 only; on x86-64
/// the request does not exist because `GETFPREGS` already carries SSE.
#[cfg(target_arch = "x86")]
pub fn get_fpxregs(tid: Pid) -> Result<libc::user_fpxregs_struct> {
    let mut data = mem::MaybeUninit::<libc::user_fpxregs_struct>::uninit();

    let rc = unsafe {
        libc::ptrace(
            libc::PTRACE_GETFPXREGS,
            tid.as_raw(),
            0 as libc::c_ulong,
            data.as_mut_ptr(),
        )
    };

    Errno::result(rc)?;

    Ok(unsafe { data.assume_init() })
}

/// `PTRACE_GET_THREAD_AREA`: read one LDT entry of the tracee. x86-32 only.
#[cfg(target_arch = "x86")]
pub fn get_thread_area(tid: Pid, entry: usize) -> Result<crate::x86::UserDesc> {
    let mut desc = mem::MaybeUninit::<crate::x86::UserDesc>::zeroed();

    let rc = unsafe {
        libc::ptrace(
            PTRACE_GET_THREAD_AREA,
            tid.as_raw(),
            entry as libc::c_ulong,
            desc.as_mut_ptr(),
        )
    };

    Errno::result(rc)?;

    Ok(unsafe { desc.assume_init() })
}
