//! A Linux debugger core built on `ptrace(2)`.
//!
//! Remora is the backend of a native userspace debugger: it attaches to a
//! running process (or spawns a new one under trace), tracks every kernel
//! thread of the tracee, and delivers one [`DebugEvent`] at a time through
//! [`Session::wait_event`]. Event delivery is *all-stop*: by the time an
//! event is surfaced, every tracked thread has been halted and its stop
//! consumed, so the caller may freely read and write tracee memory and
//! registers until it resumes.
//!
//! The kernel requires all ptrace requests for a tracee to come from the OS
//! thread that attached to it. [`Session`] is therefore not [`Send`]: create
//! it, pump events from it, and touch the tracee through it on a single
//! thread.
//!
//! Software breakpoints are managed by the session; bulk memory reads
//! overlay the original bytes over any installed traps, so callers always
//! see the program as written.

pub mod breakpoint;
pub mod error;
pub mod event;
pub mod modules;
pub mod process;
pub mod procfs;
pub mod ptrace;
pub mod session;
pub mod state;
pub mod threads;
pub mod x86;

/// A tracee virtual address or register value, machine-word sized.
pub type Address = usize;

/// Kernel task id of one tracee thread.
///
/// Threads and processes share the kernel's id space; the alias marks the
/// parameters that name a specific thread rather than a whole process.
pub type Tid = nix::unistd::Pid;

pub use nix::sys::signal::Signal;
pub use nix::unistd::Pid;

#[doc(inline)]
pub use error::{Error, Result};

#[doc(inline)]
pub use event::{DebugEvent, WaitStatus};

#[doc(inline)]
pub use session::{ResumePolicy, Session};

#[doc(inline)]
pub use state::CpuState;
