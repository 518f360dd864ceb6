//! Raw wait statuses and the debug events built from them.

use std::fmt;

use nix::sys::signal::Signal;
use nix::unistd::Pid;

/// A raw status word as returned by `waitpid(2)`.
///
/// The word is kept in its kernel encoding rather than decoded into an enum:
/// the signal to re-inject when a thread is continued is computed from the
/// original encoding (see [`WaitStatus::resume_code`]), and each tracked
/// thread stores the last word observed for it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WaitStatus(pub i32);

impl WaitStatus {
    pub fn raw(self) -> i32 {
        self.0
    }

    pub fn is_stopped(self) -> bool {
        libc::WIFSTOPPED(self.0)
    }

    pub fn is_exited(self) -> bool {
        libc::WIFEXITED(self.0)
    }

    pub fn is_signaled(self) -> bool {
        libc::WIFSIGNALED(self.0)
    }

    pub fn exit_code(self) -> Option<i32> {
        self.is_exited().then(|| libc::WEXITSTATUS(self.0))
    }

    /// The signal that stopped the thread, if this is a stop.
    pub fn stop_signal(self) -> Option<Signal> {
        if self.is_stopped() {
            Signal::try_from(libc::WSTOPSIG(self.0)).ok()
        } else {
            None
        }
    }

    /// The signal that terminated the thread, if it was killed by one.
    pub fn term_signal(self) -> Option<Signal> {
        if self.is_signaled() {
            Signal::try_from(libc::WTERMSIG(self.0)).ok()
        } else {
            None
        }
    }

    /// True for a `PTRACE_EVENT_CLONE` stop: a SIGTRAP stop with the clone
    /// event code in the high bits of the status word.
    pub fn is_clone_event(self) -> bool {
        self.is_stopped()
            && libc::WSTOPSIG(self.0) == libc::SIGTRAP
            && ((self.0 >> 16) & 0xffff) == libc::PTRACE_EVENT_CLONE
    }

    /// The signal to pass to `PTRACE_CONT`/`PTRACE_SINGLESTEP` when
    /// continuing a thread whose last observed status is `self`.
    ///
    /// A SIGSTOP stop was induced by the tracer and is swallowed; any other
    /// stop or termination signal is re-injected as observed.
    pub fn resume_code(self) -> i32 {
        if self.is_stopped() && libc::WSTOPSIG(self.0) == libc::SIGSTOP {
            return 0;
        }

        if self.is_signaled() {
            return libc::WTERMSIG(self.0);
        }

        if self.is_stopped() {
            return libc::WSTOPSIG(self.0);
        }

        0
    }
}

/// One debug event, as surfaced to the upper layer.
///
/// Events are immutable values. Between receiving one and the next
/// `resume`/`step`, every tracked thread of the tracee is stopped.
#[derive(Clone, Copy)]
pub struct DebugEvent {
    pid: Pid,
    tid: Pid,
    status: WaitStatus,
    siginfo: Option<libc::siginfo_t>,
}

impl DebugEvent {
    pub(crate) fn new(
        pid: Pid,
        tid: Pid,
        status: WaitStatus,
        siginfo: Option<libc::siginfo_t>,
    ) -> Self {
        Self { pid, tid, status, siginfo }
    }

    /// The traced process (thread-group leader).
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The thread that produced the event.
    pub fn tid(&self) -> Pid {
        self.tid
    }

    /// The raw wait status that produced the event.
    pub fn status(&self) -> WaitStatus {
        self.status
    }

    /// Kernel `siginfo` snapshot for the stop, when it was retrievable.
    pub fn siginfo(&self) -> Option<&libc::siginfo_t> {
        self.siginfo.as_ref()
    }

    pub fn is_stop(&self) -> bool {
        self.status.is_stopped()
    }

    /// True for the terminal event of a session: the last thread exited or
    /// was killed by a signal.
    pub fn is_exit(&self) -> bool {
        self.status.is_exited() || self.status.is_signaled()
    }

    pub fn stop_signal(&self) -> Option<Signal> {
        self.status.stop_signal()
    }

    pub fn term_signal(&self) -> Option<Signal> {
        self.status.term_signal()
    }
}

impl fmt::Debug for DebugEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugEvent")
            .field("pid", &self.pid)
            .field("tid", &self.tid)
            .field("status", &self.status)
            .field("si_signo", &self.siginfo.map(|si| si.si_signo))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The bit layout of a status word is:
    //
    //   stopped:    (sig << 8) | 0x7f
    //   exited:     code << 8
    //   signaled:   sig (low 7 bits), bit 7 flags a core dump
    //   ptrace evt: (event << 16) | (SIGTRAP << 8) | 0x7f

    fn stopped(sig: i32) -> WaitStatus {
        WaitStatus((sig << 8) | 0x7f)
    }

    fn exited(code: i32) -> WaitStatus {
        WaitStatus((code & 0xff) << 8)
    }

    fn signaled(sig: i32) -> WaitStatus {
        WaitStatus(sig)
    }

    fn clone_event() -> WaitStatus {
        WaitStatus((libc::PTRACE_EVENT_CLONE << 16) | (libc::SIGTRAP << 8) | 0x7f)
    }

    #[test]
    fn classifies_stops() {
        let status = stopped(libc::SIGTRAP);

        assert!(status.is_stopped());
        assert!(!status.is_exited());
        assert!(!status.is_signaled());
        assert_eq!(status.stop_signal(), Some(Signal::SIGTRAP));
        assert_eq!(status.term_signal(), None);
    }

    #[test]
    fn classifies_exits() {
        let status = exited(3);

        assert!(status.is_exited());
        assert!(!status.is_stopped());
        assert_eq!(status.exit_code(), Some(3));
        assert_eq!(status.stop_signal(), None);
    }

    #[test]
    fn classifies_terminations() {
        let status = signaled(libc::SIGKILL);

        assert!(status.is_signaled());
        assert!(!status.is_exited());
        assert_eq!(status.term_signal(), Some(Signal::SIGKILL));
    }

    #[test]
    fn recognizes_clone_events() {
        assert!(clone_event().is_clone_event());

        // A plain SIGTRAP stop has no event code.
        assert!(!stopped(libc::SIGTRAP).is_clone_event());
        // Other signals never carry the clone event.
        assert!(!stopped(libc::SIGSTOP).is_clone_event());
        assert!(!exited(0).is_clone_event());
    }

    #[test]
    fn resume_code_swallows_sigstop() {
        assert_eq!(stopped(libc::SIGSTOP).resume_code(), 0);
    }

    #[test]
    fn resume_code_reinjects_stop_signals() {
        assert_eq!(stopped(libc::SIGUSR1).resume_code(), libc::SIGUSR1);
        assert_eq!(stopped(libc::SIGSEGV).resume_code(), libc::SIGSEGV);
    }

    #[test]
    fn resume_code_reinjects_termination_signals() {
        assert_eq!(signaled(libc::SIGTERM).resume_code(), libc::SIGTERM);
    }

    #[test]
    fn resume_code_defaults_to_zero() {
        assert_eq!(exited(0).resume_code(), 0);
        assert_eq!(exited(42).resume_code(), 0);
    }
}
