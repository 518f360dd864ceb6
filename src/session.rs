//! The debugger session: attach/spawn, the event pump, all-stop control,
//! memory access, and breakpoint placement.

use std::ffi::CString;
use std::marker::PhantomData;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;
use std::time::Duration;

use nix::sys::signal::{self, SigSet, SigmaskHow, Signal};
use nix::unistd::{self, ForkResult, Pid, SysconfVar};
use tracing::{debug, info, warn};

use crate::breakpoint::{self, Breakpoint, BreakpointSet, TRAP_BYTE};
use crate::error::{Error, Result};
use crate::event::{DebugEvent, WaitStatus};
use crate::modules::{self, BinaryInfo, Module, RegionProvider};
use crate::process::Process;
use crate::procfs::{self, ThreadInfo};
use crate::ptrace;
use crate::state::CpuState;
use crate::threads::ThreadTable;
use crate::x86;
use crate::{Address, Tid};

/// How to continue the tracee after an event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResumePolicy {
    /// Run on; the signal that stopped the active thread is swallowed.
    Normal,

    /// Run on; the signal that stopped the active thread is re-injected, as
    /// if the debugger had never seen it.
    PassException,

    /// Stay stopped; `resume`/`step` become no-ops.
    Stop,
}

/// A debugging session: at most one tracee, all of its kernel threads.
///
/// The kernel demands that every ptrace request for a tracee come from the
/// OS thread that attached, so a session is not `Send`; create it and drive
/// it from one thread. Creating it blocks `SIGCHLD` on that thread, which
/// [`Session::wait_event`] waits on. A blocked `wait_event(None)` can be
/// cancelled by directing a `SIGCHLD` at the session's thread (e.g. with
/// `tgkill`).
///
/// Between a delivered [`DebugEvent`] and the next `resume`/`step`, every
/// tracked thread is stopped: memory and registers may be read and written
/// freely.
pub struct Session {
    pid: Option<Pid>,
    active_thread: Option<Tid>,
    event_thread: Option<Tid>,
    threads: ThreadTable,
    breakpoints: BreakpointSet,
    binary_info: Option<Box<dyn BinaryInfo>>,
    process: Option<Process>,
    page_size: usize,

    // Pins all ptrace traffic to the attaching thread.
    _not_send: PhantomData<*const ()>,
}

impl Session {
    /// Create an empty session and block `SIGCHLD` on the calling thread so
    /// the event pump can wait for it.
    pub fn new() -> Result<Self> {
        let mut sigchld = SigSet::empty();
        sigchld.add(Signal::SIGCHLD);
        signal::pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&sigchld), None)?;

        let page_size = unistd::sysconf(SysconfVar::PAGE_SIZE)?.unwrap_or(4096) as usize;

        Ok(Self {
            pid: None,
            active_thread: None,
            event_thread: None,
            threads: ThreadTable::new(),
            breakpoints: BreakpointSet::new(),
            binary_info: None,
            process: None,
            page_size,
            _not_send: PhantomData,
        })
    }

    pub fn attached(&self) -> bool {
        self.pid.is_some()
    }

    /// The traced process (thread-group leader), if any.
    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// The thread whose registers `get_state`/`set_state` address.
    pub fn active_thread(&self) -> Option<Tid> {
        self.active_thread
    }

    /// The thread that produced the most recent event.
    pub fn event_thread(&self) -> Option<Tid> {
        self.event_thread
    }

    pub fn thread_ids(&self) -> Vec<Tid> {
        self.threads.ids()
    }

    pub fn threads(&self) -> &ThreadTable {
        &self.threads
    }

    pub fn breakpoints(&self) -> &BreakpointSet {
        &self.breakpoints
    }

    pub fn process(&self) -> Option<&Process> {
        self.process.as_ref()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Supply the binary-info handle used to locate the dynamic linker's
    /// `r_debug` for [`Session::loaded_modules`].
    pub fn set_binary_info(&mut self, binary_info: Box<dyn BinaryInfo>) {
        self.binary_info = Some(binary_info);
    }

    /// Select the thread whose registers `get_state`/`set_state` address.
    pub fn set_active_thread(&mut self, tid: Tid) -> Result<()> {
        if !self.threads.contains(tid) {
            warn!(tid = tid.as_raw(), "attempted to select an untracked thread");
            return Err(Error::UnknownThread { tid });
        }

        self.active_thread = Some(tid);
        Ok(())
    }

    pub fn create_state(&self) -> CpuState {
        CpuState::new()
    }

    pub fn cpu_type(&self) -> x86::CpuType {
        x86::cpu_type()
    }

    pub fn has_extension(&self, extension: x86::Extension) -> bool {
        x86::has_extension(extension)
    }

    /// Fixed-width lowercase hex for the target ABI.
    pub fn format_pointer(&self, address: Address) -> String {
        x86::format_pointer(address)
    }

    /// Attach to every kernel thread of `pid`.
    ///
    /// There is no atomic whole-process attach, and the tracee may spawn
    /// threads while we work, so the `/proc/<pid>/task/` sweep repeats until
    /// a full pass finds nothing new. Each attached thread is left stopped
    /// with its attach stop consumed and `PTRACE_O_TRACECLONE` set.
    pub fn attach(&mut self, pid: Pid) -> Result<()> {
        self.detach()?;

        let mut last_error = None;

        loop {
            let tids = match procfs::task_ids(pid) {
                Ok(tids) => tids,
                Err(_) if !self.threads.is_empty() => break,
                Err(err) => return Err(err.into()),
            };

            let mut attached_any = false;

            for tid in tids {
                if self.threads.contains(tid) {
                    continue;
                }

                match self.attach_thread(tid) {
                    Ok(()) => attached_any = true,
                    Err(err) => {
                        debug!(tid = tid.as_raw(), %err, "thread did not attach");
                        last_error = Some(err);
                    }
                }
            }

            if !attached_any {
                break;
            }
        }

        if self.threads.is_empty() {
            return Err(
                last_error.unwrap_or(Error::Attach { tid: pid, source: nix::Error::ESRCH })
            );
        }

        self.pid = Some(pid);
        self.active_thread = Some(pid);
        self.event_thread = Some(pid);
        self.process = Some(Process::new(pid));

        info!(pid = pid.as_raw(), threads = self.threads.len(), "attached");
        Ok(())
    }

    fn attach_thread(&mut self, tid: Tid) -> Result<()> {
        ptrace::attach(tid)?;

        match ptrace::waitpid(tid, libc::__WALL) {
            Ok(Some((_, status))) => {
                self.threads.insert(tid, status);
                self.threads.mark_waited(tid);

                // TRACECLONE is only valid on a stopped thread, so it is set
                // here rather than at attach time.
                if let Err(err) =
                    self.ptrace_set_options(tid, ptrace::Options::PTRACE_O_TRACECLONE)
                {
                    warn!(tid = tid.as_raw(), %err, "failed to set PTRACE_O_TRACECLONE");
                }
            }
            Ok(None) => {}
            Err(err) => warn!(tid = tid.as_raw(), %err, "could not absorb attach stop"),
        }

        Ok(())
    }

    /// Spawn `path` under trace.
    ///
    /// The child requests `PTRACE_TRACEME`, optionally reopens its stdio on
    /// `tty` and changes into `cwd`, then execs. The parent consumes the
    /// exec SIGTRAP stop and seeds the session with it; any other first
    /// event detaches and fails.
    pub fn open(
        &mut self,
        path: &Path,
        cwd: Option<&Path>,
        args: &[&str],
        tty: Option<&Path>,
    ) -> Result<()> {
        self.detach()?;

        // Everything the child touches must be allocated pre-fork: only
        // async-signal-safe calls are allowed between fork and exec.
        let path_c = cstring(path.as_os_str().as_bytes())?;

        let mut argv_c = vec![path_c.clone()];
        for arg in args {
            argv_c.push(cstring(arg.as_bytes())?);
        }
        let argv = PointerArray::new(&argv_c);

        let cwd_c = match cwd {
            Some(cwd) => Some(cstring(cwd.as_os_str().as_bytes())?),
            None => None,
        };
        let tty_c = match tty {
            Some(tty) => Some(cstring(tty.as_os_str().as_bytes())?),
            None => None,
        };

        match unsafe { unistd::fork() }.map_err(|source| Error::Spawn { source })? {
            ForkResult::Child => {
                // Failures cannot be reported from here; abort and let the
                // parent observe the death via waitpid.
                if ptrace::traceme().is_err() {
                    std::process::abort();
                }

                if let Some(tty) = &tty_c {
                    redirect_stdio(tty);
                }

                if let Some(cwd) = &cwd_c {
                    unsafe {
                        libc::chdir(cwd.as_ptr());
                    }
                }

                unsafe {
                    libc::execv(path_c.as_ptr(), argv.as_ptr());
                }

                std::process::abort();
            }
            ForkResult::Parent { child } => self.finish_open(child),
        }
    }

    fn finish_open(&mut self, pid: Pid) -> Result<()> {
        self.reset();

        let status = match ptrace::waitpid(pid, libc::__WALL)? {
            Some((_, status)) => status,
            None => return Err(Error::Wait { source: nix::Error::ECHILD }),
        };

        // The very first event must be the exec SIGTRAP stop.
        if status.stop_signal() != Some(Signal::SIGTRAP) {
            let _ = ptrace::detach(pid);
            return Err(Error::InitialStop { status: status.raw() });
        }

        self.threads.insert(pid, status);
        self.threads.mark_waited(pid);

        if let Err(err) = self.ptrace_set_options(pid, ptrace::Options::PTRACE_O_TRACECLONE) {
            warn!(pid = pid.as_raw(), %err, "failed to set PTRACE_O_TRACECLONE");
            let _ = ptrace::detach(pid);
            self.reset();
            return Err(err);
        }

        self.pid = Some(pid);
        self.active_thread = Some(pid);
        self.event_thread = Some(pid);
        self.process = Some(Process::new(pid));

        info!(pid = pid.as_raw(), "spawned tracee");
        Ok(())
    }

    /// Detach from every thread, restoring breakpoint bytes first.
    pub fn detach(&mut self) -> Result<()> {
        if !self.attached() {
            return Ok(());
        }

        self.stop_all();
        self.clear_breakpoints();

        for tid in self.threads.ids() {
            if ptrace::detach(tid).is_ok() {
                // Nothing to reap unless the thread died under us; a
                // detached live thread keeps running.
                let _ = ptrace::waitpid(tid, libc::__WALL | libc::WNOHANG);
            }
        }

        info!(pid = ?self.pid.map(Pid::as_raw), "detached");
        self.reset();
        Ok(())
    }

    /// Kill the tracee outright. Requires the leader to be in a stop, as it
    /// is after any delivered event.
    pub fn kill(&mut self) -> Result<()> {
        let Some(pid) = self.pid else { return Ok(()) };

        self.clear_breakpoints();
        ptrace::kill(pid)?;

        // The group dies with the leader; reap it.
        let _ = ptrace::waitpid(pid, libc::__WALL);

        info!(pid = pid.as_raw(), "killed tracee");
        self.reset();
        Ok(())
    }

    /// Ask the tracee to stop.
    ///
    /// One process-directed `SIGSTOP` is enough to halt every thread: the
    /// stop controller runs when the resulting event is delivered and stops
    /// the rest.
    pub fn pause(&self) -> Result<()> {
        let pid = self.pid.ok_or(Error::NotAttached)?;

        signal::kill(pid, Signal::SIGSTOP)?;
        Ok(())
    }

    /// Continue after an event.
    ///
    /// The active thread's signal disposition follows `policy`; every other
    /// thread with a consumed stop is continued with the signal it
    /// originally reported, regardless of policy.
    pub fn resume(&mut self, policy: ResumePolicy) -> Result<()> {
        if policy == ResumePolicy::Stop {
            return Ok(());
        }

        let tid = self.active_thread.ok_or(Error::NotAttached)?;
        let code = self.policy_code(tid, policy);
        self.ptrace_continue(tid, code)?;

        for other in self.threads.waited_ids() {
            let code = self.resume_code_for(other);
            self.ptrace_continue(other, code)?;
        }

        Ok(())
    }

    /// Single-step the active thread. Other threads stay stopped.
    pub fn step(&mut self, policy: ResumePolicy) -> Result<()> {
        if policy == ResumePolicy::Stop {
            return Ok(());
        }

        let tid = self.active_thread.ok_or(Error::NotAttached)?;
        let code = self.policy_code(tid, policy);
        self.ptrace_step_thread(tid, code)
    }

    fn policy_code(&self, tid: Tid, policy: ResumePolicy) -> i32 {
        match policy {
            ResumePolicy::PassException => self.resume_code_for(tid),
            _ => 0,
        }
    }

    fn resume_code_for(&self, tid: Tid) -> i32 {
        self.threads
            .get(tid)
            .map(|record| record.last_status().resume_code())
            .unwrap_or(0)
    }

    /// Wait up to `timeout` for the next debug event.
    ///
    /// `None` blocks until something happens; `Some(Duration::ZERO)` polls.
    /// Returns `Ok(None)` when the timeout expires with nothing pending, and
    /// also on a spurious `SIGCHLD`, which is how a blocked wait is
    /// cancelled. When an event is returned, every tracked thread is
    /// stopped.
    pub fn wait_event(&mut self, timeout: Option<Duration>) -> Result<Option<DebugEvent>> {
        if !self.attached() {
            return Err(Error::NotAttached);
        }

        // Consume a status that is already reapable before sleeping: the
        // SIGCHLD for it may have been routed to (and discarded by) another
        // thread of this process.
        if let Some(event) = self.poll_threads()? {
            return Ok(Some(event));
        }

        if !ptrace::wait_for_sigchld(timeout)? {
            return Ok(None);
        }

        self.poll_threads()
    }

    // One non-blocking pass over the thread table; the first pending status
    // wins. Fair ordering is not required.
    fn poll_threads(&mut self) -> Result<Option<DebugEvent>> {
        for tid in self.threads.ids() {
            match ptrace::waitpid(tid, libc::__WALL | libc::WNOHANG) {
                Ok(Some((tid, status))) => return self.handle_event(tid, status),
                Ok(None) => {}
                Err(err) => debug!(tid = tid.as_raw(), %err, "waitpid poll failed"),
            }
        }

        Ok(None)
    }

    // Classify one waitpid result. Returns the event to surface, or None
    // when it was absorbed (non-leader death, clone resolution).
    fn handle_event(&mut self, tid: Tid, status: WaitStatus) -> Result<Option<DebugEvent>> {
        let pid = self.pid.ok_or(Error::NotAttached)?;

        self.threads.mark_waited(tid);

        if status.is_exited() || status.is_signaled() {
            self.threads.remove(tid);

            if !self.threads.is_empty() {
                debug!(tid = tid.as_raw(), "absorbed death of non-leader thread");
                return Ok(None);
            }

            // The last thread is gone: surface the terminal event, then the
            // session resets itself.
            info!(tid = tid.as_raw(), status = status.raw(), "tracee exited");
            let event = DebugEvent::new(pid, tid, status, None);
            self.reset();
            return Ok(Some(event));
        }

        if status.is_clone_event() {
            self.handle_clone(tid)?;
            return Ok(None);
        }

        // A normal stop: capture siginfo (tolerating failure), halt the rest
        // of the world, and surface the event.
        let siginfo = match ptrace::get_siginfo(tid) {
            Ok(siginfo) => Some(siginfo),
            Err(err) => {
                debug!(tid = tid.as_raw(), %err, "siginfo unavailable for stop");
                None
            }
        };

        self.threads.update_status(tid, status);
        self.active_thread = Some(tid);
        self.event_thread = Some(tid);

        self.stop_all();

        Ok(Some(DebugEvent::new(pid, tid, status, siginfo)))
    }

    // Resolve a clone event: register the new thread, absorb its initial
    // SIGSTOP, and continue both threads. The caller never observes a
    // half-born thread.
    fn handle_clone(&mut self, tid: Tid) -> Result<()> {
        match self.ptrace_get_event_msg(tid) {
            Ok(message) => {
                let new_tid = Pid::from_raw(message as u32 as i32);
                let mut thread_status = WaitStatus(0);

                self.threads.insert(new_tid, thread_status);

                if !self.threads.is_waited(new_tid) {
                    match ptrace::waitpid(new_tid, libc::__WALL) {
                        Ok(Some((_, status))) => {
                            thread_status = status;
                            self.threads.mark_waited(new_tid);
                            self.threads.update_status(new_tid, status);
                        }
                        Ok(None) => {}
                        Err(err) => {
                            warn!(
                                tid = new_tid.as_raw(),
                                %err,
                                "could not absorb initial stop of new thread"
                            );
                        }
                    }
                }

                if thread_status.stop_signal() != Some(Signal::SIGSTOP) {
                    warn!(
                        tid = new_tid.as_raw(),
                        status = thread_status.raw(),
                        "new thread reported an event besides SIGSTOP"
                    );
                }

                if self.threads.is_waited(new_tid) {
                    self.ptrace_continue(new_tid, thread_status.resume_code())?;
                }
            }
            Err(err) => warn!(tid = tid.as_raw(), %err, "could not read clone event message"),
        }

        self.ptrace_continue(tid, 0)?;
        Ok(())
    }

    // Stop controller: force-stop every thread that does not already have a
    // consumed stop, and absorb those stops. Afterwards the whole tracee is
    // stopped.
    fn stop_all(&mut self) {
        let Some(pid) = self.pid else { return };

        for tid in self.threads.ids() {
            if self.threads.is_waited(tid) {
                continue;
            }

            if let Err(err) = ptrace::tgkill(pid, tid, libc::SIGSTOP) {
                warn!(tid = tid.as_raw(), %err, "tgkill(SIGSTOP) failed");
                continue;
            }

            match ptrace::waitpid(tid, libc::__WALL) {
                Ok(Some((_, status))) => {
                    self.threads.mark_waited(tid);
                    self.threads.update_status(tid, status);

                    if status.stop_signal() != Some(Signal::SIGSTOP) {
                        // Keep the real status so its signal is re-injected
                        // when the thread resumes.
                        warn!(
                            tid = tid.as_raw(),
                            status = status.raw(),
                            "paused thread reported an event besides SIGSTOP"
                        );
                    }
                }
                Ok(None) => {}
                Err(err) => warn!(tid = tid.as_raw(), %err, "could not absorb forced stop"),
            }
        }
    }

    /// Read one machine word of tracee memory (`PTRACE_PEEKTEXT`).
    ///
    /// On recent kernels this fails when issued from a thread other than the
    /// one that attached; keep memory operations on the controlling thread.
    pub fn read_word(&self, address: Address) -> Result<Address> {
        let pid = self.pid.ok_or(Error::NotAttached)?;

        Ok(ptrace::peek_text(pid, address)? as Address)
    }

    /// Write one machine word of tracee memory (`PTRACE_POKETEXT`).
    pub fn write_word(&mut self, address: Address, word: Address) -> Result<()> {
        let pid = self.pid.ok_or(Error::NotAttached)?;

        ptrace::poke_text(pid, address, word as libc::c_long)
    }

    /// Bulk read through `/proc/<pid>/mem`, with the original bytes of any
    /// installed breakpoints overlaid so callers see the program as written.
    /// Returns the number of bytes read, which may be short at the end of a
    /// mapping; the overlay covers only the bytes actually read.
    pub fn read_pages(&self, address: Address, buf: &mut [u8]) -> Result<usize> {
        let process = self.process.as_ref().ok_or(Error::NotAttached)?;

        let n = process.read_memory(address, buf)?;
        breakpoint::overlay_original_bytes(address, &mut buf[..n], &self.breakpoints);

        Ok(n)
    }

    /// Install a software breakpoint: remember the displaced byte, write the
    /// trap. Installing twice at one address is a no-op.
    pub fn add_breakpoint(&mut self, address: Address) -> Result<()> {
        if self.breakpoints.contains(address) {
            return Ok(());
        }

        let word = self.read_word(address)?;
        let original = (word & 0xff) as u8;

        self.write_word(address, (word & !0xff) | TRAP_BYTE as Address)?;
        self.breakpoints.insert(Breakpoint::new(address, original));

        debug!(address, original, "installed breakpoint");
        Ok(())
    }

    /// Restore the displaced byte at `address` and forget the breakpoint.
    pub fn remove_breakpoint(&mut self, address: Address) -> Result<()> {
        let Some(breakpoint) = self.breakpoints.remove(address) else { return Ok(()) };

        let word = self.read_word(address)?;
        self.write_word(address, (word & !0xff) | breakpoint.original_byte() as Address)?;

        debug!(address, "removed breakpoint");
        Ok(())
    }

    /// Remove every breakpoint, restoring the displaced bytes. Invoked by
    /// `detach` and `kill` before the tracee is released.
    pub fn clear_breakpoints(&mut self) {
        for address in self.breakpoints.addresses() {
            if let Err(err) = self.remove_breakpoint(address) {
                warn!(address, %err, "could not restore breakpoint byte");
            }
        }
    }

    /// Enumerate loaded modules by walking the dynamic linker's
    /// `r_debug`/`link_map` chain; when that yields nothing, fall back to
    /// one module per absolutely-pathed region.
    pub fn loaded_modules(&self, regions: &dyn RegionProvider) -> Vec<Module> {
        let mut found = Vec::new();

        if let (Some(binary_info), Some(process)) = (&self.binary_info, &self.process) {
            if let Some(debug_pointer) = binary_info.debug_pointer() {
                found = modules::modules_from_link_map(process, debug_pointer);
            }
        }

        if found.is_empty() {
            found = modules::modules_from_regions(&regions.regions());
        }

        found
    }

    /// `/proc`-derived metadata for one tracked thread.
    pub fn get_thread_info(&self, tid: Tid) -> Result<ThreadInfo> {
        let pid = self.pid.ok_or(Error::NotAttached)?;

        Ok(procfs::thread_info(pid, tid))
    }

    // Continuing a thread consumes its waited mark; this is the single
    // source of truth that prevents double continuation.
    fn ptrace_continue(&mut self, tid: Tid, code: i32) -> Result<()> {
        self.consume_waited(tid)?;
        ptrace::cont(tid, code)
    }

    fn ptrace_step_thread(&mut self, tid: Tid, code: i32) -> Result<()> {
        self.consume_waited(tid)?;
        ptrace::step(tid, code)
    }

    fn consume_waited(&mut self, tid: Tid) -> Result<()> {
        if !self.threads.is_waited(tid) {
            return Err(Error::ThreadNotStopped { tid });
        }

        self.threads.clear_waited(tid);
        Ok(())
    }

    fn ptrace_set_options(&self, tid: Tid, options: ptrace::Options) -> Result<()> {
        if !self.threads.is_waited(tid) {
            return Err(Error::ThreadNotStopped { tid });
        }

        ptrace::set_options(tid, options)
    }

    fn ptrace_get_event_msg(&self, tid: Tid) -> Result<u64> {
        if !self.threads.is_waited(tid) {
            return Err(Error::ThreadNotStopped { tid });
        }

        ptrace::get_event_msg(tid)
    }

    fn reset(&mut self) {
        self.threads.clear();
        self.active_thread = None;
        self.event_thread = None;
        self.pid = None;
        self.binary_info = None;
        self.process = None;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.detach();
    }
}

fn cstring(bytes: &[u8]) -> Result<CString> {
    Ok(CString::new(bytes).map_err(std::io::Error::from)?)
}

// Child-side: reopen stdio on the given terminal device. Only
// async-signal-safe calls.
fn redirect_stdio(tty: &CString) {
    unsafe {
        let fd = libc::open(tty.as_ptr(), libc::O_RDWR);
        if fd >= 0 {
            libc::dup2(fd, libc::STDIN_FILENO);
            libc::dup2(fd, libc::STDOUT_FILENO);
            libc::dup2(fd, libc::STDERR_FILENO);
            if fd > libc::STDERR_FILENO {
                libc::close(fd);
            }
        }
    }
}

// View of a slice of `CString` values as a null-terminated pointer array,
// for `execv(2)`. The pointers are valid only while the borrow lives.
struct PointerArray<'a> {
    array: Vec<*const libc::c_char>,
    _data: &'a [CString],
}

impl<'a> PointerArray<'a> {
    fn new(data: &'a [CString]) -> Self {
        let mut array: Vec<_> = data.iter().map(|s| s.as_ptr()).collect();
        array.push(ptr::null());

        Self { array, _data: data }
    }

    fn as_ptr(&self) -> *const *const libc::c_char {
        self.array.as_ptr()
    }
}
