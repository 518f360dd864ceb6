//! Registry of the tracee's kernel threads.

use std::collections::{BTreeMap, BTreeSet};

use nix::unistd::Pid;
use tracing::debug;

use crate::event::WaitStatus;

/// Scheduling state of a tracked thread, from the tracer's point of view.
///
/// `Stopped` means the kernel reported a stop that the tracer has not yet
/// answered with a continuation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunState {
    Running,
    Stopped,
}

/// Bookkeeping for one attached kernel thread.
#[derive(Clone, Copy, Debug)]
pub struct ThreadRecord {
    tid: Pid,
    last_status: WaitStatus,
    run_state: RunState,
}

impl ThreadRecord {
    pub fn tid(&self) -> Pid {
        self.tid
    }

    /// The raw status word last returned by `waitpid` for this thread.
    pub fn last_status(&self) -> WaitStatus {
        self.last_status
    }

    pub fn run_state(&self) -> RunState {
        self.run_state
    }
}

/// The set of tracked threads, plus the *waited* set: threads whose stop has
/// been consumed by `waitpid` but not yet answered with a continuation.
///
/// Only waited threads are legal targets for ptrace requests that require a
/// stopped tracee. The waited set is always a subset of the tracked set, and
/// every waited thread is in the `Stopped` run state.
#[derive(Debug, Default)]
pub struct ThreadTable {
    threads: BTreeMap<Pid, ThreadRecord>,
    waited: BTreeSet<Pid>,
}

impl ThreadTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `tid`. Newly inserted threads start out `Stopped`: insertions
    /// happen from attach sweeps and clone events, both of which observe the
    /// thread in a stop.
    pub fn insert(&mut self, tid: Pid, status: WaitStatus) {
        debug!(tid = tid.as_raw(), "tracking thread");

        let record = ThreadRecord { tid, last_status: status, run_state: RunState::Stopped };
        self.threads.insert(tid, record);
    }

    pub fn remove(&mut self, tid: Pid) -> Option<ThreadRecord> {
        debug!(tid = tid.as_raw(), "untracking thread");

        self.waited.remove(&tid);
        self.threads.remove(&tid)
    }

    pub fn contains(&self, tid: Pid) -> bool {
        self.threads.contains_key(&tid)
    }

    pub fn get(&self, tid: Pid) -> Option<&ThreadRecord> {
        self.threads.get(&tid)
    }

    pub fn update_status(&mut self, tid: Pid, status: WaitStatus) {
        if let Some(record) = self.threads.get_mut(&tid) {
            record.last_status = status;
        }
    }

    /// Record that a `waitpid` result for `tid` has been consumed.
    pub fn mark_waited(&mut self, tid: Pid) {
        if let Some(record) = self.threads.get_mut(&tid) {
            record.run_state = RunState::Stopped;
            self.waited.insert(tid);
        } else {
            debug!(tid = tid.as_raw(), "waited an untracked thread");
        }
    }

    /// Record that `tid` has been continued; it is no longer a legal target
    /// for stopped-tracee requests.
    pub fn clear_waited(&mut self, tid: Pid) {
        self.waited.remove(&tid);

        if let Some(record) = self.threads.get_mut(&tid) {
            record.run_state = RunState::Running;
        }
    }

    pub fn is_waited(&self, tid: Pid) -> bool {
        self.waited.contains(&tid)
    }

    pub fn ids(&self) -> Vec<Pid> {
        self.threads.keys().copied().collect()
    }

    pub fn waited_ids(&self) -> Vec<Pid> {
        self.waited.iter().copied().collect()
    }

    /// True when every tracked thread has a consumed, unanswered stop.
    pub fn all_waited(&self) -> bool {
        self.threads.keys().all(|tid| self.waited.contains(tid))
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn clear(&mut self) {
        self.threads.clear();
        self.waited.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid(raw: i32) -> Pid {
        Pid::from_raw(raw)
    }

    #[test]
    fn inserted_threads_start_stopped() {
        let mut table = ThreadTable::new();
        table.insert(tid(100), WaitStatus(0x137f));

        let record = table.get(tid(100)).unwrap();
        assert_eq!(record.run_state(), RunState::Stopped);
        assert_eq!(record.last_status(), WaitStatus(0x137f));
        assert!(!table.is_waited(tid(100)));
    }

    #[test]
    fn waited_tracks_run_state() {
        let mut table = ThreadTable::new();
        table.insert(tid(100), WaitStatus(0));

        table.mark_waited(tid(100));
        assert!(table.is_waited(tid(100)));
        assert_eq!(table.get(tid(100)).unwrap().run_state(), RunState::Stopped);
        assert!(table.all_waited());

        table.clear_waited(tid(100));
        assert!(!table.is_waited(tid(100)));
        assert_eq!(table.get(tid(100)).unwrap().run_state(), RunState::Running);
        assert!(!table.all_waited());
    }

    #[test]
    fn waited_is_subset_of_tracked() {
        let mut table = ThreadTable::new();

        // Marking an untracked thread must not grow the waited set.
        table.mark_waited(tid(7));
        assert!(!table.is_waited(tid(7)));

        table.insert(tid(1), WaitStatus(0));
        table.insert(tid(2), WaitStatus(0));
        table.mark_waited(tid(1));
        table.mark_waited(tid(2));

        table.remove(tid(1));
        assert!(!table.is_waited(tid(1)));
        assert_eq!(table.waited_ids(), vec![tid(2)]);
        assert_eq!(table.ids(), vec![tid(2)]);
    }
}
