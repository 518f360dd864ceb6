//! `/proc` readers: the stat-line parser and process/thread enumeration.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use nix::unistd::{self, Pid, Uid};

use crate::error::{Error, Result};
use crate::Address;

/// Parsed `/proc/<pid>/stat` record, covering the fields through
/// `cguest_time` (field 44, present since Linux 2.6.24).
///
/// `fields` counts how many leading fields parsed successfully (`pid` is
/// field 1); callers must check it before trusting later fields, exactly as
/// they would check a `scanf` return.
#[derive(Clone, Debug)]
pub struct Stat {
    pub pid: libc::pid_t,
    pub comm: String,
    pub state: char,
    pub ppid: libc::pid_t,
    pub pgrp: libc::pid_t,
    pub session: libc::pid_t,
    pub tty_nr: i32,
    pub tpgid: i32,
    pub flags: u32,
    pub minflt: u64,
    pub cminflt: u64,
    pub majflt: u64,
    pub cmajflt: u64,
    pub utime: u64,
    pub stime: u64,
    pub cutime: i64,
    pub cstime: i64,
    pub priority: i64,
    pub nice: i64,
    pub num_threads: i64,
    pub itrealvalue: i64,
    pub starttime: u64,
    pub vsize: u64,
    pub rss: i64,
    pub rsslim: u64,
    pub startcode: Address,
    pub endcode: Address,
    pub startstack: Address,
    pub kstkesp: Address,
    pub kstkeip: Address,
    pub signal: u64,
    pub blocked: u64,
    pub sigignore: u64,
    pub sigcatch: u64,
    pub wchan: Address,
    pub nswap: u64,
    pub cnswap: u64,
    pub exit_signal: i32,
    pub processor: i32,
    pub rt_priority: u32,
    pub policy: u32,
    pub delayacct_blkio_ticks: u64,
    pub guest_time: u64,
    pub cguest_time: i64,

    /// Count of leading fields successfully parsed.
    pub fields: usize,
}

impl Default for Stat {
    fn default() -> Self {
        Self {
            pid: 0,
            comm: String::new(),
            state: '?',
            ppid: 0,
            pgrp: 0,
            session: 0,
            tty_nr: 0,
            tpgid: 0,
            flags: 0,
            minflt: 0,
            cminflt: 0,
            majflt: 0,
            cmajflt: 0,
            utime: 0,
            stime: 0,
            cutime: 0,
            cstime: 0,
            priority: 0,
            nice: 0,
            num_threads: 0,
            itrealvalue: 0,
            starttime: 0,
            vsize: 0,
            rss: 0,
            rsslim: 0,
            startcode: 0,
            endcode: 0,
            startstack: 0,
            kstkesp: 0,
            kstkeip: 0,
            signal: 0,
            blocked: 0,
            sigignore: 0,
            sigcatch: 0,
            wchan: 0,
            nswap: 0,
            cnswap: 0,
            exit_signal: 0,
            processor: 0,
            rt_priority: 0,
            policy: 0,
            delayacct_blkio_ticks: 0,
            guest_time: 0,
            cguest_time: 0,
            fields: 0,
        }
    }
}

/// Parse one stat line.
///
/// The `comm` field is parenthesized and may itself contain spaces,
/// parentheses, and punctuation, so it is delimited by the *last* `)` on the
/// line; everything after that is whitespace-separated numbers plus the
/// one-letter state.
pub fn parse_stat(line: &str) -> Option<Stat> {
    let open = line.find('(')?;
    let close = line.rfind(')')?;
    if close < open {
        return None;
    }

    let mut stat = Stat::default();
    stat.pid = line[..open].trim().parse().ok()?;
    stat.comm = line[open + 1..close].to_string();
    stat.fields = 2;

    let mut tokens = line[close + 1..].split_ascii_whitespace();

    match tokens.next().and_then(|token| token.chars().next()) {
        Some(state) => {
            stat.state = state;
            stat.fields += 1;
        }
        None => return Some(stat),
    }

    // Each remaining field parses or the record ends there, like a scanf
    // that stops at the first mismatch.
    macro_rules! fields {
        ($($name:ident),* $(,)?) => {$(
            match tokens.next().and_then(|token| token.parse().ok()) {
                Some(value) => {
                    stat.$name = value;
                    stat.fields += 1;
                }
                None => return Some(stat),
            }
        )*};
    }

    fields!(
        ppid, pgrp, session, tty_nr, tpgid, flags, minflt, cminflt, majflt, cmajflt, utime,
        stime, cutime, cstime, priority, nice, num_threads, itrealvalue, starttime, vsize, rss,
        rsslim, startcode, endcode, startstack, kstkesp, kstkeip, signal, blocked, sigignore,
        sigcatch, wchan, nswap, cnswap, exit_signal, processor, rt_priority, policy,
        delayacct_blkio_ticks, guest_time, cguest_time,
    );

    Some(stat)
}

fn read_stat(path: impl AsRef<Path>) -> Result<Stat> {
    let line = fs::read_to_string(path)?;

    parse_stat(line.trim_end()).ok_or(Error::Parse { what: "/proc stat record" })
}

/// Parsed record of `/proc/<pid>/stat`.
pub fn stat(pid: Pid) -> Result<Stat> {
    read_stat(format!("/proc/{}/stat", pid.as_raw()))
}

/// Parsed record of `/proc/<pid>/task/<tid>/stat`.
pub fn thread_stat(pid: Pid, tid: Pid) -> Result<Stat> {
    read_stat(format!("/proc/{}/task/{}/stat", pid.as_raw(), tid.as_raw()))
}

/// Summary of one running process, as listed under `/proc`.
#[derive(Clone, Debug)]
pub struct ProcessInfo {
    pub pid: libc::pid_t,
    pub uid: libc::uid_t,
    pub user: Option<String>,
    pub name: String,
}

/// Every process on the system, keyed by pid. Entries that vanish or fail to
/// parse mid-scan are skipped or partially filled, never fatal.
pub fn enumerate_processes() -> BTreeMap<libc::pid_t, ProcessInfo> {
    let mut processes = BTreeMap::new();

    let entries = match fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(_) => return processes,
    };

    for entry in entries.flatten() {
        let pid = match entry.file_name().to_str().and_then(|name| name.parse().ok()) {
            Some(pid) => pid,
            None => continue,
        };

        let name = stat(Pid::from_raw(pid))
            .ok()
            .filter(|stat| stat.fields >= 2)
            .map(|stat| stat.comm)
            .unwrap_or_default();

        let uid = entry.metadata().map(|meta| meta.uid()).unwrap_or(0);
        let user = unistd::User::from_uid(Uid::from_raw(uid))
            .ok()
            .flatten()
            .map(|user| user.name);

        processes.insert(pid, ProcessInfo { pid, uid, user, name });
    }

    processes
}

/// Parent pid of `pid` (stat field 4), or 0 when it cannot be read.
pub fn parent_pid(pid: Pid) -> libc::pid_t {
    match stat(pid) {
        Ok(stat) if stat.fields >= 4 => stat.ppid,
        _ => 0,
    }
}

/// Human label for a kernel task state letter.
pub fn state_name(state: char) -> &'static str {
    match state {
        'R' => "Running",
        'S' => "Sleeping",
        'D' => "Disk Sleep",
        'T' => "Stopped",
        't' => "Tracing Stop",
        'Z' => "Zombie",
        'X' | 'x' => "Dead",
        'W' => "Waking/Paging",
        'K' => "Wakekill",
        'P' => "Parked",
        _ => "Unknown",
    }
}

/// Metadata for one kernel thread, from `/proc/<pid>/task/<tid>/stat`.
#[derive(Clone, Debug)]
pub struct ThreadInfo {
    pub name: String,
    pub tid: Pid,
    pub ip: Address,
    pub priority: i64,
    pub state: char,
}

impl ThreadInfo {
    /// The state in "letter (label)" form, e.g. `"t (Tracing Stop)"`.
    pub fn state_display(&self) -> String {
        format!("{} ({})", self.state, state_name(self.state))
    }
}

/// Thread metadata; falls back to an empty record when the stat line cannot
/// be read or is too short.
pub fn thread_info(pid: Pid, tid: Pid) -> ThreadInfo {
    match thread_stat(pid, tid) {
        Ok(stat) if stat.fields >= 30 => ThreadInfo {
            name: stat.comm,
            tid,
            ip: stat.kstkeip,
            priority: stat.priority,
            state: stat.state,
        },
        _ => ThreadInfo { name: String::new(), tid, ip: 0, priority: 0, state: '?' },
    }
}

/// The numeric entries of `/proc/<pid>/task/`: one tid per kernel thread.
pub fn task_ids(pid: Pid) -> io::Result<Vec<Pid>> {
    let mut tids = Vec::new();

    for entry in fs::read_dir(format!("/proc/{}/task", pid.as_raw()))? {
        let entry = entry?;
        if let Some(tid) = entry.file_name().to_str().and_then(|name| name.parse().ok()) {
            tids.push(Pid::from_raw(tid));
        }
    }

    Ok(tids)
}
