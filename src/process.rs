//! Bulk tracee memory access through `/proc/<pid>/mem`.

use std::fs;
use std::io;
use std::os::unix::fs::FileExt;

use nix::unistd::Pid;

use crate::Address;

/// Read access to another process's address space, as consumed by the
/// module enumerator.
pub trait ProcessMemory {
    /// Read exactly `buf.len()` bytes at `address`. Returns false if any
    /// part of the range is unreadable.
    fn read_bytes(&self, address: Address, buf: &mut [u8]) -> bool;
}

/// Handle to the attached process for bulk memory reads.
///
/// The memory file is opened per call and closed before returning; no
/// long-lived handle is kept.
#[derive(Clone, Debug)]
pub struct Process {
    pid: Pid,
}

impl Process {
    pub(crate) fn new(pid: Pid) -> Self {
        Self { pid }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    fn mem_path(&self) -> String {
        format!("/proc/{}/mem", self.pid.as_raw())
    }

    /// Read up to `buf.len()` bytes of tracee memory at `address`; returns
    /// the number of bytes read, which is short when the range runs off the
    /// end of a mapping.
    pub fn read_memory(&self, address: Address, buf: &mut [u8]) -> io::Result<usize> {
        let mem = fs::File::open(self.mem_path())?;
        mem.read_at(buf, address as u64)
    }
}

impl ProcessMemory for Process {
    fn read_bytes(&self, address: Address, buf: &mut [u8]) -> bool {
        let mem = match fs::File::open(self.mem_path()) {
            Ok(mem) => mem,
            Err(_) => return false,
        };

        mem.read_exact_at(buf, address as u64).is_ok()
    }
}
