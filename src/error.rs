use std::io;

use nix::unistd::Pid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no tracee is attached")]
    NotAttached,

    /// A continuation or ptrace query was issued for a thread whose stop has
    /// not been consumed by `waitpid`. This is a caller bug, not a kernel
    /// condition.
    #[error("thread {tid} has no pending stop to consume")]
    ThreadNotStopped { tid: Pid },

    #[error("thread {tid} is not tracked by this session")]
    UnknownThread { tid: Pid },

    #[error("could not attach to thread = {tid}")]
    Attach { tid: Pid, source: nix::Error },

    #[error("error waiting on tracees")]
    Wait { source: nix::Error },

    #[error("could not spawn tracee")]
    Spawn { source: nix::Error },

    /// The first post-exec event of a spawned tracee was not a SIGTRAP stop.
    #[error("unexpected first stop of new tracee (status = {status:#x})")]
    InitialStop { status: i32 },

    #[error("could not parse {what}")]
    Parse { what: &'static str },

    #[error("input/output error")]
    InputOutput(#[from] io::Error),

    #[error("unexpected kernel error")]
    Kernel(#[from] nix::Error),
}
