//! Spawn-to-exit lifecycle via `open`.

use std::path::Path;

use anyhow::Result;
use ntest::timeout;
use pretty_assertions::assert_eq;
use remora::{Error, ResumePolicy, Session, Signal};

mod support;
use support::*;

#[test]
#[timeout(20000)]
fn spawned_tracee_runs_to_exit() -> Result<()> {
    let mut session = Session::new()?;
    session.open(Path::new("/bin/true"), None, &[], None)?;

    assert!(session.attached());
    let pid = session.pid().unwrap();
    assert_eq!(session.thread_ids(), vec![pid]);

    // open() absorbed the exec stop; its SIGTRAP is on record.
    let record = session.threads().get(pid).unwrap();
    assert_eq!(record.last_status().stop_signal(), Some(Signal::SIGTRAP));

    session.resume(ResumePolicy::Normal)?;

    let event = wait_for_event(&mut session)?;
    eprintln!("{event:?}");

    assert!(event.is_exit());
    assert_eq!(event.tid(), pid);
    assert_eq!(event.status().exit_code(), Some(0));

    // The terminal event resets the session.
    assert!(!session.attached());
    assert!(session.thread_ids().is_empty());

    Ok(())
}

#[test]
#[timeout(20000)]
fn open_rejects_missing_binaries() -> Result<()> {
    let mut session = Session::new()?;

    let err = session
        .open(Path::new("/no/such/binary"), None, &[], None)
        .unwrap_err();

    assert!(matches!(err, Error::InitialStop { .. }));
    assert!(!session.attached());

    Ok(())
}

#[test]
#[timeout(20000)]
fn double_resume_is_rejected() -> Result<()> {
    let mut session = Session::new()?;
    session.open(Path::new("/bin/sleep"), None, &["30"], None)?;

    session.resume(ResumePolicy::Normal)?;

    // No thread has a pending stop now; a second continuation is a bug.
    let err = session.resume(ResumePolicy::Normal).unwrap_err();
    assert!(matches!(err, Error::ThreadNotStopped { .. }));

    // Stop the tracee again so it can be killed from a stop.
    session.pause()?;
    let event = wait_for_event(&mut session)?;
    assert!(event.is_stop());

    session.kill()?;
    assert!(!session.attached());

    Ok(())
}
