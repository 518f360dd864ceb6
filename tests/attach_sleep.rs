//! Attach / pause / detach lifecycle against a sleeping child.

use std::time::Duration;

use anyhow::Result;
use ntest::timeout;
use pretty_assertions::assert_eq;
use remora::{Pid, ResumePolicy, Session, Signal};

mod support;
use support::*;

#[test]
#[timeout(20000)]
fn attach_pause_detach() -> Result<()> {
    let child = ChildGuard::spawn("sleep", &["30"])?;
    let pid = Pid::from_raw(child.id() as i32);

    let mut session = Session::new()?;
    session.attach(pid)?;

    assert!(session.attached());
    assert_eq!(session.pid(), Some(pid));
    assert_eq!(session.thread_ids(), vec![pid]);
    assert_eq!(session.active_thread(), Some(pid));

    // The attach stop was consumed by the sweep; nothing is pending.
    assert!(session.wait_event(Some(Duration::from_millis(100)))?.is_none());

    session.resume(ResumePolicy::Normal)?;
    session.pause()?;

    let event = wait_for_event(&mut session)?;
    eprintln!("{event:?}");

    assert!(event.is_stop());
    assert_eq!(event.tid(), pid);
    assert_eq!(event.stop_signal(), Some(Signal::SIGSTOP));

    // Stop-the-world: every tracked thread has a consumed stop.
    assert!(session.threads().all_waited());
    assert_eq!(session.event_thread(), Some(pid));

    session.detach()?;
    assert!(!session.attached());
    assert!(session.thread_ids().is_empty());

    Ok(())
}

#[test]
#[timeout(20000)]
fn reports_thread_info() -> Result<()> {
    let child = ChildGuard::spawn("sleep", &["30"])?;
    let pid = Pid::from_raw(child.id() as i32);

    let mut session = Session::new()?;
    session.attach(pid)?;

    let info = session.get_thread_info(pid)?;
    assert_eq!(info.tid, pid);
    assert_eq!(info.name, "sleep");

    // Attached and not yet resumed: the kernel reports a tracing stop.
    assert_eq!(info.state, 't');
    assert_eq!(info.state_display(), "t (Tracing Stop)");

    session.detach()?;
    Ok(())
}
