//! `/proc` process and thread enumeration.

use nix::unistd::{getppid, getuid, Pid};
use pretty_assertions::assert_eq;
use remora::procfs;

#[test]
fn enumerates_running_processes() {
    let processes = procfs::enumerate_processes();
    let me = std::process::id() as i32;

    let info = processes.get(&me).expect("own pid listed");
    assert_eq!(info.pid, me);
    assert!(!info.name.is_empty());

    // Directory ownership maps to a uid; for us, our own.
    assert_eq!(info.uid, getuid().as_raw());
}

#[test]
fn parent_chain_is_consistent() {
    let me = Pid::from_raw(std::process::id() as i32);
    let parent = procfs::parent_pid(me);

    assert_eq!(parent, getppid().as_raw());

    // The parent is alive, so enumeration lists it (0 is only for init).
    let processes = procfs::enumerate_processes();
    assert!(parent == 0 || processes.contains_key(&parent));
}

#[test]
fn reports_thread_state() {
    let me = Pid::from_raw(std::process::id() as i32);
    let info = procfs::thread_info(me, me);

    assert_eq!(info.tid, me);
    assert!(!info.name.is_empty());

    // The main thread is running or sleeping while we look at it.
    assert!(matches!(info.state, 'R' | 'S'));
    assert!(info.state_display().ends_with(')'));
}
