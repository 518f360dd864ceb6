//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::process::{Child, Command};
use std::time::Duration;

use anyhow::Result;
use remora::{DebugEvent, Session};

/// An untraced helper child, killed and reaped on drop.
pub struct ChildGuard(pub Child);

impl ChildGuard {
    pub fn spawn(program: &str, args: &[&str]) -> Result<Self> {
        let child = Command::new(program).args(args).spawn()?;

        // Give the child a moment to make it through exec, so tests observe
        // the running program rather than the pre-exec stub.
        std::thread::sleep(Duration::from_millis(100));

        Ok(Self(child))
    }

    pub fn id(&self) -> u32 {
        self.0.id()
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

/// Pump `wait_event` in short slices until an event arrives. The per-call
/// timeout keeps the pump live even if another harness thread swallows a
/// SIGCHLD notification.
pub fn wait_for_event(session: &mut Session) -> Result<DebugEvent> {
    loop {
        if let Some(event) = session.wait_event(Some(Duration::from_millis(50)))? {
            return Ok(event);
        }
    }
}
