//! Ptrace based platform for x86-64 Linux.

mod debuggee;
mod threads;
mod traps;

pub use debuggee::PtraceDebuggee;

use crate::debugger::engine::{Debuggee, Interrupt, Platform};
use crate::debugger::error::Error;
use crate::debugger::process::{self, Architecture, Child, LaunchTarget};
use log::debug;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

/// Breaks into a debugee with `SIGSTOP`.
pub struct LinuxInterrupt {
    pid: Pid,
    /// Set until the stop is observed by the execution thread.
    pending: AtomicBool,
}

impl LinuxInterrupt {
    fn new(pid: Pid) -> Self {
        Self {
            pid,
            pending: AtomicBool::new(false),
        }
    }
}

impl Interrupt for LinuxInterrupt {
    fn force_break(&self) -> Result<(), Error> {
        debug!(target: "tracer", "force break into {}", self.pid);
        self.pending.store(true, Ordering::Release);
        signal::kill(self.pid, Signal::SIGSTOP).map_err(|e| {
            self.pending.store(false, Ordering::Release);
            Error::Syscall("kill", e)
        })
    }
}

/// Platform that launches and attaches debugee processes with ptrace.
#[derive(Default)]
pub struct LinuxPlatform {
    /// Signals passed to debugee without a stop.
    quiet_signals: Vec<Signal>,
}

impl LinuxPlatform {
    pub fn new(quiet_signals: Vec<Signal>) -> Self {
        Self { quiet_signals }
    }
}

impl Platform for LinuxPlatform {
    fn host_architecture(&self) -> Architecture {
        Architecture::host()
    }

    fn file_architecture(&self, path: &Path) -> Result<Architecture, Error> {
        Architecture::of_file(path)
    }

    fn process_architecture(&self, pid: Pid) -> Result<Architecture, Error> {
        Architecture::of_file(&process::process_exe(pid)?)
    }

    fn launch(&self, target: &LaunchTarget) -> Result<Box<dyn Debuggee>, Error> {
        let child = Child::new(target.clone()).install()?;
        Ok(Box::new(PtraceDebuggee::new(
            child.pid(),
            child.threads(),
            false,
            self.quiet_signals.clone(),
        )))
    }

    fn attach(&self, pid: Pid) -> Result<Box<dyn Debuggee>, Error> {
        let child = Child::from_external(pid)?;
        debug!(target: "tracer", "attached to {}", child.program().display());
        Ok(Box::new(PtraceDebuggee::new(
            child.pid(),
            child.threads(),
            true,
            self.quiet_signals.clone(),
        )))
    }
}
