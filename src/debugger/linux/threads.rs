use crate::debugger::error::Error;
use crate::debugger::error::Error::Ptrace;
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::HashMap;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ThreadStatus {
    Stopped,
    Running,
}

/// Debugee threads attached with ptrace.
pub struct ThreadRegistry {
    process_pid: Pid,
    in_focus: Pid,
    threads: HashMap<Pid, ThreadStatus>,
    /// Signals that interrupted a thread while the whole process was stopping, delivered
    /// on next resume.
    pending_signals: HashMap<Pid, Signal>,
}

impl ThreadRegistry {
    pub fn new(process_pid: Pid, threads: &[Pid]) -> Self {
        let mut registry = Self {
            process_pid,
            in_focus: process_pid,
            threads: HashMap::from([(process_pid, ThreadStatus::Stopped)]),
            pending_signals: HashMap::new(),
        };
        threads.iter().for_each(|&tid| {
            registry.add(tid);
        });
        registry
    }

    /// Return pid of debugee process main thread.
    pub fn proc_pid(&self) -> Pid {
        self.process_pid
    }

    /// Return thread which event caused last stop.
    pub fn focus(&self) -> Pid {
        self.in_focus
    }

    pub fn set_focus(&mut self, tid: Pid) {
        self.in_focus = tid
    }

    pub fn contains(&self, tid: Pid) -> bool {
        self.threads.contains_key(&tid)
    }

    /// Add a stopped thread.
    pub fn add(&mut self, tid: Pid) {
        debug!(target: "tracer", "add new tracee, thread: {tid}");
        self.threads.insert(tid, ThreadStatus::Stopped);
    }

    pub fn remove(&mut self, tid: Pid) {
        debug!(target: "tracer", "remove tracee, thread: {tid}");
        self.threads.remove(&tid);
        self.pending_signals.remove(&tid);
        if self.in_focus == tid {
            self.in_focus = self.process_pid;
        }
    }

    pub fn set_status(&mut self, tid: Pid, status: ThreadStatus) {
        if let Some(s) = self.threads.get_mut(&tid) {
            *s = status;
        }
    }

    pub fn all(&self) -> Vec<Pid> {
        self.threads.keys().copied().collect()
    }

    pub fn running(&self) -> Vec<Pid> {
        self.threads
            .iter()
            .filter(|(_, s)| **s == ThreadStatus::Running)
            .map(|(tid, _)| *tid)
            .collect()
    }

    pub fn stopped(&self) -> Vec<Pid> {
        self.threads
            .iter()
            .filter(|(_, s)| **s == ThreadStatus::Stopped)
            .map(|(tid, _)| *tid)
            .collect()
    }

    pub fn defer_signal(&mut self, tid: Pid, signal: Signal) {
        debug!(target: "tracer", "defer signal {signal} for thread {tid}");
        self.pending_signals.insert(tid, signal);
    }

    /// Resume a thread, if signal is some - inject it.
    /// A thread that no longer exists is ignored, it will be removed on exit event.
    pub fn resume(&mut self, tid: Pid, step: bool, signal: Option<Signal>) -> Result<(), Error> {
        let signal = signal.or_else(|| self.pending_signals.remove(&tid));
        let result = if step {
            sys::ptrace::step(tid, signal)
        } else {
            sys::ptrace::cont(tid, signal)
        };
        match result {
            Ok(()) => {}
            Err(Errno::ESRCH) => warn!(target: "tracer", "thread {tid} not found, ESRCH"),
            Err(e) => return Err(Ptrace(e)),
        }
        self.set_status(tid, ThreadStatus::Running);
        Ok(())
    }

    /// Continue all currently stopped threads, signal is injected into the thread in focus.
    pub fn cont_stopped(&mut self, signal: Option<Signal>) -> Result<(), Error> {
        let mut errors = vec![];
        for tid in self.stopped() {
            let signal = if tid == self.in_focus { signal } else { None };
            if let Err(e) = self.resume(tid, false, signal) {
                errors.push(e);
            }
        }

        if !errors.is_empty() {
            return Err(Error::MultipleErrors(errors));
        }
        Ok(())
    }

    /// Wait for the next status change of a single thread.
    pub fn wait_one(tid: Pid) -> Result<WaitStatus, Error> {
        waitpid(tid, Some(WaitPidFlag::__WALL)).map_err(Error::Waitpid)
    }
}
