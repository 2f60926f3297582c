//! Debug session lifecycle: start, attach, stop and detach.

use crate::debugger::error::Error;
use crate::debugger::execution::{ExecutionController, ExecutionState, RunState, SessionEnd};
use crate::debugger::process::LaunchTarget;
use crate::debugger::tracer::{self, Origin, Request};
use crate::debugger::{Debugger, EventHook};
use crate::weak_error;
use log::{debug, info};
use nix::unistd::Pid;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use strum_macros::Display;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum SessionState {
    /// No debugee.
    Idle,
    /// Debugee is being created or attached.
    Initializing,
    Running,
    Stopped,
    /// Stop or detach in progress.
    Terminating,
}

/// Foreground handles of a single debug session.
pub(super) struct Session {
    pub(super) controller: ExecutionController,
    pub(super) requests: SyncSender<Request>,
    thread: JoinHandle<()>,
}

impl Session {
    fn execution(&self) -> &ExecutionState {
        self.controller.state()
    }

    fn is_closed(&self) -> bool {
        self.execution().run_lock.state() == RunState::Closed
    }

    /// Wait for the execution thread and return how the session ended.
    fn join(self) -> Result<SessionEnd, Error> {
        if self.thread.join().is_err() {
            return Err(Error::SessionLost("execution thread panicked".to_string()));
        }
        self.controller
            .state()
            .end()
            .ok_or_else(|| Error::SessionLost("session end is unknown".to_string()))
    }
}

impl Debugger {
    /// Return a session that was started and not yet reaped, possibly already closed.
    pub(super) fn live_session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn state(&self) -> SessionState {
        let Some(session) = self.live_session() else {
            return SessionState::Idle;
        };
        let execution = session.execution();
        let ending = execution.terminate_requested.load(Ordering::Acquire)
            || execution.detach_requested.load(Ordering::Acquire);

        match execution.run_lock.state() {
            RunState::Closed => SessionState::Idle,
            _ if ending => SessionState::Terminating,
            RunState::Stopped => SessionState::Stopped,
            RunState::Running if execution.last_stop().is_none() => SessionState::Initializing,
            RunState::Running => SessionState::Running,
        }
    }

    /// Return debugee pid, `None` if there is no debugee.
    pub fn pid(&self) -> Option<Pid> {
        self.live_session()
            .filter(|s| !s.is_closed())
            .and_then(|s| s.execution().pid())
    }

    /// Drop a finished session. Return an error if another session is still active.
    fn reap_session(&mut self) -> Result<(), Error> {
        match self.session.take() {
            None => Ok(()),
            Some(session) if session.is_closed() => {
                let end = session.join();
                debug!(target: "debugger", "previous session reaped: {end:?}");
                Ok(())
            }
            Some(session) => {
                self.session = Some(session);
                Err(Error::AlreadyDebugging)
            }
        }
    }

    fn spawn_session(&mut self, origin: Origin) -> Result<(), Error> {
        let state = Arc::new(ExecutionState::new(self.exception_policy));
        let (tx, rx) = mpsc::sync_channel(0);

        let platform = self.platform.clone();
        let hook: Arc<dyn EventHook> = self.hook.clone();
        let thread_state = state.clone();
        let thread = thread::Builder::new()
            .name("trapctl-tracer".to_string())
            .spawn(move || tracer::execute(platform, origin, thread_state, hook, rx))?;

        self.session = Some(Session {
            controller: ExecutionController::new(state, tx.clone(), self.hook.clone()),
            requests: tx,
            thread,
        });
        Ok(())
    }

    /// Create a debugee process from the target and start debugging it. Returns immediately,
    /// the first stop is [`crate::debugger::StopReason::Entry`].
    pub fn start(&mut self, target: LaunchTarget) -> Result<(), Error> {
        self.reap_session()?;

        let found = self.platform.file_architecture(&target.program)?;
        let expected = self.platform.host_architecture();
        if found != expected {
            return Err(Error::ArchitectureMismatch { expected, found });
        }

        info!(target: "debugger", "start debugging {}", target.program.display());
        self.spawn_session(Origin::Launch(target))
    }

    /// Attach to a running process.
    pub fn attach(&mut self, pid: Pid) -> Result<(), Error> {
        self.reap_session()?;

        let found = self.platform.process_architecture(pid)?;
        let expected = self.platform.host_architecture();
        if found != expected {
            return Err(Error::ArchitectureMismatch { expected, found });
        }

        info!(target: "debugger", "attach to process {pid}");
        self.spawn_session(Origin::Attach(pid))
    }

    /// Terminate debugee and end the session. Blocks until the execution thread finishes.
    pub fn stop(&mut self) -> Result<(), Error> {
        let session = self.session.take().ok_or(Error::NotDebugging)?;
        let execution = session.execution();
        execution.terminate_requested.store(true, Ordering::Release);

        loop {
            match execution.run_lock.state() {
                RunState::Stopped => {
                    // fails only if the thread is already gone
                    _ = session.requests.send(Request::Terminate);
                    break;
                }
                RunState::Running => {
                    weak_error!(execution.force_break(), "break into debugee:");
                    execution.run_lock.wait_while_running();
                }
                RunState::Closed => break,
            }
        }

        match session.join()? {
            SessionEnd::Lost(reason) => Err(Error::SessionLost(reason)),
            end => {
                info!(target: "debugger", "session stopped: {end:?}");
                Ok(())
            }
        }
    }

    /// Remove all traps and release the debugee, it continues running without debugger.
    pub fn detach(&mut self) -> Result<(), Error> {
        let state = self.state();
        let session = self.live_session().ok_or(Error::NotDebugging)?;
        match state {
            SessionState::Stopped => {}
            SessionState::Idle => return Err(Error::NotDebugging),
            other => return Err(Error::InvalidSessionState(other)),
        }

        let execution = session.execution();
        execution.detach_requested.store(true, Ordering::Release);
        let resume = || -> Result<(), Error> {
            execution.run_lock.unlock_with(|| {})?;
            let lost = || Error::SessionLost("execution thread is gone".to_string());
            let (tx, rx) = mpsc::sync_channel(0);
            session.requests.send(Request::Resume(tx)).map_err(|_| lost())?;
            rx.recv().map_err(|_| lost())?
        };
        if let Err(e) = resume() {
            execution.detach_requested.store(false, Ordering::Release);
            return Err(e);
        }
        execution.run_lock.wait_while_running();

        let Some(session) = self.session.take() else {
            return Err(Error::NotDebugging);
        };
        match session.join()? {
            SessionEnd::Detached => Ok(()),
            end => Err(end.to_error()),
        }
    }
}

impl Drop for Debugger {
    fn drop(&mut self) {
        if self.session.as_ref().is_some_and(|s| !s.is_closed()) {
            weak_error!(self.stop(), "stop debug session:");
        }
    }
}
