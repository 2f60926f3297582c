//! Foreground half of execution control: the run lock, state shared with the execution
//! thread and [`ExecutionController`] that turns user commands into resume requests.

use crate::debugger::address::RelocatedAddress;
use crate::debugger::breakpoint::BreakpointView;
use crate::debugger::engine::Interrupt;
use crate::debugger::error::Error;
use crate::debugger::tracer::Request;
use crate::debugger::EventHook;
use log::debug;
use nix::unistd::Pid;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use strum_macros::{Display, EnumString};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    /// Debugee stopped, safe to inspect and mutate.
    Stopped,
    /// Debugee running, breakpoint operations are refused.
    Running,
    /// Execution thread finished.
    Closed,
}

/// Gate between the foreground and the execution thread.
pub struct RunLock {
    state: Mutex<RunState>,
    changed: Condvar,
}

impl RunLock {
    pub fn new(state: RunState) -> Self {
        Self {
            state: Mutex::new(state),
            changed: Condvar::new(),
        }
    }

    fn guard(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> RunState {
        *self.guard()
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == RunState::Stopped
    }

    /// Atomically switch Stopped to Running. `on_unlock` is called under the lock, before
    /// the transition becomes visible.
    pub fn unlock_with(&self, on_unlock: impl FnOnce()) -> Result<(), Error> {
        let mut state = self.guard();
        match *state {
            RunState::Stopped => {
                on_unlock();
                *state = RunState::Running;
                self.changed.notify_all();
                Ok(())
            }
            RunState::Running => Err(Error::AlreadyRunning),
            RunState::Closed => Err(Error::NotDebugging),
        }
    }

    /// Call `on_running` under the lock if debugee is running.
    pub fn with_running<T>(
        &self,
        on_running: impl FnOnce() -> Result<T, Error>,
    ) -> Result<T, Error> {
        let state = self.guard();
        match *state {
            RunState::Running => on_running(),
            _ => Err(Error::NotRunning),
        }
    }

    /// Switch to Stopped, a closed lock stays closed.
    pub fn lock(&self) {
        let mut state = self.guard();
        if *state != RunState::Closed {
            *state = RunState::Stopped;
            self.changed.notify_all();
        }
    }

    pub fn close(&self) {
        *self.guard() = RunState::Closed;
        self.changed.notify_all();
    }

    /// Block while debugee is running.
    pub fn wait_while_running(&self) -> RunState {
        let state = self
            .changed
            .wait_while(self.guard(), |state| *state == RunState::Running)
            .unwrap_or_else(PoisonError::into_inner);
        *state
    }
}

/// Pending stepping command.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SteppingMode {
    #[default]
    None,
    StepInto,
    StepOver,
    /// Count of instructions left.
    SingleStep(u32),
    RunToReturn,
}

/// What to do with an exception debugee stopped on, when it resumes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, EnumString, Display, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ExceptionPolicy {
    /// Swallow exception, debugee never sees it.
    #[default]
    Continue,
    /// Pass exception to debugee handlers.
    NotHandled,
}

/// Why debugee stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// First stop of a session.
    Entry,
    Breakpoint(BreakpointView),
    /// Stepping command completed at address.
    Step(RelocatedAddress),
    /// Stopped by [`ExecutionController::pause`].
    Paused,
    Exception(i32),
}

/// How a debug session ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    Exited(i32),
    Detached,
    Terminated,
    /// Execution thread failed.
    Lost(String),
}

impl SessionEnd {
    pub fn to_error(&self) -> Error {
        match self {
            SessionEnd::Exited(code) => Error::ProcessExit(*code),
            SessionEnd::Detached => Error::Detached,
            SessionEnd::Terminated => Error::NotDebugging,
            SessionEnd::Lost(reason) => Error::SessionLost(reason.clone()),
        }
    }
}

/// State of a single debug session shared between the foreground and the execution thread.
pub struct ExecutionState {
    pub run_lock: RunLock,
    stepping: Mutex<SteppingMode>,
    pub skip_exceptions: AtomicBool,
    pub paused_by_user: AtomicBool,
    pub detach_requested: AtomicBool,
    pub terminate_requested: AtomicBool,
    exception_policy: Mutex<ExceptionPolicy>,
    last_stop: Mutex<Option<StopReason>>,
    end: Mutex<Option<SessionEnd>>,
    pid: AtomicI32,
    interrupt: Mutex<Option<Arc<dyn Interrupt>>>,
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ExecutionState {
    pub fn new(exception_policy: ExceptionPolicy) -> Self {
        Self {
            // the session begins as running until the first debug event
            run_lock: RunLock::new(RunState::Running),
            stepping: Mutex::default(),
            skip_exceptions: AtomicBool::new(false),
            paused_by_user: AtomicBool::new(false),
            detach_requested: AtomicBool::new(false),
            terminate_requested: AtomicBool::new(false),
            exception_policy: Mutex::new(exception_policy),
            last_stop: Mutex::default(),
            end: Mutex::default(),
            pid: AtomicI32::new(0),
            interrupt: Mutex::default(),
        }
    }

    pub fn stepping(&self) -> SteppingMode {
        *locked(&self.stepping)
    }

    pub fn set_stepping(&self, mode: SteppingMode) {
        *locked(&self.stepping) = mode;
    }

    pub fn exception_policy(&self) -> ExceptionPolicy {
        *locked(&self.exception_policy)
    }

    pub fn set_exception_policy(&self, policy: ExceptionPolicy) {
        *locked(&self.exception_policy) = policy;
    }

    pub fn last_stop(&self) -> Option<StopReason> {
        locked(&self.last_stop).clone()
    }

    pub fn set_last_stop(&self, reason: StopReason) {
        *locked(&self.last_stop) = Some(reason);
    }

    pub fn end(&self) -> Option<SessionEnd> {
        locked(&self.end).clone()
    }

    /// Store session end reason, first stored reason wins.
    pub fn set_end(&self, end: SessionEnd) {
        locked(&self.end).get_or_insert(end);
    }

    /// Return debugee pid, `None` until the debugee is created.
    pub fn pid(&self) -> Option<Pid> {
        match self.pid.load(Ordering::Acquire) {
            0 => None,
            raw => Some(Pid::from_raw(raw)),
        }
    }

    pub fn set_pid(&self, pid: Pid) {
        self.pid.store(pid.as_raw(), Ordering::Release);
    }

    pub fn interrupter(&self) -> Option<Arc<dyn Interrupt>> {
        locked(&self.interrupt).clone()
    }

    pub fn set_interrupter(&self, interrupt: Arc<dyn Interrupt>) {
        *locked(&self.interrupt) = Some(interrupt);
    }

    /// Break into the running debugee, no-op until the debugee is created.
    pub fn force_break(&self) -> Result<(), Error> {
        match self.interrupter() {
            Some(interrupt) => interrupt.force_break(),
            None => Ok(()),
        }
    }
}

fn session_lost() -> Error {
    Error::SessionLost("execution thread is gone".to_string())
}

/// Commands that move debugee between stopped and running states.
#[derive(Clone)]
pub struct ExecutionController {
    state: Arc<ExecutionState>,
    requests: SyncSender<Request>,
    hook: Arc<dyn EventHook>,
}

impl ExecutionController {
    pub(super) fn new(
        state: Arc<ExecutionState>,
        requests: SyncSender<Request>,
        hook: Arc<dyn EventHook>,
    ) -> Self {
        Self {
            state,
            requests,
            hook,
        }
    }

    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    /// Continue debugee execution in a stepping mode.
    fn resume(&self, mode: SteppingMode) -> Result<(), Error> {
        self.state.run_lock.unlock_with(|| {
            // a pause that raced with the last stop must not interrupt this run
            self.state.paused_by_user.store(false, Ordering::Release);
            self.state.set_stepping(mode);
        })?;
        debug!(target: "debugger", "resume debugee, stepping: {mode:?}");

        let (tx, rx) = mpsc::sync_channel(0);
        self.requests
            .send(Request::Resume(tx))
            .map_err(|_| session_lost())?;
        rx.recv().map_err(|_| session_lost())??;

        self.hook.on_resume();
        Ok(())
    }

    /// Continue debugee execution until next stop event.
    pub fn run(&self) -> Result<(), Error> {
        self.resume(SteppingMode::None)
    }

    /// Execute one instruction, enter a called function.
    pub fn step_into(&self) -> Result<(), Error> {
        self.resume(SteppingMode::StepInto)
    }

    /// Execute one instruction, a called function is executed in full.
    pub fn step_over(&self) -> Result<(), Error> {
        self.resume(SteppingMode::StepOver)
    }

    /// Execute `count` instructions, zero is treated as one.
    pub fn single_step(&self, count: u32) -> Result<(), Error> {
        self.resume(SteppingMode::SingleStep(count.max(1)))
    }

    /// Run until current function returns.
    pub fn run_to_return(&self) -> Result<(), Error> {
        self.resume(SteppingMode::RunToReturn)
    }

    /// Swallow the next exception debugee raises (or the one it stopped on).
    pub fn skip_next_exception(&self) -> Result<(), Error> {
        if !self.state.run_lock.is_stopped() {
            return Err(Error::NotStopped);
        }
        self.state.skip_exceptions.store(true, Ordering::Release);
        Ok(())
    }

    /// Stop a running debugee.
    pub fn pause(&self) -> Result<(), Error> {
        self.state.run_lock.with_running(|| {
            let interrupt = self.state.interrupter().ok_or(Error::NotRunning)?;
            self.state.paused_by_user.store(true, Ordering::Release);
            interrupt.force_break()
        })
    }

    pub fn set_exception_policy(&self, policy: ExceptionPolicy) {
        self.state.set_exception_policy(policy);
    }

    /// Block until debugee stops. Return an error describing session end if the session
    /// is over.
    pub fn wait_for_stop(&self) -> Result<StopReason, Error> {
        match self.state.run_lock.wait_while_running() {
            RunState::Stopped => self.state.last_stop().ok_or(Error::NotRunning),
            _ => Err(self
                .state
                .end()
                .map(|end| end.to_error())
                .unwrap_or_else(session_lost)),
        }
    }
}
