//! Execution thread. Owns the debugee and the breakpoint registry, every OS and trap engine
//! call of a session happens here.

use crate::debugger::address::RelocatedAddress;
use crate::debugger::breakpoint::{
    BreakpointKind, BreakpointRegistry, SavedBytes, Selector, SoftwareTrap,
};
use crate::debugger::engine::{DebugEvent, Debuggee, Platform, Resume};
use crate::debugger::error::Error;
use crate::debugger::execution::{
    ExceptionPolicy, ExecutionState, SessionEnd, SteppingMode, StopReason,
};
use crate::debugger::process::LaunchTarget;
use crate::debugger::{BreakpointChange, EventHook};
use crate::{muted_error, print_warns, weak_error};
use log::{debug, warn};
use nix::unistd::Pid;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::Arc;

/// Work on the registry, executed by the execution thread while debugee is stopped.
pub type RegistryJob = Box<dyn FnOnce(&mut BreakpointRegistry, &mut dyn Debuggee) + Send>;

/// Requests served by the execution thread while debugee is stopped.
pub enum Request {
    /// Resume debugee according to the stepping mode, reply when debugee is running.
    Resume(SyncSender<Result<(), Error>>),
    Registry(RegistryJob),
    /// Kill debugee and finish the session.
    Terminate,
}

/// Where debugee comes from.
pub enum Origin {
    Launch(LaunchTarget),
    Attach(Pid),
}

/// Decision made for a debug event.
enum Flow {
    Resume(Resume),
    Stop(StopReason),
    End(SessionEnd),
}

/// Result of request serving.
enum Served {
    /// Debugee resumed, optionally an event already observed while resuming.
    Resumed(Option<DebugEvent>),
    End(SessionEnd),
}

/// Software trap placed by a stepping command, not a part of the registry.
struct TransientBreakpoint {
    addr: RelocatedAddress,
    saved: SavedBytes,
}

/// Closes the run lock even if the execution thread unwinds.
struct CloseGuard(Arc<ExecutionState>);

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.0.set_end(SessionEnd::Lost(
            "execution thread terminated unexpectedly".to_string(),
        ));
        self.0.run_lock.close();
    }
}

/// Execution thread body: create or attach debugee and serve it until the session ends.
pub fn execute(
    platform: Arc<dyn Platform>,
    origin: Origin,
    state: Arc<ExecutionState>,
    hook: Arc<dyn EventHook>,
    requests: Receiver<Request>,
) {
    let _guard = CloseGuard(state.clone());

    let debuggee = match origin {
        Origin::Launch(ref target) => platform.launch(target),
        Origin::Attach(pid) => platform.attach(pid),
    };
    let debuggee = match debuggee {
        Ok(debuggee) => debuggee,
        Err(e) => {
            warn!(target: "tracer", "debugee initialization fail: {e:#}");
            state.set_end(SessionEnd::Lost(e.to_string()));
            hook.on_session_end(&SessionEnd::Lost(e.to_string()));
            return;
        }
    };
    state.set_pid(debuggee.pid());
    state.set_interrupter(debuggee.interrupter());

    let mut tracer = Tracer {
        debuggee,
        registry: BreakpointRegistry::default(),
        state: state.clone(),
        hook: hook.clone(),
        requests,
        transient: None,
        step_over_target: None,
        pending_exception: None,
        memory_step_over: None,
    };

    let end = match tracer.serve() {
        Ok(end) => end,
        Err(e) => {
            warn!(target: "tracer", "debug session lost: {e:#}");
            muted_error!(tracer.debuggee.terminate());
            SessionEnd::Lost(e.to_string())
        }
    };
    debug!(target: "tracer", "session end: {end:?}");

    tracer.registry.forget_all();
    state.set_end(end.clone());
    // notify before close, so waiters observe a fully finished session
    hook.on_session_end(&end);
    state.run_lock.close();
}

pub struct Tracer {
    debuggee: Box<dyn Debuggee>,
    registry: BreakpointRegistry,
    state: Arc<ExecutionState>,
    hook: Arc<dyn EventHook>,
    requests: Receiver<Request>,
    transient: Option<TransientBreakpoint>,
    /// Return site of a call being stepped over, trapped by a transient or a user breakpoint.
    step_over_target: Option<RelocatedAddress>,
    /// Exception debugee stopped on.
    pending_exception: Option<i32>,
    /// Restoring memory breakpoint to step over on next resume.
    memory_step_over: Option<RelocatedAddress>,
}

impl Tracer {
    fn serve(&mut self) -> Result<SessionEnd, Error> {
        let mut pending = None;
        loop {
            let event = match pending.take() {
                Some(event) => event,
                None => self.debuggee.wait_event()?,
            };
            debug!(target: "tracer", "debug event: {event:?}");

            match self.on_event(event)? {
                Flow::Resume(resume) => self.debuggee.resume(resume)?,
                Flow::End(end) => return Ok(end),
                Flow::Stop(reason) => {
                    self.enter_stop(reason);
                    match self.serve_requests()? {
                        Served::Resumed(event) => pending = event,
                        Served::End(end) => return Ok(end),
                    }
                }
            }
        }
    }

    /// Serve foreground requests until debugee resumed or session over.
    fn serve_requests(&mut self) -> Result<Served, Error> {
        loop {
            let Ok(request) = self.requests.recv() else {
                debug!(target: "tracer", "foreground gone, terminate debugee");
                return self.terminate().map(Served::End);
            };

            match request {
                Request::Registry(job) => job(&mut self.registry, self.debuggee.as_mut()),
                Request::Terminate => return self.terminate().map(Served::End),
                Request::Resume(reply) => {
                    if self.state.detach_requested.load(Ordering::Acquire) {
                        match self.detach() {
                            Ok(end) => {
                                _ = reply.send(Ok(()));
                                return Ok(Served::End(end));
                            }
                            Err(e) => {
                                warn!(target: "tracer", "detach fail: {e:#}");
                                self.state.detach_requested.store(false, Ordering::Release);
                                self.state.run_lock.lock();
                                _ = reply.send(Err(e));
                                continue;
                            }
                        }
                    }
                    if let Some(end) = self.requested_end()? {
                        _ = reply.send(Ok(()));
                        return Ok(Served::End(end));
                    }

                    match self.leave_stop() {
                        Ok(event) => {
                            _ = reply.send(Ok(()));
                            return Ok(Served::Resumed(event));
                        }
                        Err(e) => {
                            self.remove_transient();
                            self.state.set_stepping(SteppingMode::None);
                            self.state.run_lock.lock();
                            _ = reply.send(Err(e));
                        }
                    }
                }
            }
        }
    }

    fn enter_stop(&mut self, reason: StopReason) {
        self.remove_transient();
        self.state.set_stepping(SteppingMode::None);
        // a pause that raced with another stop is already satisfied
        self.state.paused_by_user.store(false, Ordering::Release);
        self.state.set_last_stop(reason.clone());
        self.hook.on_stop(&reason);
        self.state.run_lock.lock();
    }

    /// Detach or terminate debugee if the foreground asked for it.
    fn requested_end(&mut self) -> Result<Option<SessionEnd>, Error> {
        if self.state.detach_requested.load(Ordering::Acquire) {
            return self.detach().map(Some);
        }
        if self.state.terminate_requested.load(Ordering::Acquire) {
            return self.terminate().map(Some);
        }
        Ok(None)
    }

    fn on_event(&mut self, event: DebugEvent) -> Result<Flow, Error> {
        if let DebugEvent::Exited(code) = event {
            return Ok(Flow::End(SessionEnd::Exited(code)));
        }
        if let Some(end) = self.requested_end()? {
            return Ok(Flow::End(end));
        }

        let flow = match event {
            DebugEvent::Started => {
                if let Some(pid) = self.state.pid() {
                    self.hook.on_session_start(pid);
                }
                Flow::Stop(StopReason::Entry)
            }
            DebugEvent::Breakpoint(addr) => {
                if self.transient.as_ref().is_some_and(|t| t.addr == addr) {
                    return Ok(Flow::Stop(StopReason::Step(addr)));
                }
                match self.registry.hit_software(addr) {
                    Some(view) => {
                        self.hook.on_breakpoint(BreakpointChange::Hit, &view);
                        if view.singleshot {
                            weak_error!(
                                self.registry.delete(
                                    self.debuggee.engine(),
                                    BreakpointKind::Software,
                                    &Selector::Address(addr)
                                ),
                                "remove singleshot breakpoint:"
                            );
                        }
                        Flow::Stop(StopReason::Breakpoint(view))
                    }
                    None => self.continue_flow(),
                }
            }
            DebugEvent::HardwareBreakpoint(register) => {
                match self.registry.find_hardware_by_register(register) {
                    Some(view) => {
                        self.hook.on_breakpoint(BreakpointChange::Hit, &view);
                        Flow::Stop(StopReason::Breakpoint(view))
                    }
                    None => self.continue_flow(),
                }
            }
            DebugEvent::MemoryBreakpoint(addr) => match self.registry.hit_memory(addr) {
                Some(view) => {
                    self.hook.on_breakpoint(BreakpointChange::Hit, &view);
                    let selector = Selector::Address(view.addr);
                    if view.singleshot {
                        weak_error!(
                            self.registry.delete(
                                self.debuggee.engine(),
                                BreakpointKind::Memory,
                                &selector
                            ),
                            "remove singleshot memory breakpoint:"
                        );
                    } else {
                        self.memory_step_over = Some(view.addr);
                    }
                    Flow::Stop(StopReason::Breakpoint(view))
                }
                None => self.continue_flow(),
            },
            DebugEvent::SingleStep => match self.state.stepping() {
                SteppingMode::StepInto => Flow::Stop(StopReason::Step(self.debuggee.program_counter()?)),
                SteppingMode::StepOver if self.step_over_target.is_none() => {
                    Flow::Stop(StopReason::Step(self.debuggee.program_counter()?))
                }
                SteppingMode::SingleStep(left) if left <= 1 => {
                    Flow::Stop(StopReason::Step(self.debuggee.program_counter()?))
                }
                SteppingMode::SingleStep(left) => {
                    self.state.set_stepping(SteppingMode::SingleStep(left - 1));
                    Flow::Resume(Resume::step())
                }
                _ => self.continue_flow(),
            },
            DebugEvent::Exception(signal) => {
                if self.state.skip_exceptions.swap(false, Ordering::AcqRel) {
                    debug!(target: "tracer", "skip exception {signal}");
                    self.continue_flow()
                } else {
                    self.pending_exception = Some(signal);
                    Flow::Stop(StopReason::Exception(signal))
                }
            }
            DebugEvent::ForcedBreak => {
                if self.state.paused_by_user.swap(false, Ordering::AcqRel) {
                    Flow::Stop(StopReason::Paused)
                } else {
                    self.continue_flow()
                }
            }
            DebugEvent::Exited(code) => Flow::End(SessionEnd::Exited(code)),
        };
        Ok(flow)
    }

    /// Resume debugee without a stop, keeping current stepping mode.
    fn continue_flow(&self) -> Flow {
        Flow::Resume(self.resume_kind(self.state.stepping()))
    }

    fn resume_kind(&self, mode: SteppingMode) -> Resume {
        match mode {
            SteppingMode::StepInto | SteppingMode::SingleStep(_) => Resume::step(),
            SteppingMode::StepOver if self.step_over_target.is_none() => Resume::step(),
            _ => Resume::run(),
        }
    }

    /// Prepare and resume a stopped debugee. Return an event if it was observed while
    /// stepping over a trap at the current location.
    fn leave_stop(&mut self) -> Result<Option<DebugEvent>, Error> {
        let mode = self.state.stepping();
        match mode {
            SteppingMode::StepOver => {
                if let Some(return_site) = self.debuggee.call_return_site()? {
                    self.set_transient(return_site)?;
                    self.step_over_target = Some(return_site);
                }
            }
            SteppingMode::RunToReturn => match self.debuggee.return_address()? {
                Some(ret_addr) => self.set_transient(ret_addr)?,
                None => warn!(target: "tracer", "return address unknown, continue execution"),
            },
            _ => {}
        }

        let mut deliver = None;
        if let Some(signal) = self.pending_exception.take() {
            if self.state.skip_exceptions.swap(false, Ordering::AcqRel) {
                debug!(target: "tracer", "skip exception {signal}");
            } else if self.state.exception_policy() == ExceptionPolicy::NotHandled {
                deliver = Some(signal);
            }
        }

        let pc = self.debuggee.program_counter()?;
        let step_over = match self.memory_step_over.take() {
            Some(base) => Some((BreakpointKind::Memory, base)),
            None => self
                .registry
                .hit_software(pc)
                .map(|_| (BreakpointKind::Software, pc)),
        };

        if let Some((kind, addr)) = step_over {
            let event = self.step_over_trap(kind, addr, deliver)?;
            let is_step = matches!(self.resume_kind(mode), Resume { step: true, .. });
            if event != DebugEvent::SingleStep || is_step {
                return Ok(Some(event));
            }
            deliver = None;
        }

        let resume = Resume {
            deliver,
            ..self.resume_kind(mode)
        };
        self.debuggee.resume(resume)?;
        Ok(None)
    }

    /// Execute one instruction with a user trap at current location removed.
    fn step_over_trap(
        &mut self,
        kind: BreakpointKind,
        addr: RelocatedAddress,
        deliver: Option<i32>,
    ) -> Result<DebugEvent, Error> {
        let selector = Selector::Address(addr);
        self.registry
            .disable(self.debuggee.engine(), kind, &selector)?;
        self.debuggee.resume(Resume {
            step: true,
            deliver,
        })?;
        let event = self.debuggee.wait_event()?;
        if !matches!(event, DebugEvent::Exited(_)) {
            self.registry
                .enable(self.debuggee.engine(), kind, &selector)?;
        }
        Ok(event)
    }

    fn set_transient(&mut self, addr: RelocatedAddress) -> Result<(), Error> {
        if self.registry.hit_software(addr).is_some() {
            // a user breakpoint already stops debugee there
            return Ok(());
        }
        let saved = self
            .debuggee
            .install_software_trap(addr, SoftwareTrap::Int3Short)?;
        debug!(target: "tracer", "transient breakpoint at {addr}");
        self.transient = Some(TransientBreakpoint { addr, saved });
        Ok(())
    }

    fn remove_transient(&mut self) {
        self.step_over_target = None;
        if let Some(transient) = self.transient.take() {
            weak_error!(
                self.debuggee
                    .remove_software_trap(transient.addr, &transient.saved),
                "remove transient breakpoint:"
            );
        }
    }

    /// Remove all traps and release debugee. On failure traps are installed back and debugee
    /// stays under control.
    fn detach(&mut self) -> Result<SessionEnd, Error> {
        self.remove_transient();
        let armed: Vec<_> = [
            BreakpointKind::Software,
            BreakpointKind::Hardware,
            BreakpointKind::Memory,
        ]
        .into_iter()
        .flat_map(|kind| {
            self.registry
                .snapshot(kind)
                .into_iter()
                .filter(|view| view.enabled)
                .map(move |view| (kind, view.addr))
        })
        .collect();
        print_warns!(self.registry.detach_all(self.debuggee.engine()));

        if let Err(e) = self.debuggee.detach() {
            for (kind, addr) in armed {
                weak_error!(
                    self.registry
                        .enable(self.debuggee.engine(), kind, &Selector::Address(addr)),
                    "restore breakpoint after detach fail:"
                );
            }
            return Err(e);
        }
        Ok(SessionEnd::Detached)
    }

    fn terminate(&mut self) -> Result<SessionEnd, Error> {
        self.debuggee.terminate()?;
        Ok(SessionEnd::Terminated)
    }
}
