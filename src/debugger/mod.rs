pub mod address;
pub mod breakpoint;
mod code;
pub mod engine;
pub mod error;
pub mod execution;
pub mod linux;
pub mod process;
pub mod register;
pub mod session;
pub mod tracer;

pub use address::RelocatedAddress;
pub use breakpoint::{
    BreakpointKind, BreakpointView, BulkOutcome, MemoryAccess, Selector, SoftwareTrap, Toggle,
    TrapSpec,
};
pub use error::{Error, ErrorKind};
pub use execution::{ExceptionPolicy, ExecutionController, SessionEnd, StopReason};
pub use process::{Architecture, LaunchTarget};
pub use register::debug::{BreakCondition, BreakSize};
pub use session::SessionState;

use crate::debugger::breakpoint::BreakpointRegistry;
use crate::debugger::engine::{Debuggee, Platform};
use crate::debugger::execution::RunState;
use crate::debugger::session::Session;
use crate::debugger::tracer::Request;
use nix::unistd::Pid;
use std::sync::mpsc;
use std::sync::Arc;

/// What happened to a breakpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakpointChange {
    Created,
    Enabled,
    Disabled,
    Deleted,
    Hit,
}

/// Debugger notifications, called from the execution thread (except `on_resume`).
/// Implementations must not block.
pub trait EventHook: Send + Sync {
    fn on_breakpoint(&self, change: BreakpointChange, view: &BreakpointView);
    fn on_resume(&self);
    fn on_stop(&self, reason: &StopReason);
    fn on_session_start(&self, pid: Pid);
    fn on_session_end(&self, end: &SessionEnd);
}

pub struct NopHook;

impl EventHook for NopHook {
    fn on_breakpoint(&self, _: BreakpointChange, _: &BreakpointView) {}
    fn on_resume(&self) {}
    fn on_stop(&self, _: &StopReason) {}
    fn on_session_start(&self, _: Pid) {}
    fn on_session_end(&self, _: &SessionEnd) {}
}

/// Main structure of the crate. Controls a single debug session at time.
pub struct Debugger {
    platform: Arc<dyn Platform>,
    hook: Arc<dyn EventHook>,
    session: Option<Session>,
    /// Trap used by software breakpoints without an explicit type.
    default_software_trap: SoftwareTrap,
    /// Policy for new sessions.
    exception_policy: ExceptionPolicy,
}

impl Debugger {
    pub fn new(platform: impl Platform + 'static, hook: impl EventHook + 'static) -> Self {
        Self {
            platform: Arc::new(platform),
            hook: Arc::new(hook),
            session: None,
            default_software_trap: SoftwareTrap::default(),
            exception_policy: ExceptionPolicy::default(),
        }
    }

    pub fn default_software_trap(&self) -> SoftwareTrap {
        self.default_software_trap
    }

    pub fn set_default_software_trap(&mut self, variant: SoftwareTrap) {
        self.default_software_trap = variant;
    }

    /// Set exception policy for the current and all future sessions.
    pub fn set_exception_policy(&mut self, policy: ExceptionPolicy) {
        self.exception_policy = policy;
        if let Some(session) = self.live_session() {
            session.controller.set_exception_policy(policy);
        }
    }

    pub fn exception_policy(&self) -> ExceptionPolicy {
        self.exception_policy
    }

    /// Return execution controller of an active session.
    pub fn controller(&self) -> Result<&ExecutionController, Error> {
        self.live_session()
            .map(|s| &s.controller)
            .ok_or(Error::NotDebugging)
    }

    pub fn run(&self) -> Result<(), Error> {
        self.controller()?.run()
    }

    pub fn step_into(&self) -> Result<(), Error> {
        self.controller()?.step_into()
    }

    pub fn step_over(&self) -> Result<(), Error> {
        self.controller()?.step_over()
    }

    pub fn single_step(&self, count: u32) -> Result<(), Error> {
        self.controller()?.single_step(count)
    }

    pub fn run_to_return(&self) -> Result<(), Error> {
        self.controller()?.run_to_return()
    }

    pub fn skip_next_exception(&self) -> Result<(), Error> {
        self.controller()?.skip_next_exception()
    }

    pub fn pause(&self) -> Result<(), Error> {
        self.controller()?.pause()
    }

    pub fn wait_for_stop(&self) -> Result<StopReason, Error> {
        self.controller()?.wait_for_stop()
    }

    /// Execute a function with the breakpoint registry on the execution thread.
    /// Debugee must be stopped.
    fn with_registry<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&mut BreakpointRegistry, &mut dyn Debuggee) -> T + Send + 'static,
    {
        let session = self.live_session().ok_or(Error::NotDebugging)?;
        match session.controller.state().run_lock.state() {
            RunState::Stopped => {}
            RunState::Running => return Err(Error::NotStopped),
            RunState::Closed => return Err(Error::NotDebugging),
        }

        let lost = || Error::SessionLost("execution thread is gone".to_string());
        let (tx, rx) = mpsc::sync_channel(0);
        session
            .requests
            .send(Request::Registry(Box::new(move |registry, debuggee| {
                _ = tx.send(f(registry, debuggee));
            })))
            .map_err(|_| lost())?;
        rx.recv().map_err(|_| lost())
    }

    /// Create a breakpoint and install its trap. Breakpoint is not created if trap
    /// installation fails.
    pub fn set_breakpoint(
        &self,
        addr: RelocatedAddress,
        name: Option<&str>,
        spec: TrapSpec,
    ) -> Result<BreakpointView, Error> {
        let name = name.map(ToOwned::to_owned);
        let hook = self.hook.clone();
        self.with_registry(move |registry, debuggee| {
            let view = registry.create(debuggee.maps(), addr, name.as_deref(), spec)?;
            hook.on_breakpoint(BreakpointChange::Created, &view);

            let kind = view.kind;
            let selector = Selector::Address(view.addr);
            if let Err(e) = registry.enable(debuggee.engine(), kind, &selector) {
                _ = registry.delete(debuggee.engine(), kind, &selector);
                hook.on_breakpoint(BreakpointChange::Deleted, &view);
                return Err(e);
            }

            let view = registry.get(kind, &selector).unwrap_or(view);
            hook.on_breakpoint(BreakpointChange::Enabled, &view);
            Ok(view)
        })?
    }

    /// Create a software breakpoint with default trap type.
    pub fn set_software_breakpoint(
        &self,
        addr: RelocatedAddress,
        name: Option<&str>,
        singleshot: bool,
    ) -> Result<BreakpointView, Error> {
        let spec = TrapSpec::Software {
            variant: self.default_software_trap,
            singleshot,
        };
        self.set_breakpoint(addr, name, spec)
    }

    /// Create a disabled breakpoint.
    pub fn create_breakpoint(
        &self,
        addr: RelocatedAddress,
        name: Option<&str>,
        spec: TrapSpec,
    ) -> Result<BreakpointView, Error> {
        let name = name.map(ToOwned::to_owned);
        let hook = self.hook.clone();
        self.with_registry(move |registry, debuggee| {
            let view = registry.create(debuggee.maps(), addr, name.as_deref(), spec)?;
            hook.on_breakpoint(BreakpointChange::Created, &view);
            Ok(view)
        })?
    }

    fn toggle(
        &self,
        kind: BreakpointKind,
        selector: Selector,
        enable: bool,
    ) -> Result<Toggle, Error> {
        let hook = self.hook.clone();
        self.with_registry(move |registry, debuggee| {
            let toggle = if enable {
                registry.enable(debuggee.engine(), kind, &selector)
            } else {
                registry.disable(debuggee.engine(), kind, &selector)
            };
            if let Some(view) = registry.get(kind, &selector) {
                match (&toggle, enable) {
                    (Ok(Toggle::Changed), true) => hook.on_breakpoint(BreakpointChange::Enabled, &view),
                    // disabled even if trap removal fails
                    (Ok(Toggle::Changed) | Err(_), false) if !view.enabled => {
                        hook.on_breakpoint(BreakpointChange::Disabled, &view)
                    }
                    _ => {}
                }
            }
            toggle
        })?
    }

    pub fn enable_breakpoint(&self, kind: BreakpointKind, selector: Selector) -> Result<Toggle, Error> {
        self.toggle(kind, selector, true)
    }

    pub fn disable_breakpoint(&self, kind: BreakpointKind, selector: Selector) -> Result<Toggle, Error> {
        self.toggle(kind, selector, false)
    }

    pub fn delete_breakpoint(
        &self,
        kind: BreakpointKind,
        selector: Selector,
    ) -> Result<BreakpointView, Error> {
        let hook = self.hook.clone();
        self.with_registry(move |registry, debuggee| {
            let view = registry.delete(debuggee.engine(), kind, &selector)?;
            hook.on_breakpoint(BreakpointChange::Deleted, &view);
            Ok(view)
        })?
    }

    pub fn enable_all_breakpoints(&self, kind: BreakpointKind) -> Result<BulkOutcome, Error> {
        self.with_registry(move |registry, debuggee| registry.enable_all(debuggee.engine(), kind))
    }

    pub fn disable_all_breakpoints(&self, kind: BreakpointKind) -> Result<BulkOutcome, Error> {
        self.with_registry(move |registry, debuggee| registry.disable_all(debuggee.engine(), kind))
    }

    pub fn delete_all_breakpoints(&self, kind: BreakpointKind) -> Result<BulkOutcome, Error> {
        self.with_registry(move |registry, debuggee| registry.delete_all(debuggee.engine(), kind))
    }

    pub fn breakpoint(
        &self,
        kind: BreakpointKind,
        selector: Selector,
    ) -> Result<Option<BreakpointView>, Error> {
        self.with_registry(move |registry, _| registry.get(kind, &selector))
    }

    /// Return all breakpoints of a kind in creation order.
    pub fn breakpoints(&self, kind: BreakpointKind) -> Result<Vec<BreakpointView>, Error> {
        self.with_registry(move |registry, _| registry.snapshot(kind))
    }
}
