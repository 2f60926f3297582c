use nix::unistd::Pid;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use trapctl::debugger::breakpoint::SavedBytes;
use trapctl::debugger::engine::{
    DebugEvent, Debuggee, Interrupt, MemoryMap, MemoryRegion, Platform, ProcessControl, Resume,
    TrapEngine,
};
use trapctl::debugger::register::debug::DebugRegisterNumber;
use trapctl::debugger::{
    Architecture, BreakCondition, BreakSize, BreakpointChange, BreakpointView, Error, EventHook,
    LaunchTarget, MemoryAccess, RelocatedAddress, SessionEnd, SoftwareTrap, StopReason,
};

pub const DEBUGEE_PID: i32 = 4242;
pub const MISSING_APP: &str = "/missing/app";
pub const X86_APP: &str = "/apps/x86";

pub fn addr(value: usize) -> RelocatedAddress {
    RelocatedAddress::from(value)
}

/// Trap engine call observed by the fake debugee.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    InstallSoftware(RelocatedAddress, SoftwareTrap),
    RemoveSoftware(RelocatedAddress, Vec<u8>),
    InstallHardware(RelocatedAddress, DebugRegisterNumber),
    RemoveHardware(DebugRegisterNumber),
    InstallMemory(RelocatedAddress, usize),
    RemoveMemory(RelocatedAddress, usize),
}

/// Scripted outcome of `wait_event`.
#[derive(Clone, Copy, Debug)]
pub enum Scripted {
    Event(DebugEvent),
    /// Waiting for the debugee fails.
    Fail,
}

#[derive(Default)]
pub struct FakeState {
    pub calls: Vec<Call>,
    pub resumes: Vec<Resume>,
    script: VecDeque<Scripted>,
    pub pc: usize,
    pub return_address: Option<RelocatedAddress>,
    pub call_return_site: Option<RelocatedAddress>,
    /// Engine calls fail while set.
    pub engine_fails: bool,
    /// Next detach fails.
    pub detach_fails: bool,
    pub detached: bool,
    pub terminated: bool,
}

/// Debugee state shared between the test and the fake platform.
#[derive(Clone, Default)]
pub struct Fake {
    inner: Arc<(Mutex<FakeState>, Condvar)>,
}

impl Fake {
    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.inner.0.lock().unwrap()
    }

    /// Queue an event for the execution thread.
    pub fn push(&self, event: DebugEvent) {
        self.push_scripted(Scripted::Event(event));
    }

    pub fn push_scripted(&self, scripted: Scripted) {
        self.state().script.push_back(scripted);
        self.inner.1.notify_all();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn resumes(&self) -> Vec<Resume> {
        self.state().resumes.clone()
    }

    fn next_event(&self) -> Scripted {
        let mut state = self
            .inner
            .1
            .wait_while(self.state(), |s| s.script.is_empty())
            .unwrap();
        let scripted = state.script.pop_front().unwrap();
        match scripted {
            Scripted::Event(DebugEvent::Breakpoint(addr)) => state.pc = addr.as_usize(),
            Scripted::Event(DebugEvent::SingleStep) => state.pc += 1,
            _ => {}
        }
        scripted
    }

    fn engine_call(&self, call: Call) -> Result<(), Error> {
        let mut state = self.state();
        if state.engine_fails {
            return Err(Error::Engine(anyhow::anyhow!("engine failure: {call:?}")));
        }
        state.calls.push(call);
        Ok(())
    }
}

pub struct FakeDebuggee {
    fake: Fake,
}

impl TrapEngine for FakeDebuggee {
    fn install_software_trap(
        &mut self,
        addr: RelocatedAddress,
        variant: SoftwareTrap,
    ) -> Result<SavedBytes, Error> {
        self.fake.engine_call(Call::InstallSoftware(addr, variant))?;
        Ok(SavedBytes::from_slice(&[0x55, 0x48][..variant.opcode().len()]))
    }

    fn remove_software_trap(
        &mut self,
        addr: RelocatedAddress,
        saved: &SavedBytes,
    ) -> Result<(), Error> {
        self.fake
            .engine_call(Call::RemoveSoftware(addr, saved.to_vec()))
    }

    fn install_hardware_trap(
        &mut self,
        addr: RelocatedAddress,
        register: DebugRegisterNumber,
        _: BreakCondition,
        _: BreakSize,
    ) -> Result<(), Error> {
        self.fake.engine_call(Call::InstallHardware(addr, register))
    }

    fn remove_hardware_trap(&mut self, register: DebugRegisterNumber) -> Result<(), Error> {
        self.fake.engine_call(Call::RemoveHardware(register))
    }

    fn install_memory_trap(
        &mut self,
        base: RelocatedAddress,
        size: usize,
        _: MemoryAccess,
        _: bool,
    ) -> Result<(), Error> {
        self.fake.engine_call(Call::InstallMemory(base, size))
    }

    fn remove_memory_trap(&mut self, base: RelocatedAddress, size: usize) -> Result<(), Error> {
        self.fake.engine_call(Call::RemoveMemory(base, size))
    }
}

impl MemoryMap for FakeDebuggee {
    fn region_containing(&self, addr: RelocatedAddress) -> Option<MemoryRegion> {
        [(0x10000, 0x1000), (0x400000, 0x10000)]
            .into_iter()
            .map(|(base, size)| MemoryRegion {
                base: RelocatedAddress::from(base as usize),
                size,
            })
            .find(|region| addr.in_range(region.base, region.size))
    }
}

struct FakeInterrupt(Fake);

impl Interrupt for FakeInterrupt {
    fn force_break(&self) -> Result<(), Error> {
        self.0.push(DebugEvent::ForcedBreak);
        Ok(())
    }
}

impl ProcessControl for FakeDebuggee {
    fn pid(&self) -> Pid {
        Pid::from_raw(DEBUGEE_PID)
    }

    fn wait_event(&mut self) -> Result<DebugEvent, Error> {
        match self.fake.next_event() {
            Scripted::Event(event) => Ok(event),
            Scripted::Fail => Err(Error::SessionLost("debugee process vanished".to_string())),
        }
    }

    fn resume(&mut self, resume: Resume) -> Result<(), Error> {
        let mut state = self.fake.state();
        state.resumes.push(resume);
        if resume.step {
            state.script.push_back(Scripted::Event(DebugEvent::SingleStep));
            self.fake.inner.1.notify_all();
        }
        Ok(())
    }

    fn program_counter(&mut self) -> Result<RelocatedAddress, Error> {
        Ok(RelocatedAddress::from(self.fake.state().pc))
    }

    fn return_address(&mut self) -> Result<Option<RelocatedAddress>, Error> {
        Ok(self.fake.state().return_address)
    }

    fn call_return_site(&mut self) -> Result<Option<RelocatedAddress>, Error> {
        Ok(self.fake.state().call_return_site)
    }

    fn detach(&mut self) -> Result<(), Error> {
        let mut state = self.fake.state();
        if state.detach_fails {
            state.detach_fails = false;
            return Err(Error::Ptrace(nix::errno::Errno::ESRCH));
        }
        state.detached = true;
        Ok(())
    }

    fn terminate(&mut self) -> Result<(), Error> {
        self.fake.state().terminated = true;
        Ok(())
    }

    fn interrupter(&self) -> Arc<dyn Interrupt> {
        Arc::new(FakeInterrupt(self.fake.clone()))
    }
}

/// Platform that creates fake debugees. Every session starts with a `Started` event.
pub struct FakePlatform {
    fake: Fake,
    process_arch: Architecture,
}

impl FakePlatform {
    pub fn new(fake: Fake) -> Self {
        Self {
            fake,
            process_arch: Architecture::X86_64,
        }
    }

    pub fn with_process_arch(fake: Fake, arch: Architecture) -> Self {
        Self {
            fake,
            process_arch: arch,
        }
    }

    fn debuggee(&self) -> Box<dyn Debuggee> {
        self.fake.push(DebugEvent::Started);
        Box::new(FakeDebuggee {
            fake: self.fake.clone(),
        })
    }
}

impl Platform for FakePlatform {
    fn host_architecture(&self) -> Architecture {
        Architecture::X86_64
    }

    fn file_architecture(&self, path: &Path) -> Result<Architecture, Error> {
        match path.to_str() {
            Some(MISSING_APP) => Err(Error::TargetNotFound(path.to_path_buf())),
            Some(X86_APP) => Ok(Architecture::X86),
            _ => Ok(Architecture::X86_64),
        }
    }

    fn process_architecture(&self, _: Pid) -> Result<Architecture, Error> {
        Ok(self.process_arch.clone())
    }

    fn launch(&self, _: &LaunchTarget) -> Result<Box<dyn Debuggee>, Error> {
        Ok(self.debuggee())
    }

    fn attach(&self, _: Pid) -> Result<Box<dyn Debuggee>, Error> {
        Ok(self.debuggee())
    }
}

/// Notifications observed by a test.
#[derive(Clone, Default)]
pub struct TestInfo {
    pub changes: Arc<Mutex<Vec<(BreakpointChange, usize)>>>,
    pub stops: Arc<Mutex<Vec<StopReason>>>,
    pub ends: Arc<Mutex<Vec<SessionEnd>>>,
    pub started: Arc<Mutex<Option<Pid>>>,
}

#[derive(Default)]
pub struct TestHooks {
    info: TestInfo,
}

impl TestHooks {
    pub fn new(info: TestInfo) -> Self {
        Self { info }
    }
}

impl EventHook for TestHooks {
    fn on_breakpoint(&self, change: BreakpointChange, view: &BreakpointView) {
        self.info
            .changes
            .lock()
            .unwrap()
            .push((change, view.addr.as_usize()));
    }

    fn on_resume(&self) {}

    fn on_stop(&self, reason: &StopReason) {
        self.info.stops.lock().unwrap().push(reason.clone());
    }

    fn on_session_start(&self, pid: Pid) {
        *self.info.started.lock().unwrap() = Some(pid);
    }

    fn on_session_end(&self, end: &SessionEnd) {
        self.info.ends.lock().unwrap().push(end.clone());
    }
}

/// Create a debugger over a fake platform and start a session stopped at entry.
#[macro_export]
macro_rules! debugger_env {
    ($fake:ident, $info:ident, $debugger:ident, $code: block) => {{
        let $fake = $crate::common::Fake::default();
        let $info = $crate::common::TestInfo::default();
        let mut $debugger = trapctl::debugger::Debugger::new(
            $crate::common::FakePlatform::new($fake.clone()),
            $crate::common::TestHooks::new($info.clone()),
        );
        $debugger
            .start(trapctl::debugger::LaunchTarget::new("/apps/hello", ["world"]))
            .unwrap();
        assert_eq!(
            $debugger.wait_for_stop().unwrap(),
            trapctl::debugger::StopReason::Entry
        );
        $code
    }};
}
