//! Collaborators that the core orchestrates but does not implement: the trap engine,
//! the memory map, process/thread control of the OS and the platform that creates
//! debug sessions. [`crate::debugger::linux`] provides the ptrace based implementation.

use crate::debugger::address::RelocatedAddress;
use crate::debugger::breakpoint::{MemoryAccess, SavedBytes, SoftwareTrap};
use crate::debugger::error::Error;
use crate::debugger::process::{Architecture, LaunchTarget};
use crate::debugger::register::debug::{BreakCondition, BreakSize, DebugRegisterNumber};
use nix::unistd::Pid;
use std::path::Path;
use std::sync::Arc;

/// Installs and removes traps in debugee. All parameters are validated by the caller.
pub trait TrapEngine {
    /// Write a trap instruction, return overwritten bytes.
    fn install_software_trap(
        &mut self,
        addr: RelocatedAddress,
        variant: SoftwareTrap,
    ) -> Result<SavedBytes, Error>;

    /// Restore original bytes at `addr`.
    fn remove_software_trap(
        &mut self,
        addr: RelocatedAddress,
        saved: &SavedBytes,
    ) -> Result<(), Error>;

    /// Program a debug register on every thread.
    fn install_hardware_trap(
        &mut self,
        addr: RelocatedAddress,
        register: DebugRegisterNumber,
        condition: BreakCondition,
        size: BreakSize,
    ) -> Result<(), Error>;

    fn remove_hardware_trap(&mut self, register: DebugRegisterNumber) -> Result<(), Error>;

    /// Guard a memory region. If `restore` is set the guard is reinstalled after each hit.
    fn install_memory_trap(
        &mut self,
        base: RelocatedAddress,
        size: usize,
        access: MemoryAccess,
        restore: bool,
    ) -> Result<(), Error>;

    fn remove_memory_trap(&mut self, base: RelocatedAddress, size: usize) -> Result<(), Error>;
}

/// Memory region of debugee address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: RelocatedAddress,
    pub size: usize,
}

pub trait MemoryMap {
    /// Return a mapped region that contains `addr`.
    fn region_containing(&self, addr: RelocatedAddress) -> Option<MemoryRegion>;
}

/// Event observed by the execution thread while debugee is running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DebugEvent {
    /// Process created or attached, first stop of a session.
    Started,
    /// Software trap fired, program counter already points at the trap address.
    Breakpoint(RelocatedAddress),
    /// Hardware trap fired.
    HardwareBreakpoint(DebugRegisterNumber),
    /// Access to a guarded region, contains the faulting address.
    MemoryBreakpoint(RelocatedAddress),
    /// One instruction executed.
    SingleStep,
    /// Non-breakpoint exception (signal on unix).
    Exception(i32),
    /// Stop caused by [`Interrupt::force_break`].
    ForcedBreak,
    /// Whole debugee process exited with code.
    Exited(i32),
}

/// How debugee must be resumed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Resume {
    /// Trap after a single instruction.
    pub step: bool,
    /// Exception that debugee must handle itself.
    pub deliver: Option<i32>,
}

impl Resume {
    pub fn run() -> Self {
        Self::default()
    }

    pub fn step() -> Self {
        Self {
            step: true,
            deliver: None,
        }
    }
}

/// OS level control of a debugee process. Used only from the execution thread.
pub trait ProcessControl {
    fn pid(&self) -> Pid;

    /// Block until next debug event.
    fn wait_event(&mut self) -> Result<DebugEvent, Error>;

    fn resume(&mut self, resume: Resume) -> Result<(), Error>;

    /// Return program counter of the thread in focus.
    fn program_counter(&mut self) -> Result<RelocatedAddress, Error>;

    /// Return address of the current function, `None` if unknown.
    fn return_address(&mut self) -> Result<Option<RelocatedAddress>, Error>;

    /// If the instruction at program counter is a call, return the address of the
    /// instruction after it.
    fn call_return_site(&mut self) -> Result<Option<RelocatedAddress>, Error>;

    fn detach(&mut self) -> Result<(), Error>;

    fn terminate(&mut self) -> Result<(), Error>;

    /// Return a handle that can break into debugee from any thread.
    fn interrupter(&self) -> Arc<dyn Interrupt>;
}

pub trait Interrupt: Send + Sync {
    /// Force debugee to stop at the next instruction boundary the OS can deliver.
    fn force_break(&self) -> Result<(), Error>;
}

/// Everything the execution thread needs from a debugee.
pub trait Debuggee: ProcessControl + TrapEngine + MemoryMap + Send {
    fn engine(&mut self) -> &mut dyn TrapEngine;

    fn maps(&self) -> &dyn MemoryMap;
}

impl<T: ProcessControl + TrapEngine + MemoryMap + Send> Debuggee for T {
    fn engine(&mut self) -> &mut dyn TrapEngine {
        self
    }

    fn maps(&self) -> &dyn MemoryMap {
        self
    }
}

/// Source of debug sessions.
pub trait Platform: Send + Sync {
    fn host_architecture(&self) -> Architecture;

    /// Return architecture of an executable file.
    fn file_architecture(&self, path: &Path) -> Result<Architecture, Error>;

    /// Return architecture of a running process.
    fn process_architecture(&self, pid: Pid) -> Result<Architecture, Error>;

    /// Create a process. Called from the execution thread.
    fn launch(&self, target: &LaunchTarget) -> Result<Box<dyn Debuggee>, Error>;

    /// Attach to a running process. Called from the execution thread.
    fn attach(&self, pid: Pid) -> Result<Box<dyn Debuggee>, Error>;
}
