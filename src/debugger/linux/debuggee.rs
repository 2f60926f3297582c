use crate::debugger::address::RelocatedAddress;
use crate::debugger::breakpoint::{SavedBytes, SoftwareTrap};
use crate::debugger::code;
use crate::debugger::engine::{DebugEvent, Interrupt, ProcessControl, Resume};
use crate::debugger::error::Error;
use crate::debugger::error::Error::{Ptrace, Waitpid};
use crate::debugger::linux::threads::{ThreadRegistry, ThreadStatus};
use crate::debugger::linux::traps::GuardedRegion;
use crate::debugger::linux::LinuxInterrupt;
use crate::debugger::register::debug::DEBUG_REGISTER_COUNT;
use crate::debugger::register::debug::Dr7;
use crate::debugger::register::{Register, RegisterMap};
use crate::muted_error;
use capstone::prelude::*;
use log::{debug, warn};
use nix::errno::Errno;
use nix::libc;
use nix::sys;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Debugee process controlled by ptrace. Must be used from the thread that attached it.
pub struct PtraceDebuggee {
    pub(super) threads: ThreadRegistry,
    /// True after the first debug event was reported.
    started: bool,
    /// Attached process is already stopped, first event is reported without waiting.
    attached: bool,
    pub(super) software: HashMap<RelocatedAddress, (SoftwareTrap, SavedBytes)>,
    /// Addresses programmed into DR0-DR3 of every thread.
    pub(super) hardware: [Option<RelocatedAddress>; DEBUG_REGISTER_COUNT],
    pub(super) dr7: Dr7,
    pub(super) memory: HashMap<RelocatedAddress, GuardedRegion>,
    interrupt: Arc<LinuxInterrupt>,
    quiet_signals: Vec<Signal>,
}

impl PtraceDebuggee {
    pub fn new(
        pid: Pid,
        threads: &[Pid],
        attached: bool,
        quiet_signals: Vec<Signal>,
    ) -> Self {
        Self {
            threads: ThreadRegistry::new(pid, threads),
            started: false,
            attached,
            software: HashMap::new(),
            hardware: Default::default(),
            dr7: Dr7::default(),
            memory: HashMap::new(),
            interrupt: Arc::new(LinuxInterrupt::new(pid)),
            quiet_signals,
        }
    }

    fn registers(&self) -> Result<RegisterMap, Error> {
        RegisterMap::current(self.threads.focus()).map_err(Ptrace)
    }

    /// Stop all running threads with PTRACE_INTERRUPT, one by one.
    fn stop_others(&mut self) -> Result<(), Error> {
        for tid in self.threads.running() {
            match sys::ptrace::interrupt(tid) {
                Ok(()) => {}
                Err(Errno::ESRCH) => {
                    warn!(target: "tracer", "thread {tid} not found, ESRCH");
                    self.threads.remove(tid);
                    continue;
                }
                Err(e) => return Err(Ptrace(e)),
            }

            loop {
                let status = match ThreadRegistry::wait_one(tid) {
                    Ok(status) => status,
                    Err(Waitpid(Errno::ECHILD)) => {
                        self.threads.remove(tid);
                        break;
                    }
                    Err(e) => return Err(e),
                };
                debug!(target: "tracer", "interrupt thread {tid}, status: {status:?}");

                match status {
                    WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_STOP) => break,
                    WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_EXIT) => {
                        sys::ptrace::cont(tid, None).map_err(Ptrace)?;
                    }
                    WaitStatus::Exited(_, _) | WaitStatus::Signaled(_, _, _) => {
                        self.threads.remove(tid);
                        break;
                    }
                    WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                        // thread hit a trap concurrently, rewind it so the trap fires again
                        self.rewind_software_trap(tid)?;
                        break;
                    }
                    WaitStatus::Stopped(_, Signal::SIGSTOP)
                        if self.interrupt.pending.swap(false, Ordering::AcqRel) =>
                    {
                        // forced break is satisfied by this stop
                        break
                    }
                    WaitStatus::Stopped(_, signal) => {
                        self.threads.defer_signal(tid, signal);
                        break;
                    }
                    _ => break,
                }
            }
            self.threads.set_status(tid, ThreadStatus::Stopped);
        }
        Ok(())
    }

    /// If thread stopped right after a software trap, move program counter back to the
    /// trap address. Return trap address.
    fn rewind_software_trap(&self, tid: Pid) -> Result<Option<RelocatedAddress>, Error> {
        let mut regs = RegisterMap::current(tid).map_err(Ptrace)?;
        let pc = RelocatedAddress::from(regs.value(Register::Rip));

        let trap_addr = [SoftwareTrap::Int3Short, SoftwareTrap::Int3Long]
            .into_iter()
            .find_map(|variant| {
                let addr = pc.offset(-(variant.opcode().len() as isize));
                match self.software.get(&addr) {
                    Some((installed, _)) if *installed == variant => Some(addr),
                    _ => None,
                }
            });

        if let Some(addr) = trap_addr {
            regs.update(Register::Rip, addr.as_u64());
            regs.persist(tid).map_err(Ptrace)?;
        }
        Ok(trap_addr)
    }

    /// Classify a stop of a thread by a signal.
    fn decode_signal(&mut self, tid: Pid, signal: Signal) -> Result<Option<DebugEvent>, Error> {
        let info = match sys::ptrace::getsiginfo(tid) {
            Ok(info) => info,
            Err(Errno::ESRCH) => {
                self.threads.remove(tid);
                return Ok(None);
            }
            Err(e) => return Err(Ptrace(e)),
        };

        let event = match signal {
            Signal::SIGTRAP => match info.si_code {
                code::TRAP_TRACE | code::TRAP_HWBKPT => match self.take_fired_register(tid)? {
                    Some(register) => DebugEvent::HardwareBreakpoint(register),
                    None => DebugEvent::SingleStep,
                },
                code::TRAP_BRKPT | code::SI_KERNEL => match self.rewind_software_trap(tid)? {
                    Some(addr) => DebugEvent::Breakpoint(addr),
                    None => DebugEvent::Exception(signal as i32),
                },
                _ => DebugEvent::Exception(signal as i32),
            },
            Signal::SIGILL => {
                let pc = RelocatedAddress::from(
                    RegisterMap::current(tid).map_err(Ptrace)?.value(Register::Rip),
                );
                match self.software.get(&pc) {
                    Some((SoftwareTrap::Ud2, _)) => DebugEvent::Breakpoint(pc),
                    _ => DebugEvent::Exception(signal as i32),
                }
            }
            Signal::SIGSEGV if info.si_code == code::SEGV_ACCERR => {
                let addr = RelocatedAddress::from(unsafe { info.si_addr() } as usize);
                if self.memory.iter().any(|(base, r)| addr.in_range(*base, r.size)) {
                    DebugEvent::MemoryBreakpoint(addr)
                } else {
                    DebugEvent::Exception(signal as i32)
                }
            }
            Signal::SIGSTOP if self.interrupt.pending.swap(false, Ordering::AcqRel) => {
                DebugEvent::ForcedBreak
            }
            _ if self.quiet_signals.contains(&signal) => {
                debug!(target: "tracer", "deliver quiet signal {signal} to {tid}");
                self.threads.resume(tid, false, Some(signal))?;
                return Ok(None);
            }
            _ => DebugEvent::Exception(signal as i32),
        };
        Ok(Some(event))
    }

    /// Handle a new thread, it starts with PTRACE_EVENT_STOP.
    fn on_new_thread(&mut self, tid: Pid) -> Result<(), Error> {
        self.threads.add(tid);
        if let Err(e) = self.apply_debug_registers(tid) {
            warn!(target: "tracer", "set debug registers for new thread {tid}: {e:#}");
        }
        self.threads.resume(tid, false, None)
    }

    fn apply_new_status(&mut self, status: WaitStatus) -> Result<Option<DebugEvent>, Error> {
        let proc_pid = self.threads.proc_pid();
        match status {
            WaitStatus::Exited(pid, code) => {
                self.threads.remove(pid);
                if pid == proc_pid {
                    return Ok(Some(DebugEvent::Exited(code)));
                }
                Ok(None)
            }
            WaitStatus::Signaled(pid, signal, _) => {
                self.threads.remove(pid);
                if pid == proc_pid {
                    return Ok(Some(DebugEvent::Exited(128 + signal as i32)));
                }
                Ok(None)
            }
            WaitStatus::PtraceEvent(pid, _, code) => {
                self.threads.set_status(pid, ThreadStatus::Stopped);
                match code {
                    libc::PTRACE_EVENT_EXEC => {
                        self.threads.set_focus(pid);
                        return Ok(Some(DebugEvent::Started));
                    }
                    libc::PTRACE_EVENT_CLONE => {
                        let new_tid = Pid::from_raw(
                            sys::ptrace::getevent(pid).map_err(Ptrace)? as libc::pid_t,
                        );
                        // PTRACE_EVENT_STOP of a new thread may be received first
                        if !self.threads.contains(new_tid) {
                            let status = ThreadRegistry::wait_one(new_tid)?;
                            debug!(target: "tracer", "new thread {new_tid}, status: {status:?}");
                            self.on_new_thread(new_tid)?;
                        }
                        self.threads.resume(pid, false, None)?;
                    }
                    libc::PTRACE_EVENT_STOP => {
                        if self.threads.contains(pid) {
                            // stale interrupt
                            self.threads.resume(pid, false, None)?;
                        } else {
                            self.on_new_thread(pid)?;
                        }
                    }
                    libc::PTRACE_EVENT_EXIT => self.threads.resume(pid, false, None)?,
                    _ => {
                        warn!(target: "tracer", "unsupported (ignored) ptrace event, code: {code}");
                        self.threads.resume(pid, false, None)?;
                    }
                }
                Ok(None)
            }
            WaitStatus::Stopped(pid, signal) => {
                self.threads.set_status(pid, ThreadStatus::Stopped);
                let event = self.decode_signal(pid, signal)?;
                if event.is_some() {
                    self.threads.set_focus(pid);
                }
                Ok(event)
            }
            _ => {
                warn!(target: "tracer", "unexpected wait status: {status:?}");
                Ok(None)
            }
        }
    }

    fn disassembler() -> Result<Capstone, Error> {
        Capstone::new()
            .x86()
            .mode(arch::x86::ArchMode::Mode64)
            .syntax(arch::x86::ArchSyntax::Intel)
            .build()
            .map_err(Error::DisAsmInit)
    }

    /// Return mnemonic, operands and length of an instruction at address.
    fn instruction_at(&self, addr: RelocatedAddress) -> Result<Option<(String, String, usize)>, Error> {
        let code = self.read_code(addr, 16)?;
        let cs = Self::disassembler()?;
        let insns = cs
            .disasm_count(&code, addr.as_u64(), 1)
            .map_err(Error::DisAsm)?;
        Ok(insns.iter().next().map(|insn| {
            (
                insn.mnemonic().unwrap_or_default().to_string(),
                insn.op_str().unwrap_or_default().to_string(),
                insn.bytes().len(),
            )
        }))
    }
}

impl ProcessControl for PtraceDebuggee {
    fn pid(&self) -> Pid {
        self.threads.proc_pid()
    }

    fn wait_event(&mut self) -> Result<DebugEvent, Error> {
        if self.attached && !self.started {
            self.started = true;
            return Ok(DebugEvent::Started);
        }

        loop {
            let status = match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL)) {
                Ok(status) => status,
                Err(Errno::ECHILD) => {
                    return Err(Error::SessionLost("debugee process vanished".to_string()))
                }
                Err(e) => return Err(Waitpid(e)),
            };
            debug!(target: "tracer", "received new thread status: {status:?}");

            if let Some(event) = self.apply_new_status(status)? {
                if event == DebugEvent::Started {
                    self.started = true;
                }
                if !matches!(event, DebugEvent::Exited(_)) {
                    self.stop_others()?;
                }
                return Ok(event);
            }
        }
    }

    fn resume(&mut self, resume: Resume) -> Result<(), Error> {
        let signal = resume.deliver.and_then(|s| Signal::try_from(s).ok());
        if resume.step {
            let focus = self.threads.focus();
            self.threads.resume(focus, true, signal)
        } else {
            self.threads.cont_stopped(signal)
        }
    }

    fn program_counter(&mut self) -> Result<RelocatedAddress, Error> {
        Ok(RelocatedAddress::from(self.registers()?.value(Register::Rip)))
    }

    fn return_address(&mut self) -> Result<Option<RelocatedAddress>, Error> {
        let regs = self.registers()?;
        let pc = RelocatedAddress::from(regs.value(Register::Rip));
        let rsp = regs.value(Register::Rsp);
        let rbp = regs.value(Register::Rbp);

        let slot = match self.instruction_at(pc)? {
            // frame is not created yet
            Some((mnemonic, _, _)) if mnemonic == "endbr64" => rsp,
            Some((mnemonic, operands, _)) if mnemonic == "push" && operands == "rbp" => rsp,
            Some((mnemonic, operands, _)) if mnemonic == "mov" && operands == "rbp, rsp" => rsp + 8,
            _ if rbp == 0 => return Ok(None),
            _ => rbp + 8,
        };

        Ok(muted_error!(self.read_word(RelocatedAddress::from(slot))).map(RelocatedAddress::from))
    }

    fn call_return_site(&mut self) -> Result<Option<RelocatedAddress>, Error> {
        let pc = self.program_counter()?;
        Ok(match self.instruction_at(pc)? {
            Some((mnemonic, _, len)) if mnemonic.starts_with("call") => Some(pc.offset(len as isize)),
            _ => None,
        })
    }

    fn detach(&mut self) -> Result<(), Error> {
        for tid in self.threads.all() {
            match sys::ptrace::detach(tid, None) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => return Err(Ptrace(e)),
            }
        }
        if self.interrupt.pending.swap(false, Ordering::AcqRel) {
            // forced stop still queued, process would freeze after detach
            sys::signal::kill(self.threads.proc_pid(), Signal::SIGCONT)
                .map_err(|e| Error::Syscall("kill", e))?;
        }
        debug!(target: "tracer", "detached from {}", self.threads.proc_pid());
        Ok(())
    }

    fn terminate(&mut self) -> Result<(), Error> {
        let pid = self.threads.proc_pid();
        match sys::signal::kill(pid, Signal::SIGKILL) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Ok(()),
            Err(e) => return Err(Error::Syscall("kill", e)),
        }

        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Exited(p, _)) | Ok(WaitStatus::Signaled(p, _, _)) if p == pid => {
                    break
                }
                Ok(WaitStatus::PtraceEvent(tid, _, _)) => {
                    _ = sys::ptrace::cont(tid, None);
                }
                Ok(_) => continue,
                Err(Errno::ECHILD) => break,
                Err(e) => return Err(Waitpid(e)),
            }
        }
        debug!(target: "tracer", "debugee {pid} killed");
        Ok(())
    }

    fn interrupter(&self) -> Arc<dyn Interrupt> {
        self.interrupt.clone()
    }
}
