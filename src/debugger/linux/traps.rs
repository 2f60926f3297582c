//! Trap engine of [`PtraceDebuggee`]: instruction patching, debug registers and page protection.

use crate::debugger::address::RelocatedAddress;
use crate::debugger::breakpoint::{MemoryAccess, SavedBytes, SoftwareTrap};
use crate::debugger::code;
use crate::debugger::engine::{MemoryMap, MemoryRegion, TrapEngine};
use crate::debugger::error::Error;
use crate::debugger::error::Error::Ptrace;
use crate::debugger::linux::debuggee::PtraceDebuggee;
use crate::debugger::linux::threads::ThreadRegistry;
use crate::debugger::register::debug::{
    BreakCondition, BreakSize, DebugRegisterNumber, Dr6,
};
use crate::debugger::register::{Register, RegisterMap};
use log::{debug, warn};
use nix::errno::Errno;
use nix::libc::{self, c_void};
use nix::sys;
use nix::sys::mman::ProtFlags;
use nix::sys::ptrace::AddressType;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use smallvec::SmallVec;
use std::mem;

const WORD: usize = mem::size_of::<u64>();
const DR6: usize = 6;
const DR7: usize = 7;

/// Region with changed protection.
#[derive(Clone, Copy, Debug)]
pub struct GuardedRegion {
    pub size: usize,
    pub original: ProtFlags,
}

fn user_debugreg_offset(n: usize) -> usize {
    mem::offset_of!(libc::user, u_debugreg) + n * WORD
}

fn poke_debugreg(tid: Pid, n: usize, value: u64) -> Result<(), Error> {
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_POKEUSER,
            tid.as_raw(),
            user_debugreg_offset(n) as *mut c_void,
            value as *mut c_void,
        )
    };
    Errno::result(ret).map(drop).map_err(Ptrace)
}

fn peek_debugreg(tid: Pid, n: usize) -> Result<u64, Error> {
    Errno::clear();
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_PEEKUSER,
            tid.as_raw(),
            user_debugreg_offset(n) as *mut c_void,
            std::ptr::null_mut::<c_void>(),
        )
    };
    if ret == -1 && Errno::last() != Errno::UnknownErrno {
        return Err(Ptrace(Errno::last()));
    }
    Ok(ret as u64)
}

/// Aligned words covering `[addr, addr + len)`: first word address, offset of `addr` in it
/// and count of words.
fn word_span(addr: RelocatedAddress, len: usize) -> (RelocatedAddress, usize, usize) {
    let start = addr.align_down(WORD);
    let offset = addr.as_usize() - start.as_usize();
    (start, offset, (offset + len).div_ceil(WORD))
}

/// Replace bytes of `buf` at `offset`, return replaced bytes.
fn splice(buf: &mut [u8], offset: usize, bytes: &[u8]) -> SavedBytes {
    let target = &mut buf[offset..offset + bytes.len()];
    let saved = SmallVec::from_slice(target);
    target.copy_from_slice(bytes);
    saved
}

/// Protection that makes an access of a kind fault.
fn guard_protection(original: ProtFlags, access: MemoryAccess) -> ProtFlags {
    if access.contains(MemoryAccess::READ) {
        // x86 pages can't be writable or executable without being readable
        return ProtFlags::PROT_NONE;
    }
    let mut prot = original;
    if access.contains(MemoryAccess::WRITE) {
        prot.remove(ProtFlags::PROT_WRITE);
    }
    if access.contains(MemoryAccess::EXECUTE) {
        prot.remove(ProtFlags::PROT_EXEC);
    }
    prot
}

impl PtraceDebuggee {
    pub(super) fn read_word(&self, addr: RelocatedAddress) -> Result<u64, Error> {
        sys::ptrace::read(self.threads.focus(), addr.as_usize() as AddressType)
            .map(|w| w as u64)
            .map_err(Ptrace)
    }

    fn write_word(&self, addr: RelocatedAddress, word: u64) -> Result<(), Error> {
        unsafe {
            sys::ptrace::write(
                self.threads.focus(),
                addr.as_usize() as AddressType,
                word as *mut c_void,
            )
        }
        .map_err(Ptrace)
    }

    /// Read whole aligned words covering `[addr, addr + len)`. Return the words and the offset
    /// of `addr` in them.
    fn read_words(&self, addr: RelocatedAddress, len: usize) -> Result<(Vec<u8>, usize), Error> {
        let (start, offset, words) = word_span(addr, len);
        let mut buf = Vec::with_capacity(words * WORD);
        for i in 0..words {
            buf.extend(self.read_word(start.offset((i * WORD) as isize))?.to_le_bytes());
        }
        Ok((buf, offset))
    }

    /// Overwrite bytes at address, return previous bytes. All affected words are read before
    /// the first write.
    fn patch(&self, addr: RelocatedAddress, bytes: &[u8]) -> Result<SavedBytes, Error> {
        let (mut buf, offset) = self.read_words(addr, bytes.len())?;
        let saved = splice(&mut buf, offset, bytes);
        let start = addr.align_down(WORD);
        for (i, chunk) in buf.chunks_exact(WORD).enumerate() {
            let mut word = [0; WORD];
            word.copy_from_slice(chunk);
            self.write_word(start.offset((i * WORD) as isize), u64::from_le_bytes(word))?;
        }
        Ok(saved)
    }

    /// Read debugee code, installed software traps are replaced with original bytes.
    pub(super) fn read_code(&self, addr: RelocatedAddress, len: usize) -> Result<Vec<u8>, Error> {
        let (buf, offset) = self.read_words(addr, len)?;
        let mut code = buf[offset..offset + len].to_vec();

        for (trap_addr, (_, saved)) in &self.software {
            for (i, byte) in saved.iter().enumerate() {
                let byte_addr = trap_addr.offset(i as isize);
                if byte_addr.in_range(addr, len) {
                    code[byte_addr.as_usize() - addr.as_usize()] = *byte;
                }
            }
        }
        Ok(code)
    }

    /// Program all used debug registers and DR7 for a thread.
    pub(super) fn apply_debug_registers(&self, tid: Pid) -> Result<(), Error> {
        for (n, slot) in self.hardware.iter().enumerate() {
            if let Some(addr) = slot {
                poke_debugreg(tid, n, addr.as_u64())?;
            }
        }
        poke_debugreg(tid, DR7, self.dr7.0)
    }

    fn apply_debug_registers_all(&self) -> Result<(), Error> {
        let mut errors = vec![];
        for tid in self.threads.all() {
            match self.apply_debug_registers(tid) {
                Ok(()) | Err(Ptrace(Errno::ESRCH)) => {}
                Err(e) => errors.push(e),
            }
        }
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::MultipleErrors(errors)),
        }
    }

    /// Return a debug register that caused the trap and reset DR6.
    pub(super) fn take_fired_register(
        &self,
        tid: Pid,
    ) -> Result<Option<DebugRegisterNumber>, Error> {
        let dr6 = Dr6(peek_debugreg(tid, DR6)?);
        let fired = dr6
            .fired()
            .filter(|&dr| self.hardware[dr as usize].is_some());
        if fired.is_some() {
            poke_debugreg(tid, DR6, 0)?;
        }
        Ok(fired)
    }

    /// Execute a system call inside debugee, on the thread in focus.
    fn inject_syscall(&mut self, nr: u64, args: [u64; 3]) -> Result<i64, Error> {
        let tid = self.threads.focus();
        let saved_regs = RegisterMap::current(tid).map_err(Ptrace)?;
        let pc = RelocatedAddress::from(saved_regs.value(Register::Rip));
        let saved_code = self.patch(pc, &code::SYSCALL_INSN)?;

        let mut regs = saved_regs;
        regs.update(Register::Rax, nr);
        regs.update(Register::Rdi, args[0]);
        regs.update(Register::Rsi, args[1]);
        regs.update(Register::Rdx, args[2]);
        // disable syscall restart of an interrupted call
        regs.update(Register::OrigRax, u64::MAX);
        regs.persist(tid).map_err(Ptrace)?;

        let result = self.step_syscall(tid);

        self.patch(pc, &saved_code)?;
        saved_regs.persist(tid).map_err(Ptrace)?;
        result
    }

    fn step_syscall(&mut self, tid: Pid) -> Result<i64, Error> {
        sys::ptrace::step(tid, None).map_err(Ptrace)?;
        loop {
            match ThreadRegistry::wait_one(tid)? {
                WaitStatus::Stopped(_, Signal::SIGTRAP) => break,
                WaitStatus::Stopped(_, signal) => {
                    self.threads.defer_signal(tid, signal);
                    sys::ptrace::step(tid, None).map_err(Ptrace)?;
                }
                WaitStatus::Exited(_, exit_code) => return Err(Error::ProcessExit(exit_code)),
                status => {
                    debug!(target: "tracer", "unexpected status while syscall injection: {status:?}");
                    sys::ptrace::step(tid, None).map_err(Ptrace)?;
                }
            }
        }
        Ok(RegisterMap::current(tid).map_err(Ptrace)?.value(Register::Rax) as i64)
    }

    fn mprotect(&mut self, base: RelocatedAddress, size: usize, prot: ProtFlags) -> Result<(), Error> {
        let ret = self.inject_syscall(
            code::SYS_MPROTECT,
            [base.as_u64(), size as u64, prot.bits() as u64],
        )?;
        if ret < 0 {
            return Err(Error::Syscall("mprotect", Errno::from_i32(-ret as i32)));
        }
        debug!(target: "tracer", "mprotect {base} ({size} bytes) to {prot:?}");
        Ok(())
    }

    fn region_protection(&self, base: RelocatedAddress) -> Result<ProtFlags, Error> {
        let maps = proc_maps::get_process_maps(self.threads.proc_pid().as_raw())?;
        let map = maps
            .iter()
            .find(|m| base.in_range(RelocatedAddress::from(m.start()), m.size()))
            .ok_or(Error::InvalidAddress(base))?;

        let mut prot = ProtFlags::PROT_NONE;
        if map.is_read() {
            prot |= ProtFlags::PROT_READ;
        }
        if map.is_write() {
            prot |= ProtFlags::PROT_WRITE;
        }
        if map.is_exec() {
            prot |= ProtFlags::PROT_EXEC;
        }
        Ok(prot)
    }
}

impl TrapEngine for PtraceDebuggee {
    fn install_software_trap(
        &mut self,
        addr: RelocatedAddress,
        variant: SoftwareTrap,
    ) -> Result<SavedBytes, Error> {
        let saved = self.patch(addr, variant.opcode())?;
        self.software.insert(addr, (variant, saved.clone()));
        Ok(saved)
    }

    fn remove_software_trap(
        &mut self,
        addr: RelocatedAddress,
        saved: &SavedBytes,
    ) -> Result<(), Error> {
        self.patch(addr, saved)?;
        self.software.remove(&addr);
        Ok(())
    }

    fn install_hardware_trap(
        &mut self,
        addr: RelocatedAddress,
        register: DebugRegisterNumber,
        condition: BreakCondition,
        size: BreakSize,
    ) -> Result<(), Error> {
        let previous = self.dr7;
        self.hardware[register as usize] = Some(addr);
        self.dr7.configure_bp(register, condition, size);
        self.dr7.set_dr(register, false, true);

        if let Err(e) = self.apply_debug_registers_all() {
            self.hardware[register as usize] = None;
            self.dr7 = previous;
            if let Err(rollback) = self.apply_debug_registers_all() {
                warn!(target: "tracer", "rollback debug registers: {rollback:#}");
            }
            return Err(e);
        }
        Ok(())
    }

    fn remove_hardware_trap(&mut self, register: DebugRegisterNumber) -> Result<(), Error> {
        self.hardware[register as usize] = None;
        self.dr7.set_dr(register, false, false);
        self.apply_debug_registers_all()?;
        for tid in self.threads.all() {
            match poke_debugreg(tid, register as usize, 0) {
                Ok(()) | Err(Ptrace(Errno::ESRCH)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn install_memory_trap(
        &mut self,
        base: RelocatedAddress,
        size: usize,
        access: MemoryAccess,
        restore: bool,
    ) -> Result<(), Error> {
        let original = self.region_protection(base)?;
        self.mprotect(base, size, guard_protection(original, access))?;
        debug!(target: "tracer", "memory guard {access:?} at {base}, restore: {restore}");
        self.memory.insert(base, GuardedRegion { size, original });
        Ok(())
    }

    fn remove_memory_trap(&mut self, base: RelocatedAddress, size: usize) -> Result<(), Error> {
        let Some(region) = self.memory.get(&base).copied() else {
            return Ok(());
        };
        self.mprotect(base, size, region.original)?;
        self.memory.remove(&base);
        Ok(())
    }
}

impl MemoryMap for PtraceDebuggee {
    fn region_containing(&self, addr: RelocatedAddress) -> Option<MemoryRegion> {
        let maps = proc_maps::get_process_maps(self.threads.proc_pid().as_raw()).ok()?;
        maps.iter()
            .find(|m| addr.in_range(RelocatedAddress::from(m.start()), m.size()))
            .map(|m| MemoryRegion {
                base: RelocatedAddress::from(m.start()),
                size: m.size(),
            })
    }
}
