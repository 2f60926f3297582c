pub mod debug;

use nix::libc::user_regs_struct;
use nix::sys;
use nix::unistd::Pid;
use strum_macros::Display;
use strum_macros::EnumString;

/// General purpose registers the execution thread works with.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Register {
    Rax,
    Rdi,
    Rsi,
    Rdx,
    R10,
    R8,
    R9,
    Rbp,
    Rsp,
    Rip,
    Eflags,
    OrigRax,
}

/// Snapshot of thread registers.
#[derive(Clone, Copy)]
pub struct RegisterMap(user_regs_struct);

impl RegisterMap {
    pub fn current(pid: Pid) -> nix::Result<Self> {
        sys::ptrace::getregs(pid).map(RegisterMap)
    }

    pub fn value(&self, register: Register) -> u64 {
        let regs = &self.0;
        match register {
            Register::Rax => regs.rax,
            Register::Rdi => regs.rdi,
            Register::Rsi => regs.rsi,
            Register::Rdx => regs.rdx,
            Register::R10 => regs.r10,
            Register::R8 => regs.r8,
            Register::R9 => regs.r9,
            Register::Rbp => regs.rbp,
            Register::Rsp => regs.rsp,
            Register::Rip => regs.rip,
            Register::Eflags => regs.eflags,
            Register::OrigRax => regs.orig_rax,
        }
    }

    pub fn update(&mut self, register: Register, value: u64) {
        let regs = &mut self.0;
        match register {
            Register::Rax => regs.rax = value,
            Register::Rdi => regs.rdi = value,
            Register::Rsi => regs.rsi = value,
            Register::Rdx => regs.rdx = value,
            Register::R10 => regs.r10 = value,
            Register::R8 => regs.r8 = value,
            Register::R9 => regs.r9 = value,
            Register::Rbp => regs.rbp = value,
            Register::Rsp => regs.rsp = value,
            Register::Rip => regs.rip = value,
            Register::Eflags => regs.eflags = value,
            Register::OrigRax => regs.orig_rax = value,
        };
    }

    pub fn persist(self, pid: Pid) -> nix::Result<()> {
        sys::ptrace::setregs(pid, self.0)
    }
}
