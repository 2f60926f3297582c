/// Process breakpoint
pub const TRAP_BRKPT: i32 = 0x1;
/// Process trace trap
pub const TRAP_TRACE: i32 = 0x2;
/// Hardware breakpoint or watchpoint
pub const TRAP_HWBKPT: i32 = 0x4;
/// Sent by the kernel from somewhere
pub const SI_KERNEL: i32 = 0x80;
/// Invalid permissions for mapped object
pub const SEGV_ACCERR: i32 = 0x2;

/// `mprotect` syscall number, x86-64
pub const SYS_MPROTECT: u64 = 10;
/// `syscall` instruction
pub const SYSCALL_INSN: [u8; 2] = [0x0F, 0x05];
