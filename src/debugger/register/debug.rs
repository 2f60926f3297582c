//! x86-64 hardware debug registers: allocation of DR0-DR3 between hardware breakpoints and
//! encoding of DR7/DR6 for the trap engine.

use crate::debugger::address::RelocatedAddress;
use crate::debugger::error::Error;
use bit_field::BitField;
use strum_macros::{Display, EnumString, FromRepr};

/// Number of address debug registers (DR0-DR3).
pub const DEBUG_REGISTER_COUNT: usize = 4;

/// Address debug register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, FromRepr, Display)]
#[repr(usize)]
pub enum DebugRegisterNumber {
    DR0 = 0,
    DR1 = 1,
    DR2 = 2,
    DR3 = 3,
}

impl DebugRegisterNumber {
    pub const ALL: [DebugRegisterNumber; DEBUG_REGISTER_COUNT] = [
        DebugRegisterNumber::DR0,
        DebugRegisterNumber::DR1,
        DebugRegisterNumber::DR2,
        DebugRegisterNumber::DR3,
    ];
}

/// Access type that activates a hardware breakpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, EnumString, Display)]
pub enum BreakCondition {
    /// Instruction fetch.
    #[default]
    #[strum(serialize = "x", serialize = "execute")]
    Execution,
    /// Data writes.
    #[strum(serialize = "w", serialize = "write")]
    DataWrites,
    /// Data reads or writes.
    #[strum(serialize = "rw", serialize = "r", serialize = "readwrite")]
    DataReadsWrites,
}

impl BreakCondition {
    /// Value of the R/W field at DR7.
    fn rw_bits(self) -> u64 {
        match self {
            BreakCondition::Execution => 0b00,
            BreakCondition::DataWrites => 0b01,
            BreakCondition::DataReadsWrites => 0b11,
        }
    }
}

/// Size of the watched location.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Display)]
pub enum BreakSize {
    #[default]
    Bytes1,
    Bytes2,
    Bytes4,
    Bytes8,
}

impl BreakSize {
    pub fn bytes(self) -> usize {
        match self {
            BreakSize::Bytes1 => 1,
            BreakSize::Bytes2 => 2,
            BreakSize::Bytes4 => 4,
            BreakSize::Bytes8 => 8,
        }
    }

    /// Value of the LEN field at DR7.
    fn len_bits(self) -> u64 {
        match self {
            BreakSize::Bytes1 => 0b00,
            BreakSize::Bytes2 => 0b01,
            BreakSize::Bytes8 => 0b10,
            BreakSize::Bytes4 => 0b11,
        }
    }
}

impl TryFrom<u8> for BreakSize {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => BreakSize::Bytes1,
            2 => BreakSize::Bytes2,
            4 => BreakSize::Bytes4,
            8 => BreakSize::Bytes8,
            _ => return Err(Error::InvalidSize(value as u64)),
        })
    }
}

/// Keeps track of DR0-DR3 usage. A slot belongs to an enabled hardware breakpoint and
/// is never handed out again until released.
#[derive(Debug, Default)]
pub struct DebugRegisterAllocator {
    slots: [Option<RelocatedAddress>; DEBUG_REGISTER_COUNT],
}

impl DebugRegisterAllocator {
    /// Take the lowest free register for a breakpoint at `owner` address.
    pub fn acquire(&mut self, owner: RelocatedAddress) -> Result<DebugRegisterNumber, Error> {
        let idx = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(Error::NoFreeRegister)?;
        self.slots[idx] = Some(owner);
        Ok(DebugRegisterNumber::ALL[idx])
    }

    /// Free a register. Releasing a free register is a no-op.
    /// Return the address of a previous owner if any.
    pub fn release(&mut self, register: DebugRegisterNumber) -> Option<RelocatedAddress> {
        self.slots[register as usize].take()
    }

    /// Return the address of a breakpoint that owns the register.
    pub fn owner(&self, register: DebugRegisterNumber) -> Option<RelocatedAddress> {
        self.slots[register as usize]
    }

    /// Return count of used registers.
    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn release_all(&mut self) {
        self.slots = Default::default();
    }
}

/// DR7, debug control register.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Dr7(pub u64);

impl Dr7 {
    /// Return true if register enabled, local or global enable bit is checked.
    pub fn dr_enabled(&self, register: DebugRegisterNumber, global: bool) -> bool {
        let bit = register as usize * 2 + global as usize;
        self.0.get_bit(bit)
    }

    /// Set local or global enable bit for the register.
    pub fn set_dr(&mut self, register: DebugRegisterNumber, global: bool, enabled: bool) {
        let bit = register as usize * 2 + global as usize;
        self.0.set_bit(bit, enabled);
    }

    /// Set R/W and LEN fields of a register. The length of an instruction breakpoint is
    /// always encoded as a single byte.
    pub fn configure_bp(
        &mut self,
        register: DebugRegisterNumber,
        condition: BreakCondition,
        size: BreakSize,
    ) {
        let rw_offset = 16 + register as usize * 4;
        let len = if condition == BreakCondition::Execution {
            0b00
        } else {
            size.len_bits()
        };
        self.0.set_bits(rw_offset..rw_offset + 2, condition.rw_bits());
        self.0.set_bits(rw_offset + 2..rw_offset + 4, len);
    }
}

/// DR6, debug status register.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Dr6(pub u64);

impl Dr6 {
    /// Return a register whose condition was detected.
    pub fn fired(&self) -> Option<DebugRegisterNumber> {
        DebugRegisterNumber::ALL
            .into_iter()
            .find(|&dr| self.0.get_bit(dr as usize))
    }
}
