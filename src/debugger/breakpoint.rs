use crate::debugger::address::RelocatedAddress;
use crate::debugger::engine::{MemoryMap, TrapEngine};
use crate::debugger::error::Error;
use crate::debugger::register::debug::{
    BreakCondition, BreakSize, DebugRegisterAllocator, DebugRegisterNumber,
};
use bitflags::bitflags;
use indexmap::IndexMap;
use log::debug;
use serde::Deserialize;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use strum_macros::{Display, EnumString};

/// Breakpoint technology.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum BreakpointKind {
    Software,
    Hardware,
    Memory,
}

/// Trap instruction used by software breakpoints.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, EnumString, Display, Deserialize)]
pub enum SoftwareTrap {
    /// `int3`, one byte.
    #[default]
    #[strum(serialize = "short")]
    #[serde(rename = "short")]
    Int3Short,
    /// `int 3`, two bytes.
    #[strum(serialize = "long")]
    #[serde(rename = "long")]
    Int3Long,
    /// `ud2`, raises an invalid opcode exception.
    #[strum(serialize = "ud2")]
    #[serde(rename = "ud2")]
    Ud2,
}

impl SoftwareTrap {
    pub fn opcode(self) -> &'static [u8] {
        match self {
            SoftwareTrap::Int3Short => &[0xCC],
            SoftwareTrap::Int3Long => &[0xCD, 0x03],
            SoftwareTrap::Ud2 => &[0x0F, 0x0B],
        }
    }
}

/// Original bytes overwritten by a trap instruction.
pub type SavedBytes = SmallVec<[u8; 2]>;

bitflags! {
    /// Access types guarded by a memory breakpoint.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MemoryAccess: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        const EXECUTE = 0b100;
    }
}

impl Default for MemoryAccess {
    fn default() -> Self {
        MemoryAccess::all()
    }
}

impl FromStr for MemoryAccess {
    type Err = Error;

    /// Parse access type from `r`, `w`, `x` letters, `a` means any access.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut access = MemoryAccess::empty();
        for ch in s.chars() {
            access |= match ch {
                'r' => MemoryAccess::READ,
                'w' => MemoryAccess::WRITE,
                'x' => MemoryAccess::EXECUTE,
                'a' => MemoryAccess::all(),
                _ => return Err(Error::InvalidTrapType(s.to_string())),
            };
        }
        if access.is_empty() {
            return Err(Error::InvalidTrapType(s.to_string()));
        }
        Ok(access)
    }
}

/// Type flags requested by a caller at breakpoint creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapSpec {
    Software {
        variant: SoftwareTrap,
        singleshot: bool,
    },
    Hardware {
        condition: BreakCondition,
        size: BreakSize,
    },
    Memory {
        access: MemoryAccess,
        /// Reinstall a guard after each hit, otherwise breakpoint is removed after first hit.
        restore: bool,
    },
}

impl TrapSpec {
    pub fn kind(&self) -> BreakpointKind {
        match self {
            TrapSpec::Software { .. } => BreakpointKind::Software,
            TrapSpec::Hardware { .. } => BreakpointKind::Hardware,
            TrapSpec::Memory { .. } => BreakpointKind::Memory,
        }
    }
}

/// Kind specific part of a breakpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Trap {
    Software {
        variant: SoftwareTrap,
        /// Present while trap is installed.
        saved: Option<SavedBytes>,
    },
    Hardware {
        condition: BreakCondition,
        size: BreakSize,
        /// Present while trap is installed.
        register: Option<DebugRegisterNumber>,
    },
    Memory {
        access: MemoryAccess,
        restore: bool,
        region_size: usize,
    },
}

impl Trap {
    fn kind(&self) -> BreakpointKind {
        match self {
            Trap::Software { .. } => BreakpointKind::Software,
            Trap::Hardware { .. } => BreakpointKind::Hardware,
            Trap::Memory { .. } => BreakpointKind::Memory,
        }
    }
}

/// Breakpoint representation.
#[derive(Debug)]
struct Breakpoint {
    number: u32,
    addr: RelocatedAddress,
    name: Option<String>,
    enabled: bool,
    singleshot: bool,
    trap: Trap,
}

/// Breakpoint information struct, a copy of registry record at the time of request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BreakpointView {
    pub number: u32,
    pub kind: BreakpointKind,
    pub addr: RelocatedAddress,
    pub name: Option<String>,
    pub enabled: bool,
    pub singleshot: bool,
    pub trap: Trap,
}

impl From<&Breakpoint> for BreakpointView {
    fn from(bp: &Breakpoint) -> Self {
        Self {
            number: bp.number,
            kind: bp.trap.kind(),
            addr: bp.addr,
            name: bp.name.clone(),
            enabled: bp.enabled,
            singleshot: bp.singleshot,
            trap: bp.trap.clone(),
        }
    }
}

impl Display for BreakpointView {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} breakpoint #{} at {}", self.kind, self.number, self.addr)?;
        if let Some(ref name) = self.name {
            write!(f, " ({name})")?;
        }
        if !self.enabled {
            f.write_str(" [disabled]")?;
        }
        Ok(())
    }
}

/// Way to find a breakpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selector {
    Address(RelocatedAddress),
    Name(String),
    /// User input: a breakpoint name or, if no breakpoint with this name, an address.
    Ident(String),
}

impl Selector {
    pub fn from_ident(ident: impl Into<String>) -> Self {
        Selector::Ident(ident.into())
    }
}

impl From<RelocatedAddress> for Selector {
    fn from(addr: RelocatedAddress) -> Self {
        Selector::Address(addr)
    }
}

impl Display for Selector {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Selector::Address(addr) => write!(f, "{addr}"),
            Selector::Name(s) | Selector::Ident(s) => f.write_str(s),
        }
    }
}

/// Successful result of enable or disable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Toggle {
    Changed,
    AlreadyEnabled,
    AlreadyDisabled,
}

/// Result of applying an operation to all breakpoints of a kind.
#[derive(Debug, Default)]
pub struct BulkOutcome {
    pub changed: usize,
    pub unchanged: usize,
    pub errors: Vec<Error>,
}

impl BulkOutcome {
    fn record(&mut self, result: Result<Toggle, Error>) {
        match result {
            Ok(Toggle::Changed) => self.changed += 1,
            Ok(_) => self.unchanged += 1,
            Err(e) => self.errors.push(e),
        }
    }

    /// Return an error if at least one operation failed.
    pub fn into_result(self) -> Result<(usize, usize), Error> {
        if self.errors.is_empty() {
            Ok((self.changed, self.unchanged))
        } else {
            Err(Error::MultipleErrors(self.errors))
        }
    }
}

/// Breakpoints of a single kind, in creation order.
#[derive(Default)]
struct KindTable {
    by_addr: IndexMap<RelocatedAddress, Breakpoint>,
    names: HashMap<String, RelocatedAddress>,
}

impl KindTable {
    fn resolve(&self, kind: BreakpointKind, selector: &Selector) -> Result<RelocatedAddress, Error> {
        let not_found = || Error::BreakpointNotFound(kind, selector.to_string());
        match selector {
            Selector::Name(name) => self.names.get(name).copied().ok_or_else(not_found),
            Selector::Address(addr) => self.find_addr(kind, *addr).ok_or_else(not_found),
            Selector::Ident(ident) => {
                if let Some(addr) = self.names.get(ident) {
                    return Ok(*addr);
                }
                let addr = ident.parse::<RelocatedAddress>().map_err(|_| not_found())?;
                self.find_addr(kind, addr).ok_or_else(not_found)
            }
        }
    }

    /// Memory breakpoints may be addressed by any address inside a guarded region.
    fn find_addr(&self, kind: BreakpointKind, addr: RelocatedAddress) -> Option<RelocatedAddress> {
        if self.by_addr.contains_key(&addr) {
            return Some(addr);
        }
        if kind != BreakpointKind::Memory {
            return None;
        }
        self.by_addr.values().find_map(|bp| match bp.trap {
            Trap::Memory { region_size, .. } if addr.in_range(bp.addr, region_size) => Some(bp.addr),
            _ => None,
        })
    }
}

/// Container for all breakpoints of a debug session.
#[derive(Default)]
pub struct BreakpointRegistry {
    software: KindTable,
    hardware: KindTable,
    memory: KindTable,
    registers: DebugRegisterAllocator,
    last_number: u32,
}

impl BreakpointRegistry {
    fn table(&self, kind: BreakpointKind) -> &KindTable {
        match kind {
            BreakpointKind::Software => &self.software,
            BreakpointKind::Hardware => &self.hardware,
            BreakpointKind::Memory => &self.memory,
        }
    }

    fn parts_mut(
        &mut self,
        kind: BreakpointKind,
    ) -> (&mut KindTable, &mut DebugRegisterAllocator) {
        let table = match kind {
            BreakpointKind::Software => &mut self.software,
            BreakpointKind::Hardware => &mut self.hardware,
            BreakpointKind::Memory => &mut self.memory,
        };
        (table, &mut self.registers)
    }

    /// Add a new disabled breakpoint.
    ///
    /// # Arguments
    ///
    /// * `maps`: debugee memory map, used for address validation and memory region lookup
    /// * `addr`: breakpoint address, for memory breakpoints any address inside a region
    /// * `name`: optional breakpoint name, unique per kind
    /// * `spec`: breakpoint kind and type flags
    pub fn create(
        &mut self,
        maps: &dyn MemoryMap,
        addr: RelocatedAddress,
        name: Option<&str>,
        spec: TrapSpec,
    ) -> Result<BreakpointView, Error> {
        let kind = spec.kind();
        if name.is_some_and(str::is_empty) {
            return Err(Error::EmptyName);
        }

        let (addr, singleshot, trap) = match spec {
            TrapSpec::Software {
                variant,
                singleshot,
            } => {
                maps.region_containing(addr)
                    .ok_or(Error::InvalidAddress(addr))?;
                let trap = Trap::Software {
                    variant,
                    saved: None,
                };
                (addr, singleshot, trap)
            }
            TrapSpec::Hardware { condition, size } => {
                if !addr.is_aligned(size.bytes()) {
                    return Err(Error::MisalignedAddress {
                        addr,
                        size: size.bytes(),
                    });
                }
                let trap = Trap::Hardware {
                    condition,
                    size,
                    register: None,
                };
                (addr, false, trap)
            }
            TrapSpec::Memory { access, restore } => {
                let region = maps
                    .region_containing(addr)
                    .ok_or(Error::InvalidAddress(addr))?;
                let trap = Trap::Memory {
                    access,
                    restore,
                    region_size: region.size,
                };
                (region.base, !restore, trap)
            }
        };

        let (table, _) = self.parts_mut(kind);
        if table.by_addr.contains_key(&addr) {
            return Err(Error::DuplicateAddress(kind, addr));
        }
        if let Some(name) = name {
            if table.names.contains_key(name) {
                return Err(Error::DuplicateName(kind, name.to_string()));
            }
            table.names.insert(name.to_string(), addr);
        }

        self.last_number += 1;
        let bp = Breakpoint {
            number: self.last_number,
            addr,
            name: name.map(ToOwned::to_owned),
            enabled: false,
            singleshot,
            trap,
        };
        debug!(target: "debugger", "{kind} breakpoint #{} created at {addr}", bp.number);
        let view = BreakpointView::from(&bp);
        let (table, _) = self.parts_mut(kind);
        table.by_addr.insert(addr, bp);
        Ok(view)
    }

    /// Install a trap for a breakpoint.
    /// Return [`Toggle::AlreadyEnabled`] if trap already installed.
    pub fn enable(
        &mut self,
        engine: &mut dyn TrapEngine,
        kind: BreakpointKind,
        selector: &Selector,
    ) -> Result<Toggle, Error> {
        let (table, registers) = self.parts_mut(kind);
        let addr = table.resolve(kind, selector)?;
        let bp = table
            .by_addr
            .get_mut(&addr)
            .ok_or_else(|| Error::BreakpointNotFound(kind, selector.to_string()))?;
        if bp.enabled {
            return Ok(Toggle::AlreadyEnabled);
        }

        match &mut bp.trap {
            Trap::Software { variant, saved } => {
                // saved bytes survive a failed removal, the trap is still in debugee memory
                if saved.is_none() {
                    *saved = Some(engine.install_software_trap(addr, *variant)?);
                }
            }
            Trap::Hardware {
                condition,
                size,
                register,
            } => {
                if !addr.is_aligned(size.bytes()) {
                    return Err(Error::MisalignedAddress {
                        addr,
                        size: size.bytes(),
                    });
                }
                let dr = registers.acquire(addr)?;
                if let Err(e) = engine.install_hardware_trap(addr, dr, *condition, *size) {
                    registers.release(dr);
                    return Err(e);
                }
                *register = Some(dr);
            }
            Trap::Memory {
                access,
                restore,
                region_size,
            } => {
                engine.install_memory_trap(addr, *region_size, *access, *restore)?;
            }
        }

        bp.enabled = true;
        debug!(target: "debugger", "{kind} breakpoint #{} at {addr} enabled", bp.number);
        Ok(Toggle::Changed)
    }

    /// Remove a trap of a breakpoint. A breakpoint is marked as disabled (and hardware register
    /// is released) even if the trap engine fails, the failure is returned to the caller.
    /// Return [`Toggle::AlreadyDisabled`] if trap is not installed.
    pub fn disable(
        &mut self,
        engine: &mut dyn TrapEngine,
        kind: BreakpointKind,
        selector: &Selector,
    ) -> Result<Toggle, Error> {
        let (table, registers) = self.parts_mut(kind);
        let addr = table.resolve(kind, selector)?;
        let bp = table
            .by_addr
            .get_mut(&addr)
            .ok_or_else(|| Error::BreakpointNotFound(kind, selector.to_string()))?;
        if !bp.enabled {
            return Ok(Toggle::AlreadyDisabled);
        }

        let result = match &mut bp.trap {
            Trap::Software { saved, .. } => {
                let result = match saved.as_ref() {
                    Some(bytes) => engine.remove_software_trap(addr, bytes),
                    None => Ok(()),
                };
                if result.is_ok() {
                    *saved = None;
                }
                result
            }
            Trap::Hardware { register, .. } => match register.take() {
                Some(dr) => {
                    registers.release(dr);
                    engine.remove_hardware_trap(dr)
                }
                None => Ok(()),
            },
            Trap::Memory { region_size, .. } => engine.remove_memory_trap(addr, *region_size),
        };
        bp.enabled = false;
        debug!(target: "debugger", "{kind} breakpoint #{} at {addr} disabled", bp.number);

        result.map(|_| Toggle::Changed)
    }

    /// Remove breakpoint, disable it first if necessary. If disabling fails the breakpoint
    /// stays in the registry.
    pub fn delete(
        &mut self,
        engine: &mut dyn TrapEngine,
        kind: BreakpointKind,
        selector: &Selector,
    ) -> Result<BreakpointView, Error> {
        let addr = self.table(kind).resolve(kind, selector)?;
        let selector = Selector::Address(addr);
        self.disable(engine, kind, &selector)?;

        let (table, _) = self.parts_mut(kind);
        let bp = table
            .by_addr
            .shift_remove(&addr)
            .ok_or_else(|| Error::BreakpointNotFound(kind, selector.to_string()))?;
        if let Some(ref name) = bp.name {
            table.names.remove(name);
        }
        debug!(target: "debugger", "{kind} breakpoint #{} at {addr} deleted", bp.number);
        Ok(BreakpointView::from(&bp))
    }

    /// Return breakpoint by name or address.
    pub fn get(&self, kind: BreakpointKind, selector: &Selector) -> Option<BreakpointView> {
        let table = self.table(kind);
        let addr = table.resolve(kind, selector).ok()?;
        table.by_addr.get(&addr).map(BreakpointView::from)
    }

    /// Return all breakpoints of a kind, in creation order.
    pub fn snapshot(&self, kind: BreakpointKind) -> Vec<BreakpointView> {
        self.table(kind)
            .by_addr
            .values()
            .map(BreakpointView::from)
            .collect()
    }

    /// Return count of breakpoints of a kind.
    pub fn count(&self, kind: BreakpointKind) -> usize {
        self.table(kind).by_addr.len()
    }

    fn addresses(&self, kind: BreakpointKind) -> Vec<RelocatedAddress> {
        self.table(kind).by_addr.keys().copied().collect()
    }

    pub fn enable_all(&mut self, engine: &mut dyn TrapEngine, kind: BreakpointKind) -> BulkOutcome {
        let mut outcome = BulkOutcome::default();
        for addr in self.addresses(kind) {
            outcome.record(self.enable(engine, kind, &Selector::Address(addr)));
        }
        outcome
    }

    pub fn disable_all(&mut self, engine: &mut dyn TrapEngine, kind: BreakpointKind) -> BulkOutcome {
        let mut outcome = BulkOutcome::default();
        for addr in self.addresses(kind) {
            outcome.record(self.disable(engine, kind, &Selector::Address(addr)));
        }
        outcome
    }

    pub fn delete_all(&mut self, engine: &mut dyn TrapEngine, kind: BreakpointKind) -> BulkOutcome {
        let mut outcome = BulkOutcome::default();
        for addr in self.addresses(kind) {
            outcome.record(
                self.delete(engine, kind, &Selector::Address(addr))
                    .map(|_| Toggle::Changed),
            );
        }
        outcome
    }

    /// Return an enabled software breakpoint at address.
    pub fn hit_software(&self, addr: RelocatedAddress) -> Option<BreakpointView> {
        self.software
            .by_addr
            .get(&addr)
            .filter(|bp| bp.enabled)
            .map(BreakpointView::from)
    }

    /// Return an enabled memory breakpoint which region contains address.
    pub fn hit_memory(&self, addr: RelocatedAddress) -> Option<BreakpointView> {
        self.memory.by_addr.values().find_map(|bp| match bp.trap {
            Trap::Memory { region_size, .. } if bp.enabled && addr.in_range(bp.addr, region_size) => {
                Some(BreakpointView::from(bp))
            }
            _ => None,
        })
    }

    /// Return a hardware breakpoint that uses a debug register.
    pub fn find_hardware_by_register(&self, register: DebugRegisterNumber) -> Option<BreakpointView> {
        let addr = self.registers.owner(register)?;
        self.hardware.by_addr.get(&addr).map(BreakpointView::from)
    }

    /// Return count of debug registers in use.
    pub fn registers_in_use(&self) -> usize {
        self.registers.in_use()
    }

    /// Remove all installed traps (records stay in registry as disabled).
    /// Returns a list of errors, removal continues after failure.
    pub fn detach_all(&mut self, engine: &mut dyn TrapEngine) -> Vec<Error> {
        [
            BreakpointKind::Software,
            BreakpointKind::Hardware,
            BreakpointKind::Memory,
        ]
        .into_iter()
        .flat_map(|kind| self.disable_all(engine, kind).errors)
        .collect()
    }

    /// Drop all breakpoints without touching debugee, used when debugee is gone.
    pub fn forget_all(&mut self) {
        self.software = KindTable::default();
        self.hardware = KindTable::default();
        self.memory = KindTable::default();
        self.registers.release_all();
    }
}
