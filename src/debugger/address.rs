use std::fmt::{Display, Formatter};
use std::num::ParseIntError;
use std::str::FromStr;

/// Virtual address in the debuggee address space.
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct RelocatedAddress(usize);

impl RelocatedAddress {
    pub fn offset(self, offset: isize) -> RelocatedAddress {
        if offset >= 0 {
            self.0 + offset as usize
        } else {
            self.0 - offset.unsigned_abs()
        }
        .into()
    }

    /// True if address is a multiple of `align`.
    pub fn is_aligned(self, align: usize) -> bool {
        align != 0 && self.0 % align == 0
    }

    /// Round address down to a multiple of `align`.
    pub fn align_down(self, align: usize) -> RelocatedAddress {
        RelocatedAddress(self.0 - self.0 % align.max(1))
    }

    /// Return true if address is in `[base, base + size)` range.
    pub fn in_range(self, base: RelocatedAddress, size: usize) -> bool {
        self.0 >= base.0 && self.0 - base.0 < size
    }

    pub fn as_u64(self) -> u64 {
        u64::from(self)
    }

    pub fn as_usize(self) -> usize {
        usize::from(self)
    }
}

impl From<usize> for RelocatedAddress {
    fn from(addr: usize) -> Self {
        RelocatedAddress(addr)
    }
}

impl From<u64> for RelocatedAddress {
    fn from(addr: u64) -> Self {
        RelocatedAddress(addr as usize)
    }
}

impl From<RelocatedAddress> for usize {
    fn from(addr: RelocatedAddress) -> Self {
        addr.0
    }
}

impl From<RelocatedAddress> for u64 {
    fn from(addr: RelocatedAddress) -> Self {
        addr.0 as u64
    }
}

impl Display for RelocatedAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format!("{:#016X}", self.0))
    }
}

/// Parse an address in hexadecimal (`0x` or `0X` prefix) or decimal notation.
impl FromStr for RelocatedAddress {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let value = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => usize::from_str_radix(&hex.replace('_', ""), 16)?,
            None => s.parse::<usize>()?,
        };
        Ok(RelocatedAddress(value))
    }
}
