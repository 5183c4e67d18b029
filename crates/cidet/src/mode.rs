//! Target CPU modes the engine can generate encodings for.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// CPU mode the instructions under test execute in.
///
/// The paging flavour (`Pp32` vs `Pae32`) does not change how instructions are encoded, but it is
/// part of the mode so drivers can pick matching buffer placements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetMode {
    /// 16-bit protected mode.
    Pe16,
    /// 32-bit protected mode with legacy paging.
    Pp32,
    /// 32-bit protected mode with PAE paging.
    Pae32,
    /// 64-bit long mode.
    Lm64,
}

impl TargetMode {
    pub const ALL: [TargetMode; 4] = [Self::Pe16, Self::Pp32, Self::Pae32, Self::Lm64];

    pub fn is_64bit(self) -> bool {
        matches!(self, Self::Lm64)
    }

    /// Code segment width in bits, as used by decoders.
    pub fn bitness(self) -> u32 {
        match self {
            Self::Pe16 => 16,
            Self::Pp32 | Self::Pae32 => 32,
            Self::Lm64 => 64,
        }
    }

    /// Address size in bytes without an address-size prefix.
    pub fn default_address_bytes(self) -> u8 {
        match self {
            Self::Pe16 => 2,
            Self::Pp32 | Self::Pae32 => 4,
            Self::Lm64 => 8,
        }
    }

    /// Address size in bytes selected by the 0x67 prefix.
    pub fn alternate_address_bytes(self) -> u8 {
        match self {
            Self::Pe16 => 4,
            Self::Pp32 | Self::Pae32 => 2,
            Self::Lm64 => 4,
        }
    }

    /// Number of general purpose registers addressable through ModRM/SIB.
    pub fn gpr_count(self) -> u8 {
        if self.is_64bit() {
            16
        } else {
            8
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Pe16 => "pe16",
            Self::Pp32 => "pp32",
            Self::Pae32 => "pae32",
            Self::Lm64 => "lm64",
        }
    }
}

impl fmt::Display for TargetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TargetMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|mode| mode.name() == lower)
            .ok_or_else(|| format!("unknown target mode {s:?} (expected pe16, pp32, pae32 or lm64)"))
    }
}
