//! Immutable instruction descriptions supplied by the instruction tables.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{CidetError, Result};
use crate::mode::TargetMode;
use crate::operand::InOut;

/// Maximum number of operands an instruction can have.
pub const MAX_OPERANDS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperandKind {
    Gpr,
    SegReg,
    ControlReg,
    DebugReg,
    Xmm,
    Immediate,
    /// Memory only operand (e.g. `M`). Register/memory operands use their register kind.
    Memory,
}

/// Operand size class, resolved to bytes per encoding by [`SizeClass::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SizeClass {
    None,
    Byte,
    Word,
    Dword,
    Qword,
    Tbyte,
    Oword,
    Yword,
    Zword,
    /// Word, dword or qword depending on mode, operand-size prefix and REX.W.
    VarWdq,
    /// Instruction specific; not handled by the engine.
    Special,
}

impl SizeClass {
    /// Size in bytes of a fixed size class.
    pub fn fixed_bytes(self) -> Option<u8> {
        match self {
            Self::None => Some(0),
            Self::Byte => Some(1),
            Self::Word => Some(2),
            Self::Dword => Some(4),
            Self::Qword => Some(8),
            Self::Tbyte => Some(10),
            Self::Oword => Some(16),
            Self::Yword => Some(32),
            Self::Zword => Some(64),
            Self::VarWdq | Self::Special => None,
        }
    }

    /// Operand size in bytes for the given mode and prefix state.
    ///
    /// In 64-bit mode REX.W wins over the operand-size prefix. Otherwise the prefix toggles
    /// between the mode's default width (16 or 32 bits) and the other one.
    pub fn resolve(self, mode: TargetMode, op_size_prefix: bool, rex_w: bool) -> Option<u8> {
        match self {
            Self::VarWdq => Some(match mode {
                TargetMode::Lm64 if rex_w => 8,
                TargetMode::Pe16 => {
                    if op_size_prefix {
                        4
                    } else {
                        2
                    }
                }
                _ => {
                    if op_size_prefix {
                        2
                    } else {
                        4
                    }
                }
            }),
            other => other.fixed_bytes(),
        }
    }
}

/// Which ModR/M field, if any, encodes an operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModRmRole {
    None,
    Reg,
    /// ModR/M.RM, register or memory form.
    Rm,
    RmRegOnly,
    RmMemOnly,
}

impl ModRmRole {
    pub fn is_rm(self) -> bool {
        matches!(self, Self::Rm | Self::RmRegOnly | Self::RmMemOnly)
    }

    pub fn allows_register(self) -> bool {
        matches!(self, Self::Rm | Self::RmRegOnly)
    }

    pub fn allows_memory(self) -> bool {
        matches!(self, Self::Rm | Self::RmMemOnly)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Access {
    None,
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub fn reads(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    pub fn writes(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperandSpec {
    pub kind: OperandKind,
    pub size: SizeClass,
    pub role: ModRmRole,
    pub access: Access,
    /// Memory operand always addressed through ES (string destinations).
    pub always_es: bool,
}

impl OperandSpec {
    pub const fn new(kind: OperandKind, size: SizeClass, role: ModRmRole, access: Access) -> Self {
        Self {
            kind,
            size,
            role,
            access,
            always_es: false,
        }
    }

    pub const fn always_es(mut self) -> Self {
        self.always_es = true;
        self
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InstrFlags: u8 {
        const MODRM = 1 << 0;
    }
}

/// Successful outcomes of an instruction's setup callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupOutcome {
    Ready,
    /// Values were produced, and the callback's static value table wrapped around.
    EndOfCycle,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SetupError {
    #[error("operand combination is not supported by the instruction's setup")]
    Unsupported,
    #[error("no input vectors available")]
    NoData,
}

/// Fills in operand input values and the predicted results for the current encoding.
///
/// The boolean asks for an invalid operand combination (fault injection) instead of a valid one.
pub type SetupFn = fn(&mut InOut<'_>, bool) -> std::result::Result<SetupOutcome, SetupError>;

pub struct InstructionDescriptor {
    pub mnemonic: &'static str,
    /// Operand form in opcode-map notation, e.g. `Eb,Gb`.
    pub form: &'static str,
    pub opcode: &'static [u8],
    /// Fixed ModR/M.REG value for `/digit` opcodes.
    pub opcode_ext: Option<u8>,
    pub mandatory_prefix: Option<u8>,
    pub operands: &'static [OperandSpec],
    pub flags: InstrFlags,
    pub setup: SetupFn,
}

impl std::fmt::Debug for InstructionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstructionDescriptor")
            .field("mnemonic", &self.mnemonic)
            .field("form", &self.form)
            .field("opcode", &self.opcode)
            .field("opcode_ext", &self.opcode_ext)
            .finish_non_exhaustive()
    }
}

impl InstructionDescriptor {
    /// `mnemonic form`, used in logs and reports.
    pub fn name(&self) -> String {
        format!("{} {}", self.mnemonic, self.form)
    }

    pub fn uses_modrm(&self) -> bool {
        self.flags.contains(InstrFlags::MODRM)
    }

    pub fn mrm_reg_operand(&self) -> Option<usize> {
        self.operands
            .iter()
            .position(|op| op.role == ModRmRole::Reg)
    }

    pub fn mrm_rm_operand(&self) -> Option<usize> {
        self.operands.iter().position(|op| op.role.is_rm())
    }

    /// The ModR/M.RM operand can take the register-direct form.
    pub fn has_register_rm_form(&self) -> bool {
        self.operands.iter().any(|op| op.role.allows_register())
    }

    /// The ModR/M.RM operand can take a memory form.
    pub fn has_memory_rm_form(&self) -> bool {
        self.operands.iter().any(|op| op.role.allows_memory())
    }

    /// Any operand changes size with the operand-size prefix or REX.W.
    pub fn responds_to_operand_size(&self) -> bool {
        self.operands.iter().any(|op| op.size == SizeClass::VarWdq)
    }

    /// Checks the descriptor is something the engine can enumerate.
    pub fn validate(&self) -> Result<()> {
        let mnemonic = self.mnemonic;
        if !self.uses_modrm() {
            return Err(CidetError::NoModRm { mnemonic });
        }
        if !(1..=3).contains(&self.opcode.len()) {
            return Err(CidetError::OpcodeLength {
                mnemonic,
                len: self.opcode.len(),
            });
        }
        if self.operands.len() > MAX_OPERANDS {
            return Err(CidetError::TooManyOperands {
                mnemonic,
                count: self.operands.len(),
                max: MAX_OPERANDS,
            });
        }
        let reg_count = self
            .operands
            .iter()
            .filter(|op| op.role == ModRmRole::Reg)
            .count();
        if reg_count > 1 {
            return Err(CidetError::DuplicateModRmOperand {
                mnemonic,
                field: "REG",
            });
        }
        match self.operands.iter().filter(|op| op.role.is_rm()).count() {
            0 => return Err(CidetError::MissingRmOperand { mnemonic }),
            1 => {}
            _ => {
                return Err(CidetError::DuplicateModRmOperand {
                    mnemonic,
                    field: "RM",
                })
            }
        }
        if (reg_count == 1) == self.opcode_ext.is_some() {
            return Err(CidetError::AmbiguousRegField { mnemonic });
        }
        for (index, op) in self.operands.iter().enumerate() {
            if op.size.resolve(TargetMode::Lm64, false, false).is_none() {
                return Err(CidetError::UnsupportedSizeClass { mnemonic, index });
            }
            let bindable = match op.kind {
                OperandKind::Gpr => op.role != ModRmRole::None,
                OperandKind::SegReg => op.role == ModRmRole::Reg,
                OperandKind::Immediate => {
                    op.role == ModRmRole::None && op.size.fixed_bytes().map_or(true, |cb| cb <= 8)
                }
                OperandKind::Memory => op.role == ModRmRole::RmMemOnly,
                OperandKind::ControlReg | OperandKind::DebugReg | OperandKind::Xmm => false,
            };
            if !bindable {
                return Err(CidetError::UnsupportedOperandKind {
                    mnemonic,
                    index,
                    kind: op.kind,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variable_size_follows_mode_rules() {
        let v = SizeClass::VarWdq;
        assert_eq!(v.resolve(TargetMode::Lm64, false, false), Some(4));
        assert_eq!(v.resolve(TargetMode::Lm64, true, false), Some(2));
        assert_eq!(v.resolve(TargetMode::Lm64, true, true), Some(8));
        assert_eq!(v.resolve(TargetMode::Lm64, false, true), Some(8));
        assert_eq!(v.resolve(TargetMode::Pp32, false, false), Some(4));
        assert_eq!(v.resolve(TargetMode::Pae32, true, false), Some(2));
        assert_eq!(v.resolve(TargetMode::Pe16, false, false), Some(2));
        assert_eq!(v.resolve(TargetMode::Pe16, true, false), Some(4));
        assert_eq!(SizeClass::Zword.resolve(TargetMode::Pp32, true, false), Some(64));
        assert_eq!(SizeClass::Special.resolve(TargetMode::Pp32, false, false), None);
    }
}
