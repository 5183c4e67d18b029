use thiserror::Error;

use crate::descriptor::OperandKind;

pub type Result<T> = std::result::Result<T, CidetError>;

/// Fatal errors that end a test session.
///
/// These indicate a bug in the engine or an inconsistent instruction descriptor. Conditions that
/// merely make one encoding untestable are skips and never surface as a `CidetError`.
#[derive(Debug, Error)]
pub enum CidetError {
    #[error("no instruction selected")]
    NoInstruction,

    #[error("{mnemonic}: only ModR/M encoded instructions are supported")]
    NoModRm { mnemonic: &'static str },

    #[error("{mnemonic}: opcode must be 1 to 3 bytes, got {len}")]
    OpcodeLength { mnemonic: &'static str, len: usize },

    #[error("{mnemonic}: {count} operands exceeds the maximum of {max}")]
    TooManyOperands {
        mnemonic: &'static str,
        count: usize,
        max: usize,
    },

    #[error("{mnemonic}: more than one operand claims ModR/M.{field}")]
    DuplicateModRmOperand {
        mnemonic: &'static str,
        field: &'static str,
    },

    #[error("{mnemonic}: no ModR/M.RM operand")]
    MissingRmOperand { mnemonic: &'static str },

    #[error("{mnemonic}: ModR/M.REG must be either an operand or an opcode extension")]
    AmbiguousRegField { mnemonic: &'static str },

    #[error("{mnemonic}: operand {index} has no usable size class")]
    UnsupportedSizeClass { mnemonic: &'static str, index: usize },

    #[error("{mnemonic}: operand {index} of kind {kind:?} is not supported")]
    UnsupportedOperandKind {
        mnemonic: &'static str,
        index: usize,
        kind: OperandKind,
    },

    #[error("{mnemonic}: {count} memory operands, at most {max} supported")]
    TooManyMemoryOperands {
        mnemonic: &'static str,
        count: usize,
        max: usize,
    },

    #[error("no code buffer configurations registered")]
    NoCodeBufferConfigs,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to write report: {0}")]
    Report(#[from] std::io::Error),
}

/// Reasons the assembler can refuse the current encoding state.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AssembleError {
    #[error("opcode length {0} out of range")]
    OpcodeLength(usize),

    #[error("unsupported displacement size {0}")]
    DisplacementSize(u8),

    #[error("unsupported immediate size {0}")]
    ImmediateSize(u8),

    #[error("encoding is {0} bytes, longer than the 15 byte architectural limit")]
    TooLong(usize),
}
