//! Instruction descriptor tables.

pub mod alu;

use crate::descriptor::InstructionDescriptor;

/// Every instruction the engine knows how to test.
pub fn all() -> impl Iterator<Item = &'static InstructionDescriptor> {
    alu::INSTRUCTIONS.iter().flatten()
}

/// Looks up an instruction by mnemonic and operand form, e.g. `("add", "Eb,Gb")`.
pub fn find(mnemonic: &str, form: &str) -> Option<&'static InstructionDescriptor> {
    all().find(|instr| instr.mnemonic.eq_ignore_ascii_case(mnemonic) && instr.form == form)
}
