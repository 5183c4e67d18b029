//! The two-operand ALU group: `add`, `or`, `adc`, `sbb`, `and`, `sub`, `xor`, `cmp`.
//!
//! Every operation comes in the six classic ModR/M forms: `Eb,Gb`, `Ev,Gv`, `Gb,Eb`, `Gv,Ev`,
//! and the group-1 immediates `Eb,Ib` (0x80 /n) and `Ev,Ib` (0x83 /n, sign-extended).

use rand::Rng;

use crate::ctx::{FLAGS_ARITH, FLAG_AF, FLAG_CF, FLAG_OF, FLAG_PF, FLAG_SF, FLAG_ZF};
use crate::descriptor::{
    Access, InstrFlags, InstructionDescriptor, ModRmRole, OperandKind, OperandSpec, SetupError,
    SetupOutcome, SizeClass,
};
use crate::operand::{sign_extend, size_mask, InOut};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AluOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluOp {
    /// In opcode order; the index is both the `/digit` and `opcode >> 3`.
    pub const ALL: [AluOp; 8] = [
        AluOp::Add,
        AluOp::Or,
        AluOp::Adc,
        AluOp::Sbb,
        AluOp::And,
        AluOp::Sub,
        AluOp::Xor,
        AluOp::Cmp,
    ];

    pub fn mnemonic(self) -> &'static str {
        match self {
            AluOp::Add => "add",
            AluOp::Or => "or",
            AluOp::Adc => "adc",
            AluOp::Sbb => "sbb",
            AluOp::And => "and",
            AluOp::Sub => "sub",
            AluOp::Xor => "xor",
            AluOp::Cmp => "cmp",
        }
    }

    pub fn writes_result(self) -> bool {
        self != AluOp::Cmp
    }

    /// AF is undefined after the logic operations.
    pub fn is_logic(self) -> bool {
        matches!(self, AluOp::Or | AluOp::And | AluOp::Xor)
    }

    /// Result and new rflags of `dest op src` at `size` bytes.
    pub fn eval(self, dest: u64, src: u64, rflags: u64, size: u8) -> (u64, u64) {
        let carry = rflags & FLAG_CF != 0;
        let (result, flags) = match self {
            AluOp::Add => add_with_flags(dest, src, false, size),
            AluOp::Adc => add_with_flags(dest, src, carry, size),
            AluOp::Sub | AluOp::Cmp => sub_with_flags(dest, src, false, size),
            AluOp::Sbb => sub_with_flags(dest, src, carry, size),
            AluOp::Or => logic_with_flags(dest | src, size),
            AluOp::And => logic_with_flags(dest & src, size),
            AluOp::Xor => logic_with_flags(dest ^ src, size),
        };
        (result, (rflags & !FLAGS_ARITH) | flags)
    }
}

fn sign_bit(size: u8) -> u64 {
    1u64 << (u32::from(size) * 8 - 1)
}

fn parity(byte: u8) -> bool {
    byte.count_ones() % 2 == 0
}

fn result_flags(result: u64, size: u8) -> u64 {
    let mut flags = 0;
    if result == 0 {
        flags |= FLAG_ZF;
    }
    if result & sign_bit(size) != 0 {
        flags |= FLAG_SF;
    }
    if parity(result as u8) {
        flags |= FLAG_PF;
    }
    flags
}

fn add_with_flags(dest: u64, src: u64, carry_in: bool, size: u8) -> (u64, u64) {
    let mask = size_mask(size);
    let (dest, src) = (dest & mask, src & mask);
    let full = u128::from(dest) + u128::from(src) + u128::from(carry_in);
    let result = full as u64 & mask;

    let mut flags = result_flags(result, size);
    if full > u128::from(mask) {
        flags |= FLAG_CF;
    }
    if (dest ^ result) & (src ^ result) & sign_bit(size) != 0 {
        flags |= FLAG_OF;
    }
    if (dest ^ src ^ result) & 0x10 != 0 {
        flags |= FLAG_AF;
    }
    (result, flags)
}

fn sub_with_flags(dest: u64, src: u64, borrow_in: bool, size: u8) -> (u64, u64) {
    let mask = size_mask(size);
    let (dest, src) = (dest & mask, src & mask);
    let subtrahend = u128::from(src) + u128::from(borrow_in);
    let result = u128::from(dest).wrapping_sub(subtrahend) as u64 & mask;

    let mut flags = result_flags(result, size);
    if u128::from(dest) < subtrahend {
        flags |= FLAG_CF;
    }
    if (dest ^ src) & (dest ^ result) & sign_bit(size) != 0 {
        flags |= FLAG_OF;
    }
    if (dest ^ src ^ result) & 0x10 != 0 {
        flags |= FLAG_AF;
    }
    (result, flags)
}

fn logic_with_flags(result: u64, size: u8) -> (u64, u64) {
    let result = result & size_mask(size);
    (result, result_flags(result, size))
}

const DEST: usize = 0;
const SRC: usize = 1;

/// Edge values per operand width, walked as `(dest, src)` pairs before random values.
const EDGE_COUNT: usize = 5;
/// Random cases per cycle after the edge pairs.
const RANDOM_PER_CYCLE: usize = 7;
const CYCLE_LEN: usize = EDGE_COUNT * EDGE_COUNT + RANDOM_PER_CYCLE;

fn edge_values(size: u8) -> [u64; EDGE_COUNT] {
    let sb = sign_bit(size);
    [0, 1, sb - 1, sb, size_mask(size)]
}

fn setup_binary(
    op: AluOp,
    io: &mut InOut<'_>,
    invalid: bool,
) -> Result<SetupOutcome, SetupError> {
    if invalid {
        return Err(SetupError::Unsupported);
    }
    let size = io.operand(DEST).size;
    let src_size = io.operand(SRC).size;
    if size == 0 || src_size == 0 {
        return Err(SetupError::Unsupported);
    }

    let cursor = io.cursor(0);
    let slot = *cursor;
    *cursor = (slot + 1) % CYCLE_LEN;
    let outcome = if *cursor == 0 {
        SetupOutcome::EndOfCycle
    } else {
        SetupOutcome::Ready
    };

    let (dest_value, src_value) = if slot < EDGE_COUNT * EDGE_COUNT {
        (
            edge_values(size)[slot / EDGE_COUNT],
            edge_values(src_size)[slot % EDGE_COUNT],
        )
    } else {
        (io.random_value(DEST), io.random_value(SRC))
    };
    let flags_in = (io.input_rflags() & !FLAGS_ARITH) | (io.rng().gen::<u64>() & FLAGS_ARITH);
    io.set_input_rflags(flags_in);

    for (idx, value) in [(DEST, dest_value), (SRC, src_value)] {
        if !io.is_pinned(idx) {
            io.set_input_value(idx, value);
        }
    }

    // Colliding operands share a register, so read back what the instruction will see.
    let dest = io.input_value(DEST);
    let mut src = io.input_value(SRC);
    if io.operand(SRC).is_imm() && src_size < size {
        src = sign_extend(src, src_size) as u64 & size_mask(size);
    }
    for idx in 0..io.operand_count() {
        let value = io.input_value(idx);
        io.set_expected_value(idx, value);
    }

    let (result, flags) = op.eval(dest, src, flags_in, size);
    io.set_expected_rflags(flags);
    if op.is_logic() {
        io.ignore_rflags(FLAG_AF);
    }
    if op.writes_result() {
        io.set_result(DEST, result);
    }
    Ok(outcome)
}

fn setup<const OP: usize>(io: &mut InOut<'_>, invalid: bool) -> Result<SetupOutcome, SetupError> {
    setup_binary(AluOp::ALL[OP], io, invalid)
}

const fn rm_reg(size: SizeClass, dest: Access) -> [OperandSpec; 2] {
    [
        OperandSpec::new(OperandKind::Gpr, size, ModRmRole::Rm, dest),
        OperandSpec::new(OperandKind::Gpr, size, ModRmRole::Reg, Access::Read),
    ]
}

const fn reg_rm(size: SizeClass, dest: Access) -> [OperandSpec; 2] {
    [
        OperandSpec::new(OperandKind::Gpr, size, ModRmRole::Reg, dest),
        OperandSpec::new(OperandKind::Gpr, size, ModRmRole::Rm, Access::Read),
    ]
}

const fn rm_imm8(size: SizeClass, dest: Access) -> [OperandSpec; 2] {
    [
        OperandSpec::new(OperandKind::Gpr, size, ModRmRole::Rm, dest),
        OperandSpec::new(
            OperandKind::Immediate,
            SizeClass::Byte,
            ModRmRole::None,
            Access::Read,
        ),
    ]
}

const EB_GB: [OperandSpec; 2] = rm_reg(SizeClass::Byte, Access::ReadWrite);
const EV_GV: [OperandSpec; 2] = rm_reg(SizeClass::VarWdq, Access::ReadWrite);
const GB_EB: [OperandSpec; 2] = reg_rm(SizeClass::Byte, Access::ReadWrite);
const GV_EV: [OperandSpec; 2] = reg_rm(SizeClass::VarWdq, Access::ReadWrite);
const EB_IB: [OperandSpec; 2] = rm_imm8(SizeClass::Byte, Access::ReadWrite);
const EV_IB: [OperandSpec; 2] = rm_imm8(SizeClass::VarWdq, Access::ReadWrite);

const CMP_EB_GB: [OperandSpec; 2] = rm_reg(SizeClass::Byte, Access::Read);
const CMP_EV_GV: [OperandSpec; 2] = rm_reg(SizeClass::VarWdq, Access::Read);
const CMP_GB_EB: [OperandSpec; 2] = reg_rm(SizeClass::Byte, Access::Read);
const CMP_GV_EV: [OperandSpec; 2] = reg_rm(SizeClass::VarWdq, Access::Read);
const CMP_EB_IB: [OperandSpec; 2] = rm_imm8(SizeClass::Byte, Access::Read);
const CMP_EV_IB: [OperandSpec; 2] = rm_imm8(SizeClass::VarWdq, Access::Read);

macro_rules! alu_forms {
    (@one $op:literal, $mnemonic:literal, $form:literal, [$opcode:expr], $ext:expr, $operands:ident) => {
        InstructionDescriptor {
            mnemonic: $mnemonic,
            form: $form,
            opcode: &[$opcode],
            opcode_ext: $ext,
            mandatory_prefix: None,
            operands: &$operands,
            flags: InstrFlags::MODRM,
            setup: setup::<$op>,
        }
    };
    ($op:literal, $mnemonic:literal, $eb_gb:ident, $ev_gv:ident, $gb_eb:ident, $gv_ev:ident,
     $eb_ib:ident, $ev_ib:ident) => {
        [
            alu_forms!(@one $op, $mnemonic, "Eb,Gb", [$op * 8], None, $eb_gb),
            alu_forms!(@one $op, $mnemonic, "Ev,Gv", [$op * 8 + 1], None, $ev_gv),
            alu_forms!(@one $op, $mnemonic, "Gb,Eb", [$op * 8 + 2], None, $gb_eb),
            alu_forms!(@one $op, $mnemonic, "Gv,Ev", [$op * 8 + 3], None, $gv_ev),
            alu_forms!(@one $op, $mnemonic, "Eb,Ib", [0x80], Some($op), $eb_ib),
            alu_forms!(@one $op, $mnemonic, "Ev,Ib", [0x83], Some($op), $ev_ib),
        ]
    };
}

const FORMS_PER_OP: usize = 6;

pub static INSTRUCTIONS: [[InstructionDescriptor; FORMS_PER_OP]; 8] = [
    alu_forms!(0, "add", EB_GB, EV_GV, GB_EB, GV_EV, EB_IB, EV_IB),
    alu_forms!(1, "or", EB_GB, EV_GV, GB_EB, GV_EV, EB_IB, EV_IB),
    alu_forms!(2, "adc", EB_GB, EV_GV, GB_EB, GV_EV, EB_IB, EV_IB),
    alu_forms!(3, "sbb", EB_GB, EV_GV, GB_EB, GV_EV, EB_IB, EV_IB),
    alu_forms!(4, "and", EB_GB, EV_GV, GB_EB, GV_EV, EB_IB, EV_IB),
    alu_forms!(5, "sub", EB_GB, EV_GV, GB_EB, GV_EV, EB_IB, EV_IB),
    alu_forms!(6, "xor", EB_GB, EV_GV, GB_EB, GV_EV, EB_IB, EV_IB),
    alu_forms!(7, "cmp", CMP_EB_GB, CMP_EV_GV, CMP_GB_EB, CMP_GV_EV, CMP_EB_IB, CMP_EV_IB),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_matches_opcode_map() {
        for (i, forms) in INSTRUCTIONS.iter().enumerate() {
            let op = AluOp::ALL[i];
            for instr in forms {
                assert_eq!(instr.mnemonic, op.mnemonic());
                instr.validate().unwrap();
            }
            assert_eq!(forms[0].opcode, &[(i as u8) << 3]);
            assert_eq!(forms[3].opcode, &[((i as u8) << 3) + 3]);
            assert_eq!(forms[5].opcode_ext, Some(i as u8));
        }
    }

    #[test]
    fn add_and_sub_flag_corners() {
        let base = 0x202;
        let (r, f) = AluOp::Add.eval(0x7f, 0x01, base, 1);
        assert_eq!(r, 0x80);
        assert_eq!(f & FLAGS_ARITH, FLAG_OF | FLAG_SF | FLAG_AF);

        let (r, f) = AluOp::Add.eval(0xff, 0x01, base, 1);
        assert_eq!(r, 0);
        assert_eq!(f & FLAGS_ARITH, FLAG_CF | FLAG_ZF | FLAG_PF | FLAG_AF);

        let (r, f) = AluOp::Sub.eval(0, 1, base, 4);
        assert_eq!(r, 0xffff_ffff);
        assert_eq!(f & FLAGS_ARITH, FLAG_CF | FLAG_SF | FLAG_PF | FLAG_AF);
        assert_eq!(f & !FLAGS_ARITH, base);
    }

    #[test]
    fn carry_chains_use_the_incoming_flag() {
        let (r, f) = AluOp::Adc.eval(0xffff, 0, FLAG_CF, 2);
        assert_eq!(r, 0);
        assert_ne!(f & FLAG_CF, 0);

        // 0x80 - 0x7f - 1 overflows a signed byte.
        let (r, f) = AluOp::Sbb.eval(0x80, 0x7f, FLAG_CF, 1);
        assert_eq!(r, 0);
        assert_ne!(f & FLAG_OF, 0);

        // Nibble borrow with src + borrow wrapping to zero.
        let (r, f) = AluOp::Sbb.eval(0x7f, 0xff, FLAG_CF, 1);
        assert_eq!(r, 0x7f);
        assert_ne!(f & FLAG_AF, 0);
        assert_ne!(f & FLAG_CF, 0);
        assert_eq!(f & FLAG_OF, 0);
    }

    #[test]
    fn logic_clears_carry_and_overflow() {
        let (r, f) = AluOp::Xor.eval(0xaa, 0xaa, FLAG_CF | FLAG_OF, 1);
        assert_eq!(r, 0);
        assert_eq!(f & FLAGS_ARITH, FLAG_ZF | FLAG_PF);
        assert!(AluOp::And.is_logic());
        assert!(!AluOp::Cmp.writes_result());
    }
}
