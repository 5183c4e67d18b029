//! Per-encoding operand bindings and the value accessor handed to instruction setup callbacks.

use rand::rngs::StdRng;
use rand::Rng;

use crate::ctx::{CpuContext, SegReg};
use crate::descriptor::{OperandKind, OperandSpec};
use crate::encoding::Indicators;
use crate::mode::TargetMode;

/// Largest memory operand (zword).
pub const MAX_OPERAND_BYTES: usize = 64;

/// Number of iteration cursors an instruction's setup callback may keep between cases.
pub const IN_OUT_CURSORS: usize = 4;

/// Byte size to value mask.
pub const BYTE_SIZE_TO_MASK: [u64; 9] = [
    0,
    0xff,
    0xffff,
    0xff_ffff,
    0xffff_ffff,
    0xff_ffff_ffff,
    0xffff_ffff_ffff,
    0xff_ffff_ffff_ffff,
    u64::MAX,
];

/// Byte size to largest signed value.
pub const BYTE_SIZE_TO_MAX: [i64; 9] = [
    0,
    i8::MAX as i64,
    i16::MAX as i64,
    0x7f_ffff,
    i32::MAX as i64,
    0x7f_ffff_ffff,
    0x7fff_ffff_ffff,
    0x7f_ffff_ffff_ffff,
    i64::MAX,
];

pub fn size_mask(cb: u8) -> u64 {
    BYTE_SIZE_TO_MASK[usize::from(cb.min(8))]
}

/// Sign-extends the low `cb` bytes of `value`.
pub fn sign_extend(value: u64, cb: u8) -> i64 {
    match cb {
        0 => 0,
        1 => value as u8 as i8 as i64,
        2 => value as u16 as i16 as i64,
        4 => value as u32 as i32 as i64,
        8 => value as i64,
        _ => {
            let shift = 64 - 8 * u32::from(cb.min(8));
            ((value << shift) as i64) >> shift
        }
    }
}

/// Where an operand's input and expected values live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandLocation {
    Unbound,
    Gpr { index: u8, high_byte: bool },
    SegReg(SegReg),
    Immediate,
    /// The operand's scratch bytes, staged into its data buffer.
    Memory,
}

/// An operand resolved for the current encoding.
#[derive(Debug, Clone)]
pub struct OperandBinding {
    pub spec: OperandSpec,
    /// Register number as encoded (high-byte registers keep their 4..7 encoding), `None` for
    /// memory operands and immediates.
    pub reg: Option<u8>,
    /// Resolved size in bytes.
    pub size: u8,
    pub is_mem: bool,
    pub is_high_byte: bool,
    pub is_rip_relative: bool,
    pub mem_base: Option<u8>,
    pub mem_index: Option<u8>,
    /// 1, 2, 4 or 8.
    pub mem_scale: u8,
    /// Displacement size in bytes: 0, 1, 2 or 4.
    pub disp_size: u8,
    pub eff_seg: Option<SegReg>,
    /// Linear address of the memory operand.
    pub eff_addr: u64,
    /// Offset of the memory operand within its segment.
    pub seg_offset: u64,
    /// Displacement of a memory operand, value of an immediate.
    pub imm_disp: u64,
    pub base_value: u64,
    pub index_value: u64,
    pub location: OperandLocation,
    pub data_buf: Option<usize>,
    pub mem_input: [u8; MAX_OPERAND_BYTES],
    pub mem_expected: [u8; MAX_OPERAND_BYTES],
}

impl OperandBinding {
    pub fn new(spec: OperandSpec) -> Self {
        Self {
            spec,
            reg: None,
            size: 0,
            is_mem: false,
            is_high_byte: false,
            is_rip_relative: false,
            mem_base: None,
            mem_index: None,
            mem_scale: 1,
            disp_size: 0,
            eff_seg: None,
            eff_addr: 0,
            seg_offset: 0,
            imm_disp: 0,
            base_value: 0,
            index_value: 0,
            location: OperandLocation::Unbound,
            data_buf: None,
            mem_input: [0; MAX_OPERAND_BYTES],
            mem_expected: [0; MAX_OPERAND_BYTES],
        }
    }

    pub fn is_imm(&self) -> bool {
        self.spec.kind == OperandKind::Immediate
    }

    /// Register-direct general purpose register operand.
    pub fn is_gpr(&self) -> bool {
        !self.is_mem && self.spec.kind == OperandKind::Gpr && self.reg.is_some()
    }

    /// Register file index this operand touches, with `ah..bh` mapped onto `rax..rbx`.
    pub fn phys_reg(&self) -> Option<u8> {
        if self.is_mem {
            return None;
        }
        let reg = self.reg?;
        Some(if self.is_high_byte { reg - 4 } else { reg })
    }

    /// Byte lanes of the physical register the operand covers.
    pub fn reg_lanes(&self) -> std::ops::Range<u8> {
        if self.is_high_byte {
            1..2
        } else {
            0..self.size.max(1)
        }
    }

    /// Clears everything the binder derives for an encoding, keeping the encoding shape.
    pub(crate) fn reset_values(&mut self) {
        self.eff_seg = None;
        self.eff_addr = 0;
        self.seg_offset = 0;
        self.base_value = 0;
        self.index_value = 0;
        self.location = OperandLocation::Unbound;
        self.mem_input = [0; MAX_OPERAND_BYTES];
        self.mem_expected = [0; MAX_OPERAND_BYTES];
        if !self.is_mem {
            self.imm_disp = 0;
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Input,
    Expected,
}

fn read_value(op: &OperandBinding, ctx: &CpuContext, side: Side) -> u64 {
    let mask = size_mask(op.size);
    match op.location {
        OperandLocation::Gpr { index, high_byte } => {
            let shift = if high_byte { 8 } else { 0 };
            (ctx.gprs[usize::from(index)] >> shift) & mask
        }
        OperandLocation::SegReg(seg) => u64::from(ctx.sreg(seg)) & mask,
        OperandLocation::Immediate => op.imm_disp & mask,
        OperandLocation::Memory => {
            let bytes = match side {
                Side::Input => &op.mem_input,
                Side::Expected => &op.mem_expected,
            };
            let n = usize::from(op.size.min(8));
            let mut le = [0u8; 8];
            le[..n].copy_from_slice(&bytes[..n]);
            u64::from_le_bytes(le)
        }
        OperandLocation::Unbound => 0,
    }
}

fn write_value(op: &mut OperandBinding, ctx: &mut CpuContext, side: Side, value: u64) {
    let mask = size_mask(op.size);
    match op.location {
        OperandLocation::Gpr { index, high_byte } => {
            let shift = if high_byte { 8 } else { 0 };
            let reg = &mut ctx.gprs[usize::from(index)];
            *reg = (*reg & !(mask << shift)) | ((value & mask) << shift);
        }
        OperandLocation::SegReg(seg) => ctx.set_sreg(seg, value as u16),
        OperandLocation::Immediate => {
            if side == Side::Input {
                op.imm_disp = value & mask;
            }
        }
        OperandLocation::Memory => {
            let bytes = match side {
                Side::Input => &mut op.mem_input,
                Side::Expected => &mut op.mem_expected,
            };
            let n = usize::from(op.size.min(8));
            bytes[..n].copy_from_slice(&value.to_le_bytes()[..n]);
        }
        OperandLocation::Unbound => {}
    }
}

/// View of the engine state given to an instruction's setup callback.
///
/// Values are read and written at the operand's resolved size. Input writes do not touch the
/// expected side; the callback predicts every operand it cares about.
pub struct InOut<'a> {
    pub(crate) mode: TargetMode,
    pub(crate) operands: &'a mut [OperandBinding],
    pub(crate) input: &'a mut CpuContext,
    pub(crate) expected: &'a mut CpuContext,
    pub(crate) indicators: Indicators,
    pub(crate) cursors: &'a mut [usize; IN_OUT_CURSORS],
    pub(crate) rng: &'a mut StdRng,
}

impl<'a> InOut<'a> {
    pub fn mode(&self) -> TargetMode {
        self.mode
    }

    pub fn operand_count(&self) -> usize {
        self.operands.len()
    }

    pub fn operand(&self, index: usize) -> &OperandBinding {
        &self.operands[index]
    }

    pub fn indicators(&self) -> &Indicators {
        &self.indicators
    }

    /// The operand is a register also used to address memory, so its input value is already
    /// fixed by the address solver.
    pub fn is_pinned(&self, index: usize) -> bool {
        let op = &self.operands[index];
        op.is_gpr()
            && op.spec.role == crate::descriptor::ModRmRole::Reg
            && self.indicators.reg_collision_mem
    }

    pub fn input_value(&self, index: usize) -> u64 {
        read_value(&self.operands[index], self.input, Side::Input)
    }

    pub fn expected_value(&self, index: usize) -> u64 {
        read_value(&self.operands[index], self.expected, Side::Expected)
    }

    pub fn set_input_value(&mut self, index: usize, value: u64) {
        write_value(&mut self.operands[index], self.input, Side::Input, value);
    }

    pub fn set_expected_value(&mut self, index: usize, value: u64) {
        write_value(&mut self.operands[index], self.expected, Side::Expected, value);
    }

    /// Predicts an instruction result written to `index`.
    ///
    /// Dword writes to a general purpose register clear the upper half in 64-bit mode.
    pub fn set_result(&mut self, index: usize, value: u64) {
        let op = &self.operands[index];
        if let OperandLocation::Gpr {
            index: reg,
            high_byte: false,
        } = op.location
        {
            if op.size == 4 && self.mode.is_64bit() {
                self.expected.gprs[usize::from(reg)] = value & 0xffff_ffff;
                return;
            }
        }
        self.set_expected_value(index, value);
    }

    pub fn input_rflags(&self) -> u64 {
        self.input.rflags
    }

    pub fn set_input_rflags(&mut self, rflags: u64) {
        self.input.rflags = rflags;
    }

    pub fn expected_rflags(&self) -> u64 {
        self.expected.rflags
    }

    pub fn set_expected_rflags(&mut self, rflags: u64) {
        self.expected.rflags = rflags;
    }

    /// Marks flags the prediction leaves undefined.
    pub fn ignore_rflags(&mut self, mask: u64) {
        self.expected.ignored_rflags |= mask;
    }

    /// Iteration cursor kept across test cases of the same instruction.
    pub fn cursor(&mut self, slot: usize) -> &mut usize {
        &mut self.cursors[slot]
    }

    /// A random value masked to the operand's size.
    pub fn random_value(&mut self, index: usize) -> u64 {
        let mask = size_mask(self.operands[index].size);
        self.rng.gen::<u64>() & mask
    }

    pub fn rng(&mut self) -> &mut StdRng {
        self.rng
    }
}
