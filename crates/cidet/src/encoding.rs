//! Encoding enumerator.
//!
//! Walks every byte-level encoding of the current instruction like an odometer. Innermost wheel
//! first: operand size (0x66 / REX.W), segment override, SIB.scale, SIB.index, SIB.base,
//! ModR/M.RM+MOD, ModR/M.REG, address size (0x67).

use bitflags::bitflags;

use crate::ctx::{gpr, SegReg};
use crate::descriptor::OperandKind;
use crate::engine::EngineState;
use crate::error::{CidetError, Result};

bitflags! {
    /// Segment-override prefixes the enumerator may emit for memory operands.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SegPrefixes: u8 {
        const ES = 1 << 0;
        const CS = 1 << 1;
        const SS = 1 << 2;
        const DS = 1 << 3;
        const FS = 1 << 4;
        const GS = 1 << 5;
    }
}

impl SegPrefixes {
    pub fn for_seg(seg: SegReg) -> Self {
        Self::from_bits_truncate(1 << seg.index())
    }
}

/// The encoding knobs the enumerator turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EncodingState {
    pub addr_size_prefix: bool,
    pub op_size_prefix: bool,
    /// A REX prefix is required even if no REX bit is set (`spl`/`bpl`/`sil`/`dil` in REG).
    pub rex: bool,
    pub rex_w: bool,
    pub rex_r: bool,
    pub rex_x: bool,
    pub rex_b: bool,
    pub modrm: u8,
    pub has_sib: bool,
    pub sib: u8,
    pub seg_prefix: Option<SegReg>,
    /// Reserved for VEX/EVEX encoded instructions.
    pub vex: bool,
    pub evex: bool,
    /// Effective address size in bytes.
    pub addr_bytes: u8,
    /// A high-byte register (`ah..bh`) is encoded, so no REX prefix may be emitted.
    pub no_rex: bool,
    pub no_rex_for_reg: bool,
    pub no_rex_for_rm: bool,
    pub high_byte_in_reg: bool,
    pub high_byte_in_rm: bool,
}

impl EncodingState {
    /// The REX byte to emit, if any.
    pub fn rex_byte(&self) -> Option<u8> {
        let bits = u8::from(self.rex_b)
            | (u8::from(self.rex_x) << 1)
            | (u8::from(self.rex_r) << 2)
            | (u8::from(self.rex_w) << 3);
        (bits != 0 || self.rex).then_some(0x40 | bits)
    }

    pub fn modrm_mod(&self) -> u8 {
        self.modrm >> 6
    }

    fn set_modrm_rm(&mut self, rm: u8) {
        self.modrm = (self.modrm & !0x07) | (rm & 7);
    }

    fn set_modrm_reg(&mut self, reg: u8) {
        self.modrm = (self.modrm & !0x38) | ((reg & 7) << 3);
    }

    fn set_modrm_mod_rm(&mut self, md: u8, rm: u8) {
        self.modrm = (md << 6) | (self.modrm & 0x38) | (rm & 7);
    }

    fn reset_rm_byte_tracking(&mut self) {
        self.no_rex_for_rm = false;
        self.high_byte_in_rm = false;
        self.no_rex = self.no_rex_for_reg;
    }
}

/// Facts derived from the current encoding, recomputed after every step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Indicators {
    pub has_memory_operand: bool,
    /// ModR/M.REG and a register-direct ModR/M.RM overlap in the same register.
    pub reg_collision_direct: bool,
    /// ModR/M.REG is also a base or index register of the memory operand.
    pub reg_collision_mem: bool,
    pub reg_collision_mem_base: bool,
    pub reg_collision_mem_index: bool,
    pub stack_reg_in_mrm_reg: bool,
    pub stack_reg_in_mrm_rm_base: bool,
    pub high_byte_reg_in_use: bool,
    pub rex_forbidden: bool,
}

impl Indicators {
    /// The stack pointer is an operand or addresses memory.
    pub fn tricky_stack(&self) -> bool {
        self.stack_reg_in_mrm_reg || self.stack_reg_in_mrm_rm_base
    }
}

fn lanes_overlap(a: std::ops::Range<u8>, b: std::ops::Range<u8>) -> bool {
    a.start < b.end && b.start < a.end
}

impl EngineState {
    pub fn encoding(&self) -> &EncodingState {
        &self.enc
    }

    pub fn indicators(&self) -> &Indicators {
        &self.indicators
    }

    /// Highest register number ModR/M.RM and SIB may select.
    fn reg_mask(&self) -> u8 {
        if self.enc.no_rex {
            7
        } else {
            self.mode.gpr_count() - 1
        }
    }

    fn is_byte_gpr(&self, idx: usize) -> bool {
        let op = &self.operands[idx];
        op.size == 1 && op.spec.kind == OperandKind::Gpr
    }

    pub(crate) fn update_operand_sizes(&mut self) {
        for op in &mut self.operands {
            op.size = op
                .spec
                .size
                .resolve(self.mode, self.enc.op_size_prefix, self.enc.rex_w)
                .unwrap_or(0);
        }
    }

    /// Resets every wheel to its first position.
    pub fn setup_first_encoding(&mut self) -> Result<()> {
        let instr = self.instr.ok_or(CidetError::NoInstruction)?;
        if !instr.uses_modrm() {
            return Err(CidetError::NoModRm {
                mnemonic: instr.mnemonic,
            });
        }

        self.enc = EncodingState {
            addr_bytes: self.mode.default_address_bytes(),
            ..EncodingState::default()
        };
        self.setup_first_mrm_reg();
        self.setup_first_rm_mod();
        self.update_operand_sizes();
        self.refresh_indicators();
        Ok(())
    }

    /// Advances to the next encoding. Returns `false` once every wheel has wrapped, leaving the
    /// state back at the first encoding.
    pub fn setup_next_encoding(&mut self) -> bool {
        let advanced = self.setup_next_operand_size()
            || self.setup_next_segment_prefix()
            || self.setup_next_sib()
            || self.setup_next_rm_mod()
            || self.setup_next_mrm_reg()
            || self.setup_next_address_size();
        self.refresh_indicators();
        advanced
    }

    fn setup_first_mrm_reg(&mut self) {
        self.enc.rex = false;
        self.enc.rex_r = false;
        self.enc.no_rex_for_reg = false;
        self.enc.high_byte_in_reg = false;
        self.enc.no_rex = self.enc.no_rex_for_rm;

        match self.mrm_reg_op {
            Some(idx) => {
                let op = &mut self.operands[idx];
                op.reg = Some(0);
                op.is_mem = false;
                op.is_high_byte = false;
                op.is_rip_relative = false;
                op.mem_base = None;
                op.mem_index = None;
                op.disp_size = 0;
                self.enc.set_modrm_reg(0);
            }
            None => {
                let ext = self.instr.and_then(|instr| instr.opcode_ext).unwrap_or(0);
                self.enc.set_modrm_reg(ext);
            }
        }
    }

    fn setup_next_mrm_reg(&mut self) -> bool {
        let Some(idx) = self.mrm_reg_op else {
            return false;
        };
        let is_64 = self.mode.is_64bit();
        let mut reg = ((self.enc.modrm >> 3) & 7) | (u8::from(self.enc.rex_r) << 3);

        self.enc.no_rex_for_reg = false;
        self.enc.high_byte_in_reg = false;
        self.enc.no_rex = self.enc.no_rex_for_rm;
        self.operands[idx].is_high_byte = false;

        // Byte registers 4..7 are ah..bh without REX and spl..dil with it; walk both.
        if self.is_byte_gpr(idx)
            && reg >= 3
            && (reg <= 6 || (is_64 && reg == 7 && !self.enc.rex))
        {
            if is_64 && !self.enc.rex && reg >= 4 && !self.enc.no_rex {
                self.enc.rex = true;
            } else {
                reg += 1;
                self.enc.set_modrm_reg(reg);
                self.enc.rex = false;
                self.enc.rex_r = false;
                self.enc.no_rex_for_reg = true;
                self.enc.no_rex = true;
                self.enc.high_byte_in_reg = true;
                let op = &mut self.operands[idx];
                op.reg = Some(reg);
                op.is_high_byte = true;
            }
            return true;
        }

        self.enc.rex = false;
        reg = (reg + 1) & if is_64 { 15 } else { 7 };
        self.enc.set_modrm_reg(reg);
        self.enc.rex_r = reg >= 8;
        self.operands[idx].reg = Some(reg);
        reg != 0
    }

    pub(crate) fn setup_first_rm_mod(&mut self) {
        self.enc.rex_b = false;
        self.enc.rex_x = false;
        self.enc.has_sib = false;
        self.enc.sib = 0;
        self.enc.reset_rm_byte_tracking();

        let Some(idx) = self.mrm_rm_op else {
            return;
        };
        let is_16 = self.enc.addr_bytes == 2;
        let register_first = self.instr.is_some_and(|instr| instr.has_register_rm_form());
        let op = &mut self.operands[idx];
        op.is_high_byte = false;
        op.is_rip_relative = false;
        op.mem_scale = 1;
        op.disp_size = 0;
        op.imm_disp = 0;
        if register_first {
            op.reg = Some(0);
            op.is_mem = false;
            op.mem_base = None;
            op.mem_index = None;
            self.enc.set_modrm_mod_rm(3, 0);
        } else {
            op.reg = None;
            op.is_mem = true;
            if is_16 {
                op.mem_base = Some(gpr::RBX);
                op.mem_index = Some(gpr::RSI);
            } else {
                op.mem_base = Some(gpr::RAX);
                op.mem_index = None;
            }
            self.enc.set_modrm_mod_rm(0, 0);
        }
    }

    fn setup_next_rm_mod(&mut self) -> bool {
        if self.enc.addr_bytes == 2 {
            self.setup_next_rm_mod_16()
        } else {
            self.setup_next_rm_mod_32_64()
        }
    }

    fn enter_memory_form(&mut self, idx: usize, md: u8) {
        self.enc.set_modrm_mod_rm(md, 0);
        self.enc.rex_b = false;
        self.enc.rex_x = false;
        self.enc.reset_rm_byte_tracking();
        let op = &mut self.operands[idx];
        op.reg = None;
        op.is_mem = true;
        op.is_high_byte = false;
        op.imm_disp = 0;
    }

    fn setup_next_rm_mod_16(&mut self) -> bool {
        let Some(idx) = self.mrm_rm_op else {
            return false;
        };
        let mut rm = self.enc.modrm & 7;
        let md = self.enc.modrm_mod();

        let next_mod = if md == 3 {
            if rm < 7 {
                rm += 1;
                self.enc.set_modrm_rm(rm);
                let high = self.is_byte_gpr(idx) && rm >= 4;
                self.enc.high_byte_in_rm = high;
                self.enc.no_rex_for_rm = high;
                self.enc.no_rex = high || self.enc.no_rex_for_reg;
                let op = &mut self.operands[idx];
                op.reg = Some(rm);
                op.is_high_byte = high;
                return true;
            }
            if !self.instr.is_some_and(|instr| instr.has_memory_rm_form()) {
                self.setup_first_rm_mod();
                return false;
            }
            0
        } else {
            if rm < 7 {
                rm += 1;
                self.enc.set_modrm_rm(rm);
                self.set_memory_form_16(idx, rm, md);
                return true;
            }
            if md >= 2 {
                self.setup_first_rm_mod();
                return false;
            }
            md + 1
        };

        self.enter_memory_form(idx, next_mod);
        self.set_memory_form_16(idx, 0, next_mod);
        true
    }

    fn set_memory_form_16(&mut self, idx: usize, rm: u8, md: u8) {
        let (base, index) = match rm {
            0 => (Some(gpr::RBX), Some(gpr::RSI)),
            1 => (Some(gpr::RBX), Some(gpr::RDI)),
            2 => (Some(gpr::RBP), Some(gpr::RSI)),
            3 => (Some(gpr::RBP), Some(gpr::RDI)),
            4 => (None, Some(gpr::RSI)),
            5 => (None, Some(gpr::RDI)),
            6 if md == 0 => (None, None),
            6 => (Some(gpr::RBP), None),
            _ => (Some(gpr::RBX), None),
        };
        let op = &mut self.operands[idx];
        op.mem_base = base;
        op.mem_index = index;
        op.mem_scale = 1;
        op.is_rip_relative = false;
        op.disp_size = match md {
            0 if rm == 6 => 2,
            0 => 0,
            1 => 1,
            _ => 2,
        };
    }

    fn setup_next_rm_mod_32_64(&mut self) -> bool {
        let Some(idx) = self.mrm_rm_op else {
            return false;
        };
        let is_64 = self.mode.is_64bit();
        let mut rm = (self.enc.modrm & 7) | (u8::from(self.enc.rex_b) << 3);
        let md = self.enc.modrm_mod();

        let next_mod = if md == 3 {
            // REX.X is a don't-care for register-direct forms; visit the encoding with it set.
            if is_64 && !self.enc.rex_x && !self.enc.no_rex {
                self.enc.rex_x = true;
                return true;
            }

            self.enc.reset_rm_byte_tracking();
            self.operands[idx].is_high_byte = false;
            if rm < self.reg_mask() {
                // Byte registers 4..7: REX.X doubles as the "REX present" marker for spl..dil.
                if self.is_byte_gpr(idx)
                    && rm >= 3
                    && (rm <= 6 || (is_64 && rm == 7 && !self.enc.rex_x))
                {
                    if is_64 && !self.enc.rex_x && rm >= 4 && !self.enc.no_rex {
                        self.enc.rex_x = true;
                    } else {
                        rm += 1;
                        self.enc.set_modrm_rm(rm);
                        self.enc.rex_b = false;
                        self.enc.rex_x = false;
                        let rex_elsewhere = self.enc.rex_r || self.enc.rex_w || self.enc.rex;
                        let high = !rex_elsewhere;
                        if high {
                            self.enc.no_rex_for_rm = true;
                            self.enc.no_rex = true;
                            self.enc.high_byte_in_rm = true;
                        }
                        let op = &mut self.operands[idx];
                        op.reg = Some(rm);
                        op.is_high_byte = high;
                    }
                } else {
                    rm += 1;
                    self.enc.set_modrm_rm(rm);
                    self.enc.rex_b = rm >= 8;
                    self.enc.rex_x = false;
                    self.operands[idx].reg = Some(rm);
                }
                return true;
            }
            if !self.instr.is_some_and(|instr| instr.has_memory_rm_form()) {
                self.setup_first_rm_mod();
                return false;
            }
            0
        } else {
            if rm < self.reg_mask() {
                rm += 1;
                // r12 as a base needs a SIB byte; the SIB base wheel covers it.
                if rm == gpr::R12 {
                    rm += 1;
                }
                self.enc.set_modrm_rm(rm);
                self.enc.rex_b = rm >= 8;
                self.enc.rex_x = false;
                self.set_memory_form_32_64(idx, rm, md);
                return true;
            }
            if md >= 2 {
                self.setup_first_rm_mod();
                return false;
            }
            md + 1
        };

        self.enter_memory_form(idx, next_mod);
        self.set_memory_form_32_64(idx, 0, next_mod);
        true
    }

    fn set_memory_form_32_64(&mut self, idx: usize, rm: u8, md: u8) {
        let is_64 = self.mode.is_64bit();
        let op = &mut self.operands[idx];
        op.mem_scale = 1;
        op.is_rip_relative = false;
        op.mem_index = None;
        op.disp_size = match md {
            0 => 0,
            1 => 1,
            _ => 4,
        };
        self.enc.sib = 0;
        if rm == gpr::RSP {
            self.enc.has_sib = true;
            op.mem_base = Some(gpr::RAX);
            op.mem_index = Some(gpr::RAX);
        } else {
            self.enc.has_sib = false;
            if rm & 7 == 5 && md == 0 {
                op.mem_base = None;
                op.disp_size = 4;
                op.is_rip_relative = is_64;
            } else {
                op.mem_base = Some(rm);
            }
        }
    }

    fn setup_next_sib(&mut self) -> bool {
        if !self.enc.has_sib {
            return false;
        }
        if self.setup_next_sib_scale() || self.setup_next_sib_index() || self.setup_next_sib_base()
        {
            return true;
        }
        self.enc.has_sib = false;
        false
    }

    fn setup_next_sib_scale(&mut self) -> bool {
        let Some(idx) = self.mrm_rm_op else {
            return false;
        };
        let bits = ((self.enc.sib >> 6) + 1) & 3;
        self.enc.sib = (self.enc.sib & 0x3f) | (bits << 6);
        self.operands[idx].mem_scale = 1 << bits;
        bits != 0
    }

    fn setup_next_sib_index(&mut self) -> bool {
        let Some(idx) = self.mrm_rm_op else {
            return false;
        };
        let mut index = ((self.enc.sib >> 3) & 7) | (u8::from(self.enc.rex_x) << 3);
        index = (index + 1) & self.reg_mask();
        self.enc.sib = (self.enc.sib & !0x38) | ((index & 7) << 3);
        self.enc.rex_x = index >= 8;
        // Index 4 without REX.X means "no index"; r12 is a real index.
        self.operands[idx].mem_index = (index != gpr::RSP).then_some(index);
        index != 0
    }

    fn setup_next_sib_base(&mut self) -> bool {
        let Some(idx) = self.mrm_rm_op else {
            return false;
        };
        let md = self.enc.modrm_mod();
        let mut base = (self.enc.sib & 7) | (u8::from(self.enc.rex_b) << 3);
        base = (base + 1) & self.reg_mask();
        self.enc.sib = (self.enc.sib & !0x07) | (base & 7);
        self.enc.rex_b = base >= 8;
        let op = &mut self.operands[idx];
        if base & 7 == 5 && md == 0 {
            op.mem_base = None;
            op.disp_size = 4;
        } else {
            if base & 7 == 6 && md == 0 {
                op.disp_size = 0;
            }
            op.mem_base = Some(base);
        }
        base != 0
    }

    fn setup_next_segment_prefix(&mut self) -> bool {
        if !self.has_memory_operand() || self.seg_prefixes.is_empty() {
            return false;
        }
        let start = self.enc.seg_prefix.map_or(0, |seg| seg.index() + 1);
        let next = SegReg::ALL
            .into_iter()
            .skip(start)
            .find(|seg| self.seg_prefixes.contains(SegPrefixes::for_seg(*seg)));
        self.enc.seg_prefix = next;
        next.is_some()
    }

    fn setup_next_operand_size(&mut self) -> bool {
        let responds = self
            .instr
            .is_some_and(|instr| instr.responds_to_operand_size());
        if !responds {
            return false;
        }

        let advanced = if self.mode.is_64bit() {
            match (self.enc.op_size_prefix, self.enc.rex_w) {
                (false, false) => {
                    self.enc.op_size_prefix = true;
                    true
                }
                (true, false) if !self.enc.no_rex => {
                    self.enc.op_size_prefix = false;
                    self.enc.rex_w = true;
                    true
                }
                (false, true) => {
                    self.enc.op_size_prefix = true;
                    true
                }
                _ => false,
            }
        } else if !self.enc.op_size_prefix {
            self.enc.op_size_prefix = true;
            true
        } else {
            false
        };

        if !advanced {
            self.enc.op_size_prefix = false;
            self.enc.rex_w = false;
        }
        self.update_operand_sizes();
        advanced
    }

    fn setup_next_address_size(&mut self) -> bool {
        if !self.alt_address_size {
            return false;
        }
        self.enc.addr_size_prefix = !self.enc.addr_size_prefix;
        self.enc.addr_bytes = if self.enc.addr_size_prefix {
            self.mode.alternate_address_bytes()
        } else {
            self.mode.default_address_bytes()
        };
        // The RM wheel's forms depend on the address size.
        self.setup_first_rm_mod();
        self.enc.addr_size_prefix
    }

    fn has_memory_operand(&self) -> bool {
        self.mrm_rm_op
            .is_some_and(|idx| self.operands[idx].is_mem)
    }

    pub(crate) fn refresh_indicators(&mut self) {
        let reg = self.mrm_reg_op.map(|idx| &self.operands[idx]);
        let rm = self.mrm_rm_op.map(|idx| &self.operands[idx]);

        let mut ind = Indicators {
            has_memory_operand: rm.is_some_and(|op| op.is_mem),
            high_byte_reg_in_use: self.enc.high_byte_in_reg || self.enc.high_byte_in_rm,
            rex_forbidden: self.enc.no_rex,
            ..Indicators::default()
        };

        if let Some(reg) = reg {
            ind.stack_reg_in_mrm_reg =
                reg.is_gpr() && !reg.is_high_byte && reg.phys_reg() == Some(gpr::RSP);
            if let Some(rm) = rm {
                if rm.is_mem {
                    if let Some(phys) = reg.is_gpr().then(|| reg.phys_reg()).flatten() {
                        ind.reg_collision_mem_base = rm.mem_base == Some(phys);
                        ind.reg_collision_mem_index = rm.mem_index == Some(phys);
                    }
                } else if reg.spec.kind == rm.spec.kind {
                    ind.reg_collision_direct = match (reg.phys_reg(), rm.phys_reg()) {
                        (Some(a), Some(b)) if a == b => {
                            reg.spec.kind != OperandKind::Gpr
                                || lanes_overlap(reg.reg_lanes(), rm.reg_lanes())
                        }
                        _ => false,
                    };
                }
            }
        }
        if let Some(rm) = rm {
            ind.stack_reg_in_mrm_rm_base = if rm.is_mem {
                rm.mem_base == Some(gpr::RSP)
            } else {
                rm.is_gpr() && !rm.is_high_byte && rm.reg == Some(gpr::RSP)
            };
        }
        ind.reg_collision_mem = ind.reg_collision_mem_base || ind.reg_collision_mem_index;
        self.indicators = ind;
    }
}
