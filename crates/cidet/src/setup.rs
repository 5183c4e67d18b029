//! Buffer configuration iteration and per-case operand binding.

use tracing::trace;

use crate::addressing::{solve, AddressShape, AddressSkip};
use crate::buffer::{BufferDescriptor, ExpectXcpt, PageAccess, DATA_BUF_SIZE};
use crate::ctx::{gpr, SegReg, PF_ERR_P, PF_ERR_US, PF_ERR_W, XCPT_PF};
use crate::descriptor::{Access, OperandKind};
use crate::driver::PlatformDriver;
use crate::engine::{CidetCore, EngineState, MAX_MEMORY_OPERANDS};
use crate::error::{CidetError, Result};
use crate::operand::{size_mask, InOut, OperandBinding, OperandLocation};

/// #PF the data access would raise on a page with `access` rights, if any.
///
/// A page with any right is present and therefore readable. Read-modify-write operands are
/// checked for write access up front and fault as writes.
pub fn data_access_fault(access: PageAccess, op: Access, cpl: u8) -> ExpectXcpt {
    let present = !access.is_empty();
    let read_denied = op.reads() && !present;
    let write_denied = op.writes() && !access.contains(PageAccess::WRITE);
    if !read_denied && !write_denied {
        return ExpectXcpt::None;
    }
    let mut error_code = 0;
    if present {
        error_code |= PF_ERR_P;
    }
    if op.writes() {
        error_code |= PF_ERR_W;
    }
    if cpl == 3 {
        error_code |= PF_ERR_US;
    }
    ExpectXcpt::PageFault { error_code }
}

/// Segment a memory operand uses without an override prefix.
fn default_segment(op: &OperandBinding) -> SegReg {
    if op.spec.always_es {
        SegReg::Es
    } else if matches!(op.mem_base, Some(gpr::RSP | gpr::RBP)) {
        SegReg::Ss
    } else {
        SegReg::Ds
    }
}

impl EngineState {
    fn new_data_buf(&self, config_index: usize, operand: usize) -> BufferDescriptor {
        let config = self.data_buf_configs[config_index];
        let mut buf = BufferDescriptor::new(config_index, config);
        buf.cb = u32::from(self.operands[operand].size);
        buf.off = config.offset_for(DATA_BUF_SIZE, buf.cb);
        buf.operand = Some(operand);
        buf
    }

    /// Merges an address register value into a context, keeping the bits above the address
    /// width from the template.
    fn write_address_reg(&mut self, reg: u8, value: u64) {
        let mask = size_mask(self.enc.addr_bytes);
        for ctx in [&mut self.input, &mut self.expected] {
            let slot = &mut ctx.gprs[usize::from(reg)];
            *slot = (*slot & !mask) | (value & mask);
        }
    }

    fn bind_register_operand(&mut self, idx: usize) -> Result<bool> {
        let mnemonic = self.instr.map_or("", |instr| instr.mnemonic);
        let op = &mut self.operands[idx];
        match op.spec.kind {
            OperandKind::Gpr => {
                let Some(reg) = op.phys_reg() else {
                    return Err(CidetError::UnsupportedOperandKind {
                        mnemonic,
                        index: idx,
                        kind: op.spec.kind,
                    });
                };
                op.location = OperandLocation::Gpr {
                    index: reg,
                    high_byte: op.is_high_byte,
                };
            }
            OperandKind::SegReg => match op.reg.and_then(SegReg::from_index) {
                Some(seg) => op.location = OperandLocation::SegReg(seg),
                // REG values 6 and 7 name no segment register.
                None => {
                    self.skips.setup_in_out += 1;
                    return Ok(false);
                }
            },
            OperandKind::Immediate => op.location = OperandLocation::Immediate,
            kind => {
                return Err(CidetError::UnsupportedOperandKind {
                    mnemonic,
                    index: idx,
                    kind,
                })
            }
        }
        Ok(true)
    }

    /// Turns the pending #PF expectation of a data buffer into the expected context.
    fn apply_expected_exceptions(&mut self) {
        let fault = self.data_bufs.iter().find_map(|buf| match buf.expect_xcpt {
            ExpectXcpt::PageFault { error_code } => buf.operand.map(|op| (op, error_code)),
            ExpectXcpt::None => None,
        });
        let Some((op_idx, error_code)) = fault else {
            return;
        };

        let addr = self.operands[op_idx].eff_addr;
        self.expected = self.input;
        self.expected.xcpt = XCPT_PF;
        self.expected.err = error_code;
        self.expected.cr2 = addr;
        for op in &mut self.operands {
            op.mem_expected = op.mem_input;
        }
    }

    fn callback_view(&mut self) -> InOut<'_> {
        InOut {
            mode: self.mode,
            operands: &mut self.operands,
            input: &mut self.input,
            expected: &mut self.expected,
            indicators: self.indicators,
            cursors: &mut self.cursors,
            rng: &mut self.rng,
        }
    }
}

impl<D: PlatformDriver> CidetCore<D> {
    /// Attaches a data buffer using the first data configuration to every memory operand.
    ///
    /// Returns `false` if the encoding has a memory operand but no data configuration exists.
    pub fn setup_first_memory_operand_config(&mut self) -> Result<bool> {
        let st = &mut self.state;
        st.data_bufs.clear();
        for idx in 0..st.operands.len() {
            if !st.operands[idx].is_mem {
                st.operands[idx].data_buf = None;
                continue;
            }
            if st.data_buf_configs.is_empty() {
                return Ok(false);
            }
            if st.data_bufs.len() >= MAX_MEMORY_OPERANDS {
                return Err(CidetError::TooManyMemoryOperands {
                    mnemonic: st.instr.map_or("", |instr| instr.mnemonic),
                    count: st.operands.iter().filter(|op| op.is_mem).count(),
                    max: MAX_MEMORY_OPERANDS,
                });
            }
            let buf = st.new_data_buf(0, idx);
            st.operands[idx].data_buf = Some(st.data_bufs.len());
            st.data_bufs.push(buf);
        }
        Ok(true)
    }

    /// Moves every data buffer on to the next data configuration.
    pub fn setup_next_memory_operand_config(&mut self) -> bool {
        let st = &mut self.state;
        let Some(first) = st.data_bufs.first() else {
            return false;
        };
        let next = first.config_index + 1;
        if next >= st.data_buf_configs.len() {
            return false;
        }
        for i in 0..st.data_bufs.len() {
            if let Some(op) = st.data_bufs[i].operand {
                st.data_bufs[i] = st.new_data_buf(next, op);
            }
        }
        true
    }

    pub fn setup_first_code_buffer_config(&mut self) {
        let st = &mut self.state;
        if let Some(config) = st.code_buf_configs.first() {
            st.code_buf = BufferDescriptor::new(0, *config);
        }
    }

    pub fn setup_next_code_buffer_config(&mut self) -> bool {
        let st = &mut self.state;
        let next = st.code_buf.config_index + 1;
        match st.code_buf_configs.get(next) {
            Some(config) => {
                st.code_buf = BufferDescriptor::new(next, *config);
                true
            }
            None => false,
        }
    }

    /// Binds every operand for the current test case and asks the instruction for input and
    /// expected values.
    ///
    /// Memory operands get a data buffer from the driver and base/index/displacement values that
    /// make the effective address land on it. Returns `Ok(false)` when the case has to be
    /// skipped.
    pub fn setup_in_out(&mut self) -> Result<bool> {
        let Some(instr) = self.state.instr else {
            return Err(CidetError::NoInstruction);
        };
        let next_ip = self
            .state
            .input
            .rip
            .wrapping_add(u64::from(self.state.instr_len));

        for idx in 0..self.state.operands.len() {
            self.state.operands[idx].reset_values();
            let bound = if self.state.operands[idx].is_mem {
                self.bind_memory_operand(idx, next_ip)
            } else {
                self.state.bind_register_operand(idx)?
            };
            if !bound {
                return Ok(false);
            }
        }

        let outcome = (instr.setup)(&mut self.state.callback_view(), false);
        match outcome {
            Ok(outcome) => trace!(?outcome, "operand values ready"),
            Err(err) => {
                trace!(%err, "setup declined the encoding");
                self.state.skips.setup_in_out += 1;
                return Ok(false);
            }
        }

        let st = &mut self.state;
        for op in st.operands.iter_mut() {
            if op.is_mem && !op.spec.access.writes() {
                op.mem_expected = op.mem_input;
            }
        }
        st.apply_expected_exceptions();

        for buf in &st.data_bufs {
            let Some(op_idx) = buf.operand else {
                continue;
            };
            let op = &st.operands[op_idx];
            let bytes = &op.mem_input[..usize::from(op.size)];
            if !self.driver.setup_data_buf(buf, bytes) {
                st.skips.setup_data_buf += 1;
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn bind_memory_operand(&mut self, idx: usize, next_ip: u64) -> bool {
        let st = &mut self.state;
        let Some(buf_idx) = st.operands[idx].data_buf else {
            st.skips.re_init_data_buf += 1;
            return false;
        };

        let eff_seg = st
            .enc
            .seg_prefix
            .unwrap_or_else(|| default_segment(&st.operands[idx]));
        let buf = &mut st.data_bufs[buf_idx];
        buf.eff_seg = Some(eff_seg);
        buf.active = false;
        if !self.driver.reinit_data_buf(buf) {
            st.skips.re_init_data_buf += 1;
            return false;
        }
        buf.active = true;

        let eff_addr = buf.active_addr();
        let seg_offset = eff_addr.wrapping_sub(buf.seg_base);
        let addr_mask = size_mask(st.enc.addr_bytes);
        if seg_offset > addr_mask {
            trace!(seg_offset, "data buffer not reachable with this address size");
            st.skips.re_init_data_buf += 1;
            return false;
        }
        buf.expect_xcpt = data_access_fault(
            buf.config.access,
            st.operands[idx].spec.access,
            st.input.cpl(),
        );

        let op = &st.operands[idx];
        let shape = AddressShape {
            base: op.mem_base,
            index: op.mem_index,
            scale: op.mem_scale,
            disp_size: op.disp_size,
            rip_relative: op.is_rip_relative,
            addr_bytes: st.enc.addr_bytes,
        };
        let solution = match solve(&shape, seg_offset, next_ip, &mut st.rng) {
            Ok(solution) => solution,
            Err(skip) => {
                trace!(%skip, seg_offset, "no register values reach the data buffer");
                match skip {
                    AddressSkip::RipRelativeOutOfRange => st.skips.data_buf_wrt_rip += 1,
                    AddressSkip::SameBaseIndexRemainder => st.skips.same_base_index_remainder += 1,
                    AddressSkip::OnlyIndexRemainder => st.skips.only_index_remainder += 1,
                    AddressSkip::DirectAddressingOverflow => {
                        st.skips.direct_addressing_overflow += 1
                    }
                }
                return false;
            }
        };
        debug_assert_eq!(solution.effective_offset(&shape, next_ip), seg_offset);

        if let Some(base) = shape.base {
            st.write_address_reg(base, solution.base_value);
        }
        if let Some(index) = shape.index {
            st.write_address_reg(index, solution.index_value);
        }

        let op = &mut st.operands[idx];
        op.imm_disp = solution.disp as u64;
        op.base_value = solution.base_value;
        op.index_value = solution.index_value;
        op.eff_seg = Some(eff_seg);
        op.eff_addr = eff_addr;
        op.seg_offset = seg_offset;
        op.location = OperandLocation::Memory;
        true
    }
}
