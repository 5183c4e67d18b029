//! Code buffer placement, execution and result comparison.

use tracing::{debug, enabled, trace, warn, Level};

use crate::buffer::CODE_BUF_SIZE;
use crate::ctx::{SegReg, FLAGS_ARITH, NO_XCPT};
use crate::disasm::{disassemble, format_flags, hex_bytes};
use crate::driver::PlatformDriver;
use crate::engine::{CaseState, CidetCore};

impl<D: PlatformDriver> CidetCore<D> {
    /// Sizes and places the code buffer for the current encoding and points RIP at it.
    pub fn reinit_code_buf(&mut self) -> bool {
        let st = &mut self.state;
        let len = match st.assemble_length() {
            Ok(len) => len,
            Err(err) => {
                trace!(%err, "encoding cannot be assembled");
                st.skips.assemble += 1;
                return false;
            }
        };
        st.instr_len = len;

        let buf = &mut st.code_buf;
        buf.cb = u32::from(len);
        buf.off = buf.config.offset_for(CODE_BUF_SIZE, buf.cb);
        buf.off_active = buf.off;
        buf.active = false;
        if !self.driver.reinit_code_buf(buf) {
            st.skips.re_init_code_buf += 1;
            return false;
        }
        buf.active = true;

        let rip = buf
            .eff_buf_addr
            .wrapping_add(u64::from(buf.off_active))
            .wrapping_sub(buf.seg_base);
        let selector = buf.selector;
        st.input.rip = rip;
        st.expected.rip = rip.wrapping_add(u64::from(len));
        if let Some(selector) = selector {
            st.input.set_sreg(SegReg::Cs, selector);
            st.expected.set_sreg(SegReg::Cs, selector);
        }
        st.case_state = CaseState::BufferReady;
        true
    }

    /// Assembles the instruction and hands the bytes to the driver.
    pub fn setup_code_buf(&mut self) -> bool {
        let st = &mut self.state;
        let len = match st.assemble() {
            Ok(len) => len,
            Err(err) => {
                trace!(%err, "encoding cannot be assembled");
                st.skips.assemble += 1;
                return false;
            }
        };
        if len != st.code_buf.cb as u8 {
            st.skips.assemble += 1;
            return false;
        }
        if enabled!(Level::DEBUG) {
            let bytes = st.instr_bytes();
            debug!(
                instruction = st.instr.map_or("", |instr| instr.mnemonic),
                bytes = %hex_bytes(bytes),
                disasm = %disassemble(bytes, st.mode.bitness(), st.input.rip).unwrap_or_default(),
                "staged encoding"
            );
        }
        if !self.driver.setup_code_buf(&st.code_buf, st.instr_bytes()) {
            st.skips.setup_code_buf += 1;
            return false;
        }
        true
    }

    /// Runs the staged test case. `false` means the driver declined it.
    pub fn execute(&mut self) -> bool {
        let st = &mut self.state;
        st.actual = st.input;
        let ran = self.driver.execute(&st.input, &mut st.actual);
        if ran {
            st.case_state = CaseState::Executed;
        }
        ran
    }

    /// Compares the actual outcome with the expectation and reports every mismatch.
    pub fn check_results(&mut self) -> bool {
        let st = &mut self.state;
        let mut problems: Vec<String> = st
            .expected
            .diff(&st.actual)
            .iter()
            .map(ToString::to_string)
            .collect();

        for buf in &st.data_bufs {
            let Some(op_idx) = buf.operand else {
                continue;
            };
            let op = &st.operands[op_idx];
            let expected = &op.mem_expected[..usize::from(op.size)];
            if !self.driver.is_buf_equal(buf, expected) {
                problems.push(format!(
                    "memory operand {op_idx} at {:#x}: expected [{}]",
                    op.eff_addr,
                    hex_bytes(expected)
                ));
            }
        }
        st.case_state = CaseState::Verified;
        if problems.is_empty() {
            return true;
        }

        let header = self.describe_case();
        warn!(case = %header, mismatches = problems.len(), "result mismatch");
        for problem in &problems {
            self.driver.failure(&format!("{header}: {problem}"));
        }
        false
    }

    /// One-line description of the case in flight, for failure messages.
    pub fn describe_case(&self) -> String {
        let st = &self.state;
        let bytes = st.instr_bytes();
        let name = st.instr.map(|instr| instr.name()).unwrap_or_default();
        let mut out = format!("{name} [{}]", hex_bytes(bytes));
        if let Some(text) = disassemble(bytes, st.mode.bitness(), st.input.rip) {
            out.push_str(&format!(" `{text}`"));
        }
        out.push_str(&format!(" rip={:#x}", st.input.rip));
        if st.expected.xcpt != NO_XCPT {
            out.push_str(&format!(" expecting #{}", st.expected.xcpt));
        }
        let mask = FLAGS_ARITH & !st.expected.ignored_rflags;
        out.push_str(&format!(" in[{}]", format_flags(st.input.rflags, mask)));
        out
    }
}
