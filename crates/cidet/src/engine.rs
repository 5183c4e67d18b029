//! The engine state and the per-instruction test loop.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::buffer::{BufferConfig, BufferDescriptor};
use crate::config::CidetConfig;
use crate::ctx::CpuContext;
use crate::descriptor::InstructionDescriptor;
use crate::driver::PlatformDriver;
use crate::encoding::{EncodingState, Indicators, SegPrefixes};
use crate::error::{CidetError, Result};
use crate::mode::TargetMode;
use crate::operand::{OperandBinding, IN_OUT_CURSORS};
use crate::report::InstrSummary;

/// Longest architecturally valid instruction.
pub const MAX_INSTR_LEN: usize = 15;

/// Memory operands a single test case may have.
pub const MAX_MEMORY_OPERANDS: usize = 1;

/// Progress of one test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaseState {
    #[default]
    Idle,
    BufferReady,
    Executed,
    Verified,
}

/// Why test cases were not executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipCounters {
    pub setup_in_out: u64,
    pub re_init_data_buf: u64,
    pub setup_data_buf: u64,
    pub data_buf_wrt_rip: u64,
    pub assemble: u64,
    pub re_init_code_buf: u64,
    pub setup_code_buf: u64,
    pub same_base_index_remainder: u64,
    pub only_index_remainder: u64,
    pub direct_addressing_overflow: u64,
    pub no_data_buf_config: u64,
    pub execute_declined: u64,
}

impl SkipCounters {
    pub fn total(&self) -> u64 {
        self.setup_in_out
            + self.re_init_data_buf
            + self.setup_data_buf
            + self.data_buf_wrt_rip
            + self.assemble
            + self.re_init_code_buf
            + self.setup_code_buf
            + self.same_base_index_remainder
            + self.only_index_remainder
            + self.direct_addressing_overflow
            + self.no_data_buf_config
            + self.execute_declined
    }

    pub fn add(&mut self, other: &SkipCounters) {
        self.setup_in_out += other.setup_in_out;
        self.re_init_data_buf += other.re_init_data_buf;
        self.setup_data_buf += other.setup_data_buf;
        self.data_buf_wrt_rip += other.data_buf_wrt_rip;
        self.assemble += other.assemble;
        self.re_init_code_buf += other.re_init_code_buf;
        self.setup_code_buf += other.setup_code_buf;
        self.same_base_index_remainder += other.same_base_index_remainder;
        self.only_index_remainder += other.only_index_remainder;
        self.direct_addressing_overflow += other.direct_addressing_overflow;
        self.no_data_buf_config += other.no_data_buf_config;
        self.execute_declined += other.execute_declined;
    }

    fn sub(&mut self, other: &SkipCounters) {
        self.setup_in_out -= other.setup_in_out;
        self.re_init_data_buf -= other.re_init_data_buf;
        self.setup_data_buf -= other.setup_data_buf;
        self.data_buf_wrt_rip -= other.data_buf_wrt_rip;
        self.assemble -= other.assemble;
        self.re_init_code_buf -= other.re_init_code_buf;
        self.setup_code_buf -= other.setup_code_buf;
        self.same_base_index_remainder -= other.same_base_index_remainder;
        self.only_index_remainder -= other.only_index_remainder;
        self.direct_addressing_overflow -= other.direct_addressing_overflow;
        self.no_data_buf_config -= other.no_data_buf_config;
        self.execute_declined -= other.execute_declined;
    }
}

/// Everything the engine knows about the instruction and test case in flight.
pub struct EngineState {
    pub(crate) mode: TargetMode,
    pub(crate) seg_prefixes: SegPrefixes,
    pub(crate) alt_address_size: bool,
    pub(crate) instr: Option<&'static InstructionDescriptor>,
    pub(crate) mrm_reg_op: Option<usize>,
    pub(crate) mrm_rm_op: Option<usize>,
    pub(crate) operands: Vec<OperandBinding>,
    pub(crate) enc: EncodingState,
    pub(crate) indicators: Indicators,
    pub(crate) code_buf: BufferDescriptor,
    pub(crate) data_bufs: Vec<BufferDescriptor>,
    pub(crate) code_buf_configs: Vec<BufferConfig>,
    pub(crate) data_buf_configs: Vec<BufferConfig>,
    pub(crate) template: CpuContext,
    pub(crate) input: CpuContext,
    pub(crate) expected: CpuContext,
    pub(crate) actual: CpuContext,
    pub(crate) instr_bytes: [u8; MAX_INSTR_LEN + 1],
    pub(crate) instr_len: u8,
    pub(crate) skips: SkipCounters,
    pub(crate) cursors: [usize; IN_OUT_CURSORS],
    pub(crate) rng: StdRng,
    pub(crate) case_state: CaseState,
}

impl EngineState {
    pub fn new(mode: TargetMode, seed: u64) -> Self {
        let template = CpuContext::template(mode);
        Self {
            mode,
            seg_prefixes: SegPrefixes::empty(),
            alt_address_size: true,
            instr: None,
            mrm_reg_op: None,
            mrm_rm_op: None,
            operands: Vec::new(),
            enc: EncodingState {
                addr_bytes: mode.default_address_bytes(),
                ..EncodingState::default()
            },
            indicators: Indicators::default(),
            code_buf: BufferDescriptor::new(0, BufferConfig::CODE_PAGE_END),
            data_bufs: Vec::new(),
            code_buf_configs: vec![BufferConfig::CODE_PAGE_END],
            data_buf_configs: vec![BufferConfig::DATA_RW],
            template,
            input: template,
            expected: template,
            actual: template,
            instr_bytes: [0; MAX_INSTR_LEN + 1],
            instr_len: 0,
            skips: SkipCounters::default(),
            cursors: [0; IN_OUT_CURSORS],
            rng: StdRng::seed_from_u64(seed),
            case_state: CaseState::Idle,
        }
    }

    pub fn mode(&self) -> TargetMode {
        self.mode
    }

    /// Switches mode and rebuilds the template context for it.
    pub fn set_target_mode(&mut self, mode: TargetMode) {
        self.mode = mode;
        self.template = CpuContext::template(mode);
        self.enc.addr_bytes = mode.default_address_bytes();
    }

    pub fn set_seg_prefixes(&mut self, prefixes: SegPrefixes) {
        self.seg_prefixes = prefixes;
    }

    /// Whether the address-size wheel visits the 0x67 encodings.
    pub fn set_alternate_address_size(&mut self, enabled: bool) {
        self.alt_address_size = enabled;
    }

    pub fn template_ctx(&self) -> &CpuContext {
        &self.template
    }

    /// Lets the front end set segment selectors and the like.
    pub fn template_ctx_mut(&mut self) -> &mut CpuContext {
        &mut self.template
    }

    pub fn set_code_buf_configs(&mut self, configs: Vec<BufferConfig>) {
        self.code_buf_configs = configs;
    }

    pub fn set_data_buf_configs(&mut self, configs: Vec<BufferConfig>) {
        self.data_buf_configs = configs;
    }

    /// Selects the instruction to enumerate and resets all per-instruction state.
    pub fn set_instruction(&mut self, instr: &'static InstructionDescriptor) -> Result<()> {
        instr.validate()?;
        self.instr = Some(instr);
        self.operands = instr.operands.iter().copied().map(OperandBinding::new).collect();
        self.mrm_reg_op = instr.mrm_reg_operand();
        self.mrm_rm_op = instr.mrm_rm_operand();
        self.enc = EncodingState {
            addr_bytes: self.mode.default_address_bytes(),
            ..EncodingState::default()
        };
        self.indicators = Indicators::default();
        self.data_bufs.clear();
        self.cursors = [0; IN_OUT_CURSORS];
        self.instr_len = 0;
        self.case_state = CaseState::Idle;
        self.update_operand_sizes();
        Ok(())
    }

    pub fn instruction(&self) -> Option<&'static InstructionDescriptor> {
        self.instr
    }

    pub fn operands(&self) -> &[OperandBinding] {
        &self.operands
    }

    pub fn mrm_reg_operand(&self) -> Option<usize> {
        self.mrm_reg_op
    }

    pub fn mrm_rm_operand(&self) -> Option<usize> {
        self.mrm_rm_op
    }

    pub fn input_ctx(&self) -> &CpuContext {
        &self.input
    }

    pub fn expected_ctx(&self) -> &CpuContext {
        &self.expected
    }

    pub fn actual_ctx(&self) -> &CpuContext {
        &self.actual
    }

    pub fn code_buf(&self) -> &BufferDescriptor {
        &self.code_buf
    }

    pub fn data_bufs(&self) -> &[BufferDescriptor] {
        &self.data_bufs
    }

    pub fn skips(&self) -> &SkipCounters {
        &self.skips
    }

    pub fn case_state(&self) -> CaseState {
        self.case_state
    }
}

/// The engine bound to a platform driver.
pub struct CidetCore<D> {
    pub(crate) state: EngineState,
    pub(crate) driver: D,
}

impl<D: PlatformDriver> CidetCore<D> {
    /// Creates the engine, taking buffer configurations from the driver.
    pub fn new(driver: D, mode: TargetMode, seed: u64) -> Self {
        let mut state = EngineState::new(mode, seed);
        state.set_code_buf_configs(driver.code_buf_configs());
        state.set_data_buf_configs(driver.data_buf_configs());
        Self { state, driver }
    }

    pub fn from_config(driver: D, config: &CidetConfig) -> Self {
        let mut core = Self::new(driver, config.mode, config.seed);
        core.state.set_seg_prefixes(config.seg_prefixes);
        core.state.set_alternate_address_size(config.alternate_address_size);
        core
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut EngineState {
        &mut self.state
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn into_driver(self) -> D {
        self.driver
    }

    /// Runs every encoding of `instr` against every buffer configuration.
    ///
    /// Skips and failures are tallied in the returned summary; only fatal errors are returned as
    /// `Err`.
    pub fn test_instruction(
        &mut self,
        instr: &'static InstructionDescriptor,
    ) -> Result<InstrSummary> {
        if self.state.code_buf_configs.is_empty() {
            return Err(CidetError::NoCodeBufferConfigs);
        }
        self.state.set_instruction(instr)?;
        self.state.setup_first_encoding()?;

        let name = instr.name();
        debug!(instruction = %name, mode = %self.state.mode, "testing instruction");
        let skips_before = self.state.skips;
        let mut summary = InstrSummary::new(&name, self.state.mode);

        loop {
            summary.encodings += 1;
            if self.setup_first_memory_operand_config()? {
                loop {
                    self.setup_first_code_buffer_config();
                    loop {
                        self.run_case(&mut summary)?;
                        if !self.setup_next_code_buffer_config() {
                            break;
                        }
                    }
                    if !self.setup_next_memory_operand_config() {
                        break;
                    }
                }
            } else {
                self.state.skips.no_data_buf_config += 1;
                summary.skipped += 1;
            }
            if !self.state.setup_next_encoding() {
                break;
            }
        }

        let mut skips = self.state.skips;
        skips.sub(&skips_before);
        summary.skips = skips;
        info!(
            instruction = %name,
            mode = %self.state.mode,
            encodings = summary.encodings,
            executed = summary.executed,
            skipped = summary.skipped,
            failures = summary.failures,
            "instruction done"
        );
        Ok(summary)
    }

    fn run_case(&mut self, summary: &mut InstrSummary) -> Result<()> {
        let tricky = self.state.indicators.tricky_stack();
        self.state.input = self.state.template;
        self.state.input.tricky_stack = tricky;
        self.state.expected = self.state.input;
        self.state.case_state = CaseState::Idle;

        if self.reinit_code_buf() && self.setup_in_out()? && self.setup_code_buf() {
            if self.execute() {
                summary.executed += 1;
                if !self.check_results() {
                    summary.failures += 1;
                }
            } else {
                self.state.skips.execute_declined += 1;
                summary.skipped += 1;
            }
        } else {
            summary.skipped += 1;
        }
        Ok(())
    }
}
