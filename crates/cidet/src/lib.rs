//! Differential testing of x86 instruction encodings.
//!
//! For each instruction descriptor the engine enumerates every byte-level encoding (operand and
//! address size prefixes, segment overrides, REX bits, every ModR/M and SIB form). For each
//! encoding it derives register and memory inputs, predicts the outcome, and has a
//! [`PlatformDriver`] run the instruction. The driver's result is then compared against the
//! prediction field by field.
//!
//! ## Environment variables
//!
//! [`CidetConfig::from_env`] recognises:
//!
//! - `CIDET_MODE` (default: `lm64` on x86_64 hosts, else `pp32`): one of `pe16`, `pp32`,
//!   `pae32`, `lm64`.
//! - `CIDET_SEED` (default: [`config::DEFAULT_SEED`]): RNG seed, decimal or `0x` hex.
//! - `CIDET_SEG_PREFIXES` (default: `none`): segment overrides to enumerate, e.g. `fs,gs` or
//!   `all`.
//! - `CIDET_FILTER` (optional): only test instructions whose name contains one of these
//!   comma or space separated substrings (case-insensitive).
//! - `CIDET_REPORT_PATH` (optional): write a JSON [`RunReport`] to this path.

pub mod addressing;
pub mod assemble;
pub mod buffer;
pub mod config;
pub mod ctx;
pub mod descriptor;
pub mod disasm;
pub mod driver;
pub mod encoding;
pub mod engine;
pub mod error;
pub mod exec;
pub mod instr;
pub mod mode;
pub mod operand;
pub mod report;
pub mod setup;

pub use buffer::{BufferConfig, BufferDescriptor, ExpectXcpt, PageAccess};
pub use config::CidetConfig;
pub use ctx::{CpuContext, CtxField, FieldDiff, SegReg};
pub use descriptor::{InstructionDescriptor, SetupError, SetupOutcome};
pub use driver::PlatformDriver;
pub use encoding::{EncodingState, Indicators, SegPrefixes};
pub use engine::{CidetCore, EngineState, SkipCounters};
pub use error::{AssembleError, CidetError, Result};
pub use mode::TargetMode;
pub use operand::{InOut, OperandBinding, OperandLocation};
pub use report::{InstrSummary, RunReport};

/// Tests every known instruction selected by `config` and returns the run report.
///
/// The report is also written to `config.report_path` when set.
pub fn run_suite<D: PlatformDriver>(driver: D, config: &CidetConfig) -> Result<RunReport> {
    let mut core = CidetCore::from_config(driver, config);
    let mut report = RunReport::new(config.mode, config.seed);
    for instr in instr::all().filter(|instr| config.selects(&instr.name())) {
        report.push(core.test_instruction(instr)?);
    }
    if let Some(path) = &config.report_path {
        report.write_json(path)?;
    }
    report.log_summary();
    Ok(report)
}
