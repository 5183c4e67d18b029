//! CPU register state snapshots and field-by-field comparison.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::mode::TargetMode;

pub const FLAG_CF: u64 = 1 << 0;
pub const FLAG_FIXED_1: u64 = 1 << 1;
pub const FLAG_PF: u64 = 1 << 2;
pub const FLAG_AF: u64 = 1 << 4;
pub const FLAG_ZF: u64 = 1 << 6;
pub const FLAG_SF: u64 = 1 << 7;
pub const FLAG_IF: u64 = 1 << 9;
pub const FLAG_DF: u64 = 1 << 10;
pub const FLAG_OF: u64 = 1 << 11;
pub const FLAG_ID: u64 = 1 << 21;

/// Status flags written by arithmetic instructions.
pub const FLAGS_ARITH: u64 = FLAG_CF | FLAG_PF | FLAG_AF | FLAG_ZF | FLAG_SF | FLAG_OF;

/// "No exception" marker for [`CpuContext::xcpt`].
pub const NO_XCPT: u32 = u32::MAX;
/// "No error code" marker for [`CpuContext::err`].
pub const NO_ERR: u64 = u64::MAX;

pub const XCPT_GP: u32 = 13;
pub const XCPT_PF: u32 = 14;

pub const PF_ERR_P: u64 = 1 << 0;
pub const PF_ERR_W: u64 = 1 << 1;
pub const PF_ERR_US: u64 = 1 << 2;

/// General purpose register numbers as encoded in ModR/M, SIB and REX.
pub mod gpr {
    pub const RAX: u8 = 0;
    pub const RCX: u8 = 1;
    pub const RDX: u8 = 2;
    pub const RBX: u8 = 3;
    pub const RSP: u8 = 4;
    pub const RBP: u8 = 5;
    pub const RSI: u8 = 6;
    pub const RDI: u8 = 7;
    pub const R12: u8 = 12;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SegReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl SegReg {
    pub const ALL: [SegReg; 6] = [
        Self::Es,
        Self::Cs,
        Self::Ss,
        Self::Ds,
        Self::Fs,
        Self::Gs,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(usize::from(index)).copied()
    }

    /// Segment-override prefix byte.
    pub fn prefix_byte(self) -> u8 {
        match self {
            Self::Es => 0x26,
            Self::Cs => 0x2e,
            Self::Ss => 0x36,
            Self::Ds => 0x3e,
            Self::Fs => 0x64,
            Self::Gs => 0x65,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Es => "es",
            Self::Cs => "cs",
            Self::Ss => "ss",
            Self::Ds => "ds",
            Self::Fs => "fs",
            Self::Gs => "gs",
        }
    }
}

const GPR_NAMES: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15",
];

/// Full register context of one side of a test case.
///
/// Three of these exist per test case: the input handed to the driver, the predicted result and
/// the result the driver observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuContext {
    pub rip: u64,
    pub rflags: u64,
    pub gprs: [u64; 16],
    pub sregs: [u16; 6],
    /// Exception vector raised by the instruction, [`NO_XCPT`] if none.
    pub xcpt: u32,
    /// Exception error code, [`NO_ERR`] if none.
    pub err: u64,
    pub cr2: u64,
    pub tr: u16,
    pub ldtr: u16,
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
    pub dr: [u64; 4],
    pub dr6: u64,
    pub dr7: u64,
    /// Flags the prediction does not pin down (architecturally undefined). Not compared.
    pub ignored_rflags: u64,
    /// The stack pointer takes part in addressing or is an operand. Not compared.
    pub tricky_stack: bool,
}

impl Default for CpuContext {
    fn default() -> Self {
        Self {
            rip: 0,
            rflags: FLAG_FIXED_1,
            gprs: [0; 16],
            sregs: [0; 6],
            xcpt: NO_XCPT,
            err: NO_ERR,
            cr2: 0,
            tr: 0,
            ldtr: 0,
            cr0: 0,
            cr3: 0,
            cr4: 0,
            cr8: 0,
            dr: [0; 4],
            dr6: 0,
            dr7: 0,
            ignored_rflags: 0,
            tricky_stack: false,
        }
    }
}

impl CpuContext {
    /// Starting point for every test case in `mode`.
    ///
    /// Register values are distinct per register and have bits set in every byte lane so that
    /// partial writes and wrong register selection show up in the comparison.
    pub fn template(mode: TargetMode) -> Self {
        let mut ctx = Self {
            rip: u64::MAX,
            rflags: FLAG_FIXED_1 | FLAG_ID | FLAG_IF,
            ..Self::default()
        };
        for (i, reg) in ctx.gprs.iter_mut().enumerate() {
            let i = i as u64;
            *reg = if mode.is_64bit() {
                0x3fef_cc00_daba_005d | (i << 32) | (i << 8)
            } else {
                0xfada_009b | (i << 12) | (i << 8)
            };
        }
        ctx
    }

    pub fn sreg(&self, seg: SegReg) -> u16 {
        self.sregs[seg.index()]
    }

    pub fn set_sreg(&mut self, seg: SegReg, value: u16) {
        self.sregs[seg.index()] = value;
    }

    /// Current privilege level as seen through the CS selector.
    pub fn cpl(&self) -> u8 {
        (self.sreg(SegReg::Cs) & 3) as u8
    }

    /// Every compared field that differs between `self` (expected) and `actual`.
    ///
    /// `rflags` is compared under `self.ignored_rflags`. The `ignored_rflags` and
    /// `tricky_stack` fields themselves are never compared.
    pub fn diff(&self, actual: &CpuContext) -> Vec<FieldDiff> {
        CtxField::compared()
            .filter_map(|field| {
                let expected = field.read(self);
                let got = field.read(actual);
                let differs = match field {
                    CtxField::Rflags => (expected ^ got) & !self.ignored_rflags != 0,
                    _ => expected != got,
                };
                differs.then_some(FieldDiff {
                    field,
                    expected,
                    actual: got,
                })
            })
            .collect()
    }
}

/// One compared register of a [`CpuContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CtxField {
    Rip,
    Rflags,
    Gpr(u8),
    Sreg(SegReg),
    Xcpt,
    Err,
    Cr2,
    Tr,
    Ldtr,
    Cr0,
    Cr3,
    Cr4,
    Cr8,
    Dr(u8),
    Dr6,
    Dr7,
}

impl CtxField {
    /// The fields taking part in result comparison, in reporting order.
    pub fn compared() -> impl Iterator<Item = CtxField> {
        [CtxField::Rip, CtxField::Rflags]
            .into_iter()
            .chain((0..16).map(CtxField::Gpr))
            .chain(SegReg::ALL.into_iter().map(CtxField::Sreg))
            .chain([
                CtxField::Xcpt,
                CtxField::Err,
                CtxField::Cr2,
                CtxField::Tr,
                CtxField::Ldtr,
                CtxField::Cr0,
                CtxField::Cr3,
                CtxField::Cr4,
                CtxField::Cr8,
            ])
            .chain((0..4).map(CtxField::Dr))
            .chain([CtxField::Dr6, CtxField::Dr7])
    }

    pub fn read(self, ctx: &CpuContext) -> u64 {
        match self {
            Self::Rip => ctx.rip,
            Self::Rflags => ctx.rflags,
            Self::Gpr(i) => ctx.gprs[usize::from(i)],
            Self::Sreg(seg) => u64::from(ctx.sreg(seg)),
            Self::Xcpt => u64::from(ctx.xcpt),
            Self::Err => ctx.err,
            Self::Cr2 => ctx.cr2,
            Self::Tr => u64::from(ctx.tr),
            Self::Ldtr => u64::from(ctx.ldtr),
            Self::Cr0 => ctx.cr0,
            Self::Cr3 => ctx.cr3,
            Self::Cr4 => ctx.cr4,
            Self::Cr8 => ctx.cr8,
            Self::Dr(i) => ctx.dr[usize::from(i)],
            Self::Dr6 => ctx.dr6,
            Self::Dr7 => ctx.dr7,
        }
    }
}

impl fmt::Display for CtxField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rip => f.write_str("rip"),
            Self::Rflags => f.write_str("rflags"),
            Self::Gpr(i) => f.write_str(GPR_NAMES[usize::from(*i)]),
            Self::Sreg(seg) => f.write_str(seg.name()),
            Self::Xcpt => f.write_str("xcpt"),
            Self::Err => f.write_str("xcpt_err"),
            Self::Cr2 => f.write_str("cr2"),
            Self::Tr => f.write_str("tr"),
            Self::Ldtr => f.write_str("ldtr"),
            Self::Cr0 => f.write_str("cr0"),
            Self::Cr3 => f.write_str("cr3"),
            Self::Cr4 => f.write_str("cr4"),
            Self::Cr8 => f.write_str("cr8"),
            Self::Dr(i) => write!(f, "dr{i}"),
            Self::Dr6 => f.write_str("dr6"),
            Self::Dr7 => f.write_str("dr7"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub field: CtxField,
    pub expected: u64,
    pub actual: u64,
}

impl fmt::Display for FieldDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: got {:#x}, expected {:#x}",
            self.field, self.actual, self.expected
        )
    }
}
