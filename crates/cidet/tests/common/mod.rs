// Shared test helpers (integration tests compile as separate crates, so put
// common code in a submodule to avoid it becoming its own test target).
#![allow(dead_code)]

use cidet::buffer::{BufferConfig, BufferDescriptor, PageAccess, PAGE_SIZE};
use cidet::ctx::{
    CpuContext, FLAGS_ARITH, FLAG_AF, FLAG_CF, FLAG_OF, FLAG_PF, FLAG_SF, FLAG_ZF, PF_ERR_P,
    PF_ERR_US, PF_ERR_W, XCPT_GP, XCPT_PF,
};
use cidet::{PlatformDriver, TargetMode};
use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic, OpKind, Register};

pub const XCPT_UD: u32 = 6;

/// Linear addresses low enough for 16-bit addressing and RIP-relative forms in every mode.
pub const CODE_BASE: u64 = 0x9000;
pub const DATA_BASE: u64 = 0x6000;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init();
}

/// Maps a general purpose register to `(index, high_byte, size)`.
pub fn gpr_parts(reg: Register) -> Option<(u8, bool, u8)> {
    if !reg.is_gpr() {
        return None;
    }
    let high = matches!(reg, Register::AH | Register::CH | Register::DH | Register::BH);
    Some((reg.full_register().number() as u8, high, reg.size() as u8))
}

pub fn mask(size: u8) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (u32::from(size) * 8)) - 1
    }
}

fn signed(value: u64, size: u8) -> i128 {
    let bits = u32::from(size) * 8;
    let value = value & mask(size);
    if value >> (bits - 1) & 1 == 1 {
        i128::from(value) - (1i128 << bits)
    } else {
        i128::from(value)
    }
}

/// Reference ALU, written independently of the engine's flag formulas: carry and overflow come
/// from wide unsigned and signed arithmetic, AF from nibble arithmetic.
pub fn reference_alu(mnemonic: Mnemonic, dest: u64, src: u64, rflags: u64, size: u8) -> (u64, u64) {
    let m = mask(size);
    let (d, s) = (dest & m, src & m);
    let c = u64::from(rflags & FLAG_CF != 0);
    let min = -(1i128 << (size * 8 - 1));
    let max = (1i128 << (size * 8 - 1)) - 1;

    let mut flags = 0;
    let result = match mnemonic {
        Mnemonic::Add | Mnemonic::Adc => {
            let c = if mnemonic == Mnemonic::Adc { c } else { 0 };
            let wide = u128::from(d) + u128::from(s) + u128::from(c);
            let sum = signed(d, size) + signed(s, size) + i128::from(c);
            if wide > u128::from(m) {
                flags |= FLAG_CF;
            }
            if sum < min || sum > max {
                flags |= FLAG_OF;
            }
            if (d & 0xf) + (s & 0xf) + c > 0xf {
                flags |= FLAG_AF;
            }
            wide as u64 & m
        }
        Mnemonic::Sub | Mnemonic::Sbb | Mnemonic::Cmp => {
            let c = if mnemonic == Mnemonic::Sbb { c } else { 0 };
            let wide = i128::from(d) - i128::from(s) - i128::from(c);
            let diff = signed(d, size) - signed(s, size) - i128::from(c);
            if wide < 0 {
                flags |= FLAG_CF;
            }
            if diff < min || diff > max {
                flags |= FLAG_OF;
            }
            if (d & 0xf) < (s & 0xf) + c {
                flags |= FLAG_AF;
            }
            wide as u64 & m
        }
        Mnemonic::And => d & s,
        Mnemonic::Or => d | s,
        Mnemonic::Xor => d ^ s,
        other => panic!("reference ALU does not implement {other:?}"),
    };
    if result == 0 {
        flags |= FLAG_ZF;
    }
    if result >> (u32::from(size) * 8 - 1) & 1 == 1 {
        flags |= FLAG_SF;
    }
    if (result as u8).count_ones() % 2 == 0 {
        flags |= FLAG_PF;
    }
    (result, (rflags & !FLAGS_ARITH) | flags)
}

/// A platform driver that interprets the ALU group, plus register-form `mov r, Sreg`, over a
/// flat memory model.
///
/// Code and data buffers are two pages each: the first page carries the configured access
/// rights, the second is not present. Segment bases are zero.
pub struct SimDriver {
    pub mode: TargetMode,
    pub code_base: u64,
    pub data_base: u64,
    pub code_configs: Vec<BufferConfig>,
    pub data_configs: Vec<BufferConfig>,
    code: Vec<u8>,
    data: Vec<u8>,
    data_access: PageAccess,
    pub failures: Vec<String>,
    pub executed: u64,
    pub page_faults: u64,
    /// XOR'ed into the resulting rflags after every execution.
    pub corrupt_rflags: u64,
    /// XOR'ed into the given register after every execution.
    pub corrupt_gpr: Option<(usize, u64)>,
    pub decline_tricky_stack: bool,
    pub refuse_data: bool,
}

impl SimDriver {
    pub fn new(mode: TargetMode) -> Self {
        Self {
            mode,
            code_base: CODE_BASE,
            data_base: DATA_BASE,
            code_configs: vec![BufferConfig::CODE_PAGE_END],
            data_configs: vec![BufferConfig::DATA_RW],
            code: vec![0; 2 * PAGE_SIZE as usize],
            data: vec![0; 2 * PAGE_SIZE as usize],
            data_access: PageAccess::RW,
            failures: Vec::new(),
            executed: 0,
            page_faults: 0,
            corrupt_rflags: 0,
            corrupt_gpr: None,
            decline_tricky_stack: false,
            refuse_data: false,
        }
    }

    pub fn with_data_configs(mut self, configs: Vec<BufferConfig>) -> Self {
        self.data_configs = configs;
        self
    }

    fn bitness(&self) -> u32 {
        self.mode.bitness()
    }

    fn address_bytes(&self, bytes: &[u8]) -> u8 {
        let has_67 = bytes
            .iter()
            .take_while(|b| {
                matches!(
                    b,
                    0x26 | 0x2e | 0x36 | 0x3e | 0x64 | 0x65 | 0x66 | 0x67 | 0xf0 | 0xf2 | 0xf3
                )
            })
            .any(|b| *b == 0x67);
        if has_67 {
            self.mode.alternate_address_bytes()
        } else {
            self.mode.default_address_bytes()
        }
    }

    fn read_gpr(ctx: &CpuContext, reg: Register) -> u64 {
        let (index, high, size) = gpr_parts(reg).expect("gpr");
        let value = ctx.gprs[usize::from(index)];
        if high {
            (value >> 8) & 0xff
        } else {
            value & mask(size)
        }
    }

    fn write_gpr(&self, ctx: &mut CpuContext, reg: Register, value: u64) {
        let (index, high, size) = gpr_parts(reg).expect("gpr");
        let slot = &mut ctx.gprs[usize::from(index)];
        *slot = match (size, high) {
            (1, true) => (*slot & !0xff00) | ((value & 0xff) << 8),
            (4, _) if self.mode.is_64bit() => value & 0xffff_ffff,
            (8, _) => value,
            _ => (*slot & !mask(size)) | (value & mask(size)),
        };
    }

    fn linear_address(&self, instr: &Instruction, ctx: &CpuContext, addr_bytes: u8) -> u64 {
        let addr_mask = mask(addr_bytes);
        let base = instr.memory_base();
        if matches!(base, Register::RIP | Register::EIP) {
            return instr.memory_displacement64() & addr_mask;
        }
        let mut offset = instr.memory_displacement64();
        if base != Register::None {
            offset = offset.wrapping_add(Self::read_gpr(ctx, base));
        }
        let index = instr.memory_index();
        if index != Register::None {
            let scaled = Self::read_gpr(ctx, index).wrapping_mul(instr.memory_index_scale() as u64);
            offset = offset.wrapping_add(scaled);
        }
        offset & addr_mask
    }

    /// Offset into the data buffer, or `None` if the access leaves it.
    fn data_offset(&self, addr: u64, size: u8) -> Option<usize> {
        let off = addr.checked_sub(self.data_base)?;
        let end = off.checked_add(u64::from(size))?;
        (end <= self.data.len() as u64).then_some(off as usize)
    }

    fn page_fault(&self, off: usize, size: u8, write: bool, cpl: u8) -> Option<u64> {
        let last = off + usize::from(size) - 1;
        for page in [off / PAGE_SIZE as usize, last / PAGE_SIZE as usize] {
            let access = if page == 0 {
                self.data_access
            } else {
                PageAccess::empty()
            };
            let present = !access.is_empty();
            if !present || (write && !access.contains(PageAccess::WRITE)) {
                let mut err = 0;
                if present {
                    err |= PF_ERR_P;
                }
                if write {
                    err |= PF_ERR_W;
                }
                if cpl == 3 {
                    err |= PF_ERR_US;
                }
                return Some(err);
            }
        }
        None
    }

    fn read_mem(&self, off: usize, size: u8) -> u64 {
        let mut le = [0u8; 8];
        le[..usize::from(size)].copy_from_slice(&self.data[off..off + usize::from(size)]);
        u64::from_le_bytes(le)
    }

    fn run(&mut self, input: &CpuContext, actual: &mut CpuContext) {
        let Some(code_off) = input
            .rip
            .checked_sub(self.code_base)
            .filter(|off| *off < u64::from(PAGE_SIZE))
        else {
            actual.xcpt = XCPT_GP;
            return;
        };
        let bytes = &self.code[code_off as usize..PAGE_SIZE as usize];
        let mut decoder = Decoder::with_ip(self.bitness(), bytes, input.rip, DecoderOptions::NONE);
        let instr = decoder.decode();
        if instr.is_invalid() || instr.op_count() != 2 {
            actual.xcpt = XCPT_UD;
            return;
        }
        let len = instr.len();
        let next_rip = input.rip.wrapping_add(len as u64) & mask(self.mode.default_address_bytes());
        if instr.mnemonic() == Mnemonic::Mov
            && instr.op0_kind() == OpKind::Register
            && instr.op1_kind() == OpKind::Register
            && instr.op1_register().is_segment_register()
        {
            let value = u64::from(input.sregs[instr.op1_register().number()]);
            self.write_gpr(actual, instr.op0_register(), value);
            actual.rip = next_rip;
            return;
        }
        let addr_bytes = self.address_bytes(&bytes[..len]);
        let writes = instr.mnemonic() != Mnemonic::Cmp;

        let mut size = 0u8;
        let mut mem_off = None;
        for op in 0..2 {
            match instr.op_kind(op) {
                OpKind::Register => {
                    if op == 0 {
                        size = instr.op_register(op).size() as u8;
                    }
                }
                OpKind::Memory => {
                    let msize = instr.memory_size().size() as u8;
                    if op == 0 {
                        size = msize;
                    }
                    let addr = self.linear_address(&instr, input, addr_bytes);
                    let Some(off) = self.data_offset(addr, msize) else {
                        actual.xcpt = XCPT_GP;
                        return;
                    };
                    let write = writes && op == 0;
                    if let Some(err) = self.page_fault(off, msize, write, input.cpl()) {
                        self.page_faults += 1;
                        actual.xcpt = XCPT_PF;
                        actual.err = err;
                        actual.cr2 = addr;
                        return;
                    }
                    mem_off = Some(off);
                }
                _ => {}
            }
        }

        let read = |op: u32, this: &Self| -> u64 {
            match instr.op_kind(op) {
                OpKind::Register => Self::read_gpr(input, instr.op_register(op)),
                OpKind::Memory => this.read_mem(mem_off.unwrap_or_default(), size),
                _ => instr.immediate(op) & mask(size),
            }
        };
        let dest = read(0, self);
        let src = read(1, self);
        let (result, rflags) = reference_alu(instr.mnemonic(), dest, src, input.rflags, size);

        actual.rflags = rflags;
        if writes {
            match instr.op_kind(0) {
                OpKind::Register => self.write_gpr(actual, instr.op_register(0), result),
                _ => {
                    let off = mem_off.unwrap_or_default();
                    let n = usize::from(size);
                    self.data[off..off + n].copy_from_slice(&result.to_le_bytes()[..n]);
                }
            }
        }
        actual.rip = next_rip;
    }
}

impl PlatformDriver for SimDriver {
    fn code_buf_configs(&self) -> Vec<BufferConfig> {
        self.code_configs.clone()
    }

    fn data_buf_configs(&self) -> Vec<BufferConfig> {
        self.data_configs.clone()
    }

    fn reinit_data_buf(&mut self, buf: &mut BufferDescriptor) -> bool {
        if self.refuse_data {
            return false;
        }
        buf.eff_buf_addr = self.data_base;
        buf.seg_base = 0;
        self.data_access = buf.config.access;
        self.data.fill(0xa5);
        true
    }

    fn setup_data_buf(&mut self, buf: &BufferDescriptor, bytes: &[u8]) -> bool {
        let off = buf.off as usize;
        self.data[off..off + bytes.len()].copy_from_slice(bytes);
        true
    }

    fn is_buf_equal(&mut self, buf: &BufferDescriptor, expected: &[u8]) -> bool {
        let off = buf.off as usize;
        self.data[off..off + expected.len()] == *expected
    }

    fn reinit_code_buf(&mut self, buf: &mut BufferDescriptor) -> bool {
        buf.eff_buf_addr = self.code_base;
        buf.seg_base = 0;
        buf.off_active = buf.off;
        self.code.fill(0xcc);
        true
    }

    fn setup_code_buf(&mut self, buf: &BufferDescriptor, instr: &[u8]) -> bool {
        let off = buf.off_active as usize;
        self.code[off..off + instr.len()].copy_from_slice(instr);
        true
    }

    fn execute(&mut self, input: &CpuContext, actual: &mut CpuContext) -> bool {
        if self.decline_tricky_stack && input.tricky_stack {
            return false;
        }
        self.executed += 1;
        self.run(input, actual);
        actual.rflags ^= self.corrupt_rflags;
        if let Some((reg, bits)) = self.corrupt_gpr {
            actual.gprs[reg] ^= bits;
        }
        true
    }

    fn failure(&mut self, message: &str) {
        self.failures.push(message.to_string());
    }
}
