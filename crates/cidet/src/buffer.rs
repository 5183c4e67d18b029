//! Code and data buffer configurations and the per-case buffer descriptors exchanged with the
//! platform driver.

use bitflags::bitflags;

use crate::ctx::SegReg;

pub const PAGE_SIZE: u32 = 0x1000;
/// Size of the code buffer a driver must provide.
pub const CODE_BUF_SIZE: u32 = 2 * PAGE_SIZE;
/// Size of each data buffer a driver must provide.
pub const DATA_BUF_SIZE: u32 = 2 * PAGE_SIZE;

bitflags! {
    /// Access rights of the page holding the active part of a buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageAccess: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;

        const RW = Self::READ.bits() | Self::WRITE.bits();
        const RX = Self::READ.bits() | Self::EXEC.bits();
        const RWX = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Code,
    Data,
}

/// Where inside the buffer the active bytes are placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Placement {
    /// Active bytes start at offset zero.
    Start,
    /// Active bytes end exactly at the end of the first page; the following page is expected to
    /// be a guard page.
    PageEnd,
}

/// One registered way of placing and protecting a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferConfig {
    pub name: &'static str,
    pub kind: BufferKind,
    pub access: PageAccess,
    pub placement: Placement,
}

impl BufferConfig {
    pub const CODE_PAGE_END: BufferConfig = BufferConfig {
        name: "code-page-end",
        kind: BufferKind::Code,
        access: PageAccess::RX,
        placement: Placement::PageEnd,
    };

    pub const DATA_RW: BufferConfig = BufferConfig {
        name: "data-rw",
        kind: BufferKind::Data,
        access: PageAccess::RW,
        placement: Placement::Start,
    };

    pub const DATA_RW_PAGE_END: BufferConfig = BufferConfig {
        name: "data-rw-page-end",
        kind: BufferKind::Data,
        access: PageAccess::RW,
        placement: Placement::PageEnd,
    };

    pub const DATA_RO: BufferConfig = BufferConfig {
        name: "data-ro",
        kind: BufferKind::Data,
        access: PageAccess::READ,
        placement: Placement::Start,
    };

    pub const DATA_NO_ACCESS: BufferConfig = BufferConfig {
        name: "data-no-access",
        kind: BufferKind::Data,
        access: PageAccess::empty(),
        placement: Placement::Start,
    };

    /// Requested offset of `cb` active bytes within a buffer of `buf_size` bytes.
    pub fn offset_for(&self, buf_size: u32, cb: u32) -> u32 {
        match self.placement {
            Placement::Start => 0,
            Placement::PageEnd => buf_size - PAGE_SIZE - cb,
        }
    }
}

/// Exception the buffer configuration makes the instruction raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExpectXcpt {
    #[default]
    None,
    /// #PF on the operand access, raised before the instruction retires.
    PageFault { error_code: u64 },
}

/// A code or data buffer as requested by the engine and placed by the driver.
///
/// The engine fills in the configuration, offset and size; the driver's re-init callback fills
/// in `eff_buf_addr`, `seg_base` and (for code) `off_active` and `selector`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub config_index: usize,
    pub config: BufferConfig,
    /// Requested offset of the active bytes.
    pub off: u32,
    /// Number of active bytes.
    pub cb: u32,
    // The engine only initialises `seg_limit`, `seg_base_off` and `xcpt_after_instruction`;
    // they are knobs for drivers that place buffers against segment boundaries.
    pub seg_limit: u32,
    /// Offset of the segment base relative to the buffer, for boundary tests.
    pub seg_base_off: u64,
    pub active: bool,
    /// Operand owning this buffer (data buffers only).
    pub operand: Option<usize>,
    pub xcpt_after_instruction: bool,
    pub expect_xcpt: ExpectXcpt,
    /// Segment the instruction accesses the buffer through.
    pub eff_seg: Option<SegReg>,
    /// Offset the driver actually placed the active bytes at (code buffers).
    pub off_active: u32,
    /// Linear address of the buffer start.
    pub eff_buf_addr: u64,
    /// Linear base of the segment used to reach the buffer.
    pub seg_base: u64,
    /// Code segment selector to run with, if the driver dictates one.
    pub selector: Option<u16>,
}

impl BufferDescriptor {
    pub fn new(config_index: usize, config: BufferConfig) -> Self {
        Self {
            config_index,
            config,
            off: 0,
            cb: 0,
            seg_limit: 0xffff,
            seg_base_off: 0,
            active: false,
            operand: None,
            xcpt_after_instruction: false,
            expect_xcpt: ExpectXcpt::None,
            eff_seg: None,
            off_active: 0,
            eff_buf_addr: 0,
            seg_base: 0,
            selector: None,
        }
    }

    /// Linear address of the first active byte.
    pub fn active_addr(&self) -> u64 {
        self.eff_buf_addr.wrapping_add(u64::from(self.off))
    }
}
