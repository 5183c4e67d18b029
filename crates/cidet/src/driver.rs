//! The seam between the engine and whatever actually runs the instruction.

use crate::buffer::{BufferConfig, BufferDescriptor};
use crate::ctx::CpuContext;

/// Platform callbacks the engine drives.
///
/// Every method returning `bool` answers "can this test case go ahead"; `false` makes the engine
/// skip the case and count it under the matching skip reason. Drivers never see encodings they
/// are not asked to run, so a driver that cannot express a situation declines it here.
pub trait PlatformDriver {
    /// Code buffer configurations to iterate, in order. Must not be empty.
    fn code_buf_configs(&self) -> Vec<BufferConfig> {
        vec![BufferConfig::CODE_PAGE_END]
    }

    /// Data buffer configurations to iterate for memory operands.
    fn data_buf_configs(&self) -> Vec<BufferConfig> {
        vec![BufferConfig::DATA_RW]
    }

    /// Places a data buffer for the coming test case.
    ///
    /// On entry `off` and `cb` hold the requested placement. The driver fills in
    /// `eff_buf_addr` and `seg_base` for the buffer's `eff_seg`.
    fn reinit_data_buf(&mut self, buf: &mut BufferDescriptor) -> bool;

    /// Writes the operand's input bytes at the buffer's active offset.
    fn setup_data_buf(&mut self, buf: &BufferDescriptor, bytes: &[u8]) -> bool;

    /// Compares the bytes at the buffer's active offset after execution.
    fn is_buf_equal(&mut self, buf: &BufferDescriptor, expected: &[u8]) -> bool;

    /// Places the code buffer. The driver fills in `eff_buf_addr`, `seg_base` and
    /// `off_active`, and may pick a code selector.
    fn reinit_code_buf(&mut self, buf: &mut BufferDescriptor) -> bool;

    /// Writes the encoded instruction at the code buffer's active offset.
    fn setup_code_buf(&mut self, buf: &BufferDescriptor, instr: &[u8]) -> bool;

    /// Runs one instruction from `input`, storing the resulting state in `actual`.
    ///
    /// `actual` starts as a copy of `input`. Returning `false` means the driver declined to run
    /// this case (for example a tricky stack setup it cannot survive).
    fn execute(&mut self, input: &CpuContext, actual: &mut CpuContext) -> bool;

    /// Receives one human readable failure line.
    fn failure(&mut self, message: &str);
}

impl<D: PlatformDriver + ?Sized> PlatformDriver for &mut D {
    fn code_buf_configs(&self) -> Vec<BufferConfig> {
        (**self).code_buf_configs()
    }

    fn data_buf_configs(&self) -> Vec<BufferConfig> {
        (**self).data_buf_configs()
    }

    fn reinit_data_buf(&mut self, buf: &mut BufferDescriptor) -> bool {
        (**self).reinit_data_buf(buf)
    }

    fn setup_data_buf(&mut self, buf: &BufferDescriptor, bytes: &[u8]) -> bool {
        (**self).setup_data_buf(buf, bytes)
    }

    fn is_buf_equal(&mut self, buf: &BufferDescriptor, expected: &[u8]) -> bool {
        (**self).is_buf_equal(buf, expected)
    }

    fn reinit_code_buf(&mut self, buf: &mut BufferDescriptor) -> bool {
        (**self).reinit_code_buf(buf)
    }

    fn setup_code_buf(&mut self, buf: &BufferDescriptor, instr: &[u8]) -> bool {
        (**self).setup_code_buf(buf, instr)
    }

    fn execute(&mut self, input: &CpuContext, actual: &mut CpuContext) -> bool {
        (**self).execute(input, actual)
    }

    fn failure(&mut self, message: &str) {
        (**self).failure(message)
    }
}
