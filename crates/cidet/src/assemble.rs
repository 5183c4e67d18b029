//! Turns the current encoding state and operand values into instruction bytes.
//!
//! Length calculation and byte emission share one walk so the two can never disagree.

use crate::engine::{EngineState, MAX_INSTR_LEN};
use crate::error::AssembleError;

trait ByteSink {
    fn put(&mut self, byte: u8);

    fn put_le(&mut self, value: u64, size: u8) {
        for byte in &value.to_le_bytes()[..usize::from(size)] {
            self.put(*byte);
        }
    }
}

struct LengthCounter(usize);

impl ByteSink for LengthCounter {
    fn put(&mut self, _byte: u8) {
        self.0 += 1;
    }
}

struct ByteWriter {
    bytes: [u8; 2 * MAX_INSTR_LEN],
    len: usize,
}

impl ByteSink for ByteWriter {
    fn put(&mut self, byte: u8) {
        if let Some(slot) = self.bytes.get_mut(self.len) {
            *slot = byte;
        }
        self.len += 1;
    }
}

impl EngineState {
    /// Emits, in order: segment override, 0x67, 0x66, mandatory prefix, REX, opcode, ModR/M,
    /// SIB, displacement and immediates in operand order. Multi-byte fields are little endian.
    fn emit<S: ByteSink>(&self, sink: &mut S) -> Result<(), AssembleError> {
        let Some(instr) = self.instr else {
            return Err(AssembleError::OpcodeLength(0));
        };
        if !(1..=3).contains(&instr.opcode.len()) {
            return Err(AssembleError::OpcodeLength(instr.opcode.len()));
        }

        if let Some(seg) = self.enc.seg_prefix {
            sink.put(seg.prefix_byte());
        }
        if self.enc.addr_size_prefix {
            sink.put(0x67);
        }
        if self.enc.op_size_prefix {
            sink.put(0x66);
        }
        if let Some(prefix) = instr.mandatory_prefix {
            sink.put(prefix);
        }
        if let Some(rex) = self.enc.rex_byte() {
            sink.put(rex);
        }
        for byte in instr.opcode {
            sink.put(*byte);
        }

        if instr.uses_modrm() {
            sink.put(self.enc.modrm);
            if self.enc.has_sib {
                sink.put(self.enc.sib);
            }
            if let Some(rm) = self.mrm_rm_op.map(|idx| &self.operands[idx]) {
                if rm.is_mem {
                    match rm.disp_size {
                        0 => {}
                        1 | 2 | 4 => sink.put_le(rm.imm_disp, rm.disp_size),
                        n => return Err(AssembleError::DisplacementSize(n)),
                    }
                }
            }
        }

        for op in self.operands.iter().filter(|op| op.is_imm()) {
            match op.size {
                1 | 2 | 4 | 8 => sink.put_le(op.imm_disp, op.size),
                n => return Err(AssembleError::ImmediateSize(n)),
            }
        }
        Ok(())
    }

    /// Length of the instruction the current state encodes to.
    pub fn assemble_length(&self) -> Result<u8, AssembleError> {
        let mut counter = LengthCounter(0);
        self.emit(&mut counter)?;
        if counter.0 > MAX_INSTR_LEN {
            return Err(AssembleError::TooLong(counter.0));
        }
        Ok(counter.0 as u8)
    }

    /// Encodes the instruction into the engine's instruction buffer.
    pub fn assemble(&mut self) -> Result<u8, AssembleError> {
        let mut writer = ByteWriter {
            bytes: [0; 2 * MAX_INSTR_LEN],
            len: 0,
        };
        self.emit(&mut writer)?;
        if writer.len > MAX_INSTR_LEN {
            return Err(AssembleError::TooLong(writer.len));
        }
        self.instr_bytes = [0; MAX_INSTR_LEN + 1];
        self.instr_bytes[..writer.len].copy_from_slice(&writer.bytes[..writer.len]);
        self.instr_len = writer.len as u8;
        Ok(self.instr_len)
    }

    /// Bytes produced by the last [`assemble`](Self::assemble).
    pub fn instr_bytes(&self) -> &[u8] {
        &self.instr_bytes[..usize::from(self.instr_len)]
    }
}
