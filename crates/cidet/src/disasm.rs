//! Failure-message helpers: byte dumps and Intel-syntax disassembly.

use iced_x86::{Decoder, DecoderOptions, Formatter, IntelFormatter};

use crate::ctx::{FLAG_AF, FLAG_CF, FLAG_DF, FLAG_OF, FLAG_PF, FLAG_SF, FLAG_ZF};

pub fn hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Decodes the first instruction in `bytes` at `ip`. Returns `None` if the decoder rejects it.
pub fn decode(bytes: &[u8], bitness: u32, ip: u64) -> Option<iced_x86::Instruction> {
    let mut decoder = Decoder::with_ip(bitness, bytes, ip, DecoderOptions::NONE);
    let instruction = decoder.decode();
    if instruction.is_invalid() {
        None
    } else {
        Some(instruction)
    }
}

pub fn disassemble(bytes: &[u8], bitness: u32, ip: u64) -> Option<String> {
    let instruction = decode(bytes, bitness, ip)?;
    let mut formatter = IntelFormatter::new();
    let mut out = String::new();
    formatter.format(&instruction, &mut out);
    if instruction.len() != bytes.len() {
        out.push_str(&format!(" (decoded {} of {} bytes)", instruction.len(), bytes.len()));
    }
    Some(out)
}

/// Arithmetic flags set in `rflags`, restricted to `mask`.
pub fn format_flags(rflags: u64, mask: u64) -> String {
    let mut parts = Vec::new();
    for (name, bit) in [
        ("CF", FLAG_CF),
        ("PF", FLAG_PF),
        ("AF", FLAG_AF),
        ("ZF", FLAG_ZF),
        ("SF", FLAG_SF),
        ("DF", FLAG_DF),
        ("OF", FLAG_OF),
    ] {
        if mask & bit == 0 {
            continue;
        }
        parts.push(format!("{name}={}", u8::from(rflags & bit != 0)));
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disassembles_at_bitness() {
        assert_eq!(disassemble(&[0x00, 0xc8], 32, 0).as_deref(), Some("add al,cl"));
        assert_eq!(
            disassemble(&[0x48, 0x01, 0xd8], 64, 0).as_deref(),
            Some("add rax,rbx")
        );
        assert_eq!(disassemble(&[0x06], 64, 0), None);
    }

    #[test]
    fn flags_respect_mask() {
        assert_eq!(format_flags(FLAG_CF | FLAG_ZF, FLAG_CF | FLAG_ZF | FLAG_OF), "CF=1 ZF=1 OF=0");
    }
}
