//! Thin wrapper around `iced-x86`'s decoder (§2 "CPU Instruction Decoder"). Interpreter, cached
//! interpreter and recompiler only ever see `DecodedInstruction`/`Mnemonic` from this module, so
//! the underlying decoder crate could be swapped without touching execution logic.

use iced_x86::{Decoder as IcedDecoder, DecoderOptions, Instruction};

pub use iced_x86::{Code, Mnemonic, OpKind, Register};

/// A single decoded instruction plus the metadata the interpreter needs to recover from a fault
/// mid-instruction or to decide whether a block can continue past it.
#[derive(Debug, Clone)]
pub struct DecodedInstruction {
    pub inner: Instruction,
    /// Length in bytes as actually consumed from the instruction stream.
    pub length: u32,
    /// The physical (not linear) address the first byte was fetched from; used as part of a
    /// `BlockKey` and for code-cache-page bookkeeping.
    pub physical_address: u32,
}

impl DecodedInstruction {
    /// The coarse mnemonic (`Mov`, `Add`, `Je`, ...), independent of operand-size/addressing-mode
    /// encoding. This is what the interpreter dispatches on.
    pub fn mnemonic(&self) -> Mnemonic {
        self.inner.mnemonic()
    }

    /// The fine-grained, per-encoding opcode. Useful where the coarse mnemonic does not
    /// distinguish operand forms the interpreter needs to special-case.
    pub fn code(&self) -> Code {
        self.inner.code()
    }

    /// True for any instruction that ends a straight-line block: unconditional jumps/calls/rets,
    /// conditional branches, software interrupts, and HLT (§4.5 "up to the first unconditional
    /// branch, software interrupt, or page boundary").
    pub fn ends_block(&self) -> bool {
        use iced_x86::FlowControl::*;
        !matches!(self.inner.flow_control(), Next | Call)
    }
}

/// Decodes instructions from `bytes` (which the caller has already fetched starting at
/// `physical_address`) until a block-ending instruction is reached or the buffer is exhausted,
/// whichever comes first. `bitness` is 16 or 32.
pub fn decode_block(bytes: &[u8], physical_address: u32, bitness: u32) -> Vec<DecodedInstruction> {
    let mut decoder = IcedDecoder::with_ip(bitness, bytes, physical_address as u64, DecoderOptions::NONE);
    let mut out = Vec::new();
    while decoder.can_decode() {
        let start = decoder.position() as u32;
        let mut instr = Instruction::default();
        decoder.decode_out(&mut instr);
        if instr.is_invalid() {
            break;
        }
        let length = decoder.position() as u32 - start;
        let decoded = DecodedInstruction {
            physical_address: physical_address + start,
            length,
            inner: instr,
        };
        let stop = decoded.ends_block();
        out.push(decoded);
        if stop {
            break;
        }
    }
    out
}

/// Decodes exactly one instruction, for the plain interpreter's fetch-decode-execute loop which
/// never needs more than the instruction currently at EIP.
pub fn decode_one(bytes: &[u8], physical_address: u32, bitness: u32) -> Option<DecodedInstruction> {
    let mut decoder = IcedDecoder::with_ip(bitness, bytes, physical_address as u64, DecoderOptions::NONE);
    if !decoder.can_decode() {
        return None;
    }
    let mut instr = Instruction::default();
    decoder.decode_out(&mut instr);
    if instr.is_invalid() {
        return None;
    }
    let length = decoder.position() as u32;
    Some(DecodedInstruction {
        physical_address,
        length,
        inner: instr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_simple_mov_and_reports_length() {
        // mov eax, 0x12345678
        let bytes = [0xB8, 0x78, 0x56, 0x34, 0x12];
        let instr = decode_one(&bytes, 0x1000, 32).unwrap();
        assert_eq!(instr.length, 5);
        assert_eq!(instr.mnemonic(), Mnemonic::Mov);
        assert_eq!(instr.code(), Code::Mov_r32_imm32);
    }

    #[test]
    fn block_decoding_stops_at_unconditional_jump() {
        // inc eax ; jmp short -2
        let bytes = [0x40, 0xEB, 0xFE];
        let block = decode_block(&bytes, 0x2000, 32);
        assert_eq!(block.len(), 2);
        assert!(block.last().unwrap().ends_block());
    }
}
