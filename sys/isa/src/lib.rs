// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The MiniVM instruction set, as data.
//!
//! This crate is the single source of truth for opcodes, operand forms and
//! instruction word layout. The VM's decoder, the assembler and the
//! disassembler all consume this table; none of them carries a private copy
//! of any encoding detail.
//!
//! # Word layout
//!
//! Instructions are fixed-width 32-bit little-endian words:
//!
//! ```text
//! [31:24] opcode
//! [23:20] rd
//! [19:16] rs
//! [15:12] rt      (register forms)
//! [11:0]  imm12   (sign-extended where the form says so)
//! [15:0]  imm16   (wide forms; rt is absent)
//! ```
//!
//! `SVC` packs its module id in `[15:8]` and function id in `[7:0]`.
//! `CALL` carries the workspace frame size in the `rd` field and a signed
//! 16-bit word offset. Branch offsets are PC-relative in units of 4-byte
//! words, measured from the instruction after the branch.

/// Size of one instruction word in bytes. The program counter advances by
/// this much on every non-branching instruction.
pub const WORD: u32 = 4;

/// Number of addressable registers in one window.
pub const NUM_REGS: u8 = 16;

/// All MiniVM opcodes, with their wire discriminants.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum Op {
    Nop = 0x00,
    Mov = 0x01,
    Ldi = 0x02,
    Lui = 0x03,
    Ld = 0x08,
    St = 0x09,
    Ldb = 0x0A,
    Stb = 0x0B,
    Add = 0x10,
    Addi = 0x11,
    Sub = 0x12,
    Adc = 0x13,
    Sbc = 0x14,
    Mul = 0x15,
    Div = 0x16,
    And = 0x18,
    Or = 0x19,
    Xor = 0x1A,
    Not = 0x1B,
    Lsl = 0x20,
    Lsr = 0x21,
    Asr = 0x22,
    Lsli = 0x23,
    Lsri = 0x24,
    Asri = 0x25,
    Cmp = 0x28,
    Cmpi = 0x29,
    Beq = 0x30,
    Bne = 0x31,
    Blt = 0x32,
    Bge = 0x33,
    Bcs = 0x34,
    Bcc = 0x35,
    Bmi = 0x36,
    Bpl = 0x37,
    Jmp = 0x38,
    Call = 0x39,
    Ret = 0x3A,
    Svc = 0x40,
    Brk = 0x41,
}

/// Operand form of an opcode. This drives both the decoder's field
/// extraction and the assembler's operand parsing, so the two can never
/// disagree.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Form {
    /// No operands; low 24 bits must be zero.
    None,
    /// `rd, rs` -- register move/unary.
    Reg2,
    /// `rd, rs, rt` -- three-register ALU.
    Reg3,
    /// `rd, rs, #imm12` -- ALU with signed immediate.
    Reg2Imm,
    /// `rd, [rs + #imm12]` -- memory access with signed displacement.
    Mem,
    /// `rs, rt` -- two source registers, no destination (CMP).
    Reg2Src,
    /// `rs, #imm12` -- source register and signed immediate (CMPI).
    RegSrcImm,
    /// `rd, #imm16` -- wide immediate load.
    RegImm16,
    /// `#imm16` -- PC-relative signed word offset (branches, JMP).
    Rel16,
    /// `#frame, #imm16` -- CALL: frame size in the rd field, word offset.
    CallForm,
    /// `#module, #function` -- supervisor call.
    SvcForm,
}

/// One row of the opcode table.
pub struct OpInfo {
    pub op: Op,
    pub mnemonic: &'static str,
    pub form: Form,
}

/// The opcode table, in disassembly order. This is the artifact shared by
/// the VM, the assembler and the disassembler.
pub static OPCODES: &[OpInfo] = &[
    OpInfo { op: Op::Nop, mnemonic: "nop", form: Form::None },
    OpInfo { op: Op::Mov, mnemonic: "mov", form: Form::Reg2 },
    OpInfo { op: Op::Ldi, mnemonic: "ldi", form: Form::RegImm16 },
    OpInfo { op: Op::Lui, mnemonic: "lui", form: Form::RegImm16 },
    OpInfo { op: Op::Ld, mnemonic: "ld", form: Form::Mem },
    OpInfo { op: Op::St, mnemonic: "st", form: Form::Mem },
    OpInfo { op: Op::Ldb, mnemonic: "ldb", form: Form::Mem },
    OpInfo { op: Op::Stb, mnemonic: "stb", form: Form::Mem },
    OpInfo { op: Op::Add, mnemonic: "add", form: Form::Reg3 },
    OpInfo { op: Op::Addi, mnemonic: "addi", form: Form::Reg2Imm },
    OpInfo { op: Op::Sub, mnemonic: "sub", form: Form::Reg3 },
    OpInfo { op: Op::Adc, mnemonic: "adc", form: Form::Reg3 },
    OpInfo { op: Op::Sbc, mnemonic: "sbc", form: Form::Reg3 },
    OpInfo { op: Op::Mul, mnemonic: "mul", form: Form::Reg3 },
    OpInfo { op: Op::Div, mnemonic: "div", form: Form::Reg3 },
    OpInfo { op: Op::And, mnemonic: "and", form: Form::Reg3 },
    OpInfo { op: Op::Or, mnemonic: "or", form: Form::Reg3 },
    OpInfo { op: Op::Xor, mnemonic: "xor", form: Form::Reg3 },
    OpInfo { op: Op::Not, mnemonic: "not", form: Form::Reg2 },
    OpInfo { op: Op::Lsl, mnemonic: "lsl", form: Form::Reg3 },
    OpInfo { op: Op::Lsr, mnemonic: "lsr", form: Form::Reg3 },
    OpInfo { op: Op::Asr, mnemonic: "asr", form: Form::Reg3 },
    OpInfo { op: Op::Lsli, mnemonic: "lsli", form: Form::Reg2Imm },
    OpInfo { op: Op::Lsri, mnemonic: "lsri", form: Form::Reg2Imm },
    OpInfo { op: Op::Asri, mnemonic: "asri", form: Form::Reg2Imm },
    OpInfo { op: Op::Cmp, mnemonic: "cmp", form: Form::Reg2Src },
    OpInfo { op: Op::Cmpi, mnemonic: "cmpi", form: Form::RegSrcImm },
    OpInfo { op: Op::Beq, mnemonic: "beq", form: Form::Rel16 },
    OpInfo { op: Op::Bne, mnemonic: "bne", form: Form::Rel16 },
    OpInfo { op: Op::Blt, mnemonic: "blt", form: Form::Rel16 },
    OpInfo { op: Op::Bge, mnemonic: "bge", form: Form::Rel16 },
    OpInfo { op: Op::Bcs, mnemonic: "bcs", form: Form::Rel16 },
    OpInfo { op: Op::Bcc, mnemonic: "bcc", form: Form::Rel16 },
    OpInfo { op: Op::Bmi, mnemonic: "bmi", form: Form::Rel16 },
    OpInfo { op: Op::Bpl, mnemonic: "bpl", form: Form::Rel16 },
    OpInfo { op: Op::Jmp, mnemonic: "jmp", form: Form::Rel16 },
    OpInfo { op: Op::Call, mnemonic: "call", form: Form::CallForm },
    OpInfo { op: Op::Ret, mnemonic: "ret", form: Form::None },
    OpInfo { op: Op::Svc, mnemonic: "svc", form: Form::SvcForm },
    OpInfo { op: Op::Brk, mnemonic: "brk", form: Form::None },
];

impl Op {
    /// Looks up an opcode by wire discriminant.
    pub fn from_u8(x: u8) -> Option<Op> {
        OPCODES.iter().find(|i| i.op as u8 == x).map(|i| i.op)
    }

    /// Looks up an opcode by mnemonic. Matching is case-sensitive on the
    /// canonical lowercase spelling; callers fold case first.
    pub fn from_mnemonic(m: &str) -> Option<Op> {
        OPCODES.iter().find(|i| i.mnemonic == m).map(|i| i.op)
    }

    pub fn info(&self) -> &'static OpInfo {
        // The table is complete by construction; a miss here is a bug in
        // this crate, not in the caller.
        OPCODES.iter().find(|i| i.op == *self).unwrap()
    }

    pub fn mnemonic(&self) -> &'static str {
        self.info().mnemonic
    }

    pub fn form(&self) -> Form {
        self.info().form
    }

    /// True for instructions that may transfer control somewhere other
    /// than the next word. The code cache uses this to decide when a
    /// sequential prefetch is worth issuing.
    pub fn is_control_flow(&self) -> bool {
        matches!(
            self,
            Op::Beq
                | Op::Bne
                | Op::Blt
                | Op::Bge
                | Op::Bcs
                | Op::Bcc
                | Op::Bmi
                | Op::Bpl
                | Op::Jmp
                | Op::Call
                | Op::Ret
        )
    }
}

/// A decoded instruction. Fields not used by the opcode's form are zero;
/// `imm` has already been sign-extended.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Instr {
    pub op: Op,
    pub rd: u8,
    pub rs: u8,
    pub rt: u8,
    pub imm: i32,
}

impl Instr {
    /// Convenience constructor for register-only forms.
    pub fn reg(op: Op, rd: u8, rs: u8, rt: u8) -> Self {
        Instr { op, rd, rs, rt, imm: 0 }
    }

    /// Convenience constructor for immediate forms.
    pub fn imm(op: Op, rd: u8, rs: u8, imm: i32) -> Self {
        Instr { op, rd, rs, rt: 0, imm }
    }

    /// For `SVC`: the module id.
    pub fn svc_module(&self) -> u8 {
        (self.imm >> 8) as u8
    }

    /// For `SVC`: the function id.
    pub fn svc_function(&self) -> u8 {
        self.imm as u8
    }
}

/// Errors the decoder can report. The VM maps any of these to an
/// `IllegalInstruction` fault.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DecodeError {
    /// The opcode byte names no table entry.
    BadOpcode(u8),
    /// Bits the opcode's form leaves unused were set. Requiring them to be
    /// zero keeps encode/decode a bijection, which the toolchain's
    /// determinism tests rely on.
    ReservedBits(u32),
}

fn sign_extend_12(x: u32) -> i32 {
    ((x as i32) << 20) >> 20
}

fn sign_extend_16(x: u32) -> i32 {
    ((x as i32) << 16) >> 16
}

/// Decodes one instruction word.
pub fn decode(word: u32) -> Result<Instr, DecodeError> {
    let opcode = (word >> 24) as u8;
    let op = Op::from_u8(opcode).ok_or(DecodeError::BadOpcode(opcode))?;

    let rd = ((word >> 20) & 0xF) as u8;
    let rs = ((word >> 16) & 0xF) as u8;
    let rt = ((word >> 12) & 0xF) as u8;
    let imm12 = word & 0x0FFF;
    let imm16 = word & 0xFFFF;

    // Unused fields must decode as zero so that encode(decode(w)) == w.
    let check = |unused_zero: bool, instr: Instr| {
        if unused_zero {
            Ok(instr)
        } else {
            Err(DecodeError::ReservedBits(word))
        }
    };

    match op.form() {
        Form::None => check((word & 0x00FF_FFFF) == 0, Instr::reg(op, 0, 0, 0)),
        Form::Reg2 => check((word & 0x0000_FFFF) == 0, Instr::reg(op, rd, rs, 0)),
        Form::Reg3 => check(imm12 == 0, Instr::reg(op, rd, rs, rt)),
        Form::Reg2Imm | Form::Mem => {
            check(rt == 0, Instr::imm(op, rd, rs, sign_extend_12(imm12)))
        }
        Form::Reg2Src => check(rd == 0 && imm12 == 0, Instr::reg(op, 0, rs, rt)),
        Form::RegSrcImm => {
            check(rd == 0 && rt == 0, Instr::imm(op, 0, rs, sign_extend_12(imm12)))
        }
        Form::RegImm16 => check(rs == 0, Instr::imm(op, rd, 0, sign_extend_16(imm16))),
        Form::Rel16 => check(rd == 0 && rs == 0, Instr::imm(op, 0, 0, sign_extend_16(imm16))),
        Form::CallForm => check(rs == 0, Instr::imm(op, rd, 0, sign_extend_16(imm16))),
        Form::SvcForm => {
            check(rd == 0 && rs == 0, Instr::imm(op, 0, 0, imm16 as i32))
        }
    }
}

/// Encodes one instruction into its word. The inverse of [`decode`]: for
/// any instruction the assembler can produce, `decode(encode(i)) == i`.
pub fn encode(i: &Instr) -> u32 {
    let op = (i.op as u8 as u32) << 24;
    let rd = ((i.rd & 0xF) as u32) << 20;
    let rs = ((i.rs & 0xF) as u32) << 16;
    let rt = ((i.rt & 0xF) as u32) << 12;
    let imm12 = (i.imm as u32) & 0x0FFF;
    let imm16 = (i.imm as u32) & 0xFFFF;

    match i.op.form() {
        Form::None => op,
        Form::Reg2 => op | rd | rs,
        Form::Reg3 => op | rd | rs | rt,
        Form::Reg2Imm | Form::Mem => op | rd | rs | imm12,
        Form::Reg2Src => op | rs | rt,
        Form::RegSrcImm => op | rs | imm12,
        Form::RegImm16 => op | rd | imm16,
        Form::Rel16 => op | imm16,
        Form::CallForm => op | rd | imm16,
        Form::SvcForm => op | imm16,
    }
}

/// Renders one decoded instruction in MVASM syntax. The disassembler,
/// the executive's `disassemble` RPC, and the assembler's listings all
/// use this one formatter.
pub fn format_instr(i: &Instr) -> String {
    let m = i.op.mnemonic();
    match i.op.form() {
        Form::None => m.to_string(),
        Form::Reg2 => format!("{m} r{}, r{}", i.rd, i.rs),
        Form::Reg3 => format!("{m} r{}, r{}, r{}", i.rd, i.rs, i.rt),
        Form::Reg2Imm => format!("{m} r{}, r{}, #{}", i.rd, i.rs, i.imm),
        Form::Mem => format!("{m} r{}, [r{}, #{}]", i.rd, i.rs, i.imm),
        Form::Reg2Src => format!("{m} r{}, r{}", i.rs, i.rt),
        Form::RegSrcImm => format!("{m} r{}, #{}", i.rs, i.imm),
        Form::RegImm16 => format!("{m} r{}, #{}", i.rd, i.imm),
        Form::Rel16 => format!("{m} {}", i.imm),
        Form::CallForm => format!("{m} #{}, {}", i.rd, i.imm),
        Form::SvcForm => {
            format!("{m} {:#04x}, {:#04x}", i.svc_module(), i.svc_function())
        }
    }
}

/// Range check for immediates, used by the assembler to reject operands
/// that will not survive the encode/decode round trip.
pub fn imm_fits(form: Form, imm: i32) -> bool {
    match form {
        Form::Reg2Imm | Form::Mem | Form::RegSrcImm => (-2048..=2047).contains(&imm),
        Form::RegImm16 | Form::Rel16 | Form::CallForm => {
            (-32768..=32767).contains(&imm)
        }
        Form::SvcForm => (0..=0xFFFF).contains(&imm),
        _ => imm == 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_encodes_to_documented_layout() {
        let i = Instr::reg(Op::Add, 1, 2, 3);
        assert_eq!(encode(&i), 0x1012_3000);
    }

    #[test]
    fn every_opcode_round_trips_through_the_table() {
        for info in OPCODES {
            assert_eq!(Op::from_u8(info.op as u8), Some(info.op));
            assert_eq!(Op::from_mnemonic(info.mnemonic), Some(info.op));
        }
    }

    #[test]
    fn encode_decode_round_trips_representative_forms() {
        let cases = [
            Instr::reg(Op::Nop, 0, 0, 0),
            Instr::reg(Op::Mov, 4, 5, 0),
            Instr::reg(Op::Add, 1, 2, 3),
            Instr::imm(Op::Addi, 7, 7, -1),
            Instr::imm(Op::Ld, 3, 14, 0x7FC),
            Instr::imm(Op::St, 3, 14, -4),
            Instr { op: Op::Cmp, rd: 0, rs: 2, rt: 9, imm: 0 },
            Instr::imm(Op::Cmpi, 0, 2, -2048),
            Instr::imm(Op::Ldi, 0, 0, -32768),
            Instr::imm(Op::Lui, 15, 0, 0x7FFF),
            Instr::imm(Op::Beq, 0, 0, -3),
            Instr::imm(Op::Jmp, 0, 0, 120),
            Instr::imm(Op::Call, 8, 0, 16),
            Instr::imm(Op::Svc, 0, 0, 0x0502),
            Instr::reg(Op::Brk, 0, 0, 0),
        ];
        for i in &cases {
            let w = encode(i);
            assert_eq!(
                decode(w).unwrap(),
                *i,
                "instruction {i:?} failed to round-trip through {w:#010x}",
            );
        }
    }

    #[test]
    fn reserved_bits_are_rejected() {
        // BRK with junk in the rd field.
        assert_eq!(
            decode(0x4110_0000),
            Err(DecodeError::ReservedBits(0x4110_0000))
        );
        // Reg3 ADD with a stray immediate.
        assert_eq!(
            decode(0x1012_3001),
            Err(DecodeError::ReservedBits(0x1012_3001))
        );
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        assert_eq!(decode(0xFF00_0000), Err(DecodeError::BadOpcode(0xFF)));
    }

    #[test]
    fn svc_fields_unpack() {
        let i = decode(encode(&Instr::imm(Op::Svc, 0, 0, 0x0503))).unwrap();
        assert_eq!(i.svc_module(), 0x05);
        assert_eq!(i.svc_function(), 0x03);
    }
}
