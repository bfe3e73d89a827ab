//! Opcode field decomposition and the fixed selector tables.
//!
//! Field naming follows the conventional octal split of a Z80 opcode
//! byte: x = bits 7-6, y = bits 5-3, z = bits 2-0, p = y >> 1,
//! q = y & 1.

use std::fmt;

use crate::inst::EdSimple;
use crate::loc::{IndexReg, Loc8, Loc16};
use crate::registers::{Flag, Registers, R16, R8};

/// The octal fields of one opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Octal {
    pub x: u8,
    pub y: u8,
    pub z: u8,
    pub p: u8,
    pub q: u8,
}

pub fn decompose(n: u8) -> Octal {
    let y = (n >> 3) & 0x07;
    Octal {
        x: n >> 6,
        y,
        z: n & 0x07,
        p: y >> 1,
        q: y & 0x01,
    }
}

/// Pack an opcode byte from its x/y/z fields.
pub fn encode_xyz(x: u8, y: u8, z: u8) -> u8 {
    debug_assert!(x <= 3 && y <= 7 && z <= 7);
    (x << 6) | (y << 3) | z
}

/// Pack an opcode byte from its x/p/q/z fields.
pub fn encode_xpqz(x: u8, p: u8, q: u8, z: u8) -> u8 {
    debug_assert!(p <= 3 && q <= 1);
    encode_xyz(x, (p << 1) | q, z)
}

/// R selector: the 3-bit register field.
///
/// With an index prefix in effect, H and L become the index-register
/// halves and slot 6 becomes `(IX+d)`/`(IY+d)`; `disp` must carry the
/// displacement in that case.
pub fn table_r(code: u8, prefix: Option<IndexReg>, disp: Option<i8>) -> Loc8 {
    match (code, prefix) {
        (0, _) => Loc8::Reg(R8::B),
        (1, _) => Loc8::Reg(R8::C),
        (2, _) => Loc8::Reg(R8::D),
        (3, _) => Loc8::Reg(R8::E),
        (4, None) => Loc8::Reg(R8::H),
        (5, None) => Loc8::Reg(R8::L),
        (6, None) => Loc8::RegAddr(R16::HL),
        (7, _) => Loc8::Reg(R8::A),
        (4, Some(IndexReg::IX)) => Loc8::Reg(R8::IXH),
        (5, Some(IndexReg::IX)) => Loc8::Reg(R8::IXL),
        (4, Some(IndexReg::IY)) => Loc8::Reg(R8::IYH),
        (5, Some(IndexReg::IY)) => Loc8::Reg(R8::IYL),
        (6, Some(idx)) => {
            Loc8::Indexed(idx, disp.expect("indexed R lookup without displacement"))
        }
        _ => unreachable!("R selector out of range: {code}"),
    }
}

/// RP selector: BC, DE, HL (or IX/IY under a prefix), SP.
pub fn table_rp(code: u8, prefix: Option<IndexReg>) -> Loc16 {
    match (code, prefix) {
        (0, _) => Loc16::Reg(R16::BC),
        (1, _) => Loc16::Reg(R16::DE),
        (2, None) => Loc16::Reg(R16::HL),
        (2, Some(idx)) => Loc16::Reg(idx.r16()),
        (3, _) => Loc16::Reg(R16::SP),
        _ => unreachable!("RP selector out of range: {code}"),
    }
}

/// RP2 selector: as RP but with AF in the last slot.
pub fn table_rp2(code: u8, prefix: Option<IndexReg>) -> Loc16 {
    match code {
        3 => Loc16::Reg(R16::AF),
        _ => table_rp(code, prefix),
    }
}

/// A branch condition over the flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Always,
    NZ,
    Z,
    NC,
    C,
    /// Parity odd (P/V clear)
    PO,
    /// Parity even (P/V set)
    PE,
    /// Sign positive
    P,
    /// Sign negative
    M,
}

/// CC selector, indexed by the y field.
pub fn table_cc(y: u8) -> Condition {
    match y {
        0 => Condition::NZ,
        1 => Condition::Z,
        2 => Condition::NC,
        3 => Condition::C,
        4 => Condition::PO,
        5 => Condition::PE,
        6 => Condition::P,
        7 => Condition::M,
        _ => unreachable!("CC selector out of range: {y}"),
    }
}

impl Condition {
    /// Position in the CC table, `None` for the unconditional form.
    pub fn cc_code(self) -> Option<u8> {
        match self {
            Condition::Always => None,
            Condition::NZ => Some(0),
            Condition::Z => Some(1),
            Condition::NC => Some(2),
            Condition::C => Some(3),
            Condition::PO => Some(4),
            Condition::PE => Some(5),
            Condition::P => Some(6),
            Condition::M => Some(7),
        }
    }

    pub fn holds(self, regs: &Registers) -> bool {
        match self {
            Condition::Always => true,
            Condition::NZ => !regs.flag(Flag::Z),
            Condition::Z => regs.flag(Flag::Z),
            Condition::NC => !regs.flag(Flag::C),
            Condition::C => regs.flag(Flag::C),
            Condition::PO => !regs.flag(Flag::PV),
            Condition::PE => regs.flag(Flag::PV),
            Condition::P => !regs.flag(Flag::S),
            Condition::M => regs.flag(Flag::S),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Condition::Always => "",
            Condition::NZ => "NZ",
            Condition::Z => "Z",
            Condition::NC => "NC",
            Condition::C => "C",
            Condition::PO => "PO",
            Condition::PE => "PE",
            Condition::P => "P",
            Condition::M => "M",
        };
        f.write_str(s)
    }
}

/// The accumulator ALU operation selected by the y field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Adc,
    Sub,
    Sbc,
    And,
    Xor,
    Or,
    Cp,
}

/// ALU selector, indexed by the y field.
pub fn table_alu(y: u8) -> AluOp {
    match y {
        0 => AluOp::Add,
        1 => AluOp::Adc,
        2 => AluOp::Sub,
        3 => AluOp::Sbc,
        4 => AluOp::And,
        5 => AluOp::Xor,
        6 => AluOp::Or,
        7 => AluOp::Cp,
        _ => unreachable!("ALU selector out of range: {y}"),
    }
}

impl AluOp {
    pub fn alu_code(self) -> u8 {
        match self {
            AluOp::Add => 0,
            AluOp::Adc => 1,
            AluOp::Sub => 2,
            AluOp::Sbc => 3,
            AluOp::And => 4,
            AluOp::Xor => 5,
            AluOp::Or => 6,
            AluOp::Cp => 7,
        }
    }

    /// Mnemonic spelling; ADD/ADC/SBC name the accumulator.
    pub fn mnemonic(self) -> &'static str {
        match self {
            AluOp::Add => "ADD A,",
            AluOp::Adc => "ADC A,",
            AluOp::Sub => "SUB",
            AluOp::Sbc => "SBC A,",
            AluOp::And => "AND",
            AluOp::Xor => "XOR",
            AluOp::Or => "OR",
            AluOp::Cp => "CP",
        }
    }
}

/// The rotate/shift operation selected by the y field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotOp {
    Rlc,
    Rrc,
    Rl,
    Rr,
    Sla,
    Sra,
    /// Undocumented shift-left filling with 1.
    Sll,
    Srl,
}

/// ROT selector, indexed by the y field.
pub fn table_rot(y: u8) -> RotOp {
    match y {
        0 => RotOp::Rlc,
        1 => RotOp::Rrc,
        2 => RotOp::Rl,
        3 => RotOp::Rr,
        4 => RotOp::Sla,
        5 => RotOp::Sra,
        6 => RotOp::Sll,
        7 => RotOp::Srl,
        _ => unreachable!("ROT selector out of range: {y}"),
    }
}

impl RotOp {
    pub fn rot_code(self) -> u8 {
        match self {
            RotOp::Rlc => 0,
            RotOp::Rrc => 1,
            RotOp::Rl => 2,
            RotOp::Rr => 3,
            RotOp::Sla => 4,
            RotOp::Sra => 5,
            RotOp::Sll => 6,
            RotOp::Srl => 7,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            RotOp::Rlc => "RLC",
            RotOp::Rrc => "RRC",
            RotOp::Rl => "RL",
            RotOp::Rr => "RR",
            RotOp::Sla => "SLA",
            RotOp::Sra => "SRA",
            RotOp::Sll => "SLL",
            RotOp::Srl => "SRL",
        }
    }
}

/// Block-instruction table, indexed by (y-4, z) of the ED page.
pub fn table_bli(a: u8, b: u8) -> EdSimple {
    use EdSimple::*;
    match (a, b) {
        (0, 0) => Ldi,
        (0, 1) => Cpi,
        (0, 2) => Ini,
        (0, 3) => Outi,
        (1, 0) => Ldd,
        (1, 1) => Cpd,
        (1, 2) => Ind,
        (1, 3) => Outd,
        (2, 0) => Ldir,
        (2, 1) => Cpir,
        (2, 2) => Inir,
        (2, 3) => Otir,
        (3, 0) => Lddr,
        (3, 1) => Cpdr,
        (3, 2) => Indr,
        (3, 3) => Otdr,
        _ => unreachable!("BLI selector out of range: ({a},{b})"),
    }
}
