//! The instruction value model and the canonical encoder.
//!
//! `Instruction` is a closed sum with one variant per mnemonic family.
//! `encode` is the inverse of the decoder on canonical forms; where a
//! form has several legal byte sequences (the ED-page LD16 alternates
//! for HL) the shorter non-ED sequence is chosen.
//!
//! Encoding an instruction whose operand shape has no byte sequence is
//! a bug in whatever produced the value, and panics.

use std::fmt;

use crate::loc::{IndexReg, Loc8, Loc16, RSlot};
use crate::registers::{R16, R8};
use crate::tables::{encode_xpqz, encode_xyz, AluOp, Condition, RotOp};

/// A decoded (or assembled) Z80 instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Ld8(Loc8, Loc8),
    Ld16(Loc16, Loc16),
    Inc8(Loc8),
    Dec8(Loc8),
    Inc16(Loc16),
    Dec16(Loc16),
    Add16(Loc16, Loc16),
    Adc16(Loc16, Loc16),
    Sbc16(Loc16, Loc16),
    Ex(Loc16, Loc16),
    Djnz(i8),
    Jr(Condition, i8),
    Jp(Condition, Loc16),
    Call(Condition, Loc16),
    Ret(Condition),
    Rst(u8),
    Push(Loc16),
    Pop(Loc16),
    In {
        dst: Loc8,
        port: Loc8,
    },
    Out {
        port: Loc8,
        src: Loc8,
    },
    /// The accumulator ALU family: ADD/ADC/SUB/SBC/AND/XOR/OR/CP.
    Alu(AluOp, Loc8),
    /// The CB rotate/shift family. `copy` is the undocumented DDCB
    /// register copy destination.
    Rot {
        op: RotOp,
        loc: Loc8,
        copy: Option<Loc8>,
    },
    Bit(u8, Loc8),
    Res {
        bit: u8,
        loc: Loc8,
        copy: Option<Loc8>,
    },
    Set {
        bit: u8,
        loc: Loc8,
        copy: Option<Loc8>,
    },
    Simple(Simple),
    EdSimple(EdSimple),
    /// A 0xDD/0xFD byte whose following opcode makes no HL, H, L or
    /// (HL) reference. The chip executes it as a one-byte no-op
    /// (NONI); modeling it as its own unit keeps byte counts exact.
    IgnoredPrefix(IndexReg),
    /// Raw bytes interleaved in assembly output; never decoded.
    Data(Vec<u8>),
}

/// Single-byte instructions with no operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Simple {
    Nop = 0x00,
    Rlca = 0x07,
    Rrca = 0x0F,
    Rla = 0x17,
    Rra = 0x1F,
    Daa = 0x27,
    Cpl = 0x2F,
    Scf = 0x37,
    Ccf = 0x3F,
    Halt = 0x76,
    Exx = 0xD9,
    Di = 0xF3,
    Ei = 0xFB,
}

impl Simple {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Simple::Nop => "NOP",
            Simple::Rlca => "RLCA",
            Simple::Rrca => "RRCA",
            Simple::Rla => "RLA",
            Simple::Rra => "RRA",
            Simple::Daa => "DAA",
            Simple::Cpl => "CPL",
            Simple::Scf => "SCF",
            Simple::Ccf => "CCF",
            Simple::Halt => "HALT",
            Simple::Exx => "EXX",
            Simple::Di => "DI",
            Simple::Ei => "EI",
        }
    }
}

/// ED-prefixed instructions with no operands, including the block
/// transfer, compare and I/O families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EdSimple {
    Neg = 0x44,
    Retn = 0x45,
    Im0 = 0x46,
    Reti = 0x4D,
    Im1 = 0x56,
    Im2 = 0x5E,
    Rrd = 0x67,
    Rld = 0x6F,
    Ldi = 0xA0,
    Cpi = 0xA1,
    Ini = 0xA2,
    Outi = 0xA3,
    Ldd = 0xA8,
    Cpd = 0xA9,
    Ind = 0xAA,
    Outd = 0xAB,
    Ldir = 0xB0,
    Cpir = 0xB1,
    Inir = 0xB2,
    Otir = 0xB3,
    Lddr = 0xB8,
    Cpdr = 0xB9,
    Indr = 0xBA,
    Otdr = 0xBB,
}

impl EdSimple {
    pub fn mnemonic(self) -> &'static str {
        match self {
            EdSimple::Neg => "NEG",
            EdSimple::Retn => "RETN",
            EdSimple::Reti => "RETI",
            EdSimple::Im0 => "IM 0",
            EdSimple::Im1 => "IM 1",
            EdSimple::Im2 => "IM 2",
            EdSimple::Rrd => "RRD",
            EdSimple::Rld => "RLD",
            EdSimple::Ldi => "LDI",
            EdSimple::Cpi => "CPI",
            EdSimple::Ini => "INI",
            EdSimple::Outi => "OUTI",
            EdSimple::Ldd => "LDD",
            EdSimple::Cpd => "CPD",
            EdSimple::Ind => "IND",
            EdSimple::Outd => "OUTD",
            EdSimple::Ldir => "LDIR",
            EdSimple::Cpir => "CPIR",
            EdSimple::Inir => "INIR",
            EdSimple::Otir => "OTIR",
            EdSimple::Lddr => "LDDR",
            EdSimple::Cpdr => "CPDR",
            EdSimple::Indr => "INDR",
            EdSimple::Otdr => "OTDR",
        }
    }
}

/// Prepend the index prefix and splice the displacement in after the
/// opcode byte. `core` starts with the opcode; immediates may follow.
fn with_index(core: Vec<u8>, prefix: Option<IndexReg>, disp: Option<i8>) -> Vec<u8> {
    debug_assert!(prefix.is_some() || disp.is_none());
    let mut out = Vec::with_capacity(core.len() + 2);
    if let Some(p) = prefix {
        out.push(p.prefix_byte());
    }
    let mut rest = core.into_iter();
    out.push(rest.next().expect("empty opcode buffer"));
    if let Some(d) = disp {
        out.push(d as u8);
    }
    out.extend(rest);
    out
}

/// Assemble a CB-page instruction, using the displacement-first DDCB
/// layout when an index prefix is present.
fn cb_page(prefix: Option<IndexReg>, disp: Option<i8>, op: u8) -> Vec<u8> {
    match prefix {
        Some(p) => vec![
            p.prefix_byte(),
            0xCB,
            disp.expect("DDCB form without displacement") as u8,
            op,
        ],
        None => vec![0xCB, op],
    }
}

/// Merge the index demands of the two R slots of a register-register
/// form, enforcing the mixed-operand rules: a displacement operand may
/// pair with plain H/L (the prefix does not rewrite the other side),
/// but index halves cannot pair with H, L or (HL), and IX cannot mix
/// with IY.
fn combine_r_slots(a: &RSlot, b: &RSlot) -> (Option<IndexReg>, Option<i8>) {
    match (a.prefix, b.prefix) {
        (None, None) => (None, None),
        (Some(p), Some(q)) => {
            if p != q {
                panic!("cannot mix IX and IY operands in one instruction");
            }
            if a.disp.is_some() || b.disp.is_some() {
                panic!("cannot mix an index half with an indexed operand");
            }
            (Some(p), None)
        }
        (Some(p), None) => {
            check_plain_side(a, b);
            (Some(p), a.disp)
        }
        (None, Some(p)) => {
            check_plain_side(b, a);
            (Some(p), b.disp)
        }
    }
}

fn check_plain_side(prefixed: &RSlot, plain: &RSlot) {
    if prefixed.disp.is_some() {
        // (IX+d) with (HL) would land on the HALT slot
        if plain.code == 6 {
            panic!("cannot pair an indexed operand with (HL)");
        }
    } else if matches!(plain.code, 4 | 5 | 6) {
        panic!("cannot pair an index half with H, L or (HL)");
    }
}

fn le_bytes(nn: u16) -> [u8; 2] {
    nn.to_le_bytes()
}

impl Instruction {
    /// Canonical byte encoding.
    ///
    /// # Panics
    ///
    /// Panics on operand shapes that have no encoding (`PUSH SP`,
    /// `ADD16` with a non-HL-like destination, and the like). Such
    /// values cannot come out of the decoder; they indicate a bug in
    /// the producer.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Instruction::Ld8(dst, src) => encode_ld8(dst, src),
            Instruction::Ld16(dst, src) => encode_ld16(dst, src),
            Instruction::Inc8(l) => encode_incdec8(l, 4),
            Instruction::Dec8(l) => encode_incdec8(l, 5),
            Instruction::Inc16(l) => encode_incdec16(l, 0),
            Instruction::Dec16(l) => encode_incdec16(l, 1),
            Instruction::Add16(dst, src) => encode_add16(dst, src),
            Instruction::Adc16(dst, src) => encode_adcsbc16(dst, src, 1),
            Instruction::Sbc16(dst, src) => encode_adcsbc16(dst, src, 0),
            Instruction::Ex(dst, src) => encode_ex(dst, src),
            Instruction::Djnz(d) => vec![encode_xyz(0, 2, 0), *d as u8],
            Instruction::Jr(c, d) => {
                let y = match c.cc_code() {
                    None => 3,
                    Some(cc) if cc < 4 => cc + 4,
                    Some(_) => panic!("JR only takes NZ/Z/NC/C: JR {c}"),
                };
                vec![encode_xyz(0, y, 0), *d as u8]
            }
            Instruction::Jp(c, l) => encode_jp(*c, l),
            Instruction::Call(c, l) => {
                let nn = match l {
                    Loc16::Imm(nn) => *nn,
                    _ => panic!("CALL target must be an immediate: CALL {l}"),
                };
                let op = match c.cc_code() {
                    None => encode_xpqz(3, 0, 1, 5),
                    Some(cc) => encode_xyz(3, cc, 4),
                };
                let [lo, hi] = le_bytes(nn);
                vec![op, lo, hi]
            }
            Instruction::Ret(c) => match c.cc_code() {
                None => vec![encode_xpqz(3, 0, 1, 1)],
                Some(cc) => vec![encode_xyz(3, cc, 0)],
            },
            Instruction::Rst(addr) => {
                if addr % 8 != 0 || *addr > 0x38 {
                    panic!("RST target must be one of the eight vectors: {addr:#04X}");
                }
                vec![encode_xyz(3, addr / 8, 7)]
            }
            Instruction::Push(l) => encode_pushpop(l, 5),
            Instruction::Pop(l) => encode_pushpop(l, 1),
            Instruction::In { dst, port } => encode_in(dst, port),
            Instruction::Out { port, src } => encode_out(port, src),
            Instruction::Alu(op, l) => encode_alu(*op, l),
            Instruction::Rot { op, loc, copy } => {
                encode_cb_writeback(0, op.rot_code(), loc, copy.as_ref())
            }
            Instruction::Bit(bit, loc) => {
                assert!(*bit <= 7, "bit index out of range: {bit}");
                let slot = loc
                    .r_slot()
                    .unwrap_or_else(|| panic!("BIT operand has no R slot: {loc}"));
                // The DDCB copy slot is meaningless for BIT; always
                // emit the canonical slot-6 form when indexed.
                let z = if slot.disp.is_some() { 6 } else { slot.code };
                cb_page(slot.prefix, slot.disp, encode_xyz(1, *bit, z))
            }
            Instruction::Res { bit, loc, copy } => {
                assert!(*bit <= 7, "bit index out of range: {bit}");
                encode_cb_writeback(2, *bit, loc, copy.as_ref())
            }
            Instruction::Set { bit, loc, copy } => {
                assert!(*bit <= 7, "bit index out of range: {bit}");
                encode_cb_writeback(3, *bit, loc, copy.as_ref())
            }
            Instruction::Simple(s) => vec![*s as u8],
            Instruction::EdSimple(s) => vec![0xED, *s as u8],
            Instruction::IgnoredPrefix(idx) => vec![idx.prefix_byte()],
            Instruction::Data(bytes) => bytes.clone(),
        }
    }

    /// Encoded length in bytes.
    pub fn encoded_len(&self) -> usize {
        self.encode().len()
    }

    /// Whether any operand names IX or IY, i.e. whether an index
    /// prefix in front of this instruction's opcode actually did
    /// something.
    pub fn references_index(&self) -> bool {
        fn l8(l: &Loc8) -> bool {
            matches!(
                l,
                Loc8::Indexed(..) | Loc8::Reg(R8::IXH | R8::IXL | R8::IYH | R8::IYL)
            )
        }
        fn l16(l: &Loc16) -> bool {
            matches!(
                l,
                Loc16::Reg(R16::IX | R16::IY) | Loc16::RegAddr(R16::IX | R16::IY)
            )
        }
        match self {
            Instruction::Ld8(a, b) => l8(a) || l8(b),
            Instruction::Ld16(a, b)
            | Instruction::Add16(a, b)
            | Instruction::Adc16(a, b)
            | Instruction::Sbc16(a, b)
            | Instruction::Ex(a, b) => l16(a) || l16(b),
            Instruction::Inc8(l) | Instruction::Dec8(l) => l8(l),
            Instruction::Inc16(l)
            | Instruction::Dec16(l)
            | Instruction::Push(l)
            | Instruction::Pop(l)
            | Instruction::Jp(_, l)
            | Instruction::Call(_, l) => l16(l),
            Instruction::In { dst, port } => l8(dst) || l8(port),
            Instruction::Out { port, src } => l8(port) || l8(src),
            Instruction::Alu(_, l) | Instruction::Bit(_, l) => l8(l),
            Instruction::Rot { loc, copy, .. }
            | Instruction::Res { loc, copy, .. }
            | Instruction::Set { loc, copy, .. } => {
                l8(loc) || copy.as_ref().map_or(false, l8)
            }
            _ => false,
        }
    }
}

fn encode_ld8(dst: &Loc8, src: &Loc8) -> Vec<u8> {
    use Loc8::*;
    // ED-page register transfers involving I and R
    match (dst, src) {
        (Reg(R8::I), Reg(R8::A)) => return vec![0xED, 0x47],
        (Reg(R8::R), Reg(R8::A)) => return vec![0xED, 0x4F],
        (Reg(R8::A), Reg(R8::I)) => return vec![0xED, 0x57],
        (Reg(R8::A), Reg(R8::R)) => return vec![0xED, 0x5F],
        _ => {}
    }

    // Stores of A through BC/DE/(nn)
    match (dst, src) {
        (RegAddr(R16::BC), Reg(R8::A)) => return vec![encode_xpqz(0, 0, 0, 2)],
        (RegAddr(R16::DE), Reg(R8::A)) => return vec![encode_xpqz(0, 1, 0, 2)],
        (ImmAddr(nn), Reg(R8::A)) => {
            let [lo, hi] = le_bytes(*nn);
            return vec![encode_xpqz(0, 3, 0, 2), lo, hi];
        }
        _ => {}
    }

    let dslot = dst
        .r_slot()
        .unwrap_or_else(|| panic!("LD destination has no encoding: LD {dst}, {src}"));

    match src {
        Reg(_) | RegAddr(R16::HL) | Indexed(..) => {
            let sslot = src
                .r_slot()
                .unwrap_or_else(|| panic!("LD source has no encoding: LD {dst}, {src}"));
            if dslot.code == 6 && sslot.code == 6 {
                panic!("LD (HL), (HL) does not exist");
            }
            let (prefix, disp) = combine_r_slots(&dslot, &sslot);
            with_index(
                vec![encode_xyz(1, dslot.code, sslot.code)],
                prefix,
                disp,
            )
        }
        Imm(n) => {
            let mut buf = with_index(
                vec![encode_xyz(0, dslot.code, 6)],
                dslot.prefix,
                dslot.disp,
            );
            buf.push(*n);
            buf
        }
        RegAddr(R16::BC) if *dst == Reg(R8::A) => vec![encode_xpqz(0, 0, 1, 2)],
        RegAddr(R16::DE) if *dst == Reg(R8::A) => vec![encode_xpqz(0, 1, 1, 2)],
        ImmAddr(nn) if *dst == Reg(R8::A) => {
            let [lo, hi] = le_bytes(*nn);
            vec![encode_xpqz(0, 3, 1, 2), lo, hi]
        }
        _ => panic!("LD operand shape has no encoding: LD {dst}, {src}"),
    }
}

fn encode_ld16(dst: &Loc16, src: &Loc16) -> Vec<u8> {
    if let Loc16::ImmAddr(nn) = dst {
        let [lo, hi] = le_bytes(*nn);
        // LD (nn), HL has a base and an ED encoding; emit the base one.
        if src.is_hl_like() {
            return with_index(
                vec![encode_xpqz(0, 2, 0, 2), lo, hi],
                src.index_prefix(),
                None,
            );
        }
        let (p, prefix) = src
            .rp_slot()
            .unwrap_or_else(|| panic!("LD (nn) source has no encoding: LD {dst}, {src}"));
        debug_assert!(prefix.is_none());
        return vec![0xED, encode_xpqz(1, p, 0, 3), lo, hi];
    }

    let (dp, dprefix) = dst
        .rp_slot()
        .unwrap_or_else(|| panic!("LD destination has no encoding: LD {dst}, {src}"));

    match src {
        Loc16::Imm(nn) => {
            let [lo, hi] = le_bytes(*nn);
            with_index(vec![encode_xpqz(0, dp, 0, 1), lo, hi], dprefix, None)
        }
        Loc16::ImmAddr(nn) => {
            let [lo, hi] = le_bytes(*nn);
            if dst.is_hl_like() {
                with_index(vec![encode_xpqz(0, 2, 1, 2), lo, hi], dprefix, None)
            } else {
                vec![0xED, encode_xpqz(1, dp, 1, 3), lo, hi]
            }
        }
        _ if src.is_hl_like() => {
            if !matches!(dst, Loc16::Reg(R16::SP)) {
                panic!("only SP can be loaded from an HL-like pair: LD {dst}, {src}");
            }
            with_index(vec![encode_xpqz(3, 3, 1, 1)], src.index_prefix(), None)
        }
        _ => panic!("LD operand shape has no encoding: LD {dst}, {src}"),
    }
}

fn encode_incdec8(l: &Loc8, z: u8) -> Vec<u8> {
    let slot = l
        .r_slot()
        .unwrap_or_else(|| panic!("INC/DEC operand has no R slot: {l}"));
    with_index(vec![encode_xyz(0, slot.code, z)], slot.prefix, slot.disp)
}

fn encode_incdec16(l: &Loc16, q: u8) -> Vec<u8> {
    let (p, prefix) = l
        .rp_slot()
        .unwrap_or_else(|| panic!("INC/DEC operand has no RP slot: {l}"));
    with_index(vec![encode_xpqz(0, p, q, 3)], prefix, None)
}

fn encode_add16(dst: &Loc16, src: &Loc16) -> Vec<u8> {
    if !dst.is_hl_like() {
        panic!("ADD16 destination must be HL-like: ADD {dst}, {src}");
    }
    let prefix = dst.index_prefix();
    let (p, sprefix) = src
        .rp_slot()
        .unwrap_or_else(|| panic!("ADD16 source has no RP slot: ADD {dst}, {src}"));
    // Slot 2 names the destination pair itself; anything else must be
    // an unprefixed pair.
    if p == 2 {
        if sprefix != prefix {
            panic!("ADD16 cannot mix HL with an index register: ADD {dst}, {src}");
        }
    } else if sprefix.is_some() {
        panic!("ADD16 source cannot carry an index prefix: ADD {dst}, {src}");
    }
    with_index(vec![encode_xpqz(0, p, 1, 1)], prefix, None)
}

fn encode_adcsbc16(dst: &Loc16, src: &Loc16, q: u8) -> Vec<u8> {
    if !matches!(dst, Loc16::Reg(R16::HL)) {
        panic!("16-bit carry arithmetic only targets HL: {dst}");
    }
    let (p, prefix) = src
        .rp_slot()
        .unwrap_or_else(|| panic!("16-bit carry arithmetic source has no RP slot: {src}"));
    if prefix.is_some() {
        panic!("16-bit carry arithmetic source cannot be an index register: {src}");
    }
    vec![0xED, encode_xpqz(1, p, q, 2)]
}

fn encode_ex(dst: &Loc16, src: &Loc16) -> Vec<u8> {
    match (dst, src) {
        (Loc16::Reg(R16::AF), Loc16::Reg(R16::AFAlt)) => vec![0x08],
        (Loc16::RegAddr(R16::SP), _) if src.is_hl_like() => {
            with_index(vec![encode_xyz(3, 4, 3)], src.index_prefix(), None)
        }
        // EX DE,HL never takes an index prefix.
        (Loc16::Reg(R16::DE), Loc16::Reg(R16::HL)) => vec![encode_xyz(3, 5, 3)],
        _ => panic!("EX operand shape has no encoding: EX {dst}, {src}"),
    }
}

fn encode_jp(c: Condition, l: &Loc16) -> Vec<u8> {
    if c == Condition::Always && l.is_hl_like() {
        return with_index(vec![encode_xpqz(3, 2, 1, 1)], l.index_prefix(), None);
    }
    let nn = match l {
        Loc16::Imm(nn) => *nn,
        _ => panic!("JP target must be an immediate or an HL-like pair: JP {l}"),
    };
    let op = match c.cc_code() {
        None => encode_xyz(3, 0, 3),
        Some(cc) => encode_xyz(3, cc, 2),
    };
    let [lo, hi] = le_bytes(nn);
    vec![op, lo, hi]
}

fn encode_pushpop(l: &Loc16, z: u8) -> Vec<u8> {
    let (p, prefix) = l
        .rp2_slot()
        .unwrap_or_else(|| panic!("PUSH/POP operand has no RP2 slot: {l}"));
    with_index(vec![encode_xpqz(3, p, 0, z)], prefix, None)
}

fn encode_in(dst: &Loc8, port: &Loc8) -> Vec<u8> {
    match port {
        Loc8::Imm(n) => {
            if *dst != Loc8::Reg(R8::A) {
                panic!("IN from an immediate port only targets A: IN {dst}, ({port})");
            }
            vec![encode_xyz(3, 3, 3), *n]
        }
        Loc8::Reg(R8::C) => {
            let y = match dst {
                Loc8::Reg(R8::F) => 6,
                _ => {
                    let slot = dst
                        .r_slot()
                        .unwrap_or_else(|| panic!("IN destination has no R slot: {dst}"));
                    if slot.prefix.is_some() || slot.code == 6 {
                        panic!("IN destination must be a plain register: {dst}");
                    }
                    slot.code
                }
            };
            vec![0xED, encode_xyz(1, y, 0)]
        }
        _ => panic!("IN port must be C or an immediate: ({port})"),
    }
}

fn encode_out(port: &Loc8, src: &Loc8) -> Vec<u8> {
    match port {
        Loc8::Imm(n) => {
            if *src != Loc8::Reg(R8::A) {
                panic!("OUT to an immediate port only sources A: OUT ({port}), {src}");
            }
            vec![encode_xyz(3, 2, 3), *n]
        }
        Loc8::Reg(R8::C) => {
            // OUT (C),0 is the documented-undocumented slot-6 form.
            if *src == Loc8::Imm(0) {
                return vec![0xED, encode_xyz(1, 6, 1)];
            }
            let slot = src
                .r_slot()
                .unwrap_or_else(|| panic!("OUT source has no R slot: {src}"));
            if slot.prefix.is_some() || slot.code == 6 {
                panic!("OUT source must be a plain register: {src}");
            }
            vec![0xED, encode_xyz(1, slot.code, 1)]
        }
        _ => panic!("OUT port must be C or an immediate: ({port})"),
    }
}

fn encode_alu(op: AluOp, l: &Loc8) -> Vec<u8> {
    match l {
        Loc8::Imm(n) => vec![encode_xyz(3, op.alu_code(), 6), *n],
        _ => {
            let slot = l
                .r_slot()
                .unwrap_or_else(|| panic!("ALU operand has no encoding: {} {l}", op.mnemonic()));
            with_index(
                vec![encode_xyz(2, op.alu_code(), slot.code)],
                slot.prefix,
                slot.disp,
            )
        }
    }
}

/// CB-page forms that write back: rotates and RES/SET, with the
/// optional DDCB copy register in the z field.
fn encode_cb_writeback(x: u8, y: u8, loc: &Loc8, copy: Option<&Loc8>) -> Vec<u8> {
    let slot = loc
        .r_slot()
        .unwrap_or_else(|| panic!("CB operand has no R slot: {loc}"));
    let z = match copy {
        None => slot.code,
        Some(c) => {
            if slot.disp.is_none() {
                panic!("copy destination requires an indexed operand: {loc}, {c}");
            }
            let cslot = c
                .r_slot()
                .filter(|s| s.prefix.is_none() && s.code != 6)
                .unwrap_or_else(|| panic!("copy destination must be a plain register: {c}"));
            cslot.code
        }
    };
    cb_page(slot.prefix, slot.disp, encode_xyz(x, y, z))
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Ld8(dst, src) => write!(f, "LD {dst}, {src}"),
            Instruction::Ld16(dst, src) => write!(f, "LD {dst}, {src}"),
            Instruction::Inc8(l) => write!(f, "INC {l}"),
            Instruction::Dec8(l) => write!(f, "DEC {l}"),
            Instruction::Inc16(l) => write!(f, "INC {l}"),
            Instruction::Dec16(l) => write!(f, "DEC {l}"),
            Instruction::Add16(dst, src) => write!(f, "ADD {dst}, {src}"),
            Instruction::Adc16(dst, src) => write!(f, "ADC {dst}, {src}"),
            Instruction::Sbc16(dst, src) => write!(f, "SBC {dst}, {src}"),
            Instruction::Ex(dst, src) => write!(f, "EX {dst}, {src}"),
            Instruction::Djnz(d) => write!(f, "DJNZ {d}"),
            Instruction::Jr(Condition::Always, d) => write!(f, "JR {d}"),
            Instruction::Jr(c, d) => write!(f, "JR {c}, {d}"),
            Instruction::Jp(Condition::Always, l) => write!(f, "JP {l}"),
            Instruction::Jp(c, l) => write!(f, "JP {c}, {l}"),
            Instruction::Call(Condition::Always, l) => write!(f, "CALL {l}"),
            Instruction::Call(c, l) => write!(f, "CALL {c}, {l}"),
            Instruction::Ret(Condition::Always) => write!(f, "RET"),
            Instruction::Ret(c) => write!(f, "RET {c}"),
            Instruction::Rst(addr) => write!(f, "RST 0x{addr:02X}"),
            Instruction::Push(l) => write!(f, "PUSH {l}"),
            Instruction::Pop(l) => write!(f, "POP {l}"),
            Instruction::In { dst, port } => write!(f, "IN {dst}, ({port})"),
            Instruction::Out { port, src } => write!(f, "OUT ({port}), {src}"),
            Instruction::Alu(op, l) => write!(f, "{} {l}", op.mnemonic()),
            Instruction::Rot { op, loc, copy } => {
                write!(f, "{} {loc}", op.mnemonic())?;
                if let Some(c) = copy {
                    write!(f, ", {c}")?;
                }
                Ok(())
            }
            Instruction::Bit(bit, loc) => write!(f, "BIT {bit}, {loc}"),
            Instruction::Res { bit, loc, copy } => {
                write!(f, "RES {bit}, {loc}")?;
                if let Some(c) = copy {
                    write!(f, ", {c}")?;
                }
                Ok(())
            }
            Instruction::Set { bit, loc, copy } => {
                write!(f, "SET {bit}, {loc}")?;
                if let Some(c) = copy {
                    write!(f, ", {c}")?;
                }
                Ok(())
            }
            Instruction::Simple(s) => f.write_str(s.mnemonic()),
            Instruction::EdSimple(s) => f.write_str(s.mnemonic()),
            Instruction::IgnoredPrefix(_) => f.write_str("NONI"),
            Instruction::Data(bytes) => {
                f.write_str("DB")?;
                for b in bytes {
                    write!(f, " {b:02X}")?;
                }
                Ok(())
            }
        }
    }
}
