//! Streaming byte → [`Instruction`] decoder.
//!
//! The decoder consumes an optional 0xDD/0xFD index prefix, an
//! optional 0xCB/0xED opcode escape (the composite DDCB/FDCB forms
//! put the displacement byte before the opcode), one opcode byte,
//! then up to two immediate bytes. Displacements are read lazily, at
//! the first R-lookup that selects slot 6, and never twice for one
//! instruction.
//!
//! An index prefix that ends up doing nothing — it is followed by
//! another prefix byte, by the ED page, or by an opcode that never
//! mentions HL, H or L — comes out as a one-byte
//! [`Instruction::IgnoredPrefix`] unit of its own, the way the chip
//! burns it as a no-op. Byte counts therefore always match the
//! re-encoding, and a chain like `DD FD 21 ..` resolves to the
//! last-prefix-wins reading one unit at a time.
//!
//! Deliberately-invalid ED slots decode as NOP with a logged warning;
//! only truncation mid-instruction is an error, and it ends the
//! stream.

use std::io::{self, Read};
use std::sync::mpsc;
use std::thread;

use log::warn;
use thiserror::Error;

use crate::inst::{EdSimple, Instruction, Simple};
use crate::loc::{IndexReg, Loc8, Loc16};
use crate::registers::{R16, R8};
use crate::tables::{
    decompose, table_alu, table_bli, table_cc, table_r, table_rot, table_rp, table_rp2, Condition,
};

#[derive(Debug, Error)]
pub enum DecodeError {
    /// The stream ended after at least one byte of an instruction.
    #[error("byte stream ended mid-instruction at offset 0x{offset:04X}")]
    Truncated { offset: u64 },
    /// The underlying reader failed.
    #[error("read failed at offset 0x{offset:04X}")]
    Io {
        offset: u64,
        #[source]
        source: io::Error,
    },
}

enum ByteEnd {
    Eof,
    Io(io::Error),
}

/// A streaming decoder over any byte source.
///
/// Iterating yields `(instruction, bytes consumed)` pairs; the
/// iterator ends at a clean end-of-input.
pub struct Decoder<R> {
    reader: R,
    /// Offset of the next unread byte, for error reporting.
    offset: u64,
    /// Bytes consumed by the instruction being decoded.
    consumed: u16,
    index: Option<IndexReg>,
    disp: Option<i8>,
    /// One byte of pushback, for a prefix superseded by the next byte.
    lookahead: Option<u8>,
    /// The instruction split off behind an ignored prefix unit.
    pending: Option<(Instruction, u16)>,
}

impl<R: Read> Decoder<R> {
    pub fn new(reader: R) -> Self {
        Decoder {
            reader,
            offset: 0,
            consumed: 0,
            index: None,
            disp: None,
            lookahead: None,
            pending: None,
        }
    }

    fn get_byte(&mut self) -> Result<u8, ByteEnd> {
        if let Some(b) = self.lookahead.take() {
            self.offset += 1;
            self.consumed = self.consumed.wrapping_add(1);
            return Ok(b);
        }
        let mut buf = [0u8; 1];
        loop {
            match self.reader.read(&mut buf) {
                Ok(0) => return Err(ByteEnd::Eof),
                Ok(_) => {
                    self.offset += 1;
                    self.consumed = self.consumed.wrapping_add(1);
                    return Ok(buf[0]);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ByteEnd::Io(e)),
            }
        }
    }

    fn unread(&mut self, byte: u8) {
        debug_assert!(self.lookahead.is_none());
        self.lookahead = Some(byte);
        self.offset -= 1;
        self.consumed -= 1;
    }

    /// A byte that must exist: EOF here is a truncated instruction.
    fn need_byte(&mut self) -> Result<u8, DecodeError> {
        self.get_byte().map_err(|end| match end {
            ByteEnd::Eof => DecodeError::Truncated {
                offset: self.offset,
            },
            ByteEnd::Io(source) => DecodeError::Io {
                offset: self.offset,
                source,
            },
        })
    }

    /// 16-bit immediate, low byte first.
    fn imm16(&mut self) -> Result<u16, DecodeError> {
        let lo = self.need_byte()?;
        let hi = self.need_byte()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    fn imm8(&mut self) -> Result<u8, DecodeError> {
        self.need_byte()
    }

    fn disp8(&mut self) -> Result<i8, DecodeError> {
        Ok(self.need_byte()? as i8)
    }

    /// Prefix-aware R lookup. Reads the displacement byte on the first
    /// slot-6 hit and caches it for the rest of the instruction.
    fn lookup_r(&mut self, code: u8) -> Result<Loc8, DecodeError> {
        if code == 6 && self.index.is_some() && self.disp.is_none() {
            let d = self.disp8()?;
            self.disp = Some(d);
        }
        Ok(table_r(code, self.index, self.disp))
    }

    fn lookup_rp(&self, code: u8) -> Loc16 {
        table_rp(code, self.index)
    }

    fn lookup_rp2(&self, code: u8) -> Loc16 {
        table_rp2(code, self.index)
    }

    /// HL, or the index pair standing in for it.
    fn hl_like(&self) -> Loc16 {
        table_rp(2, self.index)
    }

    /// Decode one instruction. `Ok(None)` is a clean end-of-input.
    pub fn decode_one(&mut self) -> Result<Option<(Instruction, u16)>, DecodeError> {
        if let Some(pair) = self.pending.take() {
            return Ok(Some(pair));
        }
        self.consumed = 0;
        self.index = None;
        self.disp = None;

        let n = match self.get_byte() {
            Ok(n) => n,
            Err(ByteEnd::Eof) => return Ok(None),
            Err(ByteEnd::Io(source)) => {
                return Err(DecodeError::Io {
                    offset: self.offset,
                    source,
                })
            }
        };

        let inst = match n {
            0xDD | 0xFD => {
                let idx = if n == 0xDD {
                    IndexReg::IX
                } else {
                    IndexReg::IY
                };
                self.index = Some(idx);
                let m = self.need_byte()?;
                match m {
                    // Another prefix (or the ED page, which the index
                    // prefix never touches) supersedes this one; the
                    // chip burns the byte as a no-op.
                    0xDD | 0xFD | 0xED => {
                        self.unread(m);
                        Instruction::IgnoredPrefix(idx)
                    }
                    0xCB => {
                        // DDCB: displacement byte comes before the
                        // opcode byte.
                        self.disp = Some(self.need_byte()? as i8);
                        let op = self.need_byte()?;
                        self.ddcb_decode(op)
                    }
                    _ => {
                        let inst = self.base_decode(m)?;
                        if inst.references_index() {
                            inst
                        } else {
                            // The opcode never mentioned HL, so the
                            // prefix did nothing: split it off as its
                            // own one-byte unit and hold the real
                            // instruction for the next call.
                            self.pending = Some((inst, self.consumed - 1));
                            Instruction::IgnoredPrefix(idx)
                        }
                    }
                }
            }
            0xCB => {
                let m = self.need_byte()?;
                self.cb_decode(m)?
            }
            0xED => {
                let m = self.need_byte()?;
                self.ed_decode(m)?
            }
            _ => self.base_decode(n)?,
        };

        let len = match inst {
            Instruction::IgnoredPrefix(_) => 1,
            _ => self.consumed,
        };
        Ok(Some((inst, len)))
    }

    fn base_decode(&mut self, n: u8) -> Result<Instruction, DecodeError> {
        use Instruction as I;
        let o = decompose(n);
        let inst = match o.x {
            0 => match o.z {
                0 => match o.y {
                    0 => I::Simple(Simple::Nop),
                    1 => I::Ex(Loc16::Reg(R16::AF), Loc16::Reg(R16::AFAlt)),
                    2 => I::Djnz(self.disp8()?),
                    3 => I::Jr(Condition::Always, self.disp8()?),
                    _ => I::Jr(table_cc(o.y - 4), self.disp8()?),
                },
                1 => {
                    if o.q == 0 {
                        let rp = self.lookup_rp(o.p);
                        I::Ld16(rp, Loc16::Imm(self.imm16()?))
                    } else {
                        I::Add16(self.hl_like(), self.lookup_rp(o.p))
                    }
                }
                2 => {
                    let a = Loc8::Reg(R8::A);
                    match (o.q, o.p) {
                        (0, 0) => I::Ld8(Loc8::RegAddr(R16::BC), a),
                        (0, 1) => I::Ld8(Loc8::RegAddr(R16::DE), a),
                        (0, 2) => I::Ld16(Loc16::ImmAddr(self.imm16()?), self.hl_like()),
                        (0, _) => I::Ld8(Loc8::ImmAddr(self.imm16()?), a),
                        (_, 0) => I::Ld8(a, Loc8::RegAddr(R16::BC)),
                        (_, 1) => I::Ld8(a, Loc8::RegAddr(R16::DE)),
                        (_, 2) => I::Ld16(self.hl_like(), Loc16::ImmAddr(self.imm16()?)),
                        (_, _) => I::Ld8(a, Loc8::ImmAddr(self.imm16()?)),
                    }
                }
                3 => {
                    if o.q == 0 {
                        I::Inc16(self.lookup_rp(o.p))
                    } else {
                        I::Dec16(self.lookup_rp(o.p))
                    }
                }
                4 => I::Inc8(self.lookup_r(o.y)?),
                5 => I::Dec8(self.lookup_r(o.y)?),
                6 => {
                    // Lookup first: an indexed displacement precedes
                    // the immediate in the byte stream.
                    let dst = self.lookup_r(o.y)?;
                    I::Ld8(dst, Loc8::Imm(self.imm8()?))
                }
                _ => {
                    let s = match o.y {
                        0 => Simple::Rlca,
                        1 => Simple::Rrca,
                        2 => Simple::Rla,
                        3 => Simple::Rra,
                        4 => Simple::Daa,
                        5 => Simple::Cpl,
                        6 => Simple::Scf,
                        _ => Simple::Ccf,
                    };
                    I::Simple(s)
                }
            },
            1 => {
                if o.z == 6 && o.y == 6 {
                    I::Simple(Simple::Halt)
                } else {
                    // With an index prefix, a displacement operand on
                    // one side leaves the other side unrewritten.
                    let mut dst = self.lookup_r(o.y)?;
                    let mut src = self.lookup_r(o.z)?;
                    if matches!(dst, Loc8::Indexed(..)) {
                        src = table_r(o.z, None, None);
                    } else if matches!(src, Loc8::Indexed(..)) {
                        dst = table_r(o.y, None, None);
                    }
                    I::Ld8(dst, src)
                }
            }
            2 => I::Alu(table_alu(o.y), self.lookup_r(o.z)?),
            _ => match o.z {
                0 => I::Ret(table_cc(o.y)),
                1 => {
                    if o.q == 0 {
                        I::Pop(self.lookup_rp2(o.p))
                    } else {
                        match o.p {
                            0 => I::Ret(Condition::Always),
                            1 => I::Simple(Simple::Exx),
                            2 => I::Jp(Condition::Always, self.hl_like()),
                            _ => I::Ld16(Loc16::Reg(R16::SP), self.hl_like()),
                        }
                    }
                }
                2 => I::Jp(table_cc(o.y), Loc16::Imm(self.imm16()?)),
                3 => match o.y {
                    0 => I::Jp(Condition::Always, Loc16::Imm(self.imm16()?)),
                    1 => unreachable!("0xCB reaches base decode only as a prefix"),
                    2 => I::Out {
                        port: Loc8::Imm(self.imm8()?),
                        src: Loc8::Reg(R8::A),
                    },
                    3 => I::In {
                        dst: Loc8::Reg(R8::A),
                        port: Loc8::Imm(self.imm8()?),
                    },
                    4 => I::Ex(Loc16::RegAddr(R16::SP), self.hl_like()),
                    // EX DE,HL is never index-rewritten.
                    5 => I::Ex(Loc16::Reg(R16::DE), Loc16::Reg(R16::HL)),
                    6 => I::Simple(Simple::Di),
                    _ => I::Simple(Simple::Ei),
                },
                4 => I::Call(table_cc(o.y), Loc16::Imm(self.imm16()?)),
                5 => {
                    if o.q == 0 {
                        I::Push(self.lookup_rp2(o.p))
                    } else {
                        match o.p {
                            0 => I::Call(Condition::Always, Loc16::Imm(self.imm16()?)),
                            _ => unreachable!(
                                "0xDD/0xED/0xFD reach base decode only as prefixes"
                            ),
                        }
                    }
                }
                6 => I::Alu(table_alu(o.y), Loc8::Imm(self.imm8()?)),
                _ => I::Rst(o.y * 8),
            },
        };
        Ok(inst)
    }

    fn cb_decode(&mut self, n: u8) -> Result<Instruction, DecodeError> {
        let o = decompose(n);
        let loc = self.lookup_r(o.z)?;
        let inst = match o.x {
            0 => Instruction::Rot {
                op: table_rot(o.y),
                loc,
                copy: None,
            },
            1 => Instruction::Bit(o.y, loc),
            2 => Instruction::Res {
                bit: o.y,
                loc,
                copy: None,
            },
            _ => Instruction::Set {
                bit: o.y,
                loc,
                copy: None,
            },
        };
        Ok(inst)
    }

    /// DDCB/FDCB page; the displacement is already cached.
    fn ddcb_decode(&mut self, n: u8) -> Instruction {
        let o = decompose(n);
        let idx = self.index.expect("DDCB decode without an index prefix");
        let loc = Loc8::Indexed(idx, self.disp.expect("DDCB decode without displacement"));
        // z other than 6 names the undocumented copy register.
        let copy = if o.z != 6 {
            Some(table_r(o.z, None, None))
        } else {
            None
        };
        match o.x {
            0 => Instruction::Rot {
                op: table_rot(o.y),
                loc,
                copy,
            },
            // BIT writes nothing back, so the copy slot is meaningless.
            1 => Instruction::Bit(o.y, loc),
            2 => Instruction::Res {
                bit: o.y,
                loc,
                copy,
            },
            _ => Instruction::Set {
                bit: o.y,
                loc,
                copy,
            },
        }
    }

    fn ed_decode(&mut self, n: u8) -> Result<Instruction, DecodeError> {
        use Instruction as I;
        let o = decompose(n);
        let hl = Loc16::Reg(R16::HL);
        let c = Loc8::Reg(R8::C);
        let inst = match o.x {
            0 | 3 => {
                warn!("invalid opcode [ED {n:02X}], treating as NOP");
                I::Simple(Simple::Nop)
            }
            1 => match o.z {
                0 => {
                    let dst = if o.y == 6 {
                        Loc8::Reg(R8::F)
                    } else {
                        self.lookup_r(o.y)?
                    };
                    I::In { dst, port: c }
                }
                1 => {
                    let src = if o.y == 6 {
                        Loc8::Imm(0)
                    } else {
                        self.lookup_r(o.y)?
                    };
                    I::Out { port: c, src }
                }
                2 => {
                    if o.q == 0 {
                        I::Sbc16(hl, self.lookup_rp(o.p))
                    } else {
                        I::Adc16(hl, self.lookup_rp(o.p))
                    }
                }
                3 => {
                    let nn = self.imm16()?;
                    if o.q == 0 {
                        I::Ld16(Loc16::ImmAddr(nn), self.lookup_rp(o.p))
                    } else {
                        I::Ld16(self.lookup_rp(o.p), Loc16::ImmAddr(nn))
                    }
                }
                4 => I::EdSimple(EdSimple::Neg),
                5 => {
                    if o.y == 1 {
                        I::EdSimple(EdSimple::Reti)
                    } else {
                        I::EdSimple(EdSimple::Retn)
                    }
                }
                6 => {
                    let im = match o.y {
                        0 | 1 | 4 | 5 => EdSimple::Im0,
                        2 | 6 => EdSimple::Im1,
                        _ => EdSimple::Im2,
                    };
                    I::EdSimple(im)
                }
                _ => match o.y {
                    0 => I::Ld8(Loc8::Reg(R8::I), Loc8::Reg(R8::A)),
                    1 => I::Ld8(Loc8::Reg(R8::R), Loc8::Reg(R8::A)),
                    2 => I::Ld8(Loc8::Reg(R8::A), Loc8::Reg(R8::I)),
                    3 => I::Ld8(Loc8::Reg(R8::A), Loc8::Reg(R8::R)),
                    4 => I::EdSimple(EdSimple::Rrd),
                    5 => I::EdSimple(EdSimple::Rld),
                    _ => {
                        warn!("invalid opcode [ED {n:02X}], treating as NOP");
                        I::Simple(Simple::Nop)
                    }
                },
            },
            _ => {
                if o.z <= 3 && o.y >= 4 {
                    I::EdSimple(table_bli(o.y - 4, o.z))
                } else {
                    warn!("invalid opcode [ED {n:02X}], treating as NOP");
                    I::Simple(Simple::Nop)
                }
            }
        };
        Ok(inst)
    }
}

impl<R: Read> Iterator for Decoder<R> {
    type Item = Result<(Instruction, u16), DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.decode_one().transpose()
    }
}

/// Decode a single instruction from the front of a reader.
pub fn decode_one<R: Read>(reader: R) -> Result<Option<(Instruction, u16)>, DecodeError> {
    Decoder::new(reader).decode_one()
}

/// Decode a whole buffer, collecting instructions and errors.
pub fn decode_bytes(buf: &[u8]) -> (Vec<Instruction>, Vec<DecodeError>) {
    let mut insts = Vec::new();
    let mut errs = Vec::new();
    let mut dec = Decoder::new(buf);
    loop {
        match dec.decode_one() {
            Ok(Some((inst, _))) => insts.push(inst),
            Ok(None) => break,
            Err(e) => {
                errs.push(e);
                break;
            }
        }
    }
    (insts, errs)
}

/// Run the decoder on its own thread, delivering instructions and
/// errors on a pair of channels.
///
/// Sends happen in source order, so for any byte position an error is
/// delivered before any later instruction. Both channels disconnect
/// together when the input ends.
pub fn decode<R: Read + Send + 'static>(
    reader: R,
) -> (mpsc::Receiver<Instruction>, mpsc::Receiver<DecodeError>) {
    let (inst_tx, inst_rx) = mpsc::channel();
    let (err_tx, err_rx) = mpsc::channel();
    thread::spawn(move || {
        let mut dec = Decoder::new(reader);
        loop {
            match dec.decode_one() {
                Ok(Some((inst, _))) => {
                    if inst_tx.send(inst).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = err_tx.send(e);
                    break;
                }
            }
        }
    });
    (inst_rx, err_rx)
}
