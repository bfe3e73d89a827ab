use std::fmt;

use crate::machine::Machine;
use crate::registers::{R16, R8};

/// One of the two index registers selected by a 0xDD/0xFD prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexReg {
    IX,
    IY,
}

impl IndexReg {
    pub fn r16(self) -> R16 {
        match self {
            IndexReg::IX => R16::IX,
            IndexReg::IY => R16::IY,
        }
    }

    /// The prefix byte that selects this register.
    pub fn prefix_byte(self) -> u8 {
        match self {
            IndexReg::IX => 0xDD,
            IndexReg::IY => 0xFD,
        }
    }
}

/// An 8-bit operand location.
///
/// Every variant can be read through a [`Machine`]; all but `Imm` can
/// be written. Writing an immediate is a producer bug and panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loc8 {
    /// A named 8-bit register.
    Reg(R8),
    /// An 8-bit immediate.
    Imm(u8),
    /// The byte at a 16-bit immediate address.
    ImmAddr(u16),
    /// The byte at the address held in BC, DE or HL.
    RegAddr(R16),
    /// The byte at IX+d or IY+d.
    Indexed(IndexReg, i8),
}

/// A 16-bit operand location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loc16 {
    /// A named 16-bit register or pair.
    Reg(R16),
    /// A 16-bit immediate.
    Imm(u16),
    /// The word at a 16-bit immediate address.
    ImmAddr(u16),
    /// The word at the address held in a register pair ((SP) in EX).
    RegAddr(R16),
}

/// How a [`Loc8`] projects into the 3-bit R selector field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RSlot {
    pub code: u8,
    pub prefix: Option<IndexReg>,
    pub disp: Option<i8>,
}

impl Loc8 {
    /// Effective memory address, if this operand lives in memory.
    pub fn addr(&self, m: &Machine) -> Option<u16> {
        match *self {
            Loc8::ImmAddr(nn) => Some(nn),
            Loc8::RegAddr(rp) => Some(m.regs.r16(rp)),
            Loc8::Indexed(idx, d) => Some(m.regs.r16(idx.r16()).wrapping_add(d as i16 as u16)),
            Loc8::Reg(_) | Loc8::Imm(_) => None,
        }
    }

    pub fn read(&self, m: &Machine) -> u8 {
        match *self {
            Loc8::Reg(r) => m.regs.r8(r),
            Loc8::Imm(n) => n,
            _ => m.load8(self.addr(m).unwrap()),
        }
    }

    /// Write through the location.
    ///
    /// # Panics
    ///
    /// Panics when the location is an immediate; only a broken
    /// instruction producer can construct such a write.
    pub fn write(&self, m: &mut Machine, v: u8) {
        match *self {
            Loc8::Reg(r) => m.regs.set_r8(r, v),
            Loc8::Imm(n) => panic!("write to 8-bit immediate {n:#04X}"),
            _ => {
                let addr = self.addr(m).unwrap();
                m.store8(addr, v);
            }
        }
    }

    /// Projection into the R selector table, when there is one.
    pub fn r_slot(&self) -> Option<RSlot> {
        let slot = |code| RSlot {
            code,
            prefix: None,
            disp: None,
        };
        match *self {
            Loc8::Reg(R8::B) => Some(slot(0)),
            Loc8::Reg(R8::C) => Some(slot(1)),
            Loc8::Reg(R8::D) => Some(slot(2)),
            Loc8::Reg(R8::E) => Some(slot(3)),
            Loc8::Reg(R8::H) => Some(slot(4)),
            Loc8::Reg(R8::L) => Some(slot(5)),
            Loc8::RegAddr(R16::HL) => Some(slot(6)),
            Loc8::Reg(R8::A) => Some(slot(7)),
            Loc8::Reg(R8::IXH) => Some(RSlot {
                code: 4,
                prefix: Some(IndexReg::IX),
                disp: None,
            }),
            Loc8::Reg(R8::IXL) => Some(RSlot {
                code: 5,
                prefix: Some(IndexReg::IX),
                disp: None,
            }),
            Loc8::Reg(R8::IYH) => Some(RSlot {
                code: 4,
                prefix: Some(IndexReg::IY),
                disp: None,
            }),
            Loc8::Reg(R8::IYL) => Some(RSlot {
                code: 5,
                prefix: Some(IndexReg::IY),
                disp: None,
            }),
            Loc8::Indexed(idx, d) => Some(RSlot {
                code: 6,
                prefix: Some(idx),
                disp: Some(d),
            }),
            _ => None,
        }
    }
}

impl Loc16 {
    pub fn read(&self, m: &Machine) -> u16 {
        match *self {
            Loc16::Reg(r) => m.regs.r16(r),
            Loc16::Imm(nn) => nn,
            Loc16::ImmAddr(nn) => m.load16(nn),
            Loc16::RegAddr(rp) => m.load16(m.regs.r16(rp)),
        }
    }

    /// Write through the location.
    ///
    /// # Panics
    ///
    /// Panics when the location is an immediate.
    pub fn write(&self, m: &mut Machine, v: u16) {
        match *self {
            Loc16::Reg(r) => m.regs.set_r16(r, v),
            Loc16::Imm(nn) => panic!("write to 16-bit immediate {nn:#06X}"),
            Loc16::ImmAddr(nn) => m.store16(nn, v),
            Loc16::RegAddr(rp) => {
                let addr = m.regs.r16(rp);
                m.store16(addr, v);
            }
        }
    }

    /// Projection into the RP selector (SP at index 3).
    pub fn rp_slot(&self) -> Option<(u8, Option<IndexReg>)> {
        match *self {
            Loc16::Reg(R16::BC) => Some((0, None)),
            Loc16::Reg(R16::DE) => Some((1, None)),
            Loc16::Reg(R16::HL) => Some((2, None)),
            Loc16::Reg(R16::IX) => Some((2, Some(IndexReg::IX))),
            Loc16::Reg(R16::IY) => Some((2, Some(IndexReg::IY))),
            Loc16::Reg(R16::SP) => Some((3, None)),
            _ => None,
        }
    }

    /// Projection into the RP2 selector (AF at index 3).
    pub fn rp2_slot(&self) -> Option<(u8, Option<IndexReg>)> {
        match *self {
            Loc16::Reg(R16::AF) => Some((3, None)),
            Loc16::Reg(R16::SP) => None,
            _ => self.rp_slot(),
        }
    }

    /// HL, or an index register standing in for it.
    pub fn is_hl_like(&self) -> bool {
        matches!(
            *self,
            Loc16::Reg(R16::HL) | Loc16::Reg(R16::IX) | Loc16::Reg(R16::IY)
        )
    }

    /// The index prefix this operand demands, if any.
    pub fn index_prefix(&self) -> Option<IndexReg> {
        match *self {
            Loc16::Reg(R16::IX) => Some(IndexReg::IX),
            Loc16::Reg(R16::IY) => Some(IndexReg::IY),
            _ => None,
        }
    }
}

impl fmt::Display for R8 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            R8::A => "A",
            R8::B => "B",
            R8::C => "C",
            R8::D => "D",
            R8::E => "E",
            R8::H => "H",
            R8::L => "L",
            R8::F => "F",
            R8::I => "I",
            R8::R => "R",
            R8::IXH => "IXH",
            R8::IXL => "IXL",
            R8::IYH => "IYH",
            R8::IYL => "IYL",
        };
        f.write_str(s)
    }
}

impl fmt::Display for R16 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            R16::AF => "AF",
            R16::BC => "BC",
            R16::DE => "DE",
            R16::HL => "HL",
            R16::SP => "SP",
            R16::IX => "IX",
            R16::IY => "IY",
            R16::AFAlt => "AF'",
        };
        f.write_str(s)
    }
}

impl fmt::Display for IndexReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IndexReg::IX => "IX",
            IndexReg::IY => "IY",
        })
    }
}

impl fmt::Display for Loc8 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Loc8::Reg(r) => write!(f, "{r}"),
            Loc8::Imm(n) => write!(f, "0x{n:02X}"),
            Loc8::ImmAddr(nn) => write!(f, "(0x{nn:04X})"),
            Loc8::RegAddr(rp) => write!(f, "({rp})"),
            Loc8::Indexed(idx, d) if d < 0 => write!(f, "({idx}-{})", -(d as i16)),
            Loc8::Indexed(idx, d) => write!(f, "({idx}+{d})"),
        }
    }
}

impl fmt::Display for Loc16 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Loc16::Reg(r) => write!(f, "{r}"),
            Loc16::Imm(nn) => write!(f, "0x{nn:04X}"),
            Loc16::ImmAddr(nn) => write!(f, "(0x{nn:04X})"),
            Loc16::RegAddr(rp) => write!(f, "({rp})"),
        }
    }
}
