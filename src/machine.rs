//! Machine state and the fetch–decode–execute loop.

mod alu;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::decode::Decoder;
use crate::inst::{EdSimple, Instruction, Simple};
use crate::loc::Loc8;
use crate::memory::Memory;
use crate::ports::Ports;
use crate::registers::{Flag, Registers, R8};
use crate::tables::RotOp;

/// Outcome of executing one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Halted,
}

#[derive(Debug, Error)]
pub enum ExecError {
    /// A registered port handler failed.
    #[error("I/O handler for port 0x{port:04X} failed")]
    Io {
        port: u16,
        #[source]
        source: anyhow::Error,
    },
    /// A raw data pseudo-instruction reached the executor.
    #[error("cannot execute raw data bytes at 0x{addr:04X}")]
    Data { addr: u16 },
}

/// A cloneable handle for posting interrupt requests.
///
/// `raise` only sets a pending flag; the executor observes it at the
/// next instruction boundary. Safe to call from another thread while
/// `run` owns the machine.
#[derive(Debug, Clone, Default)]
pub struct InterruptLine(Arc<AtomicBool>);

impl InterruptLine {
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }

    fn pending(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// An inclusive address region for tracing and watching.
pub type Region = (u16, u16);

/// The whole machine: registers, memory, ports and interrupt state.
///
/// The machine is an owned value; exactly one executor drives it at a
/// time. Hosts configure it (load, handlers, regions) before calling
/// [`Machine::run`], and interact during a run only through the
/// [`InterruptLine`].
#[derive(Serialize, Deserialize)]
pub struct Machine {
    pub regs: Registers,
    pub mem: Memory,
    #[serde(skip)]
    pub ports: Ports,
    iff1: bool,
    iff2: bool,
    im: u8,
    halted: bool,
    /// Byte the (absent) peripheral would drive onto the bus during a
    /// mode-2 acknowledge.
    int_vector: u8,
    #[serde(skip)]
    int_line: InterruptLine,
    traces: Vec<Region>,
    watches: Vec<Region>,
}

impl Machine {
    pub fn new() -> Self {
        Machine {
            regs: Registers::new(),
            mem: Memory::new(),
            ports: Ports::new(),
            iff1: false,
            iff2: false,
            im: 0,
            halted: false,
            int_vector: 0xFF,
            int_line: InterruptLine::default(),
            traces: Vec::new(),
            watches: Vec::new(),
        }
    }

    // --- host-facing configuration ---

    /// Copy a flat binary image into memory at `addr`.
    pub fn load_image(&mut self, addr: u16, image: &[u8]) {
        self.mem.load(addr, image);
    }

    /// Encode instructions and write them contiguously from `addr`.
    /// Returns the address just past the last byte written.
    pub fn load(&mut self, addr: u16, insts: &[Instruction]) -> u16 {
        let mut at = addr;
        for inst in insts {
            for b in inst.encode() {
                self.mem.write_byte(at, b);
                at = at.wrapping_add(1);
            }
        }
        at
    }

    pub fn register_input_handler(
        &mut self,
        port: u16,
        handler: impl FnMut() -> anyhow::Result<u8> + 'static,
    ) {
        self.ports.register_input(port, handler);
    }

    pub fn register_output_handler(
        &mut self,
        port: u16,
        handler: impl FnMut(u8) -> anyhow::Result<()> + 'static,
    ) {
        self.ports.register_output(port, handler);
    }

    pub fn add_trace(&mut self, region: Region) {
        self.traces.push(region);
    }

    pub fn add_watch(&mut self, region: Region) {
        self.watches.push(region);
    }

    /// Data-bus byte used to build the mode-2 vector address.
    pub fn set_interrupt_vector(&mut self, byte: u8) {
        self.int_vector = byte;
    }

    /// Handle for posting interrupts from outside the executor.
    pub fn interrupt_line(&self) -> InterruptLine {
        self.int_line.clone()
    }

    /// Post an interrupt request, observed at the next instruction
    /// boundary.
    pub fn do_interrupt(&self) {
        self.int_line.raise();
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    pub fn iff1(&self) -> bool {
        self.iff1
    }

    pub fn interrupt_mode(&self) -> u8 {
        self.im
    }

    // --- data memory access (the watch points) ---

    fn watched(&self, addr: u16) -> bool {
        self.watches.iter().any(|&(s, e)| addr >= s && addr <= e)
    }

    fn traced(&self, addr: u16) -> bool {
        self.traces.iter().any(|&(s, e)| addr >= s && addr <= e)
    }

    pub fn load8(&self, addr: u16) -> u8 {
        let v = self.mem.read_byte(addr);
        if self.watched(addr) {
            info!("watch: read  0x{addr:04X} -> 0x{v:02X}");
        }
        v
    }

    pub fn store8(&mut self, addr: u16, v: u8) {
        if self.watched(addr) {
            info!("watch: write 0x{addr:04X} <- 0x{v:02X}");
        }
        self.mem.write_byte(addr, v);
    }

    pub fn load16(&self, addr: u16) -> u16 {
        let lo = self.load8(addr);
        let hi = self.load8(addr.wrapping_add(1));
        u16::from_le_bytes([lo, hi])
    }

    pub fn store16(&mut self, addr: u16, v: u16) {
        let [lo, hi] = v.to_le_bytes();
        self.store8(addr, lo);
        self.store8(addr.wrapping_add(1), hi);
    }

    // --- control-flow primitives ---

    pub fn jp(&mut self, addr: u16) {
        self.regs.pc = addr;
    }

    /// Relative jump; PC has already advanced past the instruction.
    pub fn jr(&mut self, d: i8) {
        self.regs.pc = self.regs.pc.wrapping_add(d as i16 as u16);
    }

    pub fn push(&mut self, v: u16) {
        self.regs.sp = self.regs.sp.wrapping_sub(2);
        self.store16(self.regs.sp, v);
    }

    pub fn pop(&mut self) -> u16 {
        let v = self.load16(self.regs.sp);
        self.regs.sp = self.regs.sp.wrapping_add(2);
        v
    }

    pub fn call(&mut self, addr: u16) {
        let pc = self.regs.pc;
        self.push(pc);
        self.jp(addr);
    }

    pub fn ret(&mut self) {
        let addr = self.pop();
        self.jp(addr);
    }

    // --- the loop ---

    /// Fetch, decode and execute one instruction, servicing a pending
    /// interrupt at the boundary first.
    pub fn step(&mut self) -> Result<Step, ExecError> {
        if self.int_line.take() && self.iff1 {
            self.accept_interrupt();
        }
        if self.halted {
            return Ok(Step::Halted);
        }

        let pc = self.regs.pc;
        let (inst, len) = match Decoder::new(self.mem.cursor_at(pc)).decode_one() {
            Ok(Some(pair)) => pair,
            Ok(None) | Err(_) => unreachable!("the memory cursor neither ends nor fails"),
        };
        self.regs.pc = pc.wrapping_add(len);
        self.regs.refresh();

        if self.traced(pc) {
            info!("0x{pc:04X}  {inst}");
            info!("        {}", self.regs);
        }

        let step = self.execute(&inst)?;
        if step == Step::Halted {
            // Hold PC on the HALT byte until an interrupt arrives.
            self.halted = true;
            self.regs.pc = pc;
        }
        Ok(step)
    }

    /// Execute from the current PC until HALT, returning the final
    /// value of A.
    ///
    /// With interrupts enabled the machine idles on a HALT until the
    /// interrupt line is raised; with them disabled HALT is terminal.
    pub fn run(&mut self) -> Result<u8, ExecError> {
        loop {
            match self.step()? {
                Step::Continue => {}
                Step::Halted => {
                    if self.iff1 {
                        if !self.int_line.pending() {
                            std::thread::yield_now();
                        }
                    } else {
                        return Ok(self.regs.a);
                    }
                }
            }
        }
    }

    fn accept_interrupt(&mut self) {
        self.iff1 = false;
        self.iff2 = false;
        if self.halted {
            // resume past the HALT byte
            self.halted = false;
            self.regs.pc = self.regs.pc.wrapping_add(1);
        }
        let pc = self.regs.pc;
        self.push(pc);
        match self.im {
            2 => {
                let table = ((self.regs.i as u16) << 8) | self.int_vector as u16;
                let target = self.load16(table);
                self.jp(target);
            }
            // mode 0 is serviced like mode 1: an undriven bus reads
            // 0xFF, which is RST 38h
            _ => self.jp(0x0038),
        }
    }

    // --- instruction dispatch ---

    pub fn execute(&mut self, inst: &Instruction) -> Result<Step, ExecError> {
        use Instruction as I;
        match inst {
            I::Ld8(dst, src) => {
                let v = src.read(self);
                dst.write(self, v);
                // LD A,I and LD A,R additionally report IFF2 through P/V
                if *dst == Loc8::Reg(R8::A)
                    && matches!(src, Loc8::Reg(R8::I) | Loc8::Reg(R8::R))
                {
                    self.regs.set_flag(Flag::S, v & 0x80 != 0);
                    self.regs.set_flag(Flag::Z, v == 0);
                    self.regs.set_flag(Flag::H, false);
                    self.regs.set_flag(Flag::N, false);
                    let iff2 = self.iff2;
                    self.regs.set_flag(Flag::PV, iff2);
                }
            }
            I::Ld16(dst, src) => {
                let v = src.read(self);
                dst.write(self, v);
            }
            I::Inc8(l) => {
                let v = l.read(self);
                let r = self.alu_inc8(v);
                l.write(self, r);
            }
            I::Dec8(l) => {
                let v = l.read(self);
                let r = self.alu_dec8(v);
                l.write(self, r);
            }
            I::Inc16(l) => {
                let v = l.read(self);
                l.write(self, v.wrapping_add(1));
            }
            I::Dec16(l) => {
                let v = l.read(self);
                l.write(self, v.wrapping_sub(1));
            }
            I::Add16(dst, src) => {
                let a = dst.read(self);
                let b = src.read(self);
                let r = self.alu_add16(a, b);
                dst.write(self, r);
            }
            I::Adc16(dst, src) => {
                let a = dst.read(self);
                let b = src.read(self);
                let r = self.alu_adc16(a, b);
                dst.write(self, r);
            }
            I::Sbc16(dst, src) => {
                let a = dst.read(self);
                let b = src.read(self);
                let r = self.alu_sbc16(a, b);
                dst.write(self, r);
            }
            I::Ex(dst, src) => {
                let a = dst.read(self);
                let b = src.read(self);
                dst.write(self, b);
                src.write(self, a);
            }
            I::Djnz(d) => {
                let b = self.regs.b.wrapping_sub(1);
                self.regs.b = b;
                if b != 0 {
                    self.jr(*d);
                }
            }
            I::Jr(c, d) => {
                if c.holds(&self.regs) {
                    self.jr(*d);
                }
            }
            I::Jp(c, l) => {
                if c.holds(&self.regs) {
                    let addr = l.read(self);
                    self.jp(addr);
                }
            }
            I::Call(c, l) => {
                if c.holds(&self.regs) {
                    let addr = l.read(self);
                    self.call(addr);
                }
            }
            I::Ret(c) => {
                if c.holds(&self.regs) {
                    self.ret();
                }
            }
            I::Rst(addr) => {
                self.call(*addr as u16);
            }
            I::Push(l) => {
                let v = l.read(self);
                self.push(v);
            }
            I::Pop(l) => {
                let v = self.pop();
                l.write(self, v);
            }
            I::In { dst, port } => self.exec_in(dst, port)?,
            I::Out { port, src } => self.exec_out(port, src)?,
            I::Alu(op, l) => {
                let arg = l.read(self);
                self.alu_acc(*op, arg);
            }
            I::Rot { op, loc, copy } => {
                let v = loc.read(self);
                let r = self.alu_rotate(*op, v);
                loc.write(self, r);
                if let Some(c) = copy {
                    c.write(self, r);
                }
            }
            I::Bit(bit, loc) => {
                let v = loc.read(self);
                let set = v & (1 << bit) != 0;
                self.regs.set_flag(Flag::Z, !set);
                self.regs.set_flag(Flag::PV, !set);
                self.regs.set_flag(Flag::S, *bit == 7 && set);
                self.regs.set_flag(Flag::H, true);
                self.regs.set_flag(Flag::N, false);
            }
            I::Res { bit, loc, copy } => {
                let v = loc.read(self) & !(1 << bit);
                loc.write(self, v);
                if let Some(c) = copy {
                    c.write(self, v);
                }
            }
            I::Set { bit, loc, copy } => {
                let v = loc.read(self) | (1 << bit);
                loc.write(self, v);
                if let Some(c) = copy {
                    c.write(self, v);
                }
            }
            I::Simple(s) => return self.exec_simple(*s),
            I::EdSimple(s) => self.exec_ed_simple(*s)?,
            // a dangling index prefix burns a fetch and does nothing
            I::IgnoredPrefix(_) => {}
            I::Data(_) => {
                return Err(ExecError::Data {
                    addr: self.regs.pc,
                })
            }
        }
        Ok(Step::Continue)
    }

    fn exec_simple(&mut self, s: Simple) -> Result<Step, ExecError> {
        match s {
            Simple::Nop => {}
            Simple::Halt => return Ok(Step::Halted),
            Simple::Rlca => self.alu_rotate_a(RotOp::Rlc),
            Simple::Rrca => self.alu_rotate_a(RotOp::Rrc),
            Simple::Rla => self.alu_rotate_a(RotOp::Rl),
            Simple::Rra => self.alu_rotate_a(RotOp::Rr),
            Simple::Daa => self.alu_daa(),
            Simple::Cpl => {
                self.regs.a = !self.regs.a;
                self.regs.set_flag(Flag::H, true);
                self.regs.set_flag(Flag::N, true);
            }
            Simple::Scf => {
                self.regs.set_flag(Flag::C, true);
                self.regs.set_flag(Flag::H, false);
                self.regs.set_flag(Flag::N, false);
            }
            Simple::Ccf => {
                let c = self.regs.flag(Flag::C);
                self.regs.set_flag(Flag::H, c);
                self.regs.set_flag(Flag::C, !c);
                self.regs.set_flag(Flag::N, false);
            }
            Simple::Exx => self.regs.exx(),
            Simple::Di => {
                self.iff1 = false;
                self.iff2 = false;
            }
            Simple::Ei => {
                self.iff1 = true;
                self.iff2 = true;
            }
        }
        Ok(Step::Continue)
    }

    fn exec_ed_simple(&mut self, s: EdSimple) -> Result<(), ExecError> {
        match s {
            EdSimple::Neg => {
                let a = self.regs.a;
                self.regs.a = self.alu_sub8(0, a, false);
            }
            EdSimple::Retn | EdSimple::Reti => {
                self.ret();
                self.iff1 = self.iff2;
            }
            EdSimple::Im0 => self.im = 0,
            EdSimple::Im1 => self.im = 1,
            EdSimple::Im2 => self.im = 2,
            EdSimple::Rrd => self.alu_rrd(),
            EdSimple::Rld => self.alu_rld(),
            EdSimple::Ldi => self.block_ld(1),
            EdSimple::Ldd => self.block_ld(-1),
            EdSimple::Ldir => loop {
                self.block_ld(1);
                if self.regs.bc() == 0 {
                    break;
                }
            },
            EdSimple::Lddr => loop {
                self.block_ld(-1);
                if self.regs.bc() == 0 {
                    break;
                }
            },
            EdSimple::Cpi => self.block_cp(1),
            EdSimple::Cpd => self.block_cp(-1),
            EdSimple::Cpir => loop {
                self.block_cp(1);
                if self.regs.bc() == 0 || self.regs.flag(Flag::Z) {
                    break;
                }
            },
            EdSimple::Cpdr => loop {
                self.block_cp(-1);
                if self.regs.bc() == 0 || self.regs.flag(Flag::Z) {
                    break;
                }
            },
            EdSimple::Ini => self.block_in(1)?,
            EdSimple::Ind => self.block_in(-1)?,
            EdSimple::Inir => loop {
                self.block_in(1)?;
                if self.regs.b == 0 {
                    break;
                }
            },
            EdSimple::Indr => loop {
                self.block_in(-1)?;
                if self.regs.b == 0 {
                    break;
                }
            },
            EdSimple::Outi => self.block_out(1)?,
            EdSimple::Outd => self.block_out(-1)?,
            EdSimple::Otir => loop {
                self.block_out(1)?;
                if self.regs.b == 0 {
                    break;
                }
            },
            EdSimple::Otdr => loop {
                self.block_out(-1)?;
                if self.regs.b == 0 {
                    break;
                }
            },
        }
        Ok(())
    }

    // --- I/O ---

    /// Split-bus port address: the C-indirect forms put B on the upper
    /// half, the immediate forms put A there.
    fn port_addr(&mut self, port: &Loc8) -> u16 {
        match port {
            Loc8::Reg(R8::C) => self.regs.bc(),
            _ => {
                let lo = port.read(self);
                ((self.regs.a as u16) << 8) | lo as u16
            }
        }
    }

    fn exec_in(&mut self, dst: &Loc8, port: &Loc8) -> Result<(), ExecError> {
        let addr = self.port_addr(port);
        let v = self
            .ports
            .input(addr)
            .map_err(|source| ExecError::Io { port: addr, source })?;
        let c_form = *port == Loc8::Reg(R8::C);
        // IN F,(C) only samples the bus into the flags
        if *dst != Loc8::Reg(R8::F) {
            dst.write(self, v);
        }
        if c_form {
            self.set_szp(v);
            self.regs.set_flag(Flag::H, false);
            self.regs.set_flag(Flag::N, false);
        }
        Ok(())
    }

    fn exec_out(&mut self, port: &Loc8, src: &Loc8) -> Result<(), ExecError> {
        let addr = self.port_addr(port);
        let v = src.read(self);
        self.ports
            .output(addr, v)
            .map_err(|source| ExecError::Io { port: addr, source })?;
        Ok(())
    }

    // --- block instructions ---

    fn block_ld(&mut self, dir: i16) {
        let hl = self.regs.hl();
        let de = self.regs.de();
        let v = self.load8(hl);
        self.store8(de, v);
        self.regs.set_hl(hl.wrapping_add(dir as u16));
        self.regs.set_de(de.wrapping_add(dir as u16));
        let bc = self.regs.bc().wrapping_sub(1);
        self.regs.set_bc(bc);
        self.regs.set_flag(Flag::H, false);
        self.regs.set_flag(Flag::N, false);
        self.regs.set_flag(Flag::PV, bc != 0);
    }

    fn block_cp(&mut self, dir: i16) {
        let hl = self.regs.hl();
        let v = self.load8(hl);
        let a = self.regs.a;
        let r = a.wrapping_sub(v);
        self.regs.set_hl(hl.wrapping_add(dir as u16));
        let bc = self.regs.bc().wrapping_sub(1);
        self.regs.set_bc(bc);
        self.regs.set_flag(Flag::S, r & 0x80 != 0);
        self.regs.set_flag(Flag::Z, r == 0);
        self.regs.set_flag(Flag::H, (a & 0x0F) < (v & 0x0F));
        self.regs.set_flag(Flag::PV, bc != 0);
        self.regs.set_flag(Flag::N, true);
    }

    fn block_in(&mut self, dir: i16) -> Result<(), ExecError> {
        let bc = self.regs.bc();
        let v = self
            .ports
            .input(bc)
            .map_err(|source| ExecError::Io { port: bc, source })?;
        let hl = self.regs.hl();
        self.store8(hl, v);
        self.regs.set_hl(hl.wrapping_add(dir as u16));
        let b = self.regs.b.wrapping_sub(1);
        self.regs.b = b;
        self.regs.set_flag(Flag::Z, b == 0);
        self.regs.set_flag(Flag::N, true);
        Ok(())
    }

    fn block_out(&mut self, dir: i16) -> Result<(), ExecError> {
        let b = self.regs.b.wrapping_sub(1);
        self.regs.b = b;
        let hl = self.regs.hl();
        let v = self.load8(hl);
        let bc = self.regs.bc();
        self.ports
            .output(bc, v)
            .map_err(|source| ExecError::Io { port: bc, source })?;
        self.regs.set_hl(hl.wrapping_add(dir as u16));
        self.regs.set_flag(Flag::Z, b == 0);
        self.regs.set_flag(Flag::N, true);
        Ok(())
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}
