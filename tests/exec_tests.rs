//! Interpreter behavior: the literal execution scenarios, the flag
//! contracts over every operand value, block operations, I/O port
//! address derivation and interrupt handling.

use std::cell::RefCell;
use std::rc::Rc;

use z80rs::inst::{EdSimple, Instruction, Simple};
use z80rs::loc::{IndexReg, Loc8, Loc16};
use z80rs::machine::{Machine, Step};
use z80rs::registers::{Flag, R16, R8};
use z80rs::tables::{AluOp, Condition, RotOp};

fn machine_with(bytes: &[u8]) -> Machine {
    let mut m = Machine::new();
    m.load_image(0x0000, bytes);
    m
}

#[test]
fn scenario_store_fetch_add() {
    // LD HL,0x0100; LD (HL),0xFF; LD B,(HL); LD (HL),0x02;
    // LD A,(HL); ADD A,B; HALT
    let prog = [
        0x21, 0x00, 0x01, 0x36, 0xFF, 0x46, 0x36, 0x02, 0x7E, 0x80, 0x76,
    ];
    let mut m = machine_with(&prog);
    let a = m.run().expect("run failed");
    assert_eq!(a, 0x01);
    assert!(m.regs.flag(Flag::C));
    assert!(!m.regs.flag(Flag::Z));
    assert_eq!(m.mem.read_byte(0x0100), 0x02);
    assert_eq!(m.regs.b, 0xFF);
}

#[test]
fn scenario_add_a_c() {
    // ADD A,C; HALT with A=0x22, C=0x11
    let insts = [
        Instruction::Alu(AluOp::Add, Loc8::Reg(R8::C)),
        Instruction::Simple(Simple::Halt),
    ];
    let bytes: Vec<u8> = insts.iter().flat_map(|i| i.encode()).collect();
    assert_eq!(bytes, vec![0x81, 0x76]);

    let mut m = Machine::new();
    m.load(0x0000, &insts);
    m.regs.a = 0x22;
    m.regs.c = 0x11;
    let a = m.run().unwrap();
    assert_eq!(a, 0x33);
    assert!(!m.regs.flag(Flag::C));
    assert!(!m.regs.flag(Flag::Z));
}

#[test]
fn pc_advances_by_decoded_length_and_halt_holds_pc() {
    let mut m = machine_with(&[0x21, 0x00, 0x01, 0x76]);
    assert_eq!(m.step().unwrap(), Step::Continue);
    assert_eq!(m.regs.pc, 3);
    assert_eq!(m.step().unwrap(), Step::Halted);
    // PC holds on the HALT byte
    assert_eq!(m.regs.pc, 3);
}

fn alu_flags(a: u8, b: u8, op: AluOp, carry_in: bool) -> (u8, u8) {
    let mut m = Machine::new();
    m.regs.a = a;
    m.regs.set_flag(Flag::C, carry_in);
    m.execute(&Instruction::Alu(op, Loc8::Imm(b))).unwrap();
    (m.regs.a, m.regs.f)
}

fn flag(f: u8, which: Flag) -> bool {
    let shift = match which {
        Flag::S => 7,
        Flag::Z => 6,
        Flag::Y => 5,
        Flag::H => 4,
        Flag::X => 3,
        Flag::PV => 2,
        Flag::N => 1,
        Flag::C => 0,
    };
    (f >> shift) & 1 != 0
}

#[test]
fn add_adc_flag_contract_for_all_operands() {
    for a in 0..=255u8 {
        for b in 0..=255u8 {
            for carry_in in [false, true] {
                let op = if carry_in { AluOp::Adc } else { AluOp::Add };
                let cin = carry_in as u16;
                let (r, f) = alu_flags(a, b, op, carry_in);
                let wide = a as u16 + b as u16 + cin;
                assert_eq!(r, wide as u8);
                assert_eq!(flag(f, Flag::C), wide > 0xFF, "C for {a:02X}+{b:02X}");
                assert_eq!(flag(f, Flag::Z), wide as u8 == 0);
                assert_eq!(flag(f, Flag::S), wide as u8 & 0x80 != 0);
                assert_eq!(
                    flag(f, Flag::H),
                    (a & 0x0F) + (b & 0x0F) + cin as u8 > 0x0F,
                    "H for {a:02X}+{b:02X}"
                );
                let signed = (a as i8 as i16) + (b as i8 as i16) + cin as i16;
                assert_eq!(
                    flag(f, Flag::PV),
                    signed < -128 || signed > 127,
                    "PV for {a:02X}+{b:02X}"
                );
                assert!(!flag(f, Flag::N));
            }
        }
    }
}

#[test]
fn sub_sbc_cp_flag_contract_for_all_operands() {
    for a in 0..=255u8 {
        for b in 0..=255u8 {
            for (op, carry_in) in [(AluOp::Sub, false), (AluOp::Sbc, true), (AluOp::Cp, false)] {
                let cin = carry_in as i16;
                let (r, f) = alu_flags(a, b, op, carry_in);
                let wide = a as i16 - b as i16 - cin;
                if op == AluOp::Cp {
                    assert_eq!(r, a, "CP must not store");
                } else {
                    assert_eq!(r, wide as u8);
                }
                assert_eq!(flag(f, Flag::C), wide < 0, "C for {a:02X}-{b:02X}");
                assert_eq!(flag(f, Flag::Z), wide as u8 == 0);
                assert_eq!(flag(f, Flag::S), wide as u8 & 0x80 != 0);
                assert_eq!(
                    flag(f, Flag::H),
                    (a & 0x0F) as i16 - (b & 0x0F) as i16 - cin < 0
                );
                let signed = (a as i8 as i16) - (b as i8 as i16) - cin;
                assert_eq!(flag(f, Flag::PV), signed < -128 || signed > 127);
                assert!(flag(f, Flag::N));
            }
        }
    }
}

#[test]
fn logic_flag_contract_for_all_operands() {
    for a in 0..=255u8 {
        for b in [0x00, 0x0F, 0x5A, 0xA5, 0xFF, a] {
            for op in [AluOp::And, AluOp::Xor, AluOp::Or] {
                let (r, f) = alu_flags(a, b, op, true);
                let expected = match op {
                    AluOp::And => a & b,
                    AluOp::Xor => a ^ b,
                    _ => a | b,
                };
                assert_eq!(r, expected);
                assert!(!flag(f, Flag::C), "logic clears C");
                assert!(!flag(f, Flag::N));
                assert_eq!(flag(f, Flag::H), op == AluOp::And);
                assert_eq!(flag(f, Flag::Z), expected == 0);
                assert_eq!(flag(f, Flag::S), expected & 0x80 != 0);
                assert_eq!(flag(f, Flag::PV), expected.count_ones() % 2 == 0);
            }
        }
    }
}

#[test]
fn inc_dec_preserve_carry_for_all_operands() {
    for v in 0..=255u8 {
        for carry in [false, true] {
            let mut m = Machine::new();
            m.regs.b = v;
            m.regs.set_flag(Flag::C, carry);
            m.execute(&Instruction::Inc8(Loc8::Reg(R8::B))).unwrap();
            assert_eq!(m.regs.b, v.wrapping_add(1));
            assert_eq!(m.regs.flag(Flag::C), carry, "INC must preserve C");
            assert_eq!(m.regs.flag(Flag::Z), v == 0xFF);
            assert_eq!(m.regs.flag(Flag::PV), v == 0x7F);
            assert_eq!(m.regs.flag(Flag::H), v & 0x0F == 0x0F);
            assert!(!m.regs.flag(Flag::N));

            let mut m = Machine::new();
            m.regs.b = v;
            m.regs.set_flag(Flag::C, carry);
            m.execute(&Instruction::Dec8(Loc8::Reg(R8::B))).unwrap();
            assert_eq!(m.regs.b, v.wrapping_sub(1));
            assert_eq!(m.regs.flag(Flag::C), carry, "DEC must preserve C");
            assert_eq!(m.regs.flag(Flag::Z), v == 0x01);
            assert_eq!(m.regs.flag(Flag::PV), v == 0x80);
            assert_eq!(m.regs.flag(Flag::H), v & 0x0F == 0);
            assert!(m.regs.flag(Flag::N));
        }
    }
}

#[test]
fn rotate_family_carry_contract_for_all_operands() {
    use RotOp::*;
    for v in 0..=255u8 {
        for carry_in in [false, true] {
            for op in [Rlc, Rrc, Rl, Rr, Sla, Sra, Sll, Srl] {
                let mut m = Machine::new();
                m.regs.b = v;
                m.regs.set_flag(Flag::C, carry_in);
                m.execute(&Instruction::Rot {
                    op,
                    loc: Loc8::Reg(R8::B),
                    copy: None,
                })
                .unwrap();
                let cin = carry_in as u8;
                let (expected, carry_out) = match op {
                    Rlc => (v.rotate_left(1), v & 0x80 != 0),
                    Rrc => (v.rotate_right(1), v & 1 != 0),
                    Rl => ((v << 1) | cin, v & 0x80 != 0),
                    Rr => ((v >> 1) | (cin << 7), v & 1 != 0),
                    Sla => (v << 1, v & 0x80 != 0),
                    Sra => ((v >> 1) | (v & 0x80), v & 1 != 0),
                    Sll => ((v << 1) | 1, v & 0x80 != 0),
                    Srl => (v >> 1, v & 1 != 0),
                };
                assert_eq!(m.regs.b, expected, "{op:?} of {v:02X}");
                assert_eq!(m.regs.flag(Flag::C), carry_out, "{op:?} C of {v:02X}");
                assert_eq!(m.regs.flag(Flag::Z), expected == 0);
                assert_eq!(
                    m.regs.flag(Flag::PV),
                    expected.count_ones() % 2 == 0
                );
                assert!(!m.regs.flag(Flag::H));
                assert!(!m.regs.flag(Flag::N));
            }
        }
    }
}

#[test]
fn accumulator_rotates_touch_only_c_h_n() {
    let mut m = Machine::new();
    m.regs.a = 0x80;
    m.regs.f = 0b1100_0100; // S, Z, PV set
    m.execute(&Instruction::Simple(Simple::Rlca)).unwrap();
    assert_eq!(m.regs.a, 0x01);
    assert!(m.regs.flag(Flag::C));
    assert!(m.regs.flag(Flag::S) && m.regs.flag(Flag::Z) && m.regs.flag(Flag::PV));

    m.regs.a = 0x01;
    m.execute(&Instruction::Simple(Simple::Rra)).unwrap();
    // carry from RLCA shifts into bit 7
    assert_eq!(m.regs.a, 0x80);
    assert!(m.regs.flag(Flag::C));
}

#[test]
fn add16_touches_only_h_n_c() {
    let mut m = Machine::new();
    m.regs.set_hl(0x0FFF);
    m.regs.set_bc(0x0001);
    m.regs.f = 0b1100_0100; // S, Z, PV set
    m.execute(&Instruction::Add16(
        Loc16::Reg(R16::HL),
        Loc16::Reg(R16::BC),
    ))
    .unwrap();
    assert_eq!(m.regs.hl(), 0x1000);
    assert!(m.regs.flag(Flag::H));
    assert!(!m.regs.flag(Flag::C));
    assert!(m.regs.flag(Flag::S) && m.regs.flag(Flag::Z) && m.regs.flag(Flag::PV));

    m.regs.set_hl(0x8000);
    m.regs.set_de(0x8000);
    m.execute(&Instruction::Add16(
        Loc16::Reg(R16::HL),
        Loc16::Reg(R16::DE),
    ))
    .unwrap();
    assert_eq!(m.regs.hl(), 0x0000);
    assert!(m.regs.flag(Flag::C));
}

#[test]
fn adc16_sbc16_full_flags() {
    let mut m = Machine::new();
    m.regs.set_hl(0x7FFF);
    m.regs.set_bc(0x0000);
    m.regs.set_flag(Flag::C, true);
    m.execute(&Instruction::Adc16(
        Loc16::Reg(R16::HL),
        Loc16::Reg(R16::BC),
    ))
    .unwrap();
    assert_eq!(m.regs.hl(), 0x8000);
    assert!(m.regs.flag(Flag::PV), "0x7FFF + 1 overflows");
    assert!(m.regs.flag(Flag::S));
    assert!(!m.regs.flag(Flag::C));

    m.regs.set_hl(0x0000);
    m.regs.set_de(0x0001);
    m.regs.set_flag(Flag::C, false);
    m.execute(&Instruction::Sbc16(
        Loc16::Reg(R16::HL),
        Loc16::Reg(R16::DE),
    ))
    .unwrap();
    assert_eq!(m.regs.hl(), 0xFFFF);
    assert!(m.regs.flag(Flag::C));
    assert!(m.regs.flag(Flag::S));
    assert!(m.regs.flag(Flag::N));
}

#[test]
fn bit_res_set_and_the_ddcb_copy_form() {
    let mut m = Machine::new();
    m.regs.ix = 0x2000;
    m.store8(0x2005, 0b0000_0001);
    m.execute(&Instruction::Bit(0, Loc8::Indexed(IndexReg::IX, 5)))
        .unwrap();
    assert!(!m.regs.flag(Flag::Z));
    assert!(m.regs.flag(Flag::H));
    assert!(!m.regs.flag(Flag::N));
    m.execute(&Instruction::Bit(1, Loc8::Indexed(IndexReg::IX, 5)))
        .unwrap();
    assert!(m.regs.flag(Flag::Z));

    // RLC (IX+5),B writes both the memory cell and B
    m.execute(&Instruction::Rot {
        op: RotOp::Rlc,
        loc: Loc8::Indexed(IndexReg::IX, 5),
        copy: Some(Loc8::Reg(R8::B)),
    })
    .unwrap();
    assert_eq!(m.load8(0x2005), 0b0000_0010);
    assert_eq!(m.regs.b, 0b0000_0010);

    m.execute(&Instruction::Set {
        bit: 7,
        loc: Loc8::Indexed(IndexReg::IX, 5),
        copy: Some(Loc8::Reg(R8::E)),
    })
    .unwrap();
    assert_eq!(m.load8(0x2005), 0b1000_0010);
    assert_eq!(m.regs.e, 0b1000_0010);

    let f_before = m.regs.f;
    m.execute(&Instruction::Res {
        bit: 1,
        loc: Loc8::Indexed(IndexReg::IX, 5),
        copy: None,
    })
    .unwrap();
    assert_eq!(m.load8(0x2005), 0b1000_0000);
    assert_eq!(m.regs.f, f_before, "RES/SET leave flags alone");
}

#[test]
fn djnz_counts_down_without_touching_flags() {
    // LD B,3; loop: INC A; DJNZ loop; HALT
    let prog = [0x06, 0x03, 0x3C, 0x10, 0xFD, 0x76];
    let mut m = machine_with(&prog);
    m.regs.f = 0xFF;
    let a = m.run().unwrap();
    assert_eq!(a, 3);
    assert_eq!(m.regs.b, 0);
}

#[test]
fn call_ret_and_the_stack() {
    // CALL 0x0006; HALT; <pad>; INC A; RET
    let prog = [0xCD, 0x06, 0x00, 0x76, 0x00, 0x00, 0x3C, 0xC9];
    let mut m = machine_with(&prog);
    m.regs.sp = 0x8000;
    let a = m.run().unwrap();
    assert_eq!(a, 1);
    assert_eq!(m.regs.sp, 0x8000, "stack balanced");
    assert_eq!(m.regs.pc, 0x0003, "halted after the CALL");
}

#[test]
fn push_pop_are_little_endian_on_the_stack() {
    let mut m = Machine::new();
    m.regs.sp = 0x8000;
    m.regs.set_bc(0x1234);
    m.execute(&Instruction::Push(Loc16::Reg(R16::BC))).unwrap();
    assert_eq!(m.regs.sp, 0x7FFE);
    assert_eq!(m.mem.read_byte(0x7FFE), 0x34);
    assert_eq!(m.mem.read_byte(0x7FFF), 0x12);
    m.execute(&Instruction::Pop(Loc16::Reg(R16::DE))).unwrap();
    assert_eq!(m.regs.de(), 0x1234);
    assert_eq!(m.regs.sp, 0x8000);
}

#[test]
fn exchange_family() {
    let mut m = Machine::new();
    m.regs.set_hl(0x1111);
    m.regs.set_de(0x2222);
    m.execute(&Instruction::Ex(Loc16::Reg(R16::DE), Loc16::Reg(R16::HL)))
        .unwrap();
    assert_eq!(m.regs.hl(), 0x2222);
    assert_eq!(m.regs.de(), 0x1111);

    m.regs.sp = 0x8000;
    m.store16(0x8000, 0xAAAA);
    m.execute(&Instruction::Ex(
        Loc16::RegAddr(R16::SP),
        Loc16::Reg(R16::HL),
    ))
    .unwrap();
    assert_eq!(m.regs.hl(), 0xAAAA);
    assert_eq!(m.load16(0x8000), 0x2222);

    m.regs.a = 0x12;
    m.regs.f = 0x34;
    m.execute(&Instruction::Ex(
        Loc16::Reg(R16::AF),
        Loc16::Reg(R16::AFAlt),
    ))
    .unwrap();
    assert_eq!(m.regs.a, 0x00);
    m.execute(&Instruction::Ex(
        Loc16::Reg(R16::AF),
        Loc16::Reg(R16::AFAlt),
    ))
    .unwrap();
    assert_eq!((m.regs.a, m.regs.f), (0x12, 0x34));
}

#[test]
fn ldir_copies_a_block() {
    let mut m = Machine::new();
    for i in 0..5u16 {
        m.mem.write_byte(0x1000 + i, i as u8 + 1);
    }
    m.regs.set_hl(0x1000);
    m.regs.set_de(0x2000);
    m.regs.set_bc(5);
    m.execute(&Instruction::EdSimple(EdSimple::Ldir)).unwrap();
    for i in 0..5u16 {
        assert_eq!(m.mem.read_byte(0x2000 + i), i as u8 + 1);
    }
    assert_eq!(m.regs.bc(), 0);
    assert_eq!(m.regs.hl(), 0x1005);
    assert_eq!(m.regs.de(), 0x2005);
    assert!(!m.regs.flag(Flag::PV), "BC reached zero");
}

#[test]
fn cpir_stops_on_match() {
    let mut m = Machine::new();
    m.mem.write_byte(0x1000, 0x10);
    m.mem.write_byte(0x1001, 0x20);
    m.mem.write_byte(0x1002, 0x30);
    m.regs.a = 0x20;
    m.regs.set_hl(0x1000);
    m.regs.set_bc(3);
    m.execute(&Instruction::EdSimple(EdSimple::Cpir)).unwrap();
    assert_eq!(m.regs.hl(), 0x1002, "stopped just past the match");
    assert_eq!(m.regs.bc(), 1);
    assert!(m.regs.flag(Flag::Z));
    assert!(m.regs.flag(Flag::PV), "BC still non-zero");
}

#[test]
fn ldi_and_cpd_single_steps() {
    let mut m = Machine::new();
    m.mem.write_byte(0x1000, 0x42);
    m.regs.set_hl(0x1000);
    m.regs.set_de(0x2000);
    m.regs.set_bc(2);
    m.execute(&Instruction::EdSimple(EdSimple::Ldi)).unwrap();
    assert_eq!(m.mem.read_byte(0x2000), 0x42);
    assert_eq!(m.regs.bc(), 1);
    assert!(m.regs.flag(Flag::PV));

    m.regs.a = 0x42;
    m.regs.set_hl(0x1000);
    m.execute(&Instruction::EdSimple(EdSimple::Cpd)).unwrap();
    assert_eq!(m.regs.hl(), 0x0FFF);
    assert_eq!(m.regs.bc(), 0);
    assert!(m.regs.flag(Flag::Z));
    assert!(!m.regs.flag(Flag::PV));
}

#[test]
fn in_a_n_builds_port_from_a_and_n() {
    let mut m = Machine::new();
    let seen = Rc::new(RefCell::new(Vec::new()));
    m.register_input_handler(0x22FE, || Ok(0x5A));
    m.regs.a = 0x22;
    m.execute(&Instruction::In {
        dst: Loc8::Reg(R8::A),
        port: Loc8::Imm(0xFE),
    })
    .unwrap();
    assert_eq!(m.regs.a, 0x5A);

    // OUT (n),A puts A on the upper half of the bus too
    let sink = Rc::clone(&seen);
    m.register_output_handler(0x5A10, move |v| {
        sink.borrow_mut().push(v);
        Ok(())
    });
    m.execute(&Instruction::Out {
        port: Loc8::Imm(0x10),
        src: Loc8::Reg(R8::A),
    })
    .unwrap();
    assert_eq!(*seen.borrow(), vec![0x5A]);
}

#[test]
fn c_indirect_io_builds_port_from_bc_and_sets_flags() {
    let mut m = Machine::new();
    m.register_input_handler(0x1234, || Ok(0x00));
    m.regs.set_bc(0x1234);
    m.regs.set_flag(Flag::C, true);
    m.execute(&Instruction::In {
        dst: Loc8::Reg(R8::E),
        port: Loc8::Reg(R8::C),
    })
    .unwrap();
    assert_eq!(m.regs.e, 0x00);
    assert!(m.regs.flag(Flag::Z));
    assert!(m.regs.flag(Flag::PV), "zero has even parity");
    assert!(m.regs.flag(Flag::C), "IN r,(C) preserves carry");
}

#[test]
fn in_f_c_sets_flags_without_storing() {
    let mut m = Machine::new();
    m.register_input_handler(0x0100, || Ok(0x80));
    m.regs.set_bc(0x0100);
    let f_before = m.regs.f;
    m.execute(&Instruction::In {
        dst: Loc8::Reg(R8::F),
        port: Loc8::Reg(R8::C),
    })
    .unwrap();
    assert!(m.regs.flag(Flag::S));
    assert!(!m.regs.flag(Flag::Z));
    assert_ne!(m.regs.f, f_before);
}

#[test]
fn unregistered_ports_read_open_bus() {
    let mut m = Machine::new();
    m.execute(&Instruction::In {
        dst: Loc8::Reg(R8::A),
        port: Loc8::Imm(0x00),
    })
    .unwrap();
    assert_eq!(m.regs.a, 0xFF);
    // and writes are discarded
    m.execute(&Instruction::Out {
        port: Loc8::Imm(0x00),
        src: Loc8::Reg(R8::A),
    })
    .unwrap();
}

#[test]
fn failing_handler_aborts_the_run() {
    // OUT (0x10),A; HALT
    let prog = [0xD3, 0x10, 0x76];
    let mut m = machine_with(&prog);
    m.register_output_handler(0x0010, |_| anyhow::bail!("device jammed"));
    let err = m.run().unwrap_err();
    assert!(err.to_string().contains("0x0010"));
}

#[test]
fn otir_drains_a_block_through_the_port() {
    let mut m = Machine::new();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    // OTIR decrements B before putting BC on the bus
    m.register_output_handler(0x0110, move |v| {
        sink.borrow_mut().push(v);
        Ok(())
    });
    m.mem.write_byte(0x3000, 0xAA);
    m.mem.write_byte(0x3001, 0xBB);
    m.regs.set_hl(0x3000);
    m.regs.b = 0x02;
    m.regs.c = 0x10;
    m.execute(&Instruction::EdSimple(EdSimple::Otir)).unwrap();
    assert_eq!(*seen.borrow(), vec![0xAA]);
    assert_eq!(m.regs.b, 0);
    assert!(m.regs.flag(Flag::Z));
}

#[test]
fn ini_reads_into_memory() {
    let mut m = Machine::new();
    m.register_input_handler(0x0220, || Ok(0x77));
    m.regs.b = 0x02;
    m.regs.c = 0x20;
    m.regs.set_hl(0x4000);
    m.execute(&Instruction::EdSimple(EdSimple::Ini)).unwrap();
    assert_eq!(m.mem.read_byte(0x4000), 0x77);
    assert_eq!(m.regs.b, 1);
    assert_eq!(m.regs.hl(), 0x4001);
    assert!(!m.regs.flag(Flag::Z));
}

#[test]
fn mode1_interrupt_services_through_0x38() {
    // 0x0000: EI; HALT; LD A,0x42; HALT
    // 0x0038: LD B,0x99; EI; RETI
    let mut m = Machine::new();
    m.load_image(0x0000, &[0xFB, 0x76, 0x3E, 0x42, 0x76]);
    m.load_image(0x0038, &[0x06, 0x99, 0xFB, 0xED, 0x4D]);
    m.regs.sp = 0x8000;
    m.execute(&Instruction::EdSimple(EdSimple::Im1)).unwrap();

    assert_eq!(m.step().unwrap(), Step::Continue); // EI
    assert_eq!(m.step().unwrap(), Step::Halted);
    assert_eq!(m.regs.pc, 0x0001, "PC holds on the HALT byte");

    m.do_interrupt();
    assert_eq!(m.step().unwrap(), Step::Continue); // service: LD B,0x99
    assert_eq!(m.regs.b, 0x99);
    assert!(!m.iff1(), "acceptance clears IFF1");
    assert_eq!(m.step().unwrap(), Step::Continue); // EI
    assert_eq!(m.step().unwrap(), Step::Continue); // RETI
    assert!(m.iff1());
    assert_eq!(m.regs.pc, 0x0002, "resumed past the HALT");

    assert_eq!(m.step().unwrap(), Step::Continue); // LD A,0x42
    assert_eq!(m.step().unwrap(), Step::Halted);
    assert_eq!(m.regs.a, 0x42);
}

#[test]
fn mode2_interrupt_reads_the_vector_table() {
    let mut m = Machine::new();
    m.load_image(0x0000, &[0xFB, 0x76]); // EI; HALT
    m.load_image(0x2000, &[0x3E, 0x55, 0x76]); // LD A,0x55; HALT
    m.regs.sp = 0x8000;
    m.regs.i = 0x40;
    m.mem.write_word(0x40FF, 0x2000); // I:0xFF (default bus byte)
    m.execute(&Instruction::EdSimple(EdSimple::Im2)).unwrap();

    m.step().unwrap(); // EI
    m.step().unwrap(); // HALT
    m.do_interrupt();
    m.step().unwrap(); // accept + LD A,0x55
    assert_eq!(m.regs.a, 0x55);
    assert_eq!(m.load16(0x7FFE), 0x0002, "return address points past HALT");
}

#[test]
fn interrupt_request_is_dropped_when_iff1_clear() {
    let mut m = machine_with(&[0x00, 0x76]); // NOP; HALT
    m.do_interrupt();
    assert_eq!(m.step().unwrap(), Step::Continue);
    assert_eq!(m.regs.pc, 1, "no service happened");
    let a = m.run().unwrap();
    assert_eq!(a, 0);
}

#[test]
fn di_ei_toggle_the_latches() {
    let mut m = Machine::new();
    m.execute(&Instruction::Simple(Simple::Ei)).unwrap();
    assert!(m.iff1());
    m.execute(&Instruction::Simple(Simple::Di)).unwrap();
    assert!(!m.iff1());
}

#[test]
fn neg_and_cpl() {
    let mut m = Machine::new();
    m.regs.a = 0x01;
    m.execute(&Instruction::EdSimple(EdSimple::Neg)).unwrap();
    assert_eq!(m.regs.a, 0xFF);
    assert!(m.regs.flag(Flag::C));
    assert!(m.regs.flag(Flag::N));

    m.regs.a = 0x80;
    m.execute(&Instruction::EdSimple(EdSimple::Neg)).unwrap();
    assert_eq!(m.regs.a, 0x80);
    assert!(m.regs.flag(Flag::PV), "NEG of 0x80 overflows");

    m.regs.a = 0b1010_0101;
    m.execute(&Instruction::Simple(Simple::Cpl)).unwrap();
    assert_eq!(m.regs.a, 0b0101_1010);
    assert!(m.regs.flag(Flag::H) && m.regs.flag(Flag::N));
}

#[test]
fn scf_ccf() {
    let mut m = Machine::new();
    m.execute(&Instruction::Simple(Simple::Scf)).unwrap();
    assert!(m.regs.flag(Flag::C));
    assert!(!m.regs.flag(Flag::H));
    m.execute(&Instruction::Simple(Simple::Ccf)).unwrap();
    assert!(!m.regs.flag(Flag::C));
    assert!(m.regs.flag(Flag::H), "CCF copies old C into H");
}

#[test]
fn ld_a_i_reports_iff2_through_pv() {
    let mut m = Machine::new();
    m.regs.i = 0x80;
    m.execute(&Instruction::Simple(Simple::Ei)).unwrap();
    m.execute(&Instruction::Ld8(Loc8::Reg(R8::A), Loc8::Reg(R8::I)))
        .unwrap();
    assert_eq!(m.regs.a, 0x80);
    assert!(m.regs.flag(Flag::S));
    assert!(m.regs.flag(Flag::PV));
    m.execute(&Instruction::Simple(Simple::Di)).unwrap();
    m.execute(&Instruction::Ld8(Loc8::Reg(R8::A), Loc8::Reg(R8::I)))
        .unwrap();
    assert!(!m.regs.flag(Flag::PV));
}

#[test]
fn plain_ld_leaves_flags_alone() {
    let mut m = Machine::new();
    m.regs.f = 0xA5;
    m.regs.b = 0x00;
    m.execute(&Instruction::Ld8(Loc8::Reg(R8::A), Loc8::Reg(R8::B)))
        .unwrap();
    m.execute(&Instruction::Ld8(Loc8::RegAddr(R16::HL), Loc8::Imm(0x7F)))
        .unwrap();
    m.execute(&Instruction::Ld16(Loc16::Reg(R16::DE), Loc16::Imm(0)))
        .unwrap();
    assert_eq!(m.regs.f, 0xA5);
}

#[test]
fn load_then_disassemble_then_load_is_idempotent() {
    let insts = vec![
        Instruction::Ld16(Loc16::Reg(R16::HL), Loc16::Imm(0x0100)),
        Instruction::Ld8(Loc8::RegAddr(R16::HL), Loc8::Imm(0xFF)),
        Instruction::Alu(AluOp::Xor, Loc8::Reg(R8::A)),
        Instruction::Jr(Condition::NZ, -2),
        Instruction::Simple(Simple::Halt),
    ];
    let mut m = Machine::new();
    let end = m.load(0x4000, &insts);
    let mut image = Vec::new();
    for addr in 0x4000..end {
        image.push(m.mem.read_byte(addr));
    }
    let (decoded, errs) = z80rs::decode::decode_bytes(&image);
    assert!(errs.is_empty());
    assert_eq!(decoded, insts);
    let mut m2 = Machine::new();
    let end2 = m2.load(0x4000, &decoded);
    assert_eq!(end, end2);
    for addr in 0x4000..end {
        assert_eq!(m.mem.read_byte(addr), m2.mem.read_byte(addr));
    }
}

#[test]
fn stray_index_prefixes_execute_as_no_ops() {
    // DD NOP; FD INC A; DD HALT — every prefix here is dead weight
    let prog = [0xDD, 0x00, 0xFD, 0x3C, 0xDD, 0x76];
    let mut m = machine_with(&prog);
    let a = m.run().unwrap();
    assert_eq!(a, 1);
    assert_eq!(m.regs.pc, 0x0005, "halted on the HALT byte");
}

#[test]
fn executing_data_is_an_error() {
    let mut m = Machine::new();
    let err = m.execute(&Instruction::Data(vec![1, 2, 3])).unwrap_err();
    assert!(err.to_string().contains("raw data"));
}

#[test]
fn watch_and_trace_regions_do_not_disturb_execution() {
    let prog = [0x21, 0x00, 0x01, 0x36, 0x42, 0x7E, 0x76];
    let mut m = machine_with(&prog);
    m.add_trace((0x0000, 0x00FF));
    m.add_watch((0x0100, 0x0100));
    let a = m.run().unwrap();
    assert_eq!(a, 0x42);
}

#[test]
fn jp_conditions_follow_the_flag_table() {
    for (cond, flag, want_taken_when_set) in [
        (Condition::Z, Flag::Z, true),
        (Condition::NZ, Flag::Z, false),
        (Condition::C, Flag::C, true),
        (Condition::NC, Flag::C, false),
        (Condition::PE, Flag::PV, true),
        (Condition::PO, Flag::PV, false),
        (Condition::M, Flag::S, true),
        (Condition::P, Flag::S, false),
    ] {
        for set in [false, true] {
            let mut m = Machine::new();
            m.regs.set_flag(flag, set);
            m.execute(&Instruction::Jp(cond, Loc16::Imm(0x1234)))
                .unwrap();
            let taken = m.regs.pc == 0x1234;
            assert_eq!(taken, set == want_taken_when_set, "{cond:?} with {flag:?}={set}");
        }
    }
}

#[test]
fn jp_hl_like_jumps_through_the_register() {
    let mut m = Machine::new();
    m.regs.ix = 0x4567;
    m.execute(&Instruction::Jp(Condition::Always, Loc16::Reg(R16::IX)))
        .unwrap();
    assert_eq!(m.regs.pc, 0x4567);
}

#[test]
fn rst_pushes_and_vectors() {
    let mut m = Machine::new();
    m.regs.sp = 0x8000;
    m.regs.pc = 0x1234;
    m.execute(&Instruction::Rst(0x18)).unwrap();
    assert_eq!(m.regs.pc, 0x0018);
    assert_eq!(m.load16(0x7FFE), 0x1234);
}

#[test]
fn rld_rotates_nibbles_left() {
    let mut m = Machine::new();
    m.regs.a = 0x7A;
    m.regs.set_hl(0x5000);
    m.store8(0x5000, 0x31);
    m.execute(&Instruction::EdSimple(EdSimple::Rld)).unwrap();
    assert_eq!(m.regs.a, 0x73);
    assert_eq!(m.load8(0x5000), 0x1A);
}
