//! A narrow Thumb-1 instruction interpreter used only to compute the next
//! program counter for GDB's software single-step (`s`). This is the Rust
//! analogue of the optional `PyMulator` dependency referenced by the
//! original implementation: there is no off-the-shelf crate for this
//! bespoke target, so just enough decode/execute is implemented here to
//! advance one instruction against a live register file and memory view.
//! Disassembly coverage is intentionally narrow — only what the
//! single-step path needs (spec Non-goals).

use crate::error::{IceError, IceResult};
use crate::target::{MemoryView, RegisterFile, WordIo};

/// Interprets one Thumb instruction at the current `pc` (logical, i.e.
/// GDB-visible, not the on-chip stored+4 value), mutating `regs` and
/// `mem` in place, and returns the resulting logical PC.
pub fn step_one<B: WordIo>(regs: &RegisterFile<B>, mem: &MemoryView<B>, pc: u32) -> IceResult<u32> {
    let insn = mem.read(pc, 16)? as u16;
    let next = execute(regs, mem, pc, insn)?;
    Ok(next)
}

fn gpr_name(reg: u16) -> &'static str {
    const NAMES: [&str; 8] = ["r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7"];
    NAMES[(reg & 0x7) as usize]
}

fn hi_reg_name(reg: u16) -> String {
    match reg {
        0..=7 => gpr_name(reg).to_string(),
        13 => "sp".to_string(),
        14 => "lr".to_string(),
        15 => "pc".to_string(),
        other => format!("r{other}"),
    }
}

fn execute<B: WordIo>(
    regs: &RegisterFile<B>,
    _mem: &MemoryView<B>,
    pc: u32,
    insn: u16,
) -> IceResult<u32> {
    let fall_through = pc.wrapping_add(2);

    // Format 16: conditional branch `1101 cccc ssss ssss`.
    if insn & 0xf000 == 0xd000 && (insn >> 8) & 0xf != 0xf {
        let cond = (insn >> 8) & 0xf;
        let offset = ((insn & 0xff) as i8 as i32) << 1;
        let taken = condition_holds(regs, cond)?;
        return Ok(if taken {
            (pc as i64 + 4 + offset as i64) as u32
        } else {
            fall_through
        });
    }

    // Format 18: unconditional branch `11100 sssssssssss`.
    if insn & 0xf800 == 0xe000 {
        let raw = insn & 0x7ff;
        let offset = if raw & 0x400 != 0 {
            ((raw as i32) - 0x800) << 1
        } else {
            (raw as i32) << 1
        };
        return Ok((pc as i64 + 4 + offset as i64) as u32);
    }

    // Format 1/2: move shifted register / add-subtract `000. ....` / `0001 1...`.
    if insn & 0xe000 == 0x0000 {
        let rd = insn & 0x7;
        let rs = (insn >> 3) & 0x7;
        if insn & 0xf800 == 0x1800 || insn & 0xf800 == 0x1a00 {
            // ADD/SUB register or immediate (format 2).
            let is_sub = insn & 0x0200 != 0;
            let imm = insn & 0x0200 != 0 || insn & 0x0400 != 0;
            let operand = if imm {
                ((insn >> 6) & 0x7) as u32
            } else {
                regs.read(gpr_name((insn >> 6) & 0x7))?
            };
            let base = regs.read(gpr_name(rs))?;
            let result = if is_sub {
                base.wrapping_sub(operand)
            } else {
                base.wrapping_add(operand)
            };
            regs.write(gpr_name(rd), result)?;
        }
        return Ok(fall_through);
    }

    // Format 3: move/compare/add/subtract immediate `001 oo rrr iiiiiiii`.
    if insn & 0xe000 == 0x2000 {
        let op = (insn >> 11) & 0x3;
        let rd = (insn >> 8) & 0x7;
        let imm = (insn & 0xff) as u32;
        let current = regs.read(gpr_name(rd))?;
        match op {
            0 => regs.write(gpr_name(rd), imm)?, // MOV
            1 => { /* CMP: flags only, nothing to mutate here */ }
            2 => regs.write(gpr_name(rd), current.wrapping_add(imm))?, // ADD
            3 => regs.write(gpr_name(rd), current.wrapping_sub(imm))?, // SUB
            _ => unreachable!(),
        }
        return Ok(fall_through);
    }

    // Format 5: Hi register operations / branch exchange `0100 01 .. ....`.
    if insn & 0xfc00 == 0x4400 {
        let op = (insn >> 8) & 0x3;
        let h1 = (insn >> 7) & 0x1;
        let h2 = (insn >> 6) & 0x1;
        let rs = ((h2 << 3) | ((insn >> 3) & 0x7)) as u16;
        let rd = ((h1 << 3) | (insn & 0x7)) as u16;
        if op == 0x3 {
            // BX Rs: branch (and exchange, ignored — target stays Thumb).
            let target = regs.read(&hi_reg_name(rs))?;
            return Ok(target & !1);
        }
        let src = regs.read(&hi_reg_name(rs))?;
        match op {
            0x0 => {
                let dst = regs.read(&hi_reg_name(rd))?;
                regs.write(&hi_reg_name(rd), dst.wrapping_add(src))?;
            }
            0x2 => regs.write(&hi_reg_name(rd), src)?,
            _ => {}
        }
        return Ok(fall_through);
    }

    // Unrecognized instruction: fall through. Disassembly coverage is
    // intentionally narrow per the single-step path's needs; unknown
    // forms are treated as no-ops for register state and simply advance
    // PC by one halfword.
    Ok(fall_through)
}

fn condition_holds<B: WordIo>(regs: &RegisterFile<B>, cond: u16) -> IceResult<bool> {
    let xpsr = regs.read("xpsr")?;
    let n = (xpsr >> 31) & 1 != 0;
    let z = (xpsr >> 30) & 1 != 0;
    let c = (xpsr >> 29) & 1 != 0;
    let v = (xpsr >> 28) & 1 != 0;
    Ok(match cond {
        0x0 => z,            // BEQ
        0x1 => !z,           // BNE
        0x2 => c,            // BCS
        0x3 => !c,           // BCC
        0x4 => n,            // BMI
        0x5 => !n,           // BPL
        0x6 => v,            // BVS
        0x7 => !v,           // BVC
        0x8 => c && !z,      // BHI
        0x9 => !c || z,      // BLS
        0xa => n == v,       // BGE
        0xb => n != v,       // BLT
        0xc => !z && n == v, // BGT
        0xd => z || n != v,  // BLE
        other => {
            return Err(IceError::ParameterError(format!(
                "unsupported branch condition {other}"
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::test_support::fake_regs_and_mem;

    fn write_u16(mem: &MemoryView<crate::target::test_support::FakeBackend>, addr: u32, val: u16) {
        mem.force_write(addr, 16, val as u32).unwrap();
    }

    #[test]
    fn mov_immediate_advances_pc_by_two_and_sets_register() {
        let (regs, mem) = fake_regs_and_mem(0x2000_0000);
        // MOV r0, #5 -> 0010 0 000 00000101
        write_u16(&mem, 0x1000, 0x2005);
        let next = step_one(&regs, &mem, 0x1000).unwrap();
        assert_eq!(next, 0x1002);
        assert_eq!(regs.read("r0").unwrap(), 5);
    }

    #[test]
    fn unconditional_branch_computes_target() {
        let (regs, mem) = fake_regs_and_mem(0x2000_0000);
        // B #4 (format 18): raw offset 2 halfwords ahead.
        write_u16(&mem, 0x1000, 0xe002);
        let next = step_one(&regs, &mem, 0x1000).unwrap();
        assert_eq!(next, 0x1000 + 4 + 4);
    }

    #[test]
    fn bx_lr_returns_link_register_masked_even() {
        let (regs, mem) = fake_regs_and_mem(0x2000_0000);
        regs.force_write("lr", 0x1234_5671).unwrap();
        // BX lr: 0100 0111 0 111 0 000 (h1=0,h2=1,rs=7(lr))
        write_u16(&mem, 0x2000, 0x4770);
        let next = step_one(&regs, &mem, 0x2000).unwrap();
        assert_eq!(next, 0x1234_5670);
    }

    #[test]
    fn beq_branches_when_zero_flag_set() {
        let (regs, mem) = fake_regs_and_mem(0x2000_0000);
        regs.force_write("xpsr", 1 << 30).unwrap();
        // BEQ #2: 1101 0000 00000001
        write_u16(&mem, 0x3000, 0xd001);
        let next = step_one(&regs, &mem, 0x3000).unwrap();
        assert_eq!(next, 0x3000 + 4 + 2);
    }
}
