// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Instruction decode and dispatch.
//!
//! One call to [`step`] advances the current task by exactly one
//! instruction, or not at all if the task has a latched fault. The VM
//! never schedules, never services an SVC, and never preempts: anything
//! that needs a policy decision is reported to the executive through the
//! returned [`StopReason`].
//!
//! # Flag conventions
//!
//! Arithmetic wraps in two's complement. C is carry-out for ADD/ADC and
//! NOT-borrow for SUB/SBC/CMP; V is signed overflow. MUL and the logical
//! ops clear C and V. Shift amounts are taken mod 32; C holds the last
//! bit shifted out, 0 when the amount is 0, and shifts clear V.

use hsx_abi::{FaultKind, Psw};
use hsx_isa::{self as isa, Instr, Op};

use crate::context::TaskContext;

/// Why a `step` returned.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StopReason {
    /// Instruction completed; the task can continue.
    Ok,
    /// `BRK` executed.
    Break,
    /// The task faulted; the same fault is latched on the context.
    Fault(FaultKind),
    /// `SVC` executed; the executive must dispatch it. The task's PC has
    /// already advanced past the instruction, and arguments are in R0-R3
    /// of the current window.
    Svc { module: u8, function: u8 },
}

/// Result of one `step` or `clock` call: the PC after the instruction (or
/// at the faulting instruction) and the stop reason.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StepResult {
    pub pc: u32,
    pub reason: StopReason,
}

/// Sum of an addition with carry plus the resulting C and V flags. SUB
/// and SBC reuse this with the complemented second operand, which yields
/// the ARM-style NOT-borrow carry for free.
fn adc(a: u32, b: u32, carry_in: u32) -> (u32, bool, bool) {
    let (r1, c1) = a.overflowing_add(b);
    let (r, c2) = r1.overflowing_add(carry_in);
    let v = ((a ^ r) & (b ^ r)) & 0x8000_0000 != 0;
    (r, c1 || c2, v)
}

fn set_zn(psw: &mut Psw, r: u32) {
    psw.set(Psw::Z, r == 0);
    psw.set(Psw::N, r & 0x8000_0000 != 0);
}

fn set_all(psw: &mut Psw, r: u32, c: bool, v: bool) {
    set_zn(psw, r);
    psw.set(Psw::C, c);
    psw.set(Psw::V, v);
}

fn branch_taken(op: Op, psw: Psw) -> bool {
    let z = psw.contains(Psw::Z);
    let c = psw.contains(Psw::C);
    let n = psw.contains(Psw::N);
    let v = psw.contains(Psw::V);
    match op {
        Op::Beq => z,
        Op::Bne => !z,
        Op::Blt => n != v,
        Op::Bge => n == v,
        Op::Bcs => c,
        Op::Bcc => !c,
        Op::Bmi => n,
        Op::Bpl => !n,
        _ => unreachable!("not a conditional branch: {op:?}"),
    }
}

/// Advances `ctx` by one instruction.
pub fn step(ctx: &mut TaskContext) -> StepResult {
    // A faulted task stays faulted; re-stepping it reports the latched
    // fault rather than executing anything.
    if let Some(f) = ctx.fault {
        return StepResult { pc: ctx.pc, reason: StopReason::Fault(f) };
    }

    let pc = ctx.pc;
    let word = match ctx.code.fetch_word(pc) {
        Ok(w) => w,
        Err(f) => return latch(ctx, f),
    };
    let instr = match isa::decode(word) {
        Ok(i) => i,
        Err(_) => return latch(ctx, FaultKind::IllegalInstruction),
    };

    let next = pc + isa::WORD;
    match execute(ctx, &instr, next) {
        Ok(Flow::Next) => {
            ctx.pc = next;
            StepResult { pc: ctx.pc, reason: StopReason::Ok }
        }
        Ok(Flow::Jump(target)) => {
            ctx.pc = target;
            StepResult { pc: ctx.pc, reason: StopReason::Ok }
        }
        Ok(Flow::Break) => {
            ctx.pc = next;
            StepResult { pc: ctx.pc, reason: StopReason::Break }
        }
        Ok(Flow::Svc { module, function }) => {
            ctx.pc = next;
            StepResult { pc: ctx.pc, reason: StopReason::Svc { module, function } }
        }
        Err(f) => latch(ctx, f),
    }
}

fn latch(ctx: &mut TaskContext, f: FaultKind) -> StepResult {
    ctx.fault = Some(f);
    StepResult { pc: ctx.pc, reason: StopReason::Fault(f) }
}

enum Flow {
    Next,
    Jump(u32),
    Break,
    Svc { module: u8, function: u8 },
}

/// Relative branch target: word offset from the instruction after the
/// branch.
fn rel(next: u32, imm: i32) -> u32 {
    next.wrapping_add((imm as u32).wrapping_mul(isa::WORD))
}

fn execute(ctx: &mut TaskContext, i: &Instr, next: u32) -> Result<Flow, FaultKind> {
    match i.op {
        Op::Nop => {}
        Op::Mov => ctx.set_reg(i.rd, ctx.reg(i.rs)),
        Op::Ldi => ctx.set_reg(i.rd, i.imm as u32),
        Op::Lui => ctx.set_reg(i.rd, (i.imm as u32) << 16),

        Op::Ld => {
            let addr = ctx.reg(i.rs).wrapping_add(i.imm as u32);
            let v = ctx.data.read_u32(addr)?;
            ctx.set_reg(i.rd, v);
        }
        Op::St => {
            let addr = ctx.reg(i.rs).wrapping_add(i.imm as u32);
            let v = ctx.reg(i.rd);
            ctx.data.write_u32(addr, v)?;
        }
        Op::Ldb => {
            let addr = ctx.reg(i.rs).wrapping_add(i.imm as u32);
            let v = ctx.data.read_u8(addr)?;
            ctx.set_reg(i.rd, v as u32);
        }
        Op::Stb => {
            let addr = ctx.reg(i.rs).wrapping_add(i.imm as u32);
            let v = ctx.reg(i.rd) as u8;
            ctx.data.write_u8(addr, v)?;
        }

        Op::Add | Op::Addi => {
            let a = ctx.reg(i.rs);
            let b = if i.op == Op::Add { ctx.reg(i.rt) } else { i.imm as u32 };
            let (r, c, v) = adc(a, b, 0);
            set_all(&mut ctx.psw, r, c, v);
            ctx.set_reg(i.rd, r);
        }
        Op::Adc => {
            let cin = ctx.psw.contains(Psw::C) as u32;
            let (r, c, v) = adc(ctx.reg(i.rs), ctx.reg(i.rt), cin);
            set_all(&mut ctx.psw, r, c, v);
            ctx.set_reg(i.rd, r);
        }
        Op::Sub => {
            let (r, c, v) = adc(ctx.reg(i.rs), !ctx.reg(i.rt), 1);
            set_all(&mut ctx.psw, r, c, v);
            ctx.set_reg(i.rd, r);
        }
        Op::Sbc => {
            let cin = ctx.psw.contains(Psw::C) as u32;
            let (r, c, v) = adc(ctx.reg(i.rs), !ctx.reg(i.rt), cin);
            set_all(&mut ctx.psw, r, c, v);
            ctx.set_reg(i.rd, r);
        }
        Op::Mul => {
            let r = ctx.reg(i.rs).wrapping_mul(ctx.reg(i.rt));
            set_all(&mut ctx.psw, r, false, false);
            ctx.set_reg(i.rd, r);
        }
        Op::Div => {
            let divisor = ctx.reg(i.rt) as i32;
            if divisor == 0 {
                return Err(FaultKind::DivideByZero);
            }
            let dividend = ctx.reg(i.rs) as i32;
            // Truncating division; MIN / -1 wraps and flags V.
            let r = dividend.wrapping_div(divisor) as u32;
            let v = dividend == i32::MIN && divisor == -1;
            set_all(&mut ctx.psw, r, false, v);
            ctx.set_reg(i.rd, r);
        }

        Op::And => {
            let r = ctx.reg(i.rs) & ctx.reg(i.rt);
            set_all(&mut ctx.psw, r, false, false);
            ctx.set_reg(i.rd, r);
        }
        Op::Or => {
            let r = ctx.reg(i.rs) | ctx.reg(i.rt);
            set_all(&mut ctx.psw, r, false, false);
            ctx.set_reg(i.rd, r);
        }
        Op::Xor => {
            let r = ctx.reg(i.rs) ^ ctx.reg(i.rt);
            set_all(&mut ctx.psw, r, false, false);
            ctx.set_reg(i.rd, r);
        }
        Op::Not => {
            let r = !ctx.reg(i.rs);
            set_all(&mut ctx.psw, r, false, false);
            ctx.set_reg(i.rd, r);
        }

        Op::Lsl | Op::Lsr | Op::Asr | Op::Lsli | Op::Lsri | Op::Asri => {
            let a = ctx.reg(i.rs);
            let amt = match i.op {
                Op::Lsl | Op::Lsr | Op::Asr => ctx.reg(i.rt) & 31,
                _ => (i.imm as u32) & 31,
            };
            let (r, c) = match i.op {
                Op::Lsl | Op::Lsli => {
                    if amt == 0 {
                        (a, false)
                    } else {
                        (a << amt, (a >> (32 - amt)) & 1 != 0)
                    }
                }
                Op::Lsr | Op::Lsri => {
                    if amt == 0 {
                        (a, false)
                    } else {
                        (a >> amt, (a >> (amt - 1)) & 1 != 0)
                    }
                }
                _ => {
                    if amt == 0 {
                        (a, false)
                    } else {
                        (
                            ((a as i32) >> amt) as u32,
                            ((a as i32) >> (amt - 1)) & 1 != 0,
                        )
                    }
                }
            };
            set_all(&mut ctx.psw, r, c, false);
            ctx.set_reg(i.rd, r);
        }

        Op::Cmp => {
            let (r, c, v) = adc(ctx.reg(i.rs), !ctx.reg(i.rt), 1);
            set_all(&mut ctx.psw, r, c, v);
        }
        Op::Cmpi => {
            let (r, c, v) = adc(ctx.reg(i.rs), !(i.imm as u32), 1);
            set_all(&mut ctx.psw, r, c, v);
        }

        Op::Beq
        | Op::Bne
        | Op::Blt
        | Op::Bge
        | Op::Bcs
        | Op::Bcc
        | Op::Bmi
        | Op::Bpl => {
            if branch_taken(i.op, ctx.psw) {
                return Ok(Flow::Jump(rel(next, i.imm)));
            }
        }
        Op::Jmp => return Ok(Flow::Jump(rel(next, i.imm))),

        Op::Call => {
            ctx.push(next)?;
            let wp = ctx.wp;
            ctx.push(wp)?;
            let new_wp = ctx.wp + i.rd as u32;
            // The callee needs a full window above the new wp.
            if new_wp as usize + isa::NUM_REGS as usize > ctx.regs.len() {
                return Err(FaultKind::StackOverflow { address: ctx.sp });
            }
            ctx.wp = new_wp;
            return Ok(Flow::Jump(rel(next, i.imm)));
        }
        Op::Ret => {
            let wp = ctx.pop()?;
            let ret = ctx.pop()?;
            ctx.wp = wp;
            return Ok(Flow::Jump(ret));
        }

        Op::Svc => {
            return Ok(Flow::Svc {
                module: i.svc_module(),
                function: i.svc_function(),
            });
        }
        Op::Brk => return Ok(Flow::Break),
    }
    Ok(Flow::Next)
}
