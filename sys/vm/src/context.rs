// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-task execution state.

use hsx_abi::{FaultKind, Pid, Psw};
use hsx_isa::NUM_REGS;

use crate::code::CodeCache;
use crate::data::DataSpace;

/// Everything the VM holds for one live task.
///
/// The fields are private so the invariants hold: `sp` stays inside
/// `[stack_base, stack_limit)` at every instruction boundary, `wp` always
/// leaves a full window inside the register arena, and a latched fault is
/// never cleared by execution (only by the executive tearing the task
/// down).
pub struct TaskContext {
    pid: Pid,
    pub(crate) pc: u32,
    pub(crate) sp: u32,
    /// Workspace pointer: base index of the current register window in
    /// `regs`.
    pub(crate) wp: u32,
    pub(crate) psw: Psw,
    /// Register arena, windowed by `wp`. Sized at load; CALL walks the
    /// window up, RET walks it back down.
    pub(crate) regs: Vec<u32>,
    pub(crate) stack_base: u32,
    pub(crate) stack_limit: u32,
    /// Latched fault. Once set, `step` refuses to advance the task.
    pub(crate) fault: Option<FaultKind>,
    pub(crate) code: CodeCache,
    pub(crate) data: DataSpace,
}

impl TaskContext {
    pub fn new(pid: Pid, entry_pc: u32, regs: usize, code: CodeCache, data: DataSpace) -> Self {
        let stack_base = data.stack_base();
        let stack_limit = data.stack_limit();
        TaskContext {
            pid,
            pc: entry_pc,
            // Full-descending stack; the initial slot below the limit is
            // never written, which keeps `sp < stack_limit` an invariant
            // rather than a boundary case.
            sp: stack_limit - 4,
            wp: 0,
            psw: Psw::empty(),
            regs: vec![0; regs],
            stack_base,
            stack_limit,
            fault: None,
            code,
            data,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn pc(&self) -> u32 {
        self.pc
    }

    pub fn sp(&self) -> u32 {
        self.sp
    }

    pub fn wp(&self) -> u32 {
        self.wp
    }

    pub fn psw(&self) -> Psw {
        self.psw
    }

    pub fn fault(&self) -> Option<FaultKind> {
        self.fault
    }

    pub fn stack_bounds(&self) -> (u32, u32) {
        (self.stack_base, self.stack_limit)
    }

    /// Reads register `r` of the current window.
    pub fn reg(&self, r: u8) -> u32 {
        debug_assert!(r < NUM_REGS);
        self.regs[self.wp as usize + r as usize]
    }

    /// Writes register `r` of the current window.
    pub fn set_reg(&mut self, r: u8, v: u32) {
        debug_assert!(r < NUM_REGS);
        self.regs[self.wp as usize + r as usize] = v;
    }

    /// Guest-memory read used by SVC handlers to translate pointer
    /// arguments.
    pub fn read_bytes(&mut self, addr: u32, out: &mut [u8]) -> Result<(), FaultKind> {
        self.data.read_bytes(addr, out)
    }

    /// Guest-memory write used by SVC handlers.
    pub fn write_bytes(&mut self, addr: u32, data: &[u8]) -> Result<(), FaultKind> {
        self.data.write_bytes(addr, data)
    }

    /// Reads the word at `sp + offset`, for the debugger's frame
    /// inspection (step-out reads the return address at `sp + 4`).
    pub fn read_stack_word(&mut self, offset: u32) -> Result<u32, FaultKind> {
        self.data.read_u32(self.sp + offset)
    }

    /// Overwrites the program counter (debugger and executive surface).
    pub fn set_pc(&mut self, pc: u32) {
        self.pc = pc;
    }

    /// Pushes a call frame exactly as CALL does: return address, then
    /// the current workspace pointer. The executive uses this to inject
    /// command-handler invocations.
    pub fn push_frame(&mut self, ret_pc: u32) -> Result<(), FaultKind> {
        self.push(ret_pc)?;
        let wp = self.wp;
        self.push(wp)
    }

    /// Pops a call frame (the inverse of `push_frame`), restoring the
    /// workspace pointer and returning the saved return address.
    pub fn pop_frame(&mut self) -> Result<u32, FaultKind> {
        let wp = self.pop()?;
        let ret = self.pop()?;
        self.wp = wp;
        Ok(ret)
    }

    pub(crate) fn push(&mut self, v: u32) -> Result<(), FaultKind> {
        let new_sp = self.sp.wrapping_sub(4);
        if new_sp < self.stack_base || new_sp >= self.stack_limit {
            return Err(FaultKind::StackOverflow { address: new_sp });
        }
        self.data.write_u32(new_sp, v)?;
        self.sp = new_sp;
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Result<u32, FaultKind> {
        // The slot just below the limit is the empty-stack sentinel;
        // popping past it is underflow, reported as a stack fault.
        if self.sp + 4 >= self.stack_limit {
            return Err(FaultKind::StackOverflow { address: self.sp });
        }
        let v = self.data.read_u32(self.sp)?;
        self.sp += 4;
        Ok(v)
    }
}
