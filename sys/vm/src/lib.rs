// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The MiniVM execution engine.
//!
//! The VM owns per-task execution contexts and advances exactly one of
//! them -- the current context -- by one instruction per [`Vm::step`]
//! call, or up to `n` per [`Vm::clock`]. Everything with a policy flavor
//! (scheduling, SVC servicing, breakpoints, permissions) lives in the
//! executive; the VM's entire interface to it is the [`StepResult`] it
//! returns and the raw register/memory accessors the executive is trusted
//! to gate.

mod code;
mod context;
mod data;
mod exec;

pub use code::{CodeCache, CodeCacheStats, CodeStore, MemCodeStore};
pub use context::TaskContext;
pub use data::{DataLayout, DataSpace, PageClass, TlbStats};
pub use exec::{StepResult, StopReason};

use std::collections::BTreeMap;

use hsx_abi::{FaultKind, Pid, Psw};

/// Tunable sizes for the VM's arenas and caches. Defaults carry the
/// design budgets for a host-class target.
#[derive(Clone, Debug)]
pub struct VmConfig {
    /// Code cache line size in bytes; must be a power of two.
    pub code_line_bytes: u32,
    /// Code cache lines per task.
    pub code_lines: usize,
    /// Enable sequential prefetch in the code cache.
    pub prefetch: bool,
    /// Data TLB page size in bytes; must be a power of two.
    pub tlb_page_bytes: u32,
    /// Data TLB entries per task (the pinned regions are wired
    /// separately).
    pub tlb_entries: usize,
    /// Register arena slots per task; each CALL consumes its frame size,
    /// and a full 16-register window must always fit.
    pub reg_window_slots: usize,
    /// Heap bytes between the globals and the pinned regions.
    pub heap_bytes: u32,
    /// Pinned IPC scratch bytes.
    pub ipc_bytes: u32,
    /// Pinned stack bytes at the top of the data space.
    pub stack_bytes: u32,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            code_line_bytes: 256,
            code_lines: 2,
            prefetch: true,
            tlb_page_bytes: 1024,
            tlb_entries: 4,
            reg_window_slots: 256,
            heap_bytes: 4096,
            ipc_bytes: 256,
            stack_bytes: 1024,
        }
    }
}

/// A program ready to be given a context: the loader's view of one HXE
/// image, reduced to what execution needs.
pub struct VmImage {
    pub entry_pc: u32,
    pub code: Box<dyn CodeStore + Send>,
    /// Initialized data segment.
    pub data: Vec<u8>,
    /// Zero-initialized bytes appended after `data`.
    pub bss_size: u32,
}

/// Register selector for the debugger-facing accessors.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegSel {
    R(u8),
    Pc,
    Sp,
    Wp,
    Psw,
}

/// Errors from the VM's management surface. Execution-time problems are
/// faults, not errors; these are misuses of the API itself.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VmError {
    NoSuchTask(Pid),
    /// `step`/`clock` called with no current context selected.
    NoContext,
    TaskExists(Pid),
    BadRegister,
}

impl core::fmt::Display for VmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            VmError::NoSuchTask(p) => write!(f, "no such task: pid {}", p.0),
            VmError::NoContext => f.write_str("no current context"),
            VmError::TaskExists(p) => write!(f, "task already loaded: pid {}", p.0),
            VmError::BadRegister => f.write_str("bad register selector"),
        }
    }
}

impl std::error::Error for VmError {}

/// The virtual machine: a table of task contexts and a current-context
/// selector.
pub struct Vm {
    config: VmConfig,
    tasks: BTreeMap<u16, TaskContext>,
    current: Option<u16>,
}

impl Vm {
    pub fn new(config: VmConfig) -> Self {
        Vm { config, tasks: BTreeMap::new(), current: None }
    }

    /// Allocates arenas and a context for `pid`. The pid itself is
    /// allocated by the executive; the VM only checks uniqueness.
    pub fn load(&mut self, pid: Pid, image: VmImage) -> Result<(), VmError> {
        if self.tasks.contains_key(&pid.0) {
            return Err(VmError::TaskExists(pid));
        }
        let code = CodeCache::new(
            image.code,
            self.config.code_line_bytes,
            self.config.code_lines,
            self.config.prefetch,
        );
        let data = DataSpace::new(
            &image.data,
            image.bss_size,
            (
                self.config.heap_bytes,
                self.config.ipc_bytes,
                self.config.stack_bytes,
            ),
            self.config.tlb_page_bytes,
            self.config.tlb_entries,
        );
        let ctx = TaskContext::new(
            pid,
            image.entry_pc,
            self.config.reg_window_slots,
            code,
            data,
        );
        self.tasks.insert(pid.0, ctx);
        Ok(())
    }

    /// Frees the task's arenas. If it was the current context, the VM is
    /// left with no context selected.
    pub fn unload(&mut self, pid: Pid) -> Result<(), VmError> {
        self.tasks.remove(&pid.0).ok_or(VmError::NoSuchTask(pid))?;
        if self.current == Some(pid.0) {
            self.current = None;
        }
        Ok(())
    }

    /// Makes `pid` the current context. O(1): this exchanges one selector
    /// word and never touches the register arenas.
    pub fn set_context(&mut self, pid: Pid) -> Result<(), VmError> {
        if !self.tasks.contains_key(&pid.0) {
            return Err(VmError::NoSuchTask(pid));
        }
        self.current = Some(pid.0);
        Ok(())
    }

    pub fn current_pid(&self) -> Option<Pid> {
        self.current.map(Pid)
    }

    /// Live pids, in ascending order.
    pub fn pids(&self) -> Vec<Pid> {
        self.tasks.keys().copied().map(Pid).collect()
    }

    pub fn context(&self, pid: Pid) -> Result<&TaskContext, VmError> {
        self.tasks.get(&pid.0).ok_or(VmError::NoSuchTask(pid))
    }

    pub fn context_mut(&mut self, pid: Pid) -> Result<&mut TaskContext, VmError> {
        self.tasks.get_mut(&pid.0).ok_or(VmError::NoSuchTask(pid))
    }

    fn current_ctx(&mut self) -> Result<&mut TaskContext, VmError> {
        let cur = self.current.ok_or(VmError::NoContext)?;
        Ok(self.tasks.get_mut(&cur).expect("current pid must be loaded"))
    }

    /// Advances the current context by exactly one instruction.
    pub fn step(&mut self) -> Result<StepResult, VmError> {
        let ctx = self.current_ctx()?;
        Ok(exec::step(ctx))
    }

    /// Advances the current context by up to `n` instructions, stopping
    /// early on any reason other than `Ok`. Returns the final step result
    /// and the number of instructions actually executed.
    pub fn clock(&mut self, n: u32) -> Result<(StepResult, u32), VmError> {
        let ctx = self.current_ctx()?;
        let mut last = StepResult { pc: ctx.pc(), reason: StopReason::Ok };
        let mut executed = 0;
        for _ in 0..n {
            last = exec::step(ctx);
            match last.reason {
                StopReason::Ok => executed += 1,
                StopReason::Break | StopReason::Svc { .. } => {
                    executed += 1;
                    break;
                }
                StopReason::Fault(_) => break,
            }
        }
        Ok((last, executed))
    }

    /// Debugger register read. Gating by session policy happens in the
    /// executive.
    pub fn reg_get(&self, pid: Pid, sel: RegSel) -> Result<u32, VmError> {
        let ctx = self.context(pid)?;
        Ok(match sel {
            RegSel::R(r) if r < hsx_isa::NUM_REGS => ctx.reg(r),
            RegSel::R(_) => return Err(VmError::BadRegister),
            RegSel::Pc => ctx.pc(),
            RegSel::Sp => ctx.sp(),
            RegSel::Wp => ctx.wp(),
            RegSel::Psw => ctx.psw().bits() as u32,
        })
    }

    /// Debugger register write.
    pub fn reg_set(&mut self, pid: Pid, sel: RegSel, v: u32) -> Result<(), VmError> {
        let ctx = self.context_mut(pid)?;
        match sel {
            RegSel::R(r) if r < hsx_isa::NUM_REGS => ctx.set_reg(r, v),
            RegSel::R(_) => return Err(VmError::BadRegister),
            RegSel::Pc => ctx.pc = v,
            RegSel::Sp => {
                let (base, limit) = ctx.stack_bounds();
                if v < base || v >= limit {
                    return Err(VmError::BadRegister);
                }
                ctx.sp = v;
            }
            RegSel::Wp => ctx.wp = v,
            RegSel::Psw => ctx.psw = Psw::from_bits_truncate(v as u8),
        }
        Ok(())
    }

    /// Reads guest memory for the SVC and debugger paths.
    pub fn read_bytes(&mut self, pid: Pid, addr: u32, out: &mut [u8]) -> Result<Result<(), FaultKind>, VmError> {
        let ctx = self.context_mut(pid)?;
        Ok(ctx.read_bytes(addr, out))
    }

    /// Writes guest memory for the SVC and debugger paths.
    pub fn write_bytes(&mut self, pid: Pid, addr: u32, data: &[u8]) -> Result<Result<(), FaultKind>, VmError> {
        let ctx = self.context_mut(pid)?;
        Ok(ctx.write_bytes(addr, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hsx_isa::{encode, Instr, Op};
    use std::sync::Arc;

    pub(crate) fn image_from(instrs: &[Instr]) -> VmImage {
        let mut bytes = Vec::new();
        for i in instrs {
            bytes.extend_from_slice(&encode(i).to_le_bytes());
        }
        VmImage {
            entry_pc: 0,
            code: Box::new(MemCodeStore(Arc::from(bytes.into_boxed_slice()))),
            data: vec![0; 64],
            bss_size: 64,
        }
    }

    fn vm_with(instrs: &[Instr]) -> Vm {
        let mut vm = Vm::new(VmConfig::default());
        vm.load(Pid(1), image_from(instrs)).unwrap();
        vm.set_context(Pid(1)).unwrap();
        vm
    }

    #[test]
    fn add_sets_flags_and_advances_pc() {
        let mut vm = vm_with(&[
            Instr::imm(Op::Ldi, 2, 0, 7),
            Instr::imm(Op::Ldi, 3, 0, -7),
            Instr::reg(Op::Add, 1, 2, 3),
            Instr::reg(Op::Brk, 0, 0, 0),
        ]);
        for _ in 0..2 {
            assert_eq!(vm.step().unwrap().reason, StopReason::Ok);
        }
        let r = vm.step().unwrap();
        assert_eq!(r.reason, StopReason::Ok);
        assert_eq!(r.pc, 12);
        assert_eq!(vm.reg_get(Pid(1), RegSel::R(1)).unwrap(), 0);
        let psw = Psw::from_bits_truncate(vm.reg_get(Pid(1), RegSel::Psw).unwrap() as u8);
        assert!(psw.contains(Psw::Z), "7 + -7 must set Z");
        assert!(psw.contains(Psw::C), "unsigned wrap sets C");
        assert_eq!(vm.step().unwrap().reason, StopReason::Break);
    }

    #[test]
    fn divide_by_zero_latches_a_fault() {
        let mut vm = vm_with(&[
            Instr::imm(Op::Ldi, 2, 0, 10),
            Instr::imm(Op::Ldi, 3, 0, 0),
            Instr::reg(Op::Div, 1, 2, 3),
        ]);
        vm.step().unwrap();
        vm.step().unwrap();
        let r = vm.step().unwrap();
        assert_eq!(r.reason, StopReason::Fault(FaultKind::DivideByZero));
        assert_eq!(r.pc, 8, "pc stays at the faulting instruction");
        // Re-stepping a faulted task reports the same fault and executes
        // nothing.
        let again = vm.step().unwrap();
        assert_eq!(again.reason, StopReason::Fault(FaultKind::DivideByZero));
        assert_eq!(again.pc, 8);
    }

    #[test]
    fn division_truncates_toward_zero() {
        let mut vm = vm_with(&[
            Instr::imm(Op::Ldi, 2, 0, -7),
            Instr::imm(Op::Ldi, 3, 0, 2),
            Instr::reg(Op::Div, 1, 2, 3),
            Instr::reg(Op::Brk, 0, 0, 0),
        ]);
        for _ in 0..3 {
            vm.step().unwrap();
        }
        assert_eq!(vm.reg_get(Pid(1), RegSel::R(1)).unwrap() as i32, -3);
    }

    #[test]
    fn svc_reports_module_and_function_with_pc_advanced() {
        let mut vm = vm_with(&[Instr::imm(Op::Svc, 0, 0, 0x0502)]);
        let r = vm.step().unwrap();
        assert_eq!(r.reason, StopReason::Svc { module: 0x05, function: 0x02 });
        assert_eq!(r.pc, 4);
    }

    #[test]
    fn call_and_ret_window_the_registers() {
        // main: LDI r0,5 ; CALL frame=4, f ; BRK
        // f:    LDI r0,9 ; RET
        let mut vm = vm_with(&[
            Instr::imm(Op::Ldi, 0, 0, 5),
            Instr::imm(Op::Call, 4, 0, 1), // skip the BRK
            Instr::reg(Op::Brk, 0, 0, 0),
            Instr::imm(Op::Ldi, 0, 0, 9),
            Instr::reg(Op::Ret, 0, 0, 0),
        ]);
        vm.step().unwrap(); // ldi
        vm.step().unwrap(); // call
        assert_eq!(vm.reg_get(Pid(1), RegSel::Wp).unwrap(), 4);
        assert_eq!(
            vm.reg_get(Pid(1), RegSel::R(0)).unwrap(),
            0,
            "callee window must not see the caller's r0",
        );
        vm.step().unwrap(); // ldi r0,9 in callee window
        vm.step().unwrap(); // ret
        assert_eq!(vm.reg_get(Pid(1), RegSel::Wp).unwrap(), 0);
        assert_eq!(
            vm.reg_get(Pid(1), RegSel::R(0)).unwrap(),
            5,
            "caller's r0 must be restored by the window walk-down",
        );
        assert_eq!(vm.step().unwrap().reason, StopReason::Break);
    }

    #[test]
    fn runaway_recursion_overflows_the_stack() {
        // f: CALL frame=0, f  (self-call forever)
        let mut vm = vm_with(&[Instr::imm(Op::Call, 0, 0, -1)]);
        let mut last = None;
        for _ in 0..2048 {
            let r = vm.step().unwrap();
            if let StopReason::Fault(f) = r.reason {
                last = Some(f);
                break;
            }
        }
        match last {
            Some(FaultKind::StackOverflow { .. }) => {}
            other => panic!("expected StackOverflow, got {other:?}"),
        }
    }

    #[test]
    fn clock_stops_early_on_break() {
        let mut vm = vm_with(&[
            Instr::reg(Op::Nop, 0, 0, 0),
            Instr::reg(Op::Brk, 0, 0, 0),
            Instr::reg(Op::Nop, 0, 0, 0),
        ]);
        let (r, executed) = vm.clock(10).unwrap();
        assert_eq!(r.reason, StopReason::Break);
        assert_eq!(executed, 2);
        assert_eq!(r.pc, 8);
    }

    #[test]
    fn set_context_does_not_move_register_arenas() {
        let mut vm = Vm::new(VmConfig { reg_window_slots: 4096, ..VmConfig::default() });
        vm.load(Pid(1), image_from(&[Instr::reg(Op::Nop, 0, 0, 0)])).unwrap();
        vm.load(Pid(2), image_from(&[Instr::reg(Op::Nop, 0, 0, 0)])).unwrap();
        let p1 = vm.context(Pid(1)).unwrap().regs.as_ptr();
        let p2 = vm.context(Pid(2)).unwrap().regs.as_ptr();
        vm.set_context(Pid(1)).unwrap();
        vm.set_context(Pid(2)).unwrap();
        vm.set_context(Pid(1)).unwrap();
        // Swapping contexts exchanges a selector, not the arenas; the
        // arena storage must not have been copied or reallocated.
        assert_eq!(vm.context(Pid(1)).unwrap().regs.as_ptr(), p1);
        assert_eq!(vm.context(Pid(2)).unwrap().regs.as_ptr(), p2);
    }

    #[test]
    fn unaligned_branch_target_faults_on_fetch() {
        // JMP lands between instructions only if the encoding allowed it;
        // word-offset branches cannot be unaligned, so instead jump past
        // the end of code.
        let mut vm = vm_with(&[Instr::imm(Op::Jmp, 0, 0, 100)]);
        let r = vm.step().unwrap();
        assert_eq!(r.reason, StopReason::Ok);
        let r = vm.step().unwrap();
        match r.reason {
            StopReason::Fault(FaultKind::OutOfBounds { .. }) => {}
            other => panic!("expected OutOfBounds after wild jump, got {other:?}"),
        }
    }

    #[test]
    fn sp_stays_inside_stack_bounds_at_every_boundary() {
        let mut vm = vm_with(&[
            Instr::imm(Op::Ldi, 0, 0, 1),
            Instr::imm(Op::Call, 2, 0, 1),
            Instr::reg(Op::Brk, 0, 0, 0),
            Instr::imm(Op::Ldi, 1, 0, 2),
            Instr::reg(Op::Ret, 0, 0, 0),
        ]);
        loop {
            let ctx = vm.context(Pid(1)).unwrap();
            let (base, limit) = ctx.stack_bounds();
            assert!(
                ctx.sp() >= base && ctx.sp() < limit,
                "sp {:#x} escaped [{base:#x}, {limit:#x})",
                ctx.sp(),
            );
            match vm.step().unwrap().reason {
                StopReason::Ok => {}
                _ => break,
            }
        }
    }
}
