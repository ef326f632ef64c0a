// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Debug sessions: the single-attach lock, breakpoint tables, and the
//! step operations.
//!
//! Exactly one debugger may be attached at a time. The keepalive grace
//! window doubles as the reconnect window: a session whose client has
//! been silent for longer than the grace period lapses at the next tick,
//! after which any client may attach fresh (with the event stream
//! reset); within the window the same client resumes its session and
//! replays unacknowledged lossless events.

use std::collections::{BTreeSet, HashMap};

use hsx_abi::{AuthLevel, EventCategory, Pid, TaskState};
use hsx_isa::{Form, Op};
use hsx_vm::{RegSel, StopReason};
use serde_json::json;

use crate::ringbuf::Trace;
use crate::{Event, ExecError, Executive};

/// Server-side state of the attached debugger.
pub(crate) struct Session {
    pub id: u64,
    pub client: String,
    pub auth: AuthLevel,
    pub last_keepalive_us: u64,
    /// Permanent breakpoints, per task.
    breakpoints: HashMap<u16, BTreeSet<u32>>,
    /// One-shot breakpoints planted by step-over/step-out.
    temps: HashMap<u16, BTreeSet<u32>>,
}

impl Session {
    pub(crate) fn has_breakpoints(&self, pid: Pid) -> bool {
        self.breakpoints.get(&pid.0).is_some_and(|s| !s.is_empty())
            || self.temps.get(&pid.0).is_some_and(|s| !s.is_empty())
    }

    fn contains(&self, pid: Pid, pc: u32) -> bool {
        self.breakpoints.get(&pid.0).is_some_and(|s| s.contains(&pc))
            || self.temps.get(&pid.0).is_some_and(|s| s.contains(&pc))
    }
}

/// Result of `session.open`.
#[derive(Clone, Debug, serde::Serialize)]
pub struct SessionInfo {
    pub session_id: u64,
    pub resumed: bool,
    pub version: u32,
}

impl Executive {
    /// Attaches a debugger. A second client is refused while the current
    /// session's keepalive is fresh; the same client reconnecting within
    /// the grace window resumes with its sequence numbers intact.
    pub fn attach(&mut self, client: &str, auth: AuthLevel) -> Result<SessionInfo, ExecError> {
        if let Some(s) = &mut self.session {
            if s.client == client {
                s.last_keepalive_us = self.now_us;
                s.auth = auth;
                return Ok(SessionInfo {
                    session_id: s.id,
                    resumed: true,
                    version: crate::EXEC_VERSION,
                });
            }
            return Err(ExecError::SessionBusy);
        }
        let id = self.ticks.wrapping_mul(0x9E37_79B9).wrapping_add(self.now_us) | 1;
        self.session = Some(Session {
            id,
            client: client.to_string(),
            auth,
            last_keepalive_us: self.now_us,
            breakpoints: HashMap::new(),
            temps: HashMap::new(),
        });
        Ok(SessionInfo { session_id: id, resumed: false, version: crate::EXEC_VERSION })
    }

    /// Explicit close: releases the lock and resets per-session state.
    pub fn detach(&mut self) -> Result<(), ExecError> {
        self.session.take().ok_or(ExecError::NoSession)?;
        self.events.reset();
        Ok(())
    }

    /// Refreshes the session keepalive; every control-plane request
    /// routes through this.
    pub fn touch_session(&mut self) {
        let now = self.now_us;
        if let Some(s) = &mut self.session {
            s.last_keepalive_us = now;
        }
    }

    pub fn session_auth(&self) -> AuthLevel {
        self.session.as_ref().map(|s| s.auth).unwrap_or(AuthLevel::User)
    }

    /// Lapses the session when its keepalive ages past the grace
    /// window. Runs every tick.
    pub(crate) fn expire_session(&mut self) {
        let grace_us = self.config.keepalive_grace_ms * 1000;
        let lapsed = self
            .session
            .as_ref()
            .is_some_and(|s| self.now_us.saturating_sub(s.last_keepalive_us) > grace_us);
        if lapsed {
            self.session = None;
            self.events.reset();
        }
    }

    fn session_mut(&mut self) -> Result<&mut Session, ExecError> {
        self.session.as_mut().ok_or(ExecError::NoSession)
    }

    /// Sets a breakpoint. `temp` marks the one-shot breakpoints used by
    /// step-over and step-out.
    pub fn bp_set(&mut self, pid: Pid, addr: u32, temp: bool) -> Result<(), ExecError> {
        let s = self.session_mut()?;
        let table = if temp { &mut s.temps } else { &mut s.breakpoints };
        table.entry(pid.0).or_default().insert(addr);
        Ok(())
    }

    pub fn bp_clear(&mut self, pid: Pid, addr: u32) -> Result<(), ExecError> {
        let s = self.session_mut()?;
        if let Some(set) = s.breakpoints.get_mut(&pid.0) {
            set.remove(&addr);
        }
        if let Some(set) = s.temps.get_mut(&pid.0) {
            set.remove(&addr);
        }
        Ok(())
    }

    pub fn bp_list(&self, pid: Pid) -> Result<Vec<u32>, ExecError> {
        let s = self.session.as_ref().ok_or(ExecError::NoSession)?;
        Ok(s.breakpoints
            .get(&pid.0)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }

    /// Checks the breakpoint table before an instruction runs. On a hit
    /// the task stops, a `break` event fires, and a temp breakpoint at
    /// the address is atomically cleared.
    pub(crate) fn hit_breakpoint(&mut self, pid: Pid, pc: u32) -> bool {
        let hit = self
            .session
            .as_ref()
            .is_some_and(|s| s.contains(pid, pc));
        if !hit {
            return false;
        }
        self.clear_temp_breakpoint(pid, pc);
        self.tasks.stop(pid);
        self.trace.record(Trace::BreakpointHit { pid, pc }, self.now_us);
        self.emit(EventCategory::Break, pid, json!({ "pid": pid.0, "pc": pc }));
        true
    }

    pub(crate) fn clear_temp_breakpoint(&mut self, pid: Pid, pc: u32) {
        if let Some(s) = &mut self.session {
            if let Some(set) = s.temps.get_mut(&pid.0) {
                set.remove(&pc);
            }
        }
    }

    /// Single-steps a task under debugger control.
    ///
    /// The breakpoint check runs *before* each instruction: a step onto
    /// a breakpoint executes nothing and reports the break. After the
    /// requested steps the task is left `Stopped`.
    pub fn step_task(&mut self, pid: Pid, n: u32) -> Result<u32, ExecError> {
        self.session.as_ref().ok_or(ExecError::NoSession)?;
        let task = self.tasks.get(pid).ok_or(ExecError::NoSuchTask(pid.0))?;
        if !matches!(task.state, TaskState::Stopped | TaskState::Ready | TaskState::New) {
            return Err(ExecError::NotStopped);
        }
        self.vm.set_context(pid)?;

        for _ in 0..n {
            let pc = self.vm.reg_get(pid, RegSel::Pc)?;
            if self.hit_breakpoint(pid, pc) {
                return Ok(pc);
            }
            let result = self.vm.step()?;
            if self.trace.enabled() {
                self.emit(
                    EventCategory::TraceStep,
                    pid,
                    json!({ "pid": pid.0, "pc": result.pc }),
                );
            }
            match result.reason {
                StopReason::Ok => {}
                StopReason::Break => {
                    self.tasks.stop(pid);
                    self.clear_temp_breakpoint(pid, result.pc);
                    self.emit(
                        EventCategory::Break,
                        pid,
                        json!({ "pid": pid.0, "pc": result.pc }),
                    );
                    return Ok(result.pc);
                }
                StopReason::Fault(kind) => {
                    self.apply_fault(pid, kind, result.pc);
                    return Ok(result.pc);
                }
                StopReason::Svc { module, function } => {
                    match self.dispatch_svc(pid, module, function) {
                        crate::svc::SvcDisposition::Continue => {}
                        crate::svc::SvcDisposition::Parked => break,
                        crate::svc::SvcDisposition::Exited => {
                            return Ok(result.pc);
                        }
                    }
                }
            }
        }

        // The debugger holds the task after a step burst.
        if self.tasks.get(pid).is_some_and(|t| {
            matches!(t.state, TaskState::Ready | TaskState::Running | TaskState::Stopped | TaskState::New)
        }) {
            self.tasks.stop(pid);
            let pc = self.vm.reg_get(pid, RegSel::Pc)?;
            self.emit(
                EventCategory::Stopped,
                pid,
                json!({ "pid": pid.0, "pc": pc, "reason": "step" }),
            );
            self.drain_subsystem_events();
            return Ok(pc);
        }
        let pc = self.vm.reg_get(pid, RegSel::Pc).unwrap_or(0);
        self.drain_subsystem_events();
        Ok(pc)
    }

    /// Step-over: a CALL runs to its return address via a temp
    /// breakpoint; anything else is a plain single step.
    pub fn step_over(&mut self, pid: Pid) -> Result<(), ExecError> {
        self.session.as_ref().ok_or(ExecError::NoSession)?;
        let pc = self.vm.reg_get(pid, RegSel::Pc)?;
        let code = self.code.get(&pid.0).ok_or(ExecError::NoSuchTask(pid.0))?;
        let at = pc as usize;
        let is_call = code
            .get(at..at + 4)
            .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
            .and_then(|w| hsx_isa::decode(w).ok())
            .is_some_and(|i| i.op == Op::Call && i.op.form() == Form::CallForm);
        if is_call {
            self.bp_set(pid, pc + hsx_isa::WORD, true)?;
            self.continue_task(pid)
        } else {
            self.step_task(pid, 1).map(|_| ())
        }
    }

    /// Step-out: plants a temp breakpoint at the current frame's return
    /// address (read from the stack) and continues.
    pub fn step_out(&mut self, pid: Pid) -> Result<(), ExecError> {
        self.session.as_ref().ok_or(ExecError::NoSession)?;
        let ctx = self.vm.context_mut(pid)?;
        let ret = ctx
            .read_stack_word(4)
            .map_err(|f| ExecError::BadRequest(format!("cannot read frame: {f:?}")))?;
        self.bp_set(pid, ret, true)?;
        self.continue_task(pid)
    }

    /// Resumes a stopped task.
    pub fn continue_task(&mut self, pid: Pid) -> Result<(), ExecError> {
        let task = self.tasks.get(pid).ok_or(ExecError::NoSuchTask(pid.0))?;
        if !matches!(task.state, TaskState::Stopped | TaskState::New) {
            return Err(ExecError::NotStopped);
        }
        self.tasks.admit(pid);
        self.emit(EventCategory::Continued, pid, json!({ "pid": pid.0 }));
        Ok(())
    }

    /// Stops a running task at its next instruction boundary (it is
    /// removed from the ready queue immediately; the VM never has an
    /// instruction in flight between ticks).
    pub fn stop_task(&mut self, pid: Pid) -> Result<(), ExecError> {
        self.tasks.get(pid).ok_or(ExecError::NoSuchTask(pid.0))?;
        self.tasks.stop(pid);
        let pc = self.vm.reg_get(pid, RegSel::Pc).unwrap_or(0);
        self.emit(
            EventCategory::Stopped,
            pid,
            json!({ "pid": pid.0, "pc": pc, "reason": "pause" }),
        );
        Ok(())
    }

    /// Debugger register read, gated on an attached session.
    pub fn debug_reg_get(&self, pid: Pid, sel: RegSel) -> Result<u32, ExecError> {
        self.session.as_ref().ok_or(ExecError::NoSession)?;
        Ok(self.vm.reg_get(pid, sel)?)
    }

    /// Debugger register write, gated on an attached session.
    pub fn debug_reg_set(&mut self, pid: Pid, sel: RegSel, v: u32) -> Result<(), ExecError> {
        self.session.as_ref().ok_or(ExecError::NoSession)?;
        Ok(self.vm.reg_set(pid, sel, v)?)
    }

    // --- event delivery -----------------------------------------------

    /// Drains up to `max` events for the attached client.
    pub fn events_take(&mut self, max: usize) -> Vec<Event> {
        self.events.take_batch(max)
    }

    /// Acknowledges events up to and including `seq`.
    pub fn events_ack(&mut self, seq: u64) {
        self.events.ack(seq);
    }

    /// Unacknowledged lossless events, replayed after a reconnect.
    pub fn events_replay(&self) -> Vec<Event> {
        self.events.replay()
    }
}
