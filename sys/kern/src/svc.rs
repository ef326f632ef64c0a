// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SVC dispatch and the per-module handlers.
//!
//! Calling convention: arguments in R0-R3 of the current window, status
//! in R0, payload length or value in R1. Pointer arguments always travel
//! with an explicit length register. Guest pointers are translated
//! through the VM's paging layer; a bad pointer costs the caller an
//! `EINVAL`, not a fault -- faults are reserved for the VM's own memory
//! discipline.
//!
//! Dispatch is keyed by `(module, function)` over the enumerated
//! capability set; a pair outside the table is a `BadSvc` fault, per the
//! policy that undefined requests are malfunctions, not errors to retry.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::Arc;

use hsx_abi::{
    AuthLevel, Code, CommandFlags, CommandFn, EventCategory, ExecFn, FaultKind, FsFn,
    Handle, MailboxFn, Oid, Pid, SvcModule, TaskFn, ValueFlags, ValueFn, WaitReason,
    TIMEOUT_INFINITE, TIMEOUT_POLL,
};
use hsx_mailbox::{MailboxError, WaitKind};
use hsx_registry::{Descriptor, RegistryError};
use hsx_vm::RegSel;
use serde_json::json;

use crate::task::PendingOp;
use crate::{Executive, HostHandler};

/// Sentinel return address planted under guest command handlers. The
/// scheduler completes the invocation when a handler's RET lands here;
/// it is far outside any code segment, so a stray jump to it cannot be
/// confused with normal control flow.
pub(crate) const CMD_RETURN_PC: u32 = 0xFFFF_FF00;

/// Upper bound on instructions a synchronously invoked command handler
/// may execute before it is declared faulty.
const HANDLER_STEP_LIMIT: u32 = 100_000;

/// How one SVC left its calling task.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum SvcDisposition {
    /// Return registers are set; the task keeps running.
    Continue,
    /// The task parked (mailbox wait or sleep).
    Parked,
    /// The task exited and has been torn down.
    Exited,
}

pub(crate) fn map_mailbox_error(e: MailboxError) -> Code {
    match e {
        MailboxError::NoSuchMailbox => Code::NoEnt,
        MailboxError::Permission => Code::Perm,
        MailboxError::Exists => Code::Inval,
        MailboxError::OutOfSlots => Code::Again,
        MailboxError::BadName => Code::Inval,
        MailboxError::WouldBlock => Code::Again,
        MailboxError::Closed => Code::BadF,
        MailboxError::Empty => Code::Again,
        MailboxError::BadHandle => Code::BadF,
        MailboxError::TooBig => Code::Inval,
    }
}

fn map_registry_error(e: RegistryError) -> Code {
    match e {
        RegistryError::Duplicate => Code::Inval,
        RegistryError::PoolExhausted => Code::Again,
        RegistryError::NoSuchValue | RegistryError::NoSuchCommand => Code::NoEnt,
        RegistryError::Permission => Code::Perm,
        RegistryError::Busy => Code::Again,
    }
}

/// A queued asynchronous command invocation.
struct AsyncJob {
    oid: Oid,
    caller: Pid,
    reply: Handle,
    args: Vec<u8>,
    kind: AsyncKind,
}

enum AsyncKind {
    Host(Arc<HostHandler>),
    Guest { owner: Pid, handler: u32 },
}

/// Result of an async invocation, ready to be posted as a `{oid, status,
/// payload}` envelope.
pub(crate) struct AsyncCompletion {
    pub oid: Oid,
    pub caller: Pid,
    pub reply: Handle,
    pub status: Code,
    pub payload: Vec<u8>,
}

/// Bounded executor for asynchronous commands.
///
/// Host handlers run on a small worker pool; guest handlers cannot leave
/// the executive thread (the VM is single-threaded by design), so they
/// queue here and run one per tick. Either way the only output channel
/// is a mailbox post, so completion order is serialised by the
/// scheduler.
pub(crate) struct AsyncExecutor {
    guest_queue: VecDeque<AsyncJob>,
    job_tx: mpsc::Sender<(AsyncJob, mpsc::Sender<AsyncCompletion>)>,
    done_tx: mpsc::Sender<AsyncCompletion>,
    done_rx: mpsc::Receiver<AsyncCompletion>,
    in_flight_host: usize,
}

impl AsyncExecutor {
    pub(crate) fn new(workers: usize) -> Self {
        let (job_tx, job_rx) =
            mpsc::channel::<(AsyncJob, mpsc::Sender<AsyncCompletion>)>();
        let (done_tx, done_rx) = mpsc::channel();
        let job_rx = Arc::new(std::sync::Mutex::new(job_rx));
        for _ in 0..workers.max(1) {
            let rx = Arc::clone(&job_rx);
            std::thread::spawn(move || loop {
                let job = {
                    let guard = rx.lock().unwrap();
                    guard.recv()
                };
                let Ok((job, done)) = job else { break };
                let AsyncKind::Host(handler) = &job.kind else { continue };
                let completion = match handler(&job.args) {
                    Ok(payload) => AsyncCompletion {
                        oid: job.oid,
                        caller: job.caller,
                        reply: job.reply,
                        status: Code::Ok,
                        payload,
                    },
                    Err(code) => AsyncCompletion {
                        oid: job.oid,
                        caller: job.caller,
                        reply: job.reply,
                        status: code,
                        payload: Vec::new(),
                    },
                };
                let _ = done.send(completion);
            });
        }
        AsyncExecutor {
            guest_queue: VecDeque::new(),
            job_tx,
            done_tx,
            done_rx,
            in_flight_host: 0,
        }
    }

    fn submit_host(&mut self, job: AsyncJob) {
        self.in_flight_host += 1;
        let _ = self.job_tx.send((job, self.done_tx.clone()));
    }

    fn submit_guest(&mut self, job: AsyncJob) {
        self.guest_queue.push_back(job);
    }

    fn pop_guest(&mut self) -> Option<AsyncJob> {
        self.guest_queue.pop_front()
    }

    fn drain_completions(&mut self) -> Vec<AsyncCompletion> {
        let mut out = Vec::new();
        while let Ok(c) = self.done_rx.try_recv() {
            self.in_flight_host -= 1;
            out.push(c);
        }
        out
    }

    pub(crate) fn has_work(&self) -> bool {
        !self.guest_queue.is_empty() || self.in_flight_host > 0
    }
}

impl Executive {
    fn arg(&self, pid: Pid, r: u8) -> u32 {
        self.vm.reg_get(pid, RegSel::R(r)).unwrap_or(0)
    }

    fn read_guest(&mut self, pid: Pid, ptr: u32, len: u32) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; len as usize];
        match self.vm.read_bytes(pid, ptr, &mut buf) {
            Ok(Ok(())) => Some(buf),
            _ => None,
        }
    }

    fn read_guest_str(&mut self, pid: Pid, ptr: u32, len: u32) -> Option<String> {
        let bytes = self.read_guest(pid, ptr, len)?;
        String::from_utf8(bytes).ok()
    }

    /// Parks the calling task on a mailbox with the op to retry.
    fn park_mailbox(
        &mut self,
        pid: Pid,
        handle: Handle,
        pending: PendingOp,
        kind: WaitKind,
        timeout_us: u32,
    ) -> SvcDisposition {
        let deadline = match timeout_us {
            TIMEOUT_INFINITE => None,
            t => Some(self.now_us + t as u64),
        };
        let _ = self.mailboxes.add_waiter(pid, handle, kind);
        self.tasks.park(pid, WaitReason::Mailbox(handle), deadline);
        if let Some(t) = self.tasks.get_mut(pid) {
            t.pending = Some(pending);
        }
        self.trace
            .record(crate::ringbuf::Trace::Park { pid }, self.now_us);
        SvcDisposition::Parked
    }

    /// Routes one trap. Unknown module or function pairs fault the
    /// caller with `BadSvc`.
    pub(crate) fn dispatch_svc(
        &mut self,
        pid: Pid,
        module: u8,
        function: u8,
    ) -> SvcDisposition {
        let pc = self.vm.reg_get(pid, RegSel::Pc).unwrap_or(0);
        let Ok(module) = SvcModule::try_from(module) else {
            self.apply_fault(pid, FaultKind::BadSvc { module, function }, pc);
            return SvcDisposition::Exited;
        };
        let bad = |exec: &mut Executive| {
            exec.apply_fault(
                pid,
                FaultKind::BadSvc { module: module as u8, function },
                pc,
            );
            SvcDisposition::Exited
        };

        match module {
            SvcModule::Task => match TaskFn::try_from(function) {
                Ok(TaskFn::Exit) => self.svc_task_exit(pid),
                Ok(TaskFn::ConsoleWrite) => self.svc_console_write(pid),
                Err(()) => bad(self),
            },
            SvcModule::Mailbox => match MailboxFn::try_from(function) {
                Ok(MailboxFn::Open) => self.svc_mbox_open(pid),
                Ok(MailboxFn::Create) => self.svc_mbox_create(pid),
                Ok(MailboxFn::Send) => self.svc_mbox_send(pid),
                Ok(MailboxFn::Recv) => self.svc_mbox_recv(pid),
                Ok(MailboxFn::Peek) => self.svc_mbox_peek(pid),
                Ok(MailboxFn::Tap) => self.svc_mbox_tap(pid),
                Ok(MailboxFn::Close) => self.svc_mbox_close(pid),
                Err(()) => bad(self),
            },
            SvcModule::Exec => match ExecFn::try_from(function) {
                Ok(ExecFn::Version) => {
                    self.set_svc_return(pid, Code::Ok, crate::EXEC_VERSION);
                    SvcDisposition::Continue
                }
                Ok(ExecFn::Ps) => self.svc_exec_ps(pid),
                Ok(ExecFn::Sleep) => self.svc_exec_sleep(pid),
                Err(()) => bad(self),
            },
            SvcModule::Value => match ValueFn::try_from(function) {
                Ok(ValueFn::Register) => self.svc_value_register(pid),
                Ok(ValueFn::Get) => self.svc_value_get(pid),
                Ok(ValueFn::Set) => self.svc_value_set(pid),
                Ok(ValueFn::Subscribe) => self.svc_value_subscribe(pid, true),
                Ok(ValueFn::Unsubscribe) => self.svc_value_subscribe(pid, false),
                Err(()) => bad(self),
            },
            SvcModule::Command => match CommandFn::try_from(function) {
                Ok(CommandFn::Register) => self.svc_cmd_register(pid),
                Ok(CommandFn::Call) => self.svc_cmd_call(pid),
                Ok(CommandFn::CallAsync) => self.svc_cmd_call_async(pid),
                Err(()) => bad(self),
            },
            SvcModule::Can | SvcModule::HalCan => self.svc_can_tx(pid),
            SvcModule::Fs | SvcModule::HalFs => match FsFn::try_from(function) {
                Ok(f) => self.svc_fs(pid, f),
                Err(()) => bad(self),
            },
            SvcModule::HalUart => self.svc_console_write(pid),
            SvcModule::HalTimer => {
                // Function 0: read the kernel microsecond clock (low
                // word in R1).
                self.set_svc_return(pid, Code::Ok, self.now_us as u32);
                SvcDisposition::Continue
            }
            SvcModule::HalFram | SvcModule::HalGpio | SvcModule::HalI2c
            | SvcModule::HalSpi => {
                // Reserved modules without a composed backend.
                self.set_svc_return(pid, Code::NoEnt, 0);
                SvcDisposition::Continue
            }
        }
    }

    // --- TASK/STDIO ----------------------------------------------------

    fn svc_task_exit(&mut self, pid: Pid) -> SvcDisposition {
        let code = self.arg(pid, 0);
        // A command handler exiting the task still completes its
        // invocation for event ordering.
        if let Some(oid) = self.tasks.get(pid).and_then(|t| t.in_flight_command) {
            self.registry.complete_command(oid);
            self.emit(
                EventCategory::CmdCompleted,
                pid,
                json!({ "oid": oid.0, "status": "OK" }),
            );
        }
        self.teardown_task(pid, code);
        SvcDisposition::Exited
    }

    fn svc_console_write(&mut self, pid: Pid) -> SvcDisposition {
        let (ptr, len) = (self.arg(pid, 0), self.arg(pid, 1));
        let Some(bytes) = self.read_guest(pid, ptr, len) else {
            self.set_svc_return(pid, Code::Inval, 0);
            return SvcDisposition::Continue;
        };
        match self.drivers.console.write(&bytes) {
            Ok(n) => self.set_svc_return(pid, Code::Ok, n as u32),
            Err(c) => self.set_svc_return(pid, c, 0),
        }
        SvcDisposition::Continue
    }

    // --- MAILBOX -------------------------------------------------------

    fn svc_mbox_open(&mut self, pid: Pid) -> SvcDisposition {
        let (ptr, len, mode) = (self.arg(pid, 0), self.arg(pid, 1), self.arg(pid, 2));
        let Some(name) = self.read_guest_str(pid, ptr, len) else {
            self.set_svc_return(pid, Code::Inval, 0);
            return SvcDisposition::Continue;
        };
        let mode = hsx_abi::ModeMask::from_bits_truncate(mode);
        match self.mailboxes.open(pid, &name, mode) {
            Ok(h) => self.set_svc_return(pid, Code::Ok, h.0),
            Err(e) => self.set_svc_return(pid, map_mailbox_error(e), 0),
        }
        SvcDisposition::Continue
    }

    fn svc_mbox_create(&mut self, pid: Pid) -> SvcDisposition {
        let (ptr, len, cap, mode) = (
            self.arg(pid, 0),
            self.arg(pid, 1),
            self.arg(pid, 2),
            self.arg(pid, 3),
        );
        let Some(name) = self.read_guest_str(pid, ptr, len) else {
            self.set_svc_return(pid, Code::Inval, 0);
            return SvcDisposition::Continue;
        };
        let mode = hsx_abi::ModeMask::from_bits_truncate(mode);
        match self.mailboxes.create(pid, &name, cap as usize, mode) {
            Ok(h) => self.set_svc_return(pid, Code::Ok, h.0),
            Err(e) => self.set_svc_return(pid, map_mailbox_error(e), 0),
        }
        self.drain_subsystem_events();
        SvcDisposition::Continue
    }

    fn svc_mbox_send(&mut self, pid: Pid) -> SvcDisposition {
        let (h, ptr, len, timeout) = (
            self.arg(pid, 0),
            self.arg(pid, 1),
            self.arg(pid, 2),
            self.arg(pid, 3),
        );
        let handle = Handle(h);
        let Some(payload) = self.read_guest(pid, ptr, len) else {
            self.set_svc_return(pid, Code::Inval, 0);
            return SvcDisposition::Continue;
        };
        match self.mailboxes.send(pid, handle, &payload) {
            Ok((n, wakes)) => {
                for w in wakes {
                    self.apply_wake(w);
                }
                self.set_svc_return(pid, Code::Ok, n as u32);
                SvcDisposition::Continue
            }
            Err(MailboxError::WouldBlock) if timeout != TIMEOUT_POLL => self.park_mailbox(
                pid,
                handle,
                PendingOp::MailboxSend { handle, ptr, len },
                WaitKind::Send { payload_len: len as usize },
                timeout,
            ),
            Err(e) => {
                self.set_svc_return(pid, map_mailbox_error(e), 0);
                SvcDisposition::Continue
            }
        }
    }

    fn svc_mbox_recv(&mut self, pid: Pid) -> SvcDisposition {
        let (h, out_ptr, out_cap, timeout) = (
            self.arg(pid, 0),
            self.arg(pid, 1),
            self.arg(pid, 2),
            self.arg(pid, 3),
        );
        let handle = Handle(h);
        match self.mailboxes.recv(pid, handle) {
            Ok((msg, wakes)) => {
                for w in wakes {
                    self.apply_wake(w);
                }
                self.finish_recv(pid, msg, out_ptr, out_cap);
                SvcDisposition::Continue
            }
            Err(MailboxError::WouldBlock) if timeout != TIMEOUT_POLL => self.park_mailbox(
                pid,
                handle,
                PendingOp::MailboxRecv { handle, out_ptr, out_cap },
                WaitKind::Recv,
                timeout,
            ),
            Err(e) => {
                self.set_svc_return(pid, map_mailbox_error(e), 0);
                SvcDisposition::Continue
            }
        }
    }

    fn svc_mbox_peek(&mut self, pid: Pid) -> SvcDisposition {
        let (h, out_ptr, out_cap) =
            (self.arg(pid, 0), self.arg(pid, 1), self.arg(pid, 2));
        match self.mailboxes.peek(pid, Handle(h)) {
            Ok(msg) => self.finish_recv(pid, msg, out_ptr, out_cap),
            Err(e) => self.set_svc_return(pid, map_mailbox_error(e), 0),
        }
        SvcDisposition::Continue
    }

    fn svc_mbox_tap(&mut self, pid: Pid) -> SvcDisposition {
        let h = Handle(self.arg(pid, 0));
        match self.mailboxes.tap(pid, h) {
            Ok(()) => self.set_svc_return(pid, Code::Ok, h.0),
            Err(e) => self.set_svc_return(pid, map_mailbox_error(e), 0),
        }
        SvcDisposition::Continue
    }

    fn svc_mbox_close(&mut self, pid: Pid) -> SvcDisposition {
        let h = Handle(self.arg(pid, 0));
        match self.mailboxes.close(pid, h) {
            Ok(wakes) => {
                for w in wakes {
                    self.apply_wake(w);
                }
                self.registry.on_mailbox_closed(h);
                self.set_svc_return(pid, Code::Ok, 0);
            }
            Err(e) => self.set_svc_return(pid, map_mailbox_error(e), 0),
        }
        SvcDisposition::Continue
    }

    // --- EXEC ----------------------------------------------------------

    fn svc_exec_ps(&mut self, pid: Pid) -> SvcDisposition {
        let (out_ptr, out_cap) = (self.arg(pid, 0), self.arg(pid, 1));
        // Packed rows of {pid u16, state u8}.
        let mut bytes = Vec::new();
        for t in self.tasks.iter() {
            let state = match t.state {
                hsx_abi::TaskState::New => 0u8,
                hsx_abi::TaskState::Ready => 1,
                hsx_abi::TaskState::Running => 2,
                hsx_abi::TaskState::Blocked(_) => 3,
                hsx_abi::TaskState::Stopped => 4,
                hsx_abi::TaskState::Faulted(_) => 5,
            };
            bytes.extend_from_slice(&t.pid.0.to_le_bytes());
            bytes.push(state);
        }
        bytes.truncate(out_cap as usize);
        match self.vm.write_bytes(pid, out_ptr, &bytes) {
            Ok(Ok(())) => self.set_svc_return(pid, Code::Ok, bytes.len() as u32),
            _ => self.set_svc_return(pid, Code::Inval, 0),
        }
        SvcDisposition::Continue
    }

    fn svc_exec_sleep(&mut self, pid: Pid) -> SvcDisposition {
        let duration_us = self.arg(pid, 0);
        if duration_us == 0 {
            self.set_svc_return(pid, Code::Ok, 0);
            return SvcDisposition::Continue;
        }
        let deadline = self.now_us + duration_us as u64;
        self.tasks
            .park(pid, WaitReason::SleepUntil(deadline), Some(deadline));
        if let Some(t) = self.tasks.get_mut(pid) {
            t.pending = Some(PendingOp::Sleep);
        }
        SvcDisposition::Parked
    }

    // --- VALUE ---------------------------------------------------------

    fn svc_value_register(&mut self, pid: Pid) -> SvcDisposition {
        let (oid, bits, packed, block_ptr) = (
            self.arg(pid, 0),
            self.arg(pid, 1),
            self.arg(pid, 2),
            self.arg(pid, 3),
        );
        let flags = ValueFlags::from_bits_truncate(packed as u8);
        let Ok(auth) = AuthLevel::try_from((packed >> 8) as u8) else {
            self.set_svc_return(pid, Code::Inval, 0);
            return SvcDisposition::Continue;
        };

        // Optional descriptor block: {name_ptr, name_len, unit_ptr,
        // unit_len} as four u32s in guest memory.
        let mut chain = Vec::new();
        if block_ptr != 0 {
            let Some(block) = self.read_guest(pid, block_ptr, 16) else {
                self.set_svc_return(pid, Code::Inval, 0);
                return SvcDisposition::Continue;
            };
            let word = |i: usize| {
                u32::from_le_bytes(block[i * 4..i * 4 + 4].try_into().unwrap())
            };
            if word(1) > 0 {
                match self.read_guest_str(pid, word(0), word(1)) {
                    Some(name) => chain.push(Descriptor::Name(name)),
                    None => {
                        self.set_svc_return(pid, Code::Inval, 0);
                        return SvcDisposition::Continue;
                    }
                }
            }
            if word(3) > 0 {
                match self.read_guest_str(pid, word(2), word(3)) {
                    Some(unit) => chain.push(Descriptor::Unit(unit)),
                    None => {
                        self.set_svc_return(pid, Code::Inval, 0);
                        return SvcDisposition::Continue;
                    }
                }
            }
        }
        if flags.contains(ValueFlags::PERSIST) {
            chain.push(Descriptor::Persist);
        }

        let initial = self
            .boot_values
            .get(&(oid as u16))
            .copied()
            .unwrap_or(bits as u16);
        match self.registry.register_value(
            pid,
            Oid(oid as u16),
            flags,
            auth,
            initial,
            &chain,
        ) {
            Ok(()) => self.set_svc_return(pid, Code::Ok, 0),
            Err(e) => self.set_svc_return(pid, map_registry_error(e), 0),
        }
        self.drain_subsystem_events();
        SvcDisposition::Continue
    }

    fn svc_value_get(&mut self, pid: Pid) -> SvcDisposition {
        let oid = Oid(self.arg(pid, 0) as u16);
        // Tasks read at user level; admin-gated values are host-only.
        match self.registry.get_value(oid, AuthLevel::User) {
            Ok(bits) => self.set_svc_return(pid, Code::Ok, bits as u32),
            Err(e) => self.set_svc_return(pid, map_registry_error(e), 0),
        }
        SvcDisposition::Continue
    }

    fn svc_value_set(&mut self, pid: Pid) -> SvcDisposition {
        let (oid, bits) = (self.arg(pid, 0), self.arg(pid, 1));
        match self
            .registry
            .set_value(pid, AuthLevel::User, Oid(oid as u16), bits as u16)
        {
            Ok(fx) => {
                self.apply_set_effects(fx);
                self.set_svc_return(pid, Code::Ok, 0);
            }
            Err(e) => self.set_svc_return(pid, map_registry_error(e), 0),
        }
        self.drain_subsystem_events();
        SvcDisposition::Continue
    }

    fn svc_value_subscribe(&mut self, pid: Pid, subscribe: bool) -> SvcDisposition {
        let (oid, handle) = (Oid(self.arg(pid, 0) as u16), Handle(self.arg(pid, 1)));
        if subscribe {
            match self.registry.subscribe(oid, handle) {
                Ok(()) => self.set_svc_return(pid, Code::Ok, 0),
                Err(e) => self.set_svc_return(pid, map_registry_error(e), 0),
            }
        } else {
            self.registry.unsubscribe(oid, handle);
            self.set_svc_return(pid, Code::Ok, 0);
        }
        SvcDisposition::Continue
    }

    // --- COMMAND -------------------------------------------------------

    fn svc_cmd_register(&mut self, pid: Pid) -> SvcDisposition {
        let (oid, handler, packed, pin) = (
            self.arg(pid, 0),
            self.arg(pid, 1),
            self.arg(pid, 2),
            self.arg(pid, 3),
        );
        let flags = CommandFlags::from_bits_truncate(packed as u8);
        let Ok(auth) = AuthLevel::try_from((packed >> 8) as u8) else {
            self.set_svc_return(pid, Code::Inval, 0);
            return SvcDisposition::Continue;
        };
        let pin = if flags.contains(CommandFlags::SECURE) {
            Some(pin)
        } else {
            None
        };
        match self
            .registry
            .register_command(pid, Oid(oid as u16), flags, auth, handler, &[], pin)
        {
            Ok(()) => self.set_svc_return(pid, Code::Ok, 0),
            Err(e) => self.set_svc_return(pid, map_registry_error(e), 0),
        }
        self.drain_subsystem_events();
        SvcDisposition::Continue
    }

    fn svc_cmd_call(&mut self, pid: Pid) -> SvcDisposition {
        let (oid, arg_ptr, arg_len, token) = (
            Oid(self.arg(pid, 0) as u16),
            self.arg(pid, 1),
            self.arg(pid, 2),
            self.arg(pid, 3),
        );
        let token = (token != 0).then_some(token);
        self.command_call(pid, oid, arg_ptr, arg_len, token, AuthLevel::User)
    }

    /// Shared sync-call path, used by the SVC (at user level) and the
    /// control plane's `cmd.call` (at the session's level).
    pub(crate) fn command_call(
        &mut self,
        pid: Pid,
        oid: Oid,
        arg_ptr: u32,
        arg_len: u32,
        token: Option<u32>,
        auth: AuthLevel,
    ) -> SvcDisposition {
        *self.cmd_calls.entry(oid.0).or_insert(0) += 1;
        let entry = match self.registry.begin_command(oid, auth, token) {
            Ok(e) => e,
            Err(e) => {
                let code = map_registry_error(e);
                self.emit(
                    EventCategory::CmdInvoked,
                    pid,
                    json!({ "oid": oid.0, "status": code_name(code) }),
                );
                self.set_svc_return(pid, code, 0);
                return SvcDisposition::Continue;
            }
        };
        self.emit(
            EventCategory::CmdInvoked,
            pid,
            json!({ "oid": oid.0, "status": "OK" }),
        );

        if entry.handler_address == 0 {
            // Host-provided command: run the registered closure inline.
            let args = self
                .read_guest(pid, arg_ptr, arg_len)
                .unwrap_or_default();
            let result = self
                .host_commands
                .get(&oid.0)
                .cloned()
                .map(|h| h(&args))
                .unwrap_or(Err(Code::NoEnt));
            self.registry.complete_command(oid);
            let (code, value) = match result {
                Ok(payload) => {
                    let v = payload
                        .get(..4)
                        .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
                        .unwrap_or(0);
                    (Code::Ok, v)
                }
                Err(c) => (c, 0),
            };
            self.emit(
                EventCategory::CmdCompleted,
                pid,
                json!({ "oid": oid.0, "status": code_name(code) }),
            );
            self.set_svc_return(pid, code, value);
            return SvcDisposition::Continue;
        }

        // Guest handler: run it to completion in the caller's context.
        if let Some(t) = self.tasks.get_mut(pid) {
            t.in_flight_command = Some(oid);
        }
        let outcome =
            self.run_guest_handler(pid, entry.handler_address, [arg_ptr, arg_len, 0, 0]);
        self.registry.complete_command(oid);
        match outcome {
            HandlerOutcome::Done { status, value } => {
                if let Some(t) = self.tasks.get_mut(pid) {
                    t.in_flight_command = None;
                }
                let code = Code::try_from(status).unwrap_or(Code::Io);
                self.emit(
                    EventCategory::CmdCompleted,
                    pid,
                    json!({ "oid": oid.0, "status": code_name(code) }),
                );
                self.set_svc_return(pid, code, value);
                SvcDisposition::Continue
            }
            HandlerOutcome::Exited => SvcDisposition::Exited,
            HandlerOutcome::Faulted => {
                // The fault event has already been emitted; report the
                // invocation as faulted too.
                self.emit(
                    EventCategory::CmdCompleted,
                    pid,
                    json!({ "oid": oid.0, "status": "HandlerFault" }),
                );
                SvcDisposition::Exited
            }
        }
    }

    fn svc_cmd_call_async(&mut self, pid: Pid) -> SvcDisposition {
        let (oid, reply, arg_ptr, arg_len) = (
            Oid(self.arg(pid, 0) as u16),
            Handle(self.arg(pid, 1)),
            self.arg(pid, 2),
            self.arg(pid, 3),
        );
        *self.cmd_calls.entry(oid.0).or_insert(0) += 1;
        let args = self.read_guest(pid, arg_ptr, arg_len).unwrap_or_default();
        // Secure async commands carry their token as the first argument
        // word.
        let token = args
            .get(..4)
            .map(|b| u32::from_le_bytes(b.try_into().unwrap()));
        let entry = match self.registry.begin_command(oid, AuthLevel::User, token) {
            Ok(e) => e,
            Err(e) => {
                let code = map_registry_error(e);
                self.emit(
                    EventCategory::CmdInvoked,
                    pid,
                    json!({ "oid": oid.0, "status": code_name(code) }),
                );
                self.set_svc_return(pid, code, 0);
                return SvcDisposition::Continue;
            }
        };
        self.emit(
            EventCategory::CmdInvoked,
            pid,
            json!({ "oid": oid.0, "status": "OK" }),
        );

        let kind = if entry.handler_address == 0 {
            match self.host_commands.get(&oid.0) {
                Some(h) => AsyncKind::Host(Arc::clone(h)),
                None => {
                    self.registry.complete_command(oid);
                    self.set_svc_return(pid, Code::NoEnt, 0);
                    return SvcDisposition::Continue;
                }
            }
        } else {
            AsyncKind::Guest {
                owner: Pid(entry.owner_pid),
                handler: entry.handler_address,
            }
        };
        let job = AsyncJob { oid, caller: pid, reply, args, kind };
        match &job.kind {
            AsyncKind::Host(_) => self.async_exec.submit_host(job),
            AsyncKind::Guest { .. } => self.async_exec.submit_guest(job),
        }
        self.set_svc_return(pid, Code::Ok, 0);
        SvcDisposition::Continue
    }

    // --- CAN / FS ------------------------------------------------------

    fn svc_can_tx(&mut self, pid: Pid) -> SvcDisposition {
        let (id, ptr, len) = (self.arg(pid, 0), self.arg(pid, 1), self.arg(pid, 2));
        let Some(frame) = self.read_guest(pid, ptr, len) else {
            self.set_svc_return(pid, Code::Inval, 0);
            return SvcDisposition::Continue;
        };
        match self.drivers.can.transmit(id as u16, &frame) {
            Ok(()) => self.set_svc_return(pid, Code::Ok, frame.len() as u32),
            Err(c) => self.set_svc_return(pid, c, 0),
        }
        SvcDisposition::Continue
    }

    fn svc_fs(&mut self, pid: Pid, f: FsFn) -> SvcDisposition {
        match f {
            FsFn::Open => {
                let (ptr, len, create) =
                    (self.arg(pid, 0), self.arg(pid, 1), self.arg(pid, 2));
                let Some(path) = self.read_guest_str(pid, ptr, len) else {
                    self.set_svc_return(pid, Code::Inval, 0);
                    return SvcDisposition::Continue;
                };
                match self.drivers.fs.open(&path, create != 0) {
                    Ok(fd) => self.set_svc_return(pid, Code::Ok, fd),
                    Err(c) => self.set_svc_return(pid, c, 0),
                }
            }
            FsFn::Read => {
                let (fd, ptr, cap, off) = (
                    self.arg(pid, 0),
                    self.arg(pid, 1),
                    self.arg(pid, 2),
                    self.arg(pid, 3),
                );
                let mut buf = vec![0u8; cap as usize];
                match self.drivers.fs.read(fd, off as usize, &mut buf) {
                    Ok(n) => {
                        buf.truncate(n);
                        match self.vm.write_bytes(pid, ptr, &buf) {
                            Ok(Ok(())) => self.set_svc_return(pid, Code::Ok, n as u32),
                            _ => self.set_svc_return(pid, Code::Inval, 0),
                        }
                    }
                    Err(c) => self.set_svc_return(pid, c, 0),
                }
            }
            FsFn::Write => {
                let (fd, ptr, len, off) = (
                    self.arg(pid, 0),
                    self.arg(pid, 1),
                    self.arg(pid, 2),
                    self.arg(pid, 3),
                );
                let Some(data) = self.read_guest(pid, ptr, len) else {
                    self.set_svc_return(pid, Code::Inval, 0);
                    return SvcDisposition::Continue;
                };
                match self.drivers.fs.write(fd, off as usize, &data) {
                    Ok(n) => self.set_svc_return(pid, Code::Ok, n as u32),
                    Err(c) => self.set_svc_return(pid, c, 0),
                }
            }
            FsFn::Close => {
                let fd = self.arg(pid, 0);
                match self.drivers.fs.close(fd) {
                    Ok(()) => self.set_svc_return(pid, Code::Ok, 0),
                    Err(c) => self.set_svc_return(pid, c, 0),
                }
            }
            FsFn::List => {
                // Newline-joined listing copied into the guest buffer.
                let (ptr, cap) = (self.arg(pid, 0), self.arg(pid, 1));
                let listing = self.drivers.fs.list().join("\n");
                let bytes = listing.as_bytes();
                let n = bytes.len().min(cap as usize);
                match self.vm.write_bytes(pid, ptr, &bytes[..n]) {
                    Ok(Ok(())) => self.set_svc_return(pid, Code::Ok, n as u32),
                    _ => self.set_svc_return(pid, Code::Inval, 0),
                }
            }
            FsFn::Delete => {
                let (ptr, len) = (self.arg(pid, 0), self.arg(pid, 1));
                let Some(path) = self.read_guest_str(pid, ptr, len) else {
                    self.set_svc_return(pid, Code::Inval, 0);
                    return SvcDisposition::Continue;
                };
                match self.drivers.fs.delete(&path) {
                    Ok(()) => self.set_svc_return(pid, Code::Ok, 0),
                    Err(c) => self.set_svc_return(pid, c, 0),
                }
            }
            FsFn::Rename => {
                // Args: from ptr/len, then a NUL-separated "from\0to"
                // would need five registers; instead the block at R0
                // holds {from_ptr, from_len, to_ptr, to_len}.
                let block_ptr = self.arg(pid, 0);
                let Some(block) = self.read_guest(pid, block_ptr, 16) else {
                    self.set_svc_return(pid, Code::Inval, 0);
                    return SvcDisposition::Continue;
                };
                let word = |i: usize| {
                    u32::from_le_bytes(block[i * 4..i * 4 + 4].try_into().unwrap())
                };
                let from = self.read_guest_str(pid, word(0), word(1));
                let to = self.read_guest_str(pid, word(2), word(3));
                match (from, to) {
                    (Some(from), Some(to)) => match self.drivers.fs.rename(&from, &to) {
                        Ok(()) => self.set_svc_return(pid, Code::Ok, 0),
                        Err(c) => self.set_svc_return(pid, c, 0),
                    },
                    _ => self.set_svc_return(pid, Code::Inval, 0),
                }
            }
            FsFn::Mkdir => {
                // Flat namespace backends accept and ignore directories.
                self.set_svc_return(pid, Code::Ok, 0);
            }
        }
        SvcDisposition::Continue
    }

    // --- guest handler execution --------------------------------------

    /// Runs a guest command handler to completion inside `pid`'s
    /// context: plants a sentinel return frame, transfers control, and
    /// drives the VM until the handler returns, exits, or faults.
    pub(crate) fn run_guest_handler(
        &mut self,
        pid: Pid,
        handler: u32,
        args: [u32; 4],
    ) -> HandlerOutcome {
        // Frame setup mirrors CALL: the outer frame restores the
        // interrupted flow, the inner one routes RET to the sentinel.
        {
            let Ok(ctx) = self.vm.context_mut(pid) else {
                return HandlerOutcome::Faulted;
            };
            let resume_pc = ctx.pc();
            if ctx.push_frame(resume_pc).is_err()
                || ctx.push_frame(CMD_RETURN_PC).is_err()
            {
                return HandlerOutcome::Faulted;
            }
            for (i, a) in args.iter().enumerate() {
                ctx.set_reg(i as u8, *a);
            }
            ctx.set_pc(handler);
        }

        for _ in 0..HANDLER_STEP_LIMIT {
            let pc = self.vm.reg_get(pid, RegSel::Pc).unwrap_or(0);
            if pc == CMD_RETURN_PC {
                // Handler returned: unwind the outer frame and resume.
                let Ok(ctx) = self.vm.context_mut(pid) else {
                    return HandlerOutcome::Faulted;
                };
                let status = ctx.reg(0);
                let value = ctx.reg(1);
                match ctx.pop_frame() {
                    Ok(resume) => ctx.set_pc(resume),
                    Err(_) => return HandlerOutcome::Faulted,
                }
                return HandlerOutcome::Done { status, value };
            }
            if self.vm.set_context(pid).is_err() {
                return HandlerOutcome::Faulted;
            }
            let result = match self.vm.step() {
                Ok(r) => r,
                Err(_) => return HandlerOutcome::Faulted,
            };
            match result.reason {
                hsx_vm::StopReason::Ok => {}
                hsx_vm::StopReason::Break => {
                    // BRK inside a handler stops the task like anywhere
                    // else; the invocation ends as a fault of the
                    // handler contract.
                    self.tasks.stop(pid);
                    return HandlerOutcome::Faulted;
                }
                hsx_vm::StopReason::Fault(kind) => {
                    self.apply_fault(pid, kind, result.pc);
                    return HandlerOutcome::Faulted;
                }
                hsx_vm::StopReason::Svc { module, function } => {
                    match self.dispatch_svc(pid, module, function) {
                        SvcDisposition::Continue => {}
                        SvcDisposition::Exited => return HandlerOutcome::Exited,
                        SvcDisposition::Parked => {
                            // Handlers may not block; fail the wait
                            // immediately and keep going.
                            let pending =
                                self.tasks.get_mut(pid).and_then(|t| t.pending.take());
                            match pending {
                                Some(PendingOp::MailboxRecv { handle, .. })
                                | Some(PendingOp::MailboxSend { handle, .. }) => {
                                    self.mailboxes.cancel_waiter(pid, handle);
                                }
                                _ => {}
                            }
                            if let Some(t) = self.tasks.get_mut(pid) {
                                t.state = hsx_abi::TaskState::Running;
                                t.deadline_us = None;
                            }
                            self.set_svc_return(pid, Code::Again, 0);
                        }
                    }
                }
            }
        }
        // Runaway handler.
        let pc = self.vm.reg_get(pid, RegSel::Pc).unwrap_or(0);
        self.apply_fault(pid, FaultKind::OutOfBounds { address: pc }, pc);
        HandlerOutcome::Faulted
    }

    /// Saves the current register window and PSW of a task about to have
    /// a handler injected into it.
    fn save_window(&self, pid: Pid) -> Option<([u32; 16], u8)> {
        let ctx = self.vm.context(pid).ok()?;
        let mut regs = [0u32; 16];
        for (i, r) in regs.iter_mut().enumerate() {
            *r = ctx.reg(i as u8);
        }
        Some((regs, ctx.psw().bits()))
    }

    fn restore_window(&mut self, pid: Pid, saved: ([u32; 16], u8)) {
        if let Ok(ctx) = self.vm.context_mut(pid) {
            for (i, r) in saved.0.iter().enumerate() {
                ctx.set_reg(i as u8, *r);
            }
        }
        let _ = self
            .vm
            .reg_set(pid, RegSel::Psw, saved.1 as u32);
    }

    /// Control-plane command invocation (`cmd.call`). Host commands run
    /// their registered closure; guest commands run in the *owner's*
    /// context with the owner's window saved and restored around the
    /// injection.
    pub fn host_command_call(
        &mut self,
        oid: Oid,
        token: Option<u32>,
        auth: AuthLevel,
    ) -> (Code, u32) {
        *self.cmd_calls.entry(oid.0).or_insert(0) += 1;
        let entry = match self.registry.begin_command(oid, auth, token) {
            Ok(e) => e,
            Err(e) => {
                let code = map_registry_error(e);
                self.emit(
                    EventCategory::CmdInvoked,
                    Pid::SYSTEM,
                    json!({ "oid": oid.0, "status": code_name(code) }),
                );
                return (code, 0);
            }
        };
        self.emit(
            EventCategory::CmdInvoked,
            Pid::SYSTEM,
            json!({ "oid": oid.0, "status": "OK" }),
        );

        if entry.handler_address == 0 {
            let result = self
                .host_commands
                .get(&oid.0)
                .cloned()
                .map(|h| h(&[]))
                .unwrap_or(Err(Code::NoEnt));
            self.registry.complete_command(oid);
            let (code, value) = match result {
                Ok(payload) => (
                    Code::Ok,
                    payload
                        .get(..4)
                        .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
                        .unwrap_or(0),
                ),
                Err(c) => (c, 0),
            };
            self.emit(
                EventCategory::CmdCompleted,
                Pid::SYSTEM,
                json!({ "oid": oid.0, "status": code_name(code) }),
            );
            return (code, value);
        }

        let owner = Pid(entry.owner_pid);
        let Some(saved) = self.save_window(owner) else {
            self.registry.complete_command(oid);
            return (Code::NoEnt, 0);
        };
        if let Some(t) = self.tasks.get_mut(owner) {
            t.in_flight_command = Some(oid);
        }
        let outcome = self.run_guest_handler(owner, entry.handler_address, [0, 0, 0, 0]);
        self.registry.complete_command(oid);
        if let Some(t) = self.tasks.get_mut(owner) {
            t.in_flight_command = None;
        }
        match outcome {
            HandlerOutcome::Done { status, value } => {
                let code = Code::try_from(status).unwrap_or(Code::Io);
                self.restore_window(owner, saved);
                self.emit(
                    EventCategory::CmdCompleted,
                    owner,
                    json!({ "oid": oid.0, "status": code_name(code) }),
                );
                (code, value)
            }
            HandlerOutcome::Exited => (Code::Ok, 0),
            HandlerOutcome::Faulted => {
                self.emit(
                    EventCategory::CmdCompleted,
                    owner,
                    json!({ "oid": oid.0, "status": "HandlerFault" }),
                );
                (Code::Io, 0)
            }
        }
    }

    /// Advances the async executor: posts finished host work, runs one
    /// queued guest handler.
    pub(crate) fn pump_async(&mut self) {
        for c in self.async_exec.drain_completions() {
            self.post_async_completion(c);
        }
        if let Some(job) = self.async_exec.pop_guest() {
            let AsyncKind::Guest { owner, handler } = job.kind else {
                return;
            };
            // The handler runs in its owner's context; a dead owner
            // fails the invocation. The owner's window is saved and
            // restored around the injection.
            let saved = self.save_window(owner);
            let outcome = if self.tasks.get(owner).is_some() && saved.is_some() {
                let out = self.run_guest_handler(owner, handler, [0, 0, 0, 0]);
                if matches!(out, HandlerOutcome::Done { .. }) {
                    self.restore_window(owner, saved.unwrap());
                }
                out
            } else {
                HandlerOutcome::Done { status: Code::NoEnt as u32, value: 0 }
            };
            let (status, payload) = match outcome {
                HandlerOutcome::Done { status, value } => (
                    Code::try_from(status).unwrap_or(Code::Io),
                    value.to_le_bytes().to_vec(),
                ),
                HandlerOutcome::Exited | HandlerOutcome::Faulted => (Code::Io, Vec::new()),
            };
            self.registry.complete_command(job.oid);
            self.post_async_completion(AsyncCompletion {
                oid: job.oid,
                caller: job.caller,
                reply: job.reply,
                status,
                payload,
            });
        }
    }

    /// Posts a `{oid, status, payload}` envelope to the caller-supplied
    /// mailbox. Mailbox errors never fault the caller; the result is
    /// simply lost.
    fn post_async_completion(&mut self, c: AsyncCompletion) {
        self.registry.complete_command(c.oid);
        self.emit(
            EventCategory::CmdCompleted,
            c.caller,
            json!({ "oid": c.oid.0, "status": code_name(c.status) }),
        );
        let mut envelope = Vec::with_capacity(6 + c.payload.len());
        envelope.extend_from_slice(&c.oid.0.to_le_bytes());
        envelope.extend_from_slice(&(c.status as u32).to_le_bytes());
        envelope.extend_from_slice(&c.payload);
        if let Ok((_, wakes)) = self.mailboxes.send(Pid::SYSTEM, c.reply, &envelope) {
            for w in wakes {
                self.apply_wake(w);
            }
        }
    }
}

/// Result of driving a guest command handler.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum HandlerOutcome {
    Done { status: u32, value: u32 },
    Exited,
    Faulted,
}

pub(crate) fn code_name(c: Code) -> &'static str {
    match c {
        Code::Ok => "OK",
        Code::Again => "EAGAIN",
        Code::TimedOut => "ETIMEDOUT",
        Code::Perm => "EPERM",
        Code::NoEnt => "ENOENT",
        Code::Inval => "EINVAL",
        Code::Io => "EIO",
        Code::BadF => "EBADF",
    }
}
