// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The HSX executive: attached-mode scheduler, SVC dispatch, debugger
//! control plane, and the glue between the MiniVM and the mailbox,
//! registry, and persistence subsystems.
//!
//! The executive owns every shared table and is the only writer to any
//! of them. The VM advances only when [`Executive::tick`] (or a debugger
//! step) drives it; nothing here preempts, and every blocking construct
//! is expressed as task state plus a retriable pending operation.

mod config;
mod debug;
mod event;
mod ringbuf;
mod svc;
mod task;

pub use config::ExecConfig;
pub use debug::SessionInfo;
pub use event::{Event, EventStream, StreamStats};
pub use ringbuf::{Trace, TraceRecord, TraceRing};
pub use task::{PendingOp, Task, TaskTable};

use std::collections::HashMap;
use std::sync::Arc;

use hsx_abi::{
    AuthLevel, Code, CommandFlags, EventCategory, FaultKind, Oid, Pid, TaskState,
    WaitReason,
};
use hsx_hal::{CanDriver, ConsoleDriver, FramDriver, FsDriver};
use hsx_hxe::{Image, ImageError};
use hsx_mailbox::{MailboxConfig, MailboxError, MailboxEvent, MailboxTable, Wake};
use hsx_persist::PersistLog;
use hsx_registry::{Registry, RegistryConfig, RegistryEvent};
use hsx_vm::{MemCodeStore, StopReason, Vm, VmError, VmImage};

use serde_json::json;

/// Version word reported by the EXEC_VERSION SVC and `session.open`:
/// major in the high half, minor in the low half.
pub const EXEC_VERSION: u32 = 0x0002_0000;

/// Executive-level failures surfaced to the CLI and control plane.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("image rejected: {0}")]
    Load(#[from] ImageError),
    #[error("no such task: pid {0}")]
    NoSuchTask(u16),
    #[error("task table is full")]
    TooManyTasks,
    #[error("an instance of {0:?} is already running")]
    InstanceExists(String),
    #[error("task is not stopped")]
    NotStopped,
    #[error("no debug session is attached")]
    NoSession,
    #[error("a debug session is already attached")]
    SessionBusy,
    #[error("vm: {0}")]
    Vm(#[from] VmError),
    #[error("{0}")]
    BadRequest(String),
}

/// Host-provided command handler: takes the argument bytes, returns the
/// result payload. Runs on the async worker pool for async commands, so
/// it must be `Send + Sync`.
pub type HostHandler = dyn Fn(&[u8]) -> Result<Vec<u8>, Code> + Send + Sync;

/// Concrete driver set composed at startup.
pub struct Drivers {
    pub console: Box<dyn ConsoleDriver + Send>,
    pub can: Box<dyn CanDriver + Send>,
    pub fs: Box<dyn FsDriver + Send>,
}

impl Default for Drivers {
    fn default() -> Self {
        Drivers {
            console: Box::new(hsx_hal::MemConsole::default()),
            can: Box::new(hsx_hal::MemCan::default()),
            fs: Box::new(hsx_hal::MemFs::default()),
        }
    }
}

/// Snapshot row for `ps`.
#[derive(Clone, Debug, serde::Serialize)]
pub struct TaskSnapshot {
    pub pid: Pid,
    pub name: String,
    pub state: TaskState,
    pub pc: u32,
}

pub struct Executive {
    pub(crate) config: ExecConfig,
    pub(crate) vm: Vm,
    pub(crate) tasks: TaskTable,
    pub(crate) mailboxes: MailboxTable,
    pub(crate) registry: Registry,
    pub(crate) events: EventStream,
    pub(crate) trace: TraceRing,
    pub drivers: Drivers,
    pub(crate) session: Option<debug::Session>,
    pub(crate) persist: Option<PersistLog<Box<dyn FramDriver + Send>>>,
    pub(crate) async_exec: svc::AsyncExecutor,
    pub(crate) host_commands: HashMap<u16, Arc<HostHandler>>,
    pub(crate) cmd_calls: HashMap<u16, u64>,
    /// Code segments by pid, for the disassembler and handler checks.
    pub(crate) code: HashMap<u16, Arc<[u8]>>,
    /// App names of live tasks, for `allow_multiple_instances`.
    pub(crate) app_names: HashMap<u16, String>,
    /// Persisted value bits replayed at mount, applied when the value is
    /// registered.
    pub(crate) boot_values: HashMap<u16, u16>,
    pub(crate) now_us: u64,
    /// Round-robin tick counter, exposed for diagnostics.
    pub(crate) ticks: u64,
}

impl Executive {
    pub fn new(config: ExecConfig, drivers: Drivers) -> Self {
        let vm = Vm::new(config.vm_config());
        let tasks = TaskTable::new(config.max_tasks);
        let mailboxes = MailboxTable::new(MailboxConfig {
            max_slots: config.mailbox_slots,
            capacity_budget: config.mailbox_budget_bytes,
        });
        let registry = Registry::new(RegistryConfig {
            max_values: config.max_values,
            max_commands: config.max_commands,
            descriptor_pool_bytes: config.descriptor_pool_bytes,
            string_pool_bytes: config.string_pool_bytes,
        });
        let events = EventStream::new(
            config.event_ring,
            config.event_ack_window,
            config.event_rate_limit,
        );
        let async_exec = svc::AsyncExecutor::new(config.async_workers);
        Executive {
            vm,
            tasks,
            mailboxes,
            registry,
            events,
            trace: TraceRing::new(256),
            drivers,
            session: None,
            persist: None,
            async_exec,
            host_commands: HashMap::new(),
            cmd_calls: HashMap::new(),
            code: HashMap::new(),
            app_names: HashMap::new(),
            boot_values: HashMap::new(),
            now_us: 0,
            ticks: 0,
            config,
        }
    }

    /// Attaches a persistence backend and replays its log into the
    /// registry (system-owned boot values).
    pub fn mount_persistence(
        &mut self,
        fram: Box<dyn FramDriver + Send>,
    ) -> Result<(), hsx_persist::PersistError> {
        let log = PersistLog::mount(fram)?;
        for (key, payload) in log.replay()? {
            if payload.len() == 2 {
                let bits = u16::from_le_bytes([payload[0], payload[1]]);
                // Values registered later pick this up at registration.
                self.boot_values.insert(key, bits);
            }
        }
        self.persist = Some(log);
        Ok(())
    }

    pub fn now_us(&self) -> u64 {
        self.now_us
    }

    /// Loads an HXE image: validates it, allocates the task and arenas,
    /// and pre-registers declared mailboxes and registry entries before
    /// the first instruction can run. The task starts in `New`; call
    /// [`Executive::start`] to admit it.
    pub fn load_image(&mut self, bytes: &[u8]) -> Result<Pid, ExecError> {
        let image = Image::parse(bytes)?;

        if !image.allow_multiple_instances
            && self.app_names.values().any(|n| *n == image.app_name)
        {
            return Err(ExecError::InstanceExists(image.app_name));
        }

        let pid = self
            .tasks
            .create(image.app_name.clone())
            .ok_or(ExecError::TooManyTasks)?;

        let code: Arc<[u8]> = Arc::from(image.code.clone().into_boxed_slice());
        self.vm.load(
            pid,
            VmImage {
                entry_pc: image.entry_pc,
                code: Box::new(MemCodeStore(code.clone())),
                data: image.data.clone(),
                bss_size: image.bss_size,
            },
        )?;
        self.code.insert(pid.0, code);
        self.app_names.insert(pid.0, image.app_name.clone());

        // Pre-create declared mailboxes. Declarations are system acts:
        // shared:/svc: boxes become system-owned, app: boxes belong to
        // the new task.
        for m in &image.mailboxes {
            let creator = if m.name.starts_with("app:") || m.name.starts_with("pid:") {
                pid
            } else {
                Pid::SYSTEM
            };
            match self.mailboxes.create(creator, &m.name, m.capacity as usize, m.mode_mask) {
                Ok(_) | Err(MailboxError::Exists) => {}
                Err(e) => {
                    return Err(ExecError::BadRequest(format!(
                        "declared mailbox {:?} rejected: {e:?}",
                        m.name
                    )))
                }
            }
        }

        // Pre-register declared values and commands on behalf of the
        // task.
        for v in &image.values {
            let initial = self
                .boot_values
                .get(&v.oid.0)
                .copied()
                .unwrap_or(v.value_bits);
            let mut chain = vec![hsx_registry::Descriptor::Name(v.name.clone())];
            if !v.unit.is_empty() {
                chain.push(hsx_registry::Descriptor::Unit(v.unit.clone()));
            }
            if let Some((lo, hi)) = v.range {
                chain.push(hsx_registry::Descriptor::Range(lo, hi));
            }
            if v.flags.contains(hsx_abi::ValueFlags::PERSIST) {
                chain.push(hsx_registry::Descriptor::Persist);
            }
            self.registry
                .register_value(pid, v.oid, v.flags, v.auth, initial, &chain)
                .map_err(|e| {
                    ExecError::BadRequest(format!("declared value {:?}: {e:?}", v.oid))
                })?;
        }
        for c in &image.commands {
            self.registry
                .register_command(
                    pid,
                    c.oid,
                    c.flags,
                    c.auth,
                    c.handler_address,
                    &[hsx_registry::Descriptor::Name(c.name.clone())],
                    None,
                )
                .map_err(|e| {
                    ExecError::BadRequest(format!("declared command {:?}: {e:?}", c.oid))
                })?;
        }

        self.drain_subsystem_events();
        Ok(pid)
    }

    /// Admits a loaded task to the ready queue.
    pub fn start(&mut self, pid: Pid) -> Result<(), ExecError> {
        self.tasks.get(pid).ok_or(ExecError::NoSuchTask(pid.0))?;
        self.tasks.admit(pid);
        Ok(())
    }

    /// Terminates a task from the host side.
    pub fn kill(&mut self, pid: Pid) -> Result<(), ExecError> {
        self.tasks.get(pid).ok_or(ExecError::NoSuchTask(pid.0))?;
        self.teardown_task(pid, u32::MAX);
        Ok(())
    }

    /// One scheduler slice: time advances, due sleepers wake, the next
    /// ready task runs up to a quantum, and subsystem telemetry drains
    /// into the event stream.
    pub fn tick(&mut self) {
        self.ticks += 1;
        self.now_us += self.config.tick_us;

        // Expire deadlines: sleeping tasks complete, mailbox waits time
        // out.
        for pid in self.tasks.expired(self.now_us) {
            self.complete_timeout(pid);
        }

        // Async command executor: launch queued work, collect results.
        self.pump_async();

        if let Some(pid) = self.tasks.next_ready() {
            self.run_slice(pid);
        }

        self.drain_subsystem_events();
        self.expire_session();
    }

    /// Runs ticks until no task is schedulable or `max_ticks` elapses.
    /// Returns the number of ticks consumed.
    pub fn run(&mut self, max_ticks: u64) -> u64 {
        for i in 0..max_ticks {
            // A task blocked with a deadline still counts as work: time
            // has to advance for its timeout (or sleep) to fire.
            let busy = self.tasks.iter().any(|t| {
                t.is_schedulable()
                    || (matches!(t.state, TaskState::Blocked(_))
                        && t.deadline_us.is_some())
            }) || self.async_exec.has_work();
            if !busy {
                return i;
            }
            self.tick();
        }
        max_ticks
    }

    fn run_slice(&mut self, pid: Pid) {
        if let Some(t) = self.tasks.get_mut(pid) {
            t.state = TaskState::Running;
        }
        if self.vm.set_context(pid).is_err() {
            // Context vanished under us (killed between queue and run).
            self.tasks.remove(pid);
            return;
        }
        self.trace.record(Trace::ContextSwitch { to: pid }, self.now_us);

        // Complete a retried operation first; it may re-park the task.
        if self.tasks.get(pid).is_some_and(|t| t.pending.is_some()) {
            self.retry_pending(pid);
            if !self.tasks.get(pid).is_some_and(|t| t.state == TaskState::Running) {
                return;
            }
        }

        // With an active session, breakpoints gate execution before each
        // instruction; the quantum is driven stepwise so a mid-slice
        // breakpoint is honored exactly.
        let stepwise = self
            .session
            .as_ref()
            .is_some_and(|s| s.has_breakpoints(pid));

        let mut remaining = self.config.quantum;
        while remaining > 0 {
            if stepwise {
                let pc = self.vm.reg_get(pid, hsx_vm::RegSel::Pc).unwrap_or(0);
                if self.hit_breakpoint(pid, pc) {
                    return;
                }
                let result = match self.vm.step() {
                    Ok(r) => r,
                    Err(_) => return,
                };
                remaining -= 1;
                if !self.account(pid, result) {
                    return;
                }
            } else {
                let (result, executed) = match self.vm.clock(remaining) {
                    Ok(r) => r,
                    Err(_) => return,
                };
                remaining = remaining.saturating_sub(executed.max(1));
                if !self.account(pid, result) {
                    return;
                }
                if result.reason == StopReason::Ok {
                    break; // quantum exhausted
                }
            }
        }

        if self.tasks.get(pid).is_some_and(|t| t.state == TaskState::Running) {
            if let Some(t) = self.tasks.get_mut(pid) {
                t.state = TaskState::Ready;
            }
            self.tasks.requeue(pid);
        }
    }

    /// Applies one step/clock result to the task. Returns `false` when
    /// the slice must end.
    fn account(&mut self, pid: Pid, result: hsx_vm::StepResult) -> bool {
        match result.reason {
            StopReason::Ok => true,
            StopReason::Break => {
                self.tasks.stop(pid);
                self.clear_temp_breakpoint(pid, result.pc);
                self.emit(
                    EventCategory::Break,
                    pid,
                    json!({ "pid": pid.0, "pc": result.pc }),
                );
                false
            }
            StopReason::Fault(kind) => {
                self.apply_fault(pid, kind, result.pc);
                false
            }
            StopReason::Svc { module, function } => {
                self.trace
                    .record(Trace::SvcEnter { pid, module, function }, self.now_us);
                match self.dispatch_svc(pid, module, function) {
                    svc::SvcDisposition::Continue => {
                        self.tasks.get(pid).is_some_and(|t| t.state == TaskState::Running)
                    }
                    svc::SvcDisposition::Parked => false,
                    svc::SvcDisposition::Exited => false,
                }
            }
        }
    }

    pub(crate) fn apply_fault(&mut self, pid: Pid, kind: FaultKind, pc: u32) {
        self.tasks.fault(pid, kind);
        self.trace.record(Trace::Fault { pid }, self.now_us);
        self.emit(
            EventCategory::Fault,
            pid,
            json!({ "pid": pid.0, "pc": pc, "kind": format!("{kind:?}") }),
        );
    }

    /// Tears down an exited or killed task: wakes its waiters with
    /// `Closed`, releases owned mailboxes and registry entries, and
    /// unloads its VM context. Queued events belonging to the task stay
    /// in the stream; they age out at the next ACK boundary.
    pub(crate) fn teardown_task(&mut self, pid: Pid, exit_code: u32) {
        self.trace.record(Trace::TaskExit { pid, code: exit_code }, self.now_us);
        for wake in self.mailboxes.on_task_exit(pid) {
            self.apply_wake(wake);
        }
        self.registry.on_task_exit(pid);
        let _ = self.vm.unload(pid);
        self.code.remove(&pid.0);
        self.app_names.remove(&pid.0);
        self.tasks.remove(pid);
    }

    pub(crate) fn apply_wake(&mut self, wake: Wake) {
        self.trace.record(Trace::Wake { pid: wake.pid }, self.now_us);
        self.tasks.wake(wake.pid, wake.closed);
    }

    /// Completes a timed-out wait: mailbox waits fail `ETIMEDOUT`,
    /// sleeps complete normally.
    fn complete_timeout(&mut self, pid: Pid) {
        let Some(t) = self.tasks.get_mut(pid) else { return };
        let pending = t.pending.take();
        t.state = TaskState::Ready;
        t.deadline_us = None;
        match pending {
            Some(PendingOp::Sleep) | None => {
                self.set_svc_return(pid, Code::Ok, 0);
            }
            Some(PendingOp::MailboxRecv { handle, .. })
            | Some(PendingOp::MailboxSend { handle, .. }) => {
                self.mailboxes.cancel_waiter(pid, handle);
                self.set_svc_return(pid, Code::TimedOut, 0);
            }
        }
        self.tasks.admit(pid);
    }

    /// Retries the pending mailbox operation of a freshly woken task.
    fn retry_pending(&mut self, pid: Pid) {
        let (pending, closed) = {
            let Some(t) = self.tasks.get_mut(pid) else { return };
            (t.pending.take(), std::mem::take(&mut t.woken_closed))
        };
        let Some(pending) = pending else { return };

        if closed {
            self.set_svc_return(pid, Code::BadF, 0);
            return;
        }
        match pending {
            PendingOp::Sleep => {
                self.set_svc_return(pid, Code::Ok, 0);
            }
            PendingOp::MailboxRecv { handle, out_ptr, out_cap } => {
                match self.mailboxes.recv(pid, handle) {
                    Ok((msg, wakes)) => {
                        for w in wakes {
                            self.apply_wake(w);
                        }
                        self.finish_recv(pid, msg, out_ptr, out_cap);
                    }
                    Err(MailboxError::WouldBlock) => {
                        self.repark(pid, handle, PendingOp::MailboxRecv { handle, out_ptr, out_cap }, hsx_mailbox::WaitKind::Recv);
                    }
                    Err(e) => {
                        self.set_svc_return(pid, svc::map_mailbox_error(e), 0);
                    }
                }
            }
            PendingOp::MailboxSend { handle, ptr, len } => {
                let mut payload = vec![0u8; len as usize];
                match self.vm.read_bytes(pid, ptr, &mut payload) {
                    Ok(Ok(())) => {}
                    _ => {
                        self.set_svc_return(pid, Code::Inval, 0);
                        return;
                    }
                }
                match self.mailboxes.send(pid, handle, &payload) {
                    Ok((n, wakes)) => {
                        for w in wakes {
                            self.apply_wake(w);
                        }
                        self.set_svc_return(pid, Code::Ok, n as u32);
                    }
                    Err(MailboxError::WouldBlock) => {
                        self.repark(
                            pid,
                            handle,
                            PendingOp::MailboxSend { handle, ptr, len },
                            hsx_mailbox::WaitKind::Send { payload_len: len as usize },
                        );
                    }
                    Err(e) => {
                        self.set_svc_return(pid, svc::map_mailbox_error(e), 0);
                    }
                }
            }
        }
    }

    fn repark(
        &mut self,
        pid: Pid,
        handle: hsx_abi::Handle,
        pending: PendingOp,
        kind: hsx_mailbox::WaitKind,
    ) {
        let deadline = self.tasks.get(pid).and_then(|t| t.deadline_us);
        let _ = self.mailboxes.add_waiter(pid, handle, kind);
        self.tasks.park(pid, WaitReason::Mailbox(handle), deadline);
        if let Some(t) = self.tasks.get_mut(pid) {
            t.pending = Some(pending);
        }
        self.trace.record(Trace::Park { pid }, self.now_us);
    }

    /// Copies a received message into the guest and sets the SVC return
    /// registers.
    pub(crate) fn finish_recv(&mut self, pid: Pid, msg: Vec<u8>, out_ptr: u32, out_cap: u32) {
        let n = msg.len().min(out_cap as usize);
        match self.vm.write_bytes(pid, out_ptr, &msg[..n]) {
            Ok(Ok(())) => self.set_svc_return(pid, Code::Ok, n as u32),
            _ => self.set_svc_return(pid, Code::Inval, 0),
        }
    }

    /// Writes the standard R0/R1 SVC return pair.
    pub(crate) fn set_svc_return(&mut self, pid: Pid, code: Code, value: u32) {
        let _ = self.vm.reg_set(pid, hsx_vm::RegSel::R(0), code as u32);
        let _ = self.vm.reg_set(pid, hsx_vm::RegSel::R(1), value);
        self.trace.record(Trace::SvcExit { pid, code: code as u32 }, self.now_us);
        if code == Code::Perm {
            // Policy denials are audit-logged.
            self.emit(
                EventCategory::SvcError,
                pid,
                json!({ "pid": pid.0, "code": "EPERM" }),
            );
        }
    }

    pub(crate) fn emit(&mut self, category: EventCategory, pid: Pid, payload: serde_json::Value) {
        self.events.emit(category, pid, payload, self.now_us);
    }

    /// Converts accumulated mailbox/registry telemetry into events, and
    /// carries out registry side effects (subscriber posts, persistence).
    pub(crate) fn drain_subsystem_events(&mut self) {
        for e in self.mailboxes.take_events() {
            match e {
                MailboxEvent::Overflow { handle, reader, dropped } => {
                    self.emit(
                        EventCategory::MailboxOverflow,
                        reader,
                        json!({ "handle": handle.0, "dropped": dropped }),
                    );
                }
                MailboxEvent::Pressure { allocated, budget } => {
                    self.emit(
                        EventCategory::Telemetry,
                        Pid::SYSTEM,
                        json!({ "kind": "mailbox_pressure", "allocated": allocated, "budget": budget }),
                    );
                }
            }
        }
        for e in self.registry.take_events() {
            match e {
                RegistryEvent::ValueRegistered { oid, pid } => {
                    self.emit(
                        EventCategory::ValueRegistered,
                        pid,
                        json!({ "oid": oid.0, "pid": pid.0 }),
                    );
                }
                RegistryEvent::ValueChanged { oid, old_bits, new_bits } => {
                    self.emit(
                        EventCategory::ValueChanged,
                        Pid::SYSTEM,
                        json!({
                            "oid": oid.0,
                            "old": f16_json(old_bits),
                            "new": f16_json(new_bits),
                        }),
                    );
                }
                RegistryEvent::PoolWarning { kind, used, capacity } => {
                    self.emit(
                        EventCategory::Telemetry,
                        Pid::SYSTEM,
                        json!({ "kind": "registry_warning", "pool": format!("{kind:?}"), "used": used, "capacity": capacity }),
                    );
                }
                RegistryEvent::PoolPressure { kind, used, capacity } => {
                    self.emit(
                        EventCategory::Telemetry,
                        Pid::SYSTEM,
                        json!({ "kind": "registry_pressure", "pool": format!("{kind:?}"), "used": used, "capacity": capacity }),
                    );
                }
                RegistryEvent::PoolExhausted { kind, pid } => {
                    self.emit(
                        EventCategory::Telemetry,
                        Pid::SYSTEM,
                        json!({ "kind": "registry_exhausted", "pool": format!("{kind:?}"), "pid": pid.0 }),
                    );
                }
            }
        }
    }

    /// Applies the effects of a value mutation: subscriber posts and the
    /// best-effort persistence write.
    pub(crate) fn apply_set_effects(&mut self, fx: hsx_registry::SetEffects) {
        for (handle, oid, bits) in fx.posts {
            let mut envelope = Vec::with_capacity(4);
            envelope.extend_from_slice(&oid.0.to_le_bytes());
            envelope.extend_from_slice(&bits.to_le_bytes());
            match self.mailboxes.send(Pid::SYSTEM, handle, &envelope) {
                Ok((_, wakes)) => {
                    for w in wakes {
                        self.apply_wake(w);
                    }
                }
                Err(MailboxError::WouldBlock) => {
                    // Subscriber is slow; the notification is lost but
                    // the subscription survives.
                }
                Err(_) => {
                    // Dead mailbox: the subscription goes with it.
                    self.registry.on_mailbox_closed(handle);
                }
            }
        }
        if let Some((oid, bits)) = fx.persist {
            if let Some(log) = self.persist.as_mut() {
                if let Err(e) = log.append(oid.0, &bits.to_le_bytes()) {
                    // Best-effort: surfaced as telemetry, never fatal.
                    self.emit(
                        EventCategory::Telemetry,
                        Pid::SYSTEM,
                        json!({ "kind": "persist_error", "oid": oid.0, "error": e.to_string() }),
                    );
                } else if log.dead_percent() > 50 {
                    // Opportunistic compaction once superseded records
                    // dominate the region.
                    let _ = log.compact();
                }
            }
        }
    }

    // --- host-facing surface -------------------------------------------

    pub fn ps(&self) -> Vec<TaskSnapshot> {
        self.tasks
            .iter()
            .map(|t| TaskSnapshot {
                pid: t.pid,
                name: t.name.clone(),
                state: t.state,
                pc: self
                    .vm
                    .context(t.pid)
                    .map(|c| c.pc())
                    .unwrap_or(0),
            })
            .collect()
    }

    pub fn task_state(&self, pid: Pid) -> Option<TaskState> {
        self.tasks.get(pid).map(|t| t.state)
    }

    pub fn console(&self) -> &dyn ConsoleDriver {
        self.drivers.console.as_ref()
    }

    /// Registers a host-provided command (handler address 0).
    pub fn register_host_command(
        &mut self,
        oid: Oid,
        flags: CommandFlags,
        auth: AuthLevel,
        pin: Option<u32>,
        handler: Arc<HostHandler>,
    ) -> Result<(), ExecError> {
        self.registry
            .register_command(Pid::SYSTEM, oid, flags, auth, 0, &[], pin)
            .map_err(|e| ExecError::BadRequest(format!("{e:?}")))?;
        self.host_commands.insert(oid.0, handler);
        Ok(())
    }

    pub fn mailbox_list(&self) -> Vec<(hsx_abi::Handle, String, Pid)> {
        self.mailboxes.list()
    }

    pub fn mailbox_inspect(
        &self,
        handle: hsx_abi::Handle,
    ) -> Result<hsx_mailbox::MailboxInfo, ExecError> {
        self.mailboxes
            .inspect(handle)
            .map_err(|e| ExecError::BadRequest(format!("{e:?}")))
    }

    pub fn mailbox_stats(
        &self,
        handle: hsx_abi::Handle,
    ) -> Result<hsx_mailbox::MailboxStats, ExecError> {
        self.mailboxes
            .stats(handle)
            .map_err(|e| ExecError::BadRequest(format!("{e:?}")))
    }

    pub fn value_entries(&self) -> &[hsx_abi::ValueEntry] {
        self.registry.values()
    }

    pub fn command_entries(&self) -> &[hsx_abi::CommandEntry] {
        self.registry.commands()
    }

    pub fn value_descriptors(&self, descriptor_offset: u16) -> Vec<hsx_registry::Descriptor> {
        self.registry.descriptors(descriptor_offset)
    }

    /// Host-side value read, at admin level.
    pub fn value_get(&self, oid: Oid) -> Result<u16, ExecError> {
        self.registry
            .get_value(oid, AuthLevel::Admin)
            .map_err(|e| ExecError::BadRequest(format!("{e:?}")))
    }

    /// Host-side value write. `auth` is the session's level; RO values
    /// still refuse non-owner writes.
    pub fn value_set(&mut self, oid: Oid, bits: u16, auth: AuthLevel) -> Result<(), ExecError> {
        // The host is not the owner: pick an impossible pid so RO
        // enforcement applies to operator writes exactly as to tasks.
        let result = self
            .registry
            .set_value(Pid(u16::MAX), auth, oid, bits);
        match result {
            Ok(fx) => {
                self.apply_set_effects(fx);
                self.drain_subsystem_events();
                Ok(())
            }
            Err(e) => Err(ExecError::BadRequest(format!("{e:?}"))),
        }
    }

    pub fn command_call_count(&self, oid: Oid) -> u64 {
        self.cmd_calls.get(&oid.0).copied().unwrap_or(0)
    }

    pub fn trace_control(&mut self, enabled: bool) {
        self.trace.set_enabled(enabled);
        if !enabled {
            self.trace.clear();
        }
    }

    pub fn trace_records(&self) -> Vec<TraceRecord> {
        self.trace.snapshot()
    }

    pub fn stream_stats(&self) -> StreamStats {
        self.events.stats
    }

    /// Reads guest data memory (debugger surface).
    pub fn read_memory(&mut self, pid: Pid, addr: u32, len: usize) -> Result<Vec<u8>, ExecError> {
        let mut buf = vec![0u8; len];
        match self.vm.read_bytes(pid, addr, &mut buf)? {
            Ok(()) => Ok(buf),
            Err(f) => Err(ExecError::BadRequest(format!("{f:?}"))),
        }
    }

    /// Writes guest data memory (debugger surface).
    pub fn write_memory(&mut self, pid: Pid, addr: u32, data: &[u8]) -> Result<(), ExecError> {
        match self.vm.write_bytes(pid, addr, data)? {
            Ok(()) => Ok(()),
            Err(f) => Err(ExecError::BadRequest(format!("{f:?}"))),
        }
    }

    /// Disassembles `count` words starting at `addr`.
    pub fn disassemble(&self, pid: Pid, addr: u32, count: usize) -> Result<Vec<(u32, String)>, ExecError> {
        let code = self
            .code
            .get(&pid.0)
            .ok_or(ExecError::NoSuchTask(pid.0))?;
        let mut out = Vec::new();
        let mut at = addr as usize & !3;
        for _ in 0..count {
            if at + 4 > code.len() {
                break;
            }
            let word = u32::from_le_bytes(code[at..at + 4].try_into().unwrap());
            let text = match hsx_isa::decode(word) {
                Ok(i) => hsx_isa::format_instr(&i),
                Err(_) => format!(".word {word:#010x}"),
            };
            out.push((at as u32, text));
            at += 4;
        }
        Ok(out)
    }
}

fn f16_json(bits: u16) -> serde_json::Value {
    let v = half::f16::from_bits(bits).to_f32();
    serde_json::Number::from_f64(v as f64)
        .map(serde_json::Value::Number)
        .unwrap_or(serde_json::Value::Null)
}
