// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The value/command registry.
//!
//! Values are half-precision payloads keyed by numeric OID, with
//! descriptor chains (name, unit, range, persistence) packed into a shared
//! byte pool over a deduplicated string table. Commands are handler
//! records with auth levels and optional PIN protection.
//!
//! Like the mailbox table, the registry is owned by the executive and
//! returns *effects* instead of performing I/O: a `set` hands back the
//! subscriber posts and persistence request for the executive to carry
//! out, and telemetry accumulates until `take_events` drains it in
//! scheduler order.

mod pool;

pub use pool::{Descriptor, DescriptorPool};

use half::f16;
use hsx_abi::{
    AuthLevel, CommandEntry, CommandFlags, Handle, Oid, Pid, ValueEntry, ValueFlags,
    NO_DESCRIPTOR,
};

/// Registry operation failures.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegistryError {
    /// The OID is already registered.
    Duplicate,
    /// Descriptor or string pool (or the entry table) is full.
    PoolExhausted,
    NoSuchValue,
    NoSuchCommand,
    /// Auth level, RO flag, or PIN mismatch.
    Permission,
    /// Exclusive command already has an invocation in flight.
    Busy,
}

/// Which pool crossed a threshold.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PoolKind {
    Values,
    Commands,
    Descriptors,
    Strings,
}

/// Telemetry drained by the executive.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegistryEvent {
    ValueRegistered { oid: Oid, pid: Pid },
    ValueChanged { oid: Oid, old_bits: u16, new_bits: u16 },
    /// Usage crossed 70%.
    PoolWarning { kind: PoolKind, used: usize, capacity: usize },
    /// Usage crossed 80%.
    PoolPressure { kind: PoolKind, used: usize, capacity: usize },
    /// A registration failed at 100%; carries the offender.
    PoolExhausted { kind: PoolKind, pid: Pid },
}

/// Side effects of a successful `set` for the executive to carry out.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SetEffects {
    /// `{oid, new value}` envelopes to post to each subscribed mailbox.
    pub posts: Vec<(Handle, Oid, u16)>,
    /// Best-effort persistence write, when the value is persistable.
    pub persist: Option<(Oid, u16)>,
}

/// Capacity budgets.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    pub max_values: usize,
    pub max_commands: usize,
    pub descriptor_pool_bytes: usize,
    pub string_pool_bytes: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            max_values: 256,
            max_commands: 64,
            descriptor_pool_bytes: 4096,
            string_pool_bytes: 4096,
        }
    }
}

/// Tracks 70/80% crossings so each threshold fires once until usage
/// falls back below it.
#[derive(Default)]
struct ThresholdLatch {
    warned: bool,
    pressured: bool,
}

pub struct Registry {
    config: RegistryConfig,
    /// Sorted by OID for binary search; entries are the packed ABI
    /// records so the control plane can ship them verbatim.
    values: Vec<ValueEntry>,
    commands: Vec<CommandEntry>,
    /// PINs for secure commands, parallel to `commands` by OID.
    pins: Vec<(Oid, u32)>,
    /// Exclusive commands with an invocation in flight.
    busy: Vec<Oid>,
    subscriptions: Vec<(Oid, Handle)>,
    pool: DescriptorPool,
    events: Vec<RegistryEvent>,
    latches: [ThresholdLatch; 4],
}

impl Registry {
    pub fn new(config: RegistryConfig) -> Self {
        let pool = DescriptorPool::new(
            config.descriptor_pool_bytes,
            config.string_pool_bytes,
        );
        Registry {
            config,
            values: Vec::new(),
            commands: Vec::new(),
            pins: Vec::new(),
            busy: Vec::new(),
            subscriptions: Vec::new(),
            pool,
            events: Vec::new(),
            latches: Default::default(),
        }
    }

    fn value_index(&self, oid: Oid) -> Result<usize, RegistryError> {
        self.values
            .binary_search_by_key(&oid.0, |e| e.oid)
            .map_err(|_| RegistryError::NoSuchValue)
    }

    fn command_index(&self, oid: Oid) -> Result<usize, RegistryError> {
        self.commands
            .binary_search_by_key(&oid.0, |e| e.oid)
            .map_err(|_| RegistryError::NoSuchCommand)
    }

    /// Registers a value with its descriptor chain.
    pub fn register_value(
        &mut self,
        pid: Pid,
        oid: Oid,
        flags: ValueFlags,
        auth: AuthLevel,
        initial_bits: u16,
        descriptors: &[Descriptor],
    ) -> Result<(), RegistryError> {
        if self.values.binary_search_by_key(&oid.0, |e| e.oid).is_ok() {
            return Err(RegistryError::Duplicate);
        }
        if self.values.len() >= self.config.max_values {
            self.events.push(RegistryEvent::PoolExhausted { kind: PoolKind::Values, pid });
            return Err(RegistryError::PoolExhausted);
        }
        let descriptor_offset = match self.pool.intern_chain(descriptors) {
            Ok(off) => off,
            Err(kind) => {
                self.events.push(RegistryEvent::PoolExhausted { kind, pid });
                return Err(RegistryError::PoolExhausted);
            }
        };
        let entry = ValueEntry {
            oid: oid.0,
            value_bits: initial_bits,
            descriptor_offset,
            pid: pid.0,
            flags: flags.bits(),
            auth: auth as u8,
        };
        let at = self
            .values
            .binary_search_by_key(&oid.0, |e| e.oid)
            .unwrap_err();
        self.values.insert(at, entry);
        self.events.push(RegistryEvent::ValueRegistered { oid, pid });
        self.check_thresholds();
        Ok(())
    }

    /// Reads a value's current bits, gated by auth level.
    pub fn get_value(&self, oid: Oid, auth: AuthLevel) -> Result<u16, RegistryError> {
        let e = &self.values[self.value_index(oid)?];
        if (e.auth) > auth as u8 {
            return Err(RegistryError::Permission);
        }
        Ok(e.value_bits)
    }

    /// Writes a value.
    ///
    /// Only the owner may write an entry without the RW flag; everyone
    /// else also needs a sufficient auth level. On success the returned
    /// effects carry subscriber posts and an optional persistence write.
    pub fn set_value(
        &mut self,
        caller: Pid,
        auth: AuthLevel,
        oid: Oid,
        new_bits: u16,
    ) -> Result<SetEffects, RegistryError> {
        let i = self.value_index(oid)?;
        let e = &self.values[i];
        let flags = ValueFlags::from_bits_truncate(e.flags);
        let is_owner = e.pid == caller.0 || caller.is_system();
        if !is_owner {
            if !flags.contains(ValueFlags::RW) {
                return Err(RegistryError::Permission);
            }
            if e.auth > auth as u8 {
                return Err(RegistryError::Permission);
            }
        }
        let old_bits = e.value_bits;
        self.values[i].value_bits = new_bits;
        self.events.push(RegistryEvent::ValueChanged { oid, old_bits, new_bits });

        let posts = self
            .subscriptions
            .iter()
            .filter(|(s, _)| *s == oid)
            .map(|&(_, h)| (h, oid, new_bits))
            .collect();
        let persist = flags
            .contains(ValueFlags::PERSIST)
            .then_some((oid, new_bits));
        Ok(SetEffects { posts, persist })
    }

    /// Integer store: converts and clamps to the finite binary16 range.
    pub fn set_value_from_i32(
        &mut self,
        caller: Pid,
        auth: AuthLevel,
        oid: Oid,
        v: i32,
    ) -> Result<SetEffects, RegistryError> {
        self.set_value(caller, auth, oid, i32_to_f16_bits(v))
    }

    /// Binds a mailbox to a value's change stream.
    pub fn subscribe(&mut self, oid: Oid, handle: Handle) -> Result<(), RegistryError> {
        self.value_index(oid)?;
        if !self.subscriptions.iter().any(|&(o, h)| o == oid && h == handle) {
            self.subscriptions.push((oid, handle));
        }
        Ok(())
    }

    pub fn unsubscribe(&mut self, oid: Oid, handle: Handle) {
        self.subscriptions.retain(|&(o, h)| !(o == oid && h == handle));
    }

    /// Drops every subscription bound to a now-closed mailbox.
    pub fn on_mailbox_closed(&mut self, handle: Handle) {
        self.subscriptions.retain(|&(_, h)| h != handle);
    }

    /// Registers a command. Secure commands carry their PIN here.
    pub fn register_command(
        &mut self,
        pid: Pid,
        oid: Oid,
        flags: CommandFlags,
        auth: AuthLevel,
        handler_address: u32,
        descriptors: &[Descriptor],
        pin: Option<u32>,
    ) -> Result<(), RegistryError> {
        if self.commands.binary_search_by_key(&oid.0, |e| e.oid).is_ok() {
            return Err(RegistryError::Duplicate);
        }
        if self.commands.len() >= self.config.max_commands {
            self.events.push(RegistryEvent::PoolExhausted { kind: PoolKind::Commands, pid });
            return Err(RegistryError::PoolExhausted);
        }
        let descriptor_offset = if descriptors.is_empty() {
            NO_DESCRIPTOR
        } else {
            match self.pool.intern_chain(descriptors) {
                Ok(off) => off,
                Err(kind) => {
                    self.events.push(RegistryEvent::PoolExhausted { kind, pid });
                    return Err(RegistryError::PoolExhausted);
                }
            }
        };
        let entry = CommandEntry {
            handler_address,
            oid: oid.0,
            descriptor_offset,
            owner_pid: pid.0,
            flags: flags.bits(),
            auth: auth as u8,
        };
        let at = self
            .commands
            .binary_search_by_key(&oid.0, |e| e.oid)
            .unwrap_err();
        self.commands.insert(at, entry);
        if let Some(pin) = pin {
            self.pins.push((oid, pin));
        }
        self.check_thresholds();
        Ok(())
    }

    /// Validates an invocation and marks exclusive commands busy.
    ///
    /// The caller must pair this with [`Registry::complete_command`] once
    /// the handler finishes.
    pub fn begin_command(
        &mut self,
        oid: Oid,
        auth: AuthLevel,
        token: Option<u32>,
    ) -> Result<CommandEntry, RegistryError> {
        let i = self.command_index(oid)?;
        let e = self.commands[i];
        if e.auth > auth as u8 {
            return Err(RegistryError::Permission);
        }
        let flags = CommandFlags::from_bits_truncate(e.flags);
        if flags.contains(CommandFlags::SECURE) {
            let expected = self
                .pins
                .iter()
                .find(|(o, _)| *o == oid)
                .map(|&(_, p)| p);
            if expected.is_none() || token != expected {
                return Err(RegistryError::Permission);
            }
        }
        if flags.contains(CommandFlags::EXCLUSIVE) {
            if self.busy.contains(&oid) {
                return Err(RegistryError::Busy);
            }
            self.busy.push(oid);
        }
        Ok(e)
    }

    /// Clears the busy mark of an exclusive command.
    pub fn complete_command(&mut self, oid: Oid) {
        self.busy.retain(|o| *o != oid);
    }

    pub fn command(&self, oid: Oid) -> Result<CommandEntry, RegistryError> {
        Ok(self.commands[self.command_index(oid)?])
    }

    pub fn values(&self) -> &[ValueEntry] {
        &self.values
    }

    pub fn commands(&self) -> &[CommandEntry] {
        &self.commands
    }

    /// Decodes the descriptor chain of a value or command entry.
    pub fn descriptors(&self, descriptor_offset: u16) -> Vec<Descriptor> {
        self.pool.read_chain(descriptor_offset)
    }

    pub fn take_events(&mut self) -> Vec<RegistryEvent> {
        std::mem::take(&mut self.events)
    }

    /// Releases everything owned by an exiting task. Persistent commands
    /// survive; they belong to the application, not the task instance.
    pub fn on_task_exit(&mut self, pid: Pid) {
        self.values.retain(|e| e.pid != pid.0);
        self.commands.retain(|e| {
            e.owner_pid != pid.0
                || CommandFlags::from_bits_truncate(e.flags)
                    .contains(CommandFlags::PERSISTENT)
        });
        let live: Vec<u16> = self.values.iter().map(|e| e.oid).collect();
        self.subscriptions.retain(|(o, _)| live.contains(&o.0));
    }

    /// Emits warning/pressure telemetry when a pool crosses 70% / 80%,
    /// once per crossing.
    fn check_thresholds(&mut self) {
        let usages = [
            (PoolKind::Values, self.values.len(), self.config.max_values),
            (PoolKind::Commands, self.commands.len(), self.config.max_commands),
            (
                PoolKind::Descriptors,
                self.pool.descriptor_bytes_used(),
                self.config.descriptor_pool_bytes,
            ),
            (
                PoolKind::Strings,
                self.pool.string_bytes_used(),
                self.config.string_pool_bytes,
            ),
        ];
        for (idx, (kind, used, cap)) in usages.into_iter().enumerate() {
            let latch = &mut self.latches[idx];
            let pct = used * 100 / cap.max(1);
            if pct >= 80 {
                if !latch.pressured {
                    latch.pressured = true;
                    self.events.push(RegistryEvent::PoolPressure { kind, used, capacity: cap });
                }
            } else {
                latch.pressured = false;
            }
            if pct >= 70 {
                if !latch.warned {
                    latch.warned = true;
                    self.events.push(RegistryEvent::PoolWarning { kind, used, capacity: cap });
                }
            } else {
                latch.warned = false;
            }
        }
    }
}

/// Integer-to-f16 conversion with clamping to the finite range, per the
/// numeric contract: integer stores never produce infinities.
pub fn i32_to_f16_bits(v: i32) -> u16 {
    let f = f16::from_f32(v as f32);
    if f.is_infinite() {
        if v < 0 {
            f16::MIN.to_bits()
        } else {
            f16::MAX.to_bits()
        }
    } else {
        f.to_bits()
    }
}

/// Boolean payloads are exactly 0.0 or 1.0.
pub fn bool_to_f16_bits(v: bool) -> u16 {
    if v {
        f16::ONE.to_bits()
    } else {
        f16::ZERO.to_bits()
    }
}
