// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The mailbox subsystem: namespaced message queues with first-reader,
//! fan-out and tap delivery.
//!
//! The table is owned and mutated exclusively by the executive
//! (single-writer discipline); SVC handlers and the control plane reach
//! it through the executive. Blocking is not implemented here: an
//! operation that would block returns `WouldBlock`, the executive parks
//! the task and registers a waiter, and the completed send/recv reports
//! which waiters became satisfiable so the executive can wake them in
//! FIFO order.
//!
//! Handles are slot index + generation; closing a mailbox tombstones the
//! slot, so stale handles resolve to `BadHandle` instead of whatever gets
//! created there next.

mod ring;

pub use ring::{MsgRing, RingFull, FRAME_OVERHEAD};

use std::collections::VecDeque;

use hsx_abi::{Handle, ModeMask, Pid};

/// Errors for every table operation, mapped onto the standard SVC codes
/// by the dispatcher.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MailboxError {
    /// `open` named a mailbox that does not exist.
    NoSuchMailbox,
    /// Caller may not perform this operation on this mailbox.
    Permission,
    /// `create` named an existing mailbox.
    Exists,
    /// The slot arena is full.
    OutOfSlots,
    /// Name failed namespace validation.
    BadName,
    /// Non-blocking operation cannot proceed; the caller may park.
    WouldBlock,
    /// The mailbox was closed while the caller held a handle to it.
    Closed,
    /// `peek` on an empty queue.
    Empty,
    /// Stale or never-valid handle.
    BadHandle,
    /// Payload exceeds the mailbox capacity and can never be sent.
    TooBig,
}

/// Mailbox namespaces, parsed from the `prefix:rest` name syntax.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Namespace {
    /// `svc:` -- system services, owned by the system.
    Svc,
    /// `pid:<n>:` -- private to task `n`.
    Task(u16),
    /// `app:` -- intra-application, owned by the creating task.
    App,
    /// `shared:` -- global, owned by the system.
    Shared,
}

impl Namespace {
    /// Splits a full mailbox name into its namespace and bare name.
    pub fn parse(name: &str) -> Result<(Namespace, &str), MailboxError> {
        if let Some(rest) = name.strip_prefix("svc:") {
            return Ok((Namespace::Svc, rest));
        }
        if let Some(rest) = name.strip_prefix("app:") {
            return Ok((Namespace::App, rest));
        }
        if let Some(rest) = name.strip_prefix("shared:") {
            return Ok((Namespace::Shared, rest));
        }
        if let Some(tail) = name.strip_prefix("pid:") {
            let (num, rest) = tail.split_once(':').ok_or(MailboxError::BadName)?;
            let pid = num.parse::<u16>().map_err(|_| MailboxError::BadName)?;
            return Ok((Namespace::Task(pid), rest));
        }
        Err(MailboxError::BadName)
    }
}

/// What a parked task is waiting to do, stored FIFO per mailbox.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitKind {
    /// Waiting for a message to arrive.
    Recv,
    /// Waiting for `payload_len` bytes of ring space.
    Send { payload_len: usize },
}

/// A task the executive should move to `Ready` because its wait is now
/// satisfiable (or its mailbox closed).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Wake {
    pub pid: Pid,
    /// `true` when the wake is a close notification: the retried
    /// operation must fail `Closed` rather than run.
    pub closed: bool,
}

/// Telemetry the executive turns into events. Collected by
/// [`MailboxTable::take_events`] so emission order follows the scheduler,
/// not the interleaving of table calls.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MailboxEvent {
    /// A reader started losing messages; `dropped` is cumulative for the
    /// burst.
    Overflow { handle: Handle, reader: Pid, dropped: u64 },
    /// Aggregate allocated capacity crossed the pressure threshold.
    Pressure { allocated: usize, budget: usize },
}

/// Per-mailbox statistics.
///
/// `deliveries` counts per-reader enqueues (for a first-reader mailbox it
/// equals `sends`); the conservation invariant is
/// `deliveries == receives + drops + pending messages`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MailboxStats {
    pub sends: u64,
    pub deliveries: u64,
    pub receives: u64,
    pub drops: u64,
    pub overflow_events: u64,
    pub high_water: usize,
}

/// Snapshot of one mailbox for the control plane's `mbox.inspect`.
#[derive(Clone, Debug)]
pub struct MailboxInfo {
    pub name: String,
    pub namespace: Namespace,
    pub capacity: usize,
    pub mode: ModeMask,
    pub owner: Pid,
    pub readers: Vec<Pid>,
    pub taps: Vec<Pid>,
    pub waiters: Vec<Pid>,
    pub depth_bytes: usize,
    pub stats: MailboxStats,
}

/// One bound endpoint of a fan-out mailbox, or a tap observer.
struct Binding {
    pid: Pid,
    ring: MsgRing,
    /// Drops in the current burst. A burst ends when the reader drains
    /// something; one overflow event is emitted per burst, however long.
    dropped_since_event: u64,
    /// Set once the current burst's event has gone out.
    burst_reported: bool,
    total_dropped: u64,
}

struct Mailbox {
    name: String,
    namespace: Namespace,
    capacity: usize,
    mode: ModeMask,
    owner: Pid,
    /// Shared queue for first-reader delivery. Unused (empty) for pure
    /// fan-out mailboxes.
    ring: MsgRing,
    /// Bound fan-out readers.
    readers: Vec<Binding>,
    /// Tap observers; taps never block senders, so their rings drop.
    taps: Vec<Binding>,
    /// Tasks that have opened this mailbox, with their access bits.
    openers: Vec<(Pid, ModeMask)>,
    waiters: VecDeque<(Pid, WaitKind)>,
    stats: MailboxStats,
}

impl Mailbox {
    fn access_of(&self, pid: Pid) -> Option<ModeMask> {
        if pid == self.owner || pid.is_system() {
            return Some(ModeMask::RDWR);
        }
        self.openers
            .iter()
            .find(|(p, _)| *p == pid)
            .map(|(_, m)| *m)
    }

    fn depth_high_water(&mut self) {
        let mut depth = self.ring.depth();
        for b in self.readers.iter().chain(self.taps.iter()) {
            depth = depth.max(b.ring.depth());
        }
        self.stats.high_water = self.stats.high_water.max(depth);
    }
}

struct Slot {
    generation: u16,
    mailbox: Option<Mailbox>,
}

/// Table-wide tunables.
#[derive(Clone, Debug)]
pub struct MailboxConfig {
    /// Maximum live mailboxes.
    pub max_slots: usize,
    /// Aggregate capacity budget in bytes; crossing 80% of it emits a
    /// pressure event.
    pub capacity_budget: usize,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        MailboxConfig { max_slots: 64, capacity_budget: 64 * 1024 }
    }
}

/// The mailbox table. See the module docs for the ownership rules.
pub struct MailboxTable {
    config: MailboxConfig,
    slots: Vec<Slot>,
    allocated_capacity: usize,
    pressure_flagged: bool,
    events: Vec<MailboxEvent>,
}

impl MailboxTable {
    pub fn new(config: MailboxConfig) -> Self {
        MailboxTable {
            config,
            slots: Vec::new(),
            allocated_capacity: 0,
            pressure_flagged: false,
            events: Vec::new(),
        }
    }

    fn resolve(&self, handle: Handle) -> Result<&Mailbox, MailboxError> {
        let slot = self.slots.get(handle.index()).ok_or(MailboxError::BadHandle)?;
        if slot.generation != handle.generation() {
            return Err(MailboxError::BadHandle);
        }
        slot.mailbox.as_ref().ok_or(MailboxError::BadHandle)
    }

    fn resolve_mut(&mut self, handle: Handle) -> Result<&mut Mailbox, MailboxError> {
        let slot = self
            .slots
            .get_mut(handle.index())
            .ok_or(MailboxError::BadHandle)?;
        if slot.generation != handle.generation() {
            return Err(MailboxError::BadHandle);
        }
        slot.mailbox.as_mut().ok_or(MailboxError::BadHandle)
    }

    fn find_by_name(&self, name: &str) -> Option<Handle> {
        self.slots.iter().enumerate().find_map(|(i, s)| {
            s.mailbox
                .as_ref()
                .filter(|m| m.name == name)
                .map(|_| Handle::for_index_and_gen(i, s.generation))
        })
    }

    /// Creates a mailbox. `pid` is the creating task (or the system).
    pub fn create(
        &mut self,
        pid: Pid,
        name: &str,
        capacity: usize,
        mode: ModeMask,
    ) -> Result<Handle, MailboxError> {
        let (namespace, bare) = Namespace::parse(name)?;
        if bare.is_empty() {
            return Err(MailboxError::BadName);
        }
        // svc: is reserved to the system; a task may only create its own
        // private namespace.
        let owner = match namespace {
            Namespace::Svc | Namespace::Shared => {
                if !pid.is_system() && namespace == Namespace::Svc {
                    return Err(MailboxError::Permission);
                }
                Pid::SYSTEM
            }
            Namespace::Task(n) => {
                if !pid.is_system() && pid.0 != n {
                    return Err(MailboxError::Permission);
                }
                Pid(n)
            }
            Namespace::App => pid,
        };
        if self.find_by_name(name).is_some() {
            return Err(MailboxError::Exists);
        }

        let live = self.slots.iter().filter(|s| s.mailbox.is_some()).count();
        if live >= self.config.max_slots {
            return Err(MailboxError::OutOfSlots);
        }

        let mailbox = Mailbox {
            name: name.to_string(),
            namespace,
            capacity,
            mode,
            owner,
            ring: MsgRing::new(if mode.is_fanout() { 0 } else { capacity }),
            readers: Vec::new(),
            taps: Vec::new(),
            openers: vec![(pid, mode & ModeMask::RDWR)],
            waiters: VecDeque::new(),
            stats: MailboxStats::default(),
        };

        self.allocated_capacity += capacity;
        self.check_pressure();

        // Reuse a tombstoned slot if one exists; its generation was
        // already bumped at close time.
        let index = match self.slots.iter().position(|s| s.mailbox.is_none()) {
            Some(i) => {
                self.slots[i].mailbox = Some(mailbox);
                i
            }
            None => {
                self.slots.push(Slot { generation: 0, mailbox: Some(mailbox) });
                self.slots.len() - 1
            }
        };
        let h = Handle::for_index_and_gen(index, self.slots[index].generation);

        // A fan-out creator that can read is itself a bound reader.
        let m = self.slots[index].mailbox.as_mut().unwrap();
        if m.mode.is_fanout() && mode.contains(ModeMask::RDONLY) && !pid.is_system() {
            m.readers.push(Binding {
                pid,
                ring: MsgRing::new(capacity),
                dropped_since_event: 0,
                burst_reported: false,
                total_dropped: 0,
            });
        }
        Ok(h)
    }

    /// Opens an existing mailbox. Binds the opener as a fan-out reader if
    /// the mailbox fans out and the requested mode includes read access.
    pub fn open(&mut self, pid: Pid, name: &str, mode: ModeMask) -> Result<Handle, MailboxError> {
        let (namespace, _) = Namespace::parse(name)?;
        if let Namespace::Task(n) = namespace {
            if !pid.is_system() && pid.0 != n {
                return Err(MailboxError::Permission);
            }
        }
        let handle = self.find_by_name(name).ok_or(MailboxError::NoSuchMailbox)?;
        let m = self.resolve_mut(handle)?;
        let requested = mode & ModeMask::RDWR;
        if !m.mode.contains(requested) {
            return Err(MailboxError::Permission);
        }
        if let Some((_, access)) = m.openers.iter_mut().find(|(p, _)| *p == pid) {
            *access |= requested;
        } else {
            m.openers.push((pid, requested));
        }
        if m.mode.is_fanout()
            && requested.contains(ModeMask::RDONLY)
            && !m.readers.iter().any(|b| b.pid == pid)
        {
            let cap = m.capacity;
            m.readers.push(Binding {
                pid,
                ring: MsgRing::new(cap),
                dropped_since_event: 0,
                burst_reported: false,
                total_dropped: 0,
            });
        }
        Ok(handle)
    }

    /// Sends one message.
    ///
    /// Returns the bytes accepted plus the recv-waiters to wake. If the
    /// queue (or, for `FANOUT_BLOCK`, any bound reader's queue) lacks
    /// space, returns `WouldBlock` and the caller decides whether to park.
    pub fn send(
        &mut self,
        pid: Pid,
        handle: Handle,
        payload: &[u8],
    ) -> Result<(usize, Vec<Wake>), MailboxError> {
        let m = self.resolve_mut(handle)?;
        let access = m.access_of(pid).ok_or(MailboxError::Permission)?;
        if !access.contains(ModeMask::WRONLY) {
            return Err(MailboxError::Permission);
        }
        if payload.len() + FRAME_OVERHEAD > m.capacity.max(FRAME_OVERHEAD) {
            return Err(MailboxError::TooBig);
        }

        if m.mode.is_fanout() {
            // FANOUT_BLOCK applies back-pressure per slow reader: every
            // bound reader must have room before anything is delivered,
            // so no reader ever sees a partial broadcast.
            if m.mode.contains(ModeMask::FANOUT_BLOCK)
                && m.readers.iter().any(|b| !b.ring.fits(payload.len()))
            {
                return Err(MailboxError::WouldBlock);
            }
            m.stats.sends += 1;
            for b in &mut m.readers {
                match b.ring.push(payload) {
                    Ok(()) => m.stats.deliveries += 1,
                    Err(_) => {
                        // FANOUT_DROP: the slow reader loses the message.
                        m.stats.deliveries += 1;
                        m.stats.drops += 1;
                        b.total_dropped += 1;
                        b.dropped_since_event += 1;
                    }
                }
            }
        } else {
            if !m.ring.fits(payload.len()) {
                return Err(MailboxError::WouldBlock);
            }
            m.ring.push(payload).expect("fits() checked above");
            m.stats.sends += 1;
            m.stats.deliveries += 1;
        }

        // Taps observe every accepted send; they never block, so a full
        // tap ring silently drops.
        for t in &mut m.taps {
            if t.ring.push(payload).is_err() {
                t.total_dropped += 1;
            }
        }

        m.depth_high_water();

        // Wake the oldest recv waiter; the message satisfies exactly one
        // receive for first-reader, and any number for fan-out (wake them
        // all -- their queues are now nonempty).
        let mut wakes = Vec::new();
        if m.mode.is_fanout() {
            while let Some(pos) = m.waiters.iter().position(|(_, k)| *k == WaitKind::Recv) {
                let (p, _) = m.waiters.remove(pos).unwrap();
                wakes.push(Wake { pid: p, closed: false });
            }
        } else if let Some(pos) = m.waiters.iter().position(|(_, k)| *k == WaitKind::Recv) {
            let (p, _) = m.waiters.remove(pos).unwrap();
            wakes.push(Wake { pid: p, closed: false });
        }
        Ok((payload.len(), wakes))
    }

    /// Receives the oldest message for `pid`.
    ///
    /// Returns the payload plus the send-waiters whose messages now fit.
    /// An empty queue returns `WouldBlock`; the caller parks or polls.
    pub fn recv(
        &mut self,
        pid: Pid,
        handle: Handle,
    ) -> Result<(Vec<u8>, Vec<Wake>), MailboxError> {
        let m = self.resolve_mut(handle)?;

        // Taps read their own observation queue without consuming from
        // anyone; they bypass the access check and the stats.
        if let Some(tap) = m.taps.iter_mut().find(|b| b.pid == pid) {
            let msg = tap.ring.pop().ok_or(MailboxError::WouldBlock)?;
            return Ok((msg, Vec::new()));
        }

        let access = m.access_of(pid).ok_or(MailboxError::Permission)?;
        if !access.contains(ModeMask::RDONLY) {
            return Err(MailboxError::Permission);
        }
        let msg = if m.mode.is_fanout() {
            let b = m
                .readers
                .iter_mut()
                .find(|b| b.pid == pid)
                .ok_or(MailboxError::Permission)?;
            let msg = b.ring.pop().ok_or(MailboxError::WouldBlock)?;
            // The reader is draining again: the drop burst (if any) is
            // over, and a future drop starts a new one.
            b.dropped_since_event = 0;
            b.burst_reported = false;
            msg
        } else {
            m.ring.pop().ok_or(MailboxError::WouldBlock)?
        };
        m.stats.receives += 1;

        // Space came free: wake the oldest sender whose message now fits.
        let mut wakes = Vec::new();
        let free = if m.mode.is_fanout() {
            m.readers.iter().map(|b| b.ring.free()).min().unwrap_or(0)
        } else {
            m.ring.free()
        };
        if let Some(pos) = m.waiters.iter().position(|(_, k)| {
            matches!(k, WaitKind::Send { payload_len } if payload_len + FRAME_OVERHEAD <= free)
        }) {
            let (p, _) = m.waiters.remove(pos).unwrap();
            wakes.push(Wake { pid: p, closed: false });
        }
        Ok((msg, wakes))
    }

    /// Copies the oldest message without consuming it.
    pub fn peek(&mut self, pid: Pid, handle: Handle) -> Result<Vec<u8>, MailboxError> {
        let m = self.resolve_mut(handle)?;
        let access = m.access_of(pid).ok_or(MailboxError::Permission)?;
        if !access.contains(ModeMask::RDONLY) {
            return Err(MailboxError::Permission);
        }
        let msg = if m.mode.is_fanout() {
            m.readers
                .iter()
                .find(|b| b.pid == pid)
                .ok_or(MailboxError::Permission)?
                .ring
                .peek()
        } else {
            m.ring.peek()
        };
        msg.ok_or(MailboxError::Empty)
    }

    /// Attaches `pid` as a tap observer. Requires the mailbox to admit
    /// taps.
    pub fn tap(&mut self, pid: Pid, handle: Handle) -> Result<(), MailboxError> {
        let m = self.resolve_mut(handle)?;
        if !m.mode.contains(ModeMask::TAP) {
            return Err(MailboxError::Permission);
        }
        if m.taps.iter().any(|b| b.pid == pid) {
            return Ok(());
        }
        let cap = m.capacity;
        m.taps.push(Binding {
            pid,
            ring: MsgRing::new(cap),
            dropped_since_event: 0,
            burst_reported: false,
            total_dropped: 0,
        });
        Ok(())
    }

    /// Closes a handle.
    ///
    /// The owner (or the system) destroys the mailbox: the slot is
    /// tombstoned, its generation bumped, and every waiter is woken with
    /// `Closed`. Anyone else merely detaches their bindings.
    pub fn close(&mut self, pid: Pid, handle: Handle) -> Result<Vec<Wake>, MailboxError> {
        let owner = self.resolve(handle)?.owner;
        if pid == owner || pid.is_system() {
            let slot = &mut self.slots[handle.index()];
            let m = slot.mailbox.take().expect("resolved above");
            slot.generation = slot.generation.wrapping_add(1);
            self.allocated_capacity -= m.capacity;
            if self.allocated_capacity * 100 < self.config.capacity_budget * 80 {
                self.pressure_flagged = false;
            }
            Ok(m
                .waiters
                .into_iter()
                .map(|(p, _)| Wake { pid: p, closed: true })
                .collect())
        } else {
            let m = self.resolve_mut(handle)?;
            m.readers.retain(|b| b.pid != pid);
            m.taps.retain(|b| b.pid != pid);
            m.openers.retain(|(p, _)| *p != pid);
            m.waiters.retain(|(p, _)| *p != pid);
            Ok(Vec::new())
        }
    }

    /// Registers `pid` as a FIFO waiter on `handle`.
    pub fn add_waiter(
        &mut self,
        pid: Pid,
        handle: Handle,
        kind: WaitKind,
    ) -> Result<(), MailboxError> {
        let m = self.resolve_mut(handle)?;
        if !m.waiters.iter().any(|(p, _)| *p == pid) {
            m.waiters.push_back((pid, kind));
        }
        Ok(())
    }

    /// Removes `pid` from a mailbox's wait list (timeout or kill paths).
    pub fn cancel_waiter(&mut self, pid: Pid, handle: Handle) {
        if let Ok(m) = self.resolve_mut(handle) {
            m.waiters.retain(|(p, _)| *p != pid);
        }
    }

    /// Statistics for the control plane.
    pub fn stats(&self, handle: Handle) -> Result<MailboxStats, MailboxError> {
        Ok(self.resolve(handle)?.stats)
    }

    /// Full description of one mailbox, for `mbox.inspect`.
    pub fn inspect(&self, handle: Handle) -> Result<MailboxInfo, MailboxError> {
        let m = self.resolve(handle)?;
        Ok(MailboxInfo {
            name: m.name.clone(),
            namespace: m.namespace.clone(),
            capacity: m.capacity,
            mode: m.mode,
            owner: m.owner,
            readers: m.readers.iter().map(|b| b.pid).collect(),
            taps: m.taps.iter().map(|b| b.pid).collect(),
            waiters: m.waiters.iter().map(|&(p, _)| p).collect(),
            depth_bytes: if m.mode.is_fanout() {
                m.readers.iter().map(|b| b.ring.depth()).max().unwrap_or(0)
            } else {
                m.ring.depth()
            },
            stats: m.stats,
        })
    }

    /// Queue depth in messages, summed across bindings for fan-out.
    pub fn depth_msgs(&self, handle: Handle) -> Result<usize, MailboxError> {
        let m = self.resolve(handle)?;
        if m.mode.is_fanout() {
            Ok(m.readers.iter().map(|b| b.ring.len()).sum())
        } else {
            Ok(m.ring.len())
        }
    }

    /// Pending (queued, undelivered) messages, for the conservation
    /// invariant `deliveries == receives + drops + pending`.
    pub fn pending_msgs(&self, handle: Handle) -> Result<usize, MailboxError> {
        self.depth_msgs(handle)
    }

    /// All live mailboxes as `(handle, name, owner)`.
    pub fn list(&self) -> Vec<(Handle, String, Pid)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| {
                s.mailbox.as_ref().map(|m| {
                    (
                        Handle::for_index_and_gen(i, s.generation),
                        m.name.clone(),
                        m.owner,
                    )
                })
            })
            .collect()
    }

    /// Drains accumulated telemetry. Overflow events coalesce an entire
    /// drop burst into one event per reader.
    pub fn take_events(&mut self) -> Vec<MailboxEvent> {
        let mut out = std::mem::take(&mut self.events);
        for (i, slot) in self.slots.iter_mut().enumerate() {
            let Some(m) = slot.mailbox.as_mut() else { continue };
            let handle = Handle::for_index_and_gen(i, slot.generation);
            for b in m.readers.iter_mut() {
                if b.dropped_since_event > 0 && !b.burst_reported {
                    out.push(MailboxEvent::Overflow {
                        handle,
                        reader: b.pid,
                        dropped: b.total_dropped,
                    });
                    b.burst_reported = true;
                    m.stats.overflow_events += 1;
                }
            }
        }
        out
    }

    /// Tears down everything `pid` owns or is bound to. Returns the
    /// waiters to wake with `Closed`.
    pub fn on_task_exit(&mut self, pid: Pid) -> Vec<Wake> {
        let mut wakes = Vec::new();
        let mut freed = 0;
        for slot in self.slots.iter_mut() {
            let destroy = matches!(&slot.mailbox, Some(m) if m.owner == pid);
            if destroy {
                let m = slot.mailbox.take().unwrap();
                freed += m.capacity;
                slot.generation = slot.generation.wrapping_add(1);
                wakes.extend(
                    m.waiters
                        .into_iter()
                        .filter(|(p, _)| *p != pid)
                        .map(|(p, _)| Wake { pid: p, closed: true }),
                );
            } else if let Some(m) = slot.mailbox.as_mut() {
                m.readers.retain(|b| b.pid != pid);
                m.taps.retain(|b| b.pid != pid);
                m.openers.retain(|(p, _)| *p != pid);
                m.waiters.retain(|(p, _)| *p != pid);
            }
        }
        self.allocated_capacity -= freed;
        wakes
    }

    fn check_pressure(&mut self) {
        let used = self.allocated_capacity * 100;
        let threshold = self.config.capacity_budget * 80;
        if used >= threshold && !self.pressure_flagged {
            self.pressure_flagged = true;
            self.events.push(MailboxEvent::Pressure {
                allocated: self.allocated_capacity,
                budget: self.config.capacity_budget,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> MailboxTable {
        MailboxTable::new(MailboxConfig::default())
    }

    const PRODUCER: Pid = Pid(2);
    const CONSUMER: Pid = Pid(3);

    #[test]
    fn first_reader_send_recv_round_trip() {
        let mut t = table();
        let h = t
            .create(PRODUCER, "shared:test", 64, ModeMask::RDWR)
            .unwrap();
        t.open(CONSUMER, "shared:test", ModeMask::RDONLY).unwrap();

        let (n, wakes) = t.send(PRODUCER, h, &[7; 16]).unwrap();
        assert_eq!(n, 16);
        assert!(wakes.is_empty());

        let (msg, _) = t.recv(CONSUMER, h).unwrap();
        assert_eq!(msg, vec![7; 16]);
        assert_eq!(t.depth_msgs(h).unwrap(), 0);

        let s = t.stats(h).unwrap();
        assert_eq!((s.sends, s.receives, s.drops), (1, 1, 0));
    }

    #[test]
    fn parked_receiver_is_woken_by_send() {
        let mut t = table();
        let h = t
            .create(PRODUCER, "shared:test", 64, ModeMask::RDWR)
            .unwrap();
        t.open(CONSUMER, "shared:test", ModeMask::RDONLY).unwrap();

        assert_eq!(t.recv(CONSUMER, h), Err(MailboxError::WouldBlock));
        t.add_waiter(CONSUMER, h, WaitKind::Recv).unwrap();

        let (_, wakes) = t.send(PRODUCER, h, b"ping").unwrap();
        assert_eq!(wakes, vec![Wake { pid: CONSUMER, closed: false }]);
        let (msg, _) = t.recv(CONSUMER, h).unwrap();
        assert_eq!(msg, b"ping");
    }

    #[test]
    fn fanout_drop_loses_only_the_slow_reader_messages() {
        let mut t = table();
        let mode = ModeMask::RDWR | ModeMask::FANOUT_DROP;
        let h = t.create(Pid::SYSTEM, "shared:bus", 32, mode).unwrap();
        let a = Pid(4);
        let b = Pid(5);
        t.open(a, "shared:bus", ModeMask::RDONLY).unwrap();
        t.open(b, "shared:bus", ModeMask::RDONLY).unwrap();

        let mut a_got = Vec::new();
        for i in 0..100u8 {
            t.send(Pid::SYSTEM, h, &[i; 16]).unwrap();
            // A consumes promptly; B never reads.
            if let Ok((msg, _)) = t.recv(a, h) {
                a_got.push(msg[0]);
            }
        }
        assert_eq!(a_got.len(), 100, "fast reader must see every frame");
        assert!(a_got.windows(2).all(|w| w[0] < w[1]), "frames must stay ordered");

        let s = t.stats(h).unwrap();
        assert!(s.drops > 0, "slow reader must have dropped");
        // One coalesced overflow event for the whole burst.
        let events = t.take_events();
        let overflows: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, MailboxEvent::Overflow { .. }))
            .collect();
        assert_eq!(overflows.len(), 1, "drop burst must coalesce to one event");
        match overflows[0] {
            MailboxEvent::Overflow { dropped, reader, .. } => {
                assert_eq!(*reader, b);
                assert_eq!(*dropped, s.drops);
            }
            _ => unreachable!(),
        }
        // Conservation: deliveries = receives + drops + pending.
        let pending = t.pending_msgs(h).unwrap() as u64;
        assert_eq!(s.deliveries, s.receives + s.drops + pending);
    }

    #[test]
    fn fanout_block_applies_backpressure_for_any_slow_reader() {
        let mut t = table();
        let mode = ModeMask::RDWR | ModeMask::FANOUT_BLOCK;
        let h = t.create(Pid::SYSTEM, "shared:bus", 20, mode).unwrap();
        t.open(Pid(4), "shared:bus", ModeMask::RDONLY).unwrap();
        t.open(Pid(5), "shared:bus", ModeMask::RDONLY).unwrap();

        t.send(Pid::SYSTEM, h, &[0; 16]).unwrap();
        // Reader 4 drains; reader 5 does not. The next send must block on
        // reader 5's full ring.
        t.recv(Pid(4), h).unwrap();
        assert_eq!(
            t.send(Pid::SYSTEM, h, &[1; 16]),
            Err(MailboxError::WouldBlock)
        );
    }

    #[test]
    fn taps_observe_without_consuming_and_never_block() {
        let mut t = table();
        let mode = ModeMask::RDWR | ModeMask::TAP;
        let h = t.create(PRODUCER, "app:stream", 64, mode).unwrap();
        t.open(CONSUMER, "app:stream", ModeMask::RDONLY).unwrap();
        let observer = Pid(9);
        t.tap(observer, h).unwrap();

        t.send(PRODUCER, h, b"data").unwrap();
        let (msg, _) = t.recv(CONSUMER, h).unwrap();
        assert_eq!(msg, b"data");
        // The tap still sees its own copy.
        let (copy, _) = t.recv(observer, h).unwrap();
        assert_eq!(copy, b"data");
    }

    #[test]
    fn close_by_owner_tombstones_and_wakes_waiters() {
        let mut t = table();
        let h = t.create(PRODUCER, "app:q", 16, ModeMask::RDWR).unwrap();
        t.open(CONSUMER, "app:q", ModeMask::RDONLY).unwrap();
        t.add_waiter(CONSUMER, h, WaitKind::Recv).unwrap();

        let wakes = t.close(PRODUCER, h).unwrap();
        assert_eq!(wakes, vec![Wake { pid: CONSUMER, closed: true }]);
        assert_eq!(t.recv(CONSUMER, h), Err(MailboxError::BadHandle));

        // The slot may be reused, but the old handle must stay dead.
        let h2 = t.create(PRODUCER, "app:q2", 16, ModeMask::RDWR).unwrap();
        assert_eq!(h2.index(), h.index(), "slot should be reused");
        assert_ne!(h2.generation(), h.generation());
        assert_eq!(t.send(PRODUCER, h, b"x"), Err(MailboxError::BadHandle));
    }

    #[test]
    fn private_namespace_is_private() {
        let mut t = table();
        t.create(PRODUCER, "pid:2:inbox", 32, ModeMask::RDWR).unwrap();
        assert_eq!(
            t.open(CONSUMER, "pid:2:inbox", ModeMask::WRONLY),
            Err(MailboxError::Permission)
        );
        assert_eq!(
            t.create(CONSUMER, "pid:2:other", 32, ModeMask::RDWR),
            Err(MailboxError::Permission)
        );
    }

    #[test]
    fn svc_namespace_is_system_only() {
        let mut t = table();
        assert_eq!(
            t.create(PRODUCER, "svc:uart0", 32, ModeMask::RDWR),
            Err(MailboxError::Permission)
        );
        t.create(Pid::SYSTEM, "svc:uart0", 32, ModeMask::RDWR).unwrap();
    }

    #[test]
    fn duplicate_create_fails_exists() {
        let mut t = table();
        t.create(PRODUCER, "app:q", 16, ModeMask::RDWR).unwrap();
        assert_eq!(
            t.create(PRODUCER, "app:q", 16, ModeMask::RDWR),
            Err(MailboxError::Exists)
        );
    }

    #[test]
    fn oversize_payload_is_rejected_outright() {
        let mut t = table();
        let h = t.create(PRODUCER, "app:q", 16, ModeMask::RDWR).unwrap();
        assert_eq!(t.send(PRODUCER, h, &[0; 64]), Err(MailboxError::TooBig));
    }

    #[test]
    fn recv_frees_space_and_wakes_oldest_fitting_sender() {
        let mut t = table();
        let h = t.create(PRODUCER, "app:q", 20, ModeMask::RDWR).unwrap();
        t.open(CONSUMER, "app:q", ModeMask::RDONLY).unwrap();
        t.send(PRODUCER, h, &[0; 16]).unwrap();
        assert_eq!(t.send(PRODUCER, h, &[1; 8]), Err(MailboxError::WouldBlock));
        t.add_waiter(PRODUCER, h, WaitKind::Send { payload_len: 8 }).unwrap();

        let (_, wakes) = t.recv(CONSUMER, h).unwrap();
        assert_eq!(wakes, vec![Wake { pid: PRODUCER, closed: false }]);
    }

    #[test]
    fn task_exit_destroys_owned_mailboxes() {
        let mut t = table();
        let h = t.create(PRODUCER, "app:q", 16, ModeMask::RDWR).unwrap();
        t.open(CONSUMER, "app:q", ModeMask::RDONLY).unwrap();
        t.add_waiter(CONSUMER, h, WaitKind::Recv).unwrap();
        let wakes = t.on_task_exit(PRODUCER);
        assert_eq!(wakes, vec![Wake { pid: CONSUMER, closed: true }]);
        assert_eq!(t.recv(CONSUMER, h), Err(MailboxError::BadHandle));
    }

    #[test]
    fn pressure_event_fires_once_per_crossing() {
        let mut t = MailboxTable::new(MailboxConfig {
            max_slots: 8,
            capacity_budget: 100,
        });
        t.create(Pid::SYSTEM, "shared:a", 40, ModeMask::RDWR).unwrap();
        assert!(t.take_events().is_empty());
        t.create(Pid::SYSTEM, "shared:b", 45, ModeMask::RDWR).unwrap();
        let events = t.take_events();
        assert_eq!(
            events,
            vec![MailboxEvent::Pressure { allocated: 85, budget: 100 }]
        );
        // Still above threshold: no repeat.
        t.create(Pid::SYSTEM, "shared:c", 5, ModeMask::RDWR).unwrap();
        assert!(t.take_events().is_empty());
    }
}
