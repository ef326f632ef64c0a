// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-capacity diagnostics ring for instrumenting the executive.
//!
//! This is the kernel-internal trace, distinct from the operator-facing
//! event stream: entries are cheap tagged moments (context switches, SVC
//! dispatches, wake decisions) kept for postmortem inspection through the
//! control plane's `traceRecords`. Repeated identical entries coalesce
//! into a count rather than flooding the ring.

use hsx_abi::Pid;

/// One traced moment.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Trace {
    ContextSwitch { to: Pid },
    SvcEnter { pid: Pid, module: u8, function: u8 },
    SvcExit { pid: Pid, code: u32 },
    Wake { pid: Pid },
    Park { pid: Pid },
    BreakpointHit { pid: Pid, pc: u32 },
    TaskExit { pid: Pid, code: u32 },
    Fault { pid: Pid },
}

#[derive(Copy, Clone, Debug)]
pub struct TraceRecord {
    pub entry: Trace,
    /// How many consecutive times this exact entry repeated.
    pub count: u32,
    /// Kernel time of the first occurrence, microseconds.
    pub time_us: u64,
}

/// Bounded trace ring; old entries are overwritten.
pub struct TraceRing {
    records: Vec<TraceRecord>,
    capacity: usize,
    next: usize,
    enabled: bool,
}

impl TraceRing {
    pub fn new(capacity: usize) -> Self {
        TraceRing {
            records: Vec::with_capacity(capacity),
            capacity,
            next: 0,
            enabled: false,
        }
    }

    pub fn set_enabled(&mut self, on: bool) {
        self.enabled = on;
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn record(&mut self, entry: Trace, time_us: u64) {
        if !self.enabled || self.capacity == 0 {
            return;
        }
        // Coalesce runs of identical entries.
        let last = if self.records.is_empty() {
            None
        } else {
            let idx = (self.next + self.capacity - 1) % self.capacity;
            let len = self.records.len();
            self.records.get_mut(idx.min(len - 1))
        };
        if let Some(last) = last {
            if last.entry == entry {
                last.count += 1;
                return;
            }
        }
        let rec = TraceRecord { entry, count: 1, time_us };
        if self.records.len() < self.capacity {
            self.records.push(rec);
            self.next = self.records.len() % self.capacity;
        } else {
            self.records[self.next] = rec;
            self.next = (self.next + 1) % self.capacity;
        }
    }

    /// Snapshot in chronological order.
    pub fn snapshot(&self) -> Vec<TraceRecord> {
        if self.records.len() < self.capacity {
            self.records.clone()
        } else {
            let mut out = Vec::with_capacity(self.capacity);
            out.extend_from_slice(&self.records[self.next..]);
            out.extend_from_slice(&self.records[..self.next]);
            out
        }
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.next = 0;
    }
}
