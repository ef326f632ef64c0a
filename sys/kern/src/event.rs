// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-session event stream.
//!
//! Events are serialised in emission order and carry strictly increasing
//! sequence numbers. The stream is bounded for droppable categories and
//! unbounded-but-acknowledged for the lossless three (`stopped`, `fault`,
//! `cmd_completed`): those are retained after delivery until the client
//! ACKs them, and replayed on a reconnect inside the keepalive grace
//! period.
//!
//! Back-pressure: when the ring is full, the ACK window is exhausted, or
//! a category exceeds its per-drain rate limit, droppable events coalesce
//! -- latest value wins for `value_changed` (per OID), `trace_step` is
//! counted and dropped, and everything else is dropped with a counter
//! bump.

use std::collections::{HashMap, VecDeque};

use hsx_abi::{EventCategory, Pid};

/// One operator-visible event.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct Event {
    pub seq: u64,
    pub category: EventCategory,
    pub pid: Pid,
    pub payload: serde_json::Value,
    pub time_us: u64,
}

/// Loss accounting, exposed through `traceRecords`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct StreamStats {
    pub emitted: u64,
    pub delivered: u64,
    pub coalesced: u64,
    pub dropped_trace_steps: u64,
    pub dropped_other: u64,
}

pub struct EventStream {
    next_seq: u64,
    pending: VecDeque<Event>,
    /// Delivered lossless events awaiting acknowledgement.
    unacked: VecDeque<Event>,
    capacity: usize,
    ack_window: usize,
    rate_limit: u64,
    rate_counts: HashMap<EventCategory, u64>,
    pub stats: StreamStats,
}

impl EventStream {
    pub fn new(capacity: usize, ack_window: usize, rate_limit: u64) -> Self {
        EventStream {
            next_seq: 0,
            pending: VecDeque::new(),
            unacked: VecDeque::new(),
            capacity,
            ack_window,
            rate_limit,
            rate_counts: HashMap::new(),
            stats: StreamStats::default(),
        }
    }

    /// Emits one event, applying the back-pressure policy.
    pub fn emit(
        &mut self,
        category: EventCategory,
        pid: Pid,
        payload: serde_json::Value,
        time_us: u64,
    ) {
        self.stats.emitted += 1;
        let congested = self.pending.len() >= self.capacity
            || self.unacked.len() >= self.ack_window
            || *self.rate_counts.get(&category).unwrap_or(&0) >= self.rate_limit;

        if congested && !category.is_lossless() {
            match category {
                EventCategory::ValueChanged => {
                    // Latest value wins, per OID.
                    let oid = payload.get("oid").cloned();
                    if let Some(e) = self.pending.iter_mut().rev().find(|e| {
                        e.category == EventCategory::ValueChanged
                            && e.payload.get("oid") == oid.as_ref()
                    }) {
                        e.payload = payload;
                        e.time_us = time_us;
                        self.stats.coalesced += 1;
                        return;
                    }
                    if self.pending.len() >= self.capacity {
                        self.stats.dropped_other += 1;
                        return;
                    }
                }
                EventCategory::TraceStep => {
                    self.stats.dropped_trace_steps += 1;
                    return;
                }
                _ => {
                    self.stats.dropped_other += 1;
                    return;
                }
            }
        }

        *self.rate_counts.entry(category).or_insert(0) += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push_back(Event { seq, category, pid, payload, time_us });
    }

    /// Delivers up to `max` pending events in order.
    ///
    /// Lossless events are copied to the unacked list; delivery stops
    /// early (preserving order) if that list reaches the ACK window.
    pub fn take_batch(&mut self, max: usize) -> Vec<Event> {
        self.rate_counts.clear();
        let mut out = Vec::new();
        while out.len() < max {
            let Some(e) = self.pending.front() else { break };
            if e.category.is_lossless() && self.unacked.len() >= self.ack_window {
                break;
            }
            let e = self.pending.pop_front().unwrap();
            if e.category.is_lossless() {
                self.unacked.push_back(e.clone());
            }
            self.stats.delivered += 1;
            out.push(e);
        }
        out
    }

    /// Acknowledges all delivered events with `seq <= upto`.
    pub fn ack(&mut self, upto: u64) {
        self.unacked.retain(|e| e.seq > upto);
    }

    /// Unacknowledged lossless events, for replay after a reconnect.
    pub fn replay(&self) -> Vec<Event> {
        self.unacked.iter().cloned().collect()
    }

    /// Number of events queued for delivery.
    pub fn backlog(&self) -> usize {
        self.pending.len()
    }

    /// Resets the stream for a brand-new session (reconnect outside the
    /// grace window).
    pub fn reset(&mut self) {
        self.next_seq = 0;
        self.pending.clear();
        self.unacked.clear();
        self.rate_counts.clear();
        self.stats = StreamStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stream() -> EventStream {
        EventStream::new(8, 4, 100)
    }

    #[test]
    fn sequence_numbers_strictly_increase() {
        let mut s = stream();
        for i in 0..5 {
            s.emit(EventCategory::Telemetry, Pid(1), json!({ "i": i }), i);
        }
        let batch = s.take_batch(16);
        assert!(batch.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[test]
    fn trace_steps_drop_under_congestion_with_counter() {
        let mut s = EventStream::new(2, 4, 100);
        s.emit(EventCategory::Telemetry, Pid(1), json!({}), 0);
        s.emit(EventCategory::Telemetry, Pid(1), json!({}), 0);
        s.emit(EventCategory::TraceStep, Pid(1), json!({}), 0);
        s.emit(EventCategory::TraceStep, Pid(1), json!({}), 0);
        assert_eq!(s.stats.dropped_trace_steps, 2);
        assert_eq!(s.backlog(), 2);
    }

    #[test]
    fn value_changed_coalesces_latest_wins() {
        let mut s = EventStream::new(2, 4, 100);
        s.emit(EventCategory::ValueChanged, Pid(1), json!({"oid": 7, "new": 1.0}), 0);
        s.emit(EventCategory::Telemetry, Pid(1), json!({}), 0);
        // Ring is now full; same-OID updates must fold into the queued
        // event.
        s.emit(EventCategory::ValueChanged, Pid(1), json!({"oid": 7, "new": 2.0}), 1);
        s.emit(EventCategory::ValueChanged, Pid(1), json!({"oid": 7, "new": 3.0}), 2);
        assert_eq!(s.stats.coalesced, 2);
        let batch = s.take_batch(16);
        let vc: Vec<_> = batch
            .iter()
            .filter(|e| e.category == EventCategory::ValueChanged)
            .collect();
        assert_eq!(vc.len(), 1);
        assert_eq!(vc[0].payload["new"], 3.0);
    }

    #[test]
    fn lossless_events_survive_congestion() {
        let mut s = EventStream::new(1, 2, 100);
        for i in 0..5 {
            s.emit(EventCategory::Fault, Pid(1), json!({"i": i}), 0);
        }
        // All five are queued despite capacity 1.
        let mut got = Vec::new();
        loop {
            let batch = s.take_batch(16);
            if batch.is_empty() {
                break;
            }
            let last = batch.last().unwrap().seq;
            got.extend(batch);
            s.ack(last);
        }
        assert_eq!(got.len(), 5, "no fault event may be dropped");
    }

    #[test]
    fn unacked_lossless_events_block_further_delivery() {
        let mut s = EventStream::new(8, 2, 100);
        for _ in 0..4 {
            s.emit(EventCategory::Stopped, Pid(1), json!({}), 0);
        }
        let first = s.take_batch(16);
        assert_eq!(first.len(), 2, "delivery must stop at the ACK window");
        assert_eq!(s.take_batch(16).len(), 0);
        s.ack(first.last().unwrap().seq);
        assert_eq!(s.take_batch(16).len(), 2);
    }

    #[test]
    fn replay_returns_unacked_in_order() {
        let mut s = stream();
        s.emit(EventCategory::Stopped, Pid(1), json!({"a": 1}), 0);
        s.emit(EventCategory::Fault, Pid(1), json!({"b": 2}), 1);
        let batch = s.take_batch(16);
        assert_eq!(batch.len(), 2);
        let replayed = s.replay();
        assert_eq!(replayed, batch);
        s.ack(batch[0].seq);
        assert_eq!(s.replay().len(), 1);
    }
}
