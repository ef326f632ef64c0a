// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The mailbox conservation invariant, checked under random operation
//! interleavings: every delivered message is eventually received,
//! dropped, or still pending -- nothing is ever lost or double-counted.

use hsx_abi::{ModeMask, Pid};
use hsx_mailbox::{MailboxConfig, MailboxError, MailboxTable};
use proptest::prelude::*;

const PRODUCER: Pid = Pid(2);
const READER_A: Pid = Pid(3);
const READER_B: Pid = Pid(4);

#[derive(Clone, Debug)]
enum OpKind {
    Send(Vec<u8>),
    RecvA,
    RecvB,
    Peek,
}

fn op_strategy() -> impl Strategy<Value = OpKind> {
    prop_oneof![
        prop::collection::vec(any::<u8>(), 0..24).prop_map(OpKind::Send),
        Just(OpKind::RecvA),
        Just(OpKind::RecvB),
        Just(OpKind::Peek),
    ]
}

proptest! {
    /// First-reader mailbox: deliveries == receives + pending, with no
    /// drops possible, for any interleaving.
    #[test]
    fn first_reader_conserves_messages(ops in prop::collection::vec(op_strategy(), 0..200)) {
        let mut t = MailboxTable::new(MailboxConfig::default());
        let h = t.create(PRODUCER, "shared:prop", 64, ModeMask::RDWR).unwrap();
        t.open(READER_A, "shared:prop", ModeMask::RDONLY).unwrap();

        for op in &ops {
            match op {
                OpKind::Send(payload) => {
                    let _ = t.send(PRODUCER, h, payload);
                }
                OpKind::RecvA | OpKind::RecvB => {
                    let _ = t.recv(READER_A, h);
                }
                OpKind::Peek => {
                    let _ = t.peek(READER_A, h);
                }
            }
            let s = t.stats(h).unwrap();
            let pending = t.pending_msgs(h).unwrap() as u64;
            prop_assert_eq!(s.deliveries, s.receives + s.drops + pending);
            prop_assert_eq!(s.drops, 0, "first-reader mode cannot drop");
            prop_assert_eq!(s.deliveries, s.sends);
        }
    }

    /// Fan-out with FANOUT_DROP: the invariant holds per delivery even
    /// while a slow reader is losing messages.
    #[test]
    fn fanout_drop_conserves_messages(ops in prop::collection::vec(op_strategy(), 0..200)) {
        let mut t = MailboxTable::new(MailboxConfig::default());
        let mode = ModeMask::RDWR | ModeMask::FANOUT_DROP;
        let h = t.create(Pid::SYSTEM, "shared:prop", 48, mode).unwrap();
        t.open(READER_A, "shared:prop", ModeMask::RDONLY).unwrap();
        t.open(READER_B, "shared:prop", ModeMask::RDONLY).unwrap();

        for op in &ops {
            match op {
                OpKind::Send(payload) => {
                    let _ = t.send(Pid::SYSTEM, h, payload);
                }
                OpKind::RecvA => {
                    let _ = t.recv(READER_A, h);
                }
                OpKind::RecvB => {
                    let _ = t.recv(READER_B, h);
                }
                OpKind::Peek => {
                    let _ = t.peek(READER_A, h);
                }
            }
            let s = t.stats(h).unwrap();
            let pending = t.pending_msgs(h).unwrap() as u64;
            prop_assert_eq!(s.deliveries, s.receives + s.drops + pending);
        }
    }

    /// Receive order equals send order for whatever subset a reader
    /// manages to receive.
    #[test]
    fn delivery_preserves_order(sizes in prop::collection::vec(1u8..16, 1..32)) {
        let mut t = MailboxTable::new(MailboxConfig::default());
        let h = t.create(PRODUCER, "app:ordered", 4096, ModeMask::RDWR).unwrap();
        t.open(READER_A, "app:ordered", ModeMask::RDONLY).unwrap();

        let mut sent = Vec::new();
        for (i, n) in sizes.iter().enumerate() {
            let payload = vec![i as u8; *n as usize];
            if t.send(PRODUCER, h, &payload).is_ok() {
                sent.push(payload);
            }
        }
        let mut got = Vec::new();
        loop {
            match t.recv(READER_A, h) {
                Ok((msg, _)) => got.push(msg),
                Err(MailboxError::WouldBlock) => break,
                Err(e) => prop_assert!(false, "unexpected error {:?}", e),
            }
        }
        prop_assert_eq!(got, sent);
    }
}
