// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end scenarios driving real guest programs through the
//! executive: breakpoints, mailbox wakeups, fan-out overflow, value
//! subscriptions, secure commands, and corrupt images.

use hsx_abi::{AuthLevel, EventCategory, ModeMask, Oid, TaskState, ValueFlags};
use hsx_hxe::{DeclaredMailbox, DeclaredValue, Image, ImageError};
use hsx_isa::{Instr, Op};
use hsx_kern::{Drivers, Event, ExecConfig, Executive};
use hsx_vm::RegSel;

fn encode(instrs: &[Instr]) -> Vec<u8> {
    let mut out = Vec::with_capacity(instrs.len() * 4);
    for i in instrs {
        out.extend_from_slice(&hsx_isa::encode(i).to_le_bytes());
    }
    out
}

fn image(name: &str, entry_pc: u32, code: Vec<u8>, data: Vec<u8>, bss: u32) -> Image {
    Image {
        entry_pc,
        app_name: name.to_string(),
        code,
        data,
        bss_size: bss,
        ..Image::default()
    }
}

fn exec() -> Executive {
    Executive::new(ExecConfig::default(), Drivers::default())
}

/// Drains every deliverable event, acknowledging as it goes.
fn drain(exec: &mut Executive) -> Vec<Event> {
    let mut out = Vec::new();
    loop {
        let batch = exec.events_take(64);
        if batch.is_empty() {
            return out;
        }
        exec.events_ack(batch.last().unwrap().seq);
        out.extend(batch);
    }
}

fn count(events: &[Event], category: EventCategory) -> usize {
    events.iter().filter(|e| e.category == category).count()
}

// Shorthand constructors to keep the program listings readable.
fn ldi(rd: u8, imm: i32) -> Instr {
    Instr::imm(Op::Ldi, rd, 0, imm)
}
fn mov(rd: u8, rs: u8) -> Instr {
    Instr::reg(Op::Mov, rd, rs, 0)
}
fn svc(module: u8, function: u8) -> Instr {
    Instr::imm(Op::Svc, 0, 0, ((module as i32) << 8) | function as i32)
}
fn brk() -> Instr {
    Instr::reg(Op::Brk, 0, 0, 0)
}

/// Scenario 1: a breakpoint at the current PC stops the step before any
/// instruction executes; clearing it lets the step through.
#[test]
fn single_step_with_breakpoint() {
    // 64 NOP words of padding, then ADD R1,R2,R3 ; BRK at 0x0100.
    let mut code = vec![0u8; 0x100];
    code.extend_from_slice(&encode(&[
        Instr::reg(Op::Add, 1, 2, 3),
        brk(),
    ]));
    let mut exec = exec();
    let pid = exec
        .load_image(&image("bp-test", 0x100, code, vec![], 0).to_bytes())
        .expect("image loads");
    exec.start(pid).unwrap();
    exec.attach("test", AuthLevel::Admin).unwrap();

    exec.debug_reg_set(pid, RegSel::R(1), 99).unwrap();
    exec.debug_reg_set(pid, RegSel::R(2), 5).unwrap();
    exec.debug_reg_set(pid, RegSel::R(3), 7).unwrap();
    exec.bp_set(pid, 0x100, false).unwrap();

    let pc = exec.step_task(pid, 1).unwrap();
    assert_eq!(pc, 0x100, "breakpoint must stop before execution");
    assert_eq!(exec.debug_reg_get(pid, RegSel::Pc).unwrap(), 0x100);
    assert_eq!(
        exec.debug_reg_get(pid, RegSel::R(1)).unwrap(),
        99,
        "no instruction may have executed",
    );
    let events = drain(&mut exec);
    let breaks: Vec<_> = events
        .iter()
        .filter(|e| e.category == EventCategory::Break)
        .collect();
    assert_eq!(breaks.len(), 1);
    assert_eq!(breaks[0].payload["pc"], 0x100);

    exec.bp_clear(pid, 0x100).unwrap();
    let pc = exec.step_task(pid, 1).unwrap();
    assert_eq!(pc, 0x104);
    assert_eq!(exec.debug_reg_get(pid, RegSel::R(1)).unwrap(), 12);
    let psw = exec.debug_reg_get(pid, RegSel::Psw).unwrap();
    assert_eq!(psw & 0b1, 0, "Z must be clear after 5 + 7");
}

/// Scenario 2: a consumer parked in recv wakes with exactly the sent
/// bytes; the mailbox drains to zero and the stats balance.
#[test]
fn mailbox_first_reader_wakeup() {
    let name = b"shared:test";

    // Consumer: open, recv (infinite timeout), stop.
    let consumer_prog = encode(&[
        ldi(0, 0),
        ldi(1, name.len() as i32),
        ldi(2, ModeMask::RDONLY.bits() as i32),
        svc(0x05, 0x00), // open -> r1
        mov(4, 1),
        mov(0, 4),
        ldi(1, 32), // out buffer
        ldi(2, 32),
        ldi(3, -1), // infinite
        svc(0x05, 0x03), // recv: parks
        brk(),
    ]);
    let consumer_img = image(
        "consumer",
        0,
        consumer_prog,
        name.to_vec(),
        64,
    );

    // Producer: open, send 16 bytes, stop. Data: name then payload at 16.
    let mut data = name.to_vec();
    data.resize(16, 0);
    data.extend_from_slice(&[0xA5; 16]);
    let producer_prog = encode(&[
        ldi(0, 0),
        ldi(1, name.len() as i32),
        ldi(2, ModeMask::WRONLY.bits() as i32),
        svc(0x05, 0x00),
        mov(4, 1),
        mov(0, 4),
        ldi(1, 16),
        ldi(2, 16),
        ldi(3, 0), // poll
        svc(0x05, 0x02), // send
        brk(),
    ]);
    let mut producer_img = image("producer", 0, producer_prog, data, 0);
    producer_img.mailboxes.push(DeclaredMailbox {
        name: "shared:test".into(),
        capacity: 64,
        mode_mask: ModeMask::RDWR,
    });

    let mut exec = exec();
    let producer = exec.load_image(&producer_img.to_bytes()).unwrap();
    let consumer = exec.load_image(&consumer_img.to_bytes()).unwrap();
    // Consumer first, so it parks before the producer sends.
    exec.start(consumer).unwrap();
    exec.start(producer).unwrap();
    exec.run(100);

    assert_eq!(exec.task_state(consumer), Some(TaskState::Stopped));
    assert_eq!(exec.task_state(producer), Some(TaskState::Stopped));

    let received = exec.read_memory(consumer, 32, 16).unwrap();
    assert_eq!(received, vec![0xA5; 16], "consumer must see the exact bytes");
    exec.attach("t", AuthLevel::Admin).unwrap();
    assert_eq!(
        exec.debug_reg_get(consumer, RegSel::R(1)).unwrap(),
        16,
        "recv must report 16 bytes",
    );

    let (handle, _, _) = exec
        .mailbox_list()
        .into_iter()
        .find(|(_, n, _)| n == "shared:test")
        .expect("declared mailbox exists");
    let stats = exec.mailbox_stats(handle).unwrap();
    assert_eq!((stats.sends, stats.receives, stats.drops), (1, 1, 0));
    assert_eq!(exec.mailbox_inspect(handle).unwrap().depth_bytes, 0);
}

/// Scenario 3: fan-out with a slow reader drops for that reader only,
/// keeps order for the fast one, and coalesces the drop burst into a
/// single overflow event.
#[test]
fn fanout_overflow_policy() {
    let name = b"shared:bus";

    // Producer: one frame per tick (sleeps between sends); first byte
    // of each 16-byte frame is the sequence number.
    let producer_prog = encode(&[
        ldi(0, 0),
        ldi(1, name.len() as i32),
        ldi(2, ModeMask::WRONLY.bits() as i32),
        svc(0x05, 0x00),
        mov(4, 1),
        ldi(5, 0),  // i
        ldi(7, 16), // frame buffer
        // loop (index 7):
        Instr::imm(Op::Stb, 5, 7, 0),
        mov(0, 4),
        mov(1, 7),
        ldi(2, 16),
        ldi(3, 0),
        svc(0x05, 0x02), // send
        ldi(0, 1),
        svc(0x06, 0x02), // sleep 1us: yield to the readers
        Instr::imm(Op::Addi, 5, 5, 1),
        Instr::imm(Op::Cmpi, 0, 5, 100),
        Instr::imm(Op::Bne, 0, 0, 7 - 18), // back to loop
        brk(),
    ]);
    let mut data = name.to_vec();
    data.resize(32, 0);
    let mut producer_img = image("producer", 0, producer_prog, data, 0);
    producer_img.mailboxes.push(DeclaredMailbox {
        name: "shared:bus".into(),
        capacity: 32,
        mode_mask: ModeMask::RDWR | ModeMask::FANOUT_DROP,
    });

    // Reader A: polls until it has consumed 100 frames, faulting
    // deliberately if order is ever violated.
    let reader_a_prog = encode(&[
        ldi(0, 0),
        ldi(1, name.len() as i32),
        ldi(2, ModeMask::RDONLY.bits() as i32),
        svc(0x05, 0x00),
        mov(4, 1),
        ldi(6, 0),  // count
        ldi(8, -1), // last sequence seen
        // loop (7):
        mov(0, 4),
        ldi(1, 16),
        ldi(2, 16),
        ldi(3, 0),
        svc(0x05, 0x03), // recv poll
        Instr::imm(Op::Cmpi, 0, 0, 0),
        Instr::imm(Op::Bne, 0, 0, 20 - 14), // EAGAIN -> cont
        ldi(9, 16),
        Instr::imm(Op::Ldb, 7, 9, 0),
        Instr { op: Op::Cmp, rd: 0, rs: 8, rt: 7, imm: 0 },
        Instr::imm(Op::Bge, 0, 0, 23 - 18), // last >= new -> fail
        mov(8, 7),
        Instr::imm(Op::Addi, 6, 6, 1),
        // cont (20):
        Instr::imm(Op::Cmpi, 0, 6, 100),
        Instr::imm(Op::Bne, 0, 0, 7 - 22), // keep polling
        brk(),
        // fail (23): divide by zero to fault the task visibly.
        ldi(9, 0),
        Instr::reg(Op::Div, 9, 9, 9),
    ]);
    let reader_a_img = image("reader-a", 0, reader_a_prog, name.to_vec(), 64);

    // Reader B: binds and never reads.
    let reader_b_prog = encode(&[
        ldi(0, 0),
        ldi(1, name.len() as i32),
        ldi(2, ModeMask::RDONLY.bits() as i32),
        svc(0x05, 0x00),
        brk(),
    ]);
    let reader_b_img = image("reader-b", 0, reader_b_prog, name.to_vec(), 0);

    let mut exec = exec();
    let producer = exec.load_image(&producer_img.to_bytes()).unwrap();
    let a = exec.load_image(&reader_a_img.to_bytes()).unwrap();
    let b = exec.load_image(&reader_b_img.to_bytes()).unwrap();
    exec.start(a).unwrap();
    exec.start(b).unwrap();
    exec.start(producer).unwrap();

    let mut events = Vec::new();
    for _ in 0..200 {
        exec.run(100);
        events.extend(drain(&mut exec));
        if exec.task_state(a) == Some(TaskState::Stopped)
            && exec.task_state(producer) == Some(TaskState::Stopped)
        {
            break;
        }
    }

    assert_eq!(
        exec.task_state(a),
        Some(TaskState::Stopped),
        "reader A must finish cleanly (a fault means frames arrived out of order)",
    );
    exec.attach("t", AuthLevel::Admin).unwrap();
    assert_eq!(
        exec.debug_reg_get(a, RegSel::R(6)).unwrap(),
        100,
        "fast reader must receive all 100 frames",
    );

    let (handle, _, _) = exec
        .mailbox_list()
        .into_iter()
        .find(|(_, n, _)| n == "shared:bus")
        .unwrap();
    let stats = exec.mailbox_stats(handle).unwrap();
    assert_eq!(stats.sends, 100);
    assert_eq!(stats.receives, 100);
    assert!(stats.drops >= 90, "slow reader must drop nearly everything");

    // Conservation: deliveries = receives + drops + pending messages.
    // B's pending backlog is its queued frames (16B payload + 2B frame).
    let info = exec.mailbox_inspect(handle).unwrap();
    let pending_msgs = (info.depth_bytes / 18) as u64;
    assert_eq!(stats.deliveries, stats.receives + stats.drops + pending_msgs);
    assert!(pending_msgs >= 1, "B saturates at its ring capacity");

    events.extend(drain(&mut exec));
    assert_eq!(
        count(&events, EventCategory::MailboxOverflow),
        1,
        "the whole drop burst must coalesce into one overflow event",
    );
}

/// Scenario 4: registration events, RO enforcement with no spurious
/// change event, and subscriber delivery of the new value.
#[test]
fn value_registration_and_subscription() {
    let mbox = b"app:vals";

    // Owner: create mailbox, subscribe it to 0xF003, set own value to
    // 2.5, receive the notification envelope.
    let owner_prog = encode(&[
        ldi(0, 0),
        ldi(1, mbox.len() as i32),
        ldi(2, 64), // capacity
        ldi(3, ModeMask::RDWR.bits() as i32),
        svc(0x05, 0x01), // create -> r1
        mov(4, 1),
        // oid 0xF003 = (0xF0 << 8) | 3
        ldi(5, 0xF0),
        Instr::imm(Op::Lsli, 5, 5, 8),
        Instr::imm(Op::Addi, 5, 5, 3),
        mov(0, 5),
        mov(1, 4),
        svc(0x07, 0x03), // subscribe
        mov(0, 5),
        ldi(1, 0x4100), // 2.5 in binary16
        svc(0x07, 0x02), // set (owner write on an RO value)
        mov(0, 4),
        ldi(1, 32),
        ldi(2, 8),
        ldi(3, -1),
        svc(0x05, 0x03), // recv the envelope
        brk(),
    ]);
    let mut owner_img = image("owner", 0, owner_prog, mbox.to_vec(), 64);
    owner_img.values.push(DeclaredValue {
        oid: Oid(0xF003),
        flags: ValueFlags::empty(), // RO
        auth: AuthLevel::User,
        value_bits: 0,
        name: "scenario.value".into(),
        unit: String::new(),
        range: None,
    });

    // Intruder: attempts a foreign write, must see EPERM in r0.
    let intruder_prog = encode(&[
        ldi(5, 0xF0),
        Instr::imm(Op::Lsli, 5, 5, 8),
        Instr::imm(Op::Addi, 5, 5, 3),
        mov(0, 5),
        ldi(1, 0x4248), // ~3.14
        svc(0x07, 0x02),
        mov(10, 0), // save the status
        brk(),
    ]);
    let intruder_img = image("intruder", 0, intruder_prog, vec![], 0);

    let mut exec = exec();
    let owner = exec.load_image(&owner_img.to_bytes()).unwrap();
    let intruder = exec.load_image(&intruder_img.to_bytes()).unwrap();
    exec.start(owner).unwrap();
    exec.start(intruder).unwrap();
    exec.run(100);

    assert_eq!(exec.task_state(owner), Some(TaskState::Stopped));
    exec.attach("t", AuthLevel::Admin).unwrap();
    assert_eq!(
        exec.debug_reg_get(intruder, RegSel::R(10)).unwrap(),
        hsx_abi::Code::Perm as u32,
        "foreign write to an RO value must fail EPERM",
    );

    // Subscriber got {oid, 2.5} as a little-endian envelope.
    let envelope = exec.read_memory(owner, 32, 4).unwrap();
    assert_eq!(envelope, vec![0x03, 0xF0, 0x00, 0x41]);

    let events = drain(&mut exec);
    assert!(
        events
            .iter()
            .any(|e| e.category == EventCategory::ValueRegistered
                && e.payload["oid"] == 0xF003),
        "registration must emit value_registered",
    );
    let changes: Vec<_> = events
        .iter()
        .filter(|e| e.category == EventCategory::ValueChanged)
        .collect();
    assert_eq!(changes.len(), 1, "only the owner's successful set may emit");
    assert_eq!(changes[0].payload["new"], 2.5);
    assert!(
        events.iter().any(|e| e.category == EventCategory::SvcError),
        "the EPERM denial must be audit-logged",
    );
}

/// Scenario 5: a secure command refuses a missing token and executes
/// with the right one; the handler exits the task and the completion
/// event still fires.
#[test]
fn secure_command_call() {
    // Register sys.reset (0xF010, SECURE, admin, PIN 1234) with a
    // handler that exits the task, then stop.
    let owner_prog = encode(&[
        ldi(5, 0xF0),
        Instr::imm(Op::Lsli, 5, 5, 8),
        Instr::imm(Op::Addi, 5, 5, 0x10),
        mov(0, 5),
        ldi(1, 9 * 4), // handler address below
        ldi(2, 0x101), // SECURE | admin << 8
        ldi(3, 1234),
        svc(0x08, 0x00), // cmd.register
        brk(),
        // handler (index 9):
        ldi(0, 0),
        svc(0x01, 0x00), // TASK_EXIT
    ]);
    let owner_img = image("sys-owner", 0, owner_prog, vec![], 0);

    let mut exec = exec();
    let owner = exec.load_image(&owner_img.to_bytes()).unwrap();
    exec.start(owner).unwrap();
    exec.run(100);
    assert_eq!(exec.task_state(owner), Some(TaskState::Stopped));

    // Without the token: EPERM, and the denial is an event.
    let (code, _) = exec.host_command_call(Oid(0xF010), None, AuthLevel::Admin);
    assert_eq!(code, hsx_abi::Code::Perm);
    let events = drain(&mut exec);
    assert!(events.iter().any(|e| {
        e.category == EventCategory::CmdInvoked && e.payload["status"] == "EPERM"
    }));

    // With the token: the handler runs, the task exits, and the
    // completion event fires.
    let (code, _) = exec.host_command_call(Oid(0xF010), Some(1234), AuthLevel::Admin);
    assert_eq!(code, hsx_abi::Code::Ok);
    assert!(exec.task_state(owner).is_none(), "TASK_EXIT must tear the task down");
    let events = drain(&mut exec);
    assert!(events.iter().any(|e| {
        e.category == EventCategory::CmdCompleted && e.payload["status"] == "OK"
    }));
}

/// Scenario 6: one flipped byte fails the CRC; nothing is created and
/// nothing is emitted.
#[test]
fn image_corruption_is_fatal_to_load() {
    let img = image(
        "corrupt",
        0,
        encode(&[Instr::reg(Op::Nop, 0, 0, 0), brk()]),
        vec![1, 2, 3, 4],
        0,
    );
    let mut bytes = img.to_bytes();
    bytes[0x44] ^= 0x40; // inside the code segment

    let mut exec = exec();
    match exec.load_image(&bytes) {
        Err(hsx_kern::ExecError::Load(ImageError::CrcMismatch { .. })) => {}
        other => panic!("expected CrcMismatch, got {other:?}"),
    }
    assert!(exec.ps().is_empty(), "no task may be created");
    assert!(drain(&mut exec).is_empty(), "no events may be emitted");
}

/// Console SVC routes through the composed driver.
#[test]
fn console_write_reaches_the_driver() {
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct SharedConsole(Arc<Mutex<Vec<u8>>>);
    impl hsx_hal::ConsoleDriver for SharedConsole {
        fn write(&mut self, bytes: &[u8]) -> Result<usize, hsx_abi::Code> {
            self.0.lock().unwrap().extend_from_slice(bytes);
            Ok(bytes.len())
        }
    }

    let sink = Arc::new(Mutex::new(Vec::new()));
    let drivers = Drivers {
        console: Box::new(SharedConsole(Arc::clone(&sink))),
        ..Drivers::default()
    };

    let prog = encode(&[
        ldi(0, 0), // data ptr
        ldi(1, 5),
        svc(0x01, 0x01), // console write
        brk(),
    ]);
    let img = image("hello", 0, prog, b"hello".to_vec(), 0);

    let mut exec = Executive::new(ExecConfig::default(), drivers);
    let pid = exec.load_image(&img.to_bytes()).unwrap();
    exec.start(pid).unwrap();
    exec.run(50);
    assert_eq!(sink.lock().unwrap().as_slice(), b"hello");
}

/// A finite recv timeout on a silent mailbox expires with ETIMEDOUT.
#[test]
fn recv_timeout_expires() {
    let name = b"shared:quiet";
    let prog = encode(&[
        ldi(0, 0),
        ldi(1, name.len() as i32),
        ldi(2, ModeMask::RDONLY.bits() as i32),
        svc(0x05, 0x00),
        mov(4, 1),
        mov(0, 4),
        ldi(1, 32),
        ldi(2, 16),
        ldi(3, 500), // 500 us
        svc(0x05, 0x03),
        mov(10, 0), // save the status
        brk(),
    ]);
    let mut img = image("waiter", 0, prog, name.to_vec(), 64);
    img.mailboxes.push(DeclaredMailbox {
        name: "shared:quiet".into(),
        capacity: 32,
        mode_mask: ModeMask::RDWR,
    });

    let mut exec = exec();
    let pid = exec.load_image(&img.to_bytes()).unwrap();
    exec.start(pid).unwrap();
    // 500 us at 100 us per tick: well inside this budget.
    exec.run(50);
    assert_eq!(exec.task_state(pid), Some(TaskState::Stopped));
    exec.attach("t", AuthLevel::Admin).unwrap();
    assert_eq!(
        exec.debug_reg_get(pid, RegSel::R(10)).unwrap(),
        hsx_abi::Code::TimedOut as u32,
    );
}

/// Persistable values survive a reboot: the log written by one
/// executive seeds the registry of the next.
#[test]
fn persisted_values_replay_at_boot() {
    use hsx_hal::FramDriver;
    use std::sync::{Arc, Mutex};

    /// FRAM whose backing bytes outlive the executive, standing in for
    /// the physical part across "reboots".
    #[derive(Clone)]
    struct SharedFram(Arc<Mutex<Vec<u8>>>);
    impl FramDriver for SharedFram {
        fn len(&self) -> usize {
            self.0.lock().unwrap().len()
        }
        fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), hsx_abi::Code> {
            let bytes = self.0.lock().unwrap();
            buf.copy_from_slice(&bytes[offset..offset + buf.len()]);
            Ok(())
        }
        fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), hsx_abi::Code> {
            let mut bytes = self.0.lock().unwrap();
            bytes[offset..offset + data.len()].copy_from_slice(data);
            Ok(())
        }
    }

    let fram = SharedFram(Arc::new(Mutex::new(vec![0xFF; 256])));
    let mut img = image("persister", 0, encode(&[brk()]), vec![], 0);
    img.values.push(DeclaredValue {
        oid: Oid(0x0101),
        flags: ValueFlags::RW | ValueFlags::PERSIST,
        auth: AuthLevel::User,
        value_bits: 0,
        name: "counter".into(),
        unit: String::new(),
        range: None,
    });
    let bytes = img.to_bytes();

    let mut exec1 = exec();
    exec1.mount_persistence(Box::new(fram.clone())).unwrap();
    exec1.load_image(&bytes).unwrap();
    exec1
        .value_set(Oid(0x0101), 0x4100, AuthLevel::Admin)
        .expect("RW persistable value accepts the write");
    drop(exec1);

    // "Reboot": a fresh executive over the same FRAM sees 2.5.
    let mut exec2 = exec();
    exec2.mount_persistence(Box::new(fram)).unwrap();
    exec2.load_image(&bytes).unwrap();
    assert_eq!(exec2.value_get(Oid(0x0101)).unwrap(), 0x4100);
}

/// A lapsed keepalive releases the session lock; a fresh keepalive
/// refuses a second client.
#[test]
fn session_lock_honors_the_keepalive_grace() {
    let config = ExecConfig { keepalive_grace_ms: 1, ..ExecConfig::default() };
    let mut exec = Executive::new(config, Drivers::default());
    exec.attach("alice", AuthLevel::Admin).unwrap();

    match exec.attach("bob", AuthLevel::Admin) {
        Err(hsx_kern::ExecError::SessionBusy) => {}
        other => panic!("expected SessionBusy, got {other:?}"),
    }

    // 1 ms grace at 100 us per tick: lapse after ~10 idle ticks.
    for _ in 0..20 {
        exec.tick();
    }
    let info = exec.attach("bob", AuthLevel::Admin).expect("lock must be free");
    assert!(!info.resumed, "bob gets a fresh session, not alice's");
}

/// Duplicate single-instance images are refused.
#[test]
fn single_instance_flag_is_enforced() {
    let img = image("singleton", 0, encode(&[brk()]), vec![], 0);
    let bytes = img.to_bytes();
    let mut exec = exec();
    exec.load_image(&bytes).unwrap();
    match exec.load_image(&bytes) {
        Err(hsx_kern::ExecError::InstanceExists(name)) => {
            assert_eq!(name, "singleton");
        }
        other => panic!("expected InstanceExists, got {other:?}"),
    }
}
