// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HSX ABI definitions, shared between the executive, the MiniVM, and the
//! offline toolchain.
//!
//! Everything in this crate is vocabulary: identifiers, flag words, fault
//! kinds, packed registry records, and the on-disk HXE header layout. No
//! behavior lives here, which keeps the crate usable from the smallest
//! possible dependency footprint on both sides of the image boundary.

#![cfg_attr(not(test), no_std)]

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Names a live task.
///
/// Pids are 16-bit and unique over the lifetime of one executive: they are
/// allocated monotonically starting at 1 and never reused, so a stale pid
/// reliably fails to resolve rather than aliasing a newer task. Pid 0 is
/// reserved to mean "the system" and owns the `svc:` and `shared:` mailbox
/// namespaces.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Pid(pub u16);

impl Pid {
    /// The reserved system pid. Owns `svc:` and `shared:` resources and is
    /// never scheduled.
    pub const SYSTEM: Self = Self(0);

    /// First pid handed out to a loaded image.
    pub const FIRST_USER: Self = Self(1);

    pub fn is_system(&self) -> bool {
        self.0 == 0
    }
}

/// Names a particular incarnation of a mailbox slot.
///
/// A `Handle` combines a slot index with a generation number. The executive
/// stores mailboxes in an arena of slots; closing a mailbox tombstones its
/// slot and bumps the generation, so a handle held across a close resolves
/// to `BadHandle` instead of aliasing whatever mailbox is created in the
/// slot next. Tasks and subscriptions hold handles, never pointers, which
/// keeps the ownership graph acyclic.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct Handle(pub u32);

impl Handle {
    /// Number of bits used for the slot index; the generation lives in the
    /// remaining top bits.
    pub const INDEX_BITS: u32 = 16;

    /// Derived mask of the index bits portion.
    pub const INDEX_MASK: u32 = (1 << Self::INDEX_BITS) - 1;

    /// Fabricates a `Handle` for a known slot index and generation number.
    pub const fn for_index_and_gen(index: usize, gen: u16) -> Self {
        Handle((index as u32 & Self::INDEX_MASK) | (gen as u32) << Self::INDEX_BITS)
    }

    /// Extracts the slot index part of this handle.
    pub fn index(&self) -> usize {
        (self.0 & Self::INDEX_MASK) as usize
    }

    /// Extracts the generation part of this handle.
    pub fn generation(&self) -> u16 {
        (self.0 >> Self::INDEX_BITS) as u16
    }
}

/// Object identifier for values and commands: `(group_id << 8) | value_id`.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Oid(pub u16);

impl Oid {
    pub const fn new(group: u8, id: u8) -> Self {
        Oid((group as u16) << 8 | id as u16)
    }

    pub fn group(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn id(&self) -> u8 {
        self.0 as u8
    }
}

/// Authorization level required to touch a value or invoke a command.
///
/// Order matters: a caller's level grants access to everything at or below
/// it, so the derive of `Ord` here is load-bearing.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum AuthLevel {
    User = 0,
    Admin = 1,
}

impl TryFrom<u8> for AuthLevel {
    type Error = ();

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::User),
            1 => Ok(Self::Admin),
            _ => Err(()),
        }
    }
}

bitflags::bitflags! {
    /// Flag byte of a value registry entry.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct ValueFlags: u8 {
        /// Entry may be written through the registry by tasks other than
        /// the owner. Absent means read-only to everyone but the owner.
        const RW = 1 << 0;
        /// Entry is replicated to the persistence log on mutation.
        const PERSIST = 1 << 1;
        /// Mutations produce `value_changed` events for subscribers.
        const NOTIFY = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Flag byte of a command registry entry.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct CommandFlags: u8 {
        /// Invocation requires the registered PIN token.
        const SECURE = 1 << 0;
        /// Handler runs on the async executor; results come back by
        /// mailbox post.
        const ASYNC = 1 << 1;
        /// Entry survives owner exit (system commands only).
        const PERSISTENT = 1 << 2;
        /// Handler admits one invocation at a time; concurrent calls see
        /// `Busy`.
        const EXCLUSIVE = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Mailbox mode mask. Composes access bits, a delivery discipline, and
    /// the reserved standard-stream aliases.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct ModeMask: u32 {
        const RDONLY = 1 << 0;
        const WRONLY = 1 << 1;
        const RDWR = Self::RDONLY.bits() | Self::WRONLY.bits();
        /// Broadcast to every bound reader; slow readers lose messages
        /// silently.
        const FANOUT_DROP = 1 << 2;
        /// Broadcast to every bound reader; a full reader ring applies
        /// back-pressure to the sender.
        const FANOUT_BLOCK = 1 << 3;
        /// Observers may attach without consuming.
        const TAP = 1 << 4;
        // Reserved standard-stream aliases.
        const STDIN = 1 << 5;
        const STDOUT = 1 << 6;
        const STDERR = 1 << 7;
    }
}

impl ModeMask {
    /// True if either fan-out discipline is selected.
    pub fn is_fanout(&self) -> bool {
        self.intersects(Self::FANOUT_DROP | Self::FANOUT_BLOCK)
    }
}

bitflags::bitflags! {
    /// Processor status word: zero, carry, negative, overflow.
    ///
    /// C holds carry-out for ADD/ADC and NOT-borrow for SUB/SBC/CMP; V is
    /// signed overflow; shifts deposit the last bit shifted out into C.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct Psw: u8 {
        const Z = 1 << 0;
        const C = 1 << 1;
        const N = 1 << 2;
        const V = 1 << 3;
    }
}

/// A record describing a fault taken by a task.
///
/// Faults are terminal: the executive stops scheduling the task and waits
/// for an operator decision. The kinds here are the complete set the VM can
/// produce; anything else in the system is an error code, not a fault.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum FaultKind {
    /// Decode failed: unknown opcode or malformed operand form.
    IllegalInstruction,
    /// A load, store, or fetch touched memory outside the task's arenas.
    OutOfBounds { address: u32 },
    /// `sp` left `[stack_base, stack_limit)`, or the register window arena
    /// was exhausted by CALL.
    StackOverflow { address: u32 },
    /// DIV with a zero divisor.
    DivideByZero,
    /// Word access at a non-word-aligned address.
    UnalignedAccess { address: u32 },
    /// SVC named a module or function outside the dispatch table.
    BadSvc { module: u8, function: u8 },
}

/// Why a blocked task is blocked.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum WaitReason {
    /// Parked on a mailbox send or receive.
    Mailbox(Handle),
    /// Sleeping until the given kernel time, in microseconds.
    SleepUntil(u64),
}

/// Scheduling state of a task.
///
/// The lifecycle is `New -> Ready -> Running -> {Blocked, Ready, Stopped,
/// Faulted}`. `Stopped` is the debugger-visible parked state; `Faulted` is
/// terminal until an operator intervenes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TaskState {
    /// Loaded but not yet admitted to the ready queue.
    New,
    /// Eligible to run.
    Ready,
    /// Currently being driven by the executive.
    Running,
    /// Waiting for a mailbox operation or a sleep deadline.
    Blocked(WaitReason),
    /// Parked by the debugger (breakpoint, step, or explicit stop).
    Stopped,
    /// Took a fault; no longer scheduled.
    Faulted(FaultKind),
}

impl TaskState {
    pub fn is_ready(&self) -> bool {
        matches!(self, TaskState::Ready)
    }

    pub fn is_live(&self) -> bool {
        !matches!(self, TaskState::Faulted(_))
    }
}

/// Standardised status codes returned in R0 from every SVC.
///
/// `Ok` is zero so guest code can branch on the Z flag after a bare
/// `CMP R0, #0`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum Code {
    Ok = 0,
    /// Operation would block; retry later.
    Again = 1,
    /// A blocking operation's timeout elapsed.
    TimedOut = 2,
    /// Permission or authorization failure.
    Perm = 3,
    /// Named object does not exist.
    NoEnt = 4,
    /// Malformed argument.
    Inval = 5,
    /// Backend I/O failure.
    Io = 6,
    /// Stale or foreign handle.
    BadF = 7,
}

impl TryFrom<u32> for Code {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Ok),
            1 => Ok(Self::Again),
            2 => Ok(Self::TimedOut),
            3 => Ok(Self::Perm),
            4 => Ok(Self::NoEnt),
            5 => Ok(Self::Inval),
            6 => Ok(Self::Io),
            7 => Ok(Self::BadF),
            _ => Err(()),
        }
    }
}

/// Timeout argument conventions shared by every blocking SVC: zero polls,
/// the all-ones sentinel waits forever. Units are declared per call
/// (microseconds for I/O, milliseconds for command dispatch).
pub const TIMEOUT_POLL: u32 = 0;
pub const TIMEOUT_INFINITE: u32 = u32::MAX;

/// SVC module identifiers. The HAL block 0x10..=0x17 is reserved for
/// hardware backends; 0x18 is held back for expansion.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SvcModule {
    Task = 0x01,
    Can = 0x02,
    Fs = 0x04,
    Mailbox = 0x05,
    Exec = 0x06,
    Value = 0x07,
    Command = 0x08,
    HalUart = 0x10,
    HalCan = 0x11,
    HalTimer = 0x12,
    HalFram = 0x13,
    HalFs = 0x14,
    HalGpio = 0x15,
    HalI2c = 0x16,
    HalSpi = 0x17,
}

impl TryFrom<u8> for SvcModule {
    type Error = ();

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        match x {
            0x01 => Ok(Self::Task),
            0x02 => Ok(Self::Can),
            0x04 => Ok(Self::Fs),
            0x05 => Ok(Self::Mailbox),
            0x06 => Ok(Self::Exec),
            0x07 => Ok(Self::Value),
            0x08 => Ok(Self::Command),
            0x10 => Ok(Self::HalUart),
            0x11 => Ok(Self::HalCan),
            0x12 => Ok(Self::HalTimer),
            0x13 => Ok(Self::HalFram),
            0x14 => Ok(Self::HalFs),
            0x15 => Ok(Self::HalGpio),
            0x16 => Ok(Self::HalI2c),
            0x17 => Ok(Self::HalSpi),
            _ => Err(()),
        }
    }
}

/// Function numbers within `SvcModule::Task`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum TaskFn {
    Exit = 0,
    ConsoleWrite = 1,
}

/// Function numbers within `SvcModule::Mailbox`. These correspond 1:1 with
/// the mailbox table operations.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum MailboxFn {
    Open = 0,
    Create = 1,
    Send = 2,
    Recv = 3,
    Peek = 4,
    Tap = 5,
    Close = 6,
}

/// Function numbers within `SvcModule::Exec`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ExecFn {
    Version = 0,
    Ps = 1,
    Sleep = 2,
}

/// Function numbers within `SvcModule::Value`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ValueFn {
    Register = 0,
    Get = 1,
    Set = 2,
    Subscribe = 3,
    Unsubscribe = 4,
}

/// Function numbers within `SvcModule::Command`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum CommandFn {
    Register = 0,
    Call = 1,
    CallAsync = 2,
}

/// Function numbers within `SvcModule::Fs`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum FsFn {
    Open = 0,
    Read = 1,
    Write = 2,
    Close = 3,
    List = 4,
    Delete = 5,
    Rename = 6,
    Mkdir = 7,
}

macro_rules! fn_try_from {
    ($t:ty, $($v:ident = $n:literal),+ $(,)?) => {
        impl TryFrom<u8> for $t {
            type Error = ();
            fn try_from(x: u8) -> Result<Self, Self::Error> {
                match x {
                    $($n => Ok(Self::$v),)+
                    _ => Err(()),
                }
            }
        }
    };
}

fn_try_from!(TaskFn, Exit = 0, ConsoleWrite = 1);
fn_try_from!(
    MailboxFn,
    Open = 0,
    Create = 1,
    Send = 2,
    Recv = 3,
    Peek = 4,
    Tap = 5,
    Close = 6,
);
fn_try_from!(ExecFn, Version = 0, Ps = 1, Sleep = 2);
fn_try_from!(
    ValueFn,
    Register = 0,
    Get = 1,
    Set = 2,
    Subscribe = 3,
    Unsubscribe = 4,
);
fn_try_from!(CommandFn, Register = 0, Call = 1, CallAsync = 2);
fn_try_from!(
    FsFn,
    Open = 0,
    Read = 1,
    Write = 2,
    Close = 3,
    List = 4,
    Delete = 5,
    Rename = 6,
    Mkdir = 7,
);

/// Packed value registry record.
///
/// This is the in-table representation; field order is chosen so the struct
/// has no padding and can round-trip through raw bytes for the control
/// plane and the persistence log.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct ValueEntry {
    /// Object identifier, `(group << 8) | id`.
    pub oid: u16,
    /// Current payload as raw IEEE 754 binary16 bits. Booleans are exactly
    /// 0.0 or 1.0.
    pub value_bits: u16,
    /// Offset of the first descriptor in the shared descriptor pool, or
    /// `NO_DESCRIPTOR`.
    pub descriptor_offset: u16,
    /// Owning task, for cleanup on exit.
    pub pid: u16,
    /// `ValueFlags` bits.
    pub flags: u8,
    /// `AuthLevel` discriminant.
    pub auth: u8,
}

/// Packed command registry record. Same representation rules as
/// `ValueEntry`.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct CommandEntry {
    /// Code offset of the handler, or 0 for host-provided commands.
    pub handler_address: u32,
    /// Object identifier.
    pub oid: u16,
    /// Offset of the first descriptor in the shared descriptor pool, or
    /// `NO_DESCRIPTOR`.
    pub descriptor_offset: u16,
    /// Owning task, for cleanup on exit.
    pub owner_pid: u16,
    /// `CommandFlags` bits.
    pub flags: u8,
    /// `AuthLevel` discriminant.
    pub auth: u8,
}

/// Sentinel descriptor offset meaning "no descriptors".
pub const NO_DESCRIPTOR: u16 = u16::MAX;

/// Kinds of descriptor records chained off a registry entry. Each record
/// in the pool is `{kind, next_offset, payload}` where the payload indexes
/// the deduplicated string table (or carries inline f16 bounds for
/// `Range`).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DescriptorKind {
    Group = 0,
    Name = 1,
    Unit = 2,
    Range = 3,
    Persist = 4,
}

impl TryFrom<u8> for DescriptorKind {
    type Error = ();

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Group),
            1 => Ok(Self::Name),
            2 => Ok(Self::Unit),
            3 => Ok(Self::Range),
            4 => Ok(Self::Persist),
            _ => Err(()),
        }
    }
}

/// Magic bytes at offset 0 of every HXE image: `"HXE\0"`.
pub const HXE_MAGIC: [u8; 4] = *b"HXE\0";

/// The two image format versions the loader understands. Version 1 images
/// predate the metadata section table and load for compatibility.
pub const HXE_VERSION_1: u16 = 0x0001;
pub const HXE_VERSION_2: u16 = 0x0002;

/// Header flag bit 0: more than one instance of this image may be live at
/// once.
pub const HXE_FLAG_ALLOW_MULTIPLE: u16 = 1 << 0;

/// Fixed HXE header, exactly 0x40 bytes, followed immediately by the code
/// segment. All multi-byte fields are little-endian; the struct is only
/// ever read on little-endian hosts or through the explicit codec in the
/// image crate.
#[derive(Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct HxeHeader {
    pub magic: [u8; 4],
    pub version: u16,
    pub flags: u16,
    pub entry_pc: u32,
    pub code_size: u32,
    pub data_size: u32,
    pub bss_size: u32,
    pub meta_offset: u32,
    pub meta_count: u32,
    /// NUL-padded UTF-8 application name.
    pub app_name: [u8; 32],
}

/// One metadata section table entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct SectionEntry {
    pub section_type: u32,
    pub offset: u32,
    pub length: u32,
}

/// Known metadata section types. Unknown types are preserved but ignored
/// by the loader, for forward compatibility.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum SectionType {
    Value = 0x01,
    Command = 0x02,
    Mailbox = 0x03,
    DebugInfo = 0x04,
}

impl TryFrom<u32> for SectionType {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0x01 => Ok(Self::Value),
            0x02 => Ok(Self::Command),
            0x03 => Ok(Self::Mailbox),
            0x04 => Ok(Self::DebugInfo),
            _ => Err(()),
        }
    }
}

/// Event stream categories, in the order they were specified. The control
/// plane serialises these as snake_case strings.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Stopped,
    Continued,
    Break,
    Fault,
    SvcError,
    ValueChanged,
    ValueRegistered,
    CmdInvoked,
    CmdCompleted,
    MailboxOverflow,
    TraceStep,
    Telemetry,
}

impl EventCategory {
    /// Categories that must never be dropped or coalesced: they block
    /// emission until acknowledged.
    pub fn is_lossless(&self) -> bool {
        matches!(
            self,
            EventCategory::Stopped | EventCategory::Fault | EventCategory::CmdCompleted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_round_trips_index_and_generation() {
        let h = Handle::for_index_and_gen(37, 9);
        assert_eq!(h.index(), 37);
        assert_eq!(h.generation(), 9);
    }

    #[test]
    fn oid_packs_group_high() {
        let oid = Oid::new(0xF0, 0x03);
        assert_eq!(oid.0, 0xF003);
        assert_eq!(oid.group(), 0xF0);
        assert_eq!(oid.id(), 0x03);
    }

    #[test]
    fn value_entry_is_pod_round_trippable() {
        let e = ValueEntry {
            oid: 0xF003,
            value_bits: 0x4248, // 3.14-ish in binary16
            descriptor_offset: 12,
            pid: 2,
            flags: ValueFlags::RW.bits(),
            auth: AuthLevel::User as u8,
        };
        let bytes = e.as_bytes();
        assert_eq!(bytes.len(), 10, "ValueEntry must stay padding-free");
        let back = ValueEntry::read_from_bytes(bytes).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn command_entry_is_pod_round_trippable() {
        let e = CommandEntry {
            handler_address: 0x0100,
            oid: 0xF010,
            descriptor_offset: NO_DESCRIPTOR,
            owner_pid: 3,
            flags: (CommandFlags::SECURE | CommandFlags::EXCLUSIVE).bits(),
            auth: AuthLevel::Admin as u8,
        };
        let bytes = e.as_bytes();
        assert_eq!(bytes.len(), 12, "CommandEntry must stay padding-free");
        let back = CommandEntry::read_from_bytes(bytes).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn rdwr_composes_both_access_bits() {
        assert!(ModeMask::RDWR.contains(ModeMask::RDONLY));
        assert!(ModeMask::RDWR.contains(ModeMask::WRONLY));
    }

    #[test]
    fn svc_module_rejects_reserved_ids() {
        assert!(SvcModule::try_from(0x03).is_err());
        assert!(SvcModule::try_from(0x18).is_err(), "0x18 is reserved");
        assert_eq!(SvcModule::try_from(0x05), Ok(SvcModule::Mailbox));
    }

    #[test]
    fn lossless_categories_are_exactly_the_specified_three() {
        let lossless: [EventCategory; 3] = [
            EventCategory::Stopped,
            EventCategory::Fault,
            EventCategory::CmdCompleted,
        ];
        for c in lossless {
            assert!(c.is_lossless());
        }
        assert!(!EventCategory::TraceStep.is_lossless());
        assert!(!EventCategory::ValueChanged.is_lossless());
    }
}
