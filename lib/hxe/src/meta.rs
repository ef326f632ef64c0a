// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Metadata section payload codecs.
//!
//! Records are packed little-endian with length-prefixed strings; a
//! section is a plain concatenation of records, self-delimiting against
//! the section length. JSON exists only in MVASM directive source text --
//! by the time metadata reaches an image it is binary.

use hsx_abi::{AuthLevel, CommandFlags, ModeMask, Oid, ValueFlags};

use crate::ImageError;

/// A `.value` directive as carried in a VALUE section.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeclaredValue {
    pub oid: Oid,
    pub flags: ValueFlags,
    pub auth: AuthLevel,
    /// Initial payload, raw binary16 bits.
    pub value_bits: u16,
    pub name: String,
    pub unit: String,
    /// Optional (lo, hi) bounds, raw binary16 bits.
    pub range: Option<(u16, u16)>,
}

/// A `.cmd` directive as carried in a COMMAND section. The handler name
/// has been resolved to a code offset by the linker (0 = host-provided).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeclaredCommand {
    pub oid: Oid,
    pub flags: CommandFlags,
    pub auth: AuthLevel,
    pub handler_address: u32,
    pub name: String,
}

/// A `.mailbox` directive as carried in a MAILBOX section.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeclaredMailbox {
    pub name: String,
    pub capacity: u32,
    pub mode_mask: ModeMask,
}

/// Cursor over a section payload. All reads are bounds-checked; running
/// off the end is `MetadataInvalid`, not a panic.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn done(&self) -> bool {
        self.pos == self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ImageError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.buf.len())
            .ok_or(ImageError::MetadataInvalid("record runs off section end"))?;
        let s = &self.buf[self.pos..end];
        self.pos = end;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, ImageError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ImageError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, ImageError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn string(&mut self) -> Result<String, ImageError> {
        let len = self.u8()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ImageError::MetadataInvalid("string is not UTF-8"))
    }
}

fn push_string(out: &mut Vec<u8>, s: &str) {
    // Directive strings are capped well below 255 by the assembler; the
    // truncation here is belt-and-suspenders for hand-built images.
    let bytes = s.as_bytes();
    let n = bytes.len().min(255);
    out.push(n as u8);
    out.extend_from_slice(&bytes[..n]);
}

fn auth_from(raw: u8) -> Result<AuthLevel, ImageError> {
    AuthLevel::try_from(raw).map_err(|_| ImageError::MetadataInvalid("bad auth level"))
}

pub(crate) fn decode_values(payload: &[u8]) -> Result<Vec<DeclaredValue>, ImageError> {
    let mut r = Reader::new(payload);
    let mut out = Vec::new();
    while !r.done() {
        let oid = Oid(r.u16()?);
        let value_bits = r.u16()?;
        let flags = ValueFlags::from_bits(r.u8()?)
            .ok_or(ImageError::MetadataInvalid("bad value flags"))?;
        let auth = auth_from(r.u8()?)?;
        let has_range = r.u8()?;
        let range = match has_range {
            0 => None,
            1 => Some((r.u16()?, r.u16()?)),
            _ => return Err(ImageError::MetadataInvalid("bad range marker")),
        };
        let name = r.string()?;
        let unit = r.string()?;
        out.push(DeclaredValue { oid, flags, auth, value_bits, name, unit, range });
    }
    Ok(out)
}

pub(crate) fn encode_values(values: &[DeclaredValue]) -> Vec<u8> {
    let mut out = Vec::new();
    for v in values {
        out.extend_from_slice(&v.oid.0.to_le_bytes());
        out.extend_from_slice(&v.value_bits.to_le_bytes());
        out.push(v.flags.bits());
        out.push(v.auth as u8);
        match v.range {
            None => out.push(0),
            Some((lo, hi)) => {
                out.push(1);
                out.extend_from_slice(&lo.to_le_bytes());
                out.extend_from_slice(&hi.to_le_bytes());
            }
        }
        push_string(&mut out, &v.name);
        push_string(&mut out, &v.unit);
    }
    out
}

pub(crate) fn decode_commands(payload: &[u8]) -> Result<Vec<DeclaredCommand>, ImageError> {
    let mut r = Reader::new(payload);
    let mut out = Vec::new();
    while !r.done() {
        let oid = Oid(r.u16()?);
        let handler_address = r.u32()?;
        let flags = CommandFlags::from_bits(r.u8()?)
            .ok_or(ImageError::MetadataInvalid("bad command flags"))?;
        let auth = auth_from(r.u8()?)?;
        let name = r.string()?;
        out.push(DeclaredCommand { oid, flags, auth, handler_address, name });
    }
    Ok(out)
}

pub(crate) fn encode_commands(commands: &[DeclaredCommand]) -> Vec<u8> {
    let mut out = Vec::new();
    for c in commands {
        out.extend_from_slice(&c.oid.0.to_le_bytes());
        out.extend_from_slice(&c.handler_address.to_le_bytes());
        out.push(c.flags.bits());
        out.push(c.auth as u8);
        push_string(&mut out, &c.name);
    }
    out
}

pub(crate) fn decode_mailboxes(payload: &[u8]) -> Result<Vec<DeclaredMailbox>, ImageError> {
    let mut r = Reader::new(payload);
    let mut out = Vec::new();
    while !r.done() {
        let capacity = r.u32()?;
        let mode_mask = ModeMask::from_bits(r.u32()?)
            .ok_or(ImageError::MetadataInvalid("bad mailbox mode mask"))?;
        let name = r.string()?;
        out.push(DeclaredMailbox { name, capacity, mode_mask });
    }
    Ok(out)
}

pub(crate) fn encode_mailboxes(mailboxes: &[DeclaredMailbox]) -> Vec<u8> {
    let mut out = Vec::new();
    for m in mailboxes {
        out.extend_from_slice(&m.capacity.to_le_bytes());
        out.extend_from_slice(&m.mode_mask.bits().to_le_bytes());
        push_string(&mut out, &m.name);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_records_round_trip() {
        let vals = vec![
            DeclaredValue {
                oid: Oid::new(0xF0, 0x03),
                flags: ValueFlags::RW | ValueFlags::PERSIST,
                auth: AuthLevel::Admin,
                value_bits: 0x3C00, // 1.0
                name: "pump.enabled".into(),
                unit: String::new(),
                range: None,
            },
            DeclaredValue {
                oid: Oid::new(0x01, 0x01),
                flags: ValueFlags::NOTIFY,
                auth: AuthLevel::User,
                value_bits: 0,
                name: "temp".into(),
                unit: "degC".into(),
                range: Some((0xC900, 0x4D00)),
            },
        ];
        let decoded = decode_values(&encode_values(&vals)).unwrap();
        assert_eq!(decoded, vals);
    }

    #[test]
    fn truncated_record_is_metadata_invalid() {
        let mut bytes = encode_values(&[DeclaredValue {
            oid: Oid(1),
            flags: ValueFlags::empty(),
            auth: AuthLevel::User,
            value_bits: 0,
            name: "x".into(),
            unit: String::new(),
            range: None,
        }]);
        bytes.truncate(bytes.len() - 1);
        match decode_values(&bytes) {
            Err(ImageError::MetadataInvalid(_)) => {}
            other => panic!("expected MetadataInvalid, got {other:?}"),
        }
    }

    #[test]
    fn command_and_mailbox_records_round_trip() {
        let cmds = vec![DeclaredCommand {
            oid: Oid(0xF010),
            flags: CommandFlags::SECURE | CommandFlags::ASYNC,
            auth: AuthLevel::Admin,
            handler_address: 0,
            name: "net.restart".into(),
        }];
        assert_eq!(decode_commands(&encode_commands(&cmds)).unwrap(), cmds);

        let boxes = vec![DeclaredMailbox {
            name: "app:frames".into(),
            capacity: 64,
            mode_mask: ModeMask::RDWR,
        }];
        assert_eq!(decode_mailboxes(&encode_mailboxes(&boxes)).unwrap(), boxes);
    }

    #[test]
    fn bad_auth_level_is_rejected() {
        let mut bytes = encode_commands(&[DeclaredCommand {
            oid: Oid(1),
            flags: CommandFlags::empty(),
            auth: AuthLevel::User,
            handler_address: 0,
            name: "c".into(),
        }]);
        bytes[7] = 9; // auth byte
        match decode_commands(&bytes) {
            Err(ImageError::MetadataInvalid(_)) => {}
            other => panic!("expected MetadataInvalid, got {other:?}"),
        }
    }
}
