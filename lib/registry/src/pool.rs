// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Descriptor pool and deduplicated string table.
//!
//! Descriptors are fixed 7-byte records chained through the pool:
//! `{kind u8, next u16, a u16, b u16}`, all little-endian, terminated by
//! the `NO_DESCRIPTOR` sentinel in `next`. String payloads index the
//! string table, which stores length-prefixed UTF-8 and interns by byte
//! content -- registering fifty values with unit `"degC"` costs the pool
//! five bytes, once.

use hsx_abi::{DescriptorKind, NO_DESCRIPTOR};

use crate::PoolKind;

const RECORD_LEN: usize = 7;

/// A decoded descriptor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Descriptor {
    Group(String),
    Name(String),
    Unit(String),
    /// Raw binary16 bounds (lo, hi).
    Range(u16, u16),
    Persist,
}

pub struct DescriptorPool {
    descriptors: Vec<u8>,
    descriptor_capacity: usize,
    strings: Vec<u8>,
    string_capacity: usize,
}

impl DescriptorPool {
    pub fn new(descriptor_capacity: usize, string_capacity: usize) -> Self {
        DescriptorPool {
            descriptors: Vec::new(),
            descriptor_capacity,
            strings: Vec::new(),
            string_capacity,
        }
    }

    pub fn descriptor_bytes_used(&self) -> usize {
        self.descriptors.len()
    }

    pub fn string_bytes_used(&self) -> usize {
        self.strings.len()
    }

    /// Interns a string, deduplicating by content. Returns its offset.
    fn intern_string(&mut self, s: &str) -> Result<u16, PoolKind> {
        let bytes = s.as_bytes();
        debug_assert!(bytes.len() <= u8::MAX as usize);

        let mut at = 0;
        while at < self.strings.len() {
            let len = self.strings[at] as usize;
            if &self.strings[at + 1..at + 1 + len] == bytes {
                return Ok(at as u16);
            }
            at += 1 + len;
        }

        let needed = 1 + bytes.len();
        if self.strings.len() + needed > self.string_capacity {
            return Err(PoolKind::Strings);
        }
        let off = self.strings.len() as u16;
        self.strings.push(bytes.len() as u8);
        self.strings.extend_from_slice(bytes);
        Ok(off)
    }

    fn read_string(&self, off: u16) -> String {
        let at = off as usize;
        let len = self.strings[at] as usize;
        String::from_utf8_lossy(&self.strings[at + 1..at + 1 + len]).into_owned()
    }

    /// Packs a descriptor chain into the pool, returning the offset of
    /// its first record (or `NO_DESCRIPTOR` for an empty chain).
    ///
    /// The records of one chain are allocated contiguously, but readers
    /// must follow the `next` links: nothing guarantees contiguity once
    /// images start declaring chains of their own.
    pub fn intern_chain(&mut self, chain: &[Descriptor]) -> Result<u16, PoolKind> {
        if chain.is_empty() {
            return Ok(NO_DESCRIPTOR);
        }
        let needed = chain.len() * RECORD_LEN;
        if self.descriptors.len() + needed > self.descriptor_capacity {
            return Err(PoolKind::Descriptors);
        }
        // Intern strings first: a string-pool failure must not leave
        // half a chain behind.
        let mut payloads = Vec::with_capacity(chain.len());
        for d in chain {
            payloads.push(match d {
                Descriptor::Group(s) => (DescriptorKind::Group, self.intern_string(s)?, 0),
                Descriptor::Name(s) => (DescriptorKind::Name, self.intern_string(s)?, 0),
                Descriptor::Unit(s) => (DescriptorKind::Unit, self.intern_string(s)?, 0),
                Descriptor::Range(lo, hi) => (DescriptorKind::Range, *lo, *hi),
                Descriptor::Persist => (DescriptorKind::Persist, 0, 0),
            });
        }

        let first = self.descriptors.len() as u16;
        let count = payloads.len();
        for (i, (kind, a, b)) in payloads.into_iter().enumerate() {
            let next = if i + 1 == count {
                NO_DESCRIPTOR
            } else {
                first + ((i + 1) * RECORD_LEN) as u16
            };
            self.descriptors.push(kind as u8);
            self.descriptors.extend_from_slice(&next.to_le_bytes());
            self.descriptors.extend_from_slice(&a.to_le_bytes());
            self.descriptors.extend_from_slice(&b.to_le_bytes());
        }
        Ok(first)
    }

    /// Walks a chain starting at `offset`. Malformed links terminate the
    /// walk rather than panic; the pool is executive-owned, so a bad link
    /// indicates a bug, not hostile input.
    pub fn read_chain(&self, offset: u16) -> Vec<Descriptor> {
        let mut out = Vec::new();
        let mut at = offset;
        while at != NO_DESCRIPTOR {
            let i = at as usize;
            if i + RECORD_LEN > self.descriptors.len() {
                break;
            }
            let kind = self.descriptors[i];
            let next = u16::from_le_bytes([self.descriptors[i + 1], self.descriptors[i + 2]]);
            let a = u16::from_le_bytes([self.descriptors[i + 3], self.descriptors[i + 4]]);
            let b = u16::from_le_bytes([self.descriptors[i + 5], self.descriptors[i + 6]]);
            match DescriptorKind::try_from(kind) {
                Ok(DescriptorKind::Group) => out.push(Descriptor::Group(self.read_string(a))),
                Ok(DescriptorKind::Name) => out.push(Descriptor::Name(self.read_string(a))),
                Ok(DescriptorKind::Unit) => out.push(Descriptor::Unit(self.read_string(a))),
                Ok(DescriptorKind::Range) => out.push(Descriptor::Range(a, b)),
                Ok(DescriptorKind::Persist) => out.push(Descriptor::Persist),
                Err(()) => break,
            }
            at = next;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_round_trips() {
        let mut p = DescriptorPool::new(1024, 1024);
        let chain = vec![
            Descriptor::Name("temp.ambient".into()),
            Descriptor::Unit("degC".into()),
            Descriptor::Range(0xC900, 0x4D00),
            Descriptor::Persist,
        ];
        let off = p.intern_chain(&chain).unwrap();
        assert_eq!(p.read_chain(off), chain);
    }

    #[test]
    fn strings_are_deduplicated_by_content() {
        let mut p = DescriptorPool::new(1024, 1024);
        p.intern_chain(&[Descriptor::Unit("degC".into())]).unwrap();
        let used = p.string_bytes_used();
        p.intern_chain(&[
            Descriptor::Name("other".into()),
            Descriptor::Unit("degC".into()),
        ])
        .unwrap();
        assert_eq!(
            p.string_bytes_used(),
            used + 1 + "other".len(),
            "the repeated unit string must not be stored twice",
        );
    }

    #[test]
    fn empty_chain_is_the_sentinel() {
        let mut p = DescriptorPool::new(64, 64);
        assert_eq!(p.intern_chain(&[]).unwrap(), NO_DESCRIPTOR);
        assert!(p.read_chain(NO_DESCRIPTOR).is_empty());
    }

    #[test]
    fn exhausted_descriptor_pool_is_reported() {
        let mut p = DescriptorPool::new(RECORD_LEN, 1024);
        p.intern_chain(&[Descriptor::Persist]).unwrap();
        assert_eq!(
            p.intern_chain(&[Descriptor::Persist]),
            Err(PoolKind::Descriptors)
        );
    }

    #[test]
    fn exhausted_string_pool_is_reported() {
        let mut p = DescriptorPool::new(1024, 4);
        assert_eq!(
            p.intern_chain(&[Descriptor::Name("too-long".into())]),
            Err(PoolKind::Strings)
        );
    }
}
