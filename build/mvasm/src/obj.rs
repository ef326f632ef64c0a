// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The HXO object format: assembler output, linker input.
//!
//! HXO is a JSON document -- the toolchain runs on hosts, the format is
//! easy to inspect, and serde's struct-field ordering plus `BTreeMap`
//! keys make the bytes deterministic for free. Sections are hex-encoded
//! so objects stay line-diffable.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const HXO_VERSION: u32 = 2;

/// Which section a symbol or relocation site lives in.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Code,
    Data,
}

/// A defined symbol: section-relative byte offset.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SymbolDef {
    pub section: Section,
    pub offset: u32,
}

/// How a relocation site is patched once its symbol's final address is
/// known.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelocKind {
    /// PC-relative signed word offset in an imm16 field (branches,
    /// JMP, CALL).
    Rel16,
    /// Absolute address in an imm16 field (LDI of a data or code
    /// symbol).
    Abs16,
    /// High half of an absolute address (LUI pairing).
    Hi16,
}

/// One relocation site, always in the code section.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Reloc {
    /// Byte offset of the instruction word to patch.
    pub offset: u32,
    pub kind: RelocKind,
    /// Index into `symbol_refs`.
    pub symbol: u32,
}

/// A `.value` directive, carried verbatim to the linker (floats are
/// converted to f16 bits at assembly, so objects never depend on host
/// float formatting).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ValueDirective {
    pub oid: u16,
    pub flags: u8,
    pub auth: u8,
    pub value_bits: u16,
    pub name: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub range: Option<(u16, u16)>,
}

/// A `.cmd` directive; `handler` is a symbol name resolved by the
/// linker (the empty string means host-provided).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CommandDirective {
    pub oid: u16,
    pub flags: u8,
    pub auth: u8,
    pub handler: String,
    pub name: String,
}

/// A `.mailbox` directive.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MailboxDirective {
    pub target: String,
    pub capacity: u32,
    pub mode_mask: u32,
}

/// One source-line mapping for the `.dbg` sidecar.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DbgLine {
    /// Code-section byte offset of the instruction.
    pub offset: u32,
    pub file: String,
    pub line: u32,
}

/// A complete object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Hxo {
    pub version: u32,
    /// Hex-encoded code section.
    pub code: String,
    /// Hex-encoded data section.
    pub data: String,
    pub bss_size: u32,
    /// Entry symbol, if this object declared `.entry`.
    pub entry: Option<String>,
    pub symbols: BTreeMap<String, SymbolDef>,
    /// Referenced symbol names, indexed by `Reloc::symbol`.
    pub symbol_refs: Vec<String>,
    pub relocs: Vec<Reloc>,
    pub values: Vec<ValueDirective>,
    pub commands: Vec<CommandDirective>,
    pub mailboxes: Vec<MailboxDirective>,
    pub dbg: Vec<DbgLine>,
}

impl Hxo {
    pub fn code_bytes(&self) -> anyhow::Result<Vec<u8>> {
        hex_decode(&self.code)
    }

    pub fn data_bytes(&self) -> anyhow::Result<Vec<u8>> {
        hex_decode(&self.data)
    }

    /// Serialises with a trailing newline; pretty so the objects diff.
    pub fn to_json(&self) -> String {
        let mut s = serde_json::to_string_pretty(self).expect("hxo serialises");
        s.push('\n');
        s
    }

    pub fn from_json(s: &str) -> anyhow::Result<Hxo> {
        let hxo: Hxo = serde_json::from_str(s)?;
        anyhow::ensure!(
            hxo.version == HXO_VERSION,
            "unsupported HXO version {}",
            hxo.version
        );
        Ok(hxo)
    }
}

pub fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(s, "{b:02x}");
    }
    s
}

pub fn hex_decode(s: &str) -> anyhow::Result<Vec<u8>> {
    anyhow::ensure!(s.len() % 2 == 0, "odd hex length");
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|e| anyhow::anyhow!("bad hex at {i}: {e}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_json_round_trips() {
        let mut hxo = Hxo {
            version: HXO_VERSION,
            code: hex_encode(&[1, 2, 3, 4]),
            ..Hxo::default()
        };
        hxo.symbols.insert(
            "main".into(),
            SymbolDef { section: Section::Code, offset: 0 },
        );
        hxo.symbol_refs.push("helper".into());
        hxo.relocs.push(Reloc { offset: 0, kind: RelocKind::Rel16, symbol: 0 });
        let back = Hxo::from_json(&hxo.to_json()).unwrap();
        assert_eq!(back.code, hxo.code);
        assert_eq!(back.symbols, hxo.symbols);
        assert_eq!(back.relocs, hxo.relocs);
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let hxo = Hxo { version: 1, ..Hxo::default() };
        assert!(Hxo::from_json(&hxo.to_json()).is_err());
    }
}
