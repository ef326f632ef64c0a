// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The linker: HXO objects in, CRC-protected HXE v2 image (and `.sym`
//! sidecar) out.
//!
//! Sections are concatenated in input order, symbols are merged (a
//! duplicate definition is an error), relocations are patched, command
//! handler names resolve to final code offsets, and directive strings
//! are deduplicated by the image metadata encoder. Output is
//! deterministic: the only environmental input is `SOURCE_DATE_EPOCH`,
//! which lands in the `.sym` sidecar and nowhere else.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Result};
use hsx_abi::{AuthLevel, CommandFlags, ModeMask, Oid, ValueFlags};
use hsx_hxe::{DeclaredCommand, DeclaredMailbox, DeclaredValue, Image};
use serde::Serialize;

use crate::obj::{Hxo, RelocKind, Section};

/// Linker inputs beyond the objects themselves.
#[derive(Clone, Debug)]
pub struct LinkOptions {
    /// Application name stamped into the header (max 31 bytes).
    pub app_name: String,
    /// Entry symbol override; otherwise the objects' `.entry` wins.
    pub entry: Option<String>,
    pub allow_multiple_instances: bool,
    /// Value of `SOURCE_DATE_EPOCH` for the `.sym` sidecar; zero when
    /// unset.
    pub source_date_epoch: u64,
}

/// The `.sym` sidecar: final addresses for every symbol plus the merged
/// source-line map.
#[derive(Debug, Serialize)]
pub struct SymFile {
    pub app: String,
    pub entry_pc: u32,
    pub source_date_epoch: u64,
    /// Symbol name -> final address (code symbols; data symbols carry
    /// their data-space address).
    pub symbols: BTreeMap<String, u32>,
    pub lines: Vec<SymLine>,
}

#[derive(Debug, Serialize)]
pub struct SymLine {
    pub addr: u32,
    pub file: String,
    pub line: u32,
}

impl SymFile {
    pub fn to_json(&self) -> String {
        let mut s = serde_json::to_string_pretty(self).expect("sym file serialises");
        s.push('\n');
        s
    }
}

/// Links objects into an image and its symbol sidecar.
pub fn link(objects: &[Hxo], options: &LinkOptions) -> Result<(Image, SymFile)> {
    let mut code = Vec::new();
    let mut data = Vec::new();
    let mut bss_size = 0u32;
    let mut entry_sym: Option<String> = options.entry.clone();

    // Final address of every symbol, by name.
    let mut symbols: BTreeMap<String, (Section, u32)> = BTreeMap::new();
    let mut lines = Vec::new();

    struct Patched {
        site: u32,
        kind: RelocKind,
        symbol: String,
    }
    let mut patches: Vec<Patched> = Vec::new();

    for hxo in objects {
        let code_base = code.len() as u32;
        let data_base = data.len() as u32;
        code.extend_from_slice(&hxo.code_bytes()?);
        data.extend_from_slice(&hxo.data_bytes()?);
        bss_size += hxo.bss_size;

        for (name, def) in &hxo.symbols {
            let addr = match def.section {
                Section::Code => code_base + def.offset,
                Section::Data => data_base + def.offset,
            };
            if symbols.insert(name.clone(), (def.section, addr)).is_some() {
                bail!("duplicate symbol {name:?}");
            }
        }
        for r in &hxo.relocs {
            let symbol = hxo
                .symbol_refs
                .get(r.symbol as usize)
                .ok_or_else(|| anyhow!("bad symbol index {}", r.symbol))?;
            patches.push(Patched {
                site: code_base + r.offset,
                kind: r.kind,
                symbol: symbol.clone(),
            });
        }
        for d in &hxo.dbg {
            lines.push(SymLine {
                addr: code_base + d.offset,
                file: d.file.clone(),
                line: d.line,
            });
        }
        if let Some(e) = &hxo.entry {
            match &entry_sym {
                Some(prev) if prev != e && options.entry.is_none() => {
                    bail!("conflicting .entry declarations: {prev:?} and {e:?}")
                }
                None => entry_sym = Some(e.clone()),
                _ => {}
            }
        }
    }

    // Patch relocation sites now that every symbol has a final address.
    for p in &patches {
        let (_, addr) = symbols
            .get(&p.symbol)
            .ok_or_else(|| anyhow!("undefined symbol {:?}", p.symbol))?;
        let site = p.site as usize;
        let word = u32::from_le_bytes(code[site..site + 4].try_into().unwrap());
        let imm: i32 = match p.kind {
            RelocKind::Rel16 => {
                let delta = *addr as i64 - (p.site as i64 + 4);
                if delta % 4 != 0 {
                    bail!("misaligned branch target for {:?}", p.symbol);
                }
                (delta / 4) as i32
            }
            RelocKind::Abs16 => *addr as i32,
            RelocKind::Hi16 => (*addr >> 16) as i32,
        };
        if !(-32768..=32767).contains(&imm) {
            bail!("relocation for {:?} out of range ({imm})", p.symbol);
        }
        let patched = (word & 0xFFFF_0000) | (imm as u32 & 0xFFFF);
        code[site..site + 4].copy_from_slice(&patched.to_le_bytes());
    }

    let entry_pc = match &entry_sym {
        Some(sym) => {
            let (section, addr) = symbols
                .get(sym)
                .ok_or_else(|| anyhow!("entry symbol {sym:?} is undefined"))?;
            if *section != Section::Code {
                bail!("entry symbol {sym:?} is not in the code section");
            }
            *addr
        }
        None => 0,
    };

    // Merge metadata directives. Duplicate OIDs across objects are a
    // link error; the loader would reject them anyway, but failing at
    // link time names the culprit.
    let mut values: Vec<DeclaredValue> = Vec::new();
    let mut commands: Vec<DeclaredCommand> = Vec::new();
    let mut mailboxes: Vec<DeclaredMailbox> = Vec::new();
    for hxo in objects {
        for v in &hxo.values {
            if values.iter().any(|x| x.oid.0 == v.oid) {
                bail!("duplicate .value oid {:#06x}", v.oid);
            }
            values.push(DeclaredValue {
                oid: Oid(v.oid),
                flags: ValueFlags::from_bits(v.flags)
                    .ok_or_else(|| anyhow!("bad value flags"))?,
                auth: AuthLevel::try_from(v.auth)
                    .map_err(|_| anyhow!("bad auth level"))?,
                value_bits: v.value_bits,
                name: v.name.clone(),
                unit: v.unit.clone(),
                range: v.range,
            });
        }
        for c in &hxo.commands {
            if commands.iter().any(|x| x.oid.0 == c.oid) {
                bail!("duplicate .cmd oid {:#06x}", c.oid);
            }
            let handler_address = if c.handler.is_empty() || c.handler == "host" {
                0
            } else {
                let (section, addr) = symbols
                    .get(&c.handler)
                    .ok_or_else(|| anyhow!("command handler {:?} is undefined", c.handler))?;
                if *section != Section::Code {
                    bail!("command handler {:?} is not code", c.handler);
                }
                *addr
            };
            commands.push(DeclaredCommand {
                oid: Oid(c.oid),
                flags: CommandFlags::from_bits(c.flags)
                    .ok_or_else(|| anyhow!("bad command flags"))?,
                auth: AuthLevel::try_from(c.auth)
                    .map_err(|_| anyhow!("bad auth level"))?,
                handler_address,
                name: c.name.clone(),
            });
        }
        for m in &hxo.mailboxes {
            if mailboxes.iter().any(|x| x.name == m.target) {
                bail!("duplicate .mailbox target {:?}", m.target);
            }
            mailboxes.push(DeclaredMailbox {
                name: m.target.clone(),
                capacity: m.capacity,
                mode_mask: ModeMask::from_bits(m.mode_mask)
                    .ok_or_else(|| anyhow!("bad mode mask"))?,
            });
        }
    }

    // Sort the line map by address; merged objects interleave.
    lines.sort_by(|a, b| a.addr.cmp(&b.addr));

    let image = Image {
        version: hsx_abi::HXE_VERSION_2,
        allow_multiple_instances: options.allow_multiple_instances,
        entry_pc,
        app_name: options.app_name.clone(),
        code,
        data,
        bss_size,
        values,
        commands,
        mailboxes,
        debug_info: Vec::new(),
        unknown_sections: Vec::new(),
    };

    let sym = SymFile {
        app: options.app_name.clone(),
        entry_pc,
        source_date_epoch: options.source_date_epoch,
        symbols: symbols.into_iter().map(|(n, (_, a))| (n, a)).collect(),
        lines,
    };

    Ok((image, sym))
}
