// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The MVASM assembler: text in, HXO object out.
//!
//! Every symbol reference -- including file-local branch targets -- is
//! emitted as a relocation and resolved by the linker. That keeps the
//! assembler single-pass and means cross-object references cost nothing
//! extra.
//!
//! Directive payloads (`.value`, `.cmd`, `.mailbox`) are JSON in the
//! source text; the assembler converts floats to binary16 bits and flag
//! names to mask bits immediately, so downstream stages only ever see
//! resolved numbers.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context, Result};
use hsx_abi::{AuthLevel, CommandFlags, ModeMask, Oid, ValueFlags};
use hsx_isa::{encode, imm_fits, Form, Instr, Op};

use crate::obj::{
    CommandDirective, DbgLine, Hxo, MailboxDirective, Reloc, RelocKind, Section,
    SymbolDef, ValueDirective, HXO_VERSION,
};

struct Assembler<'a> {
    file: &'a str,
    section: Section,
    code: Vec<u8>,
    data: Vec<u8>,
    bss_size: u32,
    entry: Option<String>,
    symbols: BTreeMap<String, SymbolDef>,
    symbol_refs: Vec<String>,
    ref_index: BTreeMap<String, u32>,
    relocs: Vec<Reloc>,
    values: Vec<ValueDirective>,
    commands: Vec<CommandDirective>,
    mailboxes: Vec<MailboxDirective>,
    dbg: Vec<DbgLine>,
}

/// Assembles one MVASM source file into an object.
pub fn assemble(source: &str, file: &str) -> Result<Hxo> {
    let mut a = Assembler {
        file,
        section: Section::Code,
        code: Vec::new(),
        data: Vec::new(),
        bss_size: 0,
        entry: None,
        symbols: BTreeMap::new(),
        symbol_refs: Vec::new(),
        ref_index: BTreeMap::new(),
        relocs: Vec::new(),
        values: Vec::new(),
        commands: Vec::new(),
        mailboxes: Vec::new(),
        dbg: Vec::new(),
    };

    for (lineno, raw) in source.lines().enumerate() {
        let lineno = lineno as u32 + 1;
        a.line(raw, lineno)
            .with_context(|| format!("{file}:{lineno}: {raw:?}"))?;
    }

    Ok(Hxo {
        version: HXO_VERSION,
        code: crate::obj::hex_encode(&a.code),
        data: crate::obj::hex_encode(&a.data),
        bss_size: a.bss_size,
        entry: a.entry,
        symbols: a.symbols,
        symbol_refs: a.symbol_refs,
        relocs: a.relocs,
        values: a.values,
        commands: a.commands,
        mailboxes: a.mailboxes,
        dbg: a.dbg,
    })
}

impl Assembler<'_> {
    fn line(&mut self, raw: &str, lineno: u32) -> Result<()> {
        let mut text = strip_comment(raw).trim();

        // Leading labels, possibly several.
        while let Some(colon) = find_label(text) {
            let (label, rest) = text.split_at(colon);
            let label = label.trim();
            if !is_ident(label) {
                bail!("bad label {label:?}");
            }
            let def = SymbolDef {
                section: self.section,
                offset: self.here(),
            };
            if self.symbols.insert(label.to_string(), def).is_some() {
                bail!("duplicate label {label:?}");
            }
            text = rest[1..].trim();
        }
        if text.is_empty() {
            return Ok(());
        }

        if let Some(directive) = text.strip_prefix('.') {
            return self.directive(directive);
        }
        self.instruction(text, lineno)
    }

    fn here(&self) -> u32 {
        match self.section {
            Section::Code => self.code.len() as u32,
            Section::Data => self.data.len() as u32,
        }
    }

    fn out(&mut self) -> &mut Vec<u8> {
        match self.section {
            Section::Code => &mut self.code,
            Section::Data => &mut self.data,
        }
    }

    fn directive(&mut self, text: &str) -> Result<()> {
        let (name, rest) = text
            .split_once(char::is_whitespace)
            .map(|(n, r)| (n, r.trim()))
            .unwrap_or((text, ""));
        match name {
            "code" => self.section = Section::Code,
            "data" => self.section = Section::Data,
            "entry" => {
                if self.entry.is_some() {
                    bail!(".entry declared twice");
                }
                self.entry = Some(rest.to_string());
            }
            "bss" => {
                self.bss_size = self
                    .bss_size
                    .checked_add(parse_imm(rest)? as u32)
                    .ok_or_else(|| anyhow!("bss overflow"))?;
            }
            "word" => {
                for tok in split_operands(rest) {
                    let v = parse_imm(&tok)?;
                    let out = self.out();
                    out.extend_from_slice(&(v as u32).to_le_bytes());
                }
            }
            "byte" => {
                for tok in split_operands(rest) {
                    let v = parse_imm(&tok)?;
                    self.out().push(v as u8);
                }
            }
            "space" => {
                let n = parse_imm(rest)? as usize;
                let out = self.out();
                out.resize(out.len() + n, 0);
            }
            "ascii" | "asciz" => {
                let s: String = serde_json::from_str(rest)
                    .map_err(|_| anyhow!("expected a JSON string literal"))?;
                self.out().extend_from_slice(s.as_bytes());
                if name == "asciz" {
                    self.out().push(0);
                }
            }
            "value" => {
                let v: serde_json::Value = serde_json::from_str(rest)?;
                self.values.push(parse_value_directive(&v)?);
            }
            "cmd" => {
                let v: serde_json::Value = serde_json::from_str(rest)?;
                self.commands.push(parse_cmd_directive(&v)?);
            }
            "mailbox" => {
                let v: serde_json::Value = serde_json::from_str(rest)?;
                self.mailboxes.push(parse_mailbox_directive(&v)?);
            }
            other => bail!("unknown directive .{other}"),
        }
        Ok(())
    }

    fn instruction(&mut self, text: &str, lineno: u32) -> Result<()> {
        if self.section != Section::Code {
            bail!("instructions are only valid in the code section");
        }
        if self.code.len() % 4 != 0 {
            bail!("instruction at misaligned code offset {}", self.code.len());
        }

        let (mnemonic, rest) = text
            .split_once(char::is_whitespace)
            .map(|(m, r)| (m, r.trim()))
            .unwrap_or((text, ""));
        let mnemonic = mnemonic.to_ascii_lowercase();
        let operands = split_operands(rest);

        // MOD is a pseudo-instruction: quotient, multiply back,
        // subtract. The destination must be distinct from both sources
        // because it doubles as the scratch register.
        if mnemonic == "mod" {
            let [rd, rs, rt] = three_regs(&operands)?;
            if rd == rs || rd == rt {
                bail!("mod needs a destination distinct from both sources");
            }
            for i in [
                Instr::reg(Op::Div, rd, rs, rt),
                Instr::reg(Op::Mul, rd, rd, rt),
                Instr::reg(Op::Sub, rd, rs, rd),
            ] {
                self.emit(&i, lineno);
            }
            return Ok(());
        }

        let op = Op::from_mnemonic(&mnemonic)
            .ok_or_else(|| anyhow!("unknown mnemonic {mnemonic:?}"))?;

        let instr = match op.form() {
            Form::None => {
                expect_operands(&operands, 0)?;
                Instr::reg(op, 0, 0, 0)
            }
            Form::Reg2 => {
                expect_operands(&operands, 2)?;
                Instr::reg(op, parse_reg(&operands[0])?, parse_reg(&operands[1])?, 0)
            }
            Form::Reg3 => {
                expect_operands(&operands, 3)?;
                Instr::reg(
                    op,
                    parse_reg(&operands[0])?,
                    parse_reg(&operands[1])?,
                    parse_reg(&operands[2])?,
                )
            }
            Form::Reg2Imm => {
                expect_operands(&operands, 3)?;
                let imm = check_imm(op, parse_imm(&operands[2])?)?;
                Instr::imm(op, parse_reg(&operands[0])?, parse_reg(&operands[1])?, imm)
            }
            Form::Mem => {
                expect_operands(&operands, 2)?;
                let (rs, disp) = parse_mem(&operands[1])?;
                let disp = check_imm(op, disp)?;
                Instr::imm(op, parse_reg(&operands[0])?, rs, disp)
            }
            Form::Reg2Src => {
                expect_operands(&operands, 2)?;
                Instr {
                    op,
                    rd: 0,
                    rs: parse_reg(&operands[0])?,
                    rt: parse_reg(&operands[1])?,
                    imm: 0,
                }
            }
            Form::RegSrcImm => {
                expect_operands(&operands, 2)?;
                let imm = check_imm(op, parse_imm(&operands[1])?)?;
                Instr::imm(op, 0, parse_reg(&operands[0])?, imm)
            }
            Form::RegImm16 => {
                expect_operands(&operands, 2)?;
                let rd = parse_reg(&operands[0])?;
                match parse_imm(&operands[1]) {
                    Ok(imm) => Instr::imm(op, rd, 0, check_imm(op, imm)?),
                    // A symbol reference: the linker patches the
                    // absolute (or high-half) address in.
                    Err(_) => {
                        let sym = ident(&operands[1])?;
                        let kind = if op == Op::Lui {
                            RelocKind::Hi16
                        } else {
                            RelocKind::Abs16
                        };
                        self.reloc(kind, sym);
                        Instr::imm(op, rd, 0, 0)
                    }
                }
            }
            Form::Rel16 => {
                expect_operands(&operands, 1)?;
                match parse_imm(&operands[0]) {
                    Ok(imm) => Instr::imm(op, 0, 0, check_imm(op, imm)?),
                    Err(_) => {
                        let sym = ident(&operands[0])?;
                        self.reloc(RelocKind::Rel16, sym);
                        Instr::imm(op, 0, 0, 0)
                    }
                }
            }
            Form::CallForm => {
                expect_operands(&operands, 2)?;
                let frame = parse_imm(&operands[0])?;
                if !(0..=15).contains(&frame) {
                    bail!("call frame size must be 0..=15, got {frame}");
                }
                match parse_imm(&operands[1]) {
                    Ok(imm) => Instr::imm(op, frame as u8, 0, check_imm(op, imm)?),
                    Err(_) => {
                        let sym = ident(&operands[1])?;
                        self.reloc(RelocKind::Rel16, sym);
                        Instr::imm(op, frame as u8, 0, 0)
                    }
                }
            }
            Form::SvcForm => {
                expect_operands(&operands, 2)?;
                let module = parse_imm(&operands[0])?;
                let function = parse_imm(&operands[1])?;
                if !(0..=255).contains(&module) || !(0..=255).contains(&function) {
                    bail!("svc module and function must fit a byte");
                }
                Instr::imm(op, 0, 0, (module << 8 | function) as i32)
            }
        };

        self.emit(&instr, lineno);
        Ok(())
    }

    fn emit(&mut self, instr: &Instr, lineno: u32) {
        self.dbg.push(DbgLine {
            offset: self.code.len() as u32,
            file: self.file.to_string(),
            line: lineno,
        });
        self.code.extend_from_slice(&encode(instr).to_le_bytes());
    }

    /// Records a relocation at the *next* emitted instruction word.
    fn reloc(&mut self, kind: RelocKind, sym: String) {
        let symbol = *self.ref_index.entry(sym.clone()).or_insert_with(|| {
            self.symbol_refs.push(sym);
            self.symbol_refs.len() as u32 - 1
        });
        self.relocs.push(Reloc { offset: self.code.len() as u32, kind, symbol });
    }
}

fn strip_comment(s: &str) -> &str {
    // Comments start at ';' outside string literals.
    let mut in_str = false;
    for (i, c) in s.char_indices() {
        match c {
            '"' => in_str = !in_str,
            ';' if !in_str => return &s[..i],
            _ => {}
        }
    }
    s
}

/// Finds the colon ending a leading label, if any. Directive payloads
/// contain colons inside JSON, so only a leading identifier counts.
fn find_label(s: &str) -> Option<usize> {
    let mut end = 0;
    for (i, c) in s.char_indices() {
        if c.is_alphanumeric() || c == '_' || c == '.' {
            end = i + c.len_utf8();
        } else {
            break;
        }
    }
    if end > 0 && s[end..].starts_with(':') {
        Some(end)
    } else {
        None
    }
}

fn is_ident(s: &str) -> bool {
    !s.is_empty()
        && s.chars().next().is_some_and(|c| c.is_alphabetic() || c == '_')
        && s.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.')
}

fn ident(s: &str) -> Result<String> {
    let s = s.trim().trim_start_matches('#');
    if is_ident(s) {
        Ok(s.to_string())
    } else {
        bail!("expected a symbol, got {s:?}")
    }
}

/// Splits operands at top-level commas, keeping bracketed groups
/// together.
fn split_operands(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut cur = String::new();
    for c in s.chars() {
        match c {
            '[' => {
                depth += 1;
                cur.push(c);
            }
            ']' => {
                depth = depth.saturating_sub(1);
                cur.push(c);
            }
            ',' if depth == 0 => {
                out.push(cur.trim().to_string());
                cur.clear();
            }
            _ => cur.push(c),
        }
    }
    if !cur.trim().is_empty() {
        out.push(cur.trim().to_string());
    }
    out
}

fn expect_operands(ops: &[String], n: usize) -> Result<()> {
    if ops.len() != n {
        bail!("expected {n} operands, got {}", ops.len());
    }
    Ok(())
}

fn parse_reg(s: &str) -> Result<u8> {
    let lower = s.to_ascii_lowercase();
    lower
        .strip_prefix('r')
        .and_then(|n| n.parse::<u8>().ok())
        .filter(|n| *n < hsx_isa::NUM_REGS)
        .ok_or_else(|| anyhow!("expected a register r0..r15, got {s:?}"))
}

fn parse_imm(s: &str) -> Result<i64> {
    let s = s.trim().trim_start_matches('#');
    let (neg, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let v = if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16)
    } else {
        body.parse::<i64>()
    }
    .map_err(|_| anyhow!("expected a number, got {s:?}"))?;
    Ok(if neg { -v } else { v })
}

fn check_imm(op: Op, imm: i64) -> Result<i32> {
    let imm32 = i32::try_from(imm).map_err(|_| anyhow!("immediate {imm} out of range"))?;
    if !imm_fits(op.form(), imm32) {
        bail!("immediate {imm} does not fit {:?}", op.form());
    }
    Ok(imm32)
}

/// Parses a `[rs, #disp]` or `[rs]` memory operand.
fn parse_mem(s: &str) -> Result<(u8, i64)> {
    let inner = s
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(|| anyhow!("expected [reg, #disp], got {s:?}"))?;
    let parts = split_operands(inner);
    match parts.as_slice() {
        [reg] => Ok((parse_reg(reg)?, 0)),
        [reg, disp] => Ok((parse_reg(reg)?, parse_imm(disp)?)),
        _ => bail!("expected [reg, #disp], got {s:?}"),
    }
}

fn three_regs(ops: &[String]) -> Result<[u8; 3]> {
    expect_operands(ops, 3)?;
    Ok([parse_reg(&ops[0])?, parse_reg(&ops[1])?, parse_reg(&ops[2])?])
}

// --- directive payloads ------------------------------------------------

fn json_u16(v: &serde_json::Value, key: &str) -> Result<u16> {
    v.get(key)
        .and_then(serde_json::Value::as_u64)
        .and_then(|n| u16::try_from(n).ok())
        .ok_or_else(|| anyhow!("missing or bad {key:?}"))
}

fn json_oid(v: &serde_json::Value) -> Result<u16> {
    let group = json_u16(v, "group")?;
    let id = json_u16(v, "id")?;
    anyhow::ensure!(group <= 0xFF && id <= 0xFF, "group and id must fit a byte");
    Ok(Oid::new(group as u8, id as u8).0)
}

fn json_auth(v: &serde_json::Value) -> Result<u8> {
    match v.get("auth").and_then(serde_json::Value::as_str) {
        None | Some("user") => Ok(AuthLevel::User as u8),
        Some("admin") => Ok(AuthLevel::Admin as u8),
        Some(other) => bail!("bad auth level {other:?}"),
    }
}

fn f16_bits(v: f64) -> u16 {
    half::f16::from_f64(v).to_bits()
}

fn parse_value_directive(v: &serde_json::Value) -> Result<ValueDirective> {
    let mut flags = ValueFlags::empty();
    match v.get("flags").and_then(serde_json::Value::as_str) {
        None | Some("RO") => {}
        Some("RW") => flags |= ValueFlags::RW,
        Some(other) => bail!("bad value flags {other:?}"),
    }
    if v.get("persist").and_then(serde_json::Value::as_bool) == Some(true) {
        flags |= ValueFlags::PERSIST;
    }
    if v.get("notify").and_then(serde_json::Value::as_bool) == Some(true) {
        flags |= ValueFlags::NOTIFY;
    }
    let range = match v.get("range") {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::Array(a)) if a.len() == 2 => {
            let lo = a[0].as_f64().ok_or_else(|| anyhow!("bad range lo"))?;
            let hi = a[1].as_f64().ok_or_else(|| anyhow!("bad range hi"))?;
            Some((f16_bits(lo), f16_bits(hi)))
        }
        Some(_) => bail!("range must be [lo, hi]"),
    };
    Ok(ValueDirective {
        oid: json_oid(v)?,
        flags: flags.bits(),
        auth: json_auth(v)?,
        value_bits: v
            .get("initial")
            .and_then(serde_json::Value::as_f64)
            .map(f16_bits)
            .unwrap_or(0),
        name: v
            .get("name")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string(),
        unit: v
            .get("unit")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string(),
        range,
    })
}

fn parse_cmd_directive(v: &serde_json::Value) -> Result<CommandDirective> {
    let mut flags = CommandFlags::empty();
    for (key, bit) in [
        ("secure", CommandFlags::SECURE),
        ("async", CommandFlags::ASYNC),
        ("persistent", CommandFlags::PERSISTENT),
        ("exclusive", CommandFlags::EXCLUSIVE),
    ] {
        if v.get(key).and_then(serde_json::Value::as_bool) == Some(true) {
            flags |= bit;
        }
    }
    let handler = v
        .get("handler")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string();
    Ok(CommandDirective {
        oid: json_oid(v)?,
        flags: flags.bits(),
        auth: json_auth(v)?,
        name: v
            .get("name")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(&handler)
            .to_string(),
        handler,
    })
}

fn parse_mailbox_directive(v: &serde_json::Value) -> Result<MailboxDirective> {
    let target = v
        .get("target")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| anyhow!("missing target"))?
        .to_string();
    let capacity = v
        .get("capacity")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| anyhow!("missing capacity"))? as u32;
    let mask_text = v
        .get("mode_mask")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("RDWR");
    let mut mask = ModeMask::empty();
    for part in mask_text.split('|') {
        mask |= match part.trim() {
            "RDONLY" => ModeMask::RDONLY,
            "WRONLY" => ModeMask::WRONLY,
            "RDWR" => ModeMask::RDWR,
            "FANOUT_DROP" => ModeMask::FANOUT_DROP,
            "FANOUT_BLOCK" => ModeMask::FANOUT_BLOCK,
            "TAP" => ModeMask::TAP,
            "STDIN" => ModeMask::STDIN,
            "STDOUT" => ModeMask::STDOUT,
            "STDERR" => ModeMask::STDERR,
            other => bail!("unknown mode flag {other:?}"),
        };
    }
    Ok(MailboxDirective { target, capacity, mode_mask: mask.bits() })
}
