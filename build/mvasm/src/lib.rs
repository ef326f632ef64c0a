// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The HSX toolchain: MVASM assembler, HXO linker, and disassembler.
//!
//! All three stages consume the shared opcode table from `hsx-isa`; the
//! image container comes from `hsx-hxe`. Nothing here is used at run
//! time -- the toolchain is offline, and its only contract with the
//! executive is the HXE format.

pub mod asm;
pub mod link;
pub mod obj;

use hsx_hxe::Image;

/// Disassembles an image's code segment into an MVASM listing.
pub fn disassemble(image: &Image) -> String {
    let mut out = String::new();
    let mut at = 0usize;
    while at + 4 <= image.code.len() {
        let word = u32::from_le_bytes(image.code[at..at + 4].try_into().unwrap());
        let text = match hsx_isa::decode(word) {
            Ok(i) => hsx_isa::format_instr(&i),
            Err(_) => format!(".word {word:#010x}"),
        };
        let marker = if at as u32 == image.entry_pc { ">" } else { " " };
        out.push_str(&format!("{marker}{at:#06x}: {text}\n"));
        at += 4;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disassembly_marks_the_entry_point() {
        let hxo = asm::assemble(".entry go\n nop\ngo:\n brk\n", "t.s").unwrap();
        let (image, _) = link::link(
            &[hxo],
            &link::LinkOptions {
                app_name: "t".into(),
                entry: None,
                allow_multiple_instances: false,
                source_date_epoch: 0,
            },
        )
        .unwrap();
        let listing = disassemble(&image);
        assert!(listing.contains(" 0x0000: nop"));
        assert!(listing.contains(">0x0004: brk"));
    }
}
