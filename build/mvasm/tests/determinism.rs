// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Toolchain determinism: identical inputs and SOURCE_DATE_EPOCH must
//! yield bit-identical outputs, object and image alike.

use mvasm::link::{link, LinkOptions};
use mvasm::{asm, disassemble};
use pretty_assertions::assert_eq;

const PROGRAM: &str = r#"
    .entry main
    .value { "group": 240, "id": 3, "flags": "RO", "name": "temp.ambient", "unit": "degC" }
    .cmd { "group": 240, "id": 16, "handler": "do_reset", "secure": true, "auth": "admin" }
    .mailbox { "target": "shared:log", "capacity": 128, "mode_mask": "FANOUT_DROP|RDWR" }
main:
    ldi r2, #7
    ldi r3, #35
    add r1, r2, r3
    call #4, do_reset
    brk
do_reset:
    ldi r0, #0
    ret
    .data
greeting: .asciz "hsx"
    .bss 32
"#;

fn build() -> (Vec<u8>, String, String) {
    let hxo = asm::assemble(PROGRAM, "prog.s").expect("program assembles");
    let object_json = hxo.to_json();
    let (image, sym) = link(
        &[hxo],
        &LinkOptions {
            app_name: "determinism".into(),
            entry: None,
            allow_multiple_instances: false,
            source_date_epoch: 1_700_000_000,
        },
    )
    .expect("program links");
    (image.to_bytes(), sym.to_json(), object_json)
}

#[test]
fn rebuild_is_bit_identical() {
    let (image_a, sym_a, obj_a) = build();
    let (image_b, sym_b, obj_b) = build();
    assert_eq!(obj_a, obj_b, "HXO bytes must be deterministic");
    assert_eq!(image_a, image_b, "HXE bytes must be deterministic");
    assert_eq!(sym_a, sym_b, ".sym bytes must be deterministic");
}

#[test]
fn image_crc_trailer_validates() {
    let (bytes, _, _) = build();
    let body = bytes.len() - 4;
    let stored = u32::from_le_bytes(bytes[body..].try_into().unwrap());
    assert_eq!(stored, hsx_hxe::CRC32.checksum(&bytes[..body]));
    hsx_hxe::Image::parse(&bytes).expect("image must parse cleanly");
}

#[test]
fn metadata_survives_the_round_trip() {
    let (bytes, _, _) = build();
    let image = hsx_hxe::Image::parse(&bytes).unwrap();
    assert_eq!(image.values.len(), 1);
    assert_eq!(image.values[0].name, "temp.ambient");
    assert_eq!(image.commands.len(), 1);
    assert!(image.commands[0].handler_address > 0, "handler must be resolved");
    assert_eq!(image.mailboxes[0].name, "shared:log");
    assert_eq!(image.app_name, "determinism");
}

#[test]
fn disassembly_round_trips_through_the_shared_table() {
    let (bytes, _, _) = build();
    let image = hsx_hxe::Image::parse(&bytes).unwrap();
    let listing = disassemble(&image);
    // Every executable word decodes; nothing falls back to .word.
    assert!(!listing.contains(".word"), "listing was:\n{listing}");
    assert!(listing.contains("add r1, r2, r3"));
}

#[test]
fn sym_file_maps_lines_in_address_order() {
    let hxo = asm::assemble(PROGRAM, "prog.s").unwrap();
    let (_, sym) = link(
        &[hxo],
        &LinkOptions {
            app_name: "determinism".into(),
            entry: None,
            allow_multiple_instances: false,
            source_date_epoch: 0,
        },
    )
    .unwrap();
    assert!(sym.lines.windows(2).all(|w| w[0].addr <= w[1].addr));
    assert_eq!(sym.symbols["do_reset"], 20);
}
