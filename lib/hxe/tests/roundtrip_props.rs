// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Container properties: write/parse round trips for arbitrary images,
//! CRC trailer validity, and corruption detection for any single byte
//! flip.

use hsx_abi::{AuthLevel, CommandFlags, ModeMask, Oid, ValueFlags};
use hsx_hxe::{DeclaredCommand, DeclaredMailbox, DeclaredValue, Image, ImageError, CRC32};
use proptest::prelude::*;

fn name_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9._]{0,14}"
}

fn value_strategy() -> impl Strategy<Value = DeclaredValue> {
    (
        any::<u16>(),
        any::<u16>(),
        0u8..8,
        0u8..2,
        name_strategy(),
        name_strategy(),
        prop::option::of((any::<u16>(), any::<u16>())),
    )
        .prop_map(|(oid, bits, flags, auth, name, unit, range)| DeclaredValue {
            oid: Oid(oid),
            flags: ValueFlags::from_bits_truncate(flags),
            auth: AuthLevel::try_from(auth).unwrap(),
            value_bits: bits,
            name,
            unit,
            range,
        })
}

fn image_strategy() -> impl Strategy<Value = Image> {
    (
        prop::collection::vec(any::<u8>(), 0..512),
        prop::collection::vec(any::<u8>(), 0..128),
        any::<u32>(),
        0u32..1024,
        any::<bool>(),
        name_strategy(),
        prop::collection::vec(value_strategy(), 0..4),
        prop::collection::vec((any::<u16>(), any::<u32>(), 0u8..16, 0u8..2, name_strategy()), 0..3),
        prop::collection::vec((name_strategy(), any::<u32>(), 0u32..256), 0..3),
    )
        .prop_map(
            |(code, data, entry_pc, bss, multi, app, values, cmds, boxes)| {
                let mut seen = std::collections::BTreeSet::new();
                let values = values
                    .into_iter()
                    .filter(|v| seen.insert(v.oid))
                    .collect();
                Image {
                    entry_pc,
                    allow_multiple_instances: multi,
                    app_name: app,
                    code,
                    data,
                    bss_size: bss,
                    values,
                    commands: cmds
                        .into_iter()
                        .map(|(oid, addr, flags, auth, name)| DeclaredCommand {
                            oid: Oid(oid),
                            flags: CommandFlags::from_bits_truncate(flags),
                            auth: AuthLevel::try_from(auth).unwrap(),
                            handler_address: addr,
                            name,
                        })
                        .collect(),
                    mailboxes: boxes
                        .into_iter()
                        .map(|(name, mode, cap)| DeclaredMailbox {
                            name: format!("shared:{name}"),
                            capacity: cap,
                            mode_mask: ModeMask::from_bits_truncate(mode),
                        })
                        .collect(),
                    ..Image::default()
                }
            },
        )
}

proptest! {
    #[test]
    fn write_then_parse_is_identity(img in image_strategy()) {
        let bytes = img.to_bytes();
        let back = Image::parse(&bytes).expect("generated image must parse");
        prop_assert_eq!(back.entry_pc, img.entry_pc);
        prop_assert_eq!(back.app_name, img.app_name);
        prop_assert_eq!(back.code, img.code);
        prop_assert_eq!(back.data, img.data);
        prop_assert_eq!(back.bss_size, img.bss_size);
        prop_assert_eq!(back.values, img.values);
        prop_assert_eq!(back.commands, img.commands);
        prop_assert_eq!(back.mailboxes, img.mailboxes);
    }

    #[test]
    fn trailer_is_crc_of_preceding_bytes(img in image_strategy()) {
        let bytes = img.to_bytes();
        let body = bytes.len() - 4;
        let stored = u32::from_le_bytes(bytes[body..].try_into().unwrap());
        prop_assert_eq!(stored, CRC32.checksum(&bytes[..body]));
    }

    #[test]
    fn any_single_byte_flip_is_rejected(
        img in image_strategy(),
        at_seed: usize,
        flip in 1u8..=255,
    ) {
        let mut bytes = img.to_bytes();
        let at = at_seed % bytes.len();
        bytes[at] ^= flip;
        // Whatever byte was hit -- magic, header, payload, or the CRC
        // itself -- the loader must refuse the image.
        prop_assert!(
            Image::parse(&bytes).is_err(),
            "corruption at byte {} survived", at,
        );
    }
}
