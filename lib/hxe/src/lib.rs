// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HXE image container: parsing, validation, and (for the linker) writing.
//!
//! The byte-exact layout is:
//!
//! ```text
//! 0x00  header (0x40 bytes, see `hsx_abi::HxeHeader`)
//! 0x40  code segment
//! ...   data segment
//! ...   section table (meta_count entries of 12 bytes)
//! ...   metadata payloads
//! last  CRC-32 over all preceding bytes
//! ```
//!
//! Version 1 images end after the data segment (plus CRC) and carry no
//! section table; they load for compatibility. Unknown section types are
//! preserved so a v2 image can be rewritten without losing sections this
//! build does not understand.

mod meta;

pub use meta::{DeclaredCommand, DeclaredMailbox, DeclaredValue};

use crc::Crc;
use hsx_abi::{
    HxeHeader, SectionEntry, SectionType, HXE_FLAG_ALLOW_MULTIPLE, HXE_MAGIC,
    HXE_VERSION_1, HXE_VERSION_2,
};
use zerocopy::{FromBytes, IntoBytes};

/// The CRC-32 used for image trailers (and by the toolchain when
/// emitting them).
pub const CRC32: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

const HEADER_LEN: usize = core::mem::size_of::<HxeHeader>();
const SECTION_ENTRY_LEN: usize = core::mem::size_of::<SectionEntry>();
const CRC_LEN: usize = 4;

/// Load-time failures, in the order the checks run.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ImageError {
    #[error("bad magic: not an HXE image")]
    BadMagic,
    #[error("unsupported image version {0:#06x}")]
    VersionUnsupported(u16),
    #[error("CRC mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    CrcMismatch { stored: u32, computed: u32 },
    #[error("image truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("metadata sections overlap or escape the image")]
    SectionOverlap,
    #[error("metadata invalid: {0}")]
    MetadataInvalid(&'static str),
}

/// A metadata section whose type this build does not interpret. Carried
/// through verbatim.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RawSection {
    pub section_type: u32,
    pub payload: Vec<u8>,
}

/// A fully parsed HXE image.
#[derive(Clone, Debug, Default)]
pub struct Image {
    pub version: u16,
    pub allow_multiple_instances: bool,
    pub entry_pc: u32,
    pub app_name: String,
    pub code: Vec<u8>,
    pub data: Vec<u8>,
    pub bss_size: u32,
    pub values: Vec<DeclaredValue>,
    pub commands: Vec<DeclaredCommand>,
    pub mailboxes: Vec<DeclaredMailbox>,
    /// DEBUG_INFO payloads, opaque at load time; the symbol pipeline
    /// consumes them offline.
    pub debug_info: Vec<Vec<u8>>,
    /// Sections of unknown type, preserved for forward compatibility.
    pub unknown_sections: Vec<RawSection>,
}

impl Image {
    /// Parses and validates an image.
    ///
    /// Check order matches the error taxonomy: magic, version, CRC,
    /// geometry, metadata. A corrupt image fails closed -- no partially
    /// parsed result is ever returned.
    pub fn parse(bytes: &[u8]) -> Result<Image, ImageError> {
        if bytes.len() < HEADER_LEN + CRC_LEN {
            return Err(ImageError::Truncated {
                need: HEADER_LEN + CRC_LEN,
                have: bytes.len(),
            });
        }
        let header = HxeHeader::read_from_bytes(&bytes[..HEADER_LEN])
            .expect("header length checked above");

        if header.magic != HXE_MAGIC {
            return Err(ImageError::BadMagic);
        }
        if header.version != HXE_VERSION_1 && header.version != HXE_VERSION_2 {
            return Err(ImageError::VersionUnsupported(header.version));
        }

        let body_len = bytes.len() - CRC_LEN;
        let stored = u32::from_le_bytes(bytes[body_len..].try_into().unwrap());
        let computed = CRC32.checksum(&bytes[..body_len]);
        if stored != computed {
            return Err(ImageError::CrcMismatch { stored, computed });
        }

        let code_end = HEADER_LEN
            .checked_add(header.code_size as usize)
            .ok_or(ImageError::SectionOverlap)?;
        let data_end = code_end
            .checked_add(header.data_size as usize)
            .ok_or(ImageError::SectionOverlap)?;
        if data_end > body_len {
            return Err(ImageError::Truncated { need: data_end + CRC_LEN, have: bytes.len() });
        }

        let mut image = Image {
            version: header.version,
            allow_multiple_instances: header.flags & HXE_FLAG_ALLOW_MULTIPLE != 0,
            entry_pc: header.entry_pc,
            app_name: decode_app_name(&header.app_name),
            code: bytes[HEADER_LEN..code_end].to_vec(),
            data: bytes[code_end..data_end].to_vec(),
            bss_size: header.bss_size,
            ..Image::default()
        };

        if header.version == HXE_VERSION_1 {
            // v1 predates the section table; nothing more to read.
            return Ok(image);
        }

        let table_start = header.meta_offset as usize;
        let count = header.meta_count as usize;
        let table_end = table_start
            .checked_add(count * SECTION_ENTRY_LEN)
            .ok_or(ImageError::SectionOverlap)?;
        if count > 0 && (table_start < data_end || table_end > body_len) {
            return Err(ImageError::SectionOverlap);
        }

        // Collect entries first so overlap checking can see all of them.
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let off = table_start + i * SECTION_ENTRY_LEN;
            let entry =
                SectionEntry::read_from_bytes(&bytes[off..off + SECTION_ENTRY_LEN])
                    .expect("entry bounds checked above");
            let s = entry.offset as usize;
            let e = s
                .checked_add(entry.length as usize)
                .ok_or(ImageError::SectionOverlap)?;
            // Payloads live strictly between the section table and the CRC.
            if s < table_end || e > body_len {
                return Err(ImageError::SectionOverlap);
            }
            entries.push((entry, s, e));
        }
        let mut spans: Vec<(usize, usize)> =
            entries.iter().map(|&(_, s, e)| (s, e)).collect();
        spans.sort_unstable();
        for w in spans.windows(2) {
            if w[1].0 < w[0].1 {
                return Err(ImageError::SectionOverlap);
            }
        }

        for (entry, s, e) in &entries {
            let payload = &bytes[*s..*e];
            match SectionType::try_from(entry.section_type) {
                Ok(SectionType::Value) => {
                    image.values = meta::decode_values(payload)?;
                }
                Ok(SectionType::Command) => {
                    image.commands = meta::decode_commands(payload)?;
                }
                Ok(SectionType::Mailbox) => {
                    image.mailboxes = meta::decode_mailboxes(payload)?;
                }
                Ok(SectionType::DebugInfo) => {
                    image.debug_info.push(payload.to_vec());
                }
                Err(()) => image.unknown_sections.push(RawSection {
                    section_type: entry.section_type,
                    payload: payload.to_vec(),
                }),
            }
        }

        Ok(image)
    }

    /// Serialises this image as HXE v2 with a fresh CRC trailer.
    ///
    /// The output is deterministic: section order is VALUE, COMMAND,
    /// MAILBOX, DEBUG_INFO, then unknown sections in their preserved
    /// order, and empty sections are omitted.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut sections: Vec<(u32, Vec<u8>)> = Vec::new();
        if !self.values.is_empty() {
            sections.push((SectionType::Value as u32, meta::encode_values(&self.values)));
        }
        if !self.commands.is_empty() {
            sections
                .push((SectionType::Command as u32, meta::encode_commands(&self.commands)));
        }
        if !self.mailboxes.is_empty() {
            sections
                .push((SectionType::Mailbox as u32, meta::encode_mailboxes(&self.mailboxes)));
        }
        for dbg in &self.debug_info {
            sections.push((SectionType::DebugInfo as u32, dbg.clone()));
        }
        for raw in &self.unknown_sections {
            sections.push((raw.section_type, raw.payload.clone()));
        }

        let meta_offset = (HEADER_LEN + self.code.len() + self.data.len()) as u32;
        let table_len = sections.len() * SECTION_ENTRY_LEN;

        let header = HxeHeader {
            magic: HXE_MAGIC,
            version: HXE_VERSION_2,
            flags: if self.allow_multiple_instances {
                HXE_FLAG_ALLOW_MULTIPLE
            } else {
                0
            },
            entry_pc: self.entry_pc,
            code_size: self.code.len() as u32,
            data_size: self.data.len() as u32,
            bss_size: self.bss_size,
            meta_offset,
            meta_count: sections.len() as u32,
            app_name: encode_app_name(&self.app_name),
        };

        let mut out = Vec::new();
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.code);
        out.extend_from_slice(&self.data);

        let mut payload_off = meta_offset as usize + table_len;
        for (stype, payload) in &sections {
            let entry = SectionEntry {
                section_type: *stype,
                offset: payload_off as u32,
                length: payload.len() as u32,
            };
            out.extend_from_slice(entry.as_bytes());
            payload_off += payload.len();
        }
        for (_, payload) in &sections {
            out.extend_from_slice(payload);
        }

        let crc = CRC32.checksum(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        out
    }
}

fn decode_app_name(raw: &[u8; 32]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn encode_app_name(name: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    let bytes = name.as_bytes();
    let n = bytes.len().min(31);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use hsx_abi::{AuthLevel, ModeMask, Oid, ValueFlags};

    fn sample_image() -> Image {
        Image {
            version: HXE_VERSION_2,
            allow_multiple_instances: false,
            entry_pc: 0x0100,
            app_name: "blinky".into(),
            code: vec![0xAA; 0x140],
            data: vec![0x55; 0x20],
            bss_size: 0x40,
            values: vec![DeclaredValue {
                oid: Oid(0xF003),
                flags: ValueFlags::NOTIFY,
                auth: AuthLevel::User,
                value_bits: 0,
                name: "temp.ambient".into(),
                unit: "degC".into(),
                range: Some((0x0000, 0x4D00)),
            }],
            commands: vec![DeclaredCommand {
                oid: Oid(0xF010),
                flags: hsx_abi::CommandFlags::SECURE,
                auth: AuthLevel::Admin,
                handler_address: 0x0120,
                name: "sys.reset".into(),
            }],
            mailboxes: vec![DeclaredMailbox {
                name: "shared:log".into(),
                capacity: 128,
                mode_mask: ModeMask::RDWR | ModeMask::FANOUT_DROP,
            }],
            debug_info: vec![],
            unknown_sections: vec![],
        }
    }

    #[test]
    fn write_then_parse_round_trips() {
        let img = sample_image();
        let bytes = img.to_bytes();
        let back = Image::parse(&bytes).expect("fresh image must parse");
        assert_eq!(back.entry_pc, img.entry_pc);
        assert_eq!(back.app_name, img.app_name);
        assert_eq!(back.code, img.code);
        assert_eq!(back.data, img.data);
        assert_eq!(back.bss_size, img.bss_size);
        assert_eq!(back.values, img.values);
        assert_eq!(back.commands, img.commands);
        assert_eq!(back.mailboxes, img.mailboxes);
    }

    #[test]
    fn single_byte_corruption_is_a_crc_mismatch() {
        let mut bytes = sample_image().to_bytes();
        // Flip a byte in the middle of the code segment; magic and
        // version stay intact so the CRC check is what trips.
        bytes[0x80] ^= 0x01;
        match Image::parse(&bytes) {
            Err(ImageError::CrcMismatch { .. }) => {}
            other => panic!("expected CrcMismatch, got {other:?}"),
        }
    }

    #[test]
    fn bad_magic_is_reported_before_crc() {
        let mut bytes = sample_image().to_bytes();
        bytes[0] = b'X';
        match Image::parse(&bytes) {
            Err(ImageError::BadMagic) => {}
            other => panic!("expected BadMagic, got {other:?}"),
        }
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut bytes = sample_image().to_bytes();
        bytes[4] = 0x09; // version low byte
        let body = bytes.len() - 4;
        let crc = CRC32.checksum(&bytes[..body]).to_le_bytes();
        bytes[body..].copy_from_slice(&crc);
        match Image::parse(&bytes) {
            Err(ImageError::VersionUnsupported(0x0009)) => {}
            other => panic!("expected VersionUnsupported, got {other:?}"),
        }
    }

    #[test]
    fn overlapping_sections_are_rejected() {
        let img = sample_image();
        let mut bytes = img.to_bytes();
        // Point the second section entry's offset into the first's span.
        let table = HEADER_LEN + img.code.len() + img.data.len();
        let second_off = table + SECTION_ENTRY_LEN + 4;
        let first_payload = (table + 3 * SECTION_ENTRY_LEN) as u32;
        bytes[second_off..second_off + 4].copy_from_slice(&first_payload.to_le_bytes());
        let body = bytes.len() - 4;
        let crc = CRC32.checksum(&bytes[..body]).to_le_bytes();
        bytes[body..].copy_from_slice(&crc);
        match Image::parse(&bytes) {
            Err(ImageError::SectionOverlap) => {}
            other => panic!("expected SectionOverlap, got {other:?}"),
        }
    }

    #[test]
    fn unknown_section_types_are_preserved() {
        let mut img = sample_image();
        img.unknown_sections.push(RawSection {
            section_type: 0x77,
            payload: vec![1, 2, 3],
        });
        let back = Image::parse(&img.to_bytes()).unwrap();
        assert_eq!(back.unknown_sections, img.unknown_sections);
        let rewritten = Image::parse(&back.to_bytes()).unwrap();
        assert_eq!(rewritten.unknown_sections, img.unknown_sections);
    }

    #[test]
    fn v1_image_without_section_table_loads() {
        let img = sample_image();
        let mut out = Vec::new();
        let header = HxeHeader {
            magic: HXE_MAGIC,
            version: HXE_VERSION_1,
            flags: 0,
            entry_pc: img.entry_pc,
            code_size: img.code.len() as u32,
            data_size: img.data.len() as u32,
            bss_size: img.bss_size,
            meta_offset: 0,
            meta_count: 0,
            app_name: encode_app_name(&img.app_name),
        };
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&img.code);
        out.extend_from_slice(&img.data);
        let crc = CRC32.checksum(&out);
        out.extend_from_slice(&crc.to_le_bytes());

        let back = Image::parse(&out).expect("v1 image must load");
        assert_eq!(back.version, HXE_VERSION_1);
        assert_eq!(back.code, img.code);
        assert!(back.values.is_empty());
    }

    #[test]
    fn truncated_image_is_rejected() {
        let bytes = sample_image().to_bytes();
        match Image::parse(&bytes[..HEADER_LEN - 1]) {
            Err(ImageError::Truncated { .. }) => {}
            other => panic!("expected Truncated, got {other:?}"),
        }
    }

    #[test]
    fn identical_inputs_produce_identical_bytes() {
        assert_eq!(sample_image().to_bytes(), sample_image().to_bytes());
    }
}
