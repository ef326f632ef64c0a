// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Log-structured key-value persistence over a FRAM-style byte region.
//!
//! Records are `{key u16, length u16, payload, crc16}` appended in write
//! order; the latest record for a key wins. Mounting scans the log until
//! it hits erased space or a CRC-invalid (torn) record -- everything
//! after a bad CRC is treated as free, which is the roll-back behavior:
//! a power cut mid-write costs exactly the interrupted record.
//!
//! Compaction rewrites only the live (latest-per-key) records to the
//! front of the region and runs automatically when an append does not
//! fit.

use std::collections::BTreeMap;

use crc::Crc;
use hsx_abi::Code;
use hsx_hal::FramDriver;

/// CRC-16 used for record trailers.
pub const CRC16: Crc<u16> = Crc::<u16>::new(&crc::CRC_16_IBM_SDLC);

const HEADER_LEN: usize = 4;
const CRC_LEN: usize = 2;

/// The key/length pattern of never-written (erased) FRAM.
const ERASED: u16 = 0xFFFF;

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum PersistError {
    #[error("record does not fit even after compaction")]
    Full,
    #[error("payload too large for the record format")]
    TooBig,
    #[error("backing store error: {0:?}")]
    Backend(Code),
}

impl From<Code> for PersistError {
    fn from(c: Code) -> Self {
        PersistError::Backend(c)
    }
}

/// A mounted persistence log.
pub struct PersistLog<D> {
    driver: D,
    /// Offset of the first free byte.
    head: usize,
    /// Latest record per key: `key -> (payload_offset, payload_len)`.
    index: BTreeMap<u16, (usize, usize)>,
    /// Bytes consumed by superseded records; drives compaction worth.
    dead_bytes: usize,
}

impl<D: FramDriver> PersistLog<D> {
    /// Scans the region and builds the key index. Never fails on content:
    /// a torn tail is rolled back by treating it as free space.
    pub fn mount(driver: D) -> Result<Self, PersistError> {
        let mut log = PersistLog {
            head: 0,
            index: BTreeMap::new(),
            dead_bytes: 0,
            driver,
        };
        log.scan()?;
        Ok(log)
    }

    fn scan(&mut self) -> Result<(), PersistError> {
        let mut at = 0;
        let region = self.driver.len();
        self.index.clear();
        self.dead_bytes = 0;
        loop {
            if at + HEADER_LEN + CRC_LEN > region {
                break;
            }
            let mut header = [0u8; HEADER_LEN];
            self.driver.read(at, &mut header)?;
            let key = u16::from_le_bytes([header[0], header[1]]);
            let len = u16::from_le_bytes([header[2], header[3]]) as usize;
            if key == ERASED && len == ERASED as usize {
                break;
            }
            let total = HEADER_LEN + len + CRC_LEN;
            if at + total > region {
                break;
            }
            let mut body = vec![0u8; HEADER_LEN + len];
            self.driver.read(at, &mut body)?;
            let mut crc_bytes = [0u8; CRC_LEN];
            self.driver.read(at + HEADER_LEN + len, &mut crc_bytes)?;
            if CRC16.checksum(&body) != u16::from_le_bytes(crc_bytes) {
                // Torn record: roll back to the last good state.
                break;
            }
            if let Some((_, old_len)) = self.index.insert(key, (at + HEADER_LEN, len)) {
                self.dead_bytes += HEADER_LEN + old_len + CRC_LEN;
            }
            at += total;
        }
        self.head = at;
        Ok(())
    }

    /// Bytes of free space remaining.
    pub fn free(&self) -> usize {
        self.driver.len() - self.head
    }

    /// Appends one record, compacting first if it would not fit.
    pub fn append(&mut self, key: u16, payload: &[u8]) -> Result<(), PersistError> {
        if payload.len() > u16::MAX as usize - 1 || key == ERASED {
            return Err(PersistError::TooBig);
        }
        let total = HEADER_LEN + payload.len() + CRC_LEN;
        if total > self.free() {
            self.compact()?;
            if total > self.free() {
                return Err(PersistError::Full);
            }
        }

        let mut record = Vec::with_capacity(total);
        record.extend_from_slice(&key.to_le_bytes());
        record.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        record.extend_from_slice(payload);
        let crc = CRC16.checksum(&record);
        record.extend_from_slice(&crc.to_le_bytes());

        self.driver.write(self.head, &record)?;
        if let Some((_, old_len)) = self
            .index
            .insert(key, (self.head + HEADER_LEN, payload.len()))
        {
            self.dead_bytes += HEADER_LEN + old_len + CRC_LEN;
        }
        self.head += total;
        Ok(())
    }

    /// Reads the latest payload for `key`.
    pub fn get(&self, key: u16) -> Result<Option<Vec<u8>>, PersistError> {
        let Some(&(off, len)) = self.index.get(&key) else {
            return Ok(None);
        };
        let mut buf = vec![0u8; len];
        self.driver.read(off, &mut buf)?;
        Ok(Some(buf))
    }

    /// Latest record per key in ascending key order, for boot-time
    /// replay into the registry.
    pub fn replay(&self) -> Result<Vec<(u16, Vec<u8>)>, PersistError> {
        let mut out = Vec::with_capacity(self.index.len());
        for (&key, &(off, len)) in &self.index {
            let mut buf = vec![0u8; len];
            self.driver.read(off, &mut buf)?;
            out.push((key, buf));
        }
        Ok(out)
    }

    /// Rewrites live records to the front of the region, eliding
    /// superseded ones.
    pub fn compact(&mut self) -> Result<(), PersistError> {
        let live = self.replay()?;
        let mut at = 0;
        let mut new_index = BTreeMap::new();
        for (key, payload) in &live {
            let mut record = Vec::with_capacity(HEADER_LEN + payload.len() + CRC_LEN);
            record.extend_from_slice(&key.to_le_bytes());
            record.extend_from_slice(&(payload.len() as u16).to_le_bytes());
            record.extend_from_slice(payload);
            let crc = CRC16.checksum(&record);
            record.extend_from_slice(&crc.to_le_bytes());
            self.driver.write(at, &record)?;
            new_index.insert(*key, (at + HEADER_LEN, payload.len()));
            at += record.len();
        }
        // Re-erase the word after the log so a future mount stops here.
        if at + HEADER_LEN <= self.driver.len() {
            self.driver.write(at, &[0xFF; HEADER_LEN])?;
        }
        self.head = at;
        self.index = new_index;
        self.dead_bytes = 0;
        Ok(())
    }

    /// Fraction of the log occupied by superseded records, 0-100. The
    /// executive compacts opportunistically past a threshold.
    pub fn dead_percent(&self) -> usize {
        if self.driver.len() == 0 {
            return 0;
        }
        self.dead_bytes * 100 / self.driver.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hsx_hal::MemFram;

    #[test]
    fn append_get_replay_round_trip() {
        let mut log = PersistLog::mount(MemFram::new(256)).unwrap();
        log.append(0xF003, &[0x00, 0x41]).unwrap();
        log.append(0x0101, &[0x00, 0x3C]).unwrap();
        assert_eq!(log.get(0xF003).unwrap(), Some(vec![0x00, 0x41]));
        assert_eq!(
            log.replay().unwrap(),
            vec![
                (0x0101, vec![0x00, 0x3C]),
                (0xF003, vec![0x00, 0x41]),
            ]
        );
    }

    #[test]
    fn latest_record_wins_across_remount() {
        let mut log = PersistLog::mount(MemFram::new(256)).unwrap();
        log.append(7, b"old").unwrap();
        log.append(7, b"new").unwrap();
        assert_eq!(log.get(7).unwrap(), Some(b"new".to_vec()));

        // Simulate a reboot by remounting the same backing bytes.
        let log = PersistLog::mount(log.driver).unwrap();
        assert_eq!(log.get(7).unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn torn_record_is_rolled_back() {
        let mut log = PersistLog::mount(MemFram::new(256)).unwrap();
        log.append(1, b"good").unwrap();
        let head = log.head;
        log.append(2, b"torn").unwrap();
        // Corrupt the second record's CRC in place.
        let crc_at = head + HEADER_LEN + 4;
        log.driver.write(crc_at, &[0x00, 0x00]).unwrap();

        let log = PersistLog::mount(log.driver).unwrap();
        assert_eq!(log.get(1).unwrap(), Some(b"good".to_vec()));
        assert_eq!(log.get(2).unwrap(), None, "torn record must be dropped");
        assert_eq!(log.head, head, "free space must resume before the torn record");
    }

    #[test]
    fn compaction_elides_superseded_records() {
        let mut log = PersistLog::mount(MemFram::new(128)).unwrap();
        for i in 0..8u16 {
            log.append(1, &[i as u8; 4]).unwrap();
        }
        assert!(log.dead_percent() > 0);
        log.compact().unwrap();
        assert_eq!(log.dead_percent(), 0);
        assert_eq!(log.get(1).unwrap(), Some(vec![7; 4]));

        // A remount after compaction sees exactly the live set.
        let log = PersistLog::mount(log.driver).unwrap();
        assert_eq!(log.replay().unwrap(), vec![(1, vec![7; 4])]);
    }

    #[test]
    fn append_compacts_automatically_when_full() {
        // Region fits ~4 records; repeated same-key appends must keep
        // succeeding thanks to auto-compaction.
        let mut log = PersistLog::mount(MemFram::new(64)).unwrap();
        for i in 0..32u8 {
            log.append(9, &[i; 6]).unwrap();
        }
        assert_eq!(log.get(9).unwrap(), Some(vec![31; 6]));
    }

    #[test]
    fn unrelated_keys_survive_compaction_pressure() {
        let mut log = PersistLog::mount(MemFram::new(96)).unwrap();
        log.append(1, b"keep-me").unwrap();
        for i in 0..16u8 {
            log.append(2, &[i; 5]).unwrap();
        }
        assert_eq!(log.get(1).unwrap(), Some(b"keep-me".to_vec()));
        assert_eq!(log.get(2).unwrap(), Some(vec![15; 5]));
    }
}
