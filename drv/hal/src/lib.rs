// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Backend traits for the SVC driver modules.
//!
//! Each hardware-facing SVC module is specified only by the small trait
//! its handlers call; the executive composes a concrete set at startup.
//! The in-memory implementations here back the test suite and the
//! host-class CLI -- real deployments supply their own.

use std::collections::BTreeMap;

use hsx_abi::Code;

/// Byte sink for console output (`TASK/STDIO` module).
pub trait ConsoleDriver {
    fn write(&mut self, bytes: &[u8]) -> Result<usize, Code>;
}

/// CAN frame transmitter (`CAN` module). Frames carry an 11-bit id and up
/// to 8 data bytes.
pub trait CanDriver {
    fn transmit(&mut self, id: u16, data: &[u8]) -> Result<(), Code>;
}

/// Byte-addressable non-volatile region (`FRAM` module and the
/// persistence log).
pub trait FramDriver {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), Code>;
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), Code>;
}

// The persistence log is generic over its backend, and the executive
// composes backends as boxed trait objects.
impl<T: FramDriver + ?Sized> FramDriver for Box<T> {
    fn len(&self) -> usize {
        (**self).len()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), Code> {
        (**self).read(offset, buf)
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), Code> {
        (**self).write(offset, data)
    }
}

/// Minimal flat-namespace filesystem (`FS` module).
pub trait FsDriver {
    fn open(&mut self, path: &str, create: bool) -> Result<u32, Code>;
    fn read(&mut self, fd: u32, offset: usize, buf: &mut [u8]) -> Result<usize, Code>;
    fn write(&mut self, fd: u32, offset: usize, data: &[u8]) -> Result<usize, Code>;
    fn close(&mut self, fd: u32) -> Result<(), Code>;
    fn list(&self) -> Vec<String>;
    fn delete(&mut self, path: &str) -> Result<(), Code>;
    fn rename(&mut self, from: &str, to: &str) -> Result<(), Code>;
}

/// Console backend that accumulates output in memory, for tests and the
/// CLI's `--capture` mode.
#[derive(Default)]
pub struct MemConsole {
    pub output: Vec<u8>,
}

impl ConsoleDriver for MemConsole {
    fn write(&mut self, bytes: &[u8]) -> Result<usize, Code> {
        self.output.extend_from_slice(bytes);
        Ok(bytes.len())
    }
}

/// Console backend that forwards to the host's stdout.
#[derive(Default)]
pub struct StdoutConsole;

impl ConsoleDriver for StdoutConsole {
    fn write(&mut self, bytes: &[u8]) -> Result<usize, Code> {
        use std::io::Write;
        std::io::stdout()
            .write_all(bytes)
            .map_err(|_| Code::Io)?;
        Ok(bytes.len())
    }
}

/// CAN backend that records transmitted frames.
#[derive(Default)]
pub struct MemCan {
    pub frames: Vec<(u16, Vec<u8>)>,
}

impl CanDriver for MemCan {
    fn transmit(&mut self, id: u16, data: &[u8]) -> Result<(), Code> {
        if data.len() > 8 {
            return Err(Code::Inval);
        }
        self.frames.push((id, data.to_vec()));
        Ok(())
    }
}

/// FRAM backend over a host byte vector, initialized to the erased
/// pattern.
pub struct MemFram {
    bytes: Vec<u8>,
}

impl MemFram {
    pub fn new(len: usize) -> Self {
        MemFram { bytes: vec![0xFF; len] }
    }
}

impl FramDriver for MemFram {
    fn len(&self) -> usize {
        self.bytes.len()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), Code> {
        let end = offset.checked_add(buf.len()).ok_or(Code::Inval)?;
        if end > self.bytes.len() {
            return Err(Code::Inval);
        }
        buf.copy_from_slice(&self.bytes[offset..end]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), Code> {
        let end = offset.checked_add(data.len()).ok_or(Code::Inval)?;
        if end > self.bytes.len() {
            return Err(Code::Inval);
        }
        self.bytes[offset..end].copy_from_slice(data);
        Ok(())
    }
}

/// Flat in-memory filesystem.
#[derive(Default)]
pub struct MemFs {
    files: BTreeMap<String, Vec<u8>>,
    open: BTreeMap<u32, String>,
    next_fd: u32,
}

impl FsDriver for MemFs {
    fn open(&mut self, path: &str, create: bool) -> Result<u32, Code> {
        if !self.files.contains_key(path) {
            if !create {
                return Err(Code::NoEnt);
            }
            self.files.insert(path.to_string(), Vec::new());
        }
        let fd = self.next_fd;
        self.next_fd += 1;
        self.open.insert(fd, path.to_string());
        Ok(fd)
    }

    fn read(&mut self, fd: u32, offset: usize, buf: &mut [u8]) -> Result<usize, Code> {
        let path = self.open.get(&fd).ok_or(Code::BadF)?;
        let data = self.files.get(path).ok_or(Code::NoEnt)?;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write(&mut self, fd: u32, offset: usize, data: &[u8]) -> Result<usize, Code> {
        let path = self.open.get(&fd).ok_or(Code::BadF)?.clone();
        let file = self.files.get_mut(&path).ok_or(Code::NoEnt)?;
        if file.len() < offset + data.len() {
            file.resize(offset + data.len(), 0);
        }
        file[offset..offset + data.len()].copy_from_slice(data);
        Ok(data.len())
    }

    fn close(&mut self, fd: u32) -> Result<(), Code> {
        self.open.remove(&fd).map(|_| ()).ok_or(Code::BadF)
    }

    fn list(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }

    fn delete(&mut self, path: &str) -> Result<(), Code> {
        self.files.remove(path).map(|_| ()).ok_or(Code::NoEnt)
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), Code> {
        let data = self.files.remove(from).ok_or(Code::NoEnt)?;
        self.files.insert(to.to_string(), data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_fs_basic_lifecycle() {
        let mut fs = MemFs::default();
        assert_eq!(fs.open("a.txt", false), Err(Code::NoEnt));
        let fd = fs.open("a.txt", true).unwrap();
        fs.write(fd, 0, b"hello").unwrap();
        let mut buf = [0u8; 8];
        let n = fs.read(fd, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        fs.close(fd).unwrap();
        assert_eq!(fs.read(fd, 0, &mut buf), Err(Code::BadF));
        fs.rename("a.txt", "b.txt").unwrap();
        assert_eq!(fs.list(), vec!["b.txt".to_string()]);
        fs.delete("b.txt").unwrap();
        assert!(fs.list().is_empty());
    }

    #[test]
    fn mem_fram_bounds_are_enforced() {
        let mut fram = MemFram::new(16);
        assert_eq!(fram.write(12, &[0; 8]), Err(Code::Inval));
        fram.write(8, &[1; 8]).unwrap();
        let mut buf = [0u8; 8];
        fram.read(8, &mut buf).unwrap();
        assert_eq!(buf, [1; 8]);
    }

    #[test]
    fn mem_can_rejects_oversize_frames() {
        let mut can = MemCan::default();
        assert_eq!(can.transmit(0x123, &[0; 9]), Err(Code::Inval));
        can.transmit(0x123, &[1, 2, 3]).unwrap();
        assert_eq!(can.frames.len(), 1);
    }
}
