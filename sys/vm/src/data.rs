// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Data-side paging: the task's data arena fronted by a small TLB with
//! write-back semantics.
//!
//! The arena is authoritative storage for the task's globals, heap, IPC
//! scratch area and stack. All VM and SVC accesses go through the TLB, so
//! dirty entries are always coherent with subsequent reads; the arena only
//! lags until write-back.
//!
//! Classes are assigned per region at load time: the stack and IPC arenas
//! are `Pinned` (wired entries, never evicted and not counted against TLB
//! capacity), the initialized-globals region is `Ro`, and the heap is
//! `Rw`. Class governs caching policy, not protection: a store to an `Ro`
//! page promotes that entry to `Rw` for its residency, which keeps mutable
//! globals working while sparing clean pages a write-back.
//!
//! Accesses that cross an entry boundary are split at the boundary; a
//! multi-byte store that straddles entries runs both halves inside one
//! critical section so the scheduler can never observe a torn write (the
//! executive only runs between `step()` calls, and the section is
//! accounted in the stats for visibility).

use hsx_abi::FaultKind;

/// Caching class of a TLB entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageClass {
    /// Wired at load time; never evicted.
    Pinned,
    /// Evictable without write-back while clean.
    Ro,
    /// Evictable with write-back when dirty.
    Rw,
}

/// Byte layout of a task's data space, in address order.
#[derive(Clone, Debug)]
pub struct DataLayout {
    pub globals_bytes: u32,
    pub heap_bytes: u32,
    pub ipc_bytes: u32,
    pub stack_bytes: u32,
}

impl DataLayout {
    pub fn total(&self) -> u32 {
        self.globals_bytes + self.heap_bytes + self.ipc_bytes + self.stack_bytes
    }
}

struct TlbEntry {
    base: u32,
    buf: Vec<u8>,
    class: PageClass,
    dirty: bool,
    stamp: u64,
}

impl TlbEntry {
    fn contains(&self, addr: u32) -> bool {
        addr >= self.base && addr - self.base < self.buf.len() as u32
    }

    fn end(&self) -> u32 {
        self.base + self.buf.len() as u32
    }
}

/// Counters exposed through the control plane.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TlbStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub write_backs: u64,
    pub split_accesses: u64,
    pub atomic_sections: u64,
}

/// A task's data space: arena plus TLB.
pub struct DataSpace {
    arena: Vec<u8>,
    layout: DataLayout,
    page_bytes: u32,
    capacity: usize,
    /// Evictable entries, at most `capacity` of them.
    tlb: Vec<TlbEntry>,
    /// Wired entries for the pinned regions; installed at construction.
    wired: Vec<TlbEntry>,
    clock: u64,
    pub stats: TlbStats,
}

impl DataSpace {
    /// Builds the data space. `globals` is the image's initialized data
    /// segment; bss is appended as zeroes and folded into the globals
    /// region.
    pub fn new(
        globals: &[u8],
        bss_bytes: u32,
        layout_rest: (u32, u32, u32), // heap, ipc, stack
        page_bytes: u32,
        tlb_entries: usize,
    ) -> Self {
        let (heap_bytes, ipc_bytes, stack_bytes) = layout_rest;
        let layout = DataLayout {
            globals_bytes: globals.len() as u32 + bss_bytes,
            heap_bytes,
            ipc_bytes,
            stack_bytes,
        };
        let mut arena = vec![0u8; layout.total() as usize];
        arena[..globals.len()].copy_from_slice(globals);

        let mut space = DataSpace {
            arena,
            layout,
            page_bytes,
            capacity: tlb_entries,
            tlb: Vec::with_capacity(tlb_entries),
            wired: Vec::new(),
            clock: 0,
            stats: TlbStats::default(),
        };

        // Wire the IPC and stack regions: one entry each, covering the
        // whole region.
        let ipc_base = space.layout.globals_bytes + space.layout.heap_bytes;
        space.wire(ipc_base, ipc_bytes);
        space.wire(ipc_base + ipc_bytes, stack_bytes);
        space
    }

    fn wire(&mut self, base: u32, len: u32) {
        if len == 0 {
            return;
        }
        let buf = self.arena[base as usize..(base + len) as usize].to_vec();
        self.wired.push(TlbEntry {
            base,
            buf,
            class: PageClass::Pinned,
            dirty: false,
            stamp: 0,
        });
    }

    pub fn len(&self) -> u32 {
        self.arena.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Lowest valid stack address.
    pub fn stack_base(&self) -> u32 {
        self.len() - self.layout.stack_bytes
    }

    /// One past the highest valid stack address.
    pub fn stack_limit(&self) -> u32 {
        self.len()
    }

    /// Base of the pinned IPC scratch region.
    pub fn ipc_base(&self) -> u32 {
        self.layout.globals_bytes + self.layout.heap_bytes
    }

    /// Class of the region containing `addr`, per the load-time layout.
    fn class_of(&self, addr: u32) -> PageClass {
        if addr < self.layout.globals_bytes {
            PageClass::Ro
        } else if addr < self.layout.globals_bytes + self.layout.heap_bytes {
            PageClass::Rw
        } else {
            PageClass::Pinned
        }
    }

    fn check_range(&self, addr: u32, len: u32) -> Result<(), FaultKind> {
        match addr.checked_add(len) {
            Some(end) if end <= self.len() => Ok(()),
            _ => Err(FaultKind::OutOfBounds { address: addr }),
        }
    }

    /// Finds or installs the entry containing `addr`, returning
    /// `(wired, index)`.
    fn lookup(&mut self, addr: u32) -> (bool, usize) {
        if let Some(i) = self.wired.iter().position(|e| e.contains(addr)) {
            self.stats.hits += 1;
            return (true, i);
        }
        if let Some(i) = self.tlb.iter().position(|e| e.contains(addr)) {
            self.stats.hits += 1;
            self.clock += 1;
            self.tlb[i].stamp = self.clock;
            return (false, i);
        }

        self.stats.misses += 1;
        let base = addr & !(self.page_bytes - 1);
        // Evictable pages never extend into the wired area, so an address
        // always resolves through exactly one entry.
        let limit = if base < self.ipc_base() {
            self.ipc_base()
        } else {
            self.len()
        };
        let end = (base + self.page_bytes).min(limit);
        let buf = self.arena[base as usize..end as usize].to_vec();
        self.clock += 1;
        let entry = TlbEntry {
            base,
            buf,
            class: self.class_of(addr),
            dirty: false,
            stamp: self.clock,
        };

        if self.tlb.len() < self.capacity {
            self.tlb.push(entry);
            (false, self.tlb.len() - 1)
        } else {
            let victim = self
                .tlb
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.stamp)
                .map(|(i, _)| i)
                .unwrap();
            self.evict(victim);
            self.tlb[victim] = entry;
            (false, victim)
        }
    }

    /// Writes a dirty victim back to the arena.
    fn evict(&mut self, victim: usize) {
        self.stats.evictions += 1;
        let e = &self.tlb[victim];
        if e.dirty {
            self.stats.write_backs += 1;
            let base = e.base as usize;
            self.arena[base..base + e.buf.len()].copy_from_slice(&e.buf);
        }
    }

    /// Writes every dirty entry back to the arena. Used at unload and by
    /// host-side memory inspection.
    pub fn flush(&mut self) {
        for e in self.tlb.iter_mut().chain(self.wired.iter_mut()) {
            if e.dirty {
                self.stats.write_backs += 1;
                let base = e.base as usize;
                self.arena[base..base + e.buf.len()].copy_from_slice(&e.buf);
                e.dirty = false;
            }
        }
    }

    /// Reads `out.len()` bytes starting at `addr`, splitting at entry
    /// boundaries as needed.
    pub fn read_bytes(&mut self, addr: u32, out: &mut [u8]) -> Result<(), FaultKind> {
        self.check_range(addr, out.len() as u32)?;
        let mut addr = addr;
        let mut out = out;
        let mut pieces = 0;
        while !out.is_empty() {
            let (wired, i) = self.lookup(addr);
            let e = if wired { &self.wired[i] } else { &self.tlb[i] };
            let off = (addr - e.base) as usize;
            let n = out.len().min((e.end() - addr) as usize);
            out[..n].copy_from_slice(&e.buf[off..off + n]);
            addr += n as u32;
            out = &mut out[n..];
            pieces += 1;
        }
        if pieces > 1 {
            self.stats.split_accesses += 1;
        }
        Ok(())
    }

    /// Writes `data` starting at `addr`, splitting at entry boundaries. A
    /// split multi-byte write runs under one critical section; see the
    /// module docs.
    pub fn write_bytes(&mut self, addr: u32, data: &[u8]) -> Result<(), FaultKind> {
        self.check_range(addr, data.len() as u32)?;
        let mut addr = addr;
        let mut data = data;
        let mut pieces = 0;
        while !data.is_empty() {
            let (wired, i) = self.lookup(addr);
            let e = if wired {
                &mut self.wired[i]
            } else {
                &mut self.tlb[i]
            };
            let off = (addr - e.base) as usize;
            let n = data.len().min((e.end() - addr) as usize);
            e.buf[off..off + n].copy_from_slice(&data[..n]);
            e.dirty = true;
            if e.class == PageClass::Ro {
                // Mutable global: keep write-back on this entry's eviction.
                e.class = PageClass::Rw;
            }
            addr += n as u32;
            data = &data[n..];
            pieces += 1;
        }
        if pieces > 1 {
            self.stats.split_accesses += 1;
            self.stats.atomic_sections += 1;
        }
        Ok(())
    }

    /// Aligned word load.
    pub fn read_u32(&mut self, addr: u32) -> Result<u32, FaultKind> {
        if addr % 4 != 0 {
            return Err(FaultKind::UnalignedAccess { address: addr });
        }
        let mut b = [0u8; 4];
        self.read_bytes(addr, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    /// Aligned word store.
    pub fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), FaultKind> {
        if addr % 4 != 0 {
            return Err(FaultKind::UnalignedAccess { address: addr });
        }
        self.write_bytes(addr, &value.to_le_bytes())
    }

    pub fn read_u8(&mut self, addr: u32) -> Result<u8, FaultKind> {
        let mut b = [0u8; 1];
        self.read_bytes(addr, &mut b)?;
        Ok(b[0])
    }

    pub fn write_u8(&mut self, addr: u32, value: u8) -> Result<(), FaultKind> {
        self.write_bytes(addr, &[value])
    }
}
