// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Code-side paging: a small, read-only, line-granular cache in front of
//! an opaque backing store.
//!
//! The backing store is whatever holds the task's code segment -- the
//! in-memory image during tests, flash or a file on a real deployment. The
//! VM only ever fetches through this cache, so the store sees line-sized
//! reads, never single words.
//!
//! Sequential decode near the end of a line issues a prefetch of the
//! successor line, which completes on the next sequential fetch; a far
//! jump discards the in-flight prefetch and starts a fresh demand fetch.
//! Eviction is LRU among resident lines.

use hsx_abi::FaultKind;

/// Backing store for a task's code segment.
pub trait CodeStore {
    /// Total number of code bytes.
    fn len(&self) -> u32;

    /// Reads `buf.len()` bytes starting at `offset`. The cache only issues
    /// reads it has already bounds-checked against `len()`, clamped at the
    /// tail line.
    fn read(&self, offset: u32, buf: &mut [u8]);
}

/// The common case: code held in host memory (loaded from an HXE image).
pub struct MemCodeStore(pub std::sync::Arc<[u8]>);

impl CodeStore for MemCodeStore {
    fn len(&self) -> u32 {
        self.0.len() as u32
    }

    fn read(&self, offset: u32, buf: &mut [u8]) {
        let off = offset as usize;
        buf.copy_from_slice(&self.0[off..off + buf.len()]);
    }
}

/// One cached code line.
struct Line {
    /// First code address covered by this line.
    base: u32,
    /// Line payload; shorter than the configured line size only for the
    /// final line of the segment.
    bytes: Vec<u8>,
    /// LRU stamp; larger is more recent.
    stamp: u64,
}

/// Counters exposed through the control plane's `traceRecords`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CodeCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub prefetches: u64,
    pub cancelled_prefetches: u64,
    pub evictions: u64,
}

/// Per-task code cache. Capacity and line size come from the VM config;
/// the defaults (2 lines of 256 bytes) match the micro-target budget.
pub struct CodeCache {
    store: Box<dyn CodeStore + Send>,
    line_bytes: u32,
    lines: Vec<Line>,
    capacity: usize,
    prefetch_enabled: bool,
    /// Base address of a prefetch that has been issued but not yet
    /// completed. It completes on the next sequential fetch; a far jump
    /// cancels it.
    pending_prefetch: Option<u32>,
    /// Address of the most recent fetch, for distinguishing sequential
    /// decode from a far jump.
    last_fetch: Option<u32>,
    clock: u64,
    pub stats: CodeCacheStats,
}

/// Fetch within this many bytes of a line end triggers prefetch of the
/// successor line.
const PREFETCH_MARGIN: u32 = 8;

impl CodeCache {
    pub fn new(
        store: Box<dyn CodeStore + Send>,
        line_bytes: u32,
        capacity: usize,
        prefetch_enabled: bool,
    ) -> Self {
        debug_assert!(line_bytes.is_power_of_two());
        debug_assert!(capacity >= 1);
        CodeCache {
            store,
            line_bytes,
            lines: Vec::with_capacity(capacity),
            capacity,
            prefetch_enabled,
            pending_prefetch: None,
            last_fetch: None,
            clock: 0,
            stats: CodeCacheStats::default(),
        }
    }

    pub fn code_len(&self) -> u32 {
        self.store.len()
    }

    /// Fetches the instruction word at `addr`.
    ///
    /// Word fetches never straddle lines because the line size is a
    /// power-of-two multiple of the word size.
    pub fn fetch_word(&mut self, addr: u32) -> Result<u32, FaultKind> {
        if addr % hsx_isa::WORD != 0 {
            return Err(FaultKind::UnalignedAccess { address: addr });
        }
        if addr.checked_add(hsx_isa::WORD).map_or(true, |end| end > self.store.len()) {
            return Err(FaultKind::OutOfBounds { address: addr });
        }

        let sequential = self
            .last_fetch
            .map_or(true, |last| addr >= last && addr - last <= self.line_bytes);
        self.last_fetch = Some(addr);

        // Resolve the in-flight prefetch: sequential decode completes it,
        // a far jump throws it away.
        if let Some(base) = self.pending_prefetch.take() {
            if sequential {
                if self.find(base).is_none() {
                    self.fill(base);
                }
            } else {
                self.stats.cancelled_prefetches += 1;
            }
        }

        let base = addr & !(self.line_bytes - 1);
        let idx = match self.find(base) {
            Some(idx) => {
                self.stats.hits += 1;
                idx
            }
            None => {
                self.stats.misses += 1;
                self.fill(base)
            }
        };

        self.clock += 1;
        self.lines[idx].stamp = self.clock;
        let off = (addr - base) as usize;
        let w = u32::from_le_bytes(
            self.lines[idx].bytes[off..off + 4].try_into().unwrap(),
        );

        // Sequential decode approaching the line boundary: issue a
        // prefetch so the boundary crossing hits.
        if self.prefetch_enabled && self.pending_prefetch.is_none() {
            let line_end = base + self.line_bytes;
            if line_end - addr <= PREFETCH_MARGIN
                && line_end < self.store.len()
                && self.find(line_end).is_none()
            {
                self.pending_prefetch = Some(line_end);
                self.stats.prefetches += 1;
            }
        }

        Ok(w)
    }

    fn find(&self, base: u32) -> Option<usize> {
        self.lines.iter().position(|l| l.base == base)
    }

    /// Loads the line at `base`, evicting the LRU line if the cache is
    /// full. Returns the index of the filled line.
    fn fill(&mut self, base: u32) -> usize {
        let len = self.line_bytes.min(self.store.len() - base);
        let mut bytes = vec![0u8; len as usize];
        self.store.read(base, &mut bytes);

        self.clock += 1;
        let line = Line { base, bytes, stamp: self.clock };

        if self.lines.len() < self.capacity {
            self.lines.push(line);
            self.lines.len() - 1
        } else {
            let victim = self
                .lines
                .iter()
                .enumerate()
                .min_by_key(|(_, l)| l.stamp)
                .map(|(i, _)| i)
                .unwrap();
            self.stats.evictions += 1;
            self.lines[victim] = line;
            victim
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn store(words: &[u32]) -> Box<dyn CodeStore + Send> {
        let mut bytes = Vec::new();
        for w in words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        Box::new(MemCodeStore(Arc::from(bytes.into_boxed_slice())))
    }

    fn seq_words(n: usize) -> Vec<u32> {
        (0..n as u32).collect()
    }

    #[test]
    fn sequential_fetch_hits_after_first_miss() {
        let mut c = CodeCache::new(store(&seq_words(64)), 64, 2, false);
        assert_eq!(c.fetch_word(0).unwrap(), 0);
        assert_eq!(c.stats.misses, 1);
        for i in 1..16 {
            assert_eq!(c.fetch_word(i * 4).unwrap(), i);
        }
        assert_eq!(c.stats.misses, 1, "all fetches within the line must hit");
    }

    #[test]
    fn fetch_past_end_is_out_of_bounds() {
        let mut c = CodeCache::new(store(&seq_words(4)), 64, 2, false);
        assert_eq!(
            c.fetch_word(16),
            Err(FaultKind::OutOfBounds { address: 16 })
        );
        assert_eq!(
            c.fetch_word(u32::MAX & !3),
            Err(FaultKind::OutOfBounds { address: u32::MAX & !3 })
        );
    }

    #[test]
    fn unaligned_fetch_faults() {
        let mut c = CodeCache::new(store(&seq_words(4)), 64, 2, false);
        assert_eq!(
            c.fetch_word(2),
            Err(FaultKind::UnalignedAccess { address: 2 })
        );
    }

    #[test]
    fn boundary_approach_prefetches_successor() {
        // 32 words, 64-byte lines => two lines.
        let mut c = CodeCache::new(store(&seq_words(32)), 64, 2, true);
        for i in 0..16 {
            c.fetch_word(i * 4).unwrap();
        }
        assert_eq!(c.stats.prefetches, 1);
        let misses_before = c.stats.misses;
        c.fetch_word(64).unwrap();
        assert_eq!(c.stats.misses, misses_before, "prefetched line must hit");
        assert_eq!(c.stats.cancelled_prefetches, 0);
    }

    #[test]
    fn far_jump_cancels_pending_prefetch() {
        // Three lines of 16 words each.
        let mut c = CodeCache::new(store(&seq_words(48)), 64, 2, true);
        c.fetch_word(60).unwrap(); // near end of line 0: prefetch issued
        assert_eq!(c.stats.prefetches, 1);
        c.fetch_word(128).unwrap(); // far jump to line 2
        assert_eq!(c.stats.cancelled_prefetches, 1);
        // The prefetched line never landed, so going there now misses.
        let misses = c.stats.misses;
        c.fetch_word(64).unwrap();
        assert_eq!(c.stats.misses, misses + 1);
    }

    #[test]
    fn lru_line_is_evicted_first() {
        let mut c = CodeCache::new(store(&seq_words(64)), 64, 2, false);
        c.fetch_word(0).unwrap(); // line 0
        c.fetch_word(64).unwrap(); // line 1
        c.fetch_word(128).unwrap(); // line 2 evicts line 0
        assert_eq!(c.stats.evictions, 1);
        let misses = c.stats.misses;
        c.fetch_word(64).unwrap(); // line 1 still resident
        assert_eq!(c.stats.misses, misses);
        c.fetch_word(0).unwrap(); // line 0 was the LRU victim
        assert_eq!(c.stats.misses, misses + 1);
    }

    #[test]
    fn short_tail_line_is_readable() {
        // 5 words with 16-byte lines: final line holds one word.
        let mut c = CodeCache::new(store(&seq_words(5)), 16, 2, false);
        assert_eq!(c.fetch_word(16).unwrap(), 4);
    }
}
