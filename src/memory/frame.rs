//! Physical frame allocator with per-region reference counts.
//!
//! One coalescing free list covers every RAM node the firmware reported.
//! Each node additionally carries a dense `u16` reference-count table,
//! carved out of the node's own first pages, indexed by
//! `(frame - region_base) / 4 KiB`:
//!
//!  - 0:  frame sits in the free pool, no table entry points at it
//!  - 1:  exactly one owner
//!  - >1: copy-on-write shared; every owning entry is read-only
//!
//! Counter mismatches (double free, underflow, allocating a frame whose
//! count is not zero) mean memory safety is already lost and panic with
//! context instead of returning an error.

use arrayvec::ArrayVec;
use spin::mutex::TicketMutex;

use crate::layout::{pages_for, PAGE_SIZE};
use crate::log::try_get_logger;

use super::range::RangeList;
use super::{linear, MemError, VmResult};

const MAX_REGIONS: usize = 32;
const PAGE: u64 = PAGE_SIZE as u64;

struct Counters {
    ptr: *mut u16,
    frames: usize,
}

// The raw pointer targets the region's carve-out, which lives for the
// kernel's lifetime; all access goes through the owning TicketMutex.
unsafe impl Send for Counters {}

pub struct Region {
    base: u64,
    limit: u64,
    counters: TicketMutex<Counters>,
}

impl Region {
    #[inline]
    fn spans(&self, frame: u64) -> bool {
        frame >= self.base && frame < self.limit
    }

    fn with<R>(&self, f: impl FnOnce(&mut [u16]) -> R) -> R {
        let guard = self.counters.lock();
        let table = unsafe { core::slice::from_raw_parts_mut(guard.ptr, guard.frames) };
        f(table)
    }

    #[inline]
    fn index(&self, frame: u64) -> usize {
        ((frame - self.base) / PAGE) as usize
    }
}

pub struct FrameAllocator {
    free: TicketMutex<RangeList>,
    regions: ArrayVec<Region, MAX_REGIONS>,
}

impl FrameAllocator {
    pub fn new() -> Self {
        FrameAllocator {
            free: TicketMutex::new(RangeList::new()),
            regions: ArrayVec::new(),
        }
    }

    /// Register one RAM node: reserve its counter table from its own head,
    /// zero the counters, and donate the remainder to the free pool.
    pub fn add_region(&mut self, base: u64, limit: u64) {
        let frames = ((limit - base) / PAGE) as usize;
        let table_pages = pages_for(frames as u64 * 2);
        if table_pages * PAGE >= limit - base {
            if let Some(l) = try_get_logger() {
                l.log("[FRAME] region too small for its refcount table, skipped");
            }
            return;
        }
        if self.regions.is_full() {
            panic!("frame allocator: more than {} RAM regions", MAX_REGIONS);
        }

        let table = unsafe { linear::frame_bytes(base, frames * 2) };
        table.fill(0);

        let region = Region {
            base,
            limit,
            counters: TicketMutex::new(Counters {
                ptr: table.as_mut_ptr() as *mut u16,
                frames,
            }),
        };
        // The table owns the frames it lives in.
        region.with(|t| {
            for c in t.iter_mut().take(table_pages as usize) {
                *c = 1;
            }
        });
        self.regions.push(region);

        self.free
            .lock()
            .add(base + table_pages * PAGE, (limit - base) - table_pages * PAGE);
    }

    /// Drop `[base, base+len)` from the free pool (reserved firmware
    /// spans, the kernel image). Tolerates spans that straddle RAM edges.
    pub fn subtract(&self, base: u64, len: u64) {
        self.free.lock().remove(base, len);
    }

    /// Mark already-resident frames (the kernel image) as owned so the
    /// counter invariant holds across every discovered frame.
    pub fn claim_range(&self, base: u64, len: u64) {
        let mut frame = base;
        while frame < base + len {
            if let Some(region) = self.region_of(frame) {
                region.with(|t| {
                    let i = region.index(frame);
                    if t[i] != 0 {
                        panic!("frame {:#x}: claimed with refcount {}", frame, t[i]);
                    }
                    t[i] = 1;
                });
            }
            frame += PAGE;
        }
    }

    fn region_of(&self, frame: u64) -> Option<&Region> {
        self.regions.iter().find(|r| r.spans(frame))
    }

    /// Take `n` contiguous frames; each leaves with refcount 1.
    pub fn alloc_frames(&self, n: u64) -> VmResult<u64> {
        let len = n.checked_mul(PAGE).ok_or(MemError::InvalidArgument)?;
        let base = self.free.lock().take(len).ok_or(MemError::OutOfMemory)?;
        for i in 0..n {
            let frame = base + i * PAGE;
            let region = self
                .region_of(frame)
                .unwrap_or_else(|| panic!("frame {:#x}: allocated outside any region", frame));
            region.with(|t| {
                let idx = region.index(frame);
                if t[idx] != 0 {
                    panic!("frame {:#x}: in free pool with refcount {}", frame, t[idx]);
                }
                t[idx] = 1;
            });
            #[cfg(feature = "vm-page-zero")]
            linear::zero_frame(frame);
        }
        Ok(base)
    }

    /// Return `n` frames whose refcount is exactly 1. Anything else is a
    /// double free or a still-shared frame and panics; owners of shared
    /// frames must go through [`FrameAllocator::drop_frame`].
    pub fn release_frames(&self, base: u64, n: u64) {
        for i in 0..n {
            let frame = base + i * PAGE;
            let region = self
                .region_of(frame)
                .unwrap_or_else(|| panic!("frame {:#x}: released outside any region", frame));
            region.with(|t| {
                let idx = region.index(frame);
                if t[idx] != 1 {
                    panic!(
                        "frame {:#x}: released with refcount {} ({}:{})",
                        frame,
                        t[idx],
                        file!(),
                        line!()
                    );
                }
                t[idx] = 0;
            });
        }
        self.free.lock().add(base, n * PAGE);
    }

    /// Add one owner to a mapped frame (address-space clone). Saturation
    /// refuses further sharing rather than losing the count.
    pub fn retain_frame(&self, frame: u64) -> VmResult<()> {
        let region = self
            .region_of(frame)
            .unwrap_or_else(|| panic!("frame {:#x}: retained outside any region", frame));
        region.with(|t| {
            let idx = region.index(frame);
            match t[idx] {
                0 => panic!("frame {:#x}: retained while free", frame),
                u16::MAX => Err(MemError::OutOfMemory),
                c => {
                    t[idx] = c + 1;
                    Ok(())
                }
            }
        })
    }

    /// Drop one owner; the last drop returns the frame to the pool. The
    /// free-list lock is taken only after the region lock is released.
    pub fn drop_frame(&self, frame: u64) {
        let region = self
            .region_of(frame)
            .unwrap_or_else(|| panic!("frame {:#x}: dropped outside any region", frame));
        let now_free = region.with(|t| {
            let idx = region.index(frame);
            if t[idx] == 0 {
                panic!("frame {:#x}: refcount underflow", frame);
            }
            t[idx] -= 1;
            t[idx] == 0
        });
        if now_free {
            self.free.lock().add(frame, PAGE);
        }
    }

    /// Give up one share of a COW frame that is known to stay shared or
    /// owned by somebody else; never reaches zero.
    pub fn cow_unshare(&self, frame: u64) -> u16 {
        let region = self
            .region_of(frame)
            .unwrap_or_else(|| panic!("frame {:#x}: unshared outside any region", frame));
        region.with(|t| {
            let idx = region.index(frame);
            if t[idx] < 2 {
                panic!("frame {:#x}: unshare with refcount {}", frame, t[idx]);
            }
            t[idx] -= 1;
            t[idx]
        })
    }

    pub fn refcount(&self, frame: u64) -> Option<u16> {
        let region = self.region_of(frame)?;
        Some(region.with(|t| t[region.index(frame)]))
    }

    pub fn free_bytes(&self) -> u64 {
        self.free.lock().total()
    }

    /// True iff the span sits wholly in the free pool.
    pub fn is_free(&self, base: u64, len: u64) -> bool {
        self.free.lock().contains(base, len)
    }

    /// Snapshot of the free pool for accounting checks.
    pub fn free_snapshot(&self) -> alloc::vec::Vec<super::range::Range> {
        self.free.lock().iter().copied().collect()
    }

    /// Registered region spans.
    pub fn region_spans(&self) -> alloc::vec::Vec<(u64, u64)> {
        self.regions.iter().map(|r| (r.base, r.limit)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::super::hosted;
    use super::*;

    fn allocator_over(bytes: usize) -> (FrameAllocator, u64, u64) {
        let span = hosted::alloc_ram(bytes);
        let mut frames = FrameAllocator::new();
        frames.add_region(span.base, span.base + span.size);
        (frames, span.base, span.base + span.size)
    }

    #[test]
    fn alloc_sets_counts_and_release_clears_them() {
        let (frames, _, _) = allocator_over(64 * PAGE_SIZE);
        let before = frames.free_bytes();
        let base = frames.alloc_frames(4).unwrap();
        assert_eq!(frames.free_bytes(), before - 4 * PAGE);
        for i in 0..4 {
            assert_eq!(frames.refcount(base + i * PAGE), Some(1));
        }
        frames.release_frames(base, 4);
        assert_eq!(frames.free_bytes(), before);
        for i in 0..4 {
            assert_eq!(frames.refcount(base + i * PAGE), Some(0));
        }
    }

    #[test]
    fn counter_table_consumes_region_head() {
        let (frames, base, limit) = allocator_over(64 * PAGE_SIZE);
        // 64 frames -> 128 count bytes -> one table page
        assert_eq!(frames.free_bytes(), (limit - base) - PAGE);
        assert_eq!(frames.refcount(base), Some(1));
        assert!(!frames.is_free(base, PAGE));
    }

    #[test]
    #[should_panic(expected = "released with refcount")]
    fn double_free_is_fatal() {
        let (frames, _, _) = allocator_over(64 * PAGE_SIZE);
        let f = frames.alloc_frames(1).unwrap();
        frames.release_frames(f, 1);
        frames.release_frames(f, 1);
    }

    #[test]
    #[should_panic(expected = "released with refcount")]
    fn releasing_shared_frame_is_fatal() {
        let (frames, _, _) = allocator_over(64 * PAGE_SIZE);
        let f = frames.alloc_frames(1).unwrap();
        frames.retain_frame(f).unwrap();
        frames.release_frames(f, 1);
    }

    #[test]
    fn drop_frees_only_at_zero() {
        let (frames, _, _) = allocator_over(64 * PAGE_SIZE);
        let before = frames.free_bytes();
        let f = frames.alloc_frames(1).unwrap();
        frames.retain_frame(f).unwrap();
        assert_eq!(frames.refcount(f), Some(2));
        frames.drop_frame(f);
        assert_eq!(frames.refcount(f), Some(1));
        assert_eq!(frames.free_bytes(), before - PAGE);
        frames.drop_frame(f);
        assert_eq!(frames.refcount(f), Some(0));
        assert_eq!(frames.free_bytes(), before);
    }

    #[test]
    fn retain_saturates_with_oom() {
        let (frames, _, _) = allocator_over(64 * PAGE_SIZE);
        let f = frames.alloc_frames(1).unwrap();
        for _ in 1..u16::MAX {
            frames.retain_frame(f).unwrap();
        }
        assert_eq!(frames.refcount(f), Some(u16::MAX));
        assert_eq!(frames.retain_frame(f), Err(MemError::OutOfMemory));
    }

    #[test]
    fn exhaustion_reports_oom_and_recovers() {
        let (frames, _, _) = allocator_over(16 * PAGE_SIZE);
        let snapshot = frames.free_snapshot();
        let mut held = alloc::vec::Vec::new();
        loop {
            match frames.alloc_frames(1) {
                Ok(f) => held.push(f),
                Err(e) => {
                    assert_eq!(e, MemError::OutOfMemory);
                    break;
                }
            }
        }
        assert_eq!(held.len() as u64 * PAGE, snapshot.iter().map(|r| r.len()).sum::<u64>());
        for f in held.into_iter().rev() {
            frames.release_frames(f, 1);
        }
        assert_eq!(frames.free_snapshot(), snapshot);
    }

    #[test]
    fn refcount_zero_iff_free() {
        let (frames, base, limit) = allocator_over(32 * PAGE_SIZE);
        let a = frames.alloc_frames(2).unwrap();
        let b = frames.alloc_frames(1).unwrap();
        frames.release_frames(a, 1);
        let mut frame = base;
        while frame < limit {
            let count = frames.refcount(frame).unwrap();
            assert_eq!(count == 0, frames.is_free(frame, PAGE), "frame {frame:#x}");
            frame += PAGE;
        }
        frames.release_frames(a + PAGE, 1);
        frames.release_frames(b, 1);
    }
}
