//! Physical frame allocator.
//!
//! Usable memory is organized into *zones*, one per contiguous usable region
//! from the boot memory map. Each zone embeds its own bookkeeping at the
//! start of the region and runs a classical binary buddy over the rest:
//! power-of-two page runs, split on allocation, merged with the buddy on
//! free. Requests walk the zone list first-fit; within a zone a per-zone
//! spinlock serializes the buddy metadata. The zone list itself is built at
//! boot and never mutated afterwards, so list traversal takes no lock.
//!
//! Every run handed out is zeroed: the initial kernel page-table build
//! depends on fresh tables reading as not-present.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, Ordering};

use spin::Mutex;

use super::{align_up, hhdm_offset, PhysAddr, FRAME_SIZE};

/// Largest buddy order: 2^18 frames = 1 GiB per block.
const MAX_ORDER: usize = 18;
const ORDER_COUNT: usize = MAX_ORDER + 1;

/// Zone header magic. A mismatch on free means the embedded metadata was
/// trampled; that is unrecoverable.
const ZONE_MAGIC: u64 = 0x5A4F_4E45_4D41_4721; // "ZONEMAG!"

// Per-frame metadata byte: the high bits carry the state of a block *head*,
// the low bits the block order. Frames inside a block are `META_INNER`.
const META_INNER: u8 = 0x00;
const META_FREE: u8 = 0x40;
const META_ALLOC: u8 = 0x80;
const META_STATE_MASK: u8 = 0xC0;
const META_ORDER_MASK: u8 = 0x3F;

/// Free-list node, stored in the first bytes of the free block itself.
struct FreeBlock {
    next: Option<NonNull<FreeBlock>>,
    prev: Option<NonNull<FreeBlock>>,
}

/// Mutable buddy state of one zone, behind the zone's lock.
struct ZoneInner {
    free_lists: [Option<NonNull<FreeBlock>>; ORDER_COUNT],
    free_frames: usize,
}

/// One contiguous usable physical region with embedded buddy metadata.
///
/// Layout at the region base: `Zone` header, then one metadata byte per
/// frame, then padding up to the first frame boundary, then the frames the
/// buddy manages.
pub struct Zone {
    magic: u64,
    next: Option<NonNull<Zone>>,
    /// Physical address of the first managed frame.
    frames_base: PhysAddr,
    /// Number of managed frames.
    nframes: usize,
    /// Direct-map offset captured when the zone was built.
    virt_offset: u64,
    meta: NonNull<u8>,
    inner: Mutex<ZoneInner>,
}

impl Zone {
    fn frame_ptr(&self, idx: usize) -> *mut u8 {
        (self.frames_base.as_u64() + (idx * FRAME_SIZE) as u64 + self.virt_offset) as *mut u8
    }

    fn meta_at(&self, idx: usize) -> u8 {
        debug_assert!(idx < self.nframes);
        // SAFETY: `meta` points at an array of `nframes` bytes inside this
        // zone's reserved header area; `idx` is bounds-checked above.
        unsafe { *self.meta.as_ptr().add(idx) }
    }

    fn set_meta(&self, idx: usize, value: u8) {
        debug_assert!(idx < self.nframes);
        // SAFETY: as in `meta_at`; writes happen only under the zone lock.
        unsafe { *self.meta.as_ptr().add(idx) = value };
    }

    fn contains(&self, addr: PhysAddr) -> bool {
        let base = self.frames_base.as_u64();
        let end = base + (self.nframes * FRAME_SIZE) as u64;
        addr.as_u64() >= base && addr.as_u64() < end
    }

    /// Push the block headed at `idx` onto the free list for `order`.
    fn push_free(&self, inner: &mut ZoneInner, idx: usize, order: usize) {
        let node = self.frame_ptr(idx) as *mut FreeBlock;
        // SAFETY: the block headed at `idx` is free (caller invariant), so
        // its memory is exclusively ours to thread the list node through.
        unsafe {
            (*node).next = inner.free_lists[order];
            (*node).prev = None;
            if let Some(mut head) = inner.free_lists[order] {
                head.as_mut().prev = NonNull::new(node);
            }
            inner.free_lists[order] = NonNull::new(node);
        }
        self.set_meta(idx, META_FREE | order as u8);
    }

    /// Detach a specific free block from its order list (used for buddy
    /// merging).
    fn unlink_free(&self, inner: &mut ZoneInner, idx: usize, order: usize) {
        let node = self.frame_ptr(idx) as *mut FreeBlock;
        // SAFETY: metadata says this block is on the `order` free list, so
        // `node` is a live list node owned by this zone and the lock is held.
        unsafe {
            let next = (*node).next;
            let prev = (*node).prev;
            if let Some(mut p) = prev {
                p.as_mut().next = next;
            } else {
                inner.free_lists[order] = next;
            }
            if let Some(mut n) = next {
                n.as_mut().prev = prev;
            }
        }
    }

    /// Pop the head block of the free list for `order`.
    fn pop_free(&self, inner: &mut ZoneInner, order: usize) -> Option<usize> {
        let head = inner.free_lists[order]?;
        // SAFETY: `head` came off this zone's free list under the lock.
        unsafe {
            inner.free_lists[order] = head.as_ref().next;
            if let Some(mut n) = head.as_ref().next {
                n.as_mut().prev = None;
            }
        }
        let addr = head.as_ptr() as u64 - self.virt_offset;
        Some(((addr - self.frames_base.as_u64()) as usize) / FRAME_SIZE)
    }

    /// Allocate a block of `1 << order` frames from this zone.
    fn alloc(&self, order: usize) -> Option<PhysAddr> {
        if order > MAX_ORDER {
            return None;
        }
        let mut inner = self.inner.lock();

        let found = (order..=MAX_ORDER).find(|&o| inner.free_lists[o].is_some())?;
        let idx = self.pop_free(&mut inner, found)?;

        // Split down, returning the upper buddy at each step.
        let mut current = found;
        while current > order {
            current -= 1;
            let buddy = idx + (1 << current);
            self.push_free(&mut inner, buddy, current);
        }

        self.set_meta(idx, META_ALLOC | order as u8);
        inner.free_frames -= 1 << order;
        Some(self.frames_base.offset((idx * FRAME_SIZE) as u64))
    }

    /// Return a previously allocated block; merges buddies greedily.
    fn free(&self, addr: PhysAddr) {
        assert_eq!(self.magic, ZONE_MAGIC, "frame allocator: zone metadata corrupted");

        let mut idx = ((addr.as_u64() - self.frames_base.as_u64()) as usize) / FRAME_SIZE;
        let meta = self.meta_at(idx);
        assert_eq!(
            meta & META_STATE_MASK,
            META_ALLOC,
            "frame allocator: free of a frame not allocated here ({:#x})",
            addr.as_u64()
        );
        let mut order = (meta & META_ORDER_MASK) as usize;

        let mut inner = self.inner.lock();
        inner.free_frames += 1 << order;

        while order < MAX_ORDER {
            let buddy = idx ^ (1 << order);
            if buddy + (1 << order) > self.nframes {
                break;
            }
            if self.meta_at(buddy) != META_FREE | order as u8 {
                break;
            }
            self.unlink_free(&mut inner, buddy, order);
            self.set_meta(buddy, META_INNER);
            self.set_meta(idx, META_INNER);
            idx = idx.min(buddy);
            order += 1;
        }

        self.push_free(&mut inner, idx, order);
    }

    fn free_frames(&self) -> usize {
        self.inner.lock().free_frames
    }
}

/// Zone-list frame allocator. See module docs for the allocation policy.
pub struct FrameAllocator {
    /// Head of the zone list. Zones are linked through their embedded
    /// headers; the list only grows, and only during boot.
    zones: AtomicPtr<Zone>,
}

// SAFETY: all mutation of zone state happens under the per-zone spinlock;
// the zone list head is an atomic and zones are never removed.
unsafe impl Send for FrameAllocator {}
// SAFETY: see the Send rationale above.
unsafe impl Sync for FrameAllocator {}

impl FrameAllocator {
    pub const fn new() -> Self {
        Self {
            zones: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Register a usable physical region.
    ///
    /// The zone header and per-frame metadata are embedded at the start of
    /// the region; whatever remains after alignment becomes buddy-managed
    /// frames. Regions too small to hold a single frame after overhead are
    /// ignored.
    ///
    /// # Safety
    ///
    /// `[base, base + len)` must be usable RAM reachable through the current
    /// direct-map offset, not otherwise in use, and registered only once.
    pub unsafe fn add_zone(&self, base: PhysAddr, len: usize) {
        let virt_offset = hhdm_offset();

        // Worst-case metadata sizing uses the raw frame count; the handful
        // of bytes over-reserved are lost to alignment anyway.
        let raw_frames = len / FRAME_SIZE;
        let header_bytes = core::mem::size_of::<Zone>() + raw_frames;
        let frames_off = align_up(header_bytes, FRAME_SIZE);
        if frames_off + FRAME_SIZE > len {
            return;
        }
        let nframes = (len - frames_off) / FRAME_SIZE;

        let zone_virt = (base.as_u64() + virt_offset) as *mut Zone;
        let meta_virt = (base.as_u64() + virt_offset) as usize + core::mem::size_of::<Zone>();

        // SAFETY: the caller guarantees the region is exclusively ours; the
        // header and metadata writes stay inside `[base, base + frames_off)`.
        unsafe {
            core::ptr::write_bytes(meta_virt as *mut u8, META_INNER, raw_frames);
            zone_virt.write(Zone {
                magic: ZONE_MAGIC,
                next: None,
                frames_base: base.offset(frames_off as u64),
                nframes,
                virt_offset,
                meta: NonNull::new_unchecked(meta_virt as *mut u8),
                inner: Mutex::new(ZoneInner {
                    free_lists: [None; ORDER_COUNT],
                    free_frames: 0,
                }),
            });
        }
        // SAFETY: just initialized above.
        let zone = unsafe { &*zone_virt };

        // Seed the free lists: cover the frame range with maximal
        // naturally-aligned power-of-two blocks.
        {
            let mut inner = zone.inner.lock();
            let mut idx = 0usize;
            while idx < nframes {
                let align_order = if idx == 0 {
                    MAX_ORDER
                } else {
                    (idx.trailing_zeros() as usize).min(MAX_ORDER)
                };
                let mut order = align_order;
                while idx + (1 << order) > nframes {
                    order -= 1;
                }
                zone.push_free(&mut inner, idx, order);
                inner.free_frames += 1 << order;
                idx += 1 << order;
            }
        }

        // Prepend to the zone list.
        let zone_ptr = zone_virt;
        loop {
            let head = self.zones.load(Ordering::Acquire);
            // SAFETY: we still exclusively own the new zone header.
            unsafe { (*zone_ptr).next = NonNull::new(head) };
            if self
                .zones
                .compare_exchange(head, zone_ptr, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
    }

    fn for_each_zone<R>(&self, mut f: impl FnMut(&Zone) -> Option<R>) -> Option<R> {
        let mut cursor = self.zones.load(Ordering::Acquire);
        while !cursor.is_null() {
            // SAFETY: zone headers live for the life of the kernel once
            // registered and are never unlinked.
            let zone = unsafe { &*cursor };
            if let Some(r) = f(zone) {
                return Some(r);
            }
            cursor = zone.next.map_or(core::ptr::null_mut(), |n| n.as_ptr());
        }
        None
    }

    /// Allocate at least `bytes` of physically contiguous memory, rounded up
    /// to a power-of-two number of frames. The run is page-aligned and
    /// zeroed. Returns `None` on exhaustion; never blocks.
    pub fn alloc(&self, bytes: usize) -> Option<PhysAddr> {
        if bytes == 0 {
            return None;
        }
        let frames = bytes.div_ceil(FRAME_SIZE).next_power_of_two();
        let order = frames.trailing_zeros() as usize;

        let addr = self.for_each_zone(|zone| zone.alloc(order))?;

        // SAFETY: the run was just handed out by the buddy, so it is mapped
        // through the direct map and not referenced by anyone else.
        unsafe {
            core::ptr::write_bytes(
                (addr.as_u64() + hhdm_offset()) as *mut u8,
                0,
                frames * FRAME_SIZE,
            );
        }
        Some(addr)
    }

    /// Release a run previously returned by [`alloc`](Self::alloc). The run
    /// length is recovered from the buddy metadata. Passing any other
    /// pointer is undefined; a detectable mismatch panics.
    pub fn free(&self, addr: PhysAddr) {
        let found = self.for_each_zone(|zone| {
            if zone.contains(addr) {
                zone.free(addr);
                Some(())
            } else {
                None
            }
        });
        assert!(
            found.is_some(),
            "frame allocator: free of {:#x} outside every zone",
            addr.as_u64()
        );
    }

    /// Total free frames across all zones.
    pub fn free_frame_count(&self) -> usize {
        let mut total = 0;
        self.for_each_zone(|zone| {
            total += zone.free_frames();
            None::<()>
        });
        total
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// The global frame allocator. Zones are registered during boot from the
/// memory-map handoff (or from a leaked host arena under test).
pub static FRAME_ALLOCATOR: FrameAllocator = FrameAllocator::new();

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::vec;

    use super::*;

    fn test_allocator(bytes: usize) -> FrameAllocator {
        let backing = vec![0u8; bytes + FRAME_SIZE].leak();
        let base = align_up(backing.as_mut_ptr() as usize, FRAME_SIZE);
        let alloc = FrameAllocator::new();
        // SAFETY: leaked host memory, frame-aligned, used by this allocator
        // instance only.
        unsafe { alloc.add_zone(PhysAddr::new(base as u64), bytes) };
        alloc
    }

    #[test]
    fn alloc_returns_aligned_zeroed_frames() {
        let fa = test_allocator(1024 * 1024);
        let frame = fa.alloc(1).expect("single frame from a fresh zone");
        assert!(frame.is_frame_aligned());
        // SAFETY: frame was just allocated from host-backed memory.
        let contents = unsafe { core::slice::from_raw_parts(frame.as_u64() as *const u8, FRAME_SIZE) };
        assert!(contents.iter().all(|&b| b == 0));
    }

    #[test]
    fn free_then_alloc_reaches_the_same_frame() {
        let fa = test_allocator(1024 * 1024);
        // Drain odd sizes so the first frame is in a known spot.
        let a = fa.alloc(FRAME_SIZE).unwrap();
        let before = fa.free_frame_count();
        fa.free(a);
        assert_eq!(fa.free_frame_count(), before + 1);
        let b = fa.alloc(FRAME_SIZE).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn runs_round_up_to_powers_of_two() {
        let fa = test_allocator(4 * 1024 * 1024);
        let before = fa.free_frame_count();
        let run = fa.alloc(3 * FRAME_SIZE).expect("3-page run");
        assert_eq!(before - fa.free_frame_count(), 4);
        fa.free(run);
        assert_eq!(fa.free_frame_count(), before);
    }

    #[test]
    fn buddies_merge_back_to_a_full_block() {
        let fa = test_allocator(2 * 1024 * 1024);
        let total = fa.free_frame_count();

        let a = fa.alloc(64 * FRAME_SIZE).unwrap();
        let b = fa.alloc(64 * FRAME_SIZE).unwrap();
        assert_ne!(a, b);
        fa.free(a);
        fa.free(b);
        assert_eq!(fa.free_frame_count(), total);

        // After merging, a block spanning both must be allocatable again.
        let big = fa.alloc(128 * FRAME_SIZE).expect("merged block");
        fa.free(big);
    }

    #[test]
    fn exhaustion_returns_none_without_blocking() {
        let fa = test_allocator(256 * 1024);
        let mut held = vec![];
        while let Some(f) = fa.alloc(FRAME_SIZE) {
            held.push(f);
        }
        assert!(fa.alloc(FRAME_SIZE).is_none());
        for f in held {
            fa.free(f);
        }
    }

    #[test]
    fn zero_byte_request_is_refused() {
        let fa = test_allocator(256 * 1024);
        assert!(fa.alloc(0).is_none());
    }

    #[test]
    #[should_panic(expected = "outside every zone")]
    fn freeing_a_foreign_pointer_panics() {
        let fa = test_allocator(256 * 1024);
        fa.free(PhysAddr::new(0x10));
    }
}
