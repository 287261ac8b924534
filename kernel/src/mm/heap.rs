//! Kernel heap: slab caches plus a large-allocation pool.
//!
//! Small requests come from a fixed ladder of power-of-two slab caches.
//! Every object is preceded by one word pointing back at its slab header,
//! so `kfree` dispatches in constant time without consulting any tree; a
//! magic sentinel in the header catches corruption, and a corrupt free is a
//! kernel panic. Requests beyond the largest class take whole page runs
//! from the frame allocator, tracked in a fixed table.
//!
//! On bare metal the heap doubles as the `#[global_allocator]` backend; a
//! small static `linked_list_allocator` heap covers allocations made before
//! the frame allocator is online.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use super::{align_up, phys_to_virt, virt_to_phys_hhdm, PhysAddr, FRAME_ALLOCATOR, FRAME_SIZE};

/// Slab object size ladder.
const SLAB_CLASSES: [usize; 8] = [16, 32, 64, 128, 256, 512, 1024, 2048];

/// Backing run per slab: two frames, so even the 2 KiB class packs a few
/// objects per slab.
const SLAB_BACKING_BYTES: usize = 2 * FRAME_SIZE;

/// Sentinel stamped into every slab header.
const SLAB_MAGIC: u32 = 0x8CBE_EFC8;

/// Word placed immediately before each object, pointing at the owning slab.
const OBJ_PREFIX: usize = core::mem::size_of::<usize>();

/// Capacity of the large-allocation tracking table.
const LARGE_SLOTS: usize = 128;

struct FreeObject {
    next: Option<NonNull<FreeObject>>,
}

#[repr(C)]
struct SlabHeader {
    magic: u32,
    obj_size: u32,
    free_count: u32,
    total_objects: u32,
    free_list: Option<NonNull<FreeObject>>,
    next: Option<NonNull<SlabHeader>>,
    /// Physical base of the backing run, for release back to the frame
    /// allocator.
    phys: PhysAddr,
}

/// One size class: a lock around a singly linked list of slabs.
struct SlabCache {
    obj_size: usize,
    head: Mutex<Option<NonNull<SlabHeader>>>,
}

// SAFETY: slab chains are only touched under the cache lock; objects handed
// out are exclusively the caller's until freed.
unsafe impl Send for SlabCache {}
// SAFETY: see Send rationale.
unsafe impl Sync for SlabCache {}

impl SlabCache {
    const fn new(obj_size: usize) -> Self {
        Self {
            obj_size,
            head: Mutex::new(None),
        }
    }

    /// Carve a fresh slab out of the frame allocator and thread its free
    /// list through the object cells.
    fn grow(&self) -> Option<NonNull<SlabHeader>> {
        let phys = FRAME_ALLOCATOR.alloc(SLAB_BACKING_BYTES)?;
        let header = phys_to_virt(phys) as *mut SlabHeader;

        let stride = self.obj_size + OBJ_PREFIX;
        let first = align_up(header as usize + core::mem::size_of::<SlabHeader>(), 16);
        let total = (phys_to_virt(phys) as usize + SLAB_BACKING_BYTES - first) / stride;

        // SAFETY: the backing run was just allocated and is private to us;
        // all writes stay inside it.
        unsafe {
            header.write(SlabHeader {
                magic: SLAB_MAGIC,
                obj_size: self.obj_size as u32,
                free_count: total as u32,
                total_objects: total as u32,
                free_list: None,
                next: None,
                phys,
            });
            let mut list: Option<NonNull<FreeObject>> = None;
            for i in (0..total).rev() {
                let obj = (first + i * stride + OBJ_PREFIX) as *mut FreeObject;
                (*obj).next = list;
                list = NonNull::new(obj);
            }
            (*header).free_list = list;
        }
        NonNull::new(header)
    }

    fn alloc(&self) -> *mut u8 {
        let mut head = self.head.lock();

        // Find a slab with a free object, or grow the chain.
        let mut cursor = *head;
        let slab = loop {
            match cursor {
                Some(s) => {
                    // SAFETY: slabs on this chain are live and only mutated
                    // under the cache lock.
                    if unsafe { s.as_ref().free_list.is_some() } {
                        break s;
                    }
                    cursor = unsafe { s.as_ref().next };
                }
                None => {
                    let Some(mut fresh) = self.grow() else {
                        return core::ptr::null_mut();
                    };
                    // SAFETY: `fresh` is private until linked in here.
                    unsafe { fresh.as_mut().next = *head };
                    *head = Some(fresh);
                    break fresh;
                }
            }
        };

        // SAFETY: `slab` is live and lock-protected; the free list threads
        // through cells inside the slab's own backing run.
        unsafe {
            let slab = slab.as_ptr();
            let obj = (*slab).free_list.unwrap();
            (*slab).free_list = obj.as_ref().next;
            (*slab).free_count -= 1;

            let data = obj.as_ptr() as *mut u8;
            let prefix = (data as usize - OBJ_PREFIX) as *mut usize;
            *prefix = slab as usize;
            data
        }
    }

    /// Return `ptr` to `slab`. Empty slabs other than the chain head give
    /// their backing run back to the frame allocator.
    fn free(&self, slab: NonNull<SlabHeader>, ptr: *mut u8) {
        let mut head = self.head.lock();

        // SAFETY: backpointer-validated slab, mutated under the cache lock;
        // the freed cell belongs to its backing run.
        unsafe {
            let s = slab.as_ptr();
            let obj = ptr as *mut FreeObject;
            (*obj).next = (*s).free_list;
            (*s).free_list = NonNull::new(obj);
            (*s).free_count += 1;

            if (*s).free_count == (*s).total_objects && *head != Some(slab) {
                // Unlink and release the fully-free slab.
                let mut cursor = *head;
                while let Some(c) = cursor {
                    let c = c.as_ptr();
                    if (*c).next == Some(slab) {
                        (*c).next = (*s).next;
                        FRAME_ALLOCATOR.free((*s).phys);
                        break;
                    }
                    cursor = (*c).next;
                }
            }
        }
    }
}

#[derive(Clone, Copy)]
struct LargeRun {
    virt: usize,
    bytes: usize,
    in_use: bool,
}

/// Allocation statistics.
#[derive(Debug, Default)]
pub struct HeapStats {
    pub allocs: AtomicU64,
    pub frees: AtomicU64,
}

/// The slab/large-pool kernel heap.
pub struct KernelHeap {
    caches: [SlabCache; SLAB_CLASSES.len()],
    large: Mutex<[LargeRun; LARGE_SLOTS]>,
    stats: HeapStats,
}

impl KernelHeap {
    pub const fn new() -> Self {
        const EMPTY: LargeRun = LargeRun {
            virt: 0,
            bytes: 0,
            in_use: false,
        };
        Self {
            caches: [
                SlabCache::new(SLAB_CLASSES[0]),
                SlabCache::new(SLAB_CLASSES[1]),
                SlabCache::new(SLAB_CLASSES[2]),
                SlabCache::new(SLAB_CLASSES[3]),
                SlabCache::new(SLAB_CLASSES[4]),
                SlabCache::new(SLAB_CLASSES[5]),
                SlabCache::new(SLAB_CLASSES[6]),
                SlabCache::new(SLAB_CLASSES[7]),
            ],
            large: Mutex::new([EMPTY; LARGE_SLOTS]),
            stats: HeapStats {
                allocs: AtomicU64::new(0),
                frees: AtomicU64::new(0),
            },
        }
    }

    fn cache_for(&self, size: usize) -> Option<&SlabCache> {
        self.caches.iter().find(|c| size <= c.obj_size)
    }

    fn large_alloc(&self, size: usize) -> *mut u8 {
        let bytes = align_up(size, FRAME_SIZE);
        let mut table = self.large.lock();
        let Some(slot) = table.iter_mut().find(|r| !r.in_use) else {
            log::warn!("heap: large-allocation table full ({size} bytes refused)");
            return core::ptr::null_mut();
        };
        let Some(phys) = FRAME_ALLOCATOR.alloc(bytes) else {
            return core::ptr::null_mut();
        };
        let virt = phys_to_virt(phys) as usize;
        *slot = LargeRun {
            virt,
            bytes,
            in_use: true,
        };
        virt as *mut u8
    }

    /// Look up (and optionally release) a large run by address. Returns the
    /// run size when found.
    fn large_lookup(&self, ptr: *mut u8, release: bool) -> Option<usize> {
        let mut table = self.large.lock();
        let run = table
            .iter_mut()
            .find(|r| r.in_use && r.virt == ptr as usize)?;
        let bytes = run.bytes;
        if release {
            run.in_use = false;
            FRAME_ALLOCATOR.free(virt_to_phys_hhdm(ptr));
        }
        Some(bytes)
    }

    /// Allocate `size` bytes. Returns null for `size == 0` or on exhaustion.
    pub fn kmalloc(&self, size: usize) -> *mut u8 {
        if size == 0 {
            return core::ptr::null_mut();
        }
        self.stats.allocs.fetch_add(1, Ordering::Relaxed);
        match self.cache_for(size) {
            Some(cache) => cache.alloc(),
            None => self.large_alloc(size),
        }
    }

    /// Allocate a zeroed array of `n` elements of `size` bytes each.
    pub fn kcalloc(&self, n: usize, size: usize) -> *mut u8 {
        let Some(total) = n.checked_mul(size) else {
            return core::ptr::null_mut();
        };
        let ptr = self.kmalloc(total);
        if !ptr.is_null() {
            // SAFETY: `ptr` is a live allocation of at least `total` bytes.
            unsafe { core::ptr::write_bytes(ptr, 0, total) };
        }
        ptr
    }

    /// Resize an allocation. `krealloc(null, n)` behaves as `kmalloc(n)`;
    /// a zero `new_size` frees and returns null.
    pub fn krealloc(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.kmalloc(new_size);
        }
        if new_size == 0 {
            self.kfree(ptr);
            return core::ptr::null_mut();
        }

        let old_size = match self.large_lookup(ptr, false) {
            Some(bytes) => bytes,
            // SAFETY: `slab_of` validates the header magic before the read.
            None => unsafe { self.slab_of(ptr).as_ref().obj_size as usize },
        };

        if new_size <= old_size {
            return ptr;
        }
        let fresh = self.kmalloc(new_size);
        if fresh.is_null() {
            return core::ptr::null_mut();
        }
        // SAFETY: both pointers are live allocations; copy length is bounded
        // by the smaller of the two.
        unsafe { core::ptr::copy_nonoverlapping(ptr, fresh, old_size.min(new_size)) };
        self.kfree(ptr);
        fresh
    }

    /// Recover the slab header behind a small allocation; panics on a
    /// trampled sentinel.
    fn slab_of(&self, ptr: *mut u8) -> NonNull<SlabHeader> {
        // SAFETY: small allocations always carry the back-pointer word
        // immediately before the object.
        let header = unsafe { *((ptr as usize - OBJ_PREFIX) as *const usize) } as *mut SlabHeader;
        let header = NonNull::new(header).expect("kernel heap corruption: null slab back-pointer");
        // SAFETY: back-pointer just read; the magic check below is the guard
        // against it being garbage.
        let magic = unsafe { header.as_ref().magic };
        assert_eq!(magic, SLAB_MAGIC, "kernel heap corruption: bad slab magic");
        header
    }

    /// Release an allocation. `kfree(null)` is a no-op.
    pub fn kfree(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        self.stats.frees.fetch_add(1, Ordering::Relaxed);

        if self.large_lookup(ptr, true).is_some() {
            return;
        }

        let slab = self.slab_of(ptr);
        // SAFETY: header magic validated.
        let obj_size = unsafe { slab.as_ref().obj_size as usize };
        let cache = self
            .cache_for(obj_size)
            .expect("kernel heap corruption: slab size outside the ladder");
        cache.free(slab, ptr);
    }

    pub fn stats(&self) -> (u64, u64) {
        (
            self.stats.allocs.load(Ordering::Relaxed),
            self.stats.frees.load(Ordering::Relaxed),
        )
    }

    /// Number of slabs currently chained for the class serving `size`.
    #[cfg(all(test, not(target_os = "none")))]
    fn slab_count(&self, size: usize) -> usize {
        let cache = self.cache_for(size).unwrap();
        let head = cache.head.lock();
        let mut n = 0;
        let mut cursor = *head;
        while let Some(s) = cursor {
            n += 1;
            // SAFETY: chain is live and lock-protected.
            cursor = unsafe { s.as_ref().next };
        }
        n
    }
}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::new()
    }
}

/// The global kernel heap instance.
pub static KERNEL_HEAP: KernelHeap = KernelHeap::new();

// ---------------------------------------------------------------------------
// Global allocator wiring (bare metal only)
// ---------------------------------------------------------------------------

#[cfg(target_os = "none")]
mod global_alloc {
    use core::alloc::{GlobalAlloc, Layout};
    use core::sync::atomic::{AtomicBool, Ordering};

    use linked_list_allocator::LockedHeap;

    use super::{KERNEL_HEAP, FRAME_SIZE};

    /// Early boot heap, used until the frame allocator has zones.
    const EARLY_HEAP_BYTES: usize = 512 * 1024;
    static mut EARLY_HEAP_MEM: [u8; EARLY_HEAP_BYTES] = [0; EARLY_HEAP_BYTES];
    static EARLY_HEAP: LockedHeap = LockedHeap::empty();
    static SLAB_READY: AtomicBool = AtomicBool::new(false);

    /// Bring up the early heap. Called once, before any allocation.
    pub fn init_early() {
        let start = core::ptr::addr_of_mut!(EARLY_HEAP_MEM) as *mut u8;
        // SAFETY: the static buffer is reserved for this heap and handed
        // over exactly once.
        unsafe { EARLY_HEAP.lock().init(start, EARLY_HEAP_BYTES) };
    }

    /// Switch allocation to the slab heap. The frame allocator must have
    /// zones by now.
    pub fn switch_to_slab() {
        SLAB_READY.store(true, Ordering::Release);
    }

    fn in_early_range(ptr: *mut u8) -> bool {
        let start = core::ptr::addr_of!(EARLY_HEAP_MEM) as usize;
        (ptr as usize) >= start && (ptr as usize) < start + EARLY_HEAP_BYTES
    }

    /// `GlobalAlloc` front for the kernel heap.
    pub struct HeapAllocator;

    // SAFETY: delegates to allocators that honor GlobalAlloc's contract;
    // alignment above the slab guarantee is routed to page-aligned runs.
    unsafe impl GlobalAlloc for HeapAllocator {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            if !SLAB_READY.load(Ordering::Acquire) {
                return EARLY_HEAP
                    .lock()
                    .allocate_first_fit(layout)
                    .map(|p| p.as_ptr())
                    .unwrap_or(core::ptr::null_mut());
            }
            if layout.align() > core::mem::size_of::<usize>() {
                if layout.align() > FRAME_SIZE {
                    return core::ptr::null_mut();
                }
                // Page runs are 4 KiB aligned, covering any sane alignment.
                return KERNEL_HEAP.large_alloc(layout.size().max(layout.align()));
            }
            KERNEL_HEAP.kmalloc(layout.size())
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            if in_early_range(ptr) {
                // SAFETY: pointer came from the early heap with this layout.
                unsafe {
                    EARLY_HEAP
                        .lock()
                        .deallocate(core::ptr::NonNull::new_unchecked(ptr), layout)
                };
                return;
            }
            KERNEL_HEAP.kfree(ptr);
        }
    }
}

#[cfg(target_os = "none")]
pub use global_alloc::{init_early, switch_to_slab, HeapAllocator};

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    // Fresh instance per test: exact-address assertions must not race the
    // other test threads through the global heap.
    fn heap() -> KernelHeap {
        super::super::ensure_hosted_frame_pool();
        KernelHeap::new()
    }

    #[test]
    fn malloc_zero_is_null() {
        let _env = crate::test_env_lock();
        assert!(heap().kmalloc(0).is_null());
    }

    #[test]
    fn small_objects_come_from_slabs_and_recycle() {
        let _env = crate::test_env_lock();
        let h = heap();
        let a = h.kmalloc(24);
        let b = h.kmalloc(24);
        assert!(!a.is_null() && !b.is_null());
        assert_ne!(a, b);

        h.kfree(a);
        // The freed cell is the next 32-class handout.
        let c = h.kmalloc(30);
        assert_eq!(a, c);
        h.kfree(b);
        h.kfree(c);
    }

    #[test]
    fn distinct_classes_do_not_alias() {
        let _env = crate::test_env_lock();
        let h = heap();
        let small = h.kmalloc(16);
        let big = h.kmalloc(2048);
        assert_ne!(small, big);
        h.kfree(small);
        h.kfree(big);
    }

    #[test]
    fn large_allocations_are_page_aligned() {
        let _env = crate::test_env_lock();
        let h = heap();
        let p = h.kmalloc(3 * FRAME_SIZE);
        assert!(!p.is_null());
        assert_eq!(p as usize % FRAME_SIZE, 0);
        h.kfree(p);
    }

    #[test]
    fn calloc_zeroes_recycled_memory() {
        let _env = crate::test_env_lock();
        let h = heap();
        let p = h.kmalloc(64);
        // SAFETY: live 64-byte allocation.
        unsafe { core::ptr::write_bytes(p, 0xAB, 64) };
        h.kfree(p);

        let q = h.kcalloc(8, 8);
        assert_eq!(p, q, "freed object should be recycled");
        // SAFETY: live 64-byte allocation.
        let bytes = unsafe { core::slice::from_raw_parts(q, 64) };
        assert!(bytes.iter().all(|&b| b == 0));
        h.kfree(q);
    }

    #[test]
    fn realloc_preserves_contents() {
        let _env = crate::test_env_lock();
        let h = heap();
        let p = h.kmalloc(16);
        // SAFETY: live 16-byte allocation.
        unsafe { core::ptr::copy_nonoverlapping(b"helix!!\0".as_ptr(), p, 8) };

        let q = h.krealloc(p, 600);
        assert!(!q.is_null());
        // SAFETY: live 600-byte allocation with the first 8 bytes copied.
        let head = unsafe { core::slice::from_raw_parts(q, 8) };
        assert_eq!(head, b"helix!!\0");

        assert!(h.krealloc(q, 0).is_null());
    }

    #[test]
    fn realloc_null_is_malloc() {
        let _env = crate::test_env_lock();
        let h = heap();
        let p = h.krealloc(core::ptr::null_mut(), 40);
        assert!(!p.is_null());
        h.kfree(p);
    }

    #[test]
    fn fully_free_secondary_slabs_return_their_pages() {
        let _env = crate::test_env_lock();
        let h = heap();
        // Force at least two slabs in the 1024 class, then free everything;
        // the frame-count delta shows secondary slabs went back.
        let per_slab = (SLAB_BACKING_BYTES - 64) / (1024 + OBJ_PREFIX);
        let mut ptrs = alloc::vec::Vec::new();
        for _ in 0..per_slab * 2 + 1 {
            ptrs.push(h.kmalloc(1024));
        }
        assert!(h.slab_count(1024) >= 2);
        for p in ptrs.drain(..) {
            h.kfree(p);
        }
        assert_eq!(h.slab_count(1024), 1);
    }
}
