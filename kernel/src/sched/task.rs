//! Tasks: the kernel's unit of scheduling.
//!
//! A task bundles identity, scheduling accounting, saved execution state,
//! blocking state, exit/reap bookkeeping, and owned resources (address
//! space, kernel stack, file descriptors). Tasks are heap-allocated and
//! circulate between scheduler structures as non-owning [`TaskRef`]s; the
//! PID registry plus the epoch GC hold the only ownership, so a task's
//! storage is released exactly once, and only after no CPU can still be
//! holding a pointer to it (see [`super::epoch`]).

use alloc::borrow::ToOwned;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::context::{GpRegs, TrapFrame};
use crate::error::{KernelError, KernelResult};
use crate::fs::fd_table::FdTable;
use crate::mm::{AddressSpace, PhysAddr, FRAME_ALLOCATOR};
use crate::sync::IrqMutex;

/// Process identifier. Process-wide unique; never reused within a boot.
pub type Pid = u64;

/// Default scheduling weight (nice-0 equivalent).
pub const DEFAULT_WEIGHT: u32 = 1024;

/// How many tasks may simultaneously wait for one task's exit.
pub const MAX_AWAITERS: usize = 8;

/// Kernel stack size per task.
pub const KERNEL_STACK_BYTES: usize = 16 * 1024;

/// Sentinel for "not in any run heap".
pub const NO_HEAP_INDEX: u32 = u32::MAX;

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// In a run heap, ready to be picked.
    Runnable,
    /// Currently on a CPU.
    Running,
    /// Parked on a wait list.
    Waiting,
    /// Exited; resources retained until a parent reaps the status.
    Zombie,
    /// Reaped; on a dead list awaiting epoch-safe reclamation.
    Dead,
}

/// Why a waiting task is parked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockedOn {
    Nothing,
    /// Futex bucket, keyed by the physical address of the futex word.
    Futex(u64),
    /// Waiting for a child's exit.
    Child(Pid),
    /// Parked in a poll set.
    Poll,
    Sleep,
}

/// Kernel stack backed by a frame-allocator run.
pub struct KernelStack {
    base: PhysAddr,
}

impl KernelStack {
    pub fn new() -> KernelResult<Self> {
        let base = FRAME_ALLOCATOR
            .alloc(KERNEL_STACK_BYTES)
            .ok_or(KernelError::OutOfMemory)?;
        Ok(Self { base })
    }

    /// Initial stack pointer (stacks grow down).
    pub fn top(&self) -> u64 {
        self.base.as_u64() + crate::mm::hhdm_offset() + KERNEL_STACK_BYTES as u64
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        FRAME_ALLOCATOR.free(self.base);
    }
}

/// Task control block.
pub struct Task {
    // Identity
    pub pid: Pid,
    pub parent: Pid,
    pub name: String,

    // Scheduling
    pub state: TaskState,
    pub weight: u32,
    /// Weighted virtual runtime; advances only while Running.
    pub vruntime: i64,
    /// Virtual deadline ordering the run heap.
    pub vdeadline: i64,
    /// CPU this task last ran on / is queued on.
    pub cpu: u32,
    /// Back-index into the owning CPU's run heap, or [`NO_HEAP_INDEX`].
    pub heap_index: u32,

    // Saved execution state
    pub regs: GpRegs,
    pub frame: TrapFrame,
    pub fs_base: u64,
    pub gs_base: u64,
    pub kernel_stack: Option<KernelStack>,
    pub addr_space: Option<AddressSpace>,

    // Blocking
    pub blocked_on: BlockedOn,
    /// Absolute microsecond deadline for timed waits.
    pub timeout_deadline_us: Option<u64>,
    /// Set when the last wake came from timeout expiry rather than an event.
    pub woke_by_timeout: bool,
    /// Intrusive link for wait and dead lists.
    pub sched_next: Option<TaskRef>,
    /// Set inside a blocking syscall; the syscall return path performs the
    /// switch after the frame is restored.
    pub deferred_switch: bool,

    // Exit / reap
    pub has_exited: bool,
    pub exit_status: i32,
    pub waited_on: bool,
    pub death_epoch: u64,
    pub awaiters: [Pid; MAX_AWAITERS],
    pub awaiter_count: usize,
    /// Which PID this task is blocked waiting for.
    pub waiting_for: Option<Pid>,
    /// Physical address where the awaited child's status is delivered; the
    /// translation is done at wait time because the child may exit under a
    /// different active address space.
    pub wait_status_phys: PhysAddr,

    // Resources
    pub files: FdTable,
    pub cwd: String,
}

impl Task {
    /// Create a kernel task; `Runnable` but not yet queued anywhere.
    pub fn new(name: &str, parent: Pid) -> Box<Task> {
        Box::new(Task {
            pid: alloc_pid(),
            parent,
            name: name.to_owned(),
            state: TaskState::Runnable,
            weight: DEFAULT_WEIGHT,
            vruntime: 0,
            vdeadline: 0,
            cpu: 0,
            heap_index: NO_HEAP_INDEX,
            regs: GpRegs::default(),
            frame: TrapFrame::default(),
            fs_base: 0,
            gs_base: 0,
            kernel_stack: None,
            addr_space: None,
            blocked_on: BlockedOn::Nothing,
            timeout_deadline_us: None,
            woke_by_timeout: false,
            sched_next: None,
            deferred_switch: false,
            has_exited: false,
            exit_status: 0,
            waited_on: false,
            death_epoch: 0,
            awaiters: [0; MAX_AWAITERS],
            awaiter_count: 0,
            waiting_for: None,
            wait_status_phys: PhysAddr::zero(),
            files: FdTable::new(),
            cwd: String::from("/"),
        })
    }

    /// Create a task with its own address space and kernel stack.
    pub fn new_user(name: &str, parent: Pid) -> KernelResult<Box<Task>> {
        let mut t = Self::new(name, parent);
        t.addr_space = Some(AddressSpace::new()?);
        t.kernel_stack = Some(KernelStack::new()?);
        Ok(t)
    }
}

/// Non-owning reference to a task.
///
/// Validity invariant: the pointee outlives every holder because storage is
/// only released by the epoch GC, which requires that no CPU can still be
/// inside a critical section that observed the task. Field access from
/// multiple CPUs is serialized by the lock of whichever scheduler structure
/// currently holds the task.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TaskRef(NonNull<Task>);

// SAFETY: see the validity invariant above; TaskRef itself is just a
// pointer.
unsafe impl Send for TaskRef {}
// SAFETY: see the validity invariant above.
unsafe impl Sync for TaskRef {}

impl core::fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "TaskRef(pid={})", self.pid())
    }
}

macro_rules! field_accessors {
    ($($get:ident / $set:ident: $field:ident: $ty:ty),+ $(,)?) => {
        $(
            pub fn $get(&self) -> $ty {
                // SAFETY: validity invariant of TaskRef; plain read
                // serialized by the owning structure's lock.
                unsafe { (*self.0.as_ptr()).$field }
            }

            pub fn $set(&self, value: $ty) {
                // SAFETY: validity invariant of TaskRef; plain write
                // serialized by the owning structure's lock.
                unsafe { (*self.0.as_ptr()).$field = value }
            }
        )+
    };
}

impl TaskRef {
    /// Leak a task into circulation. Ownership transfers to the registry +
    /// epoch GC.
    pub fn from_box(task: Box<Task>) -> Self {
        // Box::into_raw never returns null.
        Self(NonNull::new(Box::into_raw(task)).unwrap())
    }

    /// Reclaim ownership for the final release.
    ///
    /// # Safety
    ///
    /// Caller must be the epoch GC (or a test teardown) and must guarantee
    /// no other TaskRef to this task will be dereferenced again.
    pub unsafe fn into_box(self) -> Box<Task> {
        // SAFETY: forwarded caller contract.
        unsafe { Box::from_raw(self.0.as_ptr()) }
    }

    field_accessors! {
        state / set_state: state: TaskState,
        weight / set_weight: weight: u32,
        vruntime / set_vruntime: vruntime: i64,
        vdeadline / set_vdeadline: vdeadline: i64,
        cpu / set_cpu: cpu: u32,
        heap_index / set_heap_index: heap_index: u32,
        blocked_on / set_blocked_on: blocked_on: BlockedOn,
        timeout_deadline_us / set_timeout_deadline_us: timeout_deadline_us: Option<u64>,
        woke_by_timeout / set_woke_by_timeout: woke_by_timeout: bool,
        sched_next / set_sched_next: sched_next: Option<TaskRef>,
        deferred_switch / set_deferred_switch: deferred_switch: bool,
        has_exited / set_has_exited: has_exited: bool,
        exit_status / set_exit_status: exit_status: i32,
        waited_on / set_waited_on: waited_on: bool,
        death_epoch / set_death_epoch: death_epoch: u64,
        waiting_for / set_waiting_for: waiting_for: Option<Pid>,
        wait_status_phys / set_wait_status_phys: wait_status_phys: PhysAddr,
    }

    pub fn pid(&self) -> Pid {
        // SAFETY: validity invariant; pid is immutable after creation.
        unsafe { (*self.0.as_ptr()).pid }
    }

    pub fn parent(&self) -> Pid {
        // SAFETY: validity invariant; parent is immutable after creation.
        unsafe { (*self.0.as_ptr()).parent }
    }

    /// Borrow the descriptor table (internally locked).
    pub fn files(&self) -> &FdTable {
        // SAFETY: validity invariant; FdTable has interior locking.
        unsafe { &(*self.0.as_ptr()).files }
    }

    /// Borrow the task's address space, if it has a private one.
    pub fn addr_space(&self) -> Option<&AddressSpace> {
        // SAFETY: validity invariant; the address space is never replaced
        // while the task is alive.
        unsafe { (*self.0.as_ptr()).addr_space.as_ref() }
    }

    pub fn addr_space_root(&self) -> Option<PhysAddr> {
        self.addr_space().map(|a| a.root_phys())
    }

    pub fn kernel_stack_top(&self) -> Option<u64> {
        // SAFETY: validity invariant; the stack is never replaced while the
        // task is alive.
        unsafe { (*self.0.as_ptr()).kernel_stack.as_ref().map(|s| s.top()) }
    }

    pub fn saved_context(&self) -> (GpRegs, TrapFrame) {
        // SAFETY: validity invariant; reads race nothing because context is
        // only touched with the task off-CPU under the scheduler lock.
        unsafe { ((*self.0.as_ptr()).regs, (*self.0.as_ptr()).frame) }
    }

    pub fn save_context(&self, regs: GpRegs, frame: TrapFrame) {
        // SAFETY: as in `saved_context`.
        unsafe {
            (*self.0.as_ptr()).regs = regs;
            (*self.0.as_ptr()).frame = frame;
        }
    }

    /// Overwrite the saved return value register (waitpid completion path).
    pub fn set_saved_rax(&self, value: u64) {
        // SAFETY: as in `saved_context`.
        unsafe { (*self.0.as_ptr()).regs.rax = value }
    }

    pub fn fs_gs(&self) -> (u64, u64) {
        // SAFETY: as in `saved_context`.
        unsafe { ((*self.0.as_ptr()).fs_base, (*self.0.as_ptr()).gs_base) }
    }

    pub fn set_fs_gs(&self, fs: u64, gs: u64) {
        // SAFETY: as in `saved_context`.
        unsafe {
            (*self.0.as_ptr()).fs_base = fs;
            (*self.0.as_ptr()).gs_base = gs;
        }
    }

    /// Append `pid` to the exit-notification list.
    pub fn add_awaiter(&self, pid: Pid) -> KernelResult<()> {
        // SAFETY: validity invariant; callers hold the scheduler lock of the
        // CPU owning this task.
        unsafe {
            let t = self.0.as_ptr();
            if (*t).awaiter_count >= MAX_AWAITERS {
                return Err(KernelError::TableFull { table: "awaiter" });
            }
            let n = (*t).awaiter_count;
            (*t).awaiters[n] = pid;
            (*t).awaiter_count = n + 1;
            Ok(())
        }
    }

    /// Drain the exit-notification list.
    pub fn take_awaiters(&self) -> ([Pid; MAX_AWAITERS], usize) {
        // SAFETY: as in `add_awaiter`.
        unsafe {
            let t = self.0.as_ptr();
            let out = ((*t).awaiters, (*t).awaiter_count);
            (*t).awaiter_count = 0;
            out
        }
    }
}

// ---------------------------------------------------------------------------
// PID allocation and registry
// ---------------------------------------------------------------------------

static NEXT_PID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh PID.
pub fn alloc_pid() -> Pid {
    NEXT_PID.fetch_add(1, Ordering::Relaxed)
}

/// PID → task map. Entries live from spawn until epoch reclamation. The
/// lock masks IRQs: exit and wake paths consult the registry while
/// interrupts may be fielding faults.
static REGISTRY: IrqMutex<BTreeMap<Pid, TaskRef>> = IrqMutex::new(BTreeMap::new());

pub fn register(task: TaskRef) {
    REGISTRY.lock().insert(task.pid(), task);
}

pub fn lookup(pid: Pid) -> Option<TaskRef> {
    REGISTRY.lock().get(&pid).copied()
}

pub fn unregister(pid: Pid) {
    REGISTRY.lock().remove(&pid);
}

/// Number of live registry entries (debugging / tests).
pub fn task_count() -> usize {
    REGISTRY.lock().len()
}
