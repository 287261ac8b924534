//! Per-CPU preemptive scheduler.
//!
//! One [`CpuScheduler`] per CPU, each with a run heap keyed on virtual
//! deadline, a wait list, and a dead list. Within one CPU the policy picks
//! the *eligible* task (one that has accumulated at least its virtual-time
//! share) with the smallest deadline; ticks advance the running task's
//! virtual clock by its weight and preempt once it stops being the minimum.
//! Empty CPUs steal the least-urgent task from the busiest peer, taking
//! both locks in cpu-id order. All scheduler locks are IRQ-masking and are
//! released before any context switch completes.
//!
//! Blocking never happens inside a syscall body: bodies park the task on a
//! wait structure and arm `deferred_switch`; the syscall return path (or a
//! hosted test driving the policy directly) performs the switch after the
//! trap frame is whole again.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use super::epoch;
use super::run_heap::{RunHeap, TaskList};
use super::smp::{self, MAX_CPUS};
use super::task::{self, BlockedOn, Pid, Task, TaskRef, TaskState, DEFAULT_WEIGHT};
use crate::sync::IrqMutex;

/// Nominal time slice granted per deadline recomputation, in microseconds.
pub const BASE_SLICE_US: i64 = 4000;

/// Scheduler state for one CPU.
pub struct CpuScheduler {
    heap: RunHeap,
    wait_list: TaskList,
    dead_list: TaskList,
    current: Option<TaskRef>,
    idle: Option<TaskRef>,
}

impl CpuScheduler {
    const fn new() -> Self {
        Self {
            heap: RunHeap::new(),
            wait_list: TaskList::new(),
            dead_list: TaskList::new(),
            current: None,
            idle: None,
        }
    }

    /// Average virtual runtime across queued tasks and the running one.
    fn avg_vruntime(&self) -> i64 {
        let mut sum = self.heap.vruntime_sum();
        let mut count = self.heap.len() as i64;
        if let Some(cur) = self.current {
            sum += cur.vruntime();
            count += 1;
        }
        if count == 0 {
            0
        } else {
            sum / count
        }
    }

    fn insert_runnable(&mut self, t: TaskRef) {
        t.set_state(TaskState::Runnable);
        assert!(self.heap.insert(t), "scheduler: run heap overflow");
    }

    /// Pick and dequeue the best eligible local task.
    fn pick_local(&mut self) -> Option<TaskRef> {
        let avg = self.avg_vruntime();
        let best = self.heap.pick_best_eligible(avg)?;
        self.heap.remove(best);
        Some(best)
    }
}

/// One CPU's scheduler behind its IRQ-masking lock.
pub struct PerCpu {
    sched: IrqMutex<CpuScheduler>,
}

static CPUS: [PerCpu; MAX_CPUS] = [const {
    PerCpu {
        sched: IrqMutex::new(CpuScheduler::new()),
    }
}; MAX_CPUS];

/// Round-robin cursor for initial task placement.
static NEXT_PLACEMENT: AtomicU32 = AtomicU32::new(0);

fn sched(cpu: u32) -> &'static IrqMutex<CpuScheduler> {
    &CPUS[cpu as usize].sched
}

/// Initialize scheduling for the CPU roster from the SMP handoff. Called
/// once on boot (and per test to pin the CPU count).
pub fn init(cpu_count: u32) {
    smp::set_cpu_count(cpu_count);
}

/// Give `cpu` an idle task. The idle task never enters the run heap; it is
/// dispatched only when nothing else is runnable.
pub fn set_idle_task(cpu: u32, task: Box<Task>) {
    let t = TaskRef::from_box(task);
    t.set_cpu(cpu);
    task::register(t);
    sched(cpu).lock().idle = Some(t);
}

/// Time slice in virtual time for a weight.
fn slice_v(weight: u32) -> i64 {
    BASE_SLICE_US * DEFAULT_WEIGHT as i64 / weight.max(1) as i64
}

/// Convert a wall-clock delta into virtual time for a weight.
fn delta_v(delta_us: u64, weight: u32) -> i64 {
    (delta_us as i64) * DEFAULT_WEIGHT as i64 / weight.max(1) as i64
}

/// Put a fresh task into circulation: register it and place it on a CPU
/// chosen round-robin. Returns the non-owning handle.
pub fn spawn(task: Box<Task>) -> TaskRef {
    let t = TaskRef::from_box(task);
    task::register(t);
    let cpu = NEXT_PLACEMENT.fetch_add(1, Ordering::Relaxed) % smp::cpu_count();
    t.set_cpu(cpu);
    make_runnable(t);
    t
}

/// Transition a task to runnable on its CPU.
///
/// A task waking from sleep has its vruntime floored at the CPU's current
/// average so long sleepers do not starve already-runnable peers. Wakes
/// aimed at another CPU also raise that CPU's wake flag (IPI on hardware).
pub fn make_runnable(t: TaskRef) {
    let cpu = t.cpu();
    let was_empty;
    {
        let mut s = sched(cpu).lock();
        let avg = s.avg_vruntime();
        if t.vruntime() < avg {
            t.set_vruntime(avg);
        }
        t.set_vdeadline(t.vruntime() + slice_v(t.weight()));
        t.set_blocked_on(BlockedOn::Nothing);
        was_empty = s.heap.is_empty() && s.current.is_none();
        s.insert_runnable(t);
    }
    if cpu != smp::current_cpu_id() && was_empty {
        smp::wake_cpu(cpu);
    }
}

/// The task currently running on this CPU.
pub fn current_task() -> Option<TaskRef> {
    sched(smp::current_cpu_id()).lock().current
}

/// The task currently running on a specific CPU.
pub fn current_task_on(cpu: u32) -> Option<TaskRef> {
    sched(cpu).lock().current
}

/// Install `t` as the running task on `cpu` without queueing it. Used by
/// CPU bring-up for the bootstrap task and by hosted tests.
pub fn adopt_current(cpu: u32, t: TaskRef) {
    t.set_cpu(cpu);
    t.set_state(TaskState::Running);
    sched(cpu).lock().current = Some(t);
}

/// Timer-tick accounting for `cpu`.
///
/// Advances the running task's virtual clock proportionally to its weight
/// and reports whether it should be preempted: true once some queued
/// eligible task now has an earlier deadline.
pub fn on_tick(cpu: u32, delta_us: u64) -> bool {
    let mut guard = sched(cpu).lock();
    let s = &mut *guard;
    let Some(cur) = s.current else {
        return !s.heap.is_empty();
    };
    cur.set_vruntime(cur.vruntime() + delta_v(delta_us, cur.weight()));
    cur.set_vdeadline(cur.vruntime() + slice_v(cur.weight()));

    if s.idle == Some(cur) && !s.heap.is_empty() {
        return true;
    }
    let avg = s.avg_vruntime();
    match s.heap.pick_best_eligible(avg) {
        Some(best) => best.vdeadline() < cur.vdeadline(),
        None => false,
    }
}

/// Pick the next task for `cpu`, requeueing the previous one when it was
/// merely preempted. Steals from the busiest peer when the local heap runs
/// dry; falls back to the idle task. Returns the new `current`.
pub fn reschedule(cpu: u32) -> Option<TaskRef> {
    epoch::enter_critical(cpu);

    let prev_idle;
    let mut next = {
        let mut s = sched(cpu).lock();
        prev_idle = s.idle;
        if let Some(cur) = s.current.take() {
            if cur.state() == TaskState::Running && Some(cur) != s.idle {
                cur.set_state(TaskState::Runnable);
                s.insert_runnable(cur);
            }
        }
        s.pick_local()
    };

    if next.is_none() {
        next = steal_for(cpu);
    }

    let mut s = sched(cpu).lock();
    if next.is_none() {
        // Something may have landed while we were stealing.
        next = s.pick_local();
    }
    let next = next.or(prev_idle);
    if let Some(n) = next {
        n.set_cpu(cpu);
        n.set_state(TaskState::Running);
        s.current = Some(n);
    } else {
        s.current = None;
    }
    drop(s);

    epoch::exit_critical(cpu);
    next
}

/// Steal the least-urgent (largest-vdeadline) task from the busiest peer.
/// Both schedulers are locked in cpu-id order, never the thief's alone
/// first, so two mutually stealing CPUs cannot deadlock.
fn steal_for(thief: u32) -> Option<TaskRef> {
    let ncpus = smp::cpu_count();
    let mut victim: Option<(u32, usize)> = None;
    for peer in 0..ncpus {
        if peer == thief {
            continue;
        }
        let len = sched(peer).lock().heap.len();
        if len > 0 && victim.map_or(true, |(_, best)| len > best) {
            victim = Some((peer, len));
        }
    }
    let (peer, _) = victim?;

    let (lo, hi) = if thief < peer { (thief, peer) } else { (peer, thief) };
    let mut lo_guard = sched(lo).lock();
    let mut hi_guard = sched(hi).lock();
    let victim_sched = if peer == lo {
        &mut *lo_guard
    } else {
        &mut *hi_guard
    };

    let stolen = victim_sched.heap.peek_max()?;
    victim_sched.heap.remove(stolen);
    stolen.set_cpu(thief);
    Some(stolen)
}

/// Voluntarily relinquish the CPU: the current task re-enters the heap at
/// the tail (its deadline is pushed back a full slice) and the switch runs
/// on the syscall return path.
pub fn kern_yield() {
    if let Some(cur) = current_task() {
        cur.set_vdeadline(cur.vruntime() + slice_v(cur.weight()));
        cur.set_deferred_switch(true);
    }
}

/// Park the current task of `cpu` on its wait list, blocked on `reason`.
/// The state flips to Waiting immediately; the switch itself is deferred to
/// the syscall return path.
pub fn sleep_current_on_wait_list(cpu: u32, reason: BlockedOn, deadline_us: Option<u64>) {
    let mut s = sched(cpu).lock();
    let Some(cur) = s.current else { return };
    cur.set_blocked_on(reason);
    cur.set_timeout_deadline_us(deadline_us);
    cur.set_woke_by_timeout(false);
    cur.set_state(TaskState::Waiting);
    s.wait_list.push(cur);
    cur.set_deferred_switch(true);
}

/// Detach a task from its CPU's wait list (wake or kill path). Returns
/// false when the task was not parked there.
pub fn remove_from_wait_list(t: TaskRef) -> bool {
    sched(t.cpu()).lock().wait_list.remove(t)
}

/// Wake one task parked on `list`; returns it after requeueing.
pub fn wake_one(list: &mut TaskList) -> Option<TaskRef> {
    let t = list.pop()?;
    make_runnable(t);
    Some(t)
}

/// Wake every task parked on `list`; returns how many.
pub fn wake_all(list: &mut TaskList) -> usize {
    let mut n = 0;
    while wake_one(list).is_some() {
        n += 1;
    }
    n
}

/// Consume the deferred-switch flag of `cpu`'s current task.
///
/// When armed, the current slot is vacated (the task has already been
/// parked, exited, or re-inserted by the arming site) and the caller
/// follows up with [`reschedule`]. Mirrors the syscall return stub on
/// hardware.
pub fn take_deferred_switch(cpu: u32) -> Option<TaskRef> {
    let mut s = sched(cpu).lock();
    let cur = s.current?;
    if !cur.deferred_switch() {
        return None;
    }
    cur.set_deferred_switch(false);
    // A wake can beat the deferred switch: the task is Runnable again (and
    // already queued), or even still Running after a plain yield. Requeue
    // only the yield case; parked/exited tasks stay off the heap.
    if cur.state() == TaskState::Running {
        cur.set_state(TaskState::Runnable);
        s.insert_runnable(cur);
    }
    s.current = None;
    Some(cur)
}

// ---------------------------------------------------------------------------
// Exit, reap, reclamation
// ---------------------------------------------------------------------------

/// Terminate the current task of `cpu` with `status`.
///
/// Every waiter registered in the awaitee list receives the status through
/// its pre-registered physical address, has its saved return value set to
/// this task's PID, and becomes runnable. With no waiter the task turns
/// zombie and keeps its resources until a later waitpid reaps it; once a
/// waiter has consumed the status the zombie phase is already over and the
/// task retires straight to the dead list, so the status is observed by
/// exactly one waiter.
pub fn exit_current(cpu: u32, status: i32) {
    let Some(cur) = current_task_on(cpu) else {
        return;
    };
    cur.set_has_exited(true);
    cur.set_exit_status(status);

    let (awaiters, n) = cur.take_awaiters();
    let mut delivered = false;
    for &pid in &awaiters[..n] {
        let Some(waiter) = task::lookup(pid) else {
            continue;
        };
        let status_phys = waiter.wait_status_phys();
        if !status_phys.is_null() {
            // SAFETY: the physical address was translated from a validated
            // user pointer at wait time and the page cannot be unmapped
            // while its owner sleeps in waitpid.
            unsafe {
                (crate::mm::phys_to_virt(status_phys) as *mut i32).write(status);
            }
        }
        waiter.set_saved_rax(cur.pid());
        waiter.set_waiting_for(None);
        if remove_from_wait_list(waiter) {
            make_runnable(waiter);
            delivered = true;
        }
    }

    cur.set_state(TaskState::Zombie);
    if delivered {
        retire_zombie(cur);
    }
    cur.set_deferred_switch(true);
}

/// Kill a task from the fault path. Unwinds wait-structure membership, then
/// runs the normal exit protocol when the victim is current, or marks it
/// zombie directly when it is parked.
pub fn kill_task(t: TaskRef, status: i32) {
    match t.state() {
        TaskState::Running => {
            exit_current(t.cpu(), status);
        }
        _ => {
            // Detach from whichever structure holds it.
            let mut s = sched(t.cpu()).lock();
            if !s.wait_list.remove(t) {
                s.heap.remove(t);
            }
            drop(s);
            super::wait::detach(t);
            t.set_has_exited(true);
            t.set_exit_status(status);
            t.set_state(TaskState::Zombie);
        }
    }
}

/// Move a reaped zombie to its CPU's dead list, stamped with the current
/// epoch. Resources are *not* freed here; see [`collect_dead`].
pub fn retire_zombie(t: TaskRef) {
    t.set_waited_on(true);
    t.set_state(TaskState::Dead);
    t.set_death_epoch(epoch::current());
    sched(t.cpu()).lock().dead_list.push(t);
}

/// Reclaim dead tasks whose death epoch has passed the grace period.
/// Returns how many were released.
pub fn collect_dead(cpu: u32) -> usize {
    let mut reclaimable = Vec::new();
    {
        let mut s = sched(cpu).lock();
        s.dead_list.drain_filter(
            |t| epoch::is_safe_to_reclaim(t.death_epoch()),
            |t| reclaimable.push(t),
        );
    }
    let n = reclaimable.len();
    for t in reclaimable {
        task::unregister(t.pid());
        // SAFETY: the task sat on the dead list with a death epoch the
        // reclamation check cleared: no CPU can still hold a reference.
        // This is the single owning release.
        drop(unsafe { t.into_box() });
    }
    n
}

/// Wake every task sleeping on a CPU wait list whose deadline has passed
/// (`nanosleep` and timed waits parked outside the futex buckets). Driven
/// from the timer tick.
pub fn expire_sleepers(now_us: u64) -> usize {
    let mut woken = 0;
    for cpu in 0..smp::cpu_count() {
        let mut expired = TaskList::new();
        {
            let mut s = sched(cpu).lock();
            s.wait_list.drain_filter(
                |t| t.timeout_deadline_us().is_some_and(|d| d <= now_us),
                |t| expired.push(t),
            );
        }
        while let Some(t) = expired.pop() {
            t.set_woke_by_timeout(true);
            t.set_timeout_deadline_us(None);
            make_runnable(t);
            woken += 1;
        }
    }
    woken
}

/// Number of entries on `cpu`'s dead list (diagnostics and tests).
pub fn dead_list_len(cpu: u32) -> usize {
    sched(cpu).lock().dead_list.len()
}

/// Run-heap length of a CPU (diagnostics and tests).
pub fn heap_len(cpu: u32) -> usize {
    sched(cpu).lock().heap.len()
}

// ---------------------------------------------------------------------------
// Bare-metal dispatch glue
// ---------------------------------------------------------------------------

/// Syscall return path: honor a deferred switch armed inside the syscall
/// body, now that the frame is materialized.
#[cfg(target_os = "none")]
pub fn finish_syscall(
    cpu: u32,
    regs: &mut crate::arch::context::GpRegs,
    frame: &mut crate::arch::context::TrapFrame,
) {
    let Some(prev) = take_deferred_switch(cpu) else {
        return;
    };
    if let Some(next) = reschedule(cpu) {
        if Some(next) != Some(prev) {
            crate::arch::context::switch_in_frame(regs, frame, Some(prev), next);
        }
    }
}

/// Find a task by PID (re-exported convenience).
pub fn find_task(pid: Pid) -> Option<TaskRef> {
    task::lookup(pid)
}

/// Forcibly pull a task out of whatever scheduler structure holds it.
/// Test teardown only.
#[cfg(all(test, not(target_os = "none")))]
pub fn test_unqueue(t: TaskRef) {
    let mut s = sched(t.cpu()).lock();
    if s.current == Some(t) {
        s.current = None;
    } else if !s.heap.remove(t) {
        let _ = s.wait_list.remove(t) || s.dead_list.remove(t);
    }
}
