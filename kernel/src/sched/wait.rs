//! Futex wait queues.
//!
//! The canonical wait-queue building block: a fixed, power-of-two array of
//! hash buckets keyed on the *physical* address of the futex word, so
//! different virtual aliases of one page land on the same queue. Each
//! bucket is an intrusive [`TaskList`] behind its own IRQ-masking lock.
//! Timed waits record an absolute microsecond deadline on the task; the
//! timer tick sweeps expired waiters back onto their run heaps.

use super::run_heap::TaskList;
use super::scheduler;
use super::smp;
use super::task::{BlockedOn, TaskRef, TaskState};
use crate::sync::IrqMutex;

/// Number of hash buckets. Power of two.
pub const FUTEX_BUCKET_COUNT: usize = 64;

static BUCKETS: [IrqMutex<TaskList>; FUTEX_BUCKET_COUNT] =
    [const { IrqMutex::new(TaskList::new()) }; FUTEX_BUCKET_COUNT];

/// Bucket index for a futex key (physical address of a 4-byte word).
fn bucket_index(key: u64) -> usize {
    // Drop the always-zero low bits, then mix the page and offset bits.
    let k = key >> 2;
    ((k ^ (k >> 12)) as usize) & (FUTEX_BUCKET_COUNT - 1)
}

/// Park the current task of `cpu` on the bucket for `key`.
///
/// The task flips to Waiting and arms `deferred_switch`; the caller's
/// syscall returns normally and the switch happens on the return path.
pub fn futex_park_current(cpu: u32, key: u64, deadline_us: Option<u64>) {
    let Some(cur) = scheduler::current_task_on(cpu) else {
        return;
    };
    let mut bucket = BUCKETS[bucket_index(key)].lock();
    cur.set_blocked_on(BlockedOn::Futex(key));
    cur.set_timeout_deadline_us(deadline_us);
    cur.set_woke_by_timeout(false);
    cur.set_state(TaskState::Waiting);
    bucket.push(cur);
    cur.set_deferred_switch(true);
}

/// Wake up to `max` tasks parked on `key`'s bucket. Returns the number
/// woken. Wakes targeting an idle remote CPU raise its wake IPI via the
/// scheduler's requeue path.
pub fn futex_wake(key: u64, max: usize) -> usize {
    if max == 0 {
        return 0;
    }
    let mut woken = TaskList::new();
    {
        let mut bucket = BUCKETS[bucket_index(key)].lock();
        let mut taken = 0;
        bucket.drain_filter(
            |t| taken < max && t.blocked_on() == BlockedOn::Futex(key) && {
                taken += 1;
                true
            },
            |t| woken.push(t),
        );
    }
    let mut n = 0;
    while let Some(t) = woken.pop() {
        t.set_timeout_deadline_us(None);
        scheduler::make_runnable(t);
        n += 1;
    }
    n
}

/// Sweep every bucket for waiters whose deadline has passed; wake them with
/// the timed-out marker set. Returns how many expired. Driven from the
/// timer tick.
pub fn expire_timeouts(now_us: u64) -> usize {
    let mut expired = TaskList::new();
    for bucket in BUCKETS.iter() {
        let mut b = bucket.lock();
        b.drain_filter(
            |t| t.timeout_deadline_us().is_some_and(|d| d <= now_us),
            |t| expired.push(t),
        );
    }
    let mut n = 0;
    while let Some(t) = expired.pop() {
        t.set_woke_by_timeout(true);
        t.set_timeout_deadline_us(None);
        // The parked futex_wait already returned 0 into the saved frame;
        // expiry rewrites the delivered result.
        t.set_saved_rax(crate::error::Errno::Etimedout.as_ret());
        scheduler::make_runnable(t);
        n += 1;
    }
    n
}

/// Detach a task from its futex bucket (exit/kill unwinding). Returns false
/// when the task is not parked on one.
pub fn detach(t: TaskRef) -> bool {
    let BlockedOn::Futex(key) = t.blocked_on() else {
        return false;
    };
    BUCKETS[bucket_index(key)].lock().remove(t)
}

/// Number of waiters parked on `key` (diagnostics and tests).
pub fn waiter_count(key: u64) -> usize {
    let mut n = 0;
    BUCKETS[bucket_index(key)]
        .lock()
        .for_each(|t| {
            if t.blocked_on() == BlockedOn::Futex(key) {
                n += 1;
            }
        });
    n
}

/// Park the current CPU's task for `nanosleep`-style waits (no key, pure
/// timeout) on the CPU wait list.
pub fn sleep_current_until(deadline_us: u64) {
    let cpu = smp::current_cpu_id();
    scheduler::sleep_current_on_wait_list(cpu, BlockedOn::Sleep, Some(deadline_us));
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::super::task::Task;
    use super::*;

    fn parked_task(key: u64, deadline: Option<u64>) -> TaskRef {
        let t = TaskRef::from_box(Task::new("futex-park", 1));
        super::super::task::register(t);
        scheduler::adopt_current(0, t);
        futex_park_current(0, key, deadline);
        scheduler::take_deferred_switch(0);
        t
    }

    fn release(t: TaskRef) {
        super::super::task::unregister(t.pid());
        // SAFETY: test-local task, removed from every structure.
        drop(unsafe { t.into_box() });
    }

    #[test]
    fn wake_dequeues_exactly_the_keyed_waiters() {
        let _env = crate::test_env_lock();
        scheduler::init(1);
        let key_a = 0x10_0000;
        let key_b = 0x20_0000;
        let a1 = parked_task(key_a, None);
        let a2 = parked_task(key_a, None);
        let b = parked_task(key_b, None);

        assert_eq!(waiter_count(key_a), 2);
        assert_eq!(futex_wake(key_a, 1), 1);
        assert_eq!(waiter_count(key_a), 1);
        // The other key is untouched even when hashes collide.
        assert_eq!(waiter_count(key_b), 1);
        assert_eq!(futex_wake(key_a, 16), 1);
        assert_eq!(futex_wake(key_b, 16), 1);
        assert_eq!(futex_wake(key_a, 16), 0);

        // Every waiter came back runnable on its run heap.
        for t in [a1, a2, b] {
            assert_eq!(t.state(), TaskState::Runnable);
            scheduler::test_unqueue(t);
            release(t);
        }
    }

    #[test]
    fn expiry_wakes_only_past_deadline_waiters() {
        let _env = crate::test_env_lock();
        scheduler::init(1);
        let key = 0x30_0000;
        let soon = parked_task(key, Some(1_000));
        let later = parked_task(key, Some(5_000));

        assert_eq!(expire_timeouts(500), 0);
        assert_eq!(expire_timeouts(2_000), 1);
        assert!(soon.woke_by_timeout());
        assert_eq!(soon.state(), TaskState::Runnable);
        assert_eq!(later.state(), TaskState::Waiting);
        assert_eq!(expire_timeouts(10_000), 1);
        assert!(!detach(soon), "expired waiter already left the bucket");

        for t in [soon, later] {
            scheduler::test_unqueue(t);
            release(t);
        }
    }

    #[test]
    fn detach_unwinds_a_killed_waiter() {
        let _env = crate::test_env_lock();
        scheduler::init(1);
        let key = 0x40_0000;
        let t = parked_task(key, None);
        assert_eq!(waiter_count(key), 1);
        assert!(detach(t));
        assert_eq!(waiter_count(key), 0);
        assert!(!detach(t), "second detach finds nothing");
        release(t);
    }
}
