//! Cross-subsystem scenarios, driven through the real syscall dispatcher
//! against live subsystem instances. Each test owns the global scheduler
//! state for its duration (see `test_env_lock`).

#![cfg(all(test, not(target_os = "none")))]

use crate::error::Errno;
use crate::fs::epoll::{EpollEvent, EPOLLIN, EPOLL_CTL_ADD};
use crate::mm::{user, PageFlags, VirtAddr, FRAME_ALLOCATOR, FRAME_SIZE};
use crate::sched::task::Task;
use crate::sched::{epoch, scheduler, smp, wait, TaskRef, TaskState};
use crate::syscall::{self, CallClass};

const SYS_FUTEX: u64 = CallClass::Futex as u64;
const SYS_PROCESS: u64 = CallClass::Process as u64;
const SYS_VFS: u64 = CallClass::Vfs as u64;
const SYS_VMEM: u64 = CallClass::Vmem as u64;

// Operation numbers as user space encodes them.
const PROC_WAITPID: u64 = 2;
const PROC_EXIT: u64 = 3;
const FUTEX_WAIT: u64 = 0;
const FUTEX_WAKE: u64 = 1;
const VFS_WRITE: u64 = 2;
const VFS_PIPE: u64 = 9;
const VFS_EPOLL_CREATE: u64 = 10;
const VFS_EPOLL_CTL: u64 = 11;
const VFS_EPOLL_PWAIT: u64 = 12;
const VMEM_ALLOCATE: u64 = 0;
const VMEM_FREE: u64 = 1;
const PROT_RW: u64 = 0x3;
const MAP_ANON_PRIVATE: u64 = 0x22;
const MAP_ANON_FIXED: u64 = 0x32;

fn call(class: u64, args: [u64; 6]) -> i64 {
    syscall::dispatch(class, &args) as i64
}

fn user_task(name: &str) -> TaskRef {
    crate::mm::ensure_hosted_frame_pool();
    let t = TaskRef::from_box(Task::new_user(name, 1).expect("user task"));
    crate::sched::task::register(t);
    t
}

/// Map one user page and return its base address.
fn map_user_page(t: TaskRef, vaddr: u64) -> u64 {
    let frame = FRAME_ALLOCATOR.alloc(FRAME_SIZE).unwrap();
    t.addr_space()
        .unwrap()
        .map(VirtAddr::new(vaddr), frame, PageFlags::user_data())
        .unwrap();
    vaddr
}

fn teardown(tasks: &[TaskRef]) {
    for &t in tasks {
        scheduler::test_unqueue(t);
        wait::detach(t);
        crate::sched::task::unregister(t.pid());
        // SAFETY: test-local task pulled out of every structure.
        drop(unsafe { t.into_box() });
    }
}

#[test]
fn exit_and_reap_delivers_the_status_exactly_once() {
    let _env = crate::test_env_lock();
    scheduler::init(1);

    let parent = user_task("parent");
    let child = user_task("child");
    let status_addr = map_user_page(parent, 0x0000_2000_0000);

    // Parent blocks in waitpid(child).
    scheduler::adopt_current(0, parent);
    assert_eq!(
        call(SYS_PROCESS, [PROC_WAITPID, child.pid(), status_addr, 0, 0, 0]),
        0
    );
    assert_eq!(parent.state(), TaskState::Waiting);
    scheduler::take_deferred_switch(0);

    // Child exits with status 7.
    scheduler::adopt_current(0, child);
    assert_eq!(call(SYS_PROCESS, [PROC_EXIT, 7, 0, 0, 0, 0]), 0);
    scheduler::take_deferred_switch(0);

    // The parent resumed with the child PID in its return register and the
    // status in its buffer.
    assert_eq!(parent.state(), TaskState::Runnable);
    assert_eq!(parent.saved_context().0.rax, child.pid());
    let status =
        user::read_user::<i32>(parent.addr_space().unwrap(), status_addr).unwrap();
    assert_eq!(status, 7);

    // A second waitpid fails with -1 and no block.
    let next = scheduler::reschedule(0).unwrap();
    assert_eq!(next, parent);
    assert_eq!(
        call(SYS_PROCESS, [PROC_WAITPID, child.pid(), 0, 0, 0, 0]),
        -1
    );
    assert_eq!(parent.state(), TaskState::Running);

    // The child's storage is reclaimed only after the epoch grace period.
    assert_eq!(scheduler::dead_list_len(0), 1);
    assert_eq!(scheduler::collect_dead(0), 0);
    epoch::advance();
    epoch::advance();
    assert_eq!(scheduler::collect_dead(0), 1);

    teardown(&[parent]);
}

#[test]
fn futex_ping_pong_across_address_spaces() {
    let _env = crate::test_env_lock();
    scheduler::init(1);

    let a = user_task("futex-a");
    let b = user_task("futex-b");

    // One physical frame, two virtual aliases: the futex key is the
    // physical address.
    let frame = FRAME_ALLOCATOR.alloc(FRAME_SIZE).unwrap();
    let addr_a = 0x0000_3000_0000u64;
    let addr_b = 0x0000_5000_0000u64;
    a.addr_space()
        .unwrap()
        .map(VirtAddr::new(addr_a), frame, PageFlags::user_data())
        .unwrap();
    b.addr_space()
        .unwrap()
        .map(VirtAddr::new(addr_b), frame, PageFlags::user_data())
        .unwrap();

    // A: futex_wait(addr, 0) with *addr == 0 parks.
    scheduler::adopt_current(0, a);
    user::write_user::<u32>(a.addr_space().unwrap(), addr_a, 0).unwrap();
    assert_eq!(call(SYS_FUTEX, [FUTEX_WAIT, addr_a, 0, 0, 0, 0]), 0);
    assert_eq!(a.state(), TaskState::Waiting);
    scheduler::take_deferred_switch(0);

    // A wait against a changed value refuses to block.
    scheduler::adopt_current(0, b);
    user::write_user::<u32>(b.addr_space().unwrap(), addr_b, 1).unwrap();
    assert_eq!(
        call(SYS_FUTEX, [FUTEX_WAIT, addr_b, 0, 0, 0, 0]),
        -(Errno::Eagain as i64)
    );

    // B wakes through its own alias; A comes back without a timeout.
    assert_eq!(call(SYS_FUTEX, [FUTEX_WAKE, addr_b, 1, 0, 0, 0]), 1);
    assert_eq!(a.state(), TaskState::Runnable);
    assert!(!a.woke_by_timeout());

    // Break the alias before teardown: leaf teardown frees every mapped
    // frame, and the shared frame must be freed exactly once (through B).
    let replacement = FRAME_ALLOCATOR.alloc(FRAME_SIZE).unwrap();
    a.addr_space()
        .unwrap()
        .map(VirtAddr::new(addr_a), replacement, PageFlags::user_data())
        .unwrap();

    teardown(&[a, b]);
}

#[test]
fn futex_wait_times_out_with_etimedout() {
    let _env = crate::test_env_lock();
    scheduler::init(1);

    let t = user_task("futex-timeout");
    let addr = map_user_page(t, 0x0000_3100_0000);
    scheduler::adopt_current(0, t);
    user::write_user::<u32>(t.addr_space().unwrap(), addr, 5).unwrap();

    assert_eq!(call(SYS_FUTEX, [FUTEX_WAIT, addr, 5, 2_000, 0, 0]), 0);
    assert_eq!(t.state(), TaskState::Waiting);
    scheduler::take_deferred_switch(0);

    crate::timer::advance_for_tests(5_000);
    assert_eq!(t.state(), TaskState::Runnable);
    assert!(t.woke_by_timeout());
    assert_eq!(t.saved_context().0.rax as i64, -(Errno::Etimedout as i64));

    teardown(&[t]);
}

#[test]
fn epoll_reports_pipe_token_readiness() {
    let _env = crate::test_env_lock();
    scheduler::init(1);

    let t = user_task("epoll");
    let buf = map_user_page(t, 0x0000_4000_0000);
    scheduler::adopt_current(0, t);

    // pipe(fds)
    let fds_ptr = buf;
    assert_eq!(call(SYS_VFS, [VFS_PIPE, fds_ptr, 0, 0, 0, 0]), 0);
    let fds = user::read_user::<[i32; 2]>(t.addr_space().unwrap(), fds_ptr).unwrap();
    let (rfd, wfd) = (fds[0] as u64, fds[1] as u64);

    // epoll_create + ADD(rfd, EPOLLIN)
    let epfd = call(SYS_VFS, [VFS_EPOLL_CREATE, 0, 0, 0, 0, 0]);
    assert!(epfd >= 0);
    let event_ptr = buf + 0x100;
    user::write_user(
        t.addr_space().unwrap(),
        event_ptr,
        EpollEvent {
            events: EPOLLIN,
            data: 0x51,
        },
    )
    .unwrap();
    assert_eq!(
        call(
            SYS_VFS,
            [
                VFS_EPOLL_CTL,
                epfd as u64,
                EPOLL_CTL_ADD as u64,
                rfd,
                event_ptr,
                0
            ]
        ),
        0
    );

    // Push a 4-byte token through the pipe, then wait with a 100 ms
    // timeout.
    let token_ptr = buf + 0x200;
    user::copy_to_user(t.addr_space().unwrap(), token_ptr, b"tok!").unwrap();
    assert_eq!(call(SYS_VFS, [VFS_WRITE, wfd, token_ptr, 4, 0, 0]), 4);

    let events_ptr = buf + 0x300;
    let n = call(
        SYS_VFS,
        [VFS_EPOLL_PWAIT, epfd as u64, events_ptr, 8, 100, 0],
    );
    assert_eq!(n, 1);
    let ev = user::read_user::<EpollEvent>(t.addr_space().unwrap(), events_ptr).unwrap();
    let bits = ev.events;
    let data = ev.data;
    assert_ne!(bits & EPOLLIN, 0);
    assert_eq!(data, 0x51);

    teardown(&[t]);
}

#[test]
fn fixed_mmap_roundtrip_is_idempotent() {
    let _env = crate::test_env_lock();
    scheduler::init(1);

    let t = user_task("mmap");
    scheduler::adopt_current(0, t);

    let base = 0x0000_1000_0000_0000u64;
    let len = 3 * FRAME_SIZE as u64;

    let p = call(SYS_VMEM, [VMEM_ALLOCATE, base, len, PROT_RW, MAP_ANON_FIXED, 0]);
    assert_eq!(p as u64, base);
    user::copy_to_user(t.addr_space().unwrap(), base + 0x10, b"persist").unwrap();
    assert_eq!(call(SYS_VMEM, [VMEM_FREE, base, len, 0, 0, 0]), 0);
    let frames_after_first_cycle = FRAME_ALLOCATOR.free_frame_count();

    // The same fixed range maps again at the same base.
    let q = call(SYS_VMEM, [VMEM_ALLOCATE, base, len, PROT_RW, MAP_ANON_FIXED, 0]);
    assert_eq!(q as u64, base);
    // Fresh anonymous memory is zeroed, not haunted by the old bytes.
    let mut probe = [0u8; 7];
    user::copy_from_user(t.addr_space().unwrap(), base + 0x10, &mut probe).unwrap();
    assert_eq!(&probe, &[0; 7]);
    assert_eq!(call(SYS_VMEM, [VMEM_FREE, base, len, 0, 0, 0]), 0);
    assert_eq!(FRAME_ALLOCATOR.free_frame_count(), frames_after_first_cycle);

    teardown(&[t]);
}

#[test]
fn mmap_boundary_conditions() {
    let _env = crate::test_env_lock();
    scheduler::init(1);

    let t = user_task("mmap-bounds");
    scheduler::adopt_current(0, t);

    assert_eq!(
        call(SYS_VMEM, [VMEM_ALLOCATE, 0, 0, PROT_RW, MAP_ANON_PRIVATE, 0]),
        -(Errno::Einval as i64)
    );
    assert_eq!(
        call(
            SYS_VMEM,
            [VMEM_ALLOCATE, 0, u64::MAX / 2, PROT_RW, MAP_ANON_PRIVATE, 0]
        ),
        -(Errno::Enomem as i64)
    );
    // Non-fixed requests search from the dedicated base.
    let p = call(
        SYS_VMEM,
        [VMEM_ALLOCATE, 0, FRAME_SIZE as u64, PROT_RW, MAP_ANON_PRIVATE, 0],
    );
    assert!(p as u64 >= 0x0000_1000_0000_0000);
    assert_eq!(
        call(SYS_VMEM, [VMEM_FREE, p as u64, FRAME_SIZE as u64, 0, 0, 0]),
        0
    );

    teardown(&[t]);
}

#[test]
fn waitpid_for_an_unknown_pid_fails_flat() {
    let _env = crate::test_env_lock();
    scheduler::init(1);

    let t = user_task("lonely");
    scheduler::adopt_current(0, t);
    assert_eq!(
        call(SYS_PROCESS, [PROC_WAITPID, 0xDEAD_0001, 0, 0, 0, 0]),
        -1
    );
    assert_eq!(t.state(), TaskState::Running, "no block for unknown pids");

    teardown(&[t]);
}

#[test]
fn cross_cpu_futex_wake_raises_the_wake_ipi() {
    let _env = crate::test_env_lock();
    scheduler::init(2);

    let sleeper = user_task("remote-sleeper");
    let key = 0xAB_0000u64;
    scheduler::adopt_current(1, sleeper);
    wait::futex_park_current(1, key, None);
    scheduler::take_deferred_switch(1);
    let _ = smp::take_wake_pending(1);

    // An IRQ path on CPU 0 wakes the sleeper parked on CPU 1.
    assert_eq!(wait::futex_wake(key, 1), 1);
    assert_eq!(sleeper.state(), TaskState::Runnable);
    assert!(
        smp::take_wake_pending(1),
        "waking an idle remote CPU must kick it out of hlt"
    );
    // The woken task is dispatched on its CPU within one quantum.
    assert_eq!(scheduler::reschedule(1), Some(sleeper));

    teardown(&[sleeper]);
    scheduler::init(1);
}

#[test]
fn killed_tasks_are_not_reclaimed_under_a_live_epoch_reader() {
    let _env = crate::test_env_lock();
    scheduler::init(1);

    let victim = user_task("victim");
    let key = 0xCD_0000u64;
    scheduler::adopt_current(0, victim);
    wait::futex_park_current(0, key, None);
    scheduler::take_deferred_switch(0);

    // A peer CPU holds a task pointer inside an epoch critical section.
    epoch::enter_critical(2);

    scheduler::kill_task(victim, -9);
    assert!(victim.has_exited());
    assert_eq!(wait::waiter_count(key), 0, "exit detaches wait-queue entries");
    scheduler::retire_zombie(victim);

    epoch::advance();
    epoch::advance();
    assert_eq!(
        scheduler::collect_dead(0),
        0,
        "kernel stack must survive while CPU 2 is in its critical section"
    );
    epoch::exit_critical(2);
    assert_eq!(scheduler::collect_dead(0), 1);
}
