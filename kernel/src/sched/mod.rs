//! Preemptive SMP scheduler: tasks, per-CPU run heaps, wait queues, and
//! epoch-based task reclamation.

pub mod epoch;
pub mod run_heap;
pub mod scheduler;
pub mod smp;
pub mod task;
pub mod wait;

pub use scheduler::{
    collect_dead, current_task, exit_current, kern_yield, make_runnable, reschedule, spawn,
};
pub use task::{BlockedOn, Pid, Task, TaskRef, TaskState};
