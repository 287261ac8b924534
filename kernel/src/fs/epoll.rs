//! Epoll: readiness multiplexing over the descriptor table.
//!
//! An epoll file's private state is a fixed-size interest array. `pwait`
//! polls each watched file's `poll_check` hook and collects ready entries;
//! when nothing is ready and the caller asked for a wait, it returns
//! `EAGAIN` so the user-space wrapper retries. Parking the caller on a
//! per-epoll wait queue instead would be the production design; the
//! spin-poll convention is kept deliberately.

use alloc::vec::Vec;

use spin::Mutex;

use super::fd_table::FdTable;
use super::file::{File, FileOps, OpenFlags, Private};
use crate::error::Errno;

// Event bits (conventional values; user space sees these verbatim).
pub const EPOLLIN: u32 = 0x001;
pub const EPOLLPRI: u32 = 0x002;
pub const EPOLLOUT: u32 = 0x004;
pub const EPOLLERR: u32 = 0x008;
pub const EPOLLHUP: u32 = 0x010;
pub const EPOLLRDHUP: u32 = 0x2000;
pub const EPOLLONESHOT: u32 = 1 << 30;
pub const EPOLLET: u32 = 1 << 31;

// Control operations.
pub const EPOLL_CTL_ADD: u32 = 1;
pub const EPOLL_CTL_DEL: u32 = 2;
pub const EPOLL_CTL_MOD: u32 = 3;

/// Watched descriptors per epoll instance.
pub const EPOLL_MAX_INTERESTS: usize = 64;

/// User-visible event record. Layout is the ABI user space compiles
/// against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct EpollEvent {
    pub events: u32,
    pub data: u64,
}

#[derive(Debug, Clone, Copy)]
struct Interest {
    fd: usize,
    events: u32,
    data: u64,
}

/// Interest list of one epoll file.
#[derive(Debug)]
pub struct EpollInstance {
    interests: [Option<Interest>; EPOLL_MAX_INTERESTS],
}

impl EpollInstance {
    pub fn new() -> Self {
        Self {
            interests: [None; EPOLL_MAX_INTERESTS],
        }
    }

    pub fn len(&self) -> usize {
        self.interests.iter().filter(|i| i.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot_of(&self, fd: usize) -> Option<usize> {
        self.interests
            .iter()
            .position(|i| i.is_some_and(|i| i.fd == fd))
    }
}

impl Default for EpollInstance {
    fn default() -> Self {
        Self::new()
    }
}

static EPOLL_OPS: FileOps = FileOps::none();

fn instance_of(file: &File) -> Result<&Mutex<EpollInstance>, Errno> {
    match &file.private {
        Private::Epoll(m) => Ok(m),
        _ => Err(Errno::Einval),
    }
}

/// Create an epoll file and install it in `table`. Returns the descriptor.
pub fn epoll_create(table: &FdTable, cloexec: bool) -> Result<usize, Errno> {
    let file = File::new(
        &EPOLL_OPS,
        OpenFlags::empty(),
        Private::Epoll(Mutex::new(EpollInstance::new())),
    );
    table.install(file, cloexec)
}

/// Add, modify, or delete an interest.
pub fn epoll_ctl(
    table: &FdTable,
    epfd: usize,
    op: u32,
    fd: usize,
    event: Option<EpollEvent>,
) -> Result<(), Errno> {
    let epfile = table.get(epfd)?;
    let instance = instance_of(&epfile)?;

    // The target must exist except for DEL, which tolerates stale fds so
    // close() races unwind cleanly.
    if op != EPOLL_CTL_DEL {
        let _ = table.get(fd)?;
    }

    let mut inst = instance.lock();
    match op {
        EPOLL_CTL_ADD => {
            if inst.slot_of(fd).is_some() {
                return Err(Errno::Eexist);
            }
            let slot = inst
                .interests
                .iter()
                .position(|i| i.is_none())
                .ok_or(Errno::Enomem)?;
            let event = event.ok_or(Errno::Einval)?;
            inst.interests[slot] = Some(Interest {
                fd,
                events: event.events,
                data: event.data,
            });
            Ok(())
        }
        EPOLL_CTL_MOD => {
            let slot = inst.slot_of(fd).ok_or(Errno::Enoent)?;
            let event = event.ok_or(Errno::Einval)?;
            inst.interests[slot] = Some(Interest {
                fd,
                events: event.events,
                data: event.data,
            });
            Ok(())
        }
        EPOLL_CTL_DEL => {
            if let Some(slot) = inst.slot_of(fd) {
                inst.interests[slot] = None;
            }
            Ok(())
        }
        _ => Err(Errno::Einval),
    }
}

/// Collect up to `max` ready events.
///
/// Ready entries return immediately. With nothing ready, a zero timeout
/// returns an empty set and a non-zero timeout returns `EAGAIN` for the
/// caller to retry (see module docs). Watched descriptors that have been
/// closed are dropped from the interest list on the way.
pub fn epoll_pwait(
    table: &FdTable,
    epfd: usize,
    max: usize,
    timeout_ms: i64,
) -> Result<Vec<EpollEvent>, Errno> {
    if max == 0 {
        return Err(Errno::Einval);
    }
    let epfile = table.get(epfd)?;
    let instance = instance_of(&epfile)?;

    let mut ready = Vec::new();
    let mut inst = instance.lock();
    for slot in inst.interests.iter_mut() {
        if ready.len() >= max {
            break;
        }
        let Some(interest) = *slot else { continue };
        let Ok(target) = table.get(interest.fd) else {
            // Closed behind our back; forget the interest.
            *slot = None;
            continue;
        };
        let revents = target.poll_check(interest.events);
        if revents != 0 {
            ready.push(EpollEvent {
                events: revents,
                data: interest.data,
            });
            if interest.events & EPOLLONESHOT != 0 {
                *slot = Some(Interest {
                    events: 0,
                    ..interest
                });
            }
        }
    }
    drop(inst);

    if !ready.is_empty() || timeout_ms == 0 {
        Ok(ready)
    } else {
        Err(Errno::Eagain)
    }
}

/// Interest count of an epoll descriptor (tests and procfs-style
/// diagnostics).
pub fn interest_count(table: &FdTable, epfd: usize) -> Result<usize, Errno> {
    let epfile = table.get(epfd)?;
    let len = instance_of(&epfile)?.lock().len();
    Ok(len)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::super::pipe;
    use super::*;

    fn setup() -> (FdTable, usize, usize, usize) {
        let table = FdTable::new();
        let (r, w) = pipe::create_pair();
        let rfd = table.install(r, false).unwrap();
        let wfd = table.install(w, false).unwrap();
        let epfd = epoll_create(&table, false).unwrap();
        (table, epfd, rfd, wfd)
    }

    fn ev(events: u32, data: u64) -> Option<EpollEvent> {
        Some(EpollEvent { events, data })
    }

    #[test]
    fn add_del_restores_the_pre_add_state() {
        let (table, epfd, rfd, _wfd) = setup();
        assert_eq!(interest_count(&table, epfd).unwrap(), 0);
        epoll_ctl(&table, epfd, EPOLL_CTL_ADD, rfd, ev(EPOLLIN, 1)).unwrap();
        assert_eq!(interest_count(&table, epfd).unwrap(), 1);
        epoll_ctl(&table, epfd, EPOLL_CTL_DEL, rfd, None).unwrap();
        assert_eq!(interest_count(&table, epfd).unwrap(), 0);
        // DEL of a missing target stays clean.
        epoll_ctl(&table, epfd, EPOLL_CTL_DEL, rfd, None).unwrap();
    }

    #[test]
    fn duplicate_add_is_eexist_mod_absent_is_enoent() {
        let (table, epfd, rfd, wfd) = setup();
        epoll_ctl(&table, epfd, EPOLL_CTL_ADD, rfd, ev(EPOLLIN, 1)).unwrap();
        assert_eq!(
            epoll_ctl(&table, epfd, EPOLL_CTL_ADD, rfd, ev(EPOLLIN, 2)).unwrap_err(),
            Errno::Eexist
        );
        // wfd exists but was never added.
        assert_eq!(
            epoll_ctl(&table, epfd, EPOLL_CTL_MOD, wfd, ev(EPOLLIN, 2)).unwrap_err(),
            Errno::Enoent,
        );
        // A target fd that does not exist at all is EBADF.
        assert_eq!(
            epoll_ctl(&table, epfd, EPOLL_CTL_ADD, 99, ev(EPOLLIN, 2)).unwrap_err(),
            Errno::Ebadf,
        );
    }

    #[test]
    fn full_interest_list_is_enomem() {
        let table = FdTable::new();
        let epfd = epoll_create(&table, false).unwrap();
        for _ in 0..EPOLL_MAX_INTERESTS / 2 {
            let (r, w) = pipe::create_pair();
            let rfd = table.install(r, false).unwrap();
            let wfd = table.install(w, false).unwrap();
            epoll_ctl(&table, epfd, EPOLL_CTL_ADD, rfd, ev(EPOLLIN, 0)).unwrap();
            epoll_ctl(&table, epfd, EPOLL_CTL_ADD, wfd, ev(EPOLLOUT, 0)).unwrap();
        }
        assert_eq!(interest_count(&table, epfd).unwrap(), EPOLL_MAX_INTERESTS);

        let (r, _w) = pipe::create_pair();
        let rfd = table.install(r, false).unwrap();
        assert_eq!(
            epoll_ctl(&table, epfd, EPOLL_CTL_ADD, rfd, ev(EPOLLIN, 0)).unwrap_err(),
            Errno::Enomem
        );
    }

    #[test]
    fn pwait_reports_pipe_readiness() {
        let (table, epfd, rfd, wfd) = setup();
        epoll_ctl(&table, epfd, EPOLL_CTL_ADD, rfd, ev(EPOLLIN, 0xAB)).unwrap();

        // Nothing readable yet: zero timeout returns empty, a wait returns
        // EAGAIN (spin-poll convention).
        assert!(epoll_pwait(&table, epfd, 8, 0).unwrap().is_empty());
        assert_eq!(epoll_pwait(&table, epfd, 8, 100).unwrap_err(), Errno::Eagain);

        table.get(wfd).unwrap().write(b"ping").unwrap();
        let events = epoll_pwait(&table, epfd, 8, 100).unwrap();
        assert_eq!(events.len(), 1);
        let e = events[0];
        assert_ne!(e.events & EPOLLIN, 0);
        let data = e.data;
        assert_eq!(data, 0xAB);
    }

    #[test]
    fn oneshot_interests_fire_once() {
        let (table, epfd, rfd, wfd) = setup();
        epoll_ctl(
            &table,
            epfd,
            EPOLL_CTL_ADD,
            rfd,
            ev(EPOLLIN | EPOLLONESHOT, 7),
        )
        .unwrap();
        table.get(wfd).unwrap().write(b"x").unwrap();

        assert_eq!(epoll_pwait(&table, epfd, 8, 0).unwrap().len(), 1);
        // Disabled after the first report; interest entry stays allocated.
        assert!(epoll_pwait(&table, epfd, 8, 0).unwrap().is_empty());
        assert_eq!(interest_count(&table, epfd).unwrap(), 1);
    }

    #[test]
    fn closed_targets_are_pruned_during_pwait() {
        let (table, epfd, rfd, _wfd) = setup();
        epoll_ctl(&table, epfd, EPOLL_CTL_ADD, rfd, ev(EPOLLIN, 0)).unwrap();
        table.close(rfd).unwrap();
        assert!(epoll_pwait(&table, epfd, 8, 0).unwrap().is_empty());
        assert_eq!(interest_count(&table, epfd).unwrap(), 0);
    }

    #[test]
    fn zero_max_is_invalid() {
        let (table, epfd, _rfd, _wfd) = setup();
        assert_eq!(epoll_pwait(&table, epfd, 0, 0).unwrap_err(), Errno::Einval);
    }
}
