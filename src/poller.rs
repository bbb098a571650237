use std::os::unix::io::RawFd;
use std::time::Instant;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};

use crate::error::Result;
use crate::kernel_buffer::errno_is;
use crate::scoped_fd::ScopedFd;

/// One readiness event delivered by the poller.
#[derive(Copy, Clone, Debug)]
pub struct PollEvent {
    pub fd: RawFd,
    pub flags: EpollFlags,
}

impl PollEvent {
    pub fn readable(&self) -> bool {
        self.flags.contains(EpollFlags::EPOLLIN)
    }

    pub fn writable(&self) -> bool {
        self.flags.contains(EpollFlags::EPOLLOUT)
    }

    /// Peer closed or the descriptor errored; the connection is over.
    pub fn bad(&self) -> bool {
        self.flags
            .intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP | EpollFlags::EPOLLRDHUP)
    }
}

/// Epoll with a built-in self-pipe, so the event loop can be woken from any
/// thread. The poller doubles as the socket pipelines' semaphore.
pub struct Poller {
    epoll: ScopedFd,
    notify_in: ScopedFd,
    notify_out: ScopedFd,
}

impl Poller {
    pub fn new() -> Result<Poller> {
        let epoll = ScopedFd::from_raw(epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)?);
        let (read_end, write_end) = nix::unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;
        let poller = Poller {
            epoll,
            notify_in: ScopedFd::from_raw(read_end),
            notify_out: ScopedFd::from_raw(write_end),
        };
        poller.insert(poller.notify_in.get(), EpollFlags::EPOLLIN)?;
        Ok(poller)
    }

    pub fn insert(&self, fd: RawFd, flags: EpollFlags) -> Result<()> {
        let mut ev = EpollEvent::new(flags, fd as u64);
        epoll_ctl(self.epoll.get(), EpollOp::EpollCtlAdd, fd, &mut ev)?;
        Ok(())
    }

    pub fn modify(&self, fd: RawFd, flags: EpollFlags) -> Result<()> {
        let mut ev = EpollEvent::new(flags, fd as u64);
        epoll_ctl(self.epoll.get(), EpollOp::EpollCtlMod, fd, &mut ev)?;
        Ok(())
    }

    pub fn remove(&self, fd: RawFd) {
        // The fd may already be closed; nothing to do about errors here.
        let _ = epoll_ctl(self.epoll.get(), EpollOp::EpollCtlDel, fd, None);
    }

    /// Wake up `wait` from another thread.
    pub fn notify_one(&self) {
        match nix::unistd::write(self.notify_out.get(), &[1u8]) {
            Ok(_) => {}
            Err(e) if errno_is(&e, Errno::EAGAIN) => {
                // The pipe is full, the loop is awake anyway.
            }
            Err(e) => log::error!("poller: notify failed: {}", e),
        }
    }

    /// Wait until some descriptor is ready, `deadline` passes, or another
    /// thread notifies. Spurious empty returns are fine; callers re-check
    /// their own conditions.
    pub fn wait(&self, deadline: Option<Instant>) -> Result<Vec<PollEvent>> {
        let timeout_ms: isize = match deadline {
            None => -1,
            Some(d) => {
                let now = Instant::now();
                if d <= now {
                    0
                } else {
                    let ms = d.duration_since(now).as_millis();
                    ms.min(isize::MAX as u128) as isize
                }
            }
        };
        let mut events = vec![EpollEvent::empty(); 128];
        let n = match epoll_wait(self.epoll.get(), &mut events, timeout_ms) {
            Ok(n) => n,
            Err(e) if errno_is(&e, Errno::EINTR) => 0,
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::with_capacity(n);
        for ev in events.iter().take(n) {
            let fd = ev.data() as RawFd;
            if fd == self.notify_in.get() {
                self.drain_notifications();
                continue;
            }
            out.push(PollEvent {
                fd,
                flags: ev.events(),
            });
        }
        Ok(out)
    }

    fn drain_notifications(&self) {
        let mut buf = [0u8; 64];
        while let Ok(n) = nix::unistd::read(self.notify_in.get(), &mut buf) {
            if n < buf.len() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn notification_wakes_the_wait() {
        let poller = Poller::new().unwrap();
        poller.notify_one();
        // The notification itself is consumed internally; wait returns with
        // no events but without sleeping until the deadline.
        let start = Instant::now();
        let events = poller
            .wait(Some(Instant::now() + Duration::from_secs(5)))
            .unwrap();
        assert!(events.is_empty());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn readable_pipe_is_reported() {
        let poller = Poller::new().unwrap();
        let (r, w) = nix::unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).unwrap();
        let _r = ScopedFd::from_raw(r);
        let _w = ScopedFd::from_raw(w);
        poller.insert(r, EpollFlags::EPOLLIN).unwrap();
        nix::unistd::write(w, b"ping").unwrap();
        let events = poller
            .wait(Some(Instant::now() + Duration::from_secs(5)))
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].fd, r);
        assert!(events[0].readable());
    }

    #[test]
    fn deadline_expires_without_events() {
        let poller = Poller::new().unwrap();
        let start = Instant::now();
        let events = poller
            .wait(Some(Instant::now() + Duration::from_millis(30)))
            .unwrap();
        assert!(events.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(25));
    }
}
