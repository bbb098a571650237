use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use std::os::unix::io::RawFd;

use crate::error::Result;
use crate::scoped_fd::ScopedFd;

/// A pair of pipes connecting a parent and a child process in both
/// directions. Each side keeps two descriptors; the other side's ends are
/// closed after `fork`.
pub struct TwoWayPipe {
    parent_in: ScopedFd,
    parent_out: ScopedFd,
    child_in: ScopedFd,
    child_out: ScopedFd,
}

impl TwoWayPipe {
    pub fn new() -> Result<TwoWayPipe> {
        let (to_child_read, to_child_write) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
        let (to_parent_read, to_parent_write) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
        Ok(TwoWayPipe {
            parent_in: ScopedFd::from_raw(to_parent_read),
            parent_out: ScopedFd::from_raw(to_child_write),
            child_in: ScopedFd::from_raw(to_child_read),
            child_out: ScopedFd::from_raw(to_parent_write),
        })
    }

    pub fn parent_in(&self) -> RawFd {
        self.parent_in.get()
    }

    pub fn parent_out(&self) -> RawFd {
        self.parent_out.get()
    }

    pub fn child_in(&self) -> RawFd {
        self.child_in.get()
    }

    pub fn child_out(&self) -> RawFd {
        self.child_out.get()
    }

    pub fn close_in_child(&mut self) {
        self.parent_in.close();
        self.parent_out.close();
    }

    pub fn close_in_parent(&mut self) {
        self.child_in.close();
        self.child_out.close();
    }

    /// Clear close-on-exec on the child's ends so they survive `exec`.
    pub fn keep_child_ends_across_exec(&self) -> Result<()> {
        for fd in &[self.child_in.get(), self.child_out.get()] {
            fcntl(*fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
        }
        Ok(())
    }

    /// Take the parent's ends, e.g. to hand them to a connection.
    pub fn extract_parent_ends(&mut self) -> (ScopedFd, ScopedFd) {
        (
            std::mem::take(&mut self.parent_in),
            std::mem::take(&mut self.parent_out),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_directions_carry_data() {
        let pipe = TwoWayPipe::new().unwrap();
        nix::unistd::write(pipe.parent_out(), b"down").unwrap();
        let mut buf = [0u8; 4];
        nix::unistd::read(pipe.child_in(), &mut buf).unwrap();
        assert_eq!(&buf, b"down");
        nix::unistd::write(pipe.child_out(), b"up!!").unwrap();
        nix::unistd::read(pipe.parent_in(), &mut buf).unwrap();
        assert_eq!(&buf, b"up!!");
    }
}
