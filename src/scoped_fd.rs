use std::os::unix::io::RawFd;

/// An owned file descriptor that is closed when the wrapper goes out of
/// scope. `-1` means "not open"; detaching returns the raw fd and leaves
/// the wrapper empty.
#[derive(Debug)]
pub struct ScopedFd {
    fd: RawFd,
}

impl ScopedFd {
    pub fn new() -> ScopedFd {
        ScopedFd { fd: -1 }
    }

    /// Take ownership of `fd`. The caller must not close it afterwards.
    pub fn from_raw(fd: RawFd) -> ScopedFd {
        ScopedFd { fd }
    }

    pub fn get(&self) -> RawFd {
        self.fd
    }

    pub fn is_open(&self) -> bool {
        self.fd >= 0
    }

    /// Release ownership without closing.
    pub fn extract(&mut self) -> RawFd {
        let result = self.fd;
        self.fd = -1;
        result
    }

    pub fn close(&mut self) {
        if self.fd >= 0 {
            // Errors on close are not actionable here.
            let _ = nix::unistd::close(self.fd);
            self.fd = -1;
        }
    }
}

impl Default for ScopedFd {
    fn default() -> ScopedFd {
        ScopedFd::new()
    }
}

impl Drop for ScopedFd {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_on_drop() {
        let (rfd, wfd) = nix::unistd::pipe().unwrap();
        {
            let _a = ScopedFd::from_raw(rfd);
            let _b = ScopedFd::from_raw(wfd);
        }
        // Both ends are closed now; writing must fail with EBADF.
        assert!(nix::unistd::write(wfd, b"x").is_err());
    }

    #[test]
    fn extract_releases_ownership() {
        let (rfd, wfd) = nix::unistd::pipe().unwrap();
        let mut a = ScopedFd::from_raw(rfd);
        let raw = a.extract();
        assert_eq!(raw, rfd);
        assert!(!a.is_open());
        nix::unistd::close(rfd).unwrap();
        nix::unistd::close(wfd).unwrap();
    }
}
