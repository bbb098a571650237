use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::sys::socket::{
    accept4, bind, connect, getpeername, getsockname, listen, setsockopt, socket, sockopt,
    AddressFamily, SockFlag, SockType,
};

use crate::error::{Error, Result};
use crate::kernel_buffer::errno_is;
use crate::scoped_fd::ScopedFd;
use crate::socket_address::SocketAddress;

const BACKLOG: usize = 128;

/// A nonblocking stream socket (TCP or Unix). All sockets carry
/// `SOCK_NONBLOCK | SOCK_CLOEXEC`; readiness is the event loop's business.
pub struct Socket {
    fd: ScopedFd,
}

fn family_of(addr: &SocketAddress) -> Result<AddressFamily> {
    match addr {
        SocketAddress::Ipv4(_) => Ok(AddressFamily::Inet),
        SocketAddress::Ipv6(_) => Ok(AddressFamily::Inet6),
        SocketAddress::Unix(_) => Ok(AddressFamily::Unix),
        SocketAddress::Unspecified => Err(Error::config("unspecified socket address")),
    }
}

fn new_stream_socket(family: AddressFamily) -> Result<RawFd> {
    Ok(socket(
        family,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )?)
}

impl Socket {
    pub fn from_raw(fd: RawFd) -> Socket {
        Socket {
            fd: ScopedFd::from_raw(fd),
        }
    }

    /// Bind and listen on `addr`. A stale Unix socket file is removed
    /// first.
    pub fn listen_on(addr: &SocketAddress) -> Result<Socket> {
        if let SocketAddress::Unix(path) = addr {
            if path.first() != Some(&0) {
                let _ = std::fs::remove_file(String::from_utf8_lossy(path).as_ref());
            }
        }
        let fd = new_stream_socket(family_of(addr)?)?;
        let sock = Socket::from_raw(fd);
        if matches!(addr, SocketAddress::Ipv4(_) | SocketAddress::Ipv6(_)) {
            setsockopt(sock.fd(), sockopt::ReuseAddr, &true)?;
        }
        bind(sock.fd(), &addr.to_sockaddr()?)?;
        listen(sock.fd(), BACKLOG)?;
        Ok(sock)
    }

    /// Begin a nonblocking connect; completion is signalled by the poller
    /// and checked with `take_error`.
    pub fn connect_to(addr: &SocketAddress) -> Result<Socket> {
        let fd = new_stream_socket(family_of(addr)?)?;
        let sock = Socket::from_raw(fd);
        match connect(sock.fd(), &addr.to_sockaddr()?) {
            Ok(()) => {}
            Err(e) if errno_is(&e, Errno::EINPROGRESS) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(sock)
    }

    /// Accept one pending connection; `None` when there is none.
    pub fn accept(&self) -> Result<Option<(Socket, SocketAddress)>> {
        match accept4(self.fd(), SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC) {
            Ok(fd) => {
                let sock = Socket::from_raw(fd);
                let peer = sock.peer_address().unwrap_or(SocketAddress::Unspecified);
                Ok(Some((sock, peer)))
            }
            Err(e) if errno_is(&e, Errno::EAGAIN) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd.get()
    }

    pub fn local_address(&self) -> Result<SocketAddress> {
        Ok(SocketAddress::from_sockaddr(&getsockname(self.fd())?))
    }

    pub fn peer_address(&self) -> Result<SocketAddress> {
        Ok(SocketAddress::from_sockaddr(&getpeername(self.fd())?))
    }

    /// Pending socket error, if any; clears it. Used after a nonblocking
    /// connect completes.
    pub fn take_error(&self) -> Result<i32> {
        let mut err: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        // SAFETY: err/len point to valid local storage of the right size.
        let rc = unsafe {
            libc::getsockopt(
                self.fd(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if rc == -1 {
            return Err(nix::Error::last().into());
        }
        Ok(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn tcp_listen_accept_connect() {
        let server =
            Socket::listen_on(&SocketAddress::new_ipv4(Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = server.local_address().unwrap();
        assert!(addr.port() != 0);
        let client = Socket::connect_to(&addr).unwrap();
        // Localhost connects promptly; poll for the accepted side.
        let mut accepted = None;
        for _ in 0..100 {
            if let Some(pair) = server.accept().unwrap() {
                accepted = Some(pair);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let (_sock, peer) = accepted.expect("no connection accepted");
        assert!(peer.port() != 0);
        assert_eq!(client.take_error().unwrap(), 0);
    }

    #[test]
    fn abstract_unix_listen_connect() {
        let name = format!("hive-test-{}", std::process::id());
        let addr = SocketAddress::new_abstract(name.as_bytes());
        let server = Socket::listen_on(&addr).unwrap();
        let _client = Socket::connect_to(&addr).unwrap();
        let mut ok = false;
        for _ in 0..100 {
            if server.accept().unwrap().is_some() {
                ok = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(ok);
    }
}
