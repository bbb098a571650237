use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use nix::sys::socket::{InetAddr, SockAddr, UnixAddr};

use crate::error::{Error, Result};

/// A transport address as it appears on the wire: a 2-byte length followed
/// by the bytes of the system address record (`sockaddr_in`, `sockaddr_in6`
/// or `sockaddr_un`). An unspecified address has length zero.
///
/// Unix addresses keep the raw `sun_path` bytes; abstract-namespace names
/// carry their leading NUL byte, exactly as the kernel sees them.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum SocketAddress {
    Unspecified,
    Ipv4(SocketAddrV4),
    Ipv6(SocketAddrV6),
    Unix(Vec<u8>),
}

const FAMILY_SIZE: usize = 2;
const SOCKADDR_IN_SIZE: usize = 16;
const SOCKADDR_IN6_SIZE: usize = 28;

impl SocketAddress {
    pub fn new_ipv4(addr: Ipv4Addr, port: u16) -> SocketAddress {
        SocketAddress::Ipv4(SocketAddrV4::new(addr, port))
    }

    pub fn new_ipv6(addr: Ipv6Addr, port: u16) -> SocketAddress {
        SocketAddress::Ipv6(SocketAddrV6::new(addr, port, 0, 0))
    }

    pub fn new_unix<P: AsRef<Path>>(path: P) -> SocketAddress {
        use std::os::unix::ffi::OsStrExt;
        SocketAddress::Unix(path.as_ref().as_os_str().as_bytes().to_vec())
    }

    /// An abstract-namespace Unix address; `name` excludes the leading NUL.
    pub fn new_abstract(name: &[u8]) -> SocketAddress {
        let mut bytes = Vec::with_capacity(name.len() + 1);
        bytes.push(0u8);
        bytes.extend_from_slice(name);
        SocketAddress::Unix(bytes)
    }

    pub fn is_unspecified(&self) -> bool {
        matches!(self, SocketAddress::Unspecified)
    }

    pub fn is_set(&self) -> bool {
        !self.is_unspecified()
    }

    pub fn port(&self) -> u16 {
        match self {
            SocketAddress::Ipv4(a) => a.port(),
            SocketAddress::Ipv6(a) => a.port(),
            _ => 0,
        }
    }

    pub fn ipv4_addr(&self) -> Option<Ipv4Addr> {
        match self {
            SocketAddress::Ipv4(a) => Some(*a.ip()),
            _ => None,
        }
    }

    /// The raw address record, without the length prefix.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            SocketAddress::Unspecified => Vec::new(),
            SocketAddress::Ipv4(a) => {
                let mut out = vec![0u8; SOCKADDR_IN_SIZE];
                LittleEndian::write_u16(&mut out[0..2], libc::AF_INET as u16);
                BigEndian::write_u16(&mut out[2..4], a.port());
                out[4..8].copy_from_slice(&a.ip().octets());
                out
            }
            SocketAddress::Ipv6(a) => {
                let mut out = vec![0u8; SOCKADDR_IN6_SIZE];
                LittleEndian::write_u16(&mut out[0..2], libc::AF_INET6 as u16);
                BigEndian::write_u16(&mut out[2..4], a.port());
                LittleEndian::write_u32(&mut out[4..8], a.flowinfo());
                out[8..24].copy_from_slice(&a.ip().octets());
                LittleEndian::write_u32(&mut out[24..28], a.scope_id());
                out
            }
            SocketAddress::Unix(path) => {
                let mut out = vec![0u8; FAMILY_SIZE + path.len()];
                LittleEndian::write_u16(&mut out[0..2], libc::AF_UNIX as u16);
                out[2..].copy_from_slice(path);
                out
            }
        }
    }

    /// Inverse of `to_bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<SocketAddress> {
        if bytes.is_empty() {
            return Ok(SocketAddress::Unspecified);
        }
        if bytes.len() < FAMILY_SIZE {
            return Err(Error::protocol("socket address record too short"));
        }
        let family = LittleEndian::read_u16(&bytes[0..2]) as i32;
        match family {
            libc::AF_INET => {
                if bytes.len() < SOCKADDR_IN_SIZE {
                    return Err(Error::protocol("truncated sockaddr_in"));
                }
                let port = BigEndian::read_u16(&bytes[2..4]);
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&bytes[4..8]);
                Ok(SocketAddress::Ipv4(SocketAddrV4::new(octets.into(), port)))
            }
            libc::AF_INET6 => {
                if bytes.len() < SOCKADDR_IN6_SIZE {
                    return Err(Error::protocol("truncated sockaddr_in6"));
                }
                let port = BigEndian::read_u16(&bytes[2..4]);
                let flowinfo = LittleEndian::read_u32(&bytes[4..8]);
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&bytes[8..24]);
                let scope = LittleEndian::read_u32(&bytes[24..28]);
                Ok(SocketAddress::Ipv6(SocketAddrV6::new(
                    octets.into(),
                    port,
                    flowinfo,
                    scope,
                )))
            }
            libc::AF_UNIX => Ok(SocketAddress::Unix(bytes[FAMILY_SIZE..].to_vec())),
            _ => Err(Error::protocol(format!(
                "unsupported address family {}",
                family
            ))),
        }
    }

    /// Convert to the form `nix` socket calls expect.
    pub fn to_sockaddr(&self) -> Result<SockAddr> {
        match self {
            SocketAddress::Unspecified => {
                Err(Error::config("cannot use an unspecified socket address"))
            }
            SocketAddress::Ipv4(a) => Ok(SockAddr::new_inet(InetAddr::from_std(
                &SocketAddr::V4(*a),
            ))),
            SocketAddress::Ipv6(a) => Ok(SockAddr::new_inet(InetAddr::from_std(
                &SocketAddr::V6(*a),
            ))),
            SocketAddress::Unix(path) => {
                if path.first() == Some(&0) {
                    Ok(SockAddr::Unix(UnixAddr::new_abstract(&path[1..])?))
                } else {
                    let p: PathBuf = {
                        use std::os::unix::ffi::OsStrExt;
                        Path::new(std::ffi::OsStr::from_bytes(path)).to_path_buf()
                    };
                    Ok(SockAddr::new_unix(&p)?)
                }
            }
        }
    }

    pub fn from_sockaddr(addr: &SockAddr) -> SocketAddress {
        match addr {
            SockAddr::Inet(inet) => match inet.to_std() {
                SocketAddr::V4(a) => SocketAddress::Ipv4(a),
                SocketAddr::V6(a) => SocketAddress::Ipv6(a),
            },
            SockAddr::Unix(unix) => {
                if let Some(name) = unix.as_abstract() {
                    SocketAddress::new_abstract(name)
                } else if let Some(path) = unix.path() {
                    SocketAddress::new_unix(path)
                } else {
                    SocketAddress::Unspecified
                }
            }
            _ => SocketAddress::Unspecified,
        }
    }
}

impl Default for SocketAddress {
    fn default() -> SocketAddress {
        SocketAddress::Unspecified
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketAddress::Unspecified => write!(f, "*"),
            SocketAddress::Ipv4(a) => write!(f, "{}", a),
            SocketAddress::Ipv6(a) => write!(f, "{}", a),
            SocketAddress::Unix(path) => {
                if path.first() == Some(&0) {
                    write!(f, "@{}", String::from_utf8_lossy(&path[1..]))
                } else {
                    write!(f, "{}", String::from_utf8_lossy(path))
                }
            }
        }
    }
}

impl fmt::Debug for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Accepts `a.b.c.d:port`, `[v6]:port`, an absolute path, or `@name` for
/// abstract Unix sockets.
impl FromStr for SocketAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<SocketAddress> {
        if s == "*" || s.is_empty() {
            return Ok(SocketAddress::Unspecified);
        }
        if let Some(name) = s.strip_prefix('@') {
            return Ok(SocketAddress::new_abstract(name.as_bytes()));
        }
        if s.starts_with('/') {
            return Ok(SocketAddress::new_unix(s));
        }
        match s.parse::<SocketAddr>() {
            Ok(SocketAddr::V4(a)) => Ok(SocketAddress::Ipv4(a)),
            Ok(SocketAddr::V6(a)) => Ok(SocketAddress::Ipv6(a)),
            Err(_) => Err(Error::config(format!("bad socket address {:?}", s))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trip() {
        let inputs = [
            SocketAddress::Unspecified,
            SocketAddress::new_ipv4(Ipv4Addr::new(127, 0, 0, 1), 2222),
            SocketAddress::new_ipv4(Ipv4Addr::new(127, 0, 0, 1), 0),
            SocketAddress::new_ipv4(Ipv4Addr::new(84, 10, 32, 12), 321),
            SocketAddress::new_abstract(b"/tmp/.sock"),
            SocketAddress::new_unix("/tmp/.sock"),
            SocketAddress::new_ipv6("::ffff:127.1.2.3".parse().unwrap(), 333),
        ];
        for a in &inputs {
            let bytes = a.to_bytes();
            let b = SocketAddress::from_bytes(&bytes).unwrap();
            assert_eq!(*a, b, "{}", a);
        }
    }

    #[test]
    fn parse_forms() {
        assert_eq!(
            "127.0.0.1:2222".parse::<SocketAddress>().unwrap(),
            SocketAddress::new_ipv4(Ipv4Addr::new(127, 0, 0, 1), 2222)
        );
        assert_eq!(
            "@hive".parse::<SocketAddress>().unwrap(),
            SocketAddress::new_abstract(b"hive")
        );
        assert_eq!(
            "/run/hive.sock".parse::<SocketAddress>().unwrap(),
            SocketAddress::new_unix("/run/hive.sock")
        );
        assert!("nonsense".parse::<SocketAddress>().is_err());
    }

    #[test]
    fn truncated_records_are_protocol_errors() {
        let good = SocketAddress::new_ipv4(Ipv4Addr::new(1, 2, 3, 4), 5).to_bytes();
        assert!(SocketAddress::from_bytes(&good[..7]).is_err());
    }
}
