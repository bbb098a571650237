use std::net::{Ipv4Addr, Ipv6Addr};
use std::ops::{Deref, DerefMut};
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use log::trace;
use nix::errno::Errno;
use static_assertions::const_assert_eq;

use crate::error::{Error, Result};
use crate::interface_address::InterfaceAddress;
use crate::kernel::{ForeignKernel, Kernel, KernelPtr};
use crate::socket_address::SocketAddress;
use crate::type_registry::TypeRegistry;

/// Every packet starts with a 4-byte big-endian length that counts itself;
/// all other integers on the wire are little-endian.
pub const FRAME_HEADER_SIZE: usize = 4;
const_assert_eq!(FRAME_HEADER_SIZE, std::mem::size_of::<u32>());

const MIN_CAPACITY: usize = 256;

/// A growable byte buffer with a `position` cursor and a `limit`, in the
/// style of a flip buffer: typed writes advance `position`; `flip` turns
/// written bytes into readable bytes; `compact` moves unread bytes to the
/// front so the buffer can be filled again.
pub struct KernelBuffer {
    data: Vec<u8>,
    position: usize,
    limit: usize,
    types: Option<Arc<TypeRegistry>>,
}

impl KernelBuffer {
    pub fn new() -> KernelBuffer {
        KernelBuffer::with_capacity(page_size())
    }

    pub fn with_capacity(capacity: usize) -> KernelBuffer {
        let capacity = capacity.max(MIN_CAPACITY);
        KernelBuffer {
            data: vec![0; capacity],
            position: 0,
            limit: capacity,
            types: None,
        }
    }

    pub fn types(&self) -> Option<&Arc<TypeRegistry>> {
        self.types.as_ref()
    }

    pub fn set_types(&mut self, types: Arc<TypeRegistry>) {
        self.types = Some(types);
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn set_position(&mut self, rhs: usize) {
        self.position = rhs;
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn set_limit(&mut self, rhs: usize) {
        self.limit = rhs;
    }

    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    /// Advance the cursor without writing.
    pub fn bump(&mut self, n: usize) {
        self.position += n;
    }

    /// Switch from writing to reading: the written region becomes the
    /// readable region.
    pub fn flip(&mut self) {
        self.limit = self.position;
        self.position = 0;
    }

    /// Move unread bytes to the front and reopen the buffer for writing.
    pub fn compact(&mut self) {
        let len = self.limit - self.position;
        self.data.copy_within(self.position..self.limit, 0);
        self.position = len;
        self.limit = self.data.len();
    }

    pub fn clear(&mut self) {
        self.position = 0;
        self.limit = self.data.len();
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn grow(&mut self, n: usize) {
        if self.position + n > self.data.len() {
            let new_len = (self.data.len() * 2).max(self.position + n);
            self.data.resize(new_len, 0);
            self.limit = self.data.len();
        }
    }

    // -- primitive writes (little-endian) ---------------------------------

    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.grow(bytes.len());
        self.data[self.position..self.position + bytes.len()].copy_from_slice(bytes);
        self.position += bytes.len();
    }

    pub fn write_u8(&mut self, v: u8) {
        self.write_raw(&[v]);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.write_u8(v as u8);
    }

    pub fn write_u16(&mut self, v: u16) {
        let mut b = [0u8; 2];
        LittleEndian::write_u16(&mut b, v);
        self.write_raw(&b);
    }

    pub fn write_u32(&mut self, v: u32) {
        let mut b = [0u8; 4];
        LittleEndian::write_u32(&mut b, v);
        self.write_raw(&b);
    }

    pub fn write_u64(&mut self, v: u64) {
        let mut b = [0u8; 8];
        LittleEndian::write_u64(&mut b, v);
        self.write_raw(&b);
    }

    pub fn write_i32(&mut self, v: i32) {
        self.write_u32(v as u32);
    }

    pub fn write_str(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.write_raw(s.as_bytes());
    }

    pub fn write_time_point(&mut self, t: SystemTime) {
        let nanos = t
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        self.write_u64(nanos);
    }

    pub fn write_ipv4_address(&mut self, addr: Ipv4Addr) {
        self.write_raw(&addr.octets());
    }

    pub fn write_ipv6_address(&mut self, addr: Ipv6Addr) {
        self.write_raw(&addr.octets());
    }

    pub fn write_interface_address(&mut self, ifa: &InterfaceAddress) {
        self.write_ipv4_address(ifa.address());
        self.write_ipv4_address(ifa.netmask());
    }

    pub fn write_socket_address(&mut self, addr: &SocketAddress) {
        let bytes = addr.to_bytes();
        self.write_u16(bytes.len() as u16);
        self.write_raw(&bytes);
    }

    // -- primitive reads --------------------------------------------------

    pub fn read_raw(&mut self, out: &mut [u8]) -> Result<()> {
        if self.remaining() < out.len() {
            return Err(Error::protocol("buffer underflow"));
        }
        out.copy_from_slice(&self.data[self.position..self.position + out.len()]);
        self.position += out.len();
        Ok(())
    }

    pub fn read_remaining(&mut self) -> Vec<u8> {
        let out = self.data[self.position..self.limit].to_vec();
        self.position = self.limit;
        out
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read_raw(&mut b)?;
        Ok(b[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let mut b = [0u8; 2];
        self.read_raw(&mut b)?;
        Ok(LittleEndian::read_u16(&b))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read_raw(&mut b)?;
        Ok(LittleEndian::read_u32(&b))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        self.read_raw(&mut b)?;
        Ok(LittleEndian::read_u64(&b))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_str(&mut self) -> Result<String> {
        let n = self.read_u32()? as usize;
        if self.remaining() < n {
            return Err(Error::protocol("truncated string"));
        }
        let mut bytes = vec![0u8; n];
        self.read_raw(&mut bytes)?;
        String::from_utf8(bytes).map_err(|_| Error::protocol("string is not utf-8"))
    }

    pub fn read_time_point(&mut self) -> Result<SystemTime> {
        let nanos = self.read_u64()?;
        Ok(UNIX_EPOCH + Duration::from_nanos(nanos))
    }

    pub fn read_ipv4_address(&mut self) -> Result<Ipv4Addr> {
        let mut b = [0u8; 4];
        self.read_raw(&mut b)?;
        Ok(b.into())
    }

    pub fn read_ipv6_address(&mut self) -> Result<Ipv6Addr> {
        let mut b = [0u8; 16];
        self.read_raw(&mut b)?;
        Ok(b.into())
    }

    pub fn read_interface_address(&mut self) -> Result<InterfaceAddress> {
        let address = self.read_ipv4_address()?;
        let netmask = self.read_ipv4_address()?;
        Ok(InterfaceAddress::new(address, netmask))
    }

    pub fn read_socket_address(&mut self) -> Result<SocketAddress> {
        let n = self.read_u16()? as usize;
        if self.remaining() < n {
            return Err(Error::protocol("truncated socket address"));
        }
        let mut bytes = vec![0u8; n];
        self.read_raw(&mut bytes)?;
        SocketAddress::from_bytes(&bytes)
    }

    // -- kernels ----------------------------------------------------------

    pub(crate) fn write_native(&mut self, k: &dyn Kernel) -> Result<()> {
        let types = self
            .types
            .clone()
            .ok_or_else(|| Error::protocol("no kernel types"))?;
        let id = types
            .find_id(k.type_index())
            .ok_or_else(|| Error::protocol("unregistered kernel type"))?;
        self.write_u16(id);
        k.write(self)
    }

    fn read_native(&mut self) -> Result<KernelPtr> {
        let id = self.read_u16()?;
        let types = self
            .types
            .clone()
            .ok_or_else(|| Error::protocol("no kernel types"))?;
        let mut k = types
            .construct(id)
            .ok_or_else(|| Error::protocol(format!("no kernel type for id {}", id)))?;
        k.read(self)?;
        Ok(k)
    }

    /// Serialize a kernel: header, type id and body, and the embedded
    /// parent when the kernel carries it. Foreign kernels copy their
    /// payload verbatim. A carried parent that is only known by id is
    /// serialized in place from the instance registry, where it stays
    /// suspended.
    pub fn write_kernel(
        &mut self,
        k: &dyn Kernel,
        instances: Option<&crate::instance_registry::InstanceRegistry>,
    ) -> Result<()> {
        k.base().write_header(self)?;
        if k.is_foreign() {
            k.write(self)
        } else {
            self.write_native(k)?;
            if k.base().carries_parent() {
                match k.base().parent() {
                    crate::kernel::ChainLink::Owned(parent) => self.write_native(&**parent)?,
                    crate::kernel::ChainLink::Id(id) => {
                        let registry = instances
                            .ok_or_else(|| Error::protocol("carried parent is not reachable"))?;
                        match registry.with(*id, |p| self.write_native(p)) {
                            Some(result) => result?,
                            None => {
                                return Err(Error::protocol(format!(
                                    "carried parent {} is not suspended here",
                                    id
                                )));
                            }
                        }
                    }
                    crate::kernel::ChainLink::None => {
                        return Err(Error::protocol("carried parent is missing"));
                    }
                }
            }
            Ok(())
        }
    }

    /// Deserialize one kernel out of the current frame. A kernel whose
    /// target application is not `this_application` is returned as an
    /// untyped [`ForeignKernel`] envelope for the caller to forward.
    pub fn read_kernel(&mut self, this_application: u64) -> Result<KernelPtr> {
        let mut envelope = ForeignKernel::new();
        envelope.base_mut().read_header(self)?;
        if envelope.base().target_application_id() != this_application {
            envelope.read(self)?;
            trace!("buf: read foreign {:?}", envelope.base());
            return Ok(Box::new(envelope));
        }
        let id = self.read_u16()?;
        let types = self
            .types
            .clone()
            .ok_or_else(|| Error::protocol("no kernel types"))?;
        let mut k = types
            .construct(id)
            .ok_or_else(|| Error::protocol(format!("no kernel type for id {}", id)))?;
        // The body read is gated on the header's field mask (the node
        // filter in particular), so the mask must be in place first.
        k.base_mut().set_fields(envelope.base().fields());
        k.read(self)?;
        k.base_mut().swap_header(envelope.base_mut());
        if k.base().carries_parent() {
            let parent = self.read_native()?;
            k.base_mut().set_parent_owned(parent);
        }
        Ok(k)
    }

    // -- fd plumbing ------------------------------------------------------

    /// Read from `fd` until it would block, growing as needed. Returns the
    /// number of bytes read and whether end-of-stream was reached.
    pub fn fill(&mut self, fd: RawFd) -> Result<(usize, bool)> {
        let mut total = 0usize;
        loop {
            if self.position == self.data.len() {
                self.grow(page_size());
            }
            match nix::unistd::read(fd, &mut self.data[self.position..]) {
                Ok(0) => return Ok((total, true)),
                Ok(n) => {
                    self.position += n;
                    total += n;
                }
                Err(e) if errno_is(&e, Errno::EAGAIN) => return Ok((total, false)),
                Err(e) if errno_is(&e, Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Write the readable region to `fd` until done or it would block.
    pub fn flush(&mut self, fd: RawFd) -> Result<usize> {
        let mut total = 0usize;
        while self.position < self.limit {
            match nix::unistd::write(fd, &self.data[self.position..self.limit]) {
                Ok(n) => {
                    self.position += n;
                    total += n;
                }
                Err(e) if errno_is(&e, Errno::EAGAIN) => break,
                Err(e) if errno_is(&e, Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }
}

impl Default for KernelBuffer {
    fn default() -> KernelBuffer {
        KernelBuffer::new()
    }
}

pub(crate) fn errno_is(e: &nix::Error, errno: Errno) -> bool {
    e.as_errno() == Some(errno)
}

pub(crate) fn page_size() -> usize {
    // SAFETY: sysconf with a valid name has no preconditions.
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n <= 0 {
        4096
    } else {
        n as usize
    }
}

/// Reserves the frame header, lets the caller write the body through
/// `Deref`, then backfills the big-endian length on drop. A frame with an
/// empty body is discarded: the buffer position rewinds and nothing reaches
/// the wire.
pub struct KernelWriteGuard<'a> {
    buffer: &'a mut KernelBuffer,
    old_position: usize,
}

impl<'a> KernelWriteGuard<'a> {
    pub fn new(buffer: &'a mut KernelBuffer) -> KernelWriteGuard<'a> {
        let old_position = buffer.position();
        buffer.grow(FRAME_HEADER_SIZE);
        buffer.bump(FRAME_HEADER_SIZE);
        KernelWriteGuard {
            buffer,
            old_position,
        }
    }

    /// Discard everything written inside this guard.
    pub fn cancel(&mut self) {
        self.buffer.set_position(self.old_position);
    }
}

impl<'a> Drop for KernelWriteGuard<'a> {
    fn drop(&mut self) {
        let new_position = self.buffer.position();
        if new_position <= self.old_position + FRAME_HEADER_SIZE {
            self.buffer.set_position(self.old_position);
            return;
        }
        let size = (new_position - self.old_position) as u32;
        let header = &mut self.buffer.data[self.old_position..self.old_position + FRAME_HEADER_SIZE];
        BigEndian::write_u32(header, size);
    }
}

impl<'a> Deref for KernelWriteGuard<'a> {
    type Target = KernelBuffer;

    fn deref(&self) -> &KernelBuffer {
        self.buffer
    }
}

impl<'a> DerefMut for KernelWriteGuard<'a> {
    fn deref_mut(&mut self) -> &mut KernelBuffer {
        self.buffer
    }
}

/// Opens the next frame for reading. When a whole frame is buffered the
/// guard narrows the limit to the frame's end so nested readers cannot run
/// past it; on scope exit the position lands exactly at the frame boundary
/// and the limit is restored. When the frame is incomplete the guard is not
/// "good" and the buffer is left untouched.
pub struct KernelReadGuard<'a> {
    buffer: &'a mut KernelBuffer,
    old_limit: usize,
    good: bool,
}

impl<'a> KernelReadGuard<'a> {
    pub fn new(buffer: &'a mut KernelBuffer) -> KernelReadGuard<'a> {
        let old_limit = buffer.limit();
        let mut good = false;
        if buffer.remaining() >= FRAME_HEADER_SIZE {
            let p = buffer.position();
            let size = BigEndian::read_u32(&buffer.data[p..p + FRAME_HEADER_SIZE]) as usize;
            if size >= FRAME_HEADER_SIZE && buffer.remaining() >= size {
                buffer.set_limit(p + size);
                buffer.bump(FRAME_HEADER_SIZE);
                good = true;
            }
        }
        KernelReadGuard {
            buffer,
            old_limit,
            good,
        }
    }

    pub fn is_good(&self) -> bool {
        self.good
    }
}

impl<'a> Drop for KernelReadGuard<'a> {
    fn drop(&mut self) {
        if self.good {
            let limit = self.buffer.limit();
            self.buffer.set_position(limit);
            self.buffer.set_limit(self.old_limit);
        }
    }
}

impl<'a> Deref for KernelReadGuard<'a> {
    type Target = KernelBuffer;

    fn deref(&self) -> &KernelBuffer {
        self.buffer
    }
}

impl<'a> DerefMut for KernelReadGuard<'a> {
    fn deref_mut(&mut self) -> &mut KernelBuffer {
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelBase;
    use std::net::Ipv4Addr;

    #[test]
    fn frame_round_trip() {
        let mut buf = KernelBuffer::new();
        {
            let mut g = KernelWriteGuard::new(&mut buf);
            g.write_u32(123);
        }
        buf.flip();
        {
            let mut g = KernelReadGuard::new(&mut buf);
            assert!(g.is_good());
            assert_eq!(g.read_u32().unwrap(), 123);
            assert_eq!(g.position(), g.limit());
            assert!(g.read_u8().is_err());
        }
        buf.compact();
        assert_eq!(buf.position(), 0);
    }

    #[test]
    fn empty_frame_rewinds() {
        let mut buf = KernelBuffer::new();
        {
            let _g = KernelWriteGuard::new(&mut buf);
        }
        assert_eq!(buf.position(), 0);
        buf.flip();
        assert_eq!(buf.position(), 0);
        assert_eq!(buf.limit(), 0);
        {
            let g = KernelReadGuard::new(&mut buf);
            assert!(!g.is_good());
            assert_eq!(g.position(), 0);
            assert_eq!(g.limit(), 0);
        }
        buf.compact();
        assert_eq!(buf.position(), 0);
    }

    #[test]
    fn partial_frame_is_left_in_place() {
        let mut buf = KernelBuffer::new();
        {
            let mut g = KernelWriteGuard::new(&mut buf);
            g.write_u64(7);
        }
        buf.flip();
        // Narrow the readable region to a prefix of the frame.
        let full = buf.limit();
        buf.set_limit(full - 1);
        {
            let g = KernelReadGuard::new(&mut buf);
            assert!(!g.is_good());
        }
        assert_eq!(buf.position(), 0, "partial frame must not be consumed");
        buf.set_limit(full);
        {
            let mut g = KernelReadGuard::new(&mut buf);
            assert!(g.is_good());
            assert_eq!(g.read_u64().unwrap(), 7);
        }
    }

    #[test]
    fn socket_address_round_trip() {
        let inputs = [
            SocketAddress::Unspecified,
            SocketAddress::new_ipv4(Ipv4Addr::new(127, 0, 0, 1), 2222),
            SocketAddress::new_ipv4(Ipv4Addr::new(84, 10, 32, 12), 321),
            SocketAddress::new_abstract(b"/tmp/.sock"),
            SocketAddress::new_ipv6("::ffff:127.1.2.3".parse().unwrap(), 333),
        ];
        for a in &inputs {
            let mut buf = KernelBuffer::new();
            buf.write_socket_address(a);
            buf.flip();
            let b = buf.read_socket_address().unwrap();
            assert_eq!(*a, b);
            assert_eq!(buf.position(), buf.limit());
            assert!(buf.read_u8().is_err());
        }
    }

    #[test]
    fn interface_address_round_trip() {
        let inputs = [
            "127.0.0.1/8".parse::<InterfaceAddress>().unwrap(),
            "10.0.0.3/24".parse::<InterfaceAddress>().unwrap(),
        ];
        for a in &inputs {
            let mut buf = KernelBuffer::new();
            buf.write_interface_address(a);
            buf.flip();
            let b = buf.read_interface_address().unwrap();
            assert_eq!(*a, b);
            assert_eq!(buf.position(), buf.limit());
        }
    }

    #[test]
    fn base_kernel_round_trip() {
        let mut a = KernelBase::new();
        a.set_id(77);
        a.set_parent_id(5);
        a.set_path("/var/data/chunk-3");
        a.set_weight(9);
        let mut buf = KernelBuffer::new();
        a.write(&mut buf).unwrap();
        buf.flip();
        let mut b = KernelBase::new();
        b.read(&mut buf).unwrap();
        assert_eq!(b.id(), 77);
        assert_eq!(b.parent_id(), 5);
        assert_eq!(b.path(), "/var/data/chunk-3");
        assert_eq!(b.weight(), 9);
        assert_eq!(b.result(), a.result());
        assert_eq!(buf.position(), buf.limit());
    }

    #[test]
    fn string_round_trip() {
        let mut buf = KernelBuffer::new();
        buf.write_str("päth/to/data");
        buf.flip();
        assert_eq!(buf.read_str().unwrap(), "päth/to/data");
    }
}
