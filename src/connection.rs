use std::collections::VecDeque;
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, trace, warn};

use crate::error::Result;
use crate::instance_registry::InstanceRegistry;
use crate::kernel::{ExitCode, KernelPtr};
use crate::kernel_buffer::{KernelBuffer, KernelReadGuard, KernelWriteGuard};
use crate::pipeline::Pipeline;
use crate::socket_address::SocketAddress;
use crate::transaction_log::TransactionLog;
use crate::type_registry::TypeRegistry;

bitflags::bitflags! {
    pub struct ConnectionFlags: u32 {
        const SAVE_UPSTREAM_KERNELS = 1 << 0;
        const SAVE_DOWNSTREAM_KERNELS = 1 << 1;
        const WRITE_TRANSACTION_LOG = 1 << 2;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Initial,
    Starting,
    Started,
    Stopping,
    Stopped,
    Inactive,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Initial => "initial",
            ConnectionState::Starting => "starting",
            ConnectionState::Started => "started",
            ConnectionState::Stopping => "stopping",
            ConnectionState::Stopped => "stopped",
            ConnectionState::Inactive => "inactive",
        })
    }
}

/// Where a connection's kernels go after they are received.
#[derive(Clone)]
pub struct Router {
    /// The local parallel pipeline.
    pub native: Arc<dyn Pipeline>,
    /// Picks a peer for upstream kernels; recovery resubmits here.
    pub remote: Option<Arc<dyn Pipeline>>,
}

impl Router {
    pub fn send_native(&self, k: KernelPtr) {
        self.native.send(k);
    }

    /// Resubmit upstream; falls back to a local bounce when the process has
    /// no way out.
    pub fn send_remote(&self, mut k: KernelPtr) {
        match &self.remote {
            Some(remote) => remote.send(k),
            None if k.base().parent().is_set() => {
                k.base_mut().return_to_parent(ExitCode::EndpointNotConnected);
                self.native.send(k);
            }
            None => log::debug!("dropping unroutable kernel {:?}", k.base()),
        }
    }
}

/// A kernel produced by the receive loop, ready for pipeline-specific
/// routing.
pub enum Received {
    Native(KernelPtr),
    Foreign(KernelPtr),
}

/// Per-peer protocol state: buffers, retention queues and the connection
/// state machine. The transport stays outside; pipelines drive this object
/// with raw descriptors.
pub struct Connection {
    name: &'static str,
    state: ConnectionState,
    flags: ConnectionFlags,
    socket_address: SocketAddress,
    start_time: Option<Instant>,
    attempts: u32,
    input: KernelBuffer,
    output: KernelBuffer,
    /// Sent kernels that move away from this node, kept for resending.
    upstream: VecDeque<KernelPtr>,
    /// Sent downstream kernels that carry their parent, kept because loss
    /// would orphan the parent.
    downstream: VecDeque<KernelPtr>,
    this_application: u64,
    instances: Arc<InstanceRegistry>,
    transaction_log: Option<Arc<TransactionLog>>,
    pipeline_index: u16,
}

impl Connection {
    pub fn new(
        name: &'static str,
        types: Arc<TypeRegistry>,
        instances: Arc<InstanceRegistry>,
        this_application: u64,
    ) -> Connection {
        let mut input = KernelBuffer::new();
        let mut output = KernelBuffer::new();
        input.set_types(types.clone());
        output.set_types(types);
        Connection {
            name,
            state: ConnectionState::Initial,
            flags: ConnectionFlags::empty(),
            socket_address: SocketAddress::Unspecified,
            start_time: None,
            attempts: 1,
            input,
            output,
            upstream: VecDeque::new(),
            downstream: VecDeque::new(),
            this_application,
            instances,
            transaction_log: None,
            pipeline_index: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn set_state(&mut self, rhs: ConnectionState) {
        self.state = rhs;
        if rhs == ConnectionState::Starting {
            self.start_time = Some(Instant::now());
        }
    }

    pub fn start_time(&self) -> Option<Instant> {
        self.start_time
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn bump_attempts(&mut self) {
        self.attempts += 1;
    }

    pub fn setf(&mut self, f: ConnectionFlags) {
        self.flags |= f;
    }

    pub fn flags(&self) -> ConnectionFlags {
        self.flags
    }

    pub fn socket_address(&self) -> &SocketAddress {
        &self.socket_address
    }

    pub fn set_socket_address(&mut self, rhs: SocketAddress) {
        self.socket_address = rhs;
    }

    pub fn set_transaction_log(&mut self, log: Arc<TransactionLog>, pipeline_index: u16) {
        self.transaction_log = Some(log);
        self.pipeline_index = pipeline_index;
        self.flags |= ConnectionFlags::WRITE_TRANSACTION_LOG;
    }

    pub fn has_output(&self) -> bool {
        self.output.position() > 0
    }

    /// Serialize and queue `k` for transmission, retaining it according to
    /// its direction of travel.
    pub fn send(&mut self, mut k: KernelPtr) {
        k.base_mut().ensure_id();
        trace!("{}: send to {} {:?}", self.name, self.socket_address, k.base());
        let retain_upstream = (k.base().moves_upstream() || k.base().moves_somewhere())
            && self.flags.contains(ConnectionFlags::SAVE_UPSTREAM_KERNELS);
        let retain_downstream = k.base().moves_downstream()
            && k.base().carries_parent()
            && self.flags.contains(ConnectionFlags::SAVE_DOWNSTREAM_KERNELS);
        if retain_upstream && self.flags.contains(ConnectionFlags::WRITE_TRANSACTION_LOG) {
            if let Some(log) = &self.transaction_log {
                if let Err(e) = log.write_start(self.pipeline_index, &*k, &self.instances) {
                    warn!("{}: transaction log: {}", self.name, e);
                }
            }
        }
        self.write_kernel(&*k);
        if retain_upstream {
            self.upstream.push_back(k);
        } else if retain_downstream {
            self.downstream.push_back(k);
        }
        // Broadcasts and plain downstream kernels are dropped after write.
    }

    fn write_kernel(&mut self, k: &dyn crate::kernel::Kernel) {
        let instances = self.instances.clone();
        let mut guard = KernelWriteGuard::new(&mut self.output);
        if let Err(e) = guard.write_kernel(k, Some(&instances)) {
            warn!("write error: {}", e);
            guard.cancel();
        }
    }

    /// Copy a foreign kernel's framed bytes into the output buffer. The
    /// payload is never deserialized, and the caller keeps the kernel, so
    /// one envelope can fan out to several links.
    pub fn forward(&mut self, k: &dyn crate::kernel::Kernel) {
        trace!("{}: forward {:?}", self.name, k.base());
        self.write_kernel(k);
    }

    /// Pull bytes from `fd`; returns true at end-of-stream.
    pub fn fill(&mut self, fd: RawFd) -> Result<bool> {
        let (_, eof) = self.input.fill(fd)?;
        Ok(eof)
    }

    /// Decode every complete frame buffered so far. Kernels that cannot be
    /// delivered here are bounced back to the sender; the rest come out as
    /// [`Received`] for the owning pipeline to route.
    pub fn receive(&mut self) -> Vec<Received> {
        let mut out = Vec::new();
        let mut bounced = Vec::new();
        self.input.flip();
        loop {
            let kernel = {
                let mut guard = KernelReadGuard::new(&mut self.input);
                if !guard.is_good() {
                    break;
                }
                let this_application = self.this_application;
                guard.read_kernel(this_application)
            };
            match kernel {
                Ok(k) if k.is_foreign() => out.push(Received::Foreign(k)),
                Ok(mut k) => {
                    if !k.base().source().is_set() {
                        k.base_mut().set_source(self.socket_address.clone());
                    }
                    match self.receive_kernel(k) {
                        Ok(k) => out.push(Received::Native(k)),
                        Err(k) => bounced.push(k),
                    }
                }
                Err(e) => {
                    // One bad packet does not kill the link.
                    warn!("{}: read error: {}", self.name, e);
                }
            }
        }
        self.input.compact();
        for mut k in bounced {
            debug!("{}: bouncing {:?}", self.name, k.base());
            let parent = k.base().parent_id();
            k.base_mut().set_principal_id(parent);
            k.base_mut().swap_source_destination();
            self.send(k);
        }
        out
    }

    /// Attach local state to an arriving kernel: plug the retained parent
    /// into a returning completion, or verify that the addressed principal
    /// lives here. `Err` means the kernel must be bounced.
    fn receive_kernel(
        &mut self,
        mut k: KernelPtr,
    ) -> std::result::Result<KernelPtr, KernelPtr> {
        trace!("{}: recv {:?}", self.name, k.base());
        if k.base().moves_downstream() {
            self.plug_parent(&mut k);
            Ok(k)
        } else if k.base().principal_id() != 0 {
            if self.instances.contains(k.base().principal_id()) {
                Ok(k)
            } else {
                debug!("{}: no principal found for {:?}", self.name, k.base());
                k.base_mut().set_result(ExitCode::NoPrincipalFound);
                Err(k)
            }
        } else {
            Ok(k)
        }
    }

    /// Find the retained original of a returning kernel by id, move its
    /// parent link over and drop the original, so the completion is
    /// delivered exactly once.
    fn plug_parent(&mut self, k: &mut KernelPtr) {
        let id = k.base().id();
        if id == 0 {
            return;
        }
        let position = self
            .upstream
            .iter()
            .position(|orig| orig.base().id() == id);
        if let Some(position) = position {
            let mut original = self.upstream.remove(position).unwrap();
            let parent = original.base_mut().take_parent_link();
            let parent_id = parent.id();
            k.base_mut().set_parent_link(parent);
            k.base_mut().set_principal_id(parent_id);
            trace!("{}: plugged parent {} into {:?}", self.name, parent_id, k.base());
        }
    }

    /// Write buffered output to `fd`, keeping whatever does not fit.
    pub fn flush(&mut self, fd: RawFd) -> Result<()> {
        if self.output.position() == 0 {
            return Ok(());
        }
        self.output.flip();
        let result = self.output.flush(fd);
        self.output.compact();
        result.map(|_| ())
    }

    /// The link is gone: dispose of every retained kernel so that nothing
    /// acknowledged by upstream submission is lost while this node lives.
    pub fn recover(&mut self, router: &Router) {
        let upstream: Vec<_> = self.upstream.drain(..).collect();
        let downstream: Vec<_> = self.downstream.drain(..).collect();
        for k in upstream.into_iter().chain(downstream) {
            self.recover_kernel(k, router);
        }
    }

    fn recover_kernel(&mut self, mut k: KernelPtr, router: &Router) {
        if k.base().moves_upstream() {
            debug!("{}: recover {:?}", self.name, k.base());
            k.base_mut().set_destination(SocketAddress::Unspecified);
            router.send_remote(k);
        } else if k.base().moves_somewhere() {
            debug!("{}: destination unreachable for {:?}", self.name, k.base());
            k.base_mut().swap_source_destination();
            k.base_mut().return_to_parent(ExitCode::EndpointNotConnected);
            router.send_native(k);
        } else if k.base().moves_downstream() && k.base().carries_parent() {
            debug!("{}: restore parent of {:?}", self.name, k.base());
            router.send_native(k);
        } else {
            warn!("{}: bad kernel in sent buffer: {:?}", self.name, k.base());
        }
    }

    /// Abandon buffers and queues; retained kernels land in `sack`.
    pub fn clear(&mut self, sack: &mut Vec<KernelPtr>) {
        sack.extend(self.upstream.drain(..));
        sack.extend(self.downstream.drain(..));
        self.input.clear();
        self.output.clear();
    }

    pub fn num_retained(&self) -> (usize, usize) {
        (self.upstream.len(), self.downstream.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{Context, Kernel, KernelBase, KernelFlags};
    use crate::pipeline::KernelSack;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Ping {
        base: KernelBase,
        payload: u32,
    }

    impl Kernel for Ping {
        fn base(&self) -> &KernelBase {
            &self.base
        }
        fn base_mut(&mut self) -> &mut KernelBase {
            &mut self.base
        }
        fn act(&mut self, _ctx: &mut Context) {}
        fn write(&self, out: &mut KernelBuffer) -> Result<()> {
            self.base.write(out)?;
            out.write_u32(self.payload);
            Ok(())
        }
        fn read(&mut self, input: &mut KernelBuffer) -> Result<()> {
            self.base.read(input)?;
            self.payload = input.read_u32()?;
            Ok(())
        }
    }

    #[derive(Default)]
    struct CollectingPipeline {
        kernels: Mutex<Vec<KernelPtr>>,
    }

    impl Pipeline for CollectingPipeline {
        fn send(&self, k: KernelPtr) {
            self.kernels.lock().unwrap().push(k);
        }
    }

    fn types() -> Arc<TypeRegistry> {
        let t = TypeRegistry::new();
        t.register::<Ping>(101).unwrap();
        Arc::new(t)
    }

    fn connection(instances: Arc<InstanceRegistry>) -> Connection {
        let mut c = Connection::new("test", types(), instances, 0);
        c.setf(ConnectionFlags::SAVE_UPSTREAM_KERNELS | ConnectionFlags::SAVE_DOWNSTREAM_KERNELS);
        c.set_socket_address(SocketAddress::new_abstract(b"peer"));
        c
    }

    /// Move bytes from one connection's output into another's input.
    fn shovel(from: &mut Connection, to: &mut Connection) {
        from.output.flip();
        let bytes = from.output.read_remaining();
        from.output.compact();
        to.input.write_raw(&bytes);
    }

    #[test]
    fn upstream_kernel_is_retained_and_round_trips() {
        let instances_a = Arc::new(InstanceRegistry::new());
        let instances_b = Arc::new(InstanceRegistry::new());
        let mut a = connection(instances_a);
        let mut b = connection(instances_b);
        let mut k = Box::new(Ping::default());
        k.payload = 7;
        k.base_mut().set_parent_id(500);
        assert!(k.base().moves_upstream());
        a.send(k);
        assert_eq!(a.num_retained(), (1, 0));
        shovel(&mut a, &mut b);
        let received = b.receive();
        assert_eq!(received.len(), 1);
        match &received[0] {
            Received::Native(k) => {
                let ping = (**k).downcast_ref::<Ping>().unwrap();
                assert_eq!(ping.payload, 7);
                assert!(ping.base().source().is_set());
            }
            _ => panic!("expected a native kernel"),
        }
    }

    #[test]
    fn downstream_return_plugs_the_parent() {
        let instances = Arc::new(InstanceRegistry::new());
        let mut a = connection(instances.clone());
        let mut b = connection(Arc::new(InstanceRegistry::new()));
        let mut k = Box::new(Ping::default());
        k.base_mut().set_parent_id(500);
        a.send(k);
        shovel(&mut a, &mut b);
        let mut received = b.receive();
        let mut k = match received.remove(0) {
            Received::Native(k) => k,
            _ => panic!(),
        };
        // Remote side completes the kernel and sends it back.
        k.base_mut().return_to_parent(ExitCode::Success);
        b.send(k);
        shovel(&mut b, &mut a);
        let mut received = a.receive();
        assert_eq!(received.len(), 1);
        let k = match received.remove(0) {
            Received::Native(k) => k,
            _ => panic!(),
        };
        assert_eq!(k.base().principal_id(), 500);
        assert!(k.base().moves_downstream());
        // The retained original is gone: delivered exactly once.
        assert_eq!(a.num_retained(), (0, 0));
    }

    #[test]
    fn missing_principal_is_bounced() {
        let mut a = connection(Arc::new(InstanceRegistry::new()));
        let mut b = connection(Arc::new(InstanceRegistry::new()));
        let mut k = Box::new(Ping::default());
        k.base_mut().set_parent_id(77);
        k.base_mut().set_principal_id(4242); // nobody here
        a.send(k);
        shovel(&mut a, &mut b);
        let received = b.receive();
        assert!(received.is_empty());
        // The bounce comes back to `a` with the error code set.
        shovel(&mut b, &mut a);
        let mut received = a.receive();
        assert_eq!(received.len(), 1);
        let k = match received.remove(0) {
            Received::Native(k) => k,
            _ => panic!(),
        };
        assert_eq!(k.base().result(), ExitCode::NoPrincipalFound);
    }

    #[test]
    fn recovery_resubmits_upstream_kernels() {
        let native = Arc::new(CollectingPipeline::default());
        let remote = Arc::new(CollectingPipeline::default());
        let router = Router {
            native: native.clone(),
            remote: Some(remote.clone()),
        };
        let mut a = connection(Arc::new(InstanceRegistry::new()));
        let mut k = Box::new(Ping::default());
        k.base_mut().set_parent_id(500);
        a.send(k);
        let mut p2p = Box::new(Ping::default());
        p2p.base_mut().set_parent_id(501);
        p2p.base_mut().set_principal_id(900);
        p2p.base_mut()
            .set_destination(SocketAddress::new_abstract(b"gone"));
        a.send(p2p);
        a.recover(&router);
        // Upstream kernel went back to the remote pipeline for a new peer.
        assert_eq!(remote.kernels.lock().unwrap().len(), 1);
        // Point-to-point kernel bounced locally with EndpointNotConnected.
        let native_kernels = native.kernels.lock().unwrap();
        assert_eq!(native_kernels.len(), 1);
        assert_eq!(
            native_kernels[0].base().result(),
            ExitCode::EndpointNotConnected
        );
    }

    #[test]
    fn carried_parent_travels_with_the_kernel() {
        let instances_a = Arc::new(InstanceRegistry::new());
        let instances_b = Arc::new(InstanceRegistry::new());
        // Parent is suspended on node A.
        let mut parent = Box::new(Ping::default());
        parent.payload = 1000;
        parent.base_mut().set_id(600);
        parent.base_mut().setf(KernelFlags::PARKED);
        instances_a.park(parent);
        let mut a = connection(instances_a);
        let mut b = connection(instances_b);
        let mut child = Box::new(Ping::default());
        child.base_mut().set_parent_id(600);
        child.base_mut().setf(KernelFlags::CARRIES_PARENT);
        a.send(child);
        shovel(&mut a, &mut b);
        let mut received = b.receive();
        assert_eq!(received.len(), 1);
        let k = match received.remove(0) {
            Received::Native(k) => k,
            _ => panic!(),
        };
        let carried = k.base().parent().owned().expect("parent must be embedded");
        assert_eq!(
            (**carried).downcast_ref::<Ping>().unwrap().payload,
            1000
        );
    }

    #[test]
    fn clear_drains_retained_kernels() {
        let mut a = connection(Arc::new(InstanceRegistry::new()));
        let mut k = Box::new(Ping::default());
        k.base_mut().set_parent_id(1);
        a.send(k);
        let mut sack = KernelSack::new();
        a.clear(&mut sack);
        assert_eq!(sack.len(), 1);
    }
}
