use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use log::{debug, trace, warn};

use crate::connection::{Connection, ConnectionFlags, ConnectionState, Received, Router};
use crate::error::{Error, Result};
use crate::instance_registry::InstanceRegistry;
use crate::interface_address::InterfaceAddress;
use crate::kernel::{ExitCode, Kernel, KernelBase, KernelPtr};
use crate::pipeline::KernelSack;
use crate::poller::PollEvent;
use crate::resources::ResourceMap;
use crate::socket::Socket;
use crate::socket_address::SocketAddress;
use crate::socket_pipeline::{HandlerStatus, LoopContext, SocketPipeline, SocketProtocol};
use crate::transaction_log::TransactionLog;
use crate::type_registry::TypeRegistry;

/// State changes of the peer transport, reported to registered listeners
/// (the discoverers) as point-to-point kernels.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PipelineEvent {
    AddClient,
    RemoveClient,
    AddServer,
    RemoveServer,
}

/// Local-only event kernel; never serialized.
pub struct PipelineEventKernel {
    base: KernelBase,
    event: PipelineEvent,
    socket_address: SocketAddress,
    interface_address: Option<InterfaceAddress>,
}

impl PipelineEventKernel {
    fn new(
        event: PipelineEvent,
        socket_address: SocketAddress,
        interface_address: Option<InterfaceAddress>,
    ) -> PipelineEventKernel {
        PipelineEventKernel {
            base: KernelBase::new(),
            event,
            socket_address,
            interface_address,
        }
    }

    pub fn event(&self) -> PipelineEvent {
        self.event
    }

    pub fn socket_address(&self) -> &SocketAddress {
        &self.socket_address
    }

    pub fn interface_address(&self) -> Option<InterfaceAddress> {
        self.interface_address
    }
}

impl Kernel for PipelineEventKernel {
    fn base(&self) -> &KernelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut KernelBase {
        &mut self.base
    }
}

pub enum RemoteHandler {
    Server {
        socket: Socket,
        interface_address: InterfaceAddress,
    },
    Client(Box<ClientHandler>),
}

struct ClientHandler {
    socket: Socket,
    connection: Connection,
    virtual_address: SocketAddress,
}

#[derive(Default)]
pub struct RemoteState {
    /// Virtual address -> primary fd of the client handler.
    clients: HashMap<SocketAddress, RawFd>,
    /// Insertion order, the basis of the round-robin cursor.
    order: Vec<SocketAddress>,
    weights: HashMap<SocketAddress, u32>,
    resources: HashMap<SocketAddress, ResourceMap>,
    cursor: usize,
    counter: u32,
    servers: HashMap<InterfaceAddress, RawFd>,
    /// Ids of kernels interested in pipeline events.
    listeners: Vec<u64>,
}

impl RemoteState {
    /// Weighted round-robin: a client with weight `w` is yielded `w`
    /// consecutive times before the cursor advances. Clients whose
    /// recorded resources fail `filter` are skipped.
    fn next_client(
        &mut self,
        filter: Option<&crate::resources::Expression>,
    ) -> Option<SocketAddress> {
        if self.order.is_empty() {
            return None;
        }
        let max_attempts: u64 = self
            .weights
            .values()
            .map(|w| (*w).max(1) as u64)
            .sum::<u64>()
            .max(self.order.len() as u64);
        for _ in 0..max_attempts {
            if self.counter == 0 {
                self.cursor = (self.cursor + 1) % self.order.len();
                let addr = &self.order[self.cursor];
                self.counter = self.weights.get(addr).copied().unwrap_or(1).max(1);
            }
            self.counter -= 1;
            let addr = self.order[self.cursor].clone();
            let passes = match filter {
                None => true,
                Some(expr) => match self.resources.get(&addr) {
                    None => true,
                    Some(map) => expr.evaluate(map).as_bool(),
                },
            };
            if passes {
                return Some(addr);
            }
        }
        None
    }

    fn forget(&mut self, addr: &SocketAddress) {
        self.clients.remove(addr);
        self.weights.remove(addr);
        self.resources.remove(addr);
        if let Some(i) = self.order.iter().position(|a| a == addr) {
            self.order.remove(i);
            if self.order.is_empty() {
                self.cursor = 0;
                self.counter = 0;
            } else if i <= self.cursor {
                self.cursor = self.cursor.saturating_sub(1) % self.order.len();
                self.counter = 0;
            }
        }
    }
}

/// Peer-to-peer transport between daemons: listening servers per interface,
/// a weight-aware client table, and destination or round-robin routing.
pub struct RemoteProtocol {
    types: Arc<TypeRegistry>,
    instances: Arc<InstanceRegistry>,
    this_application: u64,
    port: u16,
    router: Mutex<Option<Router>>,
    foreign: Mutex<Option<Arc<dyn crate::pipeline::Pipeline>>>,
    transaction_log: Mutex<Option<(Arc<TransactionLog>, u16)>>,
}

impl RemoteProtocol {
    pub fn new(
        types: Arc<TypeRegistry>,
        instances: Arc<InstanceRegistry>,
        this_application: u64,
        port: u16,
    ) -> RemoteProtocol {
        RemoteProtocol {
            types,
            instances,
            this_application,
            port,
            router: Mutex::new(None),
            foreign: Mutex::new(None),
            transaction_log: Mutex::new(None),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_router(&self, router: Router) {
        *self.router.lock().unwrap() = Some(router);
    }

    pub fn set_foreign_pipeline(&self, rhs: Arc<dyn crate::pipeline::Pipeline>) {
        *self.foreign.lock().unwrap() = Some(rhs);
    }

    pub fn set_transaction_log(&self, log: Arc<TransactionLog>, pipeline_index: u16) {
        *self.transaction_log.lock().unwrap() = Some((log, pipeline_index));
    }

    fn router(&self) -> Option<Router> {
        self.router.lock().unwrap().clone()
    }

    /// The stable identity of an *accepted* peer: its address with the
    /// daemon port instead of the connection's ephemeral port, so both
    /// ends name the link identically. Outgoing addresses are already
    /// canonical and are used as given.
    fn virtual_addr(&self, addr: &SocketAddress) -> SocketAddress {
        match addr {
            SocketAddress::Ipv4(a) => SocketAddress::new_ipv4(*a.ip(), self.port),
            SocketAddress::Ipv6(a) => SocketAddress::new_ipv6(*a.ip(), self.port),
            other => other.clone(),
        }
    }

    fn new_connection(&self, vaddr: SocketAddress) -> Connection {
        let mut connection = Connection::new(
            "nic",
            self.types.clone(),
            self.instances.clone(),
            self.this_application,
        );
        connection.setf(
            ConnectionFlags::SAVE_UPSTREAM_KERNELS | ConnectionFlags::SAVE_DOWNSTREAM_KERNELS,
        );
        if let Some((log, index)) = self.transaction_log.lock().unwrap().clone() {
            connection.set_transaction_log(log, index);
        }
        connection.set_socket_address(vaddr);
        connection
    }

    fn fire_event(
        &self,
        cx: &mut LoopContext<'_, Self>,
        event: PipelineEvent,
        addr: &SocketAddress,
        ifaddr: Option<InterfaceAddress>,
    ) {
        let router = match self.router() {
            Some(router) => router,
            None => return,
        };
        for listener in &cx.state.listeners {
            let mut k = Box::new(PipelineEventKernel::new(event, addr.clone(), ifaddr));
            k.base_mut().set_parent_id(*listener);
            k.base_mut().set_principal_id(*listener);
            router.send_native(k);
        }
    }

    fn route_received(&self, received: Vec<Received>) {
        let router = match self.router() {
            Some(router) => router,
            None => return,
        };
        for r in received {
            match r {
                Received::Native(k) => router.send_native(k),
                Received::Foreign(k) => match self.foreign.lock().unwrap().as_ref() {
                    Some(foreign) => foreign.send(k),
                    None => warn!("nic: no pipeline for foreign {:?}", k.base()),
                },
            }
        }
    }

    /// Connect to a new peer and register the pending link.
    fn connect_client(
        &self,
        cx: &mut LoopContext<'_, Self>,
        vaddr: SocketAddress,
    ) -> Option<RawFd> {
        let socket = match Socket::connect_to(&vaddr) {
            Ok(socket) => socket,
            Err(e) => {
                warn!("nic: connect to {}: {}", vaddr, e);
                return None;
            }
        };
        debug!("nic: connecting to {}", vaddr);
        let fd = socket.fd();
        let mut connection = self.new_connection(vaddr.clone());
        connection.set_state(ConnectionState::Starting);
        cx.state.clients.insert(vaddr.clone(), fd);
        if !cx.state.order.contains(&vaddr) {
            cx.state.order.push(vaddr.clone());
        }
        cx.state.weights.entry(vaddr.clone()).or_insert(1);
        cx.register(
            fd,
            fd,
            nix::sys::epoll::EpollFlags::EPOLLIN
                | nix::sys::epoll::EpollFlags::EPOLLOUT
                | nix::sys::epoll::EpollFlags::EPOLLRDHUP,
        );
        cx.add_handler(
            fd,
            RemoteHandler::Client(Box::new(ClientHandler {
                socket,
                connection,
                virtual_address: vaddr.clone(),
            })),
        );
        self.fire_event(cx, PipelineEvent::AddClient, &vaddr, None);
        Some(fd)
    }

    /// Pick a link for `k` and serialize it there.
    fn route_kernel(&self, cx: &mut LoopContext<'_, Self>, mut k: KernelPtr) {
        // 1. An explicit destination wins; an unknown destination gets a
        //    fresh connection (this is how probes reach new peers).
        let fd = if k.base().destination().is_set() {
            let vaddr = k.base().destination().clone();
            match cx.state.clients.get(&vaddr).copied() {
                Some(fd) => Some(fd),
                None => self.connect_client(cx, vaddr),
            }
        } else {
            // 2. Weighted round-robin among the clients.
            let filter = k.base().node_filter().cloned();
            cx.state
                .next_client(filter.as_ref())
                .and_then(|addr| cx.state.clients.get(&addr).copied())
        };
        match fd.and_then(|fd| cx.handlers.get_mut(&fd)) {
            Some(RemoteHandler::Client(client)) => {
                if !k.base().destination().is_set() {
                    k.base_mut()
                        .set_destination(client.virtual_address.clone());
                }
                client.connection.send(k);
            }
            _ => {
                // 3. No clients: fail the kernel back to its origin.
                debug!("nic: no peers for {:?}", k.base());
                if k.base().parent().is_set() {
                    if let Some(router) = self.router() {
                        k.base_mut().return_to_parent(ExitCode::EndpointNotConnected);
                        router.send_native(k);
                    }
                }
            }
        }
    }

    fn accept_all(
        &self,
        cx: &mut LoopContext<'_, Self>,
        socket: &Socket,
        interface_address: InterfaceAddress,
    ) {
        loop {
            match socket.accept() {
                Ok(Some((sock, peer))) => {
                    let vaddr = self.virtual_addr(&peer);
                    debug!("nic: accept {} as {}", peer, vaddr);
                    let mut connection = self.new_connection(vaddr.clone());
                    connection.set_state(ConnectionState::Started);
                    let fd = sock.fd();
                    let handler = RemoteHandler::Client(Box::new(ClientHandler {
                        socket: sock,
                        connection,
                        virtual_address: vaddr.clone(),
                    }));
                    cx.state.clients.insert(vaddr.clone(), fd);
                    if !cx.state.order.contains(&vaddr) {
                        cx.state.order.push(vaddr.clone());
                    }
                    cx.state.weights.entry(vaddr.clone()).or_insert(1);
                    cx.register(
                        fd,
                        fd,
                        nix::sys::epoll::EpollFlags::EPOLLIN
                            | nix::sys::epoll::EpollFlags::EPOLLRDHUP,
                    );
                    cx.add_handler(fd, handler);
                    self.fire_event(cx, PipelineEvent::AddClient, &vaddr, Some(interface_address));
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("nic: accept failed: {}", e);
                    break;
                }
            }
        }
    }
}

impl SocketProtocol for RemoteProtocol {
    type Handler = RemoteHandler;
    type State = RemoteState;

    fn name(&self) -> &'static str {
        "nic"
    }

    fn process_kernels(&self, cx: &mut LoopContext<'_, Self>, kernels: Vec<KernelPtr>) {
        for k in kernels {
            if k.is_foreign() {
                // Forwarded from another pipeline: verbatim copy toward the
                // kernel's destination.
                let vaddr = k.base().destination().clone();
                let fd = cx.state.clients.get(&vaddr).copied();
                match fd.and_then(|fd| cx.handlers.get_mut(&fd)) {
                    Some(RemoteHandler::Client(client)) => client.connection.forward(&*k),
                    _ => debug!("nic: dropping foreign {:?}", k.base()),
                }
            } else {
                self.route_kernel(cx, k);
            }
        }
    }

    fn handle_event(
        &self,
        cx: &mut LoopContext<'_, Self>,
        event: &PollEvent,
        handler: &mut RemoteHandler,
    ) {
        match handler {
            RemoteHandler::Server {
                socket,
                interface_address,
            } => {
                if event.readable() {
                    self.accept_all(cx, socket, *interface_address);
                }
            }
            RemoteHandler::Client(client) => {
                let fd = client.socket.fd();
                if client.connection.state() == ConnectionState::Starting && event.writable() {
                    match client.socket.take_error() {
                        Ok(0) => {
                            debug!("nic: connected to {}", client.virtual_address);
                            client.connection.set_state(ConnectionState::Started);
                        }
                        Ok(errno) => {
                            debug!(
                                "nic: connect to {} failed: {}",
                                client.virtual_address,
                                nix::errno::Errno::from_i32(errno).desc()
                            );
                            client.connection.set_state(ConnectionState::Stopped);
                            return;
                        }
                        Err(e) => {
                            warn!("nic: {}", e);
                            client.connection.set_state(ConnectionState::Stopped);
                            return;
                        }
                    }
                }
                if event.readable() {
                    match client.connection.fill(fd) {
                        Ok(eof) => {
                            let received = client.connection.receive();
                            self.route_received(received);
                            if eof {
                                client.connection.set_state(ConnectionState::Stopped);
                            }
                        }
                        Err(e) => {
                            warn!("nic: read {}: {}", client.virtual_address, e);
                            client.connection.set_state(ConnectionState::Stopped);
                        }
                    }
                }
                if event.bad() && client.connection.state() != ConnectionState::Stopped {
                    client.connection.set_state(ConnectionState::Stopped);
                }
            }
        }
    }

    fn status(&self, handler: &RemoteHandler) -> HandlerStatus {
        match handler {
            RemoteHandler::Server { socket, .. } => HandlerStatus {
                state: ConnectionState::Started,
                start_time: None,
                read_fd: socket.fd(),
                write_fd: socket.fd(),
                pending_output: false,
            },
            RemoteHandler::Client(client) => HandlerStatus {
                state: client.connection.state(),
                start_time: client.connection.start_time(),
                read_fd: client.socket.fd(),
                write_fd: client.socket.fd(),
                pending_output: client.connection.has_output(),
            },
        }
    }

    fn flush(&self, handler: &mut RemoteHandler) {
        if let RemoteHandler::Client(client) = handler {
            if client.connection.state() == ConnectionState::Starting {
                return;
            }
            let fd = client.socket.fd();
            if let Err(e) = client.connection.flush(fd) {
                warn!("nic: write {}: {}", client.virtual_address, e);
                client.connection.set_state(ConnectionState::Stopped);
            }
        }
    }

    fn on_remove(&self, cx: &mut LoopContext<'_, Self>, handler: RemoteHandler) {
        match handler {
            RemoteHandler::Server {
                interface_address, ..
            } => {
                cx.state.servers.remove(&interface_address);
                let addr = SocketAddress::new_ipv4(interface_address.address(), self.port);
                self.fire_event(cx, PipelineEvent::RemoveServer, &addr, Some(interface_address));
            }
            RemoteHandler::Client(mut client) => {
                debug!("nic: remove {}", client.virtual_address);
                cx.state.forget(&client.virtual_address);
                if let Some(router) = self.router() {
                    client.connection.recover(&router);
                }
                let vaddr = client.virtual_address.clone();
                self.fire_event(cx, PipelineEvent::RemoveClient, &vaddr, None);
            }
        }
    }

    fn clear(&self, handler: RemoteHandler, sack: &mut KernelSack) {
        if let RemoteHandler::Client(mut client) = handler {
            client.connection.clear(sack);
        }
    }
}

pub type RemoteSocketPipeline = SocketPipeline<RemoteProtocol>;

impl SocketPipeline<RemoteProtocol> {
    /// Bind a listening socket on `ifaddr` and announce it.
    pub fn add_server(&self, interface_address: InterfaceAddress) -> Result<()> {
        let port = self.protocol().port();
        let addr = SocketAddress::new_ipv4(interface_address.address(), port);
        let socket = Socket::listen_on(&addr)?;
        debug!("nic: listen on {}", addr);
        self.with_loop(|protocol, cx| {
            let fd = socket.fd();
            cx.state.servers.insert(interface_address, fd);
            cx.register(
                fd,
                fd,
                nix::sys::epoll::EpollFlags::EPOLLIN | nix::sys::epoll::EpollFlags::EPOLLRDHUP,
            );
            cx.add_handler(
                fd,
                RemoteHandler::Server {
                    socket,
                    interface_address,
                },
            );
            protocol.fire_event(cx, PipelineEvent::AddServer, &addr, Some(interface_address));
        });
        Ok(())
    }

    pub fn remove_server(&self, interface_address: InterfaceAddress) {
        self.with_loop(|protocol, cx| {
            let fd = cx.state.servers.get(&interface_address).copied();
            if let Some(fd) = fd {
                if let Some(handler) = cx.remove_handler(fd) {
                    protocol.on_remove(cx, handler);
                }
            }
        });
    }

    /// Idempotent connect: an existing client for `addr` is reused.
    pub fn add_client(&self, addr: &SocketAddress) -> Result<()> {
        let vaddr = addr.clone();
        self.with_loop(|protocol, cx| {
            if cx.state.clients.contains_key(&vaddr) {
                return Ok(());
            }
            match protocol.connect_client(cx, vaddr.clone()) {
                Some(_) => Ok(()),
                None => Err(Error::config(format!("cannot connect to {}", vaddr))),
            }
        })
    }

    pub fn stop_client(&self, addr: &SocketAddress) {
        let vaddr = addr.clone();
        self.with_loop(|protocol, cx| {
            let fd = cx.state.clients.get(&vaddr).copied();
            if let Some(fd) = fd {
                if let Some(handler) = cx.remove_handler(fd) {
                    protocol.on_remove(cx, handler);
                }
            }
        });
    }

    pub fn set_client_weight(&self, addr: &SocketAddress, weight: u32) {
        let vaddr = addr.clone();
        self.with_loop(|_, cx| {
            trace!("nic: weight of {} is now {}", vaddr, weight);
            cx.state.weights.insert(vaddr.clone(), weight);
        });
    }

    pub fn set_client_resources(&self, addr: &SocketAddress, resources: ResourceMap) {
        let vaddr = addr.clone();
        self.with_loop(|_, cx| {
            cx.state.resources.insert(vaddr.clone(), resources);
        });
    }

    /// Register a resident kernel to receive pipeline events.
    pub fn add_listener(&self, kernel_id: u64) {
        self.with_loop(|_, cx| cx.state.listeners.push(kernel_id));
    }

    /// Snapshot of the client table in insertion order, with weights.
    pub fn clients(&self) -> Vec<(SocketAddress, u32)> {
        self.with_loop(|_, cx| {
            cx.state
                .order
                .iter()
                .map(|a| (a.clone(), cx.state.weights.get(a).copied().unwrap_or(1)))
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{Expression, Value, TOTAL_THREADS};

    fn addr(n: u8) -> SocketAddress {
        SocketAddress::new_ipv4(std::net::Ipv4Addr::new(10, 0, 0, n), 33333)
    }

    fn state_with(addrs: &[(u8, u32)]) -> RemoteState {
        let mut s = RemoteState::default();
        for (i, (n, w)) in addrs.iter().enumerate() {
            let a = addr(*n);
            s.clients.insert(a.clone(), i as RawFd + 100);
            s.order.push(a.clone());
            s.weights.insert(a, *w);
        }
        s
    }

    #[test]
    fn round_robin_respects_weights() {
        let mut s = state_with(&[(1, 2), (2, 1)]);
        let picks: Vec<_> = (0..6).map(|_| s.next_client(None).unwrap()).collect();
        let ones = picks.iter().filter(|a| **a == addr(1)).count();
        let twos = picks.iter().filter(|a| **a == addr(2)).count();
        assert_eq!(ones, 4);
        assert_eq!(twos, 2);
        // Selections of one client are consecutive.
        let first_one = picks.iter().position(|a| *a == addr(1)).unwrap();
        assert_eq!(picks[first_one], picks[first_one + 1]);
    }

    #[test]
    fn empty_table_yields_nothing() {
        let mut s = RemoteState::default();
        assert!(s.next_client(None).is_none());
    }

    #[test]
    fn removal_keeps_order_of_the_rest() {
        let mut s = state_with(&[(1, 1), (2, 1), (3, 1)]);
        s.forget(&addr(2));
        assert_eq!(s.order, vec![addr(1), addr(3)]);
        let picks: Vec<_> = (0..4).map(|_| s.next_client(None).unwrap()).collect();
        assert!(picks.contains(&addr(1)));
        assert!(picks.contains(&addr(3)));
        assert!(!picks.contains(&addr(2)));
    }

    #[test]
    fn filter_skips_clients_with_insufficient_resources() {
        let mut s = state_with(&[(1, 1), (2, 1)]);
        let mut poor = ResourceMap::new();
        poor.set(TOTAL_THREADS, Value::Unsigned(1));
        s.resources.insert(addr(1), poor);
        let needs_four = Expression::GreaterOrEqual(
            Box::new(Expression::Symbol(TOTAL_THREADS)),
            Box::new(Expression::Constant(Value::Unsigned(4))),
        );
        for _ in 0..4 {
            let pick = s.next_client(Some(&needs_four)).unwrap();
            assert_eq!(pick, addr(2), "client with 1 thread must be skipped");
        }
    }
}
