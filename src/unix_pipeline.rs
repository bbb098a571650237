use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::application::Application;
use crate::connection::{Connection, ConnectionFlags, ConnectionState, Received, Router};
use crate::error::{Error, Result};
use crate::instance_registry::InstanceRegistry;
use crate::kernel::{ExitCode, Kernel, KernelBase, KernelPtr};
use crate::kernel_buffer::KernelBuffer;
use crate::pipeline::KernelSack;
use crate::poller::PollEvent;
use crate::process_pipeline::ProcessPipeline;
use crate::socket::Socket;
use crate::socket_address::SocketAddress;
use crate::socket_pipeline::{HandlerStatus, LoopContext, SocketPipeline, SocketProtocol};
use crate::type_registry::TypeRegistry;

/// Asks a daemon to launch an application. The submit CLI packs argv, env
/// and the working directory into this kernel; the daemon answers on the
/// same connection with the result and the assigned application id.
#[derive(Default)]
pub struct SubmitKernel {
    base: KernelBase,
    arguments: Vec<String>,
    environment: Vec<String>,
    workdir: String,
    application_id: u64,
    error: String,
}

impl SubmitKernel {
    pub fn new(arguments: Vec<String>, environment: Vec<String>, workdir: String) -> SubmitKernel {
        SubmitKernel {
            base: KernelBase::new(),
            arguments,
            environment,
            workdir,
            application_id: 0,
            error: String::new(),
        }
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    pub fn application_id(&self) -> u64 {
        self.application_id
    }

    pub fn error(&self) -> &str {
        &self.error
    }
}

impl Kernel for SubmitKernel {
    fn base(&self) -> &KernelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut KernelBase {
        &mut self.base
    }

    fn write(&self, out: &mut KernelBuffer) -> Result<()> {
        self.base.write(out)?;
        out.write_u32(self.arguments.len() as u32);
        for a in &self.arguments {
            out.write_str(a);
        }
        out.write_u32(self.environment.len() as u32);
        for e in &self.environment {
            out.write_str(e);
        }
        out.write_str(&self.workdir);
        out.write_u64(self.application_id);
        out.write_str(&self.error);
        Ok(())
    }

    fn read(&mut self, input: &mut KernelBuffer) -> Result<()> {
        self.base.read(input)?;
        let n = input.read_u32()?;
        self.arguments = (0..n).map(|_| input.read_str()).collect::<Result<_>>()?;
        let n = input.read_u32()?;
        self.environment = (0..n).map(|_| input.read_str()).collect::<Result<_>>()?;
        self.workdir = input.read_str()?;
        self.application_id = input.read_u64()?;
        self.error = input.read_str()?;
        Ok(())
    }
}

pub enum UnixHandler {
    Server { socket: Socket },
    Client { socket: Socket, connection: Connection },
}

#[derive(Default)]
pub struct UnixState {
    /// Connection identity -> primary fd. Accepted peers are usually
    /// unnamed, so they get a synthetic abstract address.
    clients: HashMap<SocketAddress, RawFd>,
}

/// The daemon's front door for unmanaged processes: a Unix-domain listener
/// speaking the same framed kernel protocol. Submit kernels are answered
/// in place; everything else is routed like any other native kernel.
pub struct UnixProtocol {
    types: Arc<TypeRegistry>,
    instances: Arc<InstanceRegistry>,
    this_application: u64,
    allow_root: bool,
    router: Mutex<Option<Router>>,
    process: Mutex<Option<Arc<ProcessPipeline>>>,
}

impl UnixProtocol {
    pub fn new(
        types: Arc<TypeRegistry>,
        instances: Arc<InstanceRegistry>,
        this_application: u64,
        allow_root: bool,
    ) -> UnixProtocol {
        UnixProtocol {
            types,
            instances,
            this_application,
            allow_root,
            router: Mutex::new(None),
            process: Mutex::new(None),
        }
    }

    pub fn set_router(&self, router: Router) {
        *self.router.lock().unwrap() = Some(router);
    }

    pub fn set_process_pipeline(&self, rhs: Arc<ProcessPipeline>) {
        *self.process.lock().unwrap() = Some(rhs);
    }

    fn router(&self) -> Option<Router> {
        self.router.lock().unwrap().clone()
    }

    fn new_connection(&self, addr: SocketAddress) -> Connection {
        let mut connection = Connection::new(
            "unix",
            self.types.clone(),
            self.instances.clone(),
            self.this_application,
        );
        connection.setf(ConnectionFlags::SAVE_UPSTREAM_KERNELS);
        connection.set_socket_address(addr);
        connection
    }

    fn spawn(&self, k: &SubmitKernel) -> Result<u64> {
        let process = self
            .process
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::config("this process does not spawn applications"))?;
        let mut app = Application::new(k.arguments.to_vec(), k.environment.to_vec())?;
        if !k.workdir.is_empty() {
            app.set_workdir(k.workdir.clone());
        }
        app.set_allow_root(self.allow_root);
        process.add_application(app)
    }

    fn handle_received(&self, connection: &mut Connection, received: Vec<Received>) {
        let router = self.router();
        for r in received {
            match r {
                Received::Native(k) => {
                    if k.base().result().is_undefined() && (*k).is::<SubmitKernel>() {
                        let mut submit = k.downcast::<SubmitKernel>().ok().unwrap();
                        match self.spawn(&submit) {
                            Ok(application_id) => {
                                debug!("unix: submitted app={}", application_id);
                                submit.application_id = application_id;
                                submit.base_mut().return_to_parent(ExitCode::Success);
                            }
                            Err(e) => {
                                warn!("unix: submit failed: {}", e);
                                submit.error = e.to_string();
                                submit.base_mut().return_to_parent(ExitCode::Error);
                            }
                        }
                        connection.send(submit);
                    } else if let Some(router) = &router {
                        router.send_native(k);
                    }
                }
                Received::Foreign(k) => {
                    let process = self.process.lock().unwrap().clone();
                    match process {
                        Some(process) => crate::pipeline::Pipeline::send(&*process, k),
                        None => warn!("unix: no pipeline for foreign {:?}", k.base()),
                    }
                }
            }
        }
    }
}

impl SocketProtocol for UnixProtocol {
    type Handler = UnixHandler;
    type State = UnixState;

    fn name(&self) -> &'static str {
        "unix"
    }

    fn process_kernels(&self, cx: &mut LoopContext<'_, Self>, kernels: Vec<KernelPtr>) {
        for k in kernels {
            let fd = cx
                .state
                .clients
                .get(k.base().destination())
                .copied()
                .or_else(|| {
                    if cx.state.clients.len() == 1 {
                        cx.state.clients.values().next().copied()
                    } else {
                        None
                    }
                });
            match fd.and_then(|fd| cx.handlers.get_mut(&fd)) {
                Some(UnixHandler::Client { connection, .. }) => connection.send(k),
                _ => debug!("unix: no connection for {:?}", k.base()),
            }
        }
    }

    fn handle_event(
        &self,
        cx: &mut LoopContext<'_, Self>,
        event: &PollEvent,
        handler: &mut UnixHandler,
    ) {
        match handler {
            UnixHandler::Server { socket } => {
                if !event.readable() {
                    return;
                }
                loop {
                    match socket.accept() {
                        Ok(Some((sock, peer))) => {
                            let addr = if peer.is_set() {
                                peer
                            } else {
                                SocketAddress::new_abstract(
                                    format!("hive-client-{}", sock.fd()).as_bytes(),
                                )
                            };
                            debug!("unix: accept {}", addr);
                            let mut connection = self.new_connection(addr.clone());
                            connection.set_state(ConnectionState::Started);
                            let fd = sock.fd();
                            cx.state.clients.insert(addr, fd);
                            cx.register(
                                fd,
                                fd,
                                nix::sys::epoll::EpollFlags::EPOLLIN
                                    | nix::sys::epoll::EpollFlags::EPOLLRDHUP,
                            );
                            cx.add_handler(fd, UnixHandler::Client { socket: sock, connection });
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("unix: accept failed: {}", e);
                            break;
                        }
                    }
                }
            }
            UnixHandler::Client { socket, connection } => {
                if connection.state() == ConnectionState::Starting && event.writable() {
                    match socket.take_error() {
                        Ok(0) => connection.set_state(ConnectionState::Started),
                        _ => {
                            connection.set_state(ConnectionState::Stopped);
                            return;
                        }
                    }
                }
                if event.readable() {
                    match connection.fill(socket.fd()) {
                        Ok(eof) => {
                            let received = connection.receive();
                            self.handle_received(connection, received);
                            if eof {
                                connection.set_state(ConnectionState::Stopped);
                            }
                        }
                        Err(e) => {
                            warn!("unix: read: {}", e);
                            connection.set_state(ConnectionState::Stopped);
                        }
                    }
                }
                if event.bad() && connection.state() != ConnectionState::Stopped {
                    connection.set_state(ConnectionState::Stopped);
                }
            }
        }
    }

    fn status(&self, handler: &UnixHandler) -> HandlerStatus {
        match handler {
            UnixHandler::Server { socket } => HandlerStatus {
                state: ConnectionState::Started,
                start_time: None,
                read_fd: socket.fd(),
                write_fd: socket.fd(),
                pending_output: false,
            },
            UnixHandler::Client { socket, connection } => HandlerStatus {
                state: connection.state(),
                start_time: connection.start_time(),
                read_fd: socket.fd(),
                write_fd: socket.fd(),
                pending_output: connection.has_output(),
            },
        }
    }

    fn flush(&self, handler: &mut UnixHandler) {
        if let UnixHandler::Client { socket, connection } = handler {
            if connection.state() == ConnectionState::Starting {
                return;
            }
            if let Err(e) = connection.flush(socket.fd()) {
                warn!("unix: write: {}", e);
                connection.set_state(ConnectionState::Stopped);
            }
        }
    }

    fn on_remove(&self, cx: &mut LoopContext<'_, Self>, handler: UnixHandler) {
        if let UnixHandler::Client { mut connection, .. } = handler {
            debug!("unix: remove {}", connection.socket_address());
            let addr = connection.socket_address().clone();
            cx.state.clients.remove(&addr);
            if let Some(router) = self.router() {
                connection.recover(&router);
            }
        }
    }

    fn clear(&self, handler: UnixHandler, sack: &mut KernelSack) {
        if let UnixHandler::Client { mut connection, .. } = handler {
            connection.clear(sack);
        }
    }
}

pub type UnixSocketPipeline = SocketPipeline<UnixProtocol>;

impl SocketPipeline<UnixProtocol> {
    /// The daemon side: listen for submit clients.
    pub fn add_server(&self, addr: &SocketAddress) -> Result<()> {
        let socket = Socket::listen_on(addr)?;
        debug!("unix: listen on {}", addr);
        self.with_loop(|_, cx| {
            let fd = socket.fd();
            cx.register(
                fd,
                fd,
                nix::sys::epoll::EpollFlags::EPOLLIN | nix::sys::epoll::EpollFlags::EPOLLRDHUP,
            );
            cx.add_handler(fd, UnixHandler::Server { socket });
        });
        Ok(())
    }

    /// The CLI side: connect to a daemon.
    pub fn add_client(&self, addr: &SocketAddress) -> Result<()> {
        let socket = Socket::connect_to(addr)?;
        debug!("unix: connecting to {}", addr);
        self.with_loop(|protocol, cx| {
            let fd = socket.fd();
            let mut connection = protocol.new_connection(addr.clone());
            connection.set_state(ConnectionState::Starting);
            cx.state.clients.insert(addr.clone(), fd);
            cx.register(
                fd,
                fd,
                nix::sys::epoll::EpollFlags::EPOLLIN
                    | nix::sys::epoll::EpollFlags::EPOLLOUT
                    | nix::sys::epoll::EpollFlags::EPOLLRDHUP,
            );
            cx.add_handler(fd, UnixHandler::Client { socket, connection });
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_kernel_round_trip() {
        let mut a = SubmitKernel::new(
            vec!["solver".into(), "--n".into(), "8".into()],
            vec!["PATH=/bin".into()],
            "/tmp".into(),
        );
        a.base_mut().set_parent_id(9);
        let mut buf = KernelBuffer::new();
        a.write(&mut buf).unwrap();
        buf.flip();
        let mut b = SubmitKernel::default();
        b.read(&mut buf).unwrap();
        assert_eq!(b.arguments, a.arguments);
        assert_eq!(b.environment, a.environment);
        assert_eq!(b.workdir, a.workdir);
        assert_eq!(buf.position(), buf.limit());
    }
}
