use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, warn};
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{ForkResult, Pid};

use crate::application::Application;
use crate::connection::{Connection, ConnectionFlags, ConnectionState, Received, Router};
use crate::error::{Error, Result};
use crate::instance_registry::InstanceRegistry;
use crate::kernel::{Kernel, KernelBase, KernelPtr};
use crate::pipeline::{KernelSack, Pipeline};
use crate::poller::PollEvent;
use crate::scoped_fd::ScopedFd;
use crate::socket_pipeline::{HandlerStatus, LoopContext, SocketPipeline, SocketProtocol};
use crate::two_way_pipe::TwoWayPipe;
use crate::type_registry::TypeRegistry;

/// Local-only notification that a child application exited.
pub struct ProcessEventKernel {
    base: KernelBase,
    application_id: u64,
    exit_status: i32,
}

impl ProcessEventKernel {
    pub fn application_id(&self) -> u64 {
        self.application_id
    }

    pub fn exit_status(&self) -> i32 {
        self.exit_status
    }
}

impl Kernel for ProcessEventKernel {
    fn base(&self) -> &KernelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut KernelBase {
        &mut self.base
    }
}

pub struct ProcessHandler {
    application: Application,
    child_pid: Pid,
    pipe_in: ScopedFd,
    pipe_out: ScopedFd,
    connection: Connection,
}

#[derive(Default)]
pub struct ProcessState {
    /// Application id -> primary fd of its handler.
    jobs: HashMap<u64, RawFd>,
    listeners: Vec<u64>,
}

/// Supervises child applications connected by two-way pipes; kernel
/// traffic crosses the pipes with the same framed protocol as sockets.
pub struct ProcessProtocol {
    types: Arc<TypeRegistry>,
    instances: Arc<InstanceRegistry>,
    this_application: u64,
    allow_root: bool,
    router: Mutex<Option<Router>>,
}

impl ProcessProtocol {
    pub fn new(
        types: Arc<TypeRegistry>,
        instances: Arc<InstanceRegistry>,
        this_application: u64,
        allow_root: bool,
    ) -> ProcessProtocol {
        ProcessProtocol {
            types,
            instances,
            this_application,
            allow_root,
            router: Mutex::new(None),
        }
    }

    pub fn set_router(&self, router: Router) {
        *self.router.lock().unwrap() = Some(router);
    }

    fn router(&self) -> Option<Router> {
        self.router.lock().unwrap().clone()
    }

    fn route_received(&self, cx: &mut LoopContext<'_, Self>, received: Vec<Received>) {
        let router = match self.router() {
            Some(router) => router,
            None => return,
        };
        for r in received {
            match r {
                Received::Native(k) => router.send_native(k),
                Received::Foreign(k) => {
                    // Another local application, or another node entirely.
                    let target = k.base().target_application_id();
                    let fd = cx.state.jobs.get(&target).copied();
                    match fd.and_then(|fd| cx.handlers.get_mut(&fd)) {
                        Some(handler) => handler.connection.forward(&*k),
                        None => router.send_remote(k),
                    }
                }
            }
        }
    }

    /// Fork and exec `app`, wiring a pipe-backed connection into the loop.
    fn spawn(&self, cx: &mut LoopContext<'_, Self>, mut app: Application) -> Result<u64> {
        if self.allow_root {
            app.set_allow_root(true);
        }
        if !app.allow_root() && (app.uid() == 0 || app.gid() == 0) {
            return Err(Error::config(
                "executing as superuser/supergroup is disallowed",
            ));
        }
        let app_id = app.id();
        let mut pipe = TwoWayPipe::new()?;
        // SAFETY: the child immediately execs (or exits); no allocation
        // beyond what `execute` needs happens in between.
        match unsafe { nix::unistd::fork() }? {
            ForkResult::Child => {
                pipe.close_in_child();
                let err = app.execute(&pipe).unwrap_err();
                eprintln!("hive: failed to execute {}: {}", app.filename(), err);
                unsafe { libc::_exit(1) }
            }
            ForkResult::Parent { child } => {
                pipe.close_in_parent();
                let (pipe_in, pipe_out) = pipe.extract_parent_ends();
                debug!(
                    "proc: executing app={} pid={} command {:?}",
                    app_id,
                    child,
                    app.filename()
                );
                let mut connection =
                    Connection::new("proc", self.types.clone(), self.instances.clone(), self.this_application);
                connection.setf(
                    ConnectionFlags::SAVE_UPSTREAM_KERNELS
                        | ConnectionFlags::SAVE_DOWNSTREAM_KERNELS,
                );
                connection.set_state(ConnectionState::Started);
                let primary = pipe_in.get();
                cx.state.jobs.insert(app_id, primary);
                cx.register(
                    primary,
                    primary,
                    nix::sys::epoll::EpollFlags::EPOLLIN | nix::sys::epoll::EpollFlags::EPOLLRDHUP,
                );
                cx.add_handler(
                    primary,
                    ProcessHandler {
                        application: app,
                        child_pid: child,
                        pipe_in,
                        pipe_out,
                        connection,
                    },
                );
                Ok(app_id)
            }
        }
    }

    fn fire_terminated(&self, listeners: &[u64], application_id: u64, exit_status: i32) {
        let router = match self.router() {
            Some(router) => router,
            None => return,
        };
        for listener in listeners {
            let mut k = Box::new(ProcessEventKernel {
                base: KernelBase::new(),
                application_id,
                exit_status,
            });
            k.base_mut().set_parent_id(*listener);
            k.base_mut().set_principal_id(*listener);
            router.send_native(k);
        }
    }
}

impl SocketProtocol for ProcessProtocol {
    type Handler = ProcessHandler;
    type State = ProcessState;

    fn name(&self) -> &'static str {
        "proc"
    }

    fn process_kernels(&self, cx: &mut LoopContext<'_, Self>, kernels: Vec<KernelPtr>) {
        for mut k in kernels {
            if k.base().moves_everywhere() {
                let fds: Vec<RawFd> = cx.state.jobs.values().copied().collect();
                for fd in fds {
                    if let Some(handler) = cx.handlers.get_mut(&fd) {
                        handler.connection.forward(&*k);
                    }
                }
                continue;
            }
            let target = k.base().target_application_id();
            let fd = cx.state.jobs.get(&target).copied();
            match fd.and_then(|fd| cx.handlers.get_mut(&fd)) {
                Some(handler) => {
                    if k.is_foreign() {
                        handler.connection.forward(&*k);
                    } else {
                        handler.connection.send(k);
                    }
                }
                None => {
                    // An embedded application record lets us spawn on
                    // demand; otherwise the id is simply wrong.
                    let app = k.base_mut().take_target_application();
                    match app {
                        Some(app) => match self.spawn(cx, app) {
                            Ok(app_id) => {
                                if let Some(handler) = cx
                                    .state
                                    .jobs
                                    .get(&app_id)
                                    .copied()
                                    .and_then(|fd| cx.handlers.get_mut(&fd))
                                {
                                    if k.is_foreign() {
                                        handler.connection.forward(&*k);
                                    } else {
                                        handler.connection.send(k);
                                    }
                                }
                            }
                            Err(e) => error!("proc: spawn failed: {}", e),
                        },
                        None => error!("proc: bad application id {}", target),
                    }
                }
            }
        }
    }

    fn handle_event(
        &self,
        cx: &mut LoopContext<'_, Self>,
        event: &PollEvent,
        handler: &mut ProcessHandler,
    ) {
        if event.readable() || event.bad() {
            let fd = handler.pipe_in.get();
            match handler.connection.fill(fd) {
                Ok(eof) => {
                    let received = handler.connection.receive();
                    self.route_received(cx, received);
                    if eof {
                        handler.connection.set_state(ConnectionState::Stopped);
                    }
                }
                Err(e) => {
                    warn!("proc: read app={}: {}", handler.application.id(), e);
                    handler.connection.set_state(ConnectionState::Stopped);
                }
            }
        }
    }

    fn status(&self, handler: &ProcessHandler) -> HandlerStatus {
        HandlerStatus {
            state: handler.connection.state(),
            start_time: handler.connection.start_time(),
            read_fd: handler.pipe_in.get(),
            write_fd: handler.pipe_out.get(),
            pending_output: handler.connection.has_output(),
        }
    }

    fn flush(&self, handler: &mut ProcessHandler) {
        let fd = handler.pipe_out.get();
        if let Err(e) = handler.connection.flush(fd) {
            warn!("proc: write app={}: {}", handler.application.id(), e);
            handler.connection.set_state(ConnectionState::Stopped);
        }
    }

    fn on_remove(&self, cx: &mut LoopContext<'_, Self>, mut handler: ProcessHandler) {
        debug!("proc: remove app={}", handler.application.id());
        cx.state.jobs.remove(&handler.application.id());
        if let Some(router) = self.router() {
            handler.connection.recover(&router);
        }
    }

    fn clear(&self, mut handler: ProcessHandler, sack: &mut KernelSack) {
        handler.connection.clear(sack);
    }
}

/// The process pipeline: the event loop plus a wait thread that reaps
/// exited children and notifies listeners.
pub struct ProcessPipeline {
    base: Arc<SocketPipeline<ProcessProtocol>>,
    wait_thread: Mutex<Option<JoinHandle<()>>>,
    stopping: Arc<AtomicBool>,
}

impl ProcessPipeline {
    pub fn new(protocol: ProcessProtocol, start_timeout: Duration) -> Result<ProcessPipeline> {
        Ok(ProcessPipeline {
            base: Arc::new(SocketPipeline::new(protocol, start_timeout)?),
            wait_thread: Mutex::new(None),
            stopping: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn protocol(&self) -> &ProcessProtocol {
        self.base.protocol()
    }

    /// Launch `app` and return its id.
    pub fn add_application(&self, app: Application) -> Result<u64> {
        self.base.with_loop(|protocol, cx| protocol.spawn(cx, app))
    }

    pub fn add_listener(&self, kernel_id: u64) {
        self.base.with_loop(|_, cx| cx.state.listeners.push(kernel_id));
    }

    pub fn num_applications(&self) -> usize {
        self.base.with_loop(|_, cx| cx.state.jobs.len())
    }

    pub fn start(&self) {
        self.base.start();
        let base = self.base.clone();
        let stopping = self.stopping.clone();
        let handle = std::thread::Builder::new()
            .name("proc-wait".into())
            .spawn(move || wait_loop(&base, &stopping))
            .expect("spawn wait thread");
        *self.wait_thread.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        // Ask the children to terminate before tearing the loop down.
        self.base.with_loop(|_, cx| {
            for handler in cx.handlers.values() {
                let _ = nix::sys::signal::kill(handler.child_pid, Signal::SIGTERM);
            }
        });
        self.base.stop();
    }

    pub fn wait(&self) {
        self.base.wait();
        let handle = self.wait_thread.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    pub fn take_sack(&self) -> KernelSack {
        self.base.take_sack()
    }
}

impl Pipeline for ProcessPipeline {
    fn send(&self, k: KernelPtr) {
        self.base.send(k);
    }
}

fn wait_loop(base: &SocketPipeline<ProcessProtocol>, stopping: &AtomicBool) {
    while !stopping.load(Ordering::SeqCst) {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => reap(base, pid, code),
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                reap(base, pid, 128 + signal as i32);
            }
            Ok(_) => {
                std::thread::sleep(Duration::from_millis(99));
            }
            Err(_) => {
                // No children yet.
                std::thread::sleep(Duration::from_millis(99));
            }
        }
    }
}

fn reap(base: &SocketPipeline<ProcessProtocol>, pid: Pid, exit_status: i32) {
    base.with_loop(|protocol, cx| {
        let primary = cx
            .handlers
            .iter()
            .find(|(_, h)| h.child_pid == pid)
            .map(|(fd, _)| *fd);
        if let Some(primary) = primary {
            if let Some(handler) = cx.remove_handler(primary) {
                let application_id = handler.application.id();
                debug!("proc: app exited: app={} status={}", application_id, exit_status);
                protocol.on_remove(cx, handler);
                let listeners = cx.state.listeners.clone();
                protocol.fire_terminated(&listeners, application_id, exit_status);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct CollectingPipeline {
        kernels: StdMutex<Vec<KernelPtr>>,
    }

    impl Pipeline for CollectingPipeline {
        fn send(&self, k: KernelPtr) {
            self.kernels.lock().unwrap().push(k);
        }
    }

    fn pipeline() -> (ProcessPipeline, Arc<CollectingPipeline>) {
        let types = Arc::new(TypeRegistry::new());
        let instances = Arc::new(InstanceRegistry::new());
        let protocol = ProcessProtocol::new(types, instances, 0, true);
        let native = Arc::new(CollectingPipeline::default());
        protocol.set_router(Router {
            native: native.clone(),
            remote: None,
        });
        (
            ProcessPipeline::new(protocol, Duration::from_secs(7)).unwrap(),
            native,
        )
    }

    #[test]
    fn spawn_and_reap_notifies_listeners() {
        let (p, native) = pipeline();
        p.start();
        p.add_listener(1);
        let app = Application::new(vec!["true".into()], vec![]).unwrap();
        let app_id = p.add_application(app).unwrap();
        assert_ne!(app_id, 0);
        // `true` exits immediately; the wait thread reaps it and fires the
        // event kernel toward listener 1.
        let mut seen = false;
        for _ in 0..200 {
            let kernels = native.kernels.lock().unwrap();
            if let Some(k) = kernels.iter().find(|k| {
                k.downcast_ref::<ProcessEventKernel>()
                    .map(|e| e.application_id() == app_id)
                    .unwrap_or(false)
            }) {
                let e = k.downcast_ref::<ProcessEventKernel>().unwrap();
                assert_eq!(e.exit_status(), 0);
                seen = true;
                break;
            }
            drop(kernels);
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(seen, "termination event never arrived");
        assert_eq!(p.num_applications(), 0);
        p.stop();
        p.wait();
    }

    #[test]
    fn spawn_failure_is_reported() {
        let (p, _native) = pipeline();
        p.start();
        let app =
            Application::new(vec!["/nonexistent/definitely-missing".into()], vec![]).unwrap();
        // The fork succeeds; the exec failure surfaces as an exit status of
        // 1 through the wait thread. Spawning itself reports success.
        let app_id = p.add_application(app).unwrap();
        assert_ne!(app_id, 0);
        p.stop();
        p.wait();
    }
}
