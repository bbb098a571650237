use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{error, trace, warn};
use nix::sys::epoll::EpollFlags;

use crate::connection::ConnectionState;
use crate::error::Result;
use crate::kernel::KernelPtr;
use crate::pipeline::{KernelSack, Pipeline, PipelineState};
use crate::poller::{PollEvent, Poller};

/// What the event loop needs to know about one handler between callbacks.
#[derive(Copy, Clone, Debug)]
pub struct HandlerStatus {
    pub state: ConnectionState,
    pub start_time: Option<Instant>,
    pub read_fd: RawFd,
    pub write_fd: RawFd,
    pub pending_output: bool,
}

/// Specialization of the socket event loop: the remote, unix and process
/// pipelines each provide their own handler type, routing rules and
/// recovery policy; the base owns the thread, the poller, the handler
/// table, startup timeouts and graceful stop.
pub trait SocketProtocol: Send + Sync + 'static {
    type Handler: Send;
    type State: Send + Default;

    fn name(&self) -> &'static str;

    /// Route kernels submitted to this pipeline. Called on the loop thread
    /// under the pipeline lock.
    fn process_kernels(&self, cx: &mut LoopContext<'_, Self>, kernels: Vec<KernelPtr>);

    /// React to descriptor readiness. The handler is temporarily detached
    /// from the table; set its state to `Stopped` to have it removed and
    /// recovered.
    fn handle_event(
        &self,
        cx: &mut LoopContext<'_, Self>,
        event: &PollEvent,
        handler: &mut Self::Handler,
    );

    fn status(&self, handler: &Self::Handler) -> HandlerStatus;

    /// Write buffered output; transport errors mark the handler stopped.
    fn flush(&self, handler: &mut Self::Handler);

    /// The handler left the table while the pipeline keeps running:
    /// recover its retained kernels.
    fn on_remove(&self, cx: &mut LoopContext<'_, Self>, handler: Self::Handler);

    /// Orderly stop: surrender every retained kernel to the sack.
    fn clear(&self, handler: Self::Handler, sack: &mut KernelSack);
}

struct Guarded<P: SocketProtocol> {
    state: PipelineState,
    handlers: HashMap<RawFd, P::Handler>,
    /// Every registered fd, mapped to the handler's primary (read) fd.
    fd_index: HashMap<RawFd, RawFd>,
    /// Current epoll interest per fd.
    registered: HashMap<RawFd, EpollFlags>,
    sack: KernelSack,
    protocol_state: P::State,
}

/// The slice of pipeline state a protocol callback may touch.
pub struct LoopContext<'a, P: SocketProtocol + ?Sized> {
    pub poller: &'a Poller,
    pub handlers: &'a mut HashMap<RawFd, P::Handler>,
    pub state: &'a mut P::State,
    pub sack: &'a mut KernelSack,
    fd_index: &'a mut HashMap<RawFd, RawFd>,
    registered: &'a mut HashMap<RawFd, EpollFlags>,
}

impl<'a, P: SocketProtocol> LoopContext<'a, P> {
    /// Register `fd` with the poller on behalf of the handler keyed by
    /// `primary`.
    pub fn register(&mut self, primary: RawFd, fd: RawFd, flags: EpollFlags) {
        self.fd_index.insert(fd, primary);
        set_interest(self.poller, self.registered, fd, flags);
    }

    pub fn add_handler(&mut self, primary: RawFd, handler: P::Handler) {
        self.handlers.insert(primary, handler);
    }

    /// Detach a handler and all of its descriptors from the loop.
    pub fn remove_handler(&mut self, primary: RawFd) -> Option<P::Handler> {
        let handler = self.handlers.remove(&primary)?;
        let fds: Vec<RawFd> = self
            .fd_index
            .iter()
            .filter(|(_, p)| **p == primary)
            .map(|(fd, _)| *fd)
            .collect();
        for fd in fds {
            self.fd_index.remove(&fd);
            self.registered.remove(&fd);
            self.poller.remove(fd);
        }
        Some(handler)
    }
}

fn set_interest(poller: &Poller, registered: &mut HashMap<RawFd, EpollFlags>, fd: RawFd, flags: EpollFlags) {
    match registered.get(&fd) {
        Some(current) if *current == flags => {}
        Some(_) => {
            if let Err(e) = poller.modify(fd, flags) {
                warn!("poller: modify {}: {}", fd, e);
            } else {
                registered.insert(fd, flags);
            }
        }
        None => {
            if let Err(e) = poller.insert(fd, flags) {
                warn!("poller: insert {}: {}", fd, e);
            } else {
                registered.insert(fd, flags);
            }
        }
    }
}

struct Inner<P: SocketProtocol> {
    protocol: P,
    poller: Poller,
    guarded: Mutex<Guarded<P>>,
    /// Inbound kernels live behind their own lock so that protocol
    /// callbacks (recovery in particular) may resubmit into this pipeline
    /// while the handler table is locked.
    kernels: Mutex<Vec<KernelPtr>>,
    start_timeout: Duration,
}

/// An event-loop thread owning a set of pollable connections, an inbound
/// kernel queue and a startup timeout.
pub struct SocketPipeline<P: SocketProtocol> {
    inner: Arc<Inner<P>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<P: SocketProtocol> SocketPipeline<P> {
    pub fn new(protocol: P, start_timeout: Duration) -> Result<SocketPipeline<P>> {
        Ok(SocketPipeline {
            inner: Arc::new(Inner {
                protocol,
                poller: Poller::new()?,
                guarded: Mutex::new(Guarded {
                    state: PipelineState::Initial,
                    handlers: HashMap::new(),
                    fd_index: HashMap::new(),
                    registered: HashMap::new(),
                    sack: KernelSack::new(),
                    protocol_state: P::State::default(),
                }),
                kernels: Mutex::new(Vec::new()),
                start_timeout,
            }),
            thread: Mutex::new(None),
        })
    }

    pub fn protocol(&self) -> &P {
        &self.inner.protocol
    }

    /// Run `f` with the handler table, protocol state and poller, then wake
    /// the loop so it can act on the changes.
    pub fn with_loop<R>(&self, f: impl FnOnce(&P, &mut LoopContext<'_, P>) -> R) -> R {
        let mut g = self.inner.guarded.lock().unwrap();
        let g = &mut *g;
        let mut cx = LoopContext {
            poller: &self.inner.poller,
            handlers: &mut g.handlers,
            state: &mut g.protocol_state,
            sack: &mut g.sack,
            fd_index: &mut g.fd_index,
            registered: &mut g.registered,
        };
        let result = f(&self.inner.protocol, &mut cx);
        self.inner.poller.notify_one();
        result
    }

    pub fn start(&self) {
        let inner = self.inner.clone();
        {
            let mut g = inner.guarded.lock().unwrap();
            g.state = PipelineState::Started;
        }
        let name = self.inner.protocol.name();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || event_loop(&inner))
            .expect("spawn socket pipeline thread");
        *self.thread.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) {
        let mut g = self.inner.guarded.lock().unwrap();
        g.state = PipelineState::Stopping;
        self.inner.poller.notify_one();
    }

    pub fn wait(&self) {
        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// The kernels surrendered during stop; release after every pipeline
    /// joined.
    pub fn take_sack(&self) -> KernelSack {
        std::mem::take(&mut self.inner.guarded.lock().unwrap().sack)
    }
}

impl<P: SocketProtocol> Pipeline for SocketPipeline<P> {
    fn send(&self, k: KernelPtr) {
        trace!("{}: send {:?}", self.inner.protocol.name(), k.base());
        self.inner.kernels.lock().unwrap().push(k);
        self.inner.poller.notify_one();
    }
}

fn event_loop<P: SocketProtocol>(inner: &Inner<P>) {
    let name = inner.protocol.name();
    loop {
        // 1. Pick the wait deadline from the earliest starting handler and
        //    refresh epoll interests.
        let deadline = {
            let mut g = inner.guarded.lock().unwrap();
            if g.state.stopping() {
                break;
            }
            refresh_interests(inner, &mut g);
            earliest_start_deadline(inner, &g)
        };
        // 2. Wait outside the lock.
        let events = match inner.poller.wait(deadline) {
            Ok(events) => events,
            Err(e) => {
                error!("{}: poll failed: {}", name, e);
                Vec::new()
            }
        };
        let mut g = inner.guarded.lock().unwrap();
        if g.state.stopping() {
            break;
        }
        let g = &mut *g;
        // 3. Route freshly submitted kernels.
        let kernels = std::mem::take(&mut *inner.kernels.lock().unwrap());
        if !kernels.is_empty() {
            let mut cx = context(inner, g);
            inner.protocol.process_kernels(&mut cx, kernels);
        }
        // 4. Dispatch readiness events.
        for event in &events {
            let primary = match g.fd_index.get(&event.fd) {
                Some(primary) => *primary,
                None => continue,
            };
            let mut handler = match g.handlers.remove(&primary) {
                Some(h) => h,
                None => continue,
            };
            {
                let mut cx = context(inner, g);
                inner.protocol.handle_event(&mut cx, event, &mut handler);
            }
            let status = inner.protocol.status(&handler);
            if status.state == ConnectionState::Stopped {
                let mut cx = context(inner, g);
                detach_fds(&mut cx, primary);
                inner.protocol.on_remove(&mut cx, handler);
            } else {
                g.handlers.insert(primary, handler);
            }
        }
        // 5. Remove connections whose start deadline passed.
        sweep_stalled(inner, g);
        // 6. Flush everyone's output.
        flush_all(inner, g);
    }
    // Orderly stop: flush once more, then surrender all kernels.
    let mut g = inner.guarded.lock().unwrap();
    let g = &mut *g;
    flush_all(inner, g);
    let primaries: Vec<RawFd> = g.handlers.keys().copied().collect();
    for primary in primaries {
        if let Some(handler) = g.handlers.remove(&primary) {
            let mut cx = context(inner, g);
            detach_fds(&mut cx, primary);
            let mut sack = KernelSack::new();
            inner.protocol.clear(handler, &mut sack);
            g.sack.extend(sack);
        }
    }
    let mut remaining = std::mem::take(&mut *inner.kernels.lock().unwrap());
    g.sack.append(&mut remaining);
    g.state = PipelineState::Stopped;
    trace!("{}: stopped", name);
}

fn context<'a, P: SocketProtocol>(inner: &'a Inner<P>, g: &'a mut Guarded<P>) -> LoopContext<'a, P> {
    LoopContext {
        poller: &inner.poller,
        handlers: &mut g.handlers,
        state: &mut g.protocol_state,
        sack: &mut g.sack,
        fd_index: &mut g.fd_index,
        registered: &mut g.registered,
    }
}

/// Drop the poller registrations of every fd owned by `primary`, keeping
/// the handler itself out of it.
fn detach_fds<P: SocketProtocol>(cx: &mut LoopContext<'_, P>, primary: RawFd) {
    let fds: Vec<RawFd> = cx
        .fd_index
        .iter()
        .filter(|(_, p)| **p == primary)
        .map(|(fd, _)| *fd)
        .collect();
    for fd in fds {
        cx.fd_index.remove(&fd);
        cx.registered.remove(&fd);
        cx.poller.remove(fd);
    }
}

fn refresh_interests<P: SocketProtocol>(inner: &Inner<P>, g: &mut Guarded<P>) {
    let base_read = EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP;
    let statuses: Vec<HandlerStatus> = g
        .handlers
        .values()
        .map(|h| inner.protocol.status(h))
        .collect();
    for status in statuses {
        if status.read_fd == status.write_fd {
            let mut flags = base_read;
            if status.pending_output || status.state == ConnectionState::Starting {
                flags |= EpollFlags::EPOLLOUT;
            }
            set_interest(&inner.poller, &mut g.registered, status.read_fd, flags);
            g.fd_index.insert(status.read_fd, status.read_fd);
        } else {
            set_interest(&inner.poller, &mut g.registered, status.read_fd, base_read);
            g.fd_index.insert(status.read_fd, status.read_fd);
            if status.pending_output {
                set_interest(
                    &inner.poller,
                    &mut g.registered,
                    status.write_fd,
                    EpollFlags::EPOLLOUT,
                );
                g.fd_index.insert(status.write_fd, status.read_fd);
            } else if g.registered.contains_key(&status.write_fd) {
                g.registered.remove(&status.write_fd);
                g.fd_index.remove(&status.write_fd);
                inner.poller.remove(status.write_fd);
            }
        }
    }
}

fn earliest_start_deadline<P: SocketProtocol>(
    inner: &Inner<P>,
    g: &Guarded<P>,
) -> Option<Instant> {
    if inner.start_timeout == Duration::from_secs(0) {
        return None;
    }
    g.handlers
        .values()
        .map(|h| inner.protocol.status(h))
        .filter(|s| s.state == ConnectionState::Starting)
        .filter_map(|s| s.start_time)
        .min()
        .map(|t| t + inner.start_timeout)
}

fn sweep_stalled<P: SocketProtocol>(inner: &Inner<P>, g: &mut Guarded<P>) {
    if inner.start_timeout == Duration::from_secs(0) {
        return;
    }
    let now = Instant::now();
    let stalled: Vec<RawFd> = g
        .handlers
        .iter()
        .filter(|(_, h)| {
            let s = inner.protocol.status(h);
            s.state == ConnectionState::Starting
                && s.start_time
                    .map(|t| t + inner.start_timeout <= now)
                    .unwrap_or(false)
        })
        .map(|(fd, _)| *fd)
        .collect();
    for primary in stalled {
        warn!("{}: connection {} timed out", inner.protocol.name(), primary);
        if let Some(handler) = g.handlers.remove(&primary) {
            let mut cx = context(inner, g);
            detach_fds(&mut cx, primary);
            inner.protocol.on_remove(&mut cx, handler);
        }
    }
}

fn flush_all<P: SocketProtocol>(inner: &Inner<P>, g: &mut Guarded<P>) {
    let primaries: Vec<RawFd> = g.handlers.keys().copied().collect();
    for primary in primaries {
        let stopped = match g.handlers.get_mut(&primary) {
            Some(handler) => {
                inner.protocol.flush(handler);
                inner.protocol.status(handler).state == ConnectionState::Stopped
            }
            None => false,
        };
        if stopped {
            if let Some(handler) = g.handlers.remove(&primary) {
                let mut cx = context(inner, g);
                detach_fds(&mut cx, primary);
                inner.protocol.on_remove(&mut cx, handler);
            }
        }
    }
}
