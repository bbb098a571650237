use std::collections::{BinaryHeap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::SystemTime;

use log::{debug, error, trace};

use crate::instance_registry::InstanceRegistry;
use crate::kernel::{Context, ExitCode, KernelFlags, KernelPtr};
use crate::pipeline::{KernelSack, Pipeline, PipelineState, ShutdownLatch};
use crate::transaction_log::TransactionLog;

/// Timer-queue entry: earliest deadline first, FIFO among equal deadlines.
struct TimedKernel {
    at: SystemTime,
    seq: u64,
    kernel: KernelPtr,
}

impl PartialEq for TimedKernel {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for TimedKernel {}

impl PartialOrd for TimedKernel {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimedKernel {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert to pop the earliest deadline.
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Queues {
    state: PipelineState,
    upstream: VecDeque<KernelPtr>,
    timer: BinaryHeap<TimedKernel>,
    downstream: Vec<VecDeque<KernelPtr>>,
}

struct Inner {
    name: &'static str,
    queues: Mutex<Queues>,
    upstream_semaphore: Condvar,
    timer_semaphore: Condvar,
    downstream_semaphores: Vec<Condvar>,
    num_upstream: usize,
    num_downstream: usize,
    timer_seq: AtomicU64,
    instances: Arc<InstanceRegistry>,
    latch: Arc<ShutdownLatch>,
    /// Kernels that panicked in `act`/`react` are sent here.
    error_pipeline: Mutex<Option<Arc<dyn Pipeline>>>,
    /// Where `Context::send_remote` kernels go.
    remote_pipeline: Mutex<Option<Arc<dyn Pipeline>>>,
    /// Where kernels with a Unix-domain destination go (submit replies).
    unix_pipeline: Mutex<Option<Arc<dyn Pipeline>>>,
    transaction_log: Mutex<Option<Arc<TransactionLog>>>,
}

impl Inner {
    /// Pick the outward pipeline for a destination-addressed kernel;
    /// returns the kernel when this process has no matching way out.
    fn route_out(&self, k: KernelPtr) -> Option<KernelPtr> {
        let pipeline = match k.base().destination() {
            crate::socket_address::SocketAddress::Unix(_) => self
                .unix_pipeline
                .lock()
                .unwrap()
                .clone()
                .or_else(|| self.remote_pipeline.lock().unwrap().clone()),
            _ => self.remote_pipeline.lock().unwrap().clone(),
        };
        match pipeline {
            Some(pipeline) => {
                pipeline.send(k);
                None
            }
            None => Some(k),
        }
    }
}

/// The local scheduler: `N` upstream workers, one timer thread and `M`
/// optional downstream workers share three kinds of queues behind a single
/// mutex. Completions for one principal always land in the same downstream
/// queue, so `react` calls for that principal are single-threaded and
/// ordered.
pub struct ParallelPipeline {
    inner: Arc<Inner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ParallelPipeline {
    pub fn new(
        name: &'static str,
        num_upstream: usize,
        num_downstream: usize,
        instances: Arc<InstanceRegistry>,
        latch: Arc<ShutdownLatch>,
    ) -> ParallelPipeline {
        let num_upstream = num_upstream.max(1);
        let buckets = if num_downstream == 0 {
            num_upstream
        } else {
            num_downstream
        };
        let inner = Inner {
            name,
            queues: Mutex::new(Queues {
                state: PipelineState::Initial,
                upstream: VecDeque::new(),
                timer: BinaryHeap::new(),
                downstream: (0..buckets).map(|_| VecDeque::new()).collect(),
            }),
            upstream_semaphore: Condvar::new(),
            timer_semaphore: Condvar::new(),
            downstream_semaphores: (0..num_downstream).map(|_| Condvar::new()).collect(),
            num_upstream,
            num_downstream,
            timer_seq: AtomicU64::new(0),
            instances,
            latch,
            error_pipeline: Mutex::new(None),
            remote_pipeline: Mutex::new(None),
            unix_pipeline: Mutex::new(None),
            transaction_log: Mutex::new(None),
        };
        ParallelPipeline {
            inner: Arc::new(inner),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn num_upstream_threads(&self) -> usize {
        self.inner.num_upstream
    }

    pub fn num_downstream_threads(&self) -> usize {
        self.inner.num_downstream
    }

    pub fn instances(&self) -> &Arc<InstanceRegistry> {
        &self.inner.instances
    }

    pub fn latch(&self) -> &Arc<ShutdownLatch> {
        &self.inner.latch
    }

    pub fn set_error_pipeline(&self, rhs: Arc<dyn Pipeline>) {
        *self.inner.error_pipeline.lock().unwrap() = Some(rhs);
    }

    pub fn set_remote_pipeline(&self, rhs: Arc<dyn Pipeline>) {
        *self.inner.remote_pipeline.lock().unwrap() = Some(rhs);
    }

    pub fn set_unix_pipeline(&self, rhs: Arc<dyn Pipeline>) {
        *self.inner.unix_pipeline.lock().unwrap() = Some(rhs);
    }

    pub fn set_transaction_log(&self, rhs: Arc<TransactionLog>) {
        *self.inner.transaction_log.lock().unwrap() = Some(rhs);
    }

    pub fn start(&self) {
        let mut threads = self.threads.lock().unwrap();
        {
            let mut q = self.inner.queues.lock().unwrap();
            q.state = PipelineState::Starting;
        }
        for i in 0..self.inner.num_upstream {
            let inner = self.inner.clone();
            threads.push(
                std::thread::Builder::new()
                    .name(format!("{}-up-{}", self.inner.name, i))
                    .spawn(move || upstream_loop(&inner, i))
                    .expect("spawn upstream worker"),
            );
        }
        {
            let inner = self.inner.clone();
            threads.push(
                std::thread::Builder::new()
                    .name(format!("{}-timer", self.inner.name))
                    .spawn(move || timer_loop(&inner))
                    .expect("spawn timer thread"),
            );
        }
        for i in 0..self.inner.num_downstream {
            let inner = self.inner.clone();
            threads.push(
                std::thread::Builder::new()
                    .name(format!("{}-down-{}", self.inner.name, i))
                    .spawn(move || downstream_loop(&inner, i))
                    .expect("spawn downstream worker"),
            );
        }
        let mut q = self.inner.queues.lock().unwrap();
        q.state = PipelineState::Started;
    }

    pub fn stop(&self) {
        let mut q = self.inner.queues.lock().unwrap();
        q.state = PipelineState::Stopping;
        self.inner.upstream_semaphore.notify_all();
        self.inner.timer_semaphore.notify_all();
        for s in &self.inner.downstream_semaphores {
            s.notify_all();
        }
    }

    pub fn wait(&self) {
        let threads: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        for t in threads {
            let _ = t.join();
        }
        let mut q = self.inner.queues.lock().unwrap();
        q.state = PipelineState::Stopped;
    }

    /// Drain every queue into `sack`; called after `wait`.
    pub fn clear(&self, sack: &mut KernelSack) {
        let mut q = self.inner.queues.lock().unwrap();
        sack.extend(q.upstream.drain(..));
        while let Some(t) = q.timer.pop() {
            sack.push(t.kernel);
        }
        for queue in &mut q.downstream {
            sack.extend(queue.drain(..));
        }
    }
}

impl Pipeline for ParallelPipeline {
    fn send(&self, k: KernelPtr) {
        trace!("{}: send {:?}", self.inner.name, k.base());
        send_one(&self.inner, k);
    }
}

fn send_one(inner: &Inner, k: KernelPtr) {
    let mut q = inner.queues.lock().unwrap();
    if k.base().moves_downstream() {
        let buckets = q.downstream.len();
        let i = (k.base().principal_id() % buckets as u64) as usize;
        q.downstream[i].push_back(k);
        if inner.num_downstream == 0 {
            inner.upstream_semaphore.notify_all();
        } else {
            inner.downstream_semaphores[i].notify_one();
        }
    } else if k.base().scheduled() {
        let at = k.base().at();
        let seq = inner.timer_seq.fetch_add(1, Ordering::Relaxed);
        q.timer.push(TimedKernel { at, seq, kernel: k });
        inner.timer_semaphore.notify_one();
    } else {
        q.upstream.push_back(k);
        inner.upstream_semaphore.notify_one();
    }
}

fn upstream_loop(inner: &Arc<Inner>, index: usize) {
    let mut q = inner.queues.lock().unwrap();
    loop {
        loop {
            // Drain this worker's downstream bucket first so `react` runs
            // before further `act` on the same worker.
            let k = if inner.num_downstream == 0 {
                q.downstream[index].pop_front()
            } else {
                None
            };
            let k = k.or_else(|| q.upstream.pop_front());
            match k {
                Some(k) => {
                    drop(q);
                    process_kernel(inner, k);
                    q = inner.queues.lock().unwrap();
                }
                None => break,
            }
        }
        if q.state.stopping() {
            break;
        }
        q = inner.upstream_semaphore.wait(q).unwrap();
    }
}

fn timer_loop(inner: &Arc<Inner>) {
    let mut q = inner.queues.lock().unwrap();
    loop {
        if q.state.stopping() {
            break;
        }
        let now = SystemTime::now();
        let head_due = match q.timer.peek() {
            Some(head) => {
                if head.at <= now {
                    None
                } else {
                    Some(head.at.duration_since(now).unwrap_or_default())
                }
            }
            None => None,
        };
        match (q.timer.peek().is_some(), head_due) {
            (true, None) => {
                let k = q.timer.pop().unwrap().kernel;
                drop(q);
                process_kernel(inner, k);
                q = inner.queues.lock().unwrap();
            }
            (true, Some(wait)) => {
                let (g, _) = inner.timer_semaphore.wait_timeout(q, wait).unwrap();
                q = g;
            }
            (false, _) => {
                q = inner.timer_semaphore.wait(q).unwrap();
            }
        }
    }
}

fn downstream_loop(inner: &Arc<Inner>, index: usize) {
    let mut q = inner.queues.lock().unwrap();
    loop {
        while let Some(k) = q.downstream[index].pop_front() {
            drop(q);
            process_kernel(inner, k);
            q = inner.queues.lock().unwrap();
        }
        if q.state.stopping() {
            break;
        }
        q = inner.downstream_semaphores[index].wait(q).unwrap();
    }
}

/// Kernel ownership during one dispatch. The slots live outside the panic
/// boundary so the dispatcher can still roll back and route after a panic
/// in user code.
struct ExecSlot {
    kernel: Option<KernelPtr>,
    principal: Option<KernelPtr>,
}

fn process_kernel(inner: &Arc<Inner>, k: KernelPtr) {
    let mut ctx = Context::new();
    let mut slot = ExecSlot {
        kernel: Some(k),
        principal: None,
    };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        execute(inner, &mut slot, &mut ctx);
    }));
    if let Err(payload) = outcome {
        let what = payload_to_string(&payload);
        error!(
            "{}: execution failed: {}\n{:?}",
            inner.name,
            what,
            backtrace::Backtrace::new()
        );
        // Roll back whichever kernel we still hold, then route it
        // to the error pipeline or drop it.
        let failed = slot.principal.take().or_else(|| slot.kernel.take());
        if let Some(mut failed) = failed {
            let rollback =
                panic::catch_unwind(AssertUnwindSafe(|| failed.rollback(&mut ctx)));
            if rollback.is_err() {
                error!("{}: rollback failed for {:?}", inner.name, failed.base());
            }
            let error_pipeline = inner.error_pipeline.lock().unwrap().clone();
            match error_pipeline {
                Some(pipeline) if failed.base().parent().is_set() => {
                    failed.base_mut().return_to_parent(ExitCode::Error);
                    pipeline.send(failed);
                }
                _ => debug!("{}: dropping failed kernel {:?}", inner.name, failed.base()),
            }
        }
    } else {
        // Callback-time routing decisions.
        if let Some(p) = slot.principal.take() {
            route_after(inner, p);
        }
        if let Some(k) = slot.kernel.take() {
            route_after(inner, k);
        }
    }
    drain_context(inner, ctx);
}

fn payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<unknown panic>".to_string()
    }
}

fn execute(inner: &Arc<Inner>, slot: &mut ExecSlot, ctx: &mut Context) {
    let base = slot.kernel.as_ref().unwrap().base();
    let result = base.result();
    let has_principal = base.principal().is_set();
    if result.is_undefined() {
        if has_principal {
            deliver(inner, slot, ctx);
        } else {
            slot.kernel.as_mut().unwrap().act(ctx);
        }
    } else if !has_principal {
        // The top of the lineage: the final result shuts the process down.
        let k = slot.kernel.take().unwrap();
        debug!("{}: shutdown after {:?}", inner.name, k.base());
        inner.latch.notify(result.to_exit_status());
    } else {
        deliver(inner, slot, ctx);
    }
}

fn deliver(inner: &Arc<Inner>, slot: &mut ExecSlot, ctx: &mut Context) {
    let mut child = slot.kernel.take().unwrap();
    let principal_id = child.base().principal_id();
    if principal_id == child.base().id() {
        // A recursed kernel is its own principal; it simply continues.
        child.act(ctx);
        slot.kernel = Some(child);
        return;
    }
    if principal_id == child.base().parent_id() {
        // A kernel that carried its parent can be delivered to the
        // embedded copy even when the parent was never suspended here
        // (link recovery, transaction-log restore).
        if let Some(parent) = child.base_mut().parent_mut().take_owned() {
            let result = child.base().result();
            slot.principal = Some(parent);
            let parent = slot.principal.as_mut().unwrap();
            parent.base_mut().ensure_id();
            if result.is_undefined() || result == ExitCode::Success {
                parent.react(ctx, child);
            } else {
                parent.error(ctx, child);
            }
            return;
        }
    }
    match inner.instances.take(principal_id) {
        Some(principal) => {
            let result = child.base().result();
            let child_id = child.base().id();
            if child.base().isset(KernelFlags::DO_NOT_DELETE) {
                // One-shot flag: honored by handing the kernel over to the
                // principal, which decides its fate.
                child.base_mut().unsetf(KernelFlags::DO_NOT_DELETE);
            }
            let was_downstream = child.base().moves_downstream();
            // The slot keeps the principal reachable across a panic inside
            // `react`.
            slot.principal = Some(principal);
            let principal = slot.principal.as_mut().unwrap();
            if result.is_undefined() || result == ExitCode::Success {
                principal.react(ctx, child);
            } else {
                principal.error(ctx, child);
            }
            if was_downstream {
                if let Some(log) = inner.transaction_log.lock().unwrap().as_ref() {
                    if let Err(e) = log.write_end(child_id) {
                        error!("{}: transaction log: {}", inner.name, e);
                    }
                }
            }
        }
        None => {
            debug!(
                "{}: no principal {} found for {:?}",
                inner.name,
                principal_id,
                child.base()
            );
            if child.base().result() == ExitCode::NoPrincipalFound
                || !child.base().parent().is_set()
            {
                // Already bounced once, or nowhere to bounce: drop.
                debug!("{}: dropping {:?}", inner.name, child.base());
                return;
            }
            child.base_mut().return_to_parent(ExitCode::NoPrincipalFound);
            slot.kernel = Some(child);
        }
    }
}

/// Decide what happens to a kernel after user code ran: route it onward if
/// it started moving, park it if it awaits subordinates, drop it otherwise.
fn route_after(inner: &Arc<Inner>, k: KernelPtr) {
    let base = k.base();
    if base.is_deleted() {
        return;
    }
    if !base.result().is_undefined() && !base.principal().is_set() {
        // The top of the lineage returned: its code is the exit status.
        debug!("{}: shutdown after {:?}", inner.name, base);
        inner.latch.notify(base.result().to_exit_status());
        return;
    }
    if base.moves_downstream() || base.moves_somewhere() {
        let k = if base.destination().is_set() {
            match inner.route_out(k) {
                Some(k) => k, // no way out of this process; deliver locally
                None => return,
            }
        } else {
            k
        };
        send_one(inner, k);
    } else if base.isset(KernelFlags::PARKED) {
        inner.instances.park(k);
    } else {
        trace!("{}: done with {:?}", inner.name, k.base());
    }
}

fn drain_context(inner: &Arc<Inner>, ctx: Context) {
    let Context { local, remote } = ctx;
    for k in local {
        // A destination-addressed kernel leaves this process if it can.
        let k = if k.base().destination().is_set()
            && (k.base().moves_downstream() || k.base().moves_somewhere())
        {
            match inner.route_out(k) {
                Some(k) => k,
                None => continue,
            }
        } else {
            k
        };
        send_one(inner, k);
    }
    if !remote.is_empty() {
        let pipeline = inner.remote_pipeline.lock().unwrap().clone();
        match pipeline {
            Some(pipeline) => {
                for k in remote {
                    pipeline.send(k);
                }
            }
            None => {
                for mut k in remote {
                    debug!("{}: no remote pipeline for {:?}", inner.name, k.base());
                    if k.base().parent().is_set() {
                        k.base_mut().return_to_parent(ExitCode::EndpointNotConnected);
                        send_one(inner, k);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{Kernel, KernelBase};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn pipeline(n_up: usize, n_down: usize) -> ParallelPipeline {
        ParallelPipeline::new(
            "test",
            n_up,
            n_down,
            Arc::new(InstanceRegistry::new()),
            Arc::new(ShutdownLatch::new()),
        )
    }

    struct Echo {
        base: KernelBase,
    }

    impl Kernel for Echo {
        fn base(&self) -> &KernelBase {
            &self.base
        }
        fn base_mut(&mut self) -> &mut KernelBase {
            &mut self.base
        }
        fn act(&mut self, _ctx: &mut Context) {
            self.base.return_to_parent(ExitCode::Success);
        }
    }

    #[test]
    fn local_echo_shuts_down_with_success() {
        let p = pipeline(1, 0);
        p.start();
        let mut k = Box::new(Echo {
            base: KernelBase::new(),
        });
        // No parent: after `act` flips the result, the kernel is the top of
        // its lineage and its code becomes the exit status.
        k.base_mut().set_result(ExitCode::Undefined);
        p.send(k);
        let code = p.latch().wait_timeout(Duration::from_secs(5));
        assert_eq!(code, Some(ExitCode::Success.to_exit_status()));
        p.stop();
        p.wait();
    }

    struct Timed {
        base: KernelBase,
        order: Arc<Mutex<Vec<u32>>>,
        tag: u32,
        done: Arc<ShutdownLatch>,
        expected: usize,
    }

    impl Kernel for Timed {
        fn base(&self) -> &KernelBase {
            &self.base
        }
        fn base_mut(&mut self) -> &mut KernelBase {
            &mut self.base
        }
        fn act(&mut self, _ctx: &mut Context) {
            let mut order = self.order.lock().unwrap();
            order.push(self.tag);
            if order.len() == self.expected {
                self.done.notify(0);
            }
        }
    }

    #[test]
    fn timer_fires_in_deadline_order() {
        let p = pipeline(1, 0);
        p.start();
        let order = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(ShutdownLatch::new());
        for &(tag, ms) in &[(100u32, 100u64), (10, 10), (50, 50)] {
            let mut k = Box::new(Timed {
                base: KernelBase::new(),
                order: order.clone(),
                tag,
                done: done.clone(),
                expected: 3,
            });
            k.base_mut().set_after(Duration::from_millis(ms));
            p.send(k);
        }
        assert_eq!(done.wait_timeout(Duration::from_secs(5)), Some(0));
        assert_eq!(*order.lock().unwrap(), vec![10, 50, 100]);
        p.stop();
        p.wait();
    }

    struct Parent {
        base: KernelBase,
        seen: Arc<Mutex<Vec<u32>>>,
        remaining: usize,
        done: Arc<ShutdownLatch>,
    }

    struct Child {
        base: KernelBase,
        tag: u32,
    }

    impl Kernel for Child {
        fn base(&self) -> &KernelBase {
            &self.base
        }
        fn base_mut(&mut self) -> &mut KernelBase {
            &mut self.base
        }
        fn act(&mut self, _ctx: &mut Context) {
            self.base.return_to_parent(ExitCode::Success);
        }
    }

    impl Kernel for Parent {
        fn base(&self) -> &KernelBase {
            &self.base
        }
        fn base_mut(&mut self) -> &mut KernelBase {
            &mut self.base
        }
        fn act(&mut self, ctx: &mut Context) {
            for tag in 0..4u32 {
                let child = Box::new(Child {
                    base: KernelBase::new(),
                    tag,
                });
                ctx.upstream(&mut self.base, child);
            }
        }
        fn react(&mut self, _ctx: &mut Context, child: KernelPtr) {
            let child = child.downcast::<Child>().ok().unwrap();
            self.seen.lock().unwrap().push(child.tag);
            self.remaining -= 1;
            if self.remaining == 0 {
                self.done.notify(0);
            }
        }
    }

    #[test]
    fn fan_out_collects_every_completion() {
        let p = pipeline(2, 1);
        p.start();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(ShutdownLatch::new());
        p.send(Box::new(Parent {
            base: KernelBase::new(),
            seen: seen.clone(),
            remaining: 4,
            done: done.clone(),
        }));
        assert_eq!(done.wait_timeout(Duration::from_secs(5)), Some(0));
        let mut tags = seen.lock().unwrap().clone();
        tags.sort_unstable();
        assert_eq!(tags, vec![0, 1, 2, 3]);
        p.stop();
        p.wait();
    }

    struct Panicky {
        base: KernelBase,
        rolled_back: Arc<AtomicUsize>,
    }

    impl Kernel for Panicky {
        fn base(&self) -> &KernelBase {
            &self.base
        }
        fn base_mut(&mut self) -> &mut KernelBase {
            &mut self.base
        }
        fn act(&mut self, _ctx: &mut Context) {
            panic!("deliberate failure");
        }
        fn rollback(&mut self, _ctx: &mut Context) {
            self.rolled_back.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn panic_in_act_triggers_rollback() {
        let p = pipeline(1, 0);
        p.start();
        let rolled_back = Arc::new(AtomicUsize::new(0));
        p.send(Box::new(Panicky {
            base: KernelBase::new(),
            rolled_back: rolled_back.clone(),
        }));
        for _ in 0..100 {
            if rolled_back.load(Ordering::SeqCst) == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(rolled_back.load(Ordering::SeqCst), 1);
        p.stop();
        p.wait();
    }

    #[test]
    fn clear_drains_queues_into_sack() {
        let p = pipeline(1, 0);
        // Not started: kernels stay queued.
        let mut k = Box::new(Echo {
            base: KernelBase::new(),
        });
        k.base_mut().set_after(Duration::from_secs(3600));
        p.send(k);
        p.send(Box::new(Echo {
            base: KernelBase::new(),
        }));
        let mut sack = KernelSack::new();
        p.clear(&mut sack);
        assert_eq!(sack.len(), 2);
    }
}
