//! Two in-process "nodes" exchanging kernels over real localhost sockets:
//! upstream dispatch, downstream return with parent plugging, and recovery
//! when the peer never answers.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hive::connection::Router;
use hive::instance_registry::InstanceRegistry;
use hive::kernel::{Context, ExitCode, Kernel, KernelBase, KernelPtr};
use hive::kernel_buffer::KernelBuffer;
use hive::parallel_pipeline::ParallelPipeline;
use hive::pipeline::{Pipeline, ShutdownLatch};
use hive::remote_pipeline::{RemoteProtocol, RemoteSocketPipeline};
use hive::socket_address::SocketAddress;
use hive::socket_pipeline::SocketPipeline;
use hive::type_registry::TypeRegistry;

static NEXT_PORT: AtomicU16 = AtomicU16::new(41000);

fn next_port() -> u16 {
    NEXT_PORT.fetch_add(1, Ordering::SeqCst) + (std::process::id() % 500) as u16
}

#[derive(Default)]
struct Job {
    base: KernelBase,
    value: u32,
}

impl Kernel for Job {
    fn base(&self) -> &KernelBase {
        &self.base
    }
    fn base_mut(&mut self) -> &mut KernelBase {
        &mut self.base
    }
    fn act(&mut self, _ctx: &mut Context) {
        self.value *= 2;
        self.base.return_to_parent(ExitCode::Success);
    }
    fn write(&self, out: &mut KernelBuffer) -> hive::Result<()> {
        self.base.write(out)?;
        out.write_u32(self.value);
        Ok(())
    }
    fn read(&mut self, input: &mut KernelBuffer) -> hive::Result<()> {
        self.base.read(input)?;
        self.value = input.read_u32()?;
        Ok(())
    }
}

struct Origin {
    base: KernelBase,
    result: Arc<Mutex<Option<(ExitCode, u32)>>>,
    done: Arc<ShutdownLatch>,
}

impl Kernel for Origin {
    fn base(&self) -> &KernelBase {
        &self.base
    }
    fn base_mut(&mut self) -> &mut KernelBase {
        &mut self.base
    }
    fn act(&mut self, ctx: &mut Context) {
        let mut job = Box::new(Job::default());
        job.value = 21;
        ctx.upstream_remote(&mut self.base, job);
    }
    fn react(&mut self, _ctx: &mut Context, child: KernelPtr) {
        let value = (*child)
            .downcast_ref::<Job>()
            .map(|j| j.value)
            .unwrap_or(0);
        *self.result.lock().unwrap() = Some((child.base().result(), value));
        self.done.notify(0);
    }
}

struct Node {
    local: Arc<ParallelPipeline>,
    remote: Arc<RemoteSocketPipeline>,
    latch: Arc<ShutdownLatch>,
}

fn node(port: u16) -> Node {
    let types = Arc::new(TypeRegistry::new());
    types.register::<Job>(77).unwrap();
    let instances = Arc::new(InstanceRegistry::new());
    let latch = Arc::new(ShutdownLatch::new());
    let local = Arc::new(ParallelPipeline::new(
        "local",
        1,
        0,
        instances.clone(),
        latch.clone(),
    ));
    let remote = Arc::new(
        SocketPipeline::new(
            RemoteProtocol::new(types, instances, 0, port),
            Duration::from_secs(7),
        )
        .unwrap(),
    );
    remote.protocol().set_router(Router {
        native: local.clone() as Arc<dyn Pipeline>,
        remote: Some(remote.clone() as Arc<dyn Pipeline>),
    });
    local.set_remote_pipeline(remote.clone() as Arc<dyn Pipeline>);
    local.start();
    remote.start();
    Node {
        local,
        remote,
        latch,
    }
}

fn shutdown(node: &Node) {
    node.remote.stop();
    node.local.stop();
    node.remote.wait();
    node.local.wait();
}

#[test]
fn upstream_kernel_executes_remotely_and_returns() {
    let port_a = next_port();
    let port_b = next_port();
    let a = node(port_a);
    let b = node(port_b);
    b.remote
        .add_server("127.0.0.1/8".parse().unwrap())
        .unwrap();
    a.remote
        .add_client(&SocketAddress::new_ipv4(
            std::net::Ipv4Addr::LOCALHOST,
            port_b,
        ))
        .unwrap();
    let result = Arc::new(Mutex::new(None));
    let done = Arc::new(ShutdownLatch::new());
    a.local.send(Box::new(Origin {
        base: KernelBase::new(),
        result: result.clone(),
        done: done.clone(),
    }) as KernelPtr);
    assert_eq!(
        done.wait_timeout(Duration::from_secs(10)),
        Some(0),
        "completion never came back"
    );
    let observed = result.lock().unwrap().take().unwrap();
    assert_eq!(observed.0, ExitCode::Success);
    assert_eq!(observed.1, 42, "`act` must have run on the remote node");
    let _ = a.latch.try_get();
    shutdown(&a);
    shutdown(&b);
}

#[test]
fn unreachable_peer_bounces_with_endpoint_not_connected() {
    let port_a = next_port();
    let dead_port = next_port();
    let a = node(port_a);
    // Nobody listens on dead_port: the connect fails, recovery resubmits,
    // and with no other peers the kernel bounces back with the error code.
    let _ = a.remote.add_client(&SocketAddress::new_ipv4(
        std::net::Ipv4Addr::LOCALHOST,
        dead_port,
    ));
    let result = Arc::new(Mutex::new(None));
    let done = Arc::new(ShutdownLatch::new());
    a.local.send(Box::new(Origin {
        base: KernelBase::new(),
        result: result.clone(),
        done: done.clone(),
    }) as KernelPtr);
    assert_eq!(
        done.wait_timeout(Duration::from_secs(10)),
        Some(0),
        "bounce never arrived"
    );
    let observed = result.lock().unwrap().take().unwrap();
    assert_eq!(observed.0, ExitCode::EndpointNotConnected);
    shutdown(&a);
}

#[test]
fn client_table_reflects_add_remove_and_weights() {
    let port = next_port();
    let server_port = next_port();
    let server = node(server_port);
    server
        .remote
        .add_server("127.0.0.1/8".parse().unwrap())
        .unwrap();
    let a = node(port);
    let target = SocketAddress::new_ipv4(std::net::Ipv4Addr::LOCALHOST, server_port);
    a.remote.add_client(&target).unwrap();
    // Idempotent: adding again changes nothing.
    a.remote.add_client(&target).unwrap();
    let clients = a.remote.clients();
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].0, target);
    assert_eq!(clients[0].1, 1);
    a.remote.set_client_weight(&target, 5);
    let clients = a.remote.clients();
    assert_eq!(clients[0].1, 5);
    a.remote.stop_client(&target);
    assert!(a.remote.clients().is_empty());
    shutdown(&a);
    shutdown(&server);
}
