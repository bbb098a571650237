//! A full daemon and a submit client talking over a Unix socket: the
//! client's kernel spawns an application through the daemon's process
//! pipeline and mirrors the result, and a status query reaches the network
//! master under its well-known id.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use hive::factory::{Factory, Properties, SubmitFactory};
use hive::kernel::{Context, ExitCode, Kernel, KernelBase, KernelPtr, NETWORK_MASTER_ID};
use hive::network_master::StatusKernel;
use hive::pipeline::{Pipeline, ShutdownLatch};
use hive::socket_address::SocketAddress;
use hive::unix_pipeline::SubmitKernel;

fn daemon(dir: &std::path::Path, port: u16) -> (Factory, SocketAddress) {
    let socket = SocketAddress::new_unix(dir.join("hive.sock"));
    let properties = Properties {
        port,
        socket: socket.clone(),
        cache_directory: dir.join("cache"),
        interfaces: vec!["127.0.0.1/8".parse().unwrap()],
        upstream_threads: 2,
        allow_root: true,
        ..Properties::default()
    };
    let factory = Factory::new(properties).unwrap();
    factory.start().unwrap();
    (factory, socket)
}

struct SubmitRoot {
    base: KernelBase,
    socket: SocketAddress,
    arguments: Vec<String>,
    outcome: Arc<Mutex<Option<(ExitCode, u64, String)>>>,
    done: Arc<ShutdownLatch>,
}

impl Kernel for SubmitRoot {
    fn base(&self) -> &KernelBase {
        &self.base
    }
    fn base_mut(&mut self) -> &mut KernelBase {
        &mut self.base
    }
    fn act(&mut self, ctx: &mut Context) {
        let mut k = Box::new(SubmitKernel::new(
            self.arguments.clone(),
            vec!["PATH=/usr/bin:/bin".into()],
            "/".into(),
        ));
        k.base_mut().set_destination(self.socket.clone());
        ctx.upstream_remote(&mut self.base, k);
    }
    fn react(&mut self, _ctx: &mut Context, child: KernelPtr) {
        let code = child.base().result();
        let (app_id, error) = (*child)
            .downcast_ref::<SubmitKernel>()
            .map(|r| (r.application_id(), r.error().to_string()))
            .unwrap_or((0, String::new()));
        *self.outcome.lock().unwrap() = Some((code, app_id, error));
        self.done.notify(0);
    }
}

struct StatusRoot {
    base: KernelBase,
    socket: SocketAddress,
    outcome: Arc<Mutex<Option<(ExitCode, usize)>>>,
    done: Arc<ShutdownLatch>,
}

impl Kernel for StatusRoot {
    fn base(&self) -> &KernelBase {
        &self.base
    }
    fn base_mut(&mut self) -> &mut KernelBase {
        &mut self.base
    }
    fn act(&mut self, ctx: &mut Context) {
        let mut k = Box::new(StatusKernel::new());
        k.base_mut().set_destination(self.socket.clone());
        k.base_mut().set_principal_id(NETWORK_MASTER_ID);
        k.base_mut().set_parent_id(self.base.ensure_id());
        self.base.setf(hive::kernel::KernelFlags::PARKED);
        ctx.send_remote(k);
    }
    fn react(&mut self, _ctx: &mut Context, child: KernelPtr) {
        let code = child.base().result();
        let count = (*child)
            .downcast_ref::<StatusKernel>()
            .map(|s| s.hierarchies().len())
            .unwrap_or(0);
        *self.outcome.lock().unwrap() = Some((code, count));
        self.done.notify(0);
    }
}

#[test]
fn submit_spawns_an_application() {
    let dir = tempfile::tempdir().unwrap();
    let (factory, socket) = daemon(dir.path(), 42101);
    std::thread::sleep(Duration::from_millis(300));

    let client = SubmitFactory::new(socket.clone()).unwrap();
    client.start().unwrap();
    let outcome = Arc::new(Mutex::new(None));
    let done = Arc::new(ShutdownLatch::new());
    client.local().send(Box::new(SubmitRoot {
        base: KernelBase::new(),
        socket: socket.clone(),
        arguments: vec!["true".into()],
        outcome: outcome.clone(),
        done: done.clone(),
    }) as KernelPtr);
    assert_eq!(
        done.wait_timeout(Duration::from_secs(10)),
        Some(0),
        "submit reply never arrived"
    );
    let (code, app_id, error) = outcome.lock().unwrap().take().unwrap();
    assert_eq!(code, ExitCode::Success, "daemon refused the submit: {}", error);
    assert_ne!(app_id, 0);

    client.stop();
    client.wait();
    factory.stop();
    factory.wait();
}

#[test]
fn status_query_reaches_the_network_master() {
    let dir = tempfile::tempdir().unwrap();
    let (factory, socket) = daemon(dir.path(), 42102);
    std::thread::sleep(Duration::from_millis(300));

    let client = SubmitFactory::new(socket.clone()).unwrap();
    client.start().unwrap();
    let outcome = Arc::new(Mutex::new(None));
    let done = Arc::new(ShutdownLatch::new());
    client.local().send(Box::new(StatusRoot {
        base: KernelBase::new(),
        socket: socket.clone(),
        outcome: outcome.clone(),
        done: done.clone(),
    }) as KernelPtr);
    assert_eq!(
        done.wait_timeout(Duration::from_secs(10)),
        Some(0),
        "status reply never arrived"
    );
    let (code, hierarchies) = outcome.lock().unwrap().take().unwrap();
    assert_eq!(code, ExitCode::Success);
    assert_eq!(hierarchies, 1, "one interface was configured");

    client.stop();
    client.wait();
    factory.stop();
    factory.wait();
}
