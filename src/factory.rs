use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::application::this_application;
use crate::connection::Router;
use crate::error::Result;
use crate::instance_registry::InstanceRegistry;
use crate::interface_address::InterfaceAddress;
use crate::kernel::{KernelPtr, NETWORK_MASTER_ID};
use crate::network_master::{NetworkMaster, StatusKernel};
use crate::parallel_pipeline::ParallelPipeline;
use crate::pipeline::{KernelSack, Pipeline, ShutdownLatch};
use crate::process_pipeline::{ProcessPipeline, ProcessProtocol};
use crate::remote_pipeline::{RemoteProtocol, RemoteSocketPipeline};
use crate::socket_address::SocketAddress;
use crate::socket_pipeline::SocketPipeline;
use crate::transaction_log::TransactionLog;
use crate::type_registry::TypeRegistry;
use crate::unix_pipeline::{SubmitKernel, UnixProtocol, UnixSocketPipeline};

/// Stable wire ids of the built-in kernel types.
pub const SUBMIT_KERNEL_TYPE: u16 = 1;
pub const PROBE_TYPE: u16 = 2;
pub const HIERARCHY_KERNEL_TYPE: u16 = 3;
pub const STATUS_KERNEL_TYPE: u16 = 4;

pub fn register_builtin_types(types: &TypeRegistry) -> Result<()> {
    types.register::<SubmitKernel>(SUBMIT_KERNEL_TYPE)?;
    types.register::<crate::discoverer::Probe>(PROBE_TYPE)?;
    types.register::<crate::discoverer::HierarchyKernel>(HIERARCHY_KERNEL_TYPE)?;
    types.register::<StatusKernel>(STATUS_KERNEL_TYPE)?;
    Ok(())
}

/// Daemon configuration knobs; every field has a sensible default and a
/// matching CLI flag.
#[derive(Clone, Debug)]
pub struct Properties {
    pub port: u16,
    pub fanout: u32,
    pub scan_interval: Duration,
    pub discovery_interval: Duration,
    pub start_timeout: Duration,
    pub cache_directory: PathBuf,
    pub socket: SocketAddress,
    pub transaction_log: Option<PathBuf>,
    pub upstream_threads: usize,
    pub downstream_threads: usize,
    pub allow_root: bool,
    pub interfaces: Vec<InterfaceAddress>,
}

impl Default for Properties {
    fn default() -> Properties {
        Properties {
            port: 33333,
            fanout: 10000,
            scan_interval: Duration::from_secs(60),
            discovery_interval: Duration::from_secs(10),
            start_timeout: Duration::from_secs(7),
            cache_directory: PathBuf::from("/tmp/hive"),
            socket: SocketAddress::new_unix("/tmp/hive.sock"),
            transaction_log: None,
            upstream_threads: 0,
            downstream_threads: 0,
            allow_root: false,
            interfaces: Vec::new(),
        }
    }
}

/// The daemon's pipeline set: a parallel
/// pipeline for local execution, the remote socket pipeline for peers, the
/// process pipeline for child applications and a Unix-domain front door
/// for the submit CLI.
pub struct Factory {
    properties: Properties,
    types: Arc<TypeRegistry>,
    instances: Arc<InstanceRegistry>,
    latch: Arc<ShutdownLatch>,
    local: Arc<ParallelPipeline>,
    remote: Arc<RemoteSocketPipeline>,
    process: Arc<ProcessPipeline>,
    unix: Arc<UnixSocketPipeline>,
    transaction_log: Option<Arc<TransactionLog>>,
}

impl Factory {
    pub fn new(properties: Properties) -> Result<Factory> {
        let types = Arc::new(TypeRegistry::new());
        register_builtin_types(&types)?;
        let instances = Arc::new(InstanceRegistry::new());
        let latch = Arc::new(ShutdownLatch::new());
        let threads = if properties.upstream_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            properties.upstream_threads
        };
        let local = Arc::new(ParallelPipeline::new(
            "local",
            threads,
            properties.downstream_threads,
            instances.clone(),
            latch.clone(),
        ));
        let this_app = this_application::id();
        let remote = Arc::new(SocketPipeline::new(
            RemoteProtocol::new(types.clone(), instances.clone(), this_app, properties.port),
            properties.start_timeout,
        )?);
        let process = Arc::new(ProcessPipeline::new(
            ProcessProtocol::new(
                types.clone(),
                instances.clone(),
                this_app,
                properties.allow_root,
            ),
            properties.start_timeout,
        )?);
        let unix = Arc::new(SocketPipeline::new(
            UnixProtocol::new(
                types.clone(),
                instances.clone(),
                this_app,
                properties.allow_root,
            ),
            properties.start_timeout,
        )?);
        let router = Router {
            native: local.clone() as Arc<dyn Pipeline>,
            remote: Some(remote.clone() as Arc<dyn Pipeline>),
        };
        remote.protocol().set_router(router.clone());
        remote
            .protocol()
            .set_foreign_pipeline(process.clone() as Arc<dyn Pipeline>);
        process.protocol().set_router(router.clone());
        unix.protocol().set_router(router);
        unix.protocol().set_process_pipeline(process.clone());
        local.set_remote_pipeline(remote.clone() as Arc<dyn Pipeline>);
        local.set_unix_pipeline(unix.clone() as Arc<dyn Pipeline>);
        local.set_error_pipeline(local.clone() as Arc<dyn Pipeline>);
        let transaction_log = match &properties.transaction_log {
            Some(_) => {
                let log = Arc::new(TransactionLog::new(types.clone()));
                local.set_transaction_log(log.clone());
                // Pipeline index 1 is the remote lane; see `open` below.
                remote.protocol().set_transaction_log(log.clone(), 1);
                Some(log)
            }
            None => None,
        };
        Ok(Factory {
            properties,
            types,
            instances,
            latch,
            local,
            remote,
            process,
            unix,
            transaction_log,
        })
    }

    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.types
    }

    pub fn instances(&self) -> &Arc<InstanceRegistry> {
        &self.instances
    }

    pub fn latch(&self) -> &Arc<ShutdownLatch> {
        &self.latch
    }

    pub fn local(&self) -> &Arc<ParallelPipeline> {
        &self.local
    }

    pub fn remote(&self) -> &Arc<RemoteSocketPipeline> {
        &self.remote
    }

    pub fn process(&self) -> &Arc<ProcessPipeline> {
        &self.process
    }

    pub fn unix(&self) -> &Arc<UnixSocketPipeline> {
        &self.unix
    }

    pub fn start(&self) -> Result<()> {
        std::fs::create_dir_all(&self.properties.cache_directory)?;
        // Recovery runs before any pipeline thread exists, so the log file
        // has exactly one writer.
        if let (Some(log), Some(path)) =
            (&self.transaction_log, &self.properties.transaction_log)
        {
            let pipelines: Vec<Arc<dyn Pipeline>> = vec![
                self.local.clone() as Arc<dyn Pipeline>,
                self.remote.clone() as Arc<dyn Pipeline>,
            ];
            log.open(path, &pipelines)?;
        }
        self.local.start();
        self.remote.start();
        self.process.start();
        self.unix.start();
        self.unix.add_server(&self.properties.socket)?;
        // The network master supervises discovery and answers status
        // queries under its well-known instance id.
        self.remote.add_listener(NETWORK_MASTER_ID);
        self.process.add_listener(NETWORK_MASTER_ID);
        let master = Box::new(NetworkMaster::new(
            self.remote.clone(),
            self.properties.port,
            self.properties.fanout,
            self.properties.scan_interval,
            self.properties.discovery_interval,
            self.properties.cache_directory.clone(),
            self.properties.interfaces.clone(),
        ));
        self.local.send(master as KernelPtr);
        debug!("factory: started");
        Ok(())
    }

    pub fn stop(&self) {
        self.unix.stop();
        self.process.stop();
        self.remote.stop();
        self.local.stop();
        if let Some(log) = &self.transaction_log {
            log.close();
        }
    }

    /// Join every thread, then release the surrendered kernels.
    pub fn wait(&self) {
        self.unix.wait();
        self.process.wait();
        self.remote.wait();
        self.local.wait();
        let mut sack = KernelSack::new();
        self.local.clear(&mut sack);
        sack.extend(self.remote.take_sack());
        sack.extend(self.process.take_sack());
        sack.extend(self.unix.take_sack());
        self.instances.clear(&mut sack);
        drop(sack);
        debug!("factory: stopped");
    }
}

/// The submit CLI's reduced pipeline set: one local worker and a Unix
/// client connection to the daemon.
pub struct SubmitFactory {
    types: Arc<TypeRegistry>,
    instances: Arc<InstanceRegistry>,
    latch: Arc<ShutdownLatch>,
    local: Arc<ParallelPipeline>,
    unix: Arc<UnixSocketPipeline>,
    socket: SocketAddress,
}

impl SubmitFactory {
    pub fn new(socket: SocketAddress) -> Result<SubmitFactory> {
        let types = Arc::new(TypeRegistry::new());
        register_builtin_types(&types)?;
        let instances = Arc::new(InstanceRegistry::new());
        let latch = Arc::new(ShutdownLatch::new());
        let local = Arc::new(ParallelPipeline::new(
            "local",
            1,
            0,
            instances.clone(),
            latch.clone(),
        ));
        let unix = Arc::new(SocketPipeline::new(
            UnixProtocol::new(
                types.clone(),
                instances.clone(),
                this_application::id(),
                false,
            ),
            Duration::from_secs(7),
        )?);
        unix.protocol().set_router(Router {
            native: local.clone() as Arc<dyn Pipeline>,
            remote: None,
        });
        local.set_remote_pipeline(unix.clone() as Arc<dyn Pipeline>);
        local.set_unix_pipeline(unix.clone() as Arc<dyn Pipeline>);
        Ok(SubmitFactory {
            types,
            instances,
            latch,
            local,
            unix,
            socket,
        })
    }

    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.types
    }

    pub fn latch(&self) -> &Arc<ShutdownLatch> {
        &self.latch
    }

    pub fn local(&self) -> &Arc<ParallelPipeline> {
        &self.local
    }

    pub fn socket(&self) -> &SocketAddress {
        &self.socket
    }

    pub fn start(&self) -> Result<()> {
        self.local.start();
        self.unix.start();
        self.unix.add_client(&self.socket)
    }

    pub fn stop(&self) {
        self.unix.stop();
        self.local.stop();
    }

    pub fn wait(&self) {
        self.unix.wait();
        self.local.wait();
        let mut sack = KernelSack::new();
        self.local.clear(&mut sack);
        sack.extend(self.unix.take_sack());
        self.instances.clear(&mut sack);
    }
}
