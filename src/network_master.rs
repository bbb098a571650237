use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};

use crate::discoverer::{Discoverer, HierarchyKernel, Probe};
use crate::error::Result;
use crate::hierarchy::{Hierarchy, HierarchyNode};
use crate::interface_address::InterfaceAddress;
use crate::kernel::{Context, ExitCode, Kernel, KernelBase, KernelPtr, NETWORK_MASTER_ID};
use crate::kernel_buffer::KernelBuffer;
use crate::process_pipeline::ProcessEventKernel;
use crate::remote_pipeline::{PipelineEventKernel, RemoteSocketPipeline};
use crate::socket_address::SocketAddress;

/// Serializable snapshot of one interface's hierarchy, reported to the
/// status CLI.
#[derive(Default)]
pub struct HierarchyRecord {
    pub interface_address: InterfaceAddress,
    pub principal: Option<HierarchyNode>,
    pub subordinates: Vec<HierarchyNode>,
    pub total_weight: u32,
}

impl HierarchyRecord {
    fn of(hierarchy: &Hierarchy) -> HierarchyRecord {
        let mut subordinates: Vec<HierarchyNode> = hierarchy.subordinates().cloned().collect();
        subordinates.sort_by_key(|n| n.socket_address().to_bytes());
        HierarchyRecord {
            interface_address: hierarchy.interface_address(),
            principal: hierarchy.principal().cloned(),
            subordinates,
            total_weight: hierarchy.total_weight(),
        }
    }

    fn write(&self, out: &mut KernelBuffer) {
        out.write_interface_address(&self.interface_address);
        match &self.principal {
            Some(p) => {
                out.write_bool(true);
                p.write(out);
            }
            None => out.write_bool(false),
        }
        out.write_u32(self.subordinates.len() as u32);
        for s in &self.subordinates {
            s.write(out);
        }
        out.write_u32(self.total_weight);
    }

    fn read(input: &mut KernelBuffer) -> Result<HierarchyRecord> {
        let interface_address = input.read_interface_address()?;
        let principal = if input.read_bool()? {
            Some(HierarchyNode::read(input)?)
        } else {
            None
        };
        let n = input.read_u32()?;
        let mut subordinates = Vec::new();
        for _ in 0..n {
            subordinates.push(HierarchyNode::read(input)?);
        }
        let total_weight = input.read_u32()?;
        Ok(HierarchyRecord {
            interface_address,
            principal,
            subordinates,
            total_weight,
        })
    }
}

/// Point-to-point query answered by the network master (instance id 1)
/// with every interface's hierarchy.
#[derive(Default)]
pub struct StatusKernel {
    base: KernelBase,
    hierarchies: Vec<HierarchyRecord>,
}

impl StatusKernel {
    pub fn new() -> StatusKernel {
        StatusKernel::default()
    }

    pub fn hierarchies(&self) -> &[HierarchyRecord] {
        &self.hierarchies
    }
}

impl Kernel for StatusKernel {
    fn base(&self) -> &KernelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut KernelBase {
        &mut self.base
    }

    fn write(&self, out: &mut KernelBuffer) -> Result<()> {
        self.base.write(out)?;
        out.write_u32(self.hierarchies.len() as u32);
        for h in &self.hierarchies {
            h.write(out);
        }
        Ok(())
    }

    fn read(&mut self, input: &mut KernelBuffer) -> Result<()> {
        self.base.read(input)?;
        let n = input.read_u32()?;
        self.hierarchies = (0..n)
            .map(|_| HierarchyRecord::read(input))
            .collect::<Result<_>>()?;
        Ok(())
    }
}

/// Re-enumeration tick. Local only.
struct NetworkTimer {
    base: KernelBase,
}

impl Kernel for NetworkTimer {
    fn base(&self) -> &KernelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut KernelBase {
        &mut self.base
    }
}

/// The daemon's root resident kernel: watches the host's interface
/// addresses, owns one discoverer per interface, and forwards probes,
/// hierarchy updates and transport events to the right discoverer by
/// subnet.
pub struct NetworkMaster {
    base: KernelBase,
    remote: Arc<RemoteSocketPipeline>,
    port: u16,
    fanout: u32,
    scan_interval: Duration,
    discovery_interval: Duration,
    cache_directory: PathBuf,
    /// Explicit interface list; empty means "enumerate the host".
    allowed: Vec<InterfaceAddress>,
    discoverers: HashMap<InterfaceAddress, (u64, Arc<Mutex<Hierarchy>>)>,
    timer_pending: bool,
}

impl NetworkMaster {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        remote: Arc<RemoteSocketPipeline>,
        port: u16,
        fanout: u32,
        scan_interval: Duration,
        discovery_interval: Duration,
        cache_directory: PathBuf,
        allowed: Vec<InterfaceAddress>,
    ) -> NetworkMaster {
        let mut base = KernelBase::new();
        base.set_id(NETWORK_MASTER_ID);
        NetworkMaster {
            base,
            remote,
            port,
            fanout,
            scan_interval,
            discovery_interval,
            cache_directory,
            allowed,
            discoverers: HashMap::new(),
            timer_pending: false,
        }
    }

    fn enumerate_ifaddrs(&self) -> Vec<InterfaceAddress> {
        if !self.allowed.is_empty() {
            return self.allowed.clone();
        }
        let mut out = Vec::new();
        let addrs = match nix::ifaddrs::getifaddrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                warn!("net: cannot enumerate interfaces: {}", e);
                return out;
            }
        };
        for ifa in addrs {
            let (address, netmask) = match (&ifa.address, &ifa.netmask) {
                (
                    Some(nix::sys::socket::SockAddr::Inet(addr)),
                    Some(nix::sys::socket::SockAddr::Inet(mask)),
                ) => match (addr.to_std(), mask.to_std()) {
                    (std::net::SocketAddr::V4(a), std::net::SocketAddr::V4(m)) => {
                        (*a.ip(), *m.ip())
                    }
                    _ => continue,
                },
                _ => continue,
            };
            let candidate = InterfaceAddress::new(address, netmask);
            if !candidate.is_loopback() && !candidate.is_widearea() {
                out.push(candidate);
            }
        }
        out
    }

    fn update_ifaddrs(&mut self, ctx: &mut Context) {
        let current = self.enumerate_ifaddrs();
        let to_add: Vec<InterfaceAddress> = current
            .iter()
            .filter(|ifa| !self.discoverers.contains_key(ifa))
            .copied()
            .collect();
        let to_remove: Vec<InterfaceAddress> = self
            .discoverers
            .keys()
            .filter(|ifa| !current.contains(ifa))
            .copied()
            .collect();
        for ifaddr in to_remove {
            self.remove_ifaddr(ifaddr);
        }
        for ifaddr in to_add {
            self.add_ifaddr(ctx, ifaddr);
        }
    }

    fn add_ifaddr(&mut self, ctx: &mut Context, ifaddr: InterfaceAddress) {
        debug!("net: add interface address {}", ifaddr);
        if let Err(e) = self.remote.add_server(ifaddr) {
            warn!("net: cannot listen on {}: {}", ifaddr, e);
            return;
        }
        let mut discoverer = Box::new(Discoverer::new(
            ifaddr,
            self.port,
            self.fanout,
            self.discovery_interval,
            self.cache_directory.clone(),
            self.remote.clone(),
        ));
        let id = discoverer.base_mut().ensure_id();
        let hierarchy = discoverer.hierarchy();
        self.discoverers.insert(ifaddr, (id, hierarchy));
        ctx.upstream(&mut self.base, discoverer);
    }

    fn remove_ifaddr(&mut self, ifaddr: InterfaceAddress) {
        debug!("net: remove interface address {}", ifaddr);
        self.remote.remove_server(ifaddr);
        // The discoverer stays suspended until shutdown; its clients and
        // server are gone, so it goes quiet.
        self.discoverers.remove(&ifaddr);
    }

    fn find_discoverer(&self, addr: Ipv4Addr) -> Option<u64> {
        self.discoverers
            .iter()
            .find(|(ifaddr, _)| ifaddr.contains(addr))
            .map(|(_, (id, _))| *id)
    }

    /// Re-address a kernel to the discoverer responsible for `addr`. The
    /// destination is cleared so the kernel stays inside this process.
    fn forward_to_discoverer(&self, ctx: &mut Context, mut k: KernelPtr, addr: Option<Ipv4Addr>) {
        let id = addr.and_then(|a| self.find_discoverer(a));
        match id {
            Some(id) => {
                k.base_mut().set_principal_id(id);
                k.base_mut().set_destination(SocketAddress::Unspecified);
                ctx.send(k);
            }
            None => debug!("net: no discoverer for {:?}", k.base()),
        }
    }

    fn report_status(&self, ctx: &mut Context, mut status: Box<StatusKernel>) {
        status.hierarchies = self
            .discoverers
            .values()
            .map(|(_, h)| HierarchyRecord::of(&h.lock().unwrap()))
            .collect();
        status
            .hierarchies
            .sort_by_key(|r| u32::from(r.interface_address.address()));
        status.base_mut().return_to_parent(ExitCode::Success);
        ctx.send(status);
    }

    fn schedule_timer(&mut self, ctx: &mut Context) {
        if self.timer_pending {
            return;
        }
        self.timer_pending = true;
        let mut timer = Box::new(NetworkTimer {
            base: KernelBase::new(),
        });
        timer.base_mut().set_parent_id(NETWORK_MASTER_ID);
        timer.base_mut().set_principal_id(NETWORK_MASTER_ID);
        timer.base_mut().set_after(self.scan_interval);
        ctx.send(timer);
    }
}

impl Kernel for NetworkMaster {
    fn base(&self) -> &KernelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut KernelBase {
        &mut self.base
    }

    fn act(&mut self, ctx: &mut Context) {
        self.base.setf(crate::kernel::KernelFlags::PARKED);
        self.update_ifaddrs(ctx);
        self.schedule_timer(ctx);
    }

    fn react(&mut self, ctx: &mut Context, child: KernelPtr) {
        if (*child).is::<NetworkTimer>() {
            self.timer_pending = false;
            self.update_ifaddrs(ctx);
            self.schedule_timer(ctx);
        } else if let Some(probe) = (*child).downcast_ref::<Probe>() {
            let addr = Some(probe.interface_address().address());
            self.forward_to_discoverer(ctx, child, addr);
        } else if let Some(hk) = (*child).downcast_ref::<HierarchyKernel>() {
            let addr = Some(hk.interface_address().address());
            self.forward_to_discoverer(ctx, child, addr);
        } else if let Some(event) = (*child).downcast_ref::<PipelineEventKernel>() {
            let addr = event
                .interface_address()
                .map(|ifa| ifa.address())
                .or_else(|| event.socket_address().ipv4_addr());
            self.forward_to_discoverer(ctx, child, addr);
        } else if (*child).is::<StatusKernel>() {
            let status = child.downcast::<StatusKernel>().ok().unwrap();
            self.report_status(ctx, status);
        } else if let Some(event) = (*child).downcast_ref::<ProcessEventKernel>() {
            debug!(
                "net: application {} exited with status {}",
                event.application_id(),
                event.exit_status()
            );
        } else {
            debug!("net: unexpected kernel {:?}", child.base());
        }
    }
}
