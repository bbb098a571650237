use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};

use crate::error::Result;
use crate::hierarchy::Hierarchy;
use crate::interface_address::InterfaceAddress;
use crate::kernel::{
    Context, ExitCode, Kernel, KernelBase, KernelPtr, NETWORK_MASTER_ID,
};
use crate::kernel_buffer::KernelBuffer;
use crate::remote_pipeline::{PipelineEvent, PipelineEventKernel, RemoteSocketPipeline};
use crate::socket_address::SocketAddress;
use crate::tree_hierarchy::TreeHierarchyIterator;

/// How a node answers a probe.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ProbeResponse {
    None = 0,
    AddSubordinate = 1,
    RemoveSubordinate = 2,
    RejectSubordinate = 3,
    Retain = 4,
}

impl ProbeResponse {
    fn from_u8(raw: u8) -> ProbeResponse {
        match raw {
            1 => ProbeResponse::AddSubordinate,
            2 => ProbeResponse::RemoveSubordinate,
            3 => ProbeResponse::RejectSubordinate,
            4 => ProbeResponse::Retain,
            _ => ProbeResponse::None,
        }
    }
}

impl std::fmt::Display for ProbeResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ProbeResponse::None => "none",
            ProbeResponse::AddSubordinate => "add-subordinate",
            ProbeResponse::RemoveSubordinate => "remove-subordinate",
            ProbeResponse::RejectSubordinate => "reject-subordinate",
            ProbeResponse::Retain => "retain",
        })
    }
}

/// Asks a candidate superior to adopt the sender. Carries the sender's
/// interface address, its previous and prospective superiors and a weight
/// hint; comes back downstream with the verdict.
#[derive(Default)]
pub struct Probe {
    base: KernelBase,
    interface_address: InterfaceAddress,
    old_principal: SocketAddress,
    new_principal: SocketAddress,
    weight: u32,
    response: u8,
}

impl Probe {
    pub fn new(
        interface_address: InterfaceAddress,
        old_principal: SocketAddress,
        new_principal: SocketAddress,
        weight: u32,
    ) -> Probe {
        Probe {
            base: KernelBase::new(),
            interface_address,
            old_principal,
            new_principal,
            weight,
            response: 0,
        }
    }

    pub fn interface_address(&self) -> InterfaceAddress {
        self.interface_address
    }

    pub fn response(&self) -> ProbeResponse {
        ProbeResponse::from_u8(self.response)
    }
}

impl Kernel for Probe {
    fn base(&self) -> &KernelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut KernelBase {
        &mut self.base
    }

    fn write(&self, out: &mut KernelBuffer) -> Result<()> {
        self.base.write(out)?;
        out.write_interface_address(&self.interface_address);
        out.write_socket_address(&self.old_principal);
        out.write_socket_address(&self.new_principal);
        out.write_u32(self.weight);
        out.write_u8(self.response);
        Ok(())
    }

    fn read(&mut self, input: &mut KernelBuffer) -> Result<()> {
        self.base.read(input)?;
        self.interface_address = input.read_interface_address()?;
        self.old_principal = input.read_socket_address()?;
        self.new_principal = input.read_socket_address()?;
        self.weight = input.read_u32()?;
        self.response = input.read_u8()?;
        Ok(())
    }
}

/// Announces a node's new weight to its superior.
#[derive(Default)]
pub struct HierarchyKernel {
    base: KernelBase,
    interface_address: InterfaceAddress,
    weight: u32,
}

impl HierarchyKernel {
    pub fn new(interface_address: InterfaceAddress, weight: u32) -> HierarchyKernel {
        HierarchyKernel {
            base: KernelBase::new(),
            interface_address,
            weight,
        }
    }

    pub fn interface_address(&self) -> InterfaceAddress {
        self.interface_address
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }
}

impl Kernel for HierarchyKernel {
    fn base(&self) -> &KernelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut KernelBase {
        &mut self.base
    }

    fn write(&self, out: &mut KernelBuffer) -> Result<()> {
        self.base.write(out)?;
        out.write_interface_address(&self.interface_address);
        out.write_u32(self.weight);
        Ok(())
    }

    fn read(&mut self, input: &mut KernelBuffer) -> Result<()> {
        self.base.read(input)?;
        self.interface_address = input.read_interface_address()?;
        self.weight = input.read_u32()?;
        Ok(())
    }
}

/// Wakes the discoverer up between scans. Local only.
pub struct DiscoveryTimer {
    base: KernelBase,
}

impl DiscoveryTimer {
    fn new() -> DiscoveryTimer {
        DiscoveryTimer {
            base: KernelBase::new(),
        }
    }
}

impl Kernel for DiscoveryTimer {
    fn base(&self) -> &KernelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut KernelBase {
        &mut self.base
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum DiscovererState {
    Initial,
    Waiting,
    Probing,
}

/// Resident kernel that discovers and maintains this node's place in the
/// tree overlay of one interface: scans candidate superiors, answers
/// probes, propagates weights and persists the hierarchy cache.
pub struct Discoverer {
    base: KernelBase,
    hierarchy: Arc<Mutex<Hierarchy>>,
    remote: Arc<RemoteSocketPipeline>,
    interface_address: InterfaceAddress,
    port: u16,
    fanout: u32,
    interval: Duration,
    cache_directory: PathBuf,
    candidates: VecDeque<SocketAddress>,
    state: DiscovererState,
    timer_pending: bool,
}

impl Discoverer {
    pub fn new(
        interface_address: InterfaceAddress,
        port: u16,
        fanout: u32,
        interval: Duration,
        cache_directory: PathBuf,
        remote: Arc<RemoteSocketPipeline>,
    ) -> Discoverer {
        Discoverer {
            base: KernelBase::new(),
            hierarchy: Arc::new(Mutex::new(Hierarchy::new(interface_address, port))),
            remote,
            interface_address,
            port,
            fanout,
            interval,
            cache_directory,
            candidates: VecDeque::new(),
            state: DiscovererState::Initial,
            timer_pending: false,
        }
    }

    /// Shared with the network master for status reporting.
    pub fn hierarchy(&self) -> Arc<Mutex<Hierarchy>> {
        self.hierarchy.clone()
    }

    fn own_address(&self) -> SocketAddress {
        SocketAddress::new_ipv4(self.interface_address.address(), self.port)
    }

    fn log_prefix(&self) -> InterfaceAddress {
        self.interface_address
    }

    fn write_cache(&self) {
        if let Err(e) = self.hierarchy.lock().unwrap().write_cache(&self.cache_directory) {
            warn!("discoverer {}: cache: {}", self.log_prefix(), e);
        }
    }

    fn reset_candidates(&mut self) {
        let principal = self
            .hierarchy
            .lock()
            .unwrap()
            .principal()
            .map(|p| p.socket_address().clone());
        self.candidates.clear();
        for addr in TreeHierarchyIterator::new(self.interface_address, self.fanout) {
            let candidate = SocketAddress::new_ipv4(addr, self.port);
            // Stop before the current superior: everything after it in the
            // scan order is no improvement.
            if Some(&candidate) == principal.as_ref() {
                break;
            }
            self.candidates.push_back(candidate);
        }
    }

    fn schedule_timer(&mut self, ctx: &mut Context) {
        if self.timer_pending {
            return;
        }
        self.timer_pending = true;
        let id = self.base.ensure_id();
        let mut timer = Box::new(DiscoveryTimer::new());
        timer.base_mut().set_parent_id(id);
        timer.base_mut().set_principal_id(id);
        timer.base_mut().set_after(self.interval);
        ctx.send(timer);
    }

    fn discover(&mut self, ctx: &mut Context) {
        if self.state == DiscovererState::Probing {
            return;
        }
        if self.candidates.is_empty() {
            self.reset_candidates();
        }
        match self.candidates.pop_front() {
            Some(addr) => {
                self.state = DiscovererState::Probing;
                self.send_probe(ctx, addr);
            }
            None => {
                self.state = DiscovererState::Waiting;
            }
        }
        self.schedule_timer(ctx);
    }

    fn send_probe(&mut self, ctx: &mut Context, addr: SocketAddress) {
        let weight = self.hierarchy.lock().unwrap().total_weight();
        let old_principal = self
            .hierarchy
            .lock()
            .unwrap()
            .principal()
            .map(|p| p.socket_address().clone())
            .unwrap_or(SocketAddress::Unspecified);
        debug!("discoverer {}: probe {}", self.log_prefix(), addr);
        let mut probe = Box::new(Probe::new(
            self.interface_address,
            old_principal,
            addr.clone(),
            weight,
        ));
        probe.base_mut().set_parent_id(self.base.ensure_id());
        probe.base_mut().set_principal_id(NETWORK_MASTER_ID);
        probe.base_mut().set_destination(addr);
        ctx.send_remote(probe);
    }

    /// A probe from another node: decide its fate and answer.
    fn update_subordinates(&mut self, ctx: &mut Context, mut probe: Box<Probe>) {
        let src = probe.base().source().clone();
        let result = self.process_probe(&probe, &src);
        debug!(
            "discoverer {}: probe from {} -> {}",
            self.log_prefix(),
            src,
            result
        );
        let mut weights_changed = false;
        match result {
            ProbeResponse::AddSubordinate => {
                {
                    let mut h = self.hierarchy.lock().unwrap();
                    h.add_subordinate(src.clone());
                    h.set_subordinate_weight(&src, probe.weight);
                }
                weights_changed = true;
                if let Err(e) = self.remote.add_client(&src) {
                    warn!("discoverer {}: {}", self.log_prefix(), e);
                }
                self.remote.set_client_weight(&src, probe.weight);
                self.write_cache();
            }
            ProbeResponse::RemoveSubordinate => {
                if self.hierarchy.lock().unwrap().remove_subordinate(&src) {
                    weights_changed = true;
                    self.remote.stop_client(&src);
                    self.write_cache();
                }
            }
            ProbeResponse::Retain => {
                weights_changed = self
                    .hierarchy
                    .lock()
                    .unwrap()
                    .set_subordinate_weight(&src, probe.weight);
                if weights_changed {
                    self.remote.set_client_weight(&src, probe.weight);
                }
            }
            ProbeResponse::RejectSubordinate | ProbeResponse::None => {}
        }
        if weights_changed {
            self.broadcast_hierarchy(ctx);
        }
        probe.response = result as u8;
        probe.base_mut().return_to_parent(ExitCode::Success);
        ctx.send(probe);
    }

    fn process_probe(&self, probe: &Probe, src: &SocketAddress) -> ProbeResponse {
        let hierarchy = self.hierarchy.lock().unwrap();
        if probe.new_principal != *hierarchy.socket_address() {
            // The sender is telling us it now answers to someone else.
            ProbeResponse::RemoveSubordinate
        } else if hierarchy.has_subordinate(src) {
            ProbeResponse::Retain
        } else if hierarchy.is_principal(src) {
            // Adopting our own superior would close a cycle.
            ProbeResponse::RejectSubordinate
        } else if hierarchy.num_subordinates() as u32 >= self.fanout {
            ProbeResponse::RejectSubordinate
        } else {
            ProbeResponse::AddSubordinate
        }
    }

    /// Our own probe came back.
    fn update_superior(&mut self, ctx: &mut Context, probe: Box<Probe>) {
        self.state = DiscovererState::Waiting;
        if probe.base().result() != ExitCode::Success {
            debug!(
                "discoverer {}: probe to {} failed: {}",
                self.log_prefix(),
                probe.new_principal,
                probe.base().result()
            );
            self.discover_next(ctx);
            return;
        }
        match probe.response() {
            ProbeResponse::AddSubordinate | ProbeResponse::Retain => {
                let addr = probe.new_principal.clone();
                let old = self
                    .hierarchy
                    .lock()
                    .unwrap()
                    .principal()
                    .map(|p| p.socket_address().clone());
                if old.as_ref() != Some(&addr) {
                    debug!("discoverer {}: superior is {}", self.log_prefix(), addr);
                    if let Some(old) = old {
                        self.send_leave_probe(ctx, old);
                    }
                    self.hierarchy.lock().unwrap().set_principal(addr.clone());
                    if let Err(e) = self.remote.add_client(&addr) {
                        warn!("discoverer {}: {}", self.log_prefix(), e);
                    }
                    self.write_cache();
                    self.broadcast_hierarchy(ctx);
                }
                self.candidates.clear();
            }
            _ => self.discover_next(ctx),
        }
    }

    /// Tell a former superior that we left; it answers `remove-subordinate`
    /// to itself and forgets us.
    fn send_leave_probe(&mut self, ctx: &mut Context, old: SocketAddress) {
        let weight = self.hierarchy.lock().unwrap().total_weight();
        let mut probe = Box::new(Probe::new(
            self.interface_address,
            old.clone(),
            // new_principal deliberately not the recipient: that is the
            // removal signal.
            self.own_address(),
            weight,
        ));
        probe.base_mut().set_parent_id(self.base.ensure_id());
        probe.base_mut().set_principal_id(NETWORK_MASTER_ID);
        probe.base_mut().set_destination(old);
        ctx.send_remote(probe);
    }

    fn discover_next(&mut self, ctx: &mut Context) {
        // Between scans the timer drives us; within one scan advance
        // immediately.
        if self.candidates.is_empty() {
            self.state = DiscovererState::Waiting;
            self.schedule_timer(ctx);
        } else {
            self.state = DiscovererState::Waiting;
            self.discover(ctx);
        }
    }

    /// Push our weight to the superior so routing sees the new subtree
    /// size.
    fn broadcast_hierarchy(&mut self, ctx: &mut Context) {
        let (principal, weight) = {
            let h = self.hierarchy.lock().unwrap();
            (
                h.principal().map(|p| p.socket_address().clone()),
                h.total_weight(),
            )
        };
        if let Some(principal) = principal {
            let mut k = Box::new(HierarchyKernel::new(self.interface_address, weight));
            k.base_mut().set_parent_id(self.base.ensure_id());
            k.base_mut().set_principal_id(NETWORK_MASTER_ID);
            k.base_mut().set_destination(principal);
            ctx.send_remote(k);
        }
    }

    /// A subordinate announced a new weight.
    fn update_weights(&mut self, ctx: &mut Context, k: &HierarchyKernel) {
        let src = k.base().source().clone();
        let changed = self
            .hierarchy
            .lock()
            .unwrap()
            .set_subordinate_weight(&src, k.weight());
        if changed {
            debug!(
                "discoverer {}: weight of {} is now {}",
                self.log_prefix(),
                src,
                k.weight()
            );
            self.remote.set_client_weight(&src, k.weight());
            self.broadcast_hierarchy(ctx);
        }
    }

    fn on_event(&mut self, ctx: &mut Context, event: &PipelineEventKernel) {
        if event.event() != PipelineEvent::RemoveClient {
            return;
        }
        let addr = event.socket_address().clone();
        let (was_principal, was_subordinate) = {
            let mut h = self.hierarchy.lock().unwrap();
            let p = h.is_principal(&addr);
            if p {
                h.unset_principal();
            }
            let s = h.remove_subordinate(&addr);
            (p, s)
        };
        if was_principal {
            debug!("discoverer {}: lost superior {}", self.log_prefix(), addr);
            self.write_cache();
            self.candidates.clear();
            self.state = DiscovererState::Waiting;
            self.discover(ctx);
        } else if was_subordinate {
            debug!("discoverer {}: lost subordinate {}", self.log_prefix(), addr);
            self.write_cache();
            self.broadcast_hierarchy(ctx);
        }
    }
}

impl Kernel for Discoverer {
    fn base(&self) -> &KernelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut KernelBase {
        &mut self.base
    }

    fn act(&mut self, ctx: &mut Context) {
        self.base.ensure_id();
        self.base.setf(crate::kernel::KernelFlags::PARKED);
        // Try the cached superior before scanning the subnet.
        let cached = self
            .hierarchy
            .lock()
            .unwrap()
            .read_cache(&self.cache_directory);
        match cached {
            Ok(Some(principal)) => self.candidates.push_back(principal),
            Ok(None) => {}
            Err(e) => warn!("discoverer {}: cache: {}", self.log_prefix(), e),
        }
        self.state = DiscovererState::Initial;
        self.discover(ctx);
    }

    fn react(&mut self, ctx: &mut Context, child: KernelPtr) {
        if (*child).is::<DiscoveryTimer>() {
            self.timer_pending = false;
            self.discover(ctx);
        } else if (*child).is::<Probe>() {
            let probe = child.downcast::<Probe>().ok().unwrap();
            if probe.base().result().is_undefined() {
                self.update_subordinates(ctx, probe);
            } else {
                self.update_superior(ctx, probe);
            }
        } else if (*child).is::<HierarchyKernel>() {
            let hk = child.downcast::<HierarchyKernel>().ok().unwrap();
            if hk.base().result().is_undefined() {
                self.update_weights(ctx, &hk);
            }
        } else if (*child).is::<PipelineEventKernel>() {
            let event = child.downcast::<PipelineEventKernel>().ok().unwrap();
            self.on_event(ctx, &event);
        } else {
            debug!(
                "discoverer {}: unexpected kernel {:?}",
                self.log_prefix(),
                child.base()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance_registry::InstanceRegistry;
    use crate::remote_pipeline::RemoteProtocol;
    use crate::socket_pipeline::SocketPipeline;
    use crate::type_registry::TypeRegistry;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn discoverer(fanout: u32) -> Discoverer {
        let types = Arc::new(TypeRegistry::new());
        let instances = Arc::new(InstanceRegistry::new());
        let remote = Arc::new(
            SocketPipeline::new(
                RemoteProtocol::new(types, instances, 0, 33333),
                Duration::from_secs(7),
            )
            .unwrap(),
        );
        Discoverer::new(
            "10.0.0.1/24".parse().unwrap(),
            33333,
            fanout,
            Duration::from_secs(10),
            std::env::temp_dir(),
            remote,
        )
    }

    fn peer(n: u8) -> SocketAddress {
        SocketAddress::new_ipv4(Ipv4Addr::new(10, 0, 0, n), 33333)
    }

    fn probe_from(n: u8, target: SocketAddress) -> Probe {
        Probe::new(
            format!("10.0.0.{}/24", n).parse().unwrap(),
            SocketAddress::Unspecified,
            target,
            1,
        )
    }

    #[test]
    fn probes_are_accepted_up_to_the_fanout() {
        let d = discoverer(2);
        let own = d.hierarchy.lock().unwrap().socket_address().clone();
        let p = probe_from(2, own.clone());
        assert_eq!(d.process_probe(&p, &peer(2)), ProbeResponse::AddSubordinate);
        d.hierarchy.lock().unwrap().add_subordinate(peer(2));
        let p = probe_from(3, own.clone());
        assert_eq!(d.process_probe(&p, &peer(3)), ProbeResponse::AddSubordinate);
        d.hierarchy.lock().unwrap().add_subordinate(peer(3));
        // The tree is binary: a third child is refused.
        let p = probe_from(4, own);
        assert_eq!(
            d.process_probe(&p, &peer(4)),
            ProbeResponse::RejectSubordinate
        );
    }

    #[test]
    fn known_subordinates_are_retained() {
        let d = discoverer(2);
        let own = d.hierarchy.lock().unwrap().socket_address().clone();
        d.hierarchy.lock().unwrap().add_subordinate(peer(2));
        let p = probe_from(2, own);
        assert_eq!(d.process_probe(&p, &peer(2)), ProbeResponse::Retain);
    }

    #[test]
    fn adopting_the_superior_is_a_cycle() {
        let d = discoverer(8);
        let own = d.hierarchy.lock().unwrap().socket_address().clone();
        d.hierarchy.lock().unwrap().set_principal(peer(9));
        let p = probe_from(9, own);
        assert_eq!(
            d.process_probe(&p, &peer(9)),
            ProbeResponse::RejectSubordinate
        );
    }

    #[test]
    fn a_probe_for_someone_else_means_the_sender_left() {
        let d = discoverer(8);
        d.hierarchy.lock().unwrap().add_subordinate(peer(2));
        // The subordinate now answers to 10.0.0.9, not to us.
        let p = probe_from(2, peer(9));
        assert_eq!(
            d.process_probe(&p, &peer(2)),
            ProbeResponse::RemoveSubordinate
        );
    }

    #[test]
    fn probe_round_trip() {
        let mut a = Probe::new(
            "10.0.0.4/24".parse().unwrap(),
            SocketAddress::Unspecified,
            SocketAddress::new_ipv4(std::net::Ipv4Addr::new(10, 0, 0, 2), 33333),
            3,
        );
        a.response = ProbeResponse::AddSubordinate as u8;
        a.base_mut().set_parent_id(11);
        let mut buf = KernelBuffer::new();
        a.write(&mut buf).unwrap();
        buf.flip();
        let mut b = Probe::default();
        b.read(&mut buf).unwrap();
        assert_eq!(b.interface_address, a.interface_address);
        assert_eq!(b.old_principal, a.old_principal);
        assert_eq!(b.new_principal, a.new_principal);
        assert_eq!(b.weight, 3);
        assert_eq!(b.response(), ProbeResponse::AddSubordinate);
        assert_eq!(buf.position(), buf.limit());
    }

    #[test]
    fn hierarchy_kernel_round_trip() {
        let a = HierarchyKernel::new("10.0.0.2/24".parse().unwrap(), 4);
        let mut buf = KernelBuffer::new();
        a.write(&mut buf).unwrap();
        buf.flip();
        let mut b = HierarchyKernel::default();
        b.read(&mut buf).unwrap();
        assert_eq!(b.interface_address(), a.interface_address());
        assert_eq!(b.weight(), 4);
    }
}
