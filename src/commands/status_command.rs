use std::io;
use std::time::Duration;

use log::warn;
use serde::Serialize;

use crate::commands::hive_options::HiveSubCommand;
use crate::commands::HiveCommand;
use crate::factory::SubmitFactory;
use crate::kernel::{Context, Kernel, KernelBase, KernelPtr, NETWORK_MASTER_ID};
use crate::pipeline::Pipeline;
use crate::network_master::StatusKernel;
use crate::socket_address::SocketAddress;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PeerReport {
    address: String,
    weight: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HierarchyReport {
    interface_address: String,
    principal: Option<PeerReport>,
    subordinates: Vec<PeerReport>,
    total_weight: u32,
}

/// Root kernel of `hive status`: queries the daemon's network master and
/// prints every interface's hierarchy as JSON.
struct Status {
    base: KernelBase,
    socket: SocketAddress,
}

impl Kernel for Status {
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
        self.base.setf(crate::kernel::KernelFlags::PARKED);
        ctx.send_remote(k);
    }

    fn react(&mut self, _ctx: &mut Context, child: KernelPtr) {
        let code = child.base().result();
        match (*child).downcast_ref::<StatusKernel>() {
            Some(status) if code == crate::kernel::ExitCode::Success => {
                let reports: Vec<HierarchyReport> = status
                    .hierarchies()
                    .iter()
                    .map(|h| HierarchyReport {
                        interface_address: h.interface_address.to_string(),
                        principal: h.principal.as_ref().map(|p| PeerReport {
                            address: p.socket_address().to_string(),
                            weight: p.weight(),
                        }),
                        subordinates: h
                            .subordinates
                            .iter()
                            .map(|s| PeerReport {
                                address: s.socket_address().to_string(),
                                weight: s.weight(),
                            })
                            .collect(),
                        total_weight: h.total_weight,
                    })
                    .collect();
                match serde_json::to_string_pretty(&reports) {
                    Ok(json) => println!("{}", json),
                    Err(e) => warn!("cannot serialize status: {}", e),
                }
            }
            _ => warn!("status query failed: {}", code),
        }
        self.base.return_to_parent(code);
    }
}

pub struct StatusCommand {
    socket: SocketAddress,
}

impl StatusCommand {
    pub fn new(options: &HiveSubCommand) -> StatusCommand {
        match options.clone() {
            HiveSubCommand::Status { socket } => StatusCommand { socket },
            _ => panic!("Unexpected HiveSubCommand variant. Not a `Status` variant!"),
        }
    }
}

impl HiveCommand for StatusCommand {
    fn run(&mut self) -> io::Result<i32> {
        let factory = SubmitFactory::new(self.socket.clone())
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        factory.start().map_err(|e| {
            io::Error::new(
                io::ErrorKind::Other,
                format!("failed to connect to daemon process: {}", e),
            )
        })?;
        factory.local().send(Box::new(Status {
            base: KernelBase::new(),
            socket: self.socket.clone(),
        }) as KernelPtr);
        let code = factory
            .latch()
            .wait_timeout(Duration::from_secs(30))
            .unwrap_or_else(|| {
                warn!("no answer from the daemon");
                1
            });
        factory.stop();
        factory.wait();
        Ok(code)
    }
}
