use std::io;
use std::time::Duration;

use log::{info, warn};

use crate::commands::hive_options::HiveSubCommand;
use crate::commands::HiveCommand;
use crate::factory::SubmitFactory;
use crate::kernel::{Context, ExitCode, Kernel, KernelBase, KernelPtr};
use crate::pipeline::Pipeline;
use crate::socket_address::SocketAddress;
use crate::unix_pipeline::SubmitKernel;

/// Root kernel of the submit process: packs argv, env and the working
/// directory into a [`SubmitKernel`], sends it to the daemon and turns the
/// reply into the process exit code.
struct Submit {
    base: KernelBase,
    socket: SocketAddress,
    arguments: Vec<String>,
}

impl Kernel for Submit {
    fn base(&self) -> &KernelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut KernelBase {
        &mut self.base
    }

    fn act(&mut self, ctx: &mut Context) {
        let environment: Vec<String> = std::env::vars()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();
        let workdir = std::env::current_dir()
            .map(|d| d.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut k = Box::new(SubmitKernel::new(
            self.arguments.clone(),
            environment,
            workdir,
        ));
        k.base_mut().set_destination(self.socket.clone());
        ctx.upstream_remote(&mut self.base, k);
    }

    fn react(&mut self, _ctx: &mut Context, child: KernelPtr) {
        let code = child.base().result();
        match (*child).downcast_ref::<SubmitKernel>() {
            Some(reply) if code == ExitCode::Success => {
                info!("submitted {}", reply.application_id());
            }
            Some(reply) => {
                warn!("failed to submit: {}", reply.error());
            }
            None => warn!("unexpected reply {:?}", child.base()),
        }
        self.base.return_to_parent(code);
    }
}

pub struct SubmitCommand {
    socket: SocketAddress,
    arguments: Vec<String>,
}

impl SubmitCommand {
    pub fn new(options: &HiveSubCommand) -> SubmitCommand {
        match options.clone() {
            HiveSubCommand::Submit { socket, arguments } => SubmitCommand { socket, arguments },
            _ => panic!("Unexpected HiveSubCommand variant. Not a `Submit` variant!"),
        }
    }
}

impl HiveCommand for SubmitCommand {
    fn run(&mut self) -> io::Result<i32> {
        let factory = SubmitFactory::new(self.socket.clone())
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        factory.start().map_err(|e| {
            io::Error::new(
                io::ErrorKind::Other,
                format!("failed to connect to daemon process: {}", e),
            )
        })?;
        factory.local().send(Box::new(Submit {
            base: KernelBase::new(),
            socket: self.socket.clone(),
            arguments: self.arguments.clone(),
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
