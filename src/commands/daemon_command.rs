use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::info;

use crate::commands::hive_options::HiveSubCommand;
use crate::commands::HiveCommand;
use crate::factory::{Factory, Properties};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signo: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    // SAFETY: the handler only touches an atomic flag.
    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
    }
}

pub struct DaemonCommand {
    properties: Properties,
}

impl DaemonCommand {
    pub fn new(options: &HiveSubCommand) -> DaemonCommand {
        match options.clone() {
            HiveSubCommand::Daemon {
                port,
                fanout,
                interfaces,
                socket,
                cache_directory,
                transaction_log,
                upstream_threads,
                downstream_threads,
                discovery_interval,
                scan_interval,
                allow_root,
            } => DaemonCommand {
                properties: Properties {
                    port,
                    fanout,
                    scan_interval: Duration::from_secs(scan_interval),
                    discovery_interval: Duration::from_secs(discovery_interval),
                    cache_directory,
                    socket,
                    transaction_log,
                    upstream_threads,
                    downstream_threads,
                    allow_root,
                    interfaces,
                    ..Properties::default()
                },
            },
            _ => panic!("Unexpected HiveSubCommand variant. Not a `Daemon` variant!"),
        }
    }
}

impl HiveCommand for DaemonCommand {
    fn run(&mut self) -> io::Result<i32> {
        install_signal_handlers();
        let factory = Factory::new(self.properties.clone())
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        factory
            .start()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        info!(
            "daemon: listening on port {} and {}",
            self.properties.port, self.properties.socket
        );
        let code = loop {
            if let Some(code) = factory.latch().wait_timeout(Duration::from_millis(300)) {
                break code;
            }
            if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
                break 0;
            }
        };
        info!("daemon: shutting down with code {}", code);
        factory.stop();
        factory.wait();
        Ok(code)
    }
}
