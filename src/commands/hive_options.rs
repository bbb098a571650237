use std::path::PathBuf;

use structopt::StructOpt;

use crate::interface_address::InterfaceAddress;
use crate::socket_address::SocketAddress;

#[derive(Clone, Debug, StructOpt)]
#[structopt(
    name = "hive",
    about = "Hierarchical compute-task orchestrator: one binary for the daemon and the submit tools"
)]
pub struct HiveOptions {
    #[structopt(subcommand)]
    pub cmd: HiveSubCommand,
}

#[derive(Clone, Debug, StructOpt)]
pub enum HiveSubCommand {
    /// Run the cluster daemon.
    Daemon {
        /// TCP port the daemon listens on and dials peers at.
        #[structopt(long, default_value = "33333")]
        port: u16,

        /// Branching factor of the discovery tree.
        #[structopt(long, default_value = "10000")]
        fanout: u32,

        /// Interface addresses to serve (a.b.c.d/prefix). When omitted,
        /// every non-loopback IPv4 interface is used.
        #[structopt(long = "interface")]
        interfaces: Vec<InterfaceAddress>,

        /// Unix socket for submit clients.
        #[structopt(long, default_value = "/tmp/hive.sock")]
        socket: SocketAddress,

        /// Directory for hierarchy cache files.
        #[structopt(long, default_value = "/tmp/hive")]
        cache_directory: PathBuf,

        /// Append in-flight kernels to this file for crash recovery.
        #[structopt(long)]
        transaction_log: Option<PathBuf>,

        /// Upstream worker threads; 0 means one per hardware thread.
        #[structopt(long, default_value = "0")]
        upstream_threads: usize,

        /// Dedicated downstream worker threads.
        #[structopt(long, default_value = "0")]
        downstream_threads: usize,

        /// Seconds between discovery probes.
        #[structopt(long, default_value = "10")]
        discovery_interval: u64,

        /// Seconds between interface re-enumerations.
        #[structopt(long, default_value = "60")]
        scan_interval: u64,

        /// Allow spawning applications as root.
        #[structopt(long)]
        allow_root: bool,
    },

    /// Submit a command to a daemon and mirror its result.
    Submit {
        /// Daemon socket to talk to.
        #[structopt(long, default_value = "/tmp/hive.sock")]
        socket: SocketAddress,

        /// The command and its arguments.
        #[structopt(required = true)]
        arguments: Vec<String>,
    },

    /// Print the daemon's hierarchy as JSON.
    Status {
        /// Daemon socket to talk to.
        #[structopt(long, default_value = "/tmp/hive.sock")]
        socket: SocketAddress,
    },
}
