//! A hierarchical compute-task orchestrator.
//!
//! Applications express computation as *kernels*: serializable units of
//! work that may spawn subordinate kernels and receive their results. A
//! cluster of daemons discovers peers, elects a tree-shaped hierarchy, and
//! dispatches kernels locally across worker threads or remotely across
//! machines, preserving parent/principal lineage and recovering in-flight
//! kernels when a link or node fails.
//!
//! The building blocks, bottom up:
//!
//! * [`kernel_buffer`] — length-prefixed framing and typed serialization;
//! * [`kernel`] — the kernel object model and execution semantics;
//! * [`parallel_pipeline`] — the multi-queue local scheduler;
//! * [`connection`] — the kernel protocol over one link, with recovery;
//! * [`socket_pipeline`] — the event-loop base shared by every transport;
//! * [`remote_pipeline`], [`process_pipeline`], [`unix_pipeline`] — peers,
//!   child applications, and the submit CLI's front door;
//! * [`discoverer`] / [`network_master`] — tree discovery and weights;
//! * [`transaction_log`] — crash recovery of in-flight kernels;
//! * [`factory`] — the wiring of it all.

pub mod application;
pub mod commands;
pub mod connection;
pub mod discoverer;
pub mod error;
pub mod factory;
pub mod hierarchy;
pub mod instance_registry;
pub mod interface_address;
pub mod kernel;
pub mod kernel_buffer;
pub mod network_master;
pub mod parallel_pipeline;
pub mod pipeline;
pub mod poller;
pub mod process_pipeline;
pub mod remote_pipeline;
pub mod resources;
pub mod scoped_fd;
pub mod socket;
pub mod socket_address;
pub mod socket_pipeline;
pub mod transaction_log;
pub mod tree_hierarchy;
pub mod two_way_pipe;
pub mod type_registry;
pub mod unix_pipeline;

pub use error::{Error, Result};
pub use kernel::{Context, ExitCode, Kernel, KernelBase, KernelPtr};
pub use pipeline::Pipeline;
