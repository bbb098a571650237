use std::io;

pub mod daemon_command;
pub mod hive_options;
pub mod status_command;
pub mod submit_command;

pub trait HiveCommand {
    /// Run the subcommand; the returned value becomes the process exit
    /// code.
    fn run(&mut self) -> io::Result<i32>;
}
