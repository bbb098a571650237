use structopt::StructOpt;

use hive::commands::daemon_command::DaemonCommand;
use hive::commands::hive_options::{HiveOptions, HiveSubCommand};
use hive::commands::status_command::StatusCommand;
use hive::commands::submit_command::SubmitCommand;
use hive::commands::HiveCommand;

fn main() {
    env_logger::init();
    let options = HiveOptions::from_args();
    let mut command: Box<dyn HiveCommand> = match &options.cmd {
        HiveSubCommand::Daemon { .. } => Box::new(DaemonCommand::new(&options.cmd)),
        HiveSubCommand::Submit { .. } => Box::new(SubmitCommand::new(&options.cmd)),
        HiveSubCommand::Status { .. } => Box::new(StatusCommand::new(&options.cmd)),
    };
    match command.run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("hive: {}", e);
            std::process::exit(1);
        }
    }
}
