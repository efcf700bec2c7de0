use crate::demo::{run_demo, run_roster_check, DemoArgs, RosterArgs};
use crate::server;
use clap::{Args, Parser, Subcommand};
use wil_engine::error::AppError;

#[derive(Parser, Debug)]
#[command(
    name = "WIL Placement Engine",
    about = "Run and demonstrate the placement capacity and attendance engine from the command line",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP service (default command)
    Serve(ServeArgs),
    /// Work with placement roster CSV exports
    Roster {
        #[command(subcommand)]
        command: RosterCommand,
    },
    /// Run an end-to-end CLI demo covering enrollment, attendance, and stipends
    Demo(DemoArgs),
}

#[derive(Subcommand, Debug)]
enum RosterCommand {
    /// Parse a roster export and report created and rejected rows
    Check(RosterArgs),
}

#[derive(Args, Debug, Default)]
pub(crate) struct ServeArgs {
    /// Override the configured host for the HTTP server
    #[arg(long)]
    pub(crate) host: Option<String>,
    /// Override the configured port for the HTTP server
    #[arg(long)]
    pub(crate) port: Option<u16>,
    /// Override the staleness sweep cadence in seconds
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub(crate) sweep_interval_secs: Option<u64>,
}

pub(crate) async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    match command {
        Command::Serve(args) => server::run(args).await,
        Command::Roster {
            command: RosterCommand::Check(args),
        } => run_roster_check(args).await,
        Command::Demo(args) => run_demo(args).await,
    }
}
