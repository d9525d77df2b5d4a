pub mod commands;
pub mod device;
pub mod serial;

use std::time::Duration;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "serial-term", version, about = "Minimal serial port terminal")]
pub struct Cli {
    /// Debug-level logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: commands::Command,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();
}

pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    log::debug!("serial-term {} started", env!("CARGO_PKG_VERSION"));
    let result = runtime.block_on(commands::dispatch(cli.command));
    // A pending stdin read sits on a blocking thread and would hold up a plain drop
    runtime.shutdown_timeout(Duration::from_millis(100));
    result
}
