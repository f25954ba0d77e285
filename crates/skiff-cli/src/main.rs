mod jobs;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use skiff_common::config::AppConfig;
use skiff_driver::driver::run_driver;
use skiff_driver::engine::LocalEngineBuilder;

#[derive(Parser)]
#[command(
    name = "skiff",
    about = "Remote execution driver for a distributed compute engine"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs the driver against the in-process local engine.
    Driver,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Command::Driver => run_driver_command(),
    }
}

fn run_driver_command() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.driver.rpc_thread_count.max(1))
        .enable_all()
        .build()?;
    runtime.block_on(run_driver(
        &config,
        Arc::new(LocalEngineBuilder),
        Arc::new(jobs::DemoJobCodec),
    ))
}
