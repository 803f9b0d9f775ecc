use std::process::ExitCode;

use clap::Parser;

mod api;
mod cli;
mod config;
mod docker;
mod error;
mod github;
mod keys;
mod models;
mod nginx;
mod orchestrator;
mod registry;
mod server;
mod storage;

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    env_logger::init();

    let args = cli::Cli::parse();
    match cli::execute(args.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}
