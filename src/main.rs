use clap::Parser;
use spiced::cli::{commands, Cli, Commands};

mod main_runtime;

use main_runtime::{init_logging, init_logging_simple};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    match cli.command {
        Commands::Serve { bind, train } => {
            init_logging(&config.logging);
            commands::serve(config, bind, train).await
        }
        Commands::Train { pod, resume_paused } => {
            init_logging(&config.logging);
            commands::train(config, &pod, resume_paused).await
        }
        Commands::Validate { pod } => {
            init_logging_simple();
            commands::validate(config, &pod)
        }
        Commands::Runs { json } => {
            init_logging_simple();
            commands::runs(config, json).await
        }
        Commands::Status { run_id, json } => {
            init_logging_simple();
            commands::status(config, &run_id, json).await
        }
        Commands::Export { pod, dest } => {
            init_logging_simple();
            commands::export(config, &pod, &dest).await
        }
        Commands::Import { pod, source } => {
            init_logging_simple();
            commands::import(config, &pod, &source).await
        }
        Commands::Infer { pod, json } => {
            init_logging_simple();
            commands::infer(config, &pod, json).await
        }
        Commands::AddData { pod, file } => {
            init_logging_simple();
            commands::add_data(config, &pod, &file).await
        }
    }
}
