use std::process::ExitCode;

use clap::Parser;

use tree_service::{cli::ClientArgs, client};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    // stdout carries only the rendered reply.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let args = ClientArgs::parse();
    let response = match client::run(&args).await {
        Ok(response) => response,
        Err(err) => {
            eprintln!("error: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    match client::render(&response) {
        Ok(text) => {
            println!("{text}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
