//! A worker tool answering commands with what they contain.
//!
//! Payloads are read as text: `exit N` reports exit code N, `crash` makes
//! the process exit without answering, anything else is echoed back with
//! exit code 0.

use bytes::Bytes;
use clap::Parser;
use rexec_workertool::proto::LogLevel;
use rexec_workertool::{serve, WorkerResponse, ERROR_EXIT_CODE};
use tracing::Level;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Logs go to stderr, stdout carries the worker protocol.
    #[arg(long, default_value_t=Level::INFO)]
    log_level: Level,
}

async fn handle(action_id: String, payload: Bytes) -> WorkerResponse {
    let text = String::from_utf8_lossy(&payload);

    if text == "crash" {
        std::process::exit(ERROR_EXIT_CODE);
    }

    if let Some(code) = text.strip_prefix("exit ") {
        return match code.trim().parse() {
            Ok(code) => WorkerResponse::exit(code, format!("exiting with {}", code)),
            Err(_) => WorkerResponse::exit(ERROR_EXIT_CODE, format!("invalid exit code {}", code)),
        };
    }

    WorkerResponse::exit(0, text.to_string())
        .with_log(LogLevel::Info, format!("echoing {} bytes for {}", payload.len(), action_id))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let _tracing_handle = rexec_tracing::TracingBuilder::default()
        .level(cli.log_level)
        .build()?;

    serve(tokio::io::stdin(), tokio::io::stdout(), handle).await?;

    Ok(())
}
