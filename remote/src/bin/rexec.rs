use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rexec_castore::cas::ContentAddressedStorage;
use rexec_castore::Digest;
use rexec_remote::{
    ExecutionEvent, RemoteExecutionClients, RemoteExecutionConfig, StaticMetadataProvider,
};
use rexec_tracing::TracingHandle;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// A global log level to use when printing logs.
    /// It's also possible to set `RUST_LOG` according to
    /// `tracing_subscriber::filter::EnvFilter`, which will always have
    /// priority.
    #[arg(long, default_value_t=Level::INFO)]
    log_level: Level,

    #[command(flatten)]
    remote: RemoteExecutionConfig,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Uploads a file to the CAS, unless it's there already, and prints its
    /// digest.
    PutBlob { path: PathBuf },

    /// Writes the blob with the given digest (`hash/size`) to stdout, once
    /// it's been fully received and verified.
    CatBlob { digest: Digest },

    /// Executes the action with the given digest (`hash/size`), printing its
    /// progress. Exits with the exit code of the action.
    Execute {
        action_digest: Digest,

        #[arg(long)]
        skip_cache_lookup: bool,

        /// Downloads the output files of the action below this directory.
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
}

async fn run(
    command: Commands,
    clients: &RemoteExecutionClients,
    tracing_handle: &TracingHandle,
) -> anyhow::Result<ExitCode> {
    let storage = clients.storage();

    match command {
        Commands::PutBlob { path } => {
            let data = tokio::fs::read(&path)
                .await
                .with_context(|| format!("unable to read {}", path.display()))?;
            let digest = clients.protocol().compute_digest(&data);

            let uploaded = storage.add_missing(vec![(digest.clone(), data.into())]).await?;
            if uploaded.is_empty() {
                info!(blob.digest = %digest, "blob already present");
            }

            writeln!(tracing_handle.get_stdout_writer(), "{}", digest)?;
        }
        Commands::CatBlob { digest } => {
            cat_blob(&*storage, &digest, &mut tracing_handle.get_stdout_writer()).await?;
        }
        Commands::Execute {
            action_digest,
            skip_cache_lookup,
            output_dir,
        } => {
            let mut handle = clients
                .remote_execution_service()
                .execute(&action_digest, skip_cache_lookup)
                .await?;

            while let Some(event) = handle.next_event().await? {
                let result = match event {
                    ExecutionEvent::Stage(stage) => {
                        info!(action.digest = %action_digest, ?stage, "execution progress");
                        continue;
                    }
                    ExecutionEvent::Completed(result) => result,
                };

                let stdout = result.stdout.fetch(&*storage).await?;
                let stderr = result.stderr.fetch(&*storage).await?;
                tracing_handle.get_stdout_writer().write_all(&stdout)?;
                tracing_handle.get_stderr_writer().write_all(&stderr)?;

                if let Some(output_dir) = output_dir.as_deref() {
                    clients.materialize(&result.output_files, output_dir).await?;
                }

                info!(
                    exit_code = result.exit_code,
                    cached = result.cached,
                    outputs = result.output_files.len(),
                    "execution completed"
                );

                return Ok(ExitCode::from(result.exit_code.clamp(0, 255) as u8));
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Writes the blob to `out`, but only once all of it verified.
async fn cat_blob(
    storage: &dyn ContentAddressedStorage,
    digest: &Digest,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let data = storage.fetch(digest).await?;
    out.write_all(&data)?;
    out.flush()?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let tracing_handle = rexec_tracing::TracingBuilder::default()
        .level(cli.log_level)
        .enable_progressbar()
        .build()?;

    let clients = RemoteExecutionClients::from_config(
        &cli.remote,
        StaticMetadataProvider::for_session("rexec").into_arc(),
    )
    .await?;

    let result = run(cli.command, &clients, &tracing_handle).await;

    if let Err(e) = clients.close().await {
        warn!(err = %e, "failed to close connections");
    }

    result
}
