mod blend;
mod config;
mod server;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use paralon_contracts::constraints::ConstraintResolver;
use paralon_engine::remote::RemoteImages;
use paralon_engine::{DryrunRemote, ImageStore, Orchestrator, RemoteClient};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::blend::{run_blend, BlendArgs};
use crate::config::load_settings;
use crate::server::{build_router, AppState};

#[derive(Debug, Parser)]
#[command(name = "paralon-rs", version, about = "Paralon image generation proxy")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Serve(ServeArgs),
    Blend(BlendArgs),
}

#[derive(Debug, Parser)]
struct ServeArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    bind: Option<String>,
    /// Answer remote operations with local placeholder images.
    #[arg(long)]
    dryrun: bool,
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("paralon-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

async fn run() -> Result<i32> {
    dotenv::dotenv().ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            run_serve(args).await?;
            Ok(0)
        }
        Command::Blend(args) => {
            let path = run_blend(args).await?;
            println!("{}", path.display());
            Ok(0)
        }
    }
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let mut settings = load_settings(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        settings.bind_addr = bind;
    }
    settings.validate(args.dryrun)?;

    let remote: Arc<dyn RemoteImages> = if args.dryrun {
        Arc::new(DryrunRemote::new())
    } else {
        Arc::new(RemoteClient::new(settings.remote_config()))
    };
    let store = ImageStore::new(&settings.upload_dir, &settings.generated_dir);
    let orchestrator = Orchestrator::new(ConstraintResolver::default(), remote, store);
    let state = AppState {
        orchestrator: Arc::new(orchestrator),
    };
    let app = build_router(state, settings.max_upload_bytes);

    let addr: SocketAddr = settings
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind address '{}'", settings.bind_addr))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        %addr,
        backend = if args.dryrun { "dryrun" } else { "remote" },
        api_base = %settings.api_base,
        upload_dir = %settings.upload_dir.display(),
        generated_dir = %settings.generated_dir.display(),
        "server listening"
    );
    axum::serve(listener, app).await?;
    Ok(())
}
