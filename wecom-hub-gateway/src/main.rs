use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use wecom_hub::wecom::MemorySender;
use wecom_hub::{HubApp, HubConfig};

#[derive(Parser)]
#[command(name = "wecom-hub-gateway")]
#[command(version)]
#[command(about = "Webhook gateway for WeCom applications")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Serve(ServeArgs),
    /// Parse and validate a configuration file, then build every handler
    CheckConfig(CheckArgs),
}

#[derive(Parser)]
struct ServeArgs {
    #[arg(long, env = "WECOM_HUB_CONFIG")]
    config: PathBuf,

    /// Overrides `server.bind_addr` from the configuration file
    #[arg(long, env = "WECOM_HUB_BIND_ADDR")]
    bind_addr: Option<String>,

    #[arg(long)]
    log_json: bool,

    /// Log outbound messages instead of calling the provider API
    #[arg(long)]
    dry_run: bool,
}

#[derive(Parser)]
struct CheckArgs {
    #[arg(long, env = "WECOM_HUB_CONFIG")]
    config: PathBuf,
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    tracing_log::LogTracer::init().context("installing log bridge")?;
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wecom_hub=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if json {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
    installed.context("installing tracing subscriber")?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::CheckConfig(args) => {
            init_tracing(false)?;
            check_config(args).await
        }
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    init_tracing(args.log_json)?;

    let mut config = HubConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(bind_addr) = args.bind_addr {
        config.server.bind_addr = bind_addr;
    }

    let app = if args.dry_run {
        warn!("[Gateway] Dry run: outbound messages are only logged");
        HubApp::build_with_sender(config, Arc::new(MemorySender::new()))?
    } else {
        HubApp::build(config)?
    };

    app.run(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("[Gateway] Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
        info!("[Gateway] Shutdown requested");
    })
    .await?;
    Ok(())
}

async fn check_config(args: CheckArgs) -> anyhow::Result<()> {
    let config = HubConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let apps = config.wecom.apps.len();
    let app = HubApp::build_with_sender(config, Arc::new(MemorySender::new()))?;
    app.check()?;
    app.shutdown().await;
    println!("Configuration OK: {} applications", apps);
    Ok(())
}
