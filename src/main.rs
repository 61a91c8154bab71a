use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rare_event_detection::server::{create_router, AppState};
use rare_event_detection::viewer::config::DemoConfig;
use rare_event_detection::viewer::{create_viewer_router, ViewerState};
use rare_event_detection::{Device, ModelPaths, ModelSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rare-event-detection")]
#[command(about = "Few-shot rare event detection: inference API and demo viewer")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the inference API (CLIP, BLIP, Stable Diffusion)
    Serve {
        #[arg(long, default_value = "0.0.0.0:8000")]
        bind: SocketAddr,

        /// Directory holding the exported CLIP image tower
        #[arg(long)]
        clip_dir: Option<PathBuf>,

        /// Directory holding the exported BLIP captioning model
        #[arg(long)]
        blip_dir: Option<PathBuf>,

        /// Directory holding the exported Stable Diffusion pipeline
        #[arg(long)]
        diffusion_dir: Option<PathBuf>,

        /// Prefer the CUDA execution provider, falling back to the CPU when it is unavailable
        #[arg(long)]
        cuda: bool,
    },
    /// Run the demo viewer
    Viewer {
        #[arg(long, default_value = "0.0.0.0:8501")]
        bind: SocketAddr,

        #[arg(long, default_value = "demo_config.json")]
        config: PathBuf,
    },
}

async fn serve_router(bind: SocketAddr, router: axum::Router) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!(addr = %bind, "Listening");
    axum::serve(listener, router).await.context("server error")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Command::Serve {
            bind,
            clip_dir,
            blip_dir,
            diffusion_dir,
            cuda,
        } => {
            let paths = ModelPaths {
                clip_dir,
                blip_dir,
                diffusion_dir,
                device: if cuda { Device::Cuda } else { Device::Cpu },
            };
            let models = tokio::task::spawn_blocking(move || ModelSet::load(&paths))
                .await
                .context("model loading task panicked")?
                .context("failed to load models")?;
            tracing::info!(?models, "Models ready");
            serve_router(bind, create_router(AppState::new(models))).await
        }
        Command::Viewer { bind, config } => {
            let demo = DemoConfig::load(&config)
                .with_context(|| format!("failed to read demo config {}", config.display()))?;
            tracing::info!(
                config = %config.display(),
                domains = demo.domains.len(),
                "Demo config loaded"
            );
            serve_router(bind, create_viewer_router(ViewerState::new(demo))).await
        }
    }
}
