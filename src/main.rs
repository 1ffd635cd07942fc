//! Relaygate - CLI entry point

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use relaygate::{Config, ProxyServer, VERSION};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "relaygate")]
#[command(version = VERSION)]
#[command(about = "Intercepting HTTP/1.1 forward proxy")]
struct Args {
    /// Path to configuration file
    #[arg(short = 'c', long = "config", default_value = "config.yaml")]
    config: PathBuf,

    /// Listen address (overrides config)
    #[arg(short = 'l', long = "listen")]
    listen: Option<String>,

    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,
}

fn main() -> anyhow::Result<()> {
    // asm-optimized crypto primitives for the TLS legs
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .enable_all()
        .thread_name("relaygate-worker")
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("relaygate=info".parse()?),
        )
        .init();

    let args = Args::parse();
    info!("relaygate v{}", VERSION);

    let mut config = if args.config.exists() {
        info!("Loading configuration from: {}", args.config.display());
        match Config::load(args.config.to_str().unwrap_or("config.yaml")) {
            Ok(c) => c,
            Err(e) => {
                error!("Failed to load configuration: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        Config::default()
    };

    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    if args.test {
        config.validate().map_err(anyhow::Error::from)?;
        info!("Configuration test passed");
        return Ok(());
    }

    let mut server = match ProxyServer::new(config) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to initialize proxy: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        error!("Proxy error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
