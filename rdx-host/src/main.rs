//! rdx-host: entry point.
//!
//! ```text
//! rdx-host                          Serve with rdx-host.toml (or defaults)
//! rdx-host --config <path>          Load a custom config TOML
//! rdx-host --gen-config             Write default config to stdout
//! rdx-host --write-config <path>    Write default config to a file
//! rdx-host --listen 127.0.0.1:7400  Override the TCP listen address
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rdx_host::config::HostConfig;
use rdx_host::service::HostService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "rdx-host", about = "Headless rdx remote-display host")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "rdx-host.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Write the default configuration to a file and exit.
    #[arg(long, value_name = "PATH")]
    write_config: Option<PathBuf>,

    /// TCP listen address, overriding the config file.
    #[arg(short, long)]
    listen: Option<String>,

    /// UDP listen address, overriding the config file.
    #[arg(long)]
    udp: Option<String>,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&HostConfig::default())?;
        println!("{text}");
        return Ok(());
    }
    if let Some(path) = cli.write_config {
        HostConfig::write_default(&path)?;
        println!("Wrote {}", path.display());
        return Ok(());
    }

    let mut config = HostConfig::load(&cli.config);
    if let Some(listen) = cli.listen {
        config.network.tcp_listen = listen;
    }
    if let Some(udp) = cli.udp {
        config.network.udp_listen = udp;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("rdx-host v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "display: {}x{} @ {} fps",
        config.display.width, config.display.height, config.display.fps
    );
    info!("encodings: {:?}", config.engine.encoding.encodings);

    let service = HostService::new(config);
    let stop = service.shutdown_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.cancel();
    });

    service.run().await?;
    Ok(())
}
