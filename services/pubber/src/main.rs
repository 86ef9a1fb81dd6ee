// pubber: UDMI reference device.
//
// Loads the device config, connects through the WebSocket bridge transport,
// and runs until the device requests a lifecycle transition or the process
// is interrupted. The exit code reflects the requested transition.

use std::path::PathBuf;

use clap::Parser;
use pubber::config::load_config_from_path;
use pubber::{Pubber, PubberConfig};
use tracing::{info, warn};
use udmi_schema::SystemMode;

#[derive(Parser, Debug)]
#[command(name = "pubber", about = "UDMI reference device", version)]
struct Cli {
    /// TOML device config. Replaces the positional arguments.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Cloud project id.
    #[arg(required_unless_present = "config")]
    project: Option<String>,

    /// Site model directory.
    #[arg(required_unless_present = "config")]
    site_path: Option<String>,

    #[arg(required_unless_present = "config")]
    device_id: Option<String>,

    #[arg(required_unless_present = "config")]
    serial_no: Option<String>,
}

fn device_config(cli: &Cli) -> Result<PubberConfig, String> {
    if let Some(path) = &cli.config {
        return load_config_from_path(path).map_err(|e| e.to_string());
    }
    match (&cli.project, &cli.site_path, &cli.device_id, &cli.serial_no) {
        (Some(project), Some(site), Some(device), Some(serial)) => {
            Ok(PubberConfig::from_args(project, site, device, serial))
        }
        _ => Err("expected --config or project site_path device_id serial_no".to_owned()),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "pubber starting");

    let cli = Cli::parse();
    let config = match device_config(&cli) {
        Ok(config) => {
            info!(
                device_id = %config.device_id,
                serial_no = %config.serial_no,
                "config loaded"
            );
            config
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let pubber = match Pubber::builder(config).build() {
        Ok(pubber) => pubber,
        Err(e) => {
            eprintln!("FATAL: failed to initialize device: {}", e);
            std::process::exit(1);
        }
    };
    let mut lifecycle = pubber.lifecycle();

    if let Err(e) = pubber.start().await {
        eprintln!("FATAL: connection failed: {}", e);
        let _ = pubber.stop().await;
        std::process::exit(1);
    }
    info!("device connected");

    let mode = tokio::select! {
        changed = lifecycle.wait_for(Option::is_some) => match changed {
            Ok(mode) => (*mode).unwrap_or(SystemMode::Terminate),
            Err(_) => SystemMode::Terminate,
        },
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received");
            if let Err(e) = pubber.terminate().await {
                warn!(error = %e, "shutdown incomplete");
            }
            SystemMode::Shutdown
        }
    };

    if mode != SystemMode::Shutdown {
        if let Err(e) = pubber.stop().await {
            warn!(error = %e, "stop incomplete");
        }
    }
    info!(mode = ?mode, exit_code = mode.exit_code(), "pubber exiting");
    std::process::exit(mode.exit_code());
}
