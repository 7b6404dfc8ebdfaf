//! meteord - live TCP control-plane daemon for the Meteor network
//! emulation engine.

use std::process::ExitCode;

use clap::Parser;
use meteor_core::control::ControlServer;
use meteor_core::controller::Controller;
use meteor_core::error::{MeteorError, Result};
use meteor_core::netlink::Connection;
use meteor_core::rules::RuleTable;
use meteor_core::tc::{self, Mode, TcProgrammer};
use serde::Deserialize;
use tracing::info;

#[derive(Parser)]
#[command(name = "meteord", version, about = "Live TC control-plane daemon for Meteor")]
struct Cli {
    /// JSON configuration file.
    #[arg(short = 'c', long = "config")]
    config: String,
}

/// Shape of the `-c` config file: listen port, physical interface, this
/// node's id, classifier mode, and log level.
#[derive(Debug, Deserialize)]
struct DaemonConfig {
    #[serde(default = "default_listen_port")]
    listen_port: u16,
    interface: String,
    id: i32,
    #[serde(default)]
    mac_mode: bool,
    #[serde(default = "default_log_level")]
    log_level: String,
}

fn default_listen_port() -> u16 {
    10000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn init_tracing(level: &str) {
    let directive = level.parse().unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive.into()))
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match std::fs::read_to_string(&cli.config)
        .map_err(|e| e.to_string())
        .and_then(|text| serde_json::from_str::<DaemonConfig>(&text).map_err(|e| e.to_string()))
    {
        Ok(config) => config,
        Err(err) => {
            eprintln!("meteord: failed to load config {}: {err}", cli.config);
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&config.log_level);

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("meteord: failed to start runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "meteord exited with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: DaemonConfig) -> Result<()> {
    let conn = Connection::new().map_err(tc::TcError::from)?;

    let phys_ifindex = tc::link::resolve_ifindex(&conn, &config.interface).await?;
    let ifb_name = format!("ifb{}", config.id);
    let ifb_ifindex = tc::link::create_ifb(&conn, &ifb_name).await?;

    let tc_programmer = TcProgrammer::new(conn);
    tc_programmer
        .setup_ifb_tree(ifb_ifindex, tc::units::DEFAULT_BANDWIDTH_BITS)
        .await?;
    tc_programmer
        .setup_physical_redirect(phys_ifindex, ifb_ifindex)
        .await?;

    let classify_mode = if config.mac_mode { Mode::Mac } else { Mode::Ip };
    let table = RuleTable::new(ifb_ifindex, classify_mode, tc::units::DEFAULT_BANDWIDTH_BITS);
    let mut controller = Controller::new(tc_programmer, table);

    let bind_addr = format!("0.0.0.0:{}", config.listen_port);
    let server = ControlServer::bind(&bind_addr)
        .await
        .map_err(|err| MeteorError::Kernel(tc::TcError::InterfaceNotFound(err.to_string())))?;
    info!(addr = %bind_addr, "meteord listening");

    let shutdown = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let _shutdown_watcher = meteor_core::signals::spawn_shutdown_watcher(shutdown.clone());

    server
        .serve(&mut controller, tc::units::DEFAULT_BANDWIDTH_BITS, shutdown)
        .await
}
