//! meteor - offline scenario-replay CLI for the Meteor network emulation
//! engine.

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use clap::Parser;
use meteor_core::controller::Controller;
use meteor_core::error::{MeteorError, Result};
use meteor_core::netlink::Connection;
use meteor_core::player::{self, BridgeSelector, IngressSelector, Player};
use meteor_core::rules::RuleTable;
use meteor_core::scenario::ScenarioReader;
use meteor_core::scheduler::Scheduler;
use meteor_core::tc::{self, Mode, TcProgrammer};
use meteor_core::topology::Topology;
use tracing::info;

#[derive(Clone, Copy, clap::ValueEnum)]
enum PlayMode {
    Ingress,
    Bridge,
}

#[derive(Parser)]
#[command(name = "meteor", version, about = "Replay a Meteor scenario file against live TC state")]
struct Cli {
    /// Binary scenario file.
    #[arg(short = 'q', long = "scenario")]
    scenario: String,

    /// Settings JSON file describing the node topology.
    #[arg(short = 's', long = "settings")]
    settings: String,

    /// This node's id (required in ingress mode).
    #[arg(short = 'i', long = "id")]
    id: Option<i32>,

    /// Replay mode.
    #[arg(short = 'm', long = "mode", value_enum, default_value_t = PlayMode::Ingress)]
    mode: PlayMode,

    /// Physical interface to shape.
    #[arg(short = 'I', long = "interface")]
    interface: String,

    /// Bridge-mode connection list (two ids per line).
    #[arg(short = 'c', long = "connections")]
    connections: Option<String>,

    /// Classify peers by MAC address instead of IPv4.
    #[arg(short = 'M', long = "mac")]
    mac: bool,

    /// Loop the scenario forever.
    #[arg(short = 'l', long = "loop")]
    loop_mode: bool,

    /// Daemonize after startup.
    #[arg(short = 'd', long = "daemonize")]
    daemonize: bool,

    /// Increase log verbosity (repeatable).
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if cli.daemonize {
        #[cfg(unix)]
        {
            // SAFETY: `daemon(3)` with nochdir=0, noclose=0; no other threads
            // or open resources exist yet at this point in `main`.
            let rc = unsafe { libc::daemon(0, 0) };
            if rc != 0 {
                eprintln!("meteor: failed to daemonize");
                return ExitCode::FAILURE;
            }
        }
    }

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("meteor: failed to start runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "meteor exited with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let topology = Topology::load(&cli.settings)?;

    let reader = ScenarioReader::open(&cli.scenario)?;
    topology.validate_count(reader.header().interface_count)?;

    let self_id = cli.id.unwrap_or(0);
    let conn = Connection::new().map_err(tc::TcError::from)?;

    let phys_ifindex = tc::link::resolve_ifindex(&conn, &cli.interface).await?;
    let ifb_name = format!("ifb{self_id}");
    let ifb_ifindex = tc::link::create_ifb(&conn, &ifb_name).await?;

    let tc_programmer = TcProgrammer::new(conn);
    tc_programmer
        .setup_ifb_tree(ifb_ifindex, tc::units::DEFAULT_BANDWIDTH_BITS)
        .await?;
    tc_programmer
        .setup_physical_redirect(phys_ifindex, ifb_ifindex)
        .await?;

    let classify_mode = if cli.mac { Mode::Mac } else { Mode::Ip };
    let table = RuleTable::new(ifb_ifindex, classify_mode, tc::units::DEFAULT_BANDWIDTH_BITS);
    let mut controller = Controller::new(tc_programmer, table);

    let restart = Arc::new(AtomicBool::new(false));
    let shutdown = Arc::new(AtomicBool::new(false));
    #[cfg(unix)]
    let _restart_watcher = meteor_core::signals::spawn_restart_watcher(restart.clone());
    let _shutdown_watcher = meteor_core::signals::spawn_shutdown_watcher(shutdown.clone());

    // scale=1.0: real time. Scale is a replay-speed multiplier (wall wait =
    // scenario_seconds / scale), not the `now - origin >= scenario_seconds *
    // scale` direction written in some descriptions of this wait; at 1.0
    // both directions coincide, so this call site is unaffected either way.
    let scheduler = Scheduler::new(1.0, restart.clone());

    match cli.mode {
        PlayMode::Ingress => {
            let selector = IngressSelector::new(self_id);
            let mut player = Player::new(
                reader,
                scheduler,
                controller,
                selector,
                tc::units::DEFAULT_BANDWIDTH_BITS,
                cli.loop_mode,
                restart,
                shutdown,
            );
            player.prime_defaults(&topology, self_id).await?;
            player.run().await
        }
        PlayMode::Bridge => {
            let connections_path = cli.connections.ok_or_else(|| {
                MeteorError::ConfigInvalid(meteor_core::topology::ConfigError::MissingConnections)
            })?;
            let selector = BridgeSelector::from_connections_file(&connections_path)?;
            player::prime_defaults_bridge(&mut controller, &topology, &selector).await?;
            let player = Player::new(
                reader,
                scheduler,
                controller,
                selector,
                tc::units::DEFAULT_BANDWIDTH_BITS,
                cli.loop_mode,
                restart,
                shutdown,
            );
            player.run().await
        }
    }?;

    info!("meteor exiting");
    Ok(())
}
