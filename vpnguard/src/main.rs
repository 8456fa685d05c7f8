use clap::Parser;
use ctrlc::Error as CtrlcError;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use vpnguard_lib::config::Config;
use vpnguard_lib::controller::Controller;
use vpnguard_lib::selector::ServerSelector;
use vpnguard_lib::server::VPNServer;

/// A kill-switch-enforcing VPN supervisor daemon. There is no CLI command
/// surface or socket IPC here (out of scope, spec.md §1) — this process
/// reads its configuration and server list once at startup, connects, and
/// supervises the tunnel until it's told to stop.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Flat JSON configuration file (spec.md §6). Defaults to the
    /// platform config dir when omitted.
    #[arg(long, env = "VPNGUARD_CONFIG")]
    config: Option<PathBuf>,

    /// JSON array of candidate `VPNServer` records.
    #[arg(long, env = "VPNGUARD_SERVERS")]
    servers: PathBuf,

    /// Connect to this server id instead of the selector's best pick.
    #[arg(long)]
    server_id: Option<String>,
}

fn load_config(path: Option<&PathBuf>) -> Config {
    let resolved = path.cloned().or_else(vpnguard_lib::dirs::config_path);

    let Some(resolved) = resolved else {
        tracing::warn!("could not resolve a config path, using defaults");
        return Config::default();
    };

    match std::fs::read_to_string(&resolved) {
        Ok(text) => Config::from_json(&text).unwrap_or_else(|err| {
            tracing::warn!(error = %err, path = %resolved.display(), "invalid config file, using defaults");
            Config::default()
        }),
        Err(err) => {
            tracing::debug!(error = %err, path = %resolved.display(), "no config file found, using defaults");
            Config::default()
        }
    }
}

fn ctrlc_channel() -> Result<tokio::sync::mpsc::UnboundedReceiver<()>, exitcode::ExitCode> {
    let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
    match ctrlc::set_handler(move || {
        if sender.send(()).is_err() {
            tracing::error!("failed to deliver shutdown signal");
        }
    }) {
        Ok(()) => Ok(receiver),
        Err(CtrlcError::NoSuchSignal(signal_type)) => {
            tracing::error!(?signal_type, "no such signal");
            Err(exitcode::OSERR)
        }
        Err(CtrlcError::MultipleHandlers) => {
            tracing::error!("multiple handlers");
            Err(exitcode::UNAVAILABLE)
        }
        Err(CtrlcError::System(e)) => {
            tracing::error!(error = ?e, "system error");
            Err(exitcode::IOERR)
        }
    }
}

/// Blocks until the first interrupt, disconnects gracefully, and escalates
/// to `emergency_disconnect` if a second interrupt lands before the
/// graceful path finishes.
async fn supervise_until_shutdown(controller: Arc<Controller>) -> exitcode::ExitCode {
    let mut ctrlc_receiver = match ctrlc_channel() {
        Ok(receiver) => receiver,
        Err(exit) => return exit,
    };

    tracing::info!("entering supervision loop");
    ctrlc_receiver.recv().await;
    tracing::info!("shutdown requested, disconnecting");

    tokio::select! {
        _ = controller.disconnect(false) => {}
        _ = ctrlc_receiver.recv() => {
            tracing::warn!("second interrupt received, forcing emergency disconnect");
            controller.emergency_disconnect().await;
        }
    }

    exitcode::OK
}

async fn run(args: Args) -> exitcode::ExitCode {
    let config = load_config(args.config.as_ref());

    let servers_text = match std::fs::read_to_string(&args.servers) {
        Ok(text) => text,
        Err(err) => {
            tracing::error!(error = %err, path = %args.servers.display(), "failed to read server list");
            return exitcode::NOINPUT;
        }
    };

    let servers: Vec<VPNServer> = match serde_json::from_str(&servers_text) {
        Ok(servers) => servers,
        Err(err) => {
            tracing::error!(error = %err, "failed to parse server list");
            return exitcode::DATAERR;
        }
    };

    let target = match &args.server_id {
        Some(id) => servers.iter().find(|s| &s.id == id).cloned(),
        None => ServerSelector::new(servers.clone()).best(None).cloned(),
    };

    let Some(target) = target else {
        tracing::error!("no suitable server found in server list");
        return exitcode::DATAERR;
    };

    let controller = Controller::new(config.clone());
    controller.set_servers(servers);

    if let Err(err) = controller.connect(target, config.kill_switch_enabled, None).await {
        tracing::error!(error = %err, "initial connection failed");
        return exitcode::UNAVAILABLE;
    }

    supervise_until_shutdown(controller).await
}

#[tokio::main]
async fn main() {
    vpnguard_lib::logging::init();

    let args = Args::parse();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting {}", env!("CARGO_PKG_NAME"));

    let exit = run(args).await;
    if exit != exitcode::OK {
        tracing::warn!("abnormal exit");
    }

    process::exit(exit)
}
