// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

use std::path::PathBuf;
use std::process::ExitCode;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crucible_daemon::build_users::BuildUserPool;
use crucible_daemon::config::Config;
use crucible_daemon::scheduler::Scheduler;
use crucible_daemon::server::Server;
use crucible_daemon::store::LocalStore;

fn usage() -> ! {
    eprintln!("usage: crucible-daemon [--config <path>]");
    std::process::exit(2);
}

fn load_config() -> Result<Config, crucible_daemon::error::DaemonError> {
    let mut args = std::env::args().skip(1);
    let mut config_path: Option<PathBuf> = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => match args.next() {
                Some(path) => config_path = Some(PathBuf::from(path)),
                None => usage(),
            },
            "--help" | "-h" => usage(),
            _ => usage(),
        }
    }

    let mut config = match config_path {
        Some(path) => Config::from_file(&path)?,
        None => Config::default(),
    };
    config.apply_env_overrides()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("crucible-daemon: {e}");
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    let store = match LocalStore::open(&config) {
        Ok(store) => store,
        Err(e) => {
            error!("failed to open store: {e}");
            return ExitCode::FAILURE;
        }
    };

    let users = match &config.build_users_group {
        Some(group) if nix::unistd::geteuid().is_root() => {
            match BuildUserPool::from_group(group) {
                Ok(pool) => pool,
                Err(e) => {
                    error!("build users: {e}");
                    return ExitCode::FAILURE;
                }
            }
        }
        Some(_) => {
            info!("not running as root, ignoring build_users_group");
            BuildUserPool::disabled()
        }
        None => BuildUserPool::disabled(),
    };

    let socket_path = config.socket_path.clone();
    let scheduler = Scheduler::new(store.clone(), config, users);
    let server = Server::new(store, scheduler);

    tokio::select! {
        result = server.run(&socket_path) => {
            if let Err(e) = result {
                error!("server error: {e}");
                return ExitCode::FAILURE;
            }
        }
        _ = shutdown_signal() => {
            info!("shutting down");
        }
    }

    let _ = std::fs::remove_file(&socket_path);
    ExitCode::SUCCESS
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
    let mut int = signal(SignalKind::interrupt()).expect("installing SIGINT handler");
    tokio::select! {
        _ = term.recv() => {}
        _ = int.recv() => {}
    }
}
