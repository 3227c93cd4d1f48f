mod accounts;
mod auth;
mod clock;
mod cloudcode;
mod config;
mod error;
mod format;
mod models;
mod server;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use accounts::{AccountManager, AccountStore, disk_save_hook};
use auth::{CredentialStore, HttpClient};
use clock::SystemClock;
use cloudcode::{Dispatcher, ProjectResolver};
use config::Config;
use server::ServerState;

fn print_usage() {
    println!("ccrelay - Anthropic-compatible proxy for the Google Cloud Code API");
    println!();
    println!("Usage: ccrelay [serve] [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --port <PORT>    Listen port (default: 8080)");
    println!("  --host <HOST>    Listen address (default: 127.0.0.1)");
    println!("  --debug          Verbose logging");
    println!("  --help           Show this help");
    println!();
    println!("Accounts are read from {}", Config::dir().join("accounts.json").display());
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut port: Option<u16> = None;
    let mut host: Option<String> = None;
    let mut debug = false;

    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "serve" => {}
            "--port" | "-p" => {
                port = iter.next().and_then(|v| v.parse().ok());
                if port.is_none() {
                    eprintln!("error: --port requires a number");
                    std::process::exit(2);
                }
            }
            "--host" => {
                host = iter.next().cloned();
                if host.is_none() {
                    eprintln!("error: --host requires an address");
                    std::process::exit(2);
                }
            }
            "--debug" | "-d" => debug = true,
            "--help" | "-h" => {
                print_usage();
                return;
            }
            other => {
                eprintln!("error: unknown argument '{other}'");
                print_usage();
                std::process::exit(2);
            }
        }
    }

    let config = match Config::load() {
        Ok(config) => config.with_overrides(port, host, debug),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    let filter = if config.logging.debug {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ccrelay=debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ccrelay=info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    config::init_config(config);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run()) {
        error!(error = %e, "Server failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = config::get_config();

    let accounts_path = config.accounts_path();
    let store = AccountStore::load(&accounts_path, config.accounts.max_accounts)?;
    if store.accounts.is_empty() {
        warn!(
            path = %accounts_path.display(),
            "No accounts configured; every request will fail until the store is populated"
        );
    }

    let clock = Arc::new(SystemClock);
    let http = Arc::new(HttpClient::new());
    let accounts = Arc::new(AccountManager::new(
        store,
        clock.clone(),
        disk_save_hook(accounts_path),
        config.dispatch.max_wait_before_error_ms,
    ));
    let credentials = Arc::new(CredentialStore::new(
        http.clone(),
        clock.clone(),
        Duration::from_secs(config.dispatch.token_ttl_secs),
    ));
    let projects = Arc::new(ProjectResolver::new(
        http,
        config.dispatch.default_project_id.clone(),
    ));
    let dispatcher = Dispatcher::new(
        accounts.clone(),
        credentials,
        projects,
        clock,
        config.dispatch.clone(),
    );

    let state = Arc::new(ServerState {
        dispatcher,
        accounts,
    });

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "ccrelay listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = server::handle_connection(stream, remote_addr, state).await {
                        tracing::debug!(remote = %remote_addr, error = %e, "Connection closed with error");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}
