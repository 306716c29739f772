//! Top-level wiring: parse the CLI, load config, start the chosen role, and drive an orderly
//! shutdown.
//!
//! Grounded on the teacher's `app.rs` (`tokio::sync::watch::<bool>` shutdown broadcast,
//! `JoinSet`, bounded drain timeout, Ctrl-C/SIGTERM handling via `shutdown_signal`) and the Go
//! original's `work()` (mutually exclusive `-s`/`-c`, `sync.WaitGroup` replaced here by the
//! bounded drain).

use std::{
    net::SocketAddr,
    sync::{atomic::AtomicU32, Arc},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::{sync::watch, task::JoinSet};

use crate::{
    cli::Cli,
    config,
    http::{self, HttpState},
    tunnel::{
        client::{Client, ClientOptions},
        server::{Server, ServerOptions},
        Identity, Registry,
    },
};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn run() -> Result<()> {
    let _log_guard = crate::logging::init();
    let cli = Cli::parse();

    if cli.server == cli.client {
        bail!("Must run as server mode (-s) or client mode (-c), exclusively.");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    if cli.server {
        spawn_server(&cli, &mut tasks, shutdown_rx.clone())?;
    } else {
        spawn_client(&cli, &mut tasks, shutdown_rx.clone());
    }

    tasks.spawn(shutdown_signal(shutdown_tx));

    wait_for_first_exit(&mut tasks).await;

    tracing::info!("app: beginning shutdown drain");
    match tokio::time::timeout(DRAIN_TIMEOUT, drain(&mut tasks)).await {
        Ok(()) => tracing::info!("app: all tasks drained"),
        Err(_) => {
            tracing::warn!("app: drain timed out, aborting remaining tasks");
            tasks.abort_all();
        }
    }

    Ok(())
}

fn spawn_server(cli: &Cli, tasks: &mut JoinSet<()>, shutdown_rx: watch::Receiver<bool>) -> Result<()> {
    let cfg = config::load(&cli.config).context("loading server config")?;

    let registry = Arc::new(Registry::new());
    let id_gen = Arc::new(AtomicU32::new(0));

    let bind_addr: SocketAddr = crate::net::parse_addr(&cfg.server.ip, cfg.server.port)
        .context("parsing server.ip/server.port")?;
    let http_addr: SocketAddr =
        crate::net::parse_addr(&cfg.server.ip, cfg.server.serv).context("parsing server.ip/server.serv")?;
    let notifier_addr: SocketAddr =
        crate::net::parse_addr("127.0.0.1", cfg.braport).context("parsing braport")?;

    let server = Server::new(ServerOptions {
        bind_addr,
        notifier_addr,
    });
    {
        let registry = registry.clone();
        let id_gen = id_gen.clone();
        let shutdown_rx = shutdown_rx.clone();
        tasks.spawn(async move {
            if let Err(err) = server.listen_and_serve(registry, id_gen, shutdown_rx).await {
                tracing::error!(err = %err, "server: control plane exited with an error");
            }
        });
    }

    {
        let state = HttpState { registry };
        let router = http::router(state);
        let mut shutdown_rx = shutdown_rx;
        tasks.spawn(async move {
            let listener = match tokio::net::TcpListener::bind(http_addr).await {
                Ok(l) => l,
                Err(err) => {
                    tracing::error!(addr = %http_addr, err = %err, "http: bind failed");
                    return;
                }
            };
            tracing::info!(addr = %http_addr, "http: control plane listening");
            let serve = axum::serve(listener, router);
            tokio::select! {
                res = serve => {
                    if let Err(err) = res {
                        tracing::error!(err = %err, "http: server exited with an error");
                    }
                }
                _ = shutdown_rx.changed() => {}
            }
        });
    }

    Ok(())
}

fn spawn_client(cli: &Cli, tasks: &mut JoinSet<()>, shutdown_rx: watch::Receiver<bool>) {
    let id_gen = Arc::new(AtomicU32::new(0));

    let target = match cli.target.rsplit_once(':') {
        Some((ip, port)) => Identity {
            sn: cli.sn.clone(),
            ip: crate::net::parse_ipv4(ip).unwrap_or(std::net::Ipv4Addr::new(127, 0, 0, 1)),
            port: port.parse().unwrap_or(5900),
        },
        None => Identity {
            sn: cli.sn.clone(),
            ip: std::net::Ipv4Addr::new(127, 0, 0, 1),
            port: 5900,
        },
    };

    let server_addr = format!("{}:{}", cli.addr, cli.port);
    let server_addr: SocketAddr = match server_addr.parse() {
        Ok(addr) => addr,
        Err(err) => {
            tracing::error!(addr = %server_addr, err = %err, "client: invalid server address");
            return;
        }
    };

    let client = Client::new(ClientOptions { server_addr, target });
    tasks.spawn(async move {
        client.run(id_gen, shutdown_rx).await;
    });
}

async fn wait_for_first_exit(tasks: &mut JoinSet<()>) {
    tasks.join_next().await;
}

async fn drain(tasks: &mut JoinSet<()>) {
    while tasks.join_next().await.is_some() {}
}

async fn shutdown_signal(tx: watch::Sender<bool>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sig = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sig.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("app: shutdown signal received");
    let _ = tx.send(true);
}
