//! Server role: accept control-plane connections from tunnel clients.
//!
//! Grounded on the Go original's `ProxyServer.Run`/`openTunnel` (`AcceptAndHandle` spawning a
//! tunnel per accepted socket) and the teacher's `tunnel::server::listen_and_serve` shutdown
//! wiring. The HTTP admin surface lives in `crate::http`; this module only owns the accept loop
//! that peer clients dial into.

use std::{
    net::SocketAddr,
    sync::{atomic::AtomicU32, Arc},
};

use tokio::{net::TcpListener, sync::watch};

use crate::tunnel::{registry::Registry, tunnel::Tunnel};

pub struct ServerOptions {
    pub bind_addr: SocketAddr,
    pub notifier_addr: SocketAddr,
}

pub struct Server {
    opts: ServerOptions,
}

impl Server {
    pub fn new(opts: ServerOptions) -> Self {
        Self { opts }
    }

    pub async fn listen_and_serve(
        self,
        registry: Arc<Registry>,
        id_gen: Arc<AtomicU32>,
        shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.opts.bind_addr).await?;
        tracing::info!(addr = %self.opts.bind_addr, "server: control plane listening");

        let mut shutdown_rx = shutdown.clone();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            tracing::warn!(err = %err, "server: accept failed");
                            continue;
                        }
                    };
                    tracing::info!(%peer, "server: tunnel client connected");

                    let registry = registry.clone();
                    let id_gen = id_gen.clone();
                    let notifier_addr = self.opts.notifier_addr;
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        let (tunnel, read) = Tunnel::new(
                            crate::tunnel::Side::Server,
                            socket,
                            Some(registry),
                            Some(notifier_addr),
                            id_gen,
                        );
                        tunnel.run(read, shutdown).await;
                    });
                }
            }
        }

        tracing::info!("server: control plane shutting down");
        Ok(())
    }
}
