//! Client role: dial the server's control-plane port, announce identity, keep reconnecting.
//!
//! Grounded on the Go original's `ProxyClient.Run`/`openTunnel`/`initPeer` (dial, send `Init`
//! then `Getid(0)`, run the frame loop, sleep 60s, repeat forever) and the teacher's
//! `tunnel::client::run_once` reconnect-loop shape, including its `humantime` backoff log line.

use std::{
    net::SocketAddr,
    sync::{atomic::AtomicU32, Arc},
    time::Duration,
};

use tokio::{net::TcpStream, sync::watch};

use crate::tunnel::{
    protocol::Opcode,
    tunnel::{Identity, Side, Tunnel},
};

const RECONNECT_DELAY: Duration = Duration::from_secs(60);

pub struct ClientOptions {
    pub server_addr: SocketAddr,
    pub target: Identity,
}

pub struct Client {
    opts: ClientOptions,
}

impl Client {
    pub fn new(opts: ClientOptions) -> Self {
        Self { opts }
    }

    pub async fn run(self, id_gen: Arc<AtomicU32>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            match TcpStream::connect(self.opts.server_addr).await {
                Ok(socket) => {
                    tracing::info!(addr = %self.opts.server_addr, "client: connected");
                    if let Err(err) = self.open_tunnel(socket, id_gen.clone(), shutdown.clone()).await {
                        tracing::warn!(err = %err, "client: tunnel ended with an error");
                    }
                }
                Err(err) => {
                    tracing::warn!(addr = %self.opts.server_addr, err = %err, "client: dial failed");
                }
            }

            tracing::info!(
                backoff = %humantime::format_duration(RECONNECT_DELAY),
                "client: reconnecting after backoff"
            );
            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn open_tunnel(
        &self,
        socket: TcpStream,
        id_gen: Arc<AtomicU32>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), crate::tunnel::protocol::ProtocolError> {
        let (tunnel, read) = Tunnel::new(Side::Client, socket, None, None, id_gen);
        tunnel.set_client_identity(self.opts.target.clone());

        let mut payload = Vec::with_capacity(6 + self.opts.target.sn.len());
        payload.extend_from_slice(&self.opts.target.ip.octets());
        payload.extend_from_slice(&self.opts.target.port.to_be_bytes());
        payload.extend_from_slice(self.opts.target.sn.as_bytes());

        tunnel.send_frame(Opcode::Init, 0, &payload).await?;
        tunnel.send_frame(Opcode::Getid, 0, &[]).await?;

        tunnel.run(read, shutdown).await;
        Ok(())
    }
}
