//! Pumps bytes from one local half of a sub-connection onto the tunnel as `Data` frames.
//!
//! Mirrors the Go original's `servConnection`: read, frame, repeat, until EOF/error or a
//! `cancel` notification fires because the other side already tore the slot down.

use std::sync::Arc;

use tokio::{io::AsyncReadExt, net::tcp::OwnedReadHalf, sync::Notify};

use crate::tunnel::{
    protocol::{Opcode, MAX_DATA_PAYLOAD},
    tunnel::Tunnel,
};

pub async fn run(tunnel: Arc<Tunnel>, id: u32, mut read: OwnedReadHalf, cancel: Arc<Notify>) {
    let mut buf = vec![0u8; MAX_DATA_PAYLOAD];

    loop {
        tokio::select! {
            _ = cancel.notified() => {
                return;
            }
            res = read.read(&mut buf) => {
                match res {
                    Ok(0) => {
                        tunnel.finish_conn(id).await;
                        return;
                    }
                    Ok(n) => {
                        tunnel.touch_activity().await;
                        if tunnel.send_frame(Opcode::Data, id, &buf[..n]).await.is_err() {
                            return;
                        }
                    }
                    Err(_) => {
                        tunnel.finish_conn(id).await;
                        return;
                    }
                }
            }
        }
    }
}
