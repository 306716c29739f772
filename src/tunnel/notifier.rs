//! One-shot notification to the external bra-server whenever a mapping stops.
//!
//! Grounded on the Go original's `tellBraServer`: the blob is a fixed literal (a `W`-tagged
//! header, a constant length prefix, and a trailing constant tail) with the serial number
//! spliced in the middle. The length prefix is a literal `47`, not a recomputed size — kept
//! exactly as the original wrote it rather than corrected, since nothing downstream of this
//! notifier is under our control.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::{io::AsyncWriteExt, net::TcpStream};

const TAIL: &[u8] = &[
    0x01, 0x05, b'p', b'r', b'o', b'x', b'y', 0x02, 0x01, 0x07, 0x03, 0x01, 0x00, 0xFE,
];
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

fn build_blob(sn: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(11 + 2 + sn.len() + TAIL.len());
    buf.extend_from_slice(&47u32.to_le_bytes());
    buf.extend_from_slice(&[b'W', 0, 0x10, 0, 0, 0, 0]);
    buf.extend_from_slice(&[0x00, 0x20]);
    buf.extend_from_slice(sn.as_bytes());
    buf.extend_from_slice(TAIL);
    buf
}

pub async fn notify(addr: SocketAddr, sn: &str) {
    let blob = build_blob(sn);

    let connect = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr));
    let mut stream = match connect.await {
        Ok(Ok(s)) => s,
        Ok(Err(err)) => {
            tracing::warn!(%addr, err = %err, "notifier: dial failed");
            return;
        }
        Err(_) => {
            tracing::warn!(%addr, "notifier: dial timed out");
            return;
        }
    };

    if let Err(err) = stream.write_all(&blob).await {
        tracing::warn!(%addr, err = %err, "notifier: write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_carries_the_serial_number_between_the_fixed_header_and_tail() {
        let blob = build_blob("ABC123");
        assert_eq!(&blob[0..4], &47u32.to_le_bytes());
        assert_eq!(&blob[4..11], &[b'W', 0, 0x10, 0, 0, 0, 0]);
        assert_eq!(&blob[11..13], &[0x00, 0x20]);
        assert_eq!(&blob[13..19], b"ABC123");
        assert_eq!(&blob[19..], TAIL);
    }
}
