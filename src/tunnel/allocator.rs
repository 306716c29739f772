//! Port allocation for mapped listeners: pick a randomized starting point in the configured
//! range and take the first port that binds, mirroring the Go original's `listenRand`.

use rand::Rng;
use thiserror::Error;
use tokio::net::TcpListener;

pub const PORT_RANGE_START: u16 = 8050;
pub const PORT_RANGE_RANDOM_SPAN: u16 = 30;
/// Exclusive upper bound of the scan.
pub const PORT_RANGE_END: u16 = 10000;

#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error("no free port in [{0}, {1})")]
    RangeExhausted(u16, u16),
}

/// Bind `0.0.0.0:p` for the first `p` that succeeds, scanning forward from a randomized offset
/// within `[PORT_RANGE_START, PORT_RANGE_START + PORT_RANGE_RANDOM_SPAN)`.
pub async fn bind_random_port() -> Result<(TcpListener, u16), AllocatorError> {
    let start = PORT_RANGE_START + rand::rng().random_range(0..PORT_RANGE_RANDOM_SPAN);
    for port in start..PORT_RANGE_END {
        if let Ok(listener) = TcpListener::bind(("0.0.0.0", port)).await {
            return Ok((listener, port));
        }
    }
    Err(AllocatorError::RangeExhausted(start, PORT_RANGE_END))
}
