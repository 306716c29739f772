//! Small address-parsing helpers, grounded on the teacher's `net.rs` (`normalize_bind_addr`).

use std::net::{AddrParseError, Ipv4Addr, SocketAddr};

/// Parse `"ip:port"` into a `SocketAddr`, the way the Go original built its listener addresses
/// with plain string concatenation.
pub fn parse_addr(ip: &str, port: u16) -> Result<SocketAddr, AddrParseError> {
    format!("{ip}:{port}").parse()
}

/// Parse a dotted-quad IPv4 address out of an identity's `ip` field.
pub fn parse_ipv4(ip: &str) -> Result<Ipv4Addr, AddrParseError> {
    ip.parse()
}
