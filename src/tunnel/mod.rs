//! The tunnel subsystem: a framed multiplexing protocol that lets a server behind NAT expose a
//! local service through a client that dials out to a publicly reachable relay.
//!
//! ## Opcodes
//!
//! | Opcode | Direction       | Payload                    | Meaning                              |
//! |--------|-----------------|----------------------------|---------------------------------------|
//! | Init   | client -> server| ip(4) + port(2) + sn       | register this tunnel's identity       |
//! | Open   | server -> client| -                          | a visitor connected, dial the target  |
//! | Data   | both            | raw bytes                  | sub-connection payload                |
//! | Close  | both            | -                          | sub-connection ended                  |
//! | Getid  | both            | -                          | tunnel id handshake                   |
//! | Keep   | client -> server| -                          | keepalive heartbeat                   |
//! | Start  | both            | mapped port (as `id`)      | mapping came up                       |
//! | Stop   | both            | -                          | mapping torn down                     |
//!
//! `id` in the 9-byte frame header is the sub-connection id for `Open`/`Data`/`Close`, the tunnel
//! id for `Getid`, and the mapped port for `Start`; it is unused (zero) otherwise.

pub mod allocator;
pub mod client;
pub mod notifier;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod subconn;
pub mod tunnel;

pub use registry::Registry;
pub use tunnel::{Identity, Side, Status, Tunnel};
