//! Outbound IRC client connections (4.F): per-network socket with custom
//! flood pacing, liveness probing and multi-server failover. This deliberately
//! bypasses `irc::client::Client` (the crate's high-level, `/sync`-style
//! client) in favour of the teacher's own `Framed<_, IrcCodec>` pattern
//! (`ircd/mod.rs`), applied to outbound `connect()` instead of inbound
//! `accept()`, so the pacer/failover state machine below is ours to drive.

pub mod connection;
pub mod dispatch;
pub mod pacing;

pub use connection::{liveness_interval, next_nick_candidate, ping_timeout, reconnect_delay, ConnectionEvent, IrcConnection};
pub use dispatch::{dispatch_message, IrcEvent};
