//! The single-decree Paxos council, exposed as a library so the binary
//! entry point in `main.rs` and the `tests/` integration suite share one
//! implementation.

pub mod acceptor;
pub mod config;
pub mod error;
pub mod message;
pub mod peer;
pub mod profile;
pub mod proposer;
pub mod transport;
