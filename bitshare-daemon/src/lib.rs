//! bitshare daemon: configuration, framed socket I/O, LAN discovery, the three-listener
//! daemon and the client API used by local callers.

pub mod client;
pub mod config;
pub mod daemon;
pub mod discovery;
pub mod shutdown;
pub mod transfer;

pub use client::Client;
pub use config::Config;
pub use daemon::{Daemon, DaemonError, DaemonState, ListenerAddrs};
pub use shutdown::StopSignal;
pub use transfer::TransferError;
