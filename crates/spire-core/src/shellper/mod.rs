//! Daemon-side shellper plumbing: the socket client that talks to a holder
//! process and the session manager that spawns, reconnects, and sweeps
//! holders.

pub mod client;
pub mod manager;

pub use client::{ClientHandle, HolderMeta, ShellperClient};
pub use manager::{CreateHolderRequest, HolderInfo, ShellperManager};
