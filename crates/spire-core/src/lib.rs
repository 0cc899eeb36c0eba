//! spire session supervisor core.
//!
//! Everything the daemon needs to own interactive sessions lives here:
//! - `ring`: sequence-numbered line store with resume semantics
//! - `session`: the PTY session wrapper (local PTY or shellper-backed)
//! - `shellper`: the out-of-process holder client and its session manager
//! - `registry`: workspace → terminals map with write-through persistence
//! - `store`: the durable SQLite record store
//! - `reconcile`: startup reconciliation after a daemon restart
//! - `resolver` + `dispatch`: `[project:]agent` addressing and message
//!   delivery with typing-aware buffering

pub mod config;
pub mod dispatch;
pub mod error;
pub mod paths;
pub mod reconcile;
pub mod registry;
pub mod resolver;
pub mod ring;
pub mod session;
pub mod shellper;
pub mod store;

pub use config::{Settings, SettingsManager};
pub use error::SpireError;
pub use session::{PtySession, SessionMap, SessionStatus};

pub type Result<T> = std::result::Result<T, SpireError>;
