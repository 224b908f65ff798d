//! ClawRelay - WebSocket session bridge for a coding-assistant CLI
//!
//! ClawRelay lets a browser converse with a coding-assistant CLI running as
//! a subprocess. Each session owns one CLI process, which dials back to the
//! server over WebSocket, and any number of browser connections.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐  JSON   ┌──────────────────────────────────┐  NDJSON  ┌─────────────┐
//! │  Browser  │◄───────►│            ClawRelay             │◄────────►│ CLI process │
//! └───────────┘         │  ┌────────────┐  ┌────────────┐  │          └──────▲──────┘
//! ┌───────────┐         │  │   Bridge   │  │  Launcher  │──┼── spawn ────────┘
//! │  Browser  │◄───────►│  │ (registry) │◄─┤  (events)  │  │
//! └───────────┘         │  └────────────┘  └────────────┘  │
//!                       └──────────────────────────────────┘
//! ```
//!
//! - CLI output is broadcast to attached browsers, or buffered (bounded,
//!   drop-oldest) until one attaches.
//! - Permission requests are correlated by request id and answered at most
//!   once.
//! - Sessions move through `starting → connected ⇄ running → exited`.
//!
//! ## Modules
//!
//! - [`agent`]: Session bridge, registry, process launcher, transport
//! - [`api`]: HTTP application router
//! - [`config`]: Configuration management
//! - [`error`]: Error types

pub mod agent;
pub mod api;
pub mod config;
pub mod error;

pub use config::RelayConfig;
pub use error::{Error, Result};
