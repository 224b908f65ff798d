//! Agent module: CLI process management and WebSocket bridge
//!
//! Launches the coding-assistant CLI as a subprocess per session and relays
//! messages between it and any number of browser clients.
//!
//! ## Architecture
//!
//! ```text
//! Browser ←→ WS (JSON) ←→ ClawRelay (axum) ←→ WS (NDJSON) ←→ CLI process
//!            /ws/browser/:id  ├ transport      /ws/cli/:id     (--sdk-url)
//!                             ├ bridge
//!                             │  └ registry
//!                             ├ launcher
//!                             └ service ← handler (REST)
//! ```

pub mod bridge;
pub mod handler;
pub mod launcher;
pub mod registry;
pub mod service;
pub mod transport;
pub mod types;

pub use bridge::AgentBridge;
pub use handler::{agent_router, AgentState};
pub use launcher::AgentLauncher;
pub use registry::SessionRegistry;
pub use service::AgentService;
