//! WebSocket transport: one connection is one sync session on one document.

pub mod client;
pub mod relay;
pub mod route;
pub mod session;

pub use client::ClientSession;
pub use relay::relay_socket;
pub use route::doc_socket;
pub use session::{SessionError, SyncSession};
