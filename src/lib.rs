//! georelay - HTTP relay for a geo-restricted Firebase realtime database
//!
//! The relay serves two routes on one port:
//! - `/firebase-proxy/<upstream-url>`: validated database proxy with
//!   buffered and streaming (long-poll / SSE) relay modes
//! - everything else: website proxy that rewrites the client bundle so
//!   its database traffic routes back through the relay

pub mod config;
pub mod error;
pub mod relay;
pub mod rewrite;
pub mod validate;

pub use config::RelayConfig;
pub use error::RelayError;
pub use relay::RelayServer;
pub use validate::ProxyTarget;
