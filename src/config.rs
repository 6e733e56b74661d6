//! Relay configuration
//!
//! All values are resolved once at startup and shared read-only across
//! request tasks.

use url::Url;

/// Immutable process-wide relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Port the relay listens on
    pub port: u16,
    /// Upstream base URL the website route forwards to
    pub site_upstream: Url,
    /// Firebase realtime-database namespace served through the relay
    pub database_id: String,
    /// Take the client address from `x-forwarded-for` instead of the peer socket
    pub trust_proxy: bool,
    /// Domain suffix a database-proxy target's host must end with
    pub upstream_domain_suffix: String,
    /// Disable the host/namespace admission check (open-proxy mode)
    pub allow_any_host: bool,
}
