//! Proxy target validation
//!
//! The database-proxy route carries its upstream URL in the request
//! path. Parsing and admission happen here, before any network I/O --
//! this gate is the relay's only protection against being used as an
//! open proxy to arbitrary hosts.

use crate::config::RelayConfig;
use crate::error::RelayError;
use percent_encoding::percent_decode_str;
use url::Url;

/// Path of the realtime-database long-poll control endpoint. Requests
/// for it carry the namespace inside their own payload, so the `ns`
/// query check does not apply.
pub const LONG_POLL_PATH: &str = "/.lp";

/// A validated upstream target for the database-proxy route.
///
/// Only constructible through [`ProxyTarget::resolve`], so holding one
/// means the admission policy already passed.
#[derive(Debug, Clone)]
pub struct ProxyTarget {
    pub url: Url,
    /// Database namespace from the `ns` query parameter, if present
    pub ns: Option<String>,
}

impl ProxyTarget {
    /// Parse and admit a target from the literal path+query suffix
    /// after the route prefix. Clients may send the target URL
    /// percent-encoded as a single path segment; a suffix without a
    /// scheme is decoded once before parsing.
    pub fn resolve(suffix: &str, config: &RelayConfig) -> Result<Self, RelayError> {
        let url = parse_target(suffix)?;
        let ns = url
            .query_pairs()
            .find(|(key, _)| key == "ns")
            .map(|(_, value)| value.into_owned());

        if !config.allow_any_host {
            if !url
                .host_str()
                .is_some_and(|host| host.ends_with(&config.upstream_domain_suffix))
            {
                return Err(RelayError::ForbiddenTarget(format!(
                    "host is outside {}: {}",
                    config.upstream_domain_suffix, url
                )));
            }
            if url.path() != LONG_POLL_PATH && ns.as_deref() != Some(config.database_id.as_str()) {
                return Err(RelayError::ForbiddenTarget(format!(
                    "ns does not match the configured database: {}",
                    url
                )));
            }
        }

        Ok(Self { url, ns })
    }
}

fn parse_target(suffix: &str) -> Result<Url, RelayError> {
    if suffix.starts_with("http://") || suffix.starts_with("https://") {
        return Ok(Url::parse(suffix)?);
    }
    let decoded = percent_decode_str(suffix).decode_utf8_lossy();
    Ok(Url::parse(&decoded)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RelayConfig {
        RelayConfig {
            port: 3000,
            site_upstream: Url::parse("https://site.example.com").unwrap(),
            database_id: "mydb".to_string(),
            trust_proxy: false,
            upstream_domain_suffix: ".firebaseio.com".to_string(),
            allow_any_host: false,
        }
    }

    #[test]
    fn test_longpoll_path_admitted_without_ns() {
        let target =
            ProxyTarget::resolve("https://proj.firebaseio.com/.lp", &test_config()).unwrap();
        assert_eq!(target.url.path(), LONG_POLL_PATH);
        assert_eq!(target.ns, None);
    }

    #[test]
    fn test_longpoll_path_admitted_with_foreign_ns() {
        // The long-poll control endpoint is admitted regardless of ns
        let target =
            ProxyTarget::resolve("https://proj.firebaseio.com/.lp?ns=otherdb", &test_config())
                .unwrap();
        assert_eq!(target.ns.as_deref(), Some("otherdb"));
    }

    #[test]
    fn test_data_path_admitted_with_matching_ns() {
        let target =
            ProxyTarget::resolve("https://proj.firebaseio.com/data.json?ns=mydb", &test_config())
                .unwrap();
        assert_eq!(target.ns.as_deref(), Some("mydb"));
    }

    #[test]
    fn test_data_path_rejected_without_ns() {
        let err = ProxyTarget::resolve("https://proj.firebaseio.com/data.json", &test_config())
            .unwrap_err();
        assert!(matches!(err, RelayError::ForbiddenTarget(_)));
    }

    #[test]
    fn test_data_path_rejected_with_foreign_ns() {
        let err =
            ProxyTarget::resolve("https://proj.firebaseio.com/data.json?ns=other", &test_config())
                .unwrap_err();
        assert!(matches!(err, RelayError::ForbiddenTarget(_)));
    }

    #[test]
    fn test_foreign_host_rejected_regardless_of_query() {
        let err = ProxyTarget::resolve("https://other.example.com/x?ns=mydb", &test_config())
            .unwrap_err();
        assert!(matches!(err, RelayError::ForbiddenTarget(_)));

        let err =
            ProxyTarget::resolve("https://other.example.com/.lp", &test_config()).unwrap_err();
        assert!(matches!(err, RelayError::ForbiddenTarget(_)));
    }

    #[test]
    fn test_suffix_match_requires_full_suffix() {
        // "firebaseio.com" alone does not end with ".firebaseio.com"
        let err = ProxyTarget::resolve("https://notfirebaseio.com/.lp", &test_config());
        assert!(err.is_err());
    }

    #[test]
    fn test_malformed_target_rejected() {
        let err = ProxyTarget::resolve("not-a-url", &test_config()).unwrap_err();
        assert!(matches!(err, RelayError::MalformedTarget(_)));
    }

    #[test]
    fn test_percent_encoded_suffix_is_decoded() {
        let target = ProxyTarget::resolve(
            "https%3A%2F%2Fproj.firebaseio.com%2F.lp",
            &test_config(),
        )
        .unwrap();
        assert_eq!(target.url.host_str(), Some("proj.firebaseio.com"));
        assert_eq!(target.url.path(), LONG_POLL_PATH);
    }

    #[test]
    fn test_allow_any_host_skips_admission() {
        let mut config = test_config();
        config.allow_any_host = true;

        let target = ProxyTarget::resolve("https://other.example.com/x", &config).unwrap();
        assert_eq!(target.url.host_str(), Some("other.example.com"));

        // Parsing still applies even in open mode
        assert!(ProxyTarget::resolve("not-a-url", &config).is_err());
    }
}
