//! Per-request error taxonomy
//!
//! Every failure is scoped to the request that caused it. The router
//! maps each variant to an HTTP status and a JSON `{"error": ...}`
//! body; nothing here is fatal to the process.

use hyper::StatusCode;
use thiserror::Error;

/// Errors that can occur while relaying a single request
#[derive(Debug, Error)]
pub enum RelayError {
    /// The database-proxy path suffix did not parse as an absolute URL
    #[error("invalid proxy target: {0}")]
    MalformedTarget(#[from] url::ParseError),

    /// The target URL parsed but failed the admission policy
    #[error("this host is not proxiable: {0}")]
    ForbiddenTarget(String),

    /// The outbound request to the upstream failed
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    /// Building the downstream response failed
    #[error(transparent)]
    Http(#[from] hyper::http::Error),

    /// Reading the inbound request body failed
    #[error("failed to read request body: {0}")]
    InboundBody(#[from] hyper::Error),
}

impl RelayError {
    /// HTTP status this error surfaces as. Validation failures are the
    /// client's fault; everything else is a relay-side failure.
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::MalformedTarget(_) | RelayError::ForbiddenTarget(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_are_bad_request() {
        let err = RelayError::ForbiddenTarget("https://other.example.com/x".to_string());
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err = RelayError::MalformedTarget(url::ParseError::RelativeUrlWithoutBase);
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_other_errors_are_internal() {
        let err = RelayError::Http(hyper::http::Response::builder().status(1000).body(()).unwrap_err());
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
