//! Client bundle rewriting
//!
//! The proxied website ships one minified bundle that connects
//! straight to the geo-blocked database host. Two fixed substitutions
//! redirect its long-poll traffic through the relay and break its
//! WebSocket path before a socket is ever opened. Both fail open: if a
//! newer upstream build no longer matches, the bundle passes through
//! untouched.

use once_cell::sync::Lazy;
use regex::Regex;
use std::borrow::Cow;

/// Route prefix the rewritten bundle targets
pub const PROXY_ROUTE_PREFIX: &str = "/firebase-proxy/";

/// A fixed pattern/replacement pair applied to text content.
///
/// Replacements are chosen so their output no longer matches the
/// pattern; applying a rule twice is the same as applying it once.
struct RewriteRule {
    pattern: Regex,
    replacement: &'static str,
}

impl RewriteRule {
    fn apply<'a>(&self, content: &'a str) -> Cow<'a, str> {
        self.pattern.replace(content, self.replacement)
    }
}

static BUNDLE_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/assets/index\.\w+\.js$").unwrap());

static REWRITE_RULES: Lazy<[RewriteRule; 2]> = Lazy::new(|| {
    [
        // Route the long-poll URL construction through the host that
        // served the page, landing on the relay's database route
        RewriteRule {
            pattern: Regex::new(
                r#"i=\(n\.secure\?"https://":"http://"\)\+n\.internalHost\+"/\.lp\?""#,
            )
            .unwrap(),
            replacement: r#"i=document.location.protocol+"//"+document.location.host+"/firebase-proxy/"+(n.secure?"https://":"http://")+n.internalHost+"/.lp?""#,
        },
        // WebSocket traffic cannot be relayed; make the constructor
        // throw before a socket to the blocked host exists
        RewriteRule {
            pattern: Regex::new(r"this\.mySock=new jt\(this\.connURL,\[\],i\)").unwrap(),
            replacement: r#"this.mySock=(()=>{throw new Error("websocket disabled by relay")})()"#,
        },
    ]
});

/// Whether this request path is the main client bundle
pub fn is_bundle_path(path: &str) -> bool {
    BUNDLE_PATH.is_match(path)
}

/// Apply the fixed substitutions to bundle text: first occurrence
/// only, in declaration order. Non-matching input is returned as-is.
pub fn rewrite_bundle(content: &str) -> Cow<'_, str> {
    let pass = REWRITE_RULES[0].apply(content);
    match REWRITE_RULES[1].apply(pass.as_ref()) {
        Cow::Owned(rewritten) => Cow::Owned(rewritten),
        Cow::Borrowed(_) => pass,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LONG_POLL_SNIPPET: &str =
        r#"var i=(n.secure?"https://":"http://")+n.internalHost+"/.lp?"+query;"#;
    const WEBSOCKET_SNIPPET: &str = r#"this.mySock=new jt(this.connURL,[],i);"#;

    #[test]
    fn test_bundle_path_matching() {
        assert!(is_bundle_path("/assets/index.ABC123.js"));
        assert!(is_bundle_path("/assets/index.a1b2c3d4.js"));
        assert!(!is_bundle_path("/assets/other.js"));
        assert!(!is_bundle_path("/assets/index.ABC123.js.map"));
        assert!(!is_bundle_path("/nested/assets/index.ABC123.js"));
        assert!(!is_bundle_path("/assets/index.js"));
    }

    #[test]
    fn test_long_poll_construction_is_redirected() {
        let rewritten = rewrite_bundle(LONG_POLL_SNIPPET);
        assert!(rewritten.contains("document.location.host"));
        assert!(rewritten.contains(PROXY_ROUTE_PREFIX));
        // The original host expression is kept as the proxied target
        assert!(rewritten.contains(r#"(n.secure?"https://":"http://")+n.internalHost"#));
    }

    #[test]
    fn test_websocket_constructor_throws() {
        let rewritten = rewrite_bundle(WEBSOCKET_SNIPPET);
        assert!(rewritten.contains("throw new Error"));
        assert!(!rewritten.contains("new jt(this.connURL"));
    }

    #[test]
    fn test_non_matching_text_passes_through_unchanged() {
        let content = "console.log('unrelated bundle');";
        let rewritten = rewrite_bundle(content);
        assert!(matches!(rewritten, Cow::Borrowed(_)));
        assert_eq!(rewritten, content);
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let content = format!("{}\n{}", LONG_POLL_SNIPPET, WEBSOCKET_SNIPPET);
        let once = rewrite_bundle(&content).into_owned();
        let twice = rewrite_bundle(&once).into_owned();
        assert_eq!(once, twice);
    }
}
