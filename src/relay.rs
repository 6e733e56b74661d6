//! Relay server implementation
//!
//! Owns the listener loop and the two request paths: the database
//! proxy under `/firebase-proxy/` and the catch-all website proxy.

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::rewrite::{self, PROXY_ROUTE_PREFIX};
use crate::validate::ProxyTarget;
use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{
    HeaderMap, HeaderValue, ACCEPT, ACCEPT_ENCODING, CACHE_CONTROL, CONTENT_ENCODING,
    CONTENT_TYPE, USER_AGENT,
};
use hyper::server::conn::http1;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use std::convert::Infallible;
use std::future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tracing::{debug, error, info, warn};

/// Error type carried by relayed response bodies. The relay never
/// emits a body error (streamed frames are filtered to `Ok` and the
/// buffered body is infallible), so this is `Infallible`; a concrete
/// type is also required here to satisfy hyper's `serve_connection`
/// trait-object lifetime bounds.
pub type BoxError = std::convert::Infallible;

type RelayBody = UnsyncBoxBody<Bytes, BoxError>;

/// Marker header telling the upstream this traffic came via the relay
const GEO_PROXY_MARKER: &str = "x-firebase-geo-proxy";

/// Content-type marker that switches the database route to streaming
const EVENT_STREAM: &str = "text/event-stream";

/// Response headers never copied from upstream to downstream:
/// hop-by-hop framing plus headers the relay sets itself
const EXCLUDED_RESPONSE_HEADERS: [&str; 6] = [
    "connection",
    "transfer-encoding",
    "content-encoding",
    "content-length",
    "accept-ranges",
    "strict-transport-security",
];

/// File extensions relayed as raw bytes on the website route
const BINARY_EXTENSIONS: [&str; 3] = [".jpeg", ".png", ".ico"];

/// How a database-route response body is carried downstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportMode {
    Buffered,
    Streaming,
}

/// Upstream response body after classification. Exactly one variant
/// exists per response; the streaming side holds the live handle.
enum UpstreamPayload {
    Buffered(Bytes),
    Streaming(reqwest::Response),
}

/// Relay server
pub struct RelayServer {
    config: Arc<RelayConfig>,
    client: reqwest::Client,
}

impl RelayServer {
    /// Create a new relay server with its outbound connection pool
    pub fn new(config: RelayConfig) -> Result<Self, RelayError> {
        // Only a connect timeout: streaming requests must be allowed
        // to stay open indefinitely
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            config: Arc::new(config),
            client,
        })
    }

    /// Start the relay and serve until the process is stopped
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let addr: SocketAddr = format!("0.0.0.0:{}", self.config.port).parse()?;
        let listener = TcpListener::bind(addr).await?;
        info!("relay listening on {}", addr);

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let server = self.clone();

            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, remote_addr).await {
                    debug!("connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Serve a single inbound connection. The compression layer only
    /// ever takes effect on the website branch: database-route
    /// responses always carry an explicit content-encoding, which the
    /// layer refuses to re-encode, and its default predicate skips
    /// event streams as well.
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        remote_addr: SocketAddr,
    ) -> anyhow::Result<()> {
        stream.set_nodelay(true)?;
        let io = TokioIo::new(stream);

        let server = self.clone();
        let service = ServiceBuilder::new()
            .layer(CompressionLayer::new())
            .service(tower::service_fn(move |req: Request<Incoming>| {
                let server = server.clone();
                async move { server.handle_request(req, remote_addr).await }
            }));

        http1::Builder::new()
            .serve_connection(io, TowerToHyperService::new(service))
            .await
            .map_err(|e| anyhow::anyhow!("http service error: {}", e))
    }

    /// Top-level dispatch and catch: route by path prefix, turn any
    /// per-request failure into a JSON error response
    async fn handle_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Response<RelayBody>, Infallible> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        debug!("{} {} from {}", method, path, remote_addr);

        let result = if path.starts_with(PROXY_ROUTE_PREFIX) {
            self.handle_database_proxy(req).await
        } else {
            self.handle_website_proxy(req, remote_addr).await
        };

        match result {
            Ok(response) => Ok(response),
            Err(e) => {
                let status = e.status();
                if status == StatusCode::BAD_REQUEST {
                    warn!("{} {} rejected: {}", method, path, e);
                } else {
                    error!("{} {} failed: {}", method, path, e);
                }
                Ok(Self::json_error_response(status, &e.to_string()))
            }
        }
    }

    /// Database-proxy route: validate the target, replay the request,
    /// relay the response buffered or streamed
    async fn handle_database_proxy(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<RelayBody>, RelayError> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();
        let suffix = path_and_query.strip_prefix(PROXY_ROUTE_PREFIX).unwrap_or("");

        let target = ProxyTarget::resolve(suffix, &self.config)?;
        info!("[firebase proxy] {}", target.url);

        let (parts, body) = req.into_parts();
        let body_bytes = body.collect().await?.to_bytes();

        // x-forwarded-for is deliberately absent here: the upstream
        // would geo-block on the real client address
        let upstream_res = self
            .build_upstream_request(parts.method, target.url.as_str(), &parts.headers, body_bytes, None)
            .send()
            .await?;

        let status = upstream_res.status();
        let headers = upstream_res.headers().clone();
        let mode = classify_transport(headers.get(CONTENT_TYPE), parts.headers.get(ACCEPT));

        let payload = match mode {
            TransportMode::Buffered => UpstreamPayload::Buffered(upstream_res.bytes().await?),
            TransportMode::Streaming => UpstreamPayload::Streaming(upstream_res),
        };

        let mut response = match payload {
            UpstreamPayload::Buffered(bytes) => Response::new(Self::full_body(bytes)),
            UpstreamPayload::Streaming(upstream) => Response::new(Self::stream_body(upstream)),
        };
        *response.status_mut() = status;
        copy_response_headers(&headers, response.headers_mut());

        let downstream = response.headers_mut();
        downstream.insert(CONTENT_ENCODING, HeaderValue::from_static("identity"));
        if mode == TransportMode::Streaming {
            downstream.insert(CONTENT_TYPE, HeaderValue::from_static(EVENT_STREAM));
            downstream.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            downstream.insert("x-accel-buffering", HeaderValue::from_static("no"));
        }

        Ok(response)
    }

    /// Website-proxy route: forward to the configured upstream prefix,
    /// short-circuit binary assets, rewrite the client bundle
    async fn handle_website_proxy(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Response<RelayBody>, RelayError> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();
        let path = req.uri().path().to_string();
        let target = format!(
            "{}{}",
            self.config.site_upstream.as_str().trim_end_matches('/'),
            path_and_query
        );
        info!("[website proxy] {}", path_and_query);

        let client_ip = self.client_ip(req.headers(), remote_addr);
        let (parts, body) = req.into_parts();
        let body_bytes = body.collect().await?.to_bytes();

        let upstream_res = self
            .build_upstream_request(parts.method, &target, &parts.headers, body_bytes, Some(client_ip))
            .send()
            .await?;

        let status = upstream_res.status();
        let headers = upstream_res.headers().clone();
        let content = upstream_res.bytes().await?;

        let body = if BINARY_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
            content
        } else if rewrite::is_bundle_path(&path) {
            info!("[website mitm] {}", path);
            let text = String::from_utf8_lossy(&content);
            Bytes::from(rewrite::rewrite_bundle(&text).into_owned())
        } else {
            content
        };

        let mut response = Response::new(Self::full_body(body));
        *response.status_mut() = status;
        copy_response_headers(&headers, response.headers_mut());

        Ok(response)
    }

    /// Build the outbound request: method and body verbatim, a fixed
    /// marker header, and upstream compression declined so streamed
    /// and rewritten bodies stay plaintext
    fn build_upstream_request(
        &self,
        method: Method,
        url: &str,
        inbound: &HeaderMap,
        body: Bytes,
        forwarded_for: Option<IpAddr>,
    ) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, url)
            .header(GEO_PROXY_MARKER, "1")
            .header(ACCEPT_ENCODING, "identity")
            .body(body);

        if let Some(user_agent) = inbound.get(USER_AGENT) {
            builder = builder.header(USER_AGENT, user_agent);
        }
        if let Some(content_type) = inbound.get(CONTENT_TYPE) {
            builder = builder.header(CONTENT_TYPE, content_type);
        }
        builder = match inbound.get(ACCEPT) {
            Some(accept) => builder.header(ACCEPT, accept),
            None => builder.header(ACCEPT, "application/json"),
        };

        if let Some(ip) = forwarded_for {
            builder = builder.header("x-forwarded-for", ip.to_string());
        }

        builder
    }

    /// Client address for x-forwarded-for on the website route
    fn client_ip(&self, headers: &HeaderMap, remote_addr: SocketAddr) -> IpAddr {
        if self.config.trust_proxy {
            if let Some(ip) = headers
                .get("x-forwarded-for")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.split(',').next())
                .and_then(|value| value.trim().parse().ok())
            {
                return ip;
            }
        }
        remote_addr.ip()
    }

    /// Wrap a live upstream body as a frame-for-frame streamed
    /// response body. A mid-stream upstream error logs and ends the
    /// stream; long-poll/SSE clients reconnect on their own. Dropping
    /// the body (client disconnect) aborts the upstream request.
    fn stream_body(upstream: reqwest::Response) -> RelayBody {
        let frames = upstream
            .bytes_stream()
            .take_while(|chunk| {
                let keep = match chunk {
                    Ok(_) => true,
                    Err(e) => {
                        warn!("upstream stream error: {}", e);
                        false
                    }
                };
                future::ready(keep)
            })
            .filter_map(|chunk| {
                future::ready(chunk.ok().map(|bytes| Ok::<_, BoxError>(Frame::data(bytes))))
            });

        StreamBody::new(frames).boxed_unsync()
    }

    /// Create a complete in-memory body
    fn full_body(bytes: Bytes) -> RelayBody {
        Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
    }

    /// Build the JSON error body every failure path responds with
    fn json_error_response(status: StatusCode, message: &str) -> Response<RelayBody> {
        let body = serde_json::json!({ "error": message }).to_string();
        let mut response = Response::new(Self::full_body(Bytes::from(body)));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
            .headers_mut()
            .insert(CONTENT_ENCODING, HeaderValue::from_static("identity"));
        response
    }
}

/// Decide buffered vs streaming for a database-route response. Pure
/// and total in the upstream content-type and the inbound accept
/// header.
fn classify_transport(
    content_type: Option<&HeaderValue>,
    accept: Option<&HeaderValue>,
) -> TransportMode {
    let wants_stream = |value: Option<&HeaderValue>| {
        value
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains(EVENT_STREAM))
            .unwrap_or(false)
    };

    if wants_stream(content_type) || wants_stream(accept) {
        TransportMode::Streaming
    } else {
        TransportMode::Buffered
    }
}

/// Copy upstream response headers downstream, skipping the fixed
/// exclusion set. Repeated header values are preserved.
fn copy_response_headers(upstream: &HeaderMap, downstream: &mut HeaderMap) {
    for (name, value) in upstream {
        if !EXCLUDED_RESPONSE_HEADERS.contains(&name.as_str()) {
            downstream.append(name.clone(), value.clone());
        }
    }
}
