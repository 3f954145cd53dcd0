use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::ProxyConfig;
use crate::spoof::normalize_host;
use crate::{forward, tunnel};

/// Destination host resolved by the spoofing rules for a single request.
///
/// Carried in the request's extensions so later stages can read it without
/// re-evaluating the rule set. Set at most once per request and never shared
/// across requests.
#[derive(Debug, Clone)]
pub struct ResolvedHost(pub String);

/// The proxy façade: composes host resolution, optional diagnostics and the
/// CONNECT/forward branch into a single request handler.
pub struct Proxy {
    config: Arc<ProxyConfig>,
}

impl Proxy {
    pub fn new(config: Arc<ProxyConfig>) -> Self {
        Self { config }
    }

    /// Accept loop: each inbound connection gets its own task serving
    /// HTTP/1.1 with upgrade support (required for CONNECT).
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept error: {} (continuing)", e);
                    continue;
                }
            };

            let proxy = Arc::clone(&self);
            tokio::task::spawn(async move {
                let io = TokioIo::new(stream);
                let service =
                    service_fn(move |req| Arc::clone(&proxy).handle(req, peer_addr));

                // No auto Date header: the CONNECT established reply must be
                // the bare status line, nothing else.
                if let Err(err) = http1::Builder::new()
                    .preserve_header_case(true)
                    .title_case_headers(true)
                    .auto_date_header(false)
                    .serve_connection(io, service)
                    .with_upgrades()
                    .await
                {
                    if !err.to_string().contains("connection closed") {
                        warn!("connection from {} error: {:?}", peer_addr, err);
                    }
                }
            });
        }
    }

    /// Per-request stage chain, in fixed order: host resolution, optional
    /// diagnostics, then the method branch. CONNECT never reaches the
    /// forwarding path and other methods never reach the tunnel.
    async fn handle(
        self: Arc<Self>,
        mut req: Request<Incoming>,
        peer_addr: SocketAddr,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
        self.resolve_host(&mut req);

        if self.config.debug {
            self.log_request(&req);
        }

        if req.method() == Method::CONNECT {
            Ok(tunnel::handle_connect(req).await)
        } else {
            forward::forward(req, peer_addr).await
        }
    }

    /// Match the normalized host against the rule set and attach the first
    /// matching rule's replacement to the request. No match leaves the
    /// request untouched.
    fn resolve_host(&self, req: &mut Request<Incoming>) {
        let Some(host) = normalize_host(req) else {
            return;
        };
        if let Some(resolved) = self.config.rules.resolve(&host) {
            req.extensions_mut().insert(ResolvedHost(resolved));
        }
    }

    /// Diagnostics: a spoof-match notice plus a dump of the request line and
    /// headers. The body is deliberately left untouched so downstream stages
    /// can still consume it. Purely an observer.
    fn log_request(&self, req: &Request<Incoming>) {
        if let Some(ResolvedHost(resolved)) = req.extensions().get::<ResolvedHost>() {
            let original = normalize_host(req).unwrap_or_default();
            info!("host spoof matched: {} -> {}", original, resolved);
        }

        let mut dump = format!("{} {} {:?}\n", req.method(), req.uri(), req.version());
        for (name, value) in req.headers() {
            let value = value.to_str().unwrap_or("<binary>");
            dump.push_str(&format!("{name}: {value}\n"));
        }
        info!("new request:\n{dump}");
    }
}

/// `Response` body that carries a fixed chunk, for error and status replies.
pub fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Empty `Response` body, used for the CONNECT established reply.
pub fn empty() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}
