use std::net::SocketAddr;

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::Incoming;
use hyper::client::conn::http1::Builder;
use hyper::header::{
    HeaderName, HeaderValue, CONNECTION, HOST, TE, TRAILER, TRANSFER_ENCODING, UPGRADE,
};
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::warn;

use crate::proxy::{full, ResolvedHost};
use crate::spoof::normalize_host;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Headers scoped to a single hop, never forwarded upstream.
const HOP_BY_HOP: &[&str] = &[
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "keep-alive",
];

/// Forward a non-CONNECT request to its destination as a reverse proxy.
///
/// The outgoing target is the spoofed host when a rule matched, the original
/// declared host otherwise. Upstream failures are mapped to 502 responses;
/// nothing is retried.
pub async fn forward(
    req: Request<Incoming>,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let resolved = req
        .extensions()
        .get::<ResolvedHost>()
        .map(|ResolvedHost(host)| host.clone());

    let target = match resolved.clone().or_else(|| normalize_host(&req)) {
        Some(addr) => addr,
        None => {
            warn!("request missing host: {:?}", req.uri());
            let mut resp = Response::new(full("request missing host"));
            *resp.status_mut() = StatusCode::BAD_REQUEST;
            return Ok(resp);
        }
    };

    let stream = match TcpStream::connect(&target).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("upstream dial to {} failed: {}", target, e);
            return Ok(bad_gateway(format!("upstream {target} unreachable: {e}")));
        }
    };

    let req = match rewrite_request(req, resolved.as_deref(), peer_addr) {
        Ok(req) => req,
        Err(resp) => return Ok(*resp),
    };

    let io = TokioIo::new(stream);
    let (mut sender, conn) = match Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(io)
        .await
    {
        Ok(pair) => pair,
        Err(e) => {
            warn!("upstream handshake with {} failed: {}", target, e);
            return Ok(bad_gateway(format!("upstream {target} handshake failed: {e}")));
        }
    };

    // Drive the upstream connection so the response body keeps streaming
    // after we hand the head back to hyper.
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            if !err.to_string().contains("connection closed") {
                warn!("upstream connection error: {:?}", err);
            }
        }
    });

    match sender.send_request(req).await {
        Ok(resp) => Ok(resp.map(|b| b.boxed())),
        Err(e) => {
            warn!("upstream request to {} failed: {}", target, e);
            Ok(bad_gateway(format!("upstream {target} request failed: {e}")))
        }
    }
}

/// Rewrite the outbound request: origin-form target, spoofed Host header when
/// a rule matched, hop-by-hop headers stripped, client address appended to
/// X-Forwarded-For.
fn rewrite_request<B>(
    req: Request<B>,
    resolved: Option<&str>,
    peer_addr: SocketAddr,
) -> Result<Request<B>, Box<Response<BoxBody<Bytes, hyper::Error>>>> {
    let (mut parts, body) = req.into_parts();
    let original_authority = parts.uri.authority().map(|a| a.to_string());

    let origin_form = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .parse::<Uri>();
    parts.uri = match origin_form {
        Ok(uri) => uri,
        Err(e) => {
            warn!("unforwardable request target {:?}: {}", parts.uri, e);
            let mut resp = Response::new(full("unforwardable request target"));
            *resp.status_mut() = StatusCode::BAD_REQUEST;
            return Err(Box::new(resp));
        }
    };

    strip_hop_by_hop(&mut parts.headers);

    if let Some(host) = resolved {
        if let Ok(value) = HeaderValue::from_str(host) {
            parts.headers.insert(HOST, value);
        }
    } else if !parts.headers.contains_key(HOST) {
        // Clients using absolute-form targets may omit the Host header;
        // origin-form outbound requests must carry one.
        if let Some(value) = original_authority
            .as_deref()
            .and_then(|a| HeaderValue::from_str(a).ok())
        {
            parts.headers.insert(HOST, value);
        }
    }

    let forwarded_for = match parts.headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {}", peer_addr.ip()),
        None => peer_addr.ip().to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        parts.headers.insert(X_FORWARDED_FOR.clone(), value);
    }

    Ok(Request::from_parts(parts, body))
}

fn strip_hop_by_hop(headers: &mut hyper::HeaderMap) {
    // Headers named by the Connection header are hop-by-hop too.
    let named: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    for name in named {
        if let Ok(header) = name.parse::<HeaderName>() {
            headers.remove(header);
        }
    }

    headers.remove(CONNECTION);
    headers.remove(TE);
    headers.remove(TRAILER);
    headers.remove(TRANSFER_ENCODING);
    headers.remove(UPGRADE);
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

fn bad_gateway(message: String) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut resp = Response::new(full(message));
    *resp.status_mut() = StatusCode::BAD_GATEWAY;
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> hyper::HeaderMap {
        let mut map = hyper::HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                name.parse::<HeaderName>().unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn strips_standard_hop_by_hop_headers() {
        let mut map = headers(&[
            ("connection", "keep-alive"),
            ("proxy-connection", "keep-alive"),
            ("proxy-authorization", "Basic xyz"),
            ("te", "trailers"),
            ("transfer-encoding", "chunked"),
            ("upgrade", "h2c"),
            ("accept", "*/*"),
        ]);
        strip_hop_by_hop(&mut map);
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("accept"));
    }

    #[test]
    fn strips_headers_named_by_connection() {
        let mut map = headers(&[
            ("connection", "close, x-custom-hop"),
            ("x-custom-hop", "1"),
            ("x-kept", "1"),
        ]);
        strip_hop_by_hop(&mut map);
        assert!(!map.contains_key("x-custom-hop"));
        assert!(map.contains_key("x-kept"));
    }

    fn request(uri: &str, pairs: &[(&str, &str)]) -> Request<http_body_util::Empty<Bytes>> {
        let mut builder = Request::builder().uri(uri);
        for (name, value) in pairs {
            builder = builder.header(*name, *value);
        }
        builder.body(http_body_util::Empty::new()).unwrap()
    }

    #[test]
    fn rewrites_to_origin_form_and_spoofed_host() {
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let req = request("http://test.com/a/b?x=1", &[("host", "test.com")]);
        let out = rewrite_request(req, Some("127.0.0.1:9000"), peer).unwrap();

        assert_eq!(out.uri().to_string(), "/a/b?x=1");
        assert_eq!(out.headers().get(HOST).unwrap(), "127.0.0.1:9000");
        assert_eq!(out.headers().get(&X_FORWARDED_FOR).unwrap(), "127.0.0.1");
    }

    #[test]
    fn unmatched_request_keeps_original_host_header() {
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let req = request("http://test.com/", &[("host", "test.com")]);
        let out = rewrite_request(req, None, peer).unwrap();
        assert_eq!(out.headers().get(HOST).unwrap(), "test.com");
    }

    #[test]
    fn forwarded_for_appends_to_existing_chain() {
        let peer: SocketAddr = "10.0.0.2:4000".parse().unwrap();
        let req = request(
            "http://test.com/",
            &[("host", "test.com"), ("x-forwarded-for", "192.168.1.1")],
        );
        let out = rewrite_request(req, None, peer).unwrap();
        assert_eq!(
            out.headers().get(&X_FORWARDED_FOR).unwrap(),
            "192.168.1.1, 10.0.0.2"
        );
    }
}
