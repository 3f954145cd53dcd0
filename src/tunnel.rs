use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::buffer_pool;
use crate::proxy::{empty, full, ResolvedHost};

/// Handle a CONNECT request: dial the destination, take over the client
/// connection once hyper has flushed the established reply, then relay raw
/// bytes in both directions until either side hangs up.
///
/// The origin is dialed before the upgrade so dial failures can still be
/// answered with a proper HTTP error; once the reply is committed no further
/// response can be written and relay errors are only logged.
pub async fn handle_connect(req: Request<Incoming>) -> Response<BoxBody<Bytes, hyper::Error>> {
    let addr = match req.extensions().get::<ResolvedHost>() {
        Some(ResolvedHost(host)) => host.clone(),
        None => match req.uri().authority() {
            Some(authority) => authority.to_string(),
            None => {
                warn!("CONNECT target is not an authority: {:?}", req.uri());
                let mut resp = Response::new(full("CONNECT must be to a socket address"));
                *resp.status_mut() = StatusCode::BAD_REQUEST;
                return resp;
            }
        },
    };

    let origin = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("CONNECT dial to {} failed: {}", addr, e);
            let mut resp = Response::new(full(e.to_string()));
            *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            return resp;
        }
    };

    tokio::task::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if let Err(e) = relay(upgraded, origin).await {
                    debug!("tunnel to {} ended with error: {}", addr, e);
                }
            }
            Err(e) => warn!("connection upgrade failed: {}", e),
        }
    });

    // The exact reason phrase matters: clients validate the literal
    // "HTTP/1.1 200 Connection established" status line.
    let mut resp = Response::new(empty());
    resp.extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection established"));
    resp
}

/// Bidirectional relay between the hijacked client connection and the origin
/// using pooled copy buffers. The loop ends on the first EOF or error from
/// either direction, after which both ends are shut down exactly once.
async fn relay(upgraded: Upgraded, mut origin: TcpStream) -> std::io::Result<()> {
    let mut client = TokioIo::new(upgraded);

    let mut client_buf = buffer_pool::acquire().await;
    let mut origin_buf = buffer_pool::acquire().await;
    let mut result = Ok(());

    loop {
        tokio::select! {
            res = client.read(&mut client_buf) => {
                match res {
                    Ok(0) => break, // client hung up
                    Ok(n) => {
                        if let Err(e) = origin.write_all(&client_buf[..n]).await {
                            result = Err(e);
                            break;
                        }
                    }
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                }
            }
            res = origin.read(&mut origin_buf) => {
                match res {
                    Ok(0) => break, // origin hung up
                    Ok(n) => {
                        if let Err(e) = client.write_all(&origin_buf[..n]).await {
                            result = Err(e);
                            break;
                        }
                    }
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                }
            }
        }
    }

    // Single exit path: both ends are shut down exactly once, whichever
    // direction finished first.
    let _ = origin.shutdown().await;
    let _ = client.shutdown().await;

    buffer_pool::release(client_buf).await;
    buffer_pool::release(origin_buf).await;

    result
}
