//! HTTP(S) front end
//!
//! Every inbound request is rebuilt against the relay's single destination
//! and sent with `reqwest`, directly or through each named proxy in turn. The
//! first round trip that completes wins and its response is streamed back.
//! Request bodies are streamed as well, unless several proxies are named:
//! then the body is held in memory, up to [`REPLAY_BODY_LIMIT`] bytes, so
//! each attempt can send it again.
//! HTTPS relays terminate TLS on the accepted socket before handing it to
//! the HTTP server.

use axum::body::{Body, Bytes, HttpBody};
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::BytesMut;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use http::{header, HeaderMap, HeaderName, Method, StatusCode, Uri};
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use log::{debug, error, info, warn};
use openssl::ssl::{Ssl, SslAcceptor};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_openssl::SslStream;

use super::Relay;
use crate::common::{RelayError, Result};
use crate::config::defaults::REPLAY_BODY_LIMIT;
use crate::endpoint::{Endpoint, Protocol};
use crate::pool::{CloseSignal, ConnHandle, ConnToken};
use crate::proxy::ResolvedProxy;

/// Request headers that describe the inbound hop rather than the request
const SKIP_REQUEST_HEADERS: &[HeaderName] = &[
    header::HOST,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
    header::CONNECTION,
];

/// Request body chunks queued towards the destination
const UPLOAD_QUEUE: usize = 8;

/// Response headers the serving side sets for itself
const SKIP_RESPONSE_HEADERS: &[HeaderName] = &[header::CONNECTION, header::TRANSFER_ENCODING];

/// Build the default client used for direct requests
///
/// Redirects are returned to the caller untouched and environment proxy
/// settings are ignored.
pub fn default_client(connect_timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(connect_timeout)
        .no_proxy()
        .build()
        .map_err(|e| RelayError::Http(e.to_string()))
}

/// Build a client that tunnels every request through one SOCKS5 proxy
pub fn proxied_client(proxy: &ResolvedProxy, connect_timeout: Duration) -> Result<reqwest::Client> {
    let proxy_url = proxy.dialer.url()?;
    let socks = reqwest::Proxy::all(proxy_url.as_str()).map_err(|e| RelayError::Http(e.to_string()))?;

    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(connect_timeout)
        .proxy(socks)
        .build()
        .map_err(|e| RelayError::Http(e.to_string()))
}

/// Handler state: the relay and, when served by the relay itself, the
/// pooled connection the requests arrive on
#[derive(Clone)]
struct Forwarder {
    relay: Arc<Relay>,
    token: Option<ConnToken>,
}

/// Router that forwards every path to the destination
pub fn router(relay: Arc<Relay>) -> Router {
    Router::new()
        .fallback(handle_request)
        .with_state(Forwarder { relay, token: None })
}

fn conn_router(relay: Arc<Relay>, token: ConnToken) -> Router {
    Router::new().fallback(handle_request).with_state(Forwarder {
        relay,
        token: Some(token),
    })
}

/// Accept HTTP(S) connections until `shutdown` fires
pub(super) async fn accept_loop(
    relay: Arc<Relay>,
    listener: TcpListener,
    tls: Option<Arc<SslAcceptor>>,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<()> {
    let local = listener.local_addr()?;
    let scheme = if tls.is_some() { "HTTPS" } else { "HTTP" };
    info!("[{}] {} relay listening on {}", relay.name(), scheme, local);

    let mut tasks = JoinSet::new();

    loop {
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result {
                error!("[{}] Connection task error: {}", relay.name(), e);
            }
        }

        tokio::select! {
            _ = &mut shutdown => {
                warn!("[{}] Listener closed", relay.name());
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let network = if tls.is_some() { Protocol::Https } else { Protocol::Http };
                    let (handle, signal) = ConnHandle::new(peer, local, network);
                    tasks.spawn(serve_conn(
                        Arc::clone(&relay),
                        stream,
                        handle,
                        signal,
                        tls.clone(),
                    ));
                }
                Err(e) => warn!("[{}] Accept failed: {}", relay.name(), e),
            },
        }
    }

    tasks.detach_all();
    Ok(())
}

async fn serve_conn(
    relay: Arc<Relay>,
    stream: TcpStream,
    handle: ConnHandle,
    mut signal: CloseSignal,
    tls: Option<Arc<SslAcceptor>>,
) {
    let peer = handle.peer_addr();
    let token = relay.store_conn(handle);
    relay.metrics().record_connection_delta(1);
    debug!("[{}] New HTTP connection {}", relay.name(), peer);

    let app = conn_router(Arc::clone(&relay), token);
    let header_timeout = relay.listen_options().http_header_timeout;

    tokio::select! {
        result = serve(app, stream, tls, header_timeout) => {
            if let Err(e) = result {
                warn!("[{}] HTTP connection {} failed: {}", relay.name(), peer, e);
            }
        }
        _ = signal.closed() => {
            info!("[{}] Connection {} dropped", relay.name(), peer);
        }
    }

    relay.remove_conn(token);
    relay.metrics().record_connection_delta(-1);
}

async fn serve(
    app: Router,
    stream: TcpStream,
    tls: Option<Arc<SslAcceptor>>,
    header_timeout: Duration,
) -> Result<()> {
    let Some(acceptor) = tls else {
        return serve_http(app, stream, header_timeout).await;
    };

    let ssl = Ssl::new(acceptor.context())?;
    let mut stream = SslStream::new(ssl, stream)?;
    Pin::new(&mut stream)
        .accept()
        .await
        .map_err(|e| RelayError::TlsHandshake(e.to_string()))?;

    debug!("TLS handshake successful");
    serve_http(app, stream, header_timeout).await
}

async fn serve_http<S>(app: Router, stream: S, header_timeout: Duration) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(header_timeout)
        .serve_connection(TokioIo::new(stream), TowerToHyperService::new(app))
        .await
        .map_err(|e| RelayError::Http(e.to_string()))
}

async fn handle_request(State(forwarder): State<Forwarder>, request: Request) -> Response {
    let relay = &forwarder.relay;
    match forward_request(relay, request).await {
        Ok(Forwarded::Response(response, remote)) => {
            if let Some(token) = forwarder.token {
                relay.update_remote(token, &remote);
            }
            response
        }
        Ok(Forwarded::TooLarge) => {
            warn!(
                "[{}] Request body over {} bytes cannot be replayed through proxies",
                relay.name(),
                REPLAY_BODY_LIMIT
            );
            StatusCode::PAYLOAD_TOO_LARGE.into_response()
        }
        Err(e) => {
            error!("[{}] Forwarding request failed: {}", relay.name(), e);
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

/// Outbound URL: destination scheme and address plus the inbound path and query
pub fn outbound_url(destination: &Endpoint, uri: &Uri) -> Result<String> {
    let address = destination.require_address()?;
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    Ok(format!("{}://{}{}", destination.protocol(), address, path))
}

fn outbound_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len());
    for (name, value) in inbound {
        if !SKIP_REQUEST_HEADERS.contains(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    headers
}

/// Outcome of forwarding one request
enum Forwarded {
    /// The destination answered; the address it was reached at
    Response(Response, String),
    /// The body had to be buffered and did not fit
    TooLarge,
}

async fn forward_request(relay: &Arc<Relay>, request: Request) -> Result<Forwarded> {
    relay.metrics().record_request(1);

    let destination = relay.destinations().first().ok_or(RelayError::NoDestination)?;
    let url = outbound_url(destination, request.uri())?;
    let address = destination.require_address()?;
    let proxies = relay.proxies().resolve(destination.proxy_names())?;

    let (parts, body) = request.into_parts();
    let headers = outbound_headers(&parts.headers);
    relay.metrics().record_bandwidth(url.len() as u64, 0);

    match proxies.as_slice() {
        [] => {
            debug!("[{}] {} {}", relay.name(), parts.method, url);
            let start = Instant::now();
            let body = upload_body(relay, body);
            let (response, remote) =
                send(relay, relay.http_client(), &parts.method, &url, &headers, body, start).await?;
            let remote = remote.map_or(address, |addr| addr.to_string());
            Ok(Forwarded::Response(response, remote))
        }
        [proxy] => {
            debug!("[{}] {} {} through proxy {:?}", relay.name(), parts.method, url, proxy.name);
            let start = Instant::now();
            let client = proxied_client(proxy, relay.dial_options().timeout)?;
            let body = upload_body(relay, body);
            let (response, _) = send(relay, &client, &parts.method, &url, &headers, body, start).await?;
            Ok(Forwarded::Response(response, address))
        }
        _ => {
            // Replayed through each proxy, so it has to be held in memory
            let Some(bytes) = buffer_body(body, REPLAY_BODY_LIMIT).await? else {
                return Ok(Forwarded::TooLarge);
            };
            relay.metrics().record_bandwidth(bytes.len() as u64, 0);

            let start = Instant::now();
            for proxy in &proxies {
                debug!("[{}] {} {} through proxy {:?}", relay.name(), parts.method, url, proxy.name);

                let client = match proxied_client(proxy, relay.dial_options().timeout) {
                    Ok(client) => client,
                    Err(e) => {
                        warn!("[{}] Proxy {:?}: {}", relay.name(), proxy.name, e);
                        continue;
                    }
                };

                let body = reqwest::Body::from(bytes.clone());
                match send(relay, &client, &parts.method, &url, &headers, body, start).await {
                    Ok((response, _)) => return Ok(Forwarded::Response(response, address)),
                    Err(e) => {
                        warn!("[{}] Request through proxy {:?} failed: {}", relay.name(), proxy.name, e)
                    }
                }
            }

            Err(RelayError::Http(format!("every proxy failed for {}", url)))
        }
    }
}

/// Read a whole body, or `None` once it grows past `limit` bytes
async fn buffer_body(body: Body, limit: usize) -> Result<Option<Bytes>> {
    if body.size_hint().lower() > limit as u64 {
        return Ok(None);
    }

    let mut chunks = body.into_data_stream();
    let mut buffered = BytesMut::new();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(|e| RelayError::Http(e.to_string()))?;
        if buffered.len() + chunk.len() > limit {
            return Ok(None);
        }
        buffered.extend_from_slice(&chunk);
    }
    Ok(Some(buffered.freeze()))
}

/// Stream an inbound body upstream, counting each chunk as upload
///
/// Chunks cross a channel because the outbound body must be `Sync` and the
/// inbound one is not.
fn upload_body(relay: &Arc<Relay>, body: Body) -> reqwest::Body {
    if body.is_end_stream() {
        return reqwest::Body::from(Bytes::new());
    }

    let (mut tx, rx) = mpsc::channel::<Result<Bytes>>(UPLOAD_QUEUE);
    let metrics = Arc::clone(relay.metrics());
    tokio::spawn(async move {
        let mut chunks = body.into_data_stream();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(|e| RelayError::Http(e.to_string()));
            let failed = match &chunk {
                Ok(bytes) => {
                    metrics.record_bandwidth(bytes.len() as u64, 0);
                    false
                }
                Err(_) => true,
            };
            // The request was abandoned upstream
            if tx.send(chunk).await.is_err() || failed {
                break;
            }
        }
    });

    reqwest::Body::wrap_stream(rx)
}

async fn send(
    relay: &Arc<Relay>,
    client: &reqwest::Client,
    method: &Method,
    url: &str,
    headers: &HeaderMap,
    body: reqwest::Body,
    start: Instant,
) -> Result<(Response, Option<SocketAddr>)> {
    let upstream = match client
        .request(method.clone(), url)
        .headers(headers.clone())
        .body(body)
        .send()
        .await
    {
        Ok(upstream) => {
            relay.metrics().record_dial(1, 0, start);
            upstream
        }
        Err(e) => {
            relay.metrics().record_dial(0, 1, start);
            return Err(RelayError::Http(e.to_string()));
        }
    };

    let remote = upstream.remote_addr();
    let mut response = Response::builder().status(upstream.status());
    for (name, value) in upstream.headers() {
        if !SKIP_RESPONSE_HEADERS.contains(name) {
            response = response.header(name, value);
        }
    }

    let metrics = Arc::clone(relay.metrics());
    let stream = upstream.bytes_stream().map(move |chunk| {
        if let Ok(bytes) = &chunk {
            metrics.record_bandwidth(0, bytes.len() as u64);
        }
        chunk
    });

    let response = response
        .body(Body::from_stream(stream))
        .map_err(|e| RelayError::Http(e.to_string()))?;
    Ok((response, remote))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_url() {
        let destination = Endpoint::parse("http://127.0.0.1:8080").unwrap();
        let uri: Uri = "/foo?x=1".parse().unwrap();
        assert_eq!(
            outbound_url(&destination, &uri).unwrap(),
            "http://127.0.0.1:8080/foo?x=1"
        );

        let destination = Endpoint::parse("https://example.com").unwrap();
        let uri: Uri = "/".parse().unwrap();
        assert_eq!(outbound_url(&destination, &uri).unwrap(), "https://example.com:443/");
    }

    #[test]
    fn test_outbound_headers() {
        let mut inbound = HeaderMap::new();
        inbound.insert(header::HOST, "relay.local".parse().unwrap());
        inbound.insert(header::CONTENT_LENGTH, "3".parse().unwrap());
        inbound.insert("x-custom", "a".parse().unwrap());
        inbound.append("x-custom", "b".parse().unwrap());
        inbound.insert(header::USER_AGENT, "test".parse().unwrap());

        let headers = outbound_headers(&inbound);
        assert!(headers.get(header::HOST).is_none());
        assert!(headers.get(header::CONTENT_LENGTH).is_none());
        assert_eq!(headers.get_all("x-custom").iter().count(), 2);
        assert_eq!(headers.get(header::USER_AGENT).unwrap(), "test");
    }

    #[tokio::test]
    async fn test_buffer_body_limit() {
        let body = buffer_body(Body::from("hello"), 10).await.unwrap();
        assert_eq!(body.as_deref(), Some(&b"hello"[..]));

        // Rejected up front from the declared length
        assert!(buffer_body(Body::from(vec![0u8; 11]), 10).await.unwrap().is_none());

        // Rejected while reading when the length is unknown
        let chunks = futures::stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"123456")),
            Ok(Bytes::from_static(b"789012")),
        ]);
        assert!(buffer_body(Body::from_stream(chunks), 10).await.unwrap().is_none());
    }
}
