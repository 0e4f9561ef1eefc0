//! HTTP and HTTPS relay tests

mod common;

use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Router;
use localrelay::config::defaults::REPLAY_BODY_LIMIT;
use localrelay::config::ListenOptions;
use localrelay::{Endpoint, ProxyDescriptor, ProxyRegistry, Relay, RelayError, RelayManager};
use openssl::asn1::Asn1Time;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::{X509Builder, X509NameBuilder};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use common::{refused_addr, socks5_server, wait_until};

/// Fake destination that describes the request it received
async fn describe(request: Request) -> impl IntoResponse {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX).await.unwrap();

    let mut headers: Vec<String> = parts
        .headers
        .iter()
        .filter(|(name, _)| name.as_str().starts_with("x-") || *name == "user-agent")
        .map(|(name, value)| format!("{}={}", name, value.to_str().unwrap()))
        .collect();
    headers.sort();

    (
        StatusCode::CREATED,
        [("x-destination", "yes")],
        format!(
            "{} {} [{}] {}",
            parts.method,
            parts.uri,
            headers.join(","),
            String::from_utf8_lossy(&body)
        ),
    )
}

async fn destination_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().fallback(describe);

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

fn http_relay(name: &str, destination: &str) -> Relay {
    Relay::new(
        name,
        Endpoint::parse("http://127.0.0.1:0").unwrap(),
        vec![Endpoint::parse(destination).unwrap()],
    )
    .unwrap()
}

fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

fn write_self_signed(dir: &Path) -> (PathBuf, PathBuf) {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, "localhost").unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(7).unwrap()).unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    let cert = builder.build();

    let cert_path = dir.join("relay.crt");
    let key_path = dir.join("relay.key");
    std::fs::write(&cert_path, cert.to_pem().unwrap()).unwrap();
    std::fs::write(&key_path, key.private_key_to_pem_pkcs8().unwrap()).unwrap();
    (cert_path, key_path)
}

#[tokio::test]
async fn test_get_is_forwarded_verbatim() {
    let destination = destination_server().await;
    let manager = RelayManager::new();
    let relay = manager
        .start(http_relay("web", &format!("http://{}", destination)))
        .await
        .unwrap();
    let addr = relay.local_addr().unwrap();

    let response = client()
        .get(format!("http://{}/foo?x=1", addr))
        .header("x-trace", "abc")
        .header("user-agent", "relay-test")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 201);
    assert_eq!(response.headers()["x-destination"], "yes");
    assert_eq!(
        response.text().await.unwrap(),
        "GET /foo?x=1 [user-agent=relay-test,x-trace=abc] "
    );

    assert_eq!(relay.metrics().requests(), 1);
    assert_eq!(relay.metrics().dialer(), (1, 0));

    manager.stop_all().await;
}

#[tokio::test]
async fn test_post_body_and_upload_accounting() {
    let destination = destination_server().await;
    let manager = RelayManager::new();
    let relay = manager
        .start(http_relay("upload", &format!("http://{}", destination)))
        .await
        .unwrap();
    let addr = relay.local_addr().unwrap();

    let response = client()
        .post(format!("http://{}/submit", addr))
        .body("payload")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let text = response.text().await.unwrap();
    assert!(text.starts_with("POST /submit"));
    assert!(text.ends_with(" payload"));

    let url = format!("http://{}/submit", destination);
    assert_eq!(relay.metrics().upload(), (url.len() + "payload".len()) as u64);
    assert!(wait_until(|| relay.metrics().download() == text.len() as u64).await);

    manager.stop_all().await;
}

#[tokio::test]
async fn test_unreachable_destination_is_bad_gateway() {
    let dead = refused_addr().await;
    let manager = RelayManager::new();
    let relay = manager
        .start(http_relay("gone", &format!("http://{}", dead)))
        .await
        .unwrap();

    let response = client()
        .get(format!("http://{}/", relay.local_addr().unwrap()))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 502);
    assert_eq!(relay.metrics().dialer(), (0, 1));

    manager.stop_all().await;
}

#[tokio::test]
async fn test_request_through_proxies() {
    let destination = destination_server().await;
    let proxy = socks5_server().await;
    let dead_proxy = refused_addr().await;

    let mut r = http_relay(
        "socks",
        &format!("http://{}?proxy=dead,live", destination),
    );
    r.set_proxies(
        ProxyRegistry::new([
            ProxyDescriptor::socks5("dead", &dead_proxy.to_string()),
            ProxyDescriptor::socks5("live", &proxy.to_string()),
        ])
        .unwrap(),
    );

    let manager = RelayManager::new();
    let relay = manager.start(r).await.unwrap();

    let response = client()
        .get(format!("http://{}/via", relay.local_addr().unwrap()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    assert!(response.text().await.unwrap().starts_with("GET /via"));
    assert_eq!(relay.metrics().dialer(), (1, 1));

    manager.stop_all().await;
}

#[tokio::test]
async fn test_https_termination() {
    let dir = tempfile::tempdir().unwrap();
    let (cert, key) = write_self_signed(dir.path());

    let destination = destination_server().await;
    let mut r = Relay::new(
        "secure",
        Endpoint::parse("https://127.0.0.1:0").unwrap(),
        vec![Endpoint::parse(&format!("http://{}", destination)).unwrap()],
    )
    .unwrap();
    r.set_tls(cert, key);

    let manager = RelayManager::new();
    let relay = manager.start(r).await.unwrap();

    let client = reqwest::Client::builder()
        .no_proxy()
        .danger_accept_invalid_certs(true)
        .build()
        .unwrap();
    let response = client
        .get(format!("https://{}/secure?y=2", relay.local_addr().unwrap()))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 201);
    assert!(response.text().await.unwrap().starts_with("GET /secure?y=2"));

    manager.stop_all().await;
}

#[tokio::test]
async fn test_https_without_certificate_fails_to_start() {
    let r = Relay::new(
        "nocert",
        Endpoint::parse("https://127.0.0.1:0").unwrap(),
        vec![Endpoint::parse("http://127.0.0.1:80").unwrap()],
    )
    .unwrap();

    let manager = RelayManager::new();
    assert!(matches!(manager.start(r).await, Err(RelayError::Config(_))));
    assert!(manager.names().is_empty());
}

#[tokio::test]
async fn test_large_upload_is_streamed() {
    let destination = destination_server().await;
    let manager = RelayManager::new();
    let relay = manager
        .start(http_relay("stream", &format!("http://{}", destination)))
        .await
        .unwrap();

    let payload = "a".repeat(256 * 1024);
    let response = client()
        .put(format!("http://{}/blob", relay.local_addr().unwrap()))
        .body(payload.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let text = response.text().await.unwrap();
    assert!(text.starts_with("PUT /blob"));
    assert!(text.ends_with(&payload));

    let url = format!("http://{}/blob", destination);
    assert_eq!(relay.metrics().upload(), (url.len() + payload.len()) as u64);

    manager.stop_all().await;
}

#[tokio::test]
async fn test_body_replayed_through_proxies() {
    let destination = destination_server().await;
    let proxy = socks5_server().await;
    let dead_proxy = refused_addr().await;

    let mut r = http_relay(
        "replay",
        &format!("http://{}?proxy=dead,live", destination),
    );
    r.set_proxies(
        ProxyRegistry::new([
            ProxyDescriptor::socks5("dead", &dead_proxy.to_string()),
            ProxyDescriptor::socks5("live", &proxy.to_string()),
        ])
        .unwrap(),
    );

    let manager = RelayManager::new();
    let relay = manager.start(r).await.unwrap();

    let response = client()
        .post(format!("http://{}/again", relay.local_addr().unwrap()))
        .body("second try")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let text = response.text().await.unwrap();
    assert!(text.starts_with("POST /again"));
    assert!(text.ends_with(" second try"));
    assert_eq!(relay.metrics().dialer(), (1, 1));

    manager.stop_all().await;
}

#[tokio::test]
async fn test_pooled_connection_records_destination() {
    let destination = destination_server().await;
    let manager = RelayManager::new();
    let relay = manager
        .start(http_relay("pooled", &format!("http://{}", destination)))
        .await
        .unwrap();

    // Kept alive so the relayed connection stays pooled
    let client = client();
    let response = client
        .get(format!("http://{}/", relay.local_addr().unwrap()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    response.text().await.unwrap();

    let connections = manager.connections();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].relay, "pooled");
    assert_eq!(
        connections[0].forwarded.as_deref(),
        Some(destination.to_string().as_str())
    );

    manager.stop_all().await;
}

#[tokio::test]
async fn test_slow_request_headers_time_out() {
    let mut r = http_relay("slow", "http://127.0.0.1:80");
    r.set_listen_options(ListenOptions {
        http_header_timeout: Duration::from_millis(200),
        ..ListenOptions::default()
    });

    let manager = RelayManager::new();
    let relay = manager.start(r).await.unwrap();

    let mut client = TcpStream::connect(relay.local_addr().unwrap()).await.unwrap();
    client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

    let mut rest = Vec::new();
    let _ = timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
        .await
        .expect("relay should close a connection that stalls in its headers");

    assert!(wait_until(|| relay.connections().is_empty()).await);
    assert_eq!(relay.metrics().requests(), 0);

    manager.stop_all().await;
}

#[tokio::test]
async fn test_oversized_replay_body_is_rejected() {
    let first = refused_addr().await;
    let second = refused_addr().await;

    let mut r = http_relay("big", "http://127.0.0.1:80?proxy=first,second");
    r.set_proxies(
        ProxyRegistry::new([
            ProxyDescriptor::socks5("first", &first.to_string()),
            ProxyDescriptor::socks5("second", &second.to_string()),
        ])
        .unwrap(),
    );

    let manager = RelayManager::new();
    let relay = manager.start(r).await.unwrap();

    // Declared length alone is enough, nothing is dialed
    let mut client = TcpStream::connect(relay.local_addr().unwrap()).await.unwrap();
    let head = format!(
        "POST /upload HTTP/1.1\r\nHost: relay\r\nContent-Length: {}\r\n\r\n",
        REPLAY_BODY_LIMIT + 1
    );
    client.write_all(head.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    let mut buf = [0u8; 1024];
    let read = async {
        while !response.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = client.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            response.extend_from_slice(&buf[..n]);
        }
    };
    timeout(Duration::from_secs(5), read).await.unwrap();

    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 413"));
    assert_eq!(relay.metrics().dialer(), (0, 0));

    manager.stop_all().await;
}
