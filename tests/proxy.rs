//! End-to-end exercises over real sockets: a stub origin on one side, a raw
//! TCP client on the other, the proxy in between.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use tollbooth::auth::StaticUserAuthenticator;
use tollbooth::chain::StaticChainManager;
use tollbooth::filter::RequestFilter;
use tollbooth::http1::{HttpRequest, HttpResponse};
use tollbooth::proxy::{Proxy, ProxyContext};
use tollbooth::tracker::{ActivityTracker, FlowContext};

async fn start_proxy(ctx: ProxyContext) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let proxy = Proxy::with_context(addr.to_string(), Arc::new(ctx));
    tokio::spawn(async move {
        let _ = proxy.serve(listener).await;
    });
    addr
}

/// Stub origin: answers `canned` to every request on a connection, sending
/// each received head over `heads`.
async fn start_origin(
    canned: &'static str,
    heads: mpsc::UnboundedSender<String>,
) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();
    tokio::spawn(async move {
        loop {
            let (mut sock, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let heads = heads.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut tmp = [0u8; 4096];
                loop {
                    let head_end = loop {
                        if let Some(pos) = find(&buf, b"\r\n\r\n") {
                            break pos + 4;
                        }
                        match sock.read(&mut tmp).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&tmp[..n]),
                        }
                    };
                    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
                    buf.drain(..head_end);
                    let _ = heads.send(head);
                    if sock.write_all(canned.as_bytes()).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    (addr, connections)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Read one response with a `Content-Length` body off the stream.
async fn read_response(sock: &mut TcpStream) -> (String, Vec<u8>) {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        let n = sock.read(&mut tmp).await.unwrap();
        assert!(n > 0, "connection closed before response head");
        buf.extend_from_slice(&tmp[..n]);
    };
    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let length: usize = head
        .lines()
        .find_map(|l| {
            let (name, value) = l.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse().ok())?
        })
        .unwrap_or(0);
    let mut body = buf[head_end..].to_vec();
    while body.len() < length {
        let n = sock.read(&mut tmp).await.unwrap();
        assert!(n > 0, "connection closed mid-body");
        body.extend_from_slice(&tmp[..n]);
    }
    body.truncate(length);
    (head, body)
}

#[tokio::test]
async fn forwards_simple_get_with_rewritten_headers() {
    let (head_tx, mut head_rx) = mpsc::unbounded_channel();
    let (origin, _) = start_origin("HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK", head_tx).await;
    let proxy = start_proxy(ProxyContext::new().unwrap()).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(
            format!(
                "GET http://{origin}/a HTTP/1.1\r\nHost: {origin}\r\nProxy-Connection: keep-alive\r\n\r\n"
            )
            .as_bytes(),
        )
        .await
        .unwrap();

    let (head, body) = read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head: {head}");
    assert!(head.contains("Via: 1.1 tollbooth"), "head: {head}");
    assert!(head.to_lowercase().contains("\r\ndate:"), "head: {head}");
    assert_eq!(body, b"OK");

    let upstream_head = head_rx.recv().await.unwrap();
    assert!(
        upstream_head.starts_with("GET /a HTTP/1.1\r\n"),
        "upstream: {upstream_head}"
    );
    assert!(upstream_head.contains("Connection: keep-alive"));
    assert!(upstream_head.contains("Via: 1.1 tollbooth"));
    assert!(!upstream_head.to_lowercase().contains("proxy-connection"));
}

#[tokio::test]
async fn keep_alive_requests_reuse_the_upstream_connection() {
    let (head_tx, mut head_rx) = mpsc::unbounded_channel();
    let (origin, connections) =
        start_origin("HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK", head_tx).await;
    let proxy = start_proxy(ProxyContext::new().unwrap()).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    for path in ["/first", "/second"] {
        client
            .write_all(
                format!("GET http://{origin}{path} HTTP/1.1\r\nHost: {origin}\r\n\r\n").as_bytes(),
            )
            .await
            .unwrap();
        let (head, body) = read_response(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 200"));
        assert_eq!(body, b"OK");
        assert!(head_rx.recv().await.unwrap().contains(path));
    }

    assert_eq!(connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn missing_credentials_get_407_then_retry_succeeds() {
    let (head_tx, mut head_rx) = mpsc::unbounded_channel();
    let (origin, _) = start_origin("HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK", head_tx).await;
    let mut ctx = ProxyContext::new().unwrap();
    ctx.authenticator = Some(Arc::new(StaticUserAuthenticator::new(
        [("user".to_string(), "pass".to_string())].into_iter().collect(),
    )));
    let proxy = start_proxy(ctx).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(format!("GET http://{origin}/a HTTP/1.1\r\nHost: {origin}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let (head, body) = read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 407 Proxy Authentication Required\r\n"));
    assert!(head.contains("Proxy-Authenticate: Basic realm=\"Restricted Files\""));
    assert!(head.contains("Content-Type: text/html; charset=UTF-8"));
    assert!(String::from_utf8_lossy(&body).contains("Proxy Authentication Required"));

    // Same connection, now with credentials (user:pass).
    client
        .write_all(
            format!(
                "GET http://{origin}/a HTTP/1.1\r\nHost: {origin}\r\nProxy-Authorization: Basic dXNlcjpwYXNz\r\n\r\n"
            )
            .as_bytes(),
        )
        .await
        .unwrap();
    let (head, body) = read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"));
    assert_eq!(body, b"OK");

    let upstream_head = head_rx.recv().await.unwrap();
    assert!(!upstream_head.to_lowercase().contains("proxy-authorization"));
}

#[tokio::test]
async fn connect_tunnels_raw_bytes_both_ways() {
    // Echo origin: whatever arrives goes straight back.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut sock, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                while let Ok(n) = sock.read(&mut buf).await {
                    if n == 0 || sock.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    let proxy = start_proxy(ProxyContext::new().unwrap()).await;
    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(format!("CONNECT {origin} HTTP/1.1\r\nHost: {origin}\r\n\r\n").as_bytes())
        .await
        .unwrap();

    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    let head_end = loop {
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        let n = client.read(&mut tmp).await.unwrap();
        assert!(n > 0);
        buf.extend_from_slice(&tmp[..n]);
    };
    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    assert!(head.starts_with("HTTP/1.1 200"), "head: {head}");
    assert!(head.contains("Proxy-Connection: Keep-Alive"));
    assert!(head.contains("Via: 1.1 tollbooth"));

    // Not HTTP: the tunnel must pass arbitrary bytes verbatim.
    client.write_all(b"\x00\x01binary\xff").await.unwrap();
    let mut echoed = [0u8; 9];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"\x00\x01binary\xff");
}

#[tokio::test]
async fn chunked_http10_response_is_upgraded_and_reframed() {
    let (head_tx, _head_rx) = mpsc::unbounded_channel();
    let (origin, _) = start_origin(
        "HTTP/1.0 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        head_tx,
    )
    .await;
    let proxy = start_proxy(ProxyContext::new().unwrap()).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(
            format!(
                "GET http://{origin}/a HTTP/1.1\r\nHost: {origin}\r\nConnection: close\r\n\r\n"
            )
            .as_bytes(),
        )
        .await
        .unwrap();

    // Connection: close on the request, so read to EOF.
    let mut raw = Vec::new();
    client.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {text}");
    assert!(text.contains("Transfer-Encoding: chunked"));
    assert!(text.contains("5\r\nhello\r\n"));
    assert!(text.contains("6\r\n world\r\n"));
    assert!(text.trim_end().ends_with("0"), "got: {text}");
}

#[derive(Default)]
struct CountingTracker {
    requests_sent: AtomicUsize,
    responses: AtomicUsize,
}

impl ActivityTracker for CountingTracker {
    fn request_sent(&self, _context: &FlowContext, _request: &HttpRequest) {
        self.requests_sent.fetch_add(1, Ordering::SeqCst);
    }

    fn response_received(&self, _context: &FlowContext, _response: &HttpResponse) {
        self.responses.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn chained_proxy_failure_falls_back_to_direct() {
    let (head_tx, mut head_rx) = mpsc::unbounded_channel();
    let (origin, _) = start_origin("HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK", head_tx).await;

    // A port with nothing listening: grab one and release it.
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let tracker = Arc::new(CountingTracker::default());
    let mut ctx = ProxyContext::new().unwrap();
    ctx.chain = Some(Arc::new(StaticChainManager::new(dead_addr.to_string(), true)));
    ctx.recorder = tollbooth::tracker::ActivityRecorder::new(vec![tracker.clone()]);
    let proxy = start_proxy(ctx).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(format!("GET http://{origin}/a HTTP/1.1\r\nHost: {origin}\r\n\r\n").as_bytes())
        .await
        .unwrap();

    let (head, body) = read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"), "head: {head}");
    assert_eq!(body, b"OK");

    // Exactly one request reached an origin, and exactly one send was
    // tracked despite the retry.
    let upstream_head = head_rx.recv().await.unwrap();
    // The request was rewritten for the chained hop, so the fallback sends
    // the absolute-form URI; servers are required to accept it.
    assert!(upstream_head.starts_with("GET "), "upstream: {upstream_head}");
    assert!(upstream_head.contains("/a"), "upstream: {upstream_head}");
    assert_eq!(tracker.requests_sent.load(Ordering::SeqCst), 1);
    assert_eq!(tracker.responses.load(Ordering::SeqCst), 1);
    assert!(head_rx.try_recv().is_err());
}

#[tokio::test]
async fn request_without_authority_gets_502() {
    let proxy = start_proxy(ProxyContext::new().unwrap()).await;
    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(b"GET /nowhere HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    let (head, body) = read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
    assert!(head.contains("Connection: close"));
    assert_eq!(body, b"Bad Gateway: /nowhere");
    // And the connection closes.
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

struct Blocklist;

impl RequestFilter for Blocklist {
    fn filter(&self, request: &mut HttpRequest) -> Option<(HttpResponse, Bytes)> {
        if request.uri.starts_with("/blocked") {
            let response = HttpResponse::new(403, "Forbidden");
            return Some((response, Bytes::from_static(b"blocked by policy")));
        }
        None
    }
}

#[tokio::test]
async fn mitm_interception_sees_decrypted_requests() {
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};

    // TLS origin with a self-signed certificate for 127.0.0.1.
    let mut params = rcgen::CertificateParams::default();
    params.subject_alt_names = vec![rcgen::SanType::IpAddress("127.0.0.1".parse().unwrap())];
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let origin_cert = rcgen::Certificate::from_params(params).unwrap();
    let origin_der = CertificateDer::from(origin_cert.serialize_der().unwrap());
    let origin_key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        origin_cert.serialize_private_key_der(),
    ));

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![origin_der.clone()], origin_key)
        .unwrap();
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin = listener.local_addr().unwrap();
    let (head_tx, mut head_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Ok((sock, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            let head_tx = head_tx.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(sock).await else {
                    return;
                };
                let mut buf = Vec::new();
                let mut tmp = [0u8; 4096];
                loop {
                    if let Some(pos) = find(&buf, b"\r\n\r\n") {
                        let _ = head_tx.send(String::from_utf8_lossy(&buf[..pos + 4]).to_string());
                        break;
                    }
                    match tls.read(&mut tmp).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&tmp[..n]),
                    }
                }
                let _ = tls
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nsecret")
                    .await;
            });
        }
    });

    // Proxy trusts the origin's cert; a fresh interception CA signs leaves.
    let mut ctx = ProxyContext::new().unwrap();
    let mut upstream_roots = rustls::RootCertStore::empty();
    upstream_roots.add(origin_der).unwrap();
    ctx.upstream_tls = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(upstream_roots)
            .with_no_client_auth(),
    );
    let mitm = Arc::new(tollbooth::tls::MitmAuthority::generate().unwrap());
    ctx.mitm = Some(mitm.clone());
    let proxy = start_proxy(ctx).await;

    // CONNECT, then speak TLS with the proxy's minted leaf.
    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(format!("CONNECT {origin} HTTP/1.1\r\nHost: {origin}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let (head, _) = read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"), "head: {head}");

    let mut client_roots = rustls::RootCertStore::empty();
    client_roots.add(mitm.ca_cert_der()).unwrap();
    let client_config = rustls::ClientConfig::builder()
        .with_root_certificates(client_roots)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));
    let name = ServerName::try_from("127.0.0.1").unwrap();
    let mut tls = connector.connect(name, client).await.unwrap();

    tls.write_all(b"GET /secret HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n")
        .await
        .unwrap();
    let mut raw = Vec::new();
    let mut tmp = [0u8; 4096];
    loop {
        let n = tls.read(&mut tmp).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&tmp[..n]);
        if raw.ends_with(b"secret") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {text}");
    assert!(text.contains("Via: 1.1 tollbooth"), "got: {text}");
    assert!(text.ends_with("secret"), "got: {text}");

    // The proxy saw the decrypted request and stamped it.
    let upstream_head = head_rx.recv().await.unwrap();
    assert!(upstream_head.starts_with("GET /secret HTTP/1.1\r\n"));
    assert!(upstream_head.contains("Via: 1.1 tollbooth"));
}

#[tokio::test]
async fn request_filter_can_answer_directly() {
    let (head_tx, mut head_rx) = mpsc::unbounded_channel();
    let (origin, _) = start_origin("HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK", head_tx).await;
    let mut ctx = ProxyContext::new().unwrap();
    ctx.request_filter = Some(Arc::new(Blocklist));
    let proxy = start_proxy(ctx).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(
            format!("GET http://{origin}/blocked HTTP/1.1\r\nHost: {origin}\r\n\r\n").as_bytes(),
        )
        .await
        .unwrap();
    let (head, body) = read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 403 Forbidden\r\n"));
    assert_eq!(body, b"blocked by policy");

    // The origin never saw it; the same connection still proxies.
    client
        .write_all(format!("GET http://{origin}/ok HTTP/1.1\r\nHost: {origin}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let (head, _) = read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"));
    assert!(head_rx.recv().await.unwrap().contains("/ok"));
}
