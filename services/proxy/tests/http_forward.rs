
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use gacha_proxy::{Event, Outcome};
use harness::{dead_port, HttpOrigin, ProxyHandle, StaticResolver};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const ORIGIN_RESPONSE: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Origin: yes\r\nConnection: close\r\n\r\nhello";

/// Send `request` through the proxy and return everything it answers.
async fn roundtrip(proxy_addr: SocketAddr, request: &[u8]) -> String {
    timeout(TEST_TIMEOUT, async {
        let mut stream = TcpStream::connect(proxy_addr).await?;
        stream.write_all(request).await?;
        stream.flush().await?;

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;
        Ok::<_, std::io::Error>(String::from_utf8_lossy(&response).to_string())
    })
    .await
    .expect("timeout")
    .expect("roundtrip through proxy")
}

async fn spawn_proxy() -> ProxyHandle {
    ProxyHandle::spawn(443, Arc::new(StaticResolver::default()))
        .await
        .unwrap()
}

#[tokio::test]
async fn get_request_is_forwarded_and_relayed() {
    let origin = HttpOrigin::spawn(ORIGIN_RESPONSE).await.unwrap();
    let proxy = spawn_proxy().await;
    let host = format!("127.0.0.1:{}", origin.addr.port());

    let request = format!(
        "GET /hello?x=1 HTTP/1.1\r\nHost: {}\r\nUser-Agent: gacha-test\r\n\r\n",
        host
    );
    let response = roundtrip(proxy.listen_addr, request.as_bytes()).await;

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
    assert!(response.contains("x-origin: yes\r\n"), "{}", response);
    assert!(response.contains("content-length: 5\r\n"), "{}", response);
    assert!(response.contains("connection: close\r\n"), "{}", response);
    assert!(response.ends_with("\r\n\r\nhello"), "{}", response);

    let seen = origin.requests();
    assert_eq!(seen.len(), 1);
    let head = seen[0].head.to_ascii_lowercase();
    assert!(head.starts_with("get /hello?x=1 http/1.1\r\n"), "{}", head);
    assert!(head.contains("user-agent: gacha-test\r\n"), "{}", head);
    assert!(seen[0].body.is_empty());

    let entries = timeout(TEST_TIMEOUT, proxy.access_log.wait_for(1))
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.status, 200);
    assert_eq!(entry.event, Event::Request);
    assert_eq!(entry.target, format!("http://{}/hello?x=1", host));
    assert_eq!(entry.outcome, Outcome::HttpDirect("GET".to_string()));
    assert!(entry.to_string().contains(" HTTP/200 REQUEST "));
    assert!(entry.to_string().ends_with(" - HTTP_DIRECT/GET"));

    assert_eq!(proxy.stats.http_forwarded.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn large_response_body_is_streamed_through() {
    const BODY_LEN: usize = 512 * 1024;

    let mut response =
        format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", BODY_LEN).into_bytes();
    let body: Vec<u8> = (0..BODY_LEN).map(|i| (i % 251) as u8).collect();
    response.extend_from_slice(&body);

    let origin = HttpOrigin::spawn(response.leak()).await.unwrap();
    let proxy = spawn_proxy().await;

    let request = format!("GET /big HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n", origin.addr.port());
    let relayed = timeout(TEST_TIMEOUT, async {
        let mut stream = TcpStream::connect(proxy.listen_addr).await?;
        stream.write_all(request.as_bytes()).await?;

        let mut relayed = Vec::new();
        stream.read_to_end(&mut relayed).await?;
        Ok::<_, std::io::Error>(relayed)
    })
    .await
    .expect("timeout")
    .expect("roundtrip through proxy");

    let head_end = relayed
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response head")
        + 4;
    let head = String::from_utf8_lossy(&relayed[..head_end]).to_string();
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{}", head);
    assert!(head.contains(&format!("content-length: {}\r\n", BODY_LEN)), "{}", head);
    assert_eq!(relayed[head_end..].len(), BODY_LEN);
    assert!(relayed[head_end..] == body[..]);
}

#[tokio::test]
async fn response_without_length_is_delimited_by_close() {
    let origin = HttpOrigin::spawn(b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\nuntil the end")
        .await
        .unwrap();
    let proxy = spawn_proxy().await;

    let request = format!("GET / HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n", origin.addr.port());
    let response = roundtrip(proxy.listen_addr, request.as_bytes()).await;

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
    assert!(!response.contains("content-length"), "{}", response);
    assert!(response.ends_with("connection: close\r\n\r\nuntil the end"), "{}", response);
}

#[tokio::test]
async fn post_body_is_forwarded() {
    let origin = HttpOrigin::spawn(ORIGIN_RESPONSE).await.unwrap();
    let proxy = spawn_proxy().await;

    let request = format!(
        "POST /submit HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nContent-Type: text/plain\r\nContent-Length: 11\r\n\r\nhello world",
        origin.addr.port()
    );
    let response = roundtrip(proxy.listen_addr, request.as_bytes()).await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);

    let seen = origin.requests();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].head.to_ascii_lowercase().starts_with("post /submit http/1.1\r\n"));
    assert_eq!(seen[0].body, b"hello world");

    let entries = timeout(TEST_TIMEOUT, proxy.access_log.wait_for(1))
        .await
        .unwrap();
    assert_eq!(entries[0].outcome, Outcome::HttpDirect("POST".to_string()));
}

#[tokio::test]
async fn unreachable_upstream_answers_bad_gateway() {
    let port = dead_port().await;
    let proxy = spawn_proxy().await;

    let request = format!("GET / HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n", port);
    let response = roundtrip(proxy.listen_addr, request.as_bytes()).await;
    assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{}", response);

    let entries = timeout(TEST_TIMEOUT, proxy.access_log.wait_for(1))
        .await
        .unwrap();
    let entry = &entries[0];
    assert_eq!(entry.status, 502);
    assert_eq!(entry.target, format!("http://127.0.0.1:{}/", port));
    assert_eq!(entry.outcome, Outcome::HttpFail("upstream_failed".to_string()));
    assert!(entry.to_string().ends_with(" - HTTP_FAIL/upstream_failed"));

    assert_eq!(proxy.stats.http_failed.load(Ordering::Relaxed), 1);
    assert_eq!(proxy.stats.http_forwarded.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn request_without_host_is_rejected() {
    let proxy = spawn_proxy().await;

    let response = roundtrip(proxy.listen_addr, b"GET /x HTTP/1.1\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{}", response);

    let entries = timeout(TEST_TIMEOUT, proxy.access_log.wait_for(1))
        .await
        .unwrap();
    let entry = &entries[0];
    assert_eq!(entry.status, 400);
    assert_eq!(entry.target, "/x");
    assert_eq!(entry.outcome, Outcome::HttpFail("missing_host".to_string()));
}

#[tokio::test]
async fn garbled_request_is_rejected() {
    let proxy = spawn_proxy().await;

    let response = timeout(TEST_TIMEOUT, async {
        let mut stream = TcpStream::connect(proxy.listen_addr).await.unwrap();
        stream.write_all(b"GET\x00 nonsense\r\n\r\n").await.unwrap();
        let mut response = Vec::new();
        let _ = stream.read_to_end(&mut response).await;
        String::from_utf8_lossy(&response).to_string()
    })
    .await
    .expect("timeout");
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{}", response);

    let entries = timeout(TEST_TIMEOUT, proxy.access_log.wait_for(1))
        .await
        .unwrap();
    assert_eq!(entries[0].target, "-");
    assert_eq!(entries[0].outcome, Outcome::HttpFail("malformed_request".to_string()));
}
