mod common;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use wiretap_proxy::intercept::InterceptorRegistry;

async fn read_to_end_or_close(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
        }
    }
    out
}

async fn read_until_double_crlf(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    while !out.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.expect("head read");
        assert!(n > 0, "stream closed before head finished");
        out.push(byte[0]);
    }
    out
}

#[tokio::test]
async fn get_passthrough_adds_via_and_relays_body() {
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();

    let origin_task = tokio::spawn(async move {
        let (mut sock, _) = origin.accept().await.unwrap();
        let head = read_until_double_crlf(&mut sock).await;
        let head = String::from_utf8(head).unwrap();
        sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
            .await
            .unwrap();
        head
    });

    let (_server, proxy_addr, _store) =
        common::start_proxy(|_| {}, InterceptorRegistry::new()).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let request = format!(
        "GET http://{origin_addr}/ HTTP/1.1\r\nHost: {origin_addr}\r\nConnection: close\r\n\r\n"
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let response = String::from_utf8(read_to_end_or_close(&mut client).await).unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response.ends_with("hello"), "{response}");

    let origin_head = origin_task.await.unwrap();
    assert!(origin_head.starts_with("GET / HTTP/1.1\r\n"), "{origin_head}");
    assert!(origin_head.contains("Via: 1.1 wiretap\r\n"), "{origin_head}");
}

#[tokio::test]
async fn chunked_response_is_reassembled() {
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut sock, _) = origin.accept().await.unwrap();
        read_until_double_crlf(&mut sock).await;
        sock.write_all(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n\
              5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        )
        .await
        .unwrap();
    });

    let (_server, proxy_addr, _store) =
        common::start_proxy(|_| {}, InterceptorRegistry::new()).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let request =
        format!("GET http://{origin_addr}/ HTTP/1.1\r\nHost: {origin_addr}\r\n\r\n");
    client.write_all(request.as_bytes()).await.unwrap();

    let response = String::from_utf8(read_to_end_or_close(&mut client).await).unwrap();
    assert!(response.contains("Transfer-Encoding: chunked"), "{response}");
    // Re-emitted as one chunk carrying the reassembled body.
    assert!(response.contains("b\r\nhello world\r\n0\r\n\r\n"), "{response}");
}

#[tokio::test]
async fn expect_continue_is_answered_then_body_forwarded() {
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();

    let origin_task = tokio::spawn(async move {
        let (mut sock, _) = origin.accept().await.unwrap();
        let head = String::from_utf8(read_until_double_crlf(&mut sock).await).unwrap();
        let mut body = [0u8; 3];
        sock.read_exact(&mut body).await.unwrap();
        sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
            .await
            .unwrap();
        (head, body.to_vec())
    });

    let (_server, proxy_addr, _store) =
        common::start_proxy(|_| {}, InterceptorRegistry::new()).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let request = format!(
        "POST http://{origin_addr}/upload HTTP/1.1\r\nHost: {origin_addr}\r\n\
         Expect: 100-continue\r\nContent-Length: 3\r\n\r\n"
    );
    client.write_all(request.as_bytes()).await.unwrap();

    // The interim response arrives before any body is sent.
    let interim = read_until_double_crlf(&mut client).await;
    assert_eq!(&interim[..], b"HTTP/1.1 100 Continue\r\n\r\n");

    client.write_all(b"abc").await.unwrap();
    let response = String::from_utf8(read_to_end_or_close(&mut client).await).unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response.ends_with("ok"), "{response}");

    let (head, body) = origin_task.await.unwrap();
    assert!(!head.contains("Expect"), "{head}");
    assert_eq!(body, b"abc");
}

#[tokio::test]
async fn keep_alive_serves_multiple_exchanges() {
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut sock, _) = origin.accept().await.unwrap();
        for body in [&b"one"[..], &b"two"[..]] {
            read_until_double_crlf(&mut sock).await;
            let reply = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len());
            sock.write_all(reply.as_bytes()).await.unwrap();
            sock.write_all(body).await.unwrap();
        }
    });

    let (_server, proxy_addr, _store) =
        common::start_proxy(|_| {}, InterceptorRegistry::new()).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    for expected in ["one", "two"] {
        let request =
            format!("GET http://{origin_addr}/ HTTP/1.1\r\nHost: {origin_addr}\r\n\r\n");
        client.write_all(request.as_bytes()).await.unwrap();

        let head = String::from_utf8(read_until_double_crlf(&mut client).await).unwrap();
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
        let mut body = [0u8; 3];
        client.read_exact(&mut body).await.unwrap();
        assert_eq!(body, expected.as_bytes());
    }
}

#[tokio::test]
async fn connect_with_non_tls_payload_downgrades_to_tunnel() {
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();

    let origin_task = tokio::spawn(async move {
        let (mut sock, _) = origin.accept().await.unwrap();
        let mut buf = [0u8; 7];
        sock.read_exact(&mut buf).await.unwrap();
        sock.write_all(b"RAW-OK").await.unwrap();
        buf.to_vec()
    });

    let (_server, proxy_addr, _store) =
        common::start_proxy(|_| {}, InterceptorRegistry::new()).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let connect = format!(
        "CONNECT {origin_addr} HTTP/1.1\r\nHost: {origin_addr}\r\n\r\n"
    );
    client.write_all(connect.as_bytes()).await.unwrap();
    let head = String::from_utf8(read_until_double_crlf(&mut client).await).unwrap();
    assert!(head.starts_with("HTTP/1.1 200 OK"), "{head}");

    // First byte 'G' is not a TLS record; the stream must flow verbatim.
    client.write_all(b"GOODBYE").await.unwrap();
    let mut reply = [0u8; 6];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"RAW-OK");

    assert_eq!(origin_task.await.unwrap(), b"GOODBYE");
}

#[tokio::test]
async fn unreachable_upstream_renders_bad_gateway_page() {
    // Bind then drop to find a port with nothing listening.
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = unused.local_addr().unwrap();
    drop(unused);

    let (_server, proxy_addr, _store) =
        common::start_proxy(|_| {}, InterceptorRegistry::new()).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let request = format!(
        "GET http://{dead_addr}/ HTTP/1.1\r\nHost: {dead_addr}\r\n\r\n"
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let response = String::from_utf8(read_to_end_or_close(&mut client).await).unwrap();
    assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{response}");
    assert!(response.contains("Connection: close\r\n"), "{response}");
    assert!(response.contains("Content-Type: text/html\r\n"), "{response}");
    assert!(response.contains("<h1>502 Bad Gateway</h1>"), "{response}");
}

#[tokio::test]
async fn connecting_back_to_the_proxy_is_refused() {
    let (_server, proxy_addr, _store) =
        common::start_proxy(|_| {}, InterceptorRegistry::new()).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let request = format!(
        "GET http://127.0.0.1:{port}/ HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n",
        port = proxy_addr.port()
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let response = String::from_utf8(read_to_end_or_close(&mut client).await).unwrap();
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{response}");
    assert!(response.contains("Refusing to connect"), "{response}");
}

#[tokio::test]
async fn interceptor_response_short_circuits_upstream() {
    use bytes::Bytes;
    use wiretap_proxy::http1::message::{HttpResponse, Status};
    use wiretap_proxy::intercept::HttpEvent;

    let mut registry = InterceptorRegistry::new();
    registry.attach_http(HttpEvent::Request, |_flow, exchange| {
        let mut response = HttpResponse {
            status: Status(418),
            ..HttpResponse::default()
        };
        response.body = Bytes::from_static(b"short and stout");
        response.headers.add("Connection", "close");
        response.set_content_length();
        exchange.set_response(response);
    });

    let (_server, proxy_addr, _store) = common::start_proxy(|_| {}, registry).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    // No origin exists; the interceptor must answer before any connect.
    client
        .write_all(b"GET http://192.0.2.1:9/ HTTP/1.1\r\nHost: 192.0.2.1:9\r\n\r\n")
        .await
        .unwrap();

    let response = String::from_utf8(read_to_end_or_close(&mut client).await).unwrap();
    assert!(response.starts_with("HTTP/1.1 418 I'm a teapot\r\n"), "{response}");
    assert!(response.ends_with("short and stout"), "{response}");
}
