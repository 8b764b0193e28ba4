use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use fleetproxy::Proxy;

const TEST_TIMEOUT: Duration = Duration::from_secs(3);

fn spawn_proxy(proxy: Proxy) -> SocketAddr {
    let listener = proxy.bind().unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(proxy.serve(listener));
    addr
}

/// Mock origin that echoes every byte back
async fn spawn_echo_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    if socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_connect_tunnel_roundtrip() {
    let origin_addr = spawn_echo_origin().await;
    let proxy = Proxy::new("127.0.0.1", 0).timeout(Duration::from_secs(2));
    let addr = spawn_proxy(proxy);

    let mut client = TcpStream::connect(addr).await.unwrap();
    let connect_request = format!(
        "CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n",
        port = origin_addr.port()
    );
    client.write_all(connect_request.as_bytes()).await.unwrap();

    let mut established = [0u8; 39];
    timeout(TEST_TIMEOUT, client.read_exact(&mut established))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&established[..], b"HTTP/1.1 200 Connection Established\r\n\r\n");

    // octets flow verbatim in both directions
    let mut buf = [0u8; 1024];
    client.write_all(b"Hello, world!").await.unwrap();
    let n = timeout(TEST_TIMEOUT, client.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"Hello, world!");

    client.write_all(&[0x00, 0xff, 0x13, 0x37]).await.unwrap();
    let n = timeout(TEST_TIMEOUT, client.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], [0x00, 0xff, 0x13, 0x37]);
}

#[tokio::test]
async fn test_connect_to_unreachable_origin_gets_502() {
    // bind then drop, so the port is very likely refused
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let proxy = Proxy::new("127.0.0.1", 0).timeout(Duration::from_secs(2));
    let addr = spawn_proxy(proxy);

    let mut client = TcpStream::connect(addr).await.unwrap();
    let connect_request = format!(
        "CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n",
        dead_addr.port()
    );
    client.write_all(connect_request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    timeout(TEST_TIMEOUT, client.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        response,
        b"HTTP/1.1 502 Bad Gateway\r\nConnection: close\r\n\r\n"
    );
}

#[tokio::test]
async fn test_connect_without_target_gets_400() {
    let proxy = Proxy::new("127.0.0.1", 0).timeout(Duration::from_secs(2));
    let addr = spawn_proxy(proxy);

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"CONNECT\r\n\r\n").await.unwrap();

    let mut response = Vec::new();
    timeout(TEST_TIMEOUT, client.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        response,
        b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n"
    );
}

#[tokio::test]
async fn test_tunnel_closes_when_origin_closes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        // accept one tunnel, send a parting word, close
        if let Ok((mut socket, _)) = listener.accept().await {
            let _ = socket.write_all(b"bye").await;
        }
    });

    let proxy = Proxy::new("127.0.0.1", 0).timeout(Duration::from_secs(2));
    let addr = spawn_proxy(proxy);

    let mut client = TcpStream::connect(addr).await.unwrap();
    let connect_request = format!(
        "CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n",
        origin_addr.port()
    );
    client.write_all(connect_request.as_bytes()).await.unwrap();

    let mut established = [0u8; 39];
    timeout(TEST_TIMEOUT, client.read_exact(&mut established))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&established[..], b"HTTP/1.1 200 Connection Established\r\n\r\n");

    let mut rest = Vec::new();
    timeout(TEST_TIMEOUT, client.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rest, b"bye");
}
