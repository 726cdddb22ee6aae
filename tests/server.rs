use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use socket_hub::config::ServerConfig;
use socket_hub::error::Error;
use socket_hub::server::WebSocketServer;
use socket_hub::service::{EchoService, StaticServiceLoader};

// Masked "Hello", the RFC 6455 worked example.
const HELLO_FRAME: [u8; 11] = [
    0x81, 0x85, 0x37, 0xFA, 0x21, 0x3D, 0x7F, 0x9F, 0x4D, 0x51, 0x58,
];

const UPGRADE_REQUEST: &str = "GET /echo HTTP/1.1\r\n\
    Upgrade: websocket\r\n\
    Sec-WebSocket-Version: 13\r\n\
    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
    \r\n";

async fn start_server() -> (Arc<WebSocketServer>, SocketAddr, JoinHandle<Result<(), Error>>) {
    let config = ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        document_root: ".".into(),
    };
    let loader = StaticServiceLoader::new(".").register("echo.ws", || EchoService);
    let server = Arc::new(WebSocketServer::new(config, Box::new(loader)));

    let run_handle = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    let mut addr = None;
    for _ in 0..200 {
        if let Some(bound) = server.local_addr() {
            addr = Some(bound);
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    let addr = addr.expect("server did not bind in time");
    (server, addr, run_handle)
}

async fn read_response_headers(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    loop {
        let n = timeout(Duration::from_secs(2), stream.read(&mut tmp))
            .await
            .expect("response timed out")
            .expect("response read failed");
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&tmp[..n]);
        if buf.windows(4).any(|window| window == b"\r\n\r\n") {
            break;
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn upgraded_client(addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.expect("connect failed");
    stream
        .write_all(UPGRADE_REQUEST.as_bytes())
        .await
        .expect("request write failed");
    let response = read_response_headers(&mut stream).await;
    assert!(
        response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"),
        "unexpected response: {response}"
    );
    assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
    stream
}

fn masked_frame(payload: &[u8]) -> Vec<u8> {
    let mask: [u8; 4] = rand::random();
    assert!(payload.len() < 126, "fixture only builds short frames");
    let mut frame = vec![0x81, 0x80 | payload.len() as u8];
    frame.extend_from_slice(&mask);
    frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
    frame
}

async fn read_text_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut header = [0u8; 2];
    timeout(Duration::from_secs(2), stream.read_exact(&mut header))
        .await
        .expect("frame timed out")
        .expect("frame read failed");
    assert_eq!(header[0], 0x81);
    assert_eq!(header[1] & 0x80, 0, "server frames must not be masked");
    let mut payload = vec![0u8; (header[1] & 0x7F) as usize];
    timeout(Duration::from_secs(2), stream.read_exact(&mut payload))
        .await
        .expect("payload timed out")
        .expect("payload read failed");
    payload
}

#[tokio::test]
async fn echoes_masked_text_frames_in_order() {
    let (server, addr, run_handle) = start_server().await;
    let mut client = upgraded_client(addr).await;

    client.write_all(&HELLO_FRAME).await.unwrap();
    assert_eq!(read_text_frame(&mut client).await, b"Hello");

    // Two frames in one write must come back in wire order.
    let mut burst = masked_frame(b"first");
    burst.extend_from_slice(&masked_frame(b"second"));
    client.write_all(&burst).await.unwrap();
    assert_eq!(read_text_frame(&mut client).await, b"first");
    assert_eq!(read_text_frame(&mut client).await, b"second");

    server.shutdown_signal().set();
    timeout(Duration::from_secs(5), run_handle)
        .await
        .expect("shutdown timed out")
        .expect("server task panicked")
        .expect("server returned an error");
}

#[tokio::test]
async fn split_frame_reassembles() {
    let (server, addr, run_handle) = start_server().await;
    let mut client = upgraded_client(addr).await;

    client.write_all(&HELLO_FRAME[..4]).await.unwrap();
    client.flush().await.unwrap();
    sleep(Duration::from_millis(60)).await;
    client.write_all(&HELLO_FRAME[4..]).await.unwrap();

    assert_eq!(read_text_frame(&mut client).await, b"Hello");

    server.shutdown_signal().set();
    timeout(Duration::from_secs(5), run_handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn unmasked_frame_closes_the_connection() {
    let (server, addr, run_handle) = start_server().await;
    let mut client = upgraded_client(addr).await;

    // High bit of the length byte clear.
    client
        .write_all(&[0x81, 0x05, 0x48, 0x65, 0x6C, 0x6C, 0x6F])
        .await
        .unwrap();

    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("close timed out")
        .unwrap_or(0);
    assert_eq!(n, 0, "connection should be torn down, got {n} bytes");

    server.shutdown_signal().set();
    timeout(Duration::from_secs(5), run_handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn rejects_wrong_version_with_501() {
    let (server, addr, run_handle) = start_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = UPGRADE_REQUEST.replace("Sec-WebSocket-Version: 13", "Sec-WebSocket-Version: 8");
    stream.write_all(request.as_bytes()).await.unwrap();

    let response = read_response_headers(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 501 Not Implemented"));

    // The socket is closed right after the response.
    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("close timed out")
        .unwrap_or(0);
    assert_eq!(n, 0);

    server.shutdown_signal().set();
    timeout(Duration::from_secs(5), run_handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn unknown_path_gets_404() {
    let (server, addr, run_handle) = start_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = UPGRADE_REQUEST.replace("/echo", "/no_such_service");
    stream.write_all(request.as_bytes()).await.unwrap();

    let response = read_response_headers(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 404 Not Found"));

    server.shutdown_signal().set();
    timeout(Duration::from_secs(5), run_handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn shutdown_with_live_clients_is_orderly() {
    let (server, addr, run_handle) = start_server().await;
    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(upgraded_client(addr).await);
    }

    server.shutdown_signal().set();
    timeout(Duration::from_secs(5), run_handle)
        .await
        .expect("shutdown timed out")
        .expect("server task panicked")
        .expect("server returned an error");

    // Every client socket ends up closed once the server is down.
    for client in &mut clients {
        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("socket close timed out")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }
}
