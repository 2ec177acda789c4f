#![cfg(test)]
#![allow(dead_code)]

use netgauge::locator::{TargetUrls, TestLocation, TestServer};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::WebSocketStream;

pub type ServerWs = WebSocketStream<TcpStream>;

/// Bind an ephemeral listener, accept one WebSocket connection (echoing the
/// NDT7 subprotocol), and hand the stream to `handler`.
pub async fn spawn_ws_server<F, Fut>(handler: F) -> (SocketAddr, JoinHandle<()>)
where
    F: FnOnce(ServerWs) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("ephemeral addr");
    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let ws = accept_hdr_async(stream, |request: &Request, mut response: Response| {
            assert!(
                request.headers().get("sec-websocket-protocol").is_some(),
                "client must announce the ndt7 subprotocol"
            );
            response.headers_mut().insert(
                "sec-websocket-protocol",
                "net.measurementlab.ndt.v7".parse().expect("header value"),
            );
            Ok(response)
        })
        .await
        .expect("websocket accept");
        handler(ws).await;
    });
    (addr, handle)
}

/// Accept one TCP connection and drop it before any handshake completes.
pub async fn spawn_reset_server() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("ephemeral addr");
    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        drop(stream);
    });
    (addr, handle)
}

pub fn ws_url(addr: SocketAddr, phase: &str) -> String {
    format!("ws://{addr}/ndt/v7/{phase}")
}

/// Minimal NDT7 measurement frame as the server would emit it.
pub fn measurement_json(num_bytes: i64, elapsed_us: i64) -> String {
    serde_json::json!({
        "AppInfo": { "NumBytes": num_bytes, "ElapsedTime": elapsed_us },
        "Origin": "server",
        "Test": "download"
    })
    .to_string()
}

/// Serve one raw HTTP response on an ephemeral port and close.
pub async fn spawn_locator(status: u16, body: String) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("ephemeral addr");
    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let read = stream.read(&mut buf).await.unwrap_or(0);
            if read == 0 {
                break;
            }
            head.extend_from_slice(&buf[..read]);
            if head.windows(4).any(|window| window == b"\r\n\r\n") {
                break;
            }
        }
        let reason = match status {
            200 => "OK",
            429 => "Too Many Requests",
            _ => "Error",
        };
        let response = format!(
            "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        let _ = stream.write_all(response.as_bytes()).await;
        let _ = stream.shutdown().await;
    });
    (format!("http://{addr}/v2/nearest/ndt/ndt7"), handle)
}

/// Locate v2 response body for a list of `(machine, download_url, upload_url)`.
pub fn locate_body(servers: &[(&str, &str, &str)]) -> String {
    let results: Vec<serde_json::Value> = servers
        .iter()
        .map(|(machine, download, upload)| {
            serde_json::json!({
                "machine": machine,
                "location": { "city": "Test City", "country": "ZZ" },
                "urls": {
                    "ws:///ndt/v7/download": download,
                    "ws:///ndt/v7/upload": upload
                }
            })
        })
        .collect();
    serde_json::json!({ "results": results }).to_string()
}

/// Hand-built server record for driver tests that never touch the network.
pub fn test_server(machine: &str, download: Option<&str>, upload: Option<&str>) -> TestServer {
    TestServer {
        machine: machine.to_string(),
        location: TestLocation::default(),
        urls: TargetUrls {
            download_secure: download.map(str::to_string),
            upload_secure: upload.map(str::to_string),
            download_insecure: None,
            upload_insecure: None,
        },
    }
}
