//! In-process dashboard server for session tests
//!
//! Accepts WebSocket upgrades on a loopback port and hands each accepted
//! connection to the test, together with the request URI the client used.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use url::Url;

pub const WAIT: Duration = Duration::from_secs(5);

/// Await `future`, failing the test after [`WAIT`]
pub async fn within<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("timed out waiting")
}

pub struct MockDashboardServer {
    addr: SocketAddr,
    connections: mpsc::UnboundedReceiver<MockConnection>,
    task: JoinHandle<()>,
}

impl MockDashboardServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, connections) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let mut uri = String::new();
                let callback =
                    |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                        uri = request.uri().to_string();
                        Ok(response)
                    };

                let accepted = accept_hdr_async(stream, callback).await;
                if let Ok(socket) = accepted {
                    if tx.send(MockConnection { uri, socket }).is_err() {
                        break;
                    }
                }
            }
        });

        Self {
            addr,
            connections,
            task,
        }
    }

    /// Base URL as a dashboard user would enter it
    pub fn url(&self) -> Url {
        format!("http://{}", self.addr).parse().unwrap()
    }

    pub async fn accept(&mut self) -> MockConnection {
        within(self.connections.recv())
            .await
            .expect("server stopped")
    }

    /// Next connection, if one arrives within `wait`
    pub async fn accept_within(&mut self, wait: Duration) -> Option<MockConnection> {
        tokio::time::timeout(wait, self.connections.recv())
            .await
            .ok()
            .flatten()
    }
}

impl Drop for MockDashboardServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct MockConnection {
    /// Path and query of the upgrade request
    pub uri: String,
    socket: WebSocketStream<TcpStream>,
}

impl MockConnection {
    pub async fn send_text(&mut self, text: &str) {
        self.socket
            .send(Message::Text(text.to_string()))
            .await
            .unwrap();
    }

    /// Next text frame, or `None` once the client closes
    pub async fn recv_text(&mut self) -> Option<String> {
        loop {
            match within(self.socket.next()).await {
                Some(Ok(Message::Text(text))) => return Some(text),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                Some(Ok(_)) => continue,
            }
        }
    }

    pub async fn close(mut self) {
        let frame = CloseFrame {
            code: CloseCode::Away,
            reason: "server restarting".into(),
        };
        let _ = self.socket.close(Some(frame)).await;
        // Drain until the client acknowledges
        while let Ok(Some(Ok(_))) = tokio::time::timeout(WAIT, self.socket.next()).await {}
    }
}
