//! Local realtime server for integration tests.
//!
//! Accepts any number of WebSocket connections on 127.0.0.1. Every text
//! line a client sends is reported together with the index of the
//! connection it arrived on; tests push frames or close a connection by
//! index.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// How long a test waits for an expected line.
pub const WAIT: Duration = Duration::from_secs(5);

enum Outbound {
    Text(String),
    Close,
}

pub struct MockServer {
    pub url: String,
    received: mpsc::UnboundedReceiver<(usize, String)>,
    connections: Arc<Mutex<Vec<mpsc::UnboundedSender<Outbound>>>>,
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (received_tx, received) = mpsc::unbounded_channel();
        let connections = Arc::new(Mutex::new(Vec::new()));

        let registered = Arc::clone(&connections);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                let (out_tx, out_rx) = mpsc::unbounded_channel();
                let index = {
                    let mut connections = registered.lock().unwrap();
                    connections.push(out_tx);
                    connections.len() - 1
                };
                tokio::spawn(serve(ws, index, received_tx.clone(), out_rx));
            }
        });

        Self {
            url,
            received,
            connections,
        }
    }

    /// Next line sent by any client.
    pub async fn next_line(&mut self) -> (usize, String) {
        tokio::time::timeout(WAIT, self.received.recv())
            .await
            .expect("timed out waiting for a client line")
            .expect("server stopped")
    }

    /// Read lines until `line` arrives; returns the connection it came on
    /// and everything read before it.
    pub async fn wait_for(&mut self, line: &str) -> (usize, Vec<String>) {
        let mut before = Vec::new();
        loop {
            let (conn, text) = self.next_line().await;
            if text == line {
                return (conn, before);
            }
            before.push(text);
        }
    }

    /// Whether nothing arrives for `period`.
    pub async fn is_quiet_for(&mut self, period: Duration) -> bool {
        tokio::time::timeout(period, self.received.recv())
            .await
            .is_err()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn push(&self, conn: usize, frame: impl Into<String>) {
        let connections = self.connections.lock().unwrap();
        let _ = connections[conn].send(Outbound::Text(frame.into()));
    }

    pub fn close(&self, conn: usize) {
        let connections = self.connections.lock().unwrap();
        let _ = connections[conn].send(Outbound::Close);
    }
}

async fn serve(
    ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    index: usize,
    received: mpsc::UnboundedSender<(usize, String)>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let _ = received.send((index, text));
                }
                Some(Ok(_)) => {}
                _ => break,
            },
            out = outbound.recv() => match out {
                Some(Outbound::Text(text)) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = sink.close().await;
                    break;
                }
            }
        }
    }
}

/// Poll `check` until it holds or [`WAIT`] elapses.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
