// mock_bridge_server: A mock WebSocket bridge for testing device transports.
//
// Accepts connections on ws://localhost:<port>/bridge/<client_id>, records
// every `{topic, payload}` frame a client sends, and lets the test push
// frames back to connected clients or drop them.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{Notify, mpsc};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;

/// A frame received from a client, with the client id from the URL path.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedFrame {
    pub client_id: String,
    pub topic: String,
    pub payload: serde_json::Value,
}

#[derive(Default)]
struct ServerState {
    received: Mutex<Vec<ReceivedFrame>>,
    clients: Mutex<Vec<(String, mpsc::UnboundedSender<Message>)>>,
    arrived: Notify,
}

/// A mock bridge server for integration testing.
///
/// Binds to port 0 (random) and exposes the actual bound port. Each test
/// can spin up its own isolated server instance.
pub struct MockBridgeServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    /// Handle to the background accept loop; dropped when the server is dropped.
    _task: tokio::task::JoinHandle<()>,
}

impl MockBridgeServer {
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(ServerState::default());

        let loop_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            Self::accept_loop(listener, loop_state).await;
        });

        Ok(Self {
            addr,
            state,
            _task: task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn received(&self) -> Vec<ReceivedFrame> {
        self.state
            .received
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Wait until at least `count` frames have arrived.
    pub async fn wait_for_frames(&self, count: usize, timeout: Duration) -> Vec<ReceivedFrame> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.state.arrived.notified();
            let received = self.received();
            if received.len() >= count {
                return received;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.received();
            }
        }
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.state
            .clients
            .lock()
            .map(|c| c.iter().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default()
    }

    /// Push a frame to every connected client.
    pub fn send_to_all(&self, topic: &str, payload: serde_json::Value) {
        let frame = serde_json::json!({ "topic": topic, "payload": payload }).to_string();
        if let Ok(clients) = self.state.clients.lock() {
            for (_, tx) in clients.iter() {
                let _ = tx.send(Message::Text(frame.clone().into()));
            }
        }
    }

    /// Close every client connection from the server side.
    pub fn drop_clients(&self) {
        if let Ok(mut clients) = self.state.clients.lock() {
            for (_, tx) in clients.drain(..) {
                let _ = tx.send(Message::Close(None));
            }
        }
    }

    // -- internal --

    async fn accept_loop(listener: TcpListener, state: Arc<ServerState>) {
        while let Ok((stream, _peer)) = listener.accept().await {
            let conn_state = Arc::clone(&state);
            tokio::spawn(async move {
                // Client drops are expected in tests.
                let _ = Self::handle_connection(stream, conn_state).await;
            });
        }
    }

    async fn handle_connection(
        stream: tokio::net::TcpStream,
        state: Arc<ServerState>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let path = Arc::new(Mutex::new(String::new()));
        let path_slot = Arc::clone(&path);
        let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            if let Ok(mut slot) = path_slot.lock() {
                *slot = req.uri().path().to_owned();
            }
            Ok(resp)
        };
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
        let client_id = path
            .lock()
            .map(|p| p.trim_start_matches("/bridge/").to_owned())
            .unwrap_or_default();

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        if let Ok(mut clients) = state.clients.lock() {
            clients.push((client_id.clone(), tx));
        }

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if write.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        while let Some(msg_result) = read.next().await {
            let text = match msg_result? {
                Message::Text(t) => t,
                Message::Close(_) => break,
                _ => continue,
            };
            let value: serde_json::Value = serde_json::from_str(&text)?;
            let frame = ReceivedFrame {
                client_id: client_id.clone(),
                topic: value["topic"].as_str().unwrap_or_default().to_owned(),
                payload: value["payload"].clone(),
            };
            if let Ok(mut received) = state.received.lock() {
                received.push(frame);
            }
            state.arrived.notify_waiters();
        }

        writer.abort();
        Ok(())
    }
}
