use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::interval;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async, WebSocketStream};
use tracing::{debug, info, warn};

/// Message types spoken on the peer fabric. Anything else is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerMessageKind {
    PeerHello,
    ConsensusRequest,
    ConsensusResponse,
    HealthReport,
    #[serde(other)]
    Unknown,
}

/// JSON envelope exchanged between peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEnvelope {
    #[serde(rename = "type")]
    pub kind: PeerMessageKind,
    pub from: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Value,
}

struct PeerHandle {
    conn_id: u64,
    outbound: mpsc::Sender<String>,
    shutdown: Arc<Notify>,
}

/// Per-peer outbound queue depth. A peer that falls this far behind has its
/// frames dropped rather than buffered further.
const OUTBOUND_QUEUE: usize = 32;

/// Bidirectional websocket fabric to a bootstrap-seeded peer set. Accepts
/// inbound connections, dials bootstrap URLs, and re-dials disconnected ones
/// on the discovery interval. Holds at most one live socket per peer id; a
/// newer registration terminates the older connection.
pub struct P2pService {
    agent_id: String,
    listen_port: u16,
    bootstrap_peers: Vec<String>,
    discovery_interval: std::time::Duration,
    peers: Mutex<HashMap<String, PeerHandle>>,
    connected_bootstrap: Mutex<HashSet<String>>,
    next_conn_id: AtomicU64,
    inbound_tx: mpsc::Sender<PeerEnvelope>,
}

impl P2pService {
    pub fn new(
        agent_id: &str,
        listen_port: u16,
        bootstrap_peers: Vec<String>,
        discovery_interval: std::time::Duration,
        inbound_tx: mpsc::Sender<PeerEnvelope>,
    ) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            listen_port,
            bootstrap_peers,
            discovery_interval,
            peers: Mutex::new(HashMap::new()),
            connected_bootstrap: Mutex::new(HashSet::new()),
            next_conn_id: AtomicU64::new(1),
            inbound_tx,
        }
    }

    pub fn envelope(&self, kind: PeerMessageKind, data: Value) -> PeerEnvelope {
        PeerEnvelope {
            kind,
            from: self.agent_id.clone(),
            timestamp: Utc::now(),
            data,
        }
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        let listener = TcpListener::bind(("0.0.0.0", self.listen_port)).await?;
        info!(port = self.listen_port, "P2P listener bound.");
        Ok(listener)
    }

    pub async fn run_accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(peer_addr = %addr, "Inbound peer connection.");
                    let service = self.clone();
                    tokio::spawn(async move {
                        match accept_async(stream).await {
                            Ok(ws) => service.run_connection(ws).await,
                            Err(e) => warn!(peer_addr = %addr, error = %e, "Websocket handshake failed."),
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept peer connection.");
                }
            }
        }
    }

    /// Dials every bootstrap URL immediately, then re-dials any URL without a
    /// live connection on each discovery tick.
    pub async fn run_discovery(self: Arc<Self>) {
        let mut ticker = interval(self.discovery_interval);
        loop {
            ticker.tick().await;
            for url in &self.bootstrap_peers {
                if self.connected_bootstrap.lock().await.contains(url) {
                    continue;
                }
                tokio::spawn(self.clone().dial(url.clone()));
            }
        }
    }

    /// Connects to a peer URL and services the connection until it closes.
    pub async fn dial(self: Arc<Self>, url: String) {
        self.connected_bootstrap.lock().await.insert(url.clone());
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                info!(url = %url, "Connected to peer.");
                self.clone().run_connection(ws).await;
            }
            Err(e) => {
                debug!(url = %url, error = %e, "Peer dial failed.");
            }
        }
        self.connected_bootstrap.lock().await.remove(&url);
    }

    /// Best-effort fan-out to every open peer socket. Full or closed queues
    /// are skipped; nothing is buffered or retried.
    pub async fn broadcast(&self, envelope: &PeerEnvelope) {
        let text = match serde_json::to_string(envelope) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Failed to serialize peer envelope.");
                return;
            }
        };
        let peers = self.peers.lock().await;
        debug!(kind = ?envelope.kind, peers = peers.len(), "Broadcasting to peers.");
        for (peer_id, handle) in peers.iter() {
            match handle.outbound.try_send(text.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!(peer_id = %peer_id, "Peer send queue full. Dropping frame.");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(peer_id = %peer_id, "Peer socket closing. Dropping frame.");
                }
            }
        }
    }

    /// Terminates every peer connection without draining.
    pub async fn close_all(&self) {
        let mut peers = self.peers.lock().await;
        for (peer_id, handle) in peers.drain() {
            debug!(peer_id = %peer_id, "Closing peer connection.");
            handle.shutdown.notify_one();
        }
    }

    async fn run_connection<S>(self: Arc<Self>, ws: WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (mut sink, mut stream) = ws.split();

        let hello = self.envelope(PeerMessageKind::PeerHello, Value::Null);
        let Ok(hello_text) = serde_json::to_string(&hello) else {
            return;
        };
        if sink.send(Message::Text(hello_text.into())).await.is_err() {
            return;
        }

        let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
        let shutdown = Arc::new(Notify::new());
        let mut peer_id: Option<String> = None;

        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                Some(text) = out_rx.recv() => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                inbound = stream.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<PeerEnvelope>(text.as_str()) {
                            Ok(envelope) => {
                                self.handle_envelope(envelope, conn_id, &out_tx, &shutdown, &mut peer_id)
                                    .await;
                            }
                            Err(e) => warn!(error = %e, "Discarding malformed peer frame."),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "Peer socket error.");
                        break;
                    }
                },
            }
        }

        if let Some(id) = peer_id {
            self.deregister(&id, conn_id).await;
        }
    }

    async fn handle_envelope(
        &self,
        envelope: PeerEnvelope,
        conn_id: u64,
        out_tx: &mpsc::Sender<String>,
        shutdown: &Arc<Notify>,
        peer_id: &mut Option<String>,
    ) {
        match envelope.kind {
            PeerMessageKind::PeerHello => {
                let from = envelope.from;
                if from == self.agent_id {
                    debug!("Ignoring hello from ourselves.");
                    return;
                }
                if peer_id.as_deref() == Some(from.as_str()) {
                    return;
                }
                *peer_id = Some(from.clone());
                let handle = PeerHandle {
                    conn_id,
                    outbound: out_tx.clone(),
                    shutdown: shutdown.clone(),
                };
                let mut peers = self.peers.lock().await;
                if let Some(previous) = peers.insert(from.clone(), handle) {
                    warn!(peer_id = %from, "Peer re-registered. Terminating older connection.");
                    previous.shutdown.notify_one();
                } else {
                    info!(peer_id = %from, "Peer registered.");
                }
            }
            PeerMessageKind::Unknown => {
                debug!(from = %envelope.from, "Ignoring unknown peer message type.");
            }
            _ => {
                if self.inbound_tx.send(envelope).await.is_err() {
                    debug!("Inbound consumer gone. Dropping peer message.");
                }
            }
        }
    }

    async fn deregister(&self, peer_id: &str, conn_id: u64) {
        let mut peers = self.peers.lock().await;
        if peers.get(peer_id).map(|h| h.conn_id) == Some(conn_id) {
            peers.remove(peer_id);
            info!(peer_id = %peer_id, "Peer disconnected.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn service(agent_id: &str) -> (Arc<P2pService>, mpsc::Receiver<PeerEnvelope>) {
        let (tx, rx) = mpsc::channel(16);
        let service = Arc::new(P2pService::new(
            agent_id,
            0,
            Vec::new(),
            Duration::from_secs(60),
            tx,
        ));
        (service, rx)
    }

    async fn start_listener(service: &Arc<P2pService>) -> String {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(service.clone().run_accept_loop(listener));
        format!("ws://{addr}")
    }

    async fn wait_until<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline {
            if condition().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within deadline");
    }

    #[tokio::test]
    async fn hello_handshake_registers_both_sides() {
        let (a, _a_rx) = service("agent-a");
        let (b, _b_rx) = service("agent-b");
        let url = start_listener(&a).await;

        tokio::spawn(b.clone().dial(url));

        wait_until(|| {
            let (a, b) = (a.clone(), b.clone());
            async move { a.peer_count().await == 1 && b.peer_count().await == 1 }
        })
        .await;
    }

    #[tokio::test]
    async fn broadcast_delivers_consensus_traffic() {
        let (a, _a_rx) = service("agent-a");
        let (b, mut b_rx) = service("agent-b");
        let url = start_listener(&a).await;
        tokio::spawn(b.clone().dial(url));
        wait_until(|| {
            let a = a.clone();
            async move { a.peer_count().await == 1 }
        })
        .await;

        let envelope = a.envelope(
            PeerMessageKind::ConsensusRequest,
            json!({"validatorId": "validator-1", "consensusId": "c-1"}),
        );
        a.broadcast(&envelope).await;

        let received = tokio::time::timeout(Duration::from_secs(2), b_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.kind, PeerMessageKind::ConsensusRequest);
        assert_eq!(received.from, "agent-a");
        assert_eq!(received.data["validatorId"], "validator-1");
    }

    #[tokio::test]
    async fn self_dial_is_not_registered() {
        let (a, _a_rx) = service("agent-a");
        let (same_id, _rx) = service("agent-a");
        let url = start_listener(&a).await;

        tokio::spawn(same_id.clone().dial(url));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(a.peer_count().await, 0);
        assert_eq!(same_id.peer_count().await, 0);
    }

    #[tokio::test]
    async fn duplicate_peer_id_keeps_a_single_connection() {
        let (a, _a_rx) = service("agent-a");
        let (b1, _rx1) = service("agent-b");
        let (b2, _rx2) = service("agent-b");
        let url = start_listener(&a).await;

        tokio::spawn(b1.clone().dial(url.clone()));
        wait_until(|| {
            let a = a.clone();
            async move { a.peer_count().await == 1 }
        })
        .await;

        tokio::spawn(b2.clone().dial(url));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(a.peer_count().await, 1);
    }

    #[tokio::test]
    async fn close_all_empties_the_peer_set() {
        let (a, _a_rx) = service("agent-a");
        let (b, _b_rx) = service("agent-b");
        let url = start_listener(&a).await;
        tokio::spawn(b.clone().dial(url));
        wait_until(|| {
            let a = a.clone();
            async move { a.peer_count().await == 1 }
        })
        .await;

        a.close_all().await;
        assert_eq!(a.peer_count().await, 0);

        wait_until(|| {
            let b = b.clone();
            async move { b.peer_count().await == 0 }
        })
        .await;
    }

    #[test]
    fn unknown_message_types_deserialize_to_unknown() {
        let raw = r#"{"type":"gossip","from":"agent-x","timestamp":"2026-01-01T00:00:00Z","data":{}}"#;
        let envelope: PeerEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.kind, PeerMessageKind::Unknown);
    }

    #[test]
    fn envelope_uses_wire_field_names() {
        let envelope = PeerEnvelope {
            kind: PeerMessageKind::PeerHello,
            from: "agent-a".to_string(),
            timestamp: Utc::now(),
            data: Value::Null,
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "peer_hello");
        assert_eq!(json["from"], "agent-a");
        assert!(json["timestamp"].is_string());
    }
}
