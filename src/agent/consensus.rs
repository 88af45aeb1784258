use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::p2p::{P2pService, PeerMessageKind};
use crate::agent::probe::{HealthCheckResult, HealthChecker, HealthStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusRequestData {
    pub validator_id: String,
    pub status: HealthStatus,
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub evidence: Vec<HealthCheckResult>,
    pub consensus_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusResponseData {
    pub validator_id: String,
    pub consensus_id: String,
    pub agree: bool,
    pub agent_id: String,
    pub requester_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<HealthCheckResult>,
}

#[derive(Debug)]
pub struct ConsensusOutcome {
    pub agree_count: usize,
    pub total_peers: usize,
    pub responses: Vec<ConsensusResponseData>,
}

impl ConsensusOutcome {
    pub fn unilateral() -> Self {
        Self {
            agree_count: 0,
            total_peers: 0,
            responses: Vec::new(),
        }
    }

    /// Self-inclusive quorum rule: the requester counts as one agreeing
    /// voter, and an agent with no peers at all proceeds alone so a dead
    /// fabric can never block alerting.
    pub fn meets_threshold(&self, threshold: usize) -> bool {
        self.total_peers == 0 || self.agree_count + 1 >= threshold
    }
}

/// Requester/responder pair for peer confirmation of an unhealthy probe.
/// In-flight requests are a map of `consensusId` to response channels;
/// responses for ids no longer in the map are late and discarded.
pub struct ConsensusCoordinator {
    agent_id: String,
    validator_id: String,
    timeout: Duration,
    p2p: Arc<P2pService>,
    checker: Arc<HealthChecker>,
    latest: Arc<RwLock<Option<HealthCheckResult>>>,
    pending: Mutex<HashMap<String, mpsc::UnboundedSender<ConsensusResponseData>>>,
}

impl ConsensusCoordinator {
    pub fn new(
        agent_id: &str,
        validator_id: &str,
        timeout: Duration,
        p2p: Arc<P2pService>,
        checker: Arc<HealthChecker>,
        latest: Arc<RwLock<Option<HealthCheckResult>>>,
    ) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            validator_id: validator_id.to_string(),
            timeout,
            p2p,
            checker,
            latest,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Solicits confirmations from every connected peer and collects answers
    /// for exactly the configured timeout. The window never closes early;
    /// a peer answering twice overwrites its earlier vote.
    pub async fn request_confirmation(&self, evidence: Vec<HealthCheckResult>) -> ConsensusOutcome {
        let total_peers = self.p2p.peer_count().await;
        if total_peers == 0 {
            info!("No peers connected. Proceeding without peer confirmation.");
            return ConsensusOutcome::unilateral();
        }

        let consensus_id = Uuid::new_v4().to_string();
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.pending.lock().await.insert(consensus_id.clone(), tx);

        let request = ConsensusRequestData {
            validator_id: self.validator_id.clone(),
            status: HealthStatus::Unhealthy,
            agent_id: self.agent_id.clone(),
            timestamp: Utc::now(),
            evidence,
            consensus_id: Some(consensus_id.clone()),
        };
        match serde_json::to_value(&request) {
            Ok(data) => {
                let envelope = self.p2p.envelope(PeerMessageKind::ConsensusRequest, data);
                self.p2p.broadcast(&envelope).await;
                info!(
                    consensus_id = %consensus_id,
                    peers = total_peers,
                    "Requested peer confirmation."
                );
            }
            Err(e) => {
                warn!(error = %e, "Failed to serialize consensus request.");
            }
        }

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        let mut by_agent: HashMap<String, ConsensusResponseData> = HashMap::new();
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                maybe = rx.recv() => match maybe {
                    Some(response) => {
                        debug!(
                            consensus_id = %consensus_id,
                            peer = %response.agent_id,
                            agree = response.agree,
                            "Peer responded."
                        );
                        by_agent.insert(response.agent_id.clone(), response);
                    }
                    None => break,
                },
            }
        }
        self.pending.lock().await.remove(&consensus_id);

        let responses: Vec<ConsensusResponseData> = by_agent.into_values().collect();
        let agree_count = responses.iter().filter(|r| r.agree).count();
        info!(
            consensus_id = %consensus_id,
            agree_count,
            total_peers,
            "Peer confirmation window closed."
        );
        ConsensusOutcome {
            agree_count,
            total_peers,
            responses,
        }
    }

    /// Answers a peer's confirmation request from the freshest local view,
    /// probing on demand if this agent has not completed a cycle yet.
    pub async fn handle_request(&self, from: &str, request: ConsensusRequestData) {
        let Some(consensus_id) = request.consensus_id else {
            warn!(from, "Consensus request without consensusId. Dropping.");
            return;
        };
        if request.validator_id != self.validator_id {
            debug!(
                from,
                validator_id = %request.validator_id,
                "Consensus request for an unrelated validator. Dropping."
            );
            return;
        }

        let local = { self.latest.read().await.clone() };
        let result = match local {
            Some(result) => result,
            None => self.checker.probe().await,
        };
        let agree = result.status == HealthStatus::Unhealthy;

        let response = ConsensusResponseData {
            validator_id: self.validator_id.clone(),
            consensus_id: consensus_id.clone(),
            agree,
            agent_id: self.agent_id.clone(),
            requester_id: request.agent_id,
            timestamp: Utc::now(),
            evidence: if agree { Some(result) } else { None },
        };
        info!(consensus_id = %consensus_id, agree, "Answering consensus request.");
        match serde_json::to_value(&response) {
            Ok(data) => {
                let envelope = self.p2p.envelope(PeerMessageKind::ConsensusResponse, data);
                self.p2p.broadcast(&envelope).await;
            }
            Err(e) => warn!(error = %e, "Failed to serialize consensus response."),
        }
    }

    /// Routes a response back to the waiting requester, if it is ours and the
    /// window is still open.
    pub async fn handle_response(&self, response: ConsensusResponseData) {
        if response.requester_id != self.agent_id {
            return;
        }
        let pending = self.pending.lock().await;
        match pending.get(&response.consensus_id) {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => {
                debug!(
                    consensus_id = %response.consensus_id,
                    "Late or unknown consensus response. Discarding."
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::p2p::PeerEnvelope;
    use serde_json::json;
    use tokio::net::TcpListener;

    fn checker() -> Arc<HealthChecker> {
        Arc::new(HealthChecker::new(
            "http://127.0.0.1:1", // never dialed in these tests
            "validator-1",
            Duration::from_millis(100),
            1,
        ))
    }

    fn unhealthy_result() -> HealthCheckResult {
        HealthCheckResult {
            validator_id: "validator-1".to_string(),
            status: HealthStatus::Unhealthy,
            response_time_ms: 50,
            timestamp: Utc::now(),
            error: Some("connection refused".to_string()),
            beacon_block_height: None,
        }
    }

    fn healthy_result() -> HealthCheckResult {
        HealthCheckResult {
            validator_id: "validator-1".to_string(),
            status: HealthStatus::Healthy,
            response_time_ms: 20,
            timestamp: Utc::now(),
            error: None,
            beacon_block_height: Some(123),
        }
    }

    struct Node {
        p2p: Arc<P2pService>,
        coordinator: Arc<ConsensusCoordinator>,
        latest: Arc<RwLock<Option<HealthCheckResult>>>,
    }

    /// Builds a node with its inbound envelopes routed to the coordinator,
    /// the way the agent runtime wires them.
    fn node(agent_id: &str, validator_id: &str, timeout: Duration) -> Node {
        let (tx, mut rx) = mpsc::channel::<PeerEnvelope>(16);
        let p2p = Arc::new(P2pService::new(
            agent_id,
            0,
            Vec::new(),
            Duration::from_secs(60),
            tx,
        ));
        let latest = Arc::new(RwLock::new(None));
        let coordinator = Arc::new(ConsensusCoordinator::new(
            agent_id,
            validator_id,
            timeout,
            p2p.clone(),
            checker(),
            latest.clone(),
        ));
        let dispatch = coordinator.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                match envelope.kind {
                    PeerMessageKind::ConsensusRequest => {
                        if let Ok(data) = serde_json::from_value(envelope.data) {
                            dispatch.handle_request(&envelope.from, data).await;
                        }
                    }
                    PeerMessageKind::ConsensusResponse => {
                        if let Ok(data) = serde_json::from_value(envelope.data) {
                            dispatch.handle_response(data).await;
                        }
                    }
                    _ => {}
                }
            }
        });
        Node {
            p2p,
            coordinator,
            latest,
        }
    }

    async fn connect(listener_node: &Node, dialer_node: &Node) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(listener_node.p2p.clone().run_accept_loop(listener));
        tokio::spawn(dialer_node.p2p.clone().dial(format!("ws://{addr}")));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline {
            if listener_node.p2p.peer_count().await == 1
                && dialer_node.p2p.peer_count().await == 1
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("peers failed to connect");
    }

    #[tokio::test]
    async fn peer_confirms_when_it_also_sees_unhealthy() {
        let requester = node("agent-1", "validator-1", Duration::from_millis(300));
        let responder = node("agent-2", "validator-1", Duration::from_millis(300));
        *responder.latest.write().await = Some(unhealthy_result());
        connect(&requester, &responder).await;

        let outcome = requester
            .coordinator
            .request_confirmation(vec![unhealthy_result()])
            .await;

        assert_eq!(outcome.total_peers, 1);
        assert_eq!(outcome.agree_count, 1);
        assert_eq!(outcome.responses.len(), 1);
        assert!(outcome.responses[0].evidence.is_some());
        assert!(outcome.meets_threshold(2));
    }

    #[tokio::test]
    async fn peer_declines_when_it_sees_healthy() {
        let requester = node("agent-1", "validator-1", Duration::from_millis(300));
        let responder = node("agent-2", "validator-1", Duration::from_millis(300));
        *responder.latest.write().await = Some(healthy_result());
        connect(&requester, &responder).await;

        let outcome = requester
            .coordinator
            .request_confirmation(vec![unhealthy_result()])
            .await;

        assert_eq!(outcome.total_peers, 1);
        assert_eq!(outcome.agree_count, 0);
        assert_eq!(outcome.responses.len(), 1);
        assert!(outcome.responses[0].evidence.is_none());
        assert!(!outcome.meets_threshold(2));
    }

    #[tokio::test]
    async fn requests_for_other_validators_are_dropped() {
        let requester = node("agent-1", "validator-1", Duration::from_millis(300));
        let responder = node("agent-2", "validator-2", Duration::from_millis(300));
        *responder.latest.write().await = Some(unhealthy_result());
        connect(&requester, &responder).await;

        let outcome = requester
            .coordinator
            .request_confirmation(vec![unhealthy_result()])
            .await;

        assert_eq!(outcome.total_peers, 1);
        assert_eq!(outcome.responses.len(), 0);
    }

    #[tokio::test]
    async fn no_peers_short_circuits_to_unilateral() {
        let requester = node("agent-1", "validator-1", Duration::from_secs(120));

        let started = tokio::time::Instant::now();
        let outcome = requester
            .coordinator
            .request_confirmation(vec![unhealthy_result()])
            .await;

        assert_eq!(outcome.total_peers, 0);
        assert_eq!(outcome.agree_count, 0);
        assert!(outcome.meets_threshold(2));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn confirmation_window_never_closes_early() {
        let timeout = Duration::from_millis(400);
        let requester = node("agent-1", "validator-1", timeout);
        let responder = node("agent-2", "validator-1", timeout);
        *responder.latest.write().await = Some(unhealthy_result());
        connect(&requester, &responder).await;

        let started = tokio::time::Instant::now();
        let outcome = requester
            .coordinator
            .request_confirmation(vec![unhealthy_result()])
            .await;

        assert_eq!(outcome.agree_count, 1);
        assert!(started.elapsed() >= timeout);
    }

    #[tokio::test]
    async fn requests_without_consensus_id_get_no_answer() {
        let requester = node("agent-1", "validator-1", Duration::from_millis(300));
        let responder = node("agent-2", "validator-1", Duration::from_millis(300));
        *responder.latest.write().await = Some(unhealthy_result());
        connect(&requester, &responder).await;

        let envelope = requester.p2p.envelope(
            PeerMessageKind::ConsensusRequest,
            json!({
                "validatorId": "validator-1",
                "status": "UNHEALTHY",
                "agentId": "agent-1",
                "timestamp": Utc::now(),
                "evidence": [],
            }),
        );
        requester.p2p.broadcast(&envelope).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Nothing pending on the requester, and the responder stayed silent;
        // a stray response would have been logged as late, not delivered.
        assert!(requester.coordinator.pending.lock().await.is_empty());
    }

    #[test]
    fn threshold_rule_is_self_inclusive() {
        let lone_agree = ConsensusOutcome {
            agree_count: 1,
            total_peers: 2,
            responses: Vec::new(),
        };
        assert!(lone_agree.meets_threshold(2));

        let no_agreement = ConsensusOutcome {
            agree_count: 0,
            total_peers: 2,
            responses: Vec::new(),
        };
        assert!(!no_agreement.meets_threshold(2));
        assert!(no_agreement.meets_threshold(1));

        assert!(ConsensusOutcome::unilateral().meets_threshold(5));
    }
}
