pub mod config;
pub mod consensus;
pub mod p2p;
pub mod probe;
pub mod reporter;

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use config::AgentConfig;
use consensus::{ConsensusCoordinator, ConsensusOutcome};
use p2p::{P2pService, PeerEnvelope, PeerMessageKind};
use probe::{HealthCheckResult, HealthChecker, HealthStatus};
use reporter::Reporter;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// One probing process: probe loop, optional peer fabric, and reporter, all
/// pinned to a single validator.
pub struct SentinelAgent {
    config: AgentConfig,
    checker: Arc<HealthChecker>,
    latest: Arc<RwLock<Option<HealthCheckResult>>>,
    reporter: Arc<Reporter>,
    p2p: Option<Arc<P2pService>>,
    consensus: Option<Arc<ConsensusCoordinator>>,
    inbound_rx: Option<mpsc::Receiver<PeerEnvelope>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SentinelAgent {
    pub fn new(config: AgentConfig) -> Self {
        let checker = Arc::new(HealthChecker::new(
            &config.beacon_node_url,
            &config.validator_id,
            config.health_check_timeout(),
            config.health_check_retries,
        ));
        let latest = Arc::new(RwLock::new(None));
        let reporter = Arc::new(Reporter::new(&config));

        let (p2p, consensus, inbound_rx) = if config.p2p_enabled {
            let (inbound_tx, inbound_rx) = mpsc::channel(64);
            let p2p = Arc::new(P2pService::new(
                &config.agent_id,
                config.p2p_port,
                config.p2p_bootstrap_peers.clone(),
                config.p2p_discovery_interval(),
                inbound_tx,
            ));
            let consensus = Arc::new(ConsensusCoordinator::new(
                &config.agent_id,
                &config.validator_id,
                config.consensus_timeout(),
                p2p.clone(),
                checker.clone(),
                latest.clone(),
            ));
            (Some(p2p), Some(consensus), Some(inbound_rx))
        } else {
            (None, None, None)
        };

        Self {
            config,
            checker,
            latest,
            reporter,
            p2p,
            consensus,
            inbound_rx,
            tasks: Vec::new(),
        }
    }

    pub async fn start(&mut self) -> Result<(), AgentError> {
        info!(
            agent_id = %self.config.agent_id,
            validator_id = %self.config.validator_id,
            p2p_enabled = self.config.p2p_enabled,
            "Starting agent."
        );

        if let Some(p2p) = &self.p2p {
            let listener = p2p.bind().await?;
            self.tasks
                .push(tokio::spawn(p2p.clone().run_accept_loop(listener)));
            self.tasks.push(tokio::spawn(p2p.clone().run_discovery()));

            let consensus = self
                .consensus
                .clone()
                .ok_or_else(|| AgentError::Config("consensus requires p2p".to_string()))?;
            let mut inbound_rx = self
                .inbound_rx
                .take()
                .ok_or_else(|| AgentError::Config("agent already started".to_string()))?;
            self.tasks.push(tokio::spawn(async move {
                while let Some(envelope) = inbound_rx.recv().await {
                    dispatch_peer_message(&consensus, envelope).await;
                }
            }));
        }

        self.tasks.push(tokio::spawn(probe_cycle(
            self.config.clone(),
            self.checker.clone(),
            self.latest.clone(),
            self.consensus.clone(),
            self.reporter.clone(),
        )));
        Ok(())
    }

    /// Stops the probe ticker and terminates peer sockets without draining.
    /// A probe or report already in flight is aborted with its task.
    pub async fn shutdown(&mut self) {
        info!("Shutting down agent.");
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(p2p) = &self.p2p {
            p2p.close_all().await;
        }
    }
}

async fn dispatch_peer_message(consensus: &Arc<ConsensusCoordinator>, envelope: PeerEnvelope) {
    match envelope.kind {
        PeerMessageKind::ConsensusRequest => {
            match serde_json::from_value(envelope.data) {
                Ok(data) => consensus.handle_request(&envelope.from, data).await,
                Err(e) => warn!(from = %envelope.from, error = %e, "Malformed consensus request."),
            }
        }
        PeerMessageKind::ConsensusResponse => match serde_json::from_value(envelope.data) {
            Ok(data) => consensus.handle_response(data).await,
            Err(e) => warn!(from = %envelope.from, error = %e, "Malformed consensus response."),
        },
        // peer_hello is consumed by the transport; health_report is reserved.
        PeerMessageKind::PeerHello | PeerMessageKind::HealthReport | PeerMessageKind::Unknown => {}
    }
}

/// Decides whether an unhealthy probe needs peer confirmation. A threshold of
/// one is satisfied by the local vote alone, so the peer round-trip and its
/// full timeout wait are skipped even when peers are connected.
async fn confirm_unhealthy(
    consensus: Option<&Arc<ConsensusCoordinator>>,
    threshold: usize,
    evidence: HealthCheckResult,
) -> ConsensusOutcome {
    if threshold <= 1 {
        debug!("Self-vote satisfies the threshold. Skipping peer confirmation.");
        return ConsensusOutcome::unilateral();
    }
    match consensus {
        Some(coordinator) => coordinator.request_confirmation(vec![evidence]).await,
        None => ConsensusOutcome::unilateral(),
    }
}

/// One probe immediately, then one every interval. The consensus wait runs
/// inside the cycle, so a long confirmation window delays the next probe
/// rather than stacking probes.
async fn probe_cycle(
    config: AgentConfig,
    checker: Arc<HealthChecker>,
    latest: Arc<RwLock<Option<HealthCheckResult>>>,
    consensus: Option<Arc<ConsensusCoordinator>>,
    reporter: Arc<Reporter>,
) {
    let mut ticker = interval(config.health_check_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let result = checker.probe().await;
        match result.status {
            HealthStatus::Healthy => {
                debug!(
                    response_time_ms = result.response_time_ms,
                    block_height = ?result.beacon_block_height,
                    "Beacon node healthy."
                );
            }
            HealthStatus::Unhealthy => {
                warn!(error = ?result.error, "Beacon node unhealthy.");
            }
        }
        *latest.write().await = Some(result.clone());

        match result.status {
            HealthStatus::Unhealthy => {
                let probe_error = result
                    .error
                    .clone()
                    .unwrap_or_else(|| "Beacon node health check failed".to_string());
                let outcome = confirm_unhealthy(
                    consensus.as_ref(),
                    config.consensus_threshold,
                    result.clone(),
                )
                .await;
                if outcome.meets_threshold(config.consensus_threshold) {
                    let message = if outcome.total_peers > 0 {
                        format!(
                            "{probe_error} (confirmed by {}/{} peers)",
                            outcome.agree_count, outcome.total_peers
                        )
                    } else {
                        probe_error
                    };
                    reporter
                        .submit_status(HealthStatus::Unhealthy, Some(message))
                        .await;
                } else {
                    info!(
                        agree_count = outcome.agree_count,
                        total_peers = outcome.total_peers,
                        threshold = config.consensus_threshold,
                        "Peers did not confirm. Suppressing report."
                    );
                }
            }
            HealthStatus::Healthy => {
                if reporter.should_report_healthy().await {
                    reporter.submit_status(HealthStatus::Healthy, None).await;
                } else {
                    debug!("Status unchanged. Suppressing healthy report.");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn unhealthy_result() -> HealthCheckResult {
        HealthCheckResult {
            validator_id: "validator-1".to_string(),
            status: HealthStatus::Unhealthy,
            response_time_ms: 40,
            timestamp: Utc::now(),
            error: Some("connection refused".to_string()),
            beacon_block_height: None,
        }
    }

    fn coordinator_node(
        agent_id: &str,
        timeout: Duration,
    ) -> (
        Arc<ConsensusCoordinator>,
        Arc<P2pService>,
        mpsc::Receiver<PeerEnvelope>,
    ) {
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let p2p = Arc::new(P2pService::new(
            agent_id,
            0,
            Vec::new(),
            Duration::from_secs(60),
            inbound_tx,
        ));
        let checker = Arc::new(HealthChecker::new(
            "http://127.0.0.1:1", // never dialed in these tests
            "validator-1",
            Duration::from_millis(100),
            1,
        ));
        let latest = Arc::new(RwLock::new(Some(unhealthy_result())));
        let coordinator = Arc::new(ConsensusCoordinator::new(
            agent_id,
            "validator-1",
            timeout,
            p2p.clone(),
            checker,
            latest,
        ));
        (coordinator, p2p, inbound_rx)
    }

    #[tokio::test]
    async fn threshold_of_one_skips_the_peer_round_trip() {
        let (coordinator, p2p, _inbound) =
            coordinator_node("agent-1", Duration::from_secs(120));

        // A connected peer would make a real confirmation round wait the
        // full two minutes.
        let (peer_tx, _peer_rx) = mpsc::channel(16);
        let peer = Arc::new(P2pService::new(
            "agent-2",
            0,
            Vec::new(),
            Duration::from_secs(60),
            peer_tx,
        ));
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(p2p.clone().run_accept_loop(listener));
        tokio::spawn(peer.clone().dial(format!("ws://{addr}")));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while p2p.peer_count().await == 0 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "peer failed to connect"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            confirm_unhealthy(Some(&coordinator), 1, unhealthy_result()),
        )
        .await
        .expect("threshold of one must not wait on peers");

        assert_eq!(outcome.total_peers, 0);
        assert_eq!(outcome.agree_count, 0);
        assert!(outcome.meets_threshold(1));
    }

    #[tokio::test]
    async fn disabled_fabric_reports_unilaterally() {
        let outcome = confirm_unhealthy(None, 2, unhealthy_result()).await;
        assert_eq!(outcome.total_peers, 0);
        assert!(outcome.meets_threshold(2));
    }

    #[tokio::test]
    async fn zero_peers_returns_without_the_confirmation_wait() {
        let (coordinator, _p2p, _inbound) =
            coordinator_node("agent-1", Duration::from_secs(120));

        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            confirm_unhealthy(Some(&coordinator), 2, unhealthy_result()),
        )
        .await
        .expect("an empty peer set must not wait out the window");

        assert_eq!(outcome.total_peers, 0);
        assert!(outcome.meets_threshold(2));
    }
}
