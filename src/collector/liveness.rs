use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};

use crate::collector::broadcaster::EventBroadcaster;
use crate::db::services::agent_service;

/// An agent is announced offline after missing four default probe cycles.
const OFFLINE_AFTER_SECS: i64 = 120;
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Watches `agents.last_seen` and announces offline/online transitions over
/// the broadcast plane. Each transition is announced once; the set below
/// remembers which agents have already been called out.
pub struct LivenessTracker {
    pool: PgPool,
    broadcaster: Arc<EventBroadcaster>,
    offline: Mutex<HashSet<String>>,
}

impl LivenessTracker {
    pub fn new(pool: PgPool, broadcaster: Arc<EventBroadcaster>) -> Self {
        Self {
            pool,
            broadcaster,
            offline: Mutex::new(HashSet::new()),
        }
    }

    /// Called by ingress for every accepted report.
    pub async fn report_seen(&self, agent_id: &str, last_seen: DateTime<Utc>) {
        let was_offline = self.offline.lock().await.remove(agent_id);
        if was_offline {
            info!(agent_id, "Agent is back online.");
        }
        self.broadcaster
            .send_agent_update(agent_id, "online", json!({ "lastSeen": last_seen }));
    }

    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(SWEEP_INTERVAL);
        info!("Agent liveness sweep started.");
        loop {
            ticker.tick().await;
            let cutoff = Utc::now() - ChronoDuration::seconds(OFFLINE_AFTER_SECS);
            let silent = match agent_service::agents_silent_since(&self.pool, cutoff).await {
                Ok(agents) => agents,
                Err(e) => {
                    error!(error = %e, "Liveness sweep query failed.");
                    continue;
                }
            };

            let mut offline = self.offline.lock().await;
            for agent in silent {
                if offline.insert(agent.id.clone()) {
                    warn!(agent_id = %agent.id, last_seen = ?agent.last_seen, "Agent went offline.");
                    self.broadcaster.send_agent_update(
                        &agent.id,
                        "offline",
                        json!({ "lastSeen": agent.last_seen }),
                    );
                }
            }
        }
    }
}
