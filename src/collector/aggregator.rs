use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::enums::ReportStatus;
use crate::db::models::{AgentReport, Alert, Validator};
use crate::db::services::{alert_service, report_service};
use crate::notifications::{StatusBroadcast, WebhookDispatch};

/// Windows that never reach quorum are abandoned after this long.
const WINDOW_MAX_AGE_SECS: i64 = 600;
/// How often abandoned windows are collected.
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Durable effects the aggregator performs. Narrowed to a trait so the window
/// state machine can be tested without Postgres.
#[async_trait]
pub trait ReportStore: Send + Sync {
    async fn create_alert(
        &self,
        validator_id: &str,
        user_id: &str,
        message: &str,
    ) -> Result<Alert, sqlx::Error>;

    async fn mark_reports(
        &self,
        report_ids: &[Uuid],
        status: ReportStatus,
        consensus: bool,
    ) -> Result<(), sqlx::Error>;
}

pub struct PgReportStore {
    pool: PgPool,
}

impl PgReportStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReportStore for PgReportStore {
    async fn create_alert(
        &self,
        validator_id: &str,
        user_id: &str,
        message: &str,
    ) -> Result<Alert, sqlx::Error> {
        alert_service::create_alert(&self.pool, validator_id, user_id, message).await
    }

    async fn mark_reports(
        &self,
        report_ids: &[Uuid],
        status: ReportStatus,
        consensus: bool,
    ) -> Result<(), sqlx::Error> {
        report_service::mark_reports(&self.pool, report_ids, status, consensus).await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct WindowReport {
    report_id: Uuid,
    agent_id: String,
    status: ReportStatus,
}

/// Per-validator state while unhealthy reports are pending. Holds at most one
/// entry per agent; the newest report wins. `closed` marks a terminated
/// window so a task that raced the termination re-enters through the map
/// instead of mutating a detached window.
struct ConsensusWindow {
    reports: Vec<WindowReport>,
    consensus_reached: bool,
    closed: bool,
    opened_at: DateTime<Utc>,
}

impl ConsensusWindow {
    fn new(opened_at: DateTime<Utc>) -> Self {
        Self {
            reports: Vec::new(),
            consensus_reached: false,
            closed: false,
            opened_at,
        }
    }

    fn upsert(&mut self, report: &AgentReport) {
        let entry = WindowReport {
            report_id: report.id,
            agent_id: report.agent_id.clone(),
            status: report.status,
        };
        match self
            .reports
            .iter_mut()
            .find(|r| r.agent_id == report.agent_id)
        {
            Some(existing) => *existing = entry,
            None => self.reports.push(entry),
        }
    }

    fn unhealthy_count(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| r.status == ReportStatus::Unhealthy)
            .count()
    }

    fn report_ids(&self) -> Vec<Uuid> {
        self.reports.iter().map(|r| r.report_id).collect()
    }

    fn agent_ids(&self) -> Vec<String> {
        self.reports.iter().map(|r| r.agent_id.clone()).collect()
    }
}

type WindowCell = Arc<Mutex<ConsensusWindow>>;

/// Correlates unhealthy reports across agents, one window per validator.
/// Quorum fires the whole alert pipeline exactly once; any healthy report
/// cancels; stale windows are aged out by a background sweep.
///
/// Locking is two-level: the map mutex is only ever held to look up, insert,
/// or remove a window cell, never across storage awaits. Mutations and their
/// storage calls run under the window's own lock, so work is serialized per
/// validator and independent across validators.
pub struct ConsensusAggregator {
    windows: Mutex<HashMap<String, WindowCell>>,
    threshold: usize,
    store: Arc<dyn ReportStore>,
    broadcaster: Arc<dyn StatusBroadcast>,
    webhooks: Arc<dyn WebhookDispatch>,
}

impl ConsensusAggregator {
    pub fn new(
        threshold: usize,
        store: Arc<dyn ReportStore>,
        broadcaster: Arc<dyn StatusBroadcast>,
        webhooks: Arc<dyn WebhookDispatch>,
    ) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            threshold: threshold.max(1),
            store,
            broadcaster,
            webhooks,
        }
    }

    fn window_key(validator_id: &str) -> String {
        format!("validator_{validator_id}")
    }

    pub async fn process_report(
        &self,
        report: &AgentReport,
        validator: &Validator,
    ) -> Result<(), AggregatorError> {
        match report.status {
            ReportStatus::Unhealthy => self.handle_unhealthy(report, validator).await,
            ReportStatus::Healthy => {
                self.handle_healthy(validator).await;
                Ok(())
            }
            other => {
                // Aggregator-produced statuses are not meaningful as input.
                debug!(status = other.as_str(), "Ignoring non-signal report status.");
                Ok(())
            }
        }
    }

    /// Removes the cell from the map only if it is still the current entry,
    /// so a window opened after a termination is never evicted by mistake.
    async fn remove_window(&self, key: &str, cell: &WindowCell) {
        let mut windows = self.windows.lock().await;
        if let Some(current) = windows.get(key) {
            if Arc::ptr_eq(current, cell) {
                windows.remove(key);
            }
        }
    }

    async fn handle_unhealthy(
        &self,
        report: &AgentReport,
        validator: &Validator,
    ) -> Result<(), AggregatorError> {
        let key = Self::window_key(&validator.id);
        loop {
            let cell = {
                let mut windows = self.windows.lock().await;
                windows
                    .entry(key.clone())
                    .or_insert_with(|| {
                        info!(validator_id = %validator.id, "Opening consensus window.");
                        Arc::new(Mutex::new(ConsensusWindow::new(report.created_at)))
                    })
                    .clone()
            };
            let mut window = cell.lock().await;
            if window.closed {
                // Lost a race against a terminating task; take a fresh window.
                drop(window);
                continue;
            }

            window.upsert(report);
            let unhealthy = window.unhealthy_count();
            let total = window.reports.len();
            let quorum = unhealthy >= self.threshold && !window.consensus_reached;

            self.broadcaster.send_consensus_update(
                &validator.id,
                json!({
                    "totalReports": total,
                    "unhealthyReports": unhealthy,
                    "threshold": self.threshold,
                    "consensusReached": quorum,
                }),
            );

            if !quorum {
                debug!(
                    validator_id = %validator.id,
                    unhealthy,
                    threshold = self.threshold,
                    "Consensus window updated; quorum not reached."
                );
                return Ok(());
            }

            let message = format!(
                "Validator {} is unhealthy. Consensus reached with {} agent reports.",
                validator.name, unhealthy
            );
            // The alert must exist before the latch is set: if alert creation
            // fails, a retried report can still trigger this quorum event.
            let alert = self
                .store
                .create_alert(&validator.id, &validator.user_id, &message)
                .await?;
            window.consensus_reached = true;

            info!(
                validator_id = %validator.id,
                alert_id = %alert.id,
                report_count = unhealthy,
                "Consensus reached. Alert created."
            );

            let report_ids = window.report_ids();
            if let Err(e) = self
                .store
                .mark_reports(&report_ids, ReportStatus::ConsensusReached, true)
                .await
            {
                error!(validator_id = %validator.id, error = %e, "Failed to finalize window reports.");
            }

            self.broadcaster.send_validator_update(
                &validator.id,
                "unhealthy",
                json!({
                    "alertId": alert.id,
                    "reportCount": unhealthy,
                }),
            );
            self.broadcaster.send_alert_notification(&alert);

            let webhooks = self.webhooks.clone();
            let user_id = validator.user_id.clone();
            let payload = json!({
                "validator": validator,
                "alert": alert,
                "consensusData": {
                    "totalReports": total,
                    "unhealthyReports": unhealthy,
                    "threshold": self.threshold,
                    "agentIds": window.agent_ids(),
                },
            });
            tokio::spawn(async move {
                webhooks
                    .dispatch(&user_id, "validator.unhealthy", payload)
                    .await;
            });

            window.closed = true;
            self.remove_window(&key, &cell).await;
            return Ok(());
        }
    }

    async fn handle_healthy(&self, validator: &Validator) {
        let key = Self::window_key(&validator.id);
        let cell = { self.windows.lock().await.get(&key).cloned() };
        let Some(cell) = cell else {
            return;
        };
        let mut window = cell.lock().await;
        if window.closed {
            return;
        }
        window.closed = true;
        self.remove_window(&key, &cell).await;

        info!(
            validator_id = %validator.id,
            pending_reports = window.reports.len(),
            "Healthy report received. Cancelling consensus window."
        );

        if let Err(e) = self
            .store
            .mark_reports(&window.report_ids(), ReportStatus::ConsensusFailed, false)
            .await
        {
            error!(validator_id = %validator.id, error = %e, "Failed to mark cancelled window reports.");
        }

        self.broadcaster.send_validator_update(
            &validator.id,
            "healthy",
            json!({ "consensusCancelled": true }),
        );
    }

    /// Drops windows that have been open past the aging bound without
    /// reaching quorum. No broadcast; the reports are rewritten so nothing
    /// stays attached to a dead window in a non-terminal state.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) {
        let max_age = ChronoDuration::seconds(WINDOW_MAX_AGE_SECS);
        let cells: Vec<(String, WindowCell)> = {
            let windows = self.windows.lock().await;
            windows
                .iter()
                .map(|(key, cell)| (key.clone(), cell.clone()))
                .collect()
        };

        for (key, cell) in cells {
            let mut window = cell.lock().await;
            if window.closed || window.consensus_reached || now - window.opened_at <= max_age {
                continue;
            }
            window.closed = true;
            self.remove_window(&key, &cell).await;

            warn!(
                window = %key,
                pending_reports = window.reports.len(),
                "Consensus window aged out without quorum."
            );
            if let Err(e) = self
                .store
                .mark_reports(&window.report_ids(), ReportStatus::ConsensusFailed, false)
                .await
            {
                error!(window = %key, error = %e, "Failed to mark aged-out window reports.");
            }
        }
    }

    pub async fn run_aging_sweep(self: Arc<Self>) {
        let mut ticker = interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            self.sweep_expired(Utc::now()).await;
        }
    }

    #[cfg(test)]
    async fn open_window_count(&self) -> usize {
        self.windows.lock().await.len()
    }
}
