//! Periodic account-health scan producing alerts.
//!
//! A simple `tokio::time::interval` loop evaluates every registered account
//! on each tick and fans detected conditions out through a small
//! `AlertHandler` trait, so handlers beyond logging (an HTTP/dashboard
//! layer, out of scope here) can subscribe without this module knowing
//! about them.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::account::{Account, AccountRegistry, AccountStatus, CandidateFilter};
use crate::config::HealthMonitorConfig;
use crate::state_store::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub account_id: String,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertKind {
    HealthLow,
    LimitReached,
    ErrorRateHigh,
    Suspended,
}

pub trait AlertHandler: Send + Sync {
    fn handle(&self, alert: &Alert);
}

/// Always-registered handler: logs every alert via `tracing` rather than
/// requiring a separate alerting system to be wired up.
pub struct LogAlertHandler;
impl AlertHandler for LogAlertHandler {
    fn handle(&self, alert: &Alert) {
        match alert.severity {
            AlertSeverity::Critical => {
                tracing::error!(account_id = %alert.account_id, kind = ?alert.kind, "{}", alert.message)
            }
            AlertSeverity::Warning => {
                warn!(account_id = %alert.account_id, kind = ?alert.kind, "{}", alert.message)
            }
            AlertSeverity::Info => {
                info!(account_id = %alert.account_id, kind = ?alert.kind, "{}", alert.message)
            }
        }
    }
}

pub struct HealthMonitor {
    registry: Arc<dyn AccountRegistry>,
    store: Arc<dyn StateStore>,
    config: HealthMonitorConfig,
    handlers: parking_lot::RwLock<Vec<Arc<dyn AlertHandler>>>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<dyn AccountRegistry>,
        store: Arc<dyn StateStore>,
        config: HealthMonitorConfig,
    ) -> Self {
        Self {
            registry,
            store,
            config,
            handlers: parking_lot::RwLock::new(vec![Arc::new(LogAlertHandler)]),
        }
    }

    pub fn register_handler(&self, handler: Arc<dyn AlertHandler>) {
        self.handlers.write().push(handler);
    }

    /// Runs every `check_interval` until the task is aborted (the `Engine`
    /// owns the `JoinHandle` and aborts it on shutdown).
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.config.check_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.scan_once().await {
                tracing::error!(error = %e, "health monitor scan failed");
            }
        }
    }

    /// One scan over every account; returns the alerts raised (also
    /// dispatched to registered handlers), useful for tests that don't want
    /// to drive the timer loop.
    pub async fn scan_once(&self) -> crate::errors::Result<Vec<Alert>> {
        let accounts = self
            .registry
            .candidates(CandidateFilter::default())
            .await?;
        let mut alerts = Vec::new();

        for account in &accounts {
            if account.status == AccountStatus::Suspended {
                alerts.push(Alert {
                    account_id: account.id.clone(),
                    kind: AlertKind::Suspended,
                    severity: AlertSeverity::Critical,
                    message: format!("account {} is suspended", account.id),
                });
            }
            if account.status == AccountStatus::Active
                && account.health_score < self.config.health_low_threshold
            {
                alerts.push(Alert {
                    account_id: account.id.clone(),
                    kind: AlertKind::HealthLow,
                    severity: AlertSeverity::Warning,
                    message: format!(
                        "account {} health score {} below threshold {}",
                        account.id, account.health_score, self.config.health_low_threshold
                    ),
                });
            }
            if account.daily_upload_count >= account.daily_upload_limit {
                alerts.push(Alert {
                    account_id: account.id.clone(),
                    kind: AlertKind::LimitReached,
                    severity: AlertSeverity::Info,
                    message: format!(
                        "account {} reached its daily upload limit ({})",
                        account.id, account.daily_upload_limit
                    ),
                });
            }
            if let Some(ratio) = self.failure_ratio_24h(account).await? {
                if ratio > self.config.error_rate_threshold {
                    alerts.push(Alert {
                        account_id: account.id.clone(),
                        kind: AlertKind::ErrorRateHigh,
                        severity: AlertSeverity::Warning,
                        message: format!(
                            "account {} 24h failure ratio {:.2} exceeds threshold {:.2}",
                            account.id, ratio, self.config.error_rate_threshold
                        ),
                    });
                }
            }
        }

        let handlers = self.handlers.read().clone();
        for alert in &alerts {
            for handler in &handlers {
                handler.handle(alert);
            }
        }
        Ok(alerts)
    }

    async fn failure_ratio_24h(&self, account: &Account) -> crate::errors::Result<Option<f64>> {
        let history = self.store.history_since(&account.id, Utc::now() - chrono::Duration::hours(24)).await?;
        if history.is_empty() {
            return Ok(None);
        }
        let failures = history.iter().filter(|h| !h.success).count();
        Ok(Some(failures as f64 / history.len() as f64))
    }

    /// Manual override: resets `health_score` to 70, `status` to active,
    /// `daily_upload_count` to 0.
    pub async fn trigger_recovery(&self, account_id: &str) -> crate::errors::Result<Account> {
        self.registry.trigger_recovery(account_id).await
    }
}
