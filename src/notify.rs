//! Notification sinks
//!
//! The engine reports every delivery and every failure through a `Notifier`.
//! `TracingNotifier` forwards to the log; `ReportingNotifier` wraps another
//! notifier and periodically emits an aggregated summary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::shutdown::Shutdown;

/// Message sink for delivery outcomes
pub trait Notifier: Send + Sync {
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
}

/// Notifier that writes to the tracing log
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn info(&self, message: &str) {
        info!(target: "filefeed::notify", "{}", message);
    }

    fn warn(&self, message: &str) {
        warn!(target: "filefeed::notify", "{}", message);
    }

    fn error(&self, message: &str) {
        error!(target: "filefeed::notify", "{}", message);
    }
}

/// Aggregated counts for one report period
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryReport {
    pub period_end: DateTime<Utc>,
    pub infos: u64,
    pub warnings: u64,
    pub errors: u64,
}

impl DeliveryReport {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Counts messages passing through to an inner notifier
pub struct ReportingNotifier {
    inner: Arc<dyn Notifier>,
    infos: AtomicU64,
    warnings: AtomicU64,
    errors: AtomicU64,
}

impl ReportingNotifier {
    pub fn new(inner: Arc<dyn Notifier>) -> Self {
        Self {
            inner,
            infos: AtomicU64::new(0),
            warnings: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Take the counts accumulated since the last call
    pub fn take_report(&self) -> DeliveryReport {
        DeliveryReport {
            period_end: Utc::now(),
            infos: self.infos.swap(0, Ordering::Relaxed),
            warnings: self.warnings.swap(0, Ordering::Relaxed),
            errors: self.errors.swap(0, Ordering::Relaxed),
        }
    }

    /// Emit a report every `period` until shutdown
    pub fn spawn_schedule(self: Arc<Self>, period: Duration, mut shutdown: Shutdown) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if shutdown.sleep(period).await.is_err() {
                    break;
                }
                let report = self.take_report();
                match report.to_json() {
                    Ok(line) => self.inner.info(&format!("report {}", line)),
                    Err(e) => warn!(error = %e, "Failed to serialize delivery report"),
                }
            }
        })
    }
}

impl Notifier for ReportingNotifier {
    fn info(&self, message: &str) {
        self.infos.fetch_add(1, Ordering::Relaxed);
        self.inner.info(message);
    }

    fn warn(&self, message: &str) {
        self.warnings.fetch_add(1, Ordering::Relaxed);
        self.inner.warn(message);
    }

    fn error(&self, message: &str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.inner.error(message);
    }
}
