//! Per-record state machine shared by every delivery loop

use std::sync::Arc;
use tracing::{error, info, warn};

use super::invoke::{InvocationExecutor, InvocationOutcome};
use super::ErrorCounter;
use crate::config::SubscriptionConfig;
use crate::event::{FileEvent, Status};
use crate::notify::Notifier;
use crate::session::spool::crc32_file;

/// What the loop should do with the record it just handed over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handled; remove it from the pending structure
    Commit,
    /// Connection lost; reconnect and keep the record pending
    Retry,
    /// Terminal failure under exit-on-error
    Abort,
}

pub struct ResultProcessor {
    config: Arc<SubscriptionConfig>,
    invoker: Option<InvocationExecutor>,
    notifier: Arc<dyn Notifier>,
    errors: ErrorCounter,
    delivered: u64,
}

impl ResultProcessor {
    pub fn new(config: Arc<SubscriptionConfig>, notifier: Arc<dyn Notifier>, errors: ErrorCounter) -> Self {
        let invoker = config
            .invoke
            .as_ref()
            .map(|invoke| InvocationExecutor::new(invoke, &config.date_format));
        Self {
            config,
            invoker,
            notifier,
            errors,
            delivered: 0,
        }
    }

    /// Files delivered with status OK
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub async fn process(&mut self, event: &FileEvent) -> Disposition {
        match event.status {
            Status::Ok => self.on_delivered(event).await,
            Status::FileExists => {
                info!(file = %event.display_name(), file_type = %event.file_type, "Skipping duplicate");
                self.notifier.error(&format!(
                    "{} already exists locally, skipped",
                    event.display_name()
                ));
                Disposition::Commit
            }
            Status::FileNotFound => {
                warn!(file = %event.display_name(), file_type = %event.file_type, "File vanished before fetch");
                self.notifier.error(&format!(
                    "{} no longer exists on {}, skipped",
                    event.display_name(),
                    event.server_group
                ));
                Disposition::Commit
            }
            Status::IoError => Disposition::Retry,
            Status::Other(code) => {
                let detail = event.message.as_deref().unwrap_or("no detail");
                self.fail(&format!(
                    "{} failed with code {}: {}",
                    event.display_name(),
                    code,
                    detail
                ));
                if event.name.is_some() && self.config.exit_on_error() {
                    Disposition::Abort
                } else {
                    Disposition::Commit
                }
            }
        }
    }

    async fn on_delivered(&mut self, event: &FileEvent) -> Disposition {
        let modified = event
            .modified
            .map(|t| self.config.format_time(&t))
            .unwrap_or_default();
        info!(
            file = %event.display_name(),
            file_type = %event.file_type,
            size = event.size,
            modified = %modified,
            receipt = event.receipt_id.as_deref().unwrap_or(""),
            "Delivered"
        );

        if self.config.options.checksum {
            if let Some(reason) = checksum_mismatch(event) {
                self.fail(&format!("{}: {}", event.display_name(), reason));
                return if self.config.exit_on_error() {
                    Disposition::Abort
                } else {
                    Disposition::Commit
                };
            }
        }

        if let Some(invoker) = &self.invoker {
            if let InvocationOutcome::Failed(reason) = invoker.run(event).await {
                self.fail(&format!("Invocation for {} failed: {}", event.display_name(), reason));
                if self.config.exit_on_error() {
                    return Disposition::Abort;
                }
            }
        }

        self.delivered += 1;
        self.notifier.info(&format!(
            "{} delivered from {}:{}",
            event.display_name(),
            event.server_group,
            event.file_type
        ));
        Disposition::Commit
    }

    fn fail(&self, message: &str) {
        self.errors.increment();
        error!("{}", message);
        self.notifier.error(message);
    }
}

/// Re-hash the local copy and compare with the remote checksum
fn checksum_mismatch(event: &FileEvent) -> Option<String> {
    let (Some(expected), Some(path)) = (event.checksum.as_deref(), event.local_path.as_deref()) else {
        return None;
    };
    match crc32_file(path) {
        Ok(actual) if actual.eq_ignore_ascii_case(expected) => None,
        Ok(actual) => Some(format!("checksum mismatch (expected {}, got {})", expected, actual)),
        Err(e) => Some(format!("cannot verify checksum: {}", e)),
    }
}
