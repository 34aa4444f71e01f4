//! Delivery engine
//!
//! One `DeliveryEngine` runs one subscription in one of three modes:
//! - `poller`: periodic pull requests against the remote bookmark
//! - `push`: a listener task feeds a `PendingSet`, the consumer batch-fetches it
//! - `query`: a collector task buckets query hits by file type
//!
//! All three route results through the shared `ResultProcessor` and recover
//! from connection loss through `ManagedSession::reconnect`.

pub mod invoke;
pub mod poller;
pub mod processor;
pub mod push;
pub mod query;

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::{ConfigError, DeliveryMode, SubscriptionConfig, TransportConfig};
use crate::error::{FeedError, Result};
use crate::event::FileEvent;
use crate::notify::Notifier;
use crate::session::{Credentials, ManagedSession, ReconnectThrottle, SessionError, SessionFactory};
use crate::shutdown::Shutdown;

pub use invoke::{InvocationExecutor, InvocationOutcome};
pub use processor::{Disposition, ResultProcessor};
pub use push::{ChannelSource, NotificationSource};
pub use query::{QueryHit, QuerySubscription};

/// Monotonic error count, shared by everything reporting failures for one run
#[derive(Debug, Clone, Default)]
pub struct ErrorCounter(Arc<AtomicU64>);

impl ErrorCounter {
    pub fn increment(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Why a delivery loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopExit {
    /// Shutdown requested
    Interrupted,
    /// A terminal failure under exit-on-error
    Aborted,
    /// The push listener or query collector ended
    SourceClosed,
}

/// Summary returned when a subscription stops
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub mode: DeliveryMode,
    pub exit: LoopExit,
    pub delivered: u64,
    pub errors: u64,
    pub reconnects: u64,
}

/// Where candidate files come from; must match the configured mode
pub enum DeliverySource {
    Pull,
    Push(Box<dyn NotificationSource>),
    Query(Box<dyn QuerySubscription>),
}

impl DeliverySource {
    pub fn mode(&self) -> DeliveryMode {
        match self {
            DeliverySource::Pull => DeliveryMode::Pull,
            DeliverySource::Push(_) => DeliveryMode::Push,
            DeliverySource::Query(_) => DeliveryMode::Query,
        }
    }
}

/// Runtime knobs that are not part of the subscription itself
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub credentials: Credentials,
    pub reconnect_delay: Duration,
    /// Bounded wait used at every idle suspension point
    pub tick: Duration,
    pub pending_capacity: usize,
}

impl From<&TransportConfig> for EngineSettings {
    fn from(transport: &TransportConfig) -> Self {
        Self {
            credentials: Credentials {
                user: transport.user.clone(),
                password: transport.password.clone(),
            },
            reconnect_delay: Duration::from_millis(transport.reconnect_delay_ms),
            tick: Duration::from_millis(transport.tick_ms),
            pending_capacity: transport.pending_capacity,
        }
    }
}

pub struct DeliveryEngine {
    config: Arc<SubscriptionConfig>,
    factory: Arc<dyn SessionFactory>,
    notifier: Arc<dyn Notifier>,
    settings: EngineSettings,
    errors: ErrorCounter,
}

impl DeliveryEngine {
    /// Validates the configuration; nothing runs if it is rejected
    pub fn new(
        config: SubscriptionConfig,
        factory: Arc<dyn SessionFactory>,
        notifier: Arc<dyn Notifier>,
        settings: EngineSettings,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            factory,
            notifier,
            settings,
            errors: ErrorCounter::default(),
        })
    }

    /// Shared error counter for this engine
    pub fn errors(&self) -> ErrorCounter {
        self.errors.clone()
    }

    /// Run until shutdown, abort, or the background source ends
    pub async fn run(&self, source: DeliverySource, shutdown: Shutdown) -> Result<RunReport> {
        if source.mode() != self.config.mode {
            return Err(ConfigError::SourceMismatch {
                configured: self.config.mode,
                supplied: source.mode(),
            }
            .into());
        }

        info!(
            mode = %self.config.mode,
            server_group = %self.config.server_group,
            file_type = self.config.file_type.as_deref().unwrap_or("*"),
            output_dir = %self.config.output_dir.display(),
            "Starting subscription"
        );

        let session = match ManagedSession::open(
            self.factory.clone(),
            self.settings.credentials.clone(),
            self.config.clone(),
            ReconnectThrottle::new(self.settings.reconnect_delay),
            self.notifier.clone(),
            shutdown.clone(),
        )
        .await
        {
            Ok(session) => session,
            Err(FeedError::Interrupted) => return Ok(self.report(LoopExit::Interrupted, 0, 0)),
            Err(e) => return Err(self.terminal(e)),
        };

        let mut ctx = LoopContext {
            config: self.config.clone(),
            processor: ResultProcessor::new(self.config.clone(), self.notifier.clone(), self.errors.clone()),
            session,
            notifier: self.notifier.clone(),
            errors: self.errors.clone(),
            shutdown,
            tick: self.settings.tick,
        };

        let outcome = match source {
            DeliverySource::Pull => poller::run(&mut ctx).await,
            DeliverySource::Push(source) => push::run(&mut ctx, source, self.settings.pending_capacity).await,
            DeliverySource::Query(subscription) => query::run(&mut ctx, subscription).await,
        };

        let delivered = ctx.processor.delivered();
        let reconnects = ctx.session.reconnect_count();

        let exit = match outcome {
            Ok(exit) => exit,
            Err(FeedError::Interrupted) => LoopExit::Interrupted,
            Err(e) => return Err(self.terminal(e)),
        };

        let report = self.report(exit, delivered, reconnects);
        info!(
            exit = ?report.exit,
            delivered = report.delivered,
            errors = report.errors,
            reconnects = report.reconnects,
            "Subscription stopped"
        );
        Ok(report)
    }

    fn report(&self, exit: LoopExit, delivered: u64, reconnects: u64) -> RunReport {
        RunReport {
            mode: self.config.mode,
            exit,
            delivered,
            errors: self.errors.get(),
            reconnects,
        }
    }

    fn terminal(&self, e: FeedError) -> FeedError {
        self.errors.increment();
        error!(error = %e, "Subscription failed");
        self.notifier.error(&format!("Subscription stopped: {}", e));
        e
    }
}

/// Result of draining the session's pending results
pub(crate) enum DrainEnd {
    /// No more results
    Complete,
    /// The connection broke and was rebuilt; remaining work stays pending
    Reconnected,
    Aborted,
}

pub(crate) struct Drained {
    pub committed: Vec<FileEvent>,
    pub end: DrainEnd,
}

impl Drained {
    /// Whether a committed result carries this file name
    pub fn answered(&self, name: &str) -> bool {
        self.committed.iter().any(|e| e.name.as_deref() == Some(name))
    }
}

/// State shared by the three loop implementations
pub(crate) struct LoopContext {
    pub config: Arc<SubscriptionConfig>,
    pub session: ManagedSession,
    pub processor: ResultProcessor,
    pub notifier: Arc<dyn Notifier>,
    pub errors: ErrorCounter,
    pub shutdown: Shutdown,
    pub tick: Duration,
}

impl LoopContext {
    /// Route every queued result through the processor.
    ///
    /// An IO_ERROR record marks the session as broken but the rest of the
    /// queue is still processed, so files the transport already delivered are
    /// committed once. The session is rebuilt after the queue is empty and
    /// only the IO_ERROR entries stay pending.
    pub async fn drain(&mut self) -> Result<Drained> {
        let mut committed = Vec::new();
        let mut lost: Option<String> = None;
        loop {
            let fetched = self.session.current()?.next_result().await;
            let event = match fetched {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(e) if lost.is_some() => {
                    debug!(error = %e, "Broken session stopped answering");
                    break;
                }
                Err(e) => {
                    let reconnected = self.recover(e).await?;
                    let end = if reconnected { DrainEnd::Reconnected } else { DrainEnd::Complete };
                    return Ok(Drained { committed, end });
                }
            };

            match self.processor.process(&event).await {
                Disposition::Commit => committed.push(event),
                Disposition::Retry => {
                    if lost.is_none() {
                        lost = Some(event.message.clone().unwrap_or_else(|| event.status.to_string()));
                    }
                }
                Disposition::Abort => {
                    return Ok(Drained {
                        committed,
                        end: DrainEnd::Aborted,
                    })
                }
            }
        }

        let end = match lost {
            Some(reason) => {
                self.session.reconnect(&reason).await?;
                DrainEnd::Reconnected
            }
            None => DrainEnd::Complete,
        };
        Ok(Drained { committed, end })
    }

    /// Handle a request-level session error. Returns true if the session was
    /// rebuilt; other errors are counted and reported.
    pub async fn recover(&mut self, e: SessionError) -> Result<bool> {
        if e.is_connection() {
            self.session.reconnect(&e.to_string()).await?;
            return Ok(true);
        }
        self.errors.increment();
        error!(error = %e, "Request failed");
        self.notifier.error(&format!("Request failed: {}", e));
        Ok(false)
    }

    /// Bounded idle wait that ends the loop on shutdown
    pub async fn idle(&mut self) -> Result<()> {
        let tick = self.tick;
        self.shutdown.sleep(tick).await
    }
}
