//! Session lifecycle with reconnect-and-replay
//!
//! `ManagedSession` owns the live session for one delivery loop. When the loop
//! sees an IO_ERROR it calls `reconnect`, which drops the broken session,
//! logs back in under the throttle, and replays the configured options. The
//! caller keeps its pending work and retries it on the next cycle.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::{apply_options, ConnectionSession, Credentials, ReconnectThrottle, SessionError, SessionFactory};
use crate::config::SubscriptionConfig;
use crate::error::{FeedError, Result};
use crate::notify::Notifier;
use crate::shutdown::Shutdown;

pub struct ManagedSession {
    session: Option<Box<dyn ConnectionSession>>,
    factory: Arc<dyn SessionFactory>,
    credentials: Credentials,
    config: Arc<SubscriptionConfig>,
    throttle: ReconnectThrottle,
    notifier: Arc<dyn Notifier>,
    shutdown: Shutdown,
    reconnects: u64,
}

impl ManagedSession {
    /// Log in and apply options.
    ///
    /// The first attempt is immediate; if it fails, further attempts go
    /// through the throttle until one succeeds or shutdown is requested.
    pub async fn open(
        factory: Arc<dyn SessionFactory>,
        credentials: Credentials,
        config: Arc<SubscriptionConfig>,
        throttle: ReconnectThrottle,
        notifier: Arc<dyn Notifier>,
        shutdown: Shutdown,
    ) -> Result<Self> {
        let mut managed = Self {
            session: None,
            factory,
            credentials,
            config,
            throttle,
            notifier,
            shutdown,
            reconnects: 0,
        };

        match managed.connect_once().await {
            Ok(session) => managed.session = Some(session),
            Err(e) if e.is_connection() || matches!(e, SessionError::Login(_)) => {
                warn!(error = %e, "Initial login failed, retrying");
                managed.throttle.record_failure();
                managed.session = Some(managed.connect_paced().await?);
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            server_group = %managed.config.server_group,
            file_type = managed.config.file_type.as_deref().unwrap_or("*"),
            "Session established"
        );
        Ok(managed)
    }

    /// The live session
    pub fn current(&mut self) -> Result<&mut (dyn ConnectionSession + 'static)> {
        self.session
            .as_deref_mut()
            .ok_or(FeedError::Session(SessionError::Closed))
    }

    /// Number of completed reconnects
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects
    }

    /// Replace a broken session with a fresh one carrying the same options
    pub async fn reconnect(&mut self, reason: &str) -> Result<()> {
        self.notifier.error(&format!(
            "Connection to {} lost ({}), reconnecting",
            self.config.server_group, reason
        ));

        if let Some(mut broken) = self.session.take() {
            if let Err(e) = broken.logout().await {
                debug!(error = %e, "Ignoring logout error on broken session");
            }
        }

        let session = self.connect_paced().await?;
        self.session = Some(session);
        self.reconnects += 1;

        info!(reconnects = self.reconnects, "Reconnected and options replayed");
        Ok(())
    }

    /// Log out; errors are logged and swallowed
    pub async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.logout().await {
                warn!(error = %e, "Logout failed");
            }
        }
    }

    async fn connect_once(&self) -> std::result::Result<Box<dyn ConnectionSession>, SessionError> {
        let mut session = self
            .factory
            .login(
                &self.credentials,
                &self.config.server_group,
                self.config.file_type.as_deref(),
            )
            .await?;

        if let Err(e) = apply_options(session.as_mut(), &self.config).await {
            let _ = session.logout().await;
            return Err(e);
        }
        Ok(session)
    }

    /// Throttled login loop; ends only on success or shutdown
    async fn connect_paced(&mut self) -> Result<Box<dyn ConnectionSession>> {
        loop {
            self.throttle.pace(&mut self.shutdown).await?;

            match self.connect_once().await {
                Ok(session) => {
                    self.throttle.record_success();
                    return Ok(session);
                }
                Err(e) => {
                    self.throttle.record_failure();
                    error!(
                        error = %e,
                        failures = self.throttle.state().failures,
                        "Reconnect attempt failed"
                    );
                }
            }
        }
    }
}
