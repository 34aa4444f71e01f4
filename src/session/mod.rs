//! Connection sessions to the remote file channel
//!
//! The transport itself is a collaborator behind `ConnectionSession` /
//! `SessionFactory`. This module owns what the engine layers on top:
//! - Replaying the configured option set onto a fresh session
//! - Reconnect pacing (`throttle`)
//! - Rebuilding a broken session (`reconnect`)
//! - A directory-backed transport (`spool`)

pub mod reconnect;
pub mod spool;
pub mod throttle;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;

use crate::config::SubscriptionConfig;
use crate::event::{FileEvent, Status};

pub use reconnect::ManagedSession;
pub use throttle::{ReconnectThrottle, ThrottleState};

/// Identifier returned by every request
pub type TransactionId = u64;

/// Boolean session options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionOption {
    Replace,
    Version,
    Checksum,
    SafeRead,
    Receipt,
    Replicate,
    Diff,
}

impl SessionOption {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionOption::Replace => "replace",
            SessionOption::Version => "version",
            SessionOption::Checksum => "checksum",
            SessionOption::SafeRead => "safe_read",
            SessionOption::Receipt => "receipt",
            SessionOption::Replicate => "replicate",
            SessionOption::Diff => "diff",
        }
    }
}

/// Login parameters
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    pub password: Option<String>,
}

/// Transport errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The connection is gone; recover by reconnecting
    #[error("connection lost: {0}")]
    Connection(String),

    #[error("login failed: {0}")]
    Login(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("session closed")]
    Closed,
}

impl SessionError {
    pub fn is_connection(&self) -> bool {
        matches!(self, SessionError::Connection(_) | SessionError::Closed)
    }
}

/// One live session against a server group.
///
/// Requests queue results on the session; callers drain them with
/// `next_result` until it returns `None`.
#[async_trait]
pub trait ConnectionSession: Send {
    /// Fetch the named files
    async fn get(&mut self, names: &[String]) -> Result<TransactionId, SessionError>;

    /// List metadata for the named files without transferring them
    async fn show(&mut self, names: &[String]) -> Result<TransactionId, SessionError>;

    /// Fetch files newer than `since`. With no bookmark and `restart` set the
    /// remote resumes from its own persisted position.
    async fn get_after(
        &mut self,
        since: Option<DateTime<Utc>>,
        restart: bool,
    ) -> Result<TransactionId, SessionError>;

    async fn get_before(&mut self, until: DateTime<Utc>) -> Result<TransactionId, SessionError>;

    async fn get_between(
        &mut self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<TransactionId, SessionError>;

    fn pending_result_count(&self) -> usize;

    async fn next_result(&mut self) -> Result<Option<FileEvent>, SessionError>;

    /// Switch the active file type; anything but `Status::Ok` is a failure
    async fn change_file_type(&mut self, file_type: &str) -> Result<Status, SessionError>;

    async fn set_option(&mut self, option: SessionOption, enabled: bool) -> Result<(), SessionError>;

    async fn set_replication_root(&mut self, root: &Path) -> Result<(), SessionError>;

    async fn change_working_dir(&mut self, dir: &Path) -> Result<(), SessionError>;

    async fn logout(&mut self) -> Result<(), SessionError>;
}

/// Creates logged-in sessions
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn login(
        &self,
        credentials: &Credentials,
        server_group: &str,
        file_type: Option<&str>,
    ) -> Result<Box<dyn ConnectionSession>, SessionError>;
}

/// Apply every configured option to a session, in setup order.
///
/// A new session starts from defaults, so this runs after the initial login
/// and after every reconnect.
pub async fn apply_options(
    session: &mut dyn ConnectionSession,
    config: &SubscriptionConfig,
) -> Result<(), SessionError> {
    let options = &config.options;

    std::fs::create_dir_all(&config.output_dir)
        .map_err(|e| SessionError::Protocol(format!("cannot create {}: {}", config.output_dir.display(), e)))?;
    session.change_working_dir(&config.output_dir).await?;

    session.set_option(SessionOption::Replace, options.replace).await?;
    session.set_option(SessionOption::Version, options.version).await?;
    session.set_option(SessionOption::Checksum, options.checksum).await?;
    session.set_option(SessionOption::SafeRead, options.safe_read).await?;
    session.set_option(SessionOption::Receipt, options.receipt).await?;

    session.set_option(SessionOption::Replicate, options.replicate).await?;
    if let Some(root) = options.replicate_root.as_deref().filter(|_| options.replicate) {
        session.set_replication_root(root).await?;
    }

    session.set_option(SessionOption::Diff, options.diff).await?;
    Ok(())
}
