//! filefeed: subscription-driven file delivery
//!
//! Keeps a local directory in sync with the files published under one server
//! group of a remote file channel. Three delivery modes share one pipeline:
//! - pull: periodic time-bounded requests against the remote restart position
//! - push: a listener task fills a pending set that a consumer batch-fetches
//! - query: a collector task buckets query hits by file type
//!
//! Every result passes through `ResultProcessor`, which logs it, optionally
//! runs an external command, and decides whether the loop commits, reconnects,
//! or stops. Lost connections are rebuilt by `ManagedSession` at a fixed pace
//! with every session option replayed.

pub mod config;
pub mod delivery;
pub mod error;
pub mod event;
pub mod notify;
pub mod pending;
pub mod session;
pub mod shutdown;

pub use config::{Config, ConfigError, DeliveryMode, SubscriptionConfig};
pub use delivery::{DeliveryEngine, DeliverySource, EngineSettings, LoopExit, RunReport};
pub use error::{FeedError, Result};
pub use event::{FileEvent, Status};
pub use notify::{Notifier, ReportingNotifier, TracingNotifier};
pub use session::spool::SpoolTransport;
