//! Push-mode listener and consumer
//!
//! The listener task drains a `NotificationSource` into the pending set. The
//! consumer advances the set, batch-fetches the snapshot, and removes every
//! entry the processor commits. Connection failures leave entries in place
//! for the next snapshot.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{DrainEnd, LoopContext, LoopExit};
use crate::error::{FeedError, Result};
use crate::pending::{PendingItem, PendingSet, PushOutcome};
use crate::shutdown::{self, ShutdownTrigger};

/// Producer of newly published files
#[async_trait]
pub trait NotificationSource: Send {
    /// Next notification; `None` once the source is finished
    async fn next(&mut self) -> Option<PendingItem>;

    async fn close(&mut self);
}

/// Source fed through an mpsc channel by an external subscription client
pub struct ChannelSource {
    rx: mpsc::Receiver<PendingItem>,
}

impl ChannelSource {
    pub fn new(rx: mpsc::Receiver<PendingItem>) -> Self {
        Self { rx }
    }

    pub fn channel(capacity: usize) -> (mpsc::Sender<PendingItem>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl NotificationSource for ChannelSource {
    async fn next(&mut self) -> Option<PendingItem> {
        self.rx.recv().await
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}

/// Background task moving notifications into the pending set
pub struct Listener {
    handle: JoinHandle<()>,
    stop: ShutdownTrigger,
}

impl Listener {
    pub fn spawn(mut source: Box<dyn NotificationSource>, pending: Arc<PendingSet>) -> Self {
        let (stop, mut stopped) = shutdown::channel();
        let handle = tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    item = source.next() => item,
                    _ = stopped.triggered() => break,
                };
                let Some(item) = item else {
                    info!("Notification source finished");
                    break;
                };
                let id = item.id().to_string();
                tokio::select! {
                    outcome = pending.push(item) => {
                        if outcome == PushOutcome::Duplicate {
                            debug!(file = %id, "Already pending");
                        }
                    }
                    _ = stopped.triggered() => break,
                }
            }
            source.close().await;
        });
        Self { handle, stop }
    }

    pub fn is_alive(&self) -> bool {
        !self.handle.is_finished()
    }

    pub async fn stop(self) {
        self.stop.trigger();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Listener task failed");
        }
    }
}

pub(crate) async fn run(
    ctx: &mut LoopContext,
    source: Box<dyn NotificationSource>,
    capacity: usize,
) -> Result<LoopExit> {
    let pending = Arc::new(PendingSet::new(capacity));
    let listener = Listener::spawn(source, pending.clone());

    let outcome = consume(ctx, &pending, &listener).await;

    ctx.session.close().await;
    listener.stop().await;
    outcome
}

async fn consume(ctx: &mut LoopContext, pending: &PendingSet, listener: &Listener) -> Result<LoopExit> {
    loop {
        if ctx.shutdown.is_triggered() {
            return Err(FeedError::Interrupted);
        }

        // Sampled before the snapshot so a listener that finishes in between
        // still has its last items picked up
        let listening = listener.is_alive();
        let snapshot = pending.advance().await;
        if snapshot.is_empty() {
            if !listening {
                ctx.errors.increment();
                ctx.notifier.error("Push listener stopped, ending subscription");
                return Ok(LoopExit::SourceClosed);
            }
            let tick = ctx.tick;
            tokio::select! {
                _ = pending.wait_for_arrival(tick) => {}
                _ = ctx.shutdown.triggered() => return Err(FeedError::Interrupted),
            }
            continue;
        }

        let names: Vec<String> = snapshot.iter().map(|item| item.id().to_string()).collect();
        debug!(count = names.len(), "Fetching pending batch");

        let issued = ctx.session.current()?.get(&names).await;
        if let Err(e) = issued {
            if !ctx.recover(e).await? {
                // Not recoverable by reconnecting: the batch is skipped
                for name in &names {
                    pending.remove(name).await;
                }
            }
            continue;
        }

        let drained = ctx.drain().await?;
        match drained.end {
            DrainEnd::Complete => {
                // Every request got its answer; names without a named result
                // were covered by an anonymous failure and are not retried
                for name in &names {
                    if pending.remove(name).await && !drained.answered(name) {
                        warn!(file = %name, "No result for file, skipped");
                    }
                }
            }
            DrainEnd::Reconnected => {
                for event in &drained.committed {
                    if let Some(name) = event.name.as_deref() {
                        pending.remove(name).await;
                    }
                }
            }
            DrainEnd::Aborted => return Ok(LoopExit::Aborted),
        }
    }
}
