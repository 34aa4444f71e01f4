//! Query-mode collector and consumer
//!
//! A collector task gathers hits from a `QuerySubscription` into buckets keyed
//! by file type. The consumer drains them either per file type (bundle mode)
//! or one hit at a time in first-seen order, switching the session's active
//! file type as it goes.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{DrainEnd, LoopContext, LoopExit};
use crate::error::{FeedError, Result};
use crate::event::{FileEvent, Status};
use crate::session::SessionError;
use crate::shutdown::{self, ShutdownTrigger};

/// One query match
#[derive(Debug, Clone, PartialEq)]
pub struct QueryHit {
    pub file_type: String,
    pub name: String,
    /// Metadata, if the subscription supplies it
    pub event: Option<FileEvent>,
}

impl QueryHit {
    pub fn new(file_type: &str, name: &str) -> Self {
        Self {
            file_type: file_type.to_string(),
            name: name.to_string(),
            event: None,
        }
    }
}

/// Query-based subscription over one server group
#[async_trait]
pub trait QuerySubscription: Send {
    /// Register the query; returns the subscription id
    async fn subscribe(&mut self) -> std::result::Result<String, SessionError>;

    fn is_alive(&self) -> bool;

    /// Next match; `None` once the subscription ends
    async fn next_hit(&mut self) -> Option<QueryHit>;

    async fn close(&mut self);
}

/// Hits awaiting delivery, in first-seen order
#[derive(Debug, Default)]
pub struct ResultBuckets {
    hits: Vec<QueryHit>,
    keys: HashSet<(String, String)>,
}

impl ResultBuckets {
    /// Returns false if the hit is already held
    pub fn insert(&mut self, hit: QueryHit) -> bool {
        if !self.keys.insert((hit.file_type.clone(), hit.name.clone())) {
            return false;
        }
        self.hits.push(hit);
        true
    }

    pub fn remove(&mut self, file_type: &str, name: &str) -> bool {
        if !self.keys.remove(&(file_type.to_string(), name.to_string())) {
            return false;
        }
        self.hits.retain(|h| !(h.file_type == file_type && h.name == name));
        true
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    /// Every hit in first-seen order
    pub fn in_order(&self) -> Vec<QueryHit> {
        self.hits.clone()
    }

    /// Names grouped by file type; types ordered by first appearance
    pub fn by_type(&self) -> Vec<(String, Vec<String>)> {
        let mut groups: Vec<(String, Vec<String>)> = Vec::new();
        for hit in &self.hits {
            match groups.iter_mut().find(|(ty, _)| *ty == hit.file_type) {
                Some((_, names)) => names.push(hit.name.clone()),
                None => groups.push((hit.file_type.clone(), vec![hit.name.clone()])),
            }
        }
        groups
    }
}

/// Background task feeding `ResultBuckets`
pub struct Collector {
    id: String,
    buckets: Arc<Mutex<ResultBuckets>>,
    handle: JoinHandle<()>,
    stop: ShutdownTrigger,
}

impl Collector {
    pub async fn start(mut subscription: Box<dyn QuerySubscription>) -> Result<Self> {
        let id = subscription.subscribe().await?;
        let buckets = Arc::new(Mutex::new(ResultBuckets::default()));
        let (stop, mut stopped) = shutdown::channel();

        let task_buckets = buckets.clone();
        let handle = tokio::spawn(async move {
            while subscription.is_alive() {
                let hit = tokio::select! {
                    hit = subscription.next_hit() => hit,
                    _ = stopped.triggered() => break,
                };
                match hit {
                    Some(hit) => {
                        debug!(file = %hit.name, file_type = %hit.file_type, "Query hit");
                        task_buckets.lock().await.insert(hit);
                    }
                    None => break,
                }
            }
            subscription.close().await;
        });

        Ok(Self {
            id,
            buckets,
            handle,
            stop,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }

    pub async fn is_empty(&self) -> bool {
        self.buckets.lock().await.is_empty()
    }

    pub async fn in_order(&self) -> Vec<QueryHit> {
        self.buckets.lock().await.in_order()
    }

    pub async fn by_type(&self) -> Vec<(String, Vec<String>)> {
        self.buckets.lock().await.by_type()
    }

    pub async fn remove(&self, file_type: &str, name: &str) -> bool {
        self.buckets.lock().await.remove(file_type, name)
    }

    pub async fn stop(self) {
        self.stop.trigger();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Collector task failed");
        }
    }
}

enum Pass {
    Done,
    Reconnected,
    Aborted,
}

pub(crate) async fn run(ctx: &mut LoopContext, subscription: Box<dyn QuerySubscription>) -> Result<LoopExit> {
    let collector = Collector::start(subscription).await?;
    info!(subscription = %collector.id(), bundle = ctx.config.bundle, "Query subscription active");

    let outcome = consume(ctx, &collector).await;

    ctx.session.close().await;
    collector.stop().await;
    outcome
}

async fn consume(ctx: &mut LoopContext, collector: &Collector) -> Result<LoopExit> {
    // A fresh session is on the type it logged in with
    let mut active_type = ctx.config.file_type.clone();

    loop {
        if ctx.shutdown.is_triggered() {
            return Err(FeedError::Interrupted);
        }

        let collecting = collector.is_active();
        if collector.is_empty().await {
            if !collecting {
                ctx.errors.increment();
                ctx.notifier.error("Query subscription ended, stopping");
                return Ok(LoopExit::SourceClosed);
            }
            ctx.idle().await?;
            continue;
        }

        let pass = if ctx.config.bundle {
            bundle_pass(ctx, collector, &mut active_type).await?
        } else {
            per_result_pass(ctx, collector, &mut active_type).await?
        };

        match pass {
            Pass::Done => {}
            Pass::Reconnected => active_type = ctx.config.file_type.clone(),
            Pass::Aborted => return Ok(LoopExit::Aborted),
        }
    }
}

async fn bundle_pass(
    ctx: &mut LoopContext,
    collector: &Collector,
    active_type: &mut Option<String>,
) -> Result<Pass> {
    for (file_type, names) in collector.by_type().await {
        if switch_type(ctx, active_type, &file_type).await? {
            return Ok(Pass::Reconnected);
        }
        match fetch(ctx, collector, &file_type, &names).await? {
            Pass::Done => {}
            other => return Ok(other),
        }
    }
    Ok(Pass::Done)
}

async fn per_result_pass(
    ctx: &mut LoopContext,
    collector: &Collector,
    active_type: &mut Option<String>,
) -> Result<Pass> {
    for hit in collector.in_order().await {
        if switch_type(ctx, active_type, &hit.file_type).await? {
            return Ok(Pass::Reconnected);
        }
        match fetch(ctx, collector, &hit.file_type, std::slice::from_ref(&hit.name)).await? {
            Pass::Done => {}
            other => return Ok(other),
        }
    }
    Ok(Pass::Done)
}

/// Make `file_type` the session's active type. Returns true if the session
/// had to be rebuilt; a non-OK answer is a terminal configuration error.
async fn switch_type(ctx: &mut LoopContext, active_type: &mut Option<String>, file_type: &str) -> Result<bool> {
    if active_type.as_deref() == Some(file_type) {
        return Ok(false);
    }

    let switched = ctx.session.current()?.change_file_type(file_type).await;
    match switched {
        Ok(Status::Ok) => {
            debug!(file_type, "Switched file type");
            *active_type = Some(file_type.to_string());
            Ok(false)
        }
        Ok(status) => Err(FeedError::TypeSwitch {
            file_type: file_type.to_string(),
            reason: status.to_string(),
        }),
        Err(e) if e.is_connection() => {
            ctx.session.reconnect(&e.to_string()).await?;
            Ok(true)
        }
        Err(e) => Err(FeedError::TypeSwitch {
            file_type: file_type.to_string(),
            reason: e.to_string(),
        }),
    }
}

async fn fetch(ctx: &mut LoopContext, collector: &Collector, file_type: &str, names: &[String]) -> Result<Pass> {
    let issued = ctx.session.current()?.get(names).await;
    if let Err(e) = issued {
        if ctx.recover(e).await? {
            return Ok(Pass::Reconnected);
        }
        for name in names {
            collector.remove(file_type, name).await;
        }
        return Ok(Pass::Done);
    }

    let drained = ctx.drain().await?;
    match drained.end {
        DrainEnd::Complete => {
            for name in names {
                if collector.remove(file_type, name).await && !drained.answered(name) {
                    warn!(file = %name, file_type, "No result for file, skipped");
                }
            }
            Ok(Pass::Done)
        }
        DrainEnd::Reconnected => {
            for event in &drained.committed {
                if let Some(name) = event.name.as_deref() {
                    collector.remove(file_type, name).await;
                }
            }
            Ok(Pass::Reconnected)
        }
        DrainEnd::Aborted => Ok(Pass::Aborted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buckets_group_by_type_in_first_seen_order() {
        let mut buckets = ResultBuckets::default();
        buckets.insert(QueryHit::new("logs", "l1"));
        buckets.insert(QueryHit::new("images", "i1"));
        buckets.insert(QueryHit::new("logs", "l2"));
        buckets.insert(QueryHit::new("images", "i2"));

        assert_eq!(
            buckets.by_type(),
            vec![
                ("logs".to_string(), vec!["l1".to_string(), "l2".to_string()]),
                ("images".to_string(), vec!["i1".to_string(), "i2".to_string()]),
            ]
        );
        let order: Vec<String> = buckets.in_order().into_iter().map(|h| h.name).collect();
        assert_eq!(order, vec!["l1", "i1", "l2", "i2"]);
    }

    #[test]
    fn test_buckets_ignore_duplicates_and_remove() {
        let mut buckets = ResultBuckets::default();
        assert!(buckets.insert(QueryHit::new("logs", "l1")));
        assert!(!buckets.insert(QueryHit::new("logs", "l1")));
        assert!(buckets.insert(QueryHit::new("images", "l1")));
        assert_eq!(buckets.len(), 2);

        assert!(buckets.remove("logs", "l1"));
        assert!(!buckets.remove("logs", "l1"));
        assert_eq!(buckets.len(), 1);
    }
}
