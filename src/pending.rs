//! Pending set shared between a background producer and a consumer loop
//!
//! Entries land in the *arrived* region (producer side) and move to the
//! *in-process* region (consumer side) only through `advance`, which is the
//! single ownership hand-off. The producer can keep pushing while the consumer
//! works through its snapshot; an id present in either region is never queued
//! twice, so a duplicate notification cannot cause a second fetch.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::trace;

use crate::event::FileEvent;

/// A discovered file: either a bare name or a full record from the listener
#[derive(Debug, Clone, PartialEq)]
pub enum PendingItem {
    Name(String),
    Event(FileEvent),
}

impl PendingItem {
    pub fn id(&self) -> &str {
        match self {
            PendingItem::Name(name) => name,
            PendingItem::Event(event) => event.name.as_deref().unwrap_or(""),
        }
    }
}

/// Result of `PendingSet::push`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Already arrived or in process
    Duplicate,
}

#[derive(Default)]
struct Regions {
    arrived: VecDeque<PendingItem>,
    /// Every id in either region
    ids: HashSet<String>,
    in_process: Vec<PendingItem>,
}

impl Regions {
    fn len(&self) -> usize {
        self.arrived.len() + self.in_process.len()
    }
}

pub struct PendingSet {
    regions: Mutex<Regions>,
    capacity: usize,
    /// Signalled on push
    arrival: Notify,
    /// Signalled on remove
    space: Notify,
}

impl PendingSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            regions: Mutex::new(Regions::default()),
            capacity: capacity.max(1),
            arrival: Notify::new(),
            space: Notify::new(),
        }
    }

    /// Append to the arrived region, waiting while the set is full
    pub async fn push(&self, item: PendingItem) -> PushOutcome {
        loop {
            {
                let mut regions = self.regions.lock().await;
                if regions.ids.contains(item.id()) {
                    trace!(file = %item.id(), "Duplicate notification dropped");
                    return PushOutcome::Duplicate;
                }
                if regions.len() < self.capacity {
                    regions.ids.insert(item.id().to_string());
                    regions.arrived.push_back(item);
                    drop(regions);
                    self.arrival.notify_one();
                    return PushOutcome::Queued;
                }
            }
            self.space.notified().await;
        }
    }

    /// Move everything arrived into the in-process region and return the
    /// whole in-process snapshot, oldest first. Entries left over from a
    /// previous snapshot (e.g. after a connection failure) come first.
    pub async fn advance(&self) -> Vec<PendingItem> {
        let mut regions = self.regions.lock().await;
        let arrived: Vec<PendingItem> = regions.arrived.drain(..).collect();
        regions.in_process.extend(arrived);
        regions.in_process.clone()
    }

    /// Drop a handled id from the in-process region
    pub async fn remove(&self, id: &str) -> bool {
        let mut regions = self.regions.lock().await;
        let before = regions.in_process.len();
        regions.in_process.retain(|item| item.id() != id);
        let removed = regions.in_process.len() != before;
        if removed {
            regions.ids.remove(id);
            drop(regions);
            self.space.notify_one();
        }
        removed
    }

    pub async fn is_empty(&self) -> bool {
        self.regions.lock().await.len() == 0
    }

    pub async fn len(&self) -> usize {
        self.regions.lock().await.len()
    }

    /// Wait up to `tick` for a push; returns whether anything is pending
    pub async fn wait_for_arrival(&self, tick: Duration) -> bool {
        if !self.is_empty().await {
            return true;
        }
        let _ = tokio::time::timeout(tick, self.arrival.notified()).await;
        !self.is_empty().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn name(n: &str) -> PendingItem {
        PendingItem::Name(n.to_string())
    }

    #[tokio::test]
    async fn test_advance_moves_arrived_to_in_process() {
        let set = PendingSet::new(16);
        set.push(name("a.dat")).await;
        set.push(name("b.dat")).await;

        let snapshot = set.advance().await;
        assert_eq!(snapshot, vec![name("a.dat"), name("b.dat")]);

        // Later arrivals join only at the next advance
        set.push(name("c.dat")).await;
        assert_eq!(set.len().await, 3);
        assert_eq!(set.advance().await, vec![name("a.dat"), name("b.dat"), name("c.dat")]);
    }

    #[tokio::test]
    async fn test_duplicate_of_in_flight_file_dropped() {
        let set = PendingSet::new(16);
        assert_eq!(set.push(name("a.dat")).await, PushOutcome::Queued);
        set.advance().await;

        assert_eq!(set.push(name("a.dat")).await, PushOutcome::Duplicate);
        assert_eq!(set.advance().await.len(), 1);

        assert!(set.remove("a.dat").await);
        assert_eq!(set.push(name("a.dat")).await, PushOutcome::Queued);
    }

    #[tokio::test]
    async fn test_unremoved_entries_stay_for_next_snapshot() {
        let set = PendingSet::new(16);
        set.push(name("a.dat")).await;
        set.push(name("b.dat")).await;
        set.advance().await;
        set.remove("b.dat").await;

        set.push(name("c.dat")).await;
        assert_eq!(set.advance().await, vec![name("a.dat"), name("c.dat")]);
    }

    #[tokio::test]
    async fn test_push_waits_for_space() {
        let set = Arc::new(PendingSet::new(1));
        set.push(name("a.dat")).await;

        let producer = {
            let set = set.clone();
            tokio::spawn(async move { set.push(name("b.dat")).await })
        };
        tokio::task::yield_now().await;
        assert!(!producer.is_finished());

        set.advance().await;
        set.remove("a.dat").await;
        assert_eq!(producer.await.unwrap(), PushOutcome::Queued);
        assert_eq!(set.advance().await, vec![name("b.dat")]);
    }

    #[tokio::test]
    async fn test_concurrent_producer_each_id_handled_once() {
        let set = Arc::new(PendingSet::new(32));
        let producer = {
            let set = set.clone();
            tokio::spawn(async move {
                for i in 0..500 {
                    set.push(name(&format!("f{}", i))).await;
                }
            })
        };

        let mut handled = HashSet::new();
        let mut fetches = 0usize;
        while handled.len() < 500 {
            for item in set.advance().await {
                fetches += 1;
                assert!(handled.insert(item.id().to_string()), "fetched twice: {}", item.id());
                set.remove(item.id()).await;
            }
            set.wait_for_arrival(Duration::from_millis(10)).await;
        }
        producer.await.unwrap();
        assert_eq!(fetches, 500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_arrival_times_out_when_idle() {
        let set = PendingSet::new(4);
        assert!(!set.wait_for_arrival(Duration::from_millis(50)).await);
    }
}
