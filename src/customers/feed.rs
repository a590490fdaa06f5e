//! Shared customer feed: one producer task feeding a broadcast channel.
//!
//! The producer starts when the first subscriber arrives and stops once the
//! last one has gone; ids keep counting across restarts. Each subscriber has
//! its own bounded cursor, so a slow one skips the oldest customers instead of
//! holding the others back.
use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

pub const NAMES: [&str; 11] = [
    "Jean",
    "Max",
    "Maria",
    "Dave",
    "Jose",
    "NiceWraith",
    "Phil",
    "Jinx",
    "Puji",
    "Washy",
    "Ash",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: u64,
    pub name: String,
}

impl Customer {
    pub fn numbered(id: u64) -> Self {
        Self {
            id,
            name: NAMES[(id % NAMES.len() as u64) as usize].to_string(),
        }
    }
}

struct FeedInner {
    sender: broadcast::Sender<Customer>,
    interval: Duration,
    last_id: AtomicU64,
    running: Mutex<bool>,
    shutdown: CancellationToken,
}

/// Handle to the shared feed; clones share one producer.
#[derive(Clone)]
pub struct CustomerFeed {
    inner: Arc<FeedInner>,
}

impl CustomerFeed {
    pub fn new(interval: Duration, capacity: usize, shutdown: CancellationToken) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(FeedInner {
                sender,
                interval,
                last_id: AtomicU64::new(0),
                running: Mutex::new(false),
                shutdown,
            }),
        }
    }

    /// Join the feed, starting the producer if nobody else is listening.
    pub fn subscribe(&self) -> broadcast::Receiver<Customer> {
        let mut running = self
            .inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let receiver = self.inner.sender.subscribe();
        if !*running && !self.inner.shutdown.is_cancelled() {
            *running = true;
            tracing::debug!("Starting customer producer");
            tokio::spawn(produce(self.inner.clone()));
        }
        receiver
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.sender.receiver_count()
    }

    pub fn is_producing(&self) -> bool {
        *self
            .inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

async fn produce(inner: Arc<FeedInner>) {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = tokio::time::sleep(inner.interval) => {}
        }

        let id = inner.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        if inner.sender.send(Customer::numbered(id)).is_err() {
            // Decide under the lock so a concurrent subscribe either sees
            // the producer running or starts a new one.
            let mut running = inner.running.lock().unwrap_or_else(PoisonError::into_inner);
            if inner.sender.receiver_count() == 0 {
                *running = false;
                tracing::debug!("Customer producer idle, stopping after id {}", id);
                return;
            }
        }
    }

    *inner.running.lock().unwrap_or_else(PoisonError::into_inner) = false;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(capacity: usize) -> CustomerFeed {
        CustomerFeed::new(Duration::from_millis(10), capacity, CancellationToken::new())
    }

    #[test]
    fn test_names_cycle_by_id() {
        assert_eq!(Customer::numbered(1).name, "Max");
        assert_eq!(Customer::numbered(11).name, "Jean");
        assert_eq!(Customer::numbered(16).name, "NiceWraith");
    }

    #[tokio::test]
    async fn test_subscribers_share_one_sequence() {
        let feed = feed(16);
        let mut first = feed.subscribe();
        let mut second = feed.subscribe();

        let a = first.recv().await.unwrap();
        let b = second.recv().await.unwrap();
        assert_eq!(a, b);
        assert_eq!(first.recv().await.unwrap().id, a.id + 1);
    }

    #[tokio::test]
    async fn test_producer_stops_without_subscribers_and_restarts() {
        let feed = feed(16);
        let mut rx = feed.subscribe();
        let first = rx.recv().await.unwrap();
        drop(rx);

        tokio::time::timeout(Duration::from_secs(1), async {
            while feed.is_producing() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let mut rx = feed.subscribe();
        assert!(feed.is_producing());
        let next = rx.recv().await.unwrap();
        assert!(next.id > first.id);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_oldest() {
        let feed = feed(2);
        let mut slow = feed.subscribe();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(matches!(
            slow.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        assert!(slow.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_stops_producer() {
        let token = CancellationToken::new();
        let feed = CustomerFeed::new(Duration::from_millis(10), 4, token.clone());
        let mut rx = feed.subscribe();
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), async {
            while feed.is_producing() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        while rx.try_recv().is_ok() {}
        assert!(rx.try_recv().is_err());
    }
}
