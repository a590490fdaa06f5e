//! Per-key failure injection and request counting for exercising the gateway's
//! retry and rate-limit filters.
use std::time::{SystemTime, UNIX_EPOCH};

/// Outcome of one `/error/{id}` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCall {
    Failed { count: u32 },
    Succeeded { count: u32 },
}

/// Fails the first `failures` calls for every key, then succeeds.
#[derive(Debug)]
pub struct FailureInjector {
    failures: u32,
    counts: scc::HashMap<String, u32>,
}

impl FailureInjector {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            counts: scc::HashMap::new(),
        }
    }

    pub async fn call(&self, key: &str) -> ErrorCall {
        let count = {
            let mut entry = self
                .counts
                .entry_async(key.to_string())
                .await
                .or_insert(0);
            *entry.get_mut() += 1;
            *entry.get()
        };

        if count <= self.failures {
            tracing::info!("error for ID '{}' on count #{}", key, count);
            ErrorCall::Failed { count }
        } else {
            ErrorCall::Succeeded { count }
        }
    }

    pub async fn count(&self, key: &str) -> u32 {
        self.counts.read_async(key, |_, c| *c).await.unwrap_or(0)
    }
}

/// Counts `/hello` requests per wall-clock second.
#[derive(Debug, Default)]
pub struct HelloCounter {
    per_second: scc::HashMap<u64, u64>,
}

impl HelloCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one request and return how many arrived in the current second.
    pub async fn record(&self) -> u64 {
        let second = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let count = {
            let mut entry = self.per_second.entry_async(second).await.or_insert(0);
            *entry.get_mut() += 1;
            *entry.get()
        };
        // Keep only the last minute.
        self.per_second
            .retain_async(|s, _| *s + 60 >= second)
            .await;

        tracing::info!("There have been {} requests for the second {}", count, second);
        count
    }
}
