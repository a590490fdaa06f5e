//! Trailing debounce for configuration change notifications.
use std::time::Duration;

use tokio::{sync::mpsc, time::Instant};

use crate::utils::ShutdownSignal;

/// Turns bursts of change notifications into reloads spaced at least
/// `window` apart.
///
/// A notification that arrives inside the window is never discarded: the
/// reload waits for the window to close and then runs once for everything
/// received meanwhile.
#[derive(Debug)]
pub struct ChangeDebouncer {
    changes: mpsc::Receiver<()>,
    window: Duration,
    last_reload: Option<Instant>,
}

impl ChangeDebouncer {
    pub fn new(changes: mpsc::Receiver<()>, window: Duration) -> Self {
        Self {
            changes,
            window,
            last_reload: None,
        }
    }

    /// Resolves when a reload is due. Returns `false` once the notification
    /// channel is closed or shutdown has been triggered.
    pub async fn next_reload(&mut self, shutdown: &ShutdownSignal) -> bool {
        tokio::select! {
            _ = shutdown.triggered() => return false,
            event = self.changes.recv() => if event.is_none() { return false },
        }

        if let Some(last) = self.last_reload {
            let remaining = self.window.saturating_sub(last.elapsed());
            if !remaining.is_zero() {
                tracing::debug!("Deferring config reload by {:?}", remaining);
                tokio::select! {
                    _ = shutdown.triggered() => return false,
                    _ = tokio::time::sleep(remaining) => {}
                }
            }
        }

        while self.changes.try_recv().is_ok() {}
        self.last_reload = Some(Instant::now());
        true
    }
}
