//! Background expiry sweeper.
//!
//! Expired records are already invisible to searches and listings; the
//! sweeper only reclaims their rows. One sweeper runs per open project and
//! stops when its token is cancelled.

use ctxvault_core::memory::MemoryStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct ExpirySweeper {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ExpirySweeper {
    /// Spawn a sweep loop that purges expired records every `interval`.
    ///
    /// The first purge happens one interval after start.
    pub fn start(store: Arc<dyn MemoryStore>, interval: Duration) -> Self {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let interval = interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let project = store.project_id().to_string();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => match store.purge_expired().await {
                        Ok(0) => {}
                        Ok(purged) => debug!(project = %project, purged, "Expired memories purged"),
                        Err(e) => warn!(project = %project, error = %e, "Expiry sweep failed"),
                    },
                }
            }
            debug!(project = %project, "Expiry sweeper stopped");
        });

        Self {
            token,
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the loop and wait for an in-flight purge to finish.
    pub async fn cancel(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Expiry sweeper task ended abnormally");
            }
        }
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
