//! Retention sweeper - deletes terminal tasks past the retention window.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::domain::{MAX_PER_PAGE, PageRequest, StorageError, TaskFilter, TaskOrder};
use crate::ports::{Clock, TaskStore};

pub struct RetentionSweeper {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    retention: chrono::Duration,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        retention: chrono::Duration,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            retention,
            interval,
        }
    }

    /// Delete every terminal task that completed before `now - retention`.
    ///
    /// Pending and Running tasks are never touched. Running it twice in a row
    /// deletes nothing the second time.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let cutoff = now - self.retention;
        let filter = TaskFilter::expired(cutoff);

        let mut candidates = Vec::new();
        let mut page = PageRequest::first(MAX_PER_PAGE);
        loop {
            let batch = self.store.list(&filter, TaskOrder::CreatedDesc, page).await?;
            candidates.extend(batch.items.iter().map(|t| t.id));
            if !batch.has_next {
                break;
            }
            page.page += 1;
        }

        let mut deleted = 0;
        for task_id in candidates {
            // Re-check: the listing is a snapshot.
            let Some(task) = self.store.get(task_id).await? else {
                continue;
            };
            if !filter.matches(&task) {
                continue;
            }
            if self.store.delete(task_id).await? {
                deleted += 1;
            }
        }

        if deleted > 0 {
            info!(deleted, %cutoff, "swept expired tasks");
        } else {
            debug!(%cutoff, "nothing to sweep");
        }
        Ok(deleted)
    }

    /// Sweep every `interval` until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval = ?self.interval,
            retention_days = self.retention.num_days(),
            "retention sweeper started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep_once(self.clock.now()).await {
                        warn!(error = %err, "sweep failed, retrying on next tick");
                    }
                }
            }
        }
        info!("retention sweeper stopped");
    }
}
