use crate::feed::SourceFeed;
use crate::pipeline::Inserter;
use anyhow::Result;
use futures::TryStreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollState {
    Running,
    Draining,
    Stopped,
}

/// Repeatedly scans the source store for eligible batches and forwards
/// them. Cancellation is observed only between scans: once a scan starts it
/// runs to completion, so no in-flight batch is interrupted.
pub struct PollLoop {
    feed: Arc<dyn SourceFeed>,
    inserter: Inserter,
    serial: String,
    interval: Duration,
}

impl PollLoop {
    pub fn new(
        feed: Arc<dyn SourceFeed>,
        inserter: Inserter,
        serial: String,
        interval: Duration,
    ) -> Self {
        Self {
            feed,
            inserter,
            serial,
            interval,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut state = PollState::Running;
        while state == PollState::Running {
            if shutdown.is_cancelled() {
                state = PollState::Draining;
                continue;
            }
            tracing::debug!(serial = %self.serial, "scanning for eligible batches");
            if let Err(err) = self.scan().await {
                tracing::warn!(serial = %self.serial, error = %err, "scan failed; retrying on the next pass");
            }
            // Wake early on cancellation; the checkpoint at the top of the
            // loop decides whether another scan starts.
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.cancelled() => {}
            }
        }
        state = PollState::Stopped;
        tracing::info!(serial = %self.serial, ?state, "poll loop stopped");
    }

    async fn scan(&self) -> Result<()> {
        let mut batches = self.feed.select_eligible(&self.serial).await?;
        while let Some(batch) = batches.try_next().await? {
            self.inserter.forward_batch(self.feed.as_ref(), &batch).await;
        }
        Ok(())
    }
}
