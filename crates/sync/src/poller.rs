//! Periodic pull catch-up.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::reconciler::{PullOutcome, Reconciler};

/// Run a pull pass every `interval` until `shutdown_rx` flips to `true`.
pub fn spawn_poller(
    reconciler: Arc<Reconciler>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs_f64(), "remote poller started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match reconciler.pull_changes().await {
                        Ok(PullOutcome::Skipped) => debug!("poll skipped"),
                        Ok(PullOutcome::Completed { pulled, created }) => {
                            if pulled + created > 0 {
                                info!(pulled, created, "poll pulled remote changes");
                            }
                        }
                        Err(err) => warn!(error = %format!("{err:#}"), "poll failed"),
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("remote poller stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use notesync_notion::Block;
    use notesync_notion::memory::ROOT_PAGE_ID;

    #[tokio::test]
    async fn polling_materializes_remote_pages_until_shutdown() {
        let h = Harness::new();
        let reconciler = Arc::new(h.open().unwrap());
        reconciler.startup_sync().await.unwrap();
        let remote = h.notion.add_page(ROOT_PAGE_ID, "later");
        h.notion.set_page_blocks(&remote, vec![Block::paragraph("arrived")]);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_poller(reconciler, Duration::from_millis(20), shutdown_rx);

        let path = h.root.join("later.md");
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !path.exists() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(h.read("later.md"), "arrived\n");

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn dropping_the_sender_stops_the_poller() {
        let h = Harness::new();
        let reconciler = Arc::new(h.open().unwrap());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_poller(reconciler, Duration::from_secs(3600), shutdown_rx);

        drop(shutdown_tx);

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
