//! Decoded webhook notifications and the pull they trigger.
//!
//! Transport lives in the binary; this module only decides what a payload
//! means and makes sure at most one webhook-driven pull runs at a time.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::reconciler::{PullOutcome, Reconciler};

pub const CONTENT_UPDATED: &str = "page.content_updated";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Subscription handshake; no sync.
    Verification(String),
    /// A pull pass was started.
    Accepted,
    /// A webhook pull is already running; this notification is discarded.
    Dropped,
    /// Not a notification kind we act on.
    Ignored,
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Verification(_) => "verification",
            Self::Accepted => "accepted",
            Self::Dropped => "dropped",
            Self::Ignored => "ignored",
        }
    }
}

pub struct WebhookGate {
    reconciler: Arc<Reconciler>,
    in_flight: Arc<PullSlot>,
}

#[derive(Default)]
struct PullSlot {
    busy: AtomicBool,
    idle: Notify,
}

/// Frees the pull slot when the pull task ends, however it ends.
struct InFlight(Arc<PullSlot>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.busy.store(false, Ordering::SeqCst);
        self.0.idle.notify_waiters();
    }
}

impl WebhookGate {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self {
            reconciler,
            in_flight: Arc::new(PullSlot::default()),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.busy.load(Ordering::SeqCst)
    }

    /// Resolve once no webhook-driven pull is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.in_flight.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_busy() {
                return;
            }
            notified.await;
        }
    }

    /// Classify `payload` and, for content updates, start one pull pass in
    /// the background.  Returns without waiting for the pull.
    pub fn handle(&self, payload: &Value) -> WebhookOutcome {
        if let Some(token) = payload.get("verification_token").and_then(Value::as_str) {
            info!(token, "webhook verification token received");
            return WebhookOutcome::Verification(token.to_string());
        }

        let kind = payload.get("type").and_then(Value::as_str).unwrap_or_default();
        if kind != CONTENT_UPDATED {
            debug!(kind, "ignoring webhook notification");
            return WebhookOutcome::Ignored;
        }

        if self
            .in_flight
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("webhook pull already running, dropping notification");
            return WebhookOutcome::Dropped;
        }

        let guard = InFlight(Arc::clone(&self.in_flight));
        let reconciler = Arc::clone(&self.reconciler);
        tokio::spawn(async move {
            let _guard = guard;
            match reconciler.pull_changes().await {
                Ok(PullOutcome::Skipped) => debug!("webhook pull skipped"),
                Ok(PullOutcome::Completed { pulled, created }) => {
                    info!(pulled, created, "webhook pull complete");
                }
                Err(err) => warn!(error = %format!("{err:#}"), "webhook pull failed"),
            }
        });
        WebhookOutcome::Accepted
    }
}
