//! Spawned tasks that perform transfers and report back to the coordinator.
//!
//! An immediate transfer is a single POST. A durable transfer is journaled
//! first, then attempted until it gets an HTTP response, the retry policy
//! gives up, its resource timeout elapses, or it is cancelled. When the
//! process shuts down, durable tasks stop silently and keep their journal
//! entries so they resume on the next launch.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ferry_core::{Clock, JournalEntry, TransferKey};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    client::{DeliveryClient, DeliveryRequest},
    error::{DeliveryError, Result},
    retry::{RetryContext, RetryDecision, RetryPolicy},
    session::SessionEvent,
    storage::TransferJournal,
};

/// Everything a transfer task needs, shared by all transfers.
#[derive(Clone)]
pub(crate) struct TransferContext {
    pub client: DeliveryClient,
    pub journal: Arc<dyn TransferJournal>,
    pub clock: Arc<dyn Clock>,
    pub events: mpsc::UnboundedSender<SessionEvent>,
    pub shutdown: CancellationToken,
    pub retry_policy: RetryPolicy,
}

impl TransferContext {
    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("coordinator stopped, dropping session event");
        }
    }

    async fn stream(&self, request: DeliveryRequest) -> Result<u16> {
        let key = request.transfer.clone();
        let mut response = self.client.deliver(request).await?;
        let status_code = response.status_code();

        while let Some(chunk) = response.next_chunk().await? {
            self.emit(SessionEvent::DataReceived { key: key.clone(), chunk });
        }
        Ok(status_code)
    }

    async fn stream_cancellable(
        &self,
        request: DeliveryRequest,
        cancel: &CancellationToken,
    ) -> Result<u16> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(DeliveryError::Cancelled),
            result = self.stream(request) => result,
        }
    }

    /// Sleeps until `until` on the context clock. Returns `false` if
    /// cancelled first.
    async fn sleep_until(&self, until: DateTime<Utc>, cancel: &CancellationToken) -> bool {
        let Ok(delay) = (until - self.clock.now()).to_std() else {
            return !cancel.is_cancelled();
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => false,
            () = self.clock.sleep(delay) => true,
        }
    }
}

/// Runs one immediate transfer.
pub(crate) async fn run_immediate(
    ctx: TransferContext,
    request: DeliveryRequest,
    cancel: CancellationToken,
) {
    let key = request.transfer.clone();
    let outcome = ctx.stream_cancellable(request, &cancel).await;

    if ctx.shutdown.is_cancelled() {
        return;
    }
    ctx.emit(SessionEvent::Completed { key, outcome });
}

/// Runs one durable transfer.
///
/// `fresh` entries are journaled first; restored entries already are.
pub(crate) async fn run_durable(
    ctx: TransferContext,
    entry: JournalEntry,
    verify_tls: bool,
    fresh: bool,
    cancel: CancellationToken,
) {
    let key = TransferKey::new(entry.session_id.clone(), entry.transfer_id);

    if fresh {
        if let Err(e) = ctx.journal.insert(entry.clone()).await {
            tracing::error!(transfer_id = %key.transfer_id, error = %e, "failed to journal transfer");
            ctx.emit(SessionEvent::Completed { key, outcome: Err(e.into()) });
            return;
        }
    }
    ctx.emit(SessionEvent::Enqueued { key: key.clone() });

    let outcome = drive(&ctx, &key, &entry, verify_tls, &cancel).await;

    if ctx.shutdown.is_cancelled() {
        tracing::debug!(transfer_id = %key.transfer_id, "shutdown, leaving transfer journaled");
        return;
    }
    ctx.emit(SessionEvent::Completed { key, outcome });
}

async fn drive(
    ctx: &TransferContext,
    key: &TransferKey,
    entry: &JournalEntry,
    verify_tls: bool,
    cancel: &CancellationToken,
) -> Result<u16> {
    let mut attempts = entry.attempts;
    let mut next_attempt_at = entry.next_attempt_at;

    loop {
        if next_attempt_at > ctx.clock.now() && !ctx.sleep_until(next_attempt_at, cancel).await {
            return Err(DeliveryError::Cancelled);
        }

        let now = ctx.clock.now();
        if entry.is_expired(now) {
            let elapsed = (now - entry.created_at).num_seconds().max(0);
            tracing::warn!(transfer_id = %key.transfer_id, attempts, "resource timeout elapsed");
            return Err(DeliveryError::ResourceTimeout {
                elapsed_seconds: u64::try_from(elapsed).unwrap_or(0),
            });
        }

        attempts += 1;
        let request = DeliveryRequest {
            transfer: key.clone(),
            url: entry.url.clone(),
            body: entry.body.clone().into(),
            attempt_number: attempts,
            verify_tls,
        };

        let error = match ctx.stream_cancellable(request, cancel).await {
            Ok(status_code) => return Ok(status_code),
            Err(DeliveryError::Cancelled) => return Err(DeliveryError::Cancelled),
            Err(e) => e,
        };

        let context =
            RetryContext::new(attempts, error.clone(), ctx.clock.now(), ctx.retry_policy.clone());
        match context.decide_retry() {
            RetryDecision::Retry { next_attempt_at: scheduled } => {
                next_attempt_at = scheduled.min(entry.expires_at);
                tracing::warn!(
                    transfer_id = %key.transfer_id,
                    attempts,
                    next_attempt_at = %next_attempt_at,
                    error = %error,
                    "durable attempt failed, retrying"
                );

                if let Err(e) =
                    ctx.journal.record_attempt(key.transfer_id, attempts, next_attempt_at).await
                {
                    tracing::warn!(transfer_id = %key.transfer_id, error = %e, "failed to record attempt");
                }
                ctx.emit(SessionEvent::AttemptFailed { key: key.clone(), attempts, error });
            },
            RetryDecision::GiveUp { reason } => {
                tracing::warn!(transfer_id = %key.transfer_id, attempts, %reason, "giving up on transfer");
                return Err(error);
            },
        }
    }
}
