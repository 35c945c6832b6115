//! Orchestrator: listener -> router -> ledger -> delivery worker -> store.
//!
//! Owns startup recovery, the delivery task set, retry scheduling, checkpoint advancement and
//! graceful drain.

use crate::channels::InboundMessage;
use crate::delivery::{DeliveryOutcome, DeliveryWorker, Outbound, RetryPolicy};
use crate::error::{Error, Result};
use crate::forwarder::checkpoint::CheckpointTracker;
use crate::ledger::Ledger;
use crate::listener::{Listener, Upstream};
use crate::routing::{ForwardTarget, Router};
use crate::store::{DeliveryRecord, DeliveryStatus, Store};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

const INBOUND_BUFFER: usize = 64;

/// Runtime knobs for one forwarder run.
#[derive(Debug, Clone)]
pub struct ForwarderOptions {
    pub router: Router,
    pub retry: RetryPolicy,
    /// Concurrent send attempts.
    pub concurrency: usize,
    pub attempt_timeout: Duration,
    pub drain_timeout: Duration,
    /// Ingestion pauses while this many delivery tasks are outstanding.
    pub max_pending: usize,
    /// Chat that receives failed-permanent notices.
    pub owner_chat: Option<String>,
    /// Wait before the listener reconnects after an upstream error.
    pub listener_retry_delay: Duration,
}

impl ForwarderOptions {
    pub fn new(router: Router) -> Self {
        Self {
            router,
            retry: RetryPolicy::default(),
            concurrency: 4,
            attempt_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(10),
            max_pending: 256,
            owner_chat: None,
            listener_retry_delay: Duration::from_secs(2),
        }
    }
}

/// Counters for one run, logged at shutdown.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub recovered: usize,
    pub ingested: u64,
    pub delivered: u64,
    pub failed: u64,
    /// Deliveries left pending at shutdown (resumed on the next start).
    pub abandoned: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskReport {
    Delivered,
    Failed,
    Abandoned,
}

impl RunSummary {
    fn record(&mut self, joined: Result<Result<TaskReport>, JoinError>) -> Result<()> {
        match joined {
            Ok(Ok(TaskReport::Delivered)) => self.delivered += 1,
            Ok(Ok(TaskReport::Failed)) => self.failed += 1,
            Ok(Ok(TaskReport::Abandoned)) => self.abandoned += 1,
            Ok(Err(e)) => return Err(e),
            Err(e) if e.is_cancelled() => self.abandoned += 1,
            Err(e) => {
                log::error!("forwarder: delivery task panicked: {}", e);
                self.abandoned += 1;
            }
        }
        Ok(())
    }
}

/// State shared by the orchestrator loop and its delivery tasks.
struct Shared {
    router: Router,
    ledger: Ledger,
    worker: DeliveryWorker,
    retry: RetryPolicy,
    permits: Semaphore,
    /// Held across the settling transaction so checkpoint writes follow tracker order.
    tracker: Mutex<CheckpointTracker>,
    /// Cancels backoff waits and queued first attempts at shutdown.
    retry_cancel: CancellationToken,
    owner_chat: Option<String>,
}

type DeliveryTasks = JoinSet<Result<TaskReport>>;

pub struct Forwarder {
    options: ForwarderOptions,
    store: Arc<Store>,
    upstream: Arc<dyn Upstream>,
    outbound: Arc<dyn Outbound>,
}

impl Forwarder {
    pub fn new(
        options: ForwarderOptions,
        store: Arc<Store>,
        upstream: Arc<dyn Upstream>,
        outbound: Arc<dyn Outbound>,
    ) -> Self {
        Self {
            options,
            store,
            upstream,
            outbound,
        }
    }

    /// Run until `shutdown` is cancelled or a fatal error occurs. Pending deliveries from a previous
    /// run are resumed before the listener starts.
    pub async fn run(self, shutdown: CancellationToken) -> Result<RunSummary> {
        let checkpoint = self.store.get_checkpoint().await?;
        log::info!("forwarder: starting at checkpoint {:?}", checkpoint);
        let shared = Arc::new(Shared {
            router: self.options.router.clone(),
            ledger: Ledger::new(Arc::clone(&self.store)),
            worker: DeliveryWorker::new(Arc::clone(&self.outbound), self.options.attempt_timeout),
            retry: self.options.retry.clone(),
            permits: Semaphore::new(self.options.concurrency.max(1)),
            tracker: Mutex::new(CheckpointTracker::new(checkpoint)),
            retry_cancel: CancellationToken::new(),
            owner_chat: self.options.owner_chat.clone(),
        });
        let max_pending = self.options.max_pending.max(1);
        let mut tasks: DeliveryTasks = JoinSet::new();
        let mut summary = RunSummary {
            recovered: shared.recover(&mut tasks).await?,
            ..Default::default()
        };

        let listener_cancel = shutdown.child_token();
        let (inbound_tx, mut inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let (admitted_tx, admitted_rx) = watch::channel(checkpoint);
        let mut listener = Some(
            Listener::new(
                Arc::clone(&self.upstream),
                Arc::clone(&self.store),
                self.options.listener_retry_delay,
            )
            .start(inbound_tx, admitted_rx, listener_cancel.clone()),
        );

        let mut fatal: Option<Error> = None;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    log::info!("forwarder: shutdown requested");
                    break;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = summary.record(joined) {
                        fatal = Some(e);
                        break;
                    }
                }
                received = inbound_rx.recv(), if tasks.len() < max_pending => {
                    let Some(message) = received else {
                        if let Some(handle) = listener.take() {
                            match handle.await {
                                Ok(Ok(())) => log::info!("forwarder: listener finished"),
                                Ok(Err(e)) => fatal = Some(e),
                                Err(e) => log::error!("forwarder: listener task failed: {}", e),
                            }
                        }
                        break;
                    };
                    summary.ingested += 1;
                    let offset = message.offset;
                    if let Err(e) = shared.ingest(message, &mut tasks).await {
                        fatal = Some(e);
                        break;
                    }
                    admitted_tx.send_replace(Some(offset));
                }
            }
        }

        listener_cancel.cancel();
        shared.retry_cancel.cancel();
        drop(inbound_rx);
        if let Some(handle) = listener.take() {
            if let Ok(Err(e)) = handle.await {
                log::warn!("forwarder: listener stopped with error: {}", e);
            }
        }

        if !tasks.is_empty() {
            log::info!(
                "forwarder: draining {} delivery task(s) for {} unsettled message(s) (up to {}s)",
                tasks.len(),
                shared.tracker.lock().await.open_messages(),
                self.options.drain_timeout.as_secs()
            );
        }
        let drained = tokio::time::timeout(self.options.drain_timeout, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = summary.record(joined) {
                    fatal.get_or_insert(e);
                }
            }
        })
        .await;
        if drained.is_err() {
            log::warn!(
                "forwarder: drain timed out, aborting {} delivery task(s)",
                tasks.len()
            );
            tasks.abort_all();
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = summary.record(joined) {
                    fatal.get_or_insert(e);
                }
            }
        }

        log::info!(
            "forwarder: stopped (recovered {}, ingested {}, delivered {}, failed {}, left pending {})",
            summary.recovered,
            summary.ingested,
            summary.delivered,
            summary.failed,
            summary.abandoned
        );
        match fatal {
            Some(e) => {
                log::error!("forwarder: {}", e);
                Err(e)
            }
            None => Ok(summary),
        }
    }
}

impl Shared {
    /// Resume every non-terminal record left by a previous run.
    async fn recover(self: &Arc<Self>, tasks: &mut DeliveryTasks) -> Result<usize> {
        let pending = self.ledger.store().list_pending().await?;
        if pending.is_empty() {
            return Ok(0);
        }
        log::info!(
            "forwarder: recovering {} pending delivery record(s)",
            pending.len()
        );
        let mut messages: HashMap<String, Option<InboundMessage>> = HashMap::new();
        let mut resumed = 0;
        for record in pending {
            let Some(target) = self.router.target(&record.target_id).cloned() else {
                self.fail(record, "target no longer configured".to_string())
                    .await?;
                continue;
            };
            if !messages.contains_key(&record.message_id) {
                let message = self.ledger.store().get_message(&record.message_id).await?;
                messages.insert(record.message_id.clone(), message);
            }
            let Some(message) = messages.get(&record.message_id).cloned().flatten() else {
                self.fail(record, "message payload missing from store".to_string())
                    .await?;
                continue;
            };
            let Some(record) = self.ledger.claim_pending(record) else {
                continue;
            };
            self.tracker
                .lock()
                .await
                .track(record.offset, [record.target_id.clone()]);
            self.spawn_delivery(tasks, message, target, record);
            resumed += 1;
        }
        Ok(resumed)
    }

    /// Route, record and dispatch one inbound message.
    async fn ingest(self: &Arc<Self>, message: InboundMessage, tasks: &mut DeliveryTasks) -> Result<()> {
        let targets = self.router.resolve_targets(&message);
        if targets.is_empty() {
            log::debug!("forwarder: {} (offset {}) has no targets", message.id, message.offset);
            self.tracker.lock().await.track(message.offset, Vec::new());
            return self.advance_checkpoint().await;
        }
        let ids: Vec<String> = targets.iter().map(|t| t.id.clone()).collect();
        let admission = self.ledger.admit(&message, &ids).await?;
        if admission.is_settled() {
            log::info!(
                "forwarder: {} already settled for all {} target(s)",
                message.id,
                ids.len()
            );
            self.tracker.lock().await.track(message.offset, Vec::new());
            return self.advance_checkpoint().await;
        }
        log::info!(
            "forwarder: {} -> {} target(s), {} to deliver, {} already settled",
            message.id,
            ids.len(),
            admission.dispatch.len(),
            admission.settled.len()
        );
        {
            let mut tracker = self.tracker.lock().await;
            tracker.track(message.offset, Vec::new());
            for record in &admission.dispatch {
                tracker.track(record.offset, [record.target_id.clone()]);
            }
        }
        for record in admission.dispatch {
            match targets.iter().find(|t| t.id == record.target_id) {
                Some(target) => self.spawn_delivery(tasks, message.clone(), target.clone(), record),
                None => self.ledger.release(&record.key()),
            }
        }
        self.advance_checkpoint().await
    }

    fn spawn_delivery(
        self: &Arc<Self>,
        tasks: &mut DeliveryTasks,
        message: InboundMessage,
        target: ForwardTarget,
        record: DeliveryRecord,
    ) {
        let shared = Arc::clone(self);
        tasks.spawn(async move {
            let key = record.key();
            let res = shared.deliver_until_settled(&message, &target, record).await;
            shared.ledger.release(&key);
            res
        });
    }

    /// Attempt delivery until the record is terminal, the attempt cap is hit, or shutdown.
    async fn deliver_until_settled(
        &self,
        message: &InboundMessage,
        target: &ForwardTarget,
        mut record: DeliveryRecord,
    ) -> Result<TaskReport> {
        loop {
            let acquired = tokio::select! {
                _ = self.retry_cancel.cancelled() => return Ok(TaskReport::Abandoned),
                p = self.permits.acquire() => p,
            };
            let Ok(permit) = acquired else {
                return Ok(TaskReport::Abandoned);
            };
            log::debug!(
                "forwarder: sending {} (attempt {})",
                record.key(),
                record.attempts + 1
            );
            let outcome = self.worker.deliver(message, target).await;
            drop(permit);
            record.attempts += 1;
            record.last_attempt_at = Some(Utc::now());

            match outcome {
                DeliveryOutcome::Delivered => {
                    record.status = DeliveryStatus::Delivered;
                    record.last_error = None;
                    self.settle(&record).await?;
                    log::info!(
                        "forwarder: delivered {} to {} (attempt {})",
                        record.message_id,
                        target.chat_id,
                        record.attempts
                    );
                    return Ok(TaskReport::Delivered);
                }
                DeliveryOutcome::PermanentFailure { reason } => {
                    return self.fail(record, reason).await;
                }
                DeliveryOutcome::TransientFailure {
                    reason,
                    retry_after,
                } => {
                    if !self.retry.allows_retry(record.attempts) {
                        let reason =
                            format!("gave up after {} attempts: {}", record.attempts, reason);
                        return self.fail(record, reason).await;
                    }
                    let delay = self.retry.delay_for(record.attempts, retry_after);
                    log::warn!(
                        "forwarder: {} attempt {} failed ({}), retrying in {}ms",
                        record.key(),
                        record.attempts,
                        reason,
                        delay.as_millis()
                    );
                    record.last_error = Some(reason);
                    self.ledger.store().upsert_delivery_record(&record).await?;
                    tokio::select! {
                        _ = self.retry_cancel.cancelled() => return Ok(TaskReport::Abandoned),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Mark a record failed-permanent, surface it, notify the owner.
    async fn fail(&self, mut record: DeliveryRecord, reason: String) -> Result<TaskReport> {
        record.status = DeliveryStatus::FailedPermanent;
        record.last_error = Some(reason.clone());
        self.settle(&record).await?;
        log::error!(
            "forwarder: {} failed permanently after {} attempt(s): {}",
            record.key(),
            record.attempts,
            reason
        );
        if let Some(owner) = &self.owner_chat {
            let text = format!(
                "Forwarding message {} to target {} failed permanently: {}",
                record.message_id, record.target_id, reason
            );
            if let Err(e) = self.worker.outbound().notify(owner, &text).await {
                log::warn!("forwarder: owner notification failed: {}", e);
            }
        }
        Ok(TaskReport::Failed)
    }

    /// Write a terminal record and advance the checkpoint with it, atomically.
    async fn settle(&self, record: &DeliveryRecord) -> Result<()> {
        let mut tracker = self.tracker.lock().await;
        tracker.resolve(record.offset, &record.target_id);
        let candidate = tracker.candidate();
        if let Err(e) = self.ledger.store().settle(record, candidate).await {
            tracker.track(record.offset, [record.target_id.clone()]);
            return Err(e);
        }
        if let Some(offset) = candidate {
            tracker.commit(offset);
            log::debug!("forwarder: checkpoint advanced to {}", offset);
        }
        Ok(())
    }

    async fn advance_checkpoint(&self) -> Result<()> {
        let mut tracker = self.tracker.lock().await;
        if let Some(offset) = tracker.candidate() {
            self.ledger.store().set_checkpoint(offset).await?;
            tracker.commit(offset);
            log::debug!("forwarder: checkpoint advanced to {}", offset);
        }
        Ok(())
    }
}
