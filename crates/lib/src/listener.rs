//! Ingestion listener: pulls batches from the upstream source, in order, starting after the durable
//! checkpoint, and hands messages to the forwarder.
//!
//! The upstream is asked for the next batch only once the forwarder has admitted (durably recorded)
//! every message of the previous one, so acknowledging a batch upstream never loses messages that
//! were only held in memory. After an upstream failure the listener resumes from the checkpoint on
//! disk, not from its in-memory cursor.

use crate::channels::InboundMessage;
use crate::error::{Error, Result};
use crate::store::Store;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One batch from the upstream.
#[derive(Debug, Default)]
pub struct UpstreamBatch {
    /// Forwardable messages, in upstream order.
    pub messages: Vec<InboundMessage>,
    /// Highest offset the upstream returned, including updates without forwardable content.
    pub last_offset: Option<i64>,
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Request(String),
    #[error("upstream rejected credentials: {0}")]
    Unauthorized(String),
}

/// Upstream side of a channel.
#[async_trait]
pub trait Upstream: Send + Sync {
    fn id(&self) -> &str;
    /// Fetch the next batch of messages with offsets greater than `resume_after`
    /// (everything available when None). May wait for data (long poll).
    async fn receive(&self, resume_after: Option<i64>) -> Result<UpstreamBatch, UpstreamError>;
}

pub struct Listener {
    upstream: Arc<dyn Upstream>,
    store: Arc<Store>,
    retry_delay: Duration,
}

impl Listener {
    pub fn new(upstream: Arc<dyn Upstream>, store: Arc<Store>, retry_delay: Duration) -> Self {
        Self {
            upstream,
            store,
            retry_delay,
        }
    }

    /// Start the receive loop. `admitted` carries the highest offset the forwarder has recorded.
    pub fn start(
        self,
        inbound_tx: mpsc::Sender<InboundMessage>,
        admitted: watch::Receiver<Option<i64>>,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<()>> {
        log::info!("listener: starting {} receive loop", self.upstream.id());
        tokio::spawn(async move {
            let res = self.run(inbound_tx, admitted, cancel).await;
            log::info!("listener: receive loop stopped");
            res
        })
    }

    async fn run(
        self,
        inbound_tx: mpsc::Sender<InboundMessage>,
        mut admitted: watch::Receiver<Option<i64>>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut cursor = self.store.get_checkpoint().await?;
        log::info!("listener: resuming after offset {:?}", cursor);
        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                res = self.upstream.receive(cursor) => res,
            };
            let batch = match batch {
                Ok(b) => b,
                Err(UpstreamError::Unauthorized(e)) => {
                    return Err(Error::Configuration(format!(
                        "{} rejected credentials: {}",
                        self.upstream.id(),
                        e
                    )));
                }
                Err(e) => {
                    log::warn!("listener: {}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.retry_delay) => {}
                    }
                    cursor = self.store.get_checkpoint().await?;
                    log::debug!("listener: reconnecting after checkpoint {:?}", cursor);
                    continue;
                }
            };

            let mut messages = batch.messages;
            messages.sort_by_key(|m| m.offset);
            let mut sent_upto = None;
            for m in messages {
                if cursor.map_or(false, |c| m.offset <= c) {
                    continue;
                }
                let offset = m.offset;
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    res = inbound_tx.send(m) => {
                        if res.is_err() {
                            log::debug!("listener: inbound channel closed, stopping loop");
                            return Ok(());
                        }
                    }
                }
                cursor = Some(offset);
                sent_upto = Some(offset);
            }

            if let Some(upto) = sent_upto {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    ok = async { admitted.wait_for(|a| a.map_or(false, |a| a >= upto)).await.is_ok() } => {
                        if !ok {
                            return Ok(());
                        }
                    }
                }
            }
            if let Some(last) = batch.last_offset {
                cursor = Some(cursor.map_or(last, |c| c.max(last)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::Payload;
    use std::sync::Mutex;

    /// Serves a fixed list of messages; records every resume offset it was asked for.
    struct Scripted {
        messages: Vec<InboundMessage>,
        calls: Mutex<Vec<Option<i64>>>,
        fail_first: Mutex<bool>,
    }

    #[async_trait]
    impl Upstream for Scripted {
        fn id(&self) -> &str {
            "scripted"
        }

        async fn receive(&self, resume_after: Option<i64>) -> Result<UpstreamBatch, UpstreamError> {
            self.calls.lock().unwrap().push(resume_after);
            {
                let mut fail = self.fail_first.lock().unwrap();
                if *fail {
                    *fail = false;
                    return Err(UpstreamError::Request("connection reset".into()));
                }
            }
            let messages: Vec<InboundMessage> = self
                .messages
                .iter()
                .filter(|m| resume_after.map_or(true, |r| m.offset > r))
                .cloned()
                .collect();
            if messages.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let last_offset = messages.last().map(|m| m.offset);
            Ok(UpstreamBatch {
                messages,
                last_offset,
            })
        }
    }

    fn msg(offset: i64) -> InboundMessage {
        InboundMessage::new(offset, "-100", offset, Payload::text("x"))
    }

    #[tokio::test]
    async fn resumes_after_checkpoint_and_after_failure() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        store.set_checkpoint(2).await.unwrap();
        let upstream = Arc::new(Scripted {
            messages: (1..=4).map(msg).collect(),
            calls: Mutex::new(Vec::new()),
            fail_first: Mutex::new(true),
        });
        let (tx, mut rx) = mpsc::channel(8);
        let (admitted_tx, admitted_rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        let handle = Listener::new(upstream.clone(), store, Duration::from_millis(1)).start(
            tx,
            admitted_rx,
            cancel.clone(),
        );

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!((first.offset, second.offset), (3, 4));
        admitted_tx.send_replace(Some(4));
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        let calls = upstream.calls.lock().unwrap().clone();
        assert_eq!(calls[0], Some(2));
        assert_eq!(calls[1], Some(2));
        assert!(calls[2..].iter().all(|c| *c == Some(4)));
    }

    #[tokio::test]
    async fn waits_for_admission_before_next_batch() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let upstream = Arc::new(Scripted {
            messages: vec![msg(1)],
            calls: Mutex::new(Vec::new()),
            fail_first: Mutex::new(false),
        });
        let (tx, mut rx) = mpsc::channel(8);
        let (_admitted_tx, admitted_rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        let handle = Listener::new(upstream.clone(), store, Duration::from_millis(1)).start(
            tx,
            admitted_rx,
            cancel.clone(),
        );
        assert_eq!(rx.recv().await.unwrap().offset, 1);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(upstream.calls.lock().unwrap().len(), 1);
        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
