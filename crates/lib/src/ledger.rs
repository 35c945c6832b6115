//! Dedup/idempotency ledger on top of the store.
//!
//! Decides, for each (message, target) pair, whether a dispatch is needed: terminal pairs are
//! skipped, pairs already being delivered in this process are skipped, everything else is claimed
//! and returned for dispatch. Claims are in-memory only; durability stays with the store.

use crate::channels::InboundMessage;
use crate::error::Result;
use crate::store::{DeliveryRecord, RecordKey, Store};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Result of admitting one message against the ledger.
#[derive(Debug, Default)]
pub struct Admission {
    /// Non-terminal records now claimed by the caller; each must be delivered and then released.
    pub dispatch: Vec<DeliveryRecord>,
    /// Records already terminal: no send.
    pub settled: Vec<DeliveryRecord>,
    /// Records currently claimed by another delivery task.
    pub in_flight: Vec<DeliveryRecord>,
}

impl Admission {
    /// True when every resolved target is terminal.
    pub fn is_settled(&self) -> bool {
        self.dispatch.is_empty() && self.in_flight.is_empty()
    }
}

pub struct Ledger {
    store: Arc<Store>,
    claims: Mutex<HashSet<RecordKey>>,
}

impl Ledger {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            claims: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Record the message with a pending record per target (existing records untouched) and split
    /// the resulting records into dispatch / settled / in-flight.
    pub async fn admit(&self, message: &InboundMessage, target_ids: &[String]) -> Result<Admission> {
        let records = self.store.admit_message(message, target_ids).await?;
        let mut admission = Admission::default();
        for record in records {
            if record.is_terminal() {
                log::debug!("ledger: {} already {}, skipping", record.key(), record.status);
                admission.settled.push(record);
            } else if self.claim(&record.key()) {
                admission.dispatch.push(record);
            } else {
                admission.in_flight.push(record);
            }
        }
        Ok(admission)
    }

    /// Claim a pending record found at startup. Returns None when the record is terminal or claimed.
    pub fn claim_pending(&self, record: DeliveryRecord) -> Option<DeliveryRecord> {
        if record.is_terminal() || !self.claim(&record.key()) {
            return None;
        }
        Some(record)
    }

    fn claim(&self, key: &RecordKey) -> bool {
        self.claims
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone())
    }

    /// Drop the in-process claim on a pair once its delivery task has ended.
    pub fn release(&self, key: &RecordKey) {
        self.claims
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    #[cfg(test)]
    fn claimed(&self) -> usize {
        self.claims.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
