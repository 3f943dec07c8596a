//! # Pending request registry
//!
//! A `requestId → PendingRequest` map, keyed by the request id the router
//! allocates when it accepts an inbound HTTP request. The entry is removed
//! when the final frame arrives, on timeout, or on session close: a pending
//! request is never left dangling once its session goes away.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

/// One part of a response as it arrives from the Agent.
#[derive(Debug, Clone)]
pub enum PendingEvent {
    Head {
        status: u16,
        headers: Vec<(String, String)>,
        has_more_body: bool,
    },
    Chunk(Vec<u8>),
    Final,
}

pub struct PendingRequest {
    pub mapping_id: Uuid,
    pub tx: mpsc::Sender<PendingEvent>,
    pub deadline: Instant,
    /// Set by the router task once it has delivered the head event to the
    /// edge response, so session-close cleanup knows whether a synthetic
    /// 502 is still possible or the stream must instead be truncated.
    pub head_delivered: Arc<AtomicBool>,
}

#[derive(Clone, Default)]
pub struct PendingRegistry {
    inner: Arc<DashMap<Uuid, PendingRequest>>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, request_id: Uuid, entry: PendingRequest) {
        self.inner.insert(request_id, entry);
    }

    pub fn remove(&self, request_id: &Uuid) -> Option<PendingRequest> {
        self.inner.remove(request_id).map(|(_, v)| v)
    }

    /// Delivers `event` to the pending entry for `request_id`, if one
    /// exists. Silently drops the event otherwise (the request may have
    /// already timed out or been cancelled).
    pub async fn deliver(&self, request_id: Uuid, event: PendingEvent) {
        let tx = self.inner.get(&request_id).map(|e| e.tx.clone());
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Drains every pending entry, completing each with a synthetic 502 if
    /// its head hasn't been delivered yet, or simply dropping the sender
    /// (which truncates the in-flight streamed response) otherwise. Called
    /// when the tunnel session ends.
    pub async fn fail_all(&self) {
        let entries: Vec<(Uuid, PendingRequest)> = self.inner.iter().map(|e| {
            (*e.key(), PendingRequest {
                mapping_id: e.value().mapping_id,
                tx: e.value().tx.clone(),
                deadline: e.value().deadline,
                head_delivered: e.value().head_delivered.clone(),
            })
        }).collect();
        self.inner.clear();

        for (_, entry) in entries {
            if !entry.head_delivered.load(Ordering::SeqCst) {
                let _ = entry
                    .tx
                    .send(PendingEvent::Head {
                        status: 502,
                        headers: vec![],
                        has_more_body: false,
                    })
                    .await;
            }
            let _ = entry.tx.send(PendingEvent::Final).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn fail_all_sends_synthetic_502_when_head_not_yet_delivered() {
        let registry = PendingRegistry::new();
        let (tx, mut rx) = mpsc::channel(4);
        let id = Uuid::new_v4();
        registry.insert(
            id,
            PendingRequest {
                mapping_id: Uuid::new_v4(),
                tx,
                deadline: Instant::now() + Duration::from_secs(120),
                head_delivered: Arc::new(AtomicBool::new(false)),
            },
        );

        registry.fail_all().await;
        match rx.recv().await {
            Some(PendingEvent::Head { status, .. }) => assert_eq!(status, 502),
            other => panic!("expected synthetic 502 head, got {other:?}"),
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn fail_all_skips_synthetic_head_once_already_delivered() {
        let registry = PendingRegistry::new();
        let (tx, mut rx) = mpsc::channel(4);
        let id = Uuid::new_v4();
        registry.insert(
            id,
            PendingRequest {
                mapping_id: Uuid::new_v4(),
                tx,
                deadline: Instant::now() + Duration::from_secs(120),
                head_delivered: Arc::new(AtomicBool::new(true)),
            },
        );

        registry.fail_all().await;
        match rx.recv().await {
            Some(PendingEvent::Final) => {}
            other => panic!("expected a bare Final (truncation), got {other:?}"),
        }
    }
}
