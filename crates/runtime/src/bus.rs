//! Event Bus (SPEC_FULL.md §4.6): per-job fan-out with seamless catch-up
//! (database replay) to live (in-memory) delivery.
//!
//! The non-blocking forward-to-subscriber idiom is grounded directly in
//! `api/streaming_journal.rs`'s `StreamingJournal::append`, which uses
//! `mpsc::Sender::try_send` so a slow consumer is dropped rather than ever
//! blocking the writer. Here the "ring" that guarantees no event is lost
//! between a subscriber's catch-up read and its live hookup is a
//! `tokio::sync::broadcast` channel — it is already exactly a bounded ring
//! buffer with lagged-receiver detection, which maps directly onto the
//! spec's `subscriber.slow` disconnect requirement.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};

use crate::store::{JobEvent, RetrievalStore};
use crate::types::JobId;

pub struct EventBus {
    store: Arc<dyn RetrievalStore>,
    ring_capacity: usize,
    channels: DashMap<JobId, broadcast::Sender<JobEvent>>,
}

impl EventBus {
    pub fn new(store: Arc<dyn RetrievalStore>, ring_capacity: usize) -> Self {
        Self {
            store,
            ring_capacity: ring_capacity.max(1),
            channels: DashMap::new(),
        }
    }

    fn sender_for(&self, job_id: JobId) -> broadcast::Sender<JobEvent> {
        self.channels
            .entry(job_id)
            .or_insert_with(|| broadcast::channel(self.ring_capacity).0)
            .clone()
    }

    /// Publish an already-persisted event. Never blocks: a `broadcast`
    /// send only writes into the ring and wakes receivers, it never waits
    /// on them. Called only by the job's own worker (SPEC_FULL.md §4.6).
    pub fn publish(&self, job_id: JobId, event: JobEvent) {
        let sender = self.sender_for(job_id);
        // No receivers is not an error: nobody is subscribed yet.
        let _ = sender.send(event);
    }

    /// Drop the channel for a job once it reaches a terminal state and all
    /// subscribers have drained it, to avoid an unbounded `channels` map.
    pub fn retire(&self, job_id: JobId) {
        self.channels.remove(&job_id);
    }

    /// Subscribe starting after `since_event_id`: first drains the
    /// persisted history from the Retrieval Store (catch-up), then
    /// transitions seamlessly to live publishes with no gap or duplicate.
    /// The returned receiver's capacity is `replay_window`; if the
    /// subscriber falls far enough behind for `broadcast` to report a lag,
    /// it is disconnected (channel closed) rather than force-fed a gap.
    pub async fn subscribe(&self, job_id: JobId, since_event_id: i64) -> mpsc::Receiver<JobEvent> {
        let mut live_rx = self.sender_for(job_id).subscribe();
        let (out_tx, out_rx) = mpsc::channel(self.ring_capacity);
        let store = self.store.clone();

        tokio::spawn(async move {
            let mut last_sent = since_event_id;

            match store.read_events(job_id, since_event_id, usize::MAX).await {
                Ok(events) => {
                    for event in events {
                        last_sent = event.event_id.0;
                        if out_tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "catch-up read failed");
                    return;
                }
            }

            loop {
                match live_rx.recv().await {
                    Ok(event) => {
                        if event.event_id.0 <= last_sent {
                            // Already delivered during catch-up.
                            continue;
                        }
                        last_sent = event.event_id.0;
                        if out_tx.try_send(event).is_err() {
                            tracing::debug!(job_id = %job_id, "subscriber slow or closed, disconnecting");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(job_id = %job_id, skipped, "subscriber lagged beyond ring capacity");
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        out_rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteRetrievalStore;
    use crate::types::{EventId, JobKind};
    use chrono::Utc;
    use serde_json::json;

    async fn store_with_job() -> (Arc<dyn RetrievalStore>, JobId) {
        let store: Arc<dyn RetrievalStore> = Arc::new(SqliteRetrievalStore::open_in_memory().unwrap());
        let job_id = match store
            .insert_job(JobKind::Research, json!({}), "k", chrono::Duration::hours(1), None)
            .await
            .unwrap()
        {
            crate::store::EnqueueResult::Created(id) => id,
            _ => unreachable!(),
        };
        (store, job_id)
    }

    #[tokio::test]
    async fn subscriber_receives_catchup_then_live_in_order() {
        let (store, job_id) = store_with_job().await;
        store.append_event(job_id, "job.started", json!({})).await.unwrap();
        store.append_event(job_id, "job.progress", json!({"p": 10})).await.unwrap();

        let bus = EventBus::new(store.clone(), 64);
        let mut rx = bus.subscribe(job_id, 0).await;

        let e1 = rx.recv().await.unwrap();
        let e2 = rx.recv().await.unwrap();
        assert_eq!(e1.event_id.0, 1);
        assert_eq!(e2.event_id.0, 2);

        let e3 = store.append_event(job_id, "job.succeeded", json!({})).await.unwrap();
        bus.publish(
            job_id,
            JobEvent {
                job_id,
                event_id: e3,
                event_type: "job.succeeded".to_string(),
                payload: json!({}),
                ts: Utc::now(),
            },
        );
        let e3_recv = rx.recv().await.unwrap();
        assert_eq!(e3_recv.event_id.0, 3);
    }

    #[tokio::test]
    async fn two_subscribers_with_same_cursor_see_identical_sequence() {
        let (store, job_id) = store_with_job().await;
        store.append_event(job_id, "job.started", json!({})).await.unwrap();

        let bus = EventBus::new(store.clone(), 64);
        let mut rx1 = bus.subscribe(job_id, 0).await;
        let mut rx2 = bus.subscribe(job_id, 0).await;

        assert_eq!(rx1.recv().await.unwrap().event_id.0, rx2.recv().await.unwrap().event_id.0);
    }

    #[test]
    fn event_id_ordering_is_numeric() {
        assert!(EventId(2) > EventId(1));
    }
}
