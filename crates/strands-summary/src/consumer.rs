//! The queue consumer pool: reliable processing of completed conversations
//! with bounded retries and poison quarantine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;
use uuid::Uuid;

use strands_db::{SummaryStore, WorkQueue, SUMMARY_NOTIFICATIONS_CHANNEL};
use strands_types::{ChangeKind, StrandError, SummaryJob};

use crate::applier::ChangeApplier;
use crate::client::NpcStore;
use crate::extractor::ChangeExtractor;
use crate::generator::SummaryGenerator;

const POP_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(300);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Exponential backoff before a retry: min(60 * (n + 1), 300) seconds.
pub fn retry_backoff(retry_count: u32) -> Duration {
    Duration::from_secs(60 * (u64::from(retry_count) + 1)).min(MAX_RETRY_BACKOFF)
}

pub struct QueueConsumer {
    queue: Arc<dyn WorkQueue>,
    store: Arc<dyn SummaryStore>,
    npcs: Arc<dyn NpcStore>,
    generator: SummaryGenerator,
    extractor: ChangeExtractor,
    applier: ChangeApplier,
    worker_count: usize,
    max_retries: u32,
    processed: AtomicU64,
    failed: AtomicU64,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for QueueConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueConsumer")
            .field("worker_count", &self.worker_count)
            .finish_non_exhaustive()
    }
}

impl QueueConsumer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        store: Arc<dyn SummaryStore>,
        npcs: Arc<dyn NpcStore>,
        generator: SummaryGenerator,
        extractor: ChangeExtractor,
        applier: ChangeApplier,
        worker_count: usize,
        max_retries: u32,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            queue,
            store,
            npcs,
            generator,
            extractor,
            applier,
            worker_count,
            max_retries,
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            workers: Mutex::new(Vec::new()),
            shutdown,
        })
    }

    /// Spawn the worker pool. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut workers = lock(&self.workers);
        if !workers.is_empty() {
            return;
        }
        for worker_id in 0..self.worker_count {
            let consumer = Arc::clone(self);
            let mut stop = self.shutdown.subscribe();
            workers.push(tokio::spawn(async move {
                tracing::info!(worker_id, "summary worker started");
                loop {
                    if *stop.borrow() {
                        break;
                    }
                    let popped = tokio::select! {
                        popped = consumer.queue.pop(POP_TIMEOUT) => popped,
                        _ = stop.changed() => break,
                    };
                    match popped {
                        Ok(Some(payload)) => consumer.handle_payload(payload).await,
                        Ok(None) => {}
                        Err(e) => {
                            tracing::error!(worker_id, error = %e, "queue pop failed");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
                tracing::info!(worker_id, "summary worker stopped");
            }));
        }
    }

    /// Drain workers; anything mid-flight finishes its current job.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let workers: Vec<_> = lock(&self.workers).drain(..).collect();
        for worker in workers {
            let _ = worker.await;
        }
    }

    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub async fn queue_status(&self) -> serde_json::Value {
        json!({
            "queue_length": self.queue.len().await.unwrap_or(0),
            "poison_messages": self.queue.poison_len().await.unwrap_or(0),
            "workers": self.worker_count,
            "processed": self.processed_count(),
            "failed": self.failed_count(),
        })
    }

    async fn handle_payload(self: &Arc<Self>, payload: String) {
        let job: SummaryJob = match serde_json::from_str(&payload) {
            Ok(job) => job,
            Err(e) => {
                // Undecodable: quarantine the raw payload for inspection.
                tracing::error!(error = %e, "poison message quarantined");
                let _ = self.queue.quarantine(payload).await;
                return;
            }
        };
        let session_id = job.session_id;
        tracing::info!(%session_id, retry = job.retry_count, "processing summary job");
        if let Err(e) = self.process_job(&job).await {
            tracing::error!(%session_id, error = %e, "summary job failed");
            self.failed.fetch_add(1, Ordering::Relaxed);
            self.handle_job_error(job, &e).await;
        } else {
            self.processed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// The per-job pipeline of §4.6: summary, key points, record fetch,
    /// extraction, memory entry, auto-apply, persist, notify.
    pub async fn process_job(&self, job: &SummaryJob) -> Result<(), StrandError> {
        let summary = self.generator.generate_summary(&job.messages).await?;
        let key_points = self.generator.extract_key_points(&job.messages).await?;

        let strand = self
            .npcs
            .get(job.npc_id)
            .await?
            .ok_or(StrandError::NotFound)?;

        let changes = self
            .extractor
            .analyze_conversation(&job.messages, &strand)
            .await?;
        let memory_entry = self
            .generator
            .generate_memory_entry(&summary, &strand.name)
            .await?;

        let emotional_impact = changes
            .iter()
            .find_map(|c| match &c.kind {
                ChangeKind::EmotionalImpact(impact) => Some(serde_json::to_value(impact).ok()?),
                _ => None,
            })
            .unwrap_or(serde_json::Value::Null);

        let outcome = self
            .applier
            .apply(&self.npcs, job.npc_id, changes, memory_entry)
            .await?;

        let record = json!({
            "session_id": job.session_id,
            "npc_id": job.npc_id,
            "user_id": job.user_id,
            "summary": summary,
            "key_points": key_points,
            "emotional_impact": emotional_impact,
            "applied_changes": outcome.applied,
            "pending_changes": outcome.pending,
            "processed_at": Utc::now(),
        });
        self.store.store_summary(job.session_id, &record).await?;
        self.store.mark_completed(job.session_id).await?;
        self.store
            .publish(
                SUMMARY_NOTIFICATIONS_CHANNEL,
                &json!({
                    "type": "summary_completed",
                    "session_id": job.session_id,
                    "timestamp": Utc::now(),
                }),
            )
            .await?;

        tracing::info!(session_id = %job.session_id, "summary job complete");
        Ok(())
    }

    /// Retry with backoff up to the limit, then archive to the error key.
    async fn handle_job_error(self: &Arc<Self>, mut job: SummaryJob, error: &StrandError) {
        if job.retry_count < self.max_retries {
            let backoff = retry_backoff(job.retry_count);
            job.retry_count += 1;
            job.last_error = Some(error.to_string());
            job.retry_at = Some(Utc::now() + chrono::Duration::from_std(backoff).unwrap_or_default());
            let payload = match serde_json::to_string(&job) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::error!(error = %e, "failed to serialize retry job");
                    return;
                }
            };
            tracing::info!(
                session_id = %job.session_id,
                retry = job.retry_count,
                backoff_secs = backoff.as_secs(),
                "scheduling retry"
            );
            let queue = Arc::clone(&self.queue);
            tokio::spawn(async move {
                tokio::time::sleep(backoff).await;
                if let Err(e) = queue.push(payload).await {
                    tracing::error!(error = %e, "failed to re-enqueue job");
                }
            });
        } else {
            let record = json!({
                "session_id": job.session_id,
                "npc_id": job.npc_id,
                "error_message": error.to_string(),
                "error_kind": error.kind(),
                "original_job": job,
                "failed_at": Utc::now(),
            });
            if let Err(e) = self.store.store_error(job.session_id, &record).await {
                tracing::error!(error = %e, "failed to archive terminal job error");
            }
            tracing::error!(session_id = %job.session_id, "job moved to error key after max retries");
        }
    }

    pub async fn summary_for(&self, session_id: Uuid) -> Result<Option<serde_json::Value>, StrandError> {
        self.store.load_summary(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use strands_db::{MemoryQueue, MemorySummaryStore};
    use strands_types::{ChatMessage, LifeStrand, LifeStrandUpdate, MessageRole};

    use crate::client::CompletionClient;

    struct PlainModel;

    #[async_trait]
    impl CompletionClient for PlainModel {
        async fn complete(&self, prompt: &str, _max_tokens: u32) -> Result<String, StrandError> {
            if prompt.contains("key points") {
                Ok(r#"["They spoke about the harvest"]"#.to_string())
            } else if prompt.contains("current status") {
                Ok(r#"{"status_changes": [{"field": "mood", "new_value": "hopeful", "confidence": 0.9, "reasoning": "good news"}]}"#.to_string())
            } else if prompt.contains("JSON format") {
                Ok(r#"{"changes": []}"#.to_string())
            } else if prompt.contains("memory entry") {
                Ok("I talked with a traveler about the harvest.".to_string())
            } else {
                Ok("A short friendly talk about the harvest.".to_string())
            }
        }
    }

    struct FakeNpcStore {
        strand: Mutex<LifeStrand>,
        fail_gets: AtomicU64,
    }

    impl FakeNpcStore {
        fn with_strand(strand: LifeStrand) -> Self {
            Self {
                strand: Mutex::new(strand),
                fail_gets: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl NpcStore for FakeNpcStore {
        async fn get(&self, _npc_id: Uuid) -> Result<Option<LifeStrand>, StrandError> {
            if self
                .fail_gets
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
                .is_ok()
            {
                return Err(StrandError::ServiceUnavailable("npc service".into()));
            }
            Ok(Some(self.strand.lock().unwrap().clone()))
        }

        async fn apply_update(
            &self,
            _npc_id: Uuid,
            update: &LifeStrandUpdate,
        ) -> Result<bool, StrandError> {
            let mut strand = self.strand.lock().unwrap();
            strand.merge(update, Utc::now());
            Ok(true)
        }
    }

    fn job() -> SummaryJob {
        let now = Utc::now();
        SummaryJob {
            session_id: Uuid::new_v4(),
            npc_id: Uuid::new_v4(),
            user_id: "user-1".to_string(),
            messages: vec![
                ChatMessage::new(MessageRole::User, "how is the harvest?", now),
                ChatMessage::new(MessageRole::Assistant, "coming along nicely", now),
            ],
            created_at: now,
            ended_at: now,
            retry_count: 0,
            last_error: None,
            retry_at: None,
        }
    }

    fn consumer_with(
        npcs: Arc<FakeNpcStore>,
        queue: Arc<MemoryQueue>,
        store: Arc<MemorySummaryStore>,
        threshold: f64,
    ) -> Arc<QueueConsumer> {
        let model: Arc<dyn CompletionClient> = Arc::new(PlainModel);
        QueueConsumer::new(
            queue,
            store,
            npcs,
            SummaryGenerator::new(Arc::clone(&model)),
            ChangeExtractor::new(model),
            ChangeApplier::new(threshold),
            3,
            3,
        )
    }

    #[test]
    fn backoff_follows_the_curve() {
        assert_eq!(retry_backoff(0), Duration::from_secs(60));
        assert_eq!(retry_backoff(1), Duration::from_secs(120));
        assert_eq!(retry_backoff(4), Duration::from_secs(300));
        assert_eq!(retry_backoff(10), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn job_pipeline_stores_summary_and_applies_memory() {
        let npcs = Arc::new(FakeNpcStore::with_strand(LifeStrand::new("Alice")));
        let store = Arc::new(MemorySummaryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let consumer = consumer_with(npcs.clone(), queue, store.clone(), 0.6);

        let job = job();
        consumer.process_job(&job).await.unwrap();

        let record = store.load_summary(job.session_id).await.unwrap().unwrap();
        assert!(!record["summary"].as_str().unwrap().is_empty());
        assert_eq!(record["key_points"].as_array().unwrap().len(), 1);
        assert_eq!(store.completed(), vec![job.session_id]);
        assert!(store
            .published()
            .iter()
            .any(|(channel, payload)| channel == SUMMARY_NOTIFICATIONS_CHANNEL
                && payload["type"] == "summary_completed"));

        // The high-confidence status change and the memory were merged in.
        let strand = npcs.strand.lock().unwrap();
        assert_eq!(strand.current_status.mood.as_deref(), Some("hopeful"));
        assert_eq!(strand.memories.len(), 1);
    }

    #[tokio::test]
    async fn threshold_gates_auto_application() {
        let npcs = Arc::new(FakeNpcStore::with_strand(LifeStrand::new("Alice")));
        let store = Arc::new(MemorySummaryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        // Threshold above the extractor's 0.9 status confidence: pending.
        let consumer = consumer_with(npcs.clone(), queue, store.clone(), 0.95);

        let job = job();
        consumer.process_job(&job).await.unwrap();

        let record = store.load_summary(job.session_id).await.unwrap().unwrap();
        assert!(record["pending_changes"]
            .as_array()
            .unwrap()
            .iter()
            .any(|c| c["change_type"] == "status_updated"));
        let strand = npcs.strand.lock().unwrap();
        assert!(strand.current_status.mood.is_none());
        // The memory entry still applied unconditionally.
        assert_eq!(strand.memories.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_jobs_are_reenqueued_with_backoff() {
        let npcs = Arc::new(FakeNpcStore::with_strand(LifeStrand::new("Alice")));
        npcs.fail_gets.store(1, Ordering::SeqCst);
        let store = Arc::new(MemorySummaryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let consumer = consumer_with(npcs, Arc::clone(&queue), store, 0.6);

        let job = job();
        consumer
            .handle_payload(serde_json::to_string(&job).unwrap())
            .await;

        // Nothing yet: the retry is sleeping out its backoff.
        assert_eq!(queue.len().await.unwrap(), 0);
        tokio::time::advance(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;

        let payload = queue.pop(Duration::from_secs(1)).await.unwrap().unwrap();
        let retried: SummaryJob = serde_json::from_str(&payload).unwrap();
        assert_eq!(retried.retry_count, 1);
        assert!(retried.last_error.is_some());
    }

    #[tokio::test]
    async fn exhausted_retries_land_on_the_error_key() {
        let npcs = Arc::new(FakeNpcStore::with_strand(LifeStrand::new("Alice")));
        npcs.fail_gets.store(1, Ordering::SeqCst);
        let store = Arc::new(MemorySummaryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let consumer = consumer_with(npcs, queue, store.clone(), 0.6);

        let mut job = job();
        job.retry_count = 3;
        consumer
            .handle_payload(serde_json::to_string(&job).unwrap())
            .await;

        let error = store.load_error(job.session_id).await.unwrap().unwrap();
        assert_eq!(error["error_kind"], "service_unavailable");
        assert_eq!(error["original_job"]["retry_count"], 3);
    }

    #[tokio::test]
    async fn undecodable_payload_goes_to_poison() {
        let npcs = Arc::new(FakeNpcStore::with_strand(LifeStrand::new("Alice")));
        let store = Arc::new(MemorySummaryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let consumer = consumer_with(npcs, Arc::clone(&queue), store, 0.6);

        consumer.handle_payload("{not json".to_string()).await;
        assert_eq!(queue.poison_len().await.unwrap(), 1);
        assert_eq!(queue.poison_items(), vec!["{not json".to_string()]);
    }

    #[tokio::test]
    async fn worker_pool_drains_enqueued_jobs() {
        let npcs = Arc::new(FakeNpcStore::with_strand(LifeStrand::new("Alice")));
        let store = Arc::new(MemorySummaryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let consumer = consumer_with(npcs, Arc::clone(&queue), store.clone(), 0.6);

        let job = job();
        queue.push(serde_json::to_string(&job).unwrap()).await.unwrap();
        consumer.start();

        for _ in 0..100 {
            if consumer.processed_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(consumer.processed_count(), 1);
        assert!(store.load_summary(job.session_id).await.unwrap().is_some());
        consumer.shutdown().await;
    }
}
