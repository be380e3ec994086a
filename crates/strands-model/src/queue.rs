//! Priority queues and the worker loops that drain them.
//!
//! A min-heap keyed by `(priority, enqueued_at)` with bounded capacity.
//! Generation workers pop the highest-priority request, make sure the
//! runtime holds the right model, and hand the resulting token stream back
//! through the request's completion handle. Embedding workers batch
//! requests across callers before hitting the embedding instance.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{oneshot, watch, Notify};
use tokio::time::Instant;

use strands_types::{ModelType, SamplingParams, StrandError};

use crate::runtime::{EmbeddingPool, GenerationPool};
use crate::stream::TokenStream;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reconstruct an error with the same kind for fan-out to batch callers.
fn replicate(err: &StrandError) -> StrandError {
    match err {
        StrandError::Timeout => StrandError::Timeout,
        StrandError::Cancelled => StrandError::Cancelled,
        StrandError::QueueFull => StrandError::QueueFull,
        StrandError::ServiceUnavailable(s) => StrandError::ServiceUnavailable(s.clone()),
        StrandError::LoadFailed(s) => StrandError::LoadFailed(s.clone()),
        other => StrandError::GenerationFailed(other.to_string()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueueKey {
    priority: u8,
    enqueued_at: Instant,
    seq: u64,
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so the BinaryHeap max is the lowest (priority, time, seq).
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.enqueued_at.cmp(&self.enqueued_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
pub struct QueuedGeneration {
    key: QueueKey,
    pub deadline: Instant,
    pub model_type: ModelType,
    pub prompt: String,
    pub params: SamplingParams,
    pub responder: oneshot::Sender<Result<TokenStream, StrandError>>,
}

impl PartialEq for QueuedGeneration {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl Eq for QueuedGeneration {}
impl Ord for QueuedGeneration {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.key.cmp(&other.key)
    }
}
impl PartialOrd for QueuedGeneration {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
pub struct QueuedEmbedding {
    key: QueueKey,
    pub deadline: Instant,
    pub texts: Vec<String>,
    pub responder: oneshot::Sender<Result<Vec<Vec<f32>>, StrandError>>,
}

impl PartialEq for QueuedEmbedding {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl Eq for QueuedEmbedding {}
impl Ord for QueuedEmbedding {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.key.cmp(&other.key)
    }
}
impl PartialOrd for QueuedEmbedding {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct QueuesInner {
    generation: BinaryHeap<QueuedGeneration>,
    embedding: BinaryHeap<QueuedEmbedding>,
}

/// Shared request queues with bounded capacity.
#[derive(Debug)]
pub struct RequestQueues {
    inner: Mutex<QueuesInner>,
    generation_ready: Notify,
    embedding_ready: Notify,
    capacity: usize,
    seq: AtomicU64,
}

impl RequestQueues {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(QueuesInner::default()),
            generation_ready: Notify::new(),
            embedding_ready: Notify::new(),
            capacity,
            seq: AtomicU64::new(0),
        })
    }

    fn next_key(&self, priority: u8) -> QueueKey {
        QueueKey {
            priority,
            enqueued_at: Instant::now(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn generation_depth(&self) -> usize {
        lock(&self.inner).generation.len()
    }

    pub fn embedding_depth(&self) -> usize {
        lock(&self.inner).embedding.len()
    }

    pub fn push_generation(
        &self,
        priority: u8,
        deadline: Instant,
        model_type: ModelType,
        prompt: String,
        params: SamplingParams,
        responder: oneshot::Sender<Result<TokenStream, StrandError>>,
    ) -> Result<(), StrandError> {
        {
            let mut inner = lock(&self.inner);
            if inner.generation.len() >= self.capacity {
                return Err(StrandError::QueueFull);
            }
            inner.generation.push(QueuedGeneration {
                key: self.next_key(priority),
                deadline,
                model_type,
                prompt,
                params,
                responder,
            });
        }
        self.generation_ready.notify_one();
        Ok(())
    }

    pub fn push_embedding(
        &self,
        priority: u8,
        deadline: Instant,
        texts: Vec<String>,
        responder: oneshot::Sender<Result<Vec<Vec<f32>>, StrandError>>,
    ) -> Result<(), StrandError> {
        {
            let mut inner = lock(&self.inner);
            if inner.embedding.len() >= self.capacity {
                return Err(StrandError::QueueFull);
            }
            inner.embedding.push(QueuedEmbedding {
                key: self.next_key(priority),
                deadline,
                texts,
                responder,
            });
        }
        self.embedding_ready.notify_one();
        Ok(())
    }

    pub async fn pop_generation(&self) -> QueuedGeneration {
        loop {
            if let Some(item) = lock(&self.inner).generation.pop() {
                return item;
            }
            self.generation_ready.notified().await;
        }
    }

    pub async fn pop_embedding(&self) -> QueuedEmbedding {
        loop {
            if let Some(item) = lock(&self.inner).embedding.pop() {
                return item;
            }
            self.embedding_ready.notified().await;
        }
    }

    fn try_pop_embedding(&self) -> Option<QueuedEmbedding> {
        lock(&self.inner).embedding.pop()
    }
}

/// Handle over the spawned worker set.
#[derive(Debug)]
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        queues: Arc<RequestQueues>,
        generation_pool: Arc<GenerationPool>,
        embedding_pool: Arc<EmbeddingPool>,
        generation_workers: usize,
        embedding_workers: usize,
        max_batch_size: usize,
        batch_timeout: Duration,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let mut handles = Vec::new();

        for worker_id in 0..generation_workers {
            let queues = Arc::clone(&queues);
            let pool = Arc::clone(&generation_pool);
            let mut stop = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                tracing::info!(worker_id, "generation worker started");
                loop {
                    let request = tokio::select! {
                        req = queues.pop_generation() => req,
                        _ = stop.changed() => break,
                    };
                    run_generation(&pool, request).await;
                }
                tracing::info!(worker_id, "generation worker stopped");
            }));
        }

        for worker_id in 0..embedding_workers {
            let queues = Arc::clone(&queues);
            let pool = Arc::clone(&embedding_pool);
            let mut stop = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                tracing::info!(worker_id, "embedding worker started");
                loop {
                    let first = tokio::select! {
                        req = queues.pop_embedding() => req,
                        _ = stop.changed() => break,
                    };
                    let batch = collect_batch(&queues, first, max_batch_size, batch_timeout).await;
                    run_embedding_batch(&pool, batch).await;
                }
                tracing::info!(worker_id, "embedding worker stopped");
            }));
        }

        Self { shutdown, handles }
    }

    pub fn live_workers(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn run_generation(pool: &Arc<GenerationPool>, request: QueuedGeneration) {
    // Drop requests whose deadline passed while queued.
    if Instant::now() > request.deadline {
        let _ = request.responder.send(Err(StrandError::Timeout));
        return;
    }
    let result = pool
        .generate(request.model_type, request.prompt, request.params)
        .await;
    // The caller may have given up; a dropped receiver is not an error.
    let _ = request.responder.send(result);
}

/// Gather embedding requests until `max_batch_size` texts are buffered or
/// the batch window elapses, whichever comes first.
async fn collect_batch(
    queues: &Arc<RequestQueues>,
    first: QueuedEmbedding,
    max_batch_size: usize,
    batch_timeout: Duration,
) -> Vec<QueuedEmbedding> {
    let window_end = Instant::now() + batch_timeout;
    let mut batch = vec![first];
    let mut text_count: usize = batch[0].texts.len();

    while text_count < max_batch_size {
        if let Some(item) = queues.try_pop_embedding() {
            text_count += item.texts.len();
            batch.push(item);
            continue;
        }
        let now = Instant::now();
        if now >= window_end {
            break;
        }
        tokio::select! {
            () = tokio::time::sleep_until(window_end) => break,
            () = async { queues.embedding_ready.notified().await } => {}
        }
    }
    batch
}

async fn run_embedding_batch(pool: &Arc<EmbeddingPool>, batch: Vec<QueuedEmbedding>) {
    let now = Instant::now();
    let (live, expired): (Vec<_>, Vec<_>) = batch.into_iter().partition(|r| r.deadline >= now);
    for request in expired {
        let _ = request.responder.send(Err(StrandError::Timeout));
    }
    if live.is_empty() {
        return;
    }

    // One concatenated call; results slice back to callers by offset.
    let mut all_texts = Vec::new();
    let mut spans = Vec::with_capacity(live.len());
    for request in &live {
        spans.push((all_texts.len(), request.texts.len()));
        all_texts.extend(request.texts.iter().cloned());
    }

    match pool.generate_embeddings(&all_texts).await {
        Ok(embeddings) => {
            for (request, (start, len)) in live.into_iter().zip(spans) {
                let slice = embeddings[start..start + len].to_vec();
                let _ = request.responder.send(Ok(slice));
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "embedding batch failed");
            for request in live {
                let _ = request.responder.send(Err(replicate(&e)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockBackend, ModelConfig};
    use crate::vram::VramAccountant;
    use strands_types::ServiceClass;

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(600)
    }

    #[tokio::test]
    async fn pop_order_follows_priority_then_arrival() {
        let queues = RequestQueues::new(100);
        let mut receivers = Vec::new();
        for (priority, tag) in [(5u8, "summary"), (1, "chat-a"), (3, "embed"), (1, "chat-b")] {
            let (tx, rx) = oneshot::channel();
            queues
                .push_generation(
                    priority,
                    far_deadline(),
                    ModelType::Chat,
                    tag.to_string(),
                    SamplingParams::default(),
                    tx,
                )
                .unwrap();
            receivers.push(rx);
        }

        let order: Vec<String> = [
            queues.pop_generation().await.prompt,
            queues.pop_generation().await.prompt,
            queues.pop_generation().await.prompt,
            queues.pop_generation().await.prompt,
        ]
        .into();
        assert_eq!(order, vec!["chat-a", "chat-b", "embed", "summary"]);
    }

    #[tokio::test]
    async fn capacity_overflow_is_rejected() {
        let queues = RequestQueues::new(2);
        let mut keep = Vec::new();
        for i in 0..2 {
            let (tx, rx) = oneshot::channel();
            queues
                .push_generation(
                    1,
                    far_deadline(),
                    ModelType::Chat,
                    format!("p{i}"),
                    SamplingParams::default(),
                    tx,
                )
                .unwrap();
            keep.push(rx);
        }
        let (tx, _rx) = oneshot::channel();
        let err = queues
            .push_generation(
                1,
                far_deadline(),
                ModelType::Chat,
                "overflow".to_string(),
                SamplingParams::default(),
                tx,
            )
            .unwrap_err();
        assert!(matches!(err, StrandError::QueueFull));
    }

    #[tokio::test]
    async fn expired_requests_complete_with_timeout() {
        let queues = RequestQueues::new(10);
        let configs = vec![ModelConfig::defaults_for(ModelType::Chat, 384)];
        let pool = GenerationPool::new(
            Arc::new(MockBackend::new()),
            configs,
            VramAccountant::new(24_576, 1024),
        );

        let (tx, rx) = oneshot::channel();
        queues
            .push_generation(
                ServiceClass::Chat.default_priority(),
                Instant::now() - Duration::from_secs(1),
                ModelType::Chat,
                "late".to_string(),
                SamplingParams::default(),
                tx,
            )
            .unwrap();

        let request = queues.pop_generation().await;
        run_generation(&pool, request).await;
        let result = rx.await.unwrap();
        assert!(matches!(result, Err(StrandError::Timeout)));
    }

    #[tokio::test]
    async fn embedding_batch_slices_results_per_caller() {
        let backend: Arc<dyn crate::backend::InferenceBackend> = Arc::new(MockBackend::new());
        let pool = EmbeddingPool::initialize(
            &backend,
            ModelConfig::defaults_for(ModelType::Embedding, 384),
        )
        .await
        .unwrap();
        let queues = RequestQueues::new(100);

        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        queues
            .push_embedding(
                3,
                far_deadline(),
                vec!["one".to_string(), "two".to_string()],
                tx1,
            )
            .unwrap();
        queues
            .push_embedding(3, far_deadline(), vec!["three".to_string()], tx2)
            .unwrap();

        let first = queues.pop_embedding().await;
        let batch = collect_batch(&queues, first, 10, Duration::from_millis(50)).await;
        assert_eq!(batch.len(), 2);
        run_embedding_batch(&pool, batch).await;

        let a = rx1.await.unwrap().unwrap();
        let b = rx2.await.unwrap().unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 1);
        // Input order preserved within each caller's batch.
        assert_eq!(a[0], crate::backend::hashed_embedding("one", 384));
        assert_eq!(b[0], crate::backend::hashed_embedding("three", 384));
    }

    /// Backend whose embedding calls always fail.
    #[derive(Debug)]
    struct BrokenEmbedder;

    #[async_trait::async_trait]
    impl crate::backend::InferenceBackend for BrokenEmbedder {
        async fn load(
            &self,
            _config: &ModelConfig,
        ) -> Result<Box<dyn crate::backend::LoadedModel>, StrandError> {
            Ok(Box::new(BrokenEmbedder))
        }
    }

    #[async_trait::async_trait]
    impl crate::backend::LoadedModel for BrokenEmbedder {
        fn model_type(&self) -> ModelType {
            ModelType::Embedding
        }

        fn vram_bytes(&self) -> u64 {
            1
        }

        async fn generate(
            &self,
            _prompt: &str,
            _params: &SamplingParams,
            _sink: crate::stream::TokenSink,
        ) -> Result<(), StrandError> {
            Err(StrandError::GenerationFailed("not a chat model".into()))
        }

        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, StrandError> {
            Err(StrandError::GenerationFailed("embedding backend down".into()))
        }

        async fn unload(&self) {}
    }

    #[tokio::test]
    async fn batch_failure_fails_every_caller() {
        let dyn_backend: Arc<dyn crate::backend::InferenceBackend> = Arc::new(BrokenEmbedder);
        let config = ModelConfig::defaults_for(ModelType::Embedding, 384);
        let pool = EmbeddingPool::initialize(&dyn_backend, config).await.unwrap();
        let queues = RequestQueues::new(100);

        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        queues
            .push_embedding(3, far_deadline(), vec!["a".to_string()], tx1)
            .unwrap();
        queues
            .push_embedding(3, far_deadline(), vec!["b".to_string()], tx2)
            .unwrap();

        let first = queues.pop_embedding().await;
        let batch = collect_batch(&queues, first, 10, Duration::from_millis(20)).await;
        run_embedding_batch(&pool, batch).await;

        assert!(rx1.await.unwrap().is_err());
        assert!(rx2.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn workers_drain_in_priority_order() {
        let queues = RequestQueues::new(100);
        let configs = vec![
            ModelConfig::defaults_for(ModelType::Chat, 384),
            ModelConfig::defaults_for(ModelType::Summary, 384),
        ];
        let generation_pool = GenerationPool::new(
            Arc::new(MockBackend::new()),
            configs,
            VramAccountant::new(24_576, 1024),
        );
        let backend: Arc<dyn crate::backend::InferenceBackend> = Arc::new(MockBackend::new());
        let embedding_pool = EmbeddingPool::initialize(
            &backend,
            ModelConfig::defaults_for(ModelType::Embedding, 384),
        )
        .await
        .unwrap();

        // Enqueue before starting workers so ordering is deterministic.
        let (tx_low, rx_low) = oneshot::channel();
        let (tx_high, rx_high) = oneshot::channel();
        queues
            .push_generation(
                5,
                far_deadline(),
                ModelType::Chat,
                "low".to_string(),
                SamplingParams::default(),
                tx_low,
            )
            .unwrap();
        queues
            .push_generation(
                1,
                far_deadline(),
                ModelType::Chat,
                "high".to_string(),
                SamplingParams::default(),
                tx_high,
            )
            .unwrap();

        let workers = WorkerPool::spawn(
            Arc::clone(&queues),
            generation_pool,
            embedding_pool,
            1,
            1,
            10,
            Duration::from_millis(200),
        );
        assert_eq!(workers.live_workers(), 2);

        let high = rx_high.await.unwrap().unwrap();
        let high_text = high.collect_text().await.unwrap();
        assert!(high_text.contains("high"));

        let low = rx_low.await.unwrap().unwrap();
        let low_text = low.collect_text().await.unwrap();
        assert!(low_text.contains("low"));

        workers.shutdown().await;
    }
}
