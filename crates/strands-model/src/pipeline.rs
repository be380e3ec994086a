//! The request pipeline: admission via per-class circuit breakers, a
//! priority queue in front of the runtime, embedding batching, and the
//! proactive preload loop driven by the demand predictor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;

use strands_config::ModelServiceConfig;
use strands_types::{SamplingParams, ServiceClass, StrandError};

use crate::breaker::{BreakerConfig, BreakerState, BreakerStatus, CircuitBreaker};
use crate::predictor::{DemandPattern, DemandPredictor};
use crate::queue::{RequestQueues, WorkerPool};
use crate::runtime::{EmbeddingPool, GenerationPool};
use crate::stream::TokenStream;

const PREDICTOR_INTERVAL: Duration = Duration::from_secs(30);
const PRELOAD_QUEUE_DEPTH_LIMIT: usize = 3;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_queue_size: usize,
    pub generation_workers: usize,
    pub embedding_workers: usize,
    pub max_batch_size: usize,
    pub batch_timeout: Duration,
    pub breaker: BreakerConfig,
    pub default_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            generation_workers: 2,
            embedding_workers: 1,
            max_batch_size: 10,
            batch_timeout: Duration::from_millis(200),
            breaker: BreakerConfig::default(),
            default_timeout: Duration::from_secs(300),
        }
    }
}

impl From<&ModelServiceConfig> for PipelineConfig {
    fn from(config: &ModelServiceConfig) -> Self {
        Self {
            max_queue_size: config.max_queue_size,
            generation_workers: config.generation_workers,
            embedding_workers: config.embedding_workers,
            max_batch_size: config.max_batch_size,
            batch_timeout: config.batch_timeout,
            breaker: BreakerConfig {
                failure_threshold: config.breaker_failure_threshold,
                recovery_timeout: config.breaker_recovery_timeout,
                success_threshold: config.breaker_success_threshold,
            },
            default_timeout: config.default_request_timeout,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct RequestStats {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub breaker_trips: u64,
}

#[derive(Debug)]
pub struct RequestPipeline {
    queues: Arc<RequestQueues>,
    generation_pool: Arc<GenerationPool>,
    embedding_pool: Arc<EmbeddingPool>,
    predictor: Arc<DemandPredictor>,
    breakers: Mutex<HashMap<ServiceClass, CircuitBreaker>>,
    stats: Mutex<RequestStats>,
    utilization: Mutex<HashMap<&'static str, u64>>,
    workers: Mutex<Option<WorkerPool>>,
    predictor_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    config: PipelineConfig,
}

impl RequestPipeline {
    pub fn new(
        generation_pool: Arc<GenerationPool>,
        embedding_pool: Arc<EmbeddingPool>,
        config: PipelineConfig,
    ) -> Arc<Self> {
        let mut breakers = HashMap::new();
        for class in ServiceClass::ALL {
            breakers.insert(
                class,
                CircuitBreaker::new(class.as_str(), config.breaker.clone()),
            );
        }
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            queues: RequestQueues::new(config.max_queue_size),
            generation_pool,
            embedding_pool,
            predictor: Arc::new(DemandPredictor::new()),
            breakers: Mutex::new(breakers),
            stats: Mutex::new(RequestStats::default()),
            utilization: Mutex::new(HashMap::new()),
            workers: Mutex::new(None),
            predictor_task: Mutex::new(None),
            shutdown,
            config,
        })
    }

    /// Spawn workers and the predictor loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut workers = lock(&self.workers);
        if workers.is_some() {
            return;
        }
        *workers = Some(WorkerPool::spawn(
            Arc::clone(&self.queues),
            Arc::clone(&self.generation_pool),
            Arc::clone(&self.embedding_pool),
            self.config.generation_workers,
            self.config.embedding_workers,
            self.config.max_batch_size,
            self.config.batch_timeout,
        ));
        drop(workers);

        let pipeline = Arc::clone(self);
        let mut stop = self.shutdown.subscribe();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(PREDICTOR_INTERVAL) => {}
                    _ = stop.changed() => break,
                }
                pipeline.run_prediction_cycle().await;
            }
        });
        *lock(&self.predictor_task) = Some(task);
        tracing::info!("request pipeline started");
    }

    async fn run_prediction_cycle(self: &Arc<Self>) {
        let Some(predicted) = self.predictor.predict_next_model() else {
            return;
        };
        if self.queues.generation_depth() >= PRELOAD_QUEUE_DEPTH_LIMIT {
            return;
        }
        if self.generation_pool.current_model_type() == Some(predicted) {
            return;
        }
        tracing::info!(model_type = predicted.as_str(), "preloading predicted model");
        self.generation_pool.preload(predicted).await;
    }

    /// Stop accepting work and wind the workers down.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = lock(&self.predictor_task).take() {
            task.abort();
        }
        let workers = lock(&self.workers).take();
        if let Some(workers) = workers {
            workers.shutdown().await;
        }
        tracing::info!("request pipeline shut down");
    }

    fn admit(&self, class: ServiceClass) -> Result<(), StrandError> {
        let mut breakers = lock(&self.breakers);
        let breaker = breakers
            .get_mut(&class)
            .ok_or_else(|| StrandError::Internal("missing breaker".into()))?;
        if breaker.can_proceed() {
            Ok(())
        } else {
            drop(breakers);
            lock(&self.stats).breaker_trips += 1;
            Err(StrandError::ServiceUnavailable(class.as_str().to_string()))
        }
    }

    fn record_outcome(&self, class: ServiceClass, success: bool) {
        let mut breakers = lock(&self.breakers);
        if let Some(breaker) = breakers.get_mut(&class) {
            if success {
                breaker.record_success();
            } else {
                breaker.record_failure();
            }
        }
        drop(breakers);
        if !success {
            lock(&self.stats).failed_requests += 1;
        }
    }

    /// Submit a generation request; resolves to a lazy token stream once a
    /// worker dispatches it.
    pub async fn submit_generation(
        &self,
        class: ServiceClass,
        prompt: String,
        params: SamplingParams,
        priority: Option<u8>,
        timeout: Option<Duration>,
    ) -> Result<TokenStream, StrandError> {
        self.admit(class)?;
        self.predictor.record_request(class);
        lock(&self.stats).total_requests += 1;

        let timeout = timeout.unwrap_or(self.config.default_timeout);
        let deadline = Instant::now() + timeout;
        let (tx, rx) = oneshot::channel();
        self.queues.push_generation(
            priority.unwrap_or_else(|| class.default_priority()),
            deadline,
            class.model_type(),
            prompt,
            params,
            tx,
        )?;

        let result = match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(StrandError::Internal("worker dropped request".into())),
            Err(_) => Err(StrandError::Timeout),
        };
        match &result {
            Ok(_) => {
                self.record_outcome(class, true);
                *lock(&self.utilization)
                    .entry(class.model_type().as_str())
                    .or_insert(0) += 1;
            }
            Err(_) => self.record_outcome(class, false),
        }
        result
    }

    /// Submit texts for embedding; batched opportunistically with other
    /// callers. Result order matches input order.
    pub async fn submit_embedding(
        &self,
        texts: Vec<String>,
        priority: Option<u8>,
        timeout: Option<Duration>,
    ) -> Result<Vec<Vec<f32>>, StrandError> {
        let class = ServiceClass::Npc;
        self.admit(class)?;
        self.predictor.record_request(class);
        lock(&self.stats).total_requests += 1;

        let timeout = timeout.unwrap_or(Duration::from_secs(60));
        let deadline = Instant::now() + timeout;
        let (tx, rx) = oneshot::channel();
        self.queues.push_embedding(
            priority.unwrap_or_else(|| class.default_priority()),
            deadline,
            texts,
            tx,
        )?;

        let result = match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(StrandError::Internal("worker dropped request".into())),
            Err(_) => Err(StrandError::Timeout),
        };
        self.record_outcome(class, result.is_ok());
        result
    }

    pub fn breaker_state(&self, class: ServiceClass) -> BreakerState {
        lock(&self.breakers)
            .get(&class)
            .map(|b| b.state())
            .unwrap_or(BreakerState::Closed)
    }

    /// Seconds a caller should wait before retrying a tripped class.
    pub fn breaker_retry_after(&self, class: ServiceClass) -> u64 {
        lock(&self.breakers)
            .get(&class)
            .map(|b| b.retry_after_secs())
            .unwrap_or(0)
    }

    pub fn queue_depth(&self) -> usize {
        self.queues.generation_depth() + self.queues.embedding_depth()
    }

    pub fn health(&self) -> PipelineHealth {
        let breakers: HashMap<String, BreakerStatus> = lock(&self.breakers)
            .iter()
            .map(|(class, b)| (class.as_str().to_string(), b.status()))
            .collect();
        let workers_live = lock(&self.workers)
            .as_ref()
            .map(WorkerPool::live_workers)
            .unwrap_or(0);
        let queue_depth = self.queue_depth();
        let healthy = workers_live > 0
            && queue_depth < (self.config.max_queue_size * 4) / 5
            && breakers.values().all(|b| b.state != BreakerState::Open);
        PipelineHealth {
            healthy,
            circuit_breakers: breakers,
            queue_depth,
            workers_live,
        }
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            requests: lock(&self.stats).clone(),
            model_utilization: lock(&self.utilization).clone(),
            generation_queue_depth: self.queues.generation_depth(),
            embedding_queue_depth: self.queues.embedding_depth(),
            demand_pattern: self.predictor.demand_pattern(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PipelineHealth {
    pub healthy: bool,
    pub circuit_breakers: HashMap<String, BreakerStatus>,
    pub queue_depth: usize,
    pub workers_live: usize,
}

#[derive(Debug, Serialize)]
pub struct PipelineStats {
    pub requests: RequestStats,
    pub model_utilization: HashMap<&'static str, u64>,
    pub generation_queue_depth: usize,
    pub embedding_queue_depth: usize,
    pub demand_pattern: DemandPattern,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InferenceBackend, MockBackend, ModelConfig};
    use crate::state_machine::ModelState;
    use crate::vram::VramAccountant;
    use strands_types::ModelType;

    async fn runtime_with(
        backend: Arc<MockBackend>,
        total_vram_mb: u64,
        config: PipelineConfig,
    ) -> (Arc<GenerationPool>, Arc<RequestPipeline>) {
        let dyn_backend: Arc<dyn InferenceBackend> = backend;
        let generation_pool = GenerationPool::new(
            Arc::clone(&dyn_backend),
            vec![
                ModelConfig::defaults_for(ModelType::Chat, 384),
                ModelConfig::defaults_for(ModelType::Summary, 384),
            ],
            VramAccountant::new(total_vram_mb, 1024),
        );
        let embedding_pool = EmbeddingPool::initialize(
            &dyn_backend,
            ModelConfig::defaults_for(ModelType::Embedding, 384),
        )
        .await
        .unwrap();
        let pipeline = RequestPipeline::new(
            Arc::clone(&generation_pool),
            embedding_pool,
            config,
        );
        (generation_pool, pipeline)
    }

    async fn pipeline_with(backend: Arc<MockBackend>, config: PipelineConfig) -> Arc<RequestPipeline> {
        let (_pool, pipeline) = runtime_with(backend, 24_576, config).await;
        pipeline.start();
        pipeline
    }

    #[tokio::test]
    async fn generation_round_trip() {
        let pipeline = pipeline_with(Arc::new(MockBackend::new()), PipelineConfig::default()).await;
        let stream = pipeline
            .submit_generation(
                ServiceClass::Chat,
                "hello from the pipeline".to_string(),
                SamplingParams::default(),
                None,
                Some(Duration::from_secs(10)),
            )
            .await
            .unwrap();
        let text = stream.collect_text().await.unwrap();
        assert!(!text.is_empty());
        assert_eq!(pipeline.stats().requests.total_requests, 1);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn embedding_round_trip_preserves_order_and_dimension() {
        let pipeline = pipeline_with(Arc::new(MockBackend::new()), PipelineConfig::default()).await;
        let texts: Vec<String> = (0..3).map(|i| format!("text {i}")).collect();
        let embeddings = pipeline
            .submit_embedding(texts.clone(), None, Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(embeddings.len(), texts.len());
        assert_eq!(
            embeddings[1],
            crate::backend::hashed_embedding("text 1", 384)
        );
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn breaker_opens_after_consecutive_failures_without_reaching_downstream() {
        let backend = Arc::new(MockBackend::new());
        backend.fail_next_loads(5);
        let pipeline = pipeline_with(Arc::clone(&backend), PipelineConfig::default()).await;

        for _ in 0..5 {
            let result = pipeline
                .submit_generation(
                    ServiceClass::Chat,
                    "x".to_string(),
                    SamplingParams::default(),
                    None,
                    Some(Duration::from_secs(5)),
                )
                .await;
            assert!(result.is_err());
        }
        assert_eq!(pipeline.breaker_state(ServiceClass::Chat), BreakerState::Open);

        // Sixth request is rejected at admission; no downstream work runs.
        let total_before = pipeline.stats().requests.total_requests;
        let err = pipeline
            .submit_generation(
                ServiceClass::Chat,
                "x".to_string(),
                SamplingParams::default(),
                None,
                Some(Duration::from_secs(5)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StrandError::ServiceUnavailable(_)));
        assert_eq!(pipeline.stats().requests.total_requests, total_before);
        assert!(pipeline.breaker_retry_after(ServiceClass::Chat) > 0);
        assert_eq!(pipeline.stats().requests.breaker_trips, 1);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn open_breaker_does_not_affect_other_classes() {
        let backend = Arc::new(MockBackend::new());
        backend.fail_next_loads(5);
        let pipeline = pipeline_with(Arc::clone(&backend), PipelineConfig::default()).await;
        for _ in 0..5 {
            let _ = pipeline
                .submit_generation(
                    ServiceClass::Chat,
                    "x".to_string(),
                    SamplingParams::default(),
                    None,
                    Some(Duration::from_secs(5)),
                )
                .await;
        }
        assert_eq!(pipeline.breaker_state(ServiceClass::Chat), BreakerState::Open);
        assert_eq!(
            pipeline.breaker_state(ServiceClass::Summary),
            BreakerState::Closed
        );

        let embeddings = pipeline
            .submit_embedding(vec!["ok".to_string()], None, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(embeddings.len(), 1);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn hot_swap_walks_the_legal_graph() {
        // VRAM too tight for overlap: the swap must be sequential.
        let (pool, pipeline) = runtime_with(
            Arc::new(MockBackend::new()),
            10_000,
            PipelineConfig::default(),
        )
        .await;
        pipeline.start();

        let chat_stream = pipeline
            .submit_generation(
                ServiceClass::Chat,
                "hello there".to_string(),
                SamplingParams::default(),
                None,
                Some(Duration::from_secs(10)),
            )
            .await
            .unwrap();
        chat_stream.collect_text().await.unwrap();

        let summary_stream = pipeline
            .submit_generation(
                ServiceClass::Summary,
                "summarize this".to_string(),
                SamplingParams::default(),
                None,
                Some(Duration::from_secs(10)),
            )
            .await
            .unwrap();
        let summary = summary_stream.collect_text().await.unwrap();
        assert!(!summary.is_empty());

        // The recorded walk contains the sequential unload-then-load
        // sequence, in order.
        let walk: Vec<(ModelState, ModelState)> = pool
            .state_history()
            .iter()
            .filter(|t| t.success)
            .map(|t| (t.from_state, t.to_state))
            .collect();
        let expected = [
            (ModelState::Loaded, ModelState::Unloading),
            (ModelState::Unloading, ModelState::Idle),
            (ModelState::Idle, ModelState::Loading),
            (ModelState::Loading, ModelState::Loaded),
        ];
        let mut cursor = 0;
        for transition in &walk {
            if cursor < expected.len() && *transition == expected[cursor] {
                cursor += 1;
            }
        }
        assert_eq!(cursor, expected.len(), "sequential swap walk not found in {walk:?}");
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn preload_promotion_keeps_the_model_loaded() {
        // Plenty of VRAM: preload then promote without an unload walk.
        let (pool, pipeline) = runtime_with(
            Arc::new(MockBackend::new()),
            24_576,
            PipelineConfig::default(),
        )
        .await;
        pipeline.start();

        pool.ensure_loaded(ModelType::Chat).await.unwrap();
        pool.preload(ModelType::Summary).await;
        let vram = pool.vram_snapshot();
        assert!(vram.preloaded_mb > 0);
        assert!(
            vram.current_mb + vram.preloaded_mb + vram.safety_margin_mb <= vram.total_mb,
            "preload budget invariant violated"
        );

        let stream = pipeline
            .submit_generation(
                ServiceClass::Summary,
                "summarize".to_string(),
                SamplingParams::default(),
                None,
                Some(Duration::from_secs(10)),
            )
            .await
            .unwrap();
        stream.collect_text().await.unwrap();

        assert_eq!(pool.metrics().preload_promotions, 1);
        assert_eq!(pool.vram_snapshot().preloaded_mb, 0);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn backpressure_rejects_the_101st_request() {
        // No start(): workers never drain, so the queue fills to capacity.
        let config = PipelineConfig {
            max_queue_size: 100,
            ..PipelineConfig::default()
        };
        let (_pool, pipeline) =
            runtime_with(Arc::new(MockBackend::new()), 24_576, config).await;

        let mut submitters = Vec::new();
        for i in 0..100u32 {
            let p = Arc::clone(&pipeline);
            submitters.push(tokio::spawn(async move {
                let _ = p
                    .submit_generation(
                        ServiceClass::Chat,
                        format!("queued {i}"),
                        SamplingParams::default(),
                        Some((i % 7) as u8),
                        Some(Duration::from_millis(500)),
                    )
                    .await;
            }));
        }
        // Let every submitter enqueue.
        for _ in 0..50 {
            if pipeline.queue_depth() == 100 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pipeline.queue_depth(), 100);

        let err = pipeline
            .submit_generation(
                ServiceClass::Chat,
                "one too many".to_string(),
                SamplingParams::default(),
                None,
                Some(Duration::from_millis(500)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StrandError::QueueFull));
        for task in submitters {
            let _ = task.await;
        }
    }

    #[tokio::test]
    async fn undispatched_requests_time_out() {
        let backend = Arc::new(MockBackend::new());
        let dyn_backend: Arc<dyn InferenceBackend> = backend;
        let generation_pool = GenerationPool::new(
            Arc::clone(&dyn_backend),
            vec![ModelConfig::defaults_for(ModelType::Chat, 384)],
            VramAccountant::new(24_576, 1024),
        );
        let embedding_pool = EmbeddingPool::initialize(
            &dyn_backend,
            ModelConfig::defaults_for(ModelType::Embedding, 384),
        )
        .await
        .unwrap();
        // Workers never started: the request sits queued past its deadline.
        let pipeline =
            RequestPipeline::new(generation_pool, embedding_pool, PipelineConfig::default());
        let err = pipeline
            .submit_generation(
                ServiceClass::Chat,
                "never dispatched".to_string(),
                SamplingParams::default(),
                None,
                Some(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StrandError::Timeout));
    }
}
