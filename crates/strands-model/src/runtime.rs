//! Model pools: the generation pool (chat/summary, hot-swapped) and the
//! always-loaded embedding pool.
//!
//! The generation pool owns one current instance and one optional preload
//! slot. Swaps serialize on the swap mutex; generations serialize on a
//! separate generation gate, so an ongoing stream always completes before
//! an unload. VRAM accounting decides between overlapped and sequential
//! swaps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use strands_types::{ModelType, SamplingParams, StrandError};

use crate::backend::{InferenceBackend, LoadedModel, ModelConfig};
use crate::state_machine::{ModelState, ModelStateMachine, StateTransition};
use crate::stream::{token_channel, TokenStream};
use crate::vram::{VramAccountant, VramSnapshot};

/// Backoff before re-entering the recovery state after an error.
const ERROR_RECOVERY_BACKOFF: Duration = Duration::from_secs(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A live model occupying GPU memory. Owned exclusively by its pool.
pub struct ModelInstance {
    pub instance_id: String,
    pub model_type: ModelType,
    model: Arc<dyn LoadedModel>,
    pub last_used: DateTime<Utc>,
    pub requests_processed: u64,
    pub vram_bytes: u64,
}

impl std::fmt::Debug for ModelInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelInstance")
            .field("instance_id", &self.instance_id)
            .field("model_type", &self.model_type)
            .field("vram_bytes", &self.vram_bytes)
            .finish()
    }
}

impl ModelInstance {
    fn new(model_type: ModelType, model: Arc<dyn LoadedModel>) -> Self {
        let vram_bytes = model.vram_bytes();
        Self {
            instance_id: format!("{}_{}", model_type.as_str(), Uuid::new_v4()),
            model_type,
            model,
            last_used: Utc::now(),
            requests_processed: 0,
            vram_bytes,
        }
    }
}

#[derive(Debug, Default)]
struct PoolSlots {
    current: Option<ModelInstance>,
    preloaded: Option<ModelInstance>,
    preloading: Option<ModelType>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct PoolMetrics {
    pub total_requests: u64,
    pub model_swaps: u64,
    pub overlap_swaps: u64,
    pub sequential_swaps: u64,
    pub preload_promotions: u64,
}

#[derive(Debug)]
pub struct GenerationPool {
    backend: Arc<dyn InferenceBackend>,
    configs: Vec<ModelConfig>,
    slots: tokio::sync::Mutex<PoolSlots>,
    generation_gate: Arc<tokio::sync::Mutex<()>>,
    state: Mutex<ModelStateMachine>,
    vram: Mutex<VramAccountant>,
    metrics: Mutex<PoolMetrics>,
}

impl GenerationPool {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        configs: Vec<ModelConfig>,
        vram: VramAccountant,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            configs,
            slots: tokio::sync::Mutex::new(PoolSlots::default()),
            generation_gate: Arc::new(tokio::sync::Mutex::new(())),
            state: Mutex::new(ModelStateMachine::new()),
            vram: Mutex::new(vram),
            metrics: Mutex::new(PoolMetrics::default()),
        })
    }

    fn config_for(&self, model_type: ModelType) -> Result<ModelConfig, StrandError> {
        self.configs
            .iter()
            .find(|c| c.model_type == model_type)
            .cloned()
            .ok_or_else(|| {
                StrandError::LoadFailed(format!("no configuration for {}", model_type.as_str()))
            })
    }

    pub fn current_model_type(&self) -> Option<ModelType> {
        // try_lock keeps this callable from sync status paths; a held swap
        // lock just reports the pre-swap state.
        self.slots
            .try_lock()
            .ok()
            .and_then(|slots| slots.current.as_ref().map(|i| i.model_type))
    }

    pub fn state(&self) -> ModelState {
        lock(&self.state).current()
    }

    pub fn state_history(&self) -> Vec<StateTransition> {
        lock(&self.state).history().cloned().collect()
    }

    /// Ensure the requested model is the current instance, swapping if a
    /// different type is resident. No-op when already loaded.
    pub async fn ensure_loaded(self: &Arc<Self>, model_type: ModelType) -> Result<(), StrandError> {
        let mut slots = self.slots.lock().await;
        if slots
            .current
            .as_ref()
            .is_some_and(|i| i.model_type == model_type)
        {
            return Ok(());
        }

        tracing::info!(
            from = ?slots.current.as_ref().map(|i| i.model_type.as_str()),
            to = model_type.as_str(),
            "model swap required"
        );

        // Preload promotion: instant swap, zero extra latency.
        if slots
            .preloaded
            .as_ref()
            .is_some_and(|i| i.model_type == model_type)
        {
            let Some(preloaded) = slots.preloaded.take() else {
                return Ok(());
            };
            let old = slots.current.replace(preloaded);
            {
                let mut vram = lock(&self.vram);
                vram.promote_preload();
            }
            {
                let mut metrics = lock(&self.metrics);
                metrics.model_swaps += 1;
                metrics.preload_promotions += 1;
            }
            if let Some(old) = old {
                self.cleanup_in_background(old);
            } else {
                // Promotion onto an empty slot still walks the graph.
                let mut state = lock(&self.state);
                let _ = state.transition(ModelState::Loading);
                let _ = state.transition(ModelState::Loaded);
            }
            tracing::info!(model_type = model_type.as_str(), "promoted preloaded model");
            return Ok(());
        }

        // The very first load is not a swap; metrics only count real ones.
        let had_current = slots.current.is_some();
        if had_current && lock(&self.vram).can_overlap(model_type) {
            self.overlapped_swap(&mut slots, model_type).await?;
            let mut metrics = lock(&self.metrics);
            metrics.overlap_swaps += 1;
            metrics.model_swaps += 1;
        } else {
            self.sequential_swap(&mut slots, model_type).await?;
            if had_current {
                let mut metrics = lock(&self.metrics);
                metrics.sequential_swaps += 1;
                metrics.model_swaps += 1;
            }
        }
        Ok(())
    }

    /// Load the new instance while the old one keeps serving, then swap
    /// atomically and free the old asynchronously.
    async fn overlapped_swap(
        self: &Arc<Self>,
        slots: &mut PoolSlots,
        model_type: ModelType,
    ) -> Result<(), StrandError> {
        tracing::info!(model_type = model_type.as_str(), "overlapped swap starting");
        let instance = self.create_instance(model_type).await?;
        lock(&self.vram).charge_current(instance.vram_bytes);
        let old = slots.current.replace(instance);
        if let Some(old) = old {
            self.cleanup_in_background(old);
        }
        tracing::info!(model_type = model_type.as_str(), "overlapped swap complete");
        Ok(())
    }

    /// Unload current, then load new. Waits for any in-flight generation.
    async fn sequential_swap(
        self: &Arc<Self>,
        slots: &mut PoolSlots,
        model_type: ModelType,
    ) -> Result<(), StrandError> {
        tracing::info!(model_type = model_type.as_str(), "sequential swap starting");
        if let Some(old) = slots.current.take() {
            // Ongoing generation completes before the unload.
            let _gate = self.generation_gate.lock().await;
            self.transition(ModelState::Unloading)?;
            old.model.unload().await;
            lock(&self.vram).release_current(old.vram_bytes);
            self.transition(ModelState::Idle)?;
        }

        self.transition(ModelState::Loading)?;
        match self.create_instance(model_type).await {
            Ok(instance) => {
                lock(&self.vram).charge_current(instance.vram_bytes);
                slots.current = Some(instance);
                self.transition(ModelState::Loaded)?;
                tracing::info!(model_type = model_type.as_str(), "sequential swap complete");
                Ok(())
            }
            Err(e) => {
                self.recover_from_error(&e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn create_instance(&self, model_type: ModelType) -> Result<ModelInstance, StrandError> {
        let config = self.config_for(model_type)?;
        let model = self.backend.load(&config).await?;
        let model: Arc<dyn LoadedModel> = Arc::from(model);
        let instance = ModelInstance::new(model_type, model);
        lock(&self.vram).observe(model_type, instance.vram_bytes);
        Ok(instance)
    }

    fn cleanup_in_background(self: &Arc<Self>, instance: ModelInstance) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!(instance_id = %instance.instance_id, "releasing old model instance");
            instance.model.unload().await;
            lock(&pool.vram).release_current(instance.vram_bytes);
        });
    }

    fn transition(&self, to: ModelState) -> Result<(), StrandError> {
        lock(&self.state).transition(to)
    }

    /// ERROR bookkeeping then auto-recovery after a brief backoff.
    async fn recover_from_error(&self, error: &str) {
        let target = lock(&self.state).handle_error(error);
        tokio::time::sleep(ERROR_RECOVERY_BACKOFF).await;
        if let Err(e) = lock(&self.state).transition(target) {
            tracing::error!(error = %e, "error recovery transition failed");
        }
    }

    /// Start one generation. The returned stream is lazy, finite, and
    /// non-restartable; dropping it cancels the producer within one token
    /// boundary. At most one generation runs per instance.
    pub async fn generate(
        self: &Arc<Self>,
        model_type: ModelType,
        prompt: String,
        params: SamplingParams,
    ) -> Result<TokenStream, StrandError> {
        self.ensure_loaded(model_type).await?;

        // Lock order is always slots -> gate; the producer task releases the
        // gate without ever touching slots.
        let (model, gate) = {
            let mut slots = self.slots.lock().await;
            let gate = Arc::clone(&self.generation_gate).lock_owned().await;
            let instance = slots
                .current
                .as_mut()
                .ok_or_else(|| StrandError::GenerationFailed("no model instance".into()))?;
            instance.last_used = Utc::now();
            instance.requests_processed += 1;
            (Arc::clone(&instance.model), gate)
        };
        lock(&self.metrics).total_requests += 1;
        self.transition(ModelState::Generating)?;

        let (sink, stream) = token_channel();
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let result = model.generate(&prompt, &params, sink.clone()).await;
            match result {
                Ok(()) | Err(StrandError::Cancelled) => {
                    if let Err(e) = pool.transition(ModelState::Loaded) {
                        tracing::error!(error = %e, "post-generation transition failed");
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "generation failed");
                    sink.fail(StrandError::GenerationFailed(e.to_string())).await;
                    pool.recover_from_error(&e.to_string()).await;
                }
            }
            drop(gate);
        });

        Ok(stream)
    }

    /// Proactively load a model into the preload slot if VRAM allows.
    pub async fn preload(self: &Arc<Self>, model_type: ModelType) {
        {
            let mut slots = self.slots.lock().await;
            if slots
                .current
                .as_ref()
                .is_some_and(|i| i.model_type == model_type)
            {
                return;
            }
            if slots.preloading == Some(model_type)
                || slots
                    .preloaded
                    .as_ref()
                    .is_some_and(|i| i.model_type == model_type)
            {
                return;
            }
            if !lock(&self.vram).can_overlap(model_type) {
                tracing::info!(
                    model_type = model_type.as_str(),
                    "cannot preload, insufficient vram"
                );
                return;
            }
            slots.preloading = Some(model_type);
        }

        tracing::info!(model_type = model_type.as_str(), "background preload starting");
        let result = self.create_instance(model_type).await;
        let mut slots = self.slots.lock().await;
        slots.preloading = None;
        match result {
            Ok(instance) => {
                lock(&self.vram).charge_preload(instance.vram_bytes);
                if let Some(stale) = slots.preloaded.replace(instance) {
                    lock(&self.vram).release_preload(stale.vram_bytes);
                    self.cleanup_preload_in_background(stale);
                }
                tracing::info!(model_type = model_type.as_str(), "preload complete");
            }
            Err(e) => {
                tracing::warn!(model_type = model_type.as_str(), error = %e, "preload failed");
            }
        }
    }

    fn cleanup_preload_in_background(self: &Arc<Self>, instance: ModelInstance) {
        tokio::spawn(async move {
            instance.model.unload().await;
        });
    }

    /// Gracefully unload the current instance, freeing its VRAM.
    pub async fn unload_current(self: &Arc<Self>) -> Result<(), StrandError> {
        let mut slots = self.slots.lock().await;
        let Some(old) = slots.current.take() else {
            return Ok(());
        };
        let _gate = self.generation_gate.lock().await;
        self.transition(ModelState::Unloading)?;
        old.model.unload().await;
        lock(&self.vram).release_current(old.vram_bytes);
        self.transition(ModelState::Idle)?;
        tracing::info!("model unloaded");
        Ok(())
    }

    /// Force-unload everything without state machine guards.
    pub async fn emergency_shutdown(self: &Arc<Self>) {
        tracing::warn!("emergency shutdown initiated");
        let mut slots = self.slots.lock().await;
        if let Some(current) = slots.current.take() {
            lock(&self.vram).release_current(current.vram_bytes);
            current.model.unload().await;
        }
        if let Some(preloaded) = slots.preloaded.take() {
            lock(&self.vram).release_preload(preloaded.vram_bytes);
            preloaded.model.unload().await;
        }
        slots.preloading = None;
        lock(&self.state).force(ModelState::Idle);
        tracing::info!("emergency shutdown complete");
    }

    pub fn vram_snapshot(&self) -> VramSnapshot {
        lock(&self.vram).snapshot()
    }

    pub fn metrics(&self) -> PoolMetrics {
        lock(&self.metrics).clone()
    }

    pub fn status(&self) -> PoolStatus {
        let (current, preloaded, preloading) = match self.slots.try_lock() {
            Ok(slots) => (
                slots.current.as_ref().map(instance_status),
                slots.preloaded.as_ref().map(instance_status),
                slots.preloading.map(|t| t.as_str().to_string()),
            ),
            Err(_) => (None, None, Some("swapping".to_string())),
        };
        let state = lock(&self.state);
        PoolStatus {
            state: state.current(),
            is_operational: state.is_operational(),
            is_busy: state.is_busy(),
            can_accept_requests: state.can_accept_requests(),
            current,
            preloaded,
            preloading,
            metrics: self.metrics(),
            vram: self.vram_snapshot(),
            state_machine: state.stats(),
            recent_transitions: state.history().rev().take(20).cloned().collect(),
        }
    }
}

fn instance_status(instance: &ModelInstance) -> InstanceStatus {
    InstanceStatus {
        instance_id: instance.instance_id.clone(),
        model_type: instance.model_type,
        last_used: instance.last_used,
        requests_processed: instance.requests_processed,
        vram_mb: instance.vram_bytes / crate::vram::MB,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub instance_id: String,
    pub model_type: ModelType,
    pub last_used: DateTime<Utc>,
    pub requests_processed: u64,
    pub vram_mb: u64,
}

#[derive(Debug, Serialize)]
pub struct PoolStatus {
    pub state: ModelState,
    pub is_operational: bool,
    pub is_busy: bool,
    pub can_accept_requests: bool,
    pub current: Option<InstanceStatus>,
    pub preloaded: Option<InstanceStatus>,
    pub preloading: Option<String>,
    pub metrics: PoolMetrics,
    pub vram: VramSnapshot,
    pub state_machine: crate::state_machine::StateMachineStats,
    pub recent_transitions: Vec<StateTransition>,
}

// ---------------------------------------------------------------------------
// Embedding pool
// ---------------------------------------------------------------------------

/// Always-loaded small embedding instance.
#[derive(Debug)]
pub struct EmbeddingPool {
    instance: ModelInstance,
    dimensions: usize,
    total_requests: AtomicU64,
    total_texts: AtomicU64,
}

impl EmbeddingPool {
    pub async fn initialize(
        backend: &Arc<dyn InferenceBackend>,
        config: ModelConfig,
    ) -> Result<Arc<Self>, StrandError> {
        let dimensions = config.embedding_dimensions;
        let model = backend.load(&config).await?;
        let model: Arc<dyn LoadedModel> = Arc::from(model);
        let instance = ModelInstance::new(ModelType::Embedding, model);
        tracing::info!(vram_mb = instance.vram_bytes / crate::vram::MB, "embedding pool ready");
        Ok(Arc::new(Self {
            instance,
            dimensions,
            total_requests: AtomicU64::new(0),
            total_texts: AtomicU64::new(0),
        }))
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Batch embeddings; output order matches input order, one vector of
    /// dimension D per text. A dimension mismatch from the backend is a
    /// hard error.
    pub async fn generate_embeddings(
        &self,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, StrandError> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_texts
            .fetch_add(texts.len() as u64, Ordering::Relaxed);
        let embeddings = self.instance.model.embed(texts).await?;
        if embeddings.len() != texts.len() {
            return Err(StrandError::GenerationFailed(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                embeddings.len()
            )));
        }
        for vector in &embeddings {
            if vector.len() != self.dimensions {
                return Err(StrandError::GenerationFailed(format!(
                    "embedding dimension {} does not match configured {}",
                    vector.len(),
                    self.dimensions
                )));
            }
        }
        Ok(embeddings)
    }

    pub fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "instance_id": self.instance.instance_id,
            "dimensions": self.dimensions,
            "total_requests": self.total_requests.load(Ordering::Relaxed),
            "total_texts": self.total_texts.load(Ordering::Relaxed),
            "vram_mb": self.instance.vram_bytes / crate::vram::MB,
        })
    }
}
