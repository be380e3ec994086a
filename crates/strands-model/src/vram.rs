//! VRAM accounting and per-type size prediction.
//!
//! Predictions are a rolling exponential moving average (alpha = 0.3) over
//! observed post-load usage, clamped to [100 MB, 50 GB]. The accountant is
//! what decides between an overlapped and a sequential swap.

use std::collections::HashMap;

use serde::Serialize;
use strands_types::ModelType;

pub const MB: u64 = 1024 * 1024;
pub const EMA_ALPHA: f64 = 0.3;
pub const MIN_ESTIMATE_BYTES: u64 = 100 * MB;
pub const MAX_ESTIMATE_BYTES: u64 = 50 * 1024 * MB;

/// Initial estimates before any observation, mirroring typical quantized
/// model footprints.
fn initial_estimate(model_type: ModelType) -> u64 {
    match model_type {
        ModelType::Chat => 8000 * MB,
        ModelType::Summary => 4000 * MB,
        ModelType::Embedding => 512 * MB,
    }
}

#[derive(Debug)]
pub struct VramAccountant {
    total_bytes: u64,
    safety_margin_bytes: u64,
    current_bytes: u64,
    preloaded_bytes: u64,
    estimates: HashMap<ModelType, f64>,
}

impl VramAccountant {
    pub fn new(total_mb: u64, safety_margin_mb: u64) -> Self {
        Self {
            total_bytes: total_mb * MB,
            safety_margin_bytes: safety_margin_mb * MB,
            current_bytes: 0,
            preloaded_bytes: 0,
            estimates: HashMap::new(),
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn current_bytes(&self) -> u64 {
        self.current_bytes
    }

    pub fn preloaded_bytes(&self) -> u64 {
        self.preloaded_bytes
    }

    pub fn predict_bytes(&self, model_type: ModelType) -> u64 {
        let raw = self
            .estimates
            .get(&model_type)
            .copied()
            .unwrap_or_else(|| initial_estimate(model_type) as f64);
        (raw as u64).clamp(MIN_ESTIMATE_BYTES, MAX_ESTIMATE_BYTES)
    }

    /// Fold an observed post-load footprint into the rolling estimate.
    pub fn observe(&mut self, model_type: ModelType, observed_bytes: u64) {
        let clamped = observed_bytes.clamp(MIN_ESTIMATE_BYTES, MAX_ESTIMATE_BYTES) as f64;
        let next = match self.estimates.get(&model_type) {
            Some(prev) => prev * (1.0 - EMA_ALPHA) + clamped * EMA_ALPHA,
            None => clamped,
        };
        self.estimates.insert(model_type, next);
        tracing::debug!(
            model_type = model_type.as_str(),
            observed_mb = observed_bytes / MB,
            estimate_mb = (next as u64) / MB,
            "updated vram estimate"
        );
    }

    /// Whether the current model and a predicted new one fit side by side
    /// with the safety margin. `true` selects the overlapped swap.
    pub fn can_overlap(&self, incoming: ModelType) -> bool {
        let required = self
            .current_bytes
            .saturating_add(self.preloaded_bytes)
            .saturating_add(self.predict_bytes(incoming))
            .saturating_add(self.safety_margin_bytes);
        let fits = required <= self.total_bytes;
        tracing::info!(
            current_mb = self.current_bytes / MB,
            incoming_mb = self.predict_bytes(incoming) / MB,
            total_mb = self.total_bytes / MB,
            fits,
            "vram overlap check"
        );
        fits
    }

    pub fn charge_current(&mut self, bytes: u64) {
        self.current_bytes = self.current_bytes.saturating_add(bytes);
    }

    pub fn release_current(&mut self, bytes: u64) {
        self.current_bytes = self.current_bytes.saturating_sub(bytes);
    }

    pub fn charge_preload(&mut self, bytes: u64) {
        self.preloaded_bytes = self.preloaded_bytes.saturating_add(bytes);
    }

    pub fn release_preload(&mut self, bytes: u64) {
        self.preloaded_bytes = self.preloaded_bytes.saturating_sub(bytes);
    }

    /// Move the preload slot's charge onto the current slot (preload
    /// promotion).
    pub fn promote_preload(&mut self) {
        self.current_bytes = self.current_bytes.saturating_add(self.preloaded_bytes);
        self.preloaded_bytes = 0;
    }

    /// Invariant check used by status reporting: whenever a preload is
    /// resident, everything plus the margin must fit.
    pub fn within_budget(&self) -> bool {
        if self.preloaded_bytes == 0 {
            return self.current_bytes <= self.total_bytes;
        }
        self.current_bytes + self.preloaded_bytes + self.safety_margin_bytes <= self.total_bytes
    }

    pub fn snapshot(&self) -> VramSnapshot {
        VramSnapshot {
            total_mb: self.total_bytes / MB,
            current_mb: self.current_bytes / MB,
            preloaded_mb: self.preloaded_bytes / MB,
            safety_margin_mb: self.safety_margin_bytes / MB,
            within_budget: self.within_budget(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VramSnapshot {
    pub total_mb: u64,
    pub current_mb: u64,
    pub preloaded_mb: u64,
    pub safety_margin_mb: u64,
    pub within_budget: bool,
}
