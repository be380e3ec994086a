//! Demand prediction over the recent request mix.
//!
//! A sliding window of the last 1000 requests feeds a most-frequent-class
//! analysis over the trailing five minutes. The pipeline polls this every
//! 30 seconds and preloads the predicted model when the queue is shallow.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use strands_types::{ModelType, ServiceClass};

const MAX_HISTORY: usize = 1000;
const ANALYSIS_WINDOW: Duration = Duration::from_secs(300);
const MIN_SAMPLES: usize = 10;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
pub struct DemandPredictor {
    history: Mutex<VecDeque<(ServiceClass, Instant)>>,
}

impl DemandPredictor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, service_class: ServiceClass) {
        let mut history = lock(&self.history);
        if history.len() == MAX_HISTORY {
            history.pop_front();
        }
        history.push_back((service_class, Instant::now()));
    }

    /// The model most likely needed next: the most frequent non-embedding
    /// class over the last five minutes. `None` with too little data.
    pub fn predict_next_model(&self) -> Option<ModelType> {
        let history = lock(&self.history);
        if history.len() < MIN_SAMPLES {
            return None;
        }
        let cutoff = Instant::now().checked_sub(ANALYSIS_WINDOW);
        let mut counts: HashMap<ModelType, usize> = HashMap::new();
        for (service_class, at) in history.iter() {
            if cutoff.is_some_and(|c| *at < c) {
                continue;
            }
            let model_type = service_class.model_type();
            if model_type == ModelType::Embedding {
                continue;
            }
            *counts.entry(model_type).or_insert(0) += 1;
        }
        counts
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.as_str().cmp(a.0.as_str())))
            .map(|(model_type, _)| model_type)
    }

    pub fn demand_pattern(&self) -> DemandPattern {
        let history = lock(&self.history);
        let now = Instant::now();
        let hour_cutoff = now.checked_sub(Duration::from_secs(3600));
        let recent: Vec<_> = history
            .iter()
            .filter(|(_, at)| hour_cutoff.map_or(true, |c| *at >= c))
            .collect();

        let mut distribution: HashMap<String, usize> = HashMap::new();
        for (service_class, _) in &recent {
            *distribution
                .entry(service_class.as_str().to_string())
                .or_insert(0) += 1;
        }

        let span_minutes = recent
            .first()
            .map(|(_, oldest)| (now - *oldest).as_secs_f64() / 60.0)
            .unwrap_or(0.0)
            .max(1.0);

        DemandPattern {
            requests_per_minute: recent.len() as f64 / span_minutes,
            service_distribution: distribution,
            predicted_next_model: self.predict_next_model().map(|m| m.as_str().to_string()),
            sample_count: history.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DemandPattern {
    pub requests_per_minute: f64,
    pub service_distribution: HashMap<String, usize>,
    pub predicted_next_model: Option<String>,
    pub sample_count: usize,
}
