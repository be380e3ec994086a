//! Per-connection token buffering and stream metrics.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Characters that mark a safe point to flush a chunk to the client.
const WORD_BOUNDARY_CHARS: [char; 9] = [' ', '\n', '\t', '.', ',', '!', '?', ';', ':'];

pub const DEFAULT_BUFFER_SIZE: usize = 3;

/// Groups raw model tokens into word-boundary chunks so the client renders
/// smooth text instead of token fragments.
#[derive(Debug)]
pub struct TokenBuffer {
    tokens: Vec<String>,
    capacity: usize,
}

impl Default for TokenBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

impl TokenBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            tokens: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Add a token; returns a chunk when the buffer is full or the buffered
    /// text contains a word boundary character.
    pub fn push(&mut self, token: impl Into<String>) -> Option<String> {
        self.tokens.push(token.into());
        let text: String = self.tokens.concat();
        if self.tokens.len() >= self.capacity || text.contains(WORD_BOUNDARY_CHARS) {
            self.tokens.clear();
            Some(text)
        } else {
            None
        }
    }

    /// Drain whatever is left; called once at end of stream.
    pub fn flush(&mut self) -> Option<String> {
        if self.tokens.is_empty() {
            return None;
        }
        let text = self.tokens.concat();
        self.tokens.clear();
        Some(text)
    }
}

/// First-token latency and throughput for one response stream.
#[derive(Debug)]
pub struct StreamMetrics {
    started_at: Instant,
    first_token_at: Option<Instant>,
    token_count: u64,
    char_count: u64,
}

impl Default for StreamMetrics {
    fn default() -> Self {
        Self::start()
    }
}

impl StreamMetrics {
    pub fn start() -> Self {
        Self {
            started_at: Instant::now(),
            first_token_at: None,
            token_count: 0,
            char_count: 0,
        }
    }

    pub fn record_token(&mut self, token: &str) {
        if self.first_token_at.is_none() {
            self.first_token_at = Some(Instant::now());
        }
        self.token_count += 1;
        self.char_count += token.chars().count() as u64;
    }

    pub fn token_count(&self) -> u64 {
        self.token_count
    }

    pub fn time_to_first_token(&self) -> Option<Duration> {
        self.first_token_at.map(|at| at - self.started_at)
    }

    pub fn tokens_per_second(&self) -> f64 {
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.token_count as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn snapshot(&self) -> StreamStats {
        StreamStats {
            token_count: self.token_count,
            char_count: self.char_count,
            time_to_first_token_ms: self
                .time_to_first_token()
                .map(|d| d.as_millis() as u64),
            tokens_per_second: self.tokens_per_second(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    pub token_count: u64,
    pub char_count: u64,
    pub time_to_first_token_ms: Option<u64>,
    pub tokens_per_second: f64,
}
