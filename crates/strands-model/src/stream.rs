//! The token stream abstraction: a lazy, finite, non-restartable sequence
//! of string tokens backed by a bounded channel and a cancel flag.
//!
//! Producers push through a [`TokenSink`] and observe cancellation within
//! one token boundary; dropping the consumer side cancels the producer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use strands_types::StrandError;

/// Flag the producer checks at every token boundary.
pub type CancelFlag = Arc<AtomicBool>;

/// Bounded capacity of the token channel between producer and consumer.
pub const TOKEN_CHANNEL_CAPACITY: usize = 256;

/// Create a linked producer/consumer pair.
pub fn token_channel() -> (TokenSink, TokenStream) {
    let (tx, rx) = mpsc::channel(TOKEN_CHANNEL_CAPACITY);
    let cancel: CancelFlag = Arc::new(AtomicBool::new(false));
    (
        TokenSink {
            tx,
            cancel: cancel.clone(),
        },
        TokenStream { rx, cancel },
    )
}

/// Producer half. Held by the generation task driving the backend.
#[derive(Debug, Clone)]
pub struct TokenSink {
    tx: mpsc::Sender<Result<String, StrandError>>,
    cancel: CancelFlag,
}

impl TokenSink {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Push one token. Returns `Cancelled` once the consumer is gone or has
    /// cancelled, so the producer stops at the next token boundary.
    pub async fn send(&self, token: String) -> Result<(), StrandError> {
        if self.is_cancelled() {
            return Err(StrandError::Cancelled);
        }
        self.tx
            .send(Ok(token))
            .await
            .map_err(|_| StrandError::Cancelled)
    }

    /// Terminate the stream with an error. The consumer sees it as the last
    /// item.
    pub async fn fail(&self, error: StrandError) {
        let _ = self.tx.send(Err(error)).await;
    }
}

/// Consumer half. Dropping it cancels the producer.
#[derive(Debug)]
pub struct TokenStream {
    rx: mpsc::Receiver<Result<String, StrandError>>,
    cancel: CancelFlag,
}

impl TokenStream {
    /// Next token, `None` when the stream finished cleanly.
    pub async fn next_token(&mut self) -> Option<Result<String, StrandError>> {
        self.rx.recv().await
    }

    /// Signal the producer to stop; observed within one token boundary.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Drain the whole stream into one string (used for summaries).
    pub async fn collect_text(mut self) -> Result<String, StrandError> {
        let mut text = String::new();
        while let Some(item) = self.next_token().await {
            text.push_str(&item?);
        }
        Ok(text)
    }
}

impl Drop for TokenStream {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}
