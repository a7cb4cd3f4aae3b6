//! Single-slot response cache keyed by `(document, version)`.
//!
//! Callers asking the same question about the same document version share
//! one in-flight (or finished) outcome instead of each hitting the worker.

use std::future::Future;
use std::sync::{Mutex, PoisonError};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};

use tsbridge_types::ServerResponse;

type SharedOutcome = Shared<BoxFuture<'static, ServerResponse>>;

struct Slot {
    document: String,
    version: i32,
    outcome: SharedOutcome,
}

/// Use one instance per request kind.
#[derive(Default)]
pub struct CachedResponse {
    slot: Mutex<Option<Slot>>,
}

impl CachedResponse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the outcome for `(document, version)`, calling `resolve` only
    /// when the slot holds a different key or a cancelled outcome.
    pub async fn execute<F, Fut>(&self, document: &str, version: i32, resolve: F) -> ServerResponse
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ServerResponse> + Send + 'static,
    {
        let outcome = {
            let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
            match slot.as_mut() {
                Some(current) if current.document == document && current.version == version => {
                    let previous = current.outcome.clone();
                    // A cancelled outcome belonged to a caller that gave up;
                    // whoever asks next gets a fresh attempt.
                    let chained = async move {
                        let response = previous.await;
                        if response.is_cancelled() {
                            resolve().await
                        } else {
                            response
                        }
                    }
                    .boxed()
                    .shared();
                    current.outcome = chained.clone();
                    chained
                }
                _ => {
                    tracing::trace!(document, version, "response cache miss");
                    let fresh = resolve().boxed().shared();
                    *slot = Some(Slot {
                        document: document.to_string(),
                        version,
                        outcome: fresh.clone(),
                    });
                    fresh
                }
            }
        };
        outcome.await
    }

    pub fn on_document_close(&self, document: &str) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|current| current.document == document) {
            *slot = None;
        }
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}
