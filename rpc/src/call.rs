use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::RpcError;

pub type CallResult = Result<Bytes, RpcError>;

/// One submitted invocation. The completion sender is taken exactly once,
/// whichever of success, failure or cancellation gets there first; later
/// outcomes are dropped silently.
pub struct FunctionCall {
    pub stream_id: String,
    pub payload: Bytes,
    pub fire_and_forget: bool,
    /// Priority calls (health checks, warmup) bypass admission limits.
    pub priority: bool,
    cancel: CancellationToken,
    completion: Mutex<Option<oneshot::Sender<CallResult>>>,
    response_size: AtomicU64,
}

impl FunctionCall {
    pub fn new(
        stream_id: impl Into<String>,
        payload: Bytes,
        fire_and_forget: bool,
        priority: bool,
    ) -> (Arc<Self>, oneshot::Receiver<CallResult>) {
        let (tx, rx) = oneshot::channel();
        let call = Arc::new(Self {
            stream_id: stream_id.into(),
            payload,
            fire_and_forget,
            priority,
            cancel: CancellationToken::new(),
            completion: Mutex::new(Some(tx)),
            response_size: AtomicU64::new(0),
        });
        (call, rx)
    }

    pub fn byte_size(&self) -> u64 {
        self.payload.len() as u64
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Delivers the outcome. Returns false if the call was already completed,
    /// in which case `result` is dropped.
    pub fn complete(&self, result: CallResult) -> bool {
        let sender = self
            .completion
            .lock()
            .expect("completion lock poisoned")
            .take();
        match sender {
            Some(tx) => {
                if let Ok(bytes) = &result {
                    self.response_size
                        .store(bytes.len() as u64, Ordering::Relaxed);
                }
                // The receiver may be gone for fire-and-forget calls.
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completion
            .lock()
            .expect("completion lock poisoned")
            .is_none()
    }

    /// Cooperative, best-effort cancellation. Completes the callback with a
    /// cancellation outcome and signals the transport token; the remote side
    /// is not guaranteed to halt. A cancel after completion is a no-op.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.complete(Err(RpcError::Cancelled));
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn response_size(&self) -> u64 {
        self.response_size.load(Ordering::Relaxed)
    }
}

/// Handed back to the caller as soon as the call is submitted, so it can
/// observe sizes and request cancellation while the call is in flight.
#[derive(Clone)]
pub struct RpcContext {
    request_size: u64,
    call: Arc<FunctionCall>,
}

impl RpcContext {
    pub(crate) fn new(call: Arc<FunctionCall>) -> Self {
        Self {
            request_size: call.byte_size(),
            call,
        }
    }

    pub fn request_size(&self) -> u64 {
        self.request_size
    }

    /// Response size; 0 until the call completed successfully.
    pub fn response_size(&self) -> u64 {
        self.call.response_size()
    }

    pub fn cancel(&self) {
        self.call.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.call.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_callback_fires_exactly_once() {
        let (call, rx) = FunctionCall::new("s1", Bytes::from_static(b"{}"), false, false);
        assert!(call.complete(Ok(Bytes::from_static(b"ok"))));
        assert!(!call.complete(Err(RpcError::BadGateway("late".into()))));
        assert!(!call.complete(Ok(Bytes::from_static(b"later"))));
        assert_eq!(rx.await.unwrap().unwrap(), Bytes::from_static(b"ok"));
    }

    #[tokio::test]
    async fn test_exactly_once_under_racing_completers() {
        for _ in 0..64 {
            let (call, rx) = FunctionCall::new("s1", Bytes::from_static(b"{}"), false, false);
            let mut handles = Vec::new();
            for i in 0..8 {
                let call = call.clone();
                handles.push(tokio::spawn(async move {
                    if i % 3 == 0 {
                        call.cancel();
                        false
                    } else {
                        call.complete(Ok(Bytes::from(format!("winner {i}"))))
                    }
                }));
            }
            // Exactly one completer wins (cancel() also counts via its inner
            // complete), and the receiver observes exactly one outcome.
            rx.await.unwrap().ok();
            let mut wins = 0;
            for handle in handles {
                if handle.await.unwrap() {
                    wins += 1;
                }
            }
            assert!(wins <= 1);
            assert!(call.is_completed());
        }
    }

    #[tokio::test]
    async fn test_cancel_after_completion_is_noop() {
        let (call, rx) = FunctionCall::new("s1", Bytes::from_static(b"{}"), false, false);
        call.complete(Ok(Bytes::from_static(b"done")));
        call.cancel();
        // The original outcome is preserved.
        assert_eq!(rx.await.unwrap().unwrap(), Bytes::from_static(b"done"));
        // The token still trips so transports can stop wasted work.
        assert!(call.is_cancelled());
    }
}
