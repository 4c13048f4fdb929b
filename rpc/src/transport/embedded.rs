use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicI64, AtomicUsize, Ordering},
        mpsc::{self, RecvTimeoutError, TrySendError},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use data_model::{ConnectorConfig, ConnectorId};
use geohub_utils::CounterGuard;
use tokio::sync::oneshot;
use tracing::info_span;

use crate::{call::FunctionCall, error::RpcError, transport::FunctionTransport};

const MIN_POOL_THREADS: usize = 2;
const IDLE_THREAD_TIMEOUT: Duration = Duration::from_secs(30);

/// An in-process connector implementation. Handlers are synchronous; the
/// embedded transport keeps them off the async executor.
pub trait EmbeddedHandler: Send + Sync {
    fn handle(&self, payload: &[u8]) -> Result<Vec<u8>>;
}

/// Handlers looked up by the name carried in the connector configuration.
#[derive(Default)]
pub struct EmbeddedHandlerRegistry {
    handlers: DashMap<String, Arc<dyn EmbeddedHandler>>,
}

impl EmbeddedHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn EmbeddedHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn EmbeddedHandler>> {
        self.handlers
            .get(name)
            .map(|h| h.value().clone())
            .ok_or_else(|| anyhow!("no embedded handler registered under \"{name}\""))
    }
}

struct Job {
    stream_id: String,
    payload: Bytes,
    reply: oneshot::Sender<Result<Vec<u8>, RpcError>>,
}

struct PoolShared {
    connector: ConnectorId,
    handler: Arc<dyn EmbeddedHandler>,
    rx: Mutex<mpsc::Receiver<Job>>,
    live_threads: AtomicUsize,
    busy_threads: AtomicI64,
    max_threads: AtomicUsize,
}

impl PoolShared {
    fn run_job(&self, job: Job) {
        let _busy = CounterGuard::new("busy", |_, delta| {
            self.busy_threads.fetch_add(delta, Ordering::SeqCst);
        });
        // The handler runs under its own root span so its logging context
        // stays separated from the submitting caller's.
        let span = info_span!(
            "embedded_function",
            connector = %self.connector,
            stream_id = %job.stream_id
        );
        let _entered = span.enter();
        let outcome = catch_unwind(AssertUnwindSafe(|| self.handler.handle(&job.payload)));
        let result = match outcome {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(e)) => Err(RpcError::BadGateway(format!("embedded handler failed: {e}"))),
            Err(_) => Err(RpcError::BadGateway("embedded handler panicked".to_string())),
        };
        let _ = job.reply.send(result);
    }
}

fn worker(shared: Arc<PoolShared>) {
    loop {
        let received = {
            let rx = shared.rx.lock().expect("pool receiver lock poisoned");
            rx.recv_timeout(IDLE_THREAD_TIMEOUT)
        };
        match received {
            Ok(job) => shared.run_job(job),
            Err(RecvTimeoutError::Timeout) => {
                // Shrink back towards the floor when idle.
                let live = shared.live_threads.load(Ordering::Acquire);
                if live > MIN_POOL_THREADS &&
                    shared
                        .live_threads
                        .compare_exchange(live, live - 1, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// Runs an in-process handler on a dedicated bounded thread pool. The
/// hand-off channel has zero capacity: a call only enters the pool when a
/// thread is ready to take it, so over-capacity work queues upstream in the
/// admission core instead of hiding inside the pool.
pub struct EmbeddedFunctionClient {
    tx: mpsc::SyncSender<Job>,
    shared: Arc<PoolShared>,
    timeout: Duration,
}

impl EmbeddedFunctionClient {
    pub fn new(
        connector: ConnectorId,
        handler: Arc<dyn EmbeddedHandler>,
        max_connections: u32,
        timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::sync_channel(0);
        let max_threads = (max_connections as usize).max(MIN_POOL_THREADS);
        let shared = Arc::new(PoolShared {
            connector,
            handler,
            rx: Mutex::new(rx),
            live_threads: AtomicUsize::new(0),
            busy_threads: AtomicI64::new(0),
            max_threads: AtomicUsize::new(max_threads),
        });
        let client = Self {
            tx,
            shared,
            timeout,
        };
        for _ in 0..MIN_POOL_THREADS {
            client.spawn_thread();
        }
        client
    }

    fn spawn_thread(&self) {
        self.shared.live_threads.fetch_add(1, Ordering::AcqRel);
        let shared = self.shared.clone();
        std::thread::Builder::new()
            .name(format!("embedded-{}", shared.connector))
            .spawn(move || worker(shared))
            .expect("failed to spawn embedded pool thread");
    }

    fn try_grow(&self) {
        loop {
            let live = self.shared.live_threads.load(Ordering::Acquire);
            if live >= self.shared.max_threads.load(Ordering::Acquire) {
                return;
            }
            if self
                .shared
                .live_threads
                .compare_exchange(live, live + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let shared = self.shared.clone();
                std::thread::Builder::new()
                    .name(format!("embedded-{}", shared.connector))
                    .spawn(move || worker(shared))
                    .expect("failed to spawn embedded pool thread");
                return;
            }
        }
    }

    async fn dispatch(&self, mut job: Job) -> Result<(), RpcError> {
        loop {
            match self.tx.try_send(job) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(returned)) => {
                    job = returned;
                    self.try_grow();
                    // Rendezvous hand-off: wait for a thread to become ready.
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                Err(TrySendError::Disconnected(_)) => {
                    return Err(RpcError::BadGateway("embedded pool is stopped".to_string()));
                }
            }
        }
    }
}

#[async_trait]
impl FunctionTransport for EmbeddedFunctionClient {
    async fn invoke(&self, call: &FunctionCall) -> Result<Bytes, RpcError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job {
            stream_id: call.stream_id.clone(),
            payload: call.payload.clone(),
            reply: reply_tx,
        };

        let work = async {
            self.dispatch(job).await?;
            match reply_rx.await {
                Ok(result) => result.map(Bytes::from),
                Err(_) => Err(RpcError::BadGateway(
                    "embedded handler dropped the call".to_string(),
                )),
            }
        };

        tokio::select! {
            _ = call.cancel_token().cancelled() => Err(RpcError::Cancelled),
            outcome = tokio::time::timeout(self.timeout, work) => match outcome {
                Ok(result) => result,
                Err(_) => Err(RpcError::GatewayTimeout(format!(
                    "embedded handler did not finish within {:?}",
                    self.timeout
                ))),
            },
        }
    }

    fn on_config_update(&self, config: &ConnectorConfig) {
        let max_threads = (config.max_connections() as usize).max(MIN_POOL_THREADS);
        self.shared.max_threads.store(max_threads, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    struct EchoHandler;

    impl EmbeddedHandler for EchoHandler {
        fn handle(&self, payload: &[u8]) -> Result<Vec<u8>> {
            Ok(payload.to_vec())
        }
    }

    struct SlowHandler {
        concurrent: AtomicUsize,
        max_seen: AtomicUsize,
    }

    impl EmbeddedHandler for SlowHandler {
        fn handle(&self, payload: &[u8]) -> Result<Vec<u8>> {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            Ok(payload.to_vec())
        }
    }

    struct PanickingHandler;

    impl EmbeddedHandler for PanickingHandler {
        fn handle(&self, _payload: &[u8]) -> Result<Vec<u8>> {
            panic!("handler bug");
        }
    }

    fn call_with(payload: &'static [u8]) -> Arc<FunctionCall> {
        let (call, _rx) = FunctionCall::new("s", Bytes::from_static(payload), false, false);
        call
    }

    #[tokio::test]
    async fn test_echo_roundtrip() {
        let client = EmbeddedFunctionClient::new(
            ConnectorId::from("embedded-1"),
            Arc::new(EchoHandler),
            4,
            Duration::from_secs(5),
        );
        let body = client.invoke(&call_with(b"payload")).await.unwrap();
        assert_eq!(body, Bytes::from_static(b"payload"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_never_exceeds_max_threads() {
        let handler = Arc::new(SlowHandler {
            concurrent: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
        });
        let client = Arc::new(EmbeddedFunctionClient::new(
            ConnectorId::from("embedded-1"),
            handler.clone(),
            3,
            Duration::from_secs(10),
        ));

        let mut handles = Vec::new();
        for _ in 0..12 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                client.invoke(&call_with(b"x")).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(handler.max_seen.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let client = EmbeddedFunctionClient::new(
            ConnectorId::from("embedded-1"),
            Arc::new(PanickingHandler),
            2,
            Duration::from_secs(5),
        );
        match client.invoke(&call_with(b"x")).await {
            Err(RpcError::BadGateway(msg)) => assert!(msg.contains("panicked")),
            other => panic!("expected bad gateway, got {:?}", other.map(|b| b.len())),
        }
        // The pool survives the panic.
        match client.invoke(&call_with(b"y")).await {
            Err(RpcError::BadGateway(_)) => {}
            other => panic!("expected bad gateway, got {:?}", other.map(|b| b.len())),
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = EmbeddedHandlerRegistry::new();
        registry.register("echo", Arc::new(EchoHandler));
        assert!(registry.get("echo").is_ok());
        assert!(registry.get("missing").is_err());
    }
}
