use std::time::{Duration, Instant};

use opentelemetry::{
    metrics::{Counter, Histogram},
    KeyValue,
};

pub mod rpc_stats {
    use opentelemetry::metrics::{Counter, Histogram};

    #[derive(Debug)]
    pub struct Metrics {
        pub invocations: Counter<u64>,
        pub invocation_errors: Counter<u64>,
        pub invocation_duration: Histogram<f64>,
        pub queue_rejections: Counter<u64>,
        pub relocated_payloads: Counter<u64>,
        pub request_bytes: Counter<u64>,
        pub response_bytes: Counter<u64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("geohub-server");
            let invocations = meter
                .u64_counter("geohub.rpc.invocations")
                .with_description("number of remote function invocations")
                .build();
            let invocation_errors = meter
                .u64_counter("geohub.rpc.invocation_errors")
                .with_description("number of failed remote function invocations")
                .build();
            let invocation_duration = meter
                .f64_histogram("geohub.rpc.invocation_duration")
                .with_description("remote function invocation latencies in seconds")
                .build();
            let queue_rejections = meter
                .u64_counter("geohub.rpc.queue_rejections")
                .with_description("number of calls rejected by admission control")
                .build();
            let relocated_payloads = meter
                .u64_counter("geohub.rpc.relocated_payloads")
                .with_description("number of oversized payloads moved out-of-band")
                .build();
            let request_bytes = meter
                .u64_counter("geohub.rpc.request_bytes")
                .with_description("number of bytes submitted to connectors")
                .build();
            let response_bytes = meter
                .u64_counter("geohub.rpc.response_bytes")
                .with_description("number of bytes received from connectors")
                .build();
            Metrics {
                invocations,
                invocation_errors,
                invocation_duration,
                queue_rejections,
                relocated_payloads,
                request_bytes,
                response_bytes,
            }
        }
    }
}

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Counter<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.add(duration.as_secs_f64(), labels);
    }
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
    labels: &'a [KeyValue],
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    pub fn start(metric: &'a T) -> Self {
        Self::start_with_labels(metric, &[])
    }

    pub fn start_with_labels(metric: &'a T, labels: &'a [KeyValue]) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels,
        }
    }
}

impl<T: TimerUpdate + Sync> Drop for Timer<'_, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), self.labels);
    }
}
