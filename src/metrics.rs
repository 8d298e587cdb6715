use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static CACHE_LOOKUP_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_lookup_total", "Cache requests by outcome");
    let vec = IntCounterVec::new(opts, &["result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_lookup_total");
    vec
});

static CACHE_REQUEST_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "cache_request_duration_seconds",
        "Request latency through the cache by outcome",
    )
    .buckets(latency_buckets());
    let vec = HistogramVec::new(opts, &["result"]).expect("create histogram vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_request_duration_seconds");
    vec
});

static CACHE_STORE_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_store_total", "Responses stored in the cache")
        .expect("create cache_store_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_store_total");
    counter
});

static CACHE_KILL_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new(
        "cache_kill_total",
        "Resources marked uncacheable by reason",
    );
    let vec = IntCounterVec::new(opts, &["reason"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_kill_total");
    vec
});

static CACHE_STORE_ERRORS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_store_errors_total", "Block store read/write failures")
        .expect("create cache_store_errors_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_store_errors_total");
    counter
});

static CACHE_EVICTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter =
        IntCounter::new("cache_evictions_total", "Cached resources evicted").expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_evictions_total");
    counter
});

static CACHE_BLOCKS_IN_USE: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("cache_blocks_in_use", "Blocks held by the content store")
        .expect("create cache_blocks_in_use");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("register cache_blocks_in_use");
    gauge
});

fn latency_buckets() -> Vec<f64> {
    vec![
        0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
    ]
}

pub fn record_cache_lookup(result: &str) {
    CACHE_LOOKUP_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_cache_duration(result: &str, elapsed: Duration) {
    CACHE_REQUEST_SECONDS
        .with_label_values(&[result])
        .observe(elapsed.as_secs_f64());
}

pub fn record_cache_store() {
    CACHE_STORE_TOTAL.inc();
}

pub fn record_cache_kill(reason: &str) {
    CACHE_KILL_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_cache_store_error() {
    CACHE_STORE_ERRORS_TOTAL.inc();
}

pub fn record_cache_eviction() {
    CACHE_EVICTIONS_TOTAL.inc();
}

pub fn set_cache_blocks_in_use(blocks: u64) {
    CACHE_BLOCKS_IN_USE.set(blocks as i64);
}

pub fn gather() -> Vec<u8> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("encode metrics");
    buffer
}

pub fn content_type() -> String {
    TextEncoder::new().format_type().to_string()
}
