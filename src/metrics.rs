/// Metrics Module - Prometheus Instrumentation
///
/// One global registry, registered once at startup, and a small helper API
/// so instrumented code never touches the metric objects directly.
/// Label values are fixed sets (error kinds, script reasons, input sources,
/// RPC methods) so cardinality stays bounded.

use std::net::SocketAddr;
use std::sync::Once;
use std::time::Instant;

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Standard latency buckets for histograms (seconds)
const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0];

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ========================================================================
    // 1. INDEXING PROGRESS
    // ========================================================================

    pub static ref BLOCKS_APPLIED: IntCounter = IntCounter::new(
        "balanceblox_blocks_applied_total",
        "Blocks whose delta map was applied completely"
    ).unwrap();

    /// Labels: kind (IndexerError::kind)
    pub static ref BLOCK_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("balanceblox_block_failures_total", "Failed block attempts by error kind"),
        &["kind"]
    ).unwrap();

    pub static ref INDEXED_HEIGHT: IntGauge = IntGauge::new(
        "balanceblox_indexed_height",
        "Height of the last applied block"
    ).unwrap();

    pub static ref CHAIN_TIP_HEIGHT: IntGauge = IntGauge::new(
        "balanceblox_chain_tip_height",
        "Chain tip height reported by the block source"
    ).unwrap();

    // ========================================================================
    // 2. DELTA AGGREGATION
    // ========================================================================

    /// Labels: source (in_block, provider)
    pub static ref INPUTS_RESOLVED: IntCounterVec = IntCounterVec::new(
        Opts::new("balanceblox_inputs_resolved_total", "Spent outputs resolved by source"),
        &["source"]
    ).unwrap();

    /// Labels: reason (empty, nulldata, multisig, invalid_pubkey, nonstandard)
    pub static ref UNSUPPORTED_SCRIPTS: IntCounterVec = IntCounterVec::new(
        Opts::new("balanceblox_unsupported_scripts_total", "Scripts skipped for lack of a single owner"),
        &["reason"]
    ).unwrap();

    // ========================================================================
    // 3. LEDGER WRITES
    // ========================================================================

    pub static ref ADDRESSES_WRITTEN: IntCounter = IntCounter::new(
        "balanceblox_addresses_written_total",
        "Balance records created or updated"
    ).unwrap();

    pub static ref ALREADY_APPLIED: IntCounter = IntCounter::new(
        "balanceblox_already_applied_total",
        "Balance writes skipped because the record already held the block"
    ).unwrap();

    pub static ref BATCH_TIMEOUTS: IntCounter = IntCounter::new(
        "balanceblox_batch_timeouts_total",
        "Write batches that exceeded their deadline"
    ).unwrap();

    pub static ref BATCH_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new("balanceblox_batch_duration_seconds", "Write batch latency")
            .buckets(LATENCY_BUCKETS.to_vec())
    ).unwrap();

    pub static ref BLOCK_APPLY_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new("balanceblox_block_apply_duration_seconds", "Whole-block apply latency")
            .buckets(LATENCY_BUCKETS.to_vec())
    ).unwrap();

    // ========================================================================
    // 4. UTXO CACHE & RPC
    // ========================================================================

    pub static ref UTXO_CACHE_HITS: IntCounter = IntCounter::new(
        "balanceblox_utxo_cache_hits_total",
        "UTXO cache hits"
    ).unwrap();

    pub static ref UTXO_CACHE_MISSES: IntCounter = IntCounter::new(
        "balanceblox_utxo_cache_misses_total",
        "UTXO cache misses"
    ).unwrap();

    pub static ref UTXO_CACHE_ENTRIES: IntGauge = IntGauge::new(
        "balanceblox_utxo_cache_entries",
        "Transactions held in the UTXO cache"
    ).unwrap();

    /// Labels: method (getblockcount, getblockhash, getblock, getrawtransaction)
    pub static ref RPC_CALL_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("balanceblox_rpc_call_duration_seconds", "RPC call latency")
            .buckets(LATENCY_BUCKETS.to_vec()),
        &["method"]
    ).unwrap();

    /// Labels: method, error_type (rpc, transport, decode)
    pub static ref RPC_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("balanceblox_rpc_errors_total", "RPC errors by method and type"),
        &["method", "error_type"]
    ).unwrap();

    // ========================================================================
    // 5. OPERATIONAL
    // ========================================================================

    pub static ref SERVICE_START_TIMESTAMP: IntGauge = IntGauge::new(
        "balanceblox_service_start_timestamp_seconds",
        "Unix time the service started"
    ).unwrap();

    static ref START: Instant = Instant::now();

    pub static ref UPTIME_SECONDS: IntGauge = IntGauge::new(
        "balanceblox_uptime_seconds",
        "Seconds since the service started"
    ).unwrap();
}

static INIT: Once = Once::new();

fn register_all() -> Result<(), prometheus::Error> {
    REGISTRY.register(Box::new(BLOCKS_APPLIED.clone()))?;
    REGISTRY.register(Box::new(BLOCK_FAILURES.clone()))?;
    REGISTRY.register(Box::new(INDEXED_HEIGHT.clone()))?;
    REGISTRY.register(Box::new(CHAIN_TIP_HEIGHT.clone()))?;

    REGISTRY.register(Box::new(INPUTS_RESOLVED.clone()))?;
    REGISTRY.register(Box::new(UNSUPPORTED_SCRIPTS.clone()))?;

    REGISTRY.register(Box::new(ADDRESSES_WRITTEN.clone()))?;
    REGISTRY.register(Box::new(ALREADY_APPLIED.clone()))?;
    REGISTRY.register(Box::new(BATCH_TIMEOUTS.clone()))?;
    REGISTRY.register(Box::new(BATCH_DURATION.clone()))?;
    REGISTRY.register(Box::new(BLOCK_APPLY_DURATION.clone()))?;

    REGISTRY.register(Box::new(UTXO_CACHE_HITS.clone()))?;
    REGISTRY.register(Box::new(UTXO_CACHE_MISSES.clone()))?;
    REGISTRY.register(Box::new(UTXO_CACHE_ENTRIES.clone()))?;
    REGISTRY.register(Box::new(RPC_CALL_DURATION.clone()))?;
    REGISTRY.register(Box::new(RPC_ERRORS.clone()))?;

    REGISTRY.register(Box::new(SERVICE_START_TIMESTAMP.clone()))?;
    REGISTRY.register(Box::new(UPTIME_SECONDS.clone()))?;
    Ok(())
}

/// Initialize metrics registry
///
/// Safe to call more than once; only the first call registers.
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    let mut result = Ok(());
    INIT.call_once(|| {
        result = register_all();
        lazy_static::initialize(&START);
    });
    result?;

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)?
        .as_secs();
    if SERVICE_START_TIMESTAMP.get() == 0 {
        SERVICE_START_TIMESTAMP.set(now as i64);
    }
    Ok(())
}

/// Gather metrics in Prometheus text format
pub fn gather_metrics() -> String {
    update_uptime();
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

async fn metrics_handler() -> String {
    gather_metrics()
}

pub fn router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

/// Serve `/metrics` until `shutdown` fires.
pub async fn serve(addr: SocketAddr, shutdown: CancellationToken) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Metrics endpoint listening");
    axum::serve(listener, router().into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

// ============================================================================
// HELPER FUNCTIONS - Clean API for instrumenting code
// ============================================================================

/// Timer for measuring durations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

pub fn increment_blocks_applied() {
    BLOCKS_APPLIED.inc();
}

pub fn increment_block_failures(kind: &str) {
    BLOCK_FAILURES.with_label_values(&[kind]).inc();
}

pub fn set_indexed_height(height: i64) {
    INDEXED_HEIGHT.set(height);
}

pub fn set_chain_tip_height(height: i64) {
    CHAIN_TIP_HEIGHT.set(height);
}

pub fn increment_inputs_resolved(source: &str) {
    INPUTS_RESOLVED.with_label_values(&[source]).inc();
}

pub fn increment_unsupported_scripts(reason: &str) {
    UNSUPPORTED_SCRIPTS.with_label_values(&[reason]).inc();
}

pub fn increment_addresses_written(count: u64) {
    ADDRESSES_WRITTEN.inc_by(count);
}

pub fn increment_already_applied(count: u64) {
    ALREADY_APPLIED.inc_by(count);
}

pub fn increment_batch_timeouts() {
    BATCH_TIMEOUTS.inc();
}

pub fn record_batch_duration(duration_secs: f64) {
    BATCH_DURATION.observe(duration_secs);
}

pub fn record_block_apply_duration(duration_secs: f64) {
    BLOCK_APPLY_DURATION.observe(duration_secs);
}

pub fn increment_utxo_cache_hits() {
    UTXO_CACHE_HITS.inc();
}

pub fn increment_utxo_cache_misses() {
    UTXO_CACHE_MISSES.inc();
}

pub fn set_utxo_cache_entries(count: i64) {
    UTXO_CACHE_ENTRIES.set(count);
}

pub fn record_rpc_call_duration(method: &str, duration_secs: f64) {
    RPC_CALL_DURATION.with_label_values(&[method]).observe(duration_secs);
}

pub fn increment_rpc_errors(method: &str, error_type: &str) {
    RPC_ERRORS.with_label_values(&[method, error_type]).inc();
}

pub fn update_uptime() {
    UPTIME_SECONDS.set(START.elapsed().as_secs() as i64);
}
