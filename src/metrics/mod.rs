//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Job submissions, completions and failures per queue
//! - Grouped processor deferrals
//! - Attestation polling
//! - Wallet token balances

use crate::error::{SettlementError, SettlementResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Queue metrics
    pub static ref JOBS_ENQUEUED: CounterVec = register_counter_vec!(
        "settlement_jobs_enqueued_total",
        "Total jobs accepted by the queue",
        &["queue", "job"]
    ).unwrap();

    pub static ref DUPLICATE_SUBMISSIONS: CounterVec = register_counter_vec!(
        "settlement_duplicate_submissions_total",
        "Submissions collapsed into an existing job id",
        &["queue", "job"]
    ).unwrap();

    // Processing metrics
    pub static ref JOBS_COMPLETED: CounterVec = register_counter_vec!(
        "settlement_jobs_completed_total",
        "Total jobs executed successfully",
        &["queue", "job"]
    ).unwrap();

    pub static ref JOBS_FAILED: CounterVec = register_counter_vec!(
        "settlement_jobs_failed_total",
        "Total failed job attempts",
        &["queue", "job", "terminal"]
    ).unwrap();

    pub static ref GROUP_DEFERRALS: CounterVec = register_counter_vec!(
        "settlement_group_deferrals_total",
        "Jobs deferred because their group was busy",
        &["queue"]
    ).unwrap();

    pub static ref JOB_LATENCY: HistogramVec = register_histogram_vec!(
        "settlement_job_duration_seconds",
        "Job execution time",
        &["queue", "job"],
        vec![0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).unwrap();

    // Bridge metrics
    pub static ref ATTESTATION_POLLS: CounterVec = register_counter_vec!(
        "settlement_attestation_polls_total",
        "Attestation fetches by resulting status",
        &["status"]
    ).unwrap();

    // Wallet metrics
    pub static ref TOKEN_BALANCE: GaugeVec = register_gauge_vec!(
        "settlement_wallet_token_balance",
        "Wallet token balance in token units",
        &["chain_id", "wallet", "token"]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> SettlementResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| SettlementError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| SettlementError::Internal(format!("Metrics server failed: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_job_enqueued(queue: &str, job: &str) {
    JOBS_ENQUEUED.with_label_values(&[queue, job]).inc();
}

pub fn record_duplicate_submission(queue: &str, job: &str) {
    DUPLICATE_SUBMISSIONS.with_label_values(&[queue, job]).inc();
}

pub fn record_job_completed(queue: &str, job: &str, latency_secs: f64) {
    JOBS_COMPLETED.with_label_values(&[queue, job]).inc();
    JOB_LATENCY.with_label_values(&[queue, job]).observe(latency_secs);
}

pub fn record_job_failed(queue: &str, job: &str, terminal: bool) {
    let terminal = if terminal { "true" } else { "false" };
    JOBS_FAILED.with_label_values(&[queue, job, terminal]).inc();
}

pub fn record_group_deferral(queue: &str) {
    GROUP_DEFERRALS.with_label_values(&[queue]).inc();
}

pub fn record_attestation_poll(status: &str) {
    ATTESTATION_POLLS.with_label_values(&[status]).inc();
}

pub fn record_token_balance(chain_id: u64, wallet: &str, token: &str, balance: f64) {
    TOKEN_BALANCE
        .with_label_values(&[&chain_id.to_string(), wallet, token])
        .set(balance);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_jobs_split_by_terminal_label() {
        record_job_failed("metrics-test", "EXECUTE_CCTP_MINT", true);
        record_job_failed("metrics-test", "EXECUTE_CCTP_MINT", false);
        record_job_failed("metrics-test", "EXECUTE_CCTP_MINT", false);

        let retrying = JOBS_FAILED
            .with_label_values(&["metrics-test", "EXECUTE_CCTP_MINT", "false"])
            .get();
        assert_eq!(retrying, 2.0);
    }

    #[tokio::test]
    async fn test_handler_renders_registered_metrics() {
        record_group_deferral("metrics-handler-test");
        let body = metrics_handler().await.unwrap();
        assert!(body.contains("settlement_group_deferrals_total"));
    }
}
