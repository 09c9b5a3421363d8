//! Token cost calculation and usage recording
//!
//! Costs are computed from per-model pricing (USD per million tokens) and
//! rounded to six decimals. Usage records are handed to a [`UsageSink`] on a
//! detached task: a slow or failing sink never delays or fails the request
//! that produced the record.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::models::{Usage, UsageAttribution, UsageRecord};
use crate::provider::ModelPricing;

/// Round to six decimal places
pub fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

/// Cost in USD for the given token counts
pub fn calculate_cost(pricing: ModelPricing, prompt_tokens: usize, completion_tokens: usize) -> f64 {
    let input = (prompt_tokens as f64 / 1_000_000.0) * pricing.input_per_million;
    let output = (completion_tokens as f64 / 1_000_000.0) * pricing.output_per_million;
    round6(input + output)
}

/// Destination for usage records
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, record: UsageRecord) -> anyhow::Result<()>;
}

/// Emits each record as a structured log event
#[derive(Debug, Default, Clone)]
pub struct TracingUsageSink;

#[async_trait]
impl UsageSink for TracingUsageSink {
    async fn record(&self, record: UsageRecord) -> anyhow::Result<()> {
        info!(
            project_id = %record.project_id,
            user_id = record.user_id.as_deref().unwrap_or("-"),
            model = %record.model,
            prompt_tokens = record.prompt_tokens,
            completion_tokens = record.completion_tokens,
            cost = record.cost,
            operation = %record.operation,
            "AI usage recorded"
        );
        Ok(())
    }
}

/// Default number of records kept by [`InMemoryUsageSink`]
pub const DEFAULT_IN_MEMORY_CAPACITY: usize = 10_000;

/// Bounded in-memory buffer, readable for polling. The oldest record is
/// evicted once capacity is reached.
#[derive(Debug)]
pub struct InMemoryUsageSink {
    records: Mutex<VecDeque<UsageRecord>>,
    capacity: usize,
}

impl InMemoryUsageSink {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_IN_MEMORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Total recorded cost for a project
    pub fn total_cost(&self, project_id: &str) -> f64 {
        round6(
            self.records
                .lock()
                .iter()
                .filter(|r| r.project_id == project_id)
                .map(|r| r.cost)
                .sum(),
        )
    }
}

impl Default for InMemoryUsageSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UsageSink for InMemoryUsageSink {
    async fn record(&self, record: UsageRecord) -> anyhow::Result<()> {
        let mut records = self.records.lock();
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
        Ok(())
    }
}

/// Appends one JSON object per line to a file
pub struct JsonLinesUsageSink {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl JsonLinesUsageSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl UsageSink for JsonLinesUsageSink {
    async fn record(&self, record: UsageRecord) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Computes costs and forwards usage records to a sink
#[derive(Clone)]
pub struct UsageAccountant {
    sink: Arc<dyn UsageSink>,
}

impl UsageAccountant {
    pub fn new(sink: Arc<dyn UsageSink>) -> Self {
        Self { sink }
    }

    pub fn cost(&self, pricing: ModelPricing, usage: &Usage) -> f64 {
        calculate_cost(pricing, usage.prompt_tokens, usage.completion_tokens)
    }

    /// Build the record for a finished request and write it in the
    /// background. Returns the record that was submitted.
    pub fn record(
        &self,
        attribution: &UsageAttribution,
        model: &str,
        usage: &Usage,
    ) -> UsageRecord {
        let record = UsageRecord {
            project_id: attribution.project_id.clone(),
            user_id: attribution.user_id.clone(),
            model: model.to_string(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            cost: usage.estimated_cost,
            operation: attribution.operation.clone(),
            timestamp: Utc::now(),
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                project_id = %record.project_id,
                "No async runtime available, dropping usage record"
            );
            return record;
        };

        let sink = Arc::clone(&self.sink);
        let submitted = record.clone();
        runtime.spawn(async move {
            let project_id = submitted.project_id.clone();
            match sink.record(submitted).await {
                Ok(()) => debug!(project_id = %project_id, "Usage record persisted"),
                Err(e) => warn!(
                    project_id = %project_id,
                    error = %e,
                    "Failed to persist usage record"
                ),
            }
        });
        record
    }
}

impl Default for UsageAccountant {
    fn default() -> Self {
        Self::new(Arc::new(TracingUsageSink))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;

    #[derive(Default)]
    struct FailingSink {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl UsageSink for FailingSink {
        async fn record(&self, _record: UsageRecord) -> anyhow::Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("database unavailable")
        }
    }

    struct SlowSink;

    #[async_trait]
    impl UsageSink for SlowSink {
        async fn record(&self, _record: UsageRecord) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[test]
    fn test_cost_formula() {
        let pricing = ModelPricing::new(2.50, 10.00);
        assert_eq!(calculate_cost(pricing, 1_000, 500), 0.0075);
    }

    #[test]
    fn test_cost_is_rounded_to_six_decimals() {
        let pricing = ModelPricing::new(0.15, 0.60);
        // 7 * 0.15e-6 + 3 * 0.6e-6 = 0.00000285
        assert_eq!(calculate_cost(pricing, 7, 3), 0.000003);
    }

    #[test]
    fn test_round6() {
        assert_eq!(round6(0.1234564), 0.123456);
        assert_eq!(round6(0.1234565001), 0.123457);
    }

    proptest! {
        #[test]
        fn prop_cost_is_non_negative_and_monotonic(
            prompt in 0usize..5_000_000,
            completion in 0usize..5_000_000,
            extra in 1usize..100_000,
        ) {
            let pricing = ModelPricing::new(2.5, 10.0);
            let base = calculate_cost(pricing, prompt, completion);
            prop_assert!(base >= 0.0);
            prop_assert!(calculate_cost(pricing, prompt + extra, completion) >= base);
            prop_assert!(calculate_cost(pricing, prompt, completion + extra) >= base);
        }
    }

    fn attribution() -> UsageAttribution {
        UsageAttribution::new("proj-1", "generate_stories").with_user("user-7")
    }

    #[tokio::test]
    async fn test_record_reaches_sink() {
        let sink = Arc::new(InMemoryUsageSink::new());
        let accountant = UsageAccountant::new(sink.clone());
        let usage = Usage::new(1_000, 500).with_cost(0.0075);

        let record = accountant.record(&attribution(), "gpt-4o", &usage);
        assert_eq!(record.cost, 0.0075);
        assert_eq!(record.user_id.as_deref(), Some("user-7"));

        for _ in 0..10 {
            if !sink.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(sink.records(), vec![record]);
        assert_eq!(sink.total_cost("proj-1"), 0.0075);
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_propagate() {
        let sink = Arc::new(FailingSink::default());
        let accountant = UsageAccountant::new(sink.clone());
        let record = accountant.record(&attribution(), "gpt-4o", &Usage::new(1, 1));
        assert_eq!(record.project_id, "proj-1");

        for _ in 0..10 {
            if sink.attempts.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 1);

        // the accountant keeps working after a failed write
        accountant.record(&attribution(), "gpt-4o", &Usage::new(2, 2));
        for _ in 0..10 {
            if sink.attempts.load(Ordering::SeqCst) > 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_sink_does_not_block_caller() {
        let accountant = UsageAccountant::new(Arc::new(SlowSink));
        let started = tokio::time::Instant::now();
        accountant.record(&attribution(), "gpt-4o", &Usage::new(1, 1));
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_record_without_runtime_is_dropped_quietly() {
        let sink = Arc::new(InMemoryUsageSink::new());
        let accountant = UsageAccountant::new(sink.clone());
        accountant.record(&attribution(), "gpt-4o", &Usage::new(1, 1));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_in_memory_sink_evicts_oldest() {
        let sink = InMemoryUsageSink::with_capacity(2);
        let accountant = UsageAccountant::new(Arc::new(InMemoryUsageSink::new()));
        for tokens in 1..=3 {
            let record = accountant.record(&attribution(), "gpt-4o", &Usage::new(tokens, 0));
            sink.record(record).await.unwrap();
        }
        let kept: Vec<usize> = sink.records().iter().map(|r| r.prompt_tokens).collect();
        assert_eq!(kept, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_json_lines_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonLinesUsageSink::new(dir.path().join("usage.jsonl"));
        let accountant = UsageAccountant::new(Arc::new(InMemoryUsageSink::new()));
        let record = accountant.record(&attribution(), "gpt-4o", &Usage::new(10, 2));

        sink.record(record.clone()).await.unwrap();
        sink.record(record.clone()).await.unwrap();

        let contents = tokio::fs::read_to_string(sink.path()).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: UsageRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed, record);
    }
}
