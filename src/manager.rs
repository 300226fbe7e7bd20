//! Pipeline orchestration: the component all five others serve.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map as JsonMap, Value};

use crate::dedup::{DedupStats, RequestDeduplicator};
use crate::error::Result;
use crate::estimator::estimate_str_tokens;
use crate::events::{EventBus, OptimizationEvent, Recommendation};
use crate::key::RequestKey;
use crate::optimizer::{TokenBudgetConfig, TokenUsageMetrics, TokenUsageOptimizer};
use crate::persistent_cache::{PersistentCache, PersistentCacheStats};
use crate::suggester::{QueryAnalysis, ToolSuggester};
use crate::summarizer::{ResultSummarizer, SummarizationOptions};
use tracing::warn;

/// Per-call toggles. All stages default on.
#[derive(Debug, Clone)]
pub struct ContextOptimizationOptions {
    pub enable_cache: bool,
    pub enable_dedup: bool,
    pub enable_summarize: bool,
    pub enforce_budget: bool,
    pub cache_duration: Duration,
    pub summarization: SummarizationOptions,
}

impl Default for ContextOptimizationOptions {
    fn default() -> Self {
        Self {
            enable_cache: true,
            enable_dedup: true,
            enable_summarize: true,
            enforce_budget: true,
            cache_duration: Duration::from_secs(300),
            summarization: SummarizationOptions::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OptimizedToolResult {
    pub tool_name: String,
    pub parameters: JsonMap<String, Value>,
    pub response: String,
    pub was_cached: bool,
    pub was_deduplicated: bool,
    pub tags: Vec<String>,
    pub tokens_saved: u32,
    pub requested_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Always `None` on success: executor/storage failures propagate as `Err`
    /// from `process` rather than being carried in a successful result (spec's
    /// `error: optional` field is populated only by collaborators that choose
    /// to report partial failure without aborting the call — none do today).
    pub error: Option<String>,
}

impl OptimizedToolResult {
    /// `None` until `completed_at` is filled in.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|end| end - self.requested_at)
    }
}

#[derive(Debug, Clone)]
pub struct ManagerStatistics {
    pub token_metrics: TokenUsageMetrics,
    pub dedup_stats: DedupStats,
    pub cache_stats: PersistentCacheStats,
    pub suggester_history: std::collections::HashMap<String, f64>,
    pub efficiency_score: f64,
}

pub struct ContextWindowManager {
    persistent: PersistentCache,
    dedup: RequestDeduplicator,
    optimizer: TokenUsageOptimizer,
    summarizer: ResultSummarizer,
    suggester: ToolSuggester,
    events: EventBus,
}

impl ContextWindowManager {
    pub fn new(persistent: PersistentCache, budget: TokenBudgetConfig) -> Self {
        let events = EventBus::new();
        Self {
            persistent,
            dedup: RequestDeduplicator::new(),
            optimizer: TokenUsageOptimizer::new(budget, events.clone()),
            summarizer: ResultSummarizer::new(),
            suggester: ToolSuggester::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<OptimizationEvent> {
        self.events.subscribe()
    }

    fn tag(&self, tags: &mut Vec<String>, name: &'static str) {
        tags.push(name.to_string());
        self.events.emit(OptimizationEvent::OptimizationApplied(name.to_string()));
    }

    /// Run one tool call through the full pipeline.
    pub async fn process<F, Fut>(
        &self,
        tool: &str,
        params: JsonMap<String, Value>,
        executor: F,
        options: Option<ContextOptimizationOptions>,
    ) -> Result<OptimizedToolResult>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        let requested_at = Utc::now();
        let options = options.unwrap_or_default();
        let key = RequestKey::make(tool, Some(params.clone()))?;
        let fingerprint = key.fingerprint().to_string();
        let params_json = serde_json::to_string(&Value::Object(params.clone())).unwrap_or_else(|_| "{}".to_string());

        let mut tags = Vec::new();
        let mut tokens_saved = 0u32;
        let mut was_cached = false;
        let mut was_deduplicated = false;
        let mut cache_available = options.enable_cache;

        let mut response = if options.enable_cache {
            match self.persistent.get(tool, &fingerprint).await {
                Ok(Some(cached)) => {
                    was_cached = true;
                    self.tag(&mut tags, "persistent_cache_hit");
                    Some(cached)
                }
                Ok(None) => None,
                Err(e) => {
                    warn!(tool, error = %e, "persistent cache read failed, continuing without it");
                    cache_available = false;
                    self.tag(&mut tags, "cache_unavailable");
                    None
                }
            }
        } else {
            None
        };

        if response.is_none() {
            let executed = if options.enable_dedup {
                let pre_cached = self.dedup.cached(tool, params.clone()).unwrap_or(false);
                let cache_duration = options.cache_duration;
                let result = self
                    .dedup
                    .process(tool, params.clone(), executor, Some(cache_duration))
                    .await?;
                if pre_cached {
                    was_deduplicated = true;
                    self.tag(&mut tags, "request_deduplication");
                }
                result
            } else {
                executor().await?
            };

            self.optimizer.record_usage(tool, &params_json, &executed);

            let mut executed = executed;
            if options.enable_summarize {
                if let Ok(result) = self.summarizer.summarize(&executed, &options.summarization) {
                    if result.summarized_length < executed.len() {
                        let before = estimate_str_tokens(&executed);
                        let after = estimate_str_tokens(&result.content);
                        let saved = before.saturating_sub(after);
                        tokens_saved += saved;
                        self.optimizer.record_savings(tool, saved);
                        executed = result.content;
                        self.tag(&mut tags, "summarization");
                    }
                }
            }

            response = Some(executed);
        }

        let mut response = response.expect("response is set on every path above");

        if options.enforce_budget {
            let before = estimate_str_tokens(&response);
            let (optimized, modified) = self.optimizer.check_and_optimize_response(&response);
            if modified {
                let after = estimate_str_tokens(&optimized);
                tokens_saved += before.saturating_sub(after);
                response = optimized;
                self.tag(&mut tags, "token_budget_enforcement");
            }
        }

        if cache_available && !was_cached {
            if let Err(e) = self
                .persistent
                .put(
                    tool,
                    &fingerprint,
                    &params_json,
                    &response,
                    chrono::Duration::from_std(options.cache_duration).unwrap_or(chrono::Duration::seconds(300)),
                )
                .await
            {
                warn!(tool, error = %e, "persistent cache write failed, continuing without it");
                self.tag(&mut tags, "cache_unavailable");
            }
        }

        Ok(OptimizedToolResult {
            tool_name: tool.to_string(),
            parameters: params,
            response,
            was_cached,
            was_deduplicated,
            tags,
            tokens_saved,
            requested_at,
            completed_at: Some(Utc::now()),
            error: None,
        })
    }

    pub fn analyze_query(&self, text: &str, max: usize) -> QueryAnalysis {
        self.suggester.analyze_query(text, max)
    }

    pub fn record_tool_feedback(&self, tool: &str, was_relevant: bool) {
        self.suggester.record_tool_feedback(tool, was_relevant);
    }

    pub async fn statistics(&self) -> Result<ManagerStatistics> {
        Ok(ManagerStatistics {
            token_metrics: self.optimizer.metrics(),
            dedup_stats: self.dedup.stats(),
            cache_stats: self.persistent.stats().await?,
            suggester_history: self.suggester.history_snapshot(),
            efficiency_score: self.optimizer.efficiency_score(),
        })
    }

    pub fn recommendations(&self) -> Vec<Recommendation> {
        self.optimizer.generate_recommendations()
    }

    pub async fn maintenance(&self) -> Result<u64> {
        self.persistent.cleanup_expired().await
    }

    pub async fn reset(&self) -> Result<()> {
        self.dedup.clear();
        self.optimizer.reset();
        self.suggester.reset();
        self.persistent.clear().await
    }

    pub fn dispose(self) {
        self.dedup.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn manager() -> (TempDir, ContextWindowManager) {
        let dir = TempDir::new().unwrap();
        let cache = PersistentCache::open(&dir.path().join("cache.db")).await.unwrap();
        let manager = ContextWindowManager::new(cache, TokenBudgetConfig::default());
        (dir, manager)
    }

    fn params(pairs: &[(&str, Value)]) -> JsonMap<String, Value> {
        pairs.iter().cloned().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[tokio::test]
    async fn second_identical_call_hits_persistent_cache() {
        let (_dir, manager) = manager().await;
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        let r1 = manager
            .process("Q", params(&[("q", Value::String("a".into()))]), move || {
                c.fetch_add(1, Ordering::SeqCst);
                async move { Ok("r".to_string()) }
            }, None)
            .await
            .unwrap();
        assert!(!r1.was_cached);
        assert_eq!(r1.response, "r");

        let c = calls.clone();
        let r2 = manager
            .process("Q", params(&[("q", Value::String("a".into()))]), move || {
                c.fetch_add(1, Ordering::SeqCst);
                async move { Ok("should not run".to_string()) }
            }, None)
            .await
            .unwrap();

        assert!(r2.was_cached);
        assert!(r2.tags.contains(&"persistent_cache_hit".to_string()));
        assert_eq!(r2.response, "r");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabling_all_stages_returns_executor_output_verbatim() {
        let (_dir, manager) = manager().await;
        let options = ContextOptimizationOptions {
            enable_cache: false,
            enable_dedup: false,
            enable_summarize: false,
            enforce_budget: false,
            ..ContextOptimizationOptions::default()
        };
        let payload = serde_json::json!({"items": (0..50).collect::<Vec<_>>()}).to_string();
        let expected = payload.clone();
        let result = manager
            .process("T", params(&[]), move || async move { Ok(payload) }, Some(options))
            .await
            .unwrap();
        assert_eq!(result.response, expected);
        assert!(result.tags.is_empty());
    }

    #[tokio::test]
    async fn oversized_response_is_summarized_and_tagged() {
        let (_dir, manager) = manager().await;
        let payload = serde_json::json!({"items": (0..50).collect::<Vec<_>>()}).to_string();
        let result = manager
            .process("T", params(&[]), move || async move { Ok(payload) }, None)
            .await
            .unwrap();
        assert!(result.tags.contains(&"summarization".to_string()));
        assert!(result.tokens_saved > 0);
    }

    #[tokio::test]
    async fn budget_enforcement_shrinks_huge_response() {
        let (_dir, manager) = manager().await;
        let mut budget = TokenBudgetConfig::default();
        budget.max_tokens_per_response = 50;
        let cache = PersistentCache::open(&TempDir::new().unwrap().path().join("c.db")).await.unwrap();
        let manager = ContextWindowManager::new(cache, budget);
        let payload = "word ".repeat(5000);
        let result = manager
            .process("T", params(&[]), move || async move { Ok(payload) }, None)
            .await
            .unwrap();
        assert!(result.tags.contains(&"token_budget_enforcement".to_string()));
        assert!(result.response.len() <= 4 * 50 + 200);
    }

    #[tokio::test]
    async fn feedback_and_analyze_query_delegate_to_suggester() {
        let (_dir, manager) = manager().await;
        manager.record_tool_feedback("Q", true);
        manager.record_tool_feedback("Q", true);
        manager.record_tool_feedback("Q", false);
        let stats = manager.statistics().await.unwrap();
        assert!(stats.suggester_history["Q"] > 0.5);

        let analysis = manager.analyze_query("help me debug this crash", 5);
        assert!(!analysis.suggested_tools.is_empty());
    }

    #[tokio::test]
    async fn reset_clears_metrics_and_caches() {
        let (_dir, manager) = manager().await;
        manager
            .process("T", params(&[]), || async move { Ok("r".to_string()) }, None)
            .await
            .unwrap();
        manager.reset().await.unwrap();
        let stats = manager.statistics().await.unwrap();
        assert_eq!(stats.token_metrics.request_count, 0);
        assert_eq!(stats.dedup_stats.cache_size, 0);
        assert_eq!(stats.cache_stats.total_entries, 0);
    }

    #[tokio::test]
    async fn maintenance_deletes_expired_persistent_rows() {
        let (_dir, manager) = manager().await;
        let options = ContextOptimizationOptions {
            cache_duration: Duration::from_millis(1),
            ..ContextOptimizationOptions::default()
        };
        manager
            .process("T", params(&[]), || async move { Ok("r".to_string()) }, Some(options))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let removed = manager.maintenance().await.unwrap();
        assert_eq!(removed, 1);
    }
}
