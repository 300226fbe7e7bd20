//! Per-tool usage telemetry, budget events, and recommendations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::estimator::estimate_str_tokens;
use crate::events::{EventBus, OptimizationEvent, Recommendation, RecommendationKind};
use crate::summarizer::{ResultSummarizer, SummarizationOptions};

/// Process-wide token budget configuration.
#[derive(Debug, Clone)]
pub struct TokenBudgetConfig {
    pub max_tokens_per_request: u32,
    pub max_tokens_per_response: u32,
    pub warning_threshold: f32,
    pub auto_optimize: bool,
}

impl Default for TokenBudgetConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_request: 8_000,
            max_tokens_per_response: 4_000,
            warning_threshold: 0.8,
            auto_optimize: true,
        }
    }
}

/// Per-tool accumulator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolTokenUsage {
    pub tool_name: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub invocation_count: u64,
    pub tokens_saved: u64,
}

impl ToolTokenUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn avg_tokens(&self) -> f64 {
        if self.invocation_count == 0 {
            0.0
        } else {
            self.total_tokens() as f64 / self.invocation_count as f64
        }
    }
}

/// Process-lifetime usage snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsageMetrics {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_tokens_saved: u64,
    pub request_count: u64,
    pub tool_usage: HashMap<String, ToolTokenUsage>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl Default for TokenUsageMetrics {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            total_input_tokens: 0,
            total_output_tokens: 0,
            total_tokens_saved: 0,
            request_count: 0,
            tool_usage: HashMap::new(),
            start_time: now,
            end_time: now,
        }
    }
}

struct Totals {
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    tokens_saved: AtomicU64,
    request_count: AtomicU64,
}

impl Default for Totals {
    fn default() -> Self {
        Self {
            input_tokens: AtomicU64::new(0),
            output_tokens: AtomicU64::new(0),
            tokens_saved: AtomicU64::new(0),
            request_count: AtomicU64::new(0),
        }
    }
}

/// Accumulates usage, fires budget events, proposes recommendations, and
/// auto-shrinks oversized payloads via the summarizer.
pub struct TokenUsageOptimizer {
    totals: Totals,
    tool_usage: RwLock<HashMap<String, ToolTokenUsage>>,
    start_time: DateTime<Utc>,
    end_time: RwLock<DateTime<Utc>>,
    config: TokenBudgetConfig,
    events: EventBus,
    summarizer: ResultSummarizer,
}

impl TokenUsageOptimizer {
    pub fn new(config: TokenBudgetConfig, events: EventBus) -> Self {
        let now = Utc::now();
        Self {
            totals: Totals::default(),
            tool_usage: RwLock::new(HashMap::new()),
            start_time: now,
            end_time: RwLock::new(now),
            config,
            events,
            summarizer: ResultSummarizer::new(),
        }
    }

    pub fn config(&self) -> &TokenBudgetConfig {
        &self.config
    }

    /// Record a completed tool invocation's input/output text.
    pub fn record_usage(&self, tool: &str, input: &str, output: &str) {
        let input_tokens = estimate_str_tokens(input) as u64;
        let output_tokens = estimate_str_tokens(output) as u64;

        self.totals.input_tokens.fetch_add(input_tokens, Ordering::Relaxed);
        self.totals.output_tokens.fetch_add(output_tokens, Ordering::Relaxed);
        self.totals.request_count.fetch_add(1, Ordering::Relaxed);
        *self.end_time.write().unwrap() = Utc::now();

        {
            let mut usage = self.tool_usage.write().unwrap();
            let entry = usage.entry(tool.to_string()).or_insert_with(|| ToolTokenUsage {
                tool_name: tool.to_string(),
                ..Default::default()
            });
            entry.input_tokens += input_tokens;
            entry.output_tokens += output_tokens;
            entry.invocation_count += 1;
        }

        self.check_budget_events(input_tokens as u32, output_tokens as u32);
    }

    /// Record savings attributed to a tool (or the synthetic `AutoOptimization` tool).
    pub fn record_savings(&self, tool: &str, saved: u32) {
        self.totals.tokens_saved.fetch_add(saved as u64, Ordering::Relaxed);
        let mut usage = self.tool_usage.write().unwrap();
        if let Some(entry) = usage.get_mut(tool) {
            entry.tokens_saved += saved as u64;
        }
    }

    fn check_budget_events(&self, input_tokens: u32, output_tokens: u32) {
        let cfg = &self.config;
        for (tokens, max, side) in [
            (input_tokens, cfg.max_tokens_per_request, "request"),
            (output_tokens, cfg.max_tokens_per_response, "response"),
        ] {
            if max == 0 {
                continue;
            }
            if tokens > max {
                warn!(side, tokens, max, "token budget exceeded");
                self.events.emit(OptimizationEvent::BudgetExceeded(format!(
                    "{side} tokens {tokens} exceeded max {max}"
                )));
            } else if tokens as f32 >= cfg.warning_threshold * max as f32 {
                self.events.emit(OptimizationEvent::BudgetWarning(format!(
                    "{side} tokens {tokens} at or above warning threshold ({:.0}% of {max})",
                    cfg.warning_threshold * 100.0
                )));
            }
        }
    }

    /// Shrink `content` toward `target_tokens` tokens via the summarizer.
    /// No-op if already within budget.
    pub fn optimize_content(&self, content: &str, target_tokens: u32) -> (String, u32) {
        let current = estimate_str_tokens(content);
        if current <= target_tokens || content.is_empty() {
            return (content.to_string(), 0);
        }
        let options = SummarizationOptions::choose_for_budget(target_tokens, current);
        match self.summarizer.summarize(content, &options) {
            Ok(result) => {
                let saved = current.saturating_sub(estimate_str_tokens(&result.content));
                (result.content, saved)
            }
            Err(_) => (content.to_string(), 0),
        }
    }

    /// Check a request payload against `max_tokens_per_request`; shrink it if
    /// `auto_optimize` is set and it exceeds budget, else fire `budget_exceeded`.
    pub fn check_and_optimize_request(&self, content: &str) -> (String, bool) {
        self.check_and_optimize(content, self.config.max_tokens_per_request, "AutoOptimization")
    }

    /// Same as `check_and_optimize_request` but for responses.
    pub fn check_and_optimize_response(&self, content: &str) -> (String, bool) {
        self.check_and_optimize(content, self.config.max_tokens_per_response, "AutoOptimization")
    }

    fn check_and_optimize(&self, content: &str, max: u32, synthetic_tool: &str) -> (String, bool) {
        let current = estimate_str_tokens(content);
        if current <= max {
            return (content.to_string(), false);
        }
        if self.config.auto_optimize {
            let (shrunk, saved) = self.optimize_content(content, max);
            if saved > 0 {
                self.record_savings(synthetic_tool, saved);
            }
            (shrunk, true)
        } else {
            self.events.emit(OptimizationEvent::BudgetExceeded(format!(
                "content at {current} tokens exceeds max {max}"
            )));
            (content.to_string(), false)
        }
    }

    /// Ratio of tokens saved to tokens that would otherwise have been spent.
    /// `1.0` when no usage has been recorded yet.
    pub fn efficiency_score(&self) -> f64 {
        let saved = self.totals.tokens_saved.load(Ordering::Relaxed) as f64;
        let total = (self.totals.input_tokens.load(Ordering::Relaxed)
            + self.totals.output_tokens.load(Ordering::Relaxed)) as f64;
        if total + saved == 0.0 {
            1.0
        } else {
            saved / (total + saved)
        }
    }

    pub fn metrics(&self) -> TokenUsageMetrics {
        TokenUsageMetrics {
            total_input_tokens: self.totals.input_tokens.load(Ordering::Relaxed),
            total_output_tokens: self.totals.output_tokens.load(Ordering::Relaxed),
            total_tokens_saved: self.totals.tokens_saved.load(Ordering::Relaxed),
            request_count: self.totals.request_count.load(Ordering::Relaxed),
            tool_usage: self.tool_usage.read().unwrap().clone(),
            start_time: self.start_time,
            end_time: *self.end_time.read().unwrap(),
        }
    }

    /// Top 5 tools by total tokens, yielding recommendations ordered by
    /// `(priority asc, estimated_savings desc)`.
    pub fn generate_recommendations(&self) -> Vec<Recommendation> {
        let usage = self.tool_usage.read().unwrap();
        let mut by_total: Vec<&ToolTokenUsage> = usage.values().collect();
        by_total.sort_by(|a, b| b.total_tokens().cmp(&a.total_tokens()));
        by_total.truncate(5);

        let mut recs = Vec::new();
        for tool in by_total {
            if tool.invocation_count > 10 && tool.avg_tokens() > 500.0 {
                recs.push(Recommendation {
                    tool_name: tool.tool_name.clone(),
                    kind: RecommendationKind::Caching,
                    priority: 1,
                    estimated_savings: tool.total_tokens() / 2,
                });
            }
            if tool.invocation_count > 0
                && (tool.output_tokens as f64 / tool.invocation_count as f64) > 1000.0
            {
                recs.push(Recommendation {
                    tool_name: tool.tool_name.clone(),
                    kind: RecommendationKind::Summarization,
                    priority: 2,
                    estimated_savings: tool.output_tokens / 3,
                });
            }
            if tool.invocation_count > 5 {
                recs.push(Recommendation {
                    tool_name: tool.tool_name.clone(),
                    kind: RecommendationKind::Deduplication,
                    priority: 3,
                    estimated_savings: (tool.total_tokens() as f64 * 0.2) as u64,
                });
            }
        }

        recs.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| b.estimated_savings.cmp(&a.estimated_savings))
        });

        for rec in &recs {
            self.events
                .emit(OptimizationEvent::RecommendationGenerated(rec.clone()));
        }

        recs
    }

    pub fn reset(&self) {
        self.totals.input_tokens.store(0, Ordering::Relaxed);
        self.totals.output_tokens.store(0, Ordering::Relaxed);
        self.totals.tokens_saved.store(0, Ordering::Relaxed);
        self.totals.request_count.store(0, Ordering::Relaxed);
        self.tool_usage.write().unwrap().clear();
        *self.end_time.write().unwrap() = Utc::now();
    }
}
