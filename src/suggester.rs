//! Query-intent classification and tool suggestion.
//!
//! The reference models this with an intent base class and one subclass per
//! keyword family; this avoids unnecessary inheritance for a
//! fixed, closed set of intents — so this is a tagged enum plus static
//! keyword tables, the same shape `summarizer::SummarizationTechnique` uses
//! for its fixed technique set.

use std::collections::HashMap;

use dashmap::DashMap;

/// Coarse intent behind a free-text query. Closed set — new intents require
/// a new variant and keyword table entry, not a new type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryIntent {
    Search,
    Documentation,
    Debug,
    Build,
    Profile,
    Unknown,
}

impl QueryIntent {
    fn suggested_tools(self) -> &'static [&'static str] {
        match self {
            QueryIntent::Search => &["search_code", "find_references", "grep_workspace"],
            QueryIntent::Documentation => &["read_docs", "search_docs", "generate_docs"],
            QueryIntent::Debug => &["capture_profile", "read_logs", "run_tests"],
            QueryIntent::Build => &["build_project", "package_build", "run_tests"],
            QueryIntent::Profile => &["capture_profile", "analyze_profile"],
            QueryIntent::Unknown => &[],
        }
    }
}

/// Intents checked in this order; the first whose keyword list matches wins.
const KEYWORD_TABLE: &[(QueryIntent, &[&str])] = &[
    (QueryIntent::Debug, &["debug", "crash", "error", "exception", "stack trace", "fix"]),
    (QueryIntent::Profile, &["profile", "performance", "slow", "bottleneck", "fps"]),
    (QueryIntent::Build, &["build", "compile", "package", "deploy"]),
    (QueryIntent::Documentation, &["docs", "documentation", "how do i", "how to", "explain"]),
    (QueryIntent::Search, &["find", "search", "where is", "locate", "look up"]),
];

fn classify(text: &str) -> QueryIntent {
    let lower = text.to_lowercase();
    for (intent, keywords) in KEYWORD_TABLE {
        if keywords.iter().any(|kw| lower.contains(kw)) {
            return *intent;
        }
    }
    QueryIntent::Unknown
}

#[derive(Debug, Clone)]
pub struct QueryAnalysis {
    pub intent: QueryIntent,
    pub suggested_tools: Vec<String>,
}

const FEEDBACK_NEUTRAL: f64 = 0.5;
const FEEDBACK_LEARNING_RATE: f64 = 0.2;

/// Tracks how relevant each tool's suggestions have historically been.
/// History is an exponential moving average seeded at `FEEDBACK_NEUTRAL`;
/// it is a heuristic prior, not a statistical estimator.
pub struct ToolSuggester {
    history: DashMap<String, f64>,
}

impl ToolSuggester {
    pub fn new() -> Self {
        Self {
            history: DashMap::new(),
        }
    }

    pub fn analyze_query(&self, text: &str, max: usize) -> QueryAnalysis {
        let intent = classify(text);
        let suggested_tools = intent
            .suggested_tools()
            .iter()
            .take(max)
            .map(|s| s.to_string())
            .collect();
        QueryAnalysis {
            intent,
            suggested_tools,
        }
    }

    pub fn record_tool_feedback(&self, tool: &str, was_relevant: bool) {
        let signal = if was_relevant { 1.0 } else { 0.0 };
        let mut entry = self.history.entry(tool.to_string()).or_insert(FEEDBACK_NEUTRAL);
        *entry += FEEDBACK_LEARNING_RATE * (signal - *entry);
    }

    pub fn score_for(&self, tool: &str) -> f64 {
        self.history.get(tool).map(|v| *v).unwrap_or(FEEDBACK_NEUTRAL)
    }

    pub fn history_snapshot(&self) -> HashMap<String, f64> {
        self.history.iter().map(|e| (e.key().clone(), *e.value())).collect()
    }

    pub fn reset(&self) {
        self.history.clear();
    }
}

impl Default for ToolSuggester {
    fn default() -> Self {
        Self::new()
    }
}
