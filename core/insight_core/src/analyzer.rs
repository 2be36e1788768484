//! Turns journal text into structured analysis.
//!
//! Every public call here returns a usable value. When the model is absent,
//! unreachable or answers with something that is not JSON, the documented
//! default comes back. When the answer is JSON but incomplete, the fields that
//! are present and well-typed are laid over the default one by one.

use std::sync::Arc;

use futures::future::join_all;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::llm::{Completion, TextAnalysisCapability};
use crate::models::{
    AnalysisResult, InsightSynthesis, KeywordCount, KeywordReport, Mood, Sentiment, Theme, DEFAULT_INSIGHT,
    MAX_EMOTIONS,
};
use crate::prompts::{self, PromptEntry, KEYWORD_LIMIT};

#[derive(Debug, Clone, Copy)]
struct GenerationParams {
    max_tokens: u32,
    temperature: f32,
}

const ANALYSIS: GenerationParams = GenerationParams {
    max_tokens: 500,
    temperature: 0.7,
};
const SYNTHESIS: GenerationParams = GenerationParams {
    max_tokens: 1500,
    temperature: 0.7,
};
const KEYWORDS: GenerationParams = GenerationParams {
    max_tokens: 800,
    temperature: 0.3,
};

#[derive(Clone)]
pub struct TextAnalyzer {
    llm: Arc<dyn TextAnalysisCapability>,
}

impl TextAnalyzer {
    pub fn new(llm: Arc<dyn TextAnalysisCapability>) -> Self {
        Self { llm }
    }

    pub async fn analyze(&self, text: &str) -> AnalysisResult {
        if !self.llm.is_configured() {
            debug!("no model credential; using default analysis");
            return AnalysisResult::default();
        }
        let prompt = prompts::single_entry_prompt(text);
        match self.request_object(&prompt, ANALYSIS, "analysis").await {
            Some(obj) => merge_analysis(&obj),
            None => AnalysisResult::default(),
        }
    }

    /// Analyze several texts concurrently. Each result falls back on its own.
    pub async fn analyze_many(&self, texts: &[&str]) -> Vec<AnalysisResult> {
        join_all(texts.iter().map(|t| self.analyze(t))).await
    }

    /// Multi-entry synthesis from an already rendered prompt.
    pub async fn synthesize(&self, prompt: &str) -> InsightSynthesis {
        if !self.llm.is_configured() {
            debug!("no model credential; using default synthesis");
            return InsightSynthesis::default();
        }
        match self.request_object(prompt, SYNTHESIS, "synthesis").await {
            Some(obj) => merge_synthesis(&obj),
            None => InsightSynthesis::default(),
        }
    }

    pub async fn synthesize_entries(&self, entries: &[PromptEntry<'_>]) -> InsightSynthesis {
        if entries.is_empty() {
            return InsightSynthesis::default();
        }
        let prompt = prompts::multi_entry_insights_prompt(entries);
        self.synthesize(&prompt).await
    }

    pub async fn keywords(&self, entries: &[PromptEntry<'_>]) -> KeywordReport {
        if entries.is_empty() {
            return KeywordReport::default();
        }
        if !self.llm.is_configured() {
            debug!("no model credential; using default keywords");
            return KeywordReport::default();
        }
        let prompt = prompts::keywords_prompt(entries);
        match self.request_object(&prompt, KEYWORDS, "keywords").await {
            Some(obj) => merge_keywords(&obj),
            None => KeywordReport::default(),
        }
    }

    /// Run the model and parse its answer strictly as JSON.
    ///
    /// `None` means "use the whole default". A JSON value that is not an object
    /// yields an empty map, which merges to the default as well.
    async fn request_object(&self, prompt: &str, params: GenerationParams, mode: &str) -> Option<Map<String, Value>> {
        let raw = match self.llm.complete(prompt, params.max_tokens, params.temperature).await {
            Completion::Text(raw) => raw,
            Completion::ConfigAbsent => {
                debug!(mode, "model credential absent");
                return None;
            }
            Completion::MalformedResponse(reason) => {
                warn!(mode, %reason, "malformed model envelope; using default");
                return None;
            }
            Completion::ProviderError(err) => {
                warn!(mode, error = %err, "model call failed; using default");
                return None;
            }
        };
        match serde_json::from_str::<Value>(raw.trim()) {
            Ok(Value::Object(obj)) => Some(obj),
            Ok(_) => {
                warn!(mode, "model output is JSON but not an object; using default");
                Some(Map::new())
            }
            Err(err) => {
                warn!(mode, error = %err, "model output is not JSON; using default");
                None
            }
        }
    }
}

fn str_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn str_list_field(obj: &Map<String, Value>, key: &str) -> Option<Vec<String>> {
    let items = obj.get(key)?.as_array()?;
    Some(
        items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

fn merge_analysis(obj: &Map<String, Value>) -> AnalysisResult {
    let mut out = AnalysisResult::default();
    if let Some(mood) = obj.get("mood").and_then(Value::as_str).and_then(Mood::parse) {
        out.mood = mood;
    }
    if let Some(sentiment) = obj
        .get("sentiment")
        .and_then(Value::as_str)
        .and_then(Sentiment::parse)
    {
        out.sentiment = sentiment;
    }
    if let Some(score) = obj
        .get("sentimentScore")
        .or_else(|| obj.get("sentiment_score"))
        .and_then(Value::as_f64)
    {
        out.sentiment_score = score;
    }
    if let Some(emotions) = str_list_field(obj, "emotions") {
        out.emotions = emotions
            .into_iter()
            .map(|e| e.to_lowercase())
            .filter(|e| !e.contains(char::is_whitespace))
            .take(MAX_EMOTIONS)
            .collect();
    }
    out.insight = str_field(obj, "insight").unwrap_or_else(|| DEFAULT_INSIGHT.to_string());
    out
}

fn merge_synthesis(obj: &Map<String, Value>) -> InsightSynthesis {
    let d = InsightSynthesis::default();
    InsightSynthesis {
        summary: str_field(obj, "summary").unwrap_or(d.summary),
        mood_trend: str_field(obj, "mood_trend").unwrap_or(d.mood_trend),
        emotional_anchors: str_list_field(obj, "emotional_anchors").unwrap_or(d.emotional_anchors),
        behavioral_patterns: str_list_field(obj, "behavioral_patterns").unwrap_or(d.behavioral_patterns),
        warning_signs: str_list_field(obj, "warning_signs").unwrap_or(d.warning_signs),
        insightful_advice: str_field(obj, "insightful_advice").unwrap_or(d.insightful_advice),
        ai_suggestions: str_list_field(obj, "ai_suggestions").unwrap_or(d.ai_suggestions),
    }
}

fn merge_keywords(obj: &Map<String, Value>) -> KeywordReport {
    let mut out = KeywordReport::default();
    if let Some(items) = obj.get("keywords").and_then(Value::as_array) {
        out.keywords = items
            .iter()
            .filter_map(|it| {
                let it = it.as_object()?;
                let word = str_field(it, "word")?;
                let count = it.get("count").and_then(Value::as_u64)?;
                Some(KeywordCount {
                    word,
                    count: u32::try_from(count).unwrap_or(u32::MAX),
                })
            })
            .take(KEYWORD_LIMIT)
            .collect();
    }
    if let Some(items) = obj.get("themes").and_then(Value::as_array) {
        out.themes = items
            .iter()
            .filter_map(|it| {
                let it = it.as_object()?;
                Some(Theme {
                    theme: str_field(it, "theme")?,
                    keywords: str_list_field(it, "keywords").unwrap_or_default(),
                })
            })
            .collect();
    }
    out
}
