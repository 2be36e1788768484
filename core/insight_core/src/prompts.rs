//! Prompt rendering for the three analysis modes.
//!
//! Everything here is pure: the same entries always render the same prompt, so
//! prompt changes can be reviewed and tested without a model in the loop.

use time::OffsetDateTime;

use crate::models::{Mood, Sentiment, MAX_EMOTIONS};

pub const ENTRY_DELIMITER: &str = "\n---\n";
/// Per-entry cap for keyword extraction; long entries are cut at a char boundary.
pub const KEYWORD_ENTRY_MAX_CHARS: usize = 500;
pub const KEYWORD_LIMIT: usize = 10;

/// The slice of an entry a prompt needs.
#[derive(Debug, Clone, Copy)]
pub struct PromptEntry<'a> {
    pub content: &'a str,
    pub created_at: OffsetDateTime,
}

pub fn single_entry_prompt(text: &str) -> String {
    let moods = Mood::ALL.map(Mood::as_str).join(", ");
    let sentiments = Sentiment::ALL.map(Sentiment::as_str).join(", ");
    format!(
        r#"Analyze the following journal entry and respond with JSON only, no prose and no code fences.

Journal entry: "{entry}"

Return exactly this shape:
{{
  "mood": one of [{moods}],
  "sentiment": one of [{sentiments}],
  "sentimentScore": a number between -1 and 1,
  "emotions": up to {max_emotions} lowercase single-word emotions, most prominent first,
  "insight": one or two supportive sentences addressed to the writer
}}"#,
        entry = escape_quotes(text),
        max_emotions = MAX_EMOTIONS,
    )
}

pub fn multi_entry_insights_prompt(entries: &[PromptEntry<'_>]) -> String {
    let joined = entries
        .iter()
        .map(|e| format!("[{}] {}", e.created_at.date(), e.content.trim()))
        .collect::<Vec<_>>()
        .join(ENTRY_DELIMITER);
    format!(
        r#"You are reviewing {count} journal entries written by the same person, oldest first, separated by "---".

{joined}

Respond with JSON only, no prose and no code fences, in exactly this shape:
{{
  "summary": "a short overview of the period",
  "mood_trend": "improving | declining | stable | fluctuating",
  "emotional_anchors": ["recurring people, places or activities tied to strong feelings"],
  "behavioral_patterns": ["habits or routines visible across entries"],
  "warning_signs": ["concerning signals, empty if none"],
  "insightful_advice": "one paragraph of gentle, practical advice",
  "ai_suggestions": ["concrete next steps or journaling prompts"]
}}"#,
        count = entries.len(),
    )
}

pub fn keywords_prompt(entries: &[PromptEntry<'_>]) -> String {
    let joined = entries
        .iter()
        .map(|e| truncate_chars(e.content.trim(), KEYWORD_ENTRY_MAX_CHARS))
        .collect::<Vec<_>>()
        .join(ENTRY_DELIMITER);
    format!(
        r#"Extract the {limit} most meaningful keywords from these journal entries (separated by "---") and group related keywords into themes.
Ignore stop words and filler.

{joined}

Respond with JSON only, no prose and no code fences, in exactly this shape:
{{
  "keywords": [{{ "word": "keyword", "count": number of occurrences }}],
  "themes": [{{ "theme": "short theme name", "keywords": ["keyword"] }}]
}}"#,
        limit = KEYWORD_LIMIT,
    )
}

fn escape_quotes(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
