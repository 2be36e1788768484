use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const MAX_CONTENT_CHARS: usize = 10_000;
pub const MAX_EMOTIONS: usize = 3;
pub const DEFAULT_INSIGHT: &str = "No insight available.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mood {
    Happy,
    Sad,
    Anxious,
    Angry,
    Neutral,
    Excited,
    Confused,
    Mixed,
}

impl Mood {
    pub const ALL: [Mood; 8] = [
        Mood::Happy,
        Mood::Sad,
        Mood::Anxious,
        Mood::Angry,
        Mood::Neutral,
        Mood::Excited,
        Mood::Confused,
        Mood::Mixed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Mood::Happy => "happy",
            Mood::Sad => "sad",
            Mood::Anxious => "anxious",
            Mood::Angry => "angry",
            Mood::Neutral => "neutral",
            Mood::Excited => "excited",
            Mood::Confused => "confused",
            Mood::Mixed => "mixed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim().to_ascii_lowercase();
        Mood::ALL.into_iter().find(|m| m.as_str() == raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
}

impl Sentiment {
    pub const ALL: [Sentiment; 3] = [Sentiment::Positive, Sentiment::Negative, Sentiment::Neutral];

    pub fn as_str(self) -> &'static str {
        match self {
            Sentiment::Positive => "positive",
            Sentiment::Negative => "negative",
            Sentiment::Neutral => "neutral",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim().to_ascii_lowercase();
        Sentiment::ALL.into_iter().find(|s| s.as_str() == raw)
    }
}

/// One journal submission. Analysis fields stay empty until the entry has been analyzed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: i64,
    pub user_id: String,
    pub content: String,
    #[serde(with = "crate::timefmt::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default)]
    pub mood: Option<Mood>,
    #[serde(default)]
    pub sentiment: Option<Sentiment>,
    #[serde(default)]
    pub sentiment_score: Option<f64>,
    #[serde(default)]
    pub emotions: Vec<String>,
    #[serde(default)]
    pub insight: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl JournalEntry {
    pub fn apply_analysis(&mut self, a: &AnalysisResult) {
        self.mood = Some(a.mood);
        self.sentiment = Some(a.sentiment);
        self.sentiment_score = Some(clamp_score(a.sentiment_score));
        self.emotions = a.emotions.clone();
        self.insight = Some(a.insight.clone());
    }
}

/// What the caller submits; id and analysis are filled in by the service.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub user_id: String,
    pub content: String,
    pub created_at: OffsetDateTime,
    pub tags: Vec<String>,
}

/// Structured analysis of a single entry.
///
/// `Default` is the documented fallback handed out whenever the model's answer
/// cannot be trusted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub mood: Mood,
    pub sentiment: Sentiment,
    pub sentiment_score: f64,
    pub emotions: Vec<String>,
    pub insight: String,
}

impl Default for AnalysisResult {
    fn default() -> Self {
        Self {
            mood: Mood::Neutral,
            sentiment: Sentiment::Neutral,
            sentiment_score: 0.0,
            emotions: Vec::new(),
            insight: DEFAULT_INSIGHT.to_string(),
        }
    }
}

/// Multi-entry synthesis (weekly / premium insights).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightSynthesis {
    pub summary: String,
    pub mood_trend: String,
    pub emotional_anchors: Vec<String>,
    pub behavioral_patterns: Vec<String>,
    pub warning_signs: Vec<String>,
    pub insightful_advice: String,
    pub ai_suggestions: Vec<String>,
}

impl Default for InsightSynthesis {
    fn default() -> Self {
        Self {
            summary: "No insights available yet.".to_string(),
            mood_trend: "stable".to_string(),
            emotional_anchors: Vec::new(),
            behavioral_patterns: Vec::new(),
            warning_signs: Vec::new(),
            insightful_advice: "Keep journaling regularly to unlock deeper insights.".to_string(),
            ai_suggestions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordCount {
    pub word: String,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Theme {
    pub theme: String,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeywordReport {
    pub keywords: Vec<KeywordCount>,
    pub themes: Vec<Theme>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub notifications_enabled: bool,
    #[serde(default)]
    pub push_token: Option<String>,
}

fn default_true() -> bool {
    true
}

impl UserProfile {
    /// Enabled and holding a non-blank token.
    pub fn reachable_token(&self) -> Option<&str> {
        if !self.notifications_enabled {
            return None;
        }
        self.push_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

pub fn clamp_score(v: f64) -> f64 {
    if v.is_nan() {
        return 0.0;
    }
    v.clamp(-1.0, 1.0)
}

/// Lowercase, trim and dedup tags while keeping first-seen order.
pub fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for t in tags {
        let t = t.trim().to_lowercase();
        if !t.is_empty() && !out.contains(&t) {
            out.push(t);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mood_parse_is_case_insensitive() {
        assert_eq!(Mood::parse(" Happy "), Some(Mood::Happy));
        assert_eq!(Mood::parse("ecstatic"), None);
        assert_eq!(Sentiment::parse("NEGATIVE"), Some(Sentiment::Negative));
    }

    #[test]
    fn reachable_token_requires_flag_and_token() {
        let mut u = UserProfile {
            id: "u1".into(),
            active: true,
            notifications_enabled: true,
            push_token: Some("  ".into()),
        };
        assert_eq!(u.reachable_token(), None);
        u.push_token = Some("tok".into());
        assert_eq!(u.reachable_token(), Some("tok"));
        u.notifications_enabled = false;
        assert_eq!(u.reachable_token(), None);
    }

    #[test]
    fn apply_analysis_clamps_score() {
        let mut e = JournalEntry {
            id: 1,
            user_id: "u1".into(),
            content: "x".into(),
            created_at: time::macros::datetime!(2026-02-15 10:00 UTC),
            mood: None,
            sentiment: None,
            sentiment_score: None,
            emotions: Vec::new(),
            insight: None,
            tags: Vec::new(),
        };
        let a = AnalysisResult {
            sentiment_score: 3.5,
            ..AnalysisResult::default()
        };
        e.apply_analysis(&a);
        assert_eq!(e.sentiment_score, Some(1.0));
        assert_eq!(e.insight.as_deref(), Some(DEFAULT_INSIGHT));
    }

    #[test]
    fn normalize_tags_dedups() {
        let tags = vec!["Work".to_string(), "work ".to_string(), "".to_string(), "gym".to_string()];
        assert_eq!(normalize_tags(&tags), vec!["work".to_string(), "gym".to_string()]);
    }
}
