//! Windowed aggregation of analyzed entries.
//!
//! Ties are always resolved by first appearance in the input order, so callers
//! that pass entries oldest-first get stable, reproducible rankings.

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use time::{Date, OffsetDateTime, UtcOffset};

use crate::models::{clamp_score, JournalEntry};
use crate::timefmt::{day_start_utc, local_date};

pub const TOP_EMOTIONS: usize = 5;
/// Reported when no entry in the window carries a mood.
pub const FALLBACK_DOMINANT_MOOD: &str = "neutral";

/// Counter that remembers the order keys were first seen in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tally {
    items: Vec<(String, u32)>,
}

impl Tally {
    pub fn from_keys<'a>(keys: impl IntoIterator<Item = &'a str>) -> Self {
        let mut t = Tally::default();
        for k in keys {
            t.add(k);
        }
        t
    }

    pub fn add(&mut self, key: &str) {
        match self.items.iter_mut().find(|(k, _)| k == key) {
            Some((_, n)) => *n += 1,
            None => self.items.push((key.to_string(), 1)),
        }
    }

    pub fn get(&self, key: &str) -> u32 {
        self.items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.items.iter().map(|(k, n)| (k.as_str(), *n))
    }

    /// Highest count; the earliest-seen key wins a tie.
    pub fn leader(&self) -> Option<&str> {
        let mut best: Option<(&str, u32)> = None;
        for (k, n) in self.iter() {
            if best.map_or(true, |(_, b)| n > b) {
                best = Some((k, n));
            }
        }
        best.map(|(k, _)| k)
    }

    /// Count-descending; the sort is stable so ties keep first-seen order.
    pub fn top(&self, limit: usize) -> Vec<EmotionCount> {
        let mut items: Vec<EmotionCount> = self
            .iter()
            .map(|(k, n)| EmotionCount {
                emotion: k.to_string(),
                count: n,
            })
            .collect();
        items.sort_by(|a, b| b.count.cmp(&a.count));
        items.truncate(limit);
        items
    }
}

impl Serialize for Tally {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut map = s.serialize_map(Some(self.items.len()))?;
        for (k, n) in &self.items {
            map.serialize_entry(k, n)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmotionCount {
    pub emotion: String,
    pub count: u32,
}

/// Contiguous, inclusive range of calendar days in a fixed UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: Date,
    pub end: Date,
    pub tz: UtcOffset,
}

impl Window {
    pub fn new(start: Date, end: Date, tz: UtcOffset) -> Option<Self> {
        (start <= end).then_some(Self { start, end, tz })
    }

    /// `days` calendar days ending on (and including) `end`. Zero is treated as one.
    pub fn ending_on(end: Date, days: u32, tz: UtcOffset) -> Self {
        let span = i64::from(days.max(1)) - 1;
        let start = end
            .checked_sub(time::Duration::days(span))
            .unwrap_or(Date::MIN);
        Self { start, end, tz }
    }

    pub fn day_count(&self) -> i64 {
        (self.end - self.start).whole_days() + 1
    }

    pub fn days(&self) -> impl Iterator<Item = Date> {
        let end = self.end;
        std::iter::successors(Some(self.start), move |d| d.next_day().filter(|n| *n <= end))
    }

    pub fn contains(&self, t: OffsetDateTime) -> bool {
        let d = local_date(t, self.tz);
        d >= self.start && d <= self.end
    }

    /// Half-open UTC range `[start midnight, day after end midnight)`.
    /// `None` when either bound falls outside what `time` can represent.
    pub fn utc_range(&self) -> Option<(OffsetDateTime, OffsetDateTime)> {
        let start = day_start_utc(self.start, self.tz)?;
        let end = day_start_utc(self.end.next_day()?, self.tz)?;
        Some((start, end))
    }

    /// Window of the same length that ends the day before this one starts.
    pub fn previous(&self) -> Self {
        let len = self.day_count();
        let end = self.start.previous_day().unwrap_or(Date::MIN);
        let start = end
            .checked_sub(time::Duration::days(len - 1))
            .unwrap_or(Date::MIN);
        Self {
            start,
            end,
            tz: self.tz,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendMode {
    /// Window totals against the equal-length window right before it.
    #[default]
    PreviousPeriod,
    /// Window totals against the emotions of the last entry before the window.
    PrecedingEntry,
}

impl TrendMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TrendMode::PreviousPeriod => "previous_period",
            TrendMode::PrecedingEntry => "preceding_entry",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "previous_period" => Some(TrendMode::PreviousPeriod),
            "preceding_entry" => Some(TrendMode::PrecedingEntry),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyEmotions {
    pub date: String,
    pub emotion_counts: Tally,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeeklyStats {
    pub start_date: String,
    pub end_date: String,
    pub total_entries: usize,
    pub emotion_counts: Tally,
    pub daily_emotions: Vec<DailyEmotions>,
    pub dominant_mood: String,
    pub top_emotions: Vec<EmotionCount>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub trends: Vec<String>,
}

impl WeeklyStats {
    pub fn with_trends(mut self, trends: Vec<String>) -> Self {
        self.trends = trends;
        self
    }
}

pub fn aggregate_weekly(entries: &[JournalEntry], window: &Window) -> WeeklyStats {
    let mut daily: Vec<(Date, Tally)> = window.days().map(|d| (d, Tally::default())).collect();
    let mut total = Tally::default();
    let mut moods = Tally::default();
    let mut total_entries = 0;

    for e in entries.iter().filter(|e| window.contains(e.created_at)) {
        total_entries += 1;
        if let Some(mood) = e.mood {
            moods.add(mood.as_str());
        }
        let day = local_date(e.created_at, window.tz);
        let bucket = daily.iter_mut().find(|(d, _)| *d == day).map(|(_, t)| t);
        if let Some(bucket) = bucket {
            for emotion in &e.emotions {
                total.add(emotion);
                bucket.add(emotion);
            }
        }
    }

    WeeklyStats {
        start_date: window.start.to_string(),
        end_date: window.end.to_string(),
        total_entries,
        top_emotions: total.top(TOP_EMOTIONS),
        emotion_counts: total,
        daily_emotions: daily
            .into_iter()
            .map(|(d, t)| DailyEmotions {
                date: d.to_string(),
                emotion_counts: t,
            })
            .collect(),
        dominant_mood: moods.leader().unwrap_or(FALLBACK_DOMINANT_MOOD).to_string(),
        trends: Vec::new(),
    }
}

/// Emotion totals of every entry inside `window`, in input order.
pub fn emotion_tally(entries: &[JournalEntry], window: &Window) -> Tally {
    let mut t = Tally::default();
    for e in entries.iter().filter(|e| window.contains(e.created_at)) {
        for emotion in &e.emotions {
            t.add(emotion);
        }
    }
    t
}

/// "More X" / "Less X" for each emotion whose count moved. Unchanged emotions
/// produce no label.
pub fn trend_labels(current: &Tally, baseline: &Tally) -> Vec<String> {
    let mut labels = Vec::new();
    for (emotion, n) in current.iter() {
        let before = baseline.get(emotion);
        if n > before {
            labels.push(format!("More {emotion}"));
        } else if n < before {
            labels.push(format!("Less {emotion}"));
        }
    }
    for (emotion, _) in baseline.iter() {
        if current.get(emotion) == 0 {
            labels.push(format!("Less {emotion}"));
        }
    }
    labels
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MoodSummary {
    pub start_date: String,
    pub end_date: String,
    pub total_entries: usize,
    pub mood_distribution: Tally,
    pub sentiment_distribution: Tally,
    pub average_sentiment_score: Option<f64>,
    pub top_emotions: Vec<EmotionCount>,
    pub active_days: usize,
    pub current_streak_days: u32,
}

pub fn summarize_period(entries: &[JournalEntry], window: &Window) -> MoodSummary {
    let mut moods = Tally::default();
    let mut sentiments = Tally::default();
    let mut emotions = Tally::default();
    let mut score_sum = 0.0;
    let mut scored = 0usize;
    let mut days: Vec<Date> = Vec::new();
    let mut total_entries = 0;

    for e in entries.iter().filter(|e| window.contains(e.created_at)) {
        total_entries += 1;
        if let Some(m) = e.mood {
            moods.add(m.as_str());
        }
        if let Some(s) = e.sentiment {
            sentiments.add(s.as_str());
        }
        if let Some(score) = e.sentiment_score {
            score_sum += clamp_score(score);
            scored += 1;
        }
        for emotion in &e.emotions {
            emotions.add(emotion);
        }
        let d = local_date(e.created_at, window.tz);
        if !days.contains(&d) {
            days.push(d);
        }
    }

    let mut streak = 0u32;
    let mut cursor = Some(window.end);
    while let Some(d) = cursor.filter(|d| *d >= window.start && days.contains(d)) {
        streak += 1;
        cursor = d.previous_day();
    }

    MoodSummary {
        start_date: window.start.to_string(),
        end_date: window.end.to_string(),
        total_entries,
        mood_distribution: moods,
        sentiment_distribution: sentiments,
        average_sentiment_score: (scored > 0).then(|| score_sum / scored as f64),
        top_emotions: emotions.top(TOP_EMOTIONS),
        active_days: days.len(),
        current_streak_days: streak,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Mood, Sentiment};
    use time::macros::{date, datetime};

    fn entry(created_at: OffsetDateTime, mood: Option<Mood>, emotions: &[&str]) -> JournalEntry {
        JournalEntry {
            id: 0,
            user_id: "u1".into(),
            content: "text".into(),
            created_at,
            mood,
            sentiment: None,
            sentiment_score: None,
            emotions: emotions.iter().map(|s| s.to_string()).collect(),
            insight: None,
            tags: Vec::new(),
        }
    }

    fn utc_window(start: Date, end: Date) -> Window {
        Window::new(start, end, UtcOffset::UTC).unwrap()
    }

    #[test]
    fn three_day_scenario() {
        let entries = vec![
            entry(datetime!(2026-03-01 09:00 UTC), None, &["joy"]),
            entry(datetime!(2026-03-01 21:00 UTC), None, &["joy", "stress"]),
            entry(datetime!(2026-03-03 12:00 UTC), None, &["calm"]),
        ];
        let stats = aggregate_weekly(&entries, &utc_window(date!(2026 - 03 - 01), date!(2026 - 03 - 03)));

        assert_eq!(stats.total_entries, 3);
        assert_eq!(
            stats.emotion_counts,
            Tally::from_keys(["joy", "joy", "stress", "calm"])
        );
        assert_eq!(stats.daily_emotions.len(), 3);
        assert_eq!(stats.daily_emotions[0].date, "2026-03-01");
        assert_eq!(stats.daily_emotions[0].emotion_counts, Tally::from_keys(["joy", "joy", "stress"]));
        assert!(stats.daily_emotions[1].emotion_counts.is_empty());
        assert_eq!(stats.daily_emotions[2].emotion_counts, Tally::from_keys(["calm"]));

        let top: Vec<(&str, u32)> = stats
            .top_emotions
            .iter()
            .map(|e| (e.emotion.as_str(), e.count))
            .collect();
        assert_eq!(top, vec![("joy", 2), ("stress", 1), ("calm", 1)]);
    }

    #[test]
    fn daily_buckets_reconcile_with_totals() {
        let cases: Vec<Vec<JournalEntry>> = vec![
            vec![],
            vec![entry(datetime!(2026-03-02 10:00 UTC), None, &["joy", "joy"])],
            vec![
                entry(datetime!(2026-02-28 10:00 UTC), None, &["fear"]),
                entry(datetime!(2026-03-01 00:00 UTC), None, &["hope", "fear"]),
                entry(datetime!(2026-03-04 23:59 UTC), None, &["hope"]),
                entry(datetime!(2026-03-07 23:59:59 UTC), None, &["calm", "hope", "joy"]),
                entry(datetime!(2026-03-08 00:00 UTC), None, &["calm"]),
            ],
        ];
        let window = utc_window(date!(2026 - 03 - 01), date!(2026 - 03 - 07));
        for entries in &cases {
            let stats = aggregate_weekly(entries, &window);
            assert_eq!(stats.daily_emotions.len() as i64, window.day_count());
            for (emotion, total) in stats.emotion_counts.iter() {
                let daily_sum: u32 = stats
                    .daily_emotions
                    .iter()
                    .map(|d| d.emotion_counts.get(emotion))
                    .sum();
                assert_eq!(daily_sum, total, "emotion {emotion}");
            }
        }
    }

    #[test]
    fn empty_window_has_explicit_empty_days() {
        let window = utc_window(date!(2026 - 03 - 01), date!(2026 - 03 - 07));
        let stats = aggregate_weekly(&[], &window);
        assert_eq!(stats.total_entries, 0);
        assert_eq!(stats.daily_emotions.len(), 7);
        assert!(stats.daily_emotions.iter().all(|d| d.emotion_counts.is_empty()));
        assert!(stats.emotion_counts.is_empty());
        assert!(stats.top_emotions.is_empty());
        assert_eq!(stats.dominant_mood, FALLBACK_DOMINANT_MOOD);
    }

    #[test]
    fn dominant_mood_tie_goes_to_first_seen() {
        let window = utc_window(date!(2026 - 03 - 01), date!(2026 - 03 - 07));
        let entries = vec![
            entry(datetime!(2026-03-01 10:00 UTC), Some(Mood::Sad), &[]),
            entry(datetime!(2026-03-02 10:00 UTC), Some(Mood::Happy), &[]),
            entry(datetime!(2026-03-03 10:00 UTC), Some(Mood::Happy), &[]),
            entry(datetime!(2026-03-04 10:00 UTC), Some(Mood::Sad), &[]),
        ];
        assert_eq!(aggregate_weekly(&entries, &window).dominant_mood, "sad");

        let mut reversed = entries.clone();
        reversed.reverse();
        assert_eq!(aggregate_weekly(&reversed, &window).dominant_mood, "sad");

        let mut rotated = entries.clone();
        rotated.rotate_left(1);
        assert_eq!(aggregate_weekly(&rotated, &window).dominant_mood, "happy");
    }

    #[test]
    fn top_emotions_capped_at_five() {
        let window = utc_window(date!(2026 - 03 - 01), date!(2026 - 03 - 01));
        let entries = vec![
            entry(datetime!(2026-03-01 10:00 UTC), None, &["a", "b", "c"]),
            entry(datetime!(2026-03-01 11:00 UTC), None, &["d", "e", "f"]),
            entry(datetime!(2026-03-01 12:00 UTC), None, &["f"]),
        ];
        let top = aggregate_weekly(&entries, &window).top_emotions;
        let names: Vec<&str> = top.iter().map(|e| e.emotion.as_str()).collect();
        assert_eq!(names, vec!["f", "a", "b", "c", "d"]);
    }

    #[test]
    fn buckets_follow_local_day() {
        let tz = crate::timefmt::tz_offset_from_minutes(8 * 60);
        let window = Window::new(date!(2026 - 03 - 01), date!(2026 - 03 - 02), tz).unwrap();
        // 2026-03-01 18:00 UTC is 2026-03-02 02:00 at UTC+8.
        let entries = vec![entry(datetime!(2026-03-01 18:00 UTC), None, &["joy"])];
        let stats = aggregate_weekly(&entries, &window);
        assert!(stats.daily_emotions[0].emotion_counts.is_empty());
        assert_eq!(stats.daily_emotions[1].emotion_counts.get("joy"), 1);
        assert_eq!(
            window.utc_range(),
            Some((datetime!(2026-02-28 16:00 UTC), datetime!(2026-03-02 16:00 UTC)))
        );
    }

    #[test]
    fn utc_range_is_none_at_calendar_edge() {
        let west = crate::timefmt::tz_offset_from_minutes(-60);
        let last = Date::MAX;
        assert_eq!(Window::ending_on(last, 7, west).utc_range(), None);
        assert_eq!(Window::ending_on(last, 7, UtcOffset::UTC).utc_range(), None);
        let w = Window::new(Date::MIN, Date::MIN, crate::timefmt::tz_offset_from_minutes(60)).unwrap();
        assert_eq!(w.utc_range(), None);
        assert!(!w.contains(datetime!(2026-03-01 00:00 UTC)));
    }

    #[test]
    fn window_helpers() {
        let w = Window::ending_on(date!(2026 - 03 - 07), 7, UtcOffset::UTC);
        assert_eq!(w.start, date!(2026 - 03 - 01));
        assert_eq!(w.day_count(), 7);
        assert_eq!(w.days().count(), 7);
        let p = w.previous();
        assert_eq!((p.start, p.end), (date!(2026 - 02 - 22), date!(2026 - 02 - 28)));
        assert_eq!(Window::ending_on(date!(2026 - 03 - 07), 0, UtcOffset::UTC).day_count(), 1);
        assert!(Window::new(date!(2026 - 03 - 07), date!(2026 - 03 - 01), UtcOffset::UTC).is_none());
    }

    #[test]
    fn trend_labels_cover_rises_falls_and_disappearances() {
        let current = Tally::from_keys(["joy", "joy", "stress"]);
        let baseline = Tally::from_keys(["stress", "stress", "joy", "joy", "calm"]);
        assert_eq!(
            trend_labels(&current, &baseline),
            vec!["Less stress".to_string(), "Less calm".to_string()]
        );
        let baseline = Tally::from_keys(["joy"]);
        assert_eq!(
            trend_labels(&current, &baseline),
            vec!["More joy".to_string(), "More stress".to_string()]
        );
    }

    #[test]
    fn summary_reports_distribution_average_and_streak() {
        let window = utc_window(date!(2026 - 03 - 01), date!(2026 - 03 - 07));
        let mut a = entry(datetime!(2026-03-05 10:00 UTC), Some(Mood::Happy), &["joy"]);
        a.sentiment = Some(Sentiment::Positive);
        a.sentiment_score = Some(0.6);
        let mut b = entry(datetime!(2026-03-06 10:00 UTC), Some(Mood::Anxious), &["worry"]);
        b.sentiment = Some(Sentiment::Negative);
        b.sentiment_score = Some(-2.0);
        let mut c = entry(datetime!(2026-03-07 10:00 UTC), Some(Mood::Happy), &["joy"]);
        c.sentiment_score = Some(0.4);
        let d = entry(datetime!(2026-03-02 10:00 UTC), None, &[]);

        let s = summarize_period(&[d, a, b, c], &window);
        assert_eq!(s.total_entries, 4);
        assert_eq!(s.mood_distribution, Tally::from_keys(["happy", "anxious", "happy"]));
        assert_eq!(s.sentiment_distribution, Tally::from_keys(["positive", "negative"]));
        let avg = s.average_sentiment_score.unwrap();
        assert!((avg - 0.0).abs() < 1e-9, "clamped -2.0 to -1.0, got {avg}");
        assert_eq!(s.active_days, 4);
        assert_eq!(s.current_streak_days, 3);
        assert_eq!(s.top_emotions[0].emotion, "joy");
    }

    #[test]
    fn tally_serializes_in_first_seen_order() {
        let t = Tally::from_keys(["zeal", "awe", "zeal"]);
        assert_eq!(serde_json::to_string(&t).unwrap(), r#"{"zeal":2,"awe":1}"#);
    }
}
